//! Raw device memory regions with explicit ownership.

use crate::device::{self, CopyDirection, DeviceAllocator, DeviceType};
use crate::error::{InferenceError, Result};
use std::ptr::NonNull;
use std::sync::Arc;

enum Storage {
    /// Region obtained from `allocator`; released exactly once on drop.
    Owned {
        ptr: NonNull<u8>,
        allocator: Arc<dyn DeviceAllocator>,
    },
    /// Caller-supplied region; never freed by the buffer.
    External { ptr: NonNull<u8> },
}

/// A contiguous memory region tagged with a device.
///
/// The central invariant: owned memory is released exactly once, by the
/// allocator that produced it; external memory is never freed. Shared
/// ownership is expressed by wrapping a buffer in an `Arc` (tensors do
/// this), never by cloning the region itself.
pub struct Buffer {
    byte_size: usize,
    device_type: DeviceType,
    storage: Storage,
}

impl Buffer {
    /// Allocates an owning buffer of `byte_size` bytes from `allocator`.
    pub fn new(byte_size: usize, allocator: Arc<dyn DeviceAllocator>) -> Result<Self> {
        let ptr = allocator.allocate(byte_size)?;
        Ok(Self {
            byte_size,
            device_type: allocator.device_type(),
            storage: Storage::Owned { ptr, allocator },
        })
    }

    /// Wraps a caller-supplied region without taking ownership.
    ///
    /// The device type of a bare pointer cannot be inferred, so the buffer
    /// starts out `Unset`; call [`Buffer::set_device_type`] immediately
    /// after wrapping. Writes through the buffer are only valid if the
    /// wrapped region is writable.
    pub fn from_external(ptr: *mut u8, byte_size: usize) -> Result<Self> {
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            InferenceError::Internal("cannot wrap a null external pointer".to_string())
        })?;
        Ok(Self {
            byte_size,
            device_type: DeviceType::Unset,
            storage: Storage::External { ptr },
        })
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn set_device_type(&mut self, device_type: DeviceType) {
        self.device_type = device_type;
    }

    pub fn is_external(&self) -> bool {
        matches!(self.storage, Storage::External { .. })
    }

    pub fn ptr(&self) -> *const u8 {
        match &self.storage {
            Storage::Owned { ptr, .. } | Storage::External { ptr } => ptr.as_ptr(),
        }
    }

    pub fn mut_ptr(&self) -> *mut u8 {
        match &self.storage {
            Storage::Owned { ptr, .. } | Storage::External { ptr } => ptr.as_ptr(),
        }
    }

    /// Copies `min(self.byte_size, src.byte_size)` bytes from `src`,
    /// selecting the transfer direction from the device pair.
    ///
    /// Correctness requires the corresponding logical regions to have equal
    /// sizes; a byte-count mismatch is a caller error that this method does
    /// not detect.
    pub fn copy_from(&self, src: &Buffer) -> Result<()> {
        let byte_size = self.byte_size.min(src.byte_size);
        self.copy_from_region(0, src, 0, byte_size)
    }

    /// Copies a bounds-checked sub-range of `src` into a sub-range of self.
    pub fn copy_from_region(
        &self,
        dst_offset: usize,
        src: &Buffer,
        src_offset: usize,
        byte_size: usize,
    ) -> Result<()> {
        let dst_end = dst_offset + byte_size;
        if dst_end > self.byte_size {
            return Err(InferenceError::IndexOutOfRange {
                index: dst_end as i64,
                bound: self.byte_size,
            });
        }
        let src_end = src_offset + byte_size;
        if src_end > src.byte_size {
            return Err(InferenceError::IndexOutOfRange {
                index: src_end as i64,
                bound: src.byte_size,
            });
        }
        let direction = CopyDirection::between(self.device_type, src.device_type)?;
        let allocator = self.copy_allocator(direction)?;
        allocator.memcpy(
            self.mut_ptr().wrapping_add(dst_offset),
            src.ptr().wrapping_add(src_offset),
            byte_size,
            direction,
        )
    }

    fn copy_allocator(&self, direction: CopyDirection) -> Result<Arc<dyn DeviceAllocator>> {
        if let Storage::Owned { allocator, .. } = &self.storage {
            if direction == CopyDirection::HostToHost
                && allocator.device_type() == DeviceType::Host
            {
                return Ok(allocator.clone());
            }
            if direction != CopyDirection::HostToHost
                && allocator.device_type() == DeviceType::Accelerator
            {
                return Ok(allocator.clone());
            }
        }
        device::allocator_for_direction(direction)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Storage::Owned { ptr, allocator } = &self.storage {
            allocator.release(*ptr, self.byte_size);
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("byte_size", &self.byte_size)
            .field("device_type", &self.device_type)
            .field("external", &self.is_external())
            .finish()
    }
}
