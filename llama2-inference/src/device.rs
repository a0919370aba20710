//! Device abstraction: memory domains and their allocators.
//!
//! Each execution device (host CPU, accelerator) is a separate address space
//! with exactly one process-wide allocator instance. Allocators hand out raw
//! regions, release them, and route memory copies by direction; everything
//! above this layer (buffers, tensors) is device-agnostic.

use crate::error::{InferenceError, Result};
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Alignment for host-side tensor regions.
const HOST_ALIGNMENT: usize = 32;

/// A memory/compute domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Host,
    Accelerator,
    /// Placement not yet decided; copies involving `Unset` are rejected.
    Unset,
}

/// Transfer direction for a memory copy, derived from the device pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    HostToHost,
    HostToAccelerator,
    AcceleratorToHost,
    AcceleratorToAccelerator,
}

impl CopyDirection {
    /// Selects the direction for a copy into `dst` from `src`.
    pub fn between(dst: DeviceType, src: DeviceType) -> Result<Self> {
        match (src, dst) {
            (DeviceType::Host, DeviceType::Host) => Ok(CopyDirection::HostToHost),
            (DeviceType::Host, DeviceType::Accelerator) => Ok(CopyDirection::HostToAccelerator),
            (DeviceType::Accelerator, DeviceType::Host) => Ok(CopyDirection::AcceleratorToHost),
            (DeviceType::Accelerator, DeviceType::Accelerator) => {
                Ok(CopyDirection::AcceleratorToAccelerator)
            }
            (src, dst) => Err(InferenceError::InvalidState(format!(
                "cannot derive a copy direction for devices {src:?} -> {dst:?}"
            ))),
        }
    }
}

/// Per-device allocation strategy.
///
/// One instance per device type for the lifetime of the process. Copies are
/// synchronous from the caller's perspective; no completion queue is modeled.
/// Implementations must tolerate concurrent use by multiple models.
pub trait DeviceAllocator: Send + Sync {
    /// Device whose address space this allocator manages.
    fn device_type(&self) -> DeviceType;

    /// Allocates `byte_size` zero-initialized bytes.
    fn allocate(&self, byte_size: usize) -> Result<NonNull<u8>>;

    /// Releases a region previously obtained from [`Self::allocate`].
    fn release(&self, ptr: NonNull<u8>, byte_size: usize);

    /// Copies `byte_size` bytes between non-overlapping regions.
    ///
    /// The regions must be valid for `byte_size` bytes in the address spaces
    /// named by `direction`.
    fn memcpy(
        &self,
        dst: *mut u8,
        src: *const u8,
        byte_size: usize,
        direction: CopyDirection,
    ) -> Result<()>;
}

fn aligned_alloc(device: DeviceType, byte_size: usize) -> Result<NonNull<u8>> {
    if byte_size == 0 {
        return Err(InferenceError::InvalidState(
            "zero-byte allocation".to_string(),
        ));
    }
    let layout = Layout::from_size_align(byte_size, HOST_ALIGNMENT).map_err(|_| {
        InferenceError::Allocation {
            device,
            requested: byte_size,
        }
    })?;
    // SAFETY: layout has non-zero size, checked above.
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    NonNull::new(ptr).ok_or(InferenceError::Allocation {
        device,
        requested: byte_size,
    })
}

fn aligned_release(ptr: NonNull<u8>, byte_size: usize) {
    let Ok(layout) = Layout::from_size_align(byte_size, HOST_ALIGNMENT) else {
        return;
    };
    // SAFETY: ptr was produced by aligned_alloc with this exact layout.
    unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
}

/// Allocator for host memory.
#[derive(Debug, Default)]
pub struct HostAllocator;

impl HostAllocator {
    pub fn new() -> Self {
        HostAllocator
    }
}

impl DeviceAllocator for HostAllocator {
    fn device_type(&self) -> DeviceType {
        DeviceType::Host
    }

    fn allocate(&self, byte_size: usize) -> Result<NonNull<u8>> {
        aligned_alloc(DeviceType::Host, byte_size)
    }

    fn release(&self, ptr: NonNull<u8>, byte_size: usize) {
        aligned_release(ptr, byte_size);
    }

    fn memcpy(
        &self,
        dst: *mut u8,
        src: *const u8,
        byte_size: usize,
        direction: CopyDirection,
    ) -> Result<()> {
        if direction != CopyDirection::HostToHost {
            return Err(InferenceError::Internal(format!(
                "host allocator cannot route a {direction:?} copy"
            )));
        }
        if byte_size == 0 {
            return Ok(());
        }
        if dst.is_null() || src.is_null() {
            return Err(InferenceError::Internal(
                "null pointer passed to memcpy".to_string(),
            ));
        }
        // SAFETY: caller guarantees both regions are valid for byte_size
        // bytes and do not overlap.
        unsafe { std::ptr::copy_nonoverlapping(src, dst, byte_size) };
        Ok(())
    }
}

/// Allocator for the accelerator address space.
///
/// Backs device regions with pinned host pages and routes all four copy
/// directions, so the full device matrix runs on machines without driver
/// hardware. A driver-backed allocator implements the same trait. An
/// optional byte capacity models device memory exhaustion.
#[derive(Debug, Default)]
pub struct AcceleratorAllocator {
    capacity: Option<usize>,
    used: AtomicUsize,
}

impl AcceleratorAllocator {
    pub fn new() -> Self {
        Self {
            capacity: None,
            used: AtomicUsize::new(0),
        }
    }

    /// Caps the emulated device memory at `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            used: AtomicUsize::new(0),
        }
    }

    /// Bytes currently allocated on the device.
    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

impl DeviceAllocator for AcceleratorAllocator {
    fn device_type(&self) -> DeviceType {
        DeviceType::Accelerator
    }

    fn allocate(&self, byte_size: usize) -> Result<NonNull<u8>> {
        if let Some(capacity) = self.capacity {
            let used = self.used.load(Ordering::Relaxed);
            if used + byte_size > capacity {
                return Err(InferenceError::Allocation {
                    device: DeviceType::Accelerator,
                    requested: byte_size,
                });
            }
        }
        let ptr = aligned_alloc(DeviceType::Accelerator, byte_size)?;
        self.used.fetch_add(byte_size, Ordering::Relaxed);
        Ok(ptr)
    }

    fn release(&self, ptr: NonNull<u8>, byte_size: usize) {
        aligned_release(ptr, byte_size);
        self.used.fetch_sub(byte_size, Ordering::Relaxed);
    }

    fn memcpy(
        &self,
        dst: *mut u8,
        src: *const u8,
        byte_size: usize,
        _direction: CopyDirection,
    ) -> Result<()> {
        if byte_size == 0 {
            return Ok(());
        }
        if dst.is_null() || src.is_null() {
            return Err(InferenceError::Internal(
                "null pointer passed to memcpy".to_string(),
            ));
        }
        // SAFETY: both address spaces are host-backed here; caller
        // guarantees validity and non-overlap.
        unsafe { std::ptr::copy_nonoverlapping(src, dst, byte_size) };
        Ok(())
    }
}

static HOST_ALLOCATOR: OnceLock<Arc<HostAllocator>> = OnceLock::new();
static ACCELERATOR_ALLOCATOR: OnceLock<Arc<AcceleratorAllocator>> = OnceLock::new();

/// Process-wide allocator registry, one lazily-constructed instance per
/// device type.
///
/// Buffers and tensors take an `Arc<dyn DeviceAllocator>` at construction,
/// so tests can substitute their own instances instead of going through
/// this registry.
pub fn default_allocator(device: DeviceType) -> Result<Arc<dyn DeviceAllocator>> {
    match device {
        DeviceType::Host => {
            let alloc: Arc<dyn DeviceAllocator> = HOST_ALLOCATOR
                .get_or_init(|| Arc::new(HostAllocator::new()))
                .clone();
            Ok(alloc)
        }
        DeviceType::Accelerator => {
            let alloc: Arc<dyn DeviceAllocator> = ACCELERATOR_ALLOCATOR
                .get_or_init(|| Arc::new(AcceleratorAllocator::new()))
                .clone();
            Ok(alloc)
        }
        DeviceType::Unset => Err(InferenceError::InvalidState(
            "no allocator exists for the unset device".to_string(),
        )),
    }
}

/// Picks the allocator that can route the given direction.
pub(crate) fn allocator_for_direction(direction: CopyDirection) -> Result<Arc<dyn DeviceAllocator>> {
    match direction {
        CopyDirection::HostToHost => default_allocator(DeviceType::Host),
        _ => default_allocator(DeviceType::Accelerator),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_covers_every_device_pair() {
        assert_eq!(
            CopyDirection::between(DeviceType::Host, DeviceType::Host).unwrap(),
            CopyDirection::HostToHost
        );
        assert_eq!(
            CopyDirection::between(DeviceType::Accelerator, DeviceType::Host).unwrap(),
            CopyDirection::HostToAccelerator
        );
        assert_eq!(
            CopyDirection::between(DeviceType::Host, DeviceType::Accelerator).unwrap(),
            CopyDirection::AcceleratorToHost
        );
        assert_eq!(
            CopyDirection::between(DeviceType::Accelerator, DeviceType::Accelerator).unwrap(),
            CopyDirection::AcceleratorToAccelerator
        );
    }

    #[test]
    fn direction_rejects_unset_device() {
        let result = CopyDirection::between(DeviceType::Unset, DeviceType::Host);
        assert!(matches!(result, Err(InferenceError::InvalidState(_))));
    }

    #[test]
    fn accelerator_capacity_is_enforced() {
        let alloc = AcceleratorAllocator::with_capacity(64);
        let ptr = alloc.allocate(48).unwrap();
        let overflow = alloc.allocate(32);
        assert!(matches!(
            overflow,
            Err(InferenceError::Allocation { requested: 32, .. })
        ));
        alloc.release(ptr, 48);
        assert_eq!(alloc.used_bytes(), 0);
    }
}
