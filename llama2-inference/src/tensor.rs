//! Typed, shaped views over device buffers.

use crate::buffer::Buffer;
use crate::device::{DeviceAllocator, DeviceType};
use crate::error::{InferenceError, Result};
use std::sync::Arc;

/// Element type of a tensor; defines the element width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Int32,
    Fp32,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::Int32 => 4,
            DataType::Fp32 => 4,
        }
    }
}

/// Rust types that can back a [`DataType`].
pub trait TensorElement: Copy {
    const DTYPE: DataType;
}

impl TensorElement for i32 {
    const DTYPE: DataType = DataType::Int32;
}

impl TensorElement for f32 {
    const DTYPE: DataType = DataType::Fp32;
}

/// A typed, shaped view over a shared [`Buffer`].
///
/// Cloning a tensor clones the shape and shares the backing buffer. The
/// backing buffer, when present, always satisfies
/// `byte_size >= element_count * dtype width`.
#[derive(Clone)]
pub struct Tensor {
    dims: Vec<usize>,
    dtype: DataType,
    buffer: Option<Arc<Buffer>>,
}

impl Tensor {
    /// Creates a tensor with deferred allocation.
    pub fn new(dtype: DataType, dims: Vec<usize>) -> Self {
        Self {
            dims,
            dtype,
            buffer: None,
        }
    }

    /// Creates a tensor and allocates its backing buffer immediately.
    pub fn allocated(
        dtype: DataType,
        dims: Vec<usize>,
        allocator: &Arc<dyn DeviceAllocator>,
    ) -> Result<Self> {
        let mut tensor = Self::new(dtype, dims);
        tensor.allocate(allocator)?;
        Ok(tensor)
    }

    /// Binds an existing buffer, checking the size invariant.
    pub fn from_buffer(dtype: DataType, dims: Vec<usize>, buffer: Arc<Buffer>) -> Result<Self> {
        let mut tensor = Self::new(dtype, dims);
        if buffer.byte_size() < tensor.byte_size() {
            return Err(InferenceError::Internal(format!(
                "buffer of {} bytes is too small for tensor shape {:?} ({} bytes)",
                buffer.byte_size(),
                tensor.dims,
                tensor.byte_size()
            )));
        }
        tensor.buffer = Some(buffer);
        Ok(tensor)
    }

    /// (Re)binds the backing buffer to a fresh allocation.
    ///
    /// Re-allocating an already-allocated tensor replaces its buffer; the
    /// previous buffer is released once its last holder drops it.
    pub fn allocate(&mut self, allocator: &Arc<dyn DeviceAllocator>) -> Result<()> {
        let buffer = Buffer::new(self.byte_size(), allocator.clone())?;
        self.buffer = Some(Arc::new(buffer));
        Ok(())
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn byte_size(&self) -> usize {
        self.element_count() * self.dtype.size_in_bytes()
    }

    pub fn is_allocated(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn buffer(&self) -> Option<&Arc<Buffer>> {
        self.buffer.as_ref()
    }

    pub fn device_type(&self) -> DeviceType {
        self.buffer
            .as_ref()
            .map_or(DeviceType::Unset, |buffer| buffer.device_type())
    }

    /// Propagates a device type to the backing buffer.
    ///
    /// Only valid while the buffer is exclusively held; a shared buffer's
    /// device tag is frozen.
    pub fn set_device_type(&mut self, device_type: DeviceType) -> Result<()> {
        let buffer = self.buffer.as_mut().ok_or_else(|| {
            InferenceError::InvalidState("tensor has no backing buffer".to_string())
        })?;
        match Arc::get_mut(buffer) {
            Some(buffer) => {
                buffer.set_device_type(device_type);
                Ok(())
            }
            None => Err(InferenceError::InvalidState(
                "device type can only change while the buffer is exclusively held".to_string(),
            )),
        }
    }

    fn checked_buffer<T: TensorElement>(&self) -> Result<&Arc<Buffer>> {
        if T::DTYPE != self.dtype {
            return Err(InferenceError::Internal(format!(
                "element type {:?} does not match tensor dtype {:?}",
                T::DTYPE,
                self.dtype
            )));
        }
        let buffer = self.buffer.as_ref().ok_or_else(|| {
            InferenceError::InvalidState("tensor has no backing buffer".to_string())
        })?;
        if buffer.device_type() != DeviceType::Host {
            return Err(InferenceError::InvalidState(format!(
                "typed access requires host memory, buffer is on {:?}",
                buffer.device_type()
            )));
        }
        Ok(buffer)
    }

    /// Borrows the elements of a host-resident tensor.
    pub fn as_slice<T: TensorElement>(&self) -> Result<&[T]> {
        let buffer = self.checked_buffer::<T>()?;
        let count = self.element_count();
        // SAFETY: dtype and element count were validated against the buffer
        // size when the buffer was bound; the region is host memory.
        Ok(unsafe { std::slice::from_raw_parts(buffer.ptr() as *const T, count) })
    }

    /// Mutably borrows the elements of a host-resident tensor.
    ///
    /// # Safety
    ///
    /// The caller must ensure no other slice borrowed from the same buffer
    /// (through this or any cloned tensor) is live for the duration of the
    /// returned borrow. The single-threaded forward contract guarantees
    /// this inside the runtime.
    pub unsafe fn as_mut_slice<T: TensorElement>(&self) -> Result<&mut [T]> {
        let buffer = self.checked_buffer::<T>()?;
        let count = self.element_count();
        // SAFETY: size invariant as in as_slice; exclusivity is the
        // caller's obligation per the function contract.
        Ok(unsafe { std::slice::from_raw_parts_mut(buffer.mut_ptr() as *mut T, count) })
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("dims", &self.dims)
            .field("dtype", &self.dtype)
            .field("device_type", &self.device_type())
            .field("allocated", &self.is_allocated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::default_allocator;

    #[test]
    fn allocate_replaces_the_backing_buffer() -> anyhow::Result<()> {
        let allocator = default_allocator(DeviceType::Host)?;
        let mut tensor = Tensor::new(DataType::Fp32, vec![4, 2]);
        assert!(!tensor.is_allocated());

        tensor.allocate(&allocator)?;
        // Keep the first buffer alive so its address cannot be reused.
        let first = tensor
            .buffer()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no buffer"))?;

        tensor.allocate(&allocator)?;
        let second = tensor
            .buffer()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no buffer"))?;
        assert_ne!(first.ptr(), second.ptr());
        assert_eq!(tensor.byte_size(), 32);
        Ok(())
    }

    #[test]
    fn typed_access_rejects_dtype_mismatch() -> anyhow::Result<()> {
        let allocator = default_allocator(DeviceType::Host)?;
        let tensor = Tensor::allocated(DataType::Fp32, vec![8], &allocator)?;
        assert!(tensor.as_slice::<i32>().is_err());
        assert_eq!(tensor.as_slice::<f32>()?.len(), 8);
        Ok(())
    }

    #[test]
    fn from_buffer_enforces_the_size_invariant() -> anyhow::Result<()> {
        let allocator = default_allocator(DeviceType::Host)?;
        let buffer = std::sync::Arc::new(Buffer::new(16, allocator)?);
        let too_big = Tensor::from_buffer(DataType::Fp32, vec![8], buffer.clone());
        assert!(too_big.is_err());
        let fits = Tensor::from_buffer(DataType::Fp32, vec![4], buffer)?;
        assert_eq!(fits.element_count(), 4);
        Ok(())
    }
}
