use std::sync::Arc;

use crate::alloc;
use crate::element::Element;
use crate::{DType, LowmemError, Result};

/// Heap buffer backed by `u64` words so every element type can be viewed
/// through `bytemuck` without alignment failures.
#[derive(Debug)]
struct Buffer {
    words: Vec<u64>,
    len: usize,
}

impl Buffer {
    fn zeroed(len: usize) -> Self {
        let words = vec![0u64; len.div_ceil(8)];
        alloc::record_alloc(len);
        Self { words, len }
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = Self::zeroed(bytes.len());
        buf.bytes_mut().copy_from_slice(bytes);
        buf
    }

    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        alloc::record_alloc(self.len);
        Self { words: self.words.clone(), len: self.len }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        alloc::record_free(self.len);
    }
}

/// Shared, reference-counted tensor storage.
///
/// Storage is reference-counted (`Arc`) so clones of a tensor share the same
/// bytes; mutation goes through copy-on-write.
#[derive(Debug, Clone)]
pub struct Storage {
    data: Arc<Buffer>,
    dtype: DType,
    /// Number of logical elements (not bytes).
    numel: usize,
}

impl Storage {
    /// Allocate zeroed storage for `numel` elements of the given dtype.
    pub fn zeros(dtype: DType, numel: usize) -> Self {
        Self {
            data: Arc::new(Buffer::zeroed(dtype.storage_bytes(numel))),
            dtype,
            numel,
        }
    }

    /// Create storage from raw bytes in native element layout.
    pub fn from_bytes(dtype: DType, numel: usize, bytes: &[u8]) -> Result<Self> {
        let expected = dtype.storage_bytes(numel);
        if bytes.len() != expected {
            return Err(LowmemError::StorageError(format!(
                "Expected {} bytes for {} elements of {}, got {}",
                expected,
                numel,
                dtype,
                bytes.len()
            )));
        }
        Ok(Self {
            data: Arc::new(Buffer::from_bytes(bytes)),
            dtype,
            numel,
        })
    }

    /// Create storage from a typed slice.
    pub fn from_slice<T: Element>(data: &[T]) -> Self {
        Self {
            data: Arc::new(Buffer::from_bytes(bytemuck::cast_slice(data))),
            dtype: T::DTYPE,
            numel: data.len(),
        }
    }

    /// Get the dtype of this storage.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of logical elements.
    pub fn numel(&self) -> usize {
        self.numel
    }

    /// Size in bytes.
    pub fn nbytes(&self) -> usize {
        self.data.len
    }

    /// Read-only view of the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.data.bytes()
    }

    /// Mutable view of the raw bytes.
    /// Clones the underlying buffer if it is shared (copy-on-write).
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        Arc::make_mut(&mut self.data).bytes_mut()
    }

    /// Interpret storage as a typed slice. `None` if the dtype differs.
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        if self.dtype != T::DTYPE {
            return None;
        }
        Some(bytemuck::cast_slice(self.as_bytes()))
    }

    /// Interpret storage as a mutable typed slice (copy-on-write).
    pub fn as_slice_mut<T: Element>(&mut self) -> Option<&mut [T]> {
        if self.dtype != T::DTYPE {
            return None;
        }
        Some(bytemuck::cast_slice_mut(self.as_bytes_mut()))
    }

    /// Interpret storage as a slice of f32 values.
    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        self.as_slice::<f32>()
    }

    /// Whether this storage is uniquely owned (no other Arc references).
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.data) == 1
    }
}
