use std::fmt;

use half::{bf16, f16};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::element::Element;
use crate::dtype::DType;
use crate::error::LowmemError;
use crate::shape::Shape;
use crate::storage::Storage;
use crate::Result;

/// A dense, contiguous, row-major CPU tensor.
///
/// Cloning is cheap: clones share storage until one of them is written to.
///
/// # Examples
///
/// ```
/// use lowmem_core::{DType, Tensor};
///
/// let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
/// assert_eq!(t.shape().dims(), &[2, 2]);
///
/// let h = t.to_dtype(DType::F16);
/// assert_eq!(h.dtype(), DType::F16);
/// assert_eq!(h.nbytes(), 8);
/// ```
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a tensor from f32 data with the given shape.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the shape's element count.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(
            s.numel(),
            data.len(),
            "Shape {:?} requires {} elements, got {}",
            shape,
            s.numel(),
            data.len()
        );
        Self {
            storage: Storage::from_slice(data),
            shape: s,
        }
    }

    /// Create a tensor from a typed slice, checking the element count.
    pub fn from_slice<T: Element>(data: &[T], shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != data.len() {
            return Err(LowmemError::InvalidReshape {
                numel: data.len(),
                shape: shape.to_vec(),
            });
        }
        Ok(Self {
            storage: Storage::from_slice(data),
            shape: s,
        })
    }

    /// Create a tensor from raw bytes in native element layout.
    pub fn from_bytes(dtype: DType, shape: &[usize], bytes: &[u8]) -> Result<Self> {
        let s = Shape::new(shape);
        let storage = Storage::from_bytes(dtype, s.numel(), bytes)?;
        Ok(Self { storage, shape: s })
    }

    /// Create a tensor of zeros with the given shape and dtype.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let s = Shape::new(shape);
        Self {
            storage: Storage::zeros(dtype, s.numel()),
            shape: s,
        }
    }

    /// Create a tensor of ones (f32).
    pub fn ones(shape: &[usize]) -> Self {
        let numel = Shape::new(shape).numel();
        Self::from_f32(&vec![1.0; numel], shape)
    }

    /// Zero-mean normal samples in f32, scaled by `std`, drawn from `rng`.
    pub fn randn_with<R: Rng>(shape: &[usize], std: f32, rng: &mut R) -> Self {
        let numel = Shape::new(shape).numel();
        let data: Vec<f32> = (0..numel)
            .map(|_| {
                let z: f32 = rng.sample(StandardNormal);
                z * std
            })
            .collect();
        Self::from_f32(&data, shape)
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Shape of the tensor.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Data type.
    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    /// Size of the backing storage in bytes.
    pub fn nbytes(&self) -> usize {
        self.storage.nbytes()
    }

    // =========================================================================
    // Data access
    // =========================================================================

    /// Raw bytes in native element layout.
    pub fn as_bytes(&self) -> &[u8] {
        self.storage.as_bytes()
    }

    /// Typed view of the data. `None` if `T` does not match the dtype.
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        self.storage.as_slice::<T>()
    }

    /// The underlying f32 data, if this is an f32 tensor.
    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        self.storage.as_f32_slice()
    }

    /// All elements converted to f32, whatever the dtype.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self.as_f32_slice() {
            Some(data) => data.to_vec(),
            None => self.float_values().into_iter().map(|v| v as f32).collect(),
        }
    }

    // =========================================================================
    // Conversion and copy
    // =========================================================================

    /// Convert to another dtype. Returns a shared clone if nothing changes.
    ///
    /// Integer and bool sources going to integer or bool targets convert
    /// through i64; everything else goes through f64. Float to integer
    /// conversion saturates; integer narrowing wraps.
    pub fn to_dtype(&self, dtype: DType) -> Tensor {
        if dtype == self.dtype() {
            return self.clone();
        }
        let integral = |d: DType| d.is_integer() || d == DType::Bool;
        let storage = if integral(self.dtype()) && integral(dtype) {
            storage_from_i64(dtype, &self.int_values())
        } else {
            storage_from_f64(dtype, &self.float_values())
        };
        Tensor {
            storage,
            shape: self.shape.clone(),
        }
    }

    /// Copy `src` into this tensor's existing storage, casting to this
    /// tensor's dtype. Shapes must match exactly.
    pub fn copy_from(&mut self, src: &Tensor) -> Result<()> {
        if self.shape != src.shape {
            return Err(LowmemError::ShapeMismatch {
                expected: self.shape.dims().to_vec(),
                got: src.shape.dims().to_vec(),
            });
        }
        let converted = src.to_dtype(self.dtype());
        self.storage
            .as_bytes_mut()
            .copy_from_slice(converted.as_bytes());
        Ok(())
    }

    fn typed<T: Element>(&self) -> &[T] {
        bytemuck::cast_slice(self.storage.as_bytes())
    }

    fn float_values(&self) -> Vec<f64> {
        match self.dtype() {
            DType::F16 => self.typed::<f16>().iter().map(|v| v.to_f64()).collect(),
            DType::BF16 => self.typed::<bf16>().iter().map(|v| v.to_f64()).collect(),
            DType::F32 => self.typed::<f32>().iter().map(|&v| v as f64).collect(),
            DType::F64 => self.typed::<f64>().to_vec(),
            DType::I8 => self.typed::<i8>().iter().map(|&v| v as f64).collect(),
            DType::U8 => self.typed::<u8>().iter().map(|&v| v as f64).collect(),
            DType::I32 => self.typed::<i32>().iter().map(|&v| v as f64).collect(),
            DType::I64 => self.typed::<i64>().iter().map(|&v| v as f64).collect(),
            DType::Bool => self.as_bytes().iter().map(|&b| if b != 0 { 1.0 } else { 0.0 }).collect(),
        }
    }

    fn int_values(&self) -> Vec<i64> {
        match self.dtype() {
            DType::I8 => self.typed::<i8>().iter().map(|&v| v as i64).collect(),
            DType::U8 => self.typed::<u8>().iter().map(|&v| v as i64).collect(),
            DType::I32 => self.typed::<i32>().iter().map(|&v| v as i64).collect(),
            DType::I64 => self.typed::<i64>().to_vec(),
            DType::Bool => self.as_bytes().iter().map(|&b| (b != 0) as i64).collect(),
            _ => self.float_values().into_iter().map(|v| v as i64).collect(),
        }
    }
}

fn storage_from_f64(dtype: DType, values: &[f64]) -> Storage {
    match dtype {
        DType::F16 => Storage::from_slice(&values.iter().map(|&v| f16::from_f64(v)).collect::<Vec<_>>()),
        DType::BF16 => Storage::from_slice(&values.iter().map(|&v| bf16::from_f64(v)).collect::<Vec<_>>()),
        DType::F32 => Storage::from_slice(&values.iter().map(|&v| v as f32).collect::<Vec<_>>()),
        DType::F64 => Storage::from_slice(values),
        DType::I8 => Storage::from_slice(&values.iter().map(|&v| v as i8).collect::<Vec<_>>()),
        DType::U8 => Storage::from_slice(&values.iter().map(|&v| v as u8).collect::<Vec<_>>()),
        DType::I32 => Storage::from_slice(&values.iter().map(|&v| v as i32).collect::<Vec<_>>()),
        DType::I64 => Storage::from_slice(&values.iter().map(|&v| v as i64).collect::<Vec<_>>()),
        DType::Bool => bool_storage(values.iter().map(|&v| v != 0.0)),
    }
}

fn storage_from_i64(dtype: DType, values: &[i64]) -> Storage {
    match dtype {
        DType::I8 => Storage::from_slice(&values.iter().map(|&v| v as i8).collect::<Vec<_>>()),
        DType::U8 => Storage::from_slice(&values.iter().map(|&v| v as u8).collect::<Vec<_>>()),
        DType::I32 => Storage::from_slice(&values.iter().map(|&v| v as i32).collect::<Vec<_>>()),
        DType::I64 => Storage::from_slice(values),
        DType::Bool => bool_storage(values.iter().map(|&v| v != 0)),
        float => storage_from_f64(float, &values.iter().map(|&v| v as f64).collect::<Vec<_>>()),
    }
}

fn bool_storage(values: impl Iterator<Item = bool>) -> Storage {
    let bytes: Vec<u8> = values.map(u8::from).collect();
    let mut storage = Storage::zeros(DType::Bool, bytes.len());
    storage.as_bytes_mut().copy_from_slice(&bytes);
    storage
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, nbytes={})",
            self.shape,
            self.dtype(),
            self.nbytes(),
        )
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.to_f32_vec();
        if data.len() <= 20 {
            write!(f, "tensor({:?}, shape={}, dtype={})", data, self.shape, self.dtype())
        } else {
            write!(
                f,
                "tensor([{:.4}, {:.4}, ..., {:.4}], shape={}, dtype={})",
                data[0],
                data[1],
                data[data.len() - 1],
                self.shape,
                self.dtype()
            )
        }
    }
}
