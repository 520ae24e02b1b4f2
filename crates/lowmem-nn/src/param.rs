//! Module parameters that may or may not have backing storage.

use lowmem_core::{DType, LowmemError, Result, Shape, Tensor};

/// A parameter slot owned by a module.
///
/// `Unbacked` is a placeholder: it knows the element type it will hold and
/// may remember the shape it had before being nullified, but it owns no
/// storage. The hint is informational only; materialization always takes
/// its shape from the data being loaded.
#[derive(Clone, Debug)]
pub enum Param {
    Unbacked {
        dtype: DType,
        shape_hint: Option<Shape>,
    },
    Backed(Tensor),
}

impl Param {
    /// A parameter backed by `tensor`.
    pub fn new(tensor: Tensor) -> Self {
        Param::Backed(tensor)
    }

    /// A placeholder with no shape commitment.
    pub fn uninitialized(dtype: DType) -> Self {
        Param::Unbacked { dtype, shape_hint: None }
    }

    /// A placeholder that remembers an expected shape.
    pub fn placeholder(dtype: DType, shape: impl Into<Shape>) -> Self {
        Param::Unbacked {
            dtype,
            shape_hint: Some(shape.into()),
        }
    }

    /// Whether this parameter still lacks storage.
    pub fn is_lazy(&self) -> bool {
        matches!(self, Param::Unbacked { .. })
    }

    pub fn tensor(&self) -> Option<&Tensor> {
        match self {
            Param::Backed(t) => Some(t),
            Param::Unbacked { .. } => None,
        }
    }

    /// The tensor, or an `Unmaterialized` error naming the parameter.
    pub fn require(&self, name: &str) -> Result<&Tensor> {
        self.tensor()
            .ok_or_else(|| LowmemError::Unmaterialized(name.to_string()))
    }

    pub fn dtype(&self) -> DType {
        match self {
            Param::Backed(t) => t.dtype(),
            Param::Unbacked { dtype, .. } => *dtype,
        }
    }

    /// Actual shape when backed, otherwise the hint (if any).
    pub fn shape(&self) -> Option<&Shape> {
        match self {
            Param::Backed(t) => Some(t.shape()),
            Param::Unbacked { shape_hint, .. } => shape_hint.as_ref(),
        }
    }

    /// Bytes of backing storage held by this parameter.
    pub fn nbytes(&self) -> usize {
        self.tensor().map_or(0, Tensor::nbytes)
    }

    /// Drop the storage, keeping dtype and shape as metadata.
    pub fn nullify(&mut self) {
        if let Param::Backed(t) = self {
            *self = Param::Unbacked {
                dtype: t.dtype(),
                shape_hint: Some(t.shape().clone()),
            };
        }
    }

    /// Copy `src` into the parameter, casting to the parameter's dtype.
    ///
    /// A placeholder is first materialized with `src`'s shape; a backed
    /// parameter must already have that shape.
    pub fn copy_from(&mut self, src: &Tensor) -> Result<()> {
        match self {
            Param::Backed(t) => t.copy_from(src),
            Param::Unbacked { dtype, .. } => {
                let mut t = Tensor::zeros(src.shape().dims(), *dtype);
                t.copy_from(src)?;
                *self = Param::Backed(t);
                Ok(())
            }
        }
    }
}

impl From<Tensor> for Param {
    fn from(tensor: Tensor) -> Self {
        Param::Backed(tensor)
    }
}
