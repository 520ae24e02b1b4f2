//! Layer Normalization.
//!
//! Normalizes across the last dimension: y = (x - mean) / sqrt(var + eps) * weight + bias

use lowmem_core::{DType, LowmemError, Result, Tensor};

use crate::module::Module;
use crate::param::Param;

/// Layer Normalization over the last dimension.
pub struct LayerNorm {
    normalized_shape: usize,
    eps: f32,
    weight: Param,
    bias: Param,
}

impl LayerNorm {
    pub fn new(normalized_shape: usize, eps: f32) -> Self {
        Self {
            normalized_shape,
            eps,
            weight: Param::new(Tensor::ones(&[normalized_shape])),
            bias: Param::new(Tensor::zeros(&[normalized_shape], DType::F32)),
        }
    }

    /// Create with default eps (1e-5).
    pub fn default_new(normalized_shape: usize) -> Self {
        Self::new(normalized_shape, 1e-5)
    }

    pub fn normalized_shape(&self) -> usize {
        self.normalized_shape
    }

    pub fn eps(&self) -> f32 {
        self.eps
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let n = self.normalized_shape;
        if input.ndim() == 0 {
            return Err(LowmemError::InvalidArgument("LayerNorm: empty shape".into()));
        }
        if input.shape().last_dim() != n {
            return Err(LowmemError::ShapeMismatch {
                expected: vec![n],
                got: vec![input.shape().last_dim()],
            });
        }
        let gamma = self.weight.require("weight")?.to_f32_vec();
        let beta = self.bias.require("bias")?.to_f32_vec();

        let mut data = input.to_f32_vec();
        if n > 0 {
            for row in data.chunks_exact_mut(n) {
                let mean = row.iter().sum::<f32>() / n as f32;
                let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
                let inv_std = 1.0 / (var + self.eps).sqrt();
                for (i, v) in row.iter_mut().enumerate() {
                    *v = (*v - mean) * inv_std * gamma[i] + beta[i];
                }
            }
        }
        Tensor::from_slice(&data, input.shape().dims())
    }
}

impl Module for LayerNorm {
    fn params(&self) -> Vec<(&str, &Param)> {
        vec![("weight", &self.weight), ("bias", &self.bias)]
    }

    fn params_mut(&mut self) -> Vec<(&str, &mut Param)> {
        vec![("weight", &mut self.weight), ("bias", &mut self.bias)]
    }
}
