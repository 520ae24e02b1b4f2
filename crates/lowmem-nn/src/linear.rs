use lowmem_core::{DType, LowmemError, Result, Tensor};

use crate::module::Module;
use crate::param::Param;

/// Fully connected layer: y = x @ W^T + b
pub struct Linear {
    weight: Param,
    bias: Option<Param>,
}

impl Linear {
    /// Create a new Linear layer with Xavier initialization.
    pub fn new(in_features: usize, out_features: usize, bias: bool) -> Self {
        let weight = xavier(in_features, out_features);
        let bias = bias.then(|| Param::new(Tensor::zeros(&[out_features], DType::F32)));
        Self {
            weight: Param::new(weight),
            bias,
        }
    }

    /// Build from existing parameters.
    pub fn from_params(weight: Param, bias: Option<Param>) -> Self {
        Self { weight, bias }
    }

    pub fn weight(&self) -> &Param {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Param> {
        self.bias.as_ref()
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let weight = self.weight.require("weight")?;
        let bias = match &self.bias {
            Some(b) => Some(b.require("bias")?),
            None => None,
        };
        affine(input, weight, bias)
    }
}

impl Module for Linear {
    fn params(&self) -> Vec<(&str, &Param)> {
        let mut params = vec![("weight", &self.weight)];
        if let Some(ref b) = self.bias {
            params.push(("bias", b));
        }
        params
    }

    fn params_mut(&mut self) -> Vec<(&str, &mut Param)> {
        let mut params = vec![("weight", &mut self.weight)];
        if let Some(ref mut b) = self.bias {
            params.push(("bias", b));
        }
        params
    }
}

/// Linear layer whose input width is unknown until its weight is loaded.
///
/// The weight starts as a placeholder with no shape; `in_features` becomes
/// known once it is materialized from a checkpoint or by [`LazyLinear::initialize`].
pub struct LazyLinear {
    out_features: usize,
    weight: Param,
    bias: Option<Param>,
}

impl LazyLinear {
    pub fn new(out_features: usize, bias: bool, dtype: DType) -> Self {
        Self {
            out_features,
            weight: Param::uninitialized(dtype),
            bias: bias.then(|| Param::placeholder(dtype, [out_features])),
        }
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> &Param {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Param> {
        self.bias.as_ref()
    }

    /// Input width, known only once the weight has been materialized.
    pub fn in_features(&self) -> Option<usize> {
        self.weight.tensor().and_then(|w| w.shape().dim(1))
    }

    /// Materialize with fresh Xavier weights for `in_features` inputs.
    pub fn initialize(&mut self, in_features: usize) -> Result<()> {
        if self.weight.is_lazy() {
            self.weight.copy_from(&xavier(in_features, self.out_features))?;
        }
        if let Some(b) = self.bias.as_mut() {
            if b.is_lazy() {
                b.copy_from(&Tensor::zeros(&[self.out_features], DType::F32))?;
            }
        }
        Ok(())
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let weight = self.weight.require("weight")?;
        let bias = match &self.bias {
            Some(b) => Some(b.require("bias")?),
            None => None,
        };
        affine(input, weight, bias)
    }
}

impl Module for LazyLinear {
    fn params(&self) -> Vec<(&str, &Param)> {
        let mut params = vec![("weight", &self.weight)];
        if let Some(ref b) = self.bias {
            params.push(("bias", b));
        }
        params
    }

    fn params_mut(&mut self) -> Vec<(&str, &mut Param)> {
        let mut params = vec![("weight", &mut self.weight)];
        if let Some(ref mut b) = self.bias {
            params.push(("bias", b));
        }
        params
    }
}

fn xavier(in_features: usize, out_features: usize) -> Tensor {
    // Xavier uniform: U(-sqrt(6/(in+out)), sqrt(6/(in+out))), deterministic
    let limit = (6.0 / (in_features + out_features).max(1) as f32).sqrt();
    let data: Vec<f32> = (0..in_features * out_features)
        .map(|i| {
            let x = ((i as f32 * 0.618034) % 1.0) * 2.0 - 1.0;
            x * limit
        })
        .collect();
    Tensor::from_f32(&data, &[out_features, in_features])
}

/// y = x @ W^T + b over the last dimension of `input`, computed in f32.
fn affine(input: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let (out_f, in_f) = match weight.shape().dims() {
        &[o, i] => (o, i),
        dims => {
            return Err(LowmemError::InvalidArgument(format!(
                "linear weight must be 2-D, got shape {:?}",
                dims
            )))
        }
    };
    if input.shape().last_dim() != in_f {
        return Err(LowmemError::ShapeMismatch {
            expected: vec![in_f],
            got: input.shape().dims().to_vec(),
        });
    }

    let x = input.to_f32_vec();
    let w = weight.to_f32_vec();
    let b = bias.map(Tensor::to_f32_vec);
    let rows = if in_f == 0 { 0 } else { x.len() / in_f };

    let mut y = vec![0.0f32; rows * out_f];
    for r in 0..rows {
        let xr = &x[r * in_f..(r + 1) * in_f];
        for o in 0..out_f {
            let wo = &w[o * in_f..(o + 1) * in_f];
            let mut acc: f32 = xr.iter().zip(wo).map(|(a, b)| a * b).sum();
            if let Some(ref b) = b {
                acc += b[o];
            }
            y[r * out_f + o] = acc;
        }
    }

    let mut out_shape = input.shape().dims().to_vec();
    match out_shape.last_mut() {
        Some(last) => *last = out_f,
        None => out_shape.push(out_f),
    }
    Tensor::from_slice(&y, &out_shape)
}
