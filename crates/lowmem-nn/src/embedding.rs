//! Embedding layer: lookup table from token IDs to dense vectors.

use lowmem_core::{LowmemError, Result, Tensor};

use crate::module::Module;
use crate::param::Param;

/// Embedding lookup table of shape `[num_embeddings, embedding_dim]`.
pub struct Embedding {
    weight: Param,
}

impl Embedding {
    /// Create with N(0, 0.02) initialization.
    pub fn new(num_embeddings: usize, embedding_dim: usize) -> Self {
        let weight = Tensor::randn_with(
            &[num_embeddings, embedding_dim],
            0.02,
            &mut rand::thread_rng(),
        );
        Self {
            weight: Param::new(weight),
        }
    }

    pub fn from_param(weight: Param) -> Self {
        Self { weight }
    }

    pub fn weight(&self) -> &Param {
        &self.weight
    }

    /// Look up embeddings for a slice of token IDs.
    /// Returns an f32 tensor of shape `[ids.len(), embedding_dim]`.
    /// Out-of-range IDs get zero vectors.
    pub fn lookup(&self, ids: &[u32]) -> Result<Tensor> {
        let weight = self.weight.require("weight")?;
        let &[num, dim] = weight.shape().dims() else {
            return Err(LowmemError::InvalidArgument(format!(
                "embedding weight must be 2-D, got {}",
                weight.shape()
            )));
        };
        let w = weight.to_f32_vec();

        let mut result = vec![0.0f32; ids.len() * dim];
        for (i, &id) in ids.iter().enumerate() {
            let id = id as usize;
            if id < num {
                result[i * dim..(i + 1) * dim].copy_from_slice(&w[id * dim..(id + 1) * dim]);
            }
        }
        Tensor::from_slice(&result, &[ids.len(), dim])
    }
}

impl Module for Embedding {
    fn params(&self) -> Vec<(&str, &Param)> {
        vec![("weight", &self.weight)]
    }

    fn params_mut(&mut self) -> Vec<(&str, &mut Param)> {
        vec![("weight", &mut self.weight)]
    }
}
