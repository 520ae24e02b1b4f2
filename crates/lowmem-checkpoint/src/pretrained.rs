//! Loading models from a pretrained directory.
//!
//! A model directory holds `config.json` and `model.safetensors`. The
//! checkpoint is either a regular safetensors file, loaded eagerly, or a
//! split directory written by [`crate::split::save_split`], loaded lazily.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::Path;

use lowmem_core::{DType, Tensor};
use lowmem_nn::{serialization, Module};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{CheckpointError, Result};
use crate::materialize::MaterializeReport;
use crate::registry::{self, LazyRegistry};
use crate::split::{self, Manifest};

/// Model configuration file inside a pretrained directory.
pub const CONFIG_NAME: &str = "config.json";

/// Checkpoint inside a pretrained directory: a file or a split directory.
pub const CHECKPOINT_NAME: &str = "model.safetensors";

// ============================================================================
// Config loading (HuggingFace-style config.json)
// ============================================================================

/// Common HuggingFace `config.json` fields. Everything else lands in `extra`.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct PretrainedConfig {
    #[serde(alias = "hidden_size", alias = "n_embd")]
    pub d_model: Option<usize>,
    #[serde(alias = "num_attention_heads", alias = "n_head")]
    pub n_heads: Option<usize>,
    #[serde(alias = "num_hidden_layers", alias = "num_layers", alias = "n_layer")]
    pub n_layers: Option<usize>,
    #[serde(alias = "intermediate_size")]
    pub d_ff: Option<usize>,
    pub vocab_size: Option<usize>,
    #[serde(alias = "max_position_embeddings", alias = "n_positions")]
    pub max_seq_len: Option<usize>,
    #[serde(alias = "rms_norm_eps", alias = "layer_norm_epsilon")]
    pub norm_eps: Option<f64>,
    pub eos_token_id: Option<u32>,
    pub torch_dtype: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PretrainedConfig {
    /// Load from a `config.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        read_config(path)
    }

    /// The declared parameter dtype, if it names one this crate knows.
    pub fn dtype(&self) -> Option<DType> {
        self.torch_dtype.as_deref().and_then(DType::from_name)
    }
}

/// Read and parse any JSON config file.
pub fn read_config<C: DeserializeOwned>(path: &Path) -> Result<C> {
    let data = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CheckpointError::NotFound(path.to_path_buf()),
        _ => CheckpointError::io(path, e),
    })?;
    serde_json::from_str(&data).map_err(|e| CheckpointError::format(path, e))
}

// ============================================================================
// Models
// ============================================================================

/// A model that can be built from a config and filled from a checkpoint.
pub trait PretrainedModel: Module + Sized {
    type Config: DeserializeOwned;

    /// Build the model with whatever initial parameters it likes; they are
    /// dropped before the checkpoint is loaded.
    fn from_config(config: &Self::Config) -> Result<Self>;

    /// The module tree whose names match the checkpoint. Wrapping models
    /// return the wrapped model here.
    fn checkpoint_module(&self) -> &dyn Module {
        self
    }

    fn checkpoint_module_mut(&mut self) -> &mut dyn Module {
        self
    }
}

/// Build `M` from `path/config.json` and attach `path/model.safetensors`.
///
/// A split checkpoint is only annotated; call [`LowMemory::materialize`]
/// before running the model. A single-file checkpoint is copied in directly.
pub fn from_pretrained<M: PretrainedModel>(path: &Path) -> Result<LowMemory<M>> {
    let config: M::Config = read_config(&path.join(CONFIG_NAME))?;
    let mut model = LowMemory::new(M::from_config(&config)?);
    model.nullify();

    let checkpoint = path.join(CHECKPOINT_NAME);
    if checkpoint.is_dir() {
        model.load_state_dict_dir(&checkpoint)?;
    } else if checkpoint.is_file() {
        let mut state_dict = serialization::load_state_dict(&checkpoint)?;
        model.load_state_dict_low_memory(&mut state_dict)?;
        if !state_dict.is_empty() {
            let mut unused: Vec<&String> = state_dict.keys().collect();
            unused.sort();
            tracing::warn!("{} checkpoint tensors matched no parameter: {:?}", unused.len(), unused);
        }
    } else {
        return Err(CheckpointError::NotFound(checkpoint));
    }
    Ok(model)
}

/// A model paired with the deferred sources of its parameters.
pub struct LowMemory<M> {
    model: M,
    registry: LazyRegistry,
}

impl<M: PretrainedModel> LowMemory<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            registry: LazyRegistry::new(),
        }
    }

    /// Drop the storage of every checkpoint parameter.
    pub fn nullify(&mut self) -> usize {
        registry::nullify(self.model.checkpoint_module_mut())
    }

    /// Annotate parameters from a split checkpoint directory.
    pub fn load_state_dict_dir(&mut self, dir: &Path) -> Result<usize> {
        self.registry
            .annotate_from_directory(self.model.checkpoint_module(), dir)
    }

    /// Copy matching tensors in now, consuming their keys.
    pub fn load_state_dict_low_memory(&mut self, state_dict: &mut HashMap<String, Tensor>) -> Result<usize> {
        self.registry
            .annotate_from_dict(self.model.checkpoint_module_mut(), state_dict)
    }

    pub fn materialize(&mut self) -> MaterializeReport {
        self.registry.materialize(self.model.checkpoint_module_mut())
    }

    pub fn materialize_with_rng<R: Rng>(&mut self, rng: &mut R) -> MaterializeReport {
        self.registry
            .materialize_with_rng(self.model.checkpoint_module_mut(), rng)
    }

    /// Write the checkpoint module as a split directory.
    pub fn save_pretrained_split(&self, dir: &Path, init_std: f64) -> Result<Manifest> {
        split::save_pretrained_split(self.model.checkpoint_module(), dir, init_std)
    }

    pub fn registry(&self) -> &LazyRegistry {
        &self.registry
    }

    pub fn module(&self) -> &M {
        &self.model
    }

    pub fn module_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// Whether no annotations are left and no checkpoint parameter is a placeholder.
    pub fn is_materialized(&self) -> bool {
        self.registry.is_empty() && self.model.checkpoint_module().num_lazy() == 0
    }

    /// Hand out the model. Fails while annotations remain unresolved.
    pub fn into_inner(self) -> Result<M> {
        if !self.registry.is_empty() {
            return Err(CheckpointError::Unresolved(self.registry.names()));
        }
        Ok(self.model)
    }
}

impl<M> Deref for LowMemory<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.model
    }
}

impl<M> DerefMut for LowMemory<M> {
    fn deref_mut(&mut self) -> &mut M {
        &mut self.model
    }
}
