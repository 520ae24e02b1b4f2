//! # lowmem-checkpoint
//!
//! Load model weights without holding a full state dict and a full model at
//! the same time.
//!
//! - [`split`]: one-file-per-parameter checkpoints with a name manifest.
//! - [`registry`]: placeholders and the side table of deferred sources.
//! - [`materialize`]: fills annotated placeholders, one parameter at a time.
//! - [`pretrained`]: `config.json` + `model.safetensors` loading.

pub mod error;
pub mod materialize;
pub mod pretrained;
pub mod registry;
pub mod split;

pub use error::{CheckpointError, Result};
pub use materialize::MaterializeReport;
pub use pretrained::{from_pretrained, LowMemory, PretrainedConfig, PretrainedModel};
pub use registry::{nullify, DeferredSource, LazyRegistry};
pub use split::{
    load_manifest, load_split, load_split_tensor, sanitize_file_name, save_pretrained_split,
    save_split, EmptySpec, Manifest, SplitEntry,
};
