//! # lowmem-nn
//!
//! Parameter placeholders, the module tree walked by the checkpoint loader,
//! a handful of layers, safetensors serialization and greedy decoding.

pub mod embedding;
pub mod generate;
pub mod layer_norm;
pub mod linear;
pub mod module;
pub mod module_list;
pub mod param;
pub mod prelude;
pub mod serialization;

pub use embedding::Embedding;
pub use generate::{argmax, greedy_search, CausalLm};
pub use layer_norm::LayerNorm;
pub use linear::{LazyLinear, Linear};
pub use module::{qualify, Module};
pub use module_list::ModuleList;
pub use param::Param;
