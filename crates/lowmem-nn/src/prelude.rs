//! Convenience re-exports for model code.

pub use crate::{CausalLm, Embedding, LayerNorm, LazyLinear, Linear, Module, ModuleList, Param};
pub use lowmem_core::prelude::*;
