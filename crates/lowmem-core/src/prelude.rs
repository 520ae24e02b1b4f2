//! Convenience re-exports for common lowmem-core types.
//!
//! ```rust
//! use lowmem_core::prelude::*;
//! ```

pub use crate::Tensor;
pub use crate::DType;
pub use crate::Shape;
pub use crate::LowmemError;
pub use crate::Result;
