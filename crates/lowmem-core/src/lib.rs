//! # lowmem-core
//!
//! Tensor substrate for the lowmem loading stack.
//!
//! Provides:
//! - `Tensor`: dense CPU tensor with shape, dtype and shared storage
//! - `DType`: float, integer and bool element types with torch-style names
//! - `Storage`: aligned, copy-on-write byte buffer
//! - `alloc`: per-thread live/peak byte accounting for tensor storage

pub mod alloc;
pub mod dtype;
pub mod element;
pub mod error;
pub mod shape;
pub mod storage;
pub mod tensor;
pub mod prelude;

pub use dtype::DType;
pub use element::Element;
pub use error::LowmemError;
pub use shape::Shape;
pub use storage::Storage;
pub use tensor::Tensor;

pub type Result<T> = std::result::Result<T, LowmemError>;
