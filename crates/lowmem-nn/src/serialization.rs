//! State dict save/load using the safetensors format.
//!
//! Tensors keep their dtype on disk. Element bytes are written as stored,
//! which is little-endian on every host this crate supports.

use std::collections::HashMap;
use std::path::Path;

use lowmem_core::{DType, LowmemError, Result, Tensor};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};

use crate::module::Module;

/// Map a tensor dtype to its safetensors counterpart.
pub fn to_safetensors_dtype(dtype: DType) -> Dtype {
    match dtype {
        DType::F16 => Dtype::F16,
        DType::BF16 => Dtype::BF16,
        DType::F32 => Dtype::F32,
        DType::F64 => Dtype::F64,
        DType::I8 => Dtype::I8,
        DType::U8 => Dtype::U8,
        DType::I32 => Dtype::I32,
        DType::I64 => Dtype::I64,
        DType::Bool => Dtype::BOOL,
    }
}

/// Map a safetensors dtype to a tensor dtype, if supported.
pub fn from_safetensors_dtype(dtype: Dtype) -> Result<DType> {
    match dtype {
        Dtype::F16 => Ok(DType::F16),
        Dtype::BF16 => Ok(DType::BF16),
        Dtype::F32 => Ok(DType::F32),
        Dtype::F64 => Ok(DType::F64),
        Dtype::I8 => Ok(DType::I8),
        Dtype::U8 => Ok(DType::U8),
        Dtype::I32 => Ok(DType::I32),
        Dtype::I64 => Ok(DType::I64),
        Dtype::BOOL => Ok(DType::Bool),
        other => Err(LowmemError::StorageError(format!(
            "Unsupported safetensors dtype: {:?}",
            other
        ))),
    }
}

/// Copy a safetensors view into an owned tensor.
pub fn tensor_from_view(view: &TensorView<'_>) -> Result<Tensor> {
    let dtype = from_safetensors_dtype(view.dtype())?;
    Tensor::from_bytes(dtype, view.shape(), view.data())
}

/// Encode named tensors as a safetensors buffer.
pub fn serialize(tensors: &[(String, Tensor)]) -> Result<Vec<u8>> {
    let mut views = Vec::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        let view = TensorView::new(
            to_safetensors_dtype(tensor.dtype()),
            tensor.shape().dims().to_vec(),
            tensor.as_bytes(),
        )
        .map_err(|e| LowmemError::StorageError(format!("safetensors view error: {}", e)))?;
        views.push((name.as_str(), view));
    }

    safetensors::serialize(views, &None)
        .map_err(|e| LowmemError::StorageError(format!("safetensors serialize error: {}", e)))
}

/// Decode every tensor in a safetensors buffer, sorted by name.
pub fn deserialize(bytes: &[u8]) -> Result<Vec<(String, Tensor)>> {
    let st = SafeTensors::deserialize(bytes)
        .map_err(|e| LowmemError::StorageError(format!("safetensors parse error: {}", e)))?;

    let mut out = Vec::with_capacity(st.len());
    for (name, view) in st.tensors() {
        out.push((name, tensor_from_view(&view)?));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Save a state dict to a safetensors file.
pub fn save_state_dict(state_dict: &[(String, Tensor)], path: &Path) -> Result<()> {
    let serialized = serialize(state_dict)?;
    std::fs::write(path, serialized)
        .map_err(|e| LowmemError::StorageError(format!("Failed to write {}: {}", path.display(), e)))?;
    tracing::debug!(path = %path.display(), tensors = state_dict.len(), "saved state dict");
    Ok(())
}

/// Load a state dict from a safetensors file.
pub fn load_state_dict(path: &Path) -> Result<HashMap<String, Tensor>> {
    let data = std::fs::read(path)
        .map_err(|e| LowmemError::StorageError(format!("Failed to read {}: {}", path.display(), e)))?;
    Ok(deserialize(&data)?.into_iter().collect())
}

/// Save a module's backed parameters to a safetensors file.
pub fn save_module(module: &dyn Module, path: &Path) -> Result<()> {
    save_state_dict(&module.state_dict(), path)
}
