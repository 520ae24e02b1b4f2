//! Split checkpoints: one file per parameter plus a name manifest.
//!
//! Layout of a split directory:
//!
//! ```text
//! key_to_filename.json          {"<name>": "p<index>.<sanitized name>", ...}
//! p0.embed.weight               safetensors file holding one tensor
//! p1.head.weight.empty_json     {"shape": [...], "torch_dtype": "...", "init_std": ...}
//! ```
//!
//! The index prefix keeps file names unique even when two parameter names
//! sanitize to the same string.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use lowmem_core::{DType, LowmemError, Shape, Tensor};
use lowmem_nn::serialization::{self, tensor_from_view};
use lowmem_nn::Module;
use rand::Rng;
use regex::Regex;
use safetensors::SafeTensors;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CheckpointError, Result};

/// Name of the manifest side-car inside a split directory.
pub const KEY_TO_FILENAME_JSON: &str = "key_to_filename.json";

/// Suffix marking a file as an [`EmptySpec`] rather than tensor data.
pub const EMPTY_JSON_SUFFIX: &str = ".empty_json";

/// Whether a manifest file name refers to an empty-parameter spec.
pub fn is_empty_json(file_name: &str) -> bool {
    file_name.ends_with(EMPTY_JSON_SUFFIX)
}

/// Turn a parameter name into a file-name body.
///
/// Trims surrounding whitespace, turns spaces into `_` and drops every
/// character that is not a letter, a number, `_`, `-` or `.`. Combining
/// marks are dropped too.
///
/// ```
/// use lowmem_checkpoint::split::sanitize_file_name;
///
/// assert_eq!(sanitize_file_name(" my layer/weight ").unwrap(), "my_layerweight");
/// assert!(sanitize_file_name("..").is_err());
/// ```
pub fn sanitize_file_name(name: &str) -> Result<String> {
    static DISALLOWED: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    let disallowed = DISALLOWED
        .get_or_init(|| Regex::new(r"[^-_.\p{L}\p{N}]"))
        .as_ref()
        .map_err(|e| CheckpointError::InvalidName(format!("{name} ({e})")))?;

    let spaced = name.trim().replace(' ', "_");
    let sanitized = disallowed.replace_all(&spaced, "").into_owned();
    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        return Err(CheckpointError::InvalidName(name.to_string()));
    }
    Ok(sanitized)
}

// ============================================================================
// Manifest
// ============================================================================

/// Ordered mapping from parameter name to file name within a split directory.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Manifest {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `name` to `file`. A repeated name keeps its position and takes the
    /// new file.
    pub fn insert(&mut self, name: String, file: String) {
        match self.index.get(&name) {
            Some(&i) => self.entries[i].1 = file,
            None => {
                self.index.insert(name.clone(), self.entries.len());
                self.entries.push((name, file));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.index.get(name).map(|&i| self.entries[i].1.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl Serialize for Manifest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, file) in &self.entries {
            map.serialize_entry(name, file)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Manifest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ManifestVisitor;

        impl<'de> Visitor<'de> for ManifestVisitor {
            type Value = Manifest;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map from parameter name to file name")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Manifest, A::Error> {
                let mut manifest = Manifest::new();
                while let Some((name, file)) = access.next_entry::<String, String>()? {
                    manifest.insert(name, file);
                }
                Ok(manifest)
            }
        }

        deserializer.deserialize_map(ManifestVisitor)
    }
}

// ============================================================================
// Entries
// ============================================================================

/// Shape, dtype and init scale of a parameter that has no data yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmptySpec {
    pub shape: Shape,
    pub torch_dtype: DType,
    pub init_std: f64,
}

impl EmptySpec {
    pub fn new(shape: impl Into<Shape>, torch_dtype: DType, init_std: f64) -> Self {
        Self {
            shape: shape.into(),
            torch_dtype,
            init_std,
        }
    }

    /// Bytes the materialized tensor will occupy.
    pub fn nbytes(&self) -> usize {
        self.torch_dtype.storage_bytes(self.shape.numel())
    }

    /// Largest buffer sampling needs (the f32 draw or the cast result), or
    /// `None` if it cannot be addressed.
    fn sample_bytes(&self) -> Option<usize> {
        let width = self.torch_dtype.element_size().max(DType::F32.element_size());
        self.shape
            .checked_numel()?
            .checked_mul(width)
            .filter(|&bytes| bytes <= isize::MAX as usize)
    }

    /// Draw `N(0, 1) * init_std` in f32 and cast to the declared dtype.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Result<Tensor> {
        if self.sample_bytes().is_none() {
            return Err(LowmemError::InvalidArgument(format!(
                "empty spec shape {} is too large to allocate",
                self.shape
            ))
            .into());
        }
        Ok(Tensor::randn_with(self.shape.dims(), self.init_std as f32, rng).to_dtype(self.torch_dtype))
    }
}

/// What gets written for one parameter of a split checkpoint.
#[derive(Clone, Debug)]
pub enum SplitEntry {
    Tensor(Tensor),
    Empty(EmptySpec),
}

impl From<Tensor> for SplitEntry {
    fn from(t: Tensor) -> Self {
        SplitEntry::Tensor(t)
    }
}

impl From<EmptySpec> for SplitEntry {
    fn from(spec: EmptySpec) -> Self {
        SplitEntry::Empty(spec)
    }
}

// ============================================================================
// Save
// ============================================================================

/// Write a split checkpoint of `entries` into `dir`.
///
/// File names are assigned in entry order. Every name is sanitized before
/// anything touches the disk, so an [`CheckpointError::InvalidName`] leaves
/// the directory as it was.
pub fn save_split(entries: &[(String, SplitEntry)], dir: &Path) -> Result<Manifest> {
    let mut manifest = Manifest::new();
    let mut files = Vec::with_capacity(entries.len());
    for (index, (name, entry)) in entries.iter().enumerate() {
        let mut file = format!("p{}.{}", index, sanitize_file_name(name)?);
        if let SplitEntry::Empty(_) = entry {
            file.push_str(EMPTY_JSON_SUFFIX);
        }
        manifest.insert(name.clone(), file.clone());
        files.push(file);
    }

    std::fs::create_dir_all(dir).map_err(|e| CheckpointError::io(dir, e))?;
    write_manifest(&manifest, dir)?;

    let mut total_bytes = 0usize;
    for ((name, entry), file) in entries.iter().zip(&files) {
        let path = dir.join(file);
        let bytes = match entry {
            SplitEntry::Tensor(tensor) => {
                total_bytes += tensor.nbytes();
                serialization::serialize(&[(name.clone(), tensor.clone())])?
            }
            SplitEntry::Empty(spec) => serde_json::to_vec(spec)
                .map_err(|e| CheckpointError::format(&path, e))?,
        };
        std::fs::write(&path, bytes).map_err(|e| CheckpointError::io(&path, e))?;
        tracing::debug!("Wrote {} -> {}", name, path.display());
    }

    tracing::info!(
        "Saved {} parameters ({:.1} MB of tensor data) to {}",
        entries.len(),
        total_bytes as f64 / 1e6,
        dir.display()
    );
    Ok(manifest)
}

/// Write every parameter of `module` as a split checkpoint.
///
/// Backed parameters are written as tensors. Placeholders that remember a
/// shape are written as empty specs with `init_std`; placeholders without
/// one are skipped.
pub fn save_pretrained_split(module: &dyn Module, dir: &Path, init_std: f64) -> Result<Manifest> {
    let mut entries = Vec::new();
    for (name, param) in module.named_parameters() {
        match (param.tensor(), param.shape()) {
            (Some(t), _) => entries.push((name, SplitEntry::Tensor(t.clone()))),
            (None, Some(shape)) => {
                let spec = EmptySpec::new(shape.clone(), param.dtype(), init_std);
                entries.push((name, SplitEntry::Empty(spec)));
            }
            (None, None) => {
                tracing::warn!("Skipping '{}': placeholder has no known shape", name);
            }
        }
    }
    save_split(&entries, dir)
}

fn write_manifest(manifest: &Manifest, dir: &Path) -> Result<()> {
    let path = dir.join(KEY_TO_FILENAME_JSON);
    let json = serde_json::to_string_pretty(manifest).map_err(|e| CheckpointError::format(&path, e))?;
    std::fs::write(&path, json).map_err(|e| CheckpointError::io(&path, e))
}

// ============================================================================
// Load
// ============================================================================

/// Read the manifest of a split directory.
pub fn load_manifest(dir: &Path) -> Result<Manifest> {
    let path = dir.join(KEY_TO_FILENAME_JSON);
    let data = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CheckpointError::NotFound(path.clone()),
        _ => CheckpointError::io(&path, e),
    })?;
    serde_json::from_str(&data).map_err(|e| CheckpointError::format(&path, e))
}

/// Read the single tensor stored in a split checkpoint file.
pub fn load_split_tensor(path: &Path) -> Result<Tensor> {
    let data = read_entry_file(path)?;
    let st = SafeTensors::deserialize(&data).map_err(|e| CheckpointError::format(path, e))?;
    let mut tensors = st.tensors();
    if tensors.len() != 1 {
        return Err(CheckpointError::format(
            path,
            format!("expected exactly one tensor, found {}", tensors.len()),
        ));
    }
    let (_, view) = tensors.remove(0);
    Ok(tensor_from_view(&view)?)
}

/// Read an `.empty_json` spec.
pub fn read_empty_spec(path: &Path) -> Result<EmptySpec> {
    let data = read_entry_file(path)?;
    let spec: EmptySpec = serde_json::from_slice(&data).map_err(|e| CheckpointError::format(path, e))?;
    if spec.sample_bytes().is_none() {
        return Err(CheckpointError::format(
            path,
            format!("shape {} of {} is too large", spec.shape, spec.torch_dtype),
        ));
    }
    Ok(spec)
}

/// Read every entry of a split directory, in manifest order.
pub fn load_split(dir: &Path) -> Result<Vec<(String, SplitEntry)>> {
    let manifest = load_manifest(dir)?;
    manifest
        .iter()
        .map(|(name, file)| {
            let path = dir.join(file);
            let entry = if is_empty_json(file) {
                SplitEntry::Empty(read_empty_spec(&path)?)
            } else {
                SplitEntry::Tensor(load_split_tensor(&path)?)
            };
            Ok((name.to_string(), entry))
        })
        .collect()
}

fn read_entry_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CheckpointError::MissingFile(path.to_path_buf()),
        _ => CheckpointError::io(path, e),
    })
}
