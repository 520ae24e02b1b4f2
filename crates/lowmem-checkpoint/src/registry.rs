//! Deferred parameter sources, kept beside the module tree.
//!
//! The registry never touches parameter storage when annotating a split
//! directory: it only records where each parameter's data will come from.
//! The eager dictionary path is the exception and copies immediately.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use lowmem_core::Tensor;
use lowmem_nn::Module;

use crate::error::{CheckpointError, Result};
use crate::split::{is_empty_json, load_manifest, EmptySpec};

/// Where a placeholder's data will come from.
#[derive(Clone, Debug, PartialEq)]
pub enum DeferredSource {
    /// A single-tensor file in a split directory.
    File(PathBuf),
    /// An `.empty_json` spec on disk, sampled at materialization.
    EmptyFile(PathBuf),
    /// An in-memory spec, sampled at materialization.
    Distribution(EmptySpec),
}

/// Replace every parameter in the tree with a placeholder that keeps its
/// dtype and shape. Returns how many parameters gave up storage.
pub fn nullify(module: &mut dyn Module) -> usize {
    let mut count = 0;
    module.visit_params_mut("", &mut |_, param| {
        if !param.is_lazy() {
            param.nullify();
            count += 1;
        }
    });
    tracing::debug!("Nullified {} parameters", count);
    count
}

/// Side table of deferred sources keyed by qualified parameter name.
#[derive(Debug, Default)]
pub struct LazyRegistry {
    pending: HashMap<String, DeferredSource>,
}

impl LazyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a file source for every parameter of `module` named in the
    /// manifest of `dir`. Parameters the manifest does not mention are left
    /// alone. Returns the number of annotations made.
    pub fn annotate_from_directory(&mut self, module: &dyn Module, dir: &Path) -> Result<usize> {
        let manifest = load_manifest(dir)?;
        let root = dir.canonicalize().map_err(|e| CheckpointError::io(dir, e))?;

        let mut annotated = 0;
        let mut absent = 0;
        let pending = &mut self.pending;
        module.visit_params("", &mut |name, _| match manifest.get(name) {
            Some(file) => {
                let path = root.join(file);
                let source = if is_empty_json(file) {
                    DeferredSource::EmptyFile(path)
                } else {
                    DeferredSource::File(path)
                };
                pending.insert(name.to_string(), source);
                annotated += 1;
            }
            None => {
                tracing::debug!("'{}' not in manifest, leaving as is", name);
                absent += 1;
            }
        });

        tracing::info!(
            "Annotated {} parameters from {} ({} not in manifest)",
            annotated,
            root.display(),
            absent
        );
        Ok(annotated)
    }

    /// Copy every tensor of `state_dict` whose key names a parameter of
    /// `module` into that parameter, removing the key from the map.
    ///
    /// Placeholders take the shape of the incoming tensor. Keys that match no
    /// parameter, or that fail to apply, stay in the map. Any pending annotation for a loaded
    /// parameter is dropped. Returns the number of parameters loaded.
    pub fn annotate_from_dict(
        &mut self,
        module: &mut dyn Module,
        state_dict: &mut HashMap<String, Tensor>,
    ) -> Result<usize> {
        let mut loaded = 0;
        let mut first_err = None;
        let pending = &mut self.pending;
        module.visit_params_mut("", &mut |name, param| {
            if first_err.is_some() {
                return;
            }
            let Some(tensor) = state_dict.get(name) else {
                return;
            };
            match param.copy_from(tensor) {
                Ok(()) => {
                    state_dict.remove(name);
                    pending.remove(name);
                    loaded += 1;
                }
                Err(e) => first_err = Some(e),
            }
        });

        if let Some(e) = first_err {
            return Err(e.into());
        }
        tracing::info!(
            "Loaded {} parameters from state dict ({} keys unused)",
            loaded,
            state_dict.len()
        );
        Ok(loaded)
    }

    /// Record `source` for `name`, replacing any earlier annotation.
    pub fn defer(&mut self, name: impl Into<String>, source: DeferredSource) {
        self.pending.insert(name.into(), source);
    }

    pub fn pending(&self, name: &str) -> Option<&DeferredSource> {
        self.pending.get(name)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Names with a pending source, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pending.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn take(&mut self, name: &str) -> Option<DeferredSource> {
        self.pending.remove(name)
    }

    pub(crate) fn restore(&mut self, name: String, source: DeferredSource) {
        self.pending.insert(name, source);
    }
}
