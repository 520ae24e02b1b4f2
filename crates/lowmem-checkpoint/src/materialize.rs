//! Resolve deferred sources into real parameter storage.
//!
//! Parameters are filled one at a time in tree order, so at most one source
//! tensor is alive on top of the parameters already loaded.

use lowmem_core::Tensor;
use lowmem_nn::{Module, Param};
use rand::Rng;

use crate::error::{CheckpointError, Result};
use crate::registry::{DeferredSource, LazyRegistry};
use crate::split::{load_split_tensor, read_empty_spec};

/// Outcome of one materialization pass.
#[derive(Debug, Default)]
pub struct MaterializeReport {
    /// Parameters that received data in this pass.
    pub resolved: usize,
    /// Parameters whose source could not be applied, with the reason. Their
    /// annotations are kept.
    pub failed: Vec<(String, CheckpointError)>,
}

impl MaterializeReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// The number of resolved parameters, or the first failure.
    pub fn into_result(self) -> Result<usize> {
        match self.failed.into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(self.resolved),
        }
    }
}

impl LazyRegistry {
    /// Fill every annotated parameter of `module` from its source.
    ///
    /// Annotations are discarded as their parameters are filled, so a second
    /// call resolves nothing. Failures do not stop the walk.
    pub fn materialize(&mut self, module: &mut dyn Module) -> MaterializeReport {
        self.materialize_with_rng(module, &mut rand::thread_rng())
    }

    /// [`LazyRegistry::materialize`] drawing distribution samples from `rng`.
    pub fn materialize_with_rng<R: Rng>(
        &mut self,
        module: &mut dyn Module,
        rng: &mut R,
    ) -> MaterializeReport {
        let mut report = MaterializeReport::default();
        if self.is_empty() {
            return report;
        }

        module.visit_params_mut("", &mut |name, param| {
            let Some(source) = self.take(name) else {
                return;
            };
            match apply(&source, param, rng) {
                Ok(()) => {
                    tracing::debug!("Materialized '{}' ({} bytes)", name, param.nbytes());
                    report.resolved += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to materialize '{}': {}", name, e);
                    self.restore(name.to_string(), source);
                    report.failed.push((name.to_string(), e));
                }
            }
        });

        tracing::info!(
            "Materialized {} parameters, {} failed, {} still pending",
            report.resolved,
            report.failed.len(),
            self.len()
        );
        report
    }
}

fn apply<R: Rng>(source: &DeferredSource, param: &mut Param, rng: &mut R) -> Result<()> {
    let tensor = resolve(source, rng)?;
    param.copy_from(&tensor)?;
    Ok(())
}

/// Produce the tensor a source describes.
pub fn resolve<R: Rng>(source: &DeferredSource, rng: &mut R) -> Result<Tensor> {
    match source {
        DeferredSource::File(path) => load_split_tensor(path),
        DeferredSource::EmptyFile(path) => read_empty_spec(path)?.sample(rng),
        DeferredSource::Distribution(spec) => spec.sample(rng),
    }
}
