//! The module tree: named parameters and children, walked depth first.
//!
//! Qualified names join the path from the root with `.` (`blocks.0.weight`),
//! which is the key used by state dicts and split checkpoint manifests.

use lowmem_core::Tensor;

use crate::param::Param;

/// Join a module prefix and a local name with `.`.
pub fn qualify(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// A node in a model's module tree.
///
/// A module owns its direct parameters and its named children. Both lists
/// must come back in the same order on every call: qualified names, and the
/// file indices of split checkpoints, are derived from this order.
///
/// Traversal is depth first: a module's own parameters, then each child in
/// turn. A qualified name is the dot-joined path of child names followed by
/// the parameter name (`layers.0.attn.weight`).
pub trait Module {
    /// Direct parameters, in declaration order.
    fn params(&self) -> Vec<(&str, &Param)>;

    /// Direct parameters, mutable, in the same order as [`Module::params`].
    fn params_mut(&mut self) -> Vec<(&str, &mut Param)>;

    /// Named child modules, in declaration order.
    fn children(&self) -> Vec<(String, &dyn Module)> {
        Vec::new()
    }

    /// Named child modules, mutable, in the same order as [`Module::children`].
    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module)> {
        Vec::new()
    }

    /// Call `f` with the qualified name of every parameter in the tree.
    fn visit_params(&self, prefix: &str, f: &mut dyn FnMut(&str, &Param)) {
        for (name, param) in self.params() {
            f(&qualify(prefix, name), param);
        }
        for (child_name, child) in self.children() {
            child.visit_params(&qualify(prefix, &child_name), f);
        }
    }

    /// Mutable counterpart of [`Module::visit_params`].
    fn visit_params_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Param)) {
        for (name, param) in self.params_mut() {
            f(&qualify(prefix, name), param);
        }
        for (child_name, child) in self.children_mut() {
            child.visit_params_mut(&qualify(prefix, &child_name), f);
        }
    }

    /// Every parameter in the tree with its qualified name.
    fn named_parameters(&self) -> Vec<(String, &Param)> {
        let mut out: Vec<(String, &Param)> = self
            .params()
            .into_iter()
            .map(|(name, p)| (name.to_string(), p))
            .collect();
        for (child_name, child) in self.children() {
            for (name, p) in child.named_parameters() {
                out.push((qualify(&child_name, &name), p));
            }
        }
        out
    }

    /// Backed parameters as an ordered state dict. Placeholders are skipped.
    fn state_dict(&self) -> Vec<(String, Tensor)> {
        self.named_parameters()
            .into_iter()
            .filter_map(|(name, p)| p.tensor().map(|t| (name, t.clone())))
            .collect()
    }

    /// Total bytes of backing storage held by the tree.
    fn nbytes(&self) -> usize {
        self.named_parameters().iter().map(|(_, p)| p.nbytes()).sum()
    }

    /// Number of parameters that are still placeholders.
    fn num_lazy(&self) -> usize {
        self.named_parameters().iter().filter(|(_, p)| p.is_lazy()).count()
    }
}
