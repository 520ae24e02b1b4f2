use std::ops::{Index, IndexMut};

use crate::module::Module;
use crate::param::Param;

/// A container that holds sub-modules in an indexed list.
///
/// Children are named by position, so the third layer's weight is
/// `2.weight` relative to the list.
///
/// # Example
/// ```
/// use lowmem_nn::{Linear, Module, ModuleList};
///
/// let layers = ModuleList::new(vec![
///     Box::new(Linear::new(4, 4, true)),
///     Box::new(Linear::new(4, 2, false)),
/// ]);
/// let names: Vec<String> = layers.named_parameters().into_iter().map(|(n, _)| n).collect();
/// assert_eq!(names, vec!["0.weight", "0.bias", "1.weight"]);
/// ```
#[derive(Default)]
pub struct ModuleList {
    modules: Vec<Box<dyn Module>>,
}

impl ModuleList {
    pub fn new(modules: Vec<Box<dyn Module>>) -> Self {
        Self { modules }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn push(&mut self, module: Box<dyn Module>) {
        self.modules.push(module);
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Module> {
        self.modules.iter().map(|m| m.as_ref())
    }
}

impl Index<usize> for ModuleList {
    type Output = dyn Module;

    fn index(&self, index: usize) -> &Self::Output {
        self.modules[index].as_ref()
    }
}

impl IndexMut<usize> for ModuleList {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        self.modules[index].as_mut()
    }
}

impl Module for ModuleList {
    fn params(&self) -> Vec<(&str, &Param)> {
        Vec::new()
    }

    fn params_mut(&mut self) -> Vec<(&str, &mut Param)> {
        Vec::new()
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        self.modules
            .iter()
            .enumerate()
            .map(|(i, m)| (i.to_string(), m.as_ref()))
            .collect()
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module)> {
        self.modules
            .iter_mut()
            .enumerate()
            .map(|(i, m)| (i.to_string(), m.as_mut() as &mut dyn Module))
            .collect()
    }
}
