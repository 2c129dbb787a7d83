//! Named parameter storage with per-parameter trainability flags.
//!
//! Candle variables have no notion of "requires grad"; the trainer decides what
//! to update. [`ParamStore`] keeps that decision next to the [`VarMap`] so that
//! freezing helpers and optimizers agree on which parameters move.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::MutexGuard;

use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use forneus_core::{Error, Result};

/// Parameters of a model, keyed by their dotted checkpoint names.
#[derive(Clone)]
pub struct ParamStore {
    varmap: VarMap,
    trainable: BTreeMap<String, bool>,
}

impl std::fmt::Debug for ParamStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamStore")
            .field("params", &self.trainable.len())
            .field(
                "trainable",
                &self.trainable.values().filter(|t| **t).count(),
            )
            .finish()
    }
}

impl ParamStore {
    /// Wraps a populated var map. Every parameter starts out trainable.
    ///
    /// # Errors
    ///
    /// Returns an error if the var map lock is poisoned.
    pub fn new(varmap: VarMap) -> Result<Self> {
        let trainable = lock(&varmap)?
            .keys()
            .map(|name| (name.clone(), true))
            .collect();
        Ok(Self { varmap, trainable })
    }

    /// Returns the underlying var map.
    #[must_use]
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Returns all parameter names in lexicographic order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.trainable.keys().map(String::as_str)
    }

    /// Returns the number of named parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.trainable.len()
    }

    /// Returns `true` if the store holds no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trainable.is_empty()
    }

    /// Returns a handle to the named parameter.
    ///
    /// # Errors
    ///
    /// Returns an error if the var map lock is poisoned.
    pub fn get(&self, name: &str) -> Result<Option<Var>> {
        Ok(lock(&self.varmap)?.get(name).cloned())
    }

    /// Returns whether the named parameter is trainable.
    #[must_use]
    pub fn is_trainable(&self, name: &str) -> Option<bool> {
        self.trainable.get(name).copied()
    }

    /// Sets trainability for one parameter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModuleNotFound`] if no parameter has that name.
    pub fn set_trainable(&mut self, name: &str, trainable: bool) -> Result<()> {
        match self.trainable.get_mut(name) {
            Some(flag) => {
                *flag = trainable;
                Ok(())
            }
            None => Err(Error::ModuleNotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Sets trainability for every parameter.
    pub fn set_all_trainable(&mut self, trainable: bool) {
        for flag in self.trainable.values_mut() {
            *flag = trainable;
        }
    }

    /// Sets trainability for every parameter under a module path.
    ///
    /// Returns the number of parameters touched.
    pub fn set_module_trainable(&mut self, module: &str, trainable: bool) -> usize {
        let mut touched = 0;
        for (name, flag) in &mut self.trainable {
            if in_module(name, module) {
                *flag = trainable;
                touched += 1;
            }
        }
        touched
    }

    /// Returns handles to the trainable parameters, for an optimizer.
    ///
    /// # Errors
    ///
    /// Returns an error if the var map lock is poisoned.
    pub fn trainable_vars(&self) -> Result<Vec<Var>> {
        let data = lock(&self.varmap)?;
        Ok(self
            .trainable
            .iter()
            .filter(|(_, t)| **t)
            .filter_map(|(name, _)| data.get(name).cloned())
            .collect())
    }

    /// Total number of scalar parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the var map lock is poisoned.
    pub fn num_params(&self) -> Result<usize> {
        Ok(lock(&self.varmap)?.values().map(|v| v.elem_count()).sum())
    }

    /// Number of scalar parameters currently marked trainable.
    ///
    /// # Errors
    ///
    /// Returns an error if the var map lock is poisoned.
    pub fn num_trainable(&self) -> Result<usize> {
        let data = lock(&self.varmap)?;
        Ok(self
            .trainable
            .iter()
            .filter(|(_, t)| **t)
            .filter_map(|(name, _)| data.get(name))
            .map(|v| v.elem_count())
            .sum())
    }

    /// Every module path that owns at least one parameter, in lexicographic order.
    ///
    /// `model.layers.0.mlp.up_proj.weight` contributes `model`, `model.layers`,
    /// `model.layers.0`, `model.layers.0.mlp` and `model.layers.0.mlp.up_proj`.
    #[must_use]
    pub fn module_paths(&self) -> Vec<String> {
        let mut paths = BTreeSet::new();
        for name in self.trainable.keys() {
            let mut end = 0;
            while let Some(dot) = name[end..].find('.') {
                end += dot;
                paths.insert(name[..end].to_string());
                end += 1;
            }
        }
        paths.into_iter().collect()
    }

    /// Returns the first module path ending with `suffix`.
    #[must_use]
    pub fn find_module(&self, suffix: &str) -> Option<String> {
        self.module_paths().into_iter().find(|p| p.ends_with(suffix))
    }

    /// Indices of the numbered children of a module (`<module>.<i>.…`), sorted.
    #[must_use]
    pub fn child_indices(&self, module: &str) -> Vec<usize> {
        let prefix = format!("{module}.");
        let indices: BTreeSet<usize> = self
            .trainable
            .keys()
            .filter_map(|name| name.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('.').next())
            .filter_map(|idx| idx.parse().ok())
            .collect();
        indices.into_iter().collect()
    }

    /// Assigns values to the selected parameters from a name → tensor map.
    ///
    /// Tensors are converted to each parameter's dtype and device. Tensors with
    /// no matching parameter are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelLoad`] if a selected parameter has no tensor in
    /// `tensors` or the shapes differ.
    pub fn assign(
        &self,
        tensors: &HashMap<String, Tensor>,
        select: impl Fn(&str) -> bool,
    ) -> Result<usize> {
        let data = lock(&self.varmap)?;
        let mut assigned = 0;
        for (name, var) in data.iter().filter(|(name, _)| select(name.as_str())) {
            let tensor = tensors
                .get(name)
                .ok_or_else(|| Error::model_load(format!("Missing weight `{name}`")))?;
            if tensor.shape() != var.shape() {
                return Err(Error::model_load(format!(
                    "Weight `{name}` has shape {:?}, expected {:?}",
                    tensor.dims(),
                    var.dims()
                )));
            }
            var.set(&tensor.to_dtype(var.dtype())?.to_device(var.device())?)?;
            assigned += 1;
        }
        Ok(assigned)
    }

    /// Copies out the selected parameters as plain tensors.
    ///
    /// # Errors
    ///
    /// Returns an error if the var map lock is poisoned.
    pub fn tensors(&self, select: impl Fn(&str) -> bool) -> Result<HashMap<String, Tensor>> {
        Ok(lock(&self.varmap)?
            .iter()
            .filter(|(name, _)| select(name.as_str()))
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect())
    }
}

fn in_module(name: &str, module: &str) -> bool {
    name.strip_prefix(module)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
}

fn lock(varmap: &VarMap) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
    varmap
        .data()
        .lock()
        .map_err(|_| Error::internal("parameter map lock poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    fn store() -> ParamStore {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        for name in [
            "model.embed_tokens.weight",
            "model.layers.0.mlp.up_proj.weight",
            "model.layers.1.mlp.up_proj.weight",
            "model.layers.10.mlp.up_proj.weight",
            "lm_head.weight",
        ] {
            vb.get_with_hints((2, 3), name, Init::Const(1.0)).unwrap();
        }
        ParamStore::new(varmap).unwrap()
    }

    #[test]
    fn test_counts() {
        let mut params = store();
        assert_eq!(params.len(), 5);
        assert_eq!(params.num_params().unwrap(), 30);
        assert_eq!(params.num_trainable().unwrap(), 30);

        params.set_all_trainable(false);
        params.set_trainable("lm_head.weight", true).unwrap();
        assert_eq!(params.num_trainable().unwrap(), 6);
        assert_eq!(params.trainable_vars().unwrap().len(), 1);
        assert!(params.set_trainable("nope.weight", true).is_err());
    }

    #[test]
    fn test_module_lookup() {
        let params = store();
        assert_eq!(params.find_module("layers").as_deref(), Some("model.layers"));
        assert_eq!(
            params.find_module("embed_tokens").as_deref(),
            Some("model.embed_tokens")
        );
        assert_eq!(params.find_module("blocks"), None);
        assert_eq!(params.child_indices("model.layers"), vec![0, 1, 10]);
    }

    #[test]
    fn test_module_prefix_does_not_match_siblings() {
        let mut params = store();
        params.set_all_trainable(false);
        // `model.layers.1` must not catch `model.layers.10`
        assert_eq!(params.set_module_trainable("model.layers.1", true), 1);
        assert_eq!(
            params.is_trainable("model.layers.10.mlp.up_proj.weight"),
            Some(false)
        );
    }

    #[test]
    fn test_assign_checks_shapes() {
        let params = store();
        let mut tensors = HashMap::new();
        tensors.insert(
            "lm_head.weight".to_string(),
            Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        assert_eq!(params.assign(&tensors, |n| n == "lm_head.weight").unwrap(), 1);
        let head = params.get("lm_head.weight").unwrap().unwrap();
        let sum = head.as_tensor().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(sum.abs() < f32::EPSILON);

        tensors.insert(
            "lm_head.weight".to_string(),
            Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(params.assign(&tensors, |n| n == "lm_head.weight").is_err());
        assert!(params.assign(&tensors, |_| true).is_err());
    }
}
