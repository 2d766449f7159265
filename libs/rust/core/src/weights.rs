//! Named weight tensors and the pure arithmetic aggregation is built from.
//!
//! A `WeightStore` is an ordered map so every pass over its parameters visits names in the
//! same order. All public operations return new values; the only in-place helper is crate
//! private and used by the aggregation accumulator.

use std::collections::BTreeMap;
use ndarray::ArrayD;
use serde::{Serialize, Deserialize};
use crate::error::WeightError;

pub type Tensor = ArrayD<f32>;

/// Parameter name -> shape.
pub type Schema = BTreeMap<String, Vec<usize>>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightStore {
    params: BTreeMap<String, Tensor>,
}

/// `participant - baseline`, kept distinct from full weights so the two payload kinds cannot be mixed up.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightDelta(WeightStore);

impl WeightStore {
    pub fn new() -> Self { Self::default() }

    pub fn with_param(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.params.insert(name.into(), tensor);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> { self.params.get(name) }
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> { self.params.iter() }
    pub fn names(&self) -> impl Iterator<Item = &str> { self.params.keys().map(String::as_str) }
    pub fn len(&self) -> usize { self.params.len() }
    pub fn is_empty(&self) -> bool { self.params.is_empty() }

    pub fn schema(&self) -> Schema {
        self.params.iter().map(|(n, t)| (n.clone(), t.shape().to_vec())).collect()
    }

    /// Total scalar count across all tensors.
    pub fn num_parameters(&self) -> usize { self.params.values().map(|t| t.len()).sum() }

    pub fn byte_size(&self) -> usize { self.num_parameters() * std::mem::size_of::<f32>() }

    /// Fails on the first (name-ordered) disagreement between `self` and `other`.
    pub fn check_schema(&self, other: &WeightStore) -> Result<(), WeightError> {
        for (name, tensor) in &self.params {
            let Some(theirs) = other.params.get(name) else {
                return Err(WeightError::MissingParameter(name.clone()));
            };
            if tensor.shape() != theirs.shape() {
                return Err(WeightError::ShapeMismatch { name: name.clone(), expected: tensor.shape().to_vec(), found: theirs.shape().to_vec() });
            }
        }
        if let Some(extra) = other.params.keys().find(|n| !self.params.contains_key(*n)) {
            return Err(WeightError::UnexpectedParameter(extra.clone()));
        }
        Ok(())
    }

    pub fn zeros_like(&self) -> WeightStore {
        self.params.iter().map(|(n, t)| (n.clone(), Tensor::zeros(t.raw_dim()))).collect()
    }

    /// `self[name] + other[name] * scale` for every name.
    pub fn add_scaled(&self, other: &WeightStore, scale: f32) -> Result<WeightStore, WeightError> {
        let mut out = self.clone();
        out.add_scaled_in_place(other, scale)?;
        Ok(out)
    }

    pub(crate) fn add_scaled_in_place(&mut self, other: &WeightStore, scale: f32) -> Result<(), WeightError> {
        self.check_schema(other)?;
        for (name, tensor) in self.params.iter_mut() {
            // presence guaranteed by check_schema
            if let Some(rhs) = other.params.get(name) { tensor.scaled_add(scale, rhs); }
        }
        Ok(())
    }

    /// Elementwise `self - baseline`.
    pub fn subtract(&self, baseline: &WeightStore) -> Result<WeightDelta, WeightError> {
        baseline.check_schema(self)?;
        let diff = self.params.iter()
            .filter_map(|(n, t)| baseline.params.get(n).map(|b| (n.clone(), t - b)))
            .collect();
        Ok(WeightDelta(diff))
    }

    pub fn apply_delta(&self, delta: &WeightDelta) -> Result<WeightStore, WeightError> {
        self.add_scaled(&delta.0, 1.0)
    }
}

impl FromIterator<(String, Tensor)> for WeightStore {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self { params: iter.into_iter().collect() }
    }
}

impl WeightDelta {
    pub fn as_store(&self) -> &WeightStore { &self.0 }
    pub fn into_store(self) -> WeightStore { self.0 }
}

impl From<WeightStore> for WeightDelta {
    fn from(store: WeightStore) -> Self { Self(store) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    fn store(w: &[f32]) -> WeightStore { WeightStore::new().with_param("w", arr1(w).into_dyn()) }

    #[test]
    fn zeros_like_keeps_schema() {
        let s = WeightStore::new().with_param("a", arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn()).with_param("b", arr1(&[5.0]).into_dyn());
        let z = s.zeros_like();
        assert_eq!(z.schema(), s.schema());
        assert!(z.iter().all(|(_, t)| t.iter().all(|v| *v == 0.0)));
    }

    #[test]
    fn add_scaled_is_pure() {
        let a = store(&[1.0, 1.0]);
        let b = store(&[4.0, 2.0]);
        let c = a.add_scaled(&b, 0.5).unwrap();
        assert_eq!(c, store(&[3.0, 2.0]));
        assert_eq!(a, store(&[1.0, 1.0]));
    }

    #[test]
    fn subtract_then_apply_restores() {
        let base = store(&[1.0, 1.0]);
        let part = store(&[2.5, -1.0]);
        let delta = part.subtract(&base).unwrap();
        assert_eq!(delta.as_store(), &store(&[1.5, -2.0]));
        assert_eq!(base.apply_delta(&delta).unwrap(), part);
    }

    #[test]
    fn schema_mismatches_are_reported() {
        let base = store(&[1.0, 1.0]);
        let wrong_shape = store(&[1.0, 1.0, 1.0]);
        assert!(matches!(base.add_scaled(&wrong_shape, 1.0), Err(WeightError::ShapeMismatch { .. })));
        let missing = WeightStore::new().with_param("v", arr1(&[1.0, 1.0]).into_dyn());
        assert_eq!(base.check_schema(&missing), Err(WeightError::MissingParameter("w".into())));
        let extra = store(&[0.0, 0.0]).with_param("z", arr1(&[0.0]).into_dyn());
        assert_eq!(base.check_schema(&extra), Err(WeightError::UnexpectedParameter("z".into())));
    }

    #[test]
    fn byte_size_counts_f32() {
        let s = WeightStore::new().with_param("a", arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn());
        assert_eq!(s.num_parameters(), 4);
        assert_eq!(s.byte_size(), 16);
    }
}
