//! One timestep for a group of lanes.

use super::{ACTIONS, DONES, IS_FIRST, REWARDS};
use crate::{DreamError, Result};
use ndarray::{ArrayD, Axis, IxDyn};
use std::collections::BTreeMap;

/// Key to `[N, ...]` array, where `N` is the number of lanes in the step.
#[derive(Clone, Debug, Default)]
pub struct StepData {
    fields: BTreeMap<String, ArrayD<f32>>,
}

impl StepData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: ArrayD<f32>) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ArrayD<f32>) {
        self.fields.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&ArrayD<f32>> {
        self.fields.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut ArrayD<f32>> {
        self.fields.get_mut(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArrayD<f32>)> {
        self.fields.iter()
    }

    /// Per-lane column `[N, 1]` filled with `value`.
    pub fn column(num_lanes: usize, value: f32) -> ArrayD<f32> {
        ArrayD::from_elem(IxDyn(&[num_lanes, 1]), value)
    }

    /// Column `[N, 1]` built from per-lane values.
    pub fn column_from(values: &[f32]) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(&[values.len(), 1]), values.to_vec())
            .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[values.len(), 1])))
    }

    /// Number of lanes; every field must agree on it.
    pub fn num_lanes(&self) -> Result<usize> {
        let mut lanes = None;
        for (key, value) in &self.fields {
            let n = value.shape().first().copied().unwrap_or(0);
            match lanes {
                None => lanes = Some(n),
                Some(m) if m != n => {
                    return Err(DreamError::ShapeMismatch {
                        key: key.clone(),
                        expected: vec![m],
                        actual: vec![n],
                    })
                }
                _ => {}
            }
        }
        lanes.ok_or_else(|| DreamError::MissingKey(ACTIONS.into()))
    }

    /// Check the bookkeeping keys are present.
    pub fn validate(&self) -> Result<usize> {
        for key in [ACTIONS, REWARDS, DONES, IS_FIRST] {
            if !self.fields.contains_key(key) {
                return Err(DreamError::MissingKey(key.to_string()));
            }
        }
        self.num_lanes()
    }

    /// Row `i` of `key`, flattened.
    pub fn row(&self, key: &str, i: usize) -> Result<Vec<f32>> {
        let value = self
            .fields
            .get(key)
            .ok_or_else(|| DreamError::MissingKey(key.to_string()))?;
        if i >= value.shape()[0] {
            return Err(DreamError::ShapeMismatch {
                key: key.to_string(),
                expected: vec![i + 1],
                actual: vec![value.shape()[0]],
            });
        }
        Ok(value.index_axis(Axis(0), i).iter().copied().collect())
    }

    /// Overwrite row `i` of `key` with a constant.
    pub fn fill_row(&mut self, key: &str, i: usize, value: f32) -> Result<()> {
        let field = self
            .fields
            .get_mut(key)
            .ok_or_else(|| DreamError::MissingKey(key.to_string()))?;
        field.index_axis_mut(Axis(0), i).fill(value);
        Ok(())
    }

    /// Keep only the listed lanes, in the given order.
    pub fn select_lanes(&self, lanes: &[usize]) -> StepData {
        let fields = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.select(Axis(0), lanes)))
            .collect();
        StepData { fields }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(n: usize) -> StepData {
        StepData::new()
            .with(ACTIONS, ArrayD::zeros(IxDyn(&[n, 2])))
            .with(REWARDS, StepData::column(n, 0.5))
            .with(DONES, StepData::column(n, 0.0))
            .with(IS_FIRST, StepData::column(n, 1.0))
    }

    #[test]
    fn test_validate_requires_bookkeeping_keys() {
        assert_eq!(step(3).validate().unwrap(), 3);
        let mut partial = step(3);
        partial.fields.remove(DONES);
        assert!(matches!(partial.validate(), Err(DreamError::MissingKey(k)) if k == DONES));
    }

    #[test]
    fn test_lane_count_must_agree() {
        let bad = step(3).with("state", ArrayD::zeros(IxDyn(&[2, 4])));
        assert!(bad.num_lanes().is_err());
    }

    #[test]
    fn test_select_lanes() {
        let data = step(2).with("state", StepData::column_from(&[1.0, 2.0]));
        let picked = data.select_lanes(&[1]);
        assert_eq!(picked.row("state", 0).unwrap(), vec![2.0]);
        assert_eq!(picked.num_lanes().unwrap(), 1);
    }
}
