//! Time-major batches of contiguous sequences.

use super::IS_FIRST;
use crate::{DreamError, Result};
use ndarray::{ArrayD, Axis, IxDyn, Slice};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key to `[T, B, ...]` array.
///
/// After [`SequenceBatch::prepare`] (which sampling always applies)
/// `is_first[0, b] == 1` for every column `b`, so the world model restarts
/// its recurrent state at the beginning of each window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SequenceBatch {
    fields: BTreeMap<String, ArrayD<f32>>,
    seq_len: usize,
    batch_size: usize,
}

impl SequenceBatch {
    /// Build from `[T, B, ...]` arrays that all share `T` and `B`.
    pub fn new(fields: BTreeMap<String, ArrayD<f32>>) -> Result<Self> {
        let mut dims: Option<(usize, usize)> = None;
        for (key, value) in &fields {
            let shape = value.shape();
            if shape.len() < 2 {
                return Err(DreamError::ShapeMismatch {
                    key: key.clone(),
                    expected: vec![0, 0],
                    actual: shape.to_vec(),
                });
            }
            match dims {
                None => dims = Some((shape[0], shape[1])),
                Some((t, b)) if (t, b) != (shape[0], shape[1]) => {
                    return Err(DreamError::ShapeMismatch {
                        key: key.clone(),
                        expected: vec![t, b],
                        actual: shape[..2].to_vec(),
                    })
                }
                _ => {}
            }
        }
        let (seq_len, batch_size) = dims.ok_or_else(|| DreamError::MissingKey(IS_FIRST.into()))?;
        Ok(Self {
            fields,
            seq_len,
            batch_size,
        })
    }

    /// Force `is_first` on the first timestep of every column.
    pub fn prepare(&mut self) -> Result<()> {
        let is_first = self
            .fields
            .get_mut(IS_FIRST)
            .ok_or_else(|| DreamError::MissingKey(IS_FIRST.into()))?;
        is_first.index_axis_mut(Axis(0), 0).fill(1.0);
        Ok(())
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn get(&self, key: &str) -> Result<&ArrayD<f32>> {
        self.fields
            .get(key)
            .ok_or_else(|| DreamError::MissingKey(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    /// Flat data and shape of `key`, ready for tensor construction.
    pub fn flat(&self, key: &str) -> Result<(Vec<f32>, Vec<usize>)> {
        let value = self.get(key)?;
        Ok((value.iter().copied().collect(), value.shape().to_vec()))
    }

    /// Split along the batch axis into `parts` batches of equal size.
    pub fn split_batch(&self, parts: usize) -> Result<Vec<SequenceBatch>> {
        if parts == 0 || self.batch_size % parts != 0 {
            return Err(DreamError::Configuration(format!(
                "cannot split a batch of {} into {parts} parts",
                self.batch_size
            )));
        }
        let chunk = self.batch_size / parts;
        (0..parts)
            .map(|p| {
                let fields = self
                    .fields
                    .iter()
                    .map(|(k, v)| {
                        let part = v
                            .slice_axis(Axis(1), Slice::from(p * chunk..(p + 1) * chunk))
                            .to_owned();
                        (k.clone(), part)
                    })
                    .collect();
                SequenceBatch::new(fields)
            })
            .collect()
    }

    /// Assemble from flat `[T, B, ...]` buffers.
    pub(crate) fn from_flat(
        data: BTreeMap<String, (Vec<usize>, Vec<f32>)>,
        seq_len: usize,
        batch_size: usize,
    ) -> Result<Self> {
        let mut fields = BTreeMap::new();
        for (key, (step_shape, values)) in data {
            let mut shape = vec![seq_len, batch_size];
            shape.extend_from_slice(&step_shape);
            let array = ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|_| {
                DreamError::ShapeMismatch {
                    key: key.clone(),
                    expected: shape.clone(),
                    actual: vec![],
                }
            })?;
            fields.insert(key, array);
        }
        Self::new(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(t: usize, b: usize) -> SequenceBatch {
        let mut fields = BTreeMap::new();
        fields.insert(IS_FIRST.to_string(), ArrayD::zeros(IxDyn(&[t, b, 1])));
        let obs: Vec<f32> = (0..t * b * 2).map(|v| v as f32).collect();
        fields.insert(
            "state".to_string(),
            ArrayD::from_shape_vec(IxDyn(&[t, b, 2]), obs).unwrap(),
        );
        SequenceBatch::new(fields).unwrap()
    }

    #[test]
    fn test_prepare_sets_first_row() {
        let mut b = batch(3, 4);
        b.prepare().unwrap();
        let is_first = b.get(IS_FIRST).unwrap();
        assert!(is_first.index_axis(Axis(0), 0).iter().all(|&v| v == 1.0));
        assert!(is_first.index_axis(Axis(0), 1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_split_batch() {
        let parts = batch(2, 4).split_batch(2).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].batch_size(), 2);
        assert_eq!(parts[1].get("state").unwrap()[[0, 0, 0]], 4.0);
        assert!(batch(2, 3).split_batch(2).is_err());
    }

    #[test]
    fn test_rejects_inconsistent_dims() {
        let mut fields = BTreeMap::new();
        fields.insert("a".to_string(), ArrayD::zeros(IxDyn(&[2, 3, 1])));
        fields.insert("b".to_string(), ArrayD::zeros(IxDyn(&[2, 4, 1])));
        assert!(SequenceBatch::new(fields).is_err());
    }
}
