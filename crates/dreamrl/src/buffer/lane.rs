//! Fixed-capacity ring holding the history of one environment lane.

use crate::{DreamError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Flat storage for one key: `capacity` slots of `shape` elements each.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Column {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Column {
    fn new(shape: Vec<usize>, capacity: usize) -> Self {
        let width = shape.iter().product::<usize>();
        Self {
            shape,
            data: vec![0.0; width * capacity],
        }
    }

    fn width(&self) -> usize {
        self.shape.iter().product()
    }

    fn slot(&self, index: usize) -> &[f32] {
        let w = self.width();
        &self.data[index * w..(index + 1) * w]
    }

    fn slot_mut(&mut self, index: usize) -> &mut [f32] {
        let w = self.width();
        &mut self.data[index * w..(index + 1) * w]
    }
}

/// Ring buffer for a single lane. Writes advance `pos` and wrap at
/// `capacity`; the oldest step is overwritten once the ring is full.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LaneBuffer {
    capacity: usize,
    pos: usize,
    full: bool,
    columns: BTreeMap<String, Column>,
}

impl LaneBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pos: 0,
            full: false,
            columns: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of valid steps held.
    pub fn len(&self) -> usize {
        if self.full {
            self.capacity
        } else {
            self.pos
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Physical index of the next write.
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.columns.keys()
    }

    /// Shape of one step for `key`.
    pub fn shape(&self, key: &str) -> Option<&[usize]> {
        self.columns.get(key).map(|c| c.shape.as_slice())
    }

    /// Append one step. The first insert fixes the key set and shapes.
    pub fn push<'a, I>(&mut self, row: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a [usize], &'a [f32])>,
    {
        let row: Vec<_> = row.into_iter().collect();
        if self.columns.is_empty() {
            for &(key, shape, _) in &row {
                self.columns
                    .insert(key.to_string(), Column::new(shape.to_vec(), self.capacity));
            }
        }
        if row.len() != self.columns.len() {
            let missing = self
                .columns
                .keys()
                .find(|k| !row.iter().any(|(r, _, _)| *r == k.as_str()))
                .cloned()
                .unwrap_or_default();
            return Err(DreamError::MissingKey(missing));
        }
        // Validate everything before writing so a bad row leaves no trace
        for &(key, shape, values) in &row {
            let column = self
                .columns
                .get(key)
                .ok_or_else(|| DreamError::MissingKey(key.to_string()))?;
            if column.shape != shape || values.len() != column.width() {
                return Err(DreamError::ShapeMismatch {
                    key: key.to_string(),
                    expected: column.shape.clone(),
                    actual: shape.to_vec(),
                });
            }
        }
        for (key, _, values) in row {
            if let Some(column) = self.columns.get_mut(key) {
                column.slot_mut(self.pos).copy_from_slice(values);
            }
        }
        self.pos += 1;
        if self.pos == self.capacity {
            self.pos = 0;
            self.full = true;
        }
        Ok(())
    }

    /// Number of distinct window starts for sequences of `seq_len`.
    pub fn valid_starts(&self, seq_len: usize) -> usize {
        let len = self.len();
        if seq_len == 0 || len < seq_len {
            0
        } else {
            len - seq_len + 1
        }
    }

    /// Physical slot of the `offset`-th valid window start.
    ///
    /// Before the ring wraps, windows start in `0..=pos-seq_len`. Afterwards
    /// the logical timeline begins at `pos` (the oldest step) and a window
    /// never straddles the newest-to-oldest seam.
    pub fn window_start(&self, offset: usize) -> usize {
        if self.full {
            (self.pos + offset) % self.capacity
        } else {
            offset
        }
    }

    /// Physical slot `t` steps after `start`.
    pub fn slot_index(&self, start: usize, t: usize) -> usize {
        (start + t) % self.capacity
    }

    pub fn read(&self, key: &str, slot: usize) -> Result<&[f32]> {
        self.columns
            .get(key)
            .map(|c| c.slot(slot))
            .ok_or_else(|| DreamError::MissingKey(key.to_string()))
    }

    /// Physical slot of the most recent write.
    pub fn last_slot(&self) -> Option<usize> {
        if self.is_empty() {
            None
        } else {
            Some((self.pos + self.capacity - 1) % self.capacity)
        }
    }

    /// Overwrite a stored value in place.
    pub(crate) fn overwrite(&mut self, key: &str, slot: usize, value: f32) -> Result<()> {
        let column = self
            .columns
            .get_mut(key)
            .ok_or_else(|| DreamError::MissingKey(key.to_string()))?;
        column.slot_mut(slot).fill(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_value(lane: &mut LaneBuffer, v: f32) {
        lane.push([("x", &[1usize][..], &[v][..])]).unwrap();
    }

    #[test]
    fn test_wraps_at_capacity() {
        let mut lane = LaneBuffer::new(4);
        for i in 0..6 {
            push_value(&mut lane, i as f32);
        }
        assert!(lane.is_full());
        assert_eq!(lane.len(), 4);
        assert_eq!(lane.pos(), 2);
        // Oldest surviving step is 2, stored at the write cursor
        assert_eq!(lane.read("x", lane.window_start(0)).unwrap(), &[2.0]);
        assert_eq!(lane.read("x", lane.last_slot().unwrap()).unwrap(), &[5.0]);
    }

    #[test]
    fn test_valid_starts() {
        let mut lane = LaneBuffer::new(10);
        assert_eq!(lane.valid_starts(3), 0);
        for i in 0..5 {
            push_value(&mut lane, i as f32);
        }
        assert_eq!(lane.valid_starts(3), 3);
        assert_eq!(lane.valid_starts(5), 1);
        assert_eq!(lane.valid_starts(6), 0);
    }

    #[test]
    fn test_rejects_shape_change() {
        let mut lane = LaneBuffer::new(2);
        push_value(&mut lane, 1.0);
        let err = lane.push([("x", &[2usize][..], &[1.0, 2.0][..])]).unwrap_err();
        assert!(matches!(err, DreamError::ShapeMismatch { .. }));
        assert_eq!(lane.len(), 1);
    }

    #[test]
    fn test_rejects_missing_key() {
        let mut lane = LaneBuffer::new(2);
        lane.push([("x", &[1usize][..], &[1.0][..]), ("y", &[1usize][..], &[0.0][..])])
            .unwrap();
        assert!(matches!(
            lane.push([("x", &[1usize][..], &[1.0][..])]),
            Err(DreamError::MissingKey(k)) if k == "y"
        ));
    }
}
