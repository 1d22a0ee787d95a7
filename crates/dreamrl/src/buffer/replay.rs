//! Replay buffer with one independent ring per environment lane.

use super::{LaneBuffer, SequenceBatch, StepData, DONES, IS_FIRST};
use crate::{DreamError, Result};
use ndarray::Axis;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvIndependentReplayBuffer {
    lanes: Vec<LaneBuffer>,
}

impl EnvIndependentReplayBuffer {
    /// `capacity` steps per lane.
    pub fn new(capacity: usize, num_lanes: usize) -> Result<Self> {
        if capacity == 0 || num_lanes == 0 {
            return Err(DreamError::Configuration(format!(
                "replay buffer needs positive capacity and lanes, got {capacity} x {num_lanes}"
            )));
        }
        Ok(Self {
            lanes: (0..num_lanes).map(|_| LaneBuffer::new(capacity)).collect(),
        })
    }

    pub fn num_lanes(&self) -> usize {
        self.lanes.len()
    }

    pub fn capacity(&self) -> usize {
        self.lanes[0].capacity()
    }

    pub fn lane(&self, index: usize) -> Option<&LaneBuffer> {
        self.lanes.get(index)
    }

    /// Total steps held across lanes.
    pub fn len(&self) -> usize {
        self.lanes.iter().map(LaneBuffer::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert one timestep. Without `lanes`, row `i` goes to lane `i` and
    /// the step must cover every lane; otherwise row `i` goes to `lanes[i]`.
    pub fn add(&mut self, step: &StepData, lanes: Option<&[usize]>) -> Result<()> {
        let rows = step.validate()?;
        let targets: Vec<usize> = match lanes {
            Some(l) => l.to_vec(),
            None => (0..self.lanes.len()).collect(),
        };
        if rows != targets.len() {
            return Err(DreamError::ShapeMismatch {
                key: "lanes".into(),
                expected: vec![targets.len()],
                actual: vec![rows],
            });
        }
        if let Some(&bad) = targets.iter().find(|&&l| l >= self.lanes.len()) {
            return Err(DreamError::Configuration(format!(
                "lane {bad} out of range for {} lanes",
                self.lanes.len()
            )));
        }

        for (row, &lane) in targets.iter().enumerate() {
            let mut values = Vec::new();
            for (key, array) in step.iter() {
                let shape = array.shape()[1..].to_vec();
                let data: Vec<f32> = array.index_axis(Axis(0), row).iter().copied().collect();
                values.push((key.as_str(), shape, data));
            }
            self.lanes[lane].push(
                values
                    .iter()
                    .map(|(k, s, d)| (*k, s.as_slice(), d.as_slice())),
            )?;
        }
        Ok(())
    }

    /// Draw `n_samples` independent batches of `batch_size` windows of
    /// `seq_len` consecutive steps each.
    ///
    /// Every window picks its lane uniformly and its start uniformly among
    /// the lane's valid starts. Fails with `InsufficientData` when a chosen
    /// lane holds fewer than `seq_len` steps.
    pub fn sample<R: Rng>(
        &self,
        batch_size: usize,
        seq_len: usize,
        n_samples: usize,
        rng: &mut R,
    ) -> Result<Vec<SequenceBatch>> {
        if batch_size == 0 || seq_len == 0 {
            return Err(DreamError::Configuration(format!(
                "batch_size ({batch_size}) and sequence_length ({seq_len}) must be positive"
            )));
        }

        let mut batches = Vec::with_capacity(n_samples);
        for _ in 0..n_samples {
            let mut windows = Vec::with_capacity(batch_size);
            for _ in 0..batch_size {
                let lane_idx = rng.gen_range(0..self.lanes.len());
                let lane = &self.lanes[lane_idx];
                let starts = lane.valid_starts(seq_len);
                if starts == 0 {
                    return Err(DreamError::InsufficientData {
                        lane: lane_idx,
                        available: lane.len(),
                        requested: seq_len,
                    });
                }
                windows.push((lane_idx, lane.window_start(rng.gen_range(0..starts))));
            }
            batches.push(self.gather(&windows, seq_len)?);
        }
        debug!(n_samples, batch_size, seq_len, "sampled sequence batches");
        Ok(batches)
    }

    fn gather(&self, windows: &[(usize, usize)], seq_len: usize) -> Result<SequenceBatch> {
        let reference = &self.lanes[windows[0].0];
        let mut data = BTreeMap::new();
        for key in reference.keys() {
            let shape = reference.shape(key).unwrap_or(&[]).to_vec();
            let width: usize = shape.iter().product();
            let mut values = Vec::with_capacity(seq_len * windows.len() * width);
            for t in 0..seq_len {
                for &(lane_idx, start) in windows {
                    let lane = &self.lanes[lane_idx];
                    values.extend_from_slice(lane.read(key, lane.slot_index(start, t))?);
                }
            }
            data.insert(key.clone(), (shape, values));
        }
        let mut batch = SequenceBatch::from_flat(data, seq_len, windows.len())?;
        batch.prepare()?;
        Ok(batch)
    }

    /// Close the last written step of `lane` after its environment was
    /// rebuilt mid-episode: `dones = 1`, `is_first = 0`.
    ///
    /// This is the only in-place modification of stored data.
    pub fn mark_restart_boundary(&mut self, lane: usize) -> Result<()> {
        let buffer = self.lanes.get_mut(lane).ok_or_else(|| {
            DreamError::Configuration(format!("lane {lane} out of range"))
        })?;
        let slot = buffer.last_slot().ok_or(DreamError::InsufficientData {
            lane,
            available: 0,
            requested: 1,
        })?;
        buffer.overwrite(DONES, slot, 1.0)?;
        buffer.overwrite(IS_FIRST, slot, 0.0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{ACTIONS, REWARDS};
    use ndarray::{ArrayD, IxDyn};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Step whose "t" observation records the global timestep.
    fn step(t: usize, lanes: usize) -> StepData {
        StepData::new()
            .with("t", StepData::column(lanes, t as f32))
            .with(ACTIONS, ArrayD::zeros(IxDyn(&[lanes, 2])))
            .with(REWARDS, StepData::column(lanes, 0.0))
            .with(DONES, StepData::column(lanes, 0.0))
            .with(IS_FIRST, StepData::column(lanes, if t == 0 { 1.0 } else { 0.0 }))
    }

    #[test]
    fn test_wrapped_windows_are_contiguous_and_fresh() {
        let mut rb = EnvIndependentReplayBuffer::new(100, 2).unwrap();
        for t in 0..150 {
            rb.add(&step(t, 2), None).unwrap();
        }
        let mut rng = StdRng::seed_from_u64(42);
        let batches = rb.sample(16, 10, 20, &mut rng).unwrap();
        assert_eq!(batches.len(), 20);

        for batch in &batches {
            let t = batch.get("t").unwrap();
            assert_eq!(t.shape(), &[10, 16, 1]);
            for b in 0..16 {
                let first = t[[0, b, 0]];
                assert!(first >= 50.0, "sampled overwritten step {first}");
                for i in 1..10 {
                    assert_eq!(t[[i, b, 0]], first + i as f32);
                }
            }
        }
    }

    #[test]
    fn test_is_first_forced_on_window_start() {
        let mut rb = EnvIndependentReplayBuffer::new(20, 1).unwrap();
        for t in 0..20 {
            rb.add(&step(t, 1), None).unwrap();
        }
        let mut rng = StdRng::seed_from_u64(1);
        let batch = &rb.sample(8, 4, 1, &mut rng).unwrap()[0];
        let is_first = batch.get(IS_FIRST).unwrap();
        for b in 0..8 {
            assert_eq!(is_first[[0, b, 0]], 1.0);
        }
    }

    #[test]
    fn test_insufficient_data() {
        let mut rb = EnvIndependentReplayBuffer::new(10, 1).unwrap();
        for t in 0..3 {
            rb.add(&step(t, 1), None).unwrap();
        }
        let mut rng = StdRng::seed_from_u64(0);
        match rb.sample(1, 5, 1, &mut rng) {
            Err(DreamError::InsufficientData {
                lane,
                available,
                requested,
            }) => {
                assert_eq!((lane, available, requested), (0, 3, 5));
            }
            other => panic!("expected InsufficientData, got {other:?}"),
        }
    }

    #[test]
    fn test_add_subset_of_lanes() {
        let mut rb = EnvIndependentReplayBuffer::new(10, 3).unwrap();
        rb.add(&step(0, 3), None).unwrap();
        rb.add(&step(7, 1), Some(&[2])).unwrap();
        assert_eq!(rb.lane(0).unwrap().len(), 1);
        assert_eq!(rb.lane(2).unwrap().len(), 2);
        assert!(rb.add(&step(1, 2), Some(&[0])).is_err());
        assert!(rb.add(&step(1, 1), Some(&[5])).is_err());
    }

    #[test]
    fn test_restart_boundary_rewrites_only_last_slot() {
        let mut rb = EnvIndependentReplayBuffer::new(4, 2).unwrap();
        for t in 0..6 {
            rb.add(&step(t, 2), None).unwrap();
        }
        rb.mark_restart_boundary(1).unwrap();

        let lane = rb.lane(1).unwrap();
        let last = lane.last_slot().unwrap();
        assert_eq!(lane.read(DONES, last).unwrap(), &[1.0]);
        assert_eq!(lane.read(IS_FIRST, last).unwrap(), &[0.0]);
        assert_eq!(lane.read("t", last).unwrap(), &[5.0]);

        let untouched = rb.lane(0).unwrap();
        assert_eq!(untouched.read(DONES, untouched.last_slot().unwrap()).unwrap(), &[0.0]);

        let mut empty = EnvIndependentReplayBuffer::new(4, 1).unwrap();
        assert!(empty.mark_restart_boundary(0).is_err());
    }

    #[test]
    fn test_serde_roundtrip_preserves_cursor() {
        let mut rb = EnvIndependentReplayBuffer::new(5, 1).unwrap();
        for t in 0..7 {
            rb.add(&step(t, 1), None).unwrap();
        }
        let bytes = bincode::serialize(&rb).unwrap();
        let restored: EnvIndependentReplayBuffer = bincode::deserialize(&bytes).unwrap();
        let lane = restored.lane(0).unwrap();
        assert_eq!(lane.pos(), 2);
        assert!(lane.is_full());
        assert_eq!(lane.read("t", lane.last_slot().unwrap()).unwrap(), &[6.0]);
    }
}
