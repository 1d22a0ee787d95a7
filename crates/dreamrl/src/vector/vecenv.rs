//! Vectorized environment abstraction.

use crate::env::{EnvInfo, ObsDict};
use crate::spaces::{Dict, DynSpace};
use crate::{DreamError, Result};
use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VecEnvConfig {
    pub num_envs: usize,
    /// Lane `i` is seeded with `seed + i`
    pub seed: u64,
}

impl Default for VecEnvConfig {
    fn default() -> Self {
        Self {
            num_envs: 1,
            seed: 42,
        }
    }
}

impl VecEnvConfig {
    pub fn new(num_envs: usize) -> Self {
        Self {
            num_envs,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Result of stepping every lane once.
#[derive(Clone, Debug)]
pub struct VecStep {
    /// Next observation per key, `[N, ...]`. For lanes that finished this is
    /// already the first observation of the new episode.
    pub observations: ObsDict,
    pub rewards: Vec<f32>,
    pub terminated: Vec<bool>,
    pub truncated: Vec<bool>,
    pub infos: Vec<EnvInfo>,
    /// Terminal observation for the lanes that finished this step.
    pub final_observations: Vec<Option<ObsDict>>,
}

impl VecStep {
    pub fn dones(&self) -> Vec<bool> {
        self.terminated
            .iter()
            .zip(&self.truncated)
            .map(|(&t, &tr)| t || tr)
            .collect()
    }

    /// Indices of the lanes whose episode ended.
    pub fn done_lanes(&self) -> Vec<usize> {
        self.dones()
            .into_iter()
            .enumerate()
            .filter_map(|(i, d)| d.then_some(i))
            .collect()
    }
}

/// Trait for vectorized environment backends
pub trait VecEnvBackend: Send {
    /// Observation space of a single lane
    fn observation_space(&self) -> Dict;

    /// Action space of a single lane
    fn action_space(&self) -> DynSpace;

    fn num_envs(&self) -> usize;

    fn reset(&mut self, seed: Option<u64>) -> Result<(ObsDict, Vec<EnvInfo>)>;

    /// Step every lane with its environment-form action.
    fn step(&mut self, actions: &[ArrayD<f32>]) -> Result<VecStep>;

    fn close(&mut self);
}

/// Stack per-lane observations into `[N, ...]` arrays per key.
pub fn stack_observations(per_lane: &[ObsDict]) -> Result<ObsDict> {
    let first = per_lane
        .first()
        .ok_or_else(|| DreamError::Env("no observations to stack".into()))?;
    let mut out = ObsDict::new();
    for key in first.keys() {
        let views = per_lane
            .iter()
            .map(|obs| {
                obs.get(key)
                    .map(|a| a.view())
                    .ok_or_else(|| DreamError::MissingKey(key.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        let stacked = ndarray::stack(Axis(0), &views).map_err(|_| DreamError::ShapeMismatch {
            key: key.clone(),
            expected: first[key].shape().to_vec(),
            actual: views
                .iter()
                .find(|v| v.shape() != first[key].shape())
                .map(|v| v.shape().to_vec())
                .unwrap_or_default(),
        })?;
        out.insert(key.clone(), stacked);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn obs(v: f32, len: usize) -> ObsDict {
        ObsDict::from([("state".to_string(), ArrayD::from_elem(IxDyn(&[len]), v))])
    }

    #[test]
    fn test_stack_adds_lane_axis() {
        let stacked = stack_observations(&[obs(1.0, 3), obs(2.0, 3)]).unwrap();
        assert_eq!(stacked["state"].shape(), &[2, 3]);
        assert_eq!(stacked["state"][[1, 2]], 2.0);
    }

    #[test]
    fn test_stack_rejects_ragged_lanes() {
        let err = stack_observations(&[obs(1.0, 3), obs(2.0, 4)]).unwrap_err();
        assert!(matches!(err, DreamError::ShapeMismatch { .. }));
    }
}
