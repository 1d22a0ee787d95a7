//! Core environment trait definitions.

use crate::spaces::{Dict, DynSpace};
use crate::Result;
use ndarray::ArrayD;
use std::collections::BTreeMap;

/// Observation keyed by name, e.g. `"rgb" -> [3, 64, 64]`.
pub type ObsDict = BTreeMap<String, ArrayD<f32>>;

/// Information returned from environment steps
#[derive(Clone, Debug, Default)]
pub struct EnvInfo {
    /// Episode return (set on the final step)
    pub episode_return: Option<f32>,
    /// Episode length (set on the final step)
    pub episode_length: Option<f32>,
    /// The environment failed and was rebuilt during this step
    pub restart_on_exception: bool,
    pub extra: smallvec::SmallVec<[(&'static str, f32); 4]>,
}

impl EnvInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_episode_stats(mut self, ret: f32, len: u32) -> Self {
        self.episode_return = Some(ret);
        self.episode_length = Some(len as f32);
        self
    }

    pub fn with_extra(mut self, key: &'static str, value: f32) -> Self {
        self.extra.push((key, value));
        self
    }

    /// Look up a value by key, including the episode statistics.
    pub fn get(&self, key: &str) -> Option<f32> {
        match key {
            "episode_return" => self.episode_return,
            "episode_length" => self.episode_length,
            _ => self.extra.iter().find(|(k, _)| *k == key).map(|(_, v)| *v),
        }
    }
}

/// Result from a single environment step
#[derive(Clone, Debug)]
pub struct StepResult {
    pub observation: ObsDict,
    pub reward: f32,
    /// Episode ended inside the MDP (goal, failure)
    pub terminated: bool,
    /// Episode was cut short (time limit)
    pub truncated: bool,
    pub info: EnvInfo,
}

impl StepResult {
    pub fn done(&self) -> bool {
        self.terminated || self.truncated
    }
}

/// Environment driven by the player.
///
/// ```rust,ignore
/// impl DreamEnv for Corridor {
///     fn observation_space(&self) -> Dict {
///         Dict::from_pairs(vec![("state", DynSpace::Box(BoxSpace::symmetric(&[2])))])
///     }
///
///     fn action_space(&self) -> DynSpace {
///         DynSpace::Discrete(Discrete::new(2))
///     }
///
///     fn reset(&mut self, seed: Option<u64>) -> Result<(ObsDict, EnvInfo)> { ... }
///     fn step(&mut self, action: &ArrayD<f32>) -> Result<StepResult> { ... }
/// }
/// ```
pub trait DreamEnv: Send {
    fn observation_space(&self) -> Dict;

    fn action_space(&self) -> DynSpace;

    /// Reset to an initial state, optionally reseeding.
    fn reset(&mut self, seed: Option<u64>) -> Result<(ObsDict, EnvInfo)>;

    /// Apply one action in environment form (see `DynSpace::decode_action`).
    fn step(&mut self, action: &ArrayD<f32>) -> Result<StepResult>;

    fn render(&self) -> Option<String> {
        None
    }

    fn close(&mut self) {}
}
