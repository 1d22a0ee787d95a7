//! Environment wrappers for common functionality.

use super::{DreamEnv, EnvInfo, ObsDict, StepResult};
use crate::spaces::{Box as BoxSpace, Dict, DynSpace};
use crate::{DreamError, Result};
use ndarray::ArrayD;
use tracing::warn;

/// Wrapper that tracks episode statistics (return and length).
///
/// Adds `episode_return` and `episode_length` to info on episode completion.
pub struct EpisodeStats<E: DreamEnv> {
    env: E,
    episode_return: f32,
    episode_length: u32,
}

impl<E: DreamEnv> EpisodeStats<E> {
    pub fn new(env: E) -> Self {
        Self {
            env,
            episode_return: 0.0,
            episode_length: 0,
        }
    }

    pub fn inner(&self) -> &E {
        &self.env
    }
}

impl<E: DreamEnv> DreamEnv for EpisodeStats<E> {
    fn observation_space(&self) -> Dict {
        self.env.observation_space()
    }

    fn action_space(&self) -> DynSpace {
        self.env.action_space()
    }

    fn reset(&mut self, seed: Option<u64>) -> Result<(ObsDict, EnvInfo)> {
        self.episode_return = 0.0;
        self.episode_length = 0;
        self.env.reset(seed)
    }

    fn step(&mut self, action: &ArrayD<f32>) -> Result<StepResult> {
        let mut result = self.env.step(action)?;
        self.episode_return += result.reward;
        self.episode_length += 1;

        if result.done() {
            result.info = result
                .info
                .with_episode_stats(self.episode_return, self.episode_length);
            self.episode_return = 0.0;
            self.episode_length = 0;
        }
        Ok(result)
    }

    fn render(&self) -> Option<String> {
        self.env.render()
    }

    fn close(&mut self) {
        self.env.close()
    }
}

/// Repeats each action `repeat` times, summing rewards and stopping early
/// when the episode ends.
pub struct ActionRepeat<E: DreamEnv> {
    env: E,
    repeat: usize,
}

impl<E: DreamEnv> ActionRepeat<E> {
    pub fn new(env: E, repeat: usize) -> Result<Self> {
        if repeat == 0 {
            return Err(DreamError::Configuration(
                "action_repeat must be at least 1".into(),
            ));
        }
        Ok(Self { env, repeat })
    }
}

impl<E: DreamEnv> DreamEnv for ActionRepeat<E> {
    fn observation_space(&self) -> Dict {
        self.env.observation_space()
    }

    fn action_space(&self) -> DynSpace {
        self.env.action_space()
    }

    fn reset(&mut self, seed: Option<u64>) -> Result<(ObsDict, EnvInfo)> {
        self.env.reset(seed)
    }

    fn step(&mut self, action: &ArrayD<f32>) -> Result<StepResult> {
        let mut result = self.env.step(action)?;
        let mut total = result.reward;
        for _ in 1..self.repeat {
            if result.done() {
                break;
            }
            result = self.env.step(action)?;
            total += result.reward;
        }
        result.reward = total;
        Ok(result)
    }

    fn close(&mut self) {
        self.env.close()
    }
}

/// Wrapper that clips continuous actions to the action space bounds.
pub struct ClipAction<E: DreamEnv> {
    env: E,
    bounds: BoxSpace,
}

impl<E: DreamEnv> ClipAction<E> {
    /// Fails unless the action space is a `Box`.
    pub fn new(env: E) -> Result<Self> {
        let bounds = match env.action_space() {
            DynSpace::Box(b) => b,
            other => {
                return Err(DreamError::Configuration(format!(
                    "ClipAction requires a Box action space, got {other:?}"
                )))
            }
        };
        Ok(Self { env, bounds })
    }
}

impl<E: DreamEnv> DreamEnv for ClipAction<E> {
    fn observation_space(&self) -> Dict {
        self.env.observation_space()
    }

    fn action_space(&self) -> DynSpace {
        self.env.action_space()
    }

    fn reset(&mut self, seed: Option<u64>) -> Result<(ObsDict, EnvInfo)> {
        self.env.reset(seed)
    }

    fn step(&mut self, action: &ArrayD<f32>) -> Result<StepResult> {
        let clipped = self.bounds.clip(action)?;
        self.env.step(&clipped)
    }

    fn close(&mut self) {
        self.env.close()
    }
}

/// Rebuilds the environment when a step or reset fails.
///
/// The failed step is reported as a fresh start: the returned observation
/// comes from the rebuilt environment, reward is zero and
/// `info.restart_on_exception` is set so the player can close the previous
/// sequence in its buffer.
pub struct RestartOnError<E, F>
where
    E: DreamEnv,
    F: FnMut() -> Result<E> + Send,
{
    env: E,
    factory: F,
    max_restarts: usize,
    restarts: usize,
}

impl<E, F> RestartOnError<E, F>
where
    E: DreamEnv,
    F: FnMut() -> Result<E> + Send,
{
    pub fn new(mut factory: F, max_restarts: usize) -> Result<Self> {
        let env = factory()?;
        Ok(Self {
            env,
            factory,
            max_restarts,
            restarts: 0,
        })
    }

    pub fn restarts(&self) -> usize {
        self.restarts
    }

    fn rebuild(&mut self, cause: &DreamError) -> Result<(ObsDict, EnvInfo)> {
        if self.restarts >= self.max_restarts {
            return Err(DreamError::Env(format!(
                "giving up after {} restarts: {cause}",
                self.restarts
            )));
        }
        self.restarts += 1;
        warn!(restarts = self.restarts, error = %cause, "environment failed, restarting");
        self.env = (self.factory)()?;
        let (obs, mut info) = self.env.reset(None)?;
        info.restart_on_exception = true;
        Ok((obs, info))
    }
}

impl<E, F> DreamEnv for RestartOnError<E, F>
where
    E: DreamEnv,
    F: FnMut() -> Result<E> + Send,
{
    fn observation_space(&self) -> Dict {
        self.env.observation_space()
    }

    fn action_space(&self) -> DynSpace {
        self.env.action_space()
    }

    fn reset(&mut self, seed: Option<u64>) -> Result<(ObsDict, EnvInfo)> {
        match self.env.reset(seed) {
            Ok(out) => Ok(out),
            Err(e) => self.rebuild(&e),
        }
    }

    fn step(&mut self, action: &ArrayD<f32>) -> Result<StepResult> {
        match self.env.step(action) {
            Ok(result) => Ok(result),
            Err(e) => {
                let (observation, info) = self.rebuild(&e)?;
                Ok(StepResult {
                    observation,
                    reward: 0.0,
                    terminated: false,
                    truncated: false,
                    info,
                })
            }
        }
    }

    fn close(&mut self) {
        self.env.close()
    }
}
