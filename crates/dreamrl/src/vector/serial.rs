//! Serial (sequential) vectorization backend.
//!
//! Runs environments one at a time in the player thread.

use super::vecenv::{stack_observations, VecEnvBackend, VecStep};
use crate::env::{DreamEnv, EnvInfo, ObsDict};
use crate::spaces::{Dict, DynSpace};
use crate::{DreamError, Result};
use ndarray::ArrayD;

pub struct Serial<E: DreamEnv> {
    envs: Vec<E>,
}

impl<E: DreamEnv> Serial<E> {
    /// Build `num_envs` lanes; `env_creator` receives the lane index.
    pub fn new<F>(env_creator: F, num_envs: usize) -> Result<Self>
    where
        F: Fn(usize) -> Result<E>,
    {
        if num_envs == 0 {
            return Err(DreamError::Configuration("num_envs must be positive".into()));
        }
        let envs = (0..num_envs).map(env_creator).collect::<Result<Vec<_>>>()?;
        Ok(Self { envs })
    }
}

impl<E: DreamEnv> VecEnvBackend for Serial<E> {
    fn observation_space(&self) -> Dict {
        self.envs[0].observation_space()
    }

    fn action_space(&self) -> DynSpace {
        self.envs[0].action_space()
    }

    fn num_envs(&self) -> usize {
        self.envs.len()
    }

    fn reset(&mut self, seed: Option<u64>) -> Result<(ObsDict, Vec<EnvInfo>)> {
        let mut observations = Vec::with_capacity(self.envs.len());
        let mut infos = Vec::with_capacity(self.envs.len());
        for (i, env) in self.envs.iter_mut().enumerate() {
            let (obs, info) = env.reset(seed.map(|s| s + i as u64))?;
            observations.push(obs);
            infos.push(info);
        }
        Ok((stack_observations(&observations)?, infos))
    }

    fn step(&mut self, actions: &[ArrayD<f32>]) -> Result<VecStep> {
        if actions.len() != self.envs.len() {
            return Err(DreamError::ShapeMismatch {
                key: "actions".into(),
                expected: vec![self.envs.len()],
                actual: vec![actions.len()],
            });
        }
        let n = self.envs.len();
        let mut observations = Vec::with_capacity(n);
        let mut step = VecStep {
            observations: ObsDict::new(),
            rewards: Vec::with_capacity(n),
            terminated: Vec::with_capacity(n),
            truncated: Vec::with_capacity(n),
            infos: Vec::with_capacity(n),
            final_observations: vec![None; n],
        };

        for (i, (env, action)) in self.envs.iter_mut().zip(actions).enumerate() {
            let result = env.step(action)?;
            let done = result.done();
            step.rewards.push(result.reward);
            step.terminated.push(result.terminated);
            step.truncated.push(result.truncated);

            if done {
                // Autoreset: keep the terminal observation aside
                let (first_obs, reset_info) = env.reset(None)?;
                step.final_observations[i] = Some(result.observation);
                observations.push(first_obs);
                let mut info = result.info;
                info.restart_on_exception |= reset_info.restart_on_exception;
                step.infos.push(info);
            } else {
                observations.push(result.observation);
                step.infos.push(result.info);
            }
        }

        step.observations = stack_observations(&observations)?;
        Ok(step)
    }

    fn close(&mut self) {
        for env in &mut self.envs {
            env.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::StepResult;
    use crate::spaces::{Box as BoxSpace, Discrete};
    use ndarray::IxDyn;

    /// Counts steps and terminates after `horizon`.
    struct Timer {
        t: u32,
        horizon: u32,
    }

    impl DreamEnv for Timer {
        fn observation_space(&self) -> Dict {
            Dict::from_pairs(vec![("t", DynSpace::Box(BoxSpace::uniform(&[1], 0.0, 100.0)))])
        }

        fn action_space(&self) -> DynSpace {
            DynSpace::Discrete(Discrete::new(1))
        }

        fn reset(&mut self, _seed: Option<u64>) -> Result<(ObsDict, EnvInfo)> {
            self.t = 0;
            Ok((self.obs(), EnvInfo::new()))
        }

        fn step(&mut self, _action: &ArrayD<f32>) -> Result<StepResult> {
            self.t += 1;
            Ok(StepResult {
                observation: self.obs(),
                reward: 1.0,
                terminated: self.t >= self.horizon,
                truncated: false,
                info: EnvInfo::new(),
            })
        }
    }

    impl Timer {
        fn obs(&self) -> ObsDict {
            ObsDict::from([("t".to_string(), ArrayD::from_elem(IxDyn(&[1]), self.t as f32))])
        }
    }

    #[test]
    fn test_autoreset_keeps_final_observation() {
        let mut vec_env = Serial::new(|i| Ok(Timer { t: 0, horizon: 2 + i as u32 }), 2).unwrap();
        let (obs, _) = vec_env.reset(Some(0)).unwrap();
        assert_eq!(obs["t"].shape(), &[2, 1]);

        let actions = vec![ArrayD::zeros(IxDyn(&[1])); 2];
        let first = vec_env.step(&actions).unwrap();
        assert!(first.done_lanes().is_empty());

        let second = vec_env.step(&actions).unwrap();
        assert_eq!(second.done_lanes(), vec![0]);
        let terminal = second.final_observations[0].as_ref().unwrap();
        assert_eq!(terminal["t"][[0]], 2.0);
        // Lane 0 already restarted, lane 1 keeps counting
        assert_eq!(second.observations["t"][[0, 0]], 0.0);
        assert_eq!(second.observations["t"][[1, 0]], 2.0);
        assert!(second.final_observations[1].is_none());
    }

    #[test]
    fn test_action_count_must_match_lanes() {
        let mut vec_env = Serial::new(|_| Ok(Timer { t: 0, horizon: 3 }), 3).unwrap();
        vec_env.reset(None).unwrap();
        assert!(vec_env.step(&[ArrayD::zeros(IxDyn(&[1]))]).is_err());
    }
}
