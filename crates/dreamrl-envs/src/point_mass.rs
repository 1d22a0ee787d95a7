//! Continuous point-mass reaching task.

use dreamrl::env::{DreamEnv, EnvInfo, ObsDict, StepResult};
use dreamrl::spaces::{Box as BoxSpace, Dict, DynSpace};
use dreamrl::{DreamError, Result};
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A point in the unit square pushed by 2-D velocity commands toward a
/// random goal.
///
/// Observation `state`: `[x, y, goal_x - x, goal_y - y]`.
/// Action: velocity in `[-1, 1]^2`, scaled by `speed`.
/// Reward: negative distance to the goal, `+1` and termination on arrival.
pub struct PointMass {
    speed: f32,
    goal_radius: f32,
    max_steps: u32,
    position: [f32; 2],
    goal: [f32; 2],
    steps: u32,
    rng: StdRng,
}

impl PointMass {
    pub fn new(max_steps: u32) -> Self {
        Self {
            speed: 0.1,
            goal_radius: 0.05,
            max_steps,
            position: [0.5; 2],
            goal: [0.5; 2],
            steps: 0,
            rng: StdRng::from_entropy(),
        }
    }

    fn distance(&self) -> f32 {
        let dx = self.goal[0] - self.position[0];
        let dy = self.goal[1] - self.position[1];
        (dx * dx + dy * dy).sqrt()
    }

    fn observation(&self) -> ObsDict {
        let [x, y] = self.position;
        let state = vec![x, y, self.goal[0] - x, self.goal[1] - y];
        ObsDict::from([(
            "state".to_string(),
            ArrayD::from_shape_vec(IxDyn(&[4]), state).unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[4]))),
        )])
    }
}

impl Default for PointMass {
    fn default() -> Self {
        Self::new(100)
    }
}

impl DreamEnv for PointMass {
    fn observation_space(&self) -> Dict {
        Dict::from_pairs(vec![("state", DynSpace::Box(BoxSpace::uniform(&[4], -1.0, 1.0)))])
    }

    fn action_space(&self) -> DynSpace {
        DynSpace::Box(BoxSpace::symmetric(&[2]))
    }

    fn reset(&mut self, seed: Option<u64>) -> Result<(ObsDict, EnvInfo)> {
        if let Some(s) = seed {
            self.rng = StdRng::seed_from_u64(s);
        }
        self.position = [self.rng.gen(), self.rng.gen()];
        self.goal = [self.rng.gen(), self.rng.gen()];
        self.steps = 0;
        Ok((self.observation(), EnvInfo::new()))
    }

    fn step(&mut self, action: &ArrayD<f32>) -> Result<StepResult> {
        if action.len() != 2 {
            return Err(DreamError::ShapeMismatch {
                key: "action".into(),
                expected: vec![2],
                actual: action.shape().to_vec(),
            });
        }
        for (p, a) in self.position.iter_mut().zip(action.iter()) {
            *p = (*p + a * self.speed).clamp(0.0, 1.0);
        }
        self.steps += 1;

        let distance = self.distance();
        let reached = distance < self.goal_radius;
        Ok(StepResult {
            observation: self.observation(),
            reward: if reached { 1.0 } else { -distance },
            terminated: reached,
            truncated: !reached && self.steps >= self.max_steps,
            info: EnvInfo::new().with_extra("distance", distance),
        })
    }

    fn render(&self) -> Option<String> {
        Some(format!(
            "pos=({:.2}, {:.2}) goal=({:.2}, {:.2})",
            self.position[0], self.position[1], self.goal[0], self.goal[1]
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_is_seeded() {
        let mut a = PointMass::default();
        let mut b = PointMass::default();
        let (obs_a, _) = a.reset(Some(3)).unwrap();
        let (obs_b, _) = b.reset(Some(3)).unwrap();
        assert_eq!(obs_a["state"], obs_b["state"]);
        assert_eq!(obs_a["state"].shape(), &[4]);
    }

    #[test]
    fn test_moving_toward_goal_reaches_it() {
        let mut env = PointMass::new(1000);
        env.reset(Some(0)).unwrap();
        let mut last = None;
        for _ in 0..100 {
            let dx = env.goal[0] - env.position[0];
            let dy = env.goal[1] - env.position[1];
            let action = ArrayD::from_shape_vec(IxDyn(&[2]), vec![(dx * 5.0).clamp(-1.0, 1.0), (dy * 5.0).clamp(-1.0, 1.0)]).unwrap();
            let result = env.step(&action).unwrap();
            if result.done() {
                last = Some(result);
                break;
            }
        }
        let result = last.expect("goal not reached");
        assert!(result.terminated);
        assert_eq!(result.reward, 1.0);
    }

    #[test]
    fn test_time_limit_truncates() {
        let mut env = PointMass::new(2);
        env.reset(Some(1)).unwrap();
        env.goal = [2.0, 2.0];
        let still = ArrayD::zeros(IxDyn(&[2]));
        assert!(!env.step(&still).unwrap().done());
        let result = env.step(&still).unwrap();
        assert!(result.truncated && !result.terminated);
    }

    #[test]
    fn test_rejects_wrong_action_shape() {
        let mut env = PointMass::default();
        env.reset(None).unwrap();
        assert!(env.step(&ArrayD::zeros(IxDyn(&[3]))).is_err());
    }
}
