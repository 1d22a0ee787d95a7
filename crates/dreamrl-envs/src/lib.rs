//! Built-in environments for dreamrl.
//!
//! - `point_mass` - continuous reaching task with vector observations
//! - `pixel_grid` - discrete grid navigation with image observations

mod pixel_grid;
mod point_mass;

pub use pixel_grid::PixelGrid;
pub use point_mass::PointMass;

use dreamrl::config::EnvConfig;
use dreamrl::env::{ClipAction, DreamEnv, EnvInfo, ObsDict, StepResult};
use dreamrl::spaces::{Dict, DynSpace};
use dreamrl::{DreamError, Result};
use ndarray::ArrayD;

/// Registered ids with a one-line description.
pub const ENVIRONMENTS: [(&str, &str); 2] = [
    ("point_mass", "Continuous 2-D reaching, vector observations"),
    ("pixel_grid", "Discrete grid navigation, 3xSxS image plus state"),
];

const GRID_CELLS: usize = 4;

/// Any built-in environment, so that a vectorized backend can hold lanes of
/// a type chosen at runtime.
pub enum BuiltinEnv {
    /// Actions are clipped to `[-1, 1]` before they reach the env
    PointMass(ClipAction<PointMass>),
    PixelGrid(PixelGrid),
}

impl BuiltinEnv {
    fn inner(&self) -> &dyn DreamEnv {
        match self {
            BuiltinEnv::PointMass(env) => env,
            BuiltinEnv::PixelGrid(env) => env,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn DreamEnv {
        match self {
            BuiltinEnv::PointMass(env) => env,
            BuiltinEnv::PixelGrid(env) => env,
        }
    }
}

/// Build the environment named by `config.id`.
pub fn make(config: &EnvConfig) -> Result<BuiltinEnv> {
    let max_steps = config.max_episode_steps.unwrap_or(200) as u32;
    match config.id.as_str() {
        "point_mass" => Ok(BuiltinEnv::PointMass(ClipAction::new(PointMass::new(
            max_steps,
        ))?)),
        "pixel_grid" => Ok(BuiltinEnv::PixelGrid(PixelGrid::new(
            GRID_CELLS,
            config.screen_size,
            max_steps,
        )?)),
        other => Err(DreamError::Configuration(format!(
            "unknown environment '{}', available: {}",
            other,
            ENVIRONMENTS.map(|(id, _)| id).join(", ")
        ))),
    }
}

impl DreamEnv for BuiltinEnv {
    fn observation_space(&self) -> Dict {
        self.inner().observation_space()
    }

    fn action_space(&self) -> DynSpace {
        self.inner().action_space()
    }

    fn reset(&mut self, seed: Option<u64>) -> Result<(ObsDict, EnvInfo)> {
        self.inner_mut().reset(seed)
    }

    fn step(&mut self, action: &ArrayD<f32>) -> Result<StepResult> {
        self.inner_mut().step(action)
    }

    fn render(&self) -> Option<String> {
        self.inner().render()
    }

    fn close(&mut self) {
        self.inner_mut().close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_known_environments() {
        for (id, _) in ENVIRONMENTS {
            let config = EnvConfig {
                id: id.to_string(),
                screen_size: 16,
                ..Default::default()
            };
            let mut env = make(&config).unwrap();
            let (obs, _) = env.reset(Some(0)).unwrap();
            for key in env.observation_space().keys() {
                assert!(obs.contains_key(key), "{id} is missing {key}");
            }
        }
    }

    #[test]
    fn test_point_mass_actions_are_clipped() {
        let config = EnvConfig {
            id: "point_mass".into(),
            ..Default::default()
        };
        let mut clipped = make(&config).unwrap();
        let mut unit = make(&config).unwrap();
        clipped.reset(Some(5)).unwrap();
        unit.reset(Some(5)).unwrap();

        let big = ArrayD::from_elem(ndarray::IxDyn(&[2]), 4.0);
        let one = ArrayD::from_elem(ndarray::IxDyn(&[2]), 1.0);
        let a = clipped.step(&big).unwrap();
        let b = unit.step(&one).unwrap();
        assert_eq!(a.observation["state"], b.observation["state"]);
        assert_eq!(a.reward, b.reward);
    }

    #[test]
    fn test_unknown_environment() {
        let config = EnvConfig {
            id: "atari".into(),
            ..Default::default()
        };
        let err = make(&config).err().unwrap();
        assert!(err.to_string().contains("available: point_mass, pixel_grid"));
    }
}
