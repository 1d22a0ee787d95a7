//! Grid navigation rendered to pixels.

use dreamrl::env::{DreamEnv, EnvInfo, ObsDict, StepResult};
use dreamrl::spaces::{Box as BoxSpace, Dict, Discrete, DynSpace};
use dreamrl::{DreamError, Result};
use ndarray::{Array3, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// Stay, up, down, left, right
const MOVES: [(i32, i32); 5] = [(0, 0), (0, -1), (0, 1), (-1, 0), (1, 0)];

/// Agent (red) and goal (green) on a `cells x cells` grid, drawn as an RGB
/// image of side `screen_size`.
///
/// Observations: `rgb` `[3, S, S]` with values in `[0, 255]` and `state`
/// `[4]` holding both positions scaled to `[0, 1]`.
pub struct PixelGrid {
    cells: usize,
    screen_size: usize,
    max_steps: u32,
    agent: (usize, usize),
    goal: (usize, usize),
    steps: u32,
    rng: StdRng,
}

impl PixelGrid {
    pub fn new(cells: usize, screen_size: usize, max_steps: u32) -> Result<Self> {
        if cells < 2 || screen_size < cells || screen_size % cells != 0 {
            return Err(DreamError::Configuration(format!(
                "screen_size {screen_size} must be a multiple of the grid size {cells} (>= 2)"
            )));
        }
        Ok(Self {
            cells,
            screen_size,
            max_steps,
            agent: (0, 0),
            goal: (0, 0),
            steps: 0,
            rng: StdRng::from_entropy(),
        })
    }

    fn random_cell(&mut self) -> (usize, usize) {
        (self.rng.gen_range(0..self.cells), self.rng.gen_range(0..self.cells))
    }

    fn paint(&self, image: &mut Array3<f32>, cell: (usize, usize), channel: usize) {
        let scale = self.screen_size / self.cells;
        for y in cell.1 * scale..(cell.1 + 1) * scale {
            for x in cell.0 * scale..(cell.0 + 1) * scale {
                image[[channel, y, x]] = 255.0;
            }
        }
    }

    fn observation(&self) -> ObsDict {
        let s = self.screen_size;
        let mut image = Array3::zeros((3, s, s));
        self.paint(&mut image, self.goal, 1);
        self.paint(&mut image, self.agent, 0);

        let norm = (self.cells - 1) as f32;
        let state = vec![
            self.agent.0 as f32 / norm,
            self.agent.1 as f32 / norm,
            self.goal.0 as f32 / norm,
            self.goal.1 as f32 / norm,
        ];
        ObsDict::from([
            ("rgb".to_string(), image.into_dyn()),
            (
                "state".to_string(),
                ArrayD::from_shape_vec(IxDyn(&[4]), state).unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[4]))),
            ),
        ])
    }
}

impl DreamEnv for PixelGrid {
    fn observation_space(&self) -> Dict {
        let s = self.screen_size;
        Dict::from_pairs(vec![
            ("rgb", DynSpace::Box(BoxSpace::image(3, s, s))),
            ("state", DynSpace::Box(BoxSpace::uniform(&[4], 0.0, 1.0))),
        ])
    }

    fn action_space(&self) -> DynSpace {
        DynSpace::Discrete(Discrete::new(MOVES.len()))
    }

    fn reset(&mut self, seed: Option<u64>) -> Result<(ObsDict, EnvInfo)> {
        if let Some(s) = seed {
            self.rng = StdRng::seed_from_u64(s);
        }
        self.agent = self.random_cell();
        self.goal = self.random_cell();
        while self.goal == self.agent {
            self.goal = self.random_cell();
        }
        self.steps = 0;
        Ok((self.observation(), EnvInfo::new()))
    }

    fn step(&mut self, action: &ArrayD<f32>) -> Result<StepResult> {
        let index = action
            .iter()
            .next()
            .map(|a| a.round() as usize)
            .filter(|&i| i < MOVES.len())
            .ok_or_else(|| DreamError::Env(format!("invalid pixel_grid action {action:?}")))?;
        let (dx, dy) = MOVES[index];
        let last = self.cells as i32 - 1;
        self.agent = (
            (self.agent.0 as i32 + dx).clamp(0, last) as usize,
            (self.agent.1 as i32 + dy).clamp(0, last) as usize,
        );
        self.steps += 1;

        let reached = self.agent == self.goal;
        Ok(StepResult {
            observation: self.observation(),
            reward: if reached { 1.0 } else { -0.01 },
            terminated: reached,
            truncated: !reached && self.steps >= self.max_steps,
            info: EnvInfo::new(),
        })
    }

    fn render(&self) -> Option<String> {
        let rows = (0..self.cells).map(|y| {
            (0..self.cells)
                .map(|x| match (x, y) {
                    c if c == self.agent => 'A',
                    c if c == self.goal => 'G',
                    _ => '.',
                })
                .collect::<String>()
        });
        Some(rows.collect::<Vec<_>>().join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_layout() {
        let mut env = PixelGrid::new(4, 16, 50).unwrap();
        let (obs, _) = env.reset(Some(5)).unwrap();
        let rgb = &obs["rgb"];
        assert_eq!(rgb.shape(), &[3, 16, 16]);
        // One 4x4 block per entity
        let red: f32 = rgb.index_axis(ndarray::Axis(0), 0).sum();
        let green: f32 = rgb.index_axis(ndarray::Axis(0), 1).sum();
        assert_eq!(red, 16.0 * 255.0);
        assert_eq!(green, 16.0 * 255.0);
        assert!(rgb.iter().all(|&v| v == 0.0 || v == 255.0));
    }

    #[test]
    fn test_reaching_goal_terminates() {
        let mut env = PixelGrid::new(3, 24, 50).unwrap();
        env.reset(Some(0)).unwrap();
        env.agent = (0, 0);
        env.goal = (1, 0);
        let result = env.step(&ArrayD::from_elem(IxDyn(&[1]), 4.0)).unwrap();
        assert!(result.terminated);
        assert_eq!(result.reward, 1.0);
    }

    #[test]
    fn test_walls_clamp_movement() {
        let mut env = PixelGrid::new(3, 24, 50).unwrap();
        env.reset(Some(0)).unwrap();
        env.agent = (0, 0);
        env.goal = (2, 2);
        env.step(&ArrayD::from_elem(IxDyn(&[1]), 3.0)).unwrap();
        assert_eq!(env.agent, (0, 0));
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(PixelGrid::new(3, 16, 10).is_err());
        let mut env = PixelGrid::new(4, 16, 10).unwrap();
        env.reset(None).unwrap();
        assert!(env.step(&ArrayD::from_elem(IxDyn(&[1]), 9.0)).is_err());
    }
}
