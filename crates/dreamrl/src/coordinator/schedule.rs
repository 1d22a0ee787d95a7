//! Exploration decay and target-network sync schedules.

use serde::{Deserialize, Serialize};

/// Polynomial interpolation from `initial` to `final_value` over
/// `max_decay_steps`, held at `final_value` afterwards.
pub fn polynomial_decay(
    current_step: u64,
    initial: f64,
    final_value: f64,
    max_decay_steps: u64,
    power: f64,
) -> f64 {
    if current_step > max_decay_steps || max_decay_steps == 0 || initial == final_value {
        return final_value;
    }
    let remaining = 1.0 - current_step as f64 / max_decay_steps as f64;
    (initial - final_value) * remaining.powf(power) + final_value
}

/// Exploration amount owned by the player, advanced once per training round.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExplorationSchedule {
    pub initial: f64,
    pub min: f64,
    pub decay: bool,
    /// Rounds over which the amount decays
    pub max_decay_steps: u64,
    /// Rounds seen so far; persisted in the player's checkpoint
    pub decay_steps: u64,
    pub amount: f64,
}

impl ExplorationSchedule {
    /// `max_step_expl_decay` is expressed in gradient steps; it is divided by
    /// the gradient steps taken per round across all learners.
    pub fn new(
        initial: f64,
        min: f64,
        decay: bool,
        max_step_expl_decay: u64,
        gradient_steps_per_round: u64,
    ) -> Self {
        Self {
            initial,
            min,
            decay,
            max_decay_steps: max_step_expl_decay / gradient_steps_per_round.max(1),
            decay_steps: 0,
            amount: initial,
        }
    }

    /// Advance after a training round; returns the new amount.
    pub fn step(&mut self) -> f64 {
        if self.decay {
            self.decay_steps += 1;
            self.amount =
                polynomial_decay(self.decay_steps, self.initial, self.min, self.max_decay_steps, 1.0);
        }
        self.amount
    }
}

/// Polyak sync of the target critic every `every` gradient steps.
#[derive(Clone, Copy, Debug)]
pub struct TargetSync {
    pub every: u64,
    pub tau: f64,
}

impl TargetSync {
    pub fn new(every: u64, tau: f64) -> Self {
        Self {
            every: every.max(1),
            tau,
        }
    }

    /// Blend factor to apply before gradient step `step`, if any.
    /// The very first sync copies the source exactly.
    pub fn tau_for(&self, step: u64) -> Option<f64> {
        if step % self.every != 0 {
            None
        } else if step == 0 {
            Some(1.0)
        } else {
            Some(self.tau)
        }
    }
}
