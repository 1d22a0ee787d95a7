//! Discrete space `{0, 1, ..., n-1}`

use super::Space;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrete {
    pub n: usize,
    shape: Vec<usize>,
}

impl Discrete {
    pub fn new(n: usize) -> Self {
        assert!(n > 0, "Discrete space must have at least 1 element");
        Self { n, shape: vec![1] }
    }

    /// One-hot row for `index`; out of range indices give all zeros.
    pub fn one_hot(&self, index: usize) -> Vec<f32> {
        let mut row = vec![0.0; self.n];
        if let Some(slot) = row.get_mut(index) {
            *slot = 1.0;
        }
        row
    }
}

impl Space for Discrete {
    type Sample = usize;

    fn sample<R: Rng>(&self, rng: &mut R) -> usize {
        rng.gen_range(0..self.n)
    }

    fn contains(&self, value: &usize) -> bool {
        *value < self.n
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn num_elements(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_samples_stay_in_range() {
        let space = Discrete::new(6);
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        assert!((0..200).all(|_| space.contains(&space.sample(&mut rng))));
        assert!(!space.contains(&6));
    }

    #[test]
    fn test_one_hot() {
        let space = Discrete::new(3);
        assert_eq!(space.one_hot(1), vec![0.0, 1.0, 0.0]);
        assert_eq!(space.one_hot(9), vec![0.0; 3]);
    }
}
