//! Product of independent discrete dimensions

use super::Space;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Dimension `i` takes values in `{0, ..., nvec[i]-1}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiDiscrete {
    pub nvec: Vec<usize>,
    shape: Vec<usize>,
}

impl MultiDiscrete {
    pub fn new(nvec: Vec<usize>) -> Self {
        assert!(
            !nvec.is_empty() && nvec.iter().all(|&n| n > 0),
            "MultiDiscrete needs at least one non-empty dimension"
        );
        let shape = vec![nvec.len()];
        Self { nvec, shape }
    }

    pub fn ndim(&self) -> usize {
        self.nvec.len()
    }

    /// Start of each dimension's block inside a concatenated one-hot vector.
    pub fn offsets(&self) -> Vec<usize> {
        self.nvec
            .iter()
            .scan(0, |acc, &n| {
                let start = *acc;
                *acc += n;
                Some(start)
            })
            .collect()
    }
}

impl Space for MultiDiscrete {
    type Sample = Vec<usize>;

    fn sample<R: Rng>(&self, rng: &mut R) -> Vec<usize> {
        self.nvec.iter().map(|&n| rng.gen_range(0..n)).collect()
    }

    fn contains(&self, value: &Vec<usize>) -> bool {
        value.len() == self.nvec.len() && value.iter().zip(&self.nvec).all(|(&v, &n)| v < n)
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn num_elements(&self) -> usize {
        self.nvec.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_sample_and_contains() {
        let space = MultiDiscrete::new(vec![3, 4, 5]);
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        for _ in 0..100 {
            assert!(space.contains(&space.sample(&mut rng)));
        }
        assert!(!space.contains(&vec![0, 4, 0]));
        assert!(!space.contains(&vec![0]));
    }

    #[test]
    fn test_offsets() {
        let space = MultiDiscrete::new(vec![2, 3, 4]);
        assert_eq!(space.ndim(), 3);
        assert_eq!(space.offsets(), vec![0, 2, 5]);
    }
}
