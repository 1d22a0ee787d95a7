//! Dict space describing a multi-key observation

use super::{DynSpace, Space};
use crate::{DreamError, Result};
use ndarray::ArrayD;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named sub-spaces, kept in key order so every rank iterates them
/// identically.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Dict {
    pub spaces: BTreeMap<String, DynSpace>,
    shape: Vec<usize>,
}

impl Dict {
    pub fn new(spaces: BTreeMap<String, DynSpace>) -> Self {
        let total: usize = spaces
            .values()
            .map(|s| s.shape().iter().product::<usize>())
            .sum();
        Self {
            spaces,
            shape: vec![total],
        }
    }

    pub fn from_pairs(pairs: Vec<(&str, DynSpace)>) -> Self {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    pub fn get(&self, name: &str) -> Option<&DynSpace> {
        self.spaces.get(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.spaces.keys()
    }

    /// Keys whose space is an image box (`[C, H, W]`).
    pub fn image_keys(&self) -> Vec<String> {
        self.spaces
            .iter()
            .filter(|(_, s)| matches!(s, DynSpace::Box(b) if b.is_image()))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Keys whose space is a flat vector.
    pub fn vector_keys(&self) -> Vec<String> {
        self.spaces
            .iter()
            .filter(|(_, s)| !matches!(s, DynSpace::Box(b) if b.is_image()))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Shape of a single key, or `MissingKey`.
    pub fn key_shape(&self, key: &str) -> Result<Vec<usize>> {
        self.spaces
            .get(key)
            .map(|s| s.shape())
            .ok_or_else(|| DreamError::MissingKey(key.to_string()))
    }
}

impl Space for Dict {
    type Sample = BTreeMap<String, ArrayD<f32>>;

    fn sample<R: Rng>(&self, rng: &mut R) -> Self::Sample {
        self.spaces
            .iter()
            .map(|(k, v)| (k.clone(), v.sample(rng)))
            .collect()
    }

    fn contains(&self, value: &Self::Sample) -> bool {
        value.len() == self.spaces.len()
            && self.spaces.iter().all(|(k, space)| {
                value
                    .get(k)
                    .map(|v| v.shape() == space.shape().as_slice())
                    .unwrap_or(false)
            })
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spaces::Box as BoxSpace;
    use rand::SeedableRng;

    fn observation_space() -> Dict {
        Dict::from_pairs(vec![
            ("rgb", DynSpace::Box(BoxSpace::image(3, 64, 64))),
            ("state", DynSpace::Box(BoxSpace::symmetric(&[4]))),
        ])
    }

    #[test]
    fn test_key_partition() {
        let dict = observation_space();
        assert_eq!(dict.image_keys(), vec!["rgb".to_string()]);
        assert_eq!(dict.vector_keys(), vec!["state".to_string()]);
        assert_eq!(dict.key_shape("state").unwrap(), vec![4]);
        assert!(matches!(dict.key_shape("depth"), Err(DreamError::MissingKey(_))));
    }

    #[test]
    fn test_sample_is_contained() {
        let dict = observation_space();
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let sample = dict.sample(&mut rng);
        assert!(dict.contains(&sample));

        let mut partial = sample.clone();
        partial.remove("rgb");
        assert!(!dict.contains(&partial));
    }
}
