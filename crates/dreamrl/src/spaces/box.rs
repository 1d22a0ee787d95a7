//! Continuous space with per-element bounds.

use super::Space;
use crate::{DreamError, Result};
use ndarray::{ArrayD, IxDyn, Zip};
use rand::Rng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};

/// Bounded continuous values of a fixed shape.
///
/// Image observations are boxes of shape `[C, H, W]` in `[0, 255]`; actions
/// are usually `[-1, 1]` boxes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Box {
    pub low: ArrayD<f32>,
    pub high: ArrayD<f32>,
    shape: Vec<usize>,
}

impl Box {
    /// Panics when the bounds disagree in shape; see [`Box::try_new`].
    pub fn new(low: ArrayD<f32>, high: ArrayD<f32>) -> Self {
        assert_eq!(low.shape(), high.shape(), "low and high must have the same shape");
        let shape = low.shape().to_vec();
        Self { low, high, shape }
    }

    pub fn try_new(low: ArrayD<f32>, high: ArrayD<f32>) -> Result<Self> {
        if low.shape() != high.shape() {
            return Err(DreamError::ShapeMismatch {
                key: "high".into(),
                expected: low.shape().to_vec(),
                actual: high.shape().to_vec(),
            });
        }
        if !Zip::from(&low).and(&high).all(|&l, &h| l <= h) {
            return Err(DreamError::Configuration("box has low > high".into()));
        }
        Ok(Self::new(low, high))
    }

    pub fn uniform(shape: &[usize], low: f32, high: f32) -> Self {
        Self::new(
            ArrayD::from_elem(IxDyn(shape), low),
            ArrayD::from_elem(IxDyn(shape), high),
        )
    }

    pub fn unbounded(shape: &[usize]) -> Self {
        Self::uniform(shape, f32::NEG_INFINITY, f32::INFINITY)
    }

    /// 8-bit image, `[0, 255]`
    pub fn image(channels: usize, height: usize, width: usize) -> Self {
        Self::uniform(&[channels, height, width], 0.0, 255.0)
    }

    /// `[-1, 1]` in every element
    pub fn symmetric(shape: &[usize]) -> Self {
        Self::uniform(shape, -1.0, 1.0)
    }

    /// Three dimensions are treated as `[C, H, W]`.
    pub fn is_image(&self) -> bool {
        self.shape.len() == 3
    }

    /// Clamp `value` element-wise into the bounds.
    pub fn clip(&self, value: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        if value.shape() != self.shape.as_slice() {
            return Err(DreamError::ShapeMismatch {
                key: "action".into(),
                expected: self.shape.clone(),
                actual: value.shape().to_vec(),
            });
        }
        let mut clipped = value.clone();
        Zip::from(&mut clipped)
            .and(&self.low)
            .and(&self.high)
            .for_each(|v, &l, &h| *v = v.clamp(l, h));
        Ok(clipped)
    }
}

/// Sampling range for one element; infinite bounds fall back to `[-1, 1]`.
fn sample_range(low: f32, high: f32) -> (f32, f32) {
    if low.is_finite() && high.is_finite() {
        (low, high)
    } else {
        (-1.0, 1.0)
    }
}

impl Space for Box {
    type Sample = ArrayD<f32>;

    fn sample<R: Rng>(&self, rng: &mut R) -> Self::Sample {
        Zip::from(&self.low).and(&self.high).map_collect(|&l, &h| {
            let (l, h) = sample_range(l, h);
            Uniform::new_inclusive(l, h).sample(rng)
        })
    }

    fn contains(&self, value: &Self::Sample) -> bool {
        value.shape() == self.shape.as_slice()
            && Zip::from(value)
                .and(&self.low)
                .and(&self.high)
                .all(|&v, &l, &h| (l..=h).contains(&v))
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }
}
