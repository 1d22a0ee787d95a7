//! Observation and action space types.
//!
//! Spaces describe what an environment emits and accepts. The world model
//! consumes actions in an *encoded* form: continuous actions are flattened,
//! discrete actions become one one-hot block per dimension. `DynSpace`
//! converts between the environment form and the encoded form.

mod r#box;
mod dict;
mod discrete;
mod multi_discrete;

pub use dict::Dict;
pub use discrete::Discrete;
pub use multi_discrete::MultiDiscrete;
pub use r#box::Box;

use crate::{DreamError, Result};
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Trait for observation and action spaces
pub trait Space: Clone + Send + Sync {
    /// The type of samples from this space
    type Sample;

    /// Sample a random element from this space
    fn sample<R: Rng>(&self, rng: &mut R) -> Self::Sample;

    /// Check if a value is contained in this space
    fn contains(&self, value: &Self::Sample) -> bool;

    /// Get the shape of samples from this space
    fn shape(&self) -> &[usize];

    /// Get the total number of elements in a sample
    fn num_elements(&self) -> usize {
        self.shape().iter().product()
    }
}

/// Enum for dynamic space types
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DynSpace {
    Discrete(Discrete),
    MultiDiscrete(MultiDiscrete),
    Box(Box),
    Dict(Dict),
}

impl DynSpace {
    /// Get the shape of this space
    pub fn shape(&self) -> Vec<usize> {
        match self {
            DynSpace::Discrete(s) => s.shape().to_vec(),
            DynSpace::MultiDiscrete(s) => s.shape().to_vec(),
            DynSpace::Box(s) => s.shape().to_vec(),
            DynSpace::Dict(s) => s.shape().to_vec(),
        }
    }

    /// Whether actions from this space are continuous
    pub fn is_continuous(&self) -> bool {
        matches!(self, DynSpace::Box(_))
    }

    /// Per-head action sizes: one entry for a continuous box, one entry
    /// per discrete dimension otherwise.
    pub fn actions_dim(&self) -> Vec<usize> {
        match self {
            DynSpace::Discrete(s) => vec![s.n],
            DynSpace::MultiDiscrete(s) => s.nvec.clone(),
            DynSpace::Box(s) => vec![s.num_elements()],
            DynSpace::Dict(_) => Vec::new(),
        }
    }

    /// Width of an encoded action vector
    pub fn encoded_dim(&self) -> usize {
        self.actions_dim().iter().sum()
    }

    /// Sample an action in environment form
    pub fn sample<R: Rng>(&self, rng: &mut R) -> ArrayD<f32> {
        match self {
            DynSpace::Discrete(s) => ArrayD::from_elem(IxDyn(&[1]), s.sample(rng) as f32),
            DynSpace::MultiDiscrete(s) => {
                let v: Vec<f32> = s.sample(rng).into_iter().map(|x| x as f32).collect();
                ArrayD::from_shape_vec(IxDyn(&[v.len()]), v)
                    .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[0])))
            }
            DynSpace::Box(s) => s.sample(rng),
            DynSpace::Dict(s) => {
                let flattened: Vec<f32> = s
                    .sample(rng)
                    .into_values()
                    .flat_map(|v| v.into_iter())
                    .collect();
                let len = flattened.len();
                ArrayD::from_shape_vec(IxDyn(&[len]), flattened)
                    .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[0])))
            }
        }
    }

    /// Check if this space contains the value
    pub fn contains(&self, value: &ArrayD<f32>) -> bool {
        match self {
            DynSpace::Discrete(s) => match value.iter().next() {
                Some(v) if value.len() == 1 => s.contains(&(v.round() as usize)),
                _ => false,
            },
            DynSpace::MultiDiscrete(s) => {
                if value.len() != s.nvec.len() {
                    return false;
                }
                let v: Vec<usize> = value.iter().map(|&x| x.round() as usize).collect();
                s.contains(&v)
            }
            DynSpace::Box(s) => s.contains(value),
            DynSpace::Dict(_) => false,
        }
    }

    /// Encode an environment action into the flat form stored in the buffer.
    pub fn encode_action(&self, action: &ArrayD<f32>) -> Result<Vec<f32>> {
        match self {
            DynSpace::Box(_) => Ok(action.iter().copied().collect()),
            DynSpace::Discrete(_) | DynSpace::MultiDiscrete(_) => {
                let dims = self.actions_dim();
                if action.len() != dims.len() {
                    return Err(DreamError::ShapeMismatch {
                        key: "actions".into(),
                        expected: vec![dims.len()],
                        actual: action.shape().to_vec(),
                    });
                }
                let mut encoded = vec![0.0; dims.iter().sum()];
                let mut offset = 0;
                for (&a, &n) in action.iter().zip(dims.iter()) {
                    let idx = a.round().clamp(0.0, (n - 1) as f32) as usize;
                    encoded[offset + idx] = 1.0;
                    offset += n;
                }
                Ok(encoded)
            }
            DynSpace::Dict(_) => Err(DreamError::Configuration(
                "dict action spaces are not supported".into(),
            )),
        }
    }

    /// Decode a flat encoded action back into environment form.
    ///
    /// Discrete blocks are decoded with an argmax, so soft encodings are
    /// accepted as well.
    pub fn decode_action(&self, encoded: &[f32]) -> Result<ArrayD<f32>> {
        let expected = self.encoded_dim();
        if encoded.len() != expected {
            return Err(DreamError::ShapeMismatch {
                key: "actions".into(),
                expected: vec![expected],
                actual: vec![encoded.len()],
            });
        }
        match self {
            DynSpace::Box(b) => ArrayD::from_shape_vec(IxDyn(b.shape()), encoded.to_vec())
                .map_err(|e| DreamError::Env(e.to_string())),
            DynSpace::Discrete(_) | DynSpace::MultiDiscrete(_) => {
                let mut out = Vec::new();
                let mut offset = 0;
                for n in self.actions_dim() {
                    let block = &encoded[offset..offset + n];
                    let arg = block
                        .iter()
                        .enumerate()
                        .fold((0usize, f32::NEG_INFINITY), |best, (i, &v)| {
                            if v > best.1 {
                                (i, v)
                            } else {
                                best
                            }
                        })
                        .0;
                    out.push(arg as f32);
                    offset += n;
                }
                let len = out.len();
                ArrayD::from_shape_vec(IxDyn(&[len]), out)
                    .map_err(|e| DreamError::Env(e.to_string()))
            }
            DynSpace::Dict(_) => Err(DreamError::Configuration(
                "dict action spaces are not supported".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_discrete_encode_decode() {
        let space = DynSpace::Discrete(Discrete::new(4));
        let action = ArrayD::from_elem(IxDyn(&[1]), 2.0);
        let encoded = space.encode_action(&action).unwrap();
        assert_eq!(encoded, vec![0.0, 0.0, 1.0, 0.0]);
        assert_eq!(space.decode_action(&encoded).unwrap(), action);
    }

    #[test]
    fn test_multi_discrete_encoding_layout() {
        let space = DynSpace::MultiDiscrete(MultiDiscrete::new(vec![2, 3]));
        assert_eq!(space.actions_dim(), vec![2, 3]);
        assert_eq!(space.encoded_dim(), 5);

        let action = ArrayD::from_shape_vec(IxDyn(&[2]), vec![1.0, 0.0]).unwrap();
        let encoded = space.encode_action(&action).unwrap();
        assert_eq!(encoded, vec![0.0, 1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_decode_soft_encoding_uses_argmax() {
        let space = DynSpace::Discrete(Discrete::new(3));
        let decoded = space.decode_action(&[0.1, 0.7, 0.2]).unwrap();
        assert_eq!(decoded[[0]], 1.0);
    }

    #[test]
    fn test_box_encoding_is_flat() {
        let space = DynSpace::Box(Box::symmetric(&[2]));
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let action = space.sample(&mut rng);
        let encoded = space.encode_action(&action).unwrap();
        assert_eq!(encoded.len(), 2);
        assert!(space.contains(&space.decode_action(&encoded).unwrap()));
    }

    #[test]
    fn test_decode_rejects_wrong_width() {
        let space = DynSpace::Discrete(Discrete::new(3));
        assert!(space.decode_action(&[1.0, 0.0]).is_err());
    }
}
