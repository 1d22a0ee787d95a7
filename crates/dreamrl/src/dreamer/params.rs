//! Moving parameters between `VarStore`s, flat vectors and ndarrays.

use crate::{DreamError, Result};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use tch::{nn, Device, Kind, Tensor};

pub(crate) fn tensor_to_vec(tensor: &Tensor) -> Result<Vec<f32>> {
    let flat = tensor
        .detach()
        .to_device(Device::Cpu)
        .to_kind(Kind::Float)
        .reshape([-1]);
    Ok(Vec::<f32>::try_from(flat)?)
}

pub(crate) fn vec_to_tensor(values: &[f32], shape: &[i64], device: Device) -> Result<Tensor> {
    let expected: i64 = shape.iter().product();
    if values.len() as i64 != expected {
        return Err(DreamError::ShapeMismatch {
            key: "tensor".into(),
            expected: shape.iter().map(|&d| d as usize).collect(),
            actual: vec![values.len()],
        });
    }
    Ok(Tensor::from_slice(values).reshape(shape).to_device(device))
}

pub fn array_to_tensor(array: &ArrayD<f32>, device: Device) -> Tensor {
    let shape: Vec<i64> = array.shape().iter().map(|&d| d as i64).collect();
    let data: Vec<f32> = array.iter().copied().collect();
    Tensor::from_slice(&data).reshape(shape.as_slice()).to_device(device)
}

pub fn tensor_to_array(tensor: &Tensor) -> Result<ArrayD<f32>> {
    let shape: Vec<usize> = tensor.size().iter().map(|&d| d as usize).collect();
    let data = tensor_to_vec(tensor)?;
    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| DreamError::Serialization(e.to_string()))
}

/// Variables sorted by name, optionally restricted to top-level modules.
fn variables(vs: &nn::VarStore, modules: &[&str]) -> Vec<(String, Tensor)> {
    let mut vars: Vec<(String, Tensor)> = vs
        .variables()
        .into_iter()
        .filter(|(name, _)| {
            modules.is_empty() || name.split('.').next().is_some_and(|m| modules.contains(&m))
        })
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

pub fn parameter_count(vs: &nn::VarStore, modules: &[&str]) -> usize {
    variables(vs, modules).iter().map(|(_, t)| t.numel()).sum()
}

/// Concatenate the selected variables into one vector, in name order.
pub fn flatten_parameters(vs: &nn::VarStore, modules: &[&str]) -> Result<Vec<f32>> {
    let mut flat = Vec::with_capacity(parameter_count(vs, modules));
    for (_, var) in variables(vs, modules) {
        flat.extend(tensor_to_vec(&var)?);
    }
    Ok(flat)
}

/// Inverse of [`flatten_parameters`]; `values` must match exactly.
pub fn load_flat_parameters(vs: &nn::VarStore, modules: &[&str], values: &[f32]) -> Result<()> {
    let expected = parameter_count(vs, modules);
    if values.len() != expected {
        return Err(DreamError::ShapeMismatch {
            key: "params".into(),
            expected: vec![expected],
            actual: vec![values.len()],
        });
    }
    let mut offset = 0;
    for (_, mut var) in variables(vs, modules) {
        let n = var.numel();
        let src = vec_to_tensor(&values[offset..offset + n], &var.size(), var.device())?;
        tch::no_grad(|| var.copy_(&src));
        offset += n;
    }
    Ok(())
}

/// `target = tau * source + (1 - tau) * target` for stores of the same
/// layout. `tau == 1` is an exact copy.
pub fn soft_update(source: &nn::VarStore, target: &nn::VarStore, tau: f64) -> Result<()> {
    let sources = source.variables();
    for (name, mut dst) in target.variables() {
        let src = sources.get(&name).ok_or_else(|| DreamError::MissingKey(name.clone()))?;
        tch::no_grad(|| {
            if tau >= 1.0 {
                dst.copy_(src);
            } else {
                let blended = src * tau + &dst * (1.0 - tau);
                dst.copy_(&blended);
            }
        });
    }
    Ok(())
}

/// Named tensor values of a store, for checkpoints.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub tensors: Vec<(String, Vec<i64>, Vec<f32>)>,
}

impl StoreSnapshot {
    pub fn capture(vs: &nn::VarStore) -> Result<Self> {
        let tensors = variables(vs, &[])
            .into_iter()
            .map(|(name, t)| Ok((name, t.size(), tensor_to_vec(&t)?)))
            .collect::<Result<_>>()?;
        Ok(Self { tensors })
    }

    pub fn restore(&self, vs: &nn::VarStore) -> Result<()> {
        let mut vars = vs.variables();
        for (name, shape, values) in &self.tensors {
            let var = vars.get_mut(name).ok_or_else(|| DreamError::MissingKey(name.clone()))?;
            if var.size() != *shape {
                return Err(DreamError::ShapeMismatch {
                    key: name.clone(),
                    expected: var.size().iter().map(|&d| d as usize).collect(),
                    actual: shape.iter().map(|&d| d as usize).collect(),
                });
            }
            let src = vec_to_tensor(values, shape, var.device())?;
            tch::no_grad(|| var.copy_(&src));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(seed: i64) -> nn::VarStore {
        tch::manual_seed(seed);
        let vs = nn::VarStore::new(Device::Cpu);
        let _ = nn::linear(&vs.root() / "encoder", 3, 2, Default::default());
        let _ = nn::linear(&vs.root() / "decoder", 2, 3, Default::default());
        vs
    }

    fn max_diff(a: &nn::VarStore, b: &nn::VarStore) -> f64 {
        let b_vars = b.variables();
        a.variables()
            .iter()
            .map(|(name, t)| (t - &b_vars[name]).abs().max().double_value(&[]))
            .fold(0.0, f64::max)
    }

    #[test]
    fn test_tau_one_is_exact_copy() {
        let source = store(1);
        let target = store(2);
        assert!(max_diff(&source, &target) > 0.0);
        soft_update(&source, &target, 1.0).unwrap();
        assert_eq!(max_diff(&source, &target), 0.0);
    }

    #[test]
    fn test_soft_update_blends() {
        let source = store(1);
        let target = store(2);
        let before = flatten_parameters(&target, &[]).unwrap();
        let src = flatten_parameters(&source, &[]).unwrap();
        soft_update(&source, &target, 0.25).unwrap();
        let after = flatten_parameters(&target, &[]).unwrap();
        for ((a, s), b) in after.iter().zip(&src).zip(&before) {
            assert!((a - (0.25 * s + 0.75 * b)).abs() < 1e-6);
        }
    }

    #[test]
    fn test_flat_parameters_by_module() {
        let source = store(1);
        let target = store(2);
        let encoder = flatten_parameters(&source, &["encoder"]).unwrap();
        assert_eq!(encoder.len(), 3 * 2 + 2);
        load_flat_parameters(&target, &["encoder"], &encoder).unwrap();
        assert_eq!(flatten_parameters(&target, &["encoder"]).unwrap(), encoder);
        assert_ne!(
            flatten_parameters(&target, &["decoder"]).unwrap(),
            flatten_parameters(&source, &["decoder"]).unwrap()
        );

        let err = load_flat_parameters(&target, &["encoder"], &encoder[1..]).unwrap_err();
        assert!(matches!(err, DreamError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_snapshot_restore() {
        let source = store(1);
        let target = store(2);
        StoreSnapshot::capture(&source).unwrap().restore(&target).unwrap();
        assert_eq!(max_diff(&source, &target), 0.0);
    }

    #[test]
    fn test_array_roundtrip_keeps_shape() {
        let array = ArrayD::from_shape_vec(IxDyn(&[2, 3]), (0..6).map(|x| x as f32).collect()).unwrap();
        let tensor = array_to_tensor(&array, Device::Cpu);
        assert_eq!(tensor.size(), vec![2, 3]);
        assert_eq!(tensor_to_array(&tensor).unwrap(), array);
    }
}
