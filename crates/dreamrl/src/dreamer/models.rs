//! Observation encoders/decoders and dense heads.

use super::config::DreamerConfig;
use super::distributions::symlog;
use crate::{DreamError, Result};
use std::collections::BTreeMap;
use tch::{nn, Tensor};

/// Key to tensor with a single leading batch dimension.
pub type TensorDict = BTreeMap<String, Tensor>;

/// Maps observations `[N, ...]` to embeddings `[N, output_dim]`.
///
/// Image keys arrive scaled to `[-0.5, 0.5]`, vector keys raw.
pub trait ObservationEncoder: Send + std::fmt::Debug {
    fn encode(&self, obs: &TensorDict) -> Result<Tensor>;
    fn output_dim(&self) -> i64;
}

/// Maps latent features `[N, latent]` to one reconstruction per decoder key,
/// images as `[N, C, H, W]` in the encoder's scale, vectors `[N, D]` in
/// symlog space.
pub trait ObservationDecoder: Send + std::fmt::Debug {
    fn decode(&self, latent: &Tensor) -> TensorDict;
}

fn take<'a>(obs: &'a TensorDict, key: &str) -> Result<&'a Tensor> {
    obs.get(key)
        .ok_or_else(|| DreamError::MissingKey(key.to_string()))
}

/// `layers` x (Linear, LayerNorm, SiLU).
fn dense_layers(p: &nn::Path, in_dim: i64, units: i64, layers: usize) -> nn::Sequential {
    let mut seq = nn::seq();
    let mut cur_in = in_dim;
    for i in 0..layers {
        seq = seq
            .add(nn::linear(
                p / format!("l{i}"),
                cur_in,
                units,
                nn::LinearConfig {
                    bias: false,
                    ..Default::default()
                },
            ))
            .add(nn::layer_norm(p / format!("n{i}"), vec![units], Default::default()))
            .add_fn(|xs| xs.silu());
        cur_in = units;
    }
    seq
}

/// Dense network with a linear output layer (reward, continue, critic).
#[derive(Debug)]
pub struct DenseHead {
    seq: nn::Sequential,
}

impl DenseHead {
    pub fn new(p: &nn::Path, in_dim: i64, out_dim: i64, layers: usize, units: i64) -> Self {
        let body_out = if layers == 0 { in_dim } else { units };
        let seq = dense_layers(p, in_dim, units, layers).add(nn::linear(
            p / "out",
            body_out,
            out_dim,
            Default::default(),
        ));
        Self { seq }
    }

    pub fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.seq)
    }
}

/// LayerNorm over the channel dimension of `[N, C, H, W]`.
#[derive(Debug)]
struct LayerNorm2d {
    ln: nn::LayerNorm,
}

impl LayerNorm2d {
    fn new(p: nn::Path, dim: i64) -> Self {
        Self {
            ln: nn::layer_norm(p, vec![dim], Default::default()),
        }
    }
}

impl nn::Module for LayerNorm2d {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.permute([0, 2, 3, 1])
            .apply(&self.ln)
            .permute([0, 3, 1, 2])
    }
}

fn halving_conv() -> nn::ConvConfig {
    nn::ConvConfig {
        stride: 2,
        padding: 1,
        bias: false,
        ..Default::default()
    }
}

fn doubling_conv(bias: bool) -> nn::ConvTransposeConfig {
    nn::ConvTransposeConfig {
        stride: 2,
        padding: 1,
        bias,
        ..Default::default()
    }
}

/// Number of stride-2 stages from `side` down to 4x4.
fn cnn_stages(side: i64) -> usize {
    (side / 4).max(1).trailing_zeros() as usize
}

fn stage_channels(multiplier: i64, stage: usize) -> i64 {
    multiplier << stage
}

/// Stacks all image keys on the channel axis and halves the resolution
/// down to 4x4.
#[derive(Debug)]
pub struct CnnEncoder {
    keys: Vec<String>,
    seq: nn::Sequential,
    output_dim: i64,
}

impl CnnEncoder {
    pub fn new(p: &nn::Path, config: &DreamerConfig) -> Self {
        let in_channels: i64 = config.cnn_encoder.iter().map(|(_, s)| s[0]).sum();
        let side = config.cnn_encoder.first().map_or(64, |(_, s)| s[1]);
        let stages = cnn_stages(side);

        let mut seq = nn::seq();
        let mut c_in = in_channels;
        for i in 0..stages {
            let c_out = stage_channels(config.cnn_multiplier, i);
            seq = seq
                .add(nn::conv2d(p / format!("c{i}"), c_in, c_out, 4, halving_conv()))
                .add(LayerNorm2d::new(p / format!("n{i}"), c_out))
                .add_fn(|xs| xs.silu());
            c_in = c_out;
        }
        let final_side = side >> stages;
        Self {
            keys: config.cnn_encoder.iter().map(|(k, _)| k.clone()).collect(),
            seq,
            output_dim: c_in * final_side * final_side,
        }
    }

    fn forward(&self, obs: &TensorDict) -> Result<Tensor> {
        let images = self
            .keys
            .iter()
            .map(|k| take(obs, k))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&images, 1).apply(&self.seq).flatten(1, -1))
    }
}

/// Symlog-squashed vector keys through a dense network.
#[derive(Debug)]
pub struct MlpEncoder {
    keys: Vec<String>,
    seq: nn::Sequential,
    output_dim: i64,
}

impl MlpEncoder {
    pub fn new(p: &nn::Path, config: &DreamerConfig) -> Self {
        let in_dim: i64 = config.mlp_encoder.iter().map(|(_, d)| d).sum();
        let layers = config.mlp_layers.max(1);
        Self {
            keys: config.mlp_encoder.iter().map(|(k, _)| k.clone()).collect(),
            seq: dense_layers(p, in_dim, config.dense_units, layers),
            output_dim: config.dense_units,
        }
    }

    fn forward(&self, obs: &TensorDict) -> Result<Tensor> {
        let vectors = self
            .keys
            .iter()
            .map(|k| Ok(symlog(&take(obs, k)?.flatten(1, -1))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&vectors, -1).apply(&self.seq))
    }
}

/// Image and vector encoders side by side; embeddings are concatenated.
#[derive(Debug)]
pub struct MultiEncoder {
    cnn: Option<CnnEncoder>,
    mlp: Option<MlpEncoder>,
}

impl MultiEncoder {
    pub fn new(p: &nn::Path, config: &DreamerConfig) -> Self {
        Self {
            cnn: (!config.cnn_encoder.is_empty()).then(|| CnnEncoder::new(&(p / "cnn"), config)),
            mlp: (!config.mlp_encoder.is_empty()).then(|| MlpEncoder::new(&(p / "mlp"), config)),
        }
    }
}

impl ObservationEncoder for MultiEncoder {
    fn encode(&self, obs: &TensorDict) -> Result<Tensor> {
        let mut parts = Vec::with_capacity(2);
        if let Some(cnn) = &self.cnn {
            parts.push(cnn.forward(obs)?);
        }
        if let Some(mlp) = &self.mlp {
            parts.push(mlp.forward(obs)?);
        }
        Ok(Tensor::cat(&parts, -1))
    }

    fn output_dim(&self) -> i64 {
        self.cnn.as_ref().map_or(0, |c| c.output_dim) + self.mlp.as_ref().map_or(0, |m| m.output_dim)
    }
}

/// Mirror of [`CnnEncoder`]: project to 4x4 and double up to full size.
#[derive(Debug)]
pub struct CnnDecoder {
    keys: Vec<String>,
    channels: Vec<i64>,
    linear: nn::Linear,
    seq: nn::Sequential,
    start_channels: i64,
}

impl CnnDecoder {
    pub fn new(p: &nn::Path, config: &DreamerConfig) -> Self {
        let shapes: BTreeMap<&str, [i64; 3]> = config
            .cnn_encoder
            .iter()
            .map(|(k, s)| (k.as_str(), *s))
            .collect();
        let channels: Vec<i64> = config
            .cnn_decoder
            .iter()
            .map(|k| shapes.get(k.as_str()).map_or(3, |s| s[0]))
            .collect();
        let side = config.cnn_encoder.first().map_or(64, |(_, s)| s[1]);
        let stages = cnn_stages(side);
        let start_channels = stage_channels(config.cnn_multiplier, stages.saturating_sub(1));

        let linear = nn::linear(
            p / "lin",
            config.latent_size(),
            start_channels * 16,
            Default::default(),
        );
        let mut seq = nn::seq();
        let mut c_in = start_channels;
        for i in (0..stages).rev() {
            if i == 0 {
                let c_out = channels.iter().sum();
                seq = seq.add(nn::conv_transpose2d(p / format!("d{i}"), c_in, c_out, 4, doubling_conv(true)));
            } else {
                let c_out = stage_channels(config.cnn_multiplier, i - 1);
                seq = seq
                    .add(nn::conv_transpose2d(p / format!("d{i}"), c_in, c_out, 4, doubling_conv(false)))
                    .add(LayerNorm2d::new(p / format!("n{i}"), c_out))
                    .add_fn(|xs| xs.silu());
                c_in = c_out;
            }
        }
        Self {
            keys: config.cnn_decoder.clone(),
            channels,
            linear,
            seq,
            start_channels,
        }
    }

    fn forward(&self, latent: &Tensor, out: &mut TensorDict) {
        let x = latent
            .apply(&self.linear)
            .reshape([-1, self.start_channels, 4, 4])
            .apply(&self.seq);
        for (key, part) in self.keys.iter().zip(x.split_with_sizes(self.channels.as_slice(), 1)) {
            out.insert(key.clone(), part);
        }
    }
}

#[derive(Debug)]
pub struct MlpDecoder {
    keys: Vec<String>,
    body: nn::Sequential,
    heads: Vec<nn::Linear>,
}

impl MlpDecoder {
    pub fn new(p: &nn::Path, config: &DreamerConfig) -> Self {
        let dims: BTreeMap<&str, i64> = config
            .mlp_encoder
            .iter()
            .map(|(k, d)| (k.as_str(), *d))
            .collect();
        let layers = config.mlp_layers.max(1);
        let heads = config
            .mlp_decoder
            .iter()
            .map(|k| {
                let dim = dims.get(k.as_str()).copied().unwrap_or(1);
                nn::linear(p / format!("head_{k}"), config.dense_units, dim, Default::default())
            })
            .collect();
        Self {
            keys: config.mlp_decoder.clone(),
            body: dense_layers(p, config.latent_size(), config.dense_units, layers),
            heads,
        }
    }

    fn forward(&self, latent: &Tensor, out: &mut TensorDict) {
        let h = latent.apply(&self.body);
        for (key, head) in self.keys.iter().zip(&self.heads) {
            out.insert(key.clone(), h.apply(head));
        }
    }
}

#[derive(Debug)]
pub struct MultiDecoder {
    cnn: Option<CnnDecoder>,
    mlp: Option<MlpDecoder>,
}

impl MultiDecoder {
    pub fn new(p: &nn::Path, config: &DreamerConfig) -> Self {
        Self {
            cnn: (!config.cnn_decoder.is_empty()).then(|| CnnDecoder::new(&(p / "cnn"), config)),
            mlp: (!config.mlp_decoder.is_empty()).then(|| MlpDecoder::new(&(p / "mlp"), config)),
        }
    }
}

impl ObservationDecoder for MultiDecoder {
    fn decode(&self, latent: &Tensor) -> TensorDict {
        let mut out = TensorDict::new();
        if let Some(cnn) = &self.cnn {
            cnn.forward(latent, &mut out);
        }
        if let Some(mlp) = &self.mlp {
            mlp.forward(latent, &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dreamer::tests::{tiny_config, tiny_pixel_config};
    use tch::{Device, Kind};

    #[test]
    fn test_cnn_stages() {
        assert_eq!(cnn_stages(64), 4);
        assert_eq!(cnn_stages(16), 2);
        assert_eq!(cnn_stages(8), 1);
    }

    #[test]
    fn test_encoder_decoder_shapes() {
        let config = tiny_pixel_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let encoder = MultiEncoder::new(&(&vs.root() / "encoder"), &config);
        let decoder = MultiDecoder::new(&(&vs.root() / "decoder"), &config);

        let mut obs = TensorDict::new();
        obs.insert("rgb".into(), Tensor::zeros([5, 3, 16, 16], (Kind::Float, Device::Cpu)));
        obs.insert("state".into(), Tensor::ones([5, 3], (Kind::Float, Device::Cpu)));
        let embedded = encoder.encode(&obs).unwrap();
        // 8 channels at 4x4 from the image plus the dense units
        assert_eq!(encoder.output_dim(), 8 * 16 + 32);
        assert_eq!(embedded.size(), vec![5, encoder.output_dim()]);

        let latent = Tensor::zeros([5, config.latent_size()], (Kind::Float, Device::Cpu));
        let out = decoder.decode(&latent);
        assert_eq!(out["rgb"].size(), vec![5, 3, 16, 16]);
        assert_eq!(out["state"].size(), vec![5, 3]);
    }

    #[test]
    fn test_missing_key() {
        let config = tiny_config(false);
        let vs = nn::VarStore::new(Device::Cpu);
        let encoder = MultiEncoder::new(&vs.root(), &config);
        let err = encoder.encode(&TensorDict::new()).unwrap_err();
        assert!(matches!(err, DreamError::MissingKey(k) if k == "state"));
    }
}
