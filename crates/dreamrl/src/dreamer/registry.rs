//! Name-to-factory table for observation models, resolved once per agent.

use super::agent::{DECODER, ENCODER};
use super::config::DreamerConfig;
use super::models::{MultiDecoder, MultiEncoder, ObservationDecoder, ObservationEncoder};
use crate::{DreamError, Result};
use std::collections::BTreeMap;
use tch::nn;

pub struct ObservationModels {
    pub encoder: Box<dyn ObservationEncoder>,
    pub decoder: Box<dyn ObservationDecoder>,
}

/// Builds the encoder under `p / "encoder"` and the decoder under
/// `p / "decoder"`.
pub type ModelFactory =
    Box<dyn Fn(&nn::Path, &DreamerConfig) -> Result<ObservationModels> + Send + Sync>;

#[derive(Default)]
pub struct ModelRegistry {
    factories: BTreeMap<String, ModelFactory>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `"standard"` convolutional/dense models.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            "standard",
            Box::new(|p: &nn::Path, config: &DreamerConfig| {
                Ok(ObservationModels {
                    encoder: Box::new(MultiEncoder::new(&(p / ENCODER), config)),
                    decoder: Box::new(MultiDecoder::new(&(p / DECODER), config)),
                })
            }),
        );
        registry
    }

    pub fn register(&mut self, name: &str, factory: ModelFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.factories.keys()
    }

    pub fn build(&self, name: &str, p: &nn::Path, config: &DreamerConfig) -> Result<ObservationModels> {
        let factory = self.factories.get(name).ok_or_else(|| {
            DreamError::Configuration(format!(
                "unknown architecture '{}', available: {}",
                name,
                self.factories.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })?;
        factory(p, config)
    }
}
