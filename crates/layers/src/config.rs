//! Configuration record consumed by [`FeedForward::initialize`].
//!
//! The record is `Deserialize` so an outer model configuration can embed it
//! directly; reading files is left to the caller.
//!
//! [`FeedForward::initialize`]: crate::feed_forward::FeedForward::initialize

use candle_core::{DType, Device};
use serde::{Deserialize, Deserializer};

use crate::{
    checks, dropout,
    error::{FfnError, Result},
    init::WeightInit,
};

/// Selects where parameters live and where the forward pass runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSelector {
    /// Host memory and CPU kernels.
    #[default]
    Cpu,
    /// CUDA device with the given ordinal.
    Cuda(usize),
    /// Metal device with the given ordinal.
    Metal(usize),
}

impl DeviceSelector {
    /// Maps an integer device id: negative ids select the CPU, anything else
    /// the CUDA device with that ordinal.
    pub fn from_dev_id(dev_id: i32) -> Self {
        match usize::try_from(dev_id) {
            Ok(ordinal) => DeviceSelector::Cuda(ordinal),
            Err(_) => DeviceSelector::Cpu,
        }
    }

    /// Opens the device, reporting unavailable ones as configuration errors.
    pub fn resolve(&self) -> Result<Device> {
        let opened = match self {
            DeviceSelector::Cpu => return Ok(Device::Cpu),
            DeviceSelector::Cuda(ordinal) => Device::new_cuda(*ordinal),
            DeviceSelector::Metal(ordinal) => Device::new_metal(*ordinal),
        };
        opened.map_err(|err| FfnError::config(format!("device {self:?} is unavailable: {err}")))
    }
}

/// Hyper-parameters of a position-wise feed-forward layer.
///
/// `model_size` is used for both the input and the output width; the residual
/// connection around the layer depends on that, but the layer itself only
/// propagates shapes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FeedForwardConfig {
    /// Either a selector (`"cpu"`, `{ cuda = 0 }`) or an integer device id.
    #[serde(default, deserialize_with = "deserialize_device")]
    pub device: DeviceSelector,
    pub model_size: usize,
    pub fnn_hidden_size: usize,
    #[serde(default)]
    pub fnn_dropout: f32,
    /// Storage dtype for parameters and outputs.
    #[serde(default = "default_dtype", deserialize_with = "deserialize_dtype")]
    pub dtype: DType,
    #[serde(default)]
    pub weight_init: WeightInit,
    /// Multiplier applied to the fan-in/fan-out spread of both weight matrices.
    #[serde(default = "default_init_scale")]
    pub init_scale: f64,
}

impl FeedForwardConfig {
    /// Creates a CPU, `f32`, Xavier-uniform configuration.
    pub fn new(model_size: usize, fnn_hidden_size: usize, fnn_dropout: f32) -> Self {
        Self {
            device: DeviceSelector::Cpu,
            model_size,
            fnn_hidden_size,
            fnn_dropout,
            dtype: default_dtype(),
            weight_init: WeightInit::default(),
            init_scale: default_init_scale(),
        }
    }

    /// Hidden width derived from `model_size * ratio`, rounded to the nearest integer.
    pub fn with_expansion_ratio(model_size: usize, ratio: f32, fnn_dropout: f32) -> Self {
        let hidden = (model_size as f32 * ratio).round() as usize;
        Self::new(model_size, hidden, fnn_dropout)
    }

    pub fn input_size(&self) -> usize {
        self.model_size
    }

    pub fn output_size(&self) -> usize {
        self.model_size
    }

    /// Checks every field that can be validated without touching a device.
    pub fn validate(&self) -> Result<()> {
        if self.model_size == 0 {
            return Err(FfnError::config("model_size must be greater than zero"));
        }
        if self.fnn_hidden_size == 0 {
            return Err(FfnError::config("fnn_hidden_size must be greater than zero"));
        }
        dropout::validate_probability(self.fnn_dropout)?;
        if !self.init_scale.is_finite() || self.init_scale <= 0.0 {
            return Err(FfnError::config(format!(
                "init_scale must be finite and positive, got {}",
                self.init_scale
            )));
        }
        checks::expect_float_dtype("dtype", self.dtype)
    }
}

fn default_dtype() -> DType {
    DType::F32
}

fn default_init_scale() -> f64 {
    1.0
}

fn deserialize_device<'de, D>(deserializer: D) -> std::result::Result<DeviceSelector, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDevice {
        Id(i32),
        Selector(DeviceSelector),
    }

    Ok(match RawDevice::deserialize(deserializer)? {
        RawDevice::Id(dev_id) => DeviceSelector::from_dev_id(dev_id),
        RawDevice::Selector(selector) => selector,
    })
}

fn deserialize_dtype<'de, D>(deserializer: D) -> std::result::Result<DType, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    match raw.to_ascii_lowercase().as_str() {
        "f32" | "float32" => Ok(DType::F32),
        "f16" | "float16" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        "f64" | "float64" => Ok(DType::F64),
        other => Err(serde::de::Error::custom(format!(
            "unsupported parameter dtype '{other}'"
        ))),
    }
}
