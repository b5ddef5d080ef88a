//! Tensor engine surface consumed by the feed-forward layer.
//!
//! The layer never touches kernels directly; it asks an engine for the handful
//! of primitives it needs. [`CandleEngine`] serves them with candle on any
//! [`Device`], so switching between CPU and accelerators only changes the
//! engine, not the layer.
//!
//! All primitives are synchronous from the caller's point of view. Inputs to
//! [`TensorEngine::affine`] are 2D `(rows, features)`; the layer flattens
//! outer dimensions before calling it.

use std::fmt;

use candle_core::{Device, Result, Tensor};

use crate::{
    dropout::{self, DropoutSource},
    dtypes::PrecisionPolicy,
    init::WeightInit,
};

/// Primitive operations a feed-forward layer needs from a tensor library.
pub trait TensorEngine: Send + Sync + fmt::Debug {
    /// Device hosting parameters and activations.
    fn device(&self) -> &Device;

    /// Dtype rules used for storage and compute.
    fn policy(&self) -> &PrecisionPolicy;

    /// Allocates a zero-filled vector in the storage dtype.
    fn zeros(&self, len: usize) -> Result<Tensor>;

    /// Allocates a `[fan_in, fan_out]` matrix filled according to `init`.
    fn fan_in_out(
        &self,
        fan_in: usize,
        fan_out: usize,
        init: WeightInit,
        scale: f64,
    ) -> Result<Tensor>;

    /// Computes `input · weight + bias` with `bias` broadcast across rows.
    fn affine(&self, input: &Tensor, weight: &Tensor, bias: &Tensor) -> Result<Tensor>;

    /// Elementwise `max(0, x)`.
    fn rectify(&self, input: &Tensor) -> Result<Tensor>;

    /// Inverted dropout with probability `probability`.
    fn dropout(
        &self,
        input: &Tensor,
        probability: f32,
        source: &mut DropoutSource,
    ) -> Result<Tensor>;
}

/// Candle-backed engine.
#[derive(Debug, Clone)]
pub struct CandleEngine {
    device: Device,
    policy: PrecisionPolicy,
}

impl CandleEngine {
    pub fn new(device: Device, policy: PrecisionPolicy) -> Self {
        Self { device, policy }
    }

    /// CPU engine storing and computing in `f32`.
    pub fn cpu() -> Self {
        Self::new(
            Device::Cpu,
            PrecisionPolicy::from_parameter_dtype(candle_core::DType::F32),
        )
    }
}

impl TensorEngine for CandleEngine {
    fn device(&self) -> &Device {
        &self.device
    }

    fn policy(&self) -> &PrecisionPolicy {
        &self.policy
    }

    fn zeros(&self, len: usize) -> Result<Tensor> {
        Tensor::zeros(len, self.policy.storage(), &self.device)
    }

    fn fan_in_out(
        &self,
        fan_in: usize,
        fan_out: usize,
        init: WeightInit,
        scale: f64,
    ) -> Result<Tensor> {
        init.sample(fan_in, fan_out, scale, &self.device, self.policy.storage())
    }

    fn affine(&self, input: &Tensor, weight: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let input = self.policy.cast_for_compute(input)?;
        let weight = self.policy.cast_for_compute(weight)?;
        let bias = self.policy.cast_for_compute(bias)?;
        input.matmul(&weight)?.broadcast_add(&bias)
    }

    fn rectify(&self, input: &Tensor) -> Result<Tensor> {
        self.policy.cast_for_compute(input)?.relu()
    }

    fn dropout(
        &self,
        input: &Tensor,
        probability: f32,
        source: &mut DropoutSource,
    ) -> Result<Tensor> {
        let input = self.policy.cast_for_compute(input)?;
        dropout::apply(&input, probability, source)
    }
}
