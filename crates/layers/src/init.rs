//! Fan-in/fan-out weight initialisation.
//!
//! Weight matrices use the `[fan_in, fan_out]` layout consumed by
//! `input.matmul(weight)`. Both policies are Glorot style: the spread shrinks
//! with `fan_in + fan_out`, and a scale multiplier stretches it uniformly.
//!
//! * **XavierUniform** samples `U(-b, b)` with `b = scale * sqrt(6 / (fan_in + fan_out))`.
//! * **XavierNormal** samples `N(0, s²)` with `s = scale * sqrt(2 / (fan_in + fan_out))`.

use candle_core::{DType, Device, Result, Tensor};
use serde::Deserialize;

/// Supported weight initialisation policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightInit {
    /// Xavier/Glorot uniform initialisation.
    #[default]
    XavierUniform,
    /// Xavier/Glorot normal initialisation.
    XavierNormal,
}

impl WeightInit {
    /// Standard deviation the policy targets for a `[fan_in, fan_out]` matrix.
    pub fn target_std(&self, fan_in: usize, fan_out: usize, scale: f64) -> f64 {
        // U(-b, b) has std b / sqrt(3), which lands on the same value as the
        // normal variant.
        scale * (2.0f64 / (fan_in + fan_out) as f64).sqrt()
    }

    /// Samples a `[fan_in, fan_out]` matrix on `device`, cast to `dtype`.
    ///
    /// Sampling always happens in `f32`; reduced precision storage is produced
    /// by a final cast.
    pub fn sample(
        &self,
        fan_in: usize,
        fan_out: usize,
        scale: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Tensor> {
        let denom = (fan_in + fan_out) as f64;
        let shape = (fan_in, fan_out);
        let weight = match self {
            WeightInit::XavierUniform => {
                let bound = scale * (6.0f64 / denom).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            WeightInit::XavierNormal => {
                let std = scale * (2.0f64 / denom).sqrt();
                Tensor::randn(0f32, std as f32, shape, device)?
            }
        };
        if dtype == DType::F32 {
            Ok(weight)
        } else {
            weight.to_dtype(dtype)
        }
    }
}
