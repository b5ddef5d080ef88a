//! Inverted dropout with call-local randomness.
//!
//! Each element is zeroed with probability `p` and survivors are multiplied by
//! `1 / (1 - p)` so the expected activation is unchanged. Masks never draw from
//! state shared between calls: [`DropoutSource::Engine`] asks candle for a
//! fresh random tensor, [`DropoutSource::Seeded`] owns its generator and is
//! built per call.

use candle_core::{DType, Error, Result, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::error::FfnError;

/// Where a dropout mask draws its randomness from.
#[derive(Debug)]
pub enum DropoutSource {
    /// Candle's random tensor generation on the tensor's device.
    Engine,
    /// A caller-owned generator, used for reproducible masks.
    Seeded(StdRng),
}

impl DropoutSource {
    /// Creates a seeded source; identical seeds produce identical masks.
    pub fn seeded(seed: u64) -> Self {
        DropoutSource::Seeded(StdRng::seed_from_u64(seed))
    }
}

/// Rejects probabilities outside `[0, 1)`.
pub fn validate_probability(probability: f32) -> std::result::Result<(), FfnError> {
    if probability.is_finite() && (0.0..1.0).contains(&probability) {
        Ok(())
    } else {
        Err(FfnError::config(format!(
            "fnn_dropout must be in [0, 1), got {probability}"
        )))
    }
}

/// Applies inverted dropout to `tensor`.
///
/// A probability of zero returns the input untouched.
pub fn apply(tensor: &Tensor, probability: f32, source: &mut DropoutSource) -> Result<Tensor> {
    if probability == 0.0 {
        return Ok(tensor.clone());
    }
    if !(0.0..1.0).contains(&probability) {
        return Err(Error::Msg(format!(
            "dropout probability must be in [0, 1), got {probability}"
        )));
    }
    match source {
        DropoutSource::Engine => candle_nn::ops::dropout(tensor, probability),
        DropoutSource::Seeded(rng) => {
            let keep = 1.0 - probability;
            let mask: Vec<f32> = (0..tensor.elem_count())
                .map(|_| if rng.gen::<f32>() < keep { 1.0 } else { 0.0 })
                .collect();
            let mask = Tensor::from_vec(mask, tensor.dims(), tensor.device())?;
            let mask = if tensor.dtype() == DType::F32 {
                mask
            } else {
                mask.to_dtype(tensor.dtype())?
            };
            tensor.mul(&mask)?.affine(1.0 / f64::from(keep), 0.0)
        }
    }
}
