//! Validation helpers shared by the configuration and forward paths.
//!
//! Shape checks return [`FfnError::ShapeMismatch`] so callers can tell a bad
//! input apart from an engine failure; dtype checks report configuration
//! problems.

use candle_core::{DType, Tensor};

use crate::error::{FfnError, Result};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(context: &'static str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(FfnError::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}

/// Validates that the innermost dimension equals `features`.
///
/// Any rank of at least one is accepted; outer dimensions are treated as
/// independent positions.
pub fn expect_innermost(context: &'static str, tensor: &Tensor, features: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(&last) if last == features => Ok(()),
        _ => Err(FfnError::ShapeMismatch {
            context,
            expected: vec![features],
            actual: tensor.dims().to_vec(),
        }),
    }
}

/// Checks the dtype is one of the floating point types parameters may use.
pub fn expect_float_dtype(context: &str, dtype: DType) -> Result<()> {
    match dtype {
        DType::F16 | DType::BF16 | DType::F32 | DType::F64 => Ok(()),
        other => Err(FfnError::config(format!(
            "{context}: expected a floating point dtype, got {other:?}"
        ))),
    }
}
