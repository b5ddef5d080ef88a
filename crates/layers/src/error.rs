//! Error taxonomy for the feed-forward layer.
//!
//! Configuration problems surface from [`FeedForward::initialize`] and leave the
//! layer untouched. Shape problems surface per forward call and never alter
//! layer state. Engine failures are passed through unchanged.
//!
//! [`FeedForward::initialize`]: crate::feed_forward::FeedForward::initialize

use thiserror::Error;

/// Errors produced while configuring or running a feed-forward layer.
#[derive(Debug, Error)]
pub enum FfnError {
    /// Invalid dimensions, dropout probability, init scale, dtype or device.
    #[error("invalid feed-forward configuration: {0}")]
    Configuration(String),
    /// A tensor does not match the shape the layer was configured for.
    #[error("shape mismatch for {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    /// The layer was used before a successful `initialize`.
    #[error("feed-forward layer is not initialised")]
    Uninitialized,
    /// Failure reported by the tensor engine.
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl FfnError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        FfnError::Configuration(message.into())
    }

    /// Returns `true` for [`FfnError::Configuration`].
    pub fn is_configuration(&self) -> bool {
        matches!(self, FfnError::Configuration(_))
    }

    /// Returns `true` for [`FfnError::ShapeMismatch`].
    pub fn is_shape_mismatch(&self) -> bool {
        matches!(self, FfnError::ShapeMismatch { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FfnError>;
