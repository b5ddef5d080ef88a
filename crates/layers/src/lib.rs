//! Position-wise feed-forward layer for transformer blocks.
//!
//! The crate hosts a single component, [`FeedForward`], which expands each
//! position's hidden vector, rectifies it, optionally applies dropout, and
//! contracts it back: `y = Dropout(max(0, x·W1 + b1))·W2 + b2`. Tensor work is
//! delegated to a [`TensorEngine`]; [`CandleEngine`] provides it on candle.

pub mod checks;
pub mod config;
pub mod dropout;
pub mod dtypes;
pub mod engine;
pub mod error;
pub mod feed_forward;
pub mod init;

pub use config::{DeviceSelector, FeedForwardConfig};
pub use dtypes::PrecisionPolicy;
pub use engine::{CandleEngine, TensorEngine};
pub use error::{FfnError, Result};
pub use feed_forward::{FeedForward, FeedForwardLayer, ParamName};
pub use init::WeightInit;
