//! Position-wise feed-forward block: `y = Dropout(max(0, x·W1 + b1))·W2 + b2`.
//!
//! Inputs may have any rank of at least one; the innermost dimension must equal
//! `input_size` and every outer index is an independent position. Outer
//! dimensions are flattened into rows for the two affine transforms and
//! restored on the way out, so `(batch, seq, input_size)` becomes
//! `(batch, seq, output_size)`.
//!
//! The layer starts empty and becomes usable after [`FeedForward::initialize`].
//! It owns its four parameters as candle [`Var`]s; optimizers get handles via
//! [`FeedForward::parameters`]. Forward passes only read the parameters, so
//! several may run concurrently, but callers must not update parameters while a
//! forward pass is in flight.

use std::sync::Arc;

use candle_core::{Device, Tensor, Var};

use crate::{
    checks,
    config::FeedForwardConfig,
    dropout::DropoutSource,
    dtypes::PrecisionPolicy,
    engine::{CandleEngine, TensorEngine},
    error::{FfnError, Result},
};

/// Shared interface for feed-forward stacks.
pub trait FeedForwardLayer: Send + Sync {
    /// Configuration the layer was initialised with, if any.
    fn config(&self) -> Option<&FeedForwardConfig>;

    /// Runs the forward pass; dropout is active only when `is_training` is set.
    fn forward(&self, input: &Tensor, is_training: bool) -> Result<Tensor>;
}

/// Names of the trainable tensors, in the order [`FeedForward::parameters`] returns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamName {
    W1,
    B1,
    W2,
    B2,
}

impl ParamName {
    pub const ALL: [ParamName; 4] = [ParamName::W1, ParamName::B1, ParamName::W2, ParamName::B2];

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamName::W1 => "w1",
            ParamName::B1 => "b1",
            ParamName::W2 => "w2",
            ParamName::B2 => "b2",
        }
    }

    fn context(&self) -> &'static str {
        match self {
            ParamName::W1 => "feed_forward.w1",
            ParamName::B1 => "feed_forward.b1",
            ParamName::W2 => "feed_forward.w2",
            ParamName::B2 => "feed_forward.b2",
        }
    }
}

/// Trainable tensors of an initialised layer.
#[derive(Debug, Clone)]
struct Params {
    w1: Var,
    b1: Var,
    w2: Var,
    b2: Var,
}

impl Params {
    fn get(&self, name: ParamName) -> &Var {
        match name {
            ParamName::W1 => &self.w1,
            ParamName::B1 => &self.b1,
            ParamName::W2 => &self.w2,
            ParamName::B2 => &self.b2,
        }
    }
}

#[derive(Debug, Clone)]
struct Ready {
    config: FeedForwardConfig,
    engine: Arc<dyn TensorEngine>,
    params: Params,
}

impl Ready {
    fn build(config: &FeedForwardConfig, engine: Arc<dyn TensorEngine>) -> Result<Self> {
        config.validate()?;
        checks::expect_float_dtype("engine storage dtype", engine.policy().storage())?;

        let input = config.input_size();
        let hidden = config.fnn_hidden_size;
        let output = config.output_size();
        let (init, scale) = (config.weight_init, config.init_scale);

        let w1 = engine.fan_in_out(input, hidden, init, scale)?;
        let b1 = engine.zeros(hidden)?;
        let w2 = engine.fan_in_out(hidden, output, init, scale)?;
        let b2 = engine.zeros(output)?;

        let params = Params {
            w1: Var::from_tensor(&w1)?,
            b1: Var::from_tensor(&b1)?,
            w2: Var::from_tensor(&w2)?,
            b2: Var::from_tensor(&b2)?,
        };
        Ok(Self {
            config: config.clone(),
            engine,
            params,
        })
    }

    fn expected_shape(&self, name: ParamName) -> Vec<usize> {
        let (input, hidden, output) = (
            self.config.input_size(),
            self.config.fnn_hidden_size,
            self.config.output_size(),
        );
        match name {
            ParamName::W1 => vec![input, hidden],
            ParamName::B1 => vec![hidden],
            ParamName::W2 => vec![hidden, output],
            ParamName::B2 => vec![output],
        }
    }

    /// Validates `input` and returns the number of positions plus the output dims.
    fn positions(&self, input: &Tensor, features: usize) -> Result<(usize, Vec<usize>)> {
        checks::expect_innermost("feed_forward.input", input, self.config.input_size())?;
        let dims = input.dims();
        let outer = &dims[..dims.len() - 1];
        let rows = outer.iter().product();
        let mut out_dims = outer.to_vec();
        out_dims.push(features);
        Ok((rows, out_dims))
    }

    /// First affine transform followed by rectification, on `(rows, input_size)` rows.
    fn hidden_rows(&self, rows: &Tensor) -> Result<Tensor> {
        let pre = self
            .engine
            .affine(rows, self.params.w1.as_tensor(), self.params.b1.as_tensor())?;
        Ok(self.engine.rectify(&pre)?)
    }

    fn hidden_activations(&self, input: &Tensor) -> Result<Tensor> {
        let (rows, out_dims) = self.positions(input, self.config.fnn_hidden_size)?;
        let policy = self.engine.policy();
        if rows == 0 {
            return Ok(Tensor::zeros(out_dims, policy.storage(), self.engine.device())?);
        }
        let flat = input.reshape((rows, self.config.input_size()))?;
        let hidden = self.hidden_rows(&flat)?.reshape(out_dims)?;
        Ok(policy.cast_to_storage(&hidden)?)
    }

    fn forward(&self, input: &Tensor, dropout: Option<&mut DropoutSource>) -> Result<Tensor> {
        let (rows, out_dims) = self.positions(input, self.config.output_size())?;
        let policy = self.engine.policy();
        if rows == 0 {
            return Ok(Tensor::zeros(out_dims, policy.storage(), self.engine.device())?);
        }

        let flat = input.reshape((rows, self.config.input_size()))?;
        let mut hidden = self.hidden_rows(&flat)?;
        if let Some(source) = dropout {
            hidden = self
                .engine
                .dropout(&hidden, self.config.fnn_dropout, source)?;
        }
        let output = self
            .engine
            .affine(&hidden, self.params.w2.as_tensor(), self.params.b2.as_tensor())?
            .reshape(out_dims)?;
        Ok(policy.cast_to_storage(&output)?)
    }

    fn dropout_active(&self, is_training: bool) -> bool {
        is_training && self.config.fnn_dropout > 0.0
    }
}

/// Two-layer perceptron applied independently to every position.
///
/// Clones share parameter storage with the layer they were cloned from.
#[derive(Debug, Clone, Default)]
pub struct FeedForward {
    state: Option<Ready>,
}

impl FeedForward {
    /// Creates an uninitialised layer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and initialises a layer on the device named by `config`.
    pub fn from_config(config: &FeedForwardConfig) -> Result<Self> {
        let mut layer = Self::new();
        layer.initialize(config)?;
        Ok(layer)
    }

    /// Creates and initialises a layer on a caller-supplied engine.
    pub fn with_engine(config: &FeedForwardConfig, engine: Arc<dyn TensorEngine>) -> Result<Self> {
        let mut layer = Self::new();
        layer.initialize_with_engine(config, engine)?;
        Ok(layer)
    }

    /// Allocates and seeds all parameters from `config`.
    ///
    /// Weights follow `config.weight_init` scaled by `config.init_scale`; biases
    /// start at zero. Calling this again replaces every parameter. On failure
    /// the layer keeps whatever state it had before the call.
    pub fn initialize(&mut self, config: &FeedForwardConfig) -> Result<()> {
        let built = config.device.resolve().and_then(|device| {
            let policy = PrecisionPolicy::from_parameter_dtype(config.dtype);
            Ready::build(config, Arc::new(CandleEngine::new(device, policy)))
        });
        self.install(built)
    }

    /// Like [`initialize`](Self::initialize) but runs on `engine`.
    ///
    /// The engine decides device and dtypes; `config.device` is ignored and
    /// `config.dtype` must match the engine's storage dtype.
    pub fn initialize_with_engine(
        &mut self,
        config: &FeedForwardConfig,
        engine: Arc<dyn TensorEngine>,
    ) -> Result<()> {
        let storage = engine.policy().storage();
        let built = if storage != config.dtype {
            Err(FfnError::config(format!(
                "config dtype {:?} does not match engine storage dtype {:?}",
                config.dtype, storage
            )))
        } else {
            Ready::build(config, engine)
        };
        self.install(built)
    }

    fn install(&mut self, built: Result<Ready>) -> Result<()> {
        let ready = match built {
            Ok(ready) => ready,
            Err(err) => {
                log::warn!("feed-forward initialisation failed: {err}");
                return Err(err);
            }
        };
        if self.state.is_some() {
            log::warn!("re-initialising feed-forward layer; previous parameters are discarded");
        }
        log::debug!(
            "feed-forward initialised: input={} hidden={} output={} dropout={} device={:?} dtype={:?}",
            ready.config.input_size(),
            ready.config.fnn_hidden_size,
            ready.config.output_size(),
            ready.config.fnn_dropout,
            ready.engine.device().location(),
            ready.engine.policy().storage(),
        );
        self.state = Some(ready);
        Ok(())
    }

    fn ready(&self) -> Result<&Ready> {
        self.state.as_ref().ok_or(FfnError::Uninitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    pub fn input_size(&self) -> Option<usize> {
        self.state.as_ref().map(|s| s.config.input_size())
    }

    pub fn hidden_size(&self) -> Option<usize> {
        self.state.as_ref().map(|s| s.config.fnn_hidden_size)
    }

    pub fn output_size(&self) -> Option<usize> {
        self.state.as_ref().map(|s| s.config.output_size())
    }

    pub fn dropout_probability(&self) -> Option<f32> {
        self.state.as_ref().map(|s| s.config.fnn_dropout)
    }

    /// Device hosting the parameters.
    pub fn device(&self) -> Option<&Device> {
        self.state.as_ref().map(|s| s.engine.device())
    }

    /// Engine executing the primitives.
    pub fn engine(&self) -> Option<&Arc<dyn TensorEngine>> {
        self.state.as_ref().map(|s| &s.engine)
    }

    /// Computes the output for every position of `input`.
    ///
    /// With `is_training == false`, or a dropout probability of zero, the call
    /// is deterministic.
    pub fn forward(&self, input: &Tensor, is_training: bool) -> Result<Tensor> {
        let ready = self.ready()?;
        log::trace!(
            "feed-forward forward: dims={:?} training={is_training}",
            input.dims()
        );
        if ready.dropout_active(is_training) {
            ready.forward(input, Some(&mut DropoutSource::Engine))
        } else {
            ready.forward(input, None)
        }
    }

    /// Training-mode forward whose dropout mask is drawn from a generator
    /// seeded with `seed`, so repeated calls with the same seed agree.
    pub fn forward_seeded(&self, input: &Tensor, seed: u64) -> Result<Tensor> {
        let ready = self.ready()?;
        if ready.dropout_active(true) {
            ready.forward(input, Some(&mut DropoutSource::seeded(seed)))
        } else {
            ready.forward(input, None)
        }
    }

    /// Post-rectification, pre-dropout activations shaped `(.., hidden_size)`.
    pub fn hidden_activations(&self, input: &Tensor) -> Result<Tensor> {
        self.ready()?.hidden_activations(input)
    }

    /// Trainable handles in `w1, b1, w2, b2` order.
    pub fn parameters(&self) -> Result<Vec<Var>> {
        let params = &self.ready()?.params;
        Ok(ParamName::ALL
            .iter()
            .map(|name| params.get(*name).clone())
            .collect())
    }

    /// Trainable handles paired with their names.
    pub fn named_parameters(&self) -> Result<Vec<(&'static str, Var)>> {
        let params = &self.ready()?.params;
        Ok(ParamName::ALL
            .iter()
            .map(|name| (name.as_str(), params.get(*name).clone()))
            .collect())
    }

    /// Snapshot of one parameter.
    pub fn parameter(&self, name: ParamName) -> Result<Tensor> {
        Ok(self.ready()?.params.get(name).as_tensor().clone())
    }

    pub fn w1(&self) -> Result<Tensor> {
        self.parameter(ParamName::W1)
    }

    pub fn b1(&self) -> Result<Tensor> {
        self.parameter(ParamName::B1)
    }

    pub fn w2(&self) -> Result<Tensor> {
        self.parameter(ParamName::W2)
    }

    pub fn b2(&self) -> Result<Tensor> {
        self.parameter(ParamName::B2)
    }

    /// Copies `value` into the named parameter, casting to the storage dtype
    /// and moving it to the layer's device.
    pub fn assign(&mut self, name: ParamName, value: &Tensor) -> Result<()> {
        let ready = self.ready()?;
        checks::expect_shape(name.context(), value, &ready.expected_shape(name))?;
        let value = ready
            .engine
            .policy()
            .cast_to_storage(&value.to_device(ready.engine.device())?)?;
        ready.params.get(name).set(&value)?;
        Ok(())
    }
}

impl FeedForwardLayer for FeedForward {
    fn config(&self) -> Option<&FeedForwardConfig> {
        self.state.as_ref().map(|s| &s.config)
    }

    fn forward(&self, input: &Tensor, is_training: bool) -> Result<Tensor> {
        FeedForward::forward(self, input, is_training)
    }
}
