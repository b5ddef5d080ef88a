use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{Optimizer, SGD};
use layers::{
    dropout::DropoutSource, CandleEngine, FeedForward, FeedForwardConfig, ParamName,
    PrecisionPolicy, TensorEngine, WeightInit,
};

/// `w1 = [I | I]`, `w2 = [I ; I]` for a 4 -> 8 -> 4 layer.
fn identity_like_layer(w1_sign: f32) -> Result<FeedForward> {
    let device = Device::Cpu;
    let mut layer = FeedForward::from_config(&FeedForwardConfig::new(4, 8, 0.0))?;

    let mut w1 = vec![0f32; 4 * 8];
    let mut w2 = vec![0f32; 8 * 4];
    for i in 0..4 {
        w1[i * 8 + i] = 1.0;
        w1[i * 8 + i + 4] = w1_sign;
        w2[i * 4 + i] = 1.0;
        w2[(i + 4) * 4 + i] = 1.0;
    }
    layer.assign(ParamName::W1, &Tensor::from_vec(w1, (4, 8), &device)?)?;
    layer.assign(ParamName::W2, &Tensor::from_vec(w2, (8, 4), &device)?)?;
    Ok(layer)
}

#[test]
fn identity_like_weights_give_formula_output() -> Result<()> {
    let layer = identity_like_layer(1.0)?;
    let input = Tensor::from_slice(&[1f32, 1.0, 1.0, 1.0], (1, 4), &Device::Cpu)?;

    let hidden = layer.hidden_activations(&input)?.to_vec2::<f32>()?;
    assert_eq!(hidden, vec![vec![1.0; 8]]);

    let output = layer.forward(&input, false)?.to_vec2::<f32>()?;
    assert_eq!(output, vec![vec![2.0, 2.0, 2.0, 2.0]]);
    Ok(())
}

#[test]
fn rectify_sits_between_the_two_affines() -> Result<()> {
    // [I | -I] followed by [I ; I] computes |x| only when ReLU is applied
    // between the projections; without it the two halves cancel.
    let layer = identity_like_layer(-1.0)?;
    let input = Tensor::from_slice(&[1f32, -2.0, 3.0, -4.0], 4, &Device::Cpu)?;
    let output = layer.forward(&input, false)?.to_vec1::<f32>()?;
    assert_eq!(output, vec![1.0, 2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn biases_are_added_before_and_after_rectify() -> Result<()> {
    let device = Device::Cpu;
    let mut layer = identity_like_layer(-1.0)?;
    layer.assign(ParamName::B1, &Tensor::full(-1f32, 8, &device)?)?;
    layer.assign(ParamName::B2, &Tensor::full(0.5f32, 4, &device)?)?;

    // pre = [0, -3, 2, -5, -2, 1, -4, 3] -> relu [0, 0, 2, 0, 0, 1, 0, 3]
    let input = Tensor::from_slice(&[1f32, -2.0, 3.0, -4.0, 1.0, -2.0, 3.0, -4.0], (2, 4), &device)?;
    let output = layer.forward(&input, false)?.to_vec2::<f32>()?;
    assert_eq!(output, vec![vec![0.5, 1.5, 2.5, 3.5]; 2]);
    Ok(())
}

#[test]
fn external_optimizer_updates_parameters() -> Result<()> {
    let layer = FeedForward::from_config(&FeedForwardConfig::new(4, 8, 0.0))?;
    let w2_before = layer.w2()?.flatten_all()?.to_vec1::<f32>()?;

    let mut optimizer = SGD::new(layer.parameters()?, 0.1)?;
    let input = Tensor::randn(0f32, 1.0, (2, 3, 4), &Device::Cpu)?;
    let loss = layer.forward(&input, true)?.sqr()?.sum_all()?;
    optimizer.backward_step(&loss)?;

    let w2_after = layer.w2()?.flatten_all()?.to_vec1::<f32>()?;
    assert_ne!(w2_before, w2_after);
    let b2 = layer.b2()?.to_vec1::<f32>()?;
    assert!(b2.iter().any(|v| *v != 0.0));
    Ok(())
}

#[test]
fn concurrent_inference_matches_sequential() -> Result<()> {
    let layer = FeedForward::from_config(&FeedForwardConfig::new(16, 64, 0.2))?;
    let input = Tensor::randn(0f32, 1.0, (4, 8, 16), &Device::Cpu)?;
    let expected = layer.forward(&input, false)?.flatten_all()?.to_vec1::<f32>()?;

    let outputs = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| -> layers::Result<Vec<f32>> {
                    // Interleave training calls to show dropout does not leak
                    // into other threads' inference results.
                    layer.forward(&input, true)?;
                    Ok(layer.forward(&input, false)?.flatten_all()?.to_vec1::<f32>()?)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect::<Vec<_>>()
    });

    for output in outputs {
        assert_eq!(output?, expected);
    }
    Ok(())
}

/// Wraps the candle engine and counts dropout invocations.
#[derive(Debug)]
struct CountingEngine {
    inner: CandleEngine,
    dropout_calls: AtomicUsize,
}

impl TensorEngine for CountingEngine {
    fn device(&self) -> &Device {
        self.inner.device()
    }

    fn policy(&self) -> &PrecisionPolicy {
        self.inner.policy()
    }

    fn zeros(&self, len: usize) -> candle_core::Result<Tensor> {
        self.inner.zeros(len)
    }

    fn fan_in_out(
        &self,
        fan_in: usize,
        fan_out: usize,
        init: WeightInit,
        scale: f64,
    ) -> candle_core::Result<Tensor> {
        self.inner.fan_in_out(fan_in, fan_out, init, scale)
    }

    fn affine(&self, input: &Tensor, weight: &Tensor, bias: &Tensor) -> candle_core::Result<Tensor> {
        self.inner.affine(input, weight, bias)
    }

    fn rectify(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        self.inner.rectify(input)
    }

    fn dropout(
        &self,
        input: &Tensor,
        probability: f32,
        source: &mut DropoutSource,
    ) -> candle_core::Result<Tensor> {
        self.dropout_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.dropout(input, probability, source)
    }
}

#[test]
fn dropout_runs_only_in_training_with_positive_probability() -> Result<()> {
    let engine = Arc::new(CountingEngine {
        inner: CandleEngine::cpu(),
        dropout_calls: AtomicUsize::new(0),
    });
    let input = Tensor::randn(0f32, 1.0, (3, 4), &Device::Cpu)?;

    let layer = FeedForward::with_engine(&FeedForwardConfig::new(4, 8, 0.5), engine.clone())?;
    let installed = layer.engine().expect("initialised layer exposes its engine");
    assert!(installed.device().is_cpu());
    assert_eq!(installed.policy().storage(), DType::F32);
    layer.forward(&input, false)?;
    assert_eq!(engine.dropout_calls.load(Ordering::SeqCst), 0);
    layer.forward(&input, true)?;
    layer.forward_seeded(&input, 5)?;
    assert_eq!(engine.dropout_calls.load(Ordering::SeqCst), 2);

    let no_dropout = FeedForward::with_engine(&FeedForwardConfig::new(4, 8, 0.0), engine.clone())?;
    no_dropout.forward(&input, true)?;
    assert_eq!(engine.dropout_calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn shape_mismatch_does_not_disturb_the_layer() -> Result<()> {
    let layer = FeedForward::from_config(&FeedForwardConfig::new(4, 8, 0.0))?;
    let good = Tensor::randn(0f32, 1.0, (2, 4), &Device::Cpu)?;
    let before = layer.forward(&good, false)?.flatten_all()?.to_vec1::<f32>()?;

    let bad = Tensor::ones((2, 3), DType::F32, &Device::Cpu)?;
    assert!(layer.forward(&bad, false).unwrap_err().is_shape_mismatch());

    let after = layer.forward(&good, false)?.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(before, after);
    Ok(())
}

#[test]
fn unseeded_training_masks_are_independent_per_call() -> Result<()> {
    let layer = FeedForward::from_config(&FeedForwardConfig::new(8, 64, 0.5))?;
    let input = Tensor::randn(0f32, 1.0, (4, 6, 8), &Device::Cpu)?;
    let eval = layer.forward(&input, false)?.flatten_all()?.to_vec1::<f32>()?;

    let mut outputs = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| -> layers::Result<Vec<f32>> {
                    Ok(layer.forward(&input, true)?.flatten_all()?.to_vec1::<f32>()?)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect::<layers::Result<Vec<_>>>()
    })?;
    for _ in 0..2 {
        outputs.push(layer.forward(&input, true)?.flatten_all()?.to_vec1::<f32>()?);
    }

    for output in &outputs {
        assert_ne!(output, &eval);
    }
    let first = &outputs[0];
    assert!(
        outputs.iter().skip(1).any(|output| output != first),
        "every training call produced the same dropout mask"
    );
    Ok(())
}
