use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::dataset::collator::EncodedBatch;
use crate::error::FinetuneError;
use crate::trainer::traits::{CtcModel, DistributedBackend, MixedPrecisionBackend};

/// Process-wide numeric-precision mode, resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecisionMode {
    Full,
    /// f16 autocast with dynamic loss scaling.
    Amp,
    /// bf16 autocast; the wider exponent range needs no loss scaling.
    Bf16,
}

impl PrecisionMode {
    pub fn from_name(name: &str) -> Result<Self, FinetuneError> {
        match name {
            "full" | "fp32" => Ok(Self::Full),
            "amp" | "fp16" => Ok(Self::Amp),
            "bf16" => Ok(Self::Bf16),
            other => Err(FinetuneError::config(format!(
                "'{other}' is not a valid precision mode. Choose one of ['full', 'amp', 'bf16']"
            ))),
        }
    }
}

/// Gradients of one backward pass, already unscaled. `grads_finite` is
/// false when any trainable gradient contains NaN/Inf; the decision to
/// skip or abort belongs to the surrounding trainer loop.
pub struct BackwardOutput {
    pub grads: GradStore,
    pub grads_finite: bool,
}

/// One precision/backward capability, resolved from configuration before
/// any training work. The engine depends on this interface alone.
pub trait PrecisionStrategy: Send + std::fmt::Debug {
    fn compute_loss(
        &self,
        model: &dyn CtcModel,
        batch: &EncodedBatch,
    ) -> Result<Tensor, FinetuneError>;

    fn backward(&mut self, loss: &Tensor, vars: &[Var]) -> Result<BackwardOutput, FinetuneError>;

    fn name(&self) -> &'static str;
}

/// Resolves the configured mode into a strategy. A distributed backend,
/// when present, takes over the backward pass and requires full precision.
pub fn resolve_strategy(
    mode: PrecisionMode,
    distributed: Option<Box<dyn DistributedBackend>>,
) -> Result<Box<dyn PrecisionStrategy>, FinetuneError> {
    match (mode, distributed) {
        (PrecisionMode::Full, Some(backend)) => Ok(Box::new(DistributedStrategy { backend })),
        (_, Some(_)) => Err(FinetuneError::config(
            "a distributed backend owns the backward pass and requires precision 'full'",
        )),
        (PrecisionMode::Full, None) => Ok(Box::new(FullPrecision)),
        (PrecisionMode::Amp, None) => Ok(Box::new(NativeAmp {
            dtype: DType::F16,
            scaler: Some(GradScaler::default()),
        })),
        (PrecisionMode::Bf16, None) => Ok(Box::new(NativeAmp {
            dtype: DType::BF16,
            scaler: None,
        })),
    }
}

/// Dynamic loss scaler for f16 training. The scale shrinks when a step
/// produces non-finite gradients and grows back after a run of good steps,
/// keeping gradients representable without permanent underflow.
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    good_steps: usize,
}

impl Default for GradScaler {
    fn default() -> Self {
        Self {
            scale: 65_536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2_000,
            good_steps: 0,
        }
    }
}

impl GradScaler {
    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn update(&mut self, found_inf: bool) {
        if found_inf {
            self.scale *= self.backoff_factor;
            self.good_steps = 0;
            tracing::warn!(scale = self.scale, "gradient scaler backing off");
            return;
        }
        self.good_steps += 1;
        if self.good_steps >= self.growth_interval {
            self.scale *= self.growth_factor;
            self.good_steps = 0;
        }
    }
}

#[derive(Debug)]
struct FullPrecision;

impl PrecisionStrategy for FullPrecision {
    fn compute_loss(
        &self,
        model: &dyn CtcModel,
        batch: &EncodedBatch,
    ) -> Result<Tensor, FinetuneError> {
        model.forward_loss(batch, true)
    }

    fn backward(&mut self, loss: &Tensor, vars: &[Var]) -> Result<BackwardOutput, FinetuneError> {
        backward_with_scale(loss, 1.0, vars)
    }

    fn name(&self) -> &'static str {
        "full"
    }
}

#[derive(Debug)]
struct NativeAmp {
    dtype: DType,
    scaler: Option<GradScaler>,
}

impl PrecisionStrategy for NativeAmp {
    fn compute_loss(
        &self,
        model: &dyn CtcModel,
        batch: &EncodedBatch,
    ) -> Result<Tensor, FinetuneError> {
        let half_batch = batch.to_feature_dtype(self.dtype)?;
        let loss = model.forward_loss(&half_batch, true)?;
        loss.to_dtype(DType::F32)
            .map_err(|e| FinetuneError::runtime("upcast loss", e))
    }

    fn backward(&mut self, loss: &Tensor, vars: &[Var]) -> Result<BackwardOutput, FinetuneError> {
        let scale = self.scaler.as_ref().map_or(1.0, GradScaler::scale);
        let out = backward_with_scale(loss, scale, vars)?;
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.update(!out.grads_finite);
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "amp"
    }
}

/// Routes the backward pass through a third-party scaled-loss backend.
pub struct ScaledBackendStrategy {
    backend: Box<dyn MixedPrecisionBackend>,
}

impl std::fmt::Debug for ScaledBackendStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScaledBackendStrategy").finish_non_exhaustive()
    }
}

impl ScaledBackendStrategy {
    pub fn new(backend: Box<dyn MixedPrecisionBackend>) -> Self {
        Self { backend }
    }
}

impl PrecisionStrategy for ScaledBackendStrategy {
    fn compute_loss(
        &self,
        model: &dyn CtcModel,
        batch: &EncodedBatch,
    ) -> Result<Tensor, FinetuneError> {
        model.forward_loss(batch, true)
    }

    fn backward(&mut self, loss: &Tensor, vars: &[Var]) -> Result<BackwardOutput, FinetuneError> {
        let scaled = self.backend.scale_loss(loss)?;
        let grads = scaled
            .backward()
            .map_err(|e| FinetuneError::runtime("scaled backward pass", e))?;
        unscale_and_check(grads, self.backend.loss_scale(), vars)
    }

    fn name(&self) -> &'static str {
        "scaled-backend"
    }
}

/// A constant-scale [`MixedPrecisionBackend`], the simplest useful backend
/// behind the third-party seam.
pub struct StaticLossScale {
    scale: f64,
}

impl StaticLossScale {
    pub fn new(scale: f64) -> Self {
        Self { scale }
    }
}

impl MixedPrecisionBackend for StaticLossScale {
    fn scale_loss(&self, loss: &Tensor) -> Result<Tensor, FinetuneError> {
        loss.affine(self.scale, 0.0)
            .map_err(|e| FinetuneError::runtime("scale loss", e))
    }

    fn loss_scale(&self) -> f64 {
        self.scale
    }
}

struct DistributedStrategy {
    backend: Box<dyn DistributedBackend>,
}

impl std::fmt::Debug for DistributedStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedStrategy").finish_non_exhaustive()
    }
}

impl PrecisionStrategy for DistributedStrategy {
    fn compute_loss(
        &self,
        model: &dyn CtcModel,
        batch: &EncodedBatch,
    ) -> Result<Tensor, FinetuneError> {
        model.forward_loss(batch, true)
    }

    fn backward(&mut self, loss: &Tensor, vars: &[Var]) -> Result<BackwardOutput, FinetuneError> {
        let grads = self.backend.backward(loss)?;
        unscale_and_check(grads, 1.0, vars)
    }

    fn name(&self) -> &'static str {
        "distributed"
    }
}

fn backward_with_scale(
    loss: &Tensor,
    scale: f64,
    vars: &[Var],
) -> Result<BackwardOutput, FinetuneError> {
    let scaled = if scale == 1.0 {
        loss.clone()
    } else {
        loss.affine(scale, 0.0)
            .map_err(|e| FinetuneError::runtime("scale loss", e))?
    };
    let grads = scaled
        .backward()
        .map_err(|e| FinetuneError::runtime("backward pass", e))?;
    unscale_and_check(grads, scale, vars)
}

fn unscale_and_check(
    mut grads: GradStore,
    scale: f64,
    vars: &[Var],
) -> Result<BackwardOutput, FinetuneError> {
    let mut grads_finite = true;
    for var in vars {
        let Some(grad) = grads.remove(var.as_tensor()) else {
            continue;
        };
        let grad = if scale == 1.0 {
            grad
        } else {
            grad.affine(1.0 / scale, 0.0)
                .map_err(|e| FinetuneError::runtime("unscale gradient", e))?
        };
        if grads_finite && !tensor_is_finite(&grad)? {
            grads_finite = false;
        }
        grads.insert(var.as_tensor(), grad);
    }
    Ok(BackwardOutput {
        grads,
        grads_finite,
    })
}

fn tensor_is_finite(t: &Tensor) -> Result<bool, FinetuneError> {
    let sum = t
        .to_dtype(DType::F32)
        .and_then(|t| t.abs())
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_scalar::<f32>())
        .map_err(|e| FinetuneError::runtime("check gradient finiteness", e))?;
    Ok(sum.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precision_mode_names_parse() {
        assert_eq!(PrecisionMode::from_name("full").unwrap(), PrecisionMode::Full);
        assert_eq!(PrecisionMode::from_name("amp").unwrap(), PrecisionMode::Amp);
        assert_eq!(PrecisionMode::from_name("bf16").unwrap(), PrecisionMode::Bf16);
        assert!(matches!(
            PrecisionMode::from_name("int8").unwrap_err(),
            FinetuneError::Config { .. }
        ));
    }

    #[test]
    fn scaler_backs_off_on_inf_and_grows_after_interval() {
        let mut scaler = GradScaler {
            growth_interval: 2,
            ..GradScaler::default()
        };
        assert_eq!(scaler.scale(), 65_536.0);
        scaler.update(true);
        assert_eq!(scaler.scale(), 32_768.0);
        scaler.update(false);
        assert_eq!(scaler.scale(), 32_768.0);
        scaler.update(false);
        assert_eq!(scaler.scale(), 65_536.0);
    }

    #[test]
    fn distributed_backend_requires_full_precision() {
        struct Noop;
        impl DistributedBackend for Noop {
            fn backward(&self, loss: &Tensor) -> Result<GradStore, FinetuneError> {
                loss.backward()
                    .map_err(|e| FinetuneError::runtime("backward", e))
            }
        }
        let err = resolve_strategy(PrecisionMode::Amp, Some(Box::new(Noop))).unwrap_err();
        assert!(matches!(err, FinetuneError::Config { .. }));
        assert!(resolve_strategy(PrecisionMode::Full, Some(Box::new(Noop))).is_ok());
    }

    #[test]
    fn strategies_report_their_mode() {
        assert_eq!(
            resolve_strategy(PrecisionMode::Full, None).unwrap().name(),
            "full"
        );
        assert_eq!(
            resolve_strategy(PrecisionMode::Amp, None).unwrap().name(),
            "amp"
        );
        assert_eq!(
            resolve_strategy(PrecisionMode::Bf16, None).unwrap().name(),
            "amp"
        );
    }
}
