use candle_core::{backprop::GradStore, DType, Device, Tensor};

use crate::dataset::collator::EncodedBatch;
use crate::error::FinetuneError;
use crate::trainer::precision::{resolve_strategy, PrecisionMode, PrecisionStrategy};
use crate::trainer::traits::CtcModel;

/// How per-replica CTC losses are combined under multi-device execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReduction {
    Mean,
    /// Total loss normalized by the count of non-ignored label positions.
    Sum,
}

impl LossReduction {
    pub fn from_name(name: &str) -> Result<Self, FinetuneError> {
        match name {
            "mean" => Ok(Self::Mean),
            "sum" => Ok(Self::Sum),
            other => Err(FinetuneError::config(format!(
                "'{other}' is not a valid ctc loss reduction. Choose one of ['mean', 'sum']"
            ))),
        }
    }
}

/// Result of one optimization step: the detached loss for logging and the
/// unscaled gradients. The optimizer step and gradient clipping belong to
/// the surrounding trainer loop.
pub struct StepOutput {
    pub loss: f32,
    pub grads: GradStore,
    pub grads_finite: bool,
}

/// Executes one optimization step: device placement, loss computation under
/// the resolved precision strategy, replica-loss reduction, accumulation
/// scaling, and the backward pass.
pub struct TrainStepEngine {
    device: Device,
    strategy: Box<dyn PrecisionStrategy>,
    reduction: LossReduction,
    replica_count: usize,
    gradient_accumulation_steps: usize,
}

impl TrainStepEngine {
    pub fn new(
        device: Device,
        precision: PrecisionMode,
        reduction: LossReduction,
        replica_count: usize,
        gradient_accumulation_steps: usize,
    ) -> Result<Self, FinetuneError> {
        let strategy = resolve_strategy(precision, None)?;
        Ok(Self::with_strategy(
            device,
            strategy,
            reduction,
            replica_count,
            gradient_accumulation_steps,
        ))
    }

    /// Wires a pre-resolved strategy, e.g. a third-party scaled-loss backend
    /// or a distributed delegate.
    pub fn with_strategy(
        device: Device,
        strategy: Box<dyn PrecisionStrategy>,
        reduction: LossReduction,
        replica_count: usize,
        gradient_accumulation_steps: usize,
    ) -> Self {
        tracing::debug!(
            strategy = strategy.name(),
            ?reduction,
            replica_count,
            gradient_accumulation_steps,
            "training-step engine ready"
        );
        Self {
            device,
            strategy,
            reduction,
            replica_count,
            gradient_accumulation_steps,
        }
    }

    pub fn training_step(
        &mut self,
        model: &dyn CtcModel,
        batch: &EncodedBatch,
    ) -> Result<StepOutput, FinetuneError> {
        let batch = batch.to_device(&self.device)?;

        let mut loss = self.strategy.compute_loss(model, &batch)?;

        if self.replica_count > 1 {
            loss = self.reduce_replica_losses(&loss, &batch)?;
        }

        if self.gradient_accumulation_steps > 1 {
            loss = loss
                .affine(1.0 / self.gradient_accumulation_steps as f64, 0.0)
                .map_err(|e| FinetuneError::runtime("scale loss for accumulation", e))?;
        }

        let vars = model.trainable_vars();
        let backward = self.strategy.backward(&loss, &vars)?;

        let loss_value = loss
            .detach()
            .to_dtype(DType::F32)
            .and_then(|t| t.to_scalar::<f32>())
            .map_err(|e| FinetuneError::runtime("detach loss", e))?;

        Ok(StepOutput {
            loss: loss_value,
            grads: backward.grads,
            grads_finite: backward.grads_finite,
        })
    }

    fn reduce_replica_losses(
        &self,
        loss: &Tensor,
        batch: &EncodedBatch,
    ) -> Result<Tensor, FinetuneError> {
        match self.reduction {
            LossReduction::Mean => loss
                .mean_all()
                .map_err(|e| FinetuneError::runtime("mean-reduce replica losses", e)),
            LossReduction::Sum => {
                let positions = batch.label_positions()?;
                if positions == 0 {
                    return Err(FinetuneError::data(
                        "loss reduction 'sum' needs at least one non-ignored label position",
                    ));
                }
                loss.sum_all()
                    .and_then(|t| t.affine(1.0 / positions as f64, 0.0))
                    .map_err(|e| FinetuneError::runtime("sum-reduce replica losses", e))
            }
        }
    }
}
