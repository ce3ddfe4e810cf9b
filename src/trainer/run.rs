use std::path::PathBuf;

use candle_core::{backprop::GradStore, Var, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::dataset::collator::CtcCollator;
use crate::error::FinetuneError;
use crate::metrics::{compute_metrics, EvalMetrics};
use crate::processor::{CharTokenizer, Features};
use crate::trainer::step::{StepOutput, TrainStepEngine};
use crate::trainer::traits::CtcModel;

#[derive(Debug, Clone)]
pub struct TrainRunConfig {
    pub num_train_epochs: usize,
    pub per_device_train_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    /// Global-norm gradient clipping threshold; `None` disables clipping.
    pub max_grad_norm: Option<f64>,
    pub seed: u64,
}

impl Default for TrainRunConfig {
    fn default() -> Self {
        Self {
            num_train_epochs: 3,
            per_device_train_batch_size: 8,
            gradient_accumulation_steps: 1,
            learning_rate: 1e-4,
            max_grad_norm: Some(1.0),
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainSummary {
    pub optimizer_steps: usize,
    pub skipped_steps: usize,
    pub final_epoch_loss: f32,
}

/// Thin trainer loop around the step engine: shuffling, collation,
/// gradient-accumulation merging, clipping, optimizer updates and the
/// final checkpoint. Owns exactly what the engine does not.
pub struct Trainer<M: CtcModel> {
    model: M,
    engine: TrainStepEngine,
    collator: CtcCollator,
    config: TrainRunConfig,
    output_dir: PathBuf,
}

impl<M: CtcModel> Trainer<M> {
    pub fn new(
        model: M,
        engine: TrainStepEngine,
        collator: CtcCollator,
        config: TrainRunConfig,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            model,
            engine,
            collator,
            config,
            output_dir,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn train(&mut self, train_features: &[Features]) -> Result<TrainSummary, FinetuneError> {
        if train_features.is_empty() {
            return Err(FinetuneError::data("training split is empty"));
        }
        std::fs::create_dir_all(&self.output_dir)
            .map_err(|e| FinetuneError::io("create output directory", e))?;

        let vars = self.model.trainable_vars();
        let mut optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: self.config.learning_rate,
                ..ParamsAdamW::default()
            },
        )
        .map_err(|e| FinetuneError::runtime("build optimizer", e))?;

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut indices: Vec<usize> = (0..train_features.len()).collect();
        let accumulation = self.config.gradient_accumulation_steps.max(1);

        let mut optimizer_steps = 0usize;
        let mut skipped_steps = 0usize;
        let mut final_epoch_loss = f32::NAN;

        for epoch in 1..=self.config.num_train_epochs {
            indices.shuffle(&mut rng);

            let mut epoch_loss = 0f32;
            let mut batches = 0usize;
            let mut pending: Option<GradStore> = None;
            let mut pending_micro = 0usize;
            let mut pending_finite = true;

            for chunk in indices.chunks(self.config.per_device_train_batch_size.max(1)) {
                let batch_features: Vec<Features> =
                    chunk.iter().map(|&i| train_features[i].clone()).collect();
                let batch = self.collator.collate(&batch_features)?;
                let StepOutput {
                    loss,
                    grads,
                    grads_finite,
                } = self.engine.training_step(&self.model, &batch)?;

                epoch_loss += loss;
                batches += 1;
                pending_finite &= grads_finite;
                pending = Some(match pending.take() {
                    None => grads,
                    Some(acc) => merge_grads(acc, grads, &vars)?,
                });
                pending_micro += 1;

                if pending_micro == accumulation {
                    let grads = pending.take().ok_or_else(|| {
                        FinetuneError::runtime("trainer loop", "accumulated gradients missing")
                    })?;
                    if pending_finite {
                        let grads = clip_grad_norm(grads, &vars, self.config.max_grad_norm)?;
                        optimizer
                            .step(&grads)
                            .map_err(|e| FinetuneError::runtime("optimizer step", e))?;
                        optimizer_steps += 1;
                    } else {
                        skipped_steps += 1;
                        tracing::warn!("skipping optimizer step: non-finite gradients");
                    }
                    pending_micro = 0;
                    pending_finite = true;
                }
            }

            // Trailing partial accumulation window at epoch end.
            if let Some(grads) = pending.take() {
                if pending_finite {
                    let grads = clip_grad_norm(grads, &vars, self.config.max_grad_norm)?;
                    optimizer
                        .step(&grads)
                        .map_err(|e| FinetuneError::runtime("optimizer step", e))?;
                    optimizer_steps += 1;
                } else {
                    skipped_steps += 1;
                }
            }

            final_epoch_loss = epoch_loss / batches.max(1) as f32;
            tracing::info!(
                epoch,
                epochs = self.config.num_train_epochs,
                train_loss = final_epoch_loss,
                "epoch finished"
            );
        }

        self.model.save_checkpoint(&self.output_dir)?;
        tracing::info!(output_dir = %self.output_dir.display(), "checkpoint saved");

        Ok(TrainSummary {
            optimizer_steps,
            skipped_steps,
            final_epoch_loss,
        })
    }

    /// Greedy CTC decoding over the validation split, scored against the
    /// reference labels.
    pub fn evaluate(
        &self,
        val_features: &[Features],
        tokenizer: &CharTokenizer,
    ) -> Result<EvalMetrics, FinetuneError> {
        let mut predictions = Vec::with_capacity(val_features.len());
        let mut references = Vec::with_capacity(val_features.len());

        for chunk in val_features.chunks(self.config.per_device_train_batch_size.max(1)) {
            let batch = self.collator.collate(chunk)?;
            let (logits, frame_lengths) = self.model.logits(&batch)?;
            let pred_ids = logits
                .argmax(D::Minus1)
                .and_then(|t| t.to_vec2::<u32>())
                .map_err(|e| FinetuneError::runtime("decode predictions", e))?;

            for (row, ids) in pred_ids.iter().enumerate() {
                let valid = frame_lengths.get(row).copied().unwrap_or(ids.len());
                let prediction = tokenizer.decode_grouped(&ids[..valid.min(ids.len())]);
                let reference = tokenizer.decode_labels(&chunk[row].labels);
                tracing::debug!(%reference, %prediction, "evaluation pair");
                predictions.push(prediction);
                references.push(reference);
            }
        }

        compute_metrics(&predictions, &references)
    }
}

fn merge_grads(
    mut acc: GradStore,
    mut fresh: GradStore,
    vars: &[Var],
) -> Result<GradStore, FinetuneError> {
    for var in vars {
        let Some(new) = fresh.remove(var.as_tensor()) else {
            continue;
        };
        let merged = match acc.remove(var.as_tensor()) {
            Some(old) => (&old + &new).map_err(|e| FinetuneError::runtime("merge gradients", e))?,
            None => new,
        };
        acc.insert(var.as_tensor(), merged);
    }
    Ok(acc)
}

fn clip_grad_norm(
    mut grads: GradStore,
    vars: &[Var],
    max_norm: Option<f64>,
) -> Result<GradStore, FinetuneError> {
    let Some(max_norm) = max_norm else {
        return Ok(grads);
    };
    let on = |e| FinetuneError::runtime("clip gradients", e);

    let mut total_sq = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let sq = grad
                .sqr()
                .and_then(|t| t.sum_all())
                .and_then(|t| t.to_dtype(candle_core::DType::F64))
                .and_then(|t| t.to_scalar::<f64>())
                .map_err(on)?;
            total_sq += sq;
        }
    }
    let norm = total_sq.sqrt();
    if norm <= max_norm || norm == 0.0 {
        return Ok(grads);
    }

    let factor = max_norm / norm;
    for var in vars {
        if let Some(grad) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), grad.affine(factor, 0.0).map_err(on)?);
        }
    }
    Ok(grads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::collator::CollatorConfig;
    use crate::trainer::precision::PrecisionMode;
    use crate::trainer::probe::{FrameProbe, FrameProbeConfig};
    use crate::trainer::step::LossReduction;
    use candle_core::Device;

    fn probe_config() -> FrameProbeConfig {
        FrameProbeConfig {
            window: 4,
            hidden: 8,
            vocab_size: 8,
            dropout: 0.0,
        }
    }

    fn synthetic_features(n: usize) -> Vec<Features> {
        (0..n)
            .map(|i| Features {
                input_values: (0..16 + (i % 3) * 4)
                    .map(|j| ((i * 31 + j) as f32 / 11.0).sin())
                    .collect(),
                labels: vec![(i % 5) as i64 + 1, ((i + 2) % 5) as i64 + 1],
            })
            .collect()
    }

    fn trainer(config: TrainRunConfig, output_dir: PathBuf) -> Trainer<FrameProbe> {
        let device = Device::Cpu;
        let model = FrameProbe::new(probe_config(), &device).expect("probe");
        let engine = TrainStepEngine::new(
            device.clone(),
            PrecisionMode::Full,
            LossReduction::Mean,
            1,
            config.gradient_accumulation_steps,
        )
        .expect("engine");
        let collator = CtcCollator::new(device, CollatorConfig::default());
        Trainer::new(model, engine, collator, config, output_dir)
    }

    #[test]
    fn training_runs_and_saves_a_checkpoint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("run");
        let config = TrainRunConfig {
            num_train_epochs: 2,
            per_device_train_batch_size: 4,
            ..TrainRunConfig::default()
        };
        let summary = trainer(config, out.clone())
            .train(&synthetic_features(12))
            .unwrap();
        assert!(summary.optimizer_steps >= 2);
        assert_eq!(summary.skipped_steps, 0);
        assert!(summary.final_epoch_loss.is_finite());
        assert!(out.join("model.safetensors").exists());
    }

    #[test]
    fn accumulation_takes_fewer_optimizer_steps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let features = synthetic_features(8);

        let plain = TrainRunConfig {
            num_train_epochs: 1,
            per_device_train_batch_size: 2,
            gradient_accumulation_steps: 1,
            ..TrainRunConfig::default()
        };
        let s1 = trainer(plain, dir.path().join("a")).train(&features).unwrap();

        let accumulated = TrainRunConfig {
            num_train_epochs: 1,
            per_device_train_batch_size: 2,
            gradient_accumulation_steps: 2,
            ..TrainRunConfig::default()
        };
        let s2 = trainer(accumulated, dir.path().join("b")).train(&features).unwrap();

        assert_eq!(s1.optimizer_steps, 4);
        assert_eq!(s2.optimizer_steps, 2);
    }

    #[test]
    fn empty_training_split_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = trainer(TrainRunConfig::default(), dir.path().join("x"))
            .train(&[])
            .unwrap_err();
        assert!(matches!(err, FinetuneError::Data { .. }));
    }

    #[test]
    fn training_lowers_the_loss_on_a_tiny_split() {
        let dir = tempfile::tempdir().expect("tempdir");
        let features = synthetic_features(6);

        let short = TrainRunConfig {
            num_train_epochs: 1,
            per_device_train_batch_size: 3,
            learning_rate: 5e-2,
            seed: 7,
            ..TrainRunConfig::default()
        };
        let long = TrainRunConfig {
            num_train_epochs: 30,
            ..short.clone()
        };
        let first = trainer(short, dir.path().join("short")).train(&features).unwrap();
        let last = trainer(long, dir.path().join("long")).train(&features).unwrap();
        assert!(last.final_epoch_loss < first.final_epoch_loss);
    }

    #[test]
    fn evaluation_produces_finite_metrics() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vocab: std::collections::HashMap<String, u32> = [
            ("<pad>", 0u32),
            ("<unk>", 1),
            ("|", 2),
            ("a", 3),
            ("b", 4),
            ("c", 5),
            ("d", 6),
            ("e", 7),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        let vocab_path = dir.path().join("vocab.json");
        std::fs::write(&vocab_path, serde_json::to_string(&vocab).unwrap()).unwrap();
        let tokenizer = CharTokenizer::from_vocab_file(&vocab_path, '|', true).unwrap();

        let config = TrainRunConfig {
            num_train_epochs: 1,
            per_device_train_batch_size: 2,
            ..TrainRunConfig::default()
        };
        let mut t = trainer(config, dir.path().join("eval"));
        let features = synthetic_features(4);
        t.train(&features).unwrap();
        let metrics = t.evaluate(&features, &tokenizer).unwrap();
        assert!(metrics.wer >= 0.0);
        assert!(metrics.cer >= 0.0);
    }
}
