use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::ops::{dropout, log_softmax};

use crate::dataset::collator::{EncodedBatch, LABEL_IGNORE_ID};
use crate::error::FinetuneError;
use crate::trainer::traits::CtcModel;

/// Configuration for [`FrameProbe`].
#[derive(Debug, Clone)]
pub struct FrameProbeConfig {
    /// Samples per frame window.
    pub window: usize,
    pub hidden: usize,
    pub vocab_size: usize,
    pub dropout: f32,
}

impl Default for FrameProbeConfig {
    fn default() -> Self {
        Self {
            window: 320,
            hidden: 64,
            vocab_size: 32,
            dropout: 0.1,
        }
    }
}

/// Deliberately small frame-window classifier: featurizer → dropout →
/// lm head, trained with a uniform-alignment cross-entropy that honors
/// the label ignore sentinel.
///
/// The acoustic model proper is an external collaborator behind
/// [`CtcModel`]; this probe exists so the binary and the integration
/// suite can drive every pipeline stage with real gradients.
pub struct FrameProbe {
    config: FrameProbeConfig,
    device: Device,
    feat_w: Var,
    feat_b: Var,
    head_w: Var,
    head_b: Var,
    featurizer_frozen: bool,
    base_frozen: bool,
}

impl FrameProbe {
    pub fn new(config: FrameProbeConfig, device: &Device) -> Result<Self, FinetuneError> {
        let on = |e| FinetuneError::runtime("init frame probe", e);
        let std = 0.04f32;
        Ok(Self {
            feat_w: Var::randn(0f32, std, (config.hidden, config.window), device).map_err(on)?,
            feat_b: Var::zeros(config.hidden, DType::F32, device).map_err(on)?,
            head_w: Var::randn(0f32, std, (config.vocab_size, config.hidden), device)
                .map_err(on)?,
            head_b: Var::zeros(config.vocab_size, DType::F32, device).map_err(on)?,
            device: device.clone(),
            config,
            featurizer_frozen: false,
            base_frozen: false,
        })
    }

    /// Restores a probe saved by [`CtcModel::save_checkpoint`].
    pub fn from_checkpoint(
        config: FrameProbeConfig,
        dir: &Path,
        device: &Device,
    ) -> Result<Self, FinetuneError> {
        let path = dir.join("model.safetensors");
        let tensors = candle_core::safetensors::load(&path, device)
            .map_err(|e| FinetuneError::runtime("load probe checkpoint", e))?;
        let var = |name: &str| -> Result<Var, FinetuneError> {
            let t = tensors.get(name).ok_or_else(|| {
                FinetuneError::data(format!(
                    "checkpoint {} is missing tensor '{name}'",
                    path.display()
                ))
            })?;
            Var::from_tensor(t).map_err(|e| FinetuneError::runtime("load probe checkpoint", e))
        };
        Ok(Self {
            feat_w: var("featurizer.weight")?,
            feat_b: var("featurizer.bias")?,
            head_w: var("lm_head.weight")?,
            head_b: var("lm_head.bias")?,
            device: device.clone(),
            config,
            featurizer_frozen: false,
            base_frozen: false,
        })
    }

    /// Reshapes `[batch, samples]` into `[batch, frames, window]`, zero-
    /// padding the tail so every sample lands in a frame.
    fn frames(&self, inputs: &Tensor) -> Result<Tensor, FinetuneError> {
        let on = |e| FinetuneError::runtime("frame inputs", e);
        let (batch, samples) = inputs.dims2().map_err(on)?;
        let window = self.config.window;
        let frames = samples.div_ceil(window).max(1);
        let padded = frames * window;
        let inputs = if padded == samples {
            inputs.clone()
        } else {
            let tail = Tensor::zeros((batch, padded - samples), inputs.dtype(), inputs.device())
                .map_err(on)?;
            Tensor::cat(&[inputs, &tail], 1).map_err(on)?
        };
        inputs.reshape((batch, frames, window)).map_err(on)
    }

    /// Frame logits `[batch, frames, vocab]`. Upcasts half-precision
    /// features to the weight dtype, so autocast batches pass through.
    fn forward_frames(&self, batch: &EncodedBatch, train: bool) -> Result<Tensor, FinetuneError> {
        let on = |e| FinetuneError::runtime("probe forward", e);
        let xs = batch
            .input_values
            .to_dtype(self.feat_w.dtype())
            .map_err(on)?;
        let xs = self.frames(&xs)?;
        let hidden = xs
            .broadcast_matmul(&self.feat_w.t().map_err(on)?)
            .and_then(|t| t.broadcast_add(self.feat_b.as_tensor()))
            .and_then(|t| t.relu())
            .map_err(on)?;
        let hidden = if train && self.config.dropout > 0.0 {
            dropout(&hidden, self.config.dropout).map_err(on)?
        } else {
            hidden
        };
        hidden
            .broadcast_matmul(&self.head_w.t().map_err(on)?)
            .and_then(|t| t.broadcast_add(self.head_b.as_tensor()))
            .map_err(on)
    }

    /// Frames backed by real input per row, from the attention mask.
    fn frame_lengths(&self, batch: &EncodedBatch, frames: usize) -> Result<Vec<usize>, FinetuneError> {
        let mask = batch
            .attention_mask
            .to_vec2::<u32>()
            .map_err(|e| FinetuneError::runtime("read attention mask", e))?;
        Ok(mask
            .iter()
            .map(|row| {
                let real: usize = row.iter().map(|&m| m as usize).sum();
                real.div_ceil(self.config.window).clamp(1, frames)
            })
            .collect())
    }

    /// Spreads each row's labels uniformly over its valid frames; frames
    /// past the row's real input keep the ignore sentinel.
    fn uniform_targets(
        &self,
        batch: &EncodedBatch,
        frames: usize,
    ) -> Result<Tensor, FinetuneError> {
        let labels = batch
            .labels
            .to_vec2::<i64>()
            .map_err(|e| FinetuneError::runtime("read labels", e))?;
        let frame_lengths = self.frame_lengths(batch, frames)?;

        let rows = labels.len();
        let mut targets = vec![LABEL_IGNORE_ID; rows * frames];
        for (row, row_labels) in labels.iter().enumerate() {
            let valid: Vec<i64> = row_labels.iter().copied().filter(|&l| l >= 0).collect();
            if valid.is_empty() {
                continue;
            }
            let span = frame_lengths[row];
            for j in 0..span {
                targets[row * frames + j] = valid[j * valid.len() / span];
            }
        }
        Tensor::from_vec(targets, (rows, frames), &self.device)
            .map_err(|e| FinetuneError::runtime("build frame targets", e))
    }
}

impl CtcModel for FrameProbe {
    fn forward_loss(&self, batch: &EncodedBatch, train: bool) -> Result<Tensor, FinetuneError> {
        let on = |e| FinetuneError::runtime("probe loss", e);
        let logits = self.forward_frames(batch, train)?;
        let (_, frames, vocab) = logits.dims3().map_err(on)?;
        let targets = self.uniform_targets(batch, frames)?;

        let log_probs = log_softmax(&logits, D::Minus1).map_err(on)?;
        let mask = targets
            .ge(0i64)
            .and_then(|t| t.to_dtype(log_probs.dtype()))
            .map_err(on)?;
        let safe = targets.clamp(0i64, (vocab - 1) as i64).map_err(on)?;
        let picked = log_probs
            .gather(&safe.unsqueeze(2).map_err(on)?, D::Minus1)
            .and_then(|t| t.squeeze(2))
            .map_err(on)?;

        let denom = mask
            .sum_all()
            .and_then(|t| t.to_scalar::<f32>())
            .map_err(on)?
            .max(1.0);
        picked
            .mul(&mask)
            .and_then(|t| t.sum_all())
            .and_then(|t| t.affine(-1.0 / denom as f64, 0.0))
            .and_then(|t| t.to_dtype(DType::F32))
            .map_err(on)
    }

    fn logits(&self, batch: &EncodedBatch) -> Result<(Tensor, Vec<usize>), FinetuneError> {
        let logits = self.forward_frames(batch, false)?;
        let frames = logits
            .dims3()
            .map_err(|e| FinetuneError::runtime("probe logits", e))?
            .1;
        let lengths = self.frame_lengths(batch, frames)?;
        Ok((logits, lengths))
    }

    fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = Vec::new();
        if !self.featurizer_frozen && !self.base_frozen {
            vars.push(self.feat_w.clone());
            vars.push(self.feat_b.clone());
        }
        vars.push(self.head_w.clone());
        vars.push(self.head_b.clone());
        vars
    }

    fn freeze_feature_extractor(&mut self) {
        self.featurizer_frozen = true;
    }

    fn freeze_base_model(&mut self) {
        self.base_frozen = true;
    }

    fn save_checkpoint(&self, dir: &Path) -> Result<(), FinetuneError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| FinetuneError::io("create checkpoint directory", e))?;
        let tensors = HashMap::from([
            ("featurizer.weight".to_string(), self.feat_w.as_tensor().clone()),
            ("featurizer.bias".to_string(), self.feat_b.as_tensor().clone()),
            ("lm_head.weight".to_string(), self.head_w.as_tensor().clone()),
            ("lm_head.bias".to_string(), self.head_b.as_tensor().clone()),
        ]);
        candle_core::safetensors::save(&tensors, dir.join("model.safetensors"))
            .map_err(|e| FinetuneError::runtime("save probe checkpoint", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::collator::{CollatorConfig, CtcCollator};
    use crate::processor::Features;

    fn config() -> FrameProbeConfig {
        FrameProbeConfig {
            window: 4,
            hidden: 8,
            vocab_size: 6,
            dropout: 0.0,
        }
    }

    fn batch(input_lens: &[usize], label_lens: &[usize]) -> EncodedBatch {
        let features: Vec<Features> = input_lens
            .iter()
            .zip(label_lens)
            .map(|(&n, &l)| Features {
                input_values: (0..n).map(|i| (i as f32 / 7.0).sin()).collect(),
                labels: (0..l).map(|i| (i % 5) as i64 + 1).collect(),
            })
            .collect();
        CtcCollator::new(Device::Cpu, CollatorConfig::default())
            .collate(&features)
            .expect("collate")
    }

    #[test]
    fn loss_is_finite_and_positive() {
        let probe = FrameProbe::new(config(), &Device::Cpu).unwrap();
        let loss = probe.forward_loss(&batch(&[16, 12], &[3, 2]), true).unwrap();
        let value = loss.to_scalar::<f32>().unwrap();
        assert!(value.is_finite());
        assert!(value > 0.0);
    }

    #[test]
    fn backward_reaches_all_trainable_vars() {
        let probe = FrameProbe::new(config(), &Device::Cpu).unwrap();
        let loss = probe.forward_loss(&batch(&[16], &[3]), true).unwrap();
        let grads = loss.backward().unwrap();
        for var in probe.trainable_vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
    }

    #[test]
    fn freezing_excludes_featurizer_vars() {
        let mut probe = FrameProbe::new(config(), &Device::Cpu).unwrap();
        assert_eq!(probe.trainable_vars().len(), 4);
        probe.freeze_feature_extractor();
        assert_eq!(probe.trainable_vars().len(), 2);
    }

    #[test]
    fn logits_shape_and_frame_lengths() {
        let probe = FrameProbe::new(config(), &Device::Cpu).unwrap();
        let (logits, lengths) = probe.logits(&batch(&[16, 8], &[3, 2])).unwrap();
        let (b, f, v) = logits.dims3().unwrap();
        assert_eq!((b, f, v), (2, 4, 6));
        assert_eq!(lengths, vec![4, 2]);
    }

    #[test]
    fn ragged_inputs_are_padded_into_frames() {
        let probe = FrameProbe::new(config(), &Device::Cpu).unwrap();
        let (logits, _) = probe.logits(&batch(&[10], &[2])).unwrap();
        // 10 samples, window 4 -> 3 frames
        assert_eq!(logits.dims3().unwrap().1, 3);
    }

    #[test]
    fn half_precision_features_are_accepted() {
        let probe = FrameProbe::new(config(), &Device::Cpu).unwrap();
        let half = batch(&[16], &[3]).to_feature_dtype(DType::F16).unwrap();
        let loss = probe.forward_loss(&half, true).unwrap();
        assert_eq!(loss.dtype(), DType::F32);
    }

    #[test]
    fn checkpoint_roundtrip_preserves_weights() {
        let dir = tempfile::tempdir().expect("tempdir");
        let probe = FrameProbe::new(config(), &Device::Cpu).unwrap();
        probe.save_checkpoint(dir.path()).unwrap();
        let restored = FrameProbe::from_checkpoint(config(), dir.path(), &Device::Cpu).unwrap();

        let b = batch(&[16], &[3]);
        let a = probe.forward_loss(&b, false).unwrap().to_scalar::<f32>().unwrap();
        let c = restored.forward_loss(&b, false).unwrap().to_scalar::<f32>().unwrap();
        assert!((a - c).abs() < 1e-6);
    }
}
