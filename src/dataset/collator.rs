use candle_core::{DType, Device, Tensor};

use crate::error::FinetuneError;
use crate::processor::Features;

/// Label value excluded from loss computation at padded positions.
pub const LABEL_IGNORE_ID: i64 = -100;

/// Padding controls; `None` everywhere means "pad to the batch's own
/// longest sequence".
#[derive(Debug, Clone, Default)]
pub struct CollatorConfig {
    pub max_length: Option<usize>,
    pub max_length_labels: Option<usize>,
    pub pad_to_multiple_of: Option<usize>,
    pub pad_to_multiple_of_labels: Option<usize>,
}

/// Padded tensors for one optimization step.
///
/// Every label position outside an example's original span holds
/// [`LABEL_IGNORE_ID`]; the attention mask is 1 over real input samples
/// and 0 over padding.
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    pub input_values: Tensor,
    pub attention_mask: Tensor,
    pub labels: Tensor,
}

impl EncodedBatch {
    pub fn to_device(&self, device: &Device) -> Result<Self, FinetuneError> {
        Ok(Self {
            input_values: self
                .input_values
                .to_device(device)
                .map_err(|e| FinetuneError::runtime("move inputs to device", e))?,
            attention_mask: self
                .attention_mask
                .to_device(device)
                .map_err(|e| FinetuneError::runtime("move mask to device", e))?,
            labels: self
                .labels
                .to_device(device)
                .map_err(|e| FinetuneError::runtime("move labels to device", e))?,
        })
    }

    /// Casts the feature tensor only; mask and labels keep their dtypes.
    pub fn to_feature_dtype(&self, dtype: DType) -> Result<Self, FinetuneError> {
        Ok(Self {
            input_values: self
                .input_values
                .to_dtype(dtype)
                .map_err(|e| FinetuneError::runtime("cast inputs", e))?,
            attention_mask: self.attention_mask.clone(),
            labels: self.labels.clone(),
        })
    }

    /// Count of non-ignored label positions across the batch.
    pub fn label_positions(&self) -> Result<usize, FinetuneError> {
        let valid = self
            .labels
            .ge(0i64)
            .and_then(|t| t.to_dtype(DType::U32))
            .and_then(|t| t.sum_all())
            .and_then(|t| t.to_scalar::<u32>())
            .map_err(|e| FinetuneError::runtime("count label positions", e))?;
        Ok(valid as usize)
    }
}

/// Groups variable-length examples into padded tensors. Batch assembly
/// never mutates its inputs; the output tensors are independent copies.
#[derive(Debug, Clone)]
pub struct CtcCollator {
    device: Device,
    config: CollatorConfig,
}

impl CtcCollator {
    pub fn new(device: Device, config: CollatorConfig) -> Self {
        Self { device, config }
    }

    pub fn collate(&self, features: &[Features]) -> Result<EncodedBatch, FinetuneError> {
        if features.is_empty() {
            return Err(FinetuneError::data("cannot collate an empty batch"));
        }
        let batch = features.len();

        let input_len = padded_length(
            features.iter().map(|f| f.input_values.len()),
            self.config.max_length,
            self.config.pad_to_multiple_of,
        );
        let label_len = padded_length(
            features.iter().map(|f| f.labels.len()),
            self.config.max_length_labels,
            self.config.pad_to_multiple_of_labels,
        );

        let mut inputs = vec![0f32; batch * input_len];
        let mut mask = vec![0u32; batch * input_len];
        let mut labels = vec![LABEL_IGNORE_ID; batch * label_len];
        for (row, f) in features.iter().enumerate() {
            let n = f.input_values.len().min(input_len);
            inputs[row * input_len..row * input_len + n].copy_from_slice(&f.input_values[..n]);
            mask[row * input_len..row * input_len + n].fill(1);
            let l = f.labels.len().min(label_len);
            labels[row * label_len..row * label_len + l].copy_from_slice(&f.labels[..l]);
        }

        let on = |e| FinetuneError::runtime("build batch tensor", e);
        Ok(EncodedBatch {
            input_values: Tensor::from_vec(inputs, (batch, input_len), &self.device).map_err(on)?,
            attention_mask: Tensor::from_vec(mask, (batch, input_len), &self.device).map_err(on)?,
            labels: Tensor::from_vec(labels, (batch, label_len), &self.device).map_err(on)?,
        })
    }
}

fn padded_length(
    lengths: impl Iterator<Item = usize>,
    fixed: Option<usize>,
    multiple_of: Option<usize>,
) -> usize {
    let longest = lengths.max().unwrap_or(0);
    let target = fixed.unwrap_or(longest).max(1);
    match multiple_of {
        Some(m) if m > 1 => target.div_ceil(m) * m,
        _ => target,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(inputs: &[usize], labels: &[usize]) -> Vec<Features> {
        inputs
            .iter()
            .zip(labels)
            .map(|(&n, &l)| Features {
                input_values: (0..n).map(|i| i as f32 + 1.0).collect(),
                labels: (0..l).map(|i| i as i64 + 1).collect(),
            })
            .collect()
    }

    fn collator(config: CollatorConfig) -> CtcCollator {
        CtcCollator::new(Device::Cpu, config)
    }

    #[test]
    fn pads_to_the_batch_longest_sequence() {
        let batch = collator(CollatorConfig::default())
            .collate(&features(&[4, 2], &[3, 1]))
            .unwrap();
        assert_eq!(batch.input_values.dims(), &[2, 4]);
        assert_eq!(batch.labels.dims(), &[2, 3]);

        let mask = batch.attention_mask.to_vec2::<u32>().unwrap();
        assert_eq!(mask, vec![vec![1, 1, 1, 1], vec![1, 1, 0, 0]]);
    }

    #[test]
    fn label_padding_uses_the_ignore_sentinel() {
        let batch = collator(CollatorConfig::default())
            .collate(&features(&[4, 4], &[3, 1]))
            .unwrap();
        let labels = batch.labels.to_vec2::<i64>().unwrap();
        assert_eq!(labels[0], vec![1, 2, 3]);
        assert_eq!(labels[1], vec![1, LABEL_IGNORE_ID, LABEL_IGNORE_ID]);
        // no sentinel inside an example's original span
        assert!(labels[0].iter().all(|&l| l != LABEL_IGNORE_ID));
    }

    #[test]
    fn fixed_max_length_overrides_batch_longest() {
        let config = CollatorConfig {
            max_length: Some(8),
            max_length_labels: Some(5),
            ..CollatorConfig::default()
        };
        let batch = collator(config).collate(&features(&[4, 2], &[3, 1])).unwrap();
        assert_eq!(batch.input_values.dims(), &[2, 8]);
        assert_eq!(batch.labels.dims(), &[2, 5]);
    }

    #[test]
    fn multiple_of_alignment_rounds_up() {
        let config = CollatorConfig {
            pad_to_multiple_of: Some(8),
            pad_to_multiple_of_labels: Some(4),
            ..CollatorConfig::default()
        };
        let batch = collator(config).collate(&features(&[5, 3], &[3, 2])).unwrap();
        assert_eq!(batch.input_values.dims(), &[2, 8]);
        assert_eq!(batch.labels.dims(), &[2, 4]);
    }

    #[test]
    fn collation_does_not_mutate_inputs() {
        let original = features(&[4, 2], &[2, 1]);
        let snapshot = original.clone();
        let _ = collator(CollatorConfig::default()).collate(&original).unwrap();
        assert_eq!(original, snapshot);
    }

    #[test]
    fn label_positions_counts_non_ignored() {
        let batch = collator(CollatorConfig::default())
            .collate(&features(&[4, 4], &[3, 2]))
            .unwrap();
        assert_eq!(batch.label_positions().unwrap(), 5);
    }

    #[test]
    fn empty_batch_is_rejected() {
        let err = collator(CollatorConfig::default()).collate(&[]).unwrap_err();
        assert!(matches!(err, FinetuneError::Data { .. }));
    }
}
