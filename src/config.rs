use std::path::PathBuf;

use clap::Parser;

/// Which model/checkpoint to fine-tune from.
#[derive(Debug, Clone, Parser)]
pub struct ModelArguments {
    /// Path to the pretrained starting checkpoint. Every fold restarts from
    /// this same checkpoint.
    #[arg(long, env = "W2V2_FT_MODEL")]
    pub model_name_or_path: PathBuf,
    /// Where cached artifacts (e.g. the preparation manifest) are stored.
    #[arg(long, env = "W2V2_FT_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,
    /// Freeze the feature-extractor layers of the model.
    #[arg(long, env = "W2V2_FT_FREEZE_FEATURE_EXTRACTOR", action = clap::ArgAction::Set, default_value_t = true)]
    pub freeze_feature_extractor: bool,
    /// Freeze the base model, leaving only the head trainable.
    #[arg(long, env = "W2V2_FT_FREEZE_BASE_MODEL", default_value_t = false)]
    pub freeze_base_model: bool,
    /// Log at DEBUG instead of INFO.
    #[arg(long, env = "W2V2_FT_VERBOSE", action = clap::ArgAction::Set, default_value_t = true)]
    pub verbose_logging: bool,
}

/// What data goes into training and evaluation.
#[derive(Debug, Clone, Parser)]
pub struct DataArguments {
    /// CSV corpus table with one row per utterance.
    #[arg(long, env = "W2V2_FT_DATASET")]
    pub dataset_path: PathBuf,
    /// Source column holding the audio file path.
    #[arg(long, env = "W2V2_FT_COLUMN_FILE", default_value = "file")]
    pub column_file: String,
    /// Source column holding the fold/split id.
    #[arg(long, env = "W2V2_FT_COLUMN_SPLIT", default_value = "split")]
    pub column_split: String,
    /// Source column holding the raw transcript.
    #[arg(long, env = "W2V2_FT_COLUMN_TEXT", default_value = "text")]
    pub column_text: String,
    /// Resample loaded audio to the feature extractor's sampling rate.
    #[arg(long, env = "W2V2_FT_RESAMPLE", action = clap::ArgAction::Set, default_value_t = true)]
    pub target_feature_extractor_sampling_rate: bool,
    /// Filters out examples longer than this many seconds. Defaults to no
    /// filtering.
    #[arg(long, env = "W2V2_FT_MAX_DURATION")]
    pub max_duration_in_seconds: Option<f64>,
    /// Orthography used for normalization and tokenization: 'librispeech',
    /// 'timit', or 'buckwalter'.
    #[arg(long, env = "W2V2_FT_ORTHOGRAPHY", default_value = "librispeech")]
    pub orthography: String,
    /// Vocabulary file for the tokenizer; overrides the orthography's
    /// bundled vocabulary.
    #[arg(long, env = "W2V2_FT_VOCAB")]
    pub vocab_path: Option<PathBuf>,
    /// Ignore (and rebuild) the cached preparation manifest.
    #[arg(long, env = "W2V2_FT_OVERWRITE_CACHE", default_value_t = false)]
    pub overwrite_cache: bool,
    /// Worker threads for example preparation.
    #[arg(long, env = "W2V2_FT_PREP_WORKERS", default_value_t = 1)]
    pub preprocessing_num_workers: usize,
}

/// Training hyperparameters owned by the trainer loop and the step engine.
#[derive(Debug, Clone, Parser)]
pub struct TrainingArguments {
    /// Base checkpoint directory; each fold derives its own suffix.
    #[arg(long, env = "W2V2_FT_OUTPUT_DIR")]
    pub output_dir: String,
    #[arg(long, env = "W2V2_FT_BATCH_SIZE", default_value_t = 8)]
    pub per_device_train_batch_size: usize,
    #[arg(long, env = "W2V2_FT_GRAD_ACCUM", default_value_t = 1)]
    pub gradient_accumulation_steps: usize,
    #[arg(long, env = "W2V2_FT_EPOCHS", default_value_t = 3)]
    pub num_train_epochs: usize,
    #[arg(long, env = "W2V2_FT_LR", default_value_t = 1e-4)]
    pub learning_rate: f64,
    /// Global-norm gradient clipping threshold; 0 disables clipping.
    #[arg(long, env = "W2V2_FT_MAX_GRAD_NORM", default_value_t = 1.0)]
    pub max_grad_norm: f64,
    #[arg(long, env = "W2V2_FT_SEED", default_value_t = 42)]
    pub seed: u64,
    /// Run a final prediction pass over validation data after training.
    #[arg(long, env = "W2V2_FT_LOAD_BEST", default_value_t = false)]
    pub load_best_model_at_end: bool,
    /// Numeric precision mode: 'full', 'amp', or 'bf16'.
    #[arg(long, env = "W2V2_FT_PRECISION", default_value = "full")]
    pub precision: String,
    /// Multi-device loss reduction: 'mean' or 'sum'.
    #[arg(long, env = "W2V2_FT_CTC_LOSS_REDUCTION", default_value = "mean")]
    pub ctc_loss_reduction: String,
    /// Replica count for multi-device loss reduction; 1 disables it.
    #[arg(long, env = "W2V2_FT_REPLICAS", default_value_t = 1)]
    pub replica_count: usize,
    /// First fold to run (inclusive).
    #[arg(long, env = "W2V2_FT_FIRST_FOLD", default_value_t = 0)]
    pub first_fold: u32,
    /// Fold count; folds run over first_fold..num_folds.
    #[arg(long, env = "W2V2_FT_NUM_FOLDS", default_value_t = 4)]
    pub num_folds: u32,
}

impl TrainingArguments {
    pub fn max_grad_norm_option(&self) -> Option<f64> {
        (self.max_grad_norm > 0.0).then_some(self.max_grad_norm)
    }
}

/// Full CLI surface of the fine-tuning binary.
#[derive(Debug, Parser)]
#[command(name = "finetune")]
#[command(about = "K-fold CTC fine-tuning over a labeled audio corpus")]
pub struct FinetuneArgs {
    #[command(flatten)]
    pub model: ModelArguments,
    #[command(flatten)]
    pub data: DataArguments,
    #[command(flatten)]
    pub training: TrainingArguments,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> FinetuneArgs {
        let mut argv = vec![
            "finetune",
            "--model-name-or-path",
            "ckpt",
            "--dataset-path",
            "corpus.csv",
            "--output-dir",
            "run",
        ];
        argv.extend_from_slice(extra);
        FinetuneArgs::parse_from(argv)
    }

    #[test]
    fn defaults_mirror_the_original_surface() {
        let args = parse(&[]);
        assert!(args.model.freeze_feature_extractor);
        assert!(!args.model.freeze_base_model);
        assert_eq!(args.data.orthography, "librispeech");
        assert!(args.data.max_duration_in_seconds.is_none());
        assert_eq!(args.training.ctc_loss_reduction, "mean");
        assert_eq!(args.training.precision, "full");
        assert_eq!(args.training.num_folds, 4);
    }

    #[test]
    fn grad_norm_zero_disables_clipping() {
        let args = parse(&["--max-grad-norm", "0"]);
        assert_eq!(args.training.max_grad_norm_option(), None);
        let args = parse(&["--max-grad-norm", "0.5"]);
        assert_eq!(args.training.max_grad_norm_option(), Some(0.5));
    }

    #[test]
    fn column_remapping_is_exposed() {
        let args = parse(&["--column-file", "recording_path", "--column-text", "transcript"]);
        assert_eq!(args.data.column_file, "recording_path");
        assert_eq!(args.data.column_text, "transcript");
        assert_eq!(args.data.column_split, "split");
    }
}
