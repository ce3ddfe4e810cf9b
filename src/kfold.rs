use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::Device;
use chrono::Utc;

use crate::corpus::{CorpusRecord, CorpusTable};
use crate::dataset::collator::{CollatorConfig, CtcCollator};
use crate::dataset::filter::filter_by_max_duration;
use crate::dataset::prepare::{prepare_split, ExamplePreparer, PrepManifest, TextUpdateLog};
use crate::error::FinetuneError;
use crate::metrics::EvalMetrics;
use crate::processor::Processor;
use crate::trainer::precision::PrecisionMode;
use crate::trainer::run::{TrainRunConfig, Trainer};
use crate::trainer::step::{LossReduction, TrainStepEngine};
use crate::trainer::traits::CtcModel;

/// Per-fold checkpoint directory naming: the first executed fold appends
/// its suffix to the base path, every later fold rewrites the previous
/// fold's suffix in place. Folds must therefore run strictly in sequence.
#[derive(Debug, Clone)]
pub struct OutputDirSchedule {
    base: String,
    current: Option<(u32, String)>,
}

impl OutputDirSchedule {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            current: None,
        }
    }

    pub fn advance(&mut self, fold: u32) -> String {
        let next = match &self.current {
            None => format!("{}_fold_{fold}", self.base),
            Some((previous, dir)) => {
                dir.replace(&format!("_fold_{previous}"), &format!("_fold_{fold}"))
            }
        };
        self.current = Some((fold, next.clone()));
        next
    }
}

#[derive(Debug, Clone)]
pub struct KFoldConfig {
    pub first_fold: u32,
    pub num_folds: u32,
    pub output_dir: String,
    pub load_best_model_at_end: bool,
    pub max_duration_secs: Option<f64>,
    pub preprocessing_num_workers: usize,
    pub cache_dir: Option<PathBuf>,
    pub overwrite_cache: bool,
    pub orthography_name: String,
    pub freeze_feature_extractor: bool,
    pub freeze_base_model: bool,
    pub precision: PrecisionMode,
    pub loss_reduction: LossReduction,
    pub replica_count: usize,
}

#[derive(Debug, Clone)]
pub struct FoldOutcome {
    pub fold: u32,
    pub output_dir: PathBuf,
    pub train_size: usize,
    pub validation_size: usize,
    pub metrics: Option<EvalMetrics>,
}

/// Drives the whole run: fold selection, fresh per-fold preparation,
/// training, and optional post-training evaluation. One logical thread;
/// fold order matters for output-directory naming.
pub struct KFoldRunner<M, F>
where
    M: CtcModel,
    F: FnMut(u32) -> Result<M, FinetuneError>,
{
    device: Device,
    corpus: CorpusTable,
    processor: Processor,
    preparer: ExamplePreparer,
    collator_config: CollatorConfig,
    train_config: TrainRunConfig,
    config: KFoldConfig,
    /// Builds each fold's model from the single shared starting checkpoint.
    model_factory: F,
}

impl<M, F> KFoldRunner<M, F>
where
    M: CtcModel,
    F: FnMut(u32) -> Result<M, FinetuneError>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Device,
        corpus: CorpusTable,
        processor: Processor,
        preparer: ExamplePreparer,
        collator_config: CollatorConfig,
        train_config: TrainRunConfig,
        config: KFoldConfig,
        model_factory: F,
    ) -> Self {
        Self {
            device,
            corpus,
            processor,
            preparer,
            collator_config,
            train_config,
            config,
            model_factory,
        }
    }

    pub fn run(&mut self) -> Result<Vec<FoldOutcome>, FinetuneError> {
        let mut schedule = OutputDirSchedule::new(self.config.output_dir.clone());
        let mut outcomes = Vec::new();
        for fold in self.config.first_fold..self.config.num_folds {
            tracing::info!(fold, "fold started");
            outcomes.push(self.run_fold(fold, &mut schedule)?);
        }
        Ok(outcomes)
    }

    fn run_fold(
        &mut self,
        fold: u32,
        schedule: &mut OutputDirSchedule,
    ) -> Result<FoldOutcome, FinetuneError> {
        let manifest = self.load_manifest()?;
        let preparer = match &manifest {
            Some(m) => self.preparer.clone().with_manifest(Arc::clone(m)),
            None => self.preparer.clone(),
        };

        let train_rows = self.prefilter(self.corpus.train_rows(fold), manifest.as_deref());
        let val_rows = self.prefilter(self.corpus.validation_rows(fold), manifest.as_deref());

        let mut text_updates = TextUpdateLog::new();
        let workers = self.config.preprocessing_num_workers;
        let train_examples = prepare_split(&train_rows, &preparer, workers, &mut text_updates)?;
        let val_examples = prepare_split(&val_rows, &preparer, workers, &mut text_updates)?;
        self.save_manifest(&train_rows, &train_examples, &val_rows, &val_examples)?;
        text_updates.flush(&self.config.orthography_name);

        let train_examples =
            filter_by_max_duration(train_examples, self.config.max_duration_secs, "train");
        let val_examples =
            filter_by_max_duration(val_examples, self.config.max_duration_secs, "validation");
        tracing::info!(
            train = train_examples.len(),
            validation = val_examples.len(),
            "split sizes"
        );

        let train_features = self.processor.encode_split(&train_examples)?;
        let val_features = self.processor.encode_split(&val_examples)?;

        let mut model = (self.model_factory)(fold)?;
        if self.config.freeze_feature_extractor {
            model.freeze_feature_extractor();
        }
        if self.config.freeze_base_model {
            model.freeze_base_model();
        }

        let output_dir = PathBuf::from(schedule.advance(fold));
        tracing::info!(output_dir = %output_dir.display(), fold, "output folder");

        let engine = TrainStepEngine::new(
            self.device.clone(),
            self.config.precision,
            self.config.loss_reduction,
            self.config.replica_count,
            self.train_config.gradient_accumulation_steps,
        )?;
        let collator = CtcCollator::new(self.device.clone(), self.collator_config.clone());
        let mut trainer = Trainer::new(
            model,
            engine,
            collator,
            self.train_config.clone(),
            output_dir.clone(),
        );
        trainer.train(&train_features)?;

        let metrics = if self.config.load_best_model_at_end {
            let metrics = trainer.evaluate(&val_features, &self.processor.tokenizer)?;
            tracing::info!(fold, wer = metrics.wer, cer = metrics.cer, "validation metrics");
            self.write_metrics_report(&output_dir, fold, &metrics)?;
            Some(metrics)
        } else {
            None
        };

        Ok(FoldOutcome {
            fold,
            output_dir,
            train_size: train_features.len(),
            validation_size: val_features.len(),
            metrics,
        })
    }

    fn load_manifest(&self) -> Result<Option<Arc<PrepManifest>>, FinetuneError> {
        let Some(cache_dir) = &self.config.cache_dir else {
            return Ok(None);
        };
        if self.config.overwrite_cache {
            return Ok(None);
        }
        let path = PrepManifest::path_for(cache_dir);
        if !path.exists() {
            return Ok(None);
        }
        let manifest = PrepManifest::load(&path)?;
        tracing::debug!(entries = manifest.len(), path = %path.display(), "prep manifest loaded");
        Ok(Some(Arc::new(manifest)))
    }

    /// Drops rows whose cached duration already exceeds the threshold,
    /// before any audio decode happens.
    fn prefilter(
        &self,
        rows: Vec<CorpusRecord>,
        manifest: Option<&PrepManifest>,
    ) -> Vec<CorpusRecord> {
        let (Some(max), Some(manifest)) = (self.config.max_duration_secs, manifest) else {
            return rows;
        };
        let before = rows.len();
        let kept: Vec<CorpusRecord> = rows
            .into_iter()
            .filter(|row| match manifest.get(&row.file) {
                Some(entry) => entry.duration_secs <= max,
                None => true,
            })
            .collect();
        let skipped = before - kept.len();
        if skipped > 0 {
            tracing::debug!(skipped, "rows skipped by cached duration before decoding");
        }
        kept
    }

    fn save_manifest(
        &self,
        train_rows: &[CorpusRecord],
        train_examples: &[crate::dataset::prepare::PreparedExample],
        val_rows: &[CorpusRecord],
        val_examples: &[crate::dataset::prepare::PreparedExample],
    ) -> Result<(), FinetuneError> {
        let Some(cache_dir) = &self.config.cache_dir else {
            return Ok(());
        };
        let path = PrepManifest::path_for(cache_dir);
        let mut manifest = if path.exists() && !self.config.overwrite_cache {
            PrepManifest::load(&path)?
        } else {
            PrepManifest::default()
        };
        manifest.record_split(train_rows, train_examples);
        manifest.record_split(val_rows, val_examples);
        manifest.save(&path)
    }

    fn write_metrics_report(
        &self,
        output_dir: &Path,
        fold: u32,
        metrics: &EvalMetrics,
    ) -> Result<(), FinetuneError> {
        let report = serde_json::json!({
            "fold": fold,
            "wer": metrics.wer,
            "cer": metrics.cer,
            "generated_at": Utc::now().to_rfc3339(),
        });
        let path = output_dir.join("metrics.json");
        std::fs::write(
            &path,
            serde_json::to_string_pretty(&report)
                .map_err(|e| FinetuneError::json("serialize metrics report", e))?,
        )
        .map_err(|e| FinetuneError::io("write metrics report", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fold_appends_suffix() {
        let mut schedule = OutputDirSchedule::new("run");
        assert_eq!(schedule.advance(0), "run_fold_0");
    }

    #[test]
    fn later_folds_replace_the_previous_suffix() {
        let mut schedule = OutputDirSchedule::new("run");
        assert_eq!(schedule.advance(0), "run_fold_0");
        assert_eq!(schedule.advance(1), "run_fold_1");
        assert_eq!(schedule.advance(2), "run_fold_2");
    }

    #[test]
    fn starting_mid_range_still_appends_first() {
        let mut schedule = OutputDirSchedule::new("out/model");
        assert_eq!(schedule.advance(2), "out/model_fold_2");
        assert_eq!(schedule.advance(3), "out/model_fold_3");
    }
}
