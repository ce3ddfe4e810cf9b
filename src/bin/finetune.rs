use std::path::PathBuf;

use candle_core::Device;
use clap::Parser;
use indicatif::ProgressBar;
use tracing_subscriber::EnvFilter;

use wav2vec2_finetune::{
    CollatorConfig, CorpusTable, ExamplePreparer, FinetuneArgs, FinetuneError, FrameProbe,
    FrameProbeConfig, KFoldConfig, KFoldRunner, LossReduction, Orthography, PrecisionMode,
    Processor, SchemaMapping, TrainRunConfig,
};

fn main() {
    let args = FinetuneArgs::parse();
    configure_logger(args.model.verbose_logging);

    if let Err(err) = run(args) {
        tracing::error!(error = %err, "fine-tuning run failed");
        std::process::exit(1);
    }
}

fn configure_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn select_device() -> Result<Device, FinetuneError> {
    #[cfg(feature = "cuda")]
    {
        Device::new_cuda(0).map_err(|e| FinetuneError::runtime("CUDA init", e))
    }

    #[cfg(not(feature = "cuda"))]
    {
        Ok(Device::Cpu)
    }
}

fn run(args: FinetuneArgs) -> Result<(), FinetuneError> {
    // Resolve every named configuration value before touching data, so bad
    // configuration halts the run ahead of any fold.
    let orthography = Orthography::from_name(&args.data.orthography.to_lowercase())?;
    let precision = PrecisionMode::from_name(&args.training.precision)?;
    let loss_reduction = LossReduction::from_name(&args.training.ctc_loss_reduction)?;
    let device = select_device()?;

    let vocab_path = resolve_vocab_path(&args, &orthography)?;
    let processor = Processor::from_files(
        &vocab_path,
        &orthography,
        wav2vec2_finetune::FeatureExtractor::DEFAULT_SAMPLE_RATE_HZ,
    )?;

    let mapping = SchemaMapping {
        file: args.data.column_file.clone(),
        split: args.data.column_split.clone(),
        text: args.data.column_text.clone(),
    };
    let corpus = CorpusTable::from_csv(&args.data.dataset_path, &mapping)?;

    let preparer = ExamplePreparer::new(
        orthography,
        processor.cleaner(),
        processor.feature_extractor.sample_rate_hz,
        args.data.target_feature_extractor_sampling_rate,
    );

    let probe_config = FrameProbeConfig {
        vocab_size: processor.tokenizer.vocab_size(),
        ..FrameProbeConfig::default()
    };
    let checkpoint_dir = ensure_starting_checkpoint(
        &args.model.model_name_or_path,
        &probe_config,
        &device,
    )?;
    let factory_device = device.clone();
    let factory_config = probe_config.clone();
    let model_factory = move |_fold: u32| {
        FrameProbe::from_checkpoint(factory_config.clone(), &checkpoint_dir, &factory_device)
    };

    let train_config = TrainRunConfig {
        num_train_epochs: args.training.num_train_epochs,
        per_device_train_batch_size: args.training.per_device_train_batch_size,
        gradient_accumulation_steps: args.training.gradient_accumulation_steps,
        learning_rate: args.training.learning_rate,
        max_grad_norm: args.training.max_grad_norm_option(),
        seed: args.training.seed,
    };
    let kfold_config = KFoldConfig {
        first_fold: args.training.first_fold,
        num_folds: args.training.num_folds,
        output_dir: args.training.output_dir.clone(),
        load_best_model_at_end: args.training.load_best_model_at_end,
        max_duration_secs: args.data.max_duration_in_seconds,
        preprocessing_num_workers: args.data.preprocessing_num_workers,
        cache_dir: args.model.cache_dir.clone(),
        overwrite_cache: args.data.overwrite_cache,
        orthography_name: args.data.orthography.clone(),
        freeze_feature_extractor: args.model.freeze_feature_extractor,
        freeze_base_model: args.model.freeze_base_model,
        precision,
        loss_reduction,
        replica_count: args.training.replica_count,
    };

    let mut runner = KFoldRunner::new(
        device,
        corpus,
        processor,
        preparer,
        CollatorConfig::default(),
        train_config,
        kfold_config,
        model_factory,
    );

    let spinner = ProgressBar::new_spinner();
    spinner.set_message("running folds");
    spinner.enable_steady_tick(std::time::Duration::from_millis(120));
    let outcomes = runner.run();
    spinner.finish_and_clear();
    let outcomes = outcomes?;

    for outcome in &outcomes {
        match &outcome.metrics {
            Some(metrics) => tracing::info!(
                fold = outcome.fold,
                output_dir = %outcome.output_dir.display(),
                wer = metrics.wer,
                cer = metrics.cer,
                "fold complete"
            ),
            None => tracing::info!(
                fold = outcome.fold,
                output_dir = %outcome.output_dir.display(),
                "fold complete"
            ),
        }
    }
    Ok(())
}

fn resolve_vocab_path(
    args: &FinetuneArgs,
    orthography: &Orthography,
) -> Result<PathBuf, FinetuneError> {
    if let Some(path) = &args.data.vocab_path {
        return Ok(path.clone());
    }
    if let Some(path) = &orthography.vocab_file {
        return Ok(path.clone());
    }
    let from_model = args.model.model_name_or_path.join("vocab.json");
    if from_model.exists() {
        return Ok(from_model);
    }
    Err(FinetuneError::config(format!(
        "no vocabulary file: pass --vocab-path or place vocab.json under {}",
        args.model.model_name_or_path.display()
    )))
}

/// The bundled probe stands in for an externally-provided acoustic model.
/// All folds start from one shared checkpoint; when none exists yet, a
/// freshly-initialized one is written so reruns stay comparable.
fn ensure_starting_checkpoint(
    model_dir: &PathBuf,
    config: &FrameProbeConfig,
    device: &Device,
) -> Result<PathBuf, FinetuneError> {
    if !model_dir.join("model.safetensors").exists() {
        tracing::info!(dir = %model_dir.display(), "no starting checkpoint found; initializing one");
        use wav2vec2_finetune::CtcModel;
        let probe = FrameProbe::new(config.clone(), device)?;
        probe.save_checkpoint(model_dir)?;
    }
    Ok(model_dir.clone())
}
