pub mod config;
pub mod corpus;
pub mod dataset;
pub mod error;
pub mod kfold;
pub mod metrics;
pub mod orthography;
pub mod processor;
pub mod trainer;

pub use config::{DataArguments, FinetuneArgs, ModelArguments, TrainingArguments};
pub use corpus::{CorpusRecord, CorpusTable, SchemaMapping};
pub use dataset::collator::{CollatorConfig, CtcCollator, EncodedBatch, LABEL_IGNORE_ID};
pub use dataset::filter::filter_by_max_duration;
pub use dataset::prepare::{prepare_split, ExamplePreparer, PreparedExample, TextUpdateLog};
pub use error::FinetuneError;
pub use kfold::{FoldOutcome, KFoldConfig, KFoldRunner, OutputDirSchedule};
pub use metrics::{compute_metrics, EvalMetrics};
pub use orthography::Orthography;
pub use processor::{CharTokenizer, FeatureExtractor, Features, Processor, VocabularyCleaner};
pub use trainer::precision::{GradScaler, PrecisionMode, PrecisionStrategy};
pub use trainer::probe::{FrameProbe, FrameProbeConfig};
pub use trainer::run::{TrainRunConfig, TrainSummary, Trainer};
pub use trainer::step::{LossReduction, StepOutput, TrainStepEngine};
pub use trainer::traits::{CtcModel, DistributedBackend, MixedPrecisionBackend};
