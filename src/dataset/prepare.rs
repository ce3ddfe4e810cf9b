use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::corpus::CorpusRecord;
use crate::dataset::audio::{read_audio, resample_linear};
use crate::error::FinetuneError;
use crate::orthography::Orthography;
use crate::processor::VocabularyCleaner;

/// Per-utterance result of the preparation phase. Recomputed each fold,
/// since split membership differs.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedExample {
    pub samples: Vec<f32>,
    pub sample_rate_hz: u32,
    pub duration_secs: f64,
    pub text: String,
}

/// Buffer of (original, normalized) transcript pairs collected while a
/// split is prepared. Owned by the fold orchestrator for the fold's
/// lifetime; flushed once per fold so the log stays ordered by phase.
#[derive(Debug, Default)]
pub struct TextUpdateLog {
    updates: Vec<(String, String)>,
}

impl TextUpdateLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, original: String, updated: String) {
        self.updates.push((original, updated));
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Emits the aggregate count (WARN) and per-item detail (DEBUG), then
    /// drains the buffer.
    pub fn flush(&mut self, orthography_name: &str) {
        tracing::warn!(
            updated = self.updates.len(),
            orthography = orthography_name,
            "updated transcript(s) using orthography rules"
        );
        for (original, updated) in self.updates.drain(..) {
            tracing::debug!(%original, %updated, "updated text");
        }
    }
}

/// Per-sample transform: decode audio, compute duration, normalize and
/// clean the transcript against the active vocabulary.
#[derive(Clone)]
pub struct ExamplePreparer {
    orthography: Orthography,
    cleaner: VocabularyCleaner,
    target_sample_rate_hz: u32,
    resample: bool,
    manifest: Option<std::sync::Arc<PrepManifest>>,
}

impl ExamplePreparer {
    pub fn new(
        orthography: Orthography,
        cleaner: VocabularyCleaner,
        target_sample_rate_hz: u32,
        resample: bool,
    ) -> Self {
        Self {
            orthography,
            cleaner,
            target_sample_rate_hz,
            resample,
            manifest: None,
        }
    }

    /// Attaches a preparation manifest; rows found in it keep their cached
    /// normalized transcript and report no text update.
    pub fn with_manifest(mut self, manifest: std::sync::Arc<PrepManifest>) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn normalize_text(&self, text: &str) -> String {
        self.cleaner.clean(&self.orthography.preprocess(text))
    }

    /// Prepares one record. A changed transcript is reported alongside the
    /// example, never treated as a failure.
    pub fn prepare(
        &self,
        record: &CorpusRecord,
    ) -> Result<(PreparedExample, Option<(String, String)>), FinetuneError> {
        let decoded = read_audio(&record.file)?;
        let (samples, sample_rate_hz) =
            if self.resample && decoded.sample_rate_hz != self.target_sample_rate_hz {
                (
                    resample_linear(
                        &decoded.samples,
                        decoded.sample_rate_hz,
                        self.target_sample_rate_hz,
                    ),
                    self.target_sample_rate_hz,
                )
            } else {
                (decoded.samples, decoded.sample_rate_hz)
            };
        let duration_secs = samples.len() as f64 / self.target_sample_rate_hz as f64;

        let cached = self
            .manifest
            .as_ref()
            .and_then(|m| m.get(&record.file))
            .map(|entry| entry.text.clone());
        let (updated, change) = match cached {
            Some(text) => (text, None),
            None => {
                let updated = self.normalize_text(&record.text);
                let change = if updated != record.text {
                    Some((record.text.clone(), updated.clone()))
                } else {
                    None
                };
                (updated, change)
            }
        };

        Ok((
            PreparedExample {
                samples,
                sample_rate_hz,
                duration_secs,
                text: updated,
            },
            change,
        ))
    }
}

/// Prepares a whole split, optionally across a worker pool. Workers own
/// disjoint row chunks; results and text updates are merged in chunk order
/// so the change log stays deterministic and single-writer.
pub fn prepare_split(
    records: &[CorpusRecord],
    preparer: &ExamplePreparer,
    num_workers: usize,
    log: &mut TextUpdateLog,
) -> Result<Vec<PreparedExample>, FinetuneError> {
    let workers = num_workers.max(1).min(records.len().max(1));
    let chunk_size = records.len().div_ceil(workers);

    let chunk_results: Vec<Result<Vec<_>, FinetuneError>> = if workers <= 1 {
        vec![prepare_chunk(records, preparer)]
    } else {
        std::thread::scope(|scope| {
            let handles: Vec<_> = records
                .chunks(chunk_size)
                .map(|chunk| scope.spawn(move || prepare_chunk(chunk, preparer)))
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(result) => result,
                    Err(_) => Err(FinetuneError::runtime(
                        "prepare split",
                        "preparation worker panicked",
                    )),
                })
                .collect()
        })
    };

    let mut prepared = Vec::with_capacity(records.len());
    for chunk in chunk_results {
        for (example, change) in chunk? {
            if let Some((original, updated)) = change {
                log.push(original, updated);
            }
            prepared.push(example);
        }
    }
    Ok(prepared)
}

#[allow(clippy::type_complexity)]
fn prepare_chunk(
    records: &[CorpusRecord],
    preparer: &ExamplePreparer,
) -> Result<Vec<(PreparedExample, Option<(String, String)>)>, FinetuneError> {
    records.iter().map(|r| preparer.prepare(r)).collect()
}

/// On-disk cache of per-file durations and normalized transcripts, keyed by
/// audio path. Lets later folds pre-filter rows by duration before any
/// decode, and skips re-normalizing (and re-logging) unchanged transcripts.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PrepManifest {
    entries: HashMap<String, ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub duration_secs: f64,
    pub text: String,
}

impl PrepManifest {
    pub fn path_for(cache_dir: &Path) -> PathBuf {
        cache_dir.join("prep_manifest.json")
    }

    pub fn load(path: &Path) -> Result<Self, FinetuneError> {
        let data =
            std::fs::read_to_string(path).map_err(|e| FinetuneError::io("read prep manifest", e))?;
        serde_json::from_str(&data).map_err(|e| FinetuneError::json("parse prep manifest", e))
    }

    pub fn save(&self, path: &Path) -> Result<(), FinetuneError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FinetuneError::io("create cache directory", e))?;
        }
        let data = serde_json::to_string(self)
            .map_err(|e| FinetuneError::json("serialize prep manifest", e))?;
        std::fs::write(path, data).map_err(|e| FinetuneError::io("write prep manifest", e))
    }

    pub fn get(&self, file: &Path) -> Option<&ManifestEntry> {
        self.entries.get(&file.to_string_lossy().into_owned())
    }

    pub fn insert(&mut self, file: &Path, entry: ManifestEntry) {
        self.entries
            .insert(file.to_string_lossy().into_owned(), entry);
    }

    pub fn record_split(&mut self, records: &[CorpusRecord], examples: &[PreparedExample]) {
        for (record, example) in records.iter().zip(examples) {
            self.insert(
                &record.file,
                ManifestEntry {
                    duration_secs: example.duration_secs,
                    text: example.text.clone(),
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
