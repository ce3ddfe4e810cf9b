use std::path::{Path, PathBuf};

use crate::error::FinetuneError;

/// Source CSV column names remapped onto the canonical {file, split, text}
/// record schema. Validated against the header at load time.
#[derive(Debug, Clone)]
pub struct SchemaMapping {
    pub file: String,
    pub split: String,
    pub text: String,
}

impl Default for SchemaMapping {
    fn default() -> Self {
        Self {
            file: "file".to_string(),
            split: "split".to_string(),
            text: "text".to_string(),
        }
    }
}

/// One utterance row: audio path, fold/split id, raw transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusRecord {
    pub file: PathBuf,
    pub split: u32,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct CorpusTable {
    records: Vec<CorpusRecord>,
}

impl CorpusTable {
    pub fn from_records(records: Vec<CorpusRecord>) -> Self {
        Self { records }
    }

    pub fn from_csv(path: &Path, mapping: &SchemaMapping) -> Result<Self, FinetuneError> {
        let mut reader = csv::Reader::from_path(path)
            .map_err(|e| FinetuneError::csv("open corpus table", e))?;

        let headers = reader
            .headers()
            .map_err(|e| FinetuneError::csv("read corpus header", e))?
            .clone();
        let column = |name: &str| headers.iter().position(|h| h == name);

        let wanted = [&mapping.file, &mapping.split, &mapping.text];
        let missing: Vec<&str> = wanted
            .iter()
            .filter(|name| column(name).is_none())
            .map(|name| name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(FinetuneError::data(format!(
                "corpus table '{}' is missing expected column(s): {}",
                path.display(),
                missing.join(", ")
            )));
        }
        let (file_idx, split_idx, text_idx) = (
            column(&mapping.file).unwrap_or_default(),
            column(&mapping.split).unwrap_or_default(),
            column(&mapping.text).unwrap_or_default(),
        );

        let mut records = Vec::new();
        for (row_idx, row) in reader.records().enumerate() {
            let row = row.map_err(|e| FinetuneError::csv("read corpus row", e))?;
            let field = |idx: usize| row.get(idx).unwrap_or_default();
            let split: u32 = field(split_idx).trim().parse().map_err(|_| {
                FinetuneError::data(format!(
                    "corpus row {}: split id '{}' is not an integer",
                    row_idx + 1,
                    field(split_idx)
                ))
            })?;
            records.push(CorpusRecord {
                file: PathBuf::from(field(file_idx)),
                split,
                text: field(text_idx).to_string(),
            });
        }

        tracing::info!(rows = records.len(), path = %path.display(), "corpus table loaded");
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rows whose split id differs from `fold` (the training subset).
    pub fn train_rows(&self, fold: u32) -> Vec<CorpusRecord> {
        self.records
            .iter()
            .filter(|r| r.split != fold)
            .cloned()
            .collect()
    }

    /// Rows held out for validation on `fold`.
    pub fn validation_rows(&self, fold: u32) -> Vec<CorpusRecord> {
        self.records
            .iter()
            .filter(|r| r.split == fold)
            .cloned()
            .collect()
    }
}
