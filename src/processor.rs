use std::collections::HashMap;
use std::path::Path;

use crate::dataset::prepare::PreparedExample;
use crate::error::FinetuneError;
use crate::orthography::Orthography;

/// One encoded example: normalized waveform features and label ids.
#[derive(Debug, Clone, PartialEq)]
pub struct Features {
    pub input_values: Vec<f32>,
    pub labels: Vec<i64>,
}

/// Character-level CTC tokenizer over an HF-style `vocab.json` symbol table.
///
/// Single-character symbols form the character vocabulary; the pad token
/// doubles as the CTC blank.
#[derive(Debug, Clone)]
pub struct CharTokenizer {
    vocab: HashMap<char, u32>,
    id_to_char: HashMap<u32, char>,
    pad_id: u32,
    unk_id: Option<u32>,
    word_delimiter_token: char,
    do_lower_case: bool,
}

impl CharTokenizer {
    pub fn from_vocab_file(
        path: &Path,
        word_delimiter_token: char,
        do_lower_case: bool,
    ) -> Result<Self, FinetuneError> {
        let data =
            std::fs::read_to_string(path).map_err(|e| FinetuneError::io("read vocab.json", e))?;
        let raw: HashMap<String, u32> =
            serde_json::from_str(&data).map_err(|e| FinetuneError::json("parse vocab.json", e))?;

        let pad_id = raw.get("<pad>").copied().unwrap_or(0);
        let unk_id = raw.get("<unk>").copied();

        let mut vocab = HashMap::new();
        let mut id_to_char = HashMap::new();
        for (symbol, id) in &raw {
            let mut chars = symbol.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                vocab.insert(c, *id);
                id_to_char.insert(*id, c);
            }
        }

        if !vocab.contains_key(&word_delimiter_token) {
            return Err(FinetuneError::config(format!(
                "word delimiter '{word_delimiter_token}' is not in the vocabulary at {}",
                path.display()
            )));
        }

        Ok(Self {
            vocab,
            id_to_char,
            pad_id,
            unk_id,
            word_delimiter_token,
            do_lower_case,
        })
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn do_lower_case(&self) -> bool {
        self.do_lower_case
    }

    pub fn vocab_size(&self) -> usize {
        let max_single = self.id_to_char.keys().max().copied().unwrap_or(0);
        let max_special = self.unk_id.unwrap_or(0).max(self.pad_id);
        (max_single.max(max_special) + 1) as usize
    }

    /// Characters the tokenizer can emit, word delimiter excluded.
    pub fn vocab_chars(&self) -> Vec<char> {
        self.vocab
            .keys()
            .copied()
            .filter(|c| *c != self.word_delimiter_token)
            .collect()
    }

    pub fn encode(&self, text: &str) -> Vec<i64> {
        let text = if self.do_lower_case {
            text.to_lowercase()
        } else {
            text.to_string()
        };
        let mut ids = Vec::with_capacity(text.len());
        for (i, word) in text.split_whitespace().enumerate() {
            if i > 0 {
                if let Some(&sep) = self.vocab.get(&self.word_delimiter_token) {
                    ids.push(sep as i64);
                }
            }
            for c in word.chars() {
                match self.vocab.get(&c).copied().or(self.unk_id) {
                    Some(id) => ids.push(id as i64),
                    None => continue,
                }
            }
        }
        ids
    }

    /// Greedy CTC decode: collapse repeated ids, drop blanks, map the word
    /// delimiter back to a space.
    pub fn decode_grouped(&self, ids: &[u32]) -> String {
        let mut out = String::new();
        let mut prev: Option<u32> = None;
        for &id in ids {
            if prev == Some(id) {
                continue;
            }
            prev = Some(id);
            if id == self.pad_id {
                continue;
            }
            if let Some(&c) = self.id_to_char.get(&id) {
                out.push(if c == self.word_delimiter_token { ' ' } else { c });
            }
        }
        out.trim().to_string()
    }

    /// Decodes reference label ids verbatim (no CTC grouping), skipping the
    /// ignore sentinel used for padded label positions.
    pub fn decode_labels(&self, ids: &[i64]) -> String {
        let mut out = String::new();
        for &id in ids {
            if id < 0 {
                continue;
            }
            let id = id as u32;
            if id == self.pad_id {
                continue;
            }
            if let Some(&c) = self.id_to_char.get(&id) {
                out.push(if c == self.word_delimiter_token { ' ' } else { c });
            }
        }
        out.trim().to_string()
    }
}

/// Removes characters the tokenizer cannot emit, keeping whitespace.
/// Case-insensitive when the orthography lowercases before encoding.
#[derive(Debug, Clone)]
pub struct VocabularyCleaner {
    chars: Vec<char>,
    case_insensitive: bool,
}

impl VocabularyCleaner {
    pub fn new(vocab_chars: Vec<char>, case_insensitive: bool) -> Self {
        Self {
            chars: vocab_chars,
            case_insensitive,
        }
    }

    fn keeps(&self, c: char) -> bool {
        if c.is_whitespace() {
            return true;
        }
        if self.case_insensitive {
            self.chars.iter().any(|v| v.to_lowercase().eq(c.to_lowercase()))
        } else {
            self.chars.contains(&c)
        }
    }

    pub fn clean(&self, text: &str) -> String {
        text.chars().filter(|&c| self.keeps(c)).collect()
    }
}

/// Zero-mean / unit-variance waveform normalization at a fixed target rate.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    pub sample_rate_hz: u32,
    pub do_normalize: bool,
}

impl FeatureExtractor {
    pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 16_000;

    pub fn new(sample_rate_hz: u32) -> Self {
        Self {
            sample_rate_hz,
            do_normalize: true,
        }
    }

    pub fn extract(&self, samples: &[f32]) -> Vec<f32> {
        if !self.do_normalize || samples.is_empty() {
            return samples.to_vec();
        }
        let n = samples.len() as f64;
        let mean = samples.iter().map(|&x| x as f64).sum::<f64>() / n;
        let var = samples
            .iter()
            .map(|&x| {
                let d = x as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        let std = var.sqrt().max(1e-7);
        samples
            .iter()
            .map(|&x| ((x as f64 - mean) / std) as f32)
            .collect()
    }
}

/// Tokenizer + feature extractor pair, the seam the data pipeline talks to.
#[derive(Debug, Clone)]
pub struct Processor {
    pub tokenizer: CharTokenizer,
    pub feature_extractor: FeatureExtractor,
}

impl Processor {
    pub fn new(tokenizer: CharTokenizer, feature_extractor: FeatureExtractor) -> Self {
        Self {
            tokenizer,
            feature_extractor,
        }
    }

    pub fn from_files(
        vocab_path: &Path,
        orthography: &Orthography,
        sample_rate_hz: u32,
    ) -> Result<Self, FinetuneError> {
        let tokenizer = CharTokenizer::from_vocab_file(
            vocab_path,
            orthography.word_delimiter_token,
            orthography.do_lower_case,
        )?;
        Ok(Self::new(tokenizer, FeatureExtractor::new(sample_rate_hz)))
    }

    pub fn cleaner(&self) -> VocabularyCleaner {
        VocabularyCleaner::new(self.tokenizer.vocab_chars(), self.tokenizer.do_lower_case())
    }

    /// Encodes a prepared split into per-example features. All examples must
    /// share one sampling rate; a mixed-rate split aborts the encoding.
    pub fn encode_split(
        &self,
        examples: &[PreparedExample],
    ) -> Result<Vec<Features>, FinetuneError> {
        if let Some(first) = examples.first() {
            if let Some(bad) = examples
                .iter()
                .find(|e| e.sample_rate_hz != first.sample_rate_hz)
            {
                return Err(FinetuneError::data(format!(
                    "inconsistent sampling rates in split: expected {} Hz, found {} Hz; \
                     make sure all inputs share the feature extractor rate of {} Hz",
                    first.sample_rate_hz,
                    bad.sample_rate_hz,
                    self.feature_extractor.sample_rate_hz
                )));
            }
        }

        Ok(examples
            .iter()
            .map(|e| Features {
                input_values: self.feature_extractor.extract(&e.samples),
                labels: self.tokenizer.encode(&e.text),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VOCAB_JSON: &str = r#"{
        "<pad>": 0, "<s>": 1, "</s>": 2, "<unk>": 3, "|": 4,
        "a": 5, "b": 6, "c": 7, "d": 8, "e": 9, "h": 10, "l": 11, "o": 12
    }"#;

    fn tokenizer() -> CharTokenizer {
        let mut f = tempfile::NamedTempFile::new().expect("temp vocab");
        f.write_all(VOCAB_JSON.as_bytes()).expect("write vocab");
        CharTokenizer::from_vocab_file(f.path(), '|', true).expect("load vocab")
    }

    #[test]
    fn encode_maps_spaces_to_delimiter() {
        let tok = tokenizer();
        assert_eq!(tok.encode("ab ba"), vec![5, 6, 4, 6, 5]);
        assert_eq!(tok.encode("AB"), vec![5, 6]);
    }

    #[test]
    fn encode_falls_back_to_unk() {
        let tok = tokenizer();
        assert_eq!(tok.encode("axb"), vec![5, 3, 6]);
    }

    #[test]
    fn decode_grouped_collapses_repeats_and_blanks() {
        let tok = tokenizer();
        assert_eq!(tok.decode_grouped(&[0, 5, 5, 0, 6, 4, 4, 6, 0, 0]), "ab b");
    }

    #[test]
    fn decode_labels_skips_ignore_sentinel() {
        let tok = tokenizer();
        assert_eq!(tok.decode_labels(&[5, 6, -100, -100]), "ab");
    }

    #[test]
    fn missing_delimiter_is_a_configuration_error() {
        let mut f = tempfile::NamedTempFile::new().expect("temp vocab");
        f.write_all(br#"{"<pad>": 0, "a": 1}"#).expect("write vocab");
        let err = CharTokenizer::from_vocab_file(f.path(), '|', false).unwrap_err();
        assert!(matches!(err, FinetuneError::Config { .. }));
    }

    #[test]
    fn cleaner_strips_out_of_vocab_chars() {
        let cleaner = VocabularyCleaner::new(vec!['a', 'b'], false);
        assert_eq!(cleaner.clean("ab?c a!b"), "ab ab");
    }

    #[test]
    fn cleaner_case_insensitive_keeps_uppercase() {
        let cleaner = VocabularyCleaner::new(vec!['a', 'b'], true);
        assert_eq!(cleaner.clean("AB ab"), "AB ab");
        let strict = VocabularyCleaner::new(vec!['a', 'b'], false);
        assert_eq!(strict.clean("AB ab"), " ab");
    }

    #[test]
    fn feature_extraction_normalizes_to_zero_mean_unit_var() {
        let fx = FeatureExtractor::new(16_000);
        let out = fx.extract(&[1.0, 2.0, 3.0, 4.0]);
        let mean: f32 = out.iter().sum::<f32>() / out.len() as f32;
        let var: f32 = out.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / out.len() as f32;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-4);
    }

    #[test]
    fn encode_split_rejects_mixed_sampling_rates() {
        let proc = Processor::new(tokenizer(), FeatureExtractor::new(16_000));
        let examples = vec![
            PreparedExample {
                samples: vec![0.0; 10],
                sample_rate_hz: 16_000,
                duration_secs: 0.1,
                text: "ab".to_string(),
            },
            PreparedExample {
                samples: vec![0.0; 10],
                sample_rate_hz: 8_000,
                duration_secs: 0.1,
                text: "ba".to_string(),
            },
        ];
        let err = proc.encode_split(&examples).unwrap_err();
        assert!(matches!(err, FinetuneError::Data { .. }));
    }
}
