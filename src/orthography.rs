use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::error::FinetuneError;

/// Text normalization scheme applied to transcripts before tokenization.
///
/// Selected by name at startup; immutable afterwards. `preprocess` is
/// idempotent: translated characters never map back into the table's
/// domain, whitespace collapse is stable, and stop-word removal on
/// stop-word-free text is a no-op.
#[derive(Debug, Clone)]
pub struct Orthography {
    pub do_lower_case: bool,
    pub vocab_file: Option<PathBuf>,
    pub word_delimiter_token: char,
    pub translation_table: HashMap<char, String>,
    pub words_to_remove: HashSet<String>,
}

impl Default for Orthography {
    fn default() -> Self {
        Self {
            do_lower_case: false,
            vocab_file: None,
            word_delimiter_token: '|',
            translation_table: HashMap::new(),
            words_to_remove: HashSet::new(),
        }
    }
}

impl Orthography {
    pub fn from_name(name: &str) -> Result<Self, FinetuneError> {
        match name {
            "librispeech" => Ok(Self::default()),
            "timit" => Ok(Self {
                do_lower_case: true,
                // break compounds like "quarter-century-old" and replace pauses "--"
                translation_table: HashMap::from([('-', " ".to_string())]),
                ..Self::default()
            }),
            "buckwalter" => Ok(Self {
                vocab_file: Some(PathBuf::from("vocab/buckwalter.json")),
                // "|" is the Arabic letter alef with madda above
                word_delimiter_token: '/',
                translation_table: HashMap::from([('-', " ".to_string())]),
                words_to_remove: HashSet::from(["sil".to_string()]),
                ..Self::default()
            }),
            other => Err(FinetuneError::config(format!(
                "unsupported orthography: '{other}'"
            ))),
        }
    }

    pub fn preprocess(&self, text: &str) -> String {
        let text = if self.translation_table.is_empty() {
            text.to_string()
        } else {
            let mut out = String::with_capacity(text.len());
            for c in text.chars() {
                match self.translation_table.get(&c) {
                    Some(replacement) => out.push_str(replacement),
                    None => out.push(c),
                }
            }
            out
        };

        let words = text
            .split_whitespace()
            .filter(|w| self.words_to_remove.is_empty() || !self.words_to_remove.contains(*w));
        let mut cleaned = String::with_capacity(text.len());
        for (i, w) in words.enumerate() {
            if i > 0 {
                cleaned.push(' ');
            }
            cleaned.push_str(w);
        }
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUPPORTED: [&str; 3] = ["librispeech", "timit", "buckwalter"];

    #[test]
    fn librispeech_defaults() {
        let ortho = Orthography::from_name("librispeech").unwrap();
        assert!(!ortho.do_lower_case);
        assert!(ortho.vocab_file.is_none());
        assert_eq!(ortho.word_delimiter_token, '|');
        assert!(ortho.translation_table.is_empty());
        assert!(ortho.words_to_remove.is_empty());
    }

    #[test]
    fn unknown_name_is_a_configuration_error() {
        let err = Orthography::from_name("klingon").unwrap_err();
        assert!(matches!(err, FinetuneError::Config { .. }));
    }

    #[test]
    fn timit_breaks_compounds_and_lowercases() {
        let ortho = Orthography::from_name("timit").unwrap();
        assert!(ortho.do_lower_case);
        assert_eq!(ortho.preprocess("quarter-century-old"), "quarter century old");
        assert_eq!(ortho.preprocess("a --  b"), "a b");
    }

    #[test]
    fn buckwalter_removes_sil_words() {
        let ortho = Orthography::from_name("buckwalter").unwrap();
        assert_eq!(ortho.preprocess("sil mrHbA sil bk sil"), "mrHbA bk");
        assert_eq!(ortho.word_delimiter_token, '/');
    }

    #[test]
    fn whitespace_runs_collapse_to_single_spaces() {
        let ortho = Orthography::from_name("librispeech").unwrap();
        assert_eq!(ortho.preprocess("  hello   world\t again \n"), "hello world again");
    }

    #[test]
    fn preprocess_is_idempotent_for_all_schemes() {
        let samples = [
            "HELLO  world",
            "quarter-century-old -- pause",
            "sil one-two sil  three",
            "",
            "   ",
        ];
        for name in SUPPORTED {
            let ortho = Orthography::from_name(name).unwrap();
            for s in samples {
                let once = ortho.preprocess(s);
                assert_eq!(ortho.preprocess(&once), once, "scheme {name}, input {s:?}");
            }
        }
    }
}
