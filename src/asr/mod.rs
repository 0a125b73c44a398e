use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod whisper;

pub use whisper::WhisperAsr;

/// Decoding parameters for one transcription.
///
/// Sampling is fixed to greedy decoding with `best_of = 1` and temperature 0,
/// conditioned on previous text; only the language and the initial prompt
/// come from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AsrParams {
    pub language: Option<String>,
    pub initial_prompt: Option<String>,
    pub best_of: i32,
    pub temperature: f32,
    pub condition_on_previous_text: bool,
}

impl Default for AsrParams {
    fn default() -> Self {
        Self::new()
    }
}

impl AsrParams {
    pub fn new() -> Self {
        Self {
            language: None,
            initial_prompt: None,
            best_of: 1,
            temperature: 0.0,
            condition_on_previous_text: true,
        }
    }

    pub fn set_language(&mut self, language: Option<String>) -> &mut Self {
        self.language = language.filter(|l| !l.is_empty());
        self
    }

    pub fn set_initial_prompt(&mut self, prompt: Option<String>) -> &mut Self {
        self.initial_prompt = prompt.filter(|p| !p.is_empty());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeSegment {
    pub text: String,
    /// Segment bounds in centiseconds.
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeResult {
    pub segments: Vec<TranscribeSegment>,
    pub full_text: String,
}

impl TranscribeResult {
    pub fn from_segments(segments: Vec<TranscribeSegment>) -> Self {
        let full_text = segments.iter().map(|s| s.text.as_str()).collect::<String>();
        Self {
            segments,
            full_text,
        }
    }
}

/// Speech recognition backend.
///
/// Calls block for the whole duration of the recognition; async callers run
/// them on the blocking pool.
pub trait AsrEngine: Send + Sync {
    fn transcribe_file(&self, audio_path: &Path, params: &AsrParams) -> Result<TranscribeResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_defaults_are_deterministic() {
        let params = AsrParams::new();
        assert_eq!(params.best_of, 1);
        assert_eq!(params.temperature, 0.0);
        assert!(params.condition_on_previous_text);
        assert!(params.language.is_none());
    }

    #[test]
    fn test_empty_language_means_autodetect() {
        let mut params = AsrParams::new();
        params
            .set_language(Some(String::new()))
            .set_initial_prompt(Some("以下是普通话的句子。".to_string()));
        assert!(params.language.is_none());
        assert_eq!(params.initial_prompt.as_deref(), Some("以下是普通话的句子。"));
    }

    #[test]
    fn test_full_text_joins_segments() {
        let result = TranscribeResult::from_segments(vec![
            TranscribeSegment { text: "你好，".to_string(), start: 0, end: 120 },
            TranscribeSegment { text: "世界".to_string(), start: 120, end: 200 },
        ]);
        assert_eq!(result.full_text, "你好，世界");
    }
}
