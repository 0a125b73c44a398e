use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::asr::{AsrEngine, AsrParams, TranscribeResult, TranscribeSegment};
use crate::audio;

/// whisper.cpp backed recognizer. The model is loaded once and shared;
/// every transcription gets its own decoding state.
pub struct WhisperAsr {
    whisper_ctx: WhisperContext,
    n_threads: i32,
}

impl WhisperAsr {
    pub fn new(model_path: &Path) -> Result<Self> {
        let path = model_path
            .to_str()
            .with_context(|| format!("model path is not valid UTF-8: {}", model_path.display()))?;
        let whisper_ctx = WhisperContext::new_with_params(path, WhisperContextParameters::default())
            .map_err(|e| anyhow::anyhow!("failed to open whisper model {}: {}", path, e))?;

        let n_threads = std::thread::available_parallelism()
            .map(|n| n.get().min(8) as i32)
            .unwrap_or(4);
        info!("Loaded whisper model {} ({} threads)", path, n_threads);
        Ok(Self {
            whisper_ctx,
            n_threads,
        })
    }

    fn build_params<'a>(&self, ap: &'a AsrParams) -> FullParams<'a, 'a> {
        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: ap.best_of });

        // 固定温度，结果可复现
        params.set_temperature(ap.temperature);
        // 长音频依赖前文上下文
        params.set_no_context(!ap.condition_on_previous_text);

        params.set_n_threads(self.n_threads);
        params.set_translate(false);
        params.set_single_segment(false);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_suppress_blank(true);

        // None 表示自动检测语言
        params.set_language(ap.language.as_deref());
        if let Some(prompt) = ap.initial_prompt.as_deref() {
            params.set_initial_prompt(prompt);
        }

        params
    }
}

impl AsrEngine for WhisperAsr {
    fn transcribe_file(&self, audio_path: &Path, user_params: &AsrParams) -> Result<TranscribeResult> {
        let audio = audio::decode_file(audio_path)?;

        let mut state = self.whisper_ctx.create_state()?;
        let params = self.build_params(user_params);
        state.full(params, &audio)?;

        let num_segments = state.full_n_segments()?;
        let mut segments = Vec::with_capacity(num_segments.max(0) as usize);
        for i in 0..num_segments {
            segments.push(TranscribeSegment {
                text: state.full_get_segment_text(i)?,
                start: state.full_get_segment_t0(i)?,
                end: state.full_get_segment_t1(i)?,
            });
        }

        Ok(TranscribeResult::from_segments(segments))
    }
}
