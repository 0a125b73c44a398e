use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader};
use rayon::prelude::*;
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use tracing::{debug, info};

/// Sample rate expected by the recognizer.
pub const TARGET_SAMPLE_RATE: u32 = 16000;

/// 将音频文件解码为 16kHz 单声道 f32 样本
///
/// 16 位 PCM 的 WAV 直接读取，其余格式先经 FFmpeg 转码到临时 WAV 文件，
/// 临时文件在函数返回时自动删除。
pub fn decode_file(path: &Path) -> Result<Vec<f32>> {
    let (samples, num_channels, sample_rate) = match read_wav_if_pcm(path) {
        Some(decoded) => decoded,
        None => {
            let wav = transcode_to_wav(path)?;
            read_wav_file(wav.path())?
        }
    };

    let mono = convert_to_mono(&samples, num_channels);
    if sample_rate == TARGET_SAMPLE_RATE {
        return Ok(mono);
    }
    resample_audio(&mono, sample_rate)
}

fn read_wav_if_pcm(path: &Path) -> Option<(Vec<f32>, usize, u32)> {
    let is_wav = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("wav"))
        .unwrap_or(false);
    if !is_wav {
        return None;
    }
    match read_wav_file(path) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            debug!("Falling back to ffmpeg for {}: {}", path.display(), e);
            None
        }
    }
}

/// 使用 FFmpeg 转码为 16kHz 单声道 16 位 PCM
fn transcode_to_wav(path: &Path) -> Result<tempfile::NamedTempFile> {
    let output = tempfile::Builder::new()
        .prefix("asr-decode-")
        .suffix(".wav")
        .tempfile()
        .context("failed to create temporary wav file")?;

    info!("Converting {} to WAV with ffmpeg", path.display());
    let result = Command::new("ffmpeg")
        .arg("-nostdin")
        .arg("-y")
        .arg("-i")
        .arg(path)
        .args(["-ac", "1", "-ar", "16000", "-acodec", "pcm_s16le"])
        .arg(output.path())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| anyhow::anyhow!("Failed to execute ffmpeg: {}", e))?;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        let detail = stderr.lines().last().unwrap_or_default().trim().to_string();
        return Err(anyhow::anyhow!(
            "FFmpeg conversion failed with status {}: {}",
            result.status,
            detail
        ));
    }
    Ok(output)
}

/// 读取 16 位整数 WAV，返回 [-1, 1] 范围的样本、通道数和采样率
fn read_wav_file(path: &Path) -> Result<(Vec<f32>, usize, u32)> {
    let mut reader = WavReader::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to read WAV file: {}", e))?;
    let spec = reader.spec();

    if spec.sample_format != SampleFormat::Int {
        return Err(anyhow::anyhow!("Unsupported sample format: expected integer format"));
    }
    if spec.bits_per_sample != 16 {
        return Err(anyhow::anyhow!("Unsupported bits per sample: expected 16 bits"));
    }
    if spec.channels == 0 {
        return Err(anyhow::anyhow!("WAV file declares zero channels"));
    }

    let samples = reader
        .samples::<i16>()
        .map(|s| s.map(|v| v as f32 / 32768.0))
        .collect::<std::result::Result<Vec<f32>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to read samples: {}", e))?;

    Ok((samples, spec.channels as usize, spec.sample_rate))
}

/// 对每帧所有通道取平均，得到单声道
fn convert_to_mono(samples: &[f32], num_channels: usize) -> Vec<f32> {
    if num_channels <= 1 {
        return samples.to_vec();
    }
    samples
        .par_chunks(num_channels)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect()
}

fn resample_audio(samples: &[f32], original_sample_rate: u32) -> Result<Vec<f32>> {
    if samples.is_empty() {
        return Ok(Vec::new());
    }
    info!("Resampling from {} Hz to {} Hz", original_sample_rate, TARGET_SAMPLE_RATE);

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(
        TARGET_SAMPLE_RATE as f64 / original_sample_rate as f64,
        2.0,
        params,
        samples.len(),
        1,
    )
    .map_err(|e| anyhow::anyhow!("Failed to create resampler: {}", e))?;

    let mut resampled = resampler
        .process(&[samples.to_vec()], None)
        .map_err(|e| anyhow::anyhow!("Resampling failed: {}", e))?;

    Ok(resampled.pop().unwrap_or_default())
}
