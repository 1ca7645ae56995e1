//! Audio normalization via the external normalizer tool (ffmpeg).
//!
//! Source voice notes arrive as opus/m4a/amr; everything downstream works on
//! 16 kHz mono s16le WAV. Normalization enforces a wall-clock timeout and a
//! bounded retry count, and preserves the tail of the tool's stderr for
//! diagnosis.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::CsError;
use crate::process::{run_command_cancellable, run_command_with_timeout};
use crate::runner::CancelToken;

/// Bytes of stderr tail preserved under `derived.asr.ffmpeg_log_tail`.
const LOG_TAIL_BYTES: usize = 2048;

#[derive(Debug, Clone)]
pub struct NormalizeParams {
    pub tool: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for NormalizeParams {
    fn default() -> Self {
        Self {
            tool: "ffmpeg".to_owned(),
            sample_rate: 16_000,
            channels: 1,
            timeout: Duration::from_secs(30),
            max_retries: 2,
        }
    }
}

/// Successful normalization: the produced WAV plus the tool's stderr tail.
#[derive(Debug, Clone)]
pub struct NormalizeOutcome {
    pub wav_path: PathBuf,
    pub log_tail: String,
}

/// Failed normalization after retry exhaustion. `timed_out` is true when any
/// attempt hit the wall-clock limit; the transcriber maps that to
/// `timeout_ffmpeg` and everything else to `ffmpeg_failed`.
#[derive(Debug, Clone)]
pub struct NormalizeFailure {
    pub timed_out: bool,
    pub log_tail: String,
}

/// How a normalization attempt ended short of success. Cancellation carries
/// the runner error so the caller aborts the item instead of classifying it
/// as a tool failure.
#[derive(Debug)]
pub enum NormalizeError {
    Cancelled(CsError),
    Failed(NormalizeFailure),
}

/// Convert `input` into canonical PCM at `out_path`.
///
/// The tool writes to a unique sibling temp path which is renamed into
/// place on success, so concurrent workers normalizing identical content
/// never observe a half-written artifact. A complete artifact already at
/// `out_path` (same content-addressed name) is accepted as-is.
///
/// With a token, the subprocess runs under cancellation-aware polling: the
/// child is killed as soon as the token trips, without waiting out the
/// wall-clock timeout.
pub fn normalize_to_wav(
    input: &Path,
    out_path: &Path,
    params: &NormalizeParams,
    token: Option<&CancelToken>,
) -> Result<NormalizeOutcome, NormalizeError> {
    static SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let tmp_path = out_path.with_extension(format!("wav.part.{}.{seq}", std::process::id()));

    let args = vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
        "-i".to_owned(),
        input.display().to_string(),
        "-ar".to_owned(),
        params.sample_rate.to_string(),
        "-ac".to_owned(),
        params.channels.to_string(),
        "-c:a".to_owned(),
        "pcm_s16le".to_owned(),
        "-f".to_owned(),
        "wav".to_owned(),
        tmp_path.display().to_string(),
    ];

    let attempts = params.max_retries.max(1);
    let mut any_timeout = false;
    let mut last_tail = String::new();

    for attempt in 0..attempts {
        if let Some(tok) = token
            && let Err(err) = tok.checkpoint()
        {
            remove_partial(&tmp_path);
            return Err(NormalizeError::Cancelled(err));
        }

        let run = match token {
            Some(tok) => {
                run_command_cancellable(&params.tool, &args, None, tok, Some(params.timeout))
            }
            None => run_command_with_timeout(&params.tool, &args, None, Some(params.timeout)),
        };

        match run {
            Ok(output) => {
                let tail = tail_of(&String::from_utf8_lossy(&output.stderr));
                if tmp_path.exists() {
                    if std::fs::rename(&tmp_path, out_path).is_ok() {
                        return Ok(NormalizeOutcome {
                            wav_path: out_path.to_path_buf(),
                            log_tail: tail,
                        });
                    }
                } else if out_path.exists() {
                    // Another worker (or a prior run) already produced the
                    // content-addressed artifact.
                    return Ok(NormalizeOutcome {
                        wav_path: out_path.to_path_buf(),
                        log_tail: tail,
                    });
                }
                // Tool claimed success without producing the file; retry.
                last_tail = tail;
            }
            Err(err) => {
                if matches!(err, CsError::Cancelled(_)) {
                    remove_partial(&tmp_path);
                    return Err(NormalizeError::Cancelled(err));
                }
                if err.is_timeout() {
                    any_timeout = true;
                }
                last_tail = tail_of(&err.to_string());
                tracing::debug!(
                    attempt,
                    timed_out = err.is_timeout(),
                    "normalizer attempt failed"
                );
            }
        }
    }

    remove_partial(&tmp_path);
    Err(NormalizeError::Failed(NormalizeFailure {
        timed_out: any_timeout,
        log_tail: last_tail,
    }))
}

/// Leave no half-written artifact behind on a failed or cancelled attempt.
fn remove_partial(tmp_path: &Path) {
    if tmp_path.exists() {
        let _ = std::fs::remove_file(tmp_path);
    }
}

/// Duration of a WAV file in seconds. Falls back to a size-based estimate
/// when the header is unreadable, and 0.0 when the file is gone entirely.
#[must_use]
pub fn wav_duration_seconds(path: &Path, sample_rate: u32, channels: u16) -> f64 {
    if let Ok(reader) = hound::WavReader::open(path) {
        let spec = reader.spec();
        if spec.sample_rate > 0 {
            return f64::from(reader.duration()) / f64::from(spec.sample_rate);
        }
    }
    let bytes_per_second = u64::from(sample_rate) * u64::from(channels) * 2;
    if bytes_per_second == 0 {
        return 0.0;
    }
    std::fs::metadata(path)
        .map(|m| m.len() as f64 / bytes_per_second as f64)
        .unwrap_or(0.0)
}

fn tail_of(text: &str) -> String {
    if text.len() <= LOG_TAIL_BYTES {
        return text.to_owned();
    }
    let mut start = text.len() - LOG_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_owned()
}

#[cfg(test)]
pub(crate) fn write_test_wav(path: &Path, sample_rate: u32, samples: &[i16]) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).expect("wav writer");
    for &s in samples {
        writer.write_sample(s).expect("write sample");
    }
    writer.finalize().expect("finalize");
}
