//! Voice-message transcription (stage M3).
//!
//! Per message: cache check → normalize → VAD (observational) → chunk →
//! per-chunk ASR → assembly → status resolution → cache write. Every failure
//! maps to a terminal message state; the transcriber itself only errors on
//! cooperative cancellation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::asr::AsrClient;
use crate::audio::{NormalizeError, NormalizeParams, normalize_to_wav, wav_duration_seconds};
use crate::chunker::{ChunkError, chunk_wav};
use crate::cost::estimate_asr_cost;
use crate::error::CsResult;
use crate::hashing::sha256_file_with_extra;
use crate::model::{
    AUDIO_PIPELINE_VERSION, AsrErrorKind, AsrPayload, ChunkOutcome, ChunkStatus, ErrorSummary,
    Kind, Message, Status, StatusReason,
};
use crate::outputs::write_atomic;
use crate::runner::CancelToken;
use crate::vad::{VadThresholds, run_vad};

pub const PLACEHOLDER_CONVERSION_FAILED: &str = "[AUDIO CONVERSION FAILED]";
pub const PLACEHOLDER_TRANSCRIPTION_FAILED: &str = "[AUDIO TRANSCRIPTION FAILED]";
pub const PLACEHOLDER_CHUNKING_FAILED: &str = "[AUDIO TRANSCRIPTION FAILED (chunking)]";
pub const PLACEHOLDER_UNSUPPORTED: &str = "[UNSUPPORTED AUDIO FORMAT]";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub normalize: NormalizeParams,
    pub chunk_seconds: f64,
    pub chunk_overlap_seconds: f64,
    pub enable_vad: bool,
    pub vad: VadThresholds,
    pub cache_dir: PathBuf,
    /// Override for chunk artifacts; defaults to a content-addressed
    /// directory under the cache.
    pub chunk_dir: Option<PathBuf>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            normalize: NormalizeParams::default(),
            chunk_seconds: 120.0,
            chunk_overlap_seconds: 0.25,
            enable_vad: true,
            vad: VadThresholds::default(),
            cache_dir: PathBuf::from("cache/audio"),
            chunk_dir: None,
        }
    }
}

impl AudioConfig {
    pub fn validate(&self) -> CsResult<()> {
        use crate::error::CsError;
        if self.chunk_seconds <= 0.0 {
            return Err(CsError::InvalidConfig(format!(
                "chunk_seconds must be positive, got {}",
                self.chunk_seconds
            )));
        }
        if self.chunk_overlap_seconds < 0.0 {
            return Err(CsError::InvalidConfig(
                "chunk_overlap_seconds must not be negative".to_owned(),
            ));
        }
        if self.chunk_overlap_seconds >= self.chunk_seconds {
            return Err(CsError::InvalidConfig(format!(
                "chunk overlap ({}) must be strictly less than the window ({})",
                self.chunk_overlap_seconds, self.chunk_seconds
            )));
        }
        if self.normalize.sample_rate == 0 {
            return Err(CsError::InvalidConfig(
                "sample_rate must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cache entry
// ---------------------------------------------------------------------------

/// Hydratable terminal state of one voice message. Stored at
/// `<cache_dir>/<key>.json`, written atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    content_text: String,
    status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status_reason: Option<StatusReason>,
    partial: bool,
    derived_asr: AsrPayload,
}

// ---------------------------------------------------------------------------
// Transcriber
// ---------------------------------------------------------------------------

pub struct AudioTranscriber {
    cfg: AudioConfig,
    client: AsrClient,
}

impl AudioTranscriber {
    pub fn new(cfg: AudioConfig, client: AsrClient) -> CsResult<Self> {
        cfg.validate()?;
        Ok(Self { cfg, client })
    }

    #[must_use]
    pub const fn pipeline_version(&self) -> &'static str {
        AUDIO_PIPELINE_VERSION
    }

    #[must_use]
    pub fn client(&self) -> &AsrClient {
        &self.client
    }

    /// Transcribe one message in place. Non-voice records pass through
    /// untouched. The only error path is cooperative cancellation; every
    /// audio/ASR failure becomes a terminal message state.
    pub fn transcribe(&self, msg: &mut Message) -> CsResult<()> {
        self.transcribe_with_token(msg, None)
    }

    pub fn transcribe_with_token(
        &self,
        msg: &mut Message,
        token: Option<&CancelToken>,
    ) -> CsResult<()> {
        if msg.kind != Kind::Voice {
            return Ok(());
        }

        let mut payload = msg.derived.asr.take().unwrap_or_default();
        payload.pipeline_version = AUDIO_PIPELINE_VERSION.to_owned();
        payload.provider = Some(self.client.provider_name().to_owned());
        payload.model = Some(self.client.model().to_owned());
        payload.language_hint = Some(self.client.language_hint().to_owned());
        payload.billing_plan = Some(self.client.billing_plan().to_owned());

        let Some(media_path) = msg.media_filename.clone().map(PathBuf::from) else {
            msg.mark_failed(StatusReason::AudioUnsupportedFormat);
            set_placeholder(msg, PLACEHOLDER_UNSUPPORTED);
            msg.derived.asr = Some(payload);
            return Ok(());
        };
        if !media_path.exists() {
            msg.mark_failed(StatusReason::AudioUnsupportedFormat);
            set_placeholder(msg, PLACEHOLDER_UNSUPPORTED);
            msg.add_error(format!("media file missing: {}", media_path.display()));
            msg.derived.asr = Some(payload);
            return Ok(());
        }

        let Some(key) = self.cache_key(&media_path) else {
            msg.mark_failed(StatusReason::AudioUnsupportedFormat);
            set_placeholder(msg, PLACEHOLDER_UNSUPPORTED);
            msg.derived.asr = Some(payload);
            return Ok(());
        };

        if let Some(entry) = self.load_cache(&key) {
            apply_cache(msg, entry);
            return Ok(());
        }

        let wav_path = self.cache_dir().join(format!("{key}.wav"));
        let outcome = match normalize_to_wav(&media_path, &wav_path, &self.cfg.normalize, token) {
            Ok(outcome) => outcome,
            Err(NormalizeError::Cancelled(err)) => return Err(err),
            Err(NormalizeError::Failed(failure)) => {
                payload.ffmpeg_log_tail = Some(failure.log_tail.clone());
                let reason = if failure.timed_out {
                    StatusReason::TimeoutFfmpeg
                } else {
                    StatusReason::FfmpegFailed
                };
                msg.mark_failed(reason);
                set_placeholder(msg, PLACEHOLDER_CONVERSION_FAILED);
                msg.derived.asr = Some(payload);
                self.write_cache(&key, msg);
                return Ok(());
            }
        };
        payload.ffmpeg_log_tail = Some(outcome.log_tail.clone());

        let total_seconds = wav_duration_seconds(
            &outcome.wav_path,
            self.cfg.normalize.sample_rate,
            self.cfg.normalize.channels,
        );
        payload.total_duration_seconds = round3(total_seconds);

        if self.cfg.enable_vad {
            payload.vad = Some(run_vad(&outcome.wav_path, self.cfg.vad));
        }

        if let Some(tok) = token {
            tok.checkpoint()?;
        }

        let chunk_dir = self
            .cfg
            .chunk_dir
            .clone()
            .unwrap_or_else(|| self.cache_dir().join("chunks").join(&key));
        let chunks = match chunk_wav(
            &outcome.wav_path,
            total_seconds,
            self.cfg.chunk_seconds,
            self.cfg.chunk_overlap_seconds,
            &chunk_dir,
        ) {
            Ok(chunks) => chunks,
            Err(err) => {
                self.finish_chunking_failure(msg, &mut payload, &err);
                msg.derived.asr = Some(payload);
                self.write_cache(&key, msg);
                return Ok(());
            }
        };

        // Cancellation is honored between chunks; an in-flight call completes
        // or times out on its own.
        let mut outcomes: Vec<ChunkOutcome> = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            if let Some(tok) = token {
                tok.checkpoint()?;
            }
            let result = self.client.transcribe_chunk(
                &chunk.wav_chunk_path,
                chunk.start_sec,
                chunk.end_sec,
            );
            outcomes.push(ChunkOutcome {
                chunk_index: chunk.chunk_index,
                start_sec: chunk.start_sec,
                end_sec: chunk.end_sec,
                duration_sec: chunk.duration_sec,
                status: result.status,
                text: result.text,
                error: result.error,
                error_kind: result.error_kind,
                language: result.language,
                wav_chunk_path: chunk.wav_chunk_path.display().to_string(),
            });
        }

        apply_chunk_outcomes(msg, &mut payload, outcomes);
        payload.cost = estimate_asr_cost(
            total_seconds,
            self.client.provider_name(),
            self.client.model(),
            self.client.billing_plan(),
        );
        msg.derived.asr = Some(payload);

        self.write_cache(&key, msg);
        Ok(())
    }

    fn finish_chunking_failure(
        &self,
        msg: &mut Message,
        payload: &mut AsrPayload,
        err: &ChunkError,
    ) {
        tracing::debug!(idx = msg.idx, error = %err, "chunking failed");
        msg.mark_failed(StatusReason::AsrFailed);
        set_placeholder(msg, PLACEHOLDER_CHUNKING_FAILED);
        payload.chunks = Vec::new();
        payload.cost = 0.0;
        payload.error_summary = Some(ErrorSummary {
            chunks_ok: 0,
            chunks_error: 0,
            last_error_kind: Some("chunking".to_owned()),
            last_error_message: Some(err.to_string()),
        });
    }

    // -- cache ---------------------------------------------------------------

    fn cache_dir(&self) -> &Path {
        &self.cfg.cache_dir
    }

    /// Content-addressed key: media bytes plus every knob that could change
    /// the transcript.
    fn cache_key(&self, media_path: &Path) -> Option<String> {
        let knobs = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}",
            self.client.provider_name(),
            self.client.model(),
            self.cfg.chunk_seconds,
            self.cfg.chunk_overlap_seconds,
            self.cfg.vad.min_speech_ratio,
            self.cfg.vad.min_speech_seconds,
            self.client.billing_plan(),
            AUDIO_PIPELINE_VERSION,
        );
        sha256_file_with_extra(media_path, Some(&knobs)).ok()
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir().join(format!("{key}.json"))
    }

    fn load_cache(&self, key: &str) -> Option<CacheEntry> {
        let path = self.cache_path(key);
        let raw = std::fs::read_to_string(path).ok()?;
        // A torn or stale entry is a miss, never an error.
        serde_json::from_str(&raw).ok()
    }

    fn write_cache(&self, key: &str, msg: &Message) {
        let entry = CacheEntry {
            content_text: msg.content_text.clone(),
            status: msg.status,
            status_reason: msg.status_reason,
            partial: msg.partial,
            derived_asr: msg.derived.asr.clone().unwrap_or_default(),
        };
        let Ok(bytes) = serde_json::to_vec_pretty(&entry) else {
            return;
        };
        if let Err(err) = write_atomic(&self.cache_path(key), &bytes) {
            tracing::warn!(key, error = %err, "cache write failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Assembly and status resolution
// ---------------------------------------------------------------------------

/// Fold per-chunk outcomes into the message: assemble the transcript from
/// successful chunks in chunk order, resolve status, and fill the error
/// summary.
fn apply_chunk_outcomes(msg: &mut Message, payload: &mut AsrPayload, outcomes: Vec<ChunkOutcome>) {
    let transcript = outcomes
        .iter()
        .filter(|c| c.status == ChunkStatus::Ok && !c.text.is_empty())
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    if !transcript.is_empty() {
        if msg.content_text.is_empty() {
            msg.content_text = transcript;
        } else {
            msg.content_text = format!("{}\n{transcript}", msg.content_text);
        }
    }

    let any_ok = outcomes.iter().any(|c| c.status == ChunkStatus::Ok);
    let any_err = outcomes.iter().any(|c| c.status != ChunkStatus::Ok);
    let last_error_kind = outcomes.iter().rev().find_map(|c| c.error_kind);
    let last_error_message = outcomes.iter().rev().find_map(|c| c.error.clone());

    if any_err && !any_ok {
        let reason = if last_error_kind == Some(AsrErrorKind::Timeout) {
            StatusReason::TimeoutAsr
        } else {
            StatusReason::AsrFailed
        };
        msg.mark_failed(reason);
        set_placeholder(msg, PLACEHOLDER_TRANSCRIPTION_FAILED);
    } else if any_err {
        msg.mark_partial(StatusReason::AsrPartial);
    } else {
        msg.status = Status::Ok;
        msg.partial = false;
        msg.status_reason = None;
    }

    payload.error_summary = Some(ErrorSummary {
        chunks_ok: outcomes
            .iter()
            .filter(|c| c.status == ChunkStatus::Ok)
            .count(),
        chunks_error: outcomes
            .iter()
            .filter(|c| c.status != ChunkStatus::Ok)
            .count(),
        last_error_kind: last_error_kind.map(|k| k.as_str().to_owned()),
        last_error_message,
    });
    payload.chunks = outcomes;
}

fn apply_cache(msg: &mut Message, entry: CacheEntry) {
    msg.content_text = entry.content_text;
    msg.status = entry.status;
    msg.partial = entry.partial;
    msg.status_reason = entry.status_reason;
    msg.derived.asr = Some(entry.derived_asr);
}

fn set_placeholder(msg: &mut Message, placeholder: &str) {
    if msg.content_text.is_empty() {
        msg.content_text = placeholder.to_owned();
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
