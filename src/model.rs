use std::collections::BTreeMap;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CsError, CsResult};

/// Version of the canonical message schema. Additive optional fields bump
/// minor; removals or enum narrowing bump major.
pub const MESSAGE_SCHEMA_VERSION: &str = "1.1.0";

/// Version stamped into `derived.asr.pipeline_version`. A change here
/// invalidates every audio cache entry and forces re-transcription.
pub const AUDIO_PIPELINE_VERSION: &str = "m3.10";

// ---------------------------------------------------------------------------
// Closed enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Text,
    Voice,
    Image,
    Video,
    Document,
    Sticker,
    System,
    Unknown,
}

impl Kind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Voice => "voice",
            Self::Image => "image",
            Self::Video => "video",
            Self::Document => "document",
            Self::Sticker => "sticker",
            Self::System => "system",
            Self::Unknown => "unknown",
        }
    }

    /// Kinds that may carry a media binding.
    #[must_use]
    pub const fn is_media(self) -> bool {
        matches!(
            self,
            Self::Voice | Self::Image | Self::Video | Self::Document | Self::Sticker | Self::Unknown
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Partial,
    Failed,
    Skipped,
}

impl Status {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Closed set of machine-readable status reasons.
///
/// `VadNoSpeech` is reserved: no stage emits it today, but readers must
/// accept it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusReason {
    MergedIntoPreviousMedia,
    UnresolvedMedia,
    AmbiguousMedia,
    FfmpegFailed,
    TimeoutFfmpeg,
    VadNoSpeech,
    AsrFailed,
    TimeoutAsr,
    AsrPartial,
    AudioUnsupportedFormat,
}

impl StatusReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MergedIntoPreviousMedia => "merged_into_previous_media",
            Self::UnresolvedMedia => "unresolved_media",
            Self::AmbiguousMedia => "ambiguous_media",
            Self::FfmpegFailed => "ffmpeg_failed",
            Self::TimeoutFfmpeg => "timeout_ffmpeg",
            Self::VadNoSpeech => "vad_no_speech",
            Self::AsrFailed => "asr_failed",
            Self::TimeoutAsr => "timeout_asr",
            Self::AsrPartial => "asr_partial",
            Self::AudioUnsupportedFormat => "audio_unsupported_format",
        }
    }
}

/// Classification of ASR backend errors, shared between the client (retry
/// policy) and the transcriber (status mapping).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsrErrorKind {
    Timeout,
    Auth,
    Quota,
    Client,
    Server,
    Unknown,
}

impl AsrErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Auth => "auth",
            Self::Quota => "quota",
            Self::Client => "client",
            Self::Server => "server",
            Self::Unknown => "unknown",
        }
    }

    /// Transient kinds are retried by the ASR client; terminal kinds fail
    /// fast.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Timeout | Self::Server)
    }
}

/// Configured ASR provider. Unknown names are a configuration error at
/// client construction, not a runtime fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    WhisperOpenai,
    WhisperLocal,
    GoogleStt,
}

impl ProviderKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WhisperOpenai => "whisper_openai",
            Self::WhisperLocal => "whisper_local",
            Self::GoogleStt => "google_stt",
        }
    }
}

// ---------------------------------------------------------------------------
// Derived payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Ok,
    Error,
}

/// Per-chunk transcription outcome recorded under `derived.asr.chunks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkOutcome {
    pub chunk_index: usize,
    pub start_sec: f64,
    pub end_sec: f64,
    pub duration_sec: f64,
    pub status: ChunkStatus,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<AsrErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub wav_chunk_path: String,
}

/// Observational speech-activity stats. Never gates ASR or status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadReport {
    pub speech_ratio: f64,
    pub speech_seconds: f64,
    pub total_seconds: f64,
    pub segments: Vec<(f64, f64)>,
    pub is_mostly_silence: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub chunks_ok: usize,
    pub chunks_error: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
}

/// Full ASR metadata attached to a voice message by the transcriber.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AsrPayload {
    pub pipeline_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_plan: Option<String>,
    #[serde(default)]
    pub total_duration_seconds: f64,
    #[serde(default)]
    pub chunks: Vec<ChunkOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vad: Option<VadReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<ErrorSummary>,
    #[serde(default)]
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ffmpeg_log_tail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisambiguationCandidate {
    pub path: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_num: Option<u64>,
}

/// Tie report recorded when the resolver declines to pick between close
/// candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disambiguation {
    pub candidates: Vec<DisambiguationCandidate>,
    pub top_score: f64,
    pub tie_margin: f64,
}

/// Stage-produced metadata. Typed subfields for the payloads this pipeline
/// knows about; unknown keys from future writers are preserved in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Derived {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asr: Option<AsrPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disambiguation: Option<Disambiguation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_sha256: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Derived {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.asr.is_none()
            && self.disambiguation.is_none()
            && self.media_sha256.is_none()
            && self.extra.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Canonical message record shared by every pipeline stage.
///
/// Invariants enforced by `outputs::validate_stage`:
/// - `idx` is dense and strictly increasing after sort
/// - `partial == (status == Partial)`
/// - enum fields only hold values from the closed sets above
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub idx: u64,
    /// Calendar-local `YYYY-MM-DDTHH:MM:SS`; never rewritten after parse.
    pub ts: String,
    pub sender: String,
    pub kind: Kind,
    #[serde(default)]
    pub content_text: String,
    #[serde(default)]
    pub raw_line: String,
    #[serde(default)]
    pub raw_block: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Derived::is_empty")]
    pub derived: Derived,
    #[serde(default = "default_status")]
    pub status: Status,
    #[serde(default)]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<StatusReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

const fn default_status() -> Status {
    Status::Ok
}

impl Message {
    /// Minimal constructor used by the parser; everything else defaults.
    #[must_use]
    pub fn new(idx: u64, ts: String, sender: String, kind: Kind) -> Self {
        Self {
            idx,
            ts,
            sender,
            kind,
            content_text: String::new(),
            raw_line: String::new(),
            raw_block: String::new(),
            media_hint: None,
            media_filename: None,
            caption: None,
            derived: Derived::default(),
            status: Status::Ok,
            partial: false,
            status_reason: None,
            errors: Vec::new(),
        }
    }

    pub fn mark_partial(&mut self, reason: StatusReason) {
        self.status = Status::Partial;
        self.partial = true;
        self.status_reason = Some(reason);
    }

    pub fn mark_failed(&mut self, reason: StatusReason) {
        self.status = Status::Failed;
        self.partial = false;
        self.status_reason = Some(reason);
    }

    pub fn mark_skipped(&mut self, reason: StatusReason) {
        self.status = Status::Skipped;
        self.partial = false;
        self.status_reason = Some(reason);
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }
}

// ---------------------------------------------------------------------------
// Schema version compatibility
// ---------------------------------------------------------------------------

fn parse_semver(version: &str) -> CsResult<(u64, u64, u64)> {
    let mut parts = version.split('.');
    let mut next = |label: &str| -> CsResult<u64> {
        parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(|| {
                CsError::SchemaMismatch(format!("malformed {label} in schema version `{version}`"))
            })
    };
    let major = next("major")?;
    let minor = next("minor")?;
    let patch = next("patch")?;
    if parts.next().is_some() {
        return Err(CsError::SchemaMismatch(format!(
            "too many components in schema version `{version}`"
        )));
    }
    Ok((major, minor, patch))
}

/// Semantic-version compatibility: same major, found minor >= required minor.
/// Patch differences never matter.
pub fn check_schema_compat(found: &str, required: &str) -> CsResult<()> {
    let (f_major, f_minor, _) = parse_semver(found)?;
    let (r_major, r_minor, _) = parse_semver(required)?;
    if f_major != r_major {
        return Err(CsError::SchemaMismatch(format!(
            "incompatible schema major: found {found}, required {required}"
        )));
    }
    if f_minor < r_minor {
        return Err(CsError::SchemaMismatch(format!(
            "schema minor too old: found {found}, required {required}"
        )));
    }
    Ok(())
}
