//! Provider-agnostic ASR client.
//!
//! A backend implements [`AsrBackend`] and is selected once at client
//! construction from the configured [`ProviderKind`]. The client owns the
//! retry policy: transient error kinds (timeout, server) are retried up to
//! the configured bound, terminal kinds (auth, quota, client) fail fast.
//!
//! Configuration is validated eagerly: a provider that requires an
//! environment credential fails construction before any audio is touched.

use std::path::Path;
use std::time::Duration;

use crate::error::{CsError, CsResult};
use crate::model::{AsrErrorKind, ChunkStatus, ProviderKind};
use crate::process::run_command_with_timeout;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AsrProviderConfig {
    pub provider: ProviderKind,
    pub model: String,
    /// BCP-47-ish language code or `auto`.
    pub language_hint: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub billing_plan: String,
    pub credential_env_var: Option<String>,
    pub require_credential: bool,
}

impl AsrProviderConfig {
    /// Provider defaults mirroring the shipped provider table.
    #[must_use]
    pub fn for_provider(provider: ProviderKind) -> Self {
        match provider {
            ProviderKind::WhisperOpenai => Self {
                provider,
                model: "whisper-1".to_owned(),
                language_hint: "auto".to_owned(),
                timeout: Duration::from_secs(60),
                max_retries: 2,
                billing_plan: "per_minute".to_owned(),
                credential_env_var: Some("OPENAI_API_KEY".to_owned()),
                require_credential: false,
            },
            ProviderKind::WhisperLocal => Self {
                provider,
                model: "base".to_owned(),
                language_hint: "auto".to_owned(),
                timeout: Duration::from_secs(120),
                max_retries: 2,
                billing_plan: "local".to_owned(),
                credential_env_var: None,
                require_credential: false,
            },
            ProviderKind::GoogleStt => Self {
                provider,
                model: "chirp-3".to_owned(),
                language_hint: "auto".to_owned(),
                timeout: Duration::from_secs(60),
                max_retries: 2,
                billing_plan: "per_minute".to_owned(),
                credential_env_var: Some("GOOGLE_APPLICATION_CREDENTIALS".to_owned()),
                require_credential: true,
            },
        }
    }

    pub fn validate(&self) -> CsResult<()> {
        if self.model.trim().is_empty() {
            return Err(CsError::InvalidConfig(format!(
                "provider `{}` is missing a model",
                self.provider.as_str()
            )));
        }
        if self.max_retries == 0 {
            return Err(CsError::InvalidConfig(
                "asr max_retries must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Results and error classification
// ---------------------------------------------------------------------------

/// Normalized per-chunk transcription outcome.
#[derive(Debug, Clone)]
pub struct AsrChunkResult {
    pub status: ChunkStatus,
    pub text: String,
    pub start_sec: f64,
    pub end_sec: f64,
    pub duration_sec: f64,
    pub language: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<AsrErrorKind>,
    pub provider: String,
    pub model: String,
}

impl AsrChunkResult {
    fn ok(text: String, start_sec: f64, end_sec: f64) -> Self {
        Self {
            status: ChunkStatus::Ok,
            text,
            start_sec,
            end_sec,
            duration_sec: (end_sec - start_sec).max(0.0),
            language: None,
            error: None,
            error_kind: None,
            provider: String::new(),
            model: String::new(),
        }
    }

    fn err(kind: AsrErrorKind, message: String, start_sec: f64, end_sec: f64) -> Self {
        Self {
            status: ChunkStatus::Error,
            text: String::new(),
            start_sec,
            end_sec,
            duration_sec: (end_sec - start_sec).max(0.0),
            language: None,
            error: Some(truncate(&message, 500)),
            error_kind: Some(kind),
            provider: String::new(),
            model: String::new(),
        }
    }
}

/// Classify an error message into an [`AsrErrorKind`] by content.
#[must_use]
pub fn classify_asr_error(message: &str) -> AsrErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        return AsrErrorKind::Timeout;
    }
    if ["auth", "unauthorized", "401", "api key", "invalid_api_key"]
        .iter()
        .any(|w| lower.contains(w))
    {
        return AsrErrorKind::Auth;
    }
    if ["quota", "rate limit", "429", "exceeded"]
        .iter()
        .any(|w| lower.contains(w))
    {
        return AsrErrorKind::Quota;
    }
    if ["400", "bad request", "invalid"].iter().any(|w| lower.contains(w)) {
        return AsrErrorKind::Client;
    }
    if ["500", "502", "503", "504", "server error", "internal"]
        .iter()
        .any(|w| lower.contains(w))
    {
        return AsrErrorKind::Server;
    }
    AsrErrorKind::Unknown
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_owned();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_owned()
}

// ---------------------------------------------------------------------------
// Backend contract
// ---------------------------------------------------------------------------

/// Capability contract implemented by every provider backend.
pub trait AsrBackend: Send + Sync {
    /// Machine-readable backend name.
    fn name(&self) -> &'static str;

    /// Transcribe a single chunk. Implementations report failure through the
    /// result, never by panicking.
    fn transcribe_chunk(
        &self,
        wav_path: &Path,
        start_sec: f64,
        end_sec: f64,
        language_hint: &str,
        model: &str,
        timeout: Duration,
    ) -> AsrChunkResult;
}

/// Deterministic stub simulating a Whisper-style hosted backend.
///
/// Chunk files whose stem contains `fail` produce a terminal error and stems
/// containing `timeout` produce a timeout, which keeps every failure path
/// reachable in tests without a network.
pub struct StubWhisperBackend;

impl AsrBackend for StubWhisperBackend {
    fn name(&self) -> &'static str {
        "whisper_stub"
    }

    fn transcribe_chunk(
        &self,
        wav_path: &Path,
        start_sec: f64,
        end_sec: f64,
        _language_hint: &str,
        model: &str,
        _timeout: Duration,
    ) -> AsrChunkResult {
        if let Some(result) = stub_failure(wav_path, start_sec, end_sec) {
            return result;
        }
        AsrChunkResult::ok(
            format!("{model}-chunk-{start_sec:.2}-{end_sec:.2}"),
            start_sec,
            end_sec,
        )
    }
}

/// Deterministic stub for the Google speech provider.
pub struct StubGoogleBackend;

impl AsrBackend for StubGoogleBackend {
    fn name(&self) -> &'static str {
        "google_stub"
    }

    fn transcribe_chunk(
        &self,
        wav_path: &Path,
        start_sec: f64,
        end_sec: f64,
        _language_hint: &str,
        model: &str,
        _timeout: Duration,
    ) -> AsrChunkResult {
        if let Some(result) = stub_failure(wav_path, start_sec, end_sec) {
            return result;
        }
        AsrChunkResult::ok(
            format!("{model}-google-{start_sec:.2}-{end_sec:.2}"),
            start_sec,
            end_sec,
        )
    }
}

fn stub_failure(wav_path: &Path, start_sec: f64, end_sec: f64) -> Option<AsrChunkResult> {
    let stem = wav_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let parent = wav_path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let haystack = format!("{parent}/{stem}");
    if haystack.contains("timeout") {
        return Some(AsrChunkResult::err(
            AsrErrorKind::Timeout,
            "simulated_timeout".to_owned(),
            start_sec,
            end_sec,
        ));
    }
    if haystack.contains("fail") {
        return Some(AsrChunkResult::err(
            AsrErrorKind::Unknown,
            "simulated_failure".to_owned(),
            start_sec,
            end_sec,
        ));
    }
    None
}

/// Local backend shelling out to `whisper-cli` (whisper.cpp).
///
/// Emits JSON via `-oj` next to the chunk and reads the `text` field back.
pub struct WhisperCliBackend;

impl AsrBackend for WhisperCliBackend {
    fn name(&self) -> &'static str {
        "whisper_cli"
    }

    fn transcribe_chunk(
        &self,
        wav_path: &Path,
        start_sec: f64,
        end_sec: f64,
        language_hint: &str,
        model: &str,
        timeout: Duration,
    ) -> AsrChunkResult {
        let output_prefix = wav_path.with_extension("");
        let mut args = vec![
            "-f".to_owned(),
            wav_path.display().to_string(),
            "-m".to_owned(),
            model.to_owned(),
            "-oj".to_owned(),
            "-of".to_owned(),
            output_prefix.display().to_string(),
        ];
        if language_hint != "auto" {
            args.push("-l".to_owned());
            args.push(language_hint.to_owned());
        }

        match run_command_with_timeout("whisper-cli", &args, None, Some(timeout)) {
            Ok(_) => {
                let json_path = output_prefix.with_extension("json");
                match std::fs::read_to_string(&json_path)
                    .map_err(|e| e.to_string())
                    .and_then(|raw| {
                        serde_json::from_str::<serde_json::Value>(&raw).map_err(|e| e.to_string())
                    }) {
                    Ok(value) => {
                        let text = value
                            .get("text")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or_default()
                            .trim()
                            .to_owned();
                        let language = value
                            .pointer("/result/language")
                            .or_else(|| value.get("language"))
                            .and_then(serde_json::Value::as_str)
                            .map(str::to_owned);
                        let mut result = AsrChunkResult::ok(text, start_sec, end_sec);
                        result.language = language;
                        result
                    }
                    Err(message) => AsrChunkResult::err(
                        classify_asr_error(&message),
                        format!("whisper-cli output unreadable: {message}"),
                        start_sec,
                        end_sec,
                    ),
                }
            }
            Err(err) => {
                let kind = if err.is_timeout() {
                    AsrErrorKind::Timeout
                } else if matches!(err, CsError::CommandMissing { .. }) {
                    AsrErrorKind::Client
                } else {
                    classify_asr_error(&err.to_string())
                };
                AsrChunkResult::err(kind, err.to_string(), start_sec, end_sec)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client facade
// ---------------------------------------------------------------------------

pub struct AsrClient {
    cfg: AsrProviderConfig,
    backend: Box<dyn AsrBackend>,
}

impl std::fmt::Debug for AsrClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsrClient")
            .field("cfg", &self.cfg)
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl AsrClient {
    /// Build a client against the real process environment.
    pub fn new(cfg: AsrProviderConfig) -> CsResult<Self> {
        Self::new_with_env(cfg, &|key| std::env::var(key).ok())
    }

    /// Build a client with an explicit environment lookup (tests inject a
    /// fake here; production passes `std::env::var`). The environment is
    /// consulted exactly once, at construction.
    pub fn new_with_env(
        cfg: AsrProviderConfig,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> CsResult<Self> {
        cfg.validate()?;

        if cfg.require_credential
            && let Some(var) = cfg.credential_env_var.as_deref()
            && env(var).is_none()
        {
            return Err(CsError::InvalidConfig(format!(
                "provider `{}` requires environment variable `{var}`",
                cfg.provider.as_str()
            )));
        }

        let backend: Box<dyn AsrBackend> = match cfg.provider {
            ProviderKind::WhisperOpenai => Box::new(StubWhisperBackend),
            ProviderKind::WhisperLocal => Box::new(WhisperCliBackend),
            ProviderKind::GoogleStt => Box::new(StubGoogleBackend),
        };
        tracing::debug!(
            provider = cfg.provider.as_str(),
            backend = backend.name(),
            "asr client ready"
        );
        Ok(Self { cfg, backend })
    }

    #[must_use]
    pub fn provider_name(&self) -> &'static str {
        self.cfg.provider.as_str()
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.cfg.model
    }

    #[must_use]
    pub fn language_hint(&self) -> &str {
        &self.cfg.language_hint
    }

    #[must_use]
    pub fn billing_plan(&self) -> &str {
        &self.cfg.billing_plan
    }

    /// Transcribe one chunk, retrying transient failures up to the
    /// configured bound. Terminal failures return immediately.
    pub fn transcribe_chunk(&self, wav_path: &Path, start_sec: f64, end_sec: f64) -> AsrChunkResult {
        let attempts = self.cfg.max_retries.max(1);
        let mut last: Option<AsrChunkResult> = None;

        for attempt in 0..attempts {
            let mut result = self.backend.transcribe_chunk(
                wav_path,
                start_sec,
                end_sec,
                &self.cfg.language_hint,
                &self.cfg.model,
                self.cfg.timeout,
            );
            result.provider = self.cfg.provider.as_str().to_owned();
            result.model = self.cfg.model.clone();
            if result.language.is_none() {
                result.language = Some(self.cfg.language_hint.clone());
            }

            match result.status {
                ChunkStatus::Ok => return result,
                ChunkStatus::Error => {
                    let transient = result.error_kind.is_some_and(AsrErrorKind::is_transient);
                    if !transient {
                        return result;
                    }
                    tracing::debug!(
                        attempt,
                        kind = ?result.error_kind,
                        "transient asr error, retrying"
                    );
                    last = Some(result);
                }
            }
        }

        last.expect("at least one attempt ran")
    }
}
