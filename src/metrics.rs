//! Run-level metrics: aggregate counts, durations, and costs written once
//! at the end of a run.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CsResult;
use crate::model::{Kind, Message, Status, StatusReason, check_schema_compat};
use crate::outputs::write_atomic;

pub const METRICS_SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub schema_version: String,
    pub messages_total: u64,
    pub voice_total: u64,
    pub voice_ok: u64,
    pub voice_partial: u64,
    pub voice_failed: u64,
    pub media_resolved: u64,
    pub media_unresolved: u64,
    pub media_ambiguous: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asr_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asr_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asr_language: Option<String>,
    pub audio_seconds_total: f64,
    pub asr_cost_total: f64,
    pub wall_clock_seconds: f64,
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self {
            schema_version: METRICS_SCHEMA_VERSION.to_owned(),
            messages_total: 0,
            voice_total: 0,
            voice_ok: 0,
            voice_partial: 0,
            voice_failed: 0,
            media_resolved: 0,
            media_unresolved: 0,
            media_ambiguous: 0,
            asr_provider: None,
            asr_model: None,
            asr_language: None,
            audio_seconds_total: 0.0,
            asr_cost_total: 0.0,
            wall_clock_seconds: 0.0,
        }
    }
}

impl RunMetrics {
    pub fn record_messages(&mut self, messages: &[Message]) {
        self.messages_total = messages.len() as u64;
    }

    /// Media resolution counts from the M2 output.
    pub fn record_media_resolution(&mut self, messages: &[Message]) {
        let mut resolved = 0u64;
        let mut unresolved = 0u64;
        let mut ambiguous = 0u64;
        for msg in messages {
            if msg.media_filename.is_some() {
                resolved += 1;
            } else {
                match msg.status_reason {
                    Some(StatusReason::UnresolvedMedia) => unresolved += 1,
                    Some(StatusReason::AmbiguousMedia) => ambiguous += 1,
                    _ => {}
                }
            }
        }
        self.media_resolved = resolved;
        self.media_unresolved = unresolved;
        self.media_ambiguous = ambiguous;
    }

    /// Voice status counts, total audio seconds, and cost from the M3
    /// output. Provider/model/language come from the first voice payload.
    pub fn record_audio(&mut self, messages: &[Message]) {
        let mut totals = (0u64, 0u64, 0u64, 0u64); // (voice, ok, partial, failed)
        let mut seconds = 0.0f64;
        let mut cost = 0.0f64;

        for msg in messages {
            if msg.kind != Kind::Voice {
                continue;
            }
            totals.0 += 1;
            match msg.status {
                Status::Ok => totals.1 += 1,
                Status::Partial => totals.2 += 1,
                Status::Failed => totals.3 += 1,
                Status::Skipped => {}
            }
            if let Some(payload) = msg.derived.asr.as_ref() {
                seconds += payload.total_duration_seconds;
                cost += payload.cost;
                if self.asr_provider.is_none() {
                    self.asr_provider = payload.provider.clone();
                }
                if self.asr_model.is_none() {
                    self.asr_model = payload.model.clone();
                }
                if self.asr_language.is_none() {
                    self.asr_language = payload.language_hint.clone();
                }
            }
        }

        self.voice_total = totals.0;
        self.voice_ok = totals.1;
        self.voice_partial = totals.2;
        self.voice_failed = totals.3;
        self.audio_seconds_total = round3(seconds);
        self.asr_cost_total = round4(cost);
    }
}

pub fn write_metrics(metrics: &RunMetrics, path: &Path) -> CsResult<()> {
    let bytes = serde_json::to_vec_pretty(metrics)?;
    write_atomic(path, &bytes)
}

pub fn load_metrics(path: &Path) -> CsResult<RunMetrics> {
    let raw = std::fs::read_to_string(path)?;
    let metrics: RunMetrics = serde_json::from_str(&raw)?;
    check_schema_compat(&metrics.schema_version, METRICS_SCHEMA_VERSION)?;
    Ok(metrics)
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AsrPayload, Kind, Message, StatusReason};

    fn msg(idx: u64, kind: Kind) -> Message {
        Message::new(
            idx,
            "2025-07-08T10:00:00".to_owned(),
            "Alice".to_owned(),
            kind,
        )
    }

    #[test]
    fn media_counts_partition_by_reason() {
        let mut resolved = msg(0, Kind::Image);
        resolved.media_filename = Some("/a/img.jpg".to_owned());
        let mut unresolved = msg(1, Kind::Image);
        unresolved.status_reason = Some(StatusReason::UnresolvedMedia);
        let mut ambiguous = msg(2, Kind::Image);
        ambiguous.status_reason = Some(StatusReason::AmbiguousMedia);
        let plain = msg(3, Kind::Text);

        let mut metrics = RunMetrics::default();
        metrics.record_media_resolution(&[resolved, unresolved, ambiguous, plain]);
        assert_eq!(metrics.media_resolved, 1);
        assert_eq!(metrics.media_unresolved, 1);
        assert_eq!(metrics.media_ambiguous, 1);
    }

    #[test]
    fn audio_counts_and_totals() {
        let mut ok = msg(0, Kind::Voice);
        ok.derived.asr = Some(AsrPayload {
            provider: Some("whisper_openai".to_owned()),
            model: Some("whisper-1".to_owned()),
            language_hint: Some("auto".to_owned()),
            total_duration_seconds: 12.5,
            cost: 0.006,
            ..AsrPayload::default()
        });
        let mut partial = msg(1, Kind::Voice);
        partial.mark_partial(StatusReason::AsrPartial);
        partial.derived.asr = Some(AsrPayload {
            total_duration_seconds: 7.5,
            cost: 0.006,
            ..AsrPayload::default()
        });
        let mut failed = msg(2, Kind::Voice);
        failed.mark_failed(StatusReason::AsrFailed);

        let mut metrics = RunMetrics::default();
        metrics.record_audio(&[ok, partial, failed]);

        assert_eq!(metrics.voice_total, 3);
        assert_eq!(metrics.voice_ok, 1);
        assert_eq!(metrics.voice_partial, 1);
        assert_eq!(metrics.voice_failed, 1);
        assert_eq!(metrics.audio_seconds_total, 20.0);
        assert_eq!(metrics.asr_cost_total, 0.012);
        assert_eq!(metrics.asr_provider.as_deref(), Some("whisper_openai"));
        assert_eq!(metrics.asr_language.as_deref(), Some("auto"));
    }

    #[test]
    fn non_voice_messages_do_not_count_toward_audio() {
        let mut metrics = RunMetrics::default();
        metrics.record_audio(&[msg(0, Kind::Text), msg(1, Kind::Image)]);
        assert_eq!(metrics.voice_total, 0);
    }

    #[test]
    fn disk_round_trip_and_version_check() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metrics.json");
        let mut metrics = RunMetrics::default();
        metrics.messages_total = 42;
        write_metrics(&metrics, &path).expect("write");

        let loaded = load_metrics(&path).expect("load");
        assert_eq!(loaded.messages_total, 42);

        let mut bad = RunMetrics::default();
        bad.schema_version = "2.0.0".to_owned();
        write_metrics(&bad, &path).expect("write");
        assert!(load_metrics(&path).is_err(), "major drift rejected");
    }
}
