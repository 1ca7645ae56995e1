//! Run manifest: the versioned progress contract shared by the runner, the
//! CLI `status` surface, and external watchers. Every write goes through
//! write-temp-then-rename so readers never observe a torn manifest.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CsResult;
use crate::model::check_schema_compat;
use crate::outputs::write_atomic;

pub const MANIFEST_SCHEMA_VERSION: &str = "1.0.0";

pub const STEP_PARSE: &str = "M1_parse";
pub const STEP_MEDIA: &str = "M2_media";
pub const STEP_AUDIO: &str = "M3_audio";
pub const STEP_RENDER: &str = "M5_render";

pub const DEFAULT_STEPS: [&str; 4] = [STEP_PARSE, STEP_MEDIA, STEP_AUDIO, STEP_RENDER];

/// Second-precision UTC timestamp, `YYYY-MM-DDTHH:MM:SSZ`.
#[must_use]
pub fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Ok,
    Failed,
    Skipped,
}

impl StepStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepProgress {
    pub name: String,
    pub status: StepStatus,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub done: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

impl StepProgress {
    #[must_use]
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            status: StepStatus::Pending,
            total: 0,
            done: 0,
            error: None,
            started_at: None,
            ended_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(default)]
    pub messages_total: u64,
    #[serde(default)]
    pub voice_total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: String,
    pub run_id: String,
    pub root: String,
    pub chat_file: String,
    pub run_dir: String,
    pub start_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub steps: BTreeMap<String, StepProgress>,
    pub summary: RunSummary,
}

impl RunManifest {
    #[must_use]
    pub fn init(run_id: &str, root: &Path, chat_file: &Path, run_dir: &Path) -> Self {
        let steps = DEFAULT_STEPS
            .iter()
            .map(|name| ((*name).to_owned(), StepProgress::pending(name)))
            .collect();
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION.to_owned(),
            run_id: run_id.to_owned(),
            root: root.display().to_string(),
            chat_file: chat_file.display().to_string(),
            run_dir: run_dir.display().to_string(),
            start_time: now_iso(),
            end_time: None,
            current_step: None,
            steps,
            summary: RunSummary::default(),
        }
    }

    pub fn step_mut(&mut self, name: &str) -> &mut StepProgress {
        self.steps
            .entry(name.to_owned())
            .or_insert_with(|| StepProgress::pending(name))
    }

    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepProgress> {
        self.steps.get(name)
    }

    pub fn begin_step(&mut self, name: &str, total: u64) {
        self.current_step = Some(name.to_owned());
        let step = self.step_mut(name);
        step.status = StepStatus::Running;
        step.total = total;
        step.done = 0;
        step.error = None;
        step.started_at = Some(now_iso());
        step.ended_at = None;
    }

    pub fn complete_step(&mut self, name: &str, total: u64, done: u64) {
        let step = self.step_mut(name);
        step.status = StepStatus::Ok;
        step.total = total;
        step.done = done;
        step.ended_at = Some(now_iso());
        if self.current_step.as_deref() == Some(name) {
            self.current_step = None;
        }
    }

    pub fn fail_step(&mut self, name: &str, error: &str) {
        let step = self.step_mut(name);
        step.status = StepStatus::Failed;
        step.error = Some(error.to_owned());
        step.ended_at = Some(now_iso());
        self.summary.error = Some(format!("{name}: {error}"));
    }

    /// Monotonic progress update for the running step.
    pub fn set_done(&mut self, name: &str, done: u64) {
        let step = self.step_mut(name);
        step.done = step.done.max(done);
    }

    pub fn finalize(&mut self) {
        self.end_time = Some(now_iso());
    }

    /// Overall run state: failed > running > ok > pending.
    #[must_use]
    pub fn overall_status(&self) -> StepStatus {
        if self.summary.error.is_some() {
            return StepStatus::Failed;
        }
        let statuses: Vec<StepStatus> = self.steps.values().map(|s| s.status).collect();
        if statuses.iter().any(|s| *s == StepStatus::Failed) {
            return StepStatus::Failed;
        }
        if statuses.iter().any(|s| *s == StepStatus::Running) {
            return StepStatus::Running;
        }
        if !statuses.is_empty()
            && statuses
                .iter()
                .all(|s| matches!(s, StepStatus::Ok | StepStatus::Skipped))
        {
            return StepStatus::Ok;
        }
        StepStatus::Pending
    }
}

pub fn write_manifest(manifest: &RunManifest, path: &Path) -> CsResult<()> {
    let bytes = serde_json::to_vec_pretty(manifest)?;
    write_atomic(path, &bytes)
}

/// Load and version-check a manifest. An incompatible major version is a
/// loud failure, not a silent re-init.
pub fn load_manifest(path: &Path) -> CsResult<RunManifest> {
    let raw = std::fs::read_to_string(path)?;
    let manifest: RunManifest = serde_json::from_str(&raw)?;
    check_schema_compat(&manifest.schema_version, MANIFEST_SCHEMA_VERSION)?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fresh() -> RunManifest {
        RunManifest::init(
            "test-run",
            &PathBuf::from("/archive"),
            &PathBuf::from("/archive/_chat.txt"),
            &PathBuf::from("/archive/runs/test-run"),
        )
    }

    #[test]
    fn init_seeds_all_steps_pending() {
        let manifest = fresh();
        assert_eq!(manifest.steps.len(), 4);
        for name in DEFAULT_STEPS {
            let step = manifest.step(name).expect("step present");
            assert_eq!(step.status, StepStatus::Pending);
            assert_eq!(step.done, 0);
        }
        assert_eq!(manifest.overall_status(), StepStatus::Pending);
    }

    #[test]
    fn begin_and_complete_step_lifecycle() {
        let mut manifest = fresh();
        manifest.begin_step(STEP_AUDIO, 7);
        assert_eq!(manifest.current_step.as_deref(), Some(STEP_AUDIO));
        let step = manifest.step(STEP_AUDIO).expect("step");
        assert_eq!(step.status, StepStatus::Running);
        assert_eq!(step.total, 7);
        assert!(step.started_at.is_some());
        assert_eq!(manifest.overall_status(), StepStatus::Running);

        manifest.complete_step(STEP_AUDIO, 7, 7);
        let step = manifest.step(STEP_AUDIO).expect("step");
        assert_eq!(step.status, StepStatus::Ok);
        assert!(step.ended_at.is_some());
        assert!(manifest.current_step.is_none());
    }

    #[test]
    fn fail_step_populates_summary_error() {
        let mut manifest = fresh();
        manifest.begin_step(STEP_PARSE, 0);
        manifest.fail_step(STEP_PARSE, "chat export not found");
        assert_eq!(manifest.overall_status(), StepStatus::Failed);
        let error = manifest.summary.error.as_deref().expect("summary error");
        assert!(error.starts_with("M1_parse:"), "got: {error}");
    }

    #[test]
    fn set_done_is_monotonic() {
        let mut manifest = fresh();
        manifest.begin_step(STEP_AUDIO, 5);
        manifest.set_done(STEP_AUDIO, 3);
        manifest.set_done(STEP_AUDIO, 2); // late, out-of-order report
        assert_eq!(manifest.step(STEP_AUDIO).expect("step").done, 3);
    }

    #[test]
    fn all_ok_is_overall_ok() {
        let mut manifest = fresh();
        for name in DEFAULT_STEPS {
            manifest.begin_step(name, 1);
            manifest.complete_step(name, 1, 1);
        }
        assert_eq!(manifest.overall_status(), StepStatus::Ok);
    }

    #[test]
    fn round_trip_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run_manifest.json");
        let mut manifest = fresh();
        manifest.begin_step(STEP_PARSE, 10);
        write_manifest(&manifest, &path).expect("write");

        let loaded = load_manifest(&path).expect("load");
        assert_eq!(loaded.run_id, "test-run");
        assert_eq!(
            loaded.step(STEP_PARSE).expect("step").status,
            StepStatus::Running
        );
    }

    #[test]
    fn load_rejects_incompatible_major() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run_manifest.json");
        let mut manifest = fresh();
        manifest.schema_version = "9.0.0".to_owned();
        write_manifest(&manifest, &path).expect("write");

        let err = load_manifest(&path).unwrap_err();
        assert!(
            matches!(err, crate::error::CsError::SchemaMismatch(_)),
            "got: {err:?}"
        );
    }

    #[test]
    fn summary_extra_fields_round_trip() {
        let mut manifest = fresh();
        manifest
            .summary
            .extra
            .insert("resume_enabled".to_owned(), serde_json::json!(true));
        let raw = serde_json::to_string(&manifest).expect("serialize");
        let back: RunManifest = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(
            back.summary.extra.get("resume_enabled"),
            Some(&serde_json::json!(true))
        );
    }
}
