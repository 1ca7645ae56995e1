//! Pipeline orchestrator.
//!
//! Sequences `M1_parse → M2_media → M3_audio → M5_render` over a run
//! directory, with step-level resume, item-level reuse for voice
//! transcription, a bounded worker pool over voice items, and atomic
//! manifest/metrics updates. Item failures are absorbed into message
//! status; only infrastructure errors fail a step and the run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use crate::asr::{AsrClient, AsrProviderConfig};
use crate::cli::ShutdownController;
use crate::error::{CsError, CsResult};
use crate::manifest::{
    RunManifest, STEP_AUDIO, STEP_MEDIA, STEP_PARSE, STEP_RENDER, StepStatus, load_manifest,
    now_iso, write_manifest,
};
use crate::metrics::{RunMetrics, write_metrics};
use crate::model::{Kind, Message, Status};
use crate::outputs::{load_messages, write_validated};
use crate::parser::ChatParser;
use crate::render::{TextRenderOptions, render_messages_to_txt, write_transcript_preview};
use crate::resolver::{MediaResolver, ResolverConfig};
use crate::transcriber::{AudioConfig, AudioTranscriber};

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation handle shared between the orchestrator and its
/// workers. Checked at suspension points (between messages, between chunks,
/// inside subprocess polling loops).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || ShutdownController::is_shutting_down()
    }

    pub fn checkpoint(&self) -> CsResult<()> {
        if self.is_cancelled() {
            return Err(CsError::Cancelled("cancellation requested".to_owned()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Normalize run_id values into deterministic, filesystem-safe slugs.
#[must_use]
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut last_dash = true;
    for c in value.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_owned();
    if slug.is_empty() { "run".to_owned() } else { slug }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub root: PathBuf,
    pub chat_file: PathBuf,
    pub run_id: String,
    pub run_dir: PathBuf,
    pub max_workers_audio: usize,
    pub overwrite: bool,
    pub resume: bool,
    pub sample_limit: Option<usize>,
    pub sample_every: Option<usize>,
    pub audio: AudioConfig,
    pub asr: AsrProviderConfig,
    pub resolver: ResolverConfig,
}

impl PipelineConfig {
    /// Defaults for a run rooted at `root`: chat file `_chat.txt`, run dir
    /// `<root>/runs/<run_id>`, cache under the run dir.
    #[must_use]
    pub fn for_root(root: &Path, asr: AsrProviderConfig) -> Self {
        let run_id = slugify(
            root.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("run"),
        );
        let run_dir = root.join("runs").join(&run_id);
        let mut audio = AudioConfig::default();
        audio.cache_dir = run_dir.join("cache").join("audio");
        Self {
            root: root.to_path_buf(),
            chat_file: root.join("_chat.txt"),
            run_id,
            run_dir,
            max_workers_audio: 1,
            overwrite: false,
            resume: true,
            sample_limit: None,
            sample_every: None,
            audio,
            asr,
            resolver: ResolverConfig::default(),
        }
    }

    pub fn validate(&self) -> CsResult<()> {
        if !self.root.exists() {
            return Err(CsError::MissingInput(self.root.clone()));
        }
        if !self.chat_file.exists() {
            return Err(CsError::MissingInput(self.chat_file.clone()));
        }
        if self.max_workers_audio == 0 {
            return Err(CsError::InvalidConfig(
                "max_workers_audio must be at least 1".to_owned(),
            ));
        }
        if let Some(every) = self.sample_every
            && every == 0
        {
            return Err(CsError::InvalidConfig(
                "sample_every must be > 0 when provided".to_owned(),
            ));
        }
        if let Some(limit) = self.sample_limit
            && limit == 0
        {
            return Err(CsError::InvalidConfig(
                "sample_limit must be > 0 when provided".to_owned(),
            ));
        }
        self.audio.validate()?;
        self.asr.validate()?;
        self.resolver.validate()?;
        Ok(())
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.run_dir.join("run_manifest.json")
    }

    #[must_use]
    pub fn metrics_path(&self) -> PathBuf {
        self.run_dir.join("metrics.json")
    }

    #[must_use]
    pub fn exceptions_path(&self) -> PathBuf {
        self.run_dir.join("exceptions.csv")
    }

    #[must_use]
    pub fn messages_path(&self, stage: &str) -> PathBuf {
        self.run_dir.join(format!("messages.{stage}.jsonl"))
    }

    #[must_use]
    pub fn chat_output_path(&self) -> PathBuf {
        self.run_dir.join("chat_with_audio.txt")
    }

    #[must_use]
    pub fn preview_path(&self) -> PathBuf {
        self.run_dir.join("preview_transcripts.txt")
    }

    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.run_dir.join("logs")
    }
}

/// Paths produced by a completed run.
#[derive(Debug, Clone)]
pub struct RunOutputs {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub metrics_path: PathBuf,
    pub preview_count: u64,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct PipelineRunner {
    cfg: PipelineConfig,
    token: CancelToken,
}

impl PipelineRunner {
    #[must_use]
    pub fn new(cfg: PipelineConfig) -> Self {
        Self {
            cfg,
            token: CancelToken::new(),
        }
    }

    /// Handle for signaling cancellation from outside (e.g. a Ctrl+C hook).
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn run(&self) -> CsResult<RunOutputs> {
        self.cfg.validate()?;
        std::fs::create_dir_all(&self.cfg.run_dir)?;
        std::fs::create_dir_all(self.cfg.logs_dir())?;

        let manifest_path = self.cfg.manifest_path();
        let mut manifest = if self.cfg.resume && manifest_path.exists() {
            let mut resumed = load_manifest(&manifest_path)?;
            // A rerun starts clean: stale failure state belongs to the
            // previous attempt, not this one.
            resumed.summary.error = None;
            resumed.end_time = None;
            resumed
        } else {
            RunManifest::init(
                &self.cfg.run_id,
                &self.cfg.root,
                &self.cfg.chat_file,
                &self.cfg.run_dir,
            )
        };
        write_manifest(&manifest, &manifest_path)?;

        let run_start = Instant::now();
        let mut metrics = RunMetrics::default();

        let messages_m1 = self.run_m1(&mut manifest)?;
        let messages_m2 = self.run_m2(&mut manifest, &messages_m1)?;
        let messages_m3 = self.run_m3(&mut manifest, &messages_m2)?;
        let preview_count = self.run_m5(&mut manifest, &messages_m3)?;

        metrics.record_messages(&messages_m3);
        metrics.record_media_resolution(&messages_m2);
        metrics.record_audio(&messages_m3);
        metrics.wall_clock_seconds =
            (run_start.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;

        manifest.summary.messages_total = messages_m3.len() as u64;
        manifest.summary.voice_total = metrics.voice_total;
        manifest.finalize();
        write_manifest(&manifest, &manifest_path)?;
        write_metrics(&metrics, &self.cfg.metrics_path())?;

        Ok(RunOutputs {
            run_id: self.cfg.run_id.clone(),
            run_dir: self.cfg.run_dir.clone(),
            manifest_path,
            metrics_path: self.cfg.metrics_path(),
            preview_count,
        })
    }

    // -- step helpers --------------------------------------------------------

    fn can_resume(&self, manifest: &RunManifest, step: &str, required: &[PathBuf]) -> bool {
        if !self.cfg.resume || self.cfg.overwrite {
            return false;
        }
        let step_ok = manifest
            .step(step)
            .is_some_and(|s| s.status == StepStatus::Ok);
        step_ok && required.iter().all(|p| p.exists())
    }

    fn persist(&self, manifest: &RunManifest) -> CsResult<()> {
        write_manifest(manifest, &self.cfg.manifest_path())
    }

    fn fail_step(&self, manifest: &mut RunManifest, step: &str, err: &CsError) {
        tracing::error!(step, error = %err, "step failed");
        manifest.fail_step(step, &err.to_string());
        let _ = self.persist(manifest);
        let _ = self.append_step_log(step, &format!("failed: {err}"));
    }

    fn append_step_log(&self, step: &str, line: &str) -> CsResult<()> {
        use std::io::Write;
        let path = self.cfg.logs_dir().join(format!("{step}.log"));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{} {line}", now_iso())?;
        Ok(())
    }

    // -- M1 ------------------------------------------------------------------

    fn run_m1(&self, manifest: &mut RunManifest) -> CsResult<Vec<Message>> {
        let step = STEP_PARSE;
        let path = self.cfg.messages_path("M1");

        if self.can_resume(manifest, step, &[path.clone()]) {
            let messages = load_messages(&path)?;
            tracing::info!(count = messages.len(), "M1 resumed from disk");
            return Ok(messages);
        }

        manifest.begin_step(step, 0);
        self.persist(manifest)?;
        self.append_step_log(step, "start")?;

        let result = (|| -> CsResult<Vec<Message>> {
            let parser = ChatParser::new(&self.cfg.root, Some(&self.cfg.chat_file));
            let mut messages = parser.parse()?;
            self.apply_sampling(&mut messages);
            write_validated(&messages, &path)?;
            Ok(messages)
        })();

        match result {
            Ok(messages) => {
                manifest.complete_step(step, messages.len() as u64, messages.len() as u64);
                self.persist(manifest)?;
                self.append_step_log(step, &format!("ok total={}", messages.len()))?;
                Ok(messages)
            }
            Err(err) => {
                self.fail_step(manifest, step, &err);
                Err(err)
            }
        }
    }

    fn apply_sampling(&self, messages: &mut Vec<Message>) {
        if let Some(every) = self.cfg.sample_every {
            let mut i = 0usize;
            messages.retain(|_| {
                let keep = i % every == 0;
                i += 1;
                keep
            });
        }
        if let Some(limit) = self.cfg.sample_limit {
            messages.truncate(limit);
        }
        for (new_idx, msg) in messages.iter_mut().enumerate() {
            msg.idx = new_idx as u64;
        }
    }

    // -- M2 ------------------------------------------------------------------

    fn run_m2(&self, manifest: &mut RunManifest, messages_m1: &[Message]) -> CsResult<Vec<Message>> {
        let step = STEP_MEDIA;
        let path = self.cfg.messages_path("M2");

        if self.can_resume(manifest, step, &[path.clone()]) {
            let messages = load_messages(&path)?;
            tracing::info!(count = messages.len(), "M2 resumed from disk");
            return Ok(messages);
        }

        manifest.begin_step(step, messages_m1.len() as u64);
        self.persist(manifest)?;
        self.append_step_log(step, "start")?;

        let result = (|| -> CsResult<Vec<Message>> {
            let mut messages = messages_m1.to_vec();
            let resolver = MediaResolver::new(&self.cfg.root, self.cfg.resolver.clone())?;
            resolver.resolve(&mut messages, &self.cfg.exceptions_path())?;
            write_validated(&messages, &path)?;
            Ok(messages)
        })();

        match result {
            Ok(messages) => {
                manifest.complete_step(step, messages.len() as u64, messages.len() as u64);
                self.persist(manifest)?;
                self.append_step_log(step, &format!("ok total={}", messages.len()))?;
                Ok(messages)
            }
            Err(err) => {
                self.fail_step(manifest, step, &err);
                Err(err)
            }
        }
    }

    // -- M3 ------------------------------------------------------------------

    fn run_m3(&self, manifest: &mut RunManifest, messages_m2: &[Message]) -> CsResult<Vec<Message>> {
        let step = STEP_AUDIO;
        let path = self.cfg.messages_path("M3");

        if self.can_resume(manifest, step, &[path.clone()]) {
            let messages = load_messages(&path)?;
            tracing::info!(count = messages.len(), "M3 resumed from disk");
            return Ok(messages);
        }

        let setup = (|| -> CsResult<AudioTranscriber> {
            let client = AsrClient::new(self.cfg.asr.clone())?;
            AudioTranscriber::new(self.cfg.audio.clone(), client)
        })();
        let transcriber = match setup {
            Ok(transcriber) => transcriber,
            Err(err) => {
                // Configuration failures surface as run-level failures
                // before any audio work begins.
                manifest.begin_step(step, 0);
                self.fail_step(manifest, step, &err);
                return Err(err);
            }
        };

        let mut messages = messages_m2.to_vec();
        let voice_total = messages.iter().filter(|m| m.kind == Kind::Voice).count() as u64;
        manifest.begin_step(step, voice_total);
        self.persist(manifest)?;
        self.append_step_log(step, &format!("start voice_total={voice_total}"))?;

        // Item-level resume: retain prior results that match the current
        // pipeline/provider/model and did not fail.
        let existing = if self.cfg.resume && path.exists() {
            load_messages(&path).unwrap_or_default()
        } else {
            Vec::new()
        };
        let mut done: u64 = 0;
        let mut jobs: Vec<(usize, Message)> = Vec::new();
        for (pos, msg) in messages.iter_mut().enumerate() {
            if msg.kind != Kind::Voice {
                continue;
            }
            if let Some(prior) = existing.iter().find(|m| m.idx == msg.idx)
                && self.reusable(prior)
            {
                *msg = prior.clone();
                done += 1;
                continue;
            }
            jobs.push((pos, msg.clone()));
        }
        if done > 0 {
            manifest.set_done(step, done);
            self.persist(manifest)?;
        }

        let outcome = self.transcribe_pool(&transcriber, &jobs, manifest, step, &mut done);
        match outcome {
            Ok(results) => {
                for (pos, msg) in results {
                    messages[pos] = msg;
                }
            }
            Err(err) => {
                self.fail_step(manifest, step, &err);
                return Err(err);
            }
        }

        let result = write_validated(&messages, &path);
        match result {
            Ok(()) => {
                manifest.complete_step(step, voice_total, voice_total);
                self.persist(manifest)?;
                self.append_step_log(step, &format!("ok voice_total={voice_total}"))?;
                Ok(messages)
            }
            Err(err) => {
                self.fail_step(manifest, step, &err);
                Err(err)
            }
        }
    }

    fn reusable(&self, prior: &Message) -> bool {
        if prior.status == Status::Failed {
            return false;
        }
        let Some(payload) = prior.derived.asr.as_ref() else {
            return false;
        };
        payload.pipeline_version == crate::model::AUDIO_PIPELINE_VERSION
            && payload.provider.as_deref() == Some(self.cfg.asr.provider.as_str())
            && payload.model.as_deref() == Some(self.cfg.asr.model.as_str())
    }

    /// Bounded pool over voice items. Workers pull jobs from a shared
    /// cursor and report results over a channel; the orchestrator thread
    /// owns all manifest writes. Output order is restored by position, so
    /// worker count never changes the bytes written.
    fn transcribe_pool(
        &self,
        transcriber: &AudioTranscriber,
        jobs: &[(usize, Message)],
        manifest: &mut RunManifest,
        step: &str,
        done: &mut u64,
    ) -> CsResult<Vec<(usize, Message)>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let workers = self.cfg.max_workers_audio.min(jobs.len()).max(1);
        let cursor = AtomicUsize::new(0);
        let (result_tx, result_rx) = mpsc::channel::<(usize, CsResult<Message>)>();

        let mut results: Vec<(usize, Message)> = Vec::with_capacity(jobs.len());
        let mut first_error: Option<CsError> = None;

        thread::scope(|scope| {
            for _ in 0..workers {
                let result_tx = result_tx.clone();
                let cursor = &cursor;
                let token = self.token.clone();
                scope.spawn(move || {
                    loop {
                        let i = cursor.fetch_add(1, Ordering::SeqCst);
                        if i >= jobs.len() {
                            break;
                        }
                        let (pos, mut msg) = jobs[i].clone();
                        // Checkpoint between messages; further suspension
                        // points live inside the transcriber.
                        let outcome = token
                            .checkpoint()
                            .and_then(|()| transcriber.transcribe_with_token(&mut msg, Some(&token)));
                        if result_tx.send((pos, outcome.map(|()| msg))).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            for (pos, outcome) in result_rx {
                match outcome {
                    Ok(msg) => {
                        results.push((pos, msg));
                        *done += 1;
                        manifest.set_done(step, *done);
                        let _ = self.persist(manifest);
                    }
                    Err(err) => {
                        // First error wins; cancel the pool so workers drain.
                        if first_error.is_none() {
                            self.token.cancel();
                            first_error = Some(err);
                        }
                    }
                }
            }
        });

        match first_error {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    // -- M5 ------------------------------------------------------------------

    fn run_m5(&self, manifest: &mut RunManifest, messages_m3: &[Message]) -> CsResult<u64> {
        let step = STEP_RENDER;
        let chat_path = self.cfg.chat_output_path();

        if self.can_resume(manifest, step, &[chat_path.clone()]) {
            return Ok(messages_m3.iter().filter(|m| m.kind == Kind::Voice).count() as u64);
        }

        manifest.begin_step(step, messages_m3.len() as u64);
        self.persist(manifest)?;
        self.append_step_log(step, "start")?;

        let result = (|| -> CsResult<u64> {
            render_messages_to_txt(messages_m3, &chat_path, &TextRenderOptions::default())?;
            write_transcript_preview(messages_m3, &self.cfg.preview_path(), 120)
        })();

        match result {
            Ok(preview_count) => {
                manifest.complete_step(
                    step,
                    messages_m3.len() as u64,
                    messages_m3.len() as u64,
                );
                self.persist(manifest)?;
                self.append_step_log(step, &format!("ok preview_count={preview_count}"))?;
                Ok(preview_count)
            }
            Err(err) => {
                self.fail_step(manifest, step, &err);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProviderKind;

    #[test]
    fn slugify_normalizes_run_ids() {
        assert_eq!(slugify("My Chat Export"), "my-chat-export");
        assert_eq!(slugify("  already-slugged "), "already-slugged");
        assert_eq!(slugify("***"), "run");
        assert_eq!(slugify("A__B"), "a-b");
    }

    #[test]
    fn cancel_token_trips_checkpoint() {
        let token = CancelToken::new();
        token.checkpoint().expect("fresh token passes");
        token.cancel();
        assert!(token.is_cancelled());
        let err = token.checkpoint().unwrap_err();
        assert!(matches!(err, CsError::Cancelled(_)));
    }

    #[test]
    fn cancel_token_clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled(), "clone observes cancellation");
    }

    #[test]
    fn config_validation_requires_existing_inputs() {
        let asr = AsrProviderConfig::for_provider(ProviderKind::WhisperOpenai);
        let cfg = PipelineConfig::for_root(Path::new("/no/such/archive"), asr);
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, CsError::MissingInput(_)));
    }

    #[test]
    fn config_validation_rejects_zero_workers_and_samples() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("_chat.txt"), "7/8/25, 10:03 - A: hi\n").expect("write");
        let asr = AsrProviderConfig::for_provider(ProviderKind::WhisperOpenai);

        let mut cfg = PipelineConfig::for_root(dir.path(), asr.clone());
        cfg.max_workers_audio = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::for_root(dir.path(), asr.clone());
        cfg.sample_every = Some(0);
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::for_root(dir.path(), asr);
        cfg.sample_limit = Some(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_paths_live_under_run_dir() {
        let asr = AsrProviderConfig::for_provider(ProviderKind::WhisperOpenai);
        let cfg = PipelineConfig::for_root(Path::new("/archive"), asr);
        assert!(cfg.manifest_path().starts_with(&cfg.run_dir));
        assert!(cfg.messages_path("M2").ends_with("messages.M2.jsonl"));
        assert!(cfg.chat_output_path().ends_with("chat_with_audio.txt"));
        assert!(cfg.exceptions_path().ends_with("exceptions.csv"));
    }

    #[test]
    fn for_root_slugs_run_id_from_directory_name() {
        let asr = AsrProviderConfig::for_provider(ProviderKind::WhisperOpenai);
        let cfg = PipelineConfig::for_root(Path::new("/data/My Export"), asr);
        assert_eq!(cfg.run_id, "my-export");
        assert!(cfg.run_dir.ends_with("runs/my-export"));
    }
}
