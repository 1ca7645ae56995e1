use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Args, Parser, Subcommand};

use crate::asr::AsrProviderConfig;
use crate::error::{CsError, CsResult};
use crate::model::ProviderKind;
use crate::render::RtlMode;
use crate::runner::PipelineConfig;

// ---------------------------------------------------------------------------
// Graceful Ctrl+C shutdown
// ---------------------------------------------------------------------------

/// Global flag indicating that a shutdown signal has been received.
static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

/// Coordinates graceful Ctrl+C shutdown.
///
/// When a signal is received the controller sets a global `AtomicBool`,
/// which cancellation tokens poll via [`ShutdownController::is_shutting_down`].
pub struct ShutdownController;

impl ShutdownController {
    /// Install the Ctrl+C signal handler. `on_signal` is an optional
    /// callback invoked from the signal-handler context, typically used to
    /// trip a [`crate::runner::CancelToken`]. Errors are non-fatal.
    pub fn install(on_signal: Option<Box<dyn Fn() + Send + Sync + 'static>>) -> CsResult<()> {
        ctrlc::set_handler(move || {
            SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
            tracing::info!("shutdown signal received (Ctrl+C)");
            if let Some(ref cb) = on_signal {
                cb();
            }
        })
        .map_err(|e| CsError::Io(std::io::Error::other(format!("ctrlc handler: {e}"))))?;
        Ok(())
    }

    #[must_use]
    pub fn is_shutting_down() -> bool {
        SHUTDOWN_FLAG.load(Ordering::SeqCst)
    }

    /// Programmatically trigger the shutdown flag (internal cancel paths).
    pub fn trigger_shutdown() {
        SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
    }

    /// Exit code when terminating due to a signal: 128 + SIGINT(2).
    #[must_use]
    pub const fn signal_exit_code() -> i32 {
        130
    }
}

// ---------------------------------------------------------------------------
// Command surface
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "chatscribe")]
#[command(about = "Deterministic chat-archive transcription pipeline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the full pipeline: parse, resolve media, transcribe, render.
    Run(Box<RunArgs>),
    /// Parse the chat export into stage-M1 JSONL.
    Parse(ParseArgs),
    /// Resolve media bindings over an existing stage output.
    Resolve(ResolveArgs),
    /// Transcribe voice messages over an existing stage output.
    Transcribe(TranscribeArgs),
    /// Render a stage output to the human-readable transcript.
    Render(RenderArgs),
    /// Summarize a run directory from its manifest and metrics.
    Status(StatusArgs),
}

#[derive(Debug, Clone, Args)]
pub struct AsrArgs {
    /// ASR provider backend.
    #[arg(long, value_enum, default_value_t = ProviderKind::WhisperOpenai)]
    pub asr_provider: ProviderKind,

    /// Provider model override.
    #[arg(long)]
    pub asr_model: Option<String>,

    /// Language hint (BCP-47-like code or `auto`).
    #[arg(long)]
    pub asr_language: Option<String>,
}

impl AsrArgs {
    #[must_use]
    pub fn to_provider_config(&self) -> AsrProviderConfig {
        let mut cfg = AsrProviderConfig::for_provider(self.asr_provider);
        if let Some(model) = &self.asr_model {
            cfg.model = model.clone();
        }
        if let Some(language) = &self.asr_language {
            cfg.language_hint = language.clone();
        }
        cfg
    }
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Archive root: directory holding the chat export and media tree.
    #[arg(long)]
    pub root: PathBuf,

    /// Chat transcript override (defaults to `<root>/_chat.txt`).
    #[arg(long)]
    pub chat_file: Option<PathBuf>,

    /// Run identifier (defaults to a slug of the root directory name).
    #[arg(long)]
    pub run_id: Option<String>,

    /// Run directory override (defaults to `<root>/runs/<run_id>`).
    #[arg(long)]
    pub run_dir: Option<PathBuf>,

    /// Bounded worker pool size for voice transcription.
    #[arg(long, default_value_t = 1)]
    pub max_workers_audio: usize,

    #[command(flatten)]
    pub asr: AsrArgs,

    /// Disable step-level and item-level resume.
    #[arg(long)]
    pub no_resume: bool,

    /// Recompute every step even when outputs exist.
    #[arg(long)]
    pub overwrite: bool,

    /// Keep only the first N messages after parsing.
    #[arg(long)]
    pub sample_limit: Option<usize>,

    /// Keep every Nth message after parsing.
    #[arg(long)]
    pub sample_every: Option<usize>,
}

impl RunArgs {
    pub fn to_config(&self) -> CsResult<PipelineConfig> {
        let mut cfg = PipelineConfig::for_root(&self.root, self.asr.to_provider_config());
        if let Some(chat_file) = &self.chat_file {
            cfg.chat_file = chat_file.clone();
        }
        if let Some(run_id) = &self.run_id {
            cfg.run_id = crate::runner::slugify(run_id);
            cfg.run_dir = self.root.join("runs").join(&cfg.run_id);
            cfg.audio.cache_dir = cfg.run_dir.join("cache").join("audio");
        }
        if let Some(run_dir) = &self.run_dir {
            cfg.run_dir = run_dir.clone();
            cfg.audio.cache_dir = run_dir.join("cache").join("audio");
        }
        cfg.max_workers_audio = self.max_workers_audio;
        cfg.resume = !self.no_resume;
        cfg.overwrite = self.overwrite;
        cfg.sample_limit = self.sample_limit;
        cfg.sample_every = self.sample_every;
        Ok(cfg)
    }
}

#[derive(Debug, Args)]
pub struct ParseArgs {
    /// Archive root or direct path to the transcript.
    #[arg(long)]
    pub root: PathBuf,

    /// Chat transcript override.
    #[arg(long)]
    pub chat_file: Option<PathBuf>,

    /// Output JSONL path.
    #[arg(long, default_value = "messages.M1.jsonl")]
    pub out: PathBuf,
}

#[derive(Debug, Args)]
pub struct ResolveArgs {
    /// Archive root holding the media tree.
    #[arg(long)]
    pub root: PathBuf,

    /// Input stage JSONL.
    #[arg(long)]
    pub messages: PathBuf,

    /// Output JSONL path.
    #[arg(long, default_value = "messages.M2.jsonl")]
    pub out: PathBuf,

    /// Exceptions CSV path.
    #[arg(long, default_value = "exceptions.csv")]
    pub exceptions: PathBuf,
}

#[derive(Debug, Args)]
pub struct TranscribeArgs {
    /// Input stage JSONL.
    #[arg(long)]
    pub messages: PathBuf,

    /// Output JSONL path.
    #[arg(long, default_value = "messages.M3.jsonl")]
    pub out: PathBuf,

    /// Audio cache directory.
    #[arg(long, default_value = "cache/audio")]
    pub cache_dir: PathBuf,

    #[command(flatten)]
    pub asr: AsrArgs,
}

#[derive(Debug, Args)]
pub struct RenderArgs {
    /// Input stage JSONL.
    #[arg(long)]
    pub messages: PathBuf,

    /// Output transcript path.
    #[arg(long, default_value = "chat_with_audio.txt")]
    pub out: PathBuf,

    /// Drop system messages from the transcript.
    #[arg(long)]
    pub hide_system: bool,

    /// Append status/reason suffixes to each line.
    #[arg(long)]
    pub show_status: bool,

    /// Collapse multi-line bodies onto the header line.
    #[arg(long)]
    pub flatten_multiline: bool,

    /// Bidi handling for RTL text.
    #[arg(long, value_enum, default_value_t = RtlMode::None)]
    pub rtl_mode: RtlMode,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Run directory containing run_manifest.json.
    #[arg(long)]
    pub run_dir: PathBuf,

    /// Emit machine-readable JSON instead of the table.
    #[arg(long)]
    pub json: bool,
}
