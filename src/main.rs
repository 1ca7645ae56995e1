use clap::Parser;

use chatscribe::asr::AsrClient;
use chatscribe::cli::{Cli, Command, ShutdownController};
use chatscribe::error::{CsError, CsResult};
use chatscribe::manifest::load_manifest;
use chatscribe::metrics::load_metrics;
use chatscribe::outputs::{load_messages, write_validated};
use chatscribe::parser::ChatParser;
use chatscribe::render::{TextRenderOptions, render_messages_to_txt};
use chatscribe::resolver::{MediaResolver, ResolverConfig};
use chatscribe::runner::PipelineRunner;
use chatscribe::transcriber::{AudioConfig, AudioTranscriber};

fn main() {
    chatscribe::logging::init();

    if let Err(e) = ShutdownController::install(None) {
        tracing::warn!("failed to install Ctrl+C handler: {e}");
    }

    if let Err(error) = run() {
        if ShutdownController::is_shutting_down() {
            eprintln!("interrupted");
            std::process::exit(ShutdownController::signal_exit_code());
        }
        eprintln!("error: {error}");
        std::process::exit(1);
    }

    if ShutdownController::is_shutting_down() {
        std::process::exit(ShutdownController::signal_exit_code());
    }
}

fn run() -> CsResult<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => {
            let cfg = args.to_config()?;
            // Ctrl+C reaches the workers through the global shutdown flag,
            // which every cancellation token polls at its checkpoints.
            let runner = PipelineRunner::new(cfg);
            let outputs = runner.run()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "run_id": outputs.run_id,
                    "run_dir": outputs.run_dir,
                    "manifest": outputs.manifest_path,
                    "metrics": outputs.metrics_path,
                    "preview_count": outputs.preview_count,
                }))?
            );
            Ok(())
        }
        Command::Parse(args) => {
            let parser = ChatParser::new(&args.root, args.chat_file.as_deref());
            let messages = parser.parse()?;
            write_validated(&messages, &args.out)?;
            println!("parsed {} messages -> {}", messages.len(), args.out.display());
            Ok(())
        }
        Command::Resolve(args) => {
            let mut messages = load_messages(&args.messages)?;
            let resolver = MediaResolver::new(&args.root, ResolverConfig::default())?;
            resolver.resolve(&mut messages, &args.exceptions)?;
            write_validated(&messages, &args.out)?;
            let resolved = messages
                .iter()
                .filter(|m| m.media_filename.is_some())
                .count();
            println!(
                "resolved {resolved}/{} messages -> {}",
                messages.len(),
                args.out.display()
            );
            Ok(())
        }
        Command::Transcribe(args) => {
            let mut messages = load_messages(&args.messages)?;
            let client = AsrClient::new(args.asr.to_provider_config())?;
            let audio_cfg = AudioConfig {
                cache_dir: args.cache_dir.clone(),
                ..AudioConfig::default()
            };
            let transcriber = AudioTranscriber::new(audio_cfg, client)?;
            for msg in &mut messages {
                transcriber.transcribe(msg)?;
            }
            write_validated(&messages, &args.out)?;
            let voice = messages
                .iter()
                .filter(|m| m.kind == chatscribe::model::Kind::Voice)
                .count();
            println!("transcribed {voice} voice messages -> {}", args.out.display());
            Ok(())
        }
        Command::Render(args) => {
            let messages = load_messages(&args.messages)?;
            let options = TextRenderOptions {
                hide_system: args.hide_system,
                show_status: args.show_status,
                flatten_multiline: args.flatten_multiline,
                rtl_mode: args.rtl_mode,
            };
            let summary = render_messages_to_txt(&messages, &args.out, &options)?;
            println!(
                "rendered {} lines ({} voice, {} media, {} system) -> {}",
                summary.total,
                summary.voice,
                summary.media,
                summary.system,
                args.out.display()
            );
            Ok(())
        }
        Command::Status(args) => {
            let manifest_path = args.run_dir.join("run_manifest.json");
            if !manifest_path.exists() {
                return Err(CsError::MissingInput(manifest_path));
            }
            let manifest = load_manifest(&manifest_path)?;
            let metrics = load_metrics(&args.run_dir.join("metrics.json")).ok();

            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "manifest": manifest,
                        "metrics": metrics,
                        "overall": manifest.overall_status().as_str(),
                    }))?
                );
                return Ok(());
            }

            println!(
                "run {} [{}]  {} -> {}",
                manifest.run_id,
                manifest.overall_status().as_str(),
                manifest.start_time,
                manifest.end_time.as_deref().unwrap_or("…"),
            );
            for (name, step) in &manifest.steps {
                println!(
                    "  {name:<10} {:<8} {}/{}{}",
                    step.status.as_str(),
                    step.done,
                    step.total,
                    step.error
                        .as_deref()
                        .map(|e| format!("  ({e})"))
                        .unwrap_or_default()
                );
            }
            if let Some(metrics) = metrics {
                println!(
                    "  voice {}/{} ok, {} partial, {} failed; {:.1}s audio, ${:.4}",
                    metrics.voice_ok,
                    metrics.voice_total,
                    metrics.voice_partial,
                    metrics.voice_failed,
                    metrics.audio_seconds_total,
                    metrics.asr_cost_total,
                );
            }
            if let Some(error) = manifest.summary.error.as_deref() {
                println!("  error: {error}");
            }
            Ok(())
        }
    }
}
