//! Rendered transcript output (stage M5).
//!
//! `chat_with_audio.txt` is the human-readable merge of the final stage
//! output: one header line per message, continuations indented, media
//! placeholders where nothing was resolved or transcribed. The preview file
//! carries one diagnostic line per voice message.

use std::path::Path;
use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;

use crate::error::CsResult;
use crate::model::{Kind, Message, Status, StatusReason};
use crate::outputs::write_atomic;
use crate::transcriber::PLACEHOLDER_TRANSCRIPTION_FAILED;

/// Right-to-Left Embedding / Pop Directional Formatting.
const RLE: char = '\u{202B}';
const PDF: char = '\u{202C}';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RtlMode {
    #[default]
    None,
    BidiMarks,
}

#[derive(Debug, Clone, Default)]
pub struct TextRenderOptions {
    pub hide_system: bool,
    pub show_status: bool,
    pub flatten_multiline: bool,
    pub rtl_mode: RtlMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderSummary {
    pub total: u64,
    pub text: u64,
    pub voice: u64,
    pub media: u64,
    pub system: u64,
}

static ARABIC_RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x{0600}-\x{06FF}]").expect("arabic range regex"));

fn has_arabic(text: &str) -> bool {
    ARABIC_RANGE.is_match(text)
}

/// Wrap text in bidi embedding marks when it contains Arabic and the mode
/// asks for it.
#[must_use]
pub fn wrap_rtl_segments(text: &str, mode: RtlMode) -> String {
    match mode {
        RtlMode::None => text.to_owned(),
        RtlMode::BidiMarks if has_arabic(text) => format!("{RLE}{text}{PDF}"),
        RtlMode::BidiMarks => text.to_owned(),
    }
}

fn ts_human(ts_iso: &str) -> String {
    NaiveDateTime::parse_from_str(ts_iso, "%Y-%m-%dT%H:%M:%S")
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|_| ts_iso.to_owned())
}

fn status_suffix(msg: &Message, options: &TextRenderOptions) -> String {
    if !options.show_status {
        return String::new();
    }
    match msg.status_reason {
        Some(reason) => format!(
            "[status={}, reason={}]",
            msg.status.as_str(),
            reason.as_str()
        ),
        None => format!("[status={}]", msg.status.as_str()),
    }
}

fn select_body(msg: &Message) -> String {
    if msg.kind == Kind::System {
        if !msg.content_text.is_empty() {
            return msg.content_text.clone();
        }
        if !msg.raw_block.is_empty() {
            return msg.raw_block.clone();
        }
        return "[SYSTEM MESSAGE]".to_owned();
    }

    if !msg.content_text.is_empty() {
        return msg.content_text.clone();
    }
    if let Some(caption) = msg.caption.as_ref() {
        return caption.clone();
    }

    match msg.kind {
        Kind::Voice => {
            if msg.status == Status::Failed {
                PLACEHOLDER_TRANSCRIPTION_FAILED.to_owned()
            } else {
                "[UNTRANSCRIBED VOICE NOTE]".to_owned()
            }
        }
        Kind::Image => format!("[IMAGE: {}]", msg.media_hint.as_deref().unwrap_or("unknown")),
        Kind::Video => format!("[VIDEO: {}]", msg.media_hint.as_deref().unwrap_or("unknown")),
        Kind::Document => format!(
            "[DOCUMENT: {}]",
            msg.media_hint.as_deref().unwrap_or("unknown")
        ),
        Kind::Sticker => "[STICKER]".to_owned(),
        Kind::Unknown => "[UNKNOWN MESSAGE]".to_owned(),
        Kind::Text | Kind::System => {
            if msg.status == Status::Skipped {
                let reason = msg
                    .status_reason
                    .map_or("reason_unknown", StatusReason::as_str);
                format!("[SKIPPED: {reason}]")
            } else {
                String::new()
            }
        }
    }
}

/// Render the final stage output to `out_path`, sorted by `idx`.
pub fn render_messages_to_txt(
    messages: &[Message],
    out_path: &Path,
    options: &TextRenderOptions,
) -> CsResult<RenderSummary> {
    let mut sorted: Vec<&Message> = messages.iter().collect();
    sorted.sort_by_key(|m| m.idx);

    let mut summary = RenderSummary::default();
    let mut out = String::new();

    for msg in sorted {
        if msg.kind == Kind::System {
            if options.hide_system {
                continue;
            }
            let body = wrap_rtl_segments(&select_body(msg), options.rtl_mode);
            let suffix = status_suffix(msg, options);
            out.push_str(&format!(
                "{} - SYSTEM: {body}{suffix}\n",
                ts_human(&msg.ts)
            ));
            summary.system += 1;
            summary.total += 1;
            continue;
        }

        if msg.status == Status::Skipped
            && msg.status_reason == Some(StatusReason::MergedIntoPreviousMedia)
        {
            continue;
        }

        let body = wrap_rtl_segments(&select_body(msg), options.rtl_mode);
        let lines: Vec<&str> = if body.is_empty() {
            vec![""]
        } else {
            body.split('\n').collect()
        };
        let suffix = status_suffix(msg, options);
        let ts = ts_human(&msg.ts);

        let first = if options.flatten_multiline {
            lines[0].trim()
        } else {
            lines[0]
        };
        out.push_str(&format!("{ts} - {}: {first}{suffix}\n", msg.sender));
        if !options.flatten_multiline {
            for cont in &lines[1..] {
                out.push_str(&format!("    {cont}\n"));
            }
        }

        summary.total += 1;
        match msg.kind {
            Kind::Voice => summary.voice += 1,
            Kind::Image | Kind::Video | Kind::Document => summary.media += 1,
            _ => summary.text += 1,
        }
    }

    write_atomic(out_path, out.as_bytes())?;
    Ok(summary)
}

/// One-line diagnostic preview for a voice message.
#[must_use]
pub fn format_preview_line(msg: &Message, max_chars: usize) -> String {
    let ts = ts_human(&msg.ts);
    let status_part = match msg.status_reason {
        Some(reason) => format!("{}/{}", msg.status.as_str(), reason.as_str()),
        None => msg.status.as_str().to_owned(),
    };
    let provider = msg
        .derived
        .asr
        .as_ref()
        .and_then(|p| p.provider.as_deref())
        .unwrap_or("-");

    let text = if !msg.content_text.is_empty() {
        msg.content_text.clone()
    } else if msg.status == Status::Failed {
        PLACEHOLDER_TRANSCRIPTION_FAILED.to_owned()
    } else {
        "[UNTRANSCRIBED VOICE NOTE]".to_owned()
    };
    // Single line: collapse whitespace, bound length, escape quotes.
    let mut text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.chars().count() > max_chars {
        text = text.chars().take(max_chars).collect::<String>() + "\u{2026}";
    }
    let text = text.replace('"', "\\\"");
    let sender = msg.sender.replace('|', " ");

    format!(
        "{ts} | idx={} | sender={sender} | status={status_part} | provider={provider} | text=\"{text}\"",
        msg.idx
    )
}

/// Write `preview_transcripts.txt`: one line per voice message in idx order.
/// Returns the number of voice messages written.
pub fn write_transcript_preview(
    messages: &[Message],
    out_path: &Path,
    max_chars: usize,
) -> CsResult<u64> {
    let mut voice: Vec<&Message> = messages.iter().filter(|m| m.kind == Kind::Voice).collect();
    voice.sort_by_key(|m| m.idx);

    let mut out = String::new();
    for msg in &voice {
        out.push_str(&format_preview_line(msg, max_chars));
        out.push('\n');
    }
    write_atomic(out_path, out.as_bytes())?;
    Ok(voice.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AsrPayload, Kind, Message, StatusReason};

    fn msg(idx: u64, kind: Kind, sender: &str, text: &str) -> Message {
        let mut m = Message::new(
            idx,
            "2025-07-08T10:03:00".to_owned(),
            sender.to_owned(),
            kind,
        );
        m.content_text = text.to_owned();
        m
    }

    #[test]
    fn renders_text_messages_with_human_timestamps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("chat_with_audio.txt");
        let messages = vec![msg(0, Kind::Text, "Alice", "good morning")];
        let summary =
            render_messages_to_txt(&messages, &out, &TextRenderOptions::default()).expect("render");

        let content = std::fs::read_to_string(&out).expect("read");
        assert_eq!(content, "2025-07-08 10:03:00 - Alice: good morning\n");
        assert_eq!(summary.total, 1);
        assert_eq!(summary.text, 1);
    }

    #[test]
    fn multiline_bodies_indent_continuations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("chat.txt");
        let messages = vec![msg(0, Kind::Text, "Bob", "line one\nline two")];
        render_messages_to_txt(&messages, &out, &TextRenderOptions::default()).expect("render");

        let content = std::fs::read_to_string(&out).expect("read");
        assert!(content.contains("Bob: line one\n    line two\n"), "got: {content}");
    }

    #[test]
    fn failed_voice_gets_placeholder_body() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("chat.txt");
        let mut voice = msg(0, Kind::Voice, "Alice", "");
        voice.mark_failed(StatusReason::AsrFailed);
        render_messages_to_txt(&[voice], &out, &TextRenderOptions::default()).expect("render");

        let content = std::fs::read_to_string(&out).expect("read");
        assert!(
            content.contains("[AUDIO TRANSCRIPTION FAILED]"),
            "got: {content}"
        );
    }

    #[test]
    fn merged_caption_donors_are_omitted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("chat.txt");
        let mut media = msg(0, Kind::Image, "Bob", "");
        media.caption = Some("sunset".to_owned());
        let mut donor = msg(1, Kind::Text, "Bob", "sunset");
        donor.mark_skipped(StatusReason::MergedIntoPreviousMedia);

        let summary = render_messages_to_txt(
            &[media, donor],
            &out,
            &TextRenderOptions::default(),
        )
        .expect("render");
        let content = std::fs::read_to_string(&out).expect("read");
        assert_eq!(summary.total, 1, "donor hidden");
        assert!(content.contains("Bob: sunset"), "caption shown: {content}");
    }

    #[test]
    fn hide_system_drops_system_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("chat.txt");
        let system = msg(0, Kind::System, "Bob", "you were added");
        let options = TextRenderOptions {
            hide_system: true,
            ..Default::default()
        };
        let summary = render_messages_to_txt(&[system], &out, &options).expect("render");
        assert_eq!(summary.total, 0);
        assert_eq!(std::fs::read_to_string(&out).expect("read"), "");
    }

    #[test]
    fn show_status_appends_suffix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("chat.txt");
        let mut voice = msg(0, Kind::Voice, "Alice", "hello");
        voice.mark_partial(StatusReason::AsrPartial);
        let options = TextRenderOptions {
            show_status: true,
            ..Default::default()
        };
        render_messages_to_txt(&[voice], &out, &options).expect("render");
        let content = std::fs::read_to_string(&out).expect("read");
        assert!(
            content.contains("[status=partial, reason=asr_partial]"),
            "got: {content}"
        );
    }

    #[test]
    fn arabic_text_gets_bidi_marks_when_enabled() {
        let wrapped = wrap_rtl_segments("مرحبا", RtlMode::BidiMarks);
        assert!(wrapped.starts_with('\u{202B}'));
        assert!(wrapped.ends_with('\u{202C}'));

        let untouched = wrap_rtl_segments("hello", RtlMode::BidiMarks);
        assert_eq!(untouched, "hello");

        let disabled = wrap_rtl_segments("مرحبا", RtlMode::None);
        assert_eq!(disabled, "مرحبا");
    }

    #[test]
    fn messages_render_sorted_by_idx() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("chat.txt");
        let messages = vec![
            msg(1, Kind::Text, "Bob", "second"),
            msg(0, Kind::Text, "Alice", "first"),
        ];
        render_messages_to_txt(&messages, &out, &TextRenderOptions::default()).expect("render");
        let content = std::fs::read_to_string(&out).expect("read");
        let first_pos = content.find("first").expect("first present");
        let second_pos = content.find("second").expect("second present");
        assert!(first_pos < second_pos, "idx order: {content}");
    }

    #[test]
    fn preview_line_collapses_whitespace_and_bounds_length() {
        let mut voice = msg(3, Kind::Voice, "Alice|Pipe", "line one\nline  two");
        voice.derived.asr = Some(AsrPayload {
            provider: Some("whisper_openai".to_owned()),
            ..AsrPayload::default()
        });
        let line = format_preview_line(&voice, 120);
        assert!(line.contains("idx=3"));
        assert!(line.contains("sender=Alice Pipe"), "pipe stripped: {line}");
        assert!(line.contains("text=\"line one line two\""), "got: {line}");
        assert!(line.contains("provider=whisper_openai"));

        let long = msg(0, Kind::Voice, "A", &"word ".repeat(100));
        let line = format_preview_line(&long, 20);
        assert!(line.contains('\u{2026}'), "ellipsis on truncation: {line}");
    }

    #[test]
    fn preview_writes_only_voice_messages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("preview_transcripts.txt");
        let messages = vec![
            msg(0, Kind::Text, "Alice", "hi"),
            msg(1, Kind::Voice, "Bob", "transcribed"),
            msg(2, Kind::Voice, "Alice", "also transcribed"),
        ];
        let count = write_transcript_preview(&messages, &out, 120).expect("write");
        assert_eq!(count, 2);
        let content = std::fs::read_to_string(&out).expect("read");
        assert_eq!(content.lines().count(), 2);
        assert!(!content.contains("sender=Alice | "), "text rows absent");
    }
}
