//! Chat export parsing (stage M1).
//!
//! Header lines look like `7/8/25, 10:03 AM - Sender: body`; continuation
//! lines belong to the previous block. The timestamp layout varies by
//! device locale (12h/24h, month-first/day-first, optional seconds), so the
//! format is auto-detected over the first lines with early-line weighting
//! before any record is built.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;

use crate::error::{CsError, CsResult};
use crate::model::{Kind, Message, StatusReason};

// ---------------------------------------------------------------------------
// Timestamp format detection
// ---------------------------------------------------------------------------

struct FormatCandidate {
    name: &'static str,
    regex: &'static LazyLock<Regex>,
    patterns: &'static [&'static str],
}

static RE_12H: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,2}/\d{1,2}/\d{2,4}, \d{1,2}:\d{2} [AP]M)").expect("12h"));
static RE_12H_SECONDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,2}/\d{1,2}/\d{2,4}, \d{1,2}:\d{2}:\d{2} [AP]M)").expect("12h seconds")
});
static RE_24H: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,2}/\d{1,2}/\d{2,4}, \d{1,2}:\d{2})(?: |$)").expect("24h")
});
static RE_24H_SECONDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,2}/\d{1,2}/\d{2,4}, \d{2}:\d{2}:\d{2})(?: |$)").expect("24h seconds")
});

const FORMAT_CANDIDATES: &[FormatCandidate] = &[
    FormatCandidate {
        name: "12h_mdy",
        regex: &RE_12H,
        patterns: &["%m/%d/%y, %I:%M %p", "%m/%d/%Y, %I:%M %p"],
    },
    FormatCandidate {
        name: "12h_mdy_seconds",
        regex: &RE_12H_SECONDS,
        patterns: &["%m/%d/%y, %I:%M:%S %p", "%m/%d/%Y, %I:%M:%S %p"],
    },
    FormatCandidate {
        name: "12h_dmy",
        regex: &RE_12H,
        patterns: &["%d/%m/%y, %I:%M %p", "%d/%m/%Y, %I:%M %p"],
    },
    FormatCandidate {
        name: "12h_dmy_seconds",
        regex: &RE_12H_SECONDS,
        patterns: &["%d/%m/%y, %I:%M:%S %p", "%d/%m/%Y, %I:%M:%S %p"],
    },
    FormatCandidate {
        name: "24h_mdy",
        regex: &RE_24H,
        patterns: &["%m/%d/%y, %H:%M", "%m/%d/%Y, %H:%M"],
    },
    FormatCandidate {
        name: "24h_mdy_seconds",
        regex: &RE_24H_SECONDS,
        patterns: &["%m/%d/%y, %H:%M:%S", "%m/%d/%Y, %H:%M:%S"],
    },
    FormatCandidate {
        name: "24h_dmy",
        regex: &RE_24H,
        patterns: &["%d/%m/%y, %H:%M", "%d/%m/%Y, %H:%M"],
    },
    FormatCandidate {
        name: "24h_dmy_seconds",
        regex: &RE_24H_SECONDS,
        patterns: &["%d/%m/%y, %H:%M:%S", "%d/%m/%Y, %H:%M:%S"],
    },
];

#[derive(Debug, Clone)]
pub struct DetectedFormat {
    pub name: &'static str,
    regex: &'static LazyLock<Regex>,
    pub pattern: &'static str,
}

/// Normalize exporter-specific unicode whitespace (narrow no-break space,
/// non-breaking space) and strip RTL marks.
#[must_use]
pub fn normalize_timestamp_text(text: &str) -> String {
    text.replace('\u{202f}', " ")
        .replace('\u{a0}', " ")
        .replace('\u{200f}', "")
}

fn parses_with(fragment: &str, pattern: &str) -> bool {
    NaiveDateTime::parse_from_str(fragment.trim(), pattern).is_ok()
}

/// Detect the timestamp layout from sample lines. Scores each candidate
/// over the first 200 non-empty lines, weighting the first 50 double, and
/// picks the winning strptime pattern by hit count.
pub fn detect_datetime_format(lines: &[String]) -> CsResult<DetectedFormat> {
    let sample: Vec<String> = lines
        .iter()
        .map(|l| normalize_timestamp_text(l.trim()))
        .filter(|l| !l.is_empty())
        .take(200)
        .collect();

    if sample.is_empty() {
        return Err(CsError::InvalidChatFile(
            "no non-empty lines for format detection".to_owned(),
        ));
    }

    let mut best: Option<(&FormatCandidate, f64, &'static str)> = None;

    for candidate in FORMAT_CANDIDATES {
        let mut score = 0.0f64;
        let mut pattern_hits = vec![0.0f64; candidate.patterns.len()];

        for (idx, line) in sample.iter().enumerate() {
            let Some(caps) = candidate.regex.captures(line) else {
                continue;
            };
            let fragment = caps.get(1).map_or("", |m| m.as_str());
            let Some(pos) = candidate
                .patterns
                .iter()
                .position(|p| parses_with(fragment, p))
            else {
                continue;
            };
            let weight = if idx < 50 { 2.0 } else { 1.0 };
            score += weight;
            pattern_hits[pos] += weight;
        }

        if score <= 0.0 {
            continue;
        }
        let winning_pattern = pattern_hits
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(pos, _)| candidate.patterns[pos])
            .unwrap_or(candidate.patterns[0]);

        // Strictly-greater keeps the first candidate on ties, which favors
        // month-first layouts the way the detection has always behaved.
        if best.as_ref().is_none_or(|(_, s, _)| score > *s) {
            best = Some((candidate, score, winning_pattern));
        }
    }

    match best {
        Some((candidate, _, pattern)) => Ok(DetectedFormat {
            name: candidate.name,
            regex: candidate.regex,
            pattern,
        }),
        None => Err(CsError::InvalidChatFile(
            "no timestamp format detected in chat export".to_owned(),
        )),
    }
}

/// Parse one timestamp fragment into canonical `YYYY-MM-DDTHH:MM:SS`.
pub fn parse_ts(fragment: &str, format: &DetectedFormat) -> CsResult<String> {
    let normalized = normalize_timestamp_text(fragment.trim());
    let parsed = NaiveDateTime::parse_from_str(&normalized, format.pattern).map_err(|e| {
        CsError::InvalidChatFile(format!(
            "failed to parse timestamp `{fragment}` with `{}`: {e}",
            format.pattern
        ))
    })?;
    Ok(parsed.format("%Y-%m-%dT%H:%M:%S").to_string())
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Block {
    ts: Option<String>,
    sender: Option<String>,
    raw_line: String,
    raw_block: String,
    content_text: String,
}

pub struct ChatParser {
    chat_path: PathBuf,
}

impl ChatParser {
    /// `root` may be the archive directory (containing `_chat.txt`) or a
    /// direct path to the transcript; `chat_file` overrides both.
    #[must_use]
    pub fn new(root: &Path, chat_file: Option<&Path>) -> Self {
        let chat_path = match chat_file {
            Some(path) => path.to_path_buf(),
            None if root.is_file() => root.to_path_buf(),
            None => root.join("_chat.txt"),
        };
        Self { chat_path }
    }

    /// Parse the export into densely-indexed messages with captions merged.
    pub fn parse(&self) -> CsResult<Vec<Message>> {
        if !self.chat_path.exists() {
            return Err(CsError::MissingInput(self.chat_path.clone()));
        }
        let content = std::fs::read_to_string(&self.chat_path)?;
        let lines: Vec<String> = content.lines().map(str::to_owned).collect();
        let format = detect_datetime_format(&lines)?;
        tracing::debug!(format = format.name, "chat timestamp format detected");

        let blocks = to_blocks(&lines, &format);
        let mut messages: Vec<Message> = Vec::new();

        for block in blocks {
            let (Some(ts_raw), Some(sender)) = (block.ts.as_ref(), block.sender.as_ref()) else {
                // Preamble or malformed block with no header: drop it.
                continue;
            };
            let ts_iso = parse_ts(ts_raw, &format)?;
            let (kind, media_hint, content_text) = classify(&block.content_text);

            let mut msg = Message::new(messages.len() as u64, ts_iso, sender.clone(), kind);
            msg.content_text = content_text;
            msg.raw_line = block.raw_line;
            msg.raw_block = block.raw_block;
            msg.media_hint = media_hint;
            messages.push(msg);
        }

        merge_captions(&mut messages);
        Ok(messages)
    }
}

fn to_blocks(lines: &[String], format: &DetectedFormat) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();

    for line in lines {
        let clean = line.trim_end_matches('\n');
        let (ts, sender, body) = split_header_owned(clean, format);

        if let Some(ts) = ts {
            blocks.push(Block {
                ts: Some(ts),
                sender,
                raw_line: clean.to_owned(),
                raw_block: clean.to_owned(),
                content_text: body.unwrap_or_default(),
            });
        } else if let Some(current) = blocks.last_mut() {
            current.raw_block.push('\n');
            current.raw_block.push_str(clean);
            current.content_text.push('\n');
            current.content_text.push_str(clean);
        } else {
            blocks.push(Block {
                ts: None,
                sender: None,
                raw_line: clean.to_owned(),
                raw_block: clean.to_owned(),
                content_text: clean.to_owned(),
            });
        }
    }

    blocks
}

fn split_header_owned(
    line: &str,
    format: &DetectedFormat,
) -> (Option<String>, Option<String>, Option<String>) {
    let stripped = line.trim_start_matches('\u{feff}');
    let normalized = normalize_timestamp_text(stripped);

    let Some(caps) = format.regex.captures(&normalized) else {
        return (None, None, None);
    };
    let whole = caps.get(1).expect("group 1");
    if whole.start() != 0 {
        return (None, None, None);
    }

    let remainder = &normalized[whole.end()..];
    let Some(remainder) = remainder.strip_prefix(" - ") else {
        return (None, None, None);
    };

    let ts = whole.as_str().trim().to_owned();
    match remainder.split_once(": ") {
        Some((sender, body)) => (
            Some(ts),
            Some(sender.trim().to_owned()).filter(|s| !s.is_empty()),
            Some(body.trim().to_owned()),
        ),
        None => (Some(ts), None, None),
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

static FILE_ATTACHED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?P<fname>(IMG|VID|PTT|AUD|DOC)-\d{8}-WA\d+\.[A-Za-z0-9]+) \(file attached\)$")
        .expect("file attached regex")
});

static VOICE_DURATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^voice message \((\d+):(\d{2})\)$").expect("voice regex"));

const SYSTEM_PATTERNS: &[&str] = &[
    "messages and calls are end-to-end encrypted",
    "you created group",
    "you were added",
    "added",
    "removed",
    "changed this group's icon",
    "changed the subject from",
];

fn classify(body_raw: &str) -> (Kind, Option<String>, String) {
    let body = body_raw.trim();

    if let Some(caps) = FILE_ATTACHED.captures(body) {
        let fname = caps["fname"].to_owned();
        let kind = match fname[..3].to_uppercase().as_str() {
            "PTT" | "AUD" => Kind::Voice,
            "IMG" => Kind::Image,
            "VID" => Kind::Video,
            _ => Kind::Document,
        };
        return (kind, Some(fname), String::new());
    }

    let lower = body.to_lowercase();
    match lower.as_str() {
        "<image omitted>" => return (Kind::Image, Some("image_omitted".to_owned()), String::new()),
        "<video omitted>" => return (Kind::Video, Some("video_omitted".to_owned()), String::new()),
        "<document omitted>" => {
            return (
                Kind::Document,
                Some("document_omitted".to_owned()),
                String::new(),
            );
        }
        "<media omitted>" => {
            return (
                Kind::Unknown,
                Some("media_omitted".to_owned()),
                String::new(),
            );
        }
        "audio omitted" => return (Kind::Voice, Some("audio_omitted".to_owned()), String::new()),
        _ => {}
    }

    if SYSTEM_PATTERNS.iter().any(|p| lower.contains(p)) {
        return (Kind::System, None, body_raw.to_owned());
    }

    if let Some(caps) = VOICE_DURATION.captures(body) {
        let minutes: u32 = caps[1].parse().unwrap_or(0);
        let hint = format!("{minutes:02}:{}", &caps[2]);
        return (Kind::Voice, Some(hint), String::new());
    }

    (Kind::Text, None, body_raw.to_owned())
}

/// Fold a text message that immediately follows a media message from the
/// same sender at the same timestamp into that media message's caption. The
/// donor stays in place as `skipped/merged_into_previous_media` so indices
/// remain dense.
fn merge_captions(messages: &mut [Message]) {
    for i in 0..messages.len().saturating_sub(1) {
        if !messages[i].kind.is_media() {
            continue;
        }
        if messages[i + 1].kind != Kind::Text {
            continue;
        }
        if messages[i].sender != messages[i + 1].sender || messages[i].ts != messages[i + 1].ts {
            continue;
        }
        let caption = messages[i + 1].content_text.clone();
        messages[i].caption = Some(caption);
        messages[i + 1].mark_skipped(StatusReason::MergedIntoPreviousMedia);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Kind, Status, StatusReason};
    use std::fs;

    fn write_chat(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("_chat.txt");
        fs::write(&path, contents).expect("write chat");
        path
    }

    const SAMPLE_24H: &str = "\
7/8/25, 10:03 - Alice: good morning
7/8/25, 10:04 - Bob: PTT-20250708-WA0028.opus (file attached)
7/8/25, 10:05 - Alice: <Media omitted>
7/8/25, 10:06 - Bob: multi line starts here
and continues here
7/8/25, 10:07 - Alice: Voice message (0:36)
";

    #[test]
    fn detects_24h_format() {
        let lines: Vec<String> = SAMPLE_24H.lines().map(str::to_owned).collect();
        let format = detect_datetime_format(&lines).expect("detect");
        assert!(format.name.starts_with("24h"), "got: {}", format.name);
    }

    #[test]
    fn detects_12h_format_with_unicode_spaces() {
        let lines = vec![
            "7/8/25, 10:03\u{202f}AM - Alice: hi".to_owned(),
            "7/8/25, 10:05\u{202f}PM - Bob: yo".to_owned(),
        ];
        let format = detect_datetime_format(&lines).expect("detect");
        assert!(format.name.starts_with("12h"), "got: {}", format.name);
        let ts = parse_ts("7/8/25, 10:05 PM", &format).expect("parse");
        assert_eq!(ts, "2025-07-08T22:05:00");
    }

    #[test]
    fn no_timestamps_is_invalid_chat_file() {
        let lines = vec!["hello".to_owned(), "world".to_owned()];
        let err = detect_datetime_format(&lines).unwrap_err();
        assert!(matches!(err, CsError::InvalidChatFile(_)), "got: {err:?}");
    }

    #[test]
    fn parse_builds_dense_indexed_messages() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_chat(dir.path(), SAMPLE_24H);
        let parser = ChatParser::new(dir.path(), None);
        let messages = parser.parse().expect("parse");

        assert_eq!(messages.len(), 5);
        for (i, msg) in messages.iter().enumerate() {
            assert_eq!(msg.idx, i as u64, "dense indices");
        }
        assert_eq!(messages[0].kind, Kind::Text);
        assert_eq!(messages[0].content_text, "good morning");
        assert_eq!(messages[0].ts, "2025-07-08T10:03:00");
    }

    #[test]
    fn file_attached_lines_classify_with_exact_hint() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_chat(dir.path(), SAMPLE_24H);
        let messages = ChatParser::new(dir.path(), None).parse().expect("parse");

        let voice = &messages[1];
        assert_eq!(voice.kind, Kind::Voice);
        assert_eq!(voice.media_hint.as_deref(), Some("PTT-20250708-WA0028.opus"));
        assert!(voice.content_text.is_empty());
    }

    #[test]
    fn media_omitted_maps_to_unknown_kind() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_chat(dir.path(), SAMPLE_24H);
        let messages = ChatParser::new(dir.path(), None).parse().expect("parse");
        assert_eq!(messages[2].kind, Kind::Unknown);
        assert_eq!(messages[2].media_hint.as_deref(), Some("media_omitted"));
    }

    #[test]
    fn continuation_lines_accumulate_into_block() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_chat(dir.path(), SAMPLE_24H);
        let messages = ChatParser::new(dir.path(), None).parse().expect("parse");
        let multi = &messages[3];
        assert_eq!(multi.content_text, "multi line starts here\nand continues here");
        assert!(multi.raw_block.contains('\n'));
        assert_eq!(multi.raw_line, "7/8/25, 10:06 - Bob: multi line starts here");
    }

    #[test]
    fn voice_duration_hint_is_normalized() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_chat(dir.path(), SAMPLE_24H);
        let messages = ChatParser::new(dir.path(), None).parse().expect("parse");
        let voice = &messages[4];
        assert_eq!(voice.kind, Kind::Voice);
        assert_eq!(voice.media_hint.as_deref(), Some("00:36"));
    }

    #[test]
    fn caption_merges_into_preceding_media() {
        let chat = "\
7/8/25, 10:04 - Bob: IMG-20250708-WA0002.jpg (file attached)
7/8/25, 10:04 - Bob: look at this sunset
7/8/25, 10:09 - Alice: wow
";
        let dir = tempfile::tempdir().expect("tempdir");
        write_chat(dir.path(), chat);
        let messages = ChatParser::new(dir.path(), None).parse().expect("parse");

        assert_eq!(messages[0].caption.as_deref(), Some("look at this sunset"));
        assert_eq!(messages[1].status, Status::Skipped);
        assert_eq!(
            messages[1].status_reason,
            Some(StatusReason::MergedIntoPreviousMedia)
        );
        // Different ts: not merged.
        assert_eq!(messages[2].status, Status::Ok);
        assert_eq!(messages.len(), 3, "donor stays for dense idx");
    }

    #[test]
    fn system_notices_classify_as_system() {
        let chat = "\
7/8/25, 10:00 - Messages and calls are end-to-end encrypted. No one outside of this chat can read them.
7/8/25, 10:03 - Alice: hi
";
        let dir = tempfile::tempdir().expect("tempdir");
        write_chat(dir.path(), chat);
        let messages = ChatParser::new(dir.path(), None).parse().expect("parse");
        // The encryption notice has no `SENDER: ` split, so it is dropped as
        // headerless; the real message survives.
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender, "Alice");
    }

    #[test]
    fn system_pattern_with_sender_is_system_kind() {
        let chat = "\
7/8/25, 10:03 - Alice: hello there
7/8/25, 10:04 - Bob: you were added to the group
";
        let dir = tempfile::tempdir().expect("tempdir");
        write_chat(dir.path(), chat);
        let messages = ChatParser::new(dir.path(), None).parse().expect("parse");
        assert_eq!(messages[1].kind, Kind::System);
    }

    #[test]
    fn missing_chat_file_is_missing_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = ChatParser::new(dir.path(), None).parse().unwrap_err();
        assert!(matches!(err, CsError::MissingInput(_)), "got: {err:?}");
    }

    #[test]
    fn explicit_chat_file_override_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let alt = dir.path().join("export.txt");
        fs::write(&alt, "7/8/25, 10:03 - Alice: from override\n").expect("write");
        let messages = ChatParser::new(dir.path(), Some(&alt)).parse().expect("parse");
        assert_eq!(messages[0].content_text, "from override");
    }
}
