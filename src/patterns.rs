//! Archive filename grammar.
//!
//! Exported archives name media `IMG/VID/PTT/AUD/DOC-YYYYMMDD-WA####.ext`,
//! sometimes with a ` (1)` or `-copy` suffix appended by the exporting
//! device. This module parses those names into the tokens the resolver
//! scores on.

use std::sync::LazyLock;

use regex::Regex;

use crate::media_index::MediaKind;

static COPY_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)( \(\d+\)|-copy)$").expect("copy suffix regex"));

static WA_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?P<prefix>IMG|VID|PTT|AUD|DOC)-(?P<date>\d{8})-WA(?P<seq>\d+)")
        .expect("archive filename regex")
});

/// Canonical filename including extension, e.g. `PTT-20250708-WA0028.opus`.
/// Used by the resolver fast path to decide whether a media hint names an
/// exact file.
static WA_FULL_FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(IMG|VID|PTT|AUD|DOC)-\d{8}-WA\d+\.[A-Za-z0-9]+$")
        .expect("full filename regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFilename {
    pub prefix: Option<String>,
    pub date_token: Option<String>,
    pub seq_num: Option<u64>,
    pub kind: Option<MediaKind>,
    pub stem: String,
    pub had_copy_suffix: bool,
}

/// Strip copy suffixes and surrounding whitespace from a stem.
#[must_use]
pub fn normalize_stem(stem: &str) -> (String, bool) {
    let trimmed = stem.trim();
    let cleaned = COPY_SUFFIX_RE.replace(trimmed, "");
    let had_suffix = cleaned.len() != trimmed.len();
    (cleaned.into_owned(), had_suffix)
}

/// Parse an archive-style filename (with or without extension) into tokens.
#[must_use]
pub fn parse_filename(name: &str) -> ParsedFilename {
    let stem = name.split('.').next().unwrap_or(name);
    let (cleaned, had_copy_suffix) = normalize_stem(stem);

    let Some(caps) = WA_PATTERN.captures(&cleaned) else {
        return ParsedFilename {
            prefix: None,
            date_token: None,
            seq_num: None,
            kind: None,
            stem: cleaned.to_lowercase(),
            had_copy_suffix,
        };
    };

    let prefix = caps["prefix"].to_uppercase();
    let kind = match prefix.as_str() {
        "IMG" => MediaKind::Image,
        "VID" => MediaKind::Video,
        "PTT" | "AUD" => MediaKind::Voice,
        "DOC" => MediaKind::Document,
        _ => MediaKind::Other,
    };

    ParsedFilename {
        date_token: Some(caps["date"].to_owned()),
        seq_num: caps["seq"].parse::<u64>().ok(),
        kind: Some(kind),
        prefix: Some(prefix),
        stem: cleaned.to_lowercase(),
        had_copy_suffix,
    }
}

/// Extract the WA sequence number from an arbitrary token, if present.
#[must_use]
pub fn parse_seq_num(name: &str) -> Option<u64> {
    parse_filename(name).seq_num
}

/// Whether a media hint is an exact canonical archive filename (prefix,
/// date token, sequence, and extension all present).
#[must_use]
pub fn is_canonical_filename(hint: &str) -> bool {
    WA_FULL_FILENAME.is_match(hint.trim())
}

/// Split a stem into lowercase word tokens for hint matching.
#[must_use]
pub fn tokenize_stem(stem: &str) -> Vec<String> {
    let (cleaned, _) = normalize_stem(stem);
    cleaned
        .to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_index::MediaKind;

    #[test]
    fn parses_voice_note_filename() {
        let parsed = parse_filename("PTT-20250708-WA0028.opus");
        assert_eq!(parsed.prefix.as_deref(), Some("PTT"));
        assert_eq!(parsed.date_token.as_deref(), Some("20250708"));
        assert_eq!(parsed.seq_num, Some(28));
        assert_eq!(parsed.kind, Some(MediaKind::Voice));
        assert!(!parsed.had_copy_suffix);
    }

    #[test]
    fn aud_prefix_also_maps_to_voice() {
        let parsed = parse_filename("AUD-20250708-WA0001.m4a");
        assert_eq!(parsed.kind, Some(MediaKind::Voice));
    }

    #[test]
    fn image_and_video_and_document_prefixes() {
        assert_eq!(
            parse_filename("IMG-20250708-WA0002.jpg").kind,
            Some(MediaKind::Image)
        );
        assert_eq!(
            parse_filename("VID-20250708-WA0003.mp4").kind,
            Some(MediaKind::Video)
        );
        assert_eq!(
            parse_filename("DOC-20250708-WA0004.pdf").kind,
            Some(MediaKind::Document)
        );
    }

    #[test]
    fn copy_suffix_is_stripped() {
        let parsed = parse_filename("IMG-20250708-WA0002 (1).jpg");
        assert_eq!(parsed.seq_num, Some(2));
        assert!(parsed.had_copy_suffix);

        let parsed = parse_filename("IMG-20250708-WA0002-copy.jpg");
        assert_eq!(parsed.seq_num, Some(2));
        assert!(parsed.had_copy_suffix);
    }

    #[test]
    fn lowercase_input_is_accepted() {
        let parsed = parse_filename("ptt-20250708-wa0028.opus");
        assert_eq!(parsed.prefix.as_deref(), Some("PTT"));
        assert_eq!(parsed.seq_num, Some(28));
    }

    #[test]
    fn non_archive_names_fall_through() {
        let parsed = parse_filename("holiday photo.jpeg");
        assert!(parsed.prefix.is_none());
        assert!(parsed.seq_num.is_none());
        assert_eq!(parsed.stem, "holiday photo");
    }

    #[test]
    fn canonical_filename_requires_extension() {
        assert!(is_canonical_filename("PTT-20250708-WA0028.opus"));
        assert!(is_canonical_filename("img-20250708-wa0002.JPG"));
        assert!(!is_canonical_filename("PTT-20250708-WA0028"));
        assert!(!is_canonical_filename("<Media omitted>"));
        assert!(!is_canonical_filename("Voice message (0:36)"));
    }

    #[test]
    fn tokenize_splits_on_separators() {
        let tokens = tokenize_stem("IMG-20250708-WA0002");
        assert_eq!(tokens, vec!["img", "20250708", "wa0002"]);
    }

    #[test]
    fn seq_num_from_arbitrary_token() {
        assert_eq!(parse_seq_num("PTT-20250708-WA0028"), Some(28));
        assert_eq!(parse_seq_num("not-a-wa-name"), None);
    }
}
