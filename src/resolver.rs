//! Media resolution (stage M2).
//!
//! Binds media-expecting messages to concrete archive artifacts. An exact
//! canonical filename in the media hint short-circuits everything; otherwise
//! candidates from the message's chat day and a configurable drift window
//! are ranked by the scoring ladder and accepted only under a decisive
//! margin. Ambiguity and no-candidate outcomes are recorded, never guessed.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::NaiveDateTime;

use crate::error::{CsError, CsResult};
use crate::exceptions::{ExceptionRow, write_exceptions};
use crate::hashing::sha256_file;
use crate::media_index::{ArtifactInfo, MediaIndex, MediaKind, chat_day_of_epoch};
use crate::model::{Disambiguation, DisambiguationCandidate, Kind, Message, Status, StatusReason};
use crate::patterns::{is_canonical_filename, parse_seq_num};
use crate::scoring::{score_ext, score_hint, score_mtime, score_seq};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct LadderWeights {
    pub hint: f64,
    pub ext: f64,
    pub seq: f64,
    pub mtime: f64,
}

impl Default for LadderWeights {
    fn default() -> Self {
        Self {
            hint: 3.0,
            ext: 2.0,
            seq: 1.0,
            mtime: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub weights: LadderWeights,
    /// Decisive margin: minimum gap between top and runner-up totals.
    pub tau: f64,
    /// Bump added to the seq feature on an exact sequence match.
    pub tie_margin: f64,
    pub clock_drift_hours: f64,
    /// How many neighbors on each side contribute hint tokens.
    pub hint_window: usize,
    pub ext_priority: Vec<MediaKind>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            weights: LadderWeights::default(),
            tau: 0.75,
            tie_margin: 0.02,
            clock_drift_hours: 4.0,
            hint_window: 2,
            ext_priority: vec![
                MediaKind::Voice,
                MediaKind::Image,
                MediaKind::Video,
                MediaKind::Document,
                MediaKind::Other,
            ],
        }
    }
}

impl ResolverConfig {
    pub fn validate(&self) -> CsResult<()> {
        if self.tau <= 0.0 {
            return Err(CsError::InvalidConfig(format!(
                "resolver tau must be positive, got {}",
                self.tau
            )));
        }
        if self.clock_drift_hours < 0.0 {
            return Err(CsError::InvalidConfig(
                "clock_drift_hours must not be negative".to_owned(),
            ));
        }
        for (label, w) in [
            ("hint", self.weights.hint),
            ("ext", self.weights.ext),
            ("seq", self.weights.seq),
            ("mtime", self.weights.mtime),
        ] {
            if w < 0.0 {
                return Err(CsError::InvalidConfig(format!(
                    "ladder weight `{label}` must not be negative, got {w}"
                )));
            }
        }
        if self.ext_priority.is_empty() {
            return Err(CsError::InvalidConfig(
                "ext_priority must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RankedCandidate {
    path: std::path::PathBuf,
    size: u64,
    total: f64,
    seq_num: Option<u64>,
}

pub struct MediaResolver {
    cfg: ResolverConfig,
    index: MediaIndex,
}

impl MediaResolver {
    pub fn new(root: &Path, cfg: ResolverConfig) -> CsResult<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            index: MediaIndex::scan(root),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_index(index: MediaIndex, cfg: ResolverConfig) -> Self {
        Self { cfg, index }
    }

    /// Resolve media bindings for every media-expecting message in place and
    /// rewrite the exceptions file. Never aborts the run for per-message
    /// failures.
    pub fn resolve(&self, msgs: &mut [Message], exceptions_path: &Path) -> CsResult<()> {
        let mut exceptions: Vec<ExceptionRow> = Vec::new();

        for i in 0..msgs.len() {
            if !msgs[i].kind.is_media() || msgs[i].status == Status::Skipped {
                continue;
            }

            if self.try_fastpath(&mut msgs[i]) {
                continue;
            }

            let hints = self.extract_hints(msgs, i);
            let target_seq = extract_seq_target(&msgs[i], &hints);
            let kind = media_kind_for(msgs[i].kind);
            let candidates = self.collect_candidates(&msgs[i], kind);

            if candidates.is_empty() {
                msgs[i].status_reason = Some(StatusReason::UnresolvedMedia);
                exceptions.push(exception_row(&msgs[i], "unresolved_media", &[]));
                continue;
            }

            let ranked = self.rank(&msgs[i], &candidates, &hints, target_seq, kind);

            let top = &ranked[0];
            let second = ranked.get(1);

            if let Some(second) = second
                && (top.total - second.total) < self.cfg.tau
            {
                let msg = &mut msgs[i];
                msg.status_reason = Some(StatusReason::AmbiguousMedia);
                msg.media_filename = None;
                msg.derived.disambiguation = Some(Disambiguation {
                    candidates: ranked
                        .iter()
                        .take(2)
                        .map(|c| DisambiguationCandidate {
                            path: c.path.display().to_string(),
                            score: c.total,
                            sha256: None,
                            seq_num: c.seq_num,
                        })
                        .collect(),
                    top_score: top.total,
                    tie_margin: top.total - second.total,
                });
                exceptions.push(exception_row(msg, "ambiguous_media", &ranked));
                continue;
            }

            let msg = &mut msgs[i];
            msg.media_filename = Some(top.path.display().to_string());
            msg.status_reason = None;
            // Content hash is lazy: only the chosen artifact pays for it.
            msg.derived.media_sha256 = sha256_file(&top.path).ok();
        }

        write_exceptions(&exceptions, exceptions_path)?;
        Ok(())
    }

    /// Exact-filename fast path. Returns true when the hint named a real
    /// file; this path never produces exception rows.
    fn try_fastpath(&self, msg: &mut Message) -> bool {
        let Some(hint) = msg.media_hint.as_deref() else {
            return false;
        };
        if !is_canonical_filename(hint) {
            return false;
        }
        let Some(artifact) = self.index.find_by_basename(hint.trim()) else {
            return false;
        };
        msg.media_filename = Some(artifact.path.display().to_string());
        msg.status_reason = None;
        msg.derived.media_sha256 = sha256_file(&artifact.path).ok();
        true
    }

    /// Candidate set: the message's chat-day bucket for its kind, extended
    /// by same-kind artifacts within the drift window of the message time.
    fn collect_candidates<'a>(&'a self, msg: &Message, kind: MediaKind) -> Vec<&'a ArtifactInfo> {
        let Some(ts_epoch) = message_epoch(&msg.ts) else {
            return Vec::new();
        };
        let drift = self.cfg.clock_drift_hours * 3600.0;
        let day = chat_day_of_epoch(ts_epoch);

        let mut seen: BTreeSet<&Path> = BTreeSet::new();
        let mut out: Vec<&ArtifactInfo> = Vec::new();

        for info in self.index.bucket(&day, kind) {
            if seen.insert(info.path.as_path()) {
                out.push(info);
            }
        }
        for info in self.index.artifacts_of_kind(kind) {
            if (info.mtime - ts_epoch).abs() <= drift && seen.insert(info.path.as_path()) {
                out.push(info);
            }
        }

        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    fn rank(
        &self,
        msg: &Message,
        candidates: &[&ArtifactInfo],
        hints: &BTreeSet<String>,
        target_seq: Option<u64>,
        kind: MediaKind,
    ) -> Vec<RankedCandidate> {
        let ts_epoch = message_epoch(&msg.ts).unwrap_or(0.0);
        let w = self.cfg.weights;

        let mut ranked: Vec<RankedCandidate> = candidates
            .iter()
            .map(|info| {
                let hint_score = score_hint(hints, &info.name_tokens);
                let ext_score = score_ext(kind, &self.cfg.ext_priority);
                let mut seq_score = score_seq(target_seq, info.seq_num);
                if target_seq.is_some() && info.seq_num == target_seq {
                    seq_score += self.cfg.tie_margin;
                }
                let mtime_score = score_mtime(info.mtime - ts_epoch);

                let total = w.hint * hint_score
                    + w.ext * ext_score
                    + w.seq * seq_score
                    + w.mtime * mtime_score;

                RankedCandidate {
                    path: info.path.clone(),
                    size: info.size,
                    total,
                    seq_num: info.seq_num,
                }
            })
            .collect();

        // Descending by total; ties break by size ascending, then path.
        ranked.sort_by(|a, b| {
            b.total
                .partial_cmp(&a.total)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.size.cmp(&b.size))
                .then_with(|| a.path.cmp(&b.path))
        });
        ranked
    }

    /// Tokens from the message itself and its ±window neighbors. Same-sender
    /// tokens take precedence; the global set is the fallback.
    fn extract_hints(&self, msgs: &[Message], i: usize) -> BTreeSet<String> {
        let window = self.cfg.hint_window;
        let target_sender = &msgs[i].sender;

        let mut same_sender: BTreeSet<String> = BTreeSet::new();
        let mut global: BTreeSet<String> = BTreeSet::new();

        for text in [
            msgs[i].content_text.as_str(),
            msgs[i].caption.as_deref().unwrap_or(""),
        ] {
            if !text.is_empty() {
                same_sender.extend(tokenize_hint_text(text));
            }
        }

        let start = i.saturating_sub(window);
        let end = (i + window + 1).min(msgs.len());
        for (j, msg) in msgs.iter().enumerate().take(end).skip(start) {
            if j == i {
                continue;
            }
            for text in [
                msg.content_text.as_str(),
                msg.caption.as_deref().unwrap_or(""),
            ] {
                if text.is_empty() {
                    continue;
                }
                let tokens = tokenize_hint_text(text);
                if msg.sender == *target_sender {
                    same_sender.extend(tokens.iter().cloned());
                }
                global.extend(tokens);
            }
        }

        if same_sender.is_empty() { global } else { same_sender }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn media_kind_for(kind: Kind) -> MediaKind {
    match kind {
        Kind::Voice => MediaKind::Voice,
        Kind::Image => MediaKind::Image,
        Kind::Video => MediaKind::Video,
        Kind::Document => MediaKind::Document,
        _ => MediaKind::Other,
    }
}

fn message_epoch(ts: &str) -> Option<f64> {
    let parsed = NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S").ok()?;
    let local = parsed.and_local_timezone(chrono::Local).earliest()?;
    Some(local.timestamp() as f64)
}

fn tokenize_hint_text(text: &str) -> BTreeSet<String> {
    use std::sync::LazyLock;
    static WA_NAME: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"(?:img|vid|ptt|aud|doc)-\d{8}-wa\d+").expect("wa name regex")
    });
    static WA_SEQ: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"wa[-_]?\d+").expect("wa seq regex"));
    static JOINED: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"[a-z0-9]+(?:[-_][a-z0-9]+)+").expect("joined token regex")
    });

    let lower = text.to_lowercase();
    let mut tokens = BTreeSet::new();
    for re in [&*WA_NAME, &*WA_SEQ, &*JOINED] {
        for m in re.find_iter(&lower) {
            tokens.insert(m.as_str().to_owned());
        }
    }
    tokens
}

fn extract_seq_target(msg: &Message, hints: &BTreeSet<String>) -> Option<u64> {
    if let Some(hint) = msg.media_hint.as_deref()
        && let Some(seq) = parse_seq_num(hint)
    {
        return Some(seq);
    }
    hints.iter().find_map(|token| parse_seq_num(token))
}

fn exception_row(msg: &Message, reason: &str, ranked: &[RankedCandidate]) -> ExceptionRow {
    let fmt_score = |c: &RankedCandidate| format!("{:.4}", c.total);
    ExceptionRow {
        idx: msg.idx,
        ts: msg.ts.clone(),
        sender: msg.sender.clone(),
        kind: msg.kind.as_str().to_owned(),
        media_hint: msg.media_hint.clone().unwrap_or_default(),
        reason: reason.to_owned(),
        top1_path: ranked
            .first()
            .map(|c| c.path.display().to_string())
            .unwrap_or_default(),
        top1_score: ranked.first().map(fmt_score).unwrap_or_default(),
        top2_path: ranked
            .get(1)
            .map(|c| c.path.display().to_string())
            .unwrap_or_default(),
        top2_score: ranked.get(1).map(fmt_score).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_index::MediaIndex;
    use crate::model::{Kind, Message, Status, StatusReason};
    use std::fs;
    use std::path::PathBuf;

    fn touch(path: &PathBuf, contents: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    fn voice_msg(idx: u64, hint: Option<&str>) -> Message {
        let mut msg = Message::new(
            idx,
            "2025-07-08T10:00:00".to_owned(),
            "Alice".to_owned(),
            Kind::Voice,
        );
        msg.media_hint = hint.map(str::to_owned);
        msg
    }

    #[test]
    fn fastpath_binds_exact_filename() {
        let dir = tempfile::tempdir().expect("tempdir");
        let media = dir.path().join("media/PTT-20250708-WA0028.opus");
        touch(&media, b"opus-bytes");

        let resolver =
            MediaResolver::new(dir.path(), ResolverConfig::default()).expect("resolver");
        let mut msgs = vec![voice_msg(0, Some("PTT-20250708-WA0028.opus"))];
        let exceptions = dir.path().join("exceptions.csv");
        resolver.resolve(&mut msgs, &exceptions).expect("resolve");

        assert_eq!(
            msgs[0].media_filename.as_deref(),
            Some(media.display().to_string().as_str())
        );
        assert!(msgs[0].status_reason.is_none());
        assert!(
            msgs[0].derived.media_sha256.is_some(),
            "hash recorded on selection"
        );

        let csv = fs::read_to_string(&exceptions).expect("csv");
        assert_eq!(csv.lines().count(), 1, "no exception rows: {csv}");
    }

    #[test]
    fn no_candidates_marks_unresolved_with_exception_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolver =
            MediaResolver::new(dir.path(), ResolverConfig::default()).expect("resolver");
        let mut msgs = vec![voice_msg(0, Some("media_omitted"))];
        let exceptions = dir.path().join("exceptions.csv");
        resolver.resolve(&mut msgs, &exceptions).expect("resolve");

        assert!(msgs[0].media_filename.is_none());
        assert_eq!(msgs[0].status, Status::Ok, "resolution outcomes keep ok");
        assert_eq!(msgs[0].status_reason, Some(StatusReason::UnresolvedMedia));

        let csv = fs::read_to_string(&exceptions).expect("csv");
        assert!(csv.contains("unresolved_media"), "row written: {csv}");
    }

    #[test]
    fn close_scores_mark_ambiguous_and_record_disambiguation() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Two images with identical tokens apart from seq; no hints anywhere,
        // so totals differ only via mtime, far below tau.
        touch(&dir.path().join("a/IMG-20250708-WA0001.jpg"), b"one");
        touch(&dir.path().join("a/IMG-20250708-WA0002.jpg"), b"two");

        let resolver =
            MediaResolver::new(dir.path(), ResolverConfig::default()).expect("resolver");
        let mut msg = Message::new(
            0,
            "2025-07-08T10:00:00".to_owned(),
            "Alice".to_owned(),
            Kind::Image,
        );
        // Force the candidates into the drift window regardless of scan mtime.
        msg.ts = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        let mut msgs = vec![msg];
        let exceptions = dir.path().join("exceptions.csv");
        resolver.resolve(&mut msgs, &exceptions).expect("resolve");

        assert_eq!(msgs[0].status_reason, Some(StatusReason::AmbiguousMedia));
        assert!(msgs[0].media_filename.is_none(), "no guessing under tau");
        let blob = msgs[0]
            .derived
            .disambiguation
            .as_ref()
            .expect("disambiguation recorded");
        assert_eq!(blob.candidates.len(), 2);
        assert!(blob.tie_margin < 0.75, "margin below tau: {}", blob.tie_margin);

        let csv = fs::read_to_string(&exceptions).expect("csv");
        assert!(csv.contains("ambiguous_media"));
        assert!(csv.contains("IMG-20250708-WA0001.jpg"));
        assert!(csv.contains("IMG-20250708-WA0002.jpg"));
    }

    #[test]
    fn matching_hint_token_separates_candidates() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("a/IMG-20250708-WA0001.jpg"), b"one");
        touch(&dir.path().join("a/IMG-20250708-WA0002.jpg"), b"two");

        let resolver =
            MediaResolver::new(dir.path(), ResolverConfig::default()).expect("resolver");

        let ts = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();

        let mut media = Message::new(1, ts.clone(), "Alice".to_owned(), Kind::Image);
        media.media_hint = Some("image_omitted".to_owned());
        let mut neighbor = Message::new(2, ts, "Alice".to_owned(), Kind::Text);
        neighbor.content_text = "that was IMG-20250708-WA0002 from yesterday".to_owned();

        let mut msgs = vec![media, neighbor];
        let exceptions = dir.path().join("exceptions.csv");
        resolver.resolve(&mut msgs, &exceptions).expect("resolve");

        // hint weight (3.0) plus the exact-seq bump puts WA0002 decisively on top
        assert_eq!(msgs[0].status_reason, None, "decisive selection");
        let bound = msgs[0].media_filename.as_deref().expect("bound");
        assert!(bound.contains("WA0002"), "hint token wins: {bound}");
    }

    #[test]
    fn skipped_and_text_messages_are_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolver =
            MediaResolver::new(dir.path(), ResolverConfig::default()).expect("resolver");

        let mut text = Message::new(
            0,
            "2025-07-08T10:00:00".to_owned(),
            "Alice".to_owned(),
            Kind::Text,
        );
        text.content_text = "hello".to_owned();
        let mut donor = voice_msg(1, None);
        donor.mark_skipped(StatusReason::MergedIntoPreviousMedia);

        let mut msgs = vec![text, donor];
        let exceptions = dir.path().join("exceptions.csv");
        resolver.resolve(&mut msgs, &exceptions).expect("resolve");

        assert!(msgs[0].status_reason.is_none());
        assert_eq!(
            msgs[1].status_reason,
            Some(StatusReason::MergedIntoPreviousMedia),
            "skipped donor retains its reason"
        );
    }

    #[test]
    fn resolve_is_a_fixed_point_on_its_own_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("media/PTT-20250708-WA0028.opus"), b"opus");

        let resolver =
            MediaResolver::new(dir.path(), ResolverConfig::default()).expect("resolver");
        let mut msgs = vec![voice_msg(0, Some("PTT-20250708-WA0028.opus"))];
        let exceptions = dir.path().join("exceptions.csv");
        resolver.resolve(&mut msgs, &exceptions).expect("first");
        let snapshot = serde_json::to_string(&msgs).expect("serialize");

        resolver.resolve(&mut msgs, &exceptions).expect("second");
        let again = serde_json::to_string(&msgs).expect("serialize");
        assert_eq!(snapshot, again, "second pass changes nothing");
    }

    #[test]
    fn rank_ties_break_by_size_then_path() {
        let cfg = ResolverConfig::default();
        let resolver = MediaResolver::with_index(MediaIndex::default(), cfg);

        let mk = |path: &str, size: u64| ArtifactInfo {
            path: PathBuf::from(path),
            size,
            mtime: 0.0,
            kind: MediaKind::Image,
            name_tokens: vec![],
            seq_num: None,
        };
        let a = mk("/z/large.jpg", 100);
        let b = mk("/a/small.jpg", 10);
        let c = mk("/b/small.jpg", 10);

        let msg = Message::new(
            0,
            "1970-01-01T00:00:00".to_owned(),
            "x".to_owned(),
            Kind::Image,
        );
        let ranked = resolver.rank(
            &msg,
            &[&a, &b, &c],
            &std::collections::BTreeSet::new(),
            None,
            MediaKind::Image,
        );

        // All mtime deltas are equal (mtime 0 vs epoch ts 0), so totals tie.
        assert_eq!(ranked[0].path, PathBuf::from("/a/small.jpg"));
        assert_eq!(ranked[1].path, PathBuf::from("/b/small.jpg"));
        assert_eq!(ranked[2].path, PathBuf::from("/z/large.jpg"));
    }

    #[test]
    fn invalid_config_rejected() {
        let mut cfg = ResolverConfig::default();
        cfg.tau = 0.0;
        assert!(cfg.validate().is_err(), "zero tau rejected");

        let mut cfg = ResolverConfig::default();
        cfg.weights.hint = -1.0;
        assert!(cfg.validate().is_err(), "negative weight rejected");

        let mut cfg = ResolverConfig::default();
        cfg.ext_priority.clear();
        assert!(cfg.validate().is_err(), "empty priority rejected");
    }
}
