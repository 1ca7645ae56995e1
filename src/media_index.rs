//! Archive media index.
//!
//! Scans the archive tree once and groups artifacts by `(chat_day, kind)` so
//! the resolver only ever ranks a bounded candidate set. The index is
//! read-only after construction and safe to share across workers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::patterns::{parse_filename, tokenize_stem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Voice,
    Image,
    Video,
    Document,
    Other,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Image => "image",
            Self::Video => "video",
            Self::Document => "document",
            Self::Other => "other",
        }
    }
}

/// Extension buckets for media classification.
#[must_use]
pub fn classify_extension(ext: &str) -> MediaKind {
    match ext.to_lowercase().as_str() {
        "opus" | "ogg" | "m4a" | "amr" | "aac" => MediaKind::Voice,
        "jpg" | "jpeg" | "png" | "gif" | "heic" => MediaKind::Image,
        "mp4" | "mov" | "avi" | "mkv" => MediaKind::Video,
        "pdf" | "doc" | "docx" | "xls" | "xlsx" | "ppt" | "pptx" => MediaKind::Document,
        _ => MediaKind::Other,
    }
}

/// Metadata about one archive artifact used for resolution scoring.
///
/// The content hash is intentionally absent here; it is computed lazily by
/// the resolver only for artifacts it actually selects.
#[derive(Debug, Clone)]
pub struct ArtifactInfo {
    pub path: PathBuf,
    pub size: u64,
    /// Modification time, epoch seconds.
    pub mtime: f64,
    pub kind: MediaKind,
    pub name_tokens: Vec<String>,
    pub seq_num: Option<u64>,
}

/// Calendar date (`YYYY-MM-DD`) of an epoch-seconds timestamp in the local
/// frame. The same frame is applied to message timestamps so both sides of
/// the chat-day comparison agree.
#[must_use]
pub fn chat_day_of_epoch(epoch_secs: f64) -> String {
    let secs = epoch_secs.floor() as i64;
    match Local.timestamp_opt(secs, 0) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            dt.format("%Y-%m-%d").to_string()
        }
        chrono::LocalResult::None => "1970-01-01".to_owned(),
    }
}

#[derive(Debug, Default)]
pub struct MediaIndex {
    buckets: BTreeMap<(String, MediaKind), Vec<ArtifactInfo>>,
    total: usize,
}

impl MediaIndex {
    /// Scan the archive tree. Unreadable entries are skipped rather than
    /// failing the scan; extension-less files are ignored.
    #[must_use]
    pub fn scan(root: &Path) -> Self {
        let mut buckets: BTreeMap<(String, MediaKind), Vec<ArtifactInfo>> = BTreeMap::new();
        let mut total = 0usize;

        for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let mtime = meta
                .modified()
                .ok()
                .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);

            let kind = classify_extension(ext);
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            let parsed = parse_filename(stem);

            let info = ArtifactInfo {
                path: path.to_path_buf(),
                size: meta.len(),
                mtime,
                kind,
                name_tokens: tokenize_stem(stem),
                seq_num: parsed.seq_num,
            };

            let day = chat_day_of_epoch(mtime);
            buckets.entry((day, kind)).or_default().push(info);
            total += 1;
        }

        for bucket in buckets.values_mut() {
            bucket.sort_by(|a, b| a.path.cmp(&b.path));
        }

        tracing::debug!(artifacts = total, "media index built");
        Self { buckets, total }
    }

    #[must_use]
    pub fn total_artifacts(&self) -> usize {
        self.total
    }

    /// All artifacts of one kind, across every chat day, in deterministic
    /// (day, path) order.
    pub fn artifacts_of_kind(&self, kind: MediaKind) -> impl Iterator<Item = &ArtifactInfo> {
        self.buckets
            .iter()
            .filter(move |((_, k), _)| *k == kind)
            .flat_map(|(_, infos)| infos.iter())
    }

    /// Artifacts for a specific `(chat_day, kind)` bucket.
    #[must_use]
    pub fn bucket(&self, day: &str, kind: MediaKind) -> &[ArtifactInfo] {
        self.buckets
            .get(&(day.to_owned(), kind))
            .map_or(&[], Vec::as_slice)
    }

    /// Locate an artifact by exact basename anywhere under the root.
    /// Deterministic: the lexically-smallest path wins when duplicated.
    #[must_use]
    pub fn find_by_basename(&self, basename: &str) -> Option<&ArtifactInfo> {
        let needle = basename.to_lowercase();
        self.buckets
            .values()
            .flat_map(|infos| infos.iter())
            .filter(|info| {
                info.path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.to_lowercase() == needle)
            })
            .min_by(|a, b| a.path.cmp(&b.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path, contents: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    #[test]
    fn classify_extension_buckets() {
        assert_eq!(classify_extension("opus"), MediaKind::Voice);
        assert_eq!(classify_extension("OPUS"), MediaKind::Voice);
        assert_eq!(classify_extension("jpg"), MediaKind::Image);
        assert_eq!(classify_extension("mp4"), MediaKind::Video);
        assert_eq!(classify_extension("pdf"), MediaKind::Document);
        assert_eq!(classify_extension("zip"), MediaKind::Other);
    }

    #[test]
    fn scan_groups_by_day_and_kind() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("media/PTT-20250708-WA0001.opus"), b"v1");
        touch(&dir.path().join("media/IMG-20250708-WA0002.jpg"), b"img");
        touch(&dir.path().join("notes.txt"), b"not media but indexed as other");

        let index = MediaIndex::scan(dir.path());
        assert_eq!(index.total_artifacts(), 3);

        let voices: Vec<_> = index.artifacts_of_kind(MediaKind::Voice).collect();
        assert_eq!(voices.len(), 1);
        assert_eq!(voices[0].seq_num, Some(1));

        let images: Vec<_> = index.artifacts_of_kind(MediaKind::Image).collect();
        assert_eq!(images.len(), 1);
        assert!(images[0].name_tokens.contains(&"wa0002".to_owned()));
    }

    #[test]
    fn scan_skips_extensionless_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("README"), b"no extension");
        let index = MediaIndex::scan(dir.path());
        assert_eq!(index.total_artifacts(), 0);
    }

    #[test]
    fn find_by_basename_is_case_insensitive_and_deterministic() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("b/PTT-20250708-WA0001.opus"), b"later");
        touch(&dir.path().join("a/PTT-20250708-WA0001.opus"), b"first");

        let index = MediaIndex::scan(dir.path());
        let hit = index
            .find_by_basename("ptt-20250708-wa0001.OPUS")
            .expect("should find artifact");
        assert!(
            hit.path.to_string_lossy().contains("/a/"),
            "lexically smallest path wins: {}",
            hit.path.display()
        );
    }

    #[test]
    fn empty_bucket_returns_empty_slice() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = MediaIndex::scan(dir.path());
        assert!(index.bucket("2025-07-08", MediaKind::Voice).is_empty());
    }

    #[test]
    fn chat_day_formatting() {
        // 2025-07-08 12:00:00 UTC; exact local day depends on the host zone,
        // but the format must always be YYYY-MM-DD.
        let day = chat_day_of_epoch(1_751_976_000.0);
        assert_eq!(day.len(), 10);
        assert_eq!(&day[4..5], "-");
        assert_eq!(&day[7..8], "-");
    }
}
