//! Exceptions CSV writer for unresolved/ambiguous media outcomes.
//!
//! The file is rewritten once per run (no incremental appends) so readers
//! never see rows from a previous invocation.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::CsResult;

pub const EXCEPTIONS_HEADER: [&str; 10] = [
    "idx",
    "ts",
    "sender",
    "kind",
    "media_hint",
    "reason",
    "top1_path",
    "top1_score",
    "top2_path",
    "top2_score",
];

#[derive(Debug, Clone, Default)]
pub struct ExceptionRow {
    pub idx: u64,
    pub ts: String,
    pub sender: String,
    pub kind: String,
    pub media_hint: String,
    pub reason: String,
    pub top1_path: String,
    pub top1_score: String,
    pub top2_path: String,
    pub top2_score: String,
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_owned()
    }
}

/// Write `exceptions.csv`, replacing any previous content. An empty row set
/// still produces a header-only file so resumed runs can distinguish
/// "no exceptions" from "stage never ran".
pub fn write_exceptions(rows: &[ExceptionRow], path: &Path) -> CsResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut out = Vec::new();
    writeln!(out, "{}", EXCEPTIONS_HEADER.join(","))?;
    for row in rows {
        let fields = [
            row.idx.to_string(),
            row.ts.clone(),
            row.sender.clone(),
            row.kind.clone(),
            row.media_hint.clone(),
            row.reason.clone(),
            row.top1_path.clone(),
            row.top1_score.clone(),
            row.top2_path.clone(),
            row.top2_score.clone(),
        ];
        let line: Vec<String> = fields.iter().map(|f| csv_escape(f)).collect();
        writeln!(out, "{}", line.join(","))?;
    }

    fs::write(path, out)?;
    Ok(())
}
