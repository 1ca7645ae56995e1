//! Stage JSONL files: atomic writes, loading, and the stage-output
//! validator that enforces the record invariants.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{CsError, CsResult};
use crate::model::{Message, Status};

/// Write bytes to `path` crash-safely: write a unique sibling temp file,
/// then rename. Readers observe either the previous complete file or the
/// new one; concurrent writers to the same path each use their own temp.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> CsResult<()> {
    static SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let seq = SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let tmp = path.with_extension(format!(
        "{}tmp.{}.{seq}",
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| format!("{e}."))
            .unwrap_or_default(),
        std::process::id(),
    ));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Serialize messages to JSONL, one record per line, `\n` terminators,
/// written atomically.
pub fn write_messages_jsonl(messages: &[Message], path: &Path) -> CsResult<()> {
    let mut out = Vec::new();
    for msg in messages {
        serde_json::to_writer(&mut out, msg)?;
        out.push(b'\n');
    }
    write_atomic(path, &out)
}

/// Load a stage JSONL file. Blank lines are ignored; any malformed line is
/// an error (stage outputs are immutable contracts, not best-effort logs).
pub fn load_messages(path: &Path) -> CsResult<Vec<Message>> {
    if !path.exists() {
        return Err(CsError::MissingInput(path.to_path_buf()));
    }
    let content = fs::read_to_string(path)?;
    let mut msgs = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let msg: Message = serde_json::from_str(line).map_err(|e| {
            CsError::StageViolation(format!(
                "{}:{}: malformed message record: {e}",
                path.display(),
                lineno + 1
            ))
        })?;
        msgs.push(msg);
    }
    Ok(msgs)
}

/// Enforce the stage-output invariants:
/// - sorting by `idx` yields the dense sequence `0..N`
/// - `partial` is true exactly when `status == partial`
///
/// Enum validity is enforced structurally at deserialization time.
pub fn validate_stage(messages: &[Message]) -> CsResult<()> {
    let mut indices: Vec<u64> = messages.iter().map(|m| m.idx).collect();
    indices.sort_unstable();
    for (expected, found) in indices.iter().enumerate() {
        if *found != expected as u64 {
            return Err(CsError::StageViolation(format!(
                "idx sequence not dense: expected {expected}, found {found}"
            )));
        }
    }

    for msg in messages {
        let should_be_partial = msg.status == Status::Partial;
        if msg.partial != should_be_partial {
            return Err(CsError::StageViolation(format!(
                "idx {}: partial flag {} disagrees with status {}",
                msg.idx,
                msg.partial,
                msg.status.as_str()
            )));
        }
    }
    Ok(())
}

/// Convenience: validate then write.
pub fn write_validated(messages: &[Message], path: &Path) -> CsResult<()> {
    validate_stage(messages)?;
    write_messages_jsonl(messages, path)
}
