use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::CsResult;

const READ_CHUNK: usize = 8 * 1024 * 1024;

/// Streamed SHA-256 of a file's contents, hex-encoded.
pub fn sha256_file(path: &Path) -> CsResult<String> {
    sha256_file_with_extra(path, None)
}

/// Streamed SHA-256 of a file's contents with optional extra bytes folded in
/// after the file body. The extra string is how cache keys bind configuration
/// knobs to the content digest.
pub fn sha256_file_with_extra(path: &Path, extra: Option<&str>) -> CsResult<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    if let Some(extra) = extra {
        hasher.update(extra.as_bytes());
    }
    Ok(hex_digest(&hasher.finalize()))
}

/// SHA-256 of an in-memory string, hex-encoded.
#[must_use]
pub fn sha256_str(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex_digest(&hasher.finalize())
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}
