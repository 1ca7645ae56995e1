//! Audio chunking: fixed windows with overlap over a normalized WAV.
//!
//! Windows of `chunk_seconds` advance by `chunk_seconds - overlap`, starting
//! at offset 0, last window truncated to end-of-file. Chunk artifacts land
//! at `<chunk_dir>/chunk_{i:04}.wav` and the manifest rounds all float
//! fields to 3 decimals so equality is stable across runs.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Chunking failure over degenerate or unreadable audio. Maps to a FAILED
/// message state in the transcriber; an empty chunk list is never returned.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("invalid audio duration: {0} seconds")]
    InvalidDuration(f64),

    #[error("wav file not found: {0}")]
    MissingFile(PathBuf),

    #[error("failed to read wav: {0}")]
    BadWav(String),

    #[error("i/o error while chunking: {0}")]
    Io(String),

    #[error("no chunks produced for {0} seconds of audio")]
    Empty(f64),
}

/// One entry of the chunk manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpec {
    pub chunk_index: usize,
    pub start_sec: f64,
    pub end_sec: f64,
    pub duration_sec: f64,
    pub wav_chunk_path: PathBuf,
}

/// Split `wav_path` into overlapping windows, writing one WAV per window.
///
/// The overlap is clamped to half the window at use; rejecting overlap >=
/// window happens earlier, at config validation.
pub fn chunk_wav(
    wav_path: &Path,
    total_seconds: f64,
    chunk_seconds: f64,
    overlap_seconds: f64,
    chunk_dir: &Path,
) -> Result<Vec<ChunkSpec>, ChunkError> {
    if total_seconds <= 0.0 {
        return Err(ChunkError::InvalidDuration(total_seconds));
    }
    if !wav_path.exists() {
        return Err(ChunkError::MissingFile(wav_path.to_path_buf()));
    }

    let mut reader =
        hound::WavReader::open(wav_path).map_err(|e| ChunkError::BadWav(e.to_string()))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Err(ChunkError::BadWav("framerate is 0".to_owned()));
    }
    if spec.bits_per_sample == 0 {
        return Err(ChunkError::BadWav("sample width is 0".to_owned()));
    }

    let samples: Vec<i16> = reader
        .samples::<i16>()
        .collect::<Result<_, _>>()
        .map_err(|e| ChunkError::BadWav(e.to_string()))?;

    std::fs::create_dir_all(chunk_dir).map_err(|e| ChunkError::Io(e.to_string()))?;

    let frames_per_second = f64::from(spec.sample_rate) * f64::from(spec.channels.max(1));
    let overlap = overlap_seconds.min(chunk_seconds / 2.0);

    let mut chunks: Vec<ChunkSpec> = Vec::new();
    let mut start = 0.0f64;
    let mut prev_start = -1.0f64;

    while start < total_seconds {
        let end = (start + chunk_seconds).min(total_seconds);
        if end <= start {
            break;
        }

        let sample_start = ((start * frames_per_second) as usize).min(samples.len());
        let sample_end = ((end * frames_per_second) as usize).min(samples.len());

        let chunk_index = chunks.len();
        let chunk_path = chunk_dir.join(format!("chunk_{chunk_index:04}.wav"));
        write_chunk(&chunk_path, spec, &samples[sample_start..sample_end])?;

        chunks.push(ChunkSpec {
            chunk_index,
            start_sec: round3(start),
            end_sec: round3(end),
            duration_sec: round3(end - start),
            wav_chunk_path: chunk_path,
        });

        if end >= total_seconds {
            break;
        }
        let next_start = end - overlap;
        if next_start <= start {
            break;
        }
        start = next_start;
        // Guard against float stagnation on pathological window/overlap pairs.
        if (start - prev_start).abs() < 1e-6 {
            break;
        }
        prev_start = start;
    }

    if chunks.is_empty() {
        return Err(ChunkError::Empty(total_seconds));
    }

    Ok(chunks)
}

fn write_chunk(path: &Path, spec: hound::WavSpec, samples: &[i16]) -> Result<(), ChunkError> {
    let mut writer =
        hound::WavWriter::create(path, spec).map_err(|e| ChunkError::Io(e.to_string()))?;
    for &sample in samples {
        writer
            .write_sample(sample)
            .map_err(|e| ChunkError::Io(e.to_string()))?;
    }
    writer.finalize().map_err(|e| ChunkError::Io(e.to_string()))
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
