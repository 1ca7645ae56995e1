//! Voice-activity statistics over normalized PCM.
//!
//! Frame-level RMS energy against a dB threshold, merged into contiguous
//! segments. The output is strictly observational: it is recorded under
//! `derived.asr.vad` and must never gate transcription or influence status.

use std::path::Path;

use crate::model::VadReport;

/// Analysis frame length.
const FRAME_MS: u32 = 30;
/// Frames quieter than this are silence.
const SPEECH_THRESHOLD_DB: f64 = -42.0;

#[derive(Debug, Clone, Copy)]
pub struct VadThresholds {
    pub min_speech_ratio: f64,
    pub min_speech_seconds: f64,
}

impl Default for VadThresholds {
    fn default() -> Self {
        Self {
            min_speech_ratio: 0.05,
            min_speech_seconds: 0.1,
        }
    }
}

fn rms(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f64).sqrt()
}

fn amplitude_to_db(amplitude: f64) -> f64 {
    if amplitude <= 0.0 {
        return f64::NEG_INFINITY;
    }
    20.0 * amplitude.log10()
}

/// Compute speech stats for a normalized WAV. Unreadable audio yields an
/// all-zero report rather than an error; VAD never fails the pipeline.
#[must_use]
pub fn run_vad(wav_path: &Path, thresholds: VadThresholds) -> VadReport {
    let Ok(mut reader) = hound::WavReader::open(wav_path) else {
        return silent_report(0.0, thresholds);
    };
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return silent_report(0.0, thresholds);
    }

    let samples: Vec<f64> = reader
        .samples::<i16>()
        .filter_map(Result::ok)
        .map(|s| f64::from(s) / f64::from(i16::MAX))
        .collect();

    let channels = spec.channels.max(1) as usize;
    let frame_len = (spec.sample_rate as usize * FRAME_MS as usize / 1000).max(1) * channels;
    let frame_seconds = f64::from(FRAME_MS) / 1000.0;
    let total_seconds = samples.len() as f64 / (f64::from(spec.sample_rate) * channels as f64);

    let mut segments: Vec<(f64, f64)> = Vec::new();
    let mut speech_frames = 0usize;
    let mut total_frames = 0usize;
    let mut open_start: Option<f64> = None;

    for (i, frame) in samples.chunks(frame_len).enumerate() {
        total_frames += 1;
        let frame_start = i as f64 * frame_seconds;
        let db = amplitude_to_db(rms(frame));
        if db >= SPEECH_THRESHOLD_DB {
            speech_frames += 1;
            if open_start.is_none() {
                open_start = Some(frame_start);
            }
        } else if let Some(start) = open_start.take() {
            segments.push((round3(start), round3(frame_start)));
        }
    }
    if let Some(start) = open_start {
        segments.push((round3(start), round3(total_seconds)));
    }

    let speech_seconds = speech_frames as f64 * frame_seconds;
    let speech_ratio = if total_frames == 0 {
        0.0
    } else {
        speech_frames as f64 / total_frames as f64
    };

    VadReport {
        speech_ratio: round3(speech_ratio),
        speech_seconds: round3(speech_seconds.min(total_seconds)),
        total_seconds: round3(total_seconds),
        segments,
        is_mostly_silence: speech_ratio < thresholds.min_speech_ratio
            || speech_seconds < thresholds.min_speech_seconds,
    }
}

fn silent_report(total_seconds: f64, _thresholds: VadThresholds) -> VadReport {
    VadReport {
        speech_ratio: 0.0,
        speech_seconds: 0.0,
        total_seconds,
        segments: Vec::new(),
        is_mostly_silence: true,
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
