//! ASR cost estimation.
//!
//! Rates live in a data table keyed by `(provider, model, billing_plan)`;
//! rounding discipline is part of the row (`increment_seconds`), not a code
//! path. No network calls, fully reproducible.

/// One rate-table row: USD per minute and the billing increment in seconds.
/// An increment of zero or less bills raw seconds.
#[derive(Debug, Clone, Copy)]
pub struct Rate {
    pub rate_per_minute: f64,
    pub increment_seconds: f64,
}

const DEFAULT_RATE: Rate = Rate {
    rate_per_minute: 0.006,
    increment_seconds: 60.0,
};

const COST_TABLE: &[((&str, &str, &str), Rate)] = &[
    (
        ("whisper_openai", "whisper-1", "per_minute"),
        Rate {
            rate_per_minute: 0.006,
            increment_seconds: 60.0,
        },
    ),
    (
        ("whisper_openai", "whisper-large-v3", "per_minute"),
        Rate {
            rate_per_minute: 0.012,
            increment_seconds: 60.0,
        },
    ),
    (
        ("google_stt", "chirp-3", "per_minute"),
        Rate {
            rate_per_minute: 0.016,
            increment_seconds: 30.0,
        },
    ),
    (
        ("whisper_local", "base", "local"),
        Rate {
            rate_per_minute: 0.0,
            increment_seconds: 0.0,
        },
    ),
];

fn lookup_rate(provider: &str, model: &str, billing: &str) -> Rate {
    COST_TABLE
        .iter()
        .find(|((p, m, b), _)| *p == provider && *m == model && *b == billing)
        .map(|(_, rate)| *rate)
        .unwrap_or(DEFAULT_RATE)
}

/// Estimated cost in USD for `seconds` of audio, rounded to 4 decimals.
#[must_use]
pub fn estimate_asr_cost(seconds: f64, provider: &str, model: &str, billing: &str) -> f64 {
    let duration = seconds.max(0.0);
    let rate = lookup_rate(provider, model, billing);
    let billed = if rate.increment_seconds <= 0.0 {
        duration
    } else {
        (duration / rate.increment_seconds).ceil() * rate.increment_seconds
    };
    let cost = rate.rate_per_minute * billed / 60.0;
    round4(cost)
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_row_bills_by_minute_ceiling() {
        // 61 seconds at 0.006/min with 60 s increments bills 2 minutes.
        let cost = estimate_asr_cost(61.0, "whisper_openai", "whisper-1", "per_minute");
        assert_eq!(cost, 0.012);

        let exact = estimate_asr_cost(60.0, "whisper_openai", "whisper-1", "per_minute");
        assert_eq!(exact, 0.006);
    }

    #[test]
    fn thirty_second_increment_rows_round_tighter() {
        // 31 s with 30 s increments bills 60 s.
        let cost = estimate_asr_cost(31.0, "google_stt", "chirp-3", "per_minute");
        assert_eq!(cost, 0.016);
    }

    #[test]
    fn local_provider_is_free() {
        assert_eq!(estimate_asr_cost(600.0, "whisper_local", "base", "local"), 0.0);
    }

    #[test]
    fn unknown_tuple_falls_back_to_default_rate() {
        let cost = estimate_asr_cost(60.0, "unknown", "model-x", "per_minute");
        assert_eq!(cost, 0.006);
    }

    #[test]
    fn fallback_rate_ceils_to_the_minute() {
        // 90 s at the default 60 s increment bills 2 minutes.
        let cost = estimate_asr_cost(90.0, "nope", "nope", "nope");
        assert_eq!(cost, 0.012);
    }

    #[test]
    fn negative_duration_clamps_to_zero() {
        assert_eq!(
            estimate_asr_cost(-5.0, "whisper_openai", "whisper-1", "per_minute"),
            0.0
        );
    }

    #[test]
    fn results_are_rounded_to_four_decimals() {
        let cost = estimate_asr_cost(60.0, "whisper_openai", "whisper-large-v3", "per_minute");
        assert_eq!(cost, 0.012);
        // A value that would otherwise carry float noise still has <= 4 dp.
        let noisy = estimate_asr_cost(200.0, "whisper_openai", "whisper-1", "per_minute");
        assert_eq!((noisy * 10_000.0).round() / 10_000.0, noisy);
    }
}
