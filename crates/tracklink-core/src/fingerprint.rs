//! Device-fingerprint similarity scoring.
//!
//! A pure, table-driven heuristic: every signal present and equal on both
//! sides adds its weight from [`SIGNAL_WEIGHTS`]. There are no cross terms,
//! so the same inputs always produce the same score.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum score for a session to be considered a candidate match at all.
pub const MIN_CANDIDATE_SCORE: i64 = 25;

/// IP + timezone only count when the two sightings are at most this far apart.
pub const IP_TIMEZONE_RECENCY_SECS: i64 = 2 * 60 * 60;

/// Signal → weight table. Weights are additive and independent.
pub const SIGNAL_WEIGHTS: [(Signal, i64); 7] = [
    (Signal::Canvas, 30),
    (Signal::DeviceSignature, 35),
    (Signal::Webgl, 25),
    (Signal::Audio, 20),
    (Signal::Fonts, 15),
    (Signal::Screen, 10),
    (Signal::IpTimezone, 20),
];

/// Score threshold → probability, checked top-down.
const PROBABILITY_BANDS: [(i64, f64); 4] = [(80, 0.95), (60, 0.85), (40, 0.70), (25, 0.50)];
const PROBABILITY_FLOOR: f64 = 0.30;

/// The sparse bag of browser signals captured with a session.
///
/// Empty strings are treated the same as absent values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintSet {
    pub canvas_hash: Option<String>,
    pub webgl_hash: Option<String>,
    pub audio_hash: Option<String>,
    pub fonts_hash: Option<String>,
    pub screen_hash: Option<String>,
    pub device_signature: Option<String>,
    pub ip: Option<String>,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Canvas,
    DeviceSignature,
    Webgl,
    Audio,
    Fonts,
    Screen,
    IpTimezone,
}

impl Signal {
    pub fn weight(self) -> i64 {
        SIGNAL_WEIGHTS
            .iter()
            .find(|(signal, _)| *signal == self)
            .map(|(_, weight)| *weight)
            .unwrap_or(0)
    }
}

/// One side of a comparison: the fingerprint plus when it was observed.
#[derive(Debug, Clone, Copy)]
pub struct FingerprintSample<'a> {
    pub fingerprint: &'a FingerprintSet,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchScore {
    pub score: i64,
    pub probability: f64,
    pub matched_signals: BTreeSet<Signal>,
}

impl MatchScore {
    pub fn is_candidate(&self) -> bool {
        self.score >= MIN_CANDIDATE_SCORE
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn hash_signal(fingerprint: &FingerprintSet, signal: Signal) -> Option<&str> {
    match signal {
        Signal::Canvas => non_empty(&fingerprint.canvas_hash),
        Signal::DeviceSignature => non_empty(&fingerprint.device_signature),
        Signal::Webgl => non_empty(&fingerprint.webgl_hash),
        Signal::Audio => non_empty(&fingerprint.audio_hash),
        Signal::Fonts => non_empty(&fingerprint.fonts_hash),
        Signal::Screen => non_empty(&fingerprint.screen_hash),
        Signal::IpTimezone => None,
    }
}

fn ip_timezone_matches(candidate: &FingerprintSample<'_>, reference: &FingerprintSample<'_>) -> bool {
    let same_ip = matches!(
        (non_empty(&candidate.fingerprint.ip), non_empty(&reference.fingerprint.ip)),
        (Some(a), Some(b)) if a == b
    );
    let same_tz = matches!(
        (
            non_empty(&candidate.fingerprint.timezone),
            non_empty(&reference.fingerprint.timezone)
        ),
        (Some(a), Some(b)) if a == b
    );
    let gap = (candidate.seen_at - reference.seen_at).num_seconds().abs();
    same_ip && same_tz && gap <= IP_TIMEZONE_RECENCY_SECS
}

/// Map a total score onto its probability band.
pub fn probability_for(score: i64) -> f64 {
    PROBABILITY_BANDS
        .iter()
        .find(|(threshold, _)| score >= *threshold)
        .map(|(_, probability)| *probability)
        .unwrap_or(PROBABILITY_FLOOR)
}

/// Score `candidate` against `reference`.
pub fn score(candidate: FingerprintSample<'_>, reference: FingerprintSample<'_>) -> MatchScore {
    let mut total = 0;
    let mut matched_signals = BTreeSet::new();

    for (signal, weight) in SIGNAL_WEIGHTS {
        let matched = match signal {
            Signal::IpTimezone => ip_timezone_matches(&candidate, &reference),
            _ => matches!(
                (
                    hash_signal(candidate.fingerprint, signal),
                    hash_signal(reference.fingerprint, signal)
                ),
                (Some(a), Some(b)) if a == b
            ),
        };
        if matched {
            total += weight;
            matched_signals.insert(signal);
        }
    }

    MatchScore {
        score: total,
        probability: probability_for(total),
        matched_signals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn full_fingerprint() -> FingerprintSet {
        FingerprintSet {
            canvas_hash: Some("c1".to_string()),
            webgl_hash: Some("w1".to_string()),
            audio_hash: Some("a1".to_string()),
            fonts_hash: Some("f1".to_string()),
            screen_hash: Some("s1".to_string()),
            device_signature: Some("d1".to_string()),
            ip: Some("10.0.0.1".to_string()),
            timezone: Some("America/Chicago".to_string()),
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 10, hour, 0, 0).unwrap()
    }

    #[test]
    fn all_signals_add_up() {
        let fp = full_fingerprint();
        let result = score(
            FingerprintSample { fingerprint: &fp, seen_at: at(10) },
            FingerprintSample { fingerprint: &fp, seen_at: at(11) },
        );
        assert_eq!(result.score, 155);
        assert_eq!(result.probability, 0.95);
        assert_eq!(result.matched_signals.len(), 7);
    }

    #[test]
    fn ip_timezone_ignored_outside_recency_window() {
        let fp = FingerprintSet {
            ip: Some("10.0.0.1".to_string()),
            timezone: Some("UTC".to_string()),
            ..Default::default()
        };
        let close = score(
            FingerprintSample { fingerprint: &fp, seen_at: at(8) },
            FingerprintSample { fingerprint: &fp, seen_at: at(10) },
        );
        assert_eq!(close.score, 20);

        let far = score(
            FingerprintSample { fingerprint: &fp, seen_at: at(7) },
            FingerprintSample { fingerprint: &fp, seen_at: at(10) },
        );
        assert_eq!(far.score, 0);
        assert!(!far.is_candidate());
    }

    #[test]
    fn empty_and_mismatched_signals_do_not_count() {
        let a = FingerprintSet {
            canvas_hash: Some("".to_string()),
            webgl_hash: Some("w1".to_string()),
            screen_hash: Some("s1".to_string()),
            ..Default::default()
        };
        let b = FingerprintSet {
            canvas_hash: Some("".to_string()),
            webgl_hash: Some("w2".to_string()),
            screen_hash: Some("s1".to_string()),
            ..Default::default()
        };
        let result = score(
            FingerprintSample { fingerprint: &a, seen_at: at(1) },
            FingerprintSample { fingerprint: &b, seen_at: at(1) },
        );
        assert_eq!(result.score, 10);
        assert_eq!(result.matched_signals, BTreeSet::from([Signal::Screen]));
        assert_eq!(result.probability, 0.30);
    }

    #[test]
    fn probability_bands_step_at_thresholds() {
        assert_eq!(probability_for(80), 0.95);
        assert_eq!(probability_for(79), 0.85);
        assert_eq!(probability_for(60), 0.85);
        assert_eq!(probability_for(40), 0.70);
        assert_eq!(probability_for(39), 0.50);
        assert_eq!(probability_for(25), 0.50);
        assert_eq!(probability_for(24), 0.30);
        assert_eq!(probability_for(0), 0.30);
    }

    #[test]
    fn canvas_alone_is_a_low_band_candidate() {
        let fp = FingerprintSet {
            canvas_hash: Some("c1".to_string()),
            ..Default::default()
        };
        let result = score(
            FingerprintSample { fingerprint: &fp, seen_at: at(1) },
            FingerprintSample { fingerprint: &fp, seen_at: at(20) },
        );
        assert_eq!(result.score, 30);
        assert!(result.is_candidate());
        assert_eq!(result.probability, 0.50);
    }

    #[test]
    fn weights_table_covers_every_signal() {
        assert_eq!(Signal::DeviceSignature.weight(), 35);
        assert_eq!(Signal::Screen.weight(), 10);
        assert_eq!(Signal::IpTimezone.weight(), 20);
    }
}
