use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::{self, FingerprintSample, FingerprintSet, Signal};

/// One browsing session as written by the tracking-ingestion path.
///
/// `contact_id` is only ever filled in by the session linker (or repointed by
/// a contact merge); telemetry never sets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub visitor_id: String,
    #[serde(default)]
    pub contact_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub source_platform: Option<String>,
    #[serde(default)]
    pub utm_source: Option<String>,
    #[serde(default)]
    pub ad_id: Option<String>,
    #[serde(default)]
    pub fingerprint: FingerprintSet,
}

impl Session {
    pub fn fingerprint_sample(&self) -> FingerprintSample<'_> {
        FingerprintSample {
            fingerprint: &self.fingerprint,
            seen_at: self.started_at,
        }
    }
}

/// A scored fingerprint match against the session being converted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarSession {
    pub session_id: String,
    pub visitor_id: String,
    pub started_at: DateTime<Utc>,
    pub score: i64,
    pub probability: f64,
    pub matched_signals: Vec<Signal>,
    /// Probability is high enough for the match to be merged automatically.
    pub auto_linkable: bool,
}

/// Score `candidates` against `current` and keep the plausible matches.
///
/// Sessions of the current visitor are skipped. Results are sorted by score
/// descending (then most recent first, then session id) and capped at
/// `max_results`.
pub fn rank_similar_sessions(
    current: &Session,
    candidates: &[Session],
    max_results: usize,
    auto_link_probability: f64,
) -> Vec<SimilarSession> {
    let mut matches: Vec<SimilarSession> = candidates
        .iter()
        .filter(|s| s.visitor_id != current.visitor_id && s.session_id != current.session_id)
        .filter_map(|s| {
            let result = fingerprint::score(s.fingerprint_sample(), current.fingerprint_sample());
            if !result.is_candidate() {
                return None;
            }
            Some(SimilarSession {
                session_id: s.session_id.clone(),
                visitor_id: s.visitor_id.clone(),
                started_at: s.started_at,
                score: result.score,
                probability: result.probability,
                matched_signals: result.matched_signals.into_iter().collect(),
                auto_linkable: result.probability >= auto_link_probability,
            })
        })
        .collect();

    matches.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.started_at.cmp(&a.started_at))
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
    matches.truncate(max_results);
    matches
}

/// Result of propagating a contact across an identity's sessions.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionLinkOutcome {
    Linked {
        primary_identity_id: String,
        visitor_ids: Vec<String>,
        sessions_updated: usize,
        contact_visitor_backfilled: bool,
    },
    /// Another worker holds the identity lock and is doing the same work.
    SkippedLockHeld { primary_identity_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn session(id: &str, visitor: &str, canvas: Option<&str>, device: Option<&str>, day: u32) -> Session {
        Session {
            session_id: id.to_string(),
            visitor_id: visitor.to_string(),
            contact_id: None,
            started_at: Utc.with_ymd_and_hms(2025, 1, day, 12, 0, 0).unwrap(),
            channel: None,
            source_platform: None,
            utm_source: None,
            ad_id: None,
            fingerprint: FingerprintSet {
                canvas_hash: canvas.map(str::to_string),
                device_signature: device.map(str::to_string),
                ..Default::default()
            },
        }
    }

    #[test]
    fn ranks_by_score_and_filters_noise() {
        let current = session("cur", "v0", Some("c"), Some("d"), 10);
        let candidates = vec![
            session("s_canvas", "v1", Some("c"), None, 9),
            session("s_both", "v2", Some("c"), Some("d"), 8),
            session("s_none", "v3", Some("x"), None, 9),
            session("s_self", "v0", Some("c"), Some("d"), 9),
        ];
        let ranked = rank_similar_sessions(&current, &candidates, 20, 0.70);
        let ids: Vec<&str> = ranked.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["s_both", "s_canvas"]);
        assert_eq!(ranked[0].score, 65);
        assert!(ranked[0].auto_linkable);
        assert!(!ranked[1].auto_linkable);
    }

    #[test]
    fn caps_results() {
        let current = session("cur", "v0", Some("c"), None, 10);
        let candidates: Vec<Session> = (1..=5)
            .map(|i| session(&format!("s{i}"), &format!("v{i}"), Some("c"), None, i))
            .collect();
        let ranked = rank_similar_sessions(&current, &candidates, 3, 0.70);
        assert_eq!(ranked.len(), 3);
        // Equal scores fall back to most recent first.
        assert_eq!(ranked[0].session_id, "s5");
    }
}
