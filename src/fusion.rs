//! Detector fusion
//!
//! Pure arithmetic, no IO: weighted side-sums over the detector votes,
//! an authoritative-API override, and a confidence floor below which the
//! engine refuses to have an opinion. Same inputs, same verdict, always.

use crate::models::{DetectorReportEntry, FusedVerdict, Verdict};

/// Detector name whose high-confidence verdicts override the vote.
const API_DETECTOR: &str = "api_probe";
const API_OVERRIDE_MIN_CONFIDENCE: f64 = 0.85;

/// Confidence boost applied to voting detectors when the page
/// fingerprint moved this poll.
const DRIFT_BOOST: f64 = 0.1;

pub fn fuse(
    entries: &[DetectorReportEntry],
    confidence_threshold: f64,
    fingerprint_changed: Option<bool>,
) -> FusedVerdict {
    // Weights renormalise over the detectors that actually voted, so an
    // abstaining detector dilutes nothing. A page with no rendered body
    // and no known API must still be decidable on keywords alone.
    let total_weight: f64 = entries
        .iter()
        .filter(|e| matches!(e.outcome.verdict, Verdict::Available | Verdict::Unavailable))
        .map(|e| e.weight)
        .sum();
    let drifted = fingerprint_changed == Some(true);

    let mut s_avail = 0.0;
    let mut s_unavail = 0.0;
    let mut voters = 0usize;

    for entry in entries {
        let weight = if total_weight > 0.0 {
            entry.weight / total_weight
        } else {
            0.0
        };
        let mut confidence = entry.outcome.confidence;
        if drifted && entry.outcome.verdict != Verdict::Inconclusive {
            // Structure moved and a detector sees a verdict: the two
            // signals corroborate each other.
            confidence = (confidence + DRIFT_BOOST).min(1.0);
        }
        match entry.outcome.verdict {
            Verdict::Available => {
                s_avail += weight * confidence;
                voters += 1;
            }
            Verdict::Unavailable => {
                s_unavail += weight * confidence;
                voters += 1;
            }
            Verdict::Inconclusive | Verdict::Error => {}
        }
    }

    let evidence = entries
        .iter()
        .filter(|e| !e.outcome.evidence.is_empty())
        .map(|e| format!("{}: {}", e.detector, e.outcome.evidence))
        .collect::<Vec<_>>()
        .join("; ");

    // Page drifted but nobody could read a verdict out of it: have the
    // scheduler come back sooner instead of guessing.
    let suspicious_change = drifted && voters == 0;

    let (mut verdict, mut confidence) = if s_avail > s_unavail {
        (Verdict::Available, s_avail)
    } else if s_unavail > s_avail {
        (Verdict::Unavailable, s_unavail)
    } else {
        (Verdict::Inconclusive, s_avail.max(s_unavail))
    };

    if confidence < confidence_threshold {
        verdict = Verdict::Inconclusive;
    }

    // APIs are authoritative when they speak: a confident probe verdict
    // beats the whole vote, threshold included.
    if let Some(api) = entries.iter().find(|e| {
        e.detector == API_DETECTOR
            && e.outcome.verdict != Verdict::Inconclusive
            && e.outcome.confidence >= API_OVERRIDE_MIN_CONFIDENCE
    }) {
        verdict = api.outcome.verdict;
        confidence = api.outcome.confidence;
    }

    FusedVerdict {
        verdict,
        confidence,
        evidence,
        suspicious_change,
    }
}
