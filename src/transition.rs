//! Transition evaluation
//!
//! Decides whether one fused reading changes an item's stored status and
//! whether that change is worth telling anyone about. Hysteresis is the
//! whole point: a single optimistic reading after a long sold-out run is
//! usually a CDN hiccup or a mis-rendered page, so flipping to
//! `available` takes either exceptional confidence or a second opinion
//! from the recent history.

use crate::models::{
    CheckRecord, FusedVerdict, Item, ItemStatus, NotificationKind, Verdict,
};

/// Extra confidence a reading needs to flip status without corroboration.
pub const HYSTERESIS_MARGIN: f64 = 0.15;

/// Recent checks consulted for corroboration (current reading plus the
/// newest k-1 stored records).
pub const HISTORY_WINDOW: usize = 3;

/// What one evaluation decided.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionDecision {
    pub new_status: ItemStatus,
    /// `Restock` or `Outage` when the transition warrants a notification.
    pub emit: Option<NotificationKind>,
    /// Schedule the next poll sooner than the regular interval.
    pub recheck_sooner: bool,
}

impl TransitionDecision {
    fn keep(item: &Item) -> Self {
        Self {
            new_status: item.last_status,
            emit: None,
            recheck_sooner: false,
        }
    }
}

/// Evaluate a successful (non-error) fused reading against the stored
/// status and the newest history records (newest first, not including
/// the current reading).
pub fn evaluate(
    item: &Item,
    fused: &FusedVerdict,
    history: &[CheckRecord],
    confidence_threshold: f64,
) -> TransitionDecision {
    let mut decision = TransitionDecision::keep(item);
    decision.recheck_sooner = fused.suspicious_change;

    // No opinion, no movement.
    if fused.verdict == Verdict::Inconclusive || fused.verdict == Verdict::Error {
        return decision;
    }
    if fused.confidence < confidence_threshold {
        return decision;
    }

    let recent = &history[..history.len().min(HISTORY_WINDOW - 1)];

    match (item.last_status, fused.verdict) {
        // The transition everyone is here for.
        (ItemStatus::Unavailable | ItemStatus::Unknown, Verdict::Available) => {
            let corroborated = fused.confidence >= confidence_threshold + HYSTERESIS_MARGIN
                || recent.iter().any(|r| r.verdict == Verdict::Available);
            if corroborated {
                decision.new_status = ItemStatus::Available;
                decision.emit = Some(NotificationKind::Restock);
            } else {
                // Plausible but uncorroborated; let the next poll decide,
                // and don't make it wait the full interval.
                decision.recheck_sooner = true;
            }
        }

        // Going dark: needs two of the last three readings to agree.
        (ItemStatus::Available, Verdict::Unavailable) => {
            let agreeing = 1 + recent
                .iter()
                .filter(|r| r.verdict == Verdict::Unavailable)
                .count();
            if agreeing >= 2 {
                decision.new_status = ItemStatus::Unavailable;
                decision.emit = Some(NotificationKind::Outage);
            }
        }

        // First confident reading, or recovery from the error state:
        // adopt the status silently.
        (ItemStatus::Unknown | ItemStatus::Error, Verdict::Unavailable) => {
            decision.new_status = ItemStatus::Unavailable;
        }
        (ItemStatus::Error, Verdict::Available) => {
            decision.new_status = ItemStatus::Available;
        }

        // Confirmations keep the status and reset nothing.
        (ItemStatus::Available, Verdict::Available)
        | (ItemStatus::Unavailable, Verdict::Unavailable) => {}

        _ => {}
    }

    decision
}

/// Error-path evaluation: the check never produced a fused reading. The
/// item turns `Error`, and crossing the consecutive-error threshold is
/// an admin-visible health event (the caller also disables the item).
pub fn evaluate_error(
    new_consecutive_errors: u32,
    error_threshold: u32,
) -> (ItemStatus, Option<NotificationKind>) {
    if new_consecutive_errors == error_threshold {
        (ItemStatus::Error, Some(NotificationKind::AdminHealth))
    } else {
        (ItemStatus::Error, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn item(status: ItemStatus) -> Item {
        Item {
            item_id: "i1".into(),
            owner_id: "u1".into(),
            is_global: false,
            name: "kvm".into(),
            url: "https://example.com/vps".into(),
            vendor_tag: None,
            config_text: String::new(),
            enabled: true,
            created_at: Utc::now(),
            last_checked_at: None,
            last_status: status,
            last_confidence: 0.0,
            consecutive_error_count: 0,
            fingerprint_hash: None,
            api_endpoint: None,
            next_poll_not_before: None,
        }
    }

    fn fused(verdict: Verdict, confidence: f64) -> FusedVerdict {
        FusedVerdict {
            verdict,
            confidence,
            evidence: String::new(),
            suspicious_change: false,
        }
    }

    fn record(verdict: Verdict) -> CheckRecord {
        CheckRecord {
            item_id: "i1".into(),
            check_time: Utc::now(),
            verdict,
            confidence: 0.8,
            detector_report: Vec::new(),
            http_status: Some(200),
            latency_ms: 100,
            error_kind: None,
            error_message: None,
            fingerprint_hash: None,
        }
    }

    const THRESHOLD: f64 = 0.6;

    #[test]
    fn single_low_confidence_available_does_not_flip() {
        // Ten sold-out readings, then one "available" at bare threshold:
        // hysteresis holds the line.
        let history: Vec<CheckRecord> =
            (0..10).map(|_| record(Verdict::Unavailable)).collect();
        let d = evaluate(
            &item(ItemStatus::Unavailable),
            &fused(Verdict::Available, 0.65),
            &history,
            THRESHOLD,
        );
        assert_eq!(d.new_status, ItemStatus::Unavailable);
        assert_eq!(d.emit, None);
        assert!(d.recheck_sooner);
    }

    #[test]
    fn high_confidence_available_flips_alone() {
        let history: Vec<CheckRecord> =
            (0..10).map(|_| record(Verdict::Unavailable)).collect();
        let d = evaluate(
            &item(ItemStatus::Unavailable),
            &fused(Verdict::Available, THRESHOLD + HYSTERESIS_MARGIN),
            &history,
            THRESHOLD,
        );
        assert_eq!(d.new_status, ItemStatus::Available);
        assert_eq!(d.emit, Some(NotificationKind::Restock));
    }

    #[test]
    fn corroborated_available_flips_at_threshold() {
        // Previous tick already read available; this one confirms.
        let history = vec![record(Verdict::Available), record(Verdict::Unavailable)];
        let d = evaluate(
            &item(ItemStatus::Unavailable),
            &fused(Verdict::Available, 0.65),
            &history,
            THRESHOLD,
        );
        assert_eq!(d.new_status, ItemStatus::Available);
        assert_eq!(d.emit, Some(NotificationKind::Restock));
    }

    #[test]
    fn corroboration_window_is_bounded() {
        // An available reading three-or-more checks back is stale and
        // does not corroborate.
        let history = vec![
            record(Verdict::Unavailable),
            record(Verdict::Unavailable),
            record(Verdict::Available),
        ];
        let d = evaluate(
            &item(ItemStatus::Unavailable),
            &fused(Verdict::Available, 0.65),
            &history,
            THRESHOLD,
        );
        assert_eq!(d.new_status, ItemStatus::Unavailable);
        assert_eq!(d.emit, None);
    }

    #[test]
    fn unknown_to_available_emits_restock() {
        let d = evaluate(
            &item(ItemStatus::Unknown),
            &fused(Verdict::Available, 0.9),
            &[],
            THRESHOLD,
        );
        assert_eq!(d.new_status, ItemStatus::Available);
        assert_eq!(d.emit, Some(NotificationKind::Restock));
    }

    #[test]
    fn unknown_to_unavailable_is_silent() {
        let d = evaluate(
            &item(ItemStatus::Unknown),
            &fused(Verdict::Unavailable, 0.9),
            &[],
            THRESHOLD,
        );
        assert_eq!(d.new_status, ItemStatus::Unavailable);
        assert_eq!(d.emit, None);
    }

    #[test]
    fn outage_needs_two_of_three() {
        // One unavailable reading against an available item: hold.
        let history = vec![record(Verdict::Available), record(Verdict::Available)];
        let d = evaluate(
            &item(ItemStatus::Available),
            &fused(Verdict::Unavailable, 0.9),
            &history,
            THRESHOLD,
        );
        assert_eq!(d.new_status, ItemStatus::Available);
        assert_eq!(d.emit, None);

        // Second unavailable within the window: flip and tell the admins.
        let history = vec![record(Verdict::Unavailable), record(Verdict::Available)];
        let d = evaluate(
            &item(ItemStatus::Available),
            &fused(Verdict::Unavailable, 0.9),
            &history,
            THRESHOLD,
        );
        assert_eq!(d.new_status, ItemStatus::Unavailable);
        assert_eq!(d.emit, Some(NotificationKind::Outage));
    }

    #[test]
    fn inconclusive_never_moves_status() {
        for status in [
            ItemStatus::Unknown,
            ItemStatus::Available,
            ItemStatus::Unavailable,
            ItemStatus::Error,
        ] {
            let d = evaluate(
                &item(status),
                &fused(Verdict::Inconclusive, 0.9),
                &[],
                THRESHOLD,
            );
            assert_eq!(d.new_status, status);
            assert_eq!(d.emit, None);
        }
    }

    #[test]
    fn below_threshold_never_moves_status() {
        let d = evaluate(
            &item(ItemStatus::Unavailable),
            &fused(Verdict::Available, 0.5),
            &[record(Verdict::Available)],
            THRESHOLD,
        );
        assert_eq!(d.new_status, ItemStatus::Unavailable);
        assert_eq!(d.emit, None);
    }

    #[test]
    fn suspicious_change_requests_recheck() {
        let mut f = fused(Verdict::Inconclusive, 0.0);
        f.suspicious_change = true;
        let d = evaluate(&item(ItemStatus::Unavailable), &f, &[], THRESHOLD);
        assert!(d.recheck_sooner);
        assert_eq!(d.new_status, ItemStatus::Unavailable);
    }

    #[test]
    fn error_recovery_is_silent() {
        let d = evaluate(
            &item(ItemStatus::Error),
            &fused(Verdict::Available, 0.9),
            &[],
            THRESHOLD,
        );
        assert_eq!(d.new_status, ItemStatus::Available);
        assert_eq!(d.emit, None);
    }

    #[test]
    fn error_threshold_crossing_emits_once() {
        assert_eq!(evaluate_error(9, 10), (ItemStatus::Error, None));
        assert_eq!(
            evaluate_error(10, 10),
            (ItemStatus::Error, Some(NotificationKind::AdminHealth))
        );
        // Past the threshold the item is already disabled; no repeat.
        assert_eq!(evaluate_error(11, 10), (ItemStatus::Error, None));
    }
}
