use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stored stock status of a monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Unknown,
    Available,
    Unavailable,
    Error,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Unknown => "unknown",
            ItemStatus::Available => "available",
            ItemStatus::Unavailable => "unavailable",
            ItemStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "available" => ItemStatus::Available,
            "unavailable" => ItemStatus::Unavailable,
            "error" => ItemStatus::Error,
            _ => ItemStatus::Unknown,
        }
    }
}

/// What one check concluded about a page. Detectors and fusion only ever
/// produce the first three; `Error` marks checks that never got a usable
/// body and exists for records and stored status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Available,
    Unavailable,
    Inconclusive,
    Error,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Available => "available",
            Verdict::Unavailable => "unavailable",
            Verdict::Inconclusive => "inconclusive",
            Verdict::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "available" => Verdict::Available,
            "unavailable" => Verdict::Unavailable,
            "error" => Verdict::Error,
            _ => Verdict::Inconclusive,
        }
    }
}

/// Fetch-layer failure taxonomy. `Blocked` is data, not an error: it
/// suppresses notification and defers the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Dns,
    Connect,
    Tls,
    Timeout,
    Blocked,
    ServerError,
    Decode,
}

impl FetchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorKind::Dns => "dns",
            FetchErrorKind::Connect => "connect",
            FetchErrorKind::Tls => "tls",
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::Blocked => "blocked",
            FetchErrorKind::ServerError => "server_error",
            FetchErrorKind::Decode => "decode",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dns" => Some(FetchErrorKind::Dns),
            "connect" => Some(FetchErrorKind::Connect),
            "tls" => Some(FetchErrorKind::Tls),
            "timeout" => Some(FetchErrorKind::Timeout),
            "blocked" => Some(FetchErrorKind::Blocked),
            "server_error" => Some(FetchErrorKind::ServerError),
            "decode" => Some(FetchErrorKind::Decode),
            _ => None,
        }
    }

    /// Transient kinds retry inside the scheduler; the rest do not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchErrorKind::Dns
                | FetchErrorKind::Connect
                | FetchErrorKind::Timeout
                | FetchErrorKind::ServerError
        )
    }
}

/// Owner sentinel for items added by operators rather than users.
pub const SYSTEM_OWNER: &str = "system";

/// A monitored product page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub item_id: String,
    pub owner_id: String,
    pub is_global: bool,
    pub name: String,
    /// Canonical URL; unique across the catalog.
    pub url: String,
    pub vendor_tag: Option<String>,
    pub config_text: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_status: ItemStatus,
    pub last_confidence: f64,
    pub consecutive_error_count: u32,
    pub fingerprint_hash: Option<String>,
    /// Memoised back-end endpoint discovered by the API probe.
    pub api_endpoint: Option<String>,
    /// Poll deferral (blocked backoff). The scheduler skips the item
    /// until this passes; survives restart.
    pub next_poll_not_before: Option<DateTime<Utc>>,
}

impl Item {
    pub fn host(&self) -> Option<String> {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }
}

/// Admission-time input for a new item; the store assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewItem {
    pub owner_id: String,
    pub is_global: bool,
    pub name: String,
    pub url: String,
    pub vendor_tag: Option<String>,
    pub config_text: String,
}

/// Result of one detector run, stored per check for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorOutcome {
    pub verdict: Verdict,
    /// In [0, 1].
    pub confidence: f64,
    pub evidence: String,
}

impl DetectorOutcome {
    pub fn inconclusive(evidence: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Inconclusive,
            confidence: 0.0,
            evidence: evidence.into(),
        }
    }

    pub fn new(verdict: Verdict, confidence: f64, evidence: impl Into<String>) -> Self {
        Self {
            verdict,
            confidence: confidence.clamp(0.0, 1.0),
            evidence: evidence.into(),
        }
    }
}

/// Named detector outcome as it appears in the per-check report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorReportEntry {
    pub detector: String,
    pub weight: f64,
    #[serde(flatten)]
    pub outcome: DetectorOutcome,
}

/// Fused verdict across all detectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedVerdict {
    pub verdict: Verdict,
    pub confidence: f64,
    pub evidence: String,
    /// Fingerprint drift with no corroborating verdict. The transition
    /// evaluator uses this to schedule a sooner re-check.
    pub suspicious_change: bool,
}

/// One poll result, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRecord {
    pub item_id: String,
    pub check_time: DateTime<Utc>,
    pub verdict: Verdict,
    pub confidence: f64,
    pub detector_report: Vec<DetectorReportEntry>,
    pub http_status: Option<u16>,
    pub latency_ms: u64,
    pub error_kind: Option<FetchErrorKind>,
    pub error_message: Option<String>,
    pub fingerprint_hash: Option<String>,
}

/// A subscriber, keyed by the external id the bot front-end provides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub is_admin: bool,
    pub is_banned: bool,
    pub daily_added_count: u32,
    pub daily_window_start: DateTime<Utc>,
    pub cooldown_seconds: u64,
    pub daily_notify_limit: u32,
    /// Hours of day; start > end means the window crosses midnight.
    pub quiet_start: Option<u8>,
    pub quiet_end: Option<u8>,
    pub notifications_enabled: bool,
}

impl User {
    /// True when `hour` falls inside the user's quiet window.
    pub fn in_quiet_hours(&self, hour: u8) -> bool {
        match (self.quiet_start, self.quiet_end) {
            (Some(start), Some(end)) if start != end => {
                if start < end {
                    hour >= start && hour < end
                } else {
                    // Window crosses midnight, e.g. 23 -> 7.
                    hour >= start || hour < end
                }
            }
            _ => false,
        }
    }
}

/// User-settable preferences, applied field-by-field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPrefs {
    pub cooldown_seconds: Option<u64>,
    pub daily_notify_limit: Option<u32>,
    /// `Some(None)` clears the quiet window.
    pub quiet_hours: Option<Option<(u8, u8)>>,
    pub notifications_enabled: Option<bool>,
}

/// Kind of a delivered (or skipped) notification, as recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Restock,
    Outage,
    AdminSummary,
    AdminHealth,
    SkippedStale,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Restock => "restock",
            NotificationKind::Outage => "outage",
            NotificationKind::AdminSummary => "admin_summary",
            NotificationKind::AdminHealth => "admin_health",
            NotificationKind::SkippedStale => "skipped_stale",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "restock" => Some(NotificationKind::Restock),
            "outage" => Some(NotificationKind::Outage),
            "admin_summary" => Some(NotificationKind::AdminSummary),
            "admin_health" => Some(NotificationKind::AdminHealth),
            "skipped_stale" => Some(NotificationKind::SkippedStale),
            _ => None,
        }
    }
}

/// One ledger row. Append-only; rows are never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub item_id: String,
    pub recipient_id: String,
    pub sent_at: DateTime<Utc>,
    pub kind: NotificationKind,
}

/// A status transition awaiting aggregation. Lives in memory only;
/// a missed restock during a crash is acceptable, a duplicate is worse.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub item_id: String,
    pub item_name: String,
    pub item_url: String,
    pub owner_id: String,
    pub detected_at: DateTime<Utc>,
    pub from_status: ItemStatus,
    pub to_status: ItemStatus,
    pub confidence: f64,
    pub kind: NotificationKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for s in [
            ItemStatus::Unknown,
            ItemStatus::Available,
            ItemStatus::Unavailable,
            ItemStatus::Error,
        ] {
            assert_eq!(ItemStatus::parse(s.as_str()), s);
        }
    }

    #[test]
    fn unknown_status_parses_to_unknown() {
        assert_eq!(ItemStatus::parse("garbage"), ItemStatus::Unknown);
    }

    #[test]
    fn quiet_hours_plain_window() {
        let mut user = test_user();
        user.quiet_start = Some(1);
        user.quiet_end = Some(7);
        assert!(!user.in_quiet_hours(0));
        assert!(user.in_quiet_hours(1));
        assert!(user.in_quiet_hours(6));
        assert!(!user.in_quiet_hours(7));
        assert!(!user.in_quiet_hours(23));
    }

    #[test]
    fn quiet_hours_crossing_midnight() {
        let mut user = test_user();
        user.quiet_start = Some(23);
        user.quiet_end = Some(7);
        assert!(user.in_quiet_hours(23));
        assert!(user.in_quiet_hours(2));
        assert!(user.in_quiet_hours(6));
        assert!(!user.in_quiet_hours(7));
        assert!(!user.in_quiet_hours(12));
    }

    #[test]
    fn quiet_hours_unset_never_matches() {
        let user = test_user();
        for h in 0..24 {
            assert!(!user.in_quiet_hours(h));
        }
    }

    #[test]
    fn transient_error_kinds() {
        assert!(FetchErrorKind::Timeout.is_transient());
        assert!(FetchErrorKind::ServerError.is_transient());
        assert!(!FetchErrorKind::Blocked.is_transient());
        assert!(!FetchErrorKind::Decode.is_transient());
    }

    fn test_user() -> User {
        User {
            user_id: "u1".into(),
            is_admin: false,
            is_banned: false,
            daily_added_count: 0,
            daily_window_start: Utc::now(),
            cooldown_seconds: 600,
            daily_notify_limit: 20,
            quiet_start: None,
            quiet_end: None,
            notifications_enabled: true,
        }
    }
}
