//! Stock detectors
//!
//! Four heterogeneous signals, each reduced to the same shape: a verdict,
//! a confidence and a line of evidence. Detectors are oblivious to one
//! another; the fusion layer weighs them. Every detector runs under its
//! own deadline — a slow signal degrades to `inconclusive`, never to a
//! failed check.

pub mod api_probe;
pub mod dom;
pub mod fingerprint;
pub mod keyword;

use crate::config::Config;
use crate::fetcher::FetchResult;
use crate::models::{DetectorOutcome, DetectorReportEntry, Item};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

/// Everything a detector may look at for one poll.
pub struct DetectContext {
    pub item: Item,
    pub fetch: Arc<FetchResult>,
}

/// Output of one detector run. Side products (a discovered endpoint, a
/// computed fingerprint) ride along so the worker can persist them.
pub struct DetectorRun {
    pub outcome: DetectorOutcome,
    pub discovered_endpoint: Option<String>,
    pub fingerprint: Option<String>,
}

impl From<DetectorOutcome> for DetectorRun {
    fn from(outcome: DetectorOutcome) -> Self {
        Self {
            outcome,
            discovered_endpoint: None,
            fingerprint: None,
        }
    }
}

#[async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, ctx: Arc<DetectContext>) -> DetectorRun;
}

/// Everything the worker needs from one detection pass.
pub struct DetectionReport {
    pub entries: Vec<DetectorReportEntry>,
    pub discovered_endpoint: Option<String>,
    pub fingerprint: Option<String>,
    /// `Some(true)` when the item had a stored fingerprint and this poll
    /// produced a different one.
    pub fingerprint_changed: Option<bool>,
}

/// The standard detector set with configured weights.
pub fn standard_set(config: &Config) -> Vec<(Arc<dyn Detector>, f64)> {
    let w = &config.detector_weights;
    vec![
        (
            Arc::new(keyword::KeywordDetector::new()) as Arc<dyn Detector>,
            w.keyword,
        ),
        (Arc::new(dom::DomDetector::new()) as Arc<dyn Detector>, w.dom),
        (
            Arc::new(api_probe::ApiProbeDetector::new(
                config.detector_timeout_duration(),
            )) as Arc<dyn Detector>,
            w.api_probe,
        ),
        (
            Arc::new(fingerprint::FingerprintDetector::new()) as Arc<dyn Detector>,
            w.fingerprint,
        ),
    ]
}

/// Run every detector concurrently, each under `timeout`. Panics and
/// deadline misses both degrade to `inconclusive`.
pub async fn run_all(
    detectors: &[(Arc<dyn Detector>, f64)],
    ctx: Arc<DetectContext>,
    timeout: Duration,
) -> DetectionReport {
    let handles: Vec<(&'static str, f64, JoinHandle<DetectorRun>)> = detectors
        .iter()
        .map(|(det, weight)| {
            let det = det.clone();
            let ctx = ctx.clone();
            let name = det.name();
            let handle = tokio::spawn(async move {
                match tokio::time::timeout(timeout, det.run(ctx)).await {
                    Ok(run) => run,
                    Err(_) => DetectorOutcome::inconclusive("timeout").into(),
                }
            });
            (name, *weight, handle)
        })
        .collect();

    let mut report = DetectionReport {
        entries: Vec::with_capacity(handles.len()),
        discovered_endpoint: None,
        fingerprint: None,
        fingerprint_changed: None,
    };

    for (name, weight, handle) in handles {
        let run = match handle.await {
            Ok(run) => run,
            Err(e) => {
                warn!(detector = name, error = %e, "Detector task failed");
                DetectorOutcome::inconclusive("detector panicked").into()
            }
        };
        if run.discovered_endpoint.is_some() {
            report.discovered_endpoint = run.discovered_endpoint;
        }
        if run.fingerprint.is_some() {
            report.fingerprint = run.fingerprint;
        }
        report.entries.push(DetectorReportEntry {
            detector: name.to_string(),
            weight,
            outcome: run.outcome,
        });
    }

    if let (Some(stored), Some(fresh)) = (&ctx.item.fingerprint_hash, &report.fingerprint) {
        report.fingerprint_changed = Some(stored != fresh);
    }

    report
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::models::ItemStatus;
    use chrono::Utc;

    pub fn item_with(url: &str) -> Item {
        Item {
            item_id: "test-item".into(),
            owner_id: "u1".into(),
            is_global: false,
            name: "test".into(),
            url: url.into(),
            vendor_tag: None,
            config_text: String::new(),
            enabled: true,
            created_at: Utc::now(),
            last_checked_at: None,
            last_status: ItemStatus::Unknown,
            last_confidence: 0.0,
            consecutive_error_count: 0,
            fingerprint_hash: None,
            api_endpoint: None,
            next_poll_not_before: None,
        }
    }

    pub fn fetch_ok(url: &str, raw: &str, rendered: Option<&str>) -> FetchResult {
        FetchResult {
            final_url: url.into(),
            http_status: Some(200),
            headers: Vec::new(),
            raw_body: raw.into(),
            rendered_body: rendered.map(|s| s.to_string()),
            latency_ms: 50,
            error_kind: None,
            error_message: None,
        }
    }

    pub fn ctx(item: Item, fetch: FetchResult) -> Arc<DetectContext> {
        Arc::new(DetectContext {
            item,
            fetch: Arc::new(fetch),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::models::Verdict;

    struct SlowDetector;

    #[async_trait]
    impl Detector for SlowDetector {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn run(&self, _ctx: Arc<DetectContext>) -> DetectorRun {
            tokio::time::sleep(Duration::from_secs(60)).await;
            DetectorOutcome::new(Verdict::Available, 0.9, "too late").into()
        }
    }

    #[tokio::test]
    async fn slow_detector_times_out_to_inconclusive() {
        let set: Vec<(Arc<dyn Detector>, f64)> = vec![(Arc::new(SlowDetector), 1.0)];
        let ctx = ctx(
            item_with("https://example.com/vps"),
            fetch_ok("https://example.com/vps", "<html></html>", None),
        );
        let report = run_all(&set, ctx, Duration::from_millis(50)).await;
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].outcome.verdict, Verdict::Inconclusive);
        assert_eq!(report.entries[0].outcome.evidence, "timeout");
    }

    #[tokio::test]
    async fn standard_set_runs_clean_page() {
        let config = Config::default();
        let set = standard_set(&config);
        let ctx = ctx(
            item_with("https://example.com/vps"),
            fetch_ok(
                "https://example.com/vps",
                "<html><body><h1>VPS</h1><p>out of stock</p></body></html>",
                None,
            ),
        );
        let report = run_all(&set, ctx, Duration::from_secs(5)).await;
        assert_eq!(report.entries.len(), 4);
        // Keyword detector should have voted unavailable.
        let kw = report
            .entries
            .iter()
            .find(|e| e.detector == "keyword")
            .unwrap();
        assert_eq!(kw.outcome.verdict, Verdict::Unavailable);
        // Fingerprint side product is produced on every pass.
        assert!(report.fingerprint.is_some());
        // No stored fingerprint yet, so no drift signal.
        assert_eq!(report.fingerprint_changed, None);
    }
}
