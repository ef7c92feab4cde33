//! Poll scheduler
//!
//! Event-loop style: a dispatcher refreshes the due-set once per tick
//! and feeds a bounded worker pool. Two hard invariants, both enforced
//! here and nowhere else:
//! - at most one in-flight poll per item, ever;
//! - per-host concurrency of one with a minimum spacing between polls,
//!   measured from poll completion.
//!
//! Transient fetch errors retry in-worker with jittered exponential
//! backoff. Anti-bot blocks never retry in-tick; the item is deferred by
//! the blocked backoff. Items that keep erroring get auto-disabled and
//! the admins get told.

pub mod backoff;

use crate::config::Config;
use crate::detectors::{self, DetectContext, Detector};
use crate::fetcher::host_politeness::HostPoliteness;
use crate::fetcher::PageFetcher;
use crate::fusion;
use crate::models::{
    CheckRecord, FetchErrorKind, Item, ItemStatus, NotificationKind, PendingEvent, Verdict,
};
use crate::store::Store;
use crate::transition;
use anyhow::{Context as AnyhowContext, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

/// Outcome of one full check pipeline, for callers that want to inspect
/// it (diagnostic one-shot polls, tests).
#[derive(Debug)]
pub struct CheckSummary {
    pub record: CheckRecord,
    pub new_status: ItemStatus,
    pub emitted: Option<NotificationKind>,
    pub auto_disabled: bool,
    /// The evaluator wants the next poll sooner than the regular interval.
    pub recheck_sooner: bool,
}

/// The per-item pipeline: fetch (with transient retries) → detectors →
/// fusion → transition → record. Shared by the worker pool and the
/// one-shot diagnostic path.
pub struct CheckRunner {
    store: Store,
    config: Arc<Config>,
    fetcher: Arc<dyn PageFetcher>,
    detectors: Vec<(Arc<dyn Detector>, f64)>,
    events_tx: mpsc::Sender<PendingEvent>,
}

impl CheckRunner {
    pub fn new(
        store: Store,
        config: Arc<Config>,
        fetcher: Arc<dyn PageFetcher>,
        detectors: Vec<(Arc<dyn Detector>, f64)>,
        events_tx: mpsc::Sender<PendingEvent>,
    ) -> Self {
        Self {
            store,
            config,
            fetcher,
            detectors,
            events_tx,
        }
    }

    /// Fetch with in-worker retries for transient failures.
    async fn fetch_with_retries(&self, url: &str) -> crate::fetcher::FetchResult {
        let mut attempt = 0u32;
        loop {
            let fetch = self.fetcher.fetch(url).await;
            match fetch.error_kind {
                Some(kind) if kind.is_transient() && attempt < self.config.max_retries => {
                    let wait =
                        backoff::delay(Duration::from_secs(self.config.retry_delay), attempt);
                    warn!(
                        url,
                        error_kind = kind.as_str(),
                        attempt = attempt + 1,
                        "Transient fetch error, retrying in {:.0}s",
                        wait.as_secs_f64()
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                _ => return fetch,
            }
        }
    }

    pub async fn check_item(&self, item: &Item) -> Result<CheckSummary> {
        let fetch = self.fetch_with_retries(&item.url).await;
        let now = Utc::now();

        if let Some(kind) = fetch.error_kind {
            return self.record_failed_check(item, fetch, kind, now).await;
        }

        let ctx = Arc::new(DetectContext {
            item: item.clone(),
            fetch: Arc::new(fetch),
        });
        let report = detectors::run_all(
            &self.detectors,
            ctx.clone(),
            self.config.detector_timeout_duration(),
        )
        .await;
        let fused = fusion::fuse(
            &report.entries,
            self.config.confidence_threshold,
            report.fingerprint_changed,
        );

        let history = self
            .store
            .recent_history(&item.item_id, (transition::HISTORY_WINDOW - 1) as u32)
            .await?;
        let decision =
            transition::evaluate(item, &fused, &history, self.config.confidence_threshold);

        let record = CheckRecord {
            item_id: item.item_id.clone(),
            check_time: now,
            verdict: fused.verdict,
            confidence: fused.confidence,
            detector_report: report.entries,
            http_status: ctx.fetch.http_status,
            latency_ms: ctx.fetch.latency_ms,
            error_kind: None,
            error_message: None,
            fingerprint_hash: report.fingerprint.clone(),
        };

        self.store
            .record_check(
                &record,
                decision.new_status,
                None,
                report.discovered_endpoint.as_deref(),
            )
            .await
            .context("record check")?;

        if let Some(kind) = decision.emit {
            self.emit_event(item, decision.new_status, fused.confidence, kind, now)
                .await;
        }

        debug!(
            item_id = %item.item_id,
            verdict = fused.verdict.as_str(),
            confidence = format!("{:.2}", fused.confidence),
            status = decision.new_status.as_str(),
            "Check complete"
        );

        Ok(CheckSummary {
            record,
            new_status: decision.new_status,
            emitted: decision.emit,
            auto_disabled: false,
            recheck_sooner: decision.recheck_sooner,
        })
    }

    /// Failed fetch: the check is still recorded, errors are counted,
    /// blocks defer the item, and crossing the error threshold disables
    /// it with an admin health event. The stored stock status survives
    /// isolated blips — fetch health lives in the error counter.
    async fn record_failed_check(
        &self,
        item: &Item,
        fetch: crate::fetcher::FetchResult,
        kind: FetchErrorKind,
        now: DateTime<Utc>,
    ) -> Result<CheckSummary> {
        let expected_errors = item.consecutive_error_count + 1;
        let (threshold_status, health_event) =
            transition::evaluate_error(expected_errors, self.config.error_threshold);

        let new_status = if expected_errors >= self.config.error_threshold {
            threshold_status
        } else {
            item.last_status
        };

        let defer_until = match kind {
            FetchErrorKind::Blocked => {
                info!(
                    item_id = %item.item_id,
                    "🚧 Anti-bot block; deferring item by {}s",
                    self.config.blocked_backoff
                );
                Some(now + ChronoDuration::seconds(self.config.blocked_backoff as i64))
            }
            _ => None,
        };

        let record = CheckRecord {
            item_id: item.item_id.clone(),
            check_time: now,
            verdict: Verdict::Error,
            confidence: 0.0,
            detector_report: Vec::new(),
            http_status: fetch.http_status,
            latency_ms: fetch.latency_ms,
            error_kind: Some(kind),
            error_message: fetch.error_message.clone(),
            fingerprint_hash: None,
        };

        let errors = self
            .store
            .record_check(&record, new_status, defer_until, None)
            .await
            .context("record failed check")?;

        warn!(
            item_id = %item.item_id,
            http_status = ?fetch.http_status,
            error_kind = kind.as_str(),
            consecutive = errors,
            "Check failed: {}",
            fetch.error_message.as_deref().unwrap_or("-")
        );

        let mut auto_disabled = false;
        if health_event.is_some() {
            self.store.set_item_enabled(&item.item_id, false).await?;
            auto_disabled = true;
            error!(
                item_id = %item.item_id,
                "🛑 Item auto-disabled after {} consecutive errors",
                errors
            );
            self.emit_event(item, ItemStatus::Error, 0.0, NotificationKind::AdminHealth, now)
                .await;
        }

        Ok(CheckSummary {
            record,
            new_status,
            emitted: health_event,
            auto_disabled,
            recheck_sooner: false,
        })
    }

    async fn emit_event(
        &self,
        item: &Item,
        to_status: ItemStatus,
        confidence: f64,
        kind: NotificationKind,
        now: DateTime<Utc>,
    ) {
        let event = PendingEvent {
            item_id: item.item_id.clone(),
            item_name: item.name.clone(),
            item_url: item.url.clone(),
            owner_id: item.owner_id.clone(),
            detected_at: now,
            from_status: item.last_status,
            to_status,
            confidence,
            kind,
        };
        if self.events_tx.send(event).await.is_err() {
            warn!(item_id = %item.item_id, "Event queue closed; notification lost");
        }
    }
}

struct SchedulerCore {
    runner: CheckRunner,
    store: Store,
    config: Arc<Config>,
    politeness: HostPoliteness,
    in_flight: SyncMutex<HashSet<String>>,
    /// Items flagged for an early re-check (suspicious fingerprint
    /// drift, uncorroborated availability). In-memory on purpose.
    hot: SyncMutex<HashMap<String, DateTime<Utc>>>,
}

pub struct Scheduler {
    core: Arc<SchedulerCore>,
}

impl Scheduler {
    pub fn new(
        store: Store,
        config: Arc<Config>,
        fetcher: Arc<dyn PageFetcher>,
        detectors: Vec<(Arc<dyn Detector>, f64)>,
        events_tx: mpsc::Sender<PendingEvent>,
    ) -> Self {
        let politeness =
            HostPoliteness::new(Duration::from_secs(config.per_host_min_delay));
        let runner = CheckRunner::new(
            store.clone(),
            config.clone(),
            fetcher,
            detectors,
            events_tx,
        );
        Self {
            core: Arc::new(SchedulerCore {
                runner,
                store,
                config,
                politeness,
                in_flight: SyncMutex::new(HashSet::new()),
                hot: SyncMutex::new(HashMap::new()),
            }),
        }
    }

    /// Run dispatcher and worker pool until shutdown. In-flight items
    /// finish inside the grace window; nothing new starts after the
    /// signal.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let core = self.core;
        let (work_tx, work_rx) = mpsc::channel::<Item>(core.config.max_workers * 2);
        let work_rx = Arc::new(AsyncMutex::new(work_rx));

        let mut workers = Vec::with_capacity(core.config.max_workers);
        for worker_id in 0..core.config.max_workers {
            let core = core.clone();
            let work_rx = work_rx.clone();
            let shutdown = shutdown.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(worker_id, core, work_rx, shutdown).await;
            }));
        }

        info!(
            "🛰️  Scheduler started: {} workers, tick {}s, check interval {}s",
            core.config.max_workers, core.config.tick_interval, core.config.check_interval
        );

        let mut ticker =
            tokio::time::interval(Duration::from_secs(core.config.tick_interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    ticks += 1;
                    if let Err(e) = dispatch_due(&core, &work_tx).await {
                        warn!(error = %e, "Due-set dispatch failed");
                    }
                    if ticks % 3600 == 0 {
                        core.politeness.evict_stale(Duration::from_secs(3600));
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        // Closing the channel is the stop signal for idle workers;
        // busy ones notice the flag after their current item.
        drop(work_tx);
        info!("🛰️  Scheduler draining: waiting up to {}s for in-flight polls", core.config.shutdown_grace);
        let grace = Duration::from_secs(core.config.shutdown_grace);
        for worker in workers {
            if tokio::time::timeout(grace, worker).await.is_err() {
                warn!("Worker did not finish within shutdown grace; abandoning");
            }
        }
        info!("🛰️  Scheduler stopped");
    }

    /// Diagnostic single poll, bypassing due-set and politeness pacing.
    pub async fn check_once(&self, item: &Item) -> Result<CheckSummary> {
        self.core.runner.check_item(item).await
    }
}

/// Collect due items (regular due-set plus early re-checks), then claim
/// and enqueue the ones whose item and host slots are free.
async fn dispatch_due(core: &Arc<SchedulerCore>, work_tx: &mpsc::Sender<Item>) -> Result<()> {
    let now = Utc::now();
    let batch_limit = (core.config.max_workers * 4) as u32;
    let mut due = core
        .store
        .list_due_items(now, core.config.check_interval, batch_limit)
        .await?;

    // Early re-checks ride along, bypassing the regular interval but
    // not the politeness or in-flight rules.
    let hot_ready: Vec<String> = {
        let mut hot = core.hot.lock();
        let ready: Vec<String> = hot
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ready {
            hot.remove(id);
        }
        ready
    };
    for item_id in hot_ready {
        if due.iter().any(|i| i.item_id == item_id) {
            continue;
        }
        if let Some(item) = core.store.get_item(&item_id).await? {
            if item.enabled {
                due.push(item);
            }
        }
    }

    for item in due {
        let Some(host) = item.host() else {
            warn!(item_id = %item.item_id, "Item has no host; skipping");
            continue;
        };

        // One in-flight poll per item, claimed before the host slot.
        {
            let mut in_flight = core.in_flight.lock();
            if !in_flight.insert(item.item_id.clone()) {
                continue;
            }
        }

        if core.politeness.try_acquire(&host).is_some() {
            // Host busy or cooling down; surrender the item claim and
            // let a later tick retry.
            core.in_flight.lock().remove(&item.item_id);
            continue;
        }

        match work_tx.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(item)) => {
                core.politeness.release(&host);
                core.in_flight.lock().remove(&item.item_id);
                break;
            }
            Err(mpsc::error::TrySendError::Closed(item)) => {
                core.politeness.release(&host);
                core.in_flight.lock().remove(&item.item_id);
                debug!(item_id = %item.item_id, "Dispatch channel closed");
                break;
            }
        }
    }
    Ok(())
}

async fn worker_loop(
    worker_id: usize,
    core: Arc<SchedulerCore>,
    work_rx: Arc<AsyncMutex<mpsc::Receiver<Item>>>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        let item = {
            let mut rx = work_rx.lock().await;
            rx.recv().await
        };
        let Some(item) = item else { break };

        let host = item.host().unwrap_or_default();

        // Queued before shutdown but not started: that counts as new work.
        if *shutdown.borrow() {
            core.politeness.release(&host);
            core.in_flight.lock().remove(&item.item_id);
            break;
        }

        let result = core.runner.check_item(&item).await;

        core.politeness.release(&host);
        core.in_flight.lock().remove(&item.item_id);

        match result {
            Ok(summary) => {
                // Suspicious drift or an uncorroborated availability
                // reading: look again after a quarter interval.
                if summary.recheck_sooner && !summary.auto_disabled {
                    let at = Utc::now()
                        + ChronoDuration::seconds((core.config.check_interval / 4).max(30) as i64);
                    core.hot.lock().insert(summary.record.item_id.clone(), at);
                }
            }
            Err(e) => {
                error!(worker_id, item_id = %item.item_id, error = %e, "Check pipeline failed");
            }
        }
    }
    debug!(worker_id, "Worker exited");
}
