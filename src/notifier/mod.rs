//! Notification aggregation
//!
//! Owns the pending-event queue. One background loop wakes per
//! aggregation tick and turns raw transitions into the few messages
//! people actually want: a compact digest per administrator, one message
//! per subscribed owner — each gated by cooldown, daily caps, quiet
//! hours and per-user switches. The ledger is consulted before and
//! appended after every delivery; that is the whole
//! at-most-once-per-cooldown contract.

pub mod sink;

use crate::config::Config;
use crate::models::{LedgerEntry, NotificationKind, PendingEvent, SYSTEM_OWNER};
use crate::store::Store;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use parking_lot::Mutex;
use sink::{Sink, SinkError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Events younger than half the aggregation interval wait one more tick
/// so bursts batch together.
fn batch_age(config: &Config) -> ChronoDuration {
    ChronoDuration::seconds((config.aggregation_interval / 2) as i64)
}

/// Deferred events older than this are dropped with a ledger record.
const MAX_EVENT_AGE_HOURS: i64 = 24;

const DELIVERY_ATTEMPTS: u32 = 3;
const DELIVERY_BACKOFF_BASE: Duration = Duration::from_millis(250);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushStats {
    pub delivered: u32,
    pub skipped_cooldown: u32,
    pub skipped_daily_cap: u32,
    pub skipped_disabled: u32,
    pub deferred_quiet_hours: u32,
    pub dropped_stale: u32,
    pub dropped_missing_item: u32,
    pub delivery_failed: u32,
}

pub struct NotificationAggregator {
    store: Store,
    config: Arc<Config>,
    sink: Arc<dyn Sink>,
    rx: mpsc::Receiver<PendingEvent>,
    queue: Vec<PendingEvent>,
    /// Last delivery per (item, recipient). The aggregator is the sole
    /// ledger writer, so once a pair is cached the store needs no
    /// further lookups for it.
    last_sent: Mutex<HashMap<(String, String), DateTime<Utc>>>,
}

impl NotificationAggregator {
    pub fn new(
        store: Store,
        config: Arc<Config>,
        sink: Arc<dyn Sink>,
    ) -> (Self, mpsc::Sender<PendingEvent>) {
        let (tx, rx) = mpsc::channel(1024);
        (
            Self {
                store,
                config,
                sink,
                rx,
                queue: Vec::new(),
                last_sent: Mutex::new(HashMap::new()),
            },
            tx,
        )
    }

    /// Background loop: accumulate events, flush on each tick, final
    /// flush on shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "📣 Notification aggregator started (tick {}s)",
            self.config.aggregation_interval
        );
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.aggregation_interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        enum Wake {
            Tick,
            Event(Option<PendingEvent>),
            Shutdown,
        }

        loop {
            let wake = tokio::select! {
                _ = ticker.tick() => Wake::Tick,
                event = self.rx.recv() => Wake::Event(event),
                _ = shutdown.changed() => Wake::Shutdown,
            };
            match wake {
                Wake::Tick => {
                    if let Err(e) = self.flush_once(Utc::now()).await {
                        warn!(error = %e, "Notification flush failed; will retry next tick");
                    }
                }
                Wake::Event(Some(event)) => self.queue.push(event),
                Wake::Event(None) | Wake::Shutdown => break,
            }
        }

        // Drain whatever arrived and flush once more so a clean shutdown
        // does not eat detected restocks.
        while let Ok(event) = self.rx.try_recv() {
            self.queue.push(event);
        }
        if let Err(e) = self.flush_once(Utc::now()).await {
            warn!(error = %e, "Final notification flush failed");
        }
        info!("📣 Notification aggregator stopped");
    }

    /// One aggregation pass. Public so diagnostics and tests can drive
    /// the clock by hand.
    pub async fn flush_once(&mut self, now: DateTime<Utc>) -> Result<FlushStats> {
        let mut stats = FlushStats::default();

        // Pick up anything that arrived since the last pass.
        while let Ok(event) = self.rx.try_recv() {
            self.queue.push(event);
        }

        let min_age = batch_age(&self.config);
        let queue = std::mem::take(&mut self.queue);
        let (ready, young): (Vec<_>, Vec<_>) = queue
            .into_iter()
            .partition(|e| now - e.detected_at >= min_age);
        self.queue = young;

        if ready.is_empty() {
            return Ok(stats);
        }

        // Deleting an item cancels its pending notifications.
        let mut live = Vec::with_capacity(ready.len());
        for event in ready {
            if self.store.get_item(&event.item_id).await?.is_some() {
                live.push(event);
            } else {
                stats.dropped_missing_item += 1;
            }
        }

        let restocks: Vec<&PendingEvent> = live
            .iter()
            .filter(|e| e.kind == NotificationKind::Restock)
            .collect();
        let outages: Vec<&PendingEvent> = live
            .iter()
            .filter(|e| e.kind == NotificationKind::Outage)
            .collect();
        let health: Vec<&PendingEvent> = live
            .iter()
            .filter(|e| e.kind == NotificationKind::AdminHealth)
            .collect();

        self.flush_admin_digest(&restocks, now, &mut stats).await?;
        let deferred = self.flush_owner_messages(&restocks, now, &mut stats).await?;
        self.flush_admin_events(&outages, NotificationKind::Outage, now, &mut stats)
            .await?;
        self.flush_admin_events(&health, NotificationKind::AdminHealth, now, &mut stats)
            .await?;

        // Quiet-hours deferrals come back on a later tick.
        self.queue.extend(deferred);

        debug!(?stats, "Aggregation flush complete");
        Ok(stats)
    }

    /// One compact digest per administrator covering this flush's
    /// restocks, minus items still in that admin's cooldown.
    async fn flush_admin_digest(
        &self,
        restocks: &[&PendingEvent],
        now: DateTime<Utc>,
        stats: &mut FlushStats,
    ) -> Result<()> {
        if restocks.is_empty() {
            return Ok(());
        }

        for admin in &self.config.admin_ids {
            let mut fresh = Vec::new();
            for event in restocks {
                if self
                    .in_cooldown(&event.item_id, admin, self.config.cooldown_seconds, now)
                    .await?
                {
                    stats.skipped_cooldown += 1;
                    continue;
                }
                fresh.push(*event);
            }
            if fresh.is_empty() {
                continue;
            }

            let body = digest_message(&fresh, self.config.admin_digest_max_items);
            match self.deliver(admin, &body).await {
                Ok(()) => {
                    stats.delivered += 1;
                    for event in &fresh {
                        self.record_delivery(&LedgerEntry {
                            item_id: event.item_id.clone(),
                            recipient_id: admin.clone(),
                            sent_at: now,
                            kind: NotificationKind::AdminSummary,
                        })
                        .await?;
                    }
                }
                Err(e) => {
                    stats.delivery_failed += 1;
                    warn!(recipient = %admin, error = %e, "Admin digest dropped after retries");
                }
            }
        }
        Ok(())
    }

    /// Individual restock messages to item owners, subject to every
    /// per-user gate. Returns quiet-hour deferrals to re-queue.
    async fn flush_owner_messages(
        &self,
        restocks: &[&PendingEvent],
        now: DateTime<Utc>,
        stats: &mut FlushStats,
    ) -> Result<Vec<PendingEvent>> {
        let mut deferred = Vec::new();

        for event in restocks {
            let owner = &event.owner_id;
            // System items have no subscriber; admins already got the digest.
            if owner == SYSTEM_OWNER || self.config.is_admin(owner) {
                continue;
            }
            let Some(user) = self.store.get_user(owner).await? else {
                continue;
            };
            if !user.notifications_enabled || user.is_banned {
                stats.skipped_disabled += 1;
                continue;
            }

            if user.in_quiet_hours(now.hour() as u8) {
                if now - event.detected_at > ChronoDuration::hours(MAX_EVENT_AGE_HOURS) {
                    // Too old to still be news by the time the window opens.
                    self.store
                        .append_ledger(&LedgerEntry {
                            item_id: event.item_id.clone(),
                            recipient_id: owner.clone(),
                            sent_at: now,
                            kind: NotificationKind::SkippedStale,
                        })
                        .await?;
                    stats.dropped_stale += 1;
                } else {
                    stats.deferred_quiet_hours += 1;
                    deferred.push((*event).clone());
                }
                continue;
            }

            if self
                .in_cooldown(&event.item_id, owner, user.cooldown_seconds, now)
                .await?
            {
                debug!(item = %event.item_id, recipient = %owner, "Skipped: cooldown");
                stats.skipped_cooldown += 1;
                continue;
            }

            let since = now - ChronoDuration::hours(24);
            if self.store.deliveries_since(owner, since).await? >= user.daily_notify_limit {
                debug!(recipient = %owner, "Skipped: daily notification cap");
                stats.skipped_daily_cap += 1;
                continue;
            }

            match self.deliver(owner, &restock_message(event)).await {
                Ok(()) => {
                    stats.delivered += 1;
                    self.record_delivery(&LedgerEntry {
                        item_id: event.item_id.clone(),
                        recipient_id: owner.clone(),
                        sent_at: now,
                        kind: NotificationKind::Restock,
                    })
                    .await?;
                }
                Err(e) => {
                    stats.delivery_failed += 1;
                    warn!(recipient = %owner, error = %e, "Restock message dropped after retries");
                }
            }
        }

        Ok(deferred)
    }

    /// Outage and health events go to administrators only.
    async fn flush_admin_events(
        &self,
        events: &[&PendingEvent],
        kind: NotificationKind,
        now: DateTime<Utc>,
        stats: &mut FlushStats,
    ) -> Result<()> {
        for event in events {
            let body = match kind {
                NotificationKind::Outage => outage_message(event),
                _ => health_message(event),
            };
            for admin in &self.config.admin_ids {
                if self
                    .in_cooldown(&event.item_id, admin, self.config.cooldown_seconds, now)
                    .await?
                {
                    stats.skipped_cooldown += 1;
                    continue;
                }
                match self.deliver(admin, &body).await {
                    Ok(()) => {
                        stats.delivered += 1;
                        self.record_delivery(&LedgerEntry {
                            item_id: event.item_id.clone(),
                            recipient_id: admin.clone(),
                            sent_at: now,
                            kind,
                        })
                        .await?;
                    }
                    Err(e) => {
                        stats.delivery_failed += 1;
                        warn!(recipient = %admin, error = %e, "Admin event dropped after retries");
                    }
                }
            }
        }
        Ok(())
    }

    async fn in_cooldown(
        &self,
        item_id: &str,
        recipient: &str,
        cooldown_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let key = (item_id.to_string(), recipient.to_string());
        let cached = self.last_sent.lock().get(&key).copied();
        let last = match cached {
            Some(t) => Some(t),
            None => {
                let from_store = self.store.last_delivery_at(item_id, recipient).await?;
                if let Some(t) = from_store {
                    self.last_sent.lock().insert(key, t);
                }
                from_store
            }
        };
        let Some(last) = last else {
            return Ok(false);
        };
        Ok(now - last < ChronoDuration::seconds(cooldown_seconds as i64))
    }

    /// Append a delivered entry and keep the cooldown cache current.
    async fn record_delivery(&self, entry: &LedgerEntry) -> Result<()> {
        self.store.append_ledger(entry).await?;
        self.last_sent.lock().insert(
            (entry.item_id.clone(), entry.recipient_id.clone()),
            entry.sent_at,
        );
        Ok(())
    }

    /// Send with bounded retries. 5xx/429 and timeouts retry with
    /// exponential backoff; anything else fails fast.
    async fn deliver(&self, recipient: &str, body: &str) -> Result<(), SinkError> {
        let timeout = Duration::from_secs(self.config.delivery_timeout);
        let mut backoff = DELIVERY_BACKOFF_BASE;

        for attempt in 1..=DELIVERY_ATTEMPTS {
            let result = tokio::time::timeout(timeout, self.sink.send_text(recipient, body)).await;
            match result {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) if !e.is_retryable() => return Err(e),
                Ok(Err(e)) => {
                    warn!(recipient, attempt, error = %e, "Delivery failed, backing off");
                }
                Err(_) => {
                    warn!(recipient, attempt, "Delivery timed out, backing off");
                }
            }
            if attempt < DELIVERY_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(SinkError::Other(format!(
            "gave up after {} attempts",
            DELIVERY_ATTEMPTS
        )))
    }

    #[cfg(test)]
    pub(crate) fn push_event(&mut self, event: PendingEvent) {
        self.queue.push(event);
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }
}

fn restock_message(event: &PendingEvent) -> String {
    format!(
        "🎉 Restock: {}\n{}\nconfidence {:.0}%",
        event.item_name,
        event.item_url,
        event.confidence * 100.0
    )
}

fn digest_message(events: &[&PendingEvent], max_items: usize) -> String {
    let mut lines = vec![format!("📦 Restock digest: {} item(s) back in stock", events.len())];
    for event in events.iter().take(max_items) {
        lines.push(format!(
            "• {} — {} ({:.0}%)",
            event.item_name,
            event.item_url,
            event.confidence * 100.0
        ));
    }
    if events.len() > max_items {
        lines.push(format!("… and {} more", events.len() - max_items));
    }
    lines.join("\n")
}

fn outage_message(event: &PendingEvent) -> String {
    format!(
        "📉 Outage: {} looks out of stock again\n{}",
        event.item_name, event.item_url
    )
}

fn health_message(event: &PendingEvent) -> String {
    format!(
        "🚑 Auto-disabled after repeated check errors: {}\n{}",
        event.item_name, event.item_url
    )
}
