//! Durable state store
//!
//! Single SQLite database behind one serialized connection: items,
//! per-item check history, users, and the notification ledger. Every
//! other component reads through typed accessors and mutates only
//! through the named operations here; nothing else touches SQL.
//!
//! The tokio mutex serialises access; WAL mode keeps the occasional
//! outside reader (sqlite3 shell, backups) from blocking on writes.
//! `record_check` is the one multi-table write and runs in a single
//! transaction so a crash can never leave an item's `last_*` fields
//! disagreeing with its history.

pub mod migrations;

use crate::models::{
    CheckRecord, DetectorReportEntry, FetchErrorKind, Item, ItemStatus, LedgerEntry, NewItem,
    User, UserPrefs, Verdict,
};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn dt(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

impl Store {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open database {}", db_path))?;
        Self::init(conn)
    }

    /// Scratch database for tests and one-shot diagnostics.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory database")?)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("enable foreign keys")?;

        let version = migrations::apply(&mut conn)?;
        debug!("Store ready at schema v{}", version);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ── Items ────────────────────────────────────────────────────────

    /// Insert a new item. The caller (Catalog) has already canonicalised
    /// the URL and cleared admission checks; the UNIQUE index on `url`
    /// backstops races.
    pub async fn insert_item(&self, new: &NewItem, now: DateTime<Utc>) -> Result<Item> {
        let item_id = Uuid::new_v4().to_string();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO items (item_id, owner_id, is_global, name, url, vendor_tag,
                                config_text, enabled, created_at, last_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, 'unknown')",
            params![
                item_id,
                new.owner_id,
                new.is_global as i64,
                new.name,
                new.url,
                new.vendor_tag,
                new.config_text,
                ts(now),
            ],
        )
        .context("insert item")?;
        drop(conn);

        self.get_item(&item_id)
            .await?
            .context("read back inserted item")
    }

    pub async fn get_item(&self, item_id: &str) -> Result<Option<Item>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {} FROM items WHERE item_id = ?1", ITEM_COLUMNS),
            params![item_id],
            row_to_item,
        )
        .optional()
        .context("get item")
    }

    pub async fn find_by_url(&self, canonical_url: &str) -> Result<Option<Item>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {} FROM items WHERE url = ?1", ITEM_COLUMNS),
            params![canonical_url],
            row_to_item,
        )
        .optional()
        .context("find item by url")
    }

    /// Items visible to a user: their own plus globals. Newest first.
    pub async fn list_items_for(
        &self,
        user_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Item>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM items
             WHERE owner_id = ?1 OR is_global = 1
             ORDER BY created_at DESC, item_id
             LIMIT ?2 OFFSET ?3",
            ITEM_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![user_id, page_size, page.saturating_mul(page_size)],
                row_to_item,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list items")?;
        Ok(rows)
    }

    /// Full catalog, optionally filtered by a substring over name, url
    /// and vendor tag. Admin surface.
    pub async fn list_all_items(&self, filter: Option<&str>) -> Result<Vec<Item>> {
        let conn = self.conn.lock().await;
        let rows = match filter {
            Some(f) if !f.trim().is_empty() => {
                let needle = format!("%{}%", f.trim());
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM items
                     WHERE name LIKE ?1 OR url LIKE ?1 OR IFNULL(vendor_tag, '') LIKE ?1
                     ORDER BY created_at DESC",
                    ITEM_COLUMNS
                ))?;
                let result = stmt
                    .query_map(params![needle], row_to_item)?
                    .collect::<rusqlite::Result<Vec<_>>>();
                result
            }
            _ => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM items ORDER BY created_at DESC",
                    ITEM_COLUMNS
                ))?;
                let result = stmt
                    .query_map([], row_to_item)?
                    .collect::<rusqlite::Result<Vec<_>>>();
                result
            }
        }
        .context("list all items")?;
        Ok(rows)
    }

    /// Delete an item; history cascades, and any queued events for it are
    /// dropped by the aggregator when it finds the item gone.
    pub async fn delete_item(&self, item_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute("DELETE FROM items WHERE item_id = ?1", params![item_id])
            .context("delete item")?;
        Ok(n > 0)
    }

    /// Enable or disable scheduling. Disabling freezes polling but keeps
    /// the item and its history.
    pub async fn set_item_enabled(&self, item_id: &str, enabled: bool) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute(
                "UPDATE items SET enabled = ?2 WHERE item_id = ?1",
                params![item_id, enabled as i64],
            )
            .context("set item enabled")?;
        Ok(n > 0)
    }

    /// Enabled items whose last check is at least `min_interval` seconds
    /// old (never-checked counts as infinitely stale) and whose blocked
    /// deferral has passed. Oldest first, deterministic tie-break.
    pub async fn list_due_items(
        &self,
        now: DateTime<Utc>,
        min_interval_secs: u64,
        limit: u32,
    ) -> Result<Vec<Item>> {
        let cutoff = ts(now) - min_interval_secs as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM items
             WHERE enabled = 1
               AND (last_checked_at IS NULL OR last_checked_at <= ?1)
               AND (next_poll_not_before IS NULL OR next_poll_not_before <= ?2)
             ORDER BY IFNULL(last_checked_at, 0) ASC, item_id ASC
             LIMIT ?3",
            ITEM_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![cutoff, ts(now), limit], row_to_item)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list due items")?;
        Ok(rows)
    }

    /// Append the check record and fold its outcome into the item row in
    /// one transaction. Returns the item's new consecutive error count.
    pub async fn record_check(
        &self,
        record: &CheckRecord,
        new_status: ItemStatus,
        defer_until: Option<DateTime<Utc>>,
        discovered_endpoint: Option<&str>,
    ) -> Result<u32> {
        let report_json =
            serde_json::to_string(&record.detector_report).context("encode detector report")?;

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("begin record_check")?;

        tx.execute(
            "INSERT INTO check_history (item_id, check_time, verdict, confidence,
                                        detector_report, http_status, latency_ms,
                                        error_kind, error_message, fingerprint_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.item_id,
                ts(record.check_time),
                record.verdict.as_str(),
                record.confidence,
                report_json,
                record.http_status,
                record.latency_ms as i64,
                record.error_kind.map(|k| k.as_str()),
                record.error_message,
                record.fingerprint_hash,
            ],
        )
        .context("append check record")?;

        let prev_errors: u32 = tx
            .query_row(
                "SELECT consecutive_error_count FROM items WHERE item_id = ?1",
                params![record.item_id],
                |row| row.get(0),
            )
            .context("read error count")?;
        let errors = if record.error_kind.is_some() {
            prev_errors + 1
        } else {
            0
        };

        tx.execute(
            "UPDATE items SET
                last_checked_at = ?2,
                last_status = ?3,
                last_confidence = ?4,
                consecutive_error_count = ?5,
                fingerprint_hash = COALESCE(?6, fingerprint_hash),
                api_endpoint = COALESCE(?7, api_endpoint),
                next_poll_not_before = ?8
             WHERE item_id = ?1",
            params![
                record.item_id,
                ts(record.check_time),
                new_status.as_str(),
                record.confidence,
                errors,
                record.fingerprint_hash,
                discovered_endpoint,
                defer_until.map(ts),
            ],
        )
        .context("fold check into item")?;

        tx.commit().context("commit record_check")?;
        Ok(errors)
    }

    /// Last `limit` records for an item, newest first.
    pub async fn recent_history(&self, item_id: &str, limit: u32) -> Result<Vec<CheckRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT item_id, check_time, verdict, confidence, detector_report,
                    http_status, latency_ms, error_kind, error_message, fingerprint_hash
             FROM check_history
             WHERE item_id = ?1
             ORDER BY check_time DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![item_id, limit], row_to_check_record)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("recent history")?;
        Ok(rows)
    }

    /// Delete history older than `before`, always preserving the newest
    /// `keep_per_item` records of every item. Bounded by `cap` rows per
    /// call to keep the write short.
    pub async fn prune_history(
        &self,
        before: DateTime<Utc>,
        keep_per_item: u32,
        cap: u32,
    ) -> Result<usize> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute(
                "DELETE FROM check_history WHERE id IN (
                    SELECT id FROM (
                        SELECT id, check_time,
                               ROW_NUMBER() OVER (
                                   PARTITION BY item_id
                                   ORDER BY check_time DESC, id DESC
                               ) AS rn
                        FROM check_history
                    )
                    WHERE rn > ?1 AND check_time < ?2
                    LIMIT ?3
                )",
                params![keep_per_item, ts(before), cap],
            )
            .context("prune history")?;
        if n > 0 {
            info!("🧹 Pruned {} check records", n);
        }
        Ok(n)
    }

    /// Ledger rows older than `before`; same bounded-delete contract.
    pub async fn prune_ledger(&self, before: DateTime<Utc>, cap: u32) -> Result<usize> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute(
                "DELETE FROM notification_history WHERE id IN (
                    SELECT id FROM notification_history WHERE sent_at < ?1 LIMIT ?2
                )",
                params![ts(before), cap],
            )
            .context("prune ledger")?;
        Ok(n)
    }

    // ── Users ────────────────────────────────────────────────────────

    /// Create the user row on first contact; keep the admin flag synced
    /// with configuration on every call.
    pub async fn ensure_user(
        &self,
        user_id: &str,
        is_admin: bool,
        default_cooldown: u64,
        default_daily_limit: u32,
        now: DateTime<Utc>,
    ) -> Result<User> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO users
                (user_id, is_admin, daily_window_start, cooldown_seconds, daily_notify_limit)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user_id,
                is_admin as i64,
                ts(now),
                default_cooldown as i64,
                default_daily_limit,
            ],
        )
        .context("ensure user")?;
        conn.execute(
            "UPDATE users SET is_admin = ?2 WHERE user_id = ?1",
            params![user_id, is_admin as i64],
        )
        .context("sync admin flag")?;
        conn.query_row(
            &format!("SELECT {} FROM users WHERE user_id = ?1", USER_COLUMNS),
            params![user_id],
            row_to_user,
        )
        .context("read user")
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {} FROM users WHERE user_id = ?1", USER_COLUMNS),
            params![user_id],
            row_to_user,
        )
        .optional()
        .context("get user")
    }

    pub async fn list_admins(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM users WHERE is_admin = 1",
            USER_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], row_to_user)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list admins")?;
        Ok(rows)
    }

    pub async fn set_user_prefs(&self, user_id: &str, prefs: &UserPrefs) -> Result<bool> {
        let conn = self.conn.lock().await;
        let mut changed = 0;
        if let Some(cooldown) = prefs.cooldown_seconds {
            changed += conn.execute(
                "UPDATE users SET cooldown_seconds = ?2 WHERE user_id = ?1",
                params![user_id, cooldown as i64],
            )?;
        }
        if let Some(limit) = prefs.daily_notify_limit {
            changed += conn.execute(
                "UPDATE users SET daily_notify_limit = ?2 WHERE user_id = ?1",
                params![user_id, limit],
            )?;
        }
        if let Some(quiet) = prefs.quiet_hours {
            let (start, end) = match quiet {
                Some((s, e)) => (Some(s as i64), Some(e as i64)),
                None => (None, None),
            };
            changed += conn.execute(
                "UPDATE users SET quiet_start = ?2, quiet_end = ?3 WHERE user_id = ?1",
                params![user_id, start, end],
            )?;
        }
        if let Some(enabled) = prefs.notifications_enabled {
            changed += conn.execute(
                "UPDATE users SET notifications_enabled = ?2 WHERE user_id = ?1",
                params![user_id, enabled as i64],
            )?;
        }
        Ok(changed > 0)
    }

    pub async fn set_user_banned(&self, user_id: &str, banned: bool) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute(
                "UPDATE users SET is_banned = ?2 WHERE user_id = ?1",
                params![user_id, banned as i64],
            )
            .context("set user banned")?;
        Ok(n > 0)
    }

    /// Overwrite the user's daily-add counter and window start. The
    /// Catalog owns the rolling-window arithmetic.
    pub async fn set_daily_added(
        &self,
        user_id: &str,
        count: u32,
        window_start: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE users SET daily_added_count = ?2, daily_window_start = ?3
             WHERE user_id = ?1",
            params![user_id, count, ts(window_start)],
        )
        .context("set daily added")?;
        Ok(())
    }

    // ── Notification ledger ──────────────────────────────────────────

    pub async fn append_ledger(&self, entry: &LedgerEntry) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO notification_history (item_id, recipient_id, sent_at, kind)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.item_id,
                entry.recipient_id,
                ts(entry.sent_at),
                entry.kind.as_str(),
            ],
        )
        .context("append ledger")?;
        Ok(())
    }

    /// Most recent delivered (non-skip) ledger entry for a pair.
    pub async fn last_delivery_at(
        &self,
        item_id: &str,
        recipient_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().await;
        let row: Option<i64> = conn
            .query_row(
                "SELECT sent_at FROM notification_history
                 WHERE item_id = ?1 AND recipient_id = ?2 AND kind != 'skipped_stale'
                 ORDER BY sent_at DESC LIMIT 1",
                params![item_id, recipient_id],
                |row| row.get(0),
            )
            .optional()
            .context("last delivery")?;
        Ok(row.map(dt))
    }

    /// Count of delivered notifications for a recipient since `since`.
    pub async fn deliveries_since(
        &self,
        recipient_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM notification_history
             WHERE recipient_id = ?1 AND sent_at >= ?2 AND kind != 'skipped_stale'",
            params![recipient_id, ts(since)],
            |row| row.get(0),
        )
        .context("deliveries since")
    }

    // ── Stats ────────────────────────────────────────────────────────

    pub async fn item_count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
            .context("item count")
    }

    pub async fn history_count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT COUNT(*) FROM check_history", [], |row| row.get(0))
            .context("history count")
    }

    pub async fn optimize(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch("PRAGMA optimize;").context("optimize")?;
        Ok(())
    }
}

const ITEM_COLUMNS: &str = "item_id, owner_id, is_global, name, url, vendor_tag, config_text, \
     enabled, created_at, last_checked_at, last_status, last_confidence, \
     consecutive_error_count, fingerprint_hash, api_endpoint, next_poll_not_before";

const USER_COLUMNS: &str = "user_id, is_admin, is_banned, daily_added_count, daily_window_start, \
     cooldown_seconds, daily_notify_limit, quiet_start, quiet_end, notifications_enabled";

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<Item> {
    Ok(Item {
        item_id: row.get(0)?,
        owner_id: row.get(1)?,
        is_global: row.get::<_, i64>(2)? != 0,
        name: row.get(3)?,
        url: row.get(4)?,
        vendor_tag: row.get(5)?,
        config_text: row.get(6)?,
        enabled: row.get::<_, i64>(7)? != 0,
        created_at: dt(row.get(8)?),
        last_checked_at: row.get::<_, Option<i64>>(9)?.map(dt),
        last_status: ItemStatus::parse(&row.get::<_, String>(10)?),
        last_confidence: row.get(11)?,
        consecutive_error_count: row.get(12)?,
        fingerprint_hash: row.get(13)?,
        api_endpoint: row.get(14)?,
        next_poll_not_before: row.get::<_, Option<i64>>(15)?.map(dt),
    })
}

fn row_to_check_record(row: &Row<'_>) -> rusqlite::Result<CheckRecord> {
    let report: Vec<DetectorReportEntry> =
        serde_json::from_str(&row.get::<_, String>(4)?).unwrap_or_default();
    Ok(CheckRecord {
        item_id: row.get(0)?,
        check_time: dt(row.get(1)?),
        verdict: Verdict::parse(&row.get::<_, String>(2)?),
        confidence: row.get(3)?,
        detector_report: report,
        http_status: row.get(5)?,
        latency_ms: row.get::<_, i64>(6)? as u64,
        error_kind: row
            .get::<_, Option<String>>(7)?
            .as_deref()
            .and_then(FetchErrorKind::parse),
        error_message: row.get(8)?,
        fingerprint_hash: row.get(9)?,
    })
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        user_id: row.get(0)?,
        is_admin: row.get::<_, i64>(1)? != 0,
        is_banned: row.get::<_, i64>(2)? != 0,
        daily_added_count: row.get(3)?,
        daily_window_start: dt(row.get(4)?),
        cooldown_seconds: row.get::<_, i64>(5)? as u64,
        daily_notify_limit: row.get(6)?,
        quiet_start: row.get::<_, Option<i64>>(7)?.map(|v| v as u8),
        quiet_end: row.get::<_, Option<i64>>(8)?.map(|v| v as u8),
        notifications_enabled: row.get::<_, i64>(9)? != 0,
    })
}
