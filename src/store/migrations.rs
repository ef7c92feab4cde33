//! Numbered schema migrations
//!
//! Applied in order on startup, tracked through `PRAGMA user_version`.
//! A database written by a newer binary refuses to open: running old code
//! against a newer schema is how ledgers get corrupted.

use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use tracing::info;

/// Ordered migration scripts. Index 0 is version 1.
const MIGRATIONS: &[&str] = &[
    // v1: core tables.
    r#"
    CREATE TABLE items (
        item_id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        is_global INTEGER NOT NULL DEFAULT 0,
        name TEXT NOT NULL,
        url TEXT NOT NULL UNIQUE,
        vendor_tag TEXT,
        config_text TEXT NOT NULL DEFAULT '',
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL,
        last_checked_at INTEGER,
        last_status TEXT NOT NULL DEFAULT 'unknown',
        last_confidence REAL NOT NULL DEFAULT 0,
        consecutive_error_count INTEGER NOT NULL DEFAULT 0,
        fingerprint_hash TEXT
    );

    CREATE INDEX idx_items_due ON items(enabled, last_checked_at);
    CREATE INDEX idx_items_owner ON items(owner_id, created_at DESC);

    CREATE TABLE check_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        item_id TEXT NOT NULL REFERENCES items(item_id) ON DELETE CASCADE,
        check_time INTEGER NOT NULL,
        verdict TEXT NOT NULL,
        confidence REAL NOT NULL,
        detector_report TEXT NOT NULL DEFAULT '[]',
        http_status INTEGER,
        latency_ms INTEGER NOT NULL DEFAULT 0,
        error_kind TEXT,
        error_message TEXT,
        fingerprint_hash TEXT
    );

    CREATE INDEX idx_check_history_item_time
        ON check_history(item_id, check_time DESC);
    CREATE INDEX idx_check_history_time ON check_history(check_time);

    CREATE TABLE users (
        user_id TEXT PRIMARY KEY,
        is_admin INTEGER NOT NULL DEFAULT 0,
        is_banned INTEGER NOT NULL DEFAULT 0,
        daily_added_count INTEGER NOT NULL DEFAULT 0,
        daily_window_start INTEGER NOT NULL,
        cooldown_seconds INTEGER NOT NULL DEFAULT 600,
        daily_notify_limit INTEGER NOT NULL DEFAULT 20,
        quiet_start INTEGER,
        quiet_end INTEGER,
        notifications_enabled INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE notification_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        item_id TEXT NOT NULL,
        recipient_id TEXT NOT NULL,
        sent_at INTEGER NOT NULL,
        kind TEXT NOT NULL
    );

    CREATE INDEX idx_notification_pair
        ON notification_history(item_id, recipient_id, sent_at DESC);
    CREATE INDEX idx_notification_recipient
        ON notification_history(recipient_id, sent_at DESC);
    "#,
    // v2: API-probe endpoint memo and restart-safe poll deferral.
    r#"
    ALTER TABLE items ADD COLUMN api_endpoint TEXT;
    ALTER TABLE items ADD COLUMN next_poll_not_before INTEGER;
    "#,
];

/// Latest schema version this binary understands.
pub fn latest_version() -> u32 {
    MIGRATIONS.len() as u32
}

fn user_version(conn: &Connection) -> Result<u32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get::<_, u32>(0))
        .context("read user_version")
}

/// Bring the database up to the latest schema. Refuses databases from the
/// future. Each migration runs in its own transaction.
pub fn apply(conn: &mut Connection) -> Result<u32> {
    let current = user_version(conn)?;
    let latest = latest_version();

    if current > latest {
        bail!(
            "database schema version {} is newer than this binary supports ({}); \
             refusing to start",
            current,
            latest
        );
    }

    for version in (current + 1)..=latest {
        let sql = MIGRATIONS[(version - 1) as usize];
        let tx = conn
            .transaction()
            .with_context(|| format!("begin migration {}", version))?;
        tx.execute_batch(sql)
            .with_context(|| format!("apply migration {}", version))?;
        tx.pragma_update(None, "user_version", version)
            .with_context(|| format!("stamp migration {}", version))?;
        tx.commit()
            .with_context(|| format!("commit migration {}", version))?;
        info!("📦 Applied schema migration v{}", version);
    }

    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_all_from_empty() {
        let mut conn = Connection::open_in_memory().unwrap();
        let v = apply(&mut conn).unwrap();
        assert_eq!(v, latest_version());
        assert_eq!(user_version(&conn).unwrap(), latest_version());

        // Tables exist and the v2 columns are present.
        conn.execute(
            "INSERT INTO items (item_id, owner_id, name, url, created_at, api_endpoint)
             VALUES ('i1', 'u1', 'x', 'https://a/b', 0, 'https://a/api')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn reapply_is_noop() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply(&mut conn).unwrap();
        apply(&mut conn).unwrap();
        assert_eq!(user_version(&conn).unwrap(), latest_version());
    }

    #[test]
    fn refuses_future_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", latest_version() + 1)
            .unwrap();
        let err = apply(&mut conn).unwrap_err();
        assert!(err.to_string().contains("refusing to start"));
    }
}
