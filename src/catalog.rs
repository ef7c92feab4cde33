//! Catalog: admission-time checks over the store
//!
//! Thin façade that owns everything that can reject an item before it is
//! persisted: URL canonicalisation, duplicate detection, per-user daily
//! quotas, ban checks, vendor-tag inference. Scheduling never consults
//! the catalog; once a row exists the scheduler owns it.

use crate::config::Config;
use crate::models::{Item, NewItem, User, SYSTEM_OWNER};
use crate::store::Store;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use url::Url;

/// Admission errors surfaced to the caller. Everything else is engine
/// trouble and stays opaque.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("url is already monitored")]
    DuplicateUrl,
    #[error("daily add quota exceeded, resets at {reset_at}")]
    QuotaExceeded { reset_at: DateTime<Utc> },
    #[error("user is banned")]
    Banned,
    #[error("item not found")]
    NotFound,
    #[error("item belongs to another user")]
    NotOwner,
    #[error("admin privileges required")]
    NotAdmin,
    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

/// Query-param keys stripped during canonicalisation. `utm_` is a prefix
/// match, the rest are exact.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "msclkid", "ref", "aff", "aff_id"];

/// Canonical form: lowercase scheme and host, tracking params stripped,
/// fragment dropped, trailing slash normalised. Idempotent.
pub fn canonicalise_url(raw: &str) -> Result<String, CatalogError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CatalogError::InvalidUrl("empty url".into()));
    }

    let mut parsed =
        Url::parse(trimmed).map_err(|e| CatalogError::InvalidUrl(format!("{}: {}", trimmed, e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(CatalogError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                other
            )))
        }
    }
    if parsed.host_str().is_none() {
        return Err(CatalogError::InvalidUrl("missing host".into()));
    }

    parsed.set_fragment(None);

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| {
            let k = k.to_ascii_lowercase();
            !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        let query = kept
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{}={}", k, v)
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        parsed.set_query(Some(&query));
    }

    // Trailing slash: the root path keeps its '/', deeper paths lose it.
    let path = parsed.path().to_string();
    if path != "/" && path.ends_with('/') {
        parsed.set_path(path.trim_end_matches('/'));
    }

    Ok(parsed.to_string())
}

/// Suffix-match the item host against the configured host→tag table.
pub fn infer_vendor_tag(host: &str, table: &HashMap<String, String>) -> Option<String> {
    let host = host.to_ascii_lowercase();
    table
        .iter()
        .filter(|(suffix, _)| {
            host == **suffix || host.ends_with(&format!(".{}", suffix))
        })
        // Longest suffix wins so "eu.bwh81.net" prefers the most specific rule.
        .max_by_key(|(suffix, _)| suffix.len())
        .map(|(_, tag)| tag.clone())
}

#[derive(Clone)]
pub struct Catalog {
    store: Store,
    config: Arc<Config>,
}

impl Catalog {
    pub fn new(store: Store, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    /// Resolve the caller, creating the user row on first contact.
    pub async fn resolve_user(&self, user_id: &str) -> Result<User, CatalogError> {
        let user = self
            .store
            .ensure_user(
                user_id,
                self.config.is_admin(user_id),
                self.config.cooldown_seconds,
                self.config.daily_notify_limit,
                Utc::now(),
            )
            .await?;
        Ok(user)
    }

    /// Full admission pipeline. Admins bypass the daily quota; nobody
    /// bypasses canonicalisation or dedup.
    pub async fn add_item(
        &self,
        user_id: &str,
        name: &str,
        url: &str,
        config_text: &str,
    ) -> Result<Item, CatalogError> {
        let user = self.resolve_user(user_id).await?;
        if user.is_banned {
            return Err(CatalogError::Banned);
        }

        let canonical = canonicalise_url(url)?;

        if self.store.find_by_url(&canonical).await?.is_some() {
            return Err(CatalogError::DuplicateUrl);
        }

        let now = Utc::now();
        let (count, window_start) = rolled_window(&user, now);
        if !user.is_admin && count >= self.config.daily_add_limit {
            return Err(CatalogError::QuotaExceeded {
                reset_at: window_start + Duration::hours(24),
            });
        }

        let host = Url::parse(&canonical)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_default();
        let vendor_tag = infer_vendor_tag(&host, &self.config.vendor_tags);

        let is_system = user_id == SYSTEM_OWNER;
        let item = self
            .store
            .insert_item(
                &NewItem {
                    owner_id: user_id.to_string(),
                    is_global: is_system,
                    name: name.trim().to_string(),
                    url: canonical,
                    vendor_tag,
                    config_text: config_text.to_string(),
                },
                now,
            )
            .await?;

        self.store
            .set_daily_added(user_id, count + 1, window_start)
            .await?;

        info!(
            item_id = %item.item_id,
            owner = %user_id,
            vendor = item.vendor_tag.as_deref().unwrap_or("-"),
            "➕ Item admitted: {}",
            item.url
        );
        Ok(item)
    }

    /// Owners remove their own items; admins remove anything.
    pub async fn remove_item(&self, user_id: &str, item_id: &str) -> Result<(), CatalogError> {
        let user = self.resolve_user(user_id).await?;
        let item = self
            .store
            .get_item(item_id)
            .await?
            .ok_or(CatalogError::NotFound)?;

        if item.owner_id != user_id && !user.is_admin {
            return Err(CatalogError::NotOwner);
        }

        self.store.delete_item(item_id).await?;
        info!(item_id = %item_id, by = %user_id, "➖ Item removed");
        Ok(())
    }

    pub async fn list_items(
        &self,
        user_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Item>, CatalogError> {
        let page_size = page_size.clamp(1, 100);
        Ok(self.store.list_items_for(user_id, page, page_size).await?)
    }
}

/// Roll the daily window forward when it has aged out. Returns the count
/// and window start that admission arithmetic should use.
fn rolled_window(user: &User, now: DateTime<Utc>) -> (u32, DateTime<Utc>) {
    if now - user.daily_window_start >= Duration::hours(24) {
        (0, now)
    } else {
        (user.daily_added_count, user.daily_window_start)
    }
}
