//! Monitor service
//!
//! The programmatic surface the bot front-end talks to. Everything here
//! is a thin orchestration over Catalog and Store; the only logic of its
//! own is permission checks for the admin operations.

use crate::catalog::{Catalog, CatalogError};
use crate::config::Config;
use crate::models::{Item, User, UserPrefs};
use crate::store::Store;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct MonitorService {
    store: Store,
    catalog: Catalog,
    config: Arc<Config>,
}

impl MonitorService {
    pub fn new(store: Store, config: Arc<Config>) -> Self {
        let catalog = Catalog::new(store.clone(), config.clone());
        Self {
            store,
            catalog,
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ── User surface ─────────────────────────────────────────────────

    pub async fn add_item(
        &self,
        user_id: &str,
        name: &str,
        url: &str,
        config_text: &str,
    ) -> Result<Item, CatalogError> {
        self.catalog.add_item(user_id, name, url, config_text).await
    }

    pub async fn remove_item(&self, user_id: &str, item_id: &str) -> Result<(), CatalogError> {
        self.catalog.remove_item(user_id, item_id).await
    }

    pub async fn list_items(
        &self,
        user_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Item>, CatalogError> {
        self.catalog.list_items(user_id, page, page_size).await
    }

    pub async fn set_user_prefs(
        &self,
        user_id: &str,
        prefs: &UserPrefs,
    ) -> Result<User, CatalogError> {
        if let Some(Some((start, end))) = prefs.quiet_hours {
            if start > 23 || end > 23 {
                return Err(CatalogError::InvalidInput(format!(
                    "quiet hours must be 0-23, got {}-{}",
                    start, end
                )));
            }
        }
        self.catalog.resolve_user(user_id).await?;
        self.store.set_user_prefs(user_id, prefs).await?;
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or(CatalogError::NotFound)?;
        Ok(user)
    }

    // ── Admin surface ────────────────────────────────────────────────

    async fn require_admin(&self, user_id: &str) -> Result<User, CatalogError> {
        let user = self.catalog.resolve_user(user_id).await?;
        if !user.is_admin {
            return Err(CatalogError::NotAdmin);
        }
        Ok(user)
    }

    pub async fn admin_list_all(
        &self,
        admin_id: &str,
        filter: Option<&str>,
    ) -> Result<Vec<Item>, CatalogError> {
        self.require_admin(admin_id).await?;
        Ok(self.store.list_all_items(filter).await?)
    }

    pub async fn admin_ban(
        &self,
        admin_id: &str,
        user_id: &str,
        banned: bool,
    ) -> Result<(), CatalogError> {
        self.require_admin(admin_id).await?;
        // Make sure the row exists so the ban sticks even for users we
        // have never seen.
        self.catalog.resolve_user(user_id).await?;
        self.store.set_user_banned(user_id, banned).await?;
        info!(admin = %admin_id, user = %user_id, banned, "🔨 Ban state changed");
        Ok(())
    }

    pub async fn admin_set_item_enabled(
        &self,
        admin_id: &str,
        item_id: &str,
        enabled: bool,
    ) -> Result<(), CatalogError> {
        self.require_admin(admin_id).await?;
        if !self.store.set_item_enabled(item_id, enabled).await? {
            return Err(CatalogError::NotFound);
        }
        info!(admin = %admin_id, item = %item_id, enabled, "Item enabled state changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> MonitorService {
        let store = Store::open_in_memory().unwrap();
        let config = Arc::new(Config {
            admin_ids: vec!["admin".into()],
            ..Config::default()
        });
        MonitorService::new(store, config)
    }

    #[tokio::test]
    async fn non_admin_cannot_use_admin_surface() {
        let svc = service();
        assert!(matches!(
            svc.admin_list_all("pleb", None).await.unwrap_err(),
            CatalogError::NotAdmin
        ));
        assert!(matches!(
            svc.admin_ban("pleb", "victim", true).await.unwrap_err(),
            CatalogError::NotAdmin
        ));
    }

    #[tokio::test]
    async fn admin_can_disable_any_item() {
        let svc = service();
        let item = svc
            .add_item("u1", "plan", "https://example.com/vps", "")
            .await
            .unwrap();

        svc.admin_set_item_enabled("admin", &item.item_id, false)
            .await
            .unwrap();
        let items = svc.admin_list_all("admin", None).await.unwrap();
        assert!(!items[0].enabled);

        assert!(matches!(
            svc.admin_set_item_enabled("admin", "nope", false)
                .await
                .unwrap_err(),
            CatalogError::NotFound
        ));
    }

    #[tokio::test]
    async fn banned_user_blocked_from_adding() {
        let svc = service();
        svc.admin_ban("admin", "u1", true).await.unwrap();
        assert!(matches!(
            svc.add_item("u1", "x", "https://example.com/a", "")
                .await
                .unwrap_err(),
            CatalogError::Banned
        ));

        svc.admin_ban("admin", "u1", false).await.unwrap();
        svc.add_item("u1", "x", "https://example.com/a", "")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn prefs_validation_rejects_bad_hours() {
        let svc = service();
        let err = svc
            .set_user_prefs(
                "u1",
                &UserPrefs {
                    quiet_hours: Some(Some((25, 7))),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn prefs_roundtrip_through_service() {
        let svc = service();
        let user = svc
            .set_user_prefs(
                "u1",
                &UserPrefs {
                    cooldown_seconds: Some(900),
                    quiet_hours: Some(Some((23, 7))),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(user.cooldown_seconds, 900);
        assert_eq!(user.quiet_start, Some(23));
    }
}
