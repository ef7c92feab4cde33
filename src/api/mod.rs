//! Bot-facing JSON API
//!
//! The conversational front-end lives in another process and talks to
//! the core over this surface. Handlers map 1:1 onto `MonitorService`
//! operations; the interesting part is the error mapping, which must be
//! discrete enough for the bot to phrase a human answer.

pub mod routes;

use crate::models::CheckRecord;
use crate::service::MonitorService;
use crate::store::Store;
use std::sync::Arc;

#[derive(Clone)]
pub struct ApiState {
    pub service: MonitorService,
    pub store: Store,
    /// One-shot check hook so the API can trigger a diagnostic poll.
    pub oneshot: Arc<dyn OneShotCheck>,
}

/// The API's view of the scheduler's diagnostic poll capability.
#[async_trait::async_trait]
pub trait OneShotCheck: Send + Sync {
    async fn check_now(&self, item_id: &str) -> anyhow::Result<Option<CheckRecord>>;
}
