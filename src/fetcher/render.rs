//! Headless render pool
//!
//! The render engine itself is pluggable: anything that can turn a URL
//! into post-JavaScript HTML satisfies `Renderer`. The pool owns the
//! scarce part: browser instances are leased through a semaphore capped
//! at `max_browsers`, and every render runs under the fetch deadline.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Fetch `url` in a real browser context and return the rendered HTML.
    async fn render(&self, url: &str) -> Result<String>;
}

pub struct RenderPool {
    engine: Option<Arc<dyn Renderer>>,
    leases: Arc<Semaphore>,
    timeout: Duration,
    warned_missing_engine: AtomicBool,
}

impl RenderPool {
    pub fn new(engine: Arc<dyn Renderer>, max_browsers: usize, timeout: Duration) -> Self {
        Self {
            engine: Some(engine),
            leases: Arc::new(Semaphore::new(max_browsers.max(1))),
            timeout,
            warned_missing_engine: AtomicBool::new(false),
        }
    }

    /// Pool that never renders. Used when `enable_render` is off.
    pub fn disabled() -> Self {
        Self {
            engine: None,
            leases: Arc::new(Semaphore::new(1)),
            timeout: Duration::from_secs(30),
            warned_missing_engine: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.engine.is_some()
    }

    /// Lease a browser and render. Returns `None` when rendering is off,
    /// no engine is bound, the lease or page load times out, or the
    /// engine fails — the caller falls back to the raw body.
    pub async fn render(&self, url: &str) -> Option<String> {
        let engine = match &self.engine {
            Some(e) => e.clone(),
            None => {
                if !self.warned_missing_engine.swap(true, Ordering::Relaxed) {
                    warn!("Render requested but no render engine is bound; serving raw bodies");
                }
                return None;
            }
        };

        let _lease = match tokio::time::timeout(self.timeout, self.leases.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                warn!(url, "Render lease unavailable within deadline");
                return None;
            }
        };

        match tokio::time::timeout(self.timeout, engine.render(url)).await {
            Ok(Ok(html)) => Some(html),
            Ok(Err(e)) => {
                warn!(url, error = %e, "Render failed");
                None
            }
            Err(_) => {
                warn!(url, "Render timed out");
                None
            }
        }
    }
}
