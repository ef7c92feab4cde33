//! Page fetcher
//!
//! Mission: get a usable body out of hostile sale pages. Strategy 1 is a
//! challenge-aware plain GET with a rotating user-agent pool; strategy 2
//! leases a headless browser when the raw body is too thin or carries a
//! known anti-bot interstitial. Failures never escape as errors — they
//! come back as a `FetchResult` with an `error_kind`, and the scheduler
//! decides what retries.

pub mod host_politeness;
pub mod render;

use crate::models::FetchErrorKind;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use regex::Regex;
use render::RenderPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Browser-looking user agents rotated per request. Anti-bot layers key
/// on static agents faster than on anything else.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:126.0) Gecko/20100101 Firefox/126.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:126.0) Gecko/20100101 Firefox/126.0",
];

/// Bodies smaller than this are assumed to be interstitials or stubs and
/// escalate to a rendered fetch when one is available.
const MIN_USEFUL_BODY_BYTES: usize = 512;

/// One fetch outcome. `error_kind = None` means a usable 2xx body.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub final_url: String,
    pub http_status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub raw_body: String,
    pub rendered_body: Option<String>,
    pub latency_ms: u64,
    pub error_kind: Option<FetchErrorKind>,
    pub error_message: Option<String>,
}

impl FetchResult {
    pub fn failure(url: &str, kind: FetchErrorKind, message: String, latency_ms: u64) -> Self {
        Self {
            final_url: url.to_string(),
            http_status: None,
            headers: Vec::new(),
            raw_body: String::new(),
            rendered_body: None,
            latency_ms,
            error_kind: Some(kind),
            error_message: Some(message),
        }
    }

    pub fn is_usable(&self) -> bool {
        self.error_kind.is_none() && !self.raw_body.is_empty()
    }

    /// Rendered body when present, else the raw one.
    pub fn best_body(&self) -> &str {
        self.rendered_body.as_deref().unwrap_or(&self.raw_body)
    }
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> FetchResult;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    render_pool: Arc<RenderPool>,
    challenge_markers: Regex,
}

impl HttpFetcher {
    pub fn new(fetch_timeout: Duration, render_pool: Arc<RenderPool>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        // Cloudflare / DDoS-Guard / generic JS-challenge fingerprints.
        let challenge_markers = Regex::new(
            r"(?i)(cf-browser-verification|__cf_chl_|just a moment|checking your browser|ddos-guard|attention required|cf_chl_opt|challenge-platform)",
        )
        .expect("static regex");

        Ok(Self {
            client,
            render_pool,
            challenge_markers,
        })
    }

    fn pick_user_agent() -> &'static str {
        USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0])
    }

    fn looks_like_challenge(&self, body: &str) -> bool {
        self.challenge_markers.is_match(body)
    }

    async fn plain_get(&self, url: &str) -> FetchResult {
        let started = Instant::now();
        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, Self::pick_user_agent())
            .header(
                reqwest::header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                let latency = started.elapsed().as_millis() as u64;
                let (kind, msg) = classify_transport_error(&e);
                return FetchResult::failure(url, kind, msg, latency);
            }
        };

        let status = response.status();
        let final_url = response.url().to_string();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();

        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                let latency = started.elapsed().as_millis() as u64;
                let mut out = FetchResult::failure(
                    &final_url,
                    FetchErrorKind::Decode,
                    format!("body decode failed: {}", e),
                    latency,
                );
                out.http_status = Some(status.as_u16());
                out.headers = headers;
                return out;
            }
        };

        let latency = started.elapsed().as_millis() as u64;
        let mut result = FetchResult {
            final_url,
            http_status: Some(status.as_u16()),
            headers,
            raw_body: body,
            rendered_body: None,
            latency_ms: latency,
            error_kind: None,
            error_message: None,
        };

        if status.is_success() {
            if result.raw_body.trim().is_empty() {
                result.error_kind = Some(FetchErrorKind::Decode);
                result.error_message = Some("empty 2xx body".into());
            }
            return result;
        }

        // 403/503 are the classic anti-bot front doors. With a challenge
        // marker (or no body at all) they are a block, not a server fault.
        let code = status.as_u16();
        if (code == 403 || code == 503)
            && (self.looks_like_challenge(&result.raw_body) || result.raw_body.trim().is_empty())
        {
            result.error_kind = Some(FetchErrorKind::Blocked);
            result.error_message = Some(format!("anti-bot challenge (HTTP {})", code));
        } else {
            result.error_kind = Some(FetchErrorKind::ServerError);
            result.error_message = Some(format!("HTTP {}", code));
        }
        result
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> FetchResult {
        let mut result = self.plain_get(url).await;

        // Strategy 2: a rendered pass when the page needs a real browser.
        let wants_render = match result.error_kind {
            None => {
                result.raw_body.len() < MIN_USEFUL_BODY_BYTES
                    || self.looks_like_challenge(&result.raw_body)
            }
            Some(FetchErrorKind::Blocked) => true,
            _ => false,
        };

        if wants_render && self.render_pool.is_enabled() {
            debug!(url, "Escalating to rendered fetch");
            let started = Instant::now();
            if let Some(html) = self.render_pool.render(url).await {
                result.latency_ms += started.elapsed().as_millis() as u64;
                if !html.trim().is_empty() {
                    // A successful render clears a block: we got a real page.
                    if result.error_kind == Some(FetchErrorKind::Blocked) {
                        result.error_kind = None;
                        result.error_message = None;
                        result.http_status = Some(200);
                    }
                    if result.raw_body.is_empty() {
                        result.raw_body = html.clone();
                    }
                    result.rendered_body = Some(html);
                }
            } else {
                warn!(url, "Rendered fetch unavailable, keeping raw result");
            }
        }

        result
    }
}

/// Map reqwest transport failures onto the closed failure taxonomy.
fn classify_transport_error(e: &reqwest::Error) -> (FetchErrorKind, String) {
    let msg = full_error_chain(e);
    let lower = msg.to_ascii_lowercase();

    let kind = if e.is_timeout() {
        FetchErrorKind::Timeout
    } else if lower.contains("dns") || lower.contains("name or service not known") {
        FetchErrorKind::Dns
    } else if lower.contains("certificate") || lower.contains("tls") || lower.contains("ssl") {
        FetchErrorKind::Tls
    } else if e.is_connect() {
        FetchErrorKind::Connect
    } else if e.is_decode() || e.is_body() {
        FetchErrorKind::Decode
    } else {
        FetchErrorKind::Connect
    };
    (kind, msg)
}

fn full_error_chain(e: &dyn std::error::Error) -> String {
    let mut parts = vec![e.to_string()];
    let mut source = e.source();
    while let Some(s) = source {
        parts.push(s.to_string());
        source = s.source();
    }
    parts.join(": ")
}
