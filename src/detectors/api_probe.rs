//! D3 — back-end API probe
//!
//! Storefront front-ends lie; their JSON endpoints usually don't. The
//! first pass over a page scrapes candidate stock/cart endpoints out of
//! the markup, memoises the best one on the item, and every later poll
//! asks the endpoint directly. When an API speaks, fusion treats it as
//! authoritative.

use super::{DetectContext, Detector, DetectorRun};
use crate::models::{DetectorOutcome, Verdict};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Boolean JSON keys that carry a stock verdict directly.
const BOOL_KEYS: &[&str] = &["in_stock", "inStock", "available", "is_available", "stock"];
/// Numeric JSON keys counting sellable units.
const COUNT_KEYS: &[&str] = &["stock", "stock_count", "quantity", "qty", "available_count"];

const MAX_JSON_DEPTH: usize = 4;

pub struct ApiProbeDetector {
    client: reqwest::Client,
    quoted_url: Regex,
}

impl ApiProbeDetector {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            quoted_url: Regex::new(r#"["']((?:https?://[^"'\s<>]+|/[^"'\s<>]+))["']"#)
                .expect("static regex"),
        }
    }

    /// Score a candidate path; zero means "not an endpoint we trust".
    fn score_candidate(path: &str) -> u32 {
        let p = path.to_ascii_lowercase();
        // Query strings don't change what the endpoint is about.
        let p = p.split('?').next().unwrap_or(&p);
        if p.contains("/api/") && p.contains("stock") {
            4
        } else if p.ends_with(".json") && p.contains("stock") {
            3
        } else if p.contains("/product/") && p.ends_with(".json") {
            2
        } else if p.contains("/cart/") && !p.contains(".css") && !p.contains(".js") {
            1
        } else {
            0
        }
    }

    /// One-shot discovery: best-scoring candidate endpoint in the page,
    /// resolved against the final URL.
    fn discover(&self, base: &str, bodies: &[&str]) -> Option<String> {
        let base = Url::parse(base).ok()?;
        let mut best: Option<(u32, String)> = None;

        for body in bodies {
            for cap in self.quoted_url.captures_iter(body) {
                let raw = &cap[1];
                let score = Self::score_candidate(raw);
                if score == 0 {
                    continue;
                }
                let Ok(resolved) = base.join(raw) else {
                    continue;
                };
                // Stay on the vendor's infrastructure.
                if resolved.host_str() != base.host_str() {
                    continue;
                }
                if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                    best = Some((score, resolved.to_string()));
                }
            }
        }
        best.map(|(_, url)| url)
    }

    async fn probe(&self, endpoint: &str) -> DetectorOutcome {
        let response = match self.client.get(endpoint).send().await {
            Ok(r) => r,
            Err(e) => {
                return DetectorOutcome::inconclusive(format!("probe failed: {}", e));
            }
        };
        if !response.status().is_success() {
            return DetectorOutcome::inconclusive(format!(
                "probe HTTP {}",
                response.status().as_u16()
            ));
        }
        let json: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                return DetectorOutcome::inconclusive(format!("probe not JSON: {}", e));
            }
        };
        interpret(&json, endpoint)
    }
}

/// Walk the JSON for a stock signal, depth-limited.
fn interpret(value: &Value, endpoint: &str) -> DetectorOutcome {
    match find_signal(value, 0) {
        Some(StockSignal::Bool(key, true)) => DetectorOutcome::new(
            Verdict::Available,
            0.9,
            format!("api {}: {}=true", endpoint, key),
        ),
        Some(StockSignal::Bool(key, false)) => DetectorOutcome::new(
            Verdict::Unavailable,
            0.9,
            format!("api {}: {}=false", endpoint, key),
        ),
        Some(StockSignal::Count(key, n)) if n > 0 => DetectorOutcome::new(
            Verdict::Available,
            0.9,
            format!("api {}: {}={}", endpoint, key, n),
        ),
        _ => DetectorOutcome::inconclusive(format!("api {}: no stock fields", endpoint)),
    }
}

enum StockSignal {
    Bool(String, bool),
    Count(String, i64),
}

fn find_signal(value: &Value, depth: usize) -> Option<StockSignal> {
    if depth > MAX_JSON_DEPTH {
        return None;
    }
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                let lower = key.to_ascii_lowercase();
                if BOOL_KEYS.iter().any(|k| k.eq_ignore_ascii_case(&lower)) {
                    if let Value::Bool(b) = v {
                        return Some(StockSignal::Bool(key.clone(), *b));
                    }
                }
                if COUNT_KEYS.iter().any(|k| k.eq_ignore_ascii_case(&lower)) {
                    if let Some(n) = v.as_i64() {
                        return Some(StockSignal::Count(key.clone(), n));
                    }
                }
            }
            // No direct hit at this level; descend.
            for v in map.values() {
                if let Some(sig) = find_signal(v, depth + 1) {
                    return Some(sig);
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(|v| find_signal(v, depth + 1)),
        _ => None,
    }
}

#[async_trait]
impl Detector for ApiProbeDetector {
    fn name(&self) -> &'static str {
        "api_probe"
    }

    async fn run(&self, ctx: Arc<DetectContext>) -> DetectorRun {
        // Memoised endpoint first; discovery only happens once per item.
        if let Some(endpoint) = ctx.item.api_endpoint.as_deref() {
            return self.probe(endpoint).await.into();
        }

        let fetch = &ctx.fetch;
        if !fetch.is_usable() {
            return DetectorOutcome::inconclusive("no body to discover from").into();
        }

        let mut bodies = vec![fetch.raw_body.as_str()];
        if let Some(rendered) = fetch.rendered_body.as_deref() {
            bodies.push(rendered);
        }

        match self.discover(&fetch.final_url, &bodies) {
            Some(endpoint) => {
                debug!(endpoint = %endpoint, "Discovered candidate stock endpoint");
                let outcome = self.probe(&endpoint).await;
                DetectorRun {
                    outcome,
                    discovered_endpoint: Some(endpoint),
                    fingerprint: None,
                }
            }
            None => DetectorOutcome::inconclusive("no candidate endpoints").into(),
        }
    }
}
