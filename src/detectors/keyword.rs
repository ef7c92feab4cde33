//! D1 — keyword scan
//!
//! The blunt instrument: strip the HTML, lowercase everything, and look
//! for the phrases shops actually print. Multilingual on purpose — half
//! the monitored vendors localise their sold-out banners.

use super::{DetectContext, Detector, DetectorRun};
use crate::models::{DetectorOutcome, Verdict};
use async_trait::async_trait;
use scraper::Html;
use std::sync::Arc;

/// Phrases that mean the product cannot be bought right now.
const UNAVAILABLE_MARKERS: &[&str] = &[
    "out of stock",
    "out-of-stock",
    "sold out",
    "sold-out",
    "currently unavailable",
    "not available",
    "unavailable",
    "temporarily out",
    "notify me when",
    "back in stock soon",
    "waiting list",
    "缺货",
    "售罄",
    "无货",
    "断货",
    "暂时缺货",
    "補貨中",
];

/// Phrases that mean a purchase path is live.
const AVAILABLE_MARKERS: &[&str] = &[
    "add to cart",
    "add to basket",
    "buy now",
    "order now",
    "in stock",
    "立即购买",
    "立即订购",
    "加入购物车",
    "现货",
    "馬上購買",
];

pub struct KeywordDetector;

impl KeywordDetector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for KeywordDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Visible text of an HTML document, lowercased. Scripts and styles do
/// not count as page text.
fn visible_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let mut out = String::with_capacity(html.len() / 4);
    for node in doc.root_element().descendants() {
        if let Some(text) = node.value().as_text() {
            let in_skipped = node.ancestors().any(|a| {
                a.value()
                    .as_element()
                    .map(|e| matches!(e.name(), "script" | "style" | "noscript"))
                    .unwrap_or(false)
            });
            if !in_skipped {
                out.push_str(text);
                out.push(' ');
            }
        }
    }
    out.to_lowercase()
}

fn count_matches(text: &str, markers: &[&'static str]) -> (usize, Vec<&'static str>) {
    let mut hits = Vec::new();
    for marker in markers {
        if text.contains(marker) {
            hits.push(*marker);
        }
    }
    (hits.len(), hits)
}

#[async_trait]
impl Detector for KeywordDetector {
    fn name(&self) -> &'static str {
        "keyword"
    }

    async fn run(&self, ctx: Arc<DetectContext>) -> DetectorRun {
        let raw = &ctx.fetch.raw_body;
        if raw.trim().is_empty() {
            return DetectorOutcome::inconclusive("no body").into();
        }

        let text = visible_text(raw);
        let (unavail_n, unavail_hits) = count_matches(&text, UNAVAILABLE_MARKERS);
        let (avail_n, avail_hits) = count_matches(&text, AVAILABLE_MARKERS);

        let outcome = match (avail_n, unavail_n) {
            (0, 0) => DetectorOutcome::inconclusive("no stock markers"),
            (a, 0) => DetectorOutcome::new(
                Verdict::Available,
                (0.6 + 0.1 * a as f64).min(0.9),
                format!("available markers: {}", avail_hits.join(", ")),
            ),
            (0, u) => DetectorOutcome::new(
                Verdict::Unavailable,
                (0.6 + 0.1 * u as f64).min(0.9),
                format!("unavailable markers: {}", unavail_hits.join(", ")),
            ),
            // Both sides present: sale page with a disabled buy button,
            // related-products rail, whatever. Don't guess.
            (a, u) => DetectorOutcome::new(
                Verdict::Inconclusive,
                0.3,
                format!("conflicting markers ({} avail / {} unavail)", a, u),
            ),
        };
        outcome.into()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;

    async fn run_on(body: &str) -> DetectorOutcome {
        let det = KeywordDetector::new();
        let ctx = ctx(
            item_with("https://example.com/vps"),
            fetch_ok("https://example.com/vps", body, None),
        );
        det.run(ctx).await.outcome
    }

    #[tokio::test]
    async fn detects_out_of_stock() {
        let out = run_on("<html><body><div class='status'>Out of Stock</div></body></html>").await;
        assert_eq!(out.verdict, Verdict::Unavailable);
        assert!((out.confidence - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn detects_add_to_cart() {
        let out = run_on("<html><body><button>Add to Cart</button></body></html>").await;
        assert_eq!(out.verdict, Verdict::Available);
        assert!(out.confidence >= 0.7);
    }

    #[tokio::test]
    async fn detects_chinese_markers() {
        let out = run_on("<html><body><span>缺货</span></body></html>").await;
        assert_eq!(out.verdict, Verdict::Unavailable);

        let out = run_on("<html><body><a>立即购买</a></body></html>").await;
        assert_eq!(out.verdict, Verdict::Available);
    }

    #[tokio::test]
    async fn conflicting_markers_are_inconclusive() {
        let out = run_on(
            "<html><body><button>Add to cart</button><p>Sold out</p></body></html>",
        )
        .await;
        assert_eq!(out.verdict, Verdict::Inconclusive);
        assert!((out.confidence - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn confidence_grows_with_matches_capped() {
        let out = run_on(
            "<html><body>out of stock sold out unavailable 缺货 售罄 无货</body></html>",
        )
        .await;
        assert_eq!(out.verdict, Verdict::Unavailable);
        assert!((out.confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn markers_in_scripts_are_ignored() {
        let out = run_on(
            "<html><head><script>var msg = 'out of stock';</script></head>\
             <body><h1>VPS plans</h1></body></html>",
        )
        .await;
        assert_eq!(out.verdict, Verdict::Inconclusive);
    }

    #[tokio::test]
    async fn empty_body_is_inconclusive() {
        let out = run_on("").await;
        assert_eq!(out.verdict, Verdict::Inconclusive);
    }
}
