//! D4 — content fingerprint drift
//!
//! A stock flip almost always moves the page structure: a banner
//! appears, a form goes away. The fingerprint captures structure while
//! shrugging off the noise sale pages generate on every load
//! (timestamps, prices, rotating promo text).
//!
//! Two canonical forms, version-prefixed so a format change can never
//! masquerade as page drift:
//! - `dom1:` — skeleton hash over tag/id/class structure, text dropped;
//! - `len1:` — fallback for unparseable bodies: newline-normalised,
//!   digit-stripped text in 256-byte length buckets.
//!
//! On its own this detector only ever abstains — drift is context, not a
//! verdict. Fusion turns agreement-plus-drift into a confidence boost,
//! and drift-with-silence into a "re-check sooner" flag.

use super::{DetectContext, Detector, DetectorRun};
use crate::fetcher::FetchResult;
use crate::models::DetectorOutcome;
use async_trait::async_trait;
use scraper::Html;
use sha2::{Digest, Sha256};
use std::sync::Arc;

const LENGTH_BUCKET: usize = 256;

fn hex16(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Skeleton hash: element tags with id and sorted classes, document
/// order, no text.
fn dom_skeleton_hash(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let mut hasher = Sha256::new();
    let mut elements = 0usize;

    for node in doc.root_element().descendants() {
        let Some(el) = node.value().as_element() else {
            continue;
        };
        elements += 1;
        hasher.update(el.name().as_bytes());
        if let Some(id) = el.id() {
            hasher.update(b"#");
            hasher.update(id.as_bytes());
        }
        let mut classes: Vec<&str> = el.classes().collect();
        classes.sort_unstable();
        for class in classes {
            hasher.update(b".");
            hasher.update(class.as_bytes());
        }
        hasher.update(b">");
    }

    // The parser wraps anything in an implicit html>head>body shell, so
    // three elements means there was no real markup (bare text, JSON
    // served as text/plain). Those get the fallback hash instead.
    if elements <= 3 {
        return None;
    }
    Some(format!("dom1:{}", hex16(hasher)))
}

/// Fallback: digits out, newlines normalised, length bucketed.
fn length_bucket_hash(body: &str) -> String {
    let normalised: String = body
        .replace("\r\n", "\n")
        .chars()
        .filter(|c| !c.is_ascii_digit())
        .collect();
    let bucket = body.len() / LENGTH_BUCKET;

    let mut hasher = Sha256::new();
    hasher.update(bucket.to_le_bytes());
    hasher.update(normalised.as_bytes());
    format!("len1:{}", hex16(hasher))
}

/// Fingerprint of a fetch result. Deterministic; rendered body preferred.
pub fn compute(fetch: &FetchResult) -> Option<String> {
    let body = fetch.best_body();
    if body.trim().is_empty() {
        return None;
    }
    Some(dom_skeleton_hash(body).unwrap_or_else(|| length_bucket_hash(body)))
}

pub struct FingerprintDetector;

impl FingerprintDetector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FingerprintDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Detector for FingerprintDetector {
    fn name(&self) -> &'static str {
        "fingerprint"
    }

    async fn run(&self, ctx: Arc<DetectContext>) -> DetectorRun {
        let Some(fresh) = compute(&ctx.fetch) else {
            return DetectorOutcome::inconclusive("no body to fingerprint").into();
        };

        let outcome = match ctx.item.fingerprint_hash.as_deref() {
            None => DetectorOutcome::inconclusive("first fingerprint"),
            Some(stored) if stored == fresh => {
                // Weak negative evidence: an unchanged page is probably an
                // unchanged stock state.
                DetectorOutcome::new(crate::models::Verdict::Inconclusive, 0.2, "page unchanged")
            }
            Some(_) => DetectorOutcome::new(
                crate::models::Verdict::Inconclusive,
                0.0,
                "page structure changed",
            ),
        };

        DetectorRun {
            outcome,
            discovered_endpoint: None,
            fingerprint: Some(fresh),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;

    fn fp(raw: &str) -> String {
        compute(&fetch_ok("https://example.com", raw, None)).unwrap()
    }

    #[test]
    fn text_changes_do_not_move_skeleton() {
        let a = fp("<html><body><div class='price'>$49 — updated 12:01:07</div></body></html>");
        let b = fp("<html><body><div class='price'>$59 — updated 18:44:23</div></body></html>");
        assert_eq!(a, b);
        assert!(a.starts_with("dom1:"));
    }

    #[test]
    fn structural_changes_move_skeleton() {
        let a = fp("<html><body><form action='/cart/add'><button>Buy</button></form></body></html>");
        let b = fp("<html><body><div class='soldout'>Sold out</div></body></html>");
        assert_ne!(a, b);
    }

    #[test]
    fn class_order_is_canonical() {
        let a = fp("<html><body><div class='a b c'>x</div></body></html>");
        let b = fp("<html><body><div class='c b a'>x</div></body></html>");
        assert_eq!(a, b);
    }

    #[test]
    fn non_html_uses_length_bucket() {
        let a = fp("plain text body, revision 10423, no markup at all");
        assert!(a.starts_with("len1:"));
        // Digits rotate freely within the same length bucket.
        let b = fp("plain text body, revision 99871, no markup at all");
        assert_eq!(a, b);
    }

    #[test]
    fn empty_body_has_no_fingerprint() {
        assert_eq!(compute(&fetch_ok("https://example.com", "   ", None)), None);
    }

    #[tokio::test]
    async fn detector_reports_drift_side_products() {
        let det = FingerprintDetector::new();
        let body = "<html><body><div>hello</div></body></html>";

        // First sighting: fingerprint produced, no comparison possible.
        let ctx1 = ctx(
            item_with("https://example.com/vps"),
            fetch_ok("https://example.com/vps", body, None),
        );
        let run = det.run(ctx1).await;
        let first = run.fingerprint.clone().unwrap();
        assert_eq!(run.outcome.evidence, "first fingerprint");

        // Unchanged page.
        let mut item = item_with("https://example.com/vps");
        item.fingerprint_hash = Some(first.clone());
        let run = det
            .run(ctx(item.clone(), fetch_ok("https://example.com/vps", body, None)))
            .await;
        assert_eq!(run.outcome.evidence, "page unchanged");
        assert!((run.outcome.confidence - 0.2).abs() < 1e-9);

        // Changed page.
        let run = det
            .run(ctx(
                item,
                fetch_ok(
                    "https://example.com/vps",
                    "<html><body><section><div>other</div></section></body></html>",
                    None,
                ),
            ))
            .await;
        assert_eq!(run.outcome.evidence, "page structure changed");
        assert_eq!(run.fingerprint.is_some(), true);
    }
}
