//! D2 — rendered-DOM inspection
//!
//! Looks at what the page actually wires up: live cart forms, disabled
//! buy buttons, "notify me" widgets. Vendor-specific selector rules win
//! over the generic rule because storefront software lies in
//! vendor-specific ways. Needs a rendered body; without one it abstains.

use super::{DetectContext, Detector, DetectorRun};
use crate::models::{DetectorOutcome, Verdict};
use async_trait::async_trait;
use scraper::{Html, Selector};
use std::sync::Arc;

/// A per-vendor selector rule. First match decides.
struct VendorRule {
    host_suffix: &'static str,
    /// Selector that, when present, means the item can be bought.
    available: &'static str,
    /// Selector that, when present, means it cannot.
    unavailable: &'static str,
}

/// Selector library for storefronts we see often. WHMCS-style panels
/// dominate the VPS space.
const VENDOR_RULES: &[VendorRule] = &[
    VendorRule {
        host_suffix: "bandwagonhost.com",
        available: r#"a[href*="cart.php?a=add"]"#,
        unavailable: r#".errorbox, .out-of-stock"#,
    },
    VendorRule {
        host_suffix: "bwh81.net",
        available: r#"a[href*="cart.php?a=add"]"#,
        unavailable: r#".errorbox, .out-of-stock"#,
    },
    VendorRule {
        host_suffix: "dmit.io",
        available: r#"button.btn-order:not([disabled]), a[href*="/order"]"#,
        unavailable: r#"button.btn-order[disabled], .badge-soldout"#,
    },
    VendorRule {
        host_suffix: "racknerd.com",
        available: r#"a[href*="cart.php?a=add"], a[href*="/order"]"#,
        unavailable: r#".out-of-stock, .sold-out"#,
    },
];

pub struct DomDetector;

impl DomDetector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DomDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn sel(s: &str) -> Selector {
    Selector::parse(s).expect("static selector")
}

/// Does the document carry a submittable form whose action points at an
/// add/cart/buy endpoint, and is it enabled?
fn inspect_generic(doc: &Html) -> DetectorOutcome {
    let forms = sel("form[action]");
    let disabled_submit = sel(r#"button[disabled], input[type="submit"][disabled]"#);
    let any_submit = sel(r#"button, input[type="submit"]"#);

    for form in doc.select(&forms) {
        let action = form.value().attr("action").unwrap_or_default().to_lowercase();
        if !(action.contains("add") || action.contains("cart") || action.contains("buy")) {
            continue;
        }

        // A cart form with its submit disabled is a storefront saying no.
        if form.select(&disabled_submit).next().is_some() {
            return DetectorOutcome::new(
                Verdict::Unavailable,
                0.8,
                format!("cart form '{}' has disabled submit", action),
            );
        }
        if form.select(&any_submit).next().is_some() || form.value().attr("method").is_some() {
            return DetectorOutcome::new(
                Verdict::Available,
                0.8,
                format!("live cart form '{}'", action),
            );
        }
    }

    // A notify-me widget is the polite version of "sold out".
    let notify = sel(r#"[class*="notify"], [id*="notify"]"#);
    for el in doc.select(&notify) {
        let text: String = el.text().collect::<String>().to_lowercase();
        if text.contains("notify") || text.contains("通知") {
            return DetectorOutcome::new(Verdict::Unavailable, 0.7, "notify-me widget present");
        }
    }

    DetectorOutcome::inconclusive("no cart form or stock widget")
}

fn inspect(html: &str, host: &str) -> DetectorOutcome {
    let doc = Html::parse_document(html);

    for rule in VENDOR_RULES {
        if !(host == rule.host_suffix || host.ends_with(&format!(".{}", rule.host_suffix))) {
            continue;
        }
        // Vendor rule wins over the generic one, unavailable side first:
        // a sold-out page often still renders its order links.
        if let Ok(selector) = Selector::parse(rule.unavailable) {
            if doc.select(&selector).next().is_some() {
                return DetectorOutcome::new(
                    Verdict::Unavailable,
                    0.8,
                    format!("vendor rule {} matched unavailable", rule.host_suffix),
                );
            }
        }
        if let Ok(selector) = Selector::parse(rule.available) {
            if doc.select(&selector).next().is_some() {
                return DetectorOutcome::new(
                    Verdict::Available,
                    0.8,
                    format!("vendor rule {} matched available", rule.host_suffix),
                );
            }
        }
    }

    inspect_generic(&doc)
}

#[async_trait]
impl Detector for DomDetector {
    fn name(&self) -> &'static str {
        "dom"
    }

    async fn run(&self, ctx: Arc<DetectContext>) -> DetectorRun {
        let Some(rendered) = ctx.fetch.rendered_body.as_deref() else {
            return DetectorOutcome::inconclusive("no rendered body").into();
        };
        let host = ctx.item.host().unwrap_or_default();
        inspect(rendered, &host).into()
    }
}
