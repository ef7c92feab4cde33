//! End-to-end pipeline tests: scripted fetches in, delivered messages out.
//!
//! These drive the real components — store, detectors, fusion,
//! transition evaluation, aggregation — with only the fetch layer and
//! the delivery sink replaced by test doubles.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use stockbot_backend::{
    config::Config,
    detectors,
    fetcher::{FetchResult, PageFetcher},
    models::{FetchErrorKind, ItemStatus, Verdict},
    notifier::{sink::MemorySink, NotificationAggregator},
    scheduler::CheckRunner,
    service::MonitorService,
    store::Store,
};

// The two page states share a DOM skeleton (text-only swap, the usual
// WHMCS shape), so the fingerprint detector reports no drift and the
// hysteresis path is what gets exercised.
const IN_STOCK: &str = "<html><body><h1>KVM 512</h1>\
    <div class='stock'>Add to cart</div></body></html>";
const SOLD_OUT: &str = "<html><body><h1>KVM 512</h1>\
    <div class='stock'>Out of stock</div></body></html>";

struct ScriptedFetcher {
    script: Mutex<VecDeque<FetchResult>>,
}

impl ScriptedFetcher {
    fn new(bodies: Vec<&str>) -> Arc<Self> {
        let script = bodies
            .into_iter()
            .map(|body| FetchResult {
                final_url: "https://h1.example.com/vps".into(),
                http_status: Some(200),
                headers: Vec::new(),
                raw_body: body.to_string(),
                rendered_body: None,
                latency_ms: 30,
                error_kind: None,
                error_message: None,
            })
            .collect();
        Arc::new(Self {
            script: Mutex::new(script),
        })
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> FetchResult {
        self.script.lock().pop_front().unwrap_or_else(|| {
            FetchResult::failure(url, FetchErrorKind::Connect, "script exhausted".into(), 1)
        })
    }
}

struct Pipeline {
    store: Store,
    runner: CheckRunner,
    aggregator: NotificationAggregator,
    sink: Arc<MemorySink>,
    item_id: String,
}

/// Wire the real pipeline around a scripted fetcher. The item starts
/// owned by "owner", with "admin1" as the only administrator.
async fn pipeline(bodies: Vec<&str>) -> Pipeline {
    pipeline_with(bodies, Config::default()).await
}

async fn pipeline_with(bodies: Vec<&str>, base: Config) -> Pipeline {
    let config = Arc::new(Config {
        admin_ids: vec!["admin1".into()],
        max_retries: 0,
        retry_delay: 0,
        ..base
    });
    let store = Store::open_in_memory().unwrap();
    let sink = Arc::new(MemorySink::new());
    let (aggregator, events_tx) =
        NotificationAggregator::new(store.clone(), config.clone(), sink.clone());

    let service = MonitorService::new(store.clone(), config.clone());
    let item = service
        .add_item("owner", "KVM 512", "https://h1.example.com/vps", "")
        .await
        .unwrap();

    let runner = CheckRunner::new(
        store.clone(),
        config.clone(),
        ScriptedFetcher::new(bodies),
        detectors::standard_set(&config),
        events_tx,
    );

    Pipeline {
        store,
        runner,
        aggregator,
        sink,
        item_id: item.item_id,
    }
}

impl Pipeline {
    async fn poll(&self) -> Verdict {
        let item = self.store.get_item(&self.item_id).await.unwrap().unwrap();
        self.runner.check_item(&item).await.unwrap().record.verdict
    }

    /// Flush as if a full aggregation tick has passed.
    async fn flush(&mut self) {
        self.aggregator
            .flush_once(Utc::now() + ChronoDuration::seconds(120))
            .await
            .unwrap();
    }

    async fn status(&self) -> ItemStatus {
        self.store
            .get_item(&self.item_id)
            .await
            .unwrap()
            .unwrap()
            .last_status
    }
}

#[tokio::test]
async fn restock_detection_end_to_end() {
    // Sold out once, then in stock twice: the corroborated second
    // reading flips the status and exactly one restock flows to the
    // admin digest and the owner.
    let mut p = pipeline(vec![SOLD_OUT, IN_STOCK, IN_STOCK]).await;

    p.poll().await;
    assert_eq!(p.status().await, ItemStatus::Unavailable);

    p.poll().await;
    assert_eq!(p.status().await, ItemStatus::Unavailable); // hysteresis

    p.poll().await;
    assert_eq!(p.status().await, ItemStatus::Available);

    p.flush().await;

    let admin = p.sink.sent_to("admin1");
    assert_eq!(admin.len(), 1);
    assert!(admin[0].contains("Restock digest"));
    assert!(admin[0].contains("KVM 512"));

    let owner = p.sink.sent_to("owner");
    assert_eq!(owner.len(), 1);
    assert!(owner[0].contains("Restock"));
    assert!(owner[0].contains("https://h1.example.com/vps"));
}

#[tokio::test]
async fn false_positive_is_suppressed() {
    // One optimistic reading sandwiched by sold-out pages: status never
    // flips, nobody hears anything.
    let mut p = pipeline(vec![SOLD_OUT, IN_STOCK, SOLD_OUT, SOLD_OUT]).await;

    for _ in 0..4 {
        p.poll().await;
    }
    assert_eq!(p.status().await, ItemStatus::Unavailable);

    p.flush().await;
    assert!(p.sink.sent().is_empty());
}

#[tokio::test]
async fn second_restock_within_cooldown_is_skipped() {
    // Restock, flap down, restock again — all inside the cooldown
    // window. One delivery per recipient, total.
    let mut p = pipeline(vec![
        SOLD_OUT, IN_STOCK, IN_STOCK, // restock #1
        SOLD_OUT, SOLD_OUT, // outage (admin-only path)
        IN_STOCK, IN_STOCK, // restock #2
    ])
    .await;

    for _ in 0..3 {
        p.poll().await;
    }
    p.flush().await;
    assert_eq!(p.sink.sent_to("owner").len(), 1);

    for _ in 0..4 {
        p.poll().await;
    }
    assert_eq!(p.status().await, ItemStatus::Available);
    p.flush().await;

    // Owner saw exactly one restock despite two transitions.
    assert_eq!(p.sink.sent_to("owner").len(), 1);
}

#[tokio::test]
async fn outage_reaches_admins_only() {
    // Cooldown off so the outage right after the restock digest is not
    // suppressed for the admin.
    let mut p = pipeline_with(
        vec![SOLD_OUT, IN_STOCK, IN_STOCK, SOLD_OUT, SOLD_OUT],
        Config {
            cooldown_seconds: 0,
            ..Config::default()
        },
    )
    .await;

    for _ in 0..3 {
        p.poll().await;
    }
    p.flush().await;
    let admin_before = p.sink.sent_to("admin1").len();

    // Two unavailable readings flip it back.
    p.poll().await;
    let last = p.poll().await;
    assert_eq!(last, Verdict::Unavailable);
    assert_eq!(p.status().await, ItemStatus::Unavailable);

    p.flush().await;
    let owner = p.sink.sent_to("owner");
    assert_eq!(owner.len(), 1, "owner only ever saw the restock");
    let admin = p.sink.sent_to("admin1");
    assert_eq!(admin.len(), admin_before + 1);
    assert!(admin.last().unwrap().contains("Outage"));
}

#[tokio::test]
async fn api_probe_override_flips_against_keywords() {
    // Page says sold out, but the item has a memoised API endpoint...
    // which we cannot hit in a test without a server. Instead verify the
    // discovery memoisation half: a page carrying a stock endpoint gets
    // it recorded for the next poll.
    let body = format!(
        "{}{}",
        SOLD_OUT, r#"<script>fetch("/api/v1/stock?pid=7")</script>"#
    );
    let mut p = pipeline(vec![&body]).await;
    p.poll().await;

    let item = p.store.get_item(&p.item_id).await.unwrap().unwrap();
    assert_eq!(
        item.api_endpoint.as_deref(),
        Some("https://h1.example.com/api/v1/stock?pid=7")
    );
    p.flush().await;
}
