use crate::datastore::IsbnSource;
use crate::goodreads::GoodreadsClient;
use crate::stats_cache::StatsCache;
use anyhow::Result;
use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Goodreads accepts at most 500 ISBNs per review_counts call.
pub const MAX_ISBNS_PER_BATCH: u32 = 500;
/// Minimum spacing between provider calls.
pub const PROVIDER_INTERVAL: Duration = Duration::from_millis(2000);
/// A successful run younger than this short-circuits the next trigger.
pub const DEFAULT_FRESH_FOR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub page_size: u32,
    pub provider_interval: Duration,
    pub fresh_for: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            page_size: MAX_ISBNS_PER_BATCH,
            provider_interval: PROVIDER_INTERVAL,
            fresh_for: DEFAULT_FRESH_FOR,
        }
    }
}

/// Operator-visible record of the most recent refresh run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub records_updated: u64,
    pub batches_sent: u64,
    pub in_progress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A background run was spawned; the caller never observes its outcome.
    Started,
    /// Another run holds the single-flight guard.
    AlreadyRunning,
    /// The last successful run is still fresh; nothing to do.
    Fresh,
}

#[derive(Debug, Default)]
struct RunSummary {
    records_updated: u64,
    batches_sent: u64,
}

/// Owns the refresh pipeline: pages ISBNs out of the datastore, feeds them
/// to the provider through a shared rate limiter, and writes the normalized
/// statistics to the cache. At most one run per process at a time.
pub struct RefreshCoordinator {
    source: Arc<dyn IsbnSource>,
    client: GoodreadsClient,
    cache: Arc<dyn StatsCache>,
    limiter: DefaultDirectRateLimiter,
    config: RefreshConfig,
    running: AtomicBool,
    status: RwLock<RefreshStatus>,
}

impl RefreshCoordinator {
    pub fn new(
        source: Arc<dyn IsbnSource>,
        client: GoodreadsClient,
        cache: Arc<dyn StatsCache>,
        config: RefreshConfig,
    ) -> Arc<Self> {
        let period = config.provider_interval.max(Duration::from_millis(1));
        let quota = Quota::with_period(period).expect("provider interval is non-zero");

        Arc::new(Self {
            source,
            client,
            cache,
            limiter: RateLimiter::direct(quota),
            config,
            running: AtomicBool::new(false),
            status: RwLock::new(RefreshStatus::default()),
        })
    }

    pub async fn status(&self) -> RefreshStatus {
        self.status.read().await.clone()
    }

    /// Decide whether a new background run is warranted and, if so, spawn
    /// it. Responds before any work happens.
    pub async fn trigger(self: &Arc<Self>) -> TriggerOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return TriggerOutcome::AlreadyRunning;
        }

        let fresh = {
            let status = self.status.read().await;
            status.last_error.is_none()
                && status.last_run.is_some_and(|t| {
                    Utc::now()
                        .signed_duration_since(t)
                        .to_std()
                        .is_ok_and(|age| age < self.config.fresh_for)
                })
        };

        if fresh {
            self.running.store(false, Ordering::SeqCst);
            return TriggerOutcome::Fresh;
        }

        self.status.write().await.in_progress = true;

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.run_and_record().await;
        });

        TriggerOutcome::Started
    }

    // Runs the pipeline to completion and folds the outcome into the status
    // record. Must only be entered while holding the `running` guard.
    async fn run_and_record(self: Arc<Self>) {
        let mut summary = RunSummary::default();
        let result = self.run(&mut summary).await;

        {
            let mut status = self.status.write().await;
            status.in_progress = false;
            status.records_updated = summary.records_updated;
            status.batches_sent = summary.batches_sent;
            match result {
                Ok(()) => {
                    status.last_run = Some(Utc::now());
                    status.last_error = None;
                    info!(
                        records = summary.records_updated,
                        batches = summary.batches_sent,
                        "finished refreshing review statistics"
                    );
                }
                Err(err) => {
                    status.last_error = Some(format!("{err:#}"));
                    error!("refresh run aborted: {err:#}");
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    async fn run(&self, summary: &mut RunSummary) -> Result<()> {
        let mut cursor: Option<String> = None;

        loop {
            // A datastore failure aborts the whole run.
            let page = self
                .source
                .fetch_page(cursor.as_deref(), self.config.page_size)
                .await?;
            if page.isbns.is_empty() {
                break;
            }

            self.limiter.until_ready().await;
            summary.batches_sent += 1;

            match self.client.review_counts(&page.isbns).await {
                Ok(books) => {
                    for book in books {
                        let Some(key) = book.cache_key() else {
                            warn!("skipping review statistic with no usable ISBN");
                            continue;
                        };
                        match self.cache.set(&key, &book.cached_value()).await {
                            Ok(()) => summary.records_updated += 1,
                            Err(err) => {
                                warn!(isbn = %key, "failed to cache review statistic: {err:#}");
                            }
                        }
                    }
                }
                // A failed batch is dropped, not retried; later pages still run.
                Err(err) => warn!("dropping batch after provider error: {err:#}"),
            }

            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::StaticIsbnSource;
    use crate::stats_cache::MemoryStatsCache;
    use axum::{Json, Router, extract::Query, extract::State, routing::get};
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::net::{SocketAddr, TcpListener};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener as TokioTcpListener;
    use tokio::task::JoinHandle;

    async fn spawn_provider(app: Router) -> (SocketAddr, JoinHandle<()>) {
        let std_listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
        let addr = std_listener.local_addr().expect("local addr");
        std_listener.set_nonblocking(true).expect("nonblocking");
        let listener = TokioTcpListener::from_std(std_listener).expect("tokio listener");

        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        (addr, handle)
    }

    fn coordinator(
        isbns: Vec<&str>,
        addr: SocketAddr,
        cache: Arc<MemoryStatsCache>,
        config: RefreshConfig,
    ) -> Arc<RefreshCoordinator> {
        let source = Arc::new(StaticIsbnSource::new(
            isbns.into_iter().map(str::to_string).collect(),
        ));
        let client = GoodreadsClient::new_with_base_url("k".into(), &format!("http://{addr}/"));
        RefreshCoordinator::new(source, client, cache, config)
    }

    fn test_config(page_size: u32) -> RefreshConfig {
        RefreshConfig {
            page_size,
            provider_interval: Duration::from_millis(1),
            fresh_for: Duration::ZERO,
        }
    }

    async fn wait_until_idle(coordinator: &Arc<RefreshCoordinator>) {
        for _ in 0..200 {
            if !coordinator.status().await.in_progress {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("refresh run did not finish in time");
    }

    #[tokio::test]
    async fn caches_keyed_entries_and_skips_the_rest() {
        async fn handler(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
            assert_eq!(params.get("isbns").map(String::as_str), Some("111,222"));
            Json(json!({
                "books": [
                    { "isbn13": "111", "average_rating": "4.1", "ratings_count": 9 },
                    { "average_rating": "2.0" }
                ]
            }))
        }

        let (addr, server) =
            spawn_provider(Router::new().route("/book/review_counts.json", get(handler))).await;

        let cache = Arc::new(MemoryStatsCache::new(Duration::from_secs(60)));
        let coordinator = coordinator(
            vec!["111", "222"],
            addr,
            Arc::clone(&cache),
            test_config(500),
        );

        Arc::clone(&coordinator).run_and_record().await;

        let cached = cache
            .get("111")
            .await
            .unwrap()
            .expect("isbn 111 should be cached");
        assert_eq!(cached.get("average_rating"), Some(&json!("4.1")));
        assert_eq!(
            cached.get("ratings_count"),
            None,
            "internal counters should be stripped before caching"
        );
        assert_eq!(cache.get("222").await.unwrap(), None);

        let status = coordinator.status().await;
        assert_eq!(status.records_updated, 1);
        assert_eq!(status.batches_sent, 1);
        assert_eq!(status.last_error, None);
        assert!(status.last_run.is_some());

        server.abort();
    }

    #[tokio::test]
    async fn pages_through_the_datastore_in_batches() {
        #[derive(Clone)]
        struct TestState {
            batches: Arc<Mutex<Vec<String>>>,
        }

        async fn handler(
            State(state): State<TestState>,
            Query(params): Query<HashMap<String, String>>,
        ) -> Json<Value> {
            let isbns = params.get("isbns").cloned().unwrap_or_default();
            state.batches.lock().unwrap().push(isbns.clone());
            let books: Vec<Value> = isbns
                .split(',')
                .map(|isbn| json!({ "isbn13": isbn, "average_rating": "4.0" }))
                .collect();
            Json(json!({ "books": books }))
        }

        let batches = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/book/review_counts.json", get(handler))
            .with_state(TestState {
                batches: Arc::clone(&batches),
            });
        let (addr, server) = spawn_provider(app).await;

        let cache = Arc::new(MemoryStatsCache::new(Duration::from_secs(60)));
        let coordinator = coordinator(
            vec!["111", "222", "333", "444", "555"],
            addr,
            Arc::clone(&cache),
            test_config(2),
        );

        Arc::clone(&coordinator).run_and_record().await;

        let seen = batches.lock().unwrap().clone();
        assert_eq!(seen, vec!["111,222", "333,444", "555"]);

        for isbn in ["111", "222", "333", "444", "555"] {
            assert!(
                cache.get(isbn).await.unwrap().is_some(),
                "isbn {isbn} should be cached"
            );
        }

        let status = coordinator.status().await;
        assert_eq!(status.batches_sent, 3);
        assert_eq!(status.records_updated, 5);

        server.abort();
    }

    #[tokio::test]
    async fn a_failed_batch_is_dropped_but_the_run_continues() {
        #[derive(Clone)]
        struct TestState {
            hits: Arc<AtomicUsize>,
        }

        async fn handler(
            State(state): State<TestState>,
            Query(params): Query<HashMap<String, String>>,
        ) -> Result<Json<Value>, axum::http::StatusCode> {
            if state.hits.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
            }
            let books: Vec<Value> = params
                .get("isbns")
                .map(String::as_str)
                .unwrap_or_default()
                .split(',')
                .map(|isbn| json!({ "isbn13": isbn, "average_rating": "4.0" }))
                .collect();
            Ok(Json(json!({ "books": books })))
        }

        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/book/review_counts.json", get(handler))
            .with_state(TestState {
                hits: Arc::clone(&hits),
            });
        let (addr, server) = spawn_provider(app).await;

        let cache = Arc::new(MemoryStatsCache::new(Duration::from_secs(60)));
        let coordinator =
            coordinator(vec!["111", "222"], addr, Arc::clone(&cache), test_config(1));

        Arc::clone(&coordinator).run_and_record().await;

        assert_eq!(cache.get("111").await.unwrap(), None);
        assert!(cache.get("222").await.unwrap().is_some());

        let status = coordinator.status().await;
        assert_eq!(status.batches_sent, 2);
        assert_eq!(status.records_updated, 1);
        assert_eq!(status.last_error, None, "a dropped batch is not a run failure");

        server.abort();
    }

    #[tokio::test]
    async fn refreshing_twice_leaves_cache_content_unchanged() {
        async fn handler(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
            let books: Vec<Value> = params
                .get("isbns")
                .map(String::as_str)
                .unwrap_or_default()
                .split(',')
                .map(|isbn| json!({ "isbn13": isbn, "average_rating": "4.2" }))
                .collect();
            Json(json!({ "books": books }))
        }

        let (addr, server) =
            spawn_provider(Router::new().route("/book/review_counts.json", get(handler))).await;

        let cache = Arc::new(MemoryStatsCache::new(Duration::from_secs(60)));
        let coordinator = coordinator(
            vec!["111", "222"],
            addr,
            Arc::clone(&cache),
            test_config(500),
        );

        Arc::clone(&coordinator).run_and_record().await;
        let first = cache.get("111").await.unwrap();

        Arc::clone(&coordinator).run_and_record().await;
        let second = cache.get("111").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(coordinator.status().await.records_updated, 2);

        server.abort();
    }

    #[tokio::test]
    async fn trigger_is_single_flight_and_respects_freshness() {
        async fn handler() -> Json<Value> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Json(json!({ "books": [ { "isbn13": "111", "average_rating": "4.1" } ] }))
        }

        let (addr, server) =
            spawn_provider(Router::new().route("/book/review_counts.json", get(handler))).await;

        let cache = Arc::new(MemoryStatsCache::new(Duration::from_secs(60)));
        let config = RefreshConfig {
            fresh_for: Duration::from_secs(3600),
            ..test_config(500)
        };
        let coordinator = coordinator(vec!["111"], addr, cache, config);

        assert_eq!(coordinator.trigger().await, TriggerOutcome::Started);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.trigger().await, TriggerOutcome::AlreadyRunning);

        wait_until_idle(&coordinator).await;
        assert_eq!(
            coordinator.trigger().await,
            TriggerOutcome::Fresh,
            "a successful run within the freshness window short-circuits"
        );

        server.abort();
    }

    #[tokio::test]
    async fn datastore_failure_aborts_the_run_and_is_recorded() {
        struct FailingSource;

        #[async_trait::async_trait]
        impl IsbnSource for FailingSource {
            async fn fetch_page(
                &self,
                _cursor: Option<&str>,
                _limit: u32,
            ) -> Result<crate::datastore::IsbnPage> {
                anyhow::bail!("datastore unavailable")
            }
        }

        let cache = Arc::new(MemoryStatsCache::new(Duration::from_secs(60)));
        let client = GoodreadsClient::new_with_base_url("k".into(), "http://127.0.0.1:9/");
        let coordinator =
            RefreshCoordinator::new(Arc::new(FailingSource), client, cache, test_config(500));

        Arc::clone(&coordinator).run_and_record().await;

        let status = coordinator.status().await;
        assert!(
            status
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("datastore unavailable"))
        );
        assert_eq!(status.last_run, None);
        assert!(!status.in_progress);
    }
}
