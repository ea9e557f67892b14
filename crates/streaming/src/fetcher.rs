//! Dataset fetcher: query building, caching and pagination over a
//! [`Transport`].
//!
//! One fetcher is shared by every consumer of the data service so they all
//! see the same cache. Requests are not coalesced: two concurrent misses on
//! the same URL both go to the network and the later response wins the cache
//! slot.

use std::sync::Arc;
use std::time::Duration;

use catalog::{DatasetDescriptor, Registry};
use foundation::time::{Clock, SystemClock};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::cache::CacheStore;
use crate::config::FetcherConfig;
use crate::error::FetchError;
use crate::query::{QuerySpec, request_url};
use crate::transport::{HttpRequest, Transport};

/// Decoded rows of one response, shared with the cache.
pub type Rows = Arc<Vec<Value>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Bypass the cache lookup. The response is still stored.
    pub skip_cache: bool,
}

impl FetchOptions {
    pub fn fresh() -> Self {
        Self { skip_cache: true }
    }
}

/// Default `$order` for aggregation queries.
pub const AGGREGATION_ORDER: &str = "count(*) DESC";

#[derive(Clone)]
pub struct DatasetFetcher {
    registry: Arc<Registry>,
    cache: Arc<CacheStore<Vec<Value>>>,
    transport: Arc<dyn Transport>,
    config: FetcherConfig,
}

impl DatasetFetcher {
    pub fn new(registry: Arc<Registry>, transport: Arc<dyn Transport>, config: FetcherConfig) -> Self {
        Self::with_clock(registry, transport, config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        config: FetcherConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            cache: Arc::new(CacheStore::new(clock)),
            transport,
            config,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore<Vec<Value>> {
        &self.cache
    }

    fn descriptor(&self, key: &str) -> Result<&DatasetDescriptor, FetchError> {
        self.registry
            .get(key)
            .ok_or_else(|| FetchError::UnknownDataset(key.to_string()))
    }

    fn ttl_for(&self, descriptor: &DatasetDescriptor) -> Duration {
        descriptor.cache_ttl_or(self.config.default_ttl)
    }

    /// How long a response for `key` stays cached.
    pub fn cache_ttl(&self, key: &str) -> Result<Duration, FetchError> {
        self.descriptor(key).map(|d| self.ttl_for(d))
    }

    /// The exact URL (and cache key) `fetch` would use for this query.
    pub fn url_for(&self, key: &str, query: &QuerySpec) -> Result<String, FetchError> {
        let descriptor = self.descriptor(key)?;
        let defaults = QuerySpec {
            order: descriptor.default_sort.clone(),
            limit: Some(self.config.default_limit),
            ..QuerySpec::default()
        };
        let endpoint = descriptor.resolve_endpoint(self.registry.base_url());
        Ok(request_url(&endpoint, &query.merged_over(&defaults)))
    }

    /// Fetches one page of rows, serving from cache while the entry is fresh.
    pub async fn fetch(
        &self,
        key: &str,
        query: &QuerySpec,
        options: FetchOptions,
    ) -> Result<Rows, FetchError> {
        let descriptor = self.descriptor(key)?;
        let url = self.url_for(key, query)?;

        if !options.skip_cache {
            if let Some(rows) = self.cache.get(&url) {
                tracing::debug!(dataset = key, rows = rows.len(), "cache hit");
                return Ok(rows);
            }
            tracing::debug!(dataset = key, "cache miss");
        }

        let mut request = HttpRequest::get(&url).with_header("Accept", "application/json");
        if let Some((name, value)) = self.config.auth_header() {
            request = request.with_header(name, value);
        }

        let response = self.transport.get(request).await?;

        if response.status == 429 {
            let retry_after = response
                .header("retry-after")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            tracing::warn!(dataset = key, ?retry_after, "rate limited by data service");
            return Err(FetchError::RateLimited {
                dataset: key.to_string(),
                retry_after,
            });
        }
        if !response.is_success() {
            return Err(FetchError::Remote {
                status: response.status,
                body: response.body_text(),
            });
        }

        let rows: Vec<Value> = serde_json::from_slice(&response.body)?;
        let rows = Arc::new(rows);
        tracing::debug!(dataset = key, rows = rows.len(), "fetched");
        self.cache
            .set(url, Arc::clone(&rows), self.ttl_for(descriptor));
        Ok(rows)
    }

    /// Like [`fetch`](Self::fetch) but decodes every row into `T`.
    pub async fn fetch_as<T: DeserializeOwned>(
        &self,
        key: &str,
        query: &QuerySpec,
        options: FetchOptions,
    ) -> Result<Vec<T>, FetchError> {
        let rows = self.fetch(key, query, options).await?;
        rows.iter()
            .map(|row| T::deserialize(row).map_err(FetchError::from))
            .collect()
    }

    /// Walks `$offset` until a short page or `max_records` rows.
    ///
    /// Pages always go to the network; the cache is not consulted.
    pub async fn fetch_all_pages(
        &self,
        key: &str,
        query: &QuerySpec,
        max_records: usize,
    ) -> Result<Vec<Value>, FetchError> {
        let page_size = query
            .limit
            .unwrap_or(self.config.default_limit)
            .min(self.config.max_limit)
            .max(1);
        let mut offset = query.offset.unwrap_or(0);
        let mut all: Vec<Value> = Vec::new();

        while all.len() < max_records {
            let page_query = query.clone().limit(page_size).offset(offset);
            let page = self.fetch(key, &page_query, FetchOptions::fresh()).await?;
            tracing::debug!(dataset = key, offset, rows = page.len(), "fetched page");
            all.extend(page.iter().cloned());

            if page.len() < page_size as usize {
                break;
            }
            offset += u64::from(page_size);
        }

        all.truncate(max_records);
        Ok(all)
    }

    /// Grouped aggregate query, cached like any other fetch.
    pub async fn fetch_aggregation(
        &self,
        key: &str,
        aggregation: Aggregation<'_>,
    ) -> Result<Rows, FetchError> {
        let query = QuerySpec {
            select: Some(aggregation.select.to_string()),
            group: Some(aggregation.group.to_string()),
            filter: aggregation.filter.map(str::to_string),
            order: Some(aggregation.order.unwrap_or(AGGREGATION_ORDER).to_string()),
            limit: Some(aggregation.limit.unwrap_or(self.config.default_limit)),
            ..QuerySpec::default()
        };
        self.fetch(key, &query, FetchOptions::default()).await
    }

    /// Drops cached responses for one dataset, or everything when `key` is
    /// `None`.
    pub fn invalidate(&self, key: Option<&str>) -> Result<usize, FetchError> {
        match key {
            Some(key) => {
                let id = self.descriptor(key)?.id.clone();
                let dropped = self.cache.invalidate_dataset(&id);
                tracing::debug!(dataset = key, dropped, "invalidated cache");
                Ok(dropped)
            }
            None => {
                let dropped = self.cache.len();
                self.cache.clear();
                tracing::debug!(dropped, "cleared cache");
                Ok(dropped)
            }
        }
    }
}

impl std::fmt::Debug for DatasetFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetFetcher")
            .field("datasets", &self.registry.len())
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish()
    }
}

/// Arguments of [`DatasetFetcher::fetch_aggregation`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aggregation<'a> {
    pub select: &'a str,
    pub group: &'a str,
    pub filter: Option<&'a str>,
    pub order: Option<&'a str>,
    pub limit: Option<u32>,
}

impl<'a> Aggregation<'a> {
    pub fn new(select: &'a str, group: &'a str) -> Self {
        Self {
            select,
            group,
            ..Self::default()
        }
    }

    pub fn filter(mut self, filter: &'a str) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order(mut self, order: &'a str) -> Self {
        self.order = Some(order);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{Aggregation, DatasetFetcher, FetchOptions};
    use crate::config::FetcherConfig;
    use crate::error::FetchError;
    use crate::query::QuerySpec;
    use crate::transport::{BoxFuture, HttpRequest, HttpResponse, Transport, TransportError};
    use catalog::{DatasetDescriptor, Registry};
    use foundation::time::ManualClock;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;

    type Responder = Box<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

    /// In-memory transport recording every request it serves.
    struct FakeTransport {
        requests: Mutex<Vec<HttpRequest>>,
        respond: Responder,
    }

    impl FakeTransport {
        fn new(respond: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            })
        }

        /// Serves `total` rows `{ "n": i }`, honoring `$offset` and `$limit`.
        fn paged(total: usize) -> Arc<Self> {
            Self::new(move |req| {
                let url = url::Url::parse(&req.url).unwrap();
                let param = |name: &str| {
                    url.query_pairs()
                        .find(|(k, _)| k == name)
                        .map(|(_, v)| v.parse::<usize>().unwrap())
                };
                let offset = param("$offset").unwrap_or(0);
                let limit = param("$limit").unwrap_or(1000);
                let rows: Vec<Value> = (offset..total.min(offset + limit))
                    .map(|n| json!({ "n": n }))
                    .collect();
                HttpResponse::new(200, serde_json::to_vec(&rows).unwrap())
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().len()
        }

        fn last_url(&self) -> String {
            self.requests.lock().last().map(|r| r.url.clone()).unwrap_or_default()
        }
    }

    impl Transport for FakeTransport {
        fn get(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
            let response = (self.respond)(&request);
            self.requests.lock().push(request);
            Box::pin(async move { Ok(response) })
        }
    }

    fn registry() -> Arc<Registry> {
        let mut registry = Registry::new("http://data.test");
        registry
            .register(
                DatasetDescriptor::socrata("fireIncidents", "wr8u-xric", "Fire Incidents")
                    .with_default_sort("incident_date DESC"),
            )
            .unwrap();
        registry
            .register(
                DatasetDescriptor::socrata("dispatch911Realtime", "gnap-fj3t", "911 Realtime")
                    .with_cache_ttl(Duration::from_secs(60)),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn fetcher(transport: Arc<FakeTransport>) -> (Arc<ManualClock>, DatasetFetcher) {
        let clock = Arc::new(ManualClock::new());
        let fetcher = DatasetFetcher::with_clock(
            registry(),
            transport,
            FetcherConfig::default(),
            clock.clone(),
        );
        (clock, fetcher)
    }

    #[tokio::test]
    async fn applies_descriptor_defaults_under_caller_query() {
        let transport = FakeTransport::paged(3);
        let (_clock, fetcher) = fetcher(transport.clone());

        let rows = fetcher
            .fetch("fireIncidents", &QuerySpec::new().filter("battalion = 'B02'"), FetchOptions::default())
            .await
            .unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(
            transport.last_url(),
            "http://data.test/resource/wr8u-xric.json?%24where=battalion+%3D+%27B02%27&%24order=incident_date+DESC&%24limit=1000"
        );
        let requests = transport.requests.lock();
        assert_eq!(requests[0].header("accept"), Some("application/json"));
        assert_eq!(requests[0].header("x-app-token"), None);
    }

    #[tokio::test]
    async fn serves_cache_within_ttl_and_refetches_once_after() {
        let transport = FakeTransport::paged(5);
        let (clock, fetcher) = fetcher(transport.clone());
        let q = QuerySpec::new().limit(5);

        let first = fetcher.fetch("fireIncidents", &q, FetchOptions::default()).await.unwrap();
        clock.advance(Duration::from_secs(5 * 60));
        let second = fetcher.fetch("fireIncidents", &q, FetchOptions::default()).await.unwrap();
        assert_eq!(transport.calls(), 1);
        assert!(Arc::ptr_eq(&first, &second));

        clock.advance(Duration::from_millis(1));
        fetcher.fetch("fireIncidents", &q, FetchOptions::default()).await.unwrap();
        fetcher.fetch("fireIncidents", &q, FetchOptions::default()).await.unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn descriptor_ttl_override_applies() {
        let transport = FakeTransport::paged(1);
        let (clock, fetcher) = fetcher(transport.clone());
        let q = QuerySpec::new();

        fetcher.fetch("dispatch911Realtime", &q, FetchOptions::default()).await.unwrap();
        clock.advance(Duration::from_secs(61));
        fetcher.fetch("dispatch911Realtime", &q, FetchOptions::default()).await.unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn configured_default_ttl_drives_the_cache() {
        let transport = FakeTransport::paged(1);
        let clock = Arc::new(ManualClock::new());
        let config = FetcherConfig::default().with_default_ttl(Duration::from_secs(30));
        let fetcher = DatasetFetcher::with_clock(registry(), transport.clone(), config, clock.clone());
        assert_eq!(fetcher.cache_ttl("fireIncidents").unwrap(), Duration::from_secs(30));
        assert_eq!(fetcher.cache_ttl("dispatch911Realtime").unwrap(), Duration::from_secs(60));
        assert!(matches!(fetcher.cache_ttl("nope"), Err(FetchError::UnknownDataset(_))));

        let q = QuerySpec::new();
        fetcher.fetch("fireIncidents", &q, FetchOptions::default()).await.unwrap();
        clock.advance(Duration::from_secs(31));
        fetcher.fetch("fireIncidents", &q, FetchOptions::default()).await.unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn skip_cache_goes_to_network() {
        let transport = FakeTransport::paged(1);
        let (_clock, fetcher) = fetcher(transport.clone());
        let q = QuerySpec::new();

        fetcher.fetch("fireIncidents", &q, FetchOptions::default()).await.unwrap();
        fetcher.fetch("fireIncidents", &q, FetchOptions::fresh()).await.unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn fetch_all_pages_walks_offsets_until_short_page() {
        let transport = FakeTransport::paged(150);
        let (_clock, fetcher) = fetcher(transport.clone());

        let rows = fetcher
            .fetch_all_pages("fireIncidents", &QuerySpec::new().limit(50), 50_000)
            .await
            .unwrap();

        assert_eq!(transport.calls(), 4);
        assert_eq!(rows.len(), 150);
        let ns: Vec<u64> = rows.iter().map(|r| r["n"].as_u64().unwrap()).collect();
        assert_eq!(ns, (0..150).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn fetch_all_pages_stops_at_max_records() {
        let transport = FakeTransport::paged(500);
        let (_clock, fetcher) = fetcher(transport.clone());

        let rows = fetcher
            .fetch_all_pages("fireIncidents", &QuerySpec::new().limit(40).offset(10), 100)
            .await
            .unwrap();

        assert_eq!(transport.calls(), 3);
        assert_eq!(rows.len(), 100);
        assert_eq!(rows[0]["n"], json!(10));
        assert_eq!(rows[99]["n"], json!(109));
    }

    #[tokio::test]
    async fn aggregation_defaults_order_and_limit() {
        let transport = FakeTransport::new(|_| HttpResponse::new(200, r#"[{"battalion":"B02","count":"7"}]"#));
        let (_clock, fetcher) = fetcher(transport.clone());

        let rows = fetcher
            .fetch_aggregation(
                "fireIncidents",
                Aggregation::new("battalion, count(*) AS count", "battalion"),
            )
            .await
            .unwrap();

        assert_eq!(rows[0]["count"], json!("7"));
        assert_eq!(
            transport.last_url(),
            "http://data.test/resource/wr8u-xric.json?%24select=battalion%2C+count%28*%29+AS+count&%24group=battalion&%24order=count%28*%29+DESC&%24limit=1000"
        );
    }

    #[tokio::test]
    async fn invalidate_is_scoped_to_one_dataset() {
        let transport = FakeTransport::paged(1);
        let (_clock, fetcher) = fetcher(transport.clone());
        let q = QuerySpec::new();

        fetcher.fetch("fireIncidents", &q, FetchOptions::default()).await.unwrap();
        fetcher.fetch("dispatch911Realtime", &q, FetchOptions::default()).await.unwrap();
        assert_eq!(fetcher.invalidate(Some("fireIncidents")).unwrap(), 1);

        fetcher.fetch("fireIncidents", &q, FetchOptions::default()).await.unwrap();
        fetcher.fetch("dispatch911Realtime", &q, FetchOptions::default()).await.unwrap();
        assert_eq!(transport.calls(), 3);

        assert_eq!(fetcher.invalidate(None).unwrap(), 2);
        assert!(fetcher.cache().is_empty());
        assert!(matches!(
            fetcher.invalidate(Some("nope")),
            Err(FetchError::UnknownDataset(k)) if k == "nope"
        ));
    }

    #[tokio::test]
    async fn maps_error_statuses() {
        let transport = FakeTransport::new(|req| {
            if req.url.contains("wr8u-xric") {
                HttpResponse::new(429, "").with_header("Retry-After", "30")
            } else {
                HttpResponse::new(500, "internal")
            }
        });
        let (_clock, fetcher) = fetcher(transport.clone());

        let err = fetcher
            .fetch("fireIncidents", &QuerySpec::new(), FetchOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));

        let err = fetcher
            .fetch("dispatch911Realtime", &QuerySpec::new(), FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Remote { status: 500, ref body } if body == "internal"));

        // Failures are never cached.
        assert!(fetcher.cache().is_empty());
    }

    #[tokio::test]
    async fn unknown_dataset_and_bad_bodies() {
        let transport = FakeTransport::new(|_| HttpResponse::new(200, "not json"));
        let (_clock, fetcher) = fetcher(transport.clone());

        let err = fetcher
            .fetch("bogus", &QuerySpec::new(), FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::UnknownDataset(ref k) if k == "bogus"));
        assert_eq!(transport.calls(), 0);

        let err = fetcher
            .fetch("fireIncidents", &QuerySpec::new(), FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }

    #[tokio::test]
    async fn fetch_as_decodes_rows() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Row {
            n: u32,
        }
        let transport = FakeTransport::paged(2);
        let (_clock, fetcher) = fetcher(transport);

        let rows: Vec<Row> = fetcher
            .fetch_as("fireIncidents", &QuerySpec::new(), FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(rows, vec![Row { n: 0 }, Row { n: 1 }]);
    }
}
