//! Unit tests for both storage backends, plus the end-to-end scenarios of
//! §8 driven through [`http_cache_core::AsyncCacheProxy`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use http_cache_core::state_machine_api::CachedEntry;
use http_cache_core::{
    AsyncCacheProxy, CacheError, CacheOptions, Clock, EntryUpdate, NewEntry, Policy, Request, RequestSender, Response,
    StorageEngine,
};
use url::Url;
use uuid::Uuid;

use crate::{MemoryStorage, SqliteStorage};

fn hv(s: &str) -> HeaderValue {
    HeaderValue::from_str(s).unwrap()
}

fn request(method: Method, url: &str, headers: &[(&str, &str)]) -> Request {
    let mut h = HeaderMap::new();
    for (k, v) in headers {
        h.insert(http::HeaderName::from_bytes(k.as_bytes()).unwrap(), hv(v));
    }
    Request::new(method, Url::parse(url).unwrap(), h)
}

fn response(status: StatusCode, headers: &[(&str, &str)]) -> Response {
    let mut h = HeaderMap::new();
    for (k, v) in headers {
        h.insert(http::HeaderName::from_bytes(k.as_bytes()).unwrap(), hv(v));
    }
    Response::new(status, h)
}

/// A [`Clock`] a test can set and advance, so freshness math never depends on
/// real wall-clock time.
#[derive(Debug)]
struct FixedClock(Mutex<SystemTime>);

impl FixedClock {
    fn at(t: SystemTime) -> Arc<Self> {
        Arc::new(Self(Mutex::new(t)))
    }

    fn set(&self, t: SystemTime) {
        *self.0.lock().unwrap() = t;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> SystemTime {
        *self.0.lock().unwrap()
    }
}

/// A [`RequestSender`] that serves a queue of canned responses and counts
/// how many times it was invoked, so tests can assert the origin was (or
/// was not) contacted.
#[derive(Debug, Default)]
struct MockOrigin {
    responses: Mutex<VecDeque<(Response, Vec<u8>)>>,
    calls: AtomicUsize,
}

impl MockOrigin {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn queue(&self, response: Response, body: &[u8]) {
        self.responses.lock().unwrap().push_back((response, body.to_vec()));
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestSender for MockOrigin {
    async fn send(&self, _request: &Request) -> http_cache_core::Result<(Response, Vec<u8>)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| CacheError::OriginError(Box::new(std::io::Error::other("no queued response"))))
    }
}

mod memory_storage_unit_tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_of_a_complete_entry() {
        let storage = MemoryStorage::new();
        let req = request(Method::GET, "https://x/a", &[]);
        let resp = response(StatusCode::OK, &[("etag", r#""v1""#)]);
        let created = storage
            .create_entry(NewEntry { request: &req, response: Some(&resp), response_body: Some(b"hello"), cache_key: Some(b"key1".to_vec()), id: None })
            .await
            .unwrap();

        let found = storage.get_entries(b"key1").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].cache_key(), b"key1");
        assert_eq!(storage.read_body(created.id()).await.unwrap().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn incomplete_entries_are_invisible_until_attached() {
        let storage = MemoryStorage::new();
        let req = request(Method::GET, "https://x/a", &[]);
        let pending = storage.create_entry(NewEntry { request: &req, response: None, response_body: None, cache_key: None, id: None }).await.unwrap();

        assert!(storage.get_entries(b"key1").await.unwrap().is_empty());

        let resp = response(StatusCode::OK, &[]);
        storage.update_entry(pending.id(), EntryUpdate::Attach { response: &resp, response_body: b"ok", cache_key: b"key1".to_vec() }).await.unwrap();

        let found = storage.get_entries(b"key1").await.unwrap();
        assert_eq!(found.len(), 1, "became visible once completed");
    }

    #[tokio::test]
    async fn remove_entry_soft_deletes_and_hides_it() {
        let storage = MemoryStorage::new();
        let req = request(Method::GET, "https://x/a", &[]);
        let resp = response(StatusCode::OK, &[]);
        let created = storage
            .create_entry(NewEntry { request: &req, response: Some(&resp), response_body: Some(b"x"), cache_key: Some(b"k".to_vec()), id: None })
            .await
            .unwrap();

        storage.remove_entry(created.id()).await.unwrap();
        assert!(storage.get_entries(b"k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn merge_headers_replaces_headers_but_keeps_the_body() {
        let storage = MemoryStorage::new();
        let req = request(Method::GET, "https://x/a", &[]);
        let resp = response(StatusCode::OK, &[("etag", r#""v1""#), ("content-length", "5")]);
        let created = storage
            .create_entry(NewEntry { request: &req, response: Some(&resp), response_body: Some(b"hello"), cache_key: Some(b"k".to_vec()), id: None })
            .await
            .unwrap();

        let mut merged = HeaderMap::new();
        merged.insert(http::header::ETAG, hv(r#""v1""#));
        merged.insert(http::header::CACHE_CONTROL, hv("max-age=600"));
        let updated = storage.update_entry(created.id(), EntryUpdate::MergeHeaders(merged)).await.unwrap().unwrap();

        assert_eq!(updated.response_headers().get(http::header::CACHE_CONTROL).unwrap(), "max-age=600");
        assert_eq!(storage.read_body(created.id()).await.unwrap().unwrap(), b"hello", "304 merge never touches the stored body");
    }

    #[tokio::test]
    async fn update_on_a_removed_id_returns_none() {
        let storage = MemoryStorage::new();
        assert!(storage.update_entry(Uuid::new_v4(), EntryUpdate::Touch).await.unwrap().is_none());
    }
}

mod sqlite_storage_unit_tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_of_a_complete_entry() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let req = request(Method::GET, "https://x/a", &[]);
        let resp = response(StatusCode::OK, &[("etag", r#""v1""#)]);
        let created = storage
            .create_entry(NewEntry { request: &req, response: Some(&resp), response_body: Some(b"hello world"), cache_key: Some(b"key1".to_vec()), id: None })
            .await
            .unwrap();

        let found = storage.get_entries(b"key1").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].status().unwrap(), StatusCode::OK);
        assert_eq!(storage.read_body(created.id()).await.unwrap().unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn body_larger_than_one_chunk_reassembles_correctly() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let req = request(Method::GET, "https://x/a", &[]);
        let resp = response(StatusCode::OK, &[]);
        let body = vec![7u8; 400 * 1024];
        let created = storage
            .create_entry(NewEntry { request: &req, response: Some(&resp), response_body: Some(&body), cache_key: Some(b"k".to_vec()), id: None })
            .await
            .unwrap();

        let read_back = storage.read_body(created.id()).await.unwrap().unwrap();
        assert_eq!(read_back, body);
    }

    #[tokio::test]
    async fn incomplete_entry_completed_via_attach_becomes_visible() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let req = request(Method::GET, "https://x/a", &[("accept", "en")]);
        let pending = storage.create_entry(NewEntry { request: &req, response: None, response_body: None, cache_key: None, id: None }).await.unwrap();
        assert!(storage.get_entries(b"key1").await.unwrap().is_empty());

        let resp = response(StatusCode::OK, &[]);
        storage.update_entry(pending.id(), EntryUpdate::Attach { response: &resp, response_body: b"ok", cache_key: b"key1".to_vec() }).await.unwrap();

        let found = storage.get_entries(b"key1").await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn remove_entry_soft_deletes_and_hides_it() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let req = request(Method::GET, "https://x/a", &[]);
        let resp = response(StatusCode::OK, &[]);
        let created = storage
            .create_entry(NewEntry { request: &req, response: Some(&resp), response_body: Some(b"x"), cache_key: Some(b"k".to_vec()), id: None })
            .await
            .unwrap();

        storage.remove_entry(created.id()).await.unwrap();
        assert!(storage.get_entries(b"k").await.unwrap().is_empty());
    }
}

mod gc_unit_tests {
    use std::time::{Duration, SystemTime};

    use crate::gc::{past_abandon_age, past_soft_delete_grace, past_ttl, SweepGate, INCOMPLETE_ABANDON_AGE, SOFT_DELETE_GRACE};

    #[test]
    fn soft_delete_grace_period_boundary() {
        let now = SystemTime::now();
        let just_inside = now - (SOFT_DELETE_GRACE - Duration::from_secs(1));
        let just_past = now - (SOFT_DELETE_GRACE + Duration::from_secs(1));
        assert!(!past_soft_delete_grace(just_inside, now));
        assert!(past_soft_delete_grace(just_past, now));
    }

    #[test]
    fn abandon_age_boundary() {
        let now = SystemTime::now();
        assert!(!past_abandon_age(now - (INCOMPLETE_ABANDON_AGE - Duration::from_secs(1)), now));
        assert!(past_abandon_age(now - (INCOMPLETE_ABANDON_AGE + Duration::from_secs(1)), now));
    }

    #[test]
    fn ttl_expiry() {
        let now = SystemTime::now();
        let ttl = Duration::from_secs(60);
        assert!(!past_ttl(now - Duration::from_secs(30), now, ttl));
        assert!(past_ttl(now - Duration::from_secs(90), now, ttl));
    }

    #[test]
    fn sweep_gate_rate_limits_concurrent_callers() {
        let gate = SweepGate::new();
        let now = SystemTime::now();
        assert!(gate.should_sweep(now), "first sweep always allowed");
        assert!(!gate.should_sweep(now), "second immediate call is rate-limited");
        assert!(gate.should_sweep(now + Duration::from_secs(61)));
    }
}

/// Integration tests for Scenarios A-F (§8), each driving `AsyncCacheProxy`
/// over `MemoryStorage` and a queued `MockOrigin`.
mod scenarios {
    use super::*;

    fn proxy_with(options: CacheOptions) -> (AsyncCacheProxy<MemoryStorage, MockOrigin>, Arc<MockOrigin>, Arc<FixedClock>) {
        let origin = MockOrigin::new();
        let clock = FixedClock::at(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let storage = Arc::new(MemoryStorage::with_clock(clock.clone()));
        let proxy = AsyncCacheProxy::new(storage, origin.clone(), Policy::specification(options)).with_clock(clock.clone());
        (proxy, origin, clock)
    }

    #[tokio::test]
    async fn scenario_a_fresh_hit() {
        let (proxy, origin, clock) = proxy_with(CacheOptions::default());
        let t0 = clock.now();

        origin.queue(response(StatusCode::OK, &[("cache-control", "max-age=60")]), b"hello");
        let first = proxy.handle_request(request(Method::GET, "https://x/a", &[])).await.unwrap();
        assert_eq!(first.body, b"hello");
        assert!(!first.response.metadata.from_cache);
        assert!(first.response.metadata.stored);
        assert_eq!(origin.call_count(), 1);

        clock.set(t0 + Duration::from_secs(30));
        let second = proxy.handle_request(request(Method::GET, "https://x/a", &[])).await.unwrap();
        assert_eq!(second.body, b"hello");
        assert!(second.response.metadata.from_cache);
        assert!(!second.response.metadata.revalidated);
        assert_eq!(origin.call_count(), 1, "origin must not be contacted for a fresh hit");
    }

    #[tokio::test]
    async fn scenario_b_stale_304_revalidation() {
        let (proxy, origin, clock) = proxy_with(CacheOptions::default());
        let t0 = clock.now();

        origin.queue(response(StatusCode::OK, &[("cache-control", "max-age=60"), ("etag", r#""v1""#)]), b"hello");
        proxy.handle_request(request(Method::GET, "https://x/a", &[])).await.unwrap();

        clock.set(t0 + Duration::from_secs(120));
        origin.queue(response(StatusCode::NOT_MODIFIED, &[("etag", r#""v1""#)]), b"");
        let revalidated = proxy.handle_request(request(Method::GET, "https://x/a", &[])).await.unwrap();

        assert_eq!(revalidated.response.status, StatusCode::OK);
        assert_eq!(revalidated.body, b"hello");
        assert!(revalidated.response.metadata.from_cache);
        assert!(revalidated.response.metadata.revalidated);
        assert_eq!(origin.call_count(), 2);
    }

    #[tokio::test]
    async fn scenario_c_stale_replaced() {
        let (proxy, origin, clock) = proxy_with(CacheOptions::default());
        let t0 = clock.now();

        origin.queue(response(StatusCode::OK, &[("cache-control", "max-age=60"), ("etag", r#""v1""#)]), b"hello");
        proxy.handle_request(request(Method::GET, "https://x/a", &[])).await.unwrap();

        clock.set(t0 + Duration::from_secs(120));
        origin.queue(response(StatusCode::OK, &[("cache-control", "max-age=60"), ("etag", r#""v2""#)]), b"world");
        let replaced = proxy.handle_request(request(Method::GET, "https://x/a", &[])).await.unwrap();

        assert_eq!(replaced.body, b"world");
        assert!(!replaced.response.metadata.from_cache);
        assert!(replaced.response.metadata.stored);

        clock.set(t0 + Duration::from_secs(130));
        let third = proxy.handle_request(request(Method::GET, "https://x/a", &[])).await.unwrap();
        assert_eq!(third.body, b"world", "the replaced entry, not the invalidated one, serves subsequent hits");
        assert!(third.response.metadata.from_cache);
    }

    #[tokio::test]
    async fn scenario_d_vary() {
        let (proxy, origin, clock) = proxy_with(CacheOptions::default());
        let t0 = clock.now();

        origin.queue(response(StatusCode::OK, &[("vary", "Accept"), ("cache-control", "max-age=60")]), b"EN");
        proxy.handle_request(request(Method::GET, "https://x/r", &[("accept", "en")])).await.unwrap();

        origin.queue(response(StatusCode::OK, &[("vary", "Accept"), ("cache-control", "max-age=60")]), b"FR");
        proxy.handle_request(request(Method::GET, "https://x/r", &[("accept", "fr")])).await.unwrap();

        clock.set(t0 + Duration::from_secs(10));

        let en = proxy.handle_request(request(Method::GET, "https://x/r", &[("accept", "en")])).await.unwrap();
        assert_eq!(en.body, b"EN");
        assert!(en.response.metadata.from_cache);

        let fr = proxy.handle_request(request(Method::GET, "https://x/r", &[("accept", "fr")])).await.unwrap();
        assert_eq!(fr.body, b"FR");
        assert!(fr.response.metadata.from_cache);

        assert_eq!(origin.call_count(), 2);
        origin.queue(response(StatusCode::OK, &[("vary", "Accept"), ("cache-control", "max-age=60")]), b"DE");
        let de = proxy.handle_request(request(Method::GET, "https://x/r", &[("accept", "de")])).await.unwrap();
        assert_eq!(de.body, b"DE");
        assert_eq!(origin.call_count(), 3, "a third Accept value is a cache miss");
    }

    #[tokio::test]
    async fn scenario_e_only_if_cached_empty_cache() {
        let (proxy, origin, _clock) = proxy_with(CacheOptions::default());

        let result = proxy.handle_request(request(Method::GET, "https://x/nope", &[("cache-control", "only-if-cached")])).await.unwrap();

        assert_eq!(result.response.status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(origin.call_count(), 0, "only-if-cached must never contact the origin");
    }

    #[tokio::test]
    async fn scenario_f_unsafe_method_invalidation() {
        let (proxy, origin, clock) = proxy_with(CacheOptions::default());
        let t0 = clock.now();

        origin.queue(response(StatusCode::OK, &[("cache-control", "max-age=60")]), b"page");
        proxy.handle_request(request(Method::GET, "https://x/p", &[])).await.unwrap();

        clock.set(t0 + Duration::from_secs(5));
        origin.queue(response(StatusCode::OK, &[]), b"posted");
        proxy.handle_request(request(Method::POST, "https://x/p", &[])).await.unwrap();

        clock.set(t0 + Duration::from_secs(6));
        origin.queue(response(StatusCode::OK, &[("cache-control", "max-age=60")]), b"page again");
        let result = proxy.handle_request(request(Method::GET, "https://x/p", &[])).await.unwrap();

        assert_eq!(result.body, b"page again");
        assert_eq!(origin.call_count(), 3, "GET after POST must hit the origin again");
    }
}
