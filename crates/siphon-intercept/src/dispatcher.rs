//! Interception dispatcher.
//!
//! Every paused exchange goes through [`InterceptionDispatcher::dispatch`],
//! which decides a [`Disposition`] and then issues it. Steps never issue
//! commands themselves; they return results that are logged here and
//! folded into the safest disposition, so each pause is answered exactly
//! once even when a step fails or panics.
//!
//! ```text
//! Request:  blocked?  -> fail("Aborted")
//!           events    -> Request to matching rule sets
//!           cache hit -> (revalidate) -> fulfill
//!           otherwise -> continue
//! Response: 200 + cacheable -> write-through
//!           events    -> Response to matching rule sets
//!           continue
//! ```

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use siphon_core::{
    format_http_date, headers_visible_to, now_millis, validity_from_headers, BlockPolicy, Body,
    CacheInfo, CachePolicy, EngineConfig, Headers, PostBody, RuleRegistry, RuleSetSpec,
};
use siphon_storage::{CacheRecord, CacheStore};
use tokio::sync::{broadcast, mpsc, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::{AttachedChannel, InstrumentationChannel, PausedExchange, ResourceType, Stage};
use crate::error::Result;
use crate::events::{EventBus, InterceptEvent};
use crate::revalidator::{ValidationResult, Validator};
use crate::stats::{DispatcherStats, StatsSnapshot};

/// Failure reason given to blocked requests.
pub const BLOCKED_REASON: &str = "Aborted";

/// Value of the cache marker header on served responses.
pub const CACHE_MARKER_VALUE: &str = "HIT";

/// Response headers refreshed from a 304 answer.
const REFRESHED_ON_304: &[&str] = &["cache-control", "expires", "etag", "last-modified"];

/// The single command answering a pause.
#[derive(Debug)]
enum Disposition {
    Continue,
    Fail(&'static str),
    Fulfill(CacheHit),
}

/// A response synthesized from the cache.
#[derive(Debug)]
struct CacheHit {
    headers: Headers,
    body: Body,
    /// The body was just downloaded by a revalidation.
    downloaded: bool,
}

struct Attachment {
    channel: Arc<AttachedChannel>,
    pump: JoinHandle<()>,
}

struct Inner {
    rules: RwLock<RuleRegistry>,
    store: Arc<CacheStore>,
    validator: Arc<dyn Validator>,
    cache_policy: CachePolicy,
    block_policy: BlockPolicy,
    marker_header: String,
    events: EventBus,
    stats: DispatcherStats,
    in_flight: Mutex<HashMap<String, Stage>>,
}

/// Interception dispatcher for one instrumentation channel at a time.
///
/// Several dispatchers may share a [`CacheStore`]; each owns its rule sets.
pub struct InterceptionDispatcher {
    inner: Arc<Inner>,
    attachment: Mutex<Option<Attachment>>,
}

impl InterceptionDispatcher {
    /// Creates a dispatcher with its own event bus.
    pub fn new(store: Arc<CacheStore>, validator: Arc<dyn Validator>, config: &EngineConfig) -> Self {
        Self::with_event_bus(store, validator, config, EventBus::default())
    }

    /// Creates a dispatcher publishing to an existing bus.
    pub fn with_event_bus(
        store: Arc<CacheStore>,
        validator: Arc<dyn Validator>,
        config: &EngineConfig,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                rules: RwLock::new(RuleRegistry::new()),
                store,
                validator,
                cache_policy: config.cache_policy(),
                block_policy: config.block_policy(),
                marker_header: config.cache_marker_header.clone(),
                events,
                stats: DispatcherStats::default(),
                in_flight: Mutex::new(HashMap::new()),
            }),
            attachment: Mutex::new(None),
        }
    }

    /// Registers a rule set, replacing any set with the same marker.
    pub fn add_rule_set(&self, spec: &RuleSetSpec) -> siphon_core::Result<bool> {
        self.inner.rules.write().add_rule_set(spec)
    }

    /// Unregisters a rule set.
    pub fn remove_rule_set(&self, marker: &str) -> bool {
        self.inner.rules.write().remove(marker)
    }

    pub fn rule_set_count(&self) -> usize {
        self.inner.rules.read().len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InterceptEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Exchanges paused and not yet answered.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Starts serving a channel. Any previous attachment is torn down first.
    pub async fn attach(
        &self,
        channel: Arc<dyn InstrumentationChannel>,
        mut exchanges: mpsc::Receiver<PausedExchange>,
    ) {
        self.detach().await;

        let channel = Arc::new(AttachedChannel::new(channel));
        let inner = self.inner.clone();
        let pump_channel = channel.clone();
        let pump = tokio::spawn(async move {
            while let Some(exchange) = exchanges.recv().await {
                let inner = inner.clone();
                let channel = pump_channel.clone();
                tokio::spawn(async move {
                    inner.dispatch(channel.as_ref(), exchange).await;
                });
            }
            debug!("Exchange stream closed");
        });

        *self.attachment.lock() = Some(Attachment { channel, pump });
        info!("Dispatcher attached");
    }

    /// Stops serving the current channel. Pending commands become no-ops.
    pub async fn detach(&self) {
        let previous = self.attachment.lock().take();
        if let Some(attachment) = previous {
            attachment.pump.abort();
            attachment.channel.release().await;
            info!("Dispatcher detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.lock().is_some()
    }

    /// Handles one paused exchange and answers it on `channel`.
    pub async fn dispatch(&self, channel: &dyn InstrumentationChannel, exchange: PausedExchange) {
        self.inner.dispatch(channel, exchange).await;
    }
}

impl Inner {
    async fn dispatch(&self, channel: &dyn InstrumentationChannel, exchange: PausedExchange) {
        self.stats.exchange();
        self.in_flight
            .lock()
            .insert(exchange.exchange_id.clone(), exchange.stage);

        let decided = AssertUnwindSafe(self.decide(channel, &exchange))
            .catch_unwind()
            .await;
        let disposition = decided.unwrap_or_else(|_| {
            error!(
                "Handler panicked on {} {}, letting it through",
                exchange.method, exchange.url
            );
            Disposition::Continue
        });

        let delivered = self.issue(channel, &exchange, &disposition).await;
        self.in_flight.lock().remove(&exchange.exchange_id);

        if let (true, Disposition::Fulfill(hit)) = (delivered, disposition) {
            self.after_hit(&exchange, hit);
        }
    }

    async fn decide(&self, channel: &dyn InstrumentationChannel, exchange: &PausedExchange) -> Disposition {
        match exchange.stage {
            Stage::Request => self.on_request(exchange).await,
            Stage::Response => self.on_response(channel, exchange).await,
        }
    }

    /// Sends the disposition. Returns false if it could not be delivered as
    /// decided.
    async fn issue(
        &self,
        channel: &dyn InstrumentationChannel,
        exchange: &PausedExchange,
        disposition: &Disposition,
    ) -> bool {
        let id = exchange.exchange_id.as_str();
        let mut as_decided = true;
        let result = match disposition {
            Disposition::Continue => {
                if exchange.stage == Stage::Request {
                    self.stats.passed_through();
                }
                channel.continue_exchange(id).await
            }
            Disposition::Fail(reason) => {
                self.stats.blocked();
                channel.fail(id, reason).await
            }
            Disposition::Fulfill(hit) => {
                self.stats.served_from_cache();
                match channel.fulfill(id, 200, &hit.headers, &hit.body).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        warn!("Fulfill of {} refused ({}), continuing instead", exchange.url, e);
                        as_decided = false;
                        channel.continue_exchange(id).await
                    }
                }
            }
        };

        if let Err(e) = result {
            error!(
                "Disposition for {} {} not delivered ({}): {}",
                exchange.method,
                exchange.url,
                e.kind(),
                e
            );
            return false;
        }
        as_decided
    }

    // === Request stage ===

    async fn on_request(&self, exchange: &PausedExchange) -> Disposition {
        if self.block_policy.is_blocked(&exchange.url) {
            debug!("Blocked {}", exchange.url);
            return Disposition::Fail(BLOCKED_REASON);
        }

        self.emit_requests(exchange);

        if exchange.resource_type == ResourceType::Document
            || !self.cache_policy.method_allows(&exchange.method, &exchange.url)
        {
            return Disposition::Continue;
        }

        match self.serve_from_cache(exchange).await {
            Ok(Some(hit)) => {
                debug!("Serving {} from cache", exchange.url);
                Disposition::Fulfill(hit)
            }
            Ok(None) => Disposition::Continue,
            Err(e) => {
                warn!("Cache lookup for {} failed ({}): {}", exchange.url, e.kind(), e);
                Disposition::Continue
            }
        }
    }

    async fn serve_from_cache(&self, exchange: &PausedExchange) -> Result<Option<CacheHit>> {
        let Some(mut record) = self.store.lookup(&exchange.url).await? else {
            return Ok(None);
        };

        let mut downloaded = false;
        if record.info.needs_revalidation(now_millis()) {
            let result = self
                .validator
                .revalidate(&exchange.method, &record, &exchange.request_headers)
                .await;

            match (result.accepted, result.status_code) {
                (true, Some(200)) => match self.store_download(exchange, &record, result).await? {
                    Some(updated) => {
                        record = updated;
                        downloaded = true;
                    }
                    None => return Ok(None),
                },
                (true, Some(304)) => record = self.refresh_not_modified(record, result).await?,
                (accepted, status) => {
                    debug!(
                        "Revalidation of {} unusable (accepted={}, status={:?})",
                        exchange.url, accepted, status
                    );
                    return Ok(None);
                }
            }
            self.stats.revalidated();
        }

        let body = self.store.read_body(&record).await?.into_base64();
        let headers = served_headers(
            &record.info.response_headers,
            record.info.date,
            now_millis(),
            &self.marker_header,
        );

        Ok(Some(CacheHit {
            headers,
            body,
            downloaded,
        }))
    }

    /// Replaces a record with a fresh 200 from the revalidator. `None` when
    /// the new response may not be cached.
    async fn store_download(
        &self,
        exchange: &PausedExchange,
        record: &CacheRecord,
        result: ValidationResult,
    ) -> Result<Option<CacheRecord>> {
        let headers = result.response_headers.unwrap_or_default();
        if !self
            .cache_policy
            .should_cache(&exchange.method, &exchange.url, &headers)
        {
            return Ok(None);
        }

        let now = Utc::now();
        let Some(validity) = validity_from_headers(&headers, now) else {
            return Ok(None);
        };

        let mut info = CacheInfo::new(
            exchange.request_headers.clone(),
            headers.without(&["age"]),
            now.timestamp_millis(),
            validity,
        );
        info.post_body = record.info.post_body.clone();

        let body = body_like(result.body.unwrap_or_default(), !record.info.body_is_binary);
        Ok(Some(self.store.put(&exchange.url, info, &body).await?))
    }

    /// Keeps the stored body and refreshes date and freshness from a 304.
    async fn refresh_not_modified(
        &self,
        record: CacheRecord,
        result: ValidationResult,
    ) -> Result<CacheRecord> {
        let answer = result.response_headers.unwrap_or_default();
        let now = Utc::now();

        let mut info = record.info.clone();
        let date = answer
            .get("date")
            .map(str::to_string)
            .unwrap_or_else(|| format_http_date(now));
        info.response_headers.set("Date", date);
        for name in REFRESHED_ON_304 {
            if let Some(value) = answer.get(name) {
                info.response_headers.set(name, value);
            }
        }
        info.date = now.timestamp_millis();
        if let Some(validity) = validity_from_headers(&info.response_headers, now) {
            info.apply_validity(validity);
        }

        match self.store.update_info(&record.url, info.clone()).await? {
            Some(updated) => Ok(updated),
            None => Ok(CacheRecord { info, ..record }),
        }
    }

    fn after_hit(&self, exchange: &PausedExchange, hit: CacheHit) {
        self.emit_responses(exchange, 200, &hit.headers, Some(&hit.body), true);

        if !hit.downloaded {
            let bytes = hit.body.decoded_len();
            self.stats.saved(bytes);
            self.events.emit(InterceptEvent::LoadedFromCache { bytes });
        }
    }

    // === Response stage ===

    async fn on_response(&self, channel: &dyn InstrumentationChannel, exchange: &PausedExchange) -> Disposition {
        let status = exchange.status_code.unwrap_or_default();
        let response_headers = exchange.response_headers.clone().unwrap_or_default();
        let body: OnceCell<Option<Body>> = OnceCell::new();
        let fetch = || fetch_body(channel, &exchange.exchange_id);

        if status == 200
            && self
                .cache_policy
                .should_cache(&exchange.method, &exchange.url, &response_headers)
        {
            if let Some(captured) = body.get_or_init(fetch).await {
                if let Err(e) = self.write_through(exchange, &response_headers, captured).await {
                    warn!("Caching {} failed ({}): {}", exchange.url, e.kind(), e);
                }
            }
        }

        if self.has_response_subscribers(&exchange.url) {
            let body = body.get_or_init(fetch).await;
            self.emit_responses(exchange, status, &response_headers, body.as_ref(), false);
        }

        Disposition::Continue
    }

    async fn write_through(&self, exchange: &PausedExchange, headers: &Headers, body: &Body) -> Result<()> {
        let now = Utc::now();
        let Some(validity) = validity_from_headers(headers, now) else {
            debug!("{} is not storable", exchange.url);
            return Ok(());
        };

        let mut info = CacheInfo::new(
            exchange.request_headers.clone(),
            headers.without(&["age"]),
            now.timestamp_millis(),
            validity,
        );
        info.post_body = post_body(exchange);

        self.store.put(&exchange.url, info, body).await?;
        Ok(())
    }

    // === Events ===

    fn emit_requests(&self, exchange: &PausedExchange) {
        let events: Vec<InterceptEvent> = self
            .rules
            .read()
            .request_subscribers(&exchange.url)
            .map(|set| InterceptEvent::Request {
                marker: set.marker.clone(),
                method: exchange.method.clone(),
                url: exchange.url.clone(),
                headers: headers_visible_to(&exchange.request_headers, &set.request_header_filter),
            })
            .collect();

        for event in events {
            self.events.emit(event);
        }
    }

    fn has_response_subscribers(&self, url: &str) -> bool {
        self.rules.read().response_subscribers(url).next().is_some()
    }

    fn emit_responses(
        &self,
        exchange: &PausedExchange,
        status_code: u16,
        response_headers: &Headers,
        body: Option<&Body>,
        synthetic: bool,
    ) {
        let post = post_body(exchange);
        let events: Vec<InterceptEvent> = self
            .rules
            .read()
            .response_subscribers(&exchange.url)
            .map(|set| InterceptEvent::Response {
                marker: set.marker.clone(),
                method: exchange.method.clone(),
                url: exchange.url.clone(),
                status_code,
                headers: headers_visible_to(&exchange.request_headers, &set.request_header_filter),
                response_headers: headers_visible_to(response_headers, &set.response_header_filter),
                body: body.cloned(),
                post: post.clone(),
                synthetic,
            })
            .collect();

        for event in events {
            self.events.emit(event);
        }
    }
}

async fn fetch_body(channel: &dyn InstrumentationChannel, exchange_id: &str) -> Option<Body> {
    match channel.fetch_body(exchange_id).await {
        Ok(body) => Some(body),
        Err(e) => {
            warn!("Body of {} unavailable ({}): {}", exchange_id, e.kind(), e);
            None
        }
    }
}

fn post_body(exchange: &PausedExchange) -> Option<PostBody> {
    if !exchange.method.eq_ignore_ascii_case("POST") {
        return None;
    }
    exchange
        .post_data
        .as_ref()
        .map(|data| PostBody::from_request(data.clone(), &exchange.request_headers))
}

/// Stored headers as served: `Age` recomputed, cache marker added.
fn served_headers(stored: &Headers, date_ms: i64, now_ms: i64, marker_header: &str) -> Headers {
    let mut headers = stored.without(&["age"]);
    let age = ((now_ms - date_ms) / 1000).max(1);
    headers.push("Age", age.to_string());
    headers.push(marker_header, CACHE_MARKER_VALUE);
    headers
}

fn body_like(bytes: Vec<u8>, prefer_text: bool) -> Body {
    if prefer_text {
        match String::from_utf8(bytes) {
            Ok(text) => Body::text(text),
            Err(e) => Body::from_bytes(e.as_bytes()),
        }
    } else {
        Body::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Command, RecordingChannel, ScriptedValidator};
    use siphon_core::{MatcherInput, Validity};
    use siphon_storage::{Database, StorageRoots};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::broadcast::error::TryRecvError;

    const IMAGE: &str = "https://cdn.example/series/1.png";

    struct Fixture {
        _dir: TempDir,
        store: Arc<CacheStore>,
        validator: Arc<ScriptedValidator>,
        dispatcher: InterceptionDispatcher,
        channel: Arc<RecordingChannel>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Database::in_memory().unwrap();
        let store = Arc::new(CacheStore::new(Arc::new(db), StorageRoots::under(dir.path())));
        let validator = Arc::new(ScriptedValidator::default());
        let dispatcher =
            InterceptionDispatcher::new(store.clone(), validator.clone(), &EngineConfig::default());
        Fixture {
            _dir: dir,
            store,
            validator,
            dispatcher,
            channel: Arc::new(RecordingChannel::default()),
        }
    }

    fn browser_headers() -> Headers {
        [
            ("Accept", "image/*"),
            ("User-Agent", "browser"),
            ("Cookie", "session=1"),
        ]
        .into_iter()
        .collect()
    }

    fn image_request(id: &str) -> PausedExchange {
        PausedExchange::request(id, "GET", IMAGE, browser_headers())
            .with_resource_type(ResourceType::Image)
    }

    fn drain(rx: &mut broadcast::Receiver<InterceptEvent>) -> Vec<InterceptEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return events,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
    }

    async fn seed(store: &CacheStore, valid_until: Option<i64>, bytes: &[u8]) -> CacheRecord {
        let stored: Headers = [
            ("Content-Type", "image/png"),
            ("ETag", "\"v1\""),
            ("Age", "999"),
        ]
        .into_iter()
        .collect();
        let date = now_millis() - 10_000;
        let validity = Validity {
            valid_until,
            revalidate: None,
            immutable: None,
        };
        let info = CacheInfo::new(Headers::new(), stored, date, validity);
        store.put(IMAGE, info, &Body::from_bytes(bytes)).await.unwrap()
    }

    fn fulfilled(command: &Command) -> (&Headers, &Body) {
        match command {
            Command::Fulfill {
                status, headers, body, ..
            } => {
                assert_eq!(*status, 200);
                (headers, body)
            }
            other => panic!("expected fulfill, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn blocked_request_fails_without_events() {
        let f = fixture();
        f.dispatcher
            .add_rule_set(&RuleSetSpec::new("all").requests(true).responses(true))
            .unwrap();
        let mut rx = f.dispatcher.subscribe();

        let exchange = PausedExchange::request(
            "1",
            "GET",
            "https://www.googletagmanager.com/gtm.js?id=1",
            Headers::new(),
        );
        f.dispatcher.dispatch(f.channel.as_ref(), exchange).await;

        assert_eq!(
            f.channel.commands(),
            vec![Command::Fail("1".into(), "Aborted".into())]
        );
        assert!(drain(&mut rx).is_empty());
        assert_eq!(f.dispatcher.stats().blocked, 1);
        assert_eq!(f.dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn miss_continues_and_emits_request_events() {
        let f = fixture();
        f.dispatcher
            .add_rule_set(
                &RuleSetSpec::new("reader")
                    .requests(MatcherInput::list(["cdn\\.example"]))
                    .request_headers(MatcherInput::list(["Accept"])),
            )
            .unwrap();
        let mut rx = f.dispatcher.subscribe();

        f.dispatcher.dispatch(f.channel.as_ref(), image_request("1")).await;

        assert_eq!(f.channel.commands(), vec![Command::Continue("1".into())]);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            InterceptEvent::Request { marker, headers, .. } => {
                assert_eq!(marker, "reader");
                assert_eq!(headers.keys().collect::<Vec<_>>(), vec!["accept"]);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(f.dispatcher.stats().passed_through, 1);
    }

    #[tokio::test]
    async fn response_fan_out_isolates_headers() {
        let f = fixture();
        f.dispatcher
            .add_rule_set(
                &RuleSetSpec::new("a")
                    .responses(true)
                    .request_headers(MatcherInput::list(["accept"]))
                    .response_headers(MatcherInput::list(["content-type"])),
            )
            .unwrap();
        f.dispatcher
            .add_rule_set(
                &RuleSetSpec::new("b")
                    .responses(true)
                    .request_headers(MatcherInput::list(["user-agent"])),
            )
            .unwrap();
        // Same marker again replaces instead of duplicating.
        f.dispatcher
            .add_rule_set(
                &RuleSetSpec::new("b")
                    .responses(true)
                    .request_headers(MatcherInput::list(["user-agent"])),
            )
            .unwrap();
        assert_eq!(f.dispatcher.rule_set_count(), 2);

        let mut rx = f.dispatcher.subscribe();
        f.channel.set_body("1", Body::text("<html/>"));
        let response: Headers = [("Content-Type", "text/html"), ("Server", "x")]
            .into_iter()
            .collect();
        let exchange = PausedExchange::request("1", "GET", "https://site.example/", browser_headers())
            .with_resource_type(ResourceType::Document)
            .into_response(200, response);

        f.dispatcher.dispatch(f.channel.as_ref(), exchange).await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        for event in &events {
            let InterceptEvent::Response {
                marker,
                headers,
                response_headers,
                body,
                synthetic,
                ..
            } = event
            else {
                panic!("unexpected event {:?}", event);
            };
            assert!(!synthetic);
            assert_eq!(body.as_ref(), Some(&Body::text("<html/>")));
            match marker.as_str() {
                "a" => {
                    assert_eq!(headers.keys().collect::<Vec<_>>(), vec!["accept"]);
                    assert_eq!(response_headers.keys().collect::<Vec<_>>(), vec!["content-type"]);
                }
                "b" => {
                    assert_eq!(headers.keys().collect::<Vec<_>>(), vec!["user-agent"]);
                    assert!(response_headers.is_empty());
                }
                other => panic!("unexpected marker {}", other),
            }
        }
        // One body fetch shared by caching and both subscribers.
        assert_eq!(f.channel.body_fetches(), 1);
        assert_eq!(f.channel.commands(), vec![Command::Continue("1".into())]);
    }

    #[tokio::test]
    async fn cacheable_response_is_written_through() {
        let f = fixture();
        f.channel.set_body("1", Body::from_bytes(&[1, 2, 3]));
        let response: Headers = [("Content-Type", "image/png"), ("Cache-Control", "max-age=3600")]
            .into_iter()
            .collect();

        let before = now_millis();
        f.dispatcher
            .dispatch(f.channel.as_ref(), image_request("1").into_response(200, response))
            .await;

        let record = f.store.lookup(IMAGE).await.unwrap().unwrap();
        let valid_until = record.info.valid_until.unwrap();
        assert!(valid_until >= before + 3_600_000);
        assert_eq!(record.info.revalidate, None);
        assert_eq!(
            f.store.read_body(&record).await.unwrap(),
            Body::from_bytes(&[1, 2, 3])
        );
        assert_eq!(f.channel.commands(), vec![Command::Continue("1".into())]);
    }

    #[tokio::test]
    async fn no_store_response_is_not_persisted() {
        let f = fixture();
        f.channel.set_body("1", Body::text("secret"));
        let response: Headers = [("Cache-Control", "no-store")].into_iter().collect();

        f.dispatcher
            .dispatch(f.channel.as_ref(), image_request("1").into_response(200, response))
            .await;

        assert!(f.store.lookup(IMAGE).await.unwrap().is_none());
        assert_eq!(f.channel.body_fetches(), 0);
        assert_eq!(f.channel.commands(), vec![Command::Continue("1".into())]);
    }

    #[tokio::test]
    async fn non_200_response_is_not_persisted() {
        let f = fixture();
        f.channel.set_body("1", Body::text("moved"));
        let response: Headers = [("Cache-Control", "max-age=60")].into_iter().collect();

        f.dispatcher
            .dispatch(f.channel.as_ref(), image_request("1").into_response(301, response))
            .await;

        assert!(f.store.lookup(IMAGE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fresh_hit_is_served_without_revalidation() {
        let f = fixture();
        seed(&f.store, Some(now_millis() + 60_000), b"png bytes").await;
        f.dispatcher
            .add_rule_set(&RuleSetSpec::new("reader").responses(true))
            .unwrap();
        let mut rx = f.dispatcher.subscribe();

        f.dispatcher.dispatch(f.channel.as_ref(), image_request("1")).await;

        let commands = f.channel.commands();
        let (headers, body) = fulfilled(&commands[0]);
        assert_eq!(body, &Body::from_bytes(b"png bytes"));
        assert_eq!(headers.get("x-siphon-cache"), Some(CACHE_MARKER_VALUE));
        let age: i64 = headers.get("age").unwrap().parse().unwrap();
        assert!(age >= 10);
        assert_eq!(headers.iter().filter(|h| h.name.eq_ignore_ascii_case("age")).count(), 1);
        assert_eq!(f.validator.calls(), 0);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            InterceptEvent::Response { synthetic: true, .. }
        )));
        assert!(events.contains(&InterceptEvent::LoadedFromCache { bytes: 9 }));
        assert_eq!(f.dispatcher.stats().bytes_saved, 9);
        assert_eq!(f.dispatcher.stats().served_from_cache, 1);
    }

    #[tokio::test]
    async fn stale_hit_with_304_serves_stored_body() {
        let f = fixture();
        let seeded = seed(&f.store, Some(now_millis() - 1), b"original").await;
        f.validator.push(ValidationResult {
            accepted: true,
            status_code: Some(304),
            response_headers: Some(
                [("ETag", "\"v1\""), ("Cache-Control", "max-age=600")]
                    .into_iter()
                    .collect(),
            ),
            body: None,
        });
        let mut rx = f.dispatcher.subscribe();

        f.dispatcher.dispatch(f.channel.as_ref(), image_request("1")).await;

        let commands = f.channel.commands();
        let (headers, body) = fulfilled(&commands[0]);
        assert_eq!(body, &Body::from_bytes(b"original"));
        let age: i64 = headers.get("age").unwrap().parse().unwrap();
        assert!(age >= 1);
        assert!(headers.get("date").is_some());
        assert_eq!(f.validator.calls(), 1);

        let record = f.store.lookup(IMAGE).await.unwrap().unwrap();
        assert!(record.info.date > seeded.info.date);
        assert!(record.info.valid_until.unwrap() > now_millis());
        assert!(drain(&mut rx).contains(&InterceptEvent::LoadedFromCache { bytes: 8 }));
        assert_eq!(f.dispatcher.stats().revalidated, 1);
    }

    #[tokio::test]
    async fn stale_hit_with_200_serves_new_body_without_savings() {
        let f = fixture();
        seed(&f.store, None, b"old").await;
        f.validator.push(ValidationResult {
            accepted: true,
            status_code: Some(200),
            response_headers: Some(
                [("Content-Type", "image/png"), ("Cache-Control", "max-age=60")]
                    .into_iter()
                    .collect(),
            ),
            body: Some(b"new".to_vec()),
        });
        let mut rx = f.dispatcher.subscribe();

        f.dispatcher.dispatch(f.channel.as_ref(), image_request("1")).await;

        let commands = f.channel.commands();
        let (_, body) = fulfilled(&commands[0]);
        assert_eq!(body, &Body::from_bytes(b"new"));

        let record = f.store.lookup(IMAGE).await.unwrap().unwrap();
        assert_eq!(f.store.read_body(&record).await.unwrap().to_bytes().unwrap(), b"new");
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, InterceptEvent::LoadedFromCache { .. })));
    }

    #[tokio::test]
    async fn uncacheable_200_revalidation_is_a_miss() {
        let f = fixture();
        seed(&f.store, None, b"old").await;
        f.validator.push(ValidationResult {
            accepted: true,
            status_code: Some(200),
            response_headers: Some([("Cache-Control", "no-store")].into_iter().collect()),
            body: Some(b"new".to_vec()),
        });

        f.dispatcher.dispatch(f.channel.as_ref(), image_request("1")).await;
        assert_eq!(f.channel.commands(), vec![Command::Continue("1".into())]);
    }

    #[tokio::test]
    async fn rejected_or_odd_revalidation_is_a_miss() {
        let f = fixture();
        seed(&f.store, None, b"old").await;
        f.validator.push(ValidationResult::rejected());
        f.validator.push(ValidationResult {
            accepted: true,
            status_code: Some(500),
            response_headers: None,
            body: None,
        });

        f.dispatcher.dispatch(f.channel.as_ref(), image_request("1")).await;
        f.dispatcher.dispatch(f.channel.as_ref(), image_request("2")).await;

        assert_eq!(
            f.channel.commands(),
            vec![Command::Continue("1".into()), Command::Continue("2".into())]
        );
        assert_eq!(f.validator.calls(), 2);
    }

    #[tokio::test]
    async fn documents_bypass_the_cache() {
        let f = fixture();
        seed(&f.store, Some(now_millis() + 60_000), b"x").await;

        let exchange = image_request("1").with_resource_type(ResourceType::Document);
        f.dispatcher.dispatch(f.channel.as_ref(), exchange).await;

        assert_eq!(f.channel.commands(), vec![Command::Continue("1".into())]);
    }

    #[tokio::test]
    async fn panicking_step_still_continues() {
        let f = fixture();
        seed(&f.store, None, b"x").await;
        f.validator.panic_next();

        f.dispatcher.dispatch(f.channel.as_ref(), image_request("1")).await;

        assert_eq!(f.channel.commands(), vec![Command::Continue("1".into())]);
        assert_eq!(f.dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn refused_fulfill_falls_back_to_continue() {
        let f = fixture();
        seed(&f.store, Some(now_millis() + 60_000), b"x").await;
        f.channel.refuse_fulfill();

        f.dispatcher.dispatch(f.channel.as_ref(), image_request("1")).await;

        assert_eq!(f.channel.commands(), vec![Command::Continue("1".into())]);
    }

    #[tokio::test]
    async fn attach_pumps_exchanges_and_detach_silences() {
        let f = fixture();
        let (tx, rx) = mpsc::channel(8);
        f.dispatcher.attach(f.channel.clone(), rx).await;
        assert!(f.dispatcher.is_attached());

        tx.send(image_request("1")).await.unwrap();
        f.channel.wait_for(1, Duration::from_secs(5)).await;
        assert_eq!(f.channel.commands(), vec![Command::Continue("1".into())]);

        // Re-attaching tears the first attachment down.
        let second = Arc::new(RecordingChannel::default());
        let (_tx2, rx2) = mpsc::channel(8);
        f.dispatcher.attach(second.clone(), rx2).await;
        assert_eq!(f.channel.detach_count(), 1);

        f.dispatcher.detach().await;
        assert!(!f.dispatcher.is_attached());
        assert_eq!(second.detach_count(), 1);
    }

    #[tokio::test]
    async fn dispatchers_share_one_store() {
        let f = fixture();
        let hidden = InterceptionDispatcher::new(
            f.store.clone(),
            f.validator.clone(),
            &EngineConfig::default(),
        );

        f.channel.set_body("1", Body::text("shared"));
        let response: Headers = [("Cache-Control", "max-age=60")].into_iter().collect();
        hidden
            .dispatch(f.channel.as_ref(), image_request("1").into_response(200, response))
            .await;

        f.dispatcher.dispatch(f.channel.as_ref(), image_request("2")).await;
        let commands = f.channel.commands();
        let (_, body) = fulfilled(&commands[1]);
        assert_eq!(body, &Body::text("shared").into_base64());
    }

    #[test]
    fn served_headers_recompute_age() {
        let stored: Headers = [("age", "100"), ("content-type", "image/png")]
            .into_iter()
            .collect();

        let headers = served_headers(&stored, 1_000, 1_200, "x-cache");
        assert_eq!(headers.get("age"), Some("1"));
        assert_eq!(headers.get("x-cache"), Some(CACHE_MARKER_VALUE));

        let headers = served_headers(&stored, 1_000, 31_000, "x-cache");
        assert_eq!(headers.get("age"), Some("30"));
    }
}
