use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::{AGE, CACHE_CONTROL, CONTENT_LENGTH, DATE, ETAG, EXPIRES, LAST_MODIFIED, VARY};
use http::{HeaderMap, Method, StatusCode, Uri};
use tracing::debug;

use crate::error::Error;
use crate::interceptor::{Chain, Interceptor};
use crate::request::Request;
use crate::response::{Response, ResponseBody};
use crate::util::lock_unpoisoned;

/// Cache identity: method plus canonicalized URL. `Vary` matching happens in
/// the stage, against the header values captured at store time.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: Method,
    uri: String,
}

impl CacheKey {
    pub fn new(request: &Request) -> Self {
        Self {
            method: request.method().clone(),
            uri: canonical_uri(request.uri()),
        }
    }

    pub(crate) fn for_get(uri: &Uri) -> Self {
        Self {
            method: Method::GET,
            uri: canonical_uri(uri),
        }
    }
}

fn canonical_uri(uri: &Uri) -> String {
    let scheme = uri.scheme_str().unwrap_or("http").to_ascii_lowercase();
    let host = uri.host().unwrap_or_default().to_ascii_lowercase();
    let port = crate::util::default_port(uri).unwrap_or(80);
    let path_and_query = uri
        .path_and_query()
        .map(|value| value.as_str())
        .unwrap_or("/");
    format!("{scheme}://{host}:{port}{path_and_query}")
}

/// A stored response plus the request header values its `Vary` named.
/// `Vary: *` responses are never stored, so every entry's vary set is a
/// concrete field list.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    status: StatusCode,
    reason: String,
    headers: HeaderMap,
    body: Bytes,
    received_at: SystemTime,
    vary_fields: Vec<(String, Option<String>)>,
}

impl CachedEntry {
    pub fn new(
        status: StatusCode,
        reason: String,
        headers: HeaderMap,
        body: Bytes,
        received_at: SystemTime,
        vary_fields: Vec<(String, Option<String>)>,
    ) -> Self {
        Self {
            status,
            reason,
            headers,
            body,
            received_at,
            vary_fields,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    fn matches_vary(&self, request: &Request) -> bool {
        self.vary_fields.iter().all(|(name, stored)| {
            let current = request.header(name).map(ToOwned::to_owned);
            current == *stored
        })
    }

    fn is_fresh(&self, now: SystemTime, request_directives: &CacheControl) -> bool {
        let directives = CacheControl::parse(&self.headers);
        if directives.no_cache || request_directives.no_cache {
            return false;
        }
        self.age(now) < self.fresh_lifetime(&directives)
    }

    /// Current age: time since the entry was received, plus whatever `Age`
    /// the upstream reported when it was.
    fn age(&self, now: SystemTime) -> Duration {
        let elapsed = now
            .duration_since(self.received_at)
            .unwrap_or(Duration::ZERO);
        let reported = self
            .headers
            .get(AGE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::ZERO);
        elapsed + reported
    }

    fn fresh_lifetime(&self, directives: &CacheControl) -> Duration {
        if let Some(max_age) = directives.max_age {
            return max_age;
        }
        let expires = self
            .headers
            .get(EXPIRES)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| httpdate::parse_http_date(value).ok());
        if let Some(expires) = expires {
            let served = self
                .headers
                .get(DATE)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| httpdate::parse_http_date(value).ok())
                .unwrap_or(self.received_at);
            return expires.duration_since(served).unwrap_or(Duration::ZERO);
        }
        Duration::ZERO
    }

    /// Conditional revalidation request, when the entry carries validators.
    fn conditional_request(&self, request: &Request) -> Option<Request> {
        let mut builder = request.to_builder();
        if let Some(etag) = self.headers.get(ETAG) {
            builder = builder.header_value(http::header::IF_NONE_MATCH, etag.clone());
        } else if let Some(last_modified) = self.headers.get(LAST_MODIFIED) {
            builder = builder.header_value(http::header::IF_MODIFIED_SINCE, last_modified.clone());
        } else {
            return None;
        }
        builder.build().ok()
    }

    /// Merges a `304 Not Modified` into this entry: the 304's headers update
    /// the stored ones, the body and status stay, and the clock restarts.
    fn merge_not_modified(&self, not_modified_headers: &HeaderMap, now: SystemTime) -> Self {
        let mut headers = self.headers.clone();
        for (name, value) in not_modified_headers {
            if name == CONTENT_LENGTH {
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }
        Self {
            status: self.status,
            reason: self.reason.clone(),
            headers,
            body: self.body.clone(),
            received_at: now,
            vary_fields: self.vary_fields.clone(),
        }
    }

    fn to_response(&self, request: Request) -> Response {
        Response::builder()
            .request(request)
            .status(self.status)
            .reason(self.reason.clone())
            .headers(self.headers.clone())
            .body(ResponseBody::Full(self.body.clone()))
            .build()
    }
}

/// The pluggable response-cache capability. The store holds bytes; all
/// freshness and validation header interpretation lives in the stage.
pub trait ResponseCache: Send + Sync {
    fn lookup(&self, key: &CacheKey) -> Option<CachedEntry>;
    fn store(&self, key: CacheKey, entry: CachedEntry);
    fn invalidate(&self, key: &CacheKey);
}

const DEFAULT_CACHE_ENTRIES: usize = 64;

/// In-memory reference cache, bounded by entry count with least-recently-used
/// eviction. Last writer for a key wins; both lookups and stores refresh an
/// entry's recency.
pub struct MemoryCache {
    state: Mutex<MemoryCacheState>,
    max_entries: usize,
}

struct MemoryCacheState {
    entries: HashMap<CacheKey, CachedEntry>,
    recency: VecDeque<CacheKey>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_ENTRIES)
    }

    /// A cache holding at most `max_entries` responses. The floor is one
    /// entry.
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            state: Mutex::new(MemoryCacheState {
                entries: HashMap::new(),
                recency: VecDeque::new(),
            }),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MemoryCacheState {
    fn touch(&mut self, key: &CacheKey) {
        if let Some(position) = self.recency.iter().position(|seen| seen == key) {
            self.recency.remove(position);
        }
        self.recency.push_back(key.clone());
    }
}

impl ResponseCache for MemoryCache {
    fn lookup(&self, key: &CacheKey) -> Option<CachedEntry> {
        let mut state = lock_unpoisoned(&self.state);
        let entry = state.entries.get(key).cloned()?;
        state.touch(key);
        Some(entry)
    }

    fn store(&self, key: CacheKey, entry: CachedEntry) {
        let mut state = lock_unpoisoned(&self.state);
        state.entries.insert(key.clone(), entry);
        state.touch(&key);
        while state.entries.len() > self.max_entries {
            let Some(oldest) = state.recency.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
        }
    }

    fn invalidate(&self, key: &CacheKey) {
        let mut state = lock_unpoisoned(&self.state);
        state.entries.remove(key);
        if let Some(position) = state.recency.iter().position(|seen| seen == key) {
            state.recency.remove(position);
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct CacheControl {
    no_store: bool,
    no_cache: bool,
    max_age: Option<Duration>,
}

impl CacheControl {
    fn parse(headers: &HeaderMap) -> Self {
        let mut parsed = Self::default();
        for value in headers.get_all(CACHE_CONTROL) {
            let Ok(text) = value.to_str() else {
                continue;
            };
            for directive in text.split(',') {
                let directive = directive.trim();
                let (name, argument) = match directive.split_once('=') {
                    Some((name, argument)) => (name.trim(), Some(argument.trim().trim_matches('"'))),
                    None => (directive, None),
                };
                if name.eq_ignore_ascii_case("no-store") {
                    parsed.no_store = true;
                } else if name.eq_ignore_ascii_case("no-cache") {
                    parsed.no_cache = true;
                } else if name.eq_ignore_ascii_case("max-age") {
                    parsed.max_age = argument
                        .and_then(|seconds| seconds.parse::<u64>().ok())
                        .map(Duration::from_secs);
                }
            }
        }
        parsed
    }
}

const CACHEABLE_STATUSES: [u16; 5] = [200, 203, 300, 301, 308];

/// Consults the response cache before the connect stage ever runs. A fresh
/// hit short-circuits the chain entirely: no connection is acquired.
pub(crate) struct CacheStage {
    cache: Option<Arc<dyn ResponseCache>>,
}

impl CacheStage {
    pub(crate) fn new(cache: Option<Arc<dyn ResponseCache>>) -> Self {
        Self { cache }
    }

    fn store_if_cacheable(
        &self,
        cache: &Arc<dyn ResponseCache>,
        key: CacheKey,
        request: &Request,
        response: &mut Response,
    ) -> Result<(), Error> {
        let request_directives = CacheControl::parse(request.headers());
        let response_directives = CacheControl::parse(response.headers());
        if request_directives.no_store || response_directives.no_store {
            return Ok(());
        }
        if !CACHEABLE_STATUSES.contains(&response.status().as_u16()) {
            return Ok(());
        }

        let mut vary_fields = Vec::new();
        for value in response.headers().get_all(VARY) {
            let Ok(text) = value.to_str() else {
                return Ok(());
            };
            for field in text.split(',') {
                let field = field.trim();
                if field == "*" {
                    return Ok(());
                }
                vary_fields.push((
                    field.to_ascii_lowercase(),
                    request.header(field).map(ToOwned::to_owned),
                ));
            }
        }

        let body = response.body_bytes()?;
        let entry = CachedEntry::new(
            response.status(),
            response.reason().to_owned(),
            response.headers().clone(),
            body,
            SystemTime::now(),
            vary_fields,
        );
        debug!(uri = %request.redacted_uri(), "storing cacheable response");
        cache.store(key, entry);
        Ok(())
    }
}

impl Interceptor for CacheStage {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response, Error> {
        let request = chain.request().clone();
        let Some(cache) = self.cache.clone() else {
            return chain.proceed(request);
        };

        if *request.method() != Method::GET {
            let response = chain.proceed(request.clone())?;
            if response.is_success() && is_unsafe_method(request.method()) {
                cache.invalidate(&CacheKey::for_get(request.uri()));
            }
            return Ok(response);
        }

        let key = CacheKey::new(&request);
        let request_directives = CacheControl::parse(request.headers());
        let candidate = if request_directives.no_store {
            None
        } else {
            cache
                .lookup(&key)
                .filter(|entry| entry.matches_vary(&request))
        };

        let Some(entry) = candidate else {
            let mut response = chain.proceed(request.clone())?;
            self.store_if_cacheable(&cache, key, &request, &mut response)?;
            return Ok(response);
        };

        let now = SystemTime::now();
        if entry.is_fresh(now, &request_directives) {
            debug!(uri = %request.redacted_uri(), "serving fresh cached response");
            return Ok(entry.to_response(request));
        }

        match entry.conditional_request(&request) {
            Some(conditional) => {
                let mut network = chain.proceed(conditional)?;
                if network.status() == StatusCode::NOT_MODIFIED {
                    debug!(uri = %request.redacted_uri(), "revalidated cached response");
                    let merged = entry.merge_not_modified(network.headers(), SystemTime::now());
                    let response = merged.to_response(request);
                    cache.store(key, merged);
                    return Ok(response);
                }
                self.store_if_cacheable(&cache, key, &request, &mut network)?;
                Ok(network)
            }
            None => {
                let mut network = chain.proceed(request.clone())?;
                self.store_if_cacheable(&cache, key, &request, &mut network)?;
                Ok(network)
            }
        }
    }
}

fn is_unsafe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::DELETE | Method::PATCH
    )
}
