use std::sync::Arc;

use http::HeaderValue;

use crate::bridge::{CookieJar, NoCookies};
use crate::cache::ResponseCache;
use crate::call::Call;
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::interceptor::Interceptor;
use crate::request::Request;
use crate::retry::Authenticator;
use crate::transport::ConnectionPool;
use crate::util::parse_header_value;

const DEFAULT_USER_AGENT: &str = concat!("callx/", env!("CARGO_PKG_VERSION"));

struct ClientInner {
    dispatcher: Dispatcher,
    pool: Arc<dyn ConnectionPool>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    cookie_jar: Arc<dyn CookieJar>,
    cache: Option<Arc<dyn ResponseCache>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    proxy_authenticator: Option<Arc<dyn Authenticator>>,
    follow_redirects: bool,
    user_agent: HeaderValue,
}

/// The shared engine: dispatcher, connection pool, interceptor lists, and
/// policy. Cheap to clone; clones share everything, including in-flight
/// calls and the dispatcher's ceilings.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    /// A new, unexecuted call for the request.
    pub fn new_call(&self, request: Request) -> Call {
        Call::new(self.clone(), request)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub(crate) fn pool(&self) -> Arc<dyn ConnectionPool> {
        Arc::clone(&self.inner.pool)
    }

    pub(crate) fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.inner.interceptors
    }

    pub(crate) fn network_interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.inner.network_interceptors
    }

    pub(crate) fn cookie_jar(&self) -> Arc<dyn CookieJar> {
        Arc::clone(&self.inner.cookie_jar)
    }

    pub(crate) fn cache(&self) -> Option<Arc<dyn ResponseCache>> {
        self.inner.cache.clone()
    }

    pub(crate) fn authenticator(&self) -> Option<Arc<dyn Authenticator>> {
        self.inner.authenticator.clone()
    }

    pub(crate) fn proxy_authenticator(&self) -> Option<Arc<dyn Authenticator>> {
        self.inner.proxy_authenticator.clone()
    }

    pub(crate) fn follow_redirects(&self) -> bool {
        self.inner.follow_redirects
    }

    pub(crate) fn user_agent(&self) -> HeaderValue {
        self.inner.user_agent.clone()
    }
}

/// Builder with deferred errors, surfaced once at
/// [`HttpClientBuilder::try_build`].
pub struct HttpClientBuilder {
    pool: Option<Arc<dyn ConnectionPool>>,
    max_requests: Option<usize>,
    max_requests_per_host: Option<usize>,
    idle_callback: Option<Arc<dyn Fn() + Send + Sync>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    cookie_jar: Arc<dyn CookieJar>,
    cache: Option<Arc<dyn ResponseCache>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    proxy_authenticator: Option<Arc<dyn Authenticator>>,
    follow_redirects: bool,
    user_agent: Result<HeaderValue, Error>,
}

impl HttpClientBuilder {
    fn new() -> Self {
        Self {
            pool: None,
            max_requests: None,
            max_requests_per_host: None,
            idle_callback: None,
            interceptors: Vec::new(),
            network_interceptors: Vec::new(),
            cookie_jar: Arc::new(NoCookies),
            cache: None,
            authenticator: None,
            proxy_authenticator: None,
            follow_redirects: true,
            user_agent: Ok(HeaderValue::from_static(DEFAULT_USER_AGENT)),
        }
    }

    /// The connection pool is the one mandatory piece: the engine has no
    /// built-in transport.
    pub fn connection_pool(mut self, pool: Arc<dyn ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Ceiling on concurrently running async calls. Also adjustable later
    /// through [`Dispatcher::set_max_requests`].
    pub fn max_requests(mut self, max_requests: usize) -> Self {
        self.max_requests = Some(max_requests);
        self
    }

    pub fn max_requests_per_host(mut self, max_requests_per_host: usize) -> Self {
        self.max_requests_per_host = Some(max_requests_per_host);
        self
    }

    /// Runs each time the dispatcher goes idle.
    pub fn idle_callback(mut self, callback: Arc<dyn Fn() + Send + Sync>) -> Self {
        self.idle_callback = Some(callback);
        self
    }

    /// Adds an application interceptor. Runs outside retries and redirects,
    /// observing one logical call.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Adds a network interceptor. Runs with a connection bound, once per
    /// physical attempt.
    pub fn network_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.network_interceptors.push(interceptor);
        self
    }

    pub fn cookie_jar(mut self, cookie_jar: Arc<dyn CookieJar>) -> Self {
        self.cookie_jar = cookie_jar;
        self
    }

    pub fn cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn proxy_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.proxy_authenticator = Some(authenticator);
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = parse_header_value("user-agent", user_agent);
        self
    }

    pub fn try_build(self) -> Result<HttpClient, Error> {
        let Some(pool) = self.pool else {
            return Err(Error::InvalidArgument {
                what: "connection_pool",
                value: "missing".to_owned(),
            });
        };
        let user_agent = self.user_agent?;
        let dispatcher = Dispatcher::new();
        if let Some(max_requests) = self.max_requests {
            dispatcher.set_max_requests(max_requests)?;
        }
        if let Some(max_requests_per_host) = self.max_requests_per_host {
            dispatcher.set_max_requests_per_host(max_requests_per_host)?;
        }
        dispatcher.set_idle_callback(self.idle_callback);
        Ok(HttpClient {
            inner: Arc::new(ClientInner {
                dispatcher,
                pool,
                interceptors: self.interceptors,
                network_interceptors: self.network_interceptors,
                cookie_jar: self.cookie_jar,
                cache: self.cache,
                authenticator: self.authenticator,
                proxy_authenticator: self.proxy_authenticator,
                follow_redirects: self.follow_redirects,
                user_agent,
            }),
        })
    }
}
