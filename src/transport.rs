use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http::{HeaderMap, StatusCode, Uri};
use tracing::debug;

use crate::error::Error;
use crate::request::Request;
use crate::response::ResponseBody;
use crate::util::lock_unpoisoned;

/// The connection target: scheme, host, port, and the proxy the connection
/// would tunnel through. Two requests with equal routes may share a pooled
/// connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    scheme: String,
    host: String,
    port: u16,
    proxy: Option<Uri>,
}

impl Route {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into().to_ascii_lowercase(),
            port,
            proxy: None,
        }
    }

    pub(crate) fn from_request(request: &Request) -> Self {
        Self::new(
            request.uri().scheme_str().unwrap_or("http"),
            request.host(),
            request.port(),
        )
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn proxy(&self) -> Option<&Uri> {
        self.proxy.as_ref()
    }

    /// Stable key for pool bookkeeping.
    pub fn pool_key(&self) -> String {
        match &self.proxy {
            Some(proxy) => format!("{}://{}:{} via {proxy}", self.scheme, self.host, self.port),
            None => format!("{}://{}:{}", self.scheme, self.host, self.port),
        }
    }
}

/// What a connection hands back after one exchange: the parsed status line,
/// headers, and body. Parsing happens inside the transport; sequencing
/// (write, flush, read) is the call-server stage's job.
#[derive(Debug)]
pub struct RawResponse {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

/// One live connection. Implementations are internally synchronized:
/// `interrupt` may be called from any thread while another thread is mid-way
/// through an exchange, and must make that exchange fail promptly.
pub trait Connection: Send + Sync {
    fn write_request(&self, request: &Request) -> Result<(), Error>;
    fn flush(&self) -> Result<(), Error>;
    fn read_response(&self) -> Result<RawResponse, Error>;
    fn interrupt(&self);
    /// Whether the connection is healthy enough to return to the pool.
    fn is_reusable(&self) -> bool;
}

/// The shared connection-pool capability. `acquire` may reuse an idle
/// connection for the route or establish a new one; `release` returns a
/// healthy connection for reuse.
pub trait ConnectionPool: Send + Sync {
    fn acquire(&self, route: &Route) -> Result<Arc<dyn Connection>, Error>;
    fn release(&self, route: &Route, connection: Arc<dyn Connection>);
}

struct BoundConnection {
    route: Route,
    connection: Arc<dyn Connection>,
}

/// The per-call connection lease, owned by the retry stage for the lifetime
/// of the call. The connect stage binds a connection for each attempt; the
/// call-server stage uses it; cancellation interrupts it from any thread.
/// Once canceled, a lease never binds again.
pub struct StreamLease {
    pool: Arc<dyn ConnectionPool>,
    bound: Mutex<Option<BoundConnection>>,
    canceled: AtomicBool,
}

impl StreamLease {
    pub(crate) fn new(pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            pool,
            bound: Mutex::new(None),
            canceled: AtomicBool::new(false),
        }
    }

    /// Binds a connection for the next attempt, reusing the currently bound
    /// one when the route matches. The pool call happens outside the lease
    /// lock; a cancel that lands while `acquire` is in flight wins, and the
    /// freshly acquired connection is interrupted instead of bound.
    pub(crate) fn bind(&self, route: &Route) -> Result<Arc<dyn Connection>, Error> {
        if self.is_canceled() {
            return Err(Error::Canceled);
        }
        {
            let bound = lock_unpoisoned(&self.bound);
            if let Some(existing) = bound.as_ref() {
                if existing.route == *route {
                    return Ok(Arc::clone(&existing.connection));
                }
            }
        }

        let connection = self.pool.acquire(route)?;
        let mut bound = lock_unpoisoned(&self.bound);
        if self.is_canceled() {
            drop(bound);
            connection.interrupt();
            return Err(Error::Canceled);
        }
        if let Some(previous) = bound.take() {
            // Route changed mid-call (cross-origin follow-up); retire the old
            // connection through the pool.
            self.release_bound(previous, true);
        }
        *bound = Some(BoundConnection {
            route: route.clone(),
            connection: Arc::clone(&connection),
        });
        Ok(connection)
    }

    /// The connection bound for the attempt in flight, if any.
    pub(crate) fn connection(&self) -> Option<Arc<dyn Connection>> {
        lock_unpoisoned(&self.bound)
            .as_ref()
            .map(|bound| Arc::clone(&bound.connection))
    }

    pub(crate) fn has_bound_connection(&self) -> bool {
        lock_unpoisoned(&self.bound).is_some()
    }

    /// Ends the attempt: a healthy connection goes back to the pool for
    /// reuse, anything else is dropped.
    pub(crate) fn finish_attempt(&self, healthy: bool) {
        let bound = lock_unpoisoned(&self.bound).take();
        if let Some(bound) = bound {
            self.release_bound(bound, healthy);
        }
    }

    fn release_bound(&self, bound: BoundConnection, healthy: bool) {
        if healthy && !self.is_canceled() && bound.connection.is_reusable() {
            self.pool.release(&bound.route, bound.connection);
        }
    }

    /// Cooperative cancel: monotonic flag plus an interrupt of whatever
    /// connection is currently bound. Safe from any thread, idempotent, and
    /// safe concurrently with `bind`.
    pub(crate) fn cancel(&self) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        let connection = self.connection();
        if let Some(connection) = connection {
            debug!("interrupting in-flight connection for canceled call");
            connection.interrupt();
        }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}
