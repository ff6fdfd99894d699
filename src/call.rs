use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::bridge::Bridge;
use crate::cache::CacheStage;
use crate::call_server::CallServer;
use crate::client::HttpClient;
use crate::connect::Connect;
use crate::error::Error;
use crate::interceptor::{Chain, Interceptor};
use crate::request::Request;
use crate::response::Response;
use crate::retry::RetryAndFollowUp;
use crate::transport::StreamLease;

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Delivery surface for an asynchronous call. Exactly one of the two methods
/// runs, exactly once, on the call's worker thread; both consume the
/// callback, so double delivery is unrepresentable.
pub trait Callback: Send {
    fn on_response(self: Box<Self>, response: Response);
    fn on_failure(self: Box<Self>, error: Error);
}

impl<F> Callback for F
where
    F: FnOnce(Result<Response, Error>) + Send,
{
    fn on_response(self: Box<Self>, response: Response) {
        self(Ok(response));
    }

    fn on_failure(self: Box<Self>, error: Error) {
        self(Err(error));
    }
}

/// Identity and lifecycle state shared between a [`Call`] handle, the
/// dispatcher's registries, and the worker thread running the call.
pub(crate) struct CallShared {
    id: u64,
    host: String,
    executed: AtomicBool,
    lease: Arc<StreamLease>,
}

impl CallShared {
    fn new(host: String, lease: Arc<StreamLease>) -> Self {
        Self {
            id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
            host,
            executed: AtomicBool::new(false),
            lease,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    /// Claims the single execution slot. Returns false if already claimed.
    fn mark_executed(&self) -> bool {
        !self.executed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn cancel(&self) {
        self.lease.cancel();
    }

    fn is_canceled(&self) -> bool {
        self.lease.is_canceled()
    }
}

/// One request ready to be executed, at most once, synchronously via
/// [`Call::execute`] or asynchronously via [`Call::enqueue`]. Cancelable at
/// any point from any thread.
pub struct Call {
    client: HttpClient,
    request: Request,
    shared: Arc<CallShared>,
}

impl Call {
    pub(crate) fn new(client: HttpClient, request: Request) -> Self {
        let lease = Arc::new(StreamLease::new(client.pool()));
        let shared = Arc::new(CallShared::new(request.host(), lease));
        Self {
            client,
            request,
            shared,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Stable identity for this call, as reported by the dispatcher's
    /// snapshots and worker thread names.
    pub fn id(&self) -> u64 {
        self.shared.id()
    }

    pub fn is_executed(&self) -> bool {
        self.shared.executed.load(Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.shared.is_canceled()
    }

    /// Cancels the call: queued calls fail when their turn comes, and an
    /// in-flight exchange is interrupted. Idempotent; a no-op after the call
    /// completes.
    pub fn cancel(&self) {
        debug!(id = self.shared.id(), "canceling call");
        self.shared.cancel();
    }

    /// A fresh, unexecuted call for the same request. The new call has its
    /// own identity and is not canceled even if this one is.
    pub fn clone_reset(&self) -> Call {
        Call::new(self.client.clone(), self.request.clone())
    }

    /// Runs the call on the current thread, blocking until the response or
    /// failure. Registered with the dispatcher for the duration, so running
    /// counts and `cancel_all` include it.
    pub fn execute(&self) -> Result<Response, Error> {
        if !self.shared.mark_executed() {
            return Err(Error::AlreadyExecuted);
        }
        self.client.dispatcher().executed(Arc::clone(&self.shared));
        let _finished = FinishedGuard {
            client: self.client.clone(),
            shared: Arc::clone(&self.shared),
            asynchronous: false,
        };
        let result = run_chain(&self.client, &self.request, &self.shared);
        if result.is_ok() && self.shared.is_canceled() {
            return Err(Error::Canceled);
        }
        result
    }

    /// Hands the call to the dispatcher. The callback runs exactly once on a
    /// worker thread. Returns an error only when the call was already
    /// executed; admission-time queueing is not an error.
    pub fn enqueue(&self, callback: impl Callback + 'static) -> Result<(), Error> {
        if !self.shared.mark_executed() {
            return Err(Error::AlreadyExecuted);
        }
        self.client.dispatcher().enqueue(AsyncCall {
            client: self.client.clone(),
            request: self.request.clone(),
            shared: Arc::clone(&self.shared),
            callback: Box::new(callback),
        });
        Ok(())
    }
}

/// A call plus its callback, queued in or running under the dispatcher.
pub(crate) struct AsyncCall {
    client: HttpClient,
    request: Request,
    shared: Arc<CallShared>,
    callback: Box<dyn Callback>,
}

impl AsyncCall {
    pub(crate) fn id(&self) -> u64 {
        self.shared.id()
    }

    pub(crate) fn host(&self) -> &str {
        self.shared.host()
    }

    pub(crate) fn shared(&self) -> Arc<CallShared> {
        Arc::clone(&self.shared)
    }

    /// Worker-thread entry point. Delivers the outcome through the callback
    /// and then reports completion to the dispatcher, in that order, so the
    /// idle callback observes delivery as finished.
    pub(crate) fn run(self) {
        let AsyncCall {
            client,
            request,
            shared,
            callback,
        } = self;
        let _finished = FinishedGuard {
            client: client.clone(),
            shared: Arc::clone(&shared),
            asynchronous: true,
        };

        let result = run_chain(&client, &request, &shared);
        match result {
            Ok(_) if shared.is_canceled() => callback.on_failure(Error::Canceled),
            Ok(response) => callback.on_response(response),
            Err(error) => callback.on_failure(error),
        }
    }
}

/// Reports completion to the dispatcher when dropped, so a panicking stage
/// or callback still releases the call's running slot.
struct FinishedGuard {
    client: HttpClient,
    shared: Arc<CallShared>,
    asynchronous: bool,
}

impl Drop for FinishedGuard {
    fn drop(&mut self) {
        if self.asynchronous {
            self.client.dispatcher().finished_async(&self.shared);
        } else {
            self.client.dispatcher().finished_sync(&self.shared);
        }
    }
}

/// Assembles the stage list for one call and runs it. Application
/// interceptors sit outside the retry stage; network interceptors sit inside
/// the connect stage, just before the terminal exchange.
fn run_chain(
    client: &HttpClient,
    request: &Request,
    shared: &Arc<CallShared>,
) -> Result<Response, Error> {
    let lease = Arc::clone(&shared.lease);

    let mut stages: Vec<Arc<dyn Interceptor>> = Vec::new();
    stages.extend(client.interceptors().iter().cloned());
    stages.push(Arc::new(RetryAndFollowUp::new(
        Arc::clone(&lease),
        client.authenticator(),
        client.proxy_authenticator(),
        client.follow_redirects(),
    )));
    stages.push(Arc::new(Bridge::new(
        client.cookie_jar(),
        client.user_agent(),
    )));
    stages.push(Arc::new(CacheStage::new(client.cache())));
    stages.push(Arc::new(Connect));
    stages.extend(client.network_interceptors().iter().cloned());
    stages.push(Arc::new(CallServer));

    Chain::run(&stages, request.clone(), &lease)
}
