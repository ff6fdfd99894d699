use std::sync::Arc;

use crate::error::Error;
use crate::request::Request;
use crate::response::Response;
use crate::transport::StreamLease;

/// A single stage in the processing pipeline. A stage receives the chain
/// positioned just after itself and must do exactly one of:
///
/// - call [`Chain::proceed`] with a (possibly rewritten) request and return
///   the (possibly rewritten) response,
/// - short-circuit by returning a response without delegating, or
/// - return an error, aborting the whole chain.
///
/// Application interceptors run outermost and observe one logical call even
/// across internal retries; network interceptors run innermost and observe
/// every physical attempt.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response, Error>;
}

/// An ordered stage list plus an index cursor over one in-flight exchange.
/// Each `proceed` constructs the next-position view and delegates; the stage
/// list itself is immutable for the lifetime of the exchange.
pub struct Chain<'a> {
    stages: &'a [Arc<dyn Interceptor>],
    index: usize,
    request: Request,
    lease: &'a Arc<StreamLease>,
    proceed_calls: usize,
}

impl<'a> Chain<'a> {
    pub(crate) fn run(
        stages: &'a [Arc<dyn Interceptor>],
        request: Request,
        lease: &'a Arc<StreamLease>,
    ) -> Result<Response, Error> {
        assert!(
            !stages.is_empty(),
            "an interceptor chain needs at least a terminal stage"
        );
        let stage = Arc::clone(&stages[0]);
        let mut chain = Chain {
            stages,
            index: 0,
            request,
            lease,
            proceed_calls: 0,
        };
        stage.intercept(&mut chain)
    }

    /// The request this stage was invoked with.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Whether the owning call has been canceled. Stages should fail fast
    /// with [`Error::Canceled`] instead of doing work once this is set.
    pub fn is_canceled(&self) -> bool {
        self.lease.is_canceled()
    }

    pub(crate) fn lease(&self) -> &Arc<StreamLease> {
        self.lease
    }

    /// Delegates to the next stage. May be called again by the same stage
    /// only after the previous attempt's connection went back to the pool,
    /// which is what lets the retry stage loop. Calling it a second time
    /// while a connection is still bound is a usage error and panics.
    pub fn proceed(&mut self, request: Request) -> Result<Response, Error> {
        assert!(
            self.index + 1 < self.stages.len(),
            "the terminal stage must not call proceed"
        );
        if self.proceed_calls > 0 && self.lease.has_bound_connection() {
            panic!(
                "stage at position {} called proceed while its previous exchange still holds a connection",
                self.index
            );
        }
        self.proceed_calls += 1;

        let next_index = self.index + 1;
        let stage = Arc::clone(&self.stages[next_index]);
        let mut next = Chain {
            stages: self.stages,
            index: next_index,
            request,
            lease: self.lease,
            proceed_calls: 0,
        };
        stage.intercept(&mut next)
    }
}
