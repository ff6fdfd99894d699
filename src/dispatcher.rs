use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;

use tracing::debug;

use crate::call::{AsyncCall, CallShared};
use crate::error::Error;
use crate::util::lock_unpoisoned;

pub(crate) const DEFAULT_MAX_REQUESTS: usize = 64;
pub(crate) const DEFAULT_MAX_REQUESTS_PER_HOST: usize = 5;

/// Admission control for asynchronous calls, and the registry of everything
/// in flight. Each admitted call runs on its own worker thread; the two
/// ceilings (total and per-host) bound how many are admitted at once, and the
/// ready queue holds the rest in arrival order.
///
/// Synchronous calls bypass admission but still register here so that
/// `cancel_all` and the running counts see them.
pub struct Dispatcher {
    state: Mutex<State>,
}

struct State {
    max_requests: usize,
    max_requests_per_host: usize,
    ready: VecDeque<AsyncCall>,
    running_async: Vec<Arc<CallShared>>,
    running_sync: Vec<Arc<CallShared>>,
    idle_callback: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                max_requests: DEFAULT_MAX_REQUESTS,
                max_requests_per_host: DEFAULT_MAX_REQUESTS_PER_HOST,
                ready: VecDeque::new(),
                running_async: Vec::new(),
                running_sync: Vec::new(),
                idle_callback: None,
            }),
        }
    }

    pub fn max_requests(&self) -> usize {
        lock_unpoisoned(&self.state).max_requests
    }

    pub fn max_requests_per_host(&self) -> usize {
        lock_unpoisoned(&self.state).max_requests_per_host
    }

    /// Raising the ceiling promotes immediately; lowering it never evicts
    /// calls that are already running.
    pub fn set_max_requests(&self, max_requests: usize) -> Result<(), Error> {
        if max_requests < 1 {
            return Err(Error::InvalidArgument {
                what: "max_requests",
                value: max_requests.to_string(),
            });
        }
        lock_unpoisoned(&self.state).max_requests = max_requests;
        self.promote_and_spawn();
        Ok(())
    }

    pub fn set_max_requests_per_host(&self, max_requests_per_host: usize) -> Result<(), Error> {
        if max_requests_per_host < 1 {
            return Err(Error::InvalidArgument {
                what: "max_requests_per_host",
                value: max_requests_per_host.to_string(),
            });
        }
        lock_unpoisoned(&self.state).max_requests_per_host = max_requests_per_host;
        self.promote_and_spawn();
        Ok(())
    }

    /// Runs once each time the dispatcher becomes idle (no running or queued
    /// calls). Invoked outside the dispatcher lock.
    pub fn set_idle_callback(&self, callback: Option<Arc<dyn Fn() + Send + Sync>>) {
        lock_unpoisoned(&self.state).idle_callback = callback;
    }

    pub fn queued_calls_count(&self) -> usize {
        lock_unpoisoned(&self.state).ready.len()
    }

    /// Ids of queued calls, oldest first. Ids also appear in worker thread
    /// names and log events.
    pub fn queued_call_ids(&self) -> Vec<u64> {
        lock_unpoisoned(&self.state)
            .ready
            .iter()
            .map(AsyncCall::id)
            .collect()
    }

    pub fn running_call_ids(&self) -> Vec<u64> {
        let state = lock_unpoisoned(&self.state);
        state
            .running_async
            .iter()
            .chain(state.running_sync.iter())
            .map(|call| call.id())
            .collect()
    }

    pub fn running_calls_count(&self) -> usize {
        let state = lock_unpoisoned(&self.state);
        state.running_async.len() + state.running_sync.len()
    }

    /// Cancels every queued and running call. Queued calls still run in
    /// their turn and report [`Error::Canceled`] through their callback.
    pub fn cancel_all(&self) {
        let shared: Vec<Arc<CallShared>> = {
            let state = lock_unpoisoned(&self.state);
            state
                .ready
                .iter()
                .map(AsyncCall::shared)
                .chain(state.running_async.iter().cloned())
                .chain(state.running_sync.iter().cloned())
                .collect()
        };
        debug!(count = shared.len(), "canceling all dispatched calls");
        for call in shared {
            call.cancel();
        }
    }

    pub(crate) fn enqueue(&self, call: AsyncCall) {
        debug!(id = call.id(), host = %call.host(), "enqueueing async call");
        lock_unpoisoned(&self.state).ready.push_back(call);
        self.promote_and_spawn();
    }

    /// Registers a synchronous call for the duration of its execution.
    pub(crate) fn executed(&self, shared: Arc<CallShared>) {
        lock_unpoisoned(&self.state).running_sync.push(shared);
    }

    pub(crate) fn finished_sync(&self, shared: &Arc<CallShared>) {
        let idle_callback = {
            let mut state = lock_unpoisoned(&self.state);
            remove_running(&mut state.running_sync, shared);
            state.idle_callback_if_idle()
        };
        if let Some(callback) = idle_callback {
            callback();
        }
    }

    /// Completion hook for worker threads: unregisters the call, promotes
    /// whatever its slot frees up, and fires the idle callback last.
    pub(crate) fn finished_async(&self, shared: &Arc<CallShared>) {
        let (promoted, idle_callback) = {
            let mut state = lock_unpoisoned(&self.state);
            remove_running(&mut state.running_async, shared);
            let promoted = state.promote();
            let idle_callback = if promoted.is_empty() {
                state.idle_callback_if_idle()
            } else {
                None
            };
            (promoted, idle_callback)
        };
        for call in promoted {
            self.spawn(call);
        }
        if let Some(callback) = idle_callback {
            callback();
        }
    }

    fn promote_and_spawn(&self) {
        let promoted = lock_unpoisoned(&self.state).promote();
        for call in promoted {
            self.spawn(call);
        }
    }

    fn spawn(&self, call: AsyncCall) {
        let name = format!("callx-worker-{}", call.id());
        thread::Builder::new()
            .name(name)
            .spawn(move || call.run())
            .expect("failed to spawn dispatcher worker thread");
    }
}

impl State {
    /// Moves ready calls into the running set, oldest first, skipping (but
    /// not reordering past the queue) calls whose host is at its ceiling.
    fn promote(&mut self) -> Vec<AsyncCall> {
        let mut promoted = Vec::new();
        let mut index = 0;
        while index < self.ready.len() {
            if self.running_async.len() >= self.max_requests {
                break;
            }
            let host = self.ready[index].host().to_owned();
            let on_host = self
                .running_async
                .iter()
                .filter(|running| running.host() == host)
                .count();
            if on_host >= self.max_requests_per_host {
                index += 1;
                continue;
            }
            let Some(call) = self.ready.remove(index) else {
                break;
            };
            debug!(id = call.id(), host = %host, "promoting queued call");
            self.running_async.push(call.shared());
            promoted.push(call);
        }
        promoted
    }

    fn idle_callback_if_idle(&self) -> Option<Arc<dyn Fn() + Send + Sync>> {
        if self.running_async.is_empty() && self.running_sync.is_empty() && self.ready.is_empty() {
            self.idle_callback.clone()
        } else {
            None
        }
    }
}

fn remove_running(running: &mut Vec<Arc<CallShared>>, shared: &Arc<CallShared>) {
    let Some(position) = running.iter().position(|call| call.id() == shared.id()) else {
        panic!(
            "call {} reported completion but was not tracked as running",
            shared.id()
        );
    };
    running.swap_remove(position);
}
