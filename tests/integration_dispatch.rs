use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use callx::{
    Call, Chain, Connection, ConnectionPool, Error, ErrorCode, HttpClient, Interceptor,
    RawResponse, Request, Response, ResponseBody, Route,
};
use http::{HeaderMap, StatusCode};

/// A pool whose connections block inside `read_response` until the shared
/// gate is released, so tests can hold calls in the running state and
/// observe the dispatcher's bookkeeping.
struct GatePool {
    gate: Arc<Gate>,
    acquires: AtomicUsize,
}

struct Gate {
    released: Mutex<bool>,
    condvar: Condvar,
    in_flight: AtomicUsize,
    high_water: AtomicUsize,
    started_hosts: Mutex<Vec<String>>,
}

impl Gate {
    fn new(released: bool) -> Arc<Self> {
        Arc::new(Self {
            released: Mutex::new(released),
            condvar: Condvar::new(),
            in_flight: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            started_hosts: Mutex::new(Vec::new()),
        })
    }

    fn release(&self) {
        *self.released.lock().unwrap() = true;
        self.condvar.notify_all();
    }
}

impl GatePool {
    fn new(gate: Arc<Gate>) -> Arc<Self> {
        Arc::new(Self {
            gate,
            acquires: AtomicUsize::new(0),
        })
    }
}

impl ConnectionPool for GatePool {
    fn acquire(&self, route: &Route) -> Result<Arc<dyn Connection>, Error> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(GateConnection {
            gate: Arc::clone(&self.gate),
            host: route.host().to_owned(),
            interrupted: AtomicBool::new(false),
        }))
    }

    fn release(&self, _route: &Route, _connection: Arc<dyn Connection>) {}
}

struct GateConnection {
    gate: Arc<Gate>,
    host: String,
    interrupted: AtomicBool,
}

impl Connection for GateConnection {
    fn write_request(&self, _request: &Request) -> Result<(), Error> {
        Ok(())
    }

    fn flush(&self) -> Result<(), Error> {
        Ok(())
    }

    fn read_response(&self) -> Result<RawResponse, Error> {
        self.gate.started_hosts.lock().unwrap().push(self.host.clone());
        let in_flight = self.gate.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.gate.high_water.fetch_max(in_flight, Ordering::SeqCst);

        let mut released = self.gate.released.lock().unwrap();
        while !*released && !self.interrupted.load(Ordering::SeqCst) {
            released = self.gate.condvar.wait(released).unwrap();
        }
        drop(released);
        self.gate.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.interrupted.load(Ordering::SeqCst) {
            return Err(Error::transport(
                callx::TransportErrorKind::Interrupted,
                "exchange interrupted",
            ));
        }
        Ok(RawResponse {
            status: StatusCode::OK,
            reason: None,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
        })
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.gate.condvar.notify_all();
    }

    fn is_reusable(&self) -> bool {
        true
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn client_with(pool: Arc<GatePool>) -> HttpClient {
    init_tracing();
    HttpClient::builder()
        .connection_pool(pool)
        .try_build()
        .expect("client should build")
}

fn request(host: &str) -> Request {
    Request::get(&format!("http://{host}/resource")).expect("request should build")
}

fn wait_until(label: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {label}");
}

type Outcomes = Arc<Mutex<Vec<Result<StatusCode, Error>>>>;

fn recording_callback(outcomes: &Outcomes) -> impl FnOnce(Result<Response, Error>) + Send {
    let outcomes = Arc::clone(outcomes);
    move |result| {
        outcomes
            .lock()
            .unwrap()
            .push(result.map(|response| response.status()));
    }
}

#[test]
fn per_host_ceiling_queues_same_host_call_without_starving_other_hosts() {
    let gate = Gate::new(false);
    let pool = GatePool::new(Arc::clone(&gate));
    let client = client_with(pool);
    client.dispatcher().set_max_requests(2).unwrap();
    client.dispatcher().set_max_requests_per_host(1).unwrap();

    let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
    for host in ["a.test", "a.test", "b.test"] {
        client
            .new_call(request(host))
            .enqueue(recording_callback(&outcomes))
            .unwrap();
    }

    // The second a.test call is host-blocked; the b.test call behind it is
    // admitted anyway.
    wait_until("both admissible calls to start", || {
        gate.started_hosts.lock().unwrap().len() == 2
    });
    {
        let mut started: Vec<String> = gate.started_hosts.lock().unwrap().clone();
        started.sort();
        assert_eq!(started, ["a.test", "b.test"]);
    }
    assert_eq!(client.dispatcher().queued_calls_count(), 1);
    assert_eq!(client.dispatcher().running_calls_count(), 2);

    gate.release();
    wait_until("all calls to finish", || outcomes.lock().unwrap().len() == 3);
    assert!(outcomes.lock().unwrap().iter().all(|o| o.is_ok()));
    assert_eq!(gate.started_hosts.lock().unwrap()[2], "a.test");
    assert_eq!(client.dispatcher().running_calls_count(), 0);
}

#[test]
fn total_ceiling_bounds_concurrent_exchanges() {
    let gate = Gate::new(true);
    let pool = GatePool::new(Arc::clone(&gate));
    let client = HttpClient::builder()
        .connection_pool(pool)
        .max_requests(2)
        .try_build()
        .unwrap();

    let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
    for host in ["a.test", "b.test", "c.test", "d.test"] {
        client
            .new_call(request(host))
            .enqueue(recording_callback(&outcomes))
            .unwrap();
    }

    wait_until("all calls to finish", || outcomes.lock().unwrap().len() == 4);
    assert!(outcomes.lock().unwrap().iter().all(|o| o.is_ok()));
    assert!(gate.high_water.load(Ordering::SeqCst) <= 2);
}

#[test]
fn raising_per_host_ceiling_promotes_immediately() {
    let gate = Gate::new(false);
    let pool = GatePool::new(Arc::clone(&gate));
    let client = client_with(pool);
    client.dispatcher().set_max_requests_per_host(1).unwrap();

    let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
    let first = client.new_call(request("a.test"));
    let second = client.new_call(request("a.test"));
    first.enqueue(recording_callback(&outcomes)).unwrap();
    second.enqueue(recording_callback(&outcomes)).unwrap();
    wait_until("first call to start", || {
        gate.started_hosts.lock().unwrap().len() == 1
    });
    assert_eq!(client.dispatcher().queued_call_ids(), vec![second.id()]);
    assert_eq!(client.dispatcher().running_call_ids(), vec![first.id()]);

    client.dispatcher().set_max_requests_per_host(2).unwrap();
    wait_until("queued call to be promoted", || {
        gate.started_hosts.lock().unwrap().len() == 2
    });
    assert_eq!(client.dispatcher().queued_calls_count(), 0);

    gate.release();
    wait_until("all calls to finish", || outcomes.lock().unwrap().len() == 2);
}

#[test]
fn ceiling_setters_reject_zero() {
    let client = client_with(GatePool::new(Gate::new(true)));
    let error = client.dispatcher().set_max_requests(0).unwrap_err();
    assert_eq!(error.code(), ErrorCode::InvalidArgument);
    let error = client.dispatcher().set_max_requests_per_host(0).unwrap_err();
    assert_eq!(error.code(), ErrorCode::InvalidArgument);
}

#[test]
fn idle_callback_fires_once_after_last_call_completes() {
    let gate = Gate::new(true);
    let client = client_with(GatePool::new(Arc::clone(&gate)));
    let idle_count = Arc::new(AtomicUsize::new(0));
    {
        let idle_count = Arc::clone(&idle_count);
        client.dispatcher().set_idle_callback(Some(Arc::new(move || {
            idle_count.fetch_add(1, Ordering::SeqCst);
        })));
    }

    let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
    for host in ["a.test", "b.test"] {
        client
            .new_call(request(host))
            .enqueue(recording_callback(&outcomes))
            .unwrap();
    }

    wait_until("idle callback to fire", || {
        idle_count.load(Ordering::SeqCst) == 1
    });
    thread::sleep(Duration::from_millis(50));
    assert_eq!(idle_count.load(Ordering::SeqCst), 1);
    assert_eq!(client.dispatcher().running_calls_count(), 0);
}

#[test]
fn synchronous_calls_register_with_the_dispatcher() {
    let gate = Gate::new(false);
    let client = client_with(GatePool::new(Arc::clone(&gate)));

    let worker = {
        let client = client.clone();
        thread::spawn(move || client.new_call(request("a.test")).execute())
    };
    wait_until("sync call to register", || {
        client.dispatcher().running_calls_count() == 1
    });

    gate.release();
    let response = worker.join().unwrap().expect("call should succeed");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(client.dispatcher().running_calls_count(), 0);
}

#[test]
fn cancel_all_fails_running_and_queued_calls() {
    let gate = Gate::new(false);
    let client = client_with(GatePool::new(Arc::clone(&gate)));
    client.dispatcher().set_max_requests_per_host(1).unwrap();

    let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..2 {
        client
            .new_call(request("a.test"))
            .enqueue(recording_callback(&outcomes))
            .unwrap();
    }
    wait_until("first call to start", || {
        gate.started_hosts.lock().unwrap().len() == 1
    });
    assert_eq!(client.dispatcher().queued_calls_count(), 1);

    client.dispatcher().cancel_all();

    wait_until("both calls to fail", || outcomes.lock().unwrap().len() == 2);
    for outcome in outcomes.lock().unwrap().iter() {
        match outcome {
            Err(Error::Canceled) => {}
            other => panic!("expected canceled, got {other:?}"),
        }
    }
    assert_eq!(client.dispatcher().running_calls_count(), 0);
    assert_eq!(client.dispatcher().queued_calls_count(), 0);
}

#[test]
fn a_call_executes_at_most_once() {
    let client = client_with(GatePool::new(Gate::new(true)));
    let call = client.new_call(request("a.test"));
    call.execute().expect("first execution should succeed");
    assert!(call.is_executed());

    let error = call.execute().unwrap_err();
    assert_eq!(error.code(), ErrorCode::AlreadyExecuted);
    let error = call
        .enqueue(|_result: Result<Response, Error>| {})
        .unwrap_err();
    assert_eq!(error.code(), ErrorCode::AlreadyExecuted);

    // A reset clone is a fresh call with its own execution slot.
    let fresh = call.clone_reset();
    assert!(!fresh.is_executed());
    fresh.execute().expect("reset clone should execute");
}

#[test]
fn cancel_before_promotion_delivers_canceled_without_network() {
    let gate = Gate::new(false);
    let pool = GatePool::new(Arc::clone(&gate));
    let client = client_with(Arc::clone(&pool));
    client.dispatcher().set_max_requests_per_host(1).unwrap();

    let blocker = client.new_call(request("a.test"));
    let blocker_outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
    blocker.enqueue(recording_callback(&blocker_outcomes)).unwrap();
    wait_until("blocker to start", || {
        gate.started_hosts.lock().unwrap().len() == 1
    });

    let queued = client.new_call(request("a.test"));
    let queued_outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
    queued.enqueue(recording_callback(&queued_outcomes)).unwrap();
    let acquires_before = pool.acquires.load(Ordering::SeqCst);
    queued.cancel();
    assert!(queued.is_canceled());

    gate.release();
    wait_until("queued call to fail", || {
        queued_outcomes.lock().unwrap().len() == 1
    });
    match &queued_outcomes.lock().unwrap()[0] {
        Err(Error::Canceled) => {}
        other => panic!("expected canceled, got {other:?}"),
    }
    // The canceled call never touched the pool.
    assert_eq!(pool.acquires.load(Ordering::SeqCst), acquires_before);

    wait_until("blocker to finish", || {
        blocker_outcomes.lock().unwrap().len() == 1
    });
    assert!(blocker_outcomes.lock().unwrap()[0].is_ok());
}

#[test]
fn callback_panic_still_releases_the_running_slot() {
    let gate = Gate::new(true);
    let client = client_with(GatePool::new(Arc::clone(&gate)));
    client.dispatcher().set_max_requests_per_host(1).unwrap();

    client
        .new_call(request("a.test"))
        .enqueue(|_result: Result<Response, Error>| panic!("delivery failure"))
        .unwrap();

    // The first call's slot must come back even though its callback died,
    // or this same-host call would queue forever.
    let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
    client
        .new_call(request("a.test"))
        .enqueue(recording_callback(&outcomes))
        .unwrap();
    wait_until("second call to be delivered", || {
        outcomes.lock().unwrap().len() == 1
    });
    assert!(outcomes.lock().unwrap()[0].is_ok());
    wait_until("running count to drain", || {
        client.dispatcher().running_calls_count() == 0
    });
}

struct PanickingStage;

impl Interceptor for PanickingStage {
    fn intercept(&self, _chain: &mut Chain<'_>) -> Result<Response, Error> {
        panic!("stage failure");
    }
}

#[test]
fn stage_panic_still_unregisters_a_sync_call() {
    init_tracing();
    let client = HttpClient::builder()
        .connection_pool(GatePool::new(Gate::new(true)))
        .interceptor(Arc::new(PanickingStage))
        .try_build()
        .unwrap();

    let call = client.new_call(request("a.test"));
    let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| call.execute()));
    assert!(unwound.is_err());
    assert_eq!(client.dispatcher().running_calls_count(), 0);
}

struct CancelOnResponse(Arc<Mutex<Option<Arc<Call>>>>);

impl Interceptor for CancelOnResponse {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response, Error> {
        let request = chain.request().clone();
        let response = chain.proceed(request)?;
        if let Some(call) = self.0.lock().unwrap().as_ref() {
            call.cancel();
        }
        Ok(response)
    }
}

#[test]
fn cancel_racing_completion_reports_canceled_to_sync_callers() {
    init_tracing();
    let slot: Arc<Mutex<Option<Arc<Call>>>> = Arc::new(Mutex::new(None));
    let client = HttpClient::builder()
        .connection_pool(GatePool::new(Gate::new(true)))
        .interceptor(Arc::new(CancelOnResponse(Arc::clone(&slot))))
        .try_build()
        .unwrap();

    let call = Arc::new(client.new_call(request("a.test")));
    *slot.lock().unwrap() = Some(Arc::clone(&call));

    // The exchange completes, but the cancel landed before execute returned.
    match call.execute() {
        Err(Error::Canceled) => {}
        other => panic!("expected canceled, got {other:?}"),
    }
    assert!(call.is_canceled());
}
