//! Deadline-bounded, panic-isolated handler execution.
//!
//! Each request is handed to a freshly spawned task (the isolated unit)
//! wrapped in a panic barrier, while the request-serving task waits on
//! whichever comes first: the unit's result or the request's [`Deadline`].
//!
//! ```text
//! Pending -> Running -> Completed   handler response passed through
//!                    -> Panicked    500, panic logged with backtrace
//!                    -> TimedOut    408, unit cancelled and left to finish
//! ```
//!
//! Exactly one side may commit the response. Both sides race on a single
//! [`ResponseCommit`] compare-and-swap; the loser backs off. A unit that
//! finishes after the deadline committed has its result dropped and counted
//! as a late completion, so nothing it produces can reach the client. Ties go
//! to the deadline: a result produced at or after the expiry instant is
//! discarded the same way even if it reaches the commit first.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::Response;
use gatehouse_core::{CatchUnwindExt, ExecutionOutcome, PanicReport, RequestContext};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, error, info_span, warn, Instrument, Span};

use super::{request_context, route_of, ResponseFuture};
use crate::network::lifecycle::ExecutionStats;
use crate::service::config::SupervisorConfig;
use crate::service::deadline::Deadline;
use crate::service::error::{json_message, panic_response, timeout_response, UNAVAILABLE_MESSAGE};

// ---------------------------------------------------------------------------
// ResponseCommit
// ---------------------------------------------------------------------------

/// The party that committed the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOwner {
    Handler,
    Deadline,
}

const PENDING: u8 = 0;
const HANDLER: u8 = 1;
const DEADLINE: u8 = 2;

/// One-shot commit flag shared by the waiting task and the isolated unit.
#[derive(Debug)]
pub struct ResponseCommit(AtomicU8);

impl ResponseCommit {
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU8::new(PENDING))
    }

    /// Attempts to become the sole committer. Returns `false` if the other
    /// side already committed.
    pub fn claim(&self, owner: CommitOwner) -> bool {
        let tag = match owner {
            CommitOwner::Handler => HANDLER,
            CommitOwner::Deadline => DEADLINE,
        };
        self.0
            .compare_exchange(PENDING, tag, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[must_use]
    pub fn owner(&self) -> Option<CommitOwner> {
        match self.0.load(Ordering::Acquire) {
            HANDLER => Some(CommitOwner::Handler),
            DEADLINE => Some(CommitOwner::Deadline),
            _ => None,
        }
    }
}

impl Default for ResponseCommit {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// SupervisorLayer
// ---------------------------------------------------------------------------

/// Tower layer running the inner service under the execution supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorLayer {
    config: SupervisorConfig,
    stats: Arc<ExecutionStats>,
}

impl SupervisorLayer {
    #[must_use]
    pub fn new(config: SupervisorConfig, stats: Arc<ExecutionStats>) -> Self {
        Self { config, stats }
    }
}

impl<S> Layer<S> for SupervisorLayer {
    type Service = SupervisorService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SupervisorService {
            inner,
            config: self.config.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

// ---------------------------------------------------------------------------
// SupervisorService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SupervisorService<S> {
    inner: S,
    config: SupervisorConfig,
    stats: Arc<ExecutionStats>,
}

impl<S> Service<Request> for SupervisorService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);

        let deadline = Deadline::new(&request_context(&req), self.config.request_timeout);
        req.extensions_mut().insert(deadline.clone());

        Box::pin(supervise(
            inner,
            req,
            deadline,
            self.config.clone(),
            Arc::clone(&self.stats),
        ))
    }
}

type UnitResult = Result<Response, PanicReport>;

/// What the isolated unit hands back to the waiting task.
struct Delivery {
    result: UnitResult,
    /// Whether the unit finished strictly before the expiry instant.
    in_time: bool,
}

async fn supervise<S>(
    inner: S,
    req: Request,
    deadline: Deadline,
    config: SupervisorConfig,
    stats: Arc<ExecutionStats>,
) -> Result<Response, Infallible>
where
    S: Service<Request, Response = Response, Error = Infallible> + Send + 'static,
    S::Future: Send + 'static,
{
    let ctx = deadline.context().clone();
    let method = req.method().clone();
    let route = route_of(&req);

    // Leaving this function by any path fires the deadline for the unit.
    let _cancel_on_exit = deadline.token().clone().drop_guard();

    let Ok(runtime) = Handle::try_current() else {
        error!(
            correlation_id = ctx.correlation_id(),
            method = %method,
            route = %route,
            "no async runtime available to launch the request handler"
        );
        return Ok(json_message(StatusCode::SERVICE_UNAVAILABLE, UNAVAILABLE_MESSAGE));
    };

    let commit = Arc::new(ResponseCommit::new());
    let (tx, mut rx) = oneshot::channel::<Delivery>();
    let unit = IsolatedUnit::start(&deadline, Arc::clone(&commit), Arc::clone(&stats), tx);

    let unit_span = info_span!(
        parent: None,
        "supervised_unit",
        correlation_id = ctx.correlation_id(),
        method = %method,
        route = %route,
    );
    unit_span.follows_from(&Span::current());

    drop(runtime.spawn(
        async move {
            let result = inner.oneshot(req).catch_unwind().await.map(|response| match response {
                Ok(response) => response,
                Err(never) => match never {},
            });
            unit.finish(result);
        }
        .instrument(unit_span),
    ));

    let outcome = tokio::select! {
        biased;
        received = &mut rx => received.into_outcome(&deadline, &stats),
        () = deadline.cancelled() => {
            // Marked before the claim so the unit never unmarks an orphan
            // that was not yet counted.
            stats.orphan_marked();
            if commit.claim(CommitOwner::Deadline) {
                deadline.cancel();
                stats.timed_out();
                ExecutionOutcome::TimedOut { after: deadline.timeout() }
            } else {
                // The unit committed first; its result is already on the way.
                stats.orphan_unmarked();
                (&mut rx).await.into_outcome(&deadline, &stats)
            }
        }
    };

    Ok(respond(outcome, &ctx, &method, &route, &config, &stats))
}

trait IntoOutcome {
    fn into_outcome(self, deadline: &Deadline, stats: &ExecutionStats) -> ExecutionOutcome<Response>;
}

impl IntoOutcome for Result<Delivery, oneshot::error::RecvError> {
    fn into_outcome(self, deadline: &Deadline, stats: &ExecutionStats) -> ExecutionOutcome<Response> {
        match self {
            Ok(Delivery { result, in_time: true }) => result.into(),
            Ok(Delivery { result, in_time: false }) => {
                record_late_completion(stats, deadline.context(), &result);
                stats.timed_out();
                ExecutionOutcome::TimedOut {
                    after: deadline.timeout(),
                }
            }
            Err(_) => ExecutionOutcome::Panicked(PanicReport::vanished(
                "isolated unit ended without reporting a result",
            )),
        }
    }
}

fn record_late_completion(stats: &ExecutionStats, ctx: &RequestContext, result: &UnitResult) {
    stats.late_completion();
    metrics::counter!("supervisor_late_completions_total").increment(1);
    let discarded = match result {
        Ok(response) => response.status().as_u16().to_string(),
        Err(report) => report.to_string(),
    };
    warn!(
        correlation_id = ctx.correlation_id(),
        discarded = %discarded,
        "late completion discarded after timeout response"
    );
}

fn respond(
    outcome: ExecutionOutcome<Response>,
    ctx: &RequestContext,
    method: &axum::http::Method,
    route: &str,
    config: &SupervisorConfig,
    stats: &ExecutionStats,
) -> Response {
    metrics::counter!("supervisor_outcomes_total", "outcome" => outcome.label()).increment(1);
    debug!(
        correlation_id = ctx.correlation_id(),
        outcome = outcome.label(),
        "supervised request settled"
    );
    match outcome {
        ExecutionOutcome::Completed(response) => response,
        ExecutionOutcome::Panicked(report) => {
            stats.panicked();
            error!(
                correlation_id = ctx.correlation_id(),
                method = %method,
                route,
                panic.message = %report.message,
                "panic.type" = report.type_name,
                panic.location = report.location.as_deref().unwrap_or("unknown"),
                panic.backtrace = %report.backtrace,
                "recovered panic in request handler"
            );
            metrics::counter!("http_request_panics_total", "layer" => "supervisor").increment(1);
            panic_response(&report, config.expose_panic_details)
        }
        ExecutionOutcome::TimedOut { after } => {
            warn!(
                correlation_id = ctx.correlation_id(),
                method = %method,
                route,
                timeout_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
                "request timed out"
            );
            metrics::counter!("http_request_timeouts_total").increment(1);
            timeout_response()
        }
    }
}

// ---------------------------------------------------------------------------
// IsolatedUnit
// ---------------------------------------------------------------------------

/// The spawned side of a supervised request. Accounts for itself in
/// [`ExecutionStats`] from launch until drop.
struct IsolatedUnit {
    commit: Arc<ResponseCommit>,
    stats: Arc<ExecutionStats>,
    tx: Option<oneshot::Sender<Delivery>>,
    ctx: RequestContext,
    expires_at: Instant,
}

impl IsolatedUnit {
    fn start(
        deadline: &Deadline,
        commit: Arc<ResponseCommit>,
        stats: Arc<ExecutionStats>,
        tx: oneshot::Sender<Delivery>,
    ) -> Self {
        stats.unit_started();
        Self {
            commit,
            stats,
            tx: Some(tx),
            ctx: deadline.context().clone(),
            expires_at: deadline.expires_at(),
        }
    }

    fn finish(mut self, result: UnitResult) {
        let in_time = Instant::now() < self.expires_at;
        if self.commit.claim(CommitOwner::Handler) {
            if let Some(tx) = self.tx.take() {
                // The waiting side is gone if the client disconnected.
                let _ = tx.send(Delivery { result, in_time });
            }
            return;
        }
        record_late_completion(&self.stats, &self.ctx, &result);
    }
}

impl Drop for IsolatedUnit {
    fn drop(&mut self) {
        let orphaned = self.commit.owner() == Some(CommitOwner::Deadline);
        self.stats.unit_finished(orphaned);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use std::task::Wake;
    use std::time::Duration;

    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use serde_json::{json, Value};
    use tracing_subscriber::fmt::MakeWriter;

    use super::*;

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for LogBuffer {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn config(timeout: Duration, expose: bool) -> SupervisorConfig {
        SupervisorConfig {
            request_timeout: timeout,
            expose_panic_details: expose,
        }
    }

    fn get_request(path: &str) -> Request {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn supervised(router: Router, config: SupervisorConfig) -> (Router, Arc<ExecutionStats>) {
        let stats = Arc::new(ExecutionStats::new());
        (router.layer(SupervisorLayer::new(config, Arc::clone(&stats))), stats)
    }

    #[test]
    fn commit_is_claimed_exactly_once() {
        let commit = ResponseCommit::new();
        assert_eq!(commit.owner(), None);
        assert!(commit.claim(CommitOwner::Deadline));
        assert!(!commit.claim(CommitOwner::Handler));
        assert!(!commit.claim(CommitOwner::Deadline));
        assert_eq!(commit.owner(), Some(CommitOwner::Deadline));
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        for _ in 0..100 {
            let commit = Arc::new(ResponseCommit::new());
            let handles: Vec<_> = [CommitOwner::Handler, CommitOwner::Deadline]
                .into_iter()
                .map(|owner| {
                    let commit = Arc::clone(&commit);
                    std::thread::spawn(move || commit.claim(owner))
                })
                .collect();
            let wins = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(wins, 1);
        }
    }

    #[tokio::test]
    async fn completed_response_passes_through() {
        let router = Router::new().route(
            "/ok",
            get(|| async { (StatusCode::CREATED, [("x-handler", "yes")], "made") }),
        );
        let (app, stats) = supervised(router, config(Duration::from_secs(5), false));

        let response = app.oneshot(get_request("/ok")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-handler"], "yes");
        assert_eq!(body_string(response).await, "made");

        tokio::task::yield_now().await;
        assert_eq!(stats.in_flight(), 0);
        assert_eq!(stats.timeouts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn settled_outcome_is_logged_by_label() {
        let buffer = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(buffer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let router = Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            )
            .route("/boom", get(|| async { panic!("labelled") as () }));
        let (app, _) = supervised(router, config(Duration::from_millis(100), false));
        for path in ["/ok", "/slow", "/boom"] {
            let _ = app.clone().oneshot(get_request(path)).await.unwrap();
        }

        let logs = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        for label in ["completed", "timed_out", "panicked"] {
            assert!(
                logs.lines()
                    .any(|line| line.contains("supervised request settled") && line.contains(label)),
                "no settled line for {label}:\n{logs}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out_and_late_result_is_discarded() {
        let router = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                "too late"
            }),
        );
        let (app, stats) = supervised(router, config(Duration::from_millis(100), false));

        let start = Instant::now();
        let response = app.oneshot(get_request("/slow")).await.unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(stats.timeouts(), 1);
        assert_eq!(stats.orphaned(), 1);
        assert_eq!(stats.in_flight(), 1);

        // Let the abandoned unit run to its own conclusion.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(stats.late_completions(), 1);
        assert_eq!(stats.orphaned(), 0);
        assert_eq!(stats.in_flight(), 0);

        assert_eq!(body_json(response).await, json!({ "message": "request timeout" }));
    }

    #[tokio::test(start_paused = true)]
    async fn handler_observing_deadline_abandons_promptly() {
        let abandoned = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&abandoned);
        let router = Router::new().route(
            "/cooperative",
            get(move |deadline: Deadline| {
                let flag = Arc::clone(&flag);
                async move {
                    match deadline.run(tokio::time::sleep(Duration::from_secs(60))).await {
                        Ok(()) => "finished",
                        Err(_) => {
                            flag.store(true, Ordering::SeqCst);
                            "abandoned"
                        }
                    }
                }
            }),
        );
        let (app, stats) = supervised(router, config(Duration::from_millis(50), false));

        let response = app.oneshot(get_request("/cooperative")).await.unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(abandoned.load(Ordering::SeqCst));
        assert_eq!(stats.in_flight(), 0);
        assert_eq!(stats.orphaned(), 0);
        assert_eq!(stats.late_completions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn race_at_the_deadline_commits_exactly_one_response() {
        let router = Router::new().route(
            "/edge",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                "done"
            }),
        );
        let (app, stats) = supervised(router, config(Duration::from_millis(100), false));

        for _ in 0..50 {
            let late_before = stats.late_completions();
            let response = app.clone().oneshot(get_request("/edge")).await.unwrap();
            let status = response.status();
            tokio::time::sleep(Duration::from_millis(10)).await;

            match status {
                StatusCode::OK => {
                    assert_eq!(body_string(response).await, "done");
                    assert_eq!(stats.late_completions(), late_before);
                }
                StatusCode::REQUEST_TIMEOUT => {
                    assert_eq!(body_json(response).await, json!({ "message": "request timeout" }));
                    assert_eq!(stats.late_completions(), late_before + 1);
                }
                other => panic!("unexpected status {other}"),
            }
            assert_eq!(stats.orphaned(), 0);
            assert_eq!(stats.in_flight(), 0);
        }
    }

    #[derive(Debug)]
    struct Opaque;

    #[tokio::test]
    async fn panics_of_every_payload_kind_become_500() {
        let router = Router::new()
            .route("/str", get(|| async { panic!("boom-str") as () }))
            .route(
                "/string",
                get(|| async { std::panic::panic_any(format!("boom-{}", "string")) as () }),
            )
            .route(
                "/io",
                get(|| async { std::panic::panic_any(io::Error::other("disk on fire")) as () }),
            )
            .route("/int", get(|| async { std::panic::panic_any(42_i32) as () }))
            .route("/opaque", get(|| async { std::panic::panic_any(Opaque) as () }));
        let (app, stats) = supervised(router, config(Duration::from_secs(5), true));

        let mut types = Vec::new();
        for (path, expected) in [
            ("/str", "boom-str"),
            ("/string", "boom-string"),
            ("/io", "disk on fire"),
            ("/int", "42"),
            ("/opaque", "panic payload of unrecognized type"),
        ] {
            let response = app.clone().oneshot(get_request(path)).await.unwrap();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR, "{path}");
            let body = body_json(response).await;
            assert_eq!(body["message"], "internal server error");
            assert_eq!(body["error"], expected, "{path}");
            types.push(body["type"].as_str().unwrap().to_string());
        }

        types.sort();
        types.dedup();
        assert_eq!(types.len(), 5);
        assert_eq!(stats.panics(), 5);
    }

    #[tokio::test]
    async fn panic_details_hidden_by_default() {
        let router = Router::new().route("/boom", get(|| async { panic!("secret internals") as () }));
        let (app, _) = supervised(router, config(Duration::from_secs(5), false));

        let response = app.oneshot(get_request("/boom")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await, json!({ "message": "internal server error" }));
    }

    #[tokio::test]
    async fn server_keeps_serving_after_a_panic() {
        let router = Router::new()
            .route("/boom", get(|| async { panic!("boom") as () }))
            .route("/ok", get(|| async { "ok" }));
        let (app, _) = supervised(router, config(Duration::from_secs(5), false));

        let first = app.clone().oneshot(get_request("/boom")).await.unwrap();
        assert_eq!(first.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let second = app.oneshot(get_request("/ok")).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
    }

    struct NoopWake;

    impl Wake for NoopWake {
        fn wake(self: Arc<Self>) {}
    }

    #[test]
    fn launch_without_runtime_is_503() {
        let inner = tower::service_fn(|_req: Request| async {
            Ok::<_, Infallible>(Response::new(Body::from("unreachable")))
        });
        let stats = Arc::new(ExecutionStats::new());
        let mut service = SupervisorLayer::new(config(Duration::from_secs(1), false), Arc::clone(&stats))
            .layer(inner);

        let mut fut = service.call(get_request("/"));
        let waker = Arc::new(NoopWake).into();
        let mut cx = Context::from_waker(&waker);
        let Poll::Ready(Ok(response)) = fut.as_mut().poll(&mut cx) else {
            panic!("supervisor should answer synchronously without a runtime");
        };

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(stats.in_flight(), 0);
    }
}
