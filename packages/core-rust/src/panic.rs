//! Panic isolation for synchronous calls and futures.
//!
//! A panic barrier only observes panics raised on the unit of execution it
//! wraps. [`CatchUnwind`] therefore wraps every individual `poll` of the
//! inner future, so whichever worker thread polls it is covered, and the
//! barrier travels with the future when it is spawned onto another task.
//!
//! Backtraces must be captured while the panicking stack is still intact,
//! which only a panic hook can do. [`install_backtrace_hook`] chains a hook
//! in front of the existing one: panics raised inside an isolation scope have
//! their backtrace stashed in a thread-local for [`PanicReport`]; all other
//! panics are forwarded to the previous hook unchanged.

use std::any::{type_name, Any};
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};

thread_local! {
    static ISOLATION_DEPTH: Cell<usize> = const { Cell::new(0) };
    static CAPTURED: RefCell<Option<Captured>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

struct Captured {
    location: Option<String>,
    backtrace: String,
}

/// Installs the backtrace-capturing panic hook. Idempotent.
pub fn install_backtrace_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if ISOLATION_DEPTH.with(Cell::get) == 0 {
                previous(info);
                return;
            }
            let captured = Captured {
                location: info.location().map(ToString::to_string),
                backtrace: Backtrace::force_capture().to_string(),
            };
            CAPTURED.with(|slot| *slot.borrow_mut() = Some(captured));
        }));
    });
}

/// Marks the current thread as running inside a panic barrier for its lifetime.
struct IsolationScope;

impl IsolationScope {
    fn enter() -> Self {
        ISOLATION_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for IsolationScope {
    fn drop(&mut self) {
        ISOLATION_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

// ---------------------------------------------------------------------------
// PanicReport
// ---------------------------------------------------------------------------

/// A recovered panic, converted into plain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicReport {
    /// Human-readable rendering of the panic payload.
    pub message: String,
    /// Type name of the payload, when it is one of the recognized types.
    pub type_name: &'static str,
    /// Source location of the `panic!`, when the hook observed it.
    pub location: Option<String>,
    /// Backtrace captured at the panic site.
    pub backtrace: String,
}

impl PanicReport {
    /// Converts a payload returned by `catch_unwind` into a report, consuming
    /// any backtrace the hook stashed on this thread.
    #[must_use]
    pub fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let captured = CAPTURED.with(|slot| slot.borrow_mut().take());
        let (message, type_name) = describe(payload);
        let (location, backtrace) = match captured {
            Some(c) => (c.location, c.backtrace),
            None => (None, "backtrace unavailable".to_string()),
        };
        Self {
            message,
            type_name,
            location,
            backtrace,
        }
    }

    /// Builds a report for a unit that ended without producing a result.
    #[must_use]
    pub fn vanished(reason: impl Into<String>) -> Self {
        Self {
            message: reason.into(),
            type_name: "unknown",
            location: None,
            backtrace: "backtrace unavailable".to_string(),
        }
    }
}

impl fmt::Display for PanicReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "panic at {location}: {}", self.message),
            None => write!(f, "panic: {}", self.message),
        }
    }
}

macro_rules! describe_as {
    ($payload:expr; $($ty:ty),+ $(,)?) => {
        $(
            if let Some(value) = $payload.downcast_ref::<$ty>() {
                return (value.to_string(), type_name::<$ty>());
            }
        )+
    };
}

fn describe(payload: &(dyn Any + Send)) -> (String, &'static str) {
    describe_as!(payload;
        &'static str,
        String,
        Box<dyn std::error::Error + Send + Sync>,
        std::io::Error,
        std::fmt::Error,
        i8, i16, i32, i64, i128, isize,
        u8, u16, u32, u64, u128, usize,
        f32, f64, bool, char,
    );
    (
        "panic payload of unrecognized type".to_string(),
        type_name::<Box<dyn Any + Send>>(),
    )
}

// ---------------------------------------------------------------------------
// Barriers
// ---------------------------------------------------------------------------

/// Runs `f` behind a panic barrier on the current thread.
///
/// # Errors
///
/// Returns the recovered [`PanicReport`] if `f` panics.
pub fn catch_sync<R>(f: impl FnOnce() -> R) -> Result<R, PanicReport> {
    install_backtrace_hook();
    let _scope = IsolationScope::enter();
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| PanicReport::from_payload(&*payload))
}

/// Future adapter that converts a panic during any `poll` into a [`PanicReport`].
///
/// Wraps [`futures_util::FutureExt::catch_unwind`] and holds an isolation
/// scope across each poll so the hook keeps the backtrace. After yielding a
/// report the inner future is dropped and never polled again.
#[must_use = "futures do nothing unless polled"]
pub struct CatchUnwind<F> {
    inner: Option<Pin<Box<futures_util::future::CatchUnwind<AssertUnwindSafe<F>>>>>,
}

impl<F: Future> CatchUnwind<F> {
    pub fn new(future: F) -> Self {
        install_backtrace_hook();
        Self {
            inner: Some(Box::pin(futures_util::FutureExt::catch_unwind(
                AssertUnwindSafe(future),
            ))),
        }
    }
}

impl<F: Future> Future for CatchUnwind<F> {
    type Output = Result<F::Output, PanicReport>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(inner) = self.inner.as_mut() else {
            return Poll::Ready(Err(PanicReport::vanished("polled after completion")));
        };

        let polled = {
            let _scope = IsolationScope::enter();
            inner.as_mut().poll(cx)
        };

        match polled {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                self.inner = None;
                Poll::Ready(result.map_err(|payload| PanicReport::from_payload(&*payload)))
            }
        }
    }
}

/// Extension trait adding [`CatchUnwind`] to every future.
pub trait CatchUnwindExt: Future + Sized {
    fn catch_unwind(self) -> CatchUnwind<Self> {
        CatchUnwind::new(self)
    }
}

impl<F: Future> CatchUnwindExt for F {}
