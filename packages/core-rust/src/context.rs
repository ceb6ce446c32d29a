//! Immutable, append-only request context.
//!
//! A [`RequestContext`] is a persistent linked chain of key/value bindings.
//! Enrichment never mutates an existing context: [`RequestContext::with`]
//! returns a new context whose head is the new binding and whose tail is
//! shared with the parent. Cloning is one `Arc` increment, so the chain can
//! be handed to concurrently running units without locks.

use std::fmt;
use std::sync::Arc;

/// Keys that can be bound into a [`RequestContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKey {
    /// Per-request correlation identifier (`X-Request-ID`).
    CorrelationId,
    /// Authenticated subject; unbound for anonymous requests.
    SubjectId,
    /// Distributed trace identifier (32 lowercase hex chars).
    TraceId,
    /// Span identifier of the request span (16 lowercase hex chars).
    SpanId,
}

impl ContextKey {
    pub const ALL: [Self; 4] = [
        Self::CorrelationId,
        Self::SubjectId,
        Self::TraceId,
        Self::SpanId,
    ];

    /// Field name used in debug output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CorrelationId => "correlation_id",
            Self::SubjectId => "subject_id",
            Self::TraceId => "trace_id",
            Self::SpanId => "span_id",
        }
    }
}

struct Binding {
    key: ContextKey,
    value: Arc<str>,
    parent: Option<Arc<Binding>>,
}

/// Per-request context carrying correlation, identity, and tracing identifiers.
///
/// Lookups walk the chain from the newest binding, so rebinding a key in a
/// derived context shadows the parent's value without touching it. Looking
/// up a key that was never bound yields `""`.
#[derive(Clone, Default)]
pub struct RequestContext {
    head: Option<Arc<Binding>>,
}

impl RequestContext {
    /// Creates an empty context with no bindings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a derived context with `key` bound to `value`.
    #[must_use]
    pub fn with(&self, key: ContextKey, value: impl Into<Arc<str>>) -> Self {
        Self {
            head: Some(Arc::new(Binding {
                key,
                value: value.into(),
                parent: self.head.clone(),
            })),
        }
    }

    /// Returns the newest value bound to `key`, or `""` if unbound.
    #[must_use]
    pub fn get(&self, key: ContextKey) -> &str {
        self.lookup(key).unwrap_or("")
    }

    #[must_use]
    pub fn with_correlation_id(&self, id: impl Into<Arc<str>>) -> Self {
        self.with(ContextKey::CorrelationId, id)
    }

    #[must_use]
    pub fn with_subject_id(&self, subject: impl Into<Arc<str>>) -> Self {
        self.with(ContextKey::SubjectId, subject)
    }

    #[must_use]
    pub fn with_trace(&self, trace_id: impl Into<Arc<str>>, span_id: impl Into<Arc<str>>) -> Self {
        self.with(ContextKey::TraceId, trace_id)
            .with(ContextKey::SpanId, span_id)
    }

    #[must_use]
    pub fn correlation_id(&self) -> &str {
        self.get(ContextKey::CorrelationId)
    }

    #[must_use]
    pub fn subject_id(&self) -> &str {
        self.get(ContextKey::SubjectId)
    }

    #[must_use]
    pub fn trace_id(&self) -> &str {
        self.get(ContextKey::TraceId)
    }

    #[must_use]
    pub fn span_id(&self) -> &str {
        self.get(ContextKey::SpanId)
    }

    fn lookup(&self, key: ContextKey) -> Option<&str> {
        let mut node = self.head.as_deref();
        while let Some(binding) = node {
            if binding.key == key {
                return Some(&binding.value);
            }
            node = binding.parent.as_deref();
        }
        None
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("RequestContext");
        for key in ContextKey::ALL {
            out.field(key.as_str(), &self.get(key));
        }
        out.finish()
    }
}
