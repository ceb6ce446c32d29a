//! Gatehouse Core: request context chain, claims, execution outcomes, panic
//! isolation, and body redaction shared by the HTTP pipeline.

pub mod claims;
pub mod context;
pub mod outcome;
pub mod panic;
pub mod redaction;

pub use claims::Claims;
pub use context::{ContextKey, RequestContext};
pub use outcome::ExecutionOutcome;
pub use panic::{catch_sync, CatchUnwind, CatchUnwindExt, PanicReport};
pub use redaction::{
    CapturedBody, RedactionPolicy, REDACTION_MARKER, TRUNCATION_SUFFIX, WITHHELD_MARKER,
};
