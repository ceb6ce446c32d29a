use serde::{Deserialize, Serialize};

/// Claims extracted from a validated bearer credential.
///
/// Constructed once per request by the identity gate and dropped with the
/// request; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject identifier of the authenticated caller.
    pub sub: String,
    /// Expiry as seconds since the Unix epoch.
    pub exp: u64,
}
