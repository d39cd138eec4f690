use thiserror::Error;

/// Errors the core must be able to match on.
///
/// Provider adapters and the HTTP layer wrap everything else in
/// `anyhow::Error`; these kinds cross module boundaries and drive
/// control flow (skip the follow-up call, exit cleanly, etc.).
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The caller's transport ended while a dispatch was pending.
    #[error("caller closed")]
    CallerClosed,

    /// The client went away or the request was cancelled. No follow-up
    /// call is attempted and nothing is surfaced to the client.
    #[error("request cancelled")]
    Cancelled,

    /// The bridge config file is absent. The bridge does not start;
    /// this is not a failure of the host.
    #[error("bridge config not found: {0}")]
    ConfigNotFound(String),

    /// Non-2xx or transport failure from the upstream LLM. The message
    /// carries the provider's status and body, never a credential.
    #[error("provider error ({status}): {message}")]
    Provider { status: u16, message: String },
}
