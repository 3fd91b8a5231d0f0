use thiserror::Error;

/// Failures loading a rule source. Individual malformed rule lines are not
/// errors; they are skipped so one bad line never aborts a large list.
#[derive(Error, Debug, Clone)]
pub enum RuleError {
    #[error("Failed to read rule file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to base64-decode rule file {path}: {reason}")]
    Base64 { path: String, reason: String },
}

/// Upstream caller failures. Each variant names the step that failed so a
/// `call` error is never just "it failed".
#[derive(Error, Debug, Clone)]
pub enum UpstreamError {
    #[error("Invalid upstream address: {0}")]
    InvalidAddress(String),

    #[error("Dial to {server} failed: {reason}")]
    Dial { server: String, reason: String },

    #[error("Write to {server} failed: {reason}")]
    Write { server: String, reason: String },

    #[error("Read from {server} failed: {reason}")]
    Read { server: String, reason: String },

    #[error("Failed to pack query: {0}")]
    Pack(String),

    #[error("Failed to build HTTP request: {0}")]
    BuildRequest(String),

    #[error("Transport error from {server}: {reason}")]
    Transport { server: String, reason: String },

    #[error("Failed to unpack response: {0}")]
    Unpack(String),

    #[error("Query to {server} timed out after {elapsed_ms}ms")]
    Timeout { server: String, elapsed_ms: u64 },

    #[error("Resolution loop detected while resolving {host}")]
    LoopDetected { host: String },

    #[error("Caller is closed")]
    Closed,
}
