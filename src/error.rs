use thiserror::Error;

/// Failure kinds of the monitoring core.
///
/// Parse and subscriber failures are swallowed with counters by their
/// producers; transient store errors are retried with backoff; fatal store
/// errors surface to the caller. Configuration errors fail fast at startup.
#[derive(Debug, Error)]
pub enum Error {
    /// No usable capture interface, or the capture handle could not be opened.
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(String),

    /// A packet could not be decoded. Never fatal to the pipeline.
    #[error("malformed packet: {0}")]
    Parse(String),

    /// A bounded cache hit its capacity and evicted entries. Non-fatal.
    #[error("cache overflow in {cache}: evicted {evicted} entries")]
    CacheOverflow { cache: &'static str, evicted: usize },

    /// Retryable database error (locked, busy, connection lost).
    #[error("transient store error: {0}")]
    StoreTransient(#[source] sqlx::Error),

    /// Database error beyond retry (schema or I/O).
    #[error("fatal store error: {0}")]
    StoreFatal(#[source] sqlx::Error),

    /// A query was given out-of-range or contradictory filter parameters.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// Threat scoring failed; the caller falls back to `safe`.
    #[error("scorer error: {0}")]
    Scorer(String),

    /// A single subscriber failed to take an event. Isolated per subscriber.
    #[error("subscriber error: {0}")]
    Subscriber(String),

    /// Startup configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Whether a database error is worth retrying.
///
/// Matches the SQLite failure modes that clear on their own: the write lock
/// being held, the busy timeout firing, or the connection going away.
pub fn is_transient(e: &sqlx::Error) -> bool {
    let msg = e.to_string().to_lowercase();
    ["locked", "busy", "connection lost", "closed", "unable to open"]
        .iter()
        .any(|keyword| msg.contains(keyword))
}

/// Wrap a database error into the transient or fatal store kind.
pub fn classify_store(e: sqlx::Error) -> Error {
    if is_transient(&e) {
        Error::StoreTransient(e)
    } else {
        Error::StoreFatal(e)
    }
}
