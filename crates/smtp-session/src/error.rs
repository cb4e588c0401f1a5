use thiserror::Error;

/// Errors surfaced by a session. Transport causes are carried as
/// strings so that the same error can fail both the in-flight
/// submission and the session's close completion.
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// A pipelined submission violated the RFC 2920 ordering rules.
    /// Raised before anything is written; not retryable.
    #[error("{0}")]
    InvalidPipelinedRequest(String),
    /// A submission was made while an earlier submission was still
    /// awaiting its responses.
    #[error("{0}")]
    ResponsePending(String),
    #[error("{0}")]
    ChannelClosed(String),
    #[error("{0}")]
    ReadTimeout(String),
    #[error("response is not UTF8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("Malformed Response: {0}")]
    MalformedResponseLine(String),
    #[error("Response line is too long")]
    ResponseTooLong,
    #[error("[{connection_id}] Error {error} reading from the server")]
    ReadError {
        connection_id: String,
        error: String,
    },
    #[error("[{connection_id}] Error {error} writing to the server")]
    WriteError {
        connection_id: String,
        error: String,
    },
    #[error("[{connection_id}] Error {error} flushing the send buffer")]
    FlushError {
        connection_id: String,
        error: String,
    },
    #[error("Error {error} connecting to {address}")]
    ConnectError { address: String, error: String },
    #[error("keep_alive_timeout must not be zero; use None to disable keepalive")]
    ZeroKeepAliveTimeout,
}
