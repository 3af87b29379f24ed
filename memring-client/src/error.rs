//! Error types for the cache client.

use std::fmt;
use std::io;

use memring_proto::ProtoError;
use thiserror::Error;

/// Result type alias for cache client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the cache client.
///
/// A missing key is never an error: get-like operations report it as
/// `Ok(None)` (or `false` for `exists`/`delete`).
#[derive(Debug, Error)]
pub enum Error {
    /// Transport could not be established to a node.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Network failure on an established connection.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A connect/read/write deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The response violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),

    /// The server answered with an explicit error reply.
    #[error("server error: {0}")]
    Server(String),

    /// The response type did not match the command that was sent.
    #[error("unexpected response for {0}")]
    Unexpected(&'static str),

    /// Key rejected before transmission (empty, too long, or unsendable).
    #[error("invalid key: {0}")]
    BadKey(&'static str),

    /// Value exceeds the configured maximum size.
    #[error("value of {len} bytes exceeds limit of {max}")]
    ValueTooLarge { len: usize, max: usize },

    /// Pool is saturated and no connection freed up within the acquire timeout.
    #[error("connection pool for {addr} exhausted")]
    PoolExhausted { addr: String },

    /// Circuit breaker is open for this node; no network attempt was made.
    #[error("node {addr} suspended after repeated failures")]
    NodeSuspended { addr: String },

    /// The ring holds no nodes.
    #[error("no cache servers available")]
    NoServers,

    /// Invalid configuration, surfaced at construction time only.
    #[error("config error: {0}")]
    Config(String),

    /// A multi-node operation failed on some nodes but not others.
    #[error("{0}")]
    Partial(PartialFailure),
}

impl Error {
    /// True for failures that a retry against the same node can plausibly fix.
    ///
    /// Protocol violations, server rejections, and caller mistakes are never
    /// retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Connect { .. } | Error::Io(_) | Error::Timeout => true,
            Error::Protocol(ProtoError::Io(_)) | Error::Protocol(ProtoError::Eof) => true,
            _ => false,
        }
    }
}

/// Per-node breakdown of a failed multi-node operation.
///
/// The operation was still attempted on every node; entries here cover only
/// the nodes that failed after retries.
#[derive(Debug)]
pub struct PartialFailure {
    pub failures: Vec<NodeFailure>,
}

/// One failed node within a `PartialFailure`.
#[derive(Debug)]
pub struct NodeFailure {
    /// Node address the batch was routed to.
    pub addr: String,
    /// Keys whose outcome was lost with this node. Empty for broadcast
    /// operations such as flush.
    pub keys: Vec<String>,
    /// The error that sank the batch.
    pub error: Box<Error>,
}

impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} node(s) failed:", self.failures.len())?;
        for failure in &self.failures {
            write!(f, " {} ({} keys): {};", failure.addr, failure.keys.len(), failure.error)?;
        }
        Ok(())
    }
}
