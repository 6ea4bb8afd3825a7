//! Error types for the relay core.
//!
//! `Error` covers everything a listener, connection or the proxy can fail with.
//! `status_code()` decides whether (and how) a failure is reported to the client.

use crate::cache::CacheError;
use crate::config::EndpointParseError;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to connect to upstream {target}: {source}")]
    BadGateway {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("No upstream endpoint to connect to for {0}")]
    NoUpstream(String),

    #[error("Upstream {0} closed the connection before responding")]
    UpstreamClosed(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Malformed response from upstream: {0}")]
    MalformedResponse(String),

    #[error("Message head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("Message body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("Credential revision overflow for {0}")]
    RevisionOverflow(String),

    #[error("Connection is already communicating")]
    AlreadyCommunicating,

    #[error("Connection has been decommissioned")]
    Decommissioned,

    #[error("Object has been disposed")]
    Disposed,

    #[error("No listener is configured")]
    NoListeners,

    #[error("No listener could be started: {0}")]
    NoListenerStarted(String),

    #[error("Listener on {0} is still listening")]
    ListenerRunning(String),

    #[error("Proxy is not started")]
    NotStarted,

    #[error("Proxy must be stopped first")]
    StillStarted,

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Endpoint(#[from] EndpointParseError),
}

impl Error {
    /// Status code of the error response sent to the client, if one should be sent.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::BadGateway { .. }
            | Error::NoUpstream(_)
            | Error::UpstreamClosed(_)
            | Error::MalformedResponse(_)
            | Error::Io(_) => Some(502),
            Error::BodyTooLarge(_) => Some(413),
            Error::RevisionOverflow(_) | Error::Cache(_) | Error::NotStarted => Some(500),
            _ => None,
        }
    }
}

/// Whether an I/O error looks like an ordinary disconnect rather than a fault.
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
    )
}
