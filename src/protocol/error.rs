//! Error types for the host/worker control protocol.

use thiserror::Error;

/// Errors produced by the control protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A line could not be decoded into a known message.
    #[error("protocol violation: malformed message {line:?}: {source}")]
    Malformed {
        /// The offending line, truncated for logging.
        line: String,
        /// The decode error.
        #[source]
        source: serde_json::Error,
    },

    /// A well-formed message arrived where it makes no sense.
    #[error("protocol violation: unexpected {code} message")]
    Unexpected {
        /// Wire code of the message.
        code: &'static str,
    },

    /// The peer went away.
    #[error("control channel closed")]
    ChannelClosed,

    /// The worker is terminating; pending and new RPCs resolve to this.
    #[error("worker is terminating")]
    Terminated,

    /// An RPC was not answered within the configured timeout.
    #[error("no reply to {code} within {millis} ms")]
    Timeout {
        /// Wire code of the request.
        code: &'static str,
        /// Configured timeout.
        millis: u64,
    },

    /// Reading or writing the channel failed.
    #[error("control channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether this error means the peer broke the wire contract.
    #[must_use]
    pub fn is_violation(&self) -> bool {
        matches!(self, Self::Malformed { .. } | Self::Unexpected { .. })
    }
}
