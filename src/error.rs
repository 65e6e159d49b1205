use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("peer unreachable: no usable address pair within {0:?}")]
    PeerUnreachable(Duration),
    #[error("transport handshake timed out")]
    HandshakeTimedOut,
    #[error("transport closed: {0}")]
    TransportClosed(#[source] io::Error),
    #[error("cancelled")]
    Cancelled,
    #[error("blocked by local firewall")]
    FirewallBlocking,
    /// Raised internally while decoding inbound signaling payloads. Always
    /// recovered at the orchestrator boundary (logged and dropped), never
    /// returned to a caller awaiting a connection.
    #[error("malformed signal: {0}")]
    MalformedSignal(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
