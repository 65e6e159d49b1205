use std::io;

use async_trait::async_trait;

use crate::protocol::PeerId;

/// Credential half of the negotiation, relayed through the signaling channel.
/// The password travels hex-encoded (see [`crate::Credentials::password_hex`]).
#[derive(Clone, Debug)]
pub struct SessionSignal {
    pub peer: PeerId,
    pub username_fragment: String,
    pub password: String,
}

/// One candidate line, or `None` for "no more candidates from this peer".
#[derive(Clone, Debug)]
pub struct CandidateSignal {
    pub peer: PeerId,
    pub candidate: Option<String>,
}

/// Outbound half of the signaling channel: an already-connected reliable
/// channel to the relay server, owned by the embedding application. Inbound
/// signals are pushed into [`crate::SessionOrchestrator::handle_session_signal`]
/// and [`crate::SessionOrchestrator::handle_candidate_signal`].
#[async_trait]
pub trait SignalingSender: Send + Sync {
    async fn send_session(&self, to: PeerId, username_fragment: &str, password: &str)
        -> io::Result<()>;

    /// `candidate = None` tells the peer that candidate gathering finished.
    async fn send_candidate(&self, to: PeerId, candidate: Option<&str>) -> io::Result<()>;
}
