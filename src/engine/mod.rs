use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;

use crate::protocol::candidate::Candidate;
use crate::protocol::credentials::Credentials;
use crate::protocol::PeerId;
use crate::session::SessionState;
use crate::tunnel::TransportKind;

/// Candidate-gathering and connectivity-check engine, consumed as a black
/// box. One engine instance backs one candidate-pool generation and may serve
/// several concurrent links.
#[async_trait]
pub trait DiscoveryEngine: Send + Sync {
    /// Local candidates, produced as they are discovered. The receiver is
    /// drained by the candidate pool; the channel closes when gathering is
    /// complete.
    fn local_candidates(&self) -> flume::Receiver<Candidate>;

    /// Opens the per-peer connectivity lane for one session.
    async fn open_link(
        &self,
        peer: PeerId,
        local: &Credentials,
        remote: &Credentials,
    ) -> io::Result<Box<dyn NatLink>>;

    /// Releases sockets and gathering state. Idempotent.
    async fn shutdown(&self);

    /// True once the engine has fully shut down and can no longer serve new
    /// links; the pool replaces such a generation on the next acquire.
    fn is_shutdown(&self) -> bool;
}

/// One peer's connectivity lane: remote-candidate intake, the ready-for-data
/// signal, and the punched datagram path once ready. STUN/TURN traffic is the
/// engine's own business and never appears on the datagram channels.
#[async_trait]
pub trait NatLink: Send + Sync {
    async fn add_remote_candidate(&self, candidate: Candidate);

    /// No more remote candidates will arrive.
    fn remote_candidates_done(&self);

    /// Resolves once a usable address pair was selected and the datagram
    /// path is live. Cancellation-safe; the caller bounds it with a timeout.
    async fn ready(&self) -> io::Result<()>;

    /// Outbound datagrams toward the peer. One datagram per frame.
    fn datagram_sender(&self) -> flume::Sender<BytesMut>;

    /// Inbound datagrams from the peer.
    fn datagram_receiver(&self) -> flume::Receiver<BytesMut>;

    /// Selected local address, available after [`NatLink::ready`] resolves.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Selected remote address, available after [`NatLink::ready`] resolves.
    fn remote_addr(&self) -> Option<SocketAddr>;

    async fn close(&self);
}

/// Creates one [`DiscoveryEngine`] per candidate-pool generation.
#[async_trait]
pub trait DiscoveryFactory: Send + Sync {
    async fn create(&self) -> io::Result<Arc<dyn DiscoveryEngine>>;
}

/// Outcome of the firewall retry prompt.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FirewallDecision {
    Retry,
    Cancelled,
}

/// The two UI callbacks plus the local firewall predicate, injected into the
/// orchestrator instead of being discovered through platform reflection.
#[async_trait]
pub trait PlatformHooks: Send + Sync {
    /// True while a local firewall policy would block inbound connectivity.
    fn firewall_blocking(&self) -> bool;

    /// Asks the user to disable the blocking firewall and suspends until
    /// they answer.
    async fn firewall_prompt(&self) -> FirewallDecision;

    /// Renders a diagnostic toast.
    fn toast(&self, message: &str);
}

/// Structured events for the embedding application's telemetry pipeline.
#[derive(Clone, Debug)]
pub enum TelemetryEvent {
    SessionState { peer: PeerId, state: SessionState },
    TransportSelected { peer: PeerId, transport: TransportKind },
    CandidateSent { peer: PeerId },
    CandidateReceived { peer: PeerId },
    Established { peer: PeerId, transport: TransportKind },
    Failed { peer: PeerId, reason: String },
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Sink for embedders that do not collect telemetry.
pub struct NoTelemetry;

impl TelemetrySink for NoTelemetry {
    fn emit(&self, _event: TelemetryEvent) {}
}
