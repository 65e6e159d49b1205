//! # icelink - peer-to-peer session establishment and tunneling
//!
//! `icelink` lets two game clients that share a session establish a direct,
//! NAT-traversing connection and carries both game-protocol bytes and
//! real-time voice over the single negotiated path.
//!
//! The embedding application supplies the collaborators this crate treats as
//! black boxes: the signaling channel to the relay server
//! ([`SignalingSender`]), the candidate-gathering/connectivity engine
//! ([`DiscoveryFactory`]), optionally a modern secure transport
//! ([`AlternateEngine`]), UI callbacks ([`PlatformHooks`]) and a telemetry
//! sink ([`TelemetrySink`]). Everything in between lives here: credential
//! generation, capability negotiation through the username fragment,
//! candidate relay, transport selection, the reliable stream, voice
//! multiplexing and teardown.
//!
//! ## Connecting
//!
//! ```rust,no_run
//! use icelink::{Config, PeerId, SessionOrchestrator};
//! use bytes::BytesMut;
//!
//! # async fn example(
//! #     signaling: std::sync::Arc<dyn icelink::SignalingSender>,
//! #     discovery: std::sync::Arc<dyn icelink::DiscoveryFactory>,
//! #     hooks: std::sync::Arc<dyn icelink::PlatformHooks>,
//! #     peer: PeerId,
//! # ) -> icelink::Result<()> {
//! let orchestrator = SessionOrchestrator::new(
//!     Config::default(),
//!     signaling,
//!     discovery,
//!     None,
//!     hooks,
//!     std::sync::Arc::new(icelink::NoTelemetry),
//! );
//! let connection = orchestrator.connect(peer).await?;
//! connection.send(BytesMut::from(&b"hello"[..]))?;
//! while let Some(frame) = connection.recv().await? {
//!     println!("got {} bytes", frame.len());
//! }
//! connection.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Accepting
//!
//! Invite the peer, then claim connections as they are established:
//!
//! ```rust,no_run
//! # async fn example(orchestrator: icelink::SessionOrchestrator, peer: icelink::PeerId) {
//! orchestrator.invite(peer);
//! while let Ok(connection) = orchestrator.next_incoming().await {
//!     tokio::spawn(async move {
//!         // handle the connection
//!     });
//! }
//! # }
//! ```
//!
//! Inbound signaling is pushed in from the relay connection:
//! [`SessionOrchestrator::handle_session_signal`] and
//! [`SessionOrchestrator::handle_candidate_signal`]. Both recover from
//! malformed input by logging and dropping it.

pub mod config;
mod diag;
pub mod engine;
pub mod error;
mod extend;
pub mod orchestrator;
mod pool;
pub mod protocol;
pub mod session;
pub mod signal;
pub mod tunnel;

pub use config::Config;
pub use engine::{
    DiscoveryEngine, DiscoveryFactory, FirewallDecision, NatLink, NoTelemetry, PlatformHooks,
    TelemetryEvent, TelemetrySink,
};
pub use error::{Error, Result};
pub use orchestrator::SessionOrchestrator;
pub use protocol::candidate::{Candidate, CandidateKind};
pub use protocol::capability::{negotiate, Capabilities};
pub use protocol::credentials::Credentials;
pub use protocol::{PeerId, CLOSE_SENTINEL, VOICE_TAG};
pub use session::{ConnectionHandle, Role, SessionState};
pub use signal::{CandidateSignal, SessionSignal, SignalingSender};
pub use tunnel::alternate::{AlternateEngine, EngineIo, EngineStream};
pub use tunnel::TransportKind;
