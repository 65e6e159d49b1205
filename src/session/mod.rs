use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_shutdown::ShutdownManager;
use bytes::BytesMut;
use crossbeam_utils::atomic::AtomicCell;
use tokio::time::timeout;

use crate::config::Config;
use crate::diag::ConnLog;
use crate::engine::{NatLink, TelemetryEvent, TelemetrySink};
use crate::error::{Error, Result};
use crate::extend::frame_queue::{frame_queue, FrameReceiver, FrameSender};
use crate::extend::spawn_guarded;
use crate::pool::PoolHandle;
use crate::protocol::candidate::Candidate;
use crate::protocol::capability::negotiate;
use crate::protocol::credentials::Credentials;
use crate::protocol::{PeerId, VOICE_TAG};
use crate::signal::SignalingSender;
use crate::tunnel::alternate::AlternateEngine;
use crate::tunnel::reliable::StreamConfig;
use crate::tunnel::{alternate, reliable, TransportKind};

pub(crate) mod voice;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Role {
    Initiator,
    Responder,
}

/// Lifecycle of one connection attempt. `Closed` is terminal and reachable
/// from every other state through cancellation or failure.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SessionState {
    Created,
    AwaitingRemoteCredentials,
    Negotiating,
    AwaitingConnectivity,
    TransportHandshake,
    Open,
    Closing,
    Closed,
}

/// Everything a session task needs, assembled by the orchestrator.
pub(crate) struct SessionCtx {
    pub peer: PeerId,
    pub role: Role,
    pub local: Credentials,
    /// Seeded for responders; initiators wait on `remote_rx`.
    pub remote: Option<Credentials>,
    pub remote_rx: tokio::sync::mpsc::Receiver<Credentials>,
    pub intake: flume::Receiver<Option<Candidate>>,
    pub pool: PoolHandle,
    pub config: Arc<Config>,
    pub signaling: Arc<dyn SignalingSender>,
    pub alternate: Option<Arc<dyn AlternateEngine>>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub shutdown: ShutdownManager<()>,
    pub state: Arc<AtomicCell<SessionState>>,
    pub log: Arc<ConnLog>,
}

fn transition(ctx: &SessionCtx, state: SessionState) {
    ctx.state.store(state);
    ctx.log.record(format!("state -> {state:?}"));
    ctx.telemetry.emit(TelemetryEvent::SessionState {
        peer: ctx.peer,
        state,
    });
}

/// Drives one session from credential generation to an open transport.
/// Subordinate tasks (candidate streaming, link pump, transport, voice
/// relay) stay alive under the session's shutdown scope after this returns.
pub(crate) async fn run(mut ctx: SessionCtx) -> Result<ConnectionHandle> {
    transition(&ctx, SessionState::AwaitingRemoteCredentials);
    let remote = match ctx.remote.take() {
        Some(remote) => remote,
        None => {
            ctx.signaling
                .send_session(ctx.peer, &ctx.local.ufrag, &ctx.local.password_hex())
                .await?;
            ctx.remote_rx.recv().await.ok_or(Error::Cancelled)?
        }
    };
    if ctx.role == Role::Responder {
        // Answer with our half of the credentials so the initiator can
        // resolve its side.
        ctx.signaling
            .send_session(ctx.peer, &ctx.local.ufrag, &ctx.local.password_hex())
            .await?;
    }

    transition(&ctx, SessionState::Negotiating);
    let caps = negotiate(&ctx.local, &remote);
    ctx.log.record(format!(
        "negotiated alternate={} voice_port={:?} (remote ufrag {})",
        caps.prefers_alternate_transport, caps.voice_port, remote.ufrag
    ));

    let link: Arc<dyn NatLink> = Arc::from(
        ctx.pool
            .engine()
            .open_link(ctx.peer, &ctx.local, &remote)
            .await?,
    );
    tokio::spawn({
        let shutdown = ctx.shutdown.clone();
        let link = link.clone();
        async move {
            let token = shutdown.delay_shutdown_token();
            shutdown.wait_shutdown_triggered().await;
            link.close().await;
            drop(token);
        }
    });
    stream_local_candidates(&ctx);
    feed_remote_candidates(&ctx, link.clone());

    transition(&ctx, SessionState::AwaitingConnectivity);
    match timeout(ctx.config.connectivity_timeout, link.ready()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(Error::Io(e)),
        Err(_) => return Err(Error::PeerUnreachable(ctx.config.connectivity_timeout)),
    }
    ctx.log.record(format!(
        "connectivity ready, pair {:?} -> {:?}",
        link.local_addr(),
        link.remote_addr()
    ));

    transition(&ctx, SessionState::TransportHandshake);
    let capacity = ctx.config.frame_queue_capacity;
    let (send_tx, send_rx) = frame_queue(capacity);
    let (recv_tx, recv_rx) = frame_queue(capacity);
    let (voice_out_tx, voice_out_rx) = frame_queue(capacity);
    let (voice_in_tx, voice_in_rx) = frame_queue(capacity);
    let (closed_tx, closed_rx) = flume::bounded(1);
    let (transport_tx, transport_rx) = tokio::sync::mpsc::channel::<BytesMut>(512);
    pump_link(&ctx, link.clone(), transport_tx, voice_in_tx);
    forward_voice(&ctx, link.clone(), voice_out_rx);

    let out = link.datagram_sender();
    let (kind, voice_port) = match (caps.prefers_alternate_transport, ctx.alternate.clone()) {
        (true, Some(engine)) => {
            let advertised = match ctx.role {
                Role::Responder => ctx.config.voice_port.unwrap_or(0),
                Role::Initiator => 0,
            };
            let learned = alternate::establish(
                ctx.role,
                engine,
                advertised,
                out,
                transport_rx,
                send_rx,
                recv_tx,
                closed_tx,
                &ctx.shutdown,
            )
            .await
            .map_err(Error::TransportClosed)?;
            // In-band negotiation supersedes the ufrag voice flag here.
            let voice = match ctx.role {
                Role::Initiator => learned,
                Role::Responder => ctx.config.voice_port,
            };
            (TransportKind::Alternate, voice)
        }
        _ => {
            let stream_cfg = StreamConfig {
                mtu: ctx.config.stream_mtu,
                window: ctx.config.stream_window,
                probe_interval: ctx.config.probe_interval,
            };
            timeout(
                ctx.config.handshake_timeout,
                reliable::establish(
                    ctx.role,
                    out,
                    transport_rx,
                    send_rx,
                    recv_tx,
                    closed_tx,
                    ctx.shutdown.clone(),
                    stream_cfg,
                ),
            )
            .await
            .map_err(|_| Error::HandshakeTimedOut)?
            .map_err(Error::TransportClosed)?;
            (TransportKind::ReliableStream, caps.voice_port)
        }
    };
    ctx.telemetry.emit(TelemetryEvent::TransportSelected {
        peer: ctx.peer,
        transport: kind,
    });

    transition(&ctx, SessionState::Open);
    let mut voice_relay = None;
    if let Some(port) = voice_port {
        voice_relay = voice::start(
            ctx.shutdown.clone(),
            ctx.config.voice_relay_bind,
            port,
            voice_in_rx,
            voice_out_tx,
        )
        .await;
        match voice_relay {
            Some(addr) => ctx.log.record(format!("voice relay on {addr} -> app port {port}")),
            None => ctx.log.record("voice relay unavailable, continuing without".into()),
        }
    }

    Ok(ConnectionHandle {
        peer: ctx.peer,
        transport: kind,
        send: send_tx,
        recv: recv_rx,
        closed: closed_rx,
        shutdown: ctx.shutdown.clone(),
        close_timeout: ctx.config.close_timeout,
        state: ctx.state.clone(),
        voice_relay,
    })
}

/// Streams pool candidates to the peer as each one is discovered, then the
/// end-of-candidates marker.
fn stream_local_candidates(ctx: &SessionCtx) {
    let candidates = ctx.pool.candidates();
    let signaling = ctx.signaling.clone();
    let telemetry = ctx.telemetry.clone();
    let log = ctx.log.clone();
    let peer = ctx.peer;
    spawn_guarded(&ctx.shutdown, async move {
        while let Ok(candidate) = candidates.recv_async().await {
            log.record(format!("sending candidate {candidate}"));
            if signaling
                .send_candidate(peer, Some(&candidate.to_line()))
                .await
                .is_err()
            {
                return;
            }
            telemetry.emit(TelemetryEvent::CandidateSent { peer });
        }
        _ = signaling.send_candidate(peer, None).await;
        log.record("local candidate gathering complete".into());
    });
}

/// Feeds inbound candidate signals into the connectivity engine in arrival
/// order until the end-of-candidates marker.
fn feed_remote_candidates(ctx: &SessionCtx, link: Arc<dyn NatLink>) {
    let intake = ctx.intake.clone();
    let telemetry = ctx.telemetry.clone();
    let log = ctx.log.clone();
    let peer = ctx.peer;
    spawn_guarded(&ctx.shutdown, async move {
        while let Ok(message) = intake.recv_async().await {
            match message {
                Some(candidate) => {
                    log.record(format!("received candidate {candidate}"));
                    link.add_remote_candidate(candidate).await;
                    telemetry.emit(TelemetryEvent::CandidateReceived { peer });
                }
                None => {
                    log.record("peer candidate intake closed".into());
                    link.remote_candidates_done();
                    return;
                }
            }
        }
    });
}

/// Demultiplexes inbound link datagrams: voice frames by their tag byte,
/// everything else to the transport. One datagram is one frame.
fn pump_link(
    ctx: &SessionCtx,
    link: Arc<dyn NatLink>,
    transport_tx: tokio::sync::mpsc::Sender<BytesMut>,
    voice_in: FrameSender,
) {
    spawn_guarded(&ctx.shutdown, async move {
        let incoming = link.datagram_receiver();
        while let Ok(datagram) = incoming.recv_async().await {
            if datagram.first() == Some(&VOICE_TAG) {
                if !voice_in.is_closed() {
                    _ = voice_in.push(datagram);
                }
            } else if transport_tx.send(datagram).await.is_err() {
                return;
            }
        }
    });
}

/// Moves tagged voice frames from the relay onto the link.
fn forward_voice(ctx: &SessionCtx, link: Arc<dyn NatLink>, voice_out: FrameReceiver) {
    spawn_guarded(&ctx.shutdown, async move {
        let out = link.datagram_sender();
        while let Ok(Some(frame)) = voice_out.pop().await {
            if out.send_async(frame).await.is_err() {
                return;
            }
        }
    });
}

/// What the caller (the game networking layer) holds while a connection is
/// open: the frame streams and the close switch.
pub struct ConnectionHandle {
    peer: PeerId,
    transport: TransportKind,
    send: FrameSender,
    recv: FrameReceiver,
    closed: flume::Receiver<()>,
    shutdown: ShutdownManager<()>,
    close_timeout: Duration,
    state: Arc<AtomicCell<SessionState>>,
    voice_relay: Option<SocketAddr>,
}

impl ConnectionHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Where the local voice application should send its packets, when a
    /// voice channel was negotiated and the relay socket could bind.
    pub fn voice_relay_addr(&self) -> Option<SocketAddr> {
        self.voice_relay
    }

    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    /// Queues a frame for the peer. Never blocks: when the connection is
    /// backed up the oldest queued frame is dropped instead.
    pub fn send(&self, frame: BytesMut) -> Result<()> {
        self.send.push(frame).map_err(|_| {
            Error::TransportClosed(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "send stream closed",
            ))
        })
    }

    /// Next frame from the peer; `Ok(None)` is clean end-of-stream.
    pub async fn recv(&self) -> Result<Option<BytesMut>> {
        tokio::select! {
            biased;
            rs = self.recv.pop() => rs.map_err(Error::TransportClosed),
            _ = self.shutdown.wait_shutdown_triggered() => Err(Error::Cancelled),
        }
    }

    /// Graceful close: flushes pending frames through the transport's close
    /// handshake, forcing teardown if that takes longer than the close
    /// timeout.
    pub async fn close(&self) -> Result<()> {
        self.state.store(SessionState::Closing);
        self.send.close();
        if timeout(self.close_timeout, self.closed.recv_async())
            .await
            .is_err()
        {
            log::debug!("graceful close of {} timed out, forcing teardown", self.peer);
        }
        self.state.store(SessionState::Closed);
        _ = self.shutdown.trigger_shutdown(());
        Ok(())
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        _ = self.shutdown.trigger_shutdown(());
    }
}
