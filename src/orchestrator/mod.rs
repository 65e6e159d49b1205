use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_shutdown::ShutdownManager;
use crossbeam_utils::atomic::AtomicCell;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::config::Config;
use crate::diag::{self, ConnLog};
use crate::engine::{
    DiscoveryFactory, FirewallDecision, PlatformHooks, TelemetryEvent, TelemetrySink,
};
use crate::error::{Error, Result};
use crate::extend::chain_shutdown;
use crate::pool::PoolManager;
use crate::protocol::candidate::Candidate;
use crate::protocol::credentials::Credentials;
use crate::protocol::PeerId;
use crate::session::{self, ConnectionHandle, Role, SessionCtx, SessionState};
use crate::signal::SignalingSender;
use crate::tunnel::alternate::AlternateEngine;

/// Top-level owner of the subsystem: routes inbound signaling to sessions,
/// exposes `connect`/`accept`, and manages the shared candidate pool.
///
/// The peer-to-session table is mutated only through the orchestrator's own
/// entry points; signal handlers read it and hand work to the owning session
/// over channels.
pub struct SessionOrchestrator {
    config: Arc<Config>,
    signaling: Arc<dyn SignalingSender>,
    pools: Arc<PoolManager>,
    alternate: Option<Arc<dyn AlternateEngine>>,
    hooks: Arc<dyn PlatformHooks>,
    telemetry: Arc<dyn TelemetrySink>,
    sessions: Arc<Mutex<HashMap<PeerId, SessionEntry>>>,
    invited: DashMap<PeerId, ()>,
    incoming_tx: flume::Sender<ConnectionHandle>,
    incoming_rx: flume::Receiver<ConnectionHandle>,
    next_seq: AtomicU64,
    shutdown: ShutdownManager<()>,
}

struct SessionEntry {
    id: u64,
    role: Role,
    shutdown: ShutdownManager<()>,
    remote_tx: tokio::sync::mpsc::Sender<Credentials>,
    resolved: Arc<AtomicBool>,
    intake: flume::Sender<Option<Candidate>>,
}

enum Deliver {
    Caller(oneshot::Sender<Result<ConnectionHandle>>),
    Incoming,
}

impl SessionOrchestrator {
    /// Builds the orchestrator and kicks off the purge of transcript files
    /// left over from a previous run. Must be called inside a tokio runtime.
    pub fn new(
        config: Config,
        signaling: Arc<dyn SignalingSender>,
        discovery: Arc<dyn DiscoveryFactory>,
        alternate: Option<Arc<dyn AlternateEngine>>,
        hooks: Arc<dyn PlatformHooks>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        if let Some(dir) = config.transcript_dir.clone() {
            tokio::spawn(async move {
                match diag::purge_stale(&dir).await {
                    Ok(0) => {}
                    Ok(n) => log::debug!("purged {n} stale connection transcripts"),
                    Err(e) => log::warn!("transcript purge failed: {e:?}"),
                }
            });
        }
        let pools = Arc::new(PoolManager::new(discovery, config.pool_grace));
        let (incoming_tx, incoming_rx) = flume::bounded(64);
        Self {
            config: Arc::new(config),
            signaling,
            pools,
            alternate,
            hooks,
            telemetry,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            invited: DashMap::new(),
            incoming_tx,
            incoming_rx,
            next_seq: AtomicU64::new(0),
            shutdown: ShutdownManager::new(),
        }
    }

    /// Allows `peer` to open a connection to us through the signaling
    /// channel.
    pub fn invite(&self, peer: PeerId) {
        self.invited.insert(peer, ());
    }

    pub fn revoke_invite(&self, peer: PeerId) {
        self.invited.remove(&peer);
    }

    /// The next connection established by an invited peer.
    pub async fn next_incoming(&self) -> Result<ConnectionHandle> {
        self.incoming_rx
            .recv_async()
            .await
            .map_err(|_| Error::Cancelled)
    }

    /// Establishes an outgoing connection. Any previous session for the
    /// peer is cancelled first; while the local firewall blocks inbound
    /// connectivity the user is asked to retry or give up.
    pub async fn connect(&self, peer: PeerId) -> Result<ConnectionHandle> {
        self.cancel_session(peer).await;
        while self.hooks.firewall_blocking() {
            log::info!("firewall blocks inbound connectivity, prompting user");
            match self.hooks.firewall_prompt().await {
                FirewallDecision::Retry => continue,
                FirewallDecision::Cancelled => return Err(Error::FirewallBlocking),
            }
        }
        let (tx, rx) = oneshot::channel();
        self.spawn_session(peer, Role::Initiator, None, Deliver::Caller(tx))
            .await?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Accepts a connection from `peer` whose credentials arrived out of
    /// band. Any previous session for the peer is cancelled first.
    pub async fn accept(
        &self,
        peer: PeerId,
        remote_username_fragment: String,
        remote_password: String,
    ) -> Result<ConnectionHandle> {
        let remote = Credentials::from_signal(remote_username_fragment, &remote_password)?;
        self.cancel_session(peer).await;
        let (tx, rx) = oneshot::channel();
        self.spawn_session(peer, Role::Responder, Some(remote), Deliver::Caller(tx))
            .await?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Inbound credential signal. Resolves a pending outgoing session,
    /// starts a responder session for invited peers, and drops everything
    /// else. Never fails.
    pub async fn handle_session_signal(
        &self,
        peer: PeerId,
        username_fragment: String,
        password: String,
    ) {
        if let Err(e) = self
            .try_session_signal(peer, username_fragment, password)
            .await
        {
            log::warn!("dropping session signal from {peer}: {e}");
        }
    }

    async fn try_session_signal(
        &self,
        peer: PeerId,
        username_fragment: String,
        password: String,
    ) -> Result<()> {
        let remote = Credentials::from_signal(username_fragment, &password)?;
        let pending = {
            let sessions = self.sessions.lock();
            sessions.get(&peer).and_then(|entry| {
                (entry.role == Role::Initiator && !entry.resolved.load(Ordering::Acquire))
                    .then(|| (entry.remote_tx.clone(), entry.resolved.clone()))
            })
        };
        if let Some((remote_tx, resolved)) = pending {
            resolved.store(true, Ordering::Release);
            // A send failure means the session died between lookup and send;
            // the peer's next signal starts over.
            _ = remote_tx.send(remote).await;
            return Ok(());
        }
        if self.invited.contains_key(&peer) {
            self.cancel_session(peer).await;
            self.spawn_session(peer, Role::Responder, Some(remote), Deliver::Incoming)
                .await?;
            return Ok(());
        }
        log::warn!("ignoring session signal from uninvited peer {peer}");
        Ok(())
    }

    /// Inbound candidate signal, forwarded to the owning session in arrival
    /// order. `None` closes that peer's candidate intake. Never fails.
    pub async fn handle_candidate_signal(&self, peer: PeerId, candidate: Option<String>) {
        let intake = self
            .sessions
            .lock()
            .get(&peer)
            .map(|entry| entry.intake.clone());
        let Some(intake) = intake else {
            log::debug!("no session for candidate signal from {peer}");
            return;
        };
        let message = match candidate {
            None => None,
            Some(line) => match Candidate::parse(&line) {
                Some(candidate) => Some(candidate),
                // Malformed: already logged by the parser, drop it here.
                None => return,
            },
        };
        _ = intake.send_async(message).await;
    }

    async fn cancel_session(&self, peer: PeerId) {
        let shutdown = self
            .sessions
            .lock()
            .get(&peer)
            .map(|entry| entry.shutdown.clone());
        if let Some(shutdown) = shutdown {
            _ = shutdown.trigger_shutdown(());
            // New-session logic must observe the old teardown complete.
            shutdown.wait_shutdown_complete().await;
        }
    }

    async fn spawn_session(
        &self,
        peer: PeerId,
        role: Role,
        remote: Option<Credentials>,
        deliver: Deliver,
    ) -> Result<()> {
        let pool = self.pools.acquire().await?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        // Only the accepting side advertises a voice port.
        let voice = match role {
            Role::Responder => self.config.voice_port,
            Role::Initiator => None,
        };
        let local = Credentials::generate(self.config.alternate_transport, voice);
        let log = Arc::new(ConnLog::new(
            self.config.transcript_dir.as_deref(),
            peer,
            seq,
        ));
        log.record(format!(
            "session {seq}: role {role:?}, local ufrag {}",
            local.ufrag
        ));
        let shutdown = ShutdownManager::new();
        chain_shutdown(&self.shutdown, &shutdown);
        let (remote_tx, remote_rx) = tokio::sync::mpsc::channel(1);
        let (intake_tx, intake_rx) = flume::bounded(256);
        self.sessions.lock().insert(
            peer,
            SessionEntry {
                id: seq,
                role,
                shutdown: shutdown.clone(),
                remote_tx,
                resolved: Arc::new(AtomicBool::new(remote.is_some())),
                intake: intake_tx,
            },
        );
        let ctx = SessionCtx {
            peer,
            role,
            local,
            remote,
            remote_rx,
            intake: intake_rx,
            pool,
            config: self.config.clone(),
            signaling: self.signaling.clone(),
            alternate: self.alternate.clone(),
            telemetry: self.telemetry.clone(),
            shutdown,
            state: Arc::new(AtomicCell::new(SessionState::Created)),
            log,
        };
        self.spawn_driver(peer, seq, ctx, deliver);
        Ok(())
    }

    fn spawn_driver(&self, peer: PeerId, seq: u64, ctx: SessionCtx, deliver: Deliver) {
        let sessions = self.sessions.clone();
        let hooks = self.hooks.clone();
        let telemetry = self.telemetry.clone();
        let incoming = self.incoming_tx.clone();
        let shutdown = ctx.shutdown.clone();
        let state = ctx.state.clone();
        let log = ctx.log.clone();
        tokio::spawn(async move {
            let token = shutdown.delay_shutdown_token().ok();
            let rs = match shutdown.wrap_cancel(session::run(ctx)).await {
                Ok(rs) => rs,
                Err(_) => Err(Error::Cancelled),
            };
            match rs {
                Ok(handle) => {
                    let transport = handle.transport();
                    telemetry.emit(TelemetryEvent::Established { peer, transport });
                    let unclaimed = match deliver {
                        Deliver::Caller(tx) => tx.send(Ok(handle)).err().and_then(|rs| rs.ok()),
                        Deliver::Incoming => {
                            incoming.send_async(handle).await.err().map(|e| e.into_inner())
                        }
                    };
                    // Nobody left to claim the handle: its drop tears the
                    // session back down.
                    drop(unclaimed);
                    shutdown.wait_shutdown_triggered().await;
                    state.store(SessionState::Closed);
                    log.record("session closed".into());
                    log.flush().await;
                }
                Err(e) => {
                    state.store(SessionState::Closed);
                    log.record(format!("session failed: {e}"));
                    log.dump_to_primary();
                    log.flush().await;
                    hooks.toast(&format!("Connection to {peer} failed: {e}"));
                    telemetry.emit(TelemetryEvent::Failed {
                        peer,
                        reason: e.to_string(),
                    });
                    _ = shutdown.trigger_shutdown(());
                    if let Deliver::Caller(tx) = deliver {
                        _ = tx.send(Err(e));
                    }
                }
            }
            drop(token);
            let mut sessions = sessions.lock();
            if sessions.get(&peer).map(|entry| entry.id) == Some(seq) {
                sessions.remove(&peer);
            }
        });
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        _ = self.shutdown.trigger_shutdown(());
    }
}
