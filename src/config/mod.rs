use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

pub(crate) const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const POOL_GRACE: Duration = Duration::from_secs(60);

/// A segment size this large from the start matters: growing from a tiny
/// default makes retransmission backoff dominate the first seconds of a
/// connection before window growth converges.
pub(crate) const STREAM_MTU: usize = 1450;

pub struct Config {
    /// Bound on waiting for the connectivity engine's ready-for-data signal.
    pub connectivity_timeout: Duration,
    /// Bound on the reliable-stream connect handshake. The alternate
    /// transport times its own handshake out internally.
    pub handshake_timeout: Duration,
    /// How long a closing session waits for the transport to drain cleanly
    /// before forcing teardown.
    pub close_timeout: Duration,
    /// How long a candidate pool outlives its last registration, so bursts
    /// of near-simultaneous connections share one gathering pass.
    pub pool_grace: Duration,
    /// Capacity of the voice/data multiplexing queues. Overflow drops the
    /// oldest frame.
    pub frame_queue_capacity: usize,
    pub stream_mtu: usize,
    pub stream_window: u16,
    /// Resend cadence of the reliable-stream connect probe.
    pub probe_interval: Duration,
    /// Advertise (and use, if both sides agree) the alternate transport.
    pub alternate_transport: bool,
    /// Local port the voice application listens on. Advertised to the peer
    /// when accepting a connection; also the default forward target for
    /// inbound voice before the application has sent anything.
    pub voice_port: Option<u16>,
    /// Bind address of the local voice relay socket.
    pub voice_relay_bind: SocketAddr,
    /// Directory for per-connection transcript files. `None` keeps
    /// transcripts in memory only (they still reach the primary log on
    /// failure).
    pub transcript_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connectivity_timeout: CONNECTIVITY_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            close_timeout: CLOSE_TIMEOUT,
            pool_grace: POOL_GRACE,
            frame_queue_capacity: 1000,
            stream_mtu: STREAM_MTU,
            stream_window: 128,
            probe_interval: Duration::from_millis(500),
            alternate_transport: true,
            voice_port: None,
            voice_relay_bind: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)),
            transcript_dir: None,
        }
    }
}

impl Config {
    pub fn empty() -> Self {
        Self::default()
    }
    pub fn set_connectivity_timeout(mut self, timeout: Duration) -> Self {
        self.connectivity_timeout = timeout;
        self
    }
    pub fn set_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
    pub fn set_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
    pub fn set_pool_grace(mut self, grace: Duration) -> Self {
        self.pool_grace = grace;
        self
    }
    pub fn set_frame_queue_capacity(mut self, capacity: usize) -> Self {
        self.frame_queue_capacity = capacity;
        self
    }
    pub fn set_stream_mtu(mut self, mtu: usize) -> Self {
        self.stream_mtu = mtu;
        self
    }
    pub fn set_stream_window(mut self, window: u16) -> Self {
        self.stream_window = window;
        self
    }
    pub fn set_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }
    pub fn set_alternate_transport(mut self, enabled: bool) -> Self {
        self.alternate_transport = enabled;
        self
    }
    pub fn set_voice_port(mut self, port: Option<u16>) -> Self {
        self.voice_port = port;
        self
    }
    pub fn set_voice_relay_bind(mut self, bind: SocketAddr) -> Self {
        self.voice_relay_bind = bind;
        self
    }
    pub fn set_transcript_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.transcript_dir = dir;
        self
    }
}
