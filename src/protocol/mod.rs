use std::fmt;

use uuid::Uuid;

pub mod candidate;
pub mod capability;
pub mod credentials;

/// Identifies a peer (a player in the shared session). Assigned by the
/// signaling layer, opaque to this crate.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub struct PeerId(pub Uuid);

impl PeerId {
    pub fn random() -> Self {
        PeerId(Uuid::new_v4())
    }
}

impl From<Uuid> for PeerId {
    fn from(value: Uuid) -> Self {
        PeerId(value)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Leading byte of a voice frame on the punched datagram link.
///
/// The link is shared by several protocols, all of which are told apart by the
/// first byte of each datagram, so the value is load-bearing:
/// - STUN messages start with 0x00-0x03 (method/class bits) and TURN
///   ChannelData with 0x40-0x7F, so anything in those ranges is out.
/// - QUIC v1 requires the fixed bit 0x40 to be set in every packet; a first
///   byte with the high bit set but 0x40 clear (0x80-0xBF) can never be a
///   valid QUIC packet.
/// - The reliable stream's packets begin with the 4-byte conversation id,
///   which is fixed at zero here, so their first byte is 0x00; its connect
///   probe starts with 0x02.
/// 0xB3 sits in the 0x80-0xBF window and collides with none of the above.
pub const VOICE_TAG: u8 = 0xB3;

/// Payload announcing "peer is done sending" on the reliable stream. The
/// first 16 bytes of SHA-256 over `"icelink graceful close sentinel v1"`.
/// Stable across versions; changing it breaks close interop with old peers.
pub const CLOSE_SENTINEL: [u8; 16] = [
    0x4e, 0x5a, 0xfb, 0x9d, 0x75, 0xae, 0xe6, 0x98, 0x2c, 0xe7, 0xef, 0x42, 0x97, 0xe4, 0x1d, 0x27,
];

/// Conversation id of the reliable stream. Zero is the wire default shared
/// with old peers; the probe below carries it so both sides agree.
pub const STREAM_CONV: u32 = 0;

pub(crate) const PROBE_FLAG: u8 = 0x02;
pub(crate) const PROBE_LEN: usize = 8;

/// Connect probe for the reliable stream handshake: conversation id in the
/// first four bytes (little endian), first byte overwritten with the probe
/// flag. Short enough to never be mistaken for a stream packet, which is at
/// least 24 bytes.
pub(crate) fn connect_probe() -> [u8; PROBE_LEN] {
    let mut probe = [0u8; PROBE_LEN];
    probe[..4].copy_from_slice(&STREAM_CONV.to_le_bytes());
    probe[0] = PROBE_FLAG;
    probe
}

pub(crate) fn is_connect_probe(buf: &[u8]) -> bool {
    buf.len() == PROBE_LEN && buf[0] == PROBE_FLAG
}
