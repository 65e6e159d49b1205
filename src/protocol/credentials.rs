use std::fmt;
use std::fmt::Write;

use rand::RngCore;

use crate::error::Error;

/// Prefix every username fragment carries. Old peers key on it, so it is
/// part of the wire contract.
pub const UFRAG_PREFIX: &str = "essential";

/// Negotiation credentials generated once per session with a CSPRNG and
/// immutable afterwards.
///
/// The username fragment doubles as a capability side channel:
/// `essential-<flags>-<random8hex>`, where `<flags>` is an alphanumeric
/// capability string. Peers that predate capabilities emit fragments without
/// the flags segment and are still accepted.
#[derive(Clone, Eq, PartialEq)]
pub struct Credentials {
    pub ufrag: String,
    pub password: [u8; 16],
}

impl Credentials {
    /// Generates fresh credentials advertising the given capability flags.
    /// `voice_port` must only be supplied on the accepting side; the
    /// initiating side never advertises one.
    pub fn generate(alternate_transport: bool, voice_port: Option<u16>) -> Credentials {
        let mut rng = rand::thread_rng();
        let mut password = [0u8; 16];
        rng.fill_bytes(&mut password);
        let mut suffix = [0u8; 4];
        rng.fill_bytes(&mut suffix);

        let mut flags = String::new();
        if alternate_transport {
            flags.push('q');
        }
        if let Some(port) = voice_port {
            _ = write!(flags, "v{port}");
        }
        let ufrag = format!("{UFRAG_PREFIX}-{flags}-{}", hex_encode(&suffix));
        Credentials { ufrag, password }
    }

    /// Rebuilds credentials from the fields of an inbound session signal.
    pub fn from_signal(ufrag: String, password: &str) -> crate::error::Result<Credentials> {
        let password = decode_password(password)?;
        Ok(Credentials { ufrag, password })
    }

    /// The password as transmitted in signaling messages.
    pub fn password_hex(&self) -> String {
        hex_encode(&self.password)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the password.
        f.debug_struct("Credentials")
            .field("ufrag", &self.ufrag)
            .finish_non_exhaustive()
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        _ = write!(out, "{b:02x}");
    }
    out
}

fn decode_password(s: &str) -> crate::error::Result<[u8; 16]> {
    if s.len() != 32 || !s.is_ascii() {
        return Err(Error::MalformedSignal(format!(
            "password must be 32 hex chars, got {} bytes",
            s.len()
        )));
    }
    let mut out = [0u8; 16];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let chunk = std::str::from_utf8(chunk)
            .map_err(|_| Error::MalformedSignal("non-utf8 password".into()))?;
        out[i] = u8::from_str_radix(chunk, 16)
            .map_err(|_| Error::MalformedSignal(format!("bad hex in password: {chunk:?}")))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_shape() {
        let creds = Credentials::generate(true, Some(24454));
        let segments: Vec<&str> = creds.ufrag.split('-').collect();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], UFRAG_PREFIX);
        assert_eq!(segments[1], "qv24454");
        assert_eq!(segments[2].len(), 8);
        assert!(segments[2].bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn empty_flags_keep_segment_count() {
        let creds = Credentials::generate(false, None);
        assert_eq!(creds.ufrag.split('-').count(), 3);
    }

    #[test]
    fn password_round_trips_through_signal() {
        let creds = Credentials::generate(false, None);
        let rebuilt = Credentials::from_signal(creds.ufrag.clone(), &creds.password_hex()).unwrap();
        assert_eq!(rebuilt, creds);
    }

    #[test]
    fn bad_password_rejected() {
        assert!(Credentials::from_signal("essential--aabbccdd".into(), "too short").is_err());
        assert!(Credentials::from_signal(
            "essential--aabbccdd".into(),
            "zz000000000000000000000000000000"
        )
        .is_err());
    }

    #[test]
    fn credentials_are_unique() {
        let a = Credentials::generate(false, None);
        let b = Credentials::generate(false, None);
        assert_ne!(a.ufrag, b.ufrag);
        assert_ne!(a.password, b.password);
    }
}
