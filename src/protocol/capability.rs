use super::credentials::Credentials;

/// Capabilities both sides agree on for one session, derived from the flags
/// segment of the two username fragments. Never stored; recomputed wherever
/// needed so credentials stay the single source of truth.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct Capabilities {
    /// True only when both fragments advertise alternate-transport support.
    pub prefers_alternate_transport: bool,
    /// Voice relay port. Advertised only by the accepting side; the remote
    /// fragment wins, the local one covers the side that advertised it.
    pub voice_port: Option<u16>,
}

/// Pure comparison of the two credential sets; no I/O.
pub fn negotiate(local: &Credentials, remote: &Credentials) -> Capabilities {
    let local_flags = flags_of(&local.ufrag);
    let remote_flags = flags_of(&remote.ufrag);
    Capabilities {
        prefers_alternate_transport: has_flag(local_flags, 'q') && has_flag(remote_flags, 'q'),
        voice_port: voice_port_of(remote_flags).or_else(|| voice_port_of(local_flags)),
    }
}

/// The flags segment of a fragment, or `None` for fragments produced by old
/// peers (fewer than three dash-separated segments means no capabilities).
fn flags_of(ufrag: &str) -> Option<&str> {
    let mut segments = ufrag.split('-');
    let _prefix = segments.next()?;
    let flags = segments.next()?;
    segments.next()?;
    Some(flags)
}

fn has_flag(flags: Option<&str>, flag: char) -> bool {
    flags.is_some_and(|f| f.contains(flag))
}

fn voice_port_of(flags: Option<&str>) -> Option<u16> {
    let flags = flags?;
    let at = flags.find('v')?;
    let digits: String = flags[at + 1..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        log::error!("voice flag without port digits in {flags:?}");
        return None;
    }
    match digits.parse::<u16>() {
        Ok(port) => Some(port),
        Err(e) => {
            log::error!("unparsable voice port {digits:?}: {e}");
            None
        }
    }
}
