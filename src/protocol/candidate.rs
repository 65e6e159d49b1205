use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// How a candidate address was discovered.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    Relay,
}

impl CandidateKind {
    pub fn short_name(&self) -> &'static str {
        match self {
            CandidateKind::Host => "host",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::Relay => "relay",
        }
    }

    fn from_short(s: &str) -> Option<CandidateKind> {
        match s {
            "host" => Some(CandidateKind::Host),
            "srflx" => Some(CandidateKind::ServerReflexive),
            "relay" => Some(CandidateKind::Relay),
            _ => None,
        }
    }
}

/// A concrete address a peer might be reachable at.
///
/// The wire form is `<priority> 1 udp <priority> <ip> <port> typ <short>`,
/// deliberately a subset of a standard candidate line so any compliant parser
/// can consume it.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub address: SocketAddr,
    pub priority: u32,
}

impl Candidate {
    /// Parses a candidate line. Malformed lines yield `None` with a logged
    /// warning; they are dropped, never fatal.
    pub fn parse(line: &str) -> Option<Candidate> {
        let rs = Self::parse_fields(line);
        if rs.is_none() {
            log::warn!("dropping malformed candidate line {line:?}");
        }
        rs
    }

    fn parse_fields(line: &str) -> Option<Candidate> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 8 || fields[1] != "1" || fields[2] != "udp" || fields[6] != "typ" {
            return None;
        }
        let priority: u32 = fields[3].parse().ok()?;
        let ip: IpAddr = fields[4].parse().ok()?;
        let port: u16 = fields[5].parse().ok()?;
        let kind = CandidateKind::from_short(fields[7])?;
        Some(Candidate {
            kind,
            address: SocketAddr::new(ip, port),
            priority,
        })
    }

    pub fn to_line(&self) -> String {
        format!(
            "{priority} 1 udp {priority} {ip} {port} typ {kind}",
            priority = self.priority,
            ip = self.address.ip(),
            port = self.address.port(),
            kind = self.kind.short_name(),
        )
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: CandidateKind, addr: &str, priority: u32) -> Candidate {
        Candidate {
            kind,
            address: addr.parse().unwrap(),
            priority,
        }
    }

    #[test]
    fn round_trips_all_kinds() {
        let cases = [
            sample(CandidateKind::Host, "192.168.1.7:40132", 2_130_706_431),
            sample(CandidateKind::ServerReflexive, "203.0.113.9:61001", 1_694_498_815),
            sample(CandidateKind::Relay, "198.51.100.2:3478", 16_777_215),
            sample(CandidateKind::Host, "[fe80::1]:9", 1),
        ];
        for c in cases {
            assert_eq!(Candidate::parse(&c.to_line()), Some(c));
        }
    }

    #[test]
    fn wire_shape() {
        let c = sample(CandidateKind::ServerReflexive, "203.0.113.9:61001", 99);
        assert_eq!(c.to_line(), "99 1 udp 99 203.0.113.9 61001 typ srflx");
    }

    #[test]
    fn malformed_lines_drop_without_panicking() {
        let bad = [
            "",
            "garbage",
            "99 1 tcp 99 203.0.113.9 61001 typ srflx",
            "99 2 udp 99 203.0.113.9 61001 typ srflx",
            "99 1 udp 99 203.0.113.9 61001 typ teleport",
            "99 1 udp 99 203.0.113.9 99999 typ srflx",
            "99 1 udp notanumber 203.0.113.9 61001 typ srflx",
            "99 1 udp 99 not.an.ip 61001 typ srflx",
            "99 1 udp 99 203.0.113.9 61001 typ",
        ];
        for line in bad {
            assert_eq!(Candidate::parse(line), None, "accepted {line:?}");
        }
    }
}
