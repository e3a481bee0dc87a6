//! The out-of-band candidate exchange format.
//!
//! One candidate is ten colon-separated fields:
//!
//! ```text
//! component:protocol:ip:port:priority:username:password:type:generation:foundation
//! ```
//!
//! A CAS joins many candidates with single spaces. IPv6 addresses contribute
//! extra colons; the parser re-joins the middle fields so both families round
//! trip.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use str0m::Candidate;
use str0m::net::Protocol;

pub const COMPONENT_DEFAULT: u16 = 1;

/// Candidate type names as exchanged on the wire.
pub const KIND_HOST: &str = "local";
pub const KIND_SRFLX: &str = "stun";
pub const KIND_PRFLX: &str = "prflx";
pub const KIND_RELAY: &str = "relay";

const FIELDS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateEntry {
    pub component: u16,
    pub protocol: String,
    pub addr: SocketAddr,
    pub priority: u32,
    pub username: String,
    pub password: String,
    pub kind: String,
    pub generation: u32,
    pub foundation: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CandidateParseError {
    #[error("candidate has {0} fields, expected at least {FIELDS}")]
    TooFewFields(usize),
    #[error("invalid {field} field: `{value}`")]
    InvalidField { field: &'static str, value: String },
}

impl CandidateEntry {
    /// RFC 8445 §5.1.2 type preferences; the local preference is flat since
    /// we advertise one socket.
    pub fn priority_for(kind: &str) -> u32 {
        let type_pref: u32 = match kind {
            KIND_HOST => 126,
            KIND_PRFLX => 110,
            KIND_SRFLX => 100,
            _ => 0,
        };

        (type_pref << 24) | (65535 << 8) | (256 - u32::from(COMPONENT_DEFAULT))
    }

    /// The ICE-agent form of this candidate. Server-reflexive and relayed
    /// candidates use their own address as base; the agent only needs the
    /// pairing address for connectivity checks.
    pub fn to_agent_candidate(&self) -> Option<Candidate> {
        let result = match self.kind.as_str() {
            KIND_HOST => Candidate::host(self.addr, Protocol::Udp),
            KIND_RELAY => Candidate::relayed(self.addr, self.addr, Protocol::Udp),
            // Peer-reflexive entries pair like server-reflexive ones.
            KIND_SRFLX | KIND_PRFLX => {
                Candidate::server_reflexive(self.addr, self.addr, Protocol::Udp)
            }
            other => {
                tracing::warn!(kind = %other, "Discarding candidate of unknown type");
                return None;
            }
        };

        result
            .inspect_err(|e| tracing::warn!(addr = %self.addr, "Unusable candidate: {e}"))
            .ok()
    }

    /// A stable foundation for a locally gathered candidate.
    pub fn foundation_for(kind: &str, addr: SocketAddr) -> String {
        use std::hash::{Hash, Hasher};

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        kind.hash(&mut hasher);
        addr.ip().hash(&mut hasher);

        format!("{:08x}", hasher.finish() as u32)
    }
}

impl fmt::Display for CandidateEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}:{}:{}:{}:{}:{}",
            self.component,
            self.protocol,
            self.addr.ip(),
            self.addr.port(),
            self.priority,
            self.username,
            self.password,
            self.kind,
            self.generation,
            self.foundation,
        )
    }
}

impl FromStr for CandidateEntry {
    type Err = CandidateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() < FIELDS {
            return Err(CandidateParseError::TooFewFields(fields.len()));
        }

        // Head: component, protocol. Tail: priority .. foundation (6 fields).
        // Whatever sits between is ip:port; IPv6 text re-joins on ':'.
        let tail = fields.len() - 6;
        let port_field = tail - 1;
        let ip = fields[2..port_field].join(":");

        let parse_num = |field: &'static str, value: &str| -> Result<u32, CandidateParseError> {
            value.parse().map_err(|_| CandidateParseError::InvalidField {
                field,
                value: value.to_owned(),
            })
        };

        let invalid = |field: &'static str, value: &str| CandidateParseError::InvalidField {
            field,
            value: value.to_owned(),
        };

        let port: u16 = fields[port_field]
            .parse()
            .map_err(|_| invalid("port", fields[port_field]))?;
        let ip = ip.parse().map_err(|_| invalid("ip", &ip))?;

        Ok(Self {
            component: parse_num("component", fields[0])? as u16,
            protocol: fields[1].to_owned(),
            addr: SocketAddr::new(ip, port),
            priority: parse_num("priority", fields[tail])?,
            username: fields[tail + 1].to_owned(),
            password: fields[tail + 2].to_owned(),
            kind: fields[tail + 3].to_owned(),
            generation: parse_num("generation", fields[tail + 4])?,
            foundation: fields[tail + 5].to_owned(),
        })
    }
}

/// Parses a whitespace-joined CAS, discarding malformed entries.
pub fn parse_cas(cas: &str) -> Vec<CandidateEntry> {
    cas.split_whitespace()
        .filter_map(|entry| {
            entry
                .parse::<CandidateEntry>()
                .inspect_err(|e| tracing::warn!(%entry, "Discarding malformed candidate: {e}"))
                .ok()
        })
        .collect()
}

/// Space-joins candidates into the CAS wire form.
pub fn format_cas(candidates: &[CandidateEntry]) -> String {
    candidates
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CandidateEntry {
        CandidateEntry {
            component: 1,
            protocol: "udp".to_owned(),
            addr: "192.0.2.7:51000".parse().unwrap(),
            priority: CandidateEntry::priority_for(KIND_HOST),
            username: "ufrag01".to_owned(),
            password: "pass0123456789abcdef".to_owned(),
            kind: KIND_HOST.to_owned(),
            generation: 0,
            foundation: "deadbeef".to_owned(),
        }
    }

    #[test]
    fn round_trips_through_the_wire_form() {
        let entry = sample();

        let parsed: CandidateEntry = entry.to_string().parse().unwrap();

        assert_eq!(parsed, entry);
    }

    #[test]
    fn round_trips_ipv6() {
        let mut entry = sample();
        entry.addr = "[2001:db8::7]:51000".parse().unwrap();
        // Display prints the bare IPv6 address, no brackets.
        let wire = entry.to_string();
        assert!(wire.contains("2001:db8::7:51000"));

        let parsed: CandidateEntry = wire.parse().unwrap();

        assert_eq!(parsed.addr, entry.addr);
    }

    #[test]
    fn rejects_fewer_than_ten_fields() {
        let wire = "1:udp:192.0.2.7:51000:2130706175:u:p:local:0"; // 9 fields

        assert!(wire.parse::<CandidateEntry>().is_err());
    }

    #[test]
    fn cas_parsing_skips_malformed_entries() {
        let good = sample().to_string();
        let cas = format!("{good} garbage:entry {good}");

        let parsed = parse_cas(&cas);

        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn cas_formats_space_joined() {
        let entries = vec![sample(), sample()];

        let cas = format_cas(&entries);

        assert_eq!(parse_cas(&cas).len(), 2);
        assert_eq!(cas.matches(' ').count(), 1);
    }

    #[test]
    fn agent_candidate_conversion() {
        assert!(sample().to_agent_candidate().is_some());

        let mut relay = sample();
        relay.kind = KIND_RELAY.to_owned();
        assert!(relay.to_agent_candidate().is_some());

        let mut unknown = sample();
        unknown.kind = "carrier-pigeon".to_owned();
        assert!(unknown.to_agent_candidate().is_none());
    }
}
