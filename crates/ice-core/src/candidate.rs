use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

use crate::LocalCandidateId;

/// `{ ip, port }`, equal iff both components are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TransportAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl TransportAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        TransportAddress { ip, port }
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(_) => write!(f, "{}:{}", self.ip, self.port),
            IpAddr::V6(_) => write!(f, "[{}]:{}", self.ip, self.port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relayed,
}

impl CandidateType {
    pub(crate) fn type_preference(self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relayed => 0,
        }
    }

    /// The token used on the wire (`candidate:... typ host`, etc).
    pub fn as_wire_str(self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relayed => "relay",
        }
    }
}

/// Fixed per §3: the core does not gather multiple candidates of the same type
/// to rank against each other, so the local preference component is constant.
pub(crate) const LOCAL_PREFERENCE: u32 = 65535;

pub(crate) fn candidate_priority(typ: CandidateType, component_id: u16) -> u32 {
    (typ.type_preference() << 24) | (LOCAL_PREFERENCE << 8) | (256 - component_id as u32)
}

/// One potential endpoint an ICE agent might use for a component.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub typ: CandidateType,
    pub taddr: TransportAddress,
    pub component_id: u16,
    pub priority: u32,
    pub foundation: String,
    /// Host and Relayed candidates are self-based (`None`); ServerReflexive
    /// candidates point at the Host candidate they were gathered through;
    /// PeerReflexive candidates point at whichever local candidate was used
    /// for the check that revealed them.
    pub base: Option<LocalCandidateId>,
    pub is_default: bool,
}

impl Candidate {
    /// Build a local candidate; its priority is always derived from §3's formula.
    pub(crate) fn new_local(
        typ: CandidateType,
        taddr: TransportAddress,
        component_id: u16,
        foundation: String,
        base: Option<LocalCandidateId>,
    ) -> Self {
        Candidate {
            typ,
            taddr,
            component_id,
            priority: candidate_priority(typ, component_id),
            foundation,
            base,
            is_default: false,
        }
    }

    /// Build a remote candidate, whose priority arrives verbatim from the peer's offer/answer.
    pub(crate) fn new_remote(
        typ: CandidateType,
        taddr: TransportAddress,
        component_id: u16,
        priority: u32,
        foundation: String,
    ) -> Self {
        Candidate {
            typ,
            taddr,
            component_id,
            priority,
            foundation,
            base: None,
            is_default: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_beats_prflx_beats_srflx_beats_relay() {
        let host = candidate_priority(CandidateType::Host, 1);
        let prflx = candidate_priority(CandidateType::PeerReflexive, 1);
        let srflx = candidate_priority(CandidateType::ServerReflexive, 1);
        let relay = candidate_priority(CandidateType::Relayed, 1);
        assert!(host > prflx && prflx > srflx && srflx > relay);
    }

    #[test]
    fn rtcp_component_lowers_priority_relative_to_rtp() {
        let rtp = candidate_priority(CandidateType::Host, 1);
        let rtcp = candidate_priority(CandidateType::Host, 2);
        assert!(rtp > rtcp);
        assert_eq!(rtp - rtcp, 1);
    }

    #[test]
    fn priority_matches_rfc5245_formula() {
        let p = candidate_priority(CandidateType::Host, 1);
        let expected = (126u32 << 24) | (LOCAL_PREFERENCE << 8) | (256 - 1);
        assert_eq!(p, expected);
    }
}
