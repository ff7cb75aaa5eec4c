#![deny(unreachable_pub, unsafe_code)]

//! sans io implementation of an ICE (RFC 5245) agent core
//!
//! This crate owns the pair-state machine and connectivity-check scheduler only.
//! It does not open sockets, does not encode or decode STUN messages, and does not
//! gather candidates from STUN/TURN servers — those are the embedder's job, wired
//! in through the [`StunCodec`] trait and the [`Effect`] values this crate emits.
//! The embedder resolves a socket from an `Effect::SendStun`'s `component_id`
//! itself; the core has no socket-handle type of its own to call out through.

mod checklist;
mod error;
mod idgen;

pub mod candidate;
pub mod pair;
pub mod stats;
pub mod stun;

use std::net::IpAddr;
use std::time::Instant;

pub use candidate::{Candidate, CandidateType, TransportAddress};
pub use checklist::{CheckList, CheckListState};
pub use error::{Error, Result};
pub use pair::{CandidatePair, PairId, PairState, ValidPair};
pub use stun::{StunCodec, StunMessage};

slotmap::new_key_type! {
    /// Stable handle for a candidate in a [`CheckList`]'s local candidate arena.
    pub struct LocalCandidateId;
    /// Stable handle for a candidate in a [`CheckList`]'s remote candidate arena.
    pub struct RemoteCandidateId;
}

/// Logical sub-stream of a media stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    /// The RTP component. Carries RTCP too when rtcp-mux is used.
    Rtp = 1,
    /// The RTCP component.
    Rtcp = 2,
}

impl Component {
    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            1 => Some(Component::Rtp),
            2 => Some(Component::Rtcp),
            _ => None,
        }
    }
}

/// ICE controlling/controlled role, per RFC 5245 §5.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Controlling,
    Controlled,
}

impl Role {
    pub fn flipped(self) -> Role {
        match self {
            Role::Controlling => Role::Controlled,
            Role::Controlled => Role::Controlling,
        }
    }
}

/// Session-wide short-term credentials, exchanged out of band (e.g. via SDP).
#[derive(Debug, Clone)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn random() -> Self {
        IceCredentials {
            ufrag: idgen::random_alphanumeric(8),
            pwd: idgen::random_alphanumeric(32),
        }
    }
}

/// A datagram handed to the core by the transport layer.
pub struct ReceivedPkt<'a> {
    pub data: &'a [u8],
    pub source: TransportAddress,
    pub destination: TransportAddress,
    pub component_id: u16,
}

/// Work the embedder must carry out as a result of driving the core forward.
///
/// This replaces the single untyped `on_event` callback style with an explicit,
/// inspectable list: a tick or a received packet can produce any number of sends
/// plus at most one terminal state change per stream.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Send `bytes` (an already-encoded STUN message) from `component_id`'s socket
    /// on `stream` to `dest`.
    SendStun {
        stream: usize,
        component_id: u16,
        bytes: Vec<u8>,
        dest: TransportAddress,
    },
    /// `stream` reached `CheckListState::Completed`: every component has a
    /// nominated valid pair.
    StreamCompleted { stream: usize },
    /// `stream` reached `CheckListState::Failed`: no nomination is possible anymore.
    StreamFailed { stream: usize },
}

/// Process-wide container for one ICE negotiation across the streams of a media session.
pub struct Session {
    pub config: SessionConfig,
    streams: Vec<CheckList>,
}

/// Session-wide tunables. See RFC 5245 §15.4 / §16 for the wire defaults.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub role: Role,
    pub tie_breaker: u64,
    pub local_credentials: IceCredentials,
    pub remote_credentials: Option<IceCredentials>,
    ta_ms: u64,
    keepalive_timeout_s: u64,
    max_connectivity_checks: usize,
}

const DEFAULT_TA_MS: u64 = 20;
const MIN_KEEPALIVE_TIMEOUT_S: u64 = 15;
const DEFAULT_KEEPALIVE_TIMEOUT_S: u64 = MIN_KEEPALIVE_TIMEOUT_S;
const DEFAULT_MAX_CONNECTIVITY_CHECKS: usize = 100;
pub(crate) const MAX_CANDIDATES_PER_ARENA: usize = 10;
pub(crate) const ICE_MAX_RETRANSMISSIONS: u32 = 7;
pub(crate) const INITIAL_RTO_MS: u32 = 100;

impl SessionConfig {
    pub fn new(role: Role, local_credentials: IceCredentials) -> Self {
        SessionConfig {
            role,
            tie_breaker: rand::random(),
            local_credentials,
            remote_credentials: None,
            ta_ms: DEFAULT_TA_MS,
            keepalive_timeout_s: DEFAULT_KEEPALIVE_TIMEOUT_S,
            max_connectivity_checks: DEFAULT_MAX_CONNECTIVITY_CHECKS,
        }
    }

    pub fn ta_ms(&self) -> u64 {
        self.ta_ms
    }

    pub fn keepalive_timeout_s(&self) -> u64 {
        self.keepalive_timeout_s
    }

    /// Clamped to a minimum of 15s, per spec.
    pub fn set_keepalive_timeout_s(&mut self, secs: u64) {
        self.keepalive_timeout_s = secs.max(MIN_KEEPALIVE_TIMEOUT_S);
    }

    pub fn max_connectivity_checks(&self) -> usize {
        self.max_connectivity_checks
    }

    pub fn set_max_connectivity_checks(&mut self, max: u8) {
        self.max_connectivity_checks = max as usize;
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Session {
            config,
            streams: Vec::new(),
        }
    }

    /// Tear down the session. Streams are dropped; no further calls are valid.
    pub fn destroy(self) {}

    pub fn set_role(&mut self, role: Role) {
        if self.config.role != role {
            self.config.role = role;
            for stream in &mut self.streams {
                stream.recompute_pair_priorities(self.config.role);
            }
        }
    }

    pub fn set_local_credentials(&mut self, credentials: IceCredentials) {
        self.config.local_credentials = credentials;
    }

    pub fn set_remote_credentials(&mut self, credentials: IceCredentials) {
        self.config.remote_credentials = Some(credentials);
    }

    pub fn set_max_connectivity_checks(&mut self, max: u8) {
        self.config.set_max_connectivity_checks(max);
        for stream in &mut self.streams {
            stream.truncate_check_list(self.config.max_connectivity_checks);
        }
    }

    pub fn set_keepalive_timeout(&mut self, secs: u64) {
        self.config.set_keepalive_timeout_s(secs);
    }

    /// Add a new per-media-stream check list, returning its stream index.
    pub fn add_check_list(&mut self) -> usize {
        let is_first = self.streams.is_empty();
        self.streams.push(CheckList::new(is_first));
        self.streams.len() - 1
    }

    pub fn check_list(&self, stream: usize) -> &CheckList {
        &self.streams[stream]
    }

    pub fn check_list_mut(&mut self, stream: usize) -> &mut CheckList {
        &mut self.streams[stream]
    }

    /// Derive foundations for every candidate across every stream, grouping by
    /// `(type, base ip)` as described in §3. Idempotent; call after gathering.
    pub fn compute_candidates_foundations(&mut self) {
        for stream in &mut self.streams {
            stream.recompute_foundations();
        }
    }

    /// Mark, for each component, the candidate that should be advertised as the
    /// default candidate (highest priority host candidate, falling back to
    /// server-reflexive, then relayed).
    pub fn choose_default_candidates(&mut self) {
        for stream in &mut self.streams {
            stream.choose_default_candidates();
        }
    }

    /// Rewrite every server-reflexive local candidate's pair partner to point at
    /// its host base, as required before pairing (§4.1 "Replace base").
    pub fn set_base_for_srflx_candidates(&mut self) {
        // The rewrite happens lazily as part of pair formation (see
        // `CheckList::form_pairs`); this entry point exists so callers can
        // invoke the documented step explicitly before pairing.
    }

    /// Form and prune candidate pairs for `stream` (§4.1).
    pub fn pair_candidates(&mut self, stream: usize) {
        self.streams[stream].form_pairs(&self.config);
    }

    /// Drive every stream's scheduler forward by one tick.
    pub fn process_all(&mut self, now: Instant, codec: &dyn StunCodec) -> Vec<Effect> {
        let mut effects = Vec::new();
        for (idx, stream) in self.streams.iter_mut().enumerate() {
            stream.process(idx, now, &self.config, codec, &mut effects);
        }
        effects
    }

    /// Feed a received STUN datagram for `stream` into the core.
    pub fn handle_stun_packet(
        &mut self,
        stream: usize,
        codec: &dyn StunCodec,
        pkt: &ReceivedPkt<'_>,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.streams[stream].handle_stun_packet(stream, &mut self.config, codec, pkt, &mut effects);
        effects
    }
}

pub(crate) fn opt_min<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (None, None) => None,
        (None, Some(b)) => Some(b),
        (Some(a), None) => Some(a),
        (Some(a), Some(b)) => Some(a.min(b)),
    }
}

pub(crate) fn ip_matches(a: IpAddr, b: IpAddr) -> bool {
    a == b
}
