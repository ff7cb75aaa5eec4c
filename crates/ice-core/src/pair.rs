use std::cmp::{max, min};
use std::time::Instant;

use crate::{LocalCandidateId, RemoteCandidateId, Role, INITIAL_RTO_MS};

/// A stable index into a [`crate::CheckList`]'s `pairs` vector. Pairs are never
/// removed once created, so indices stay valid for the life of the check list —
/// the arena-of-stable-indices approach Design Notes calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairId(pub(crate) u32);

impl PairId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Frozen,
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

impl PairState {
    /// Debug wire token, per §6.
    pub fn as_wire_str(self) -> &'static str {
        match self {
            PairState::Frozen => "Frozen",
            PairState::Waiting => "Waiting",
            PairState::InProgress => "In-Progress",
            PairState::Succeeded => "Succeeded",
            PairState::Failed => "Failed",
        }
    }
}

/// A (local, remote) candidate tuple subject to connectivity checks.
#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub local: LocalCandidateId,
    pub remote: RemoteCandidateId,
    pub priority: u64,
    pub state: PairState,
    /// The role captured at the time the in-flight check was sent; used to
    /// undo a role flip on the pair that triggered a 487 (§4.7).
    pub role: Role,
    pub is_default: bool,
    pub is_nominated: bool,
    pub transaction_id: [u8; 12],
    pub rto_ms: u32,
    pub retransmissions: u32,
    pub transmission_time: Option<Instant>,
    pub wait_transaction_timeout: bool,
}

impl CandidatePair {
    pub(crate) fn new(
        local: LocalCandidateId,
        remote: RemoteCandidateId,
        priority: u64,
        role: Role,
    ) -> Self {
        CandidatePair {
            local,
            remote,
            priority,
            state: PairState::Frozen,
            role,
            is_default: false,
            is_nominated: false,
            transaction_id: [0; 12],
            rto_ms: INITIAL_RTO_MS,
            retransmissions: 0,
            transmission_time: None,
            wait_transaction_timeout: false,
        }
    }
}

/// `priority = (min(G,D) << 32) | (max(G,D) << 1) | (G > D ? 1 : 0)`, where G is
/// the controlling side's candidate priority and D the other side's.
pub(crate) fn pair_priority(local_priority: u32, remote_priority: u32, role: Role) -> u64 {
    let (g, d) = match role {
        Role::Controlling => (local_priority as u64, remote_priority as u64),
        Role::Controlled => (remote_priority as u64, local_priority as u64),
    };

    (min(g, d) << 32) | (max(g, d) << 1) | u64::from(g > d)
}

/// A successful check, paired with the pair that produced it (may differ from
/// `valid` when a peer-reflexive candidate was discovered along the way).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidPair {
    pub valid: PairId,
    pub generated_from: PairId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controlling_side_is_g() {
        // G > D: controlling candidate wins the low bit.
        let p = pair_priority(2_130_706_431, 1_694_498_815, Role::Controlling);
        let g = 2_130_706_431u64;
        let d = 1_694_498_815u64;
        assert_eq!(p, (d.min(g) << 32) | (g.max(d) << 1) | 1);
    }

    #[test]
    fn swapping_role_swaps_g_and_d_but_keeps_min_max_symmetric() {
        let local = 2_130_706_431;
        let remote = 1_694_498_815;

        let controlling = pair_priority(local, remote, Role::Controlling);
        let controlled = pair_priority(local, remote, Role::Controlled);

        // min/max component agrees either way; only the tie-break bit flips.
        assert_eq!(controlling >> 1, controlled >> 1);
        assert_ne!(controlling & 1, controlled & 1);
    }

    #[test]
    fn equal_priorities_clear_the_tiebreak_bit() {
        let p = pair_priority(1000, 1000, Role::Controlling);
        assert_eq!(p & 1, 0);
    }
}
