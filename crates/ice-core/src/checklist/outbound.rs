//! §4.3: build and (re)send the binding request for a pair.

use std::time::Instant;

use crate::idgen;
use crate::pair::{PairId, PairState};
use crate::stun::{StunCodec, StunMessage};
use crate::{Role, SessionConfig, ICE_MAX_RETRANSMISSIONS, INITIAL_RTO_MS};

use super::CheckList;

impl CheckList {
    /// Send (or retransmit) the binding request for `pair_id`. Returns the bytes
    /// to send, or `None` if this call only performed a state transition: the
    /// "wait for transaction timeout" rule from a triggered check on an
    /// in-flight pair, or retransmission exhaustion.
    pub(crate) fn issue_check(
        &mut self,
        pair_id: PairId,
        cfg: &SessionConfig,
        now: Instant,
        codec: &dyn StunCodec,
    ) -> Option<Vec<u8>> {
        let idx = pair_id.index();

        if self.pairs[idx].state == PairState::InProgress {
            if self.pairs[idx].wait_transaction_timeout {
                self.pairs[idx].wait_transaction_timeout = false;
                self.pairs[idx].state = PairState::Waiting;
                self.enqueue_triggered(pair_id);
                return None;
            }

            self.pairs[idx].retransmissions += 1;
            if self.pairs[idx].retransmissions > ICE_MAX_RETRANSMISSIONS {
                self.pairs[idx].state = PairState::Failed;
                log::debug!("pair {idx} exhausted retransmissions, marking Failed");
                return None;
            }
            self.pairs[idx].rto_ms *= 2;
            self.pairs[idx].transmission_time = Some(now);
        } else {
            self.pairs[idx].rto_ms = INITIAL_RTO_MS;
            self.pairs[idx].retransmissions = 0;
            self.pairs[idx].role = cfg.role;
            self.pairs[idx].transaction_id = idgen::random_transaction_id();
            self.pairs[idx].state = PairState::InProgress;
            self.pairs[idx].transmission_time = Some(now);
        }

        Some(self.encode_binding_request(pair_id, cfg, codec))
    }

    fn encode_binding_request(&self, pair_id: PairId, cfg: &SessionConfig, codec: &dyn StunCodec) -> Vec<u8> {
        let pair = &self.pairs[pair_id.index()];
        let local = &self.local_candidates[pair.local];

        let mut msg = StunMessage::request(pair.transaction_id);

        let remote_ufrag = self.remote_ufrag(cfg).unwrap_or_default();
        msg.username = Some(format!("{}:{}", remote_ufrag, cfg.local_credentials.ufrag));
        msg.message_integrity = true;
        msg.fingerprint = true;
        // Sent as PeerReflexive priority: our peer should learn us at the
        // lowest-preference type if this check reveals a new candidate of ours.
        msg.priority = Some((local.priority & 0x00FF_FFFF) | (crate::candidate::CandidateType::PeerReflexive.type_preference() << 24));
        msg.use_candidate = pair.role == Role::Controlling && pair.is_nominated;

        match pair.role {
            Role::Controlling => msg.ice_controlling = Some(cfg.tie_breaker),
            Role::Controlled => msg.ice_controlled = Some(cfg.tie_breaker),
        }

        let key = self.remote_pwd(cfg).map(str::as_bytes);
        codec.encode(&msg, key)
    }
}
