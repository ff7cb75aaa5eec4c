//! §4.4 received requests, §4.5 received success responses, §4.7 received
//! error responses.

use crate::candidate::CandidateType;
use crate::idgen;
use crate::pair::{PairId, PairState, ValidPair};
use crate::stun::{Class, ErrorCode, StunCodec, StunMessage};
use crate::{Effect, ReceivedPkt, Role, SessionConfig, MAX_CANDIDATES_PER_ARENA};

use super::CheckList;

enum RoleAttr {
    Controlling(u64),
    Controlled(u64),
}

impl CheckList {
    pub(crate) fn handle_stun_packet(
        &mut self,
        stream: usize,
        cfg: &mut SessionConfig,
        codec: &dyn StunCodec,
        pkt: &ReceivedPkt<'_>,
        effects: &mut Vec<Effect>,
    ) {
        let msg = match codec.decode(pkt.data) {
            Ok(msg) => msg,
            Err(_) => {
                log::warn!("discarding malformed STUN packet from {}", pkt.source);
                return;
            }
        };

        match msg.class {
            Class::Request => self.receive_request(stream, cfg, codec, pkt, msg, effects),
            Class::Indication => {}
            Class::Success => {
                if !msg.fingerprint {
                    log::trace!("STUN success missing FINGERPRINT, discarding");
                    return;
                }
                self.receive_success(stream, cfg, codec, pkt, msg, effects);
            }
            Class::Error => {
                if !msg.fingerprint {
                    log::trace!("STUN error missing FINGERPRINT, discarding");
                    return;
                }
                self.receive_error(stream, cfg, codec, pkt, msg, effects);
            }
        }
    }

    fn send_error(
        &self,
        stream: usize,
        pkt: &ReceivedPkt<'_>,
        codec: &dyn StunCodec,
        transaction_id: [u8; 12],
        number: u16,
        reason: &str,
        effects: &mut Vec<Effect>,
    ) {
        let msg = StunMessage::error(transaction_id, ErrorCode::new(number, reason));
        let bytes = codec.encode(&msg, None);
        effects.push(Effect::SendStun {
            stream,
            component_id: pkt.component_id,
            bytes,
            dest: pkt.source,
        });
    }

    /// §4.4: validate, learn the peer-reflexive remote candidate if needed,
    /// trigger the matching check, apply request-side nomination, and reply.
    fn receive_request(
        &mut self,
        stream: usize,
        cfg: &mut SessionConfig,
        codec: &dyn StunCodec,
        pkt: &ReceivedPkt<'_>,
        msg: StunMessage,
        effects: &mut Vec<Effect>,
    ) {
        let tid = msg.transaction_id;

        if !msg.message_integrity {
            self.send_error(stream, pkt, codec, tid, ErrorCode::BAD_REQUEST, "Missing MESSAGE-INTEGRITY", effects);
            return;
        }
        if msg.username.is_none() {
            self.send_error(stream, pkt, codec, tid, ErrorCode::BAD_REQUEST, "Missing USERNAME", effects);
            return;
        }
        if !msg.fingerprint {
            self.send_error(stream, pkt, codec, tid, ErrorCode::BAD_REQUEST, "Missing FINGERPRINT", effects);
            return;
        }
        let Some(priority) = msg.priority else {
            self.send_error(stream, pkt, codec, tid, ErrorCode::BAD_REQUEST, "Missing PRIORITY", effects);
            return;
        };
        let role_attr = match (msg.ice_controlling, msg.ice_controlled) {
            (Some(tb), None) => RoleAttr::Controlling(tb),
            (None, Some(tb)) => RoleAttr::Controlled(tb),
            _ => {
                self.send_error(
                    stream,
                    pkt,
                    codec,
                    tid,
                    ErrorCode::BAD_REQUEST,
                    "Expected exactly one of ICE-CONTROLLING/ICE-CONTROLLED",
                    effects,
                );
                return;
            }
        };

        if !codec.verify_integrity_short_term(pkt.data, cfg.local_credentials.pwd.as_bytes()) {
            self.send_error(
                stream,
                pkt,
                codec,
                tid,
                ErrorCode::UNAUTHORIZED,
                "MESSAGE-INTEGRITY verification failed",
                effects,
            );
            return;
        }

        let username = msg.username.as_deref().unwrap_or_default();
        if username.split(':').next() != Some(cfg.local_credentials.ufrag.as_str()) {
            self.send_error(stream, pkt, codec, tid, ErrorCode::UNAUTHORIZED, "USERNAME does not match", effects);
            return;
        }

        match role_attr {
            RoleAttr::Controlling(peer_tb) if cfg.role == Role::Controlling => {
                if cfg.tie_breaker >= peer_tb {
                    self.send_error(stream, pkt, codec, tid, ErrorCode::ROLE_CONFLICT, "Role conflict", effects);
                    return;
                }
                cfg.role = Role::Controlled;
                self.recompute_pair_priorities(cfg.role);
            }
            RoleAttr::Controlled(peer_tb) if cfg.role == Role::Controlled => {
                if cfg.tie_breaker >= peer_tb {
                    cfg.role = Role::Controlling;
                    self.recompute_pair_priorities(cfg.role);
                } else {
                    self.send_error(stream, pkt, codec, tid, ErrorCode::ROLE_CONFLICT, "Role conflict", effects);
                    return;
                }
            }
            _ => {}
        }

        let remote_id = match self.remote_candidates.iter().find(|(_, c)| c.taddr == pkt.source).map(|(id, _)| id) {
            Some(id) => id,
            None => {
                let foundation = idgen::random_foundation();
                match self.add_remote_candidate(CandidateType::PeerReflexive, pkt.source, pkt.component_id, priority, foundation) {
                    Ok(id) => id,
                    Err(_) => {
                        log::warn!("remote candidate arena full, dropping peer-reflexive discovery from {}", pkt.source);
                        return;
                    }
                }
            }
        };

        let Some(local_id) = self.local_candidates.iter().find(|(_, c)| c.taddr == pkt.destination).map(|(id, _)| id) else {
            log::warn!("no local candidate matches receiving address {}", pkt.destination);
            return;
        };

        let pair_id = match self.find_pair(local_id, remote_id) {
            Some(id) => {
                match self.pairs[id.index()].state {
                    PairState::Waiting | PairState::Frozen | PairState::Failed => {
                        self.pairs[id.index()].state = PairState::Waiting;
                        self.enqueue_triggered(id);
                    }
                    PairState::InProgress => {
                        self.pairs[id.index()].wait_transaction_timeout = true;
                    }
                    PairState::Succeeded => {}
                }
                id
            }
            None => {
                let id = self.push_pair(local_id, remote_id, cfg.role);
                self.check_list.push(id);
                self.pairs[id.index()].state = PairState::Waiting;
                self.enqueue_triggered(id);
                id
            }
        };

        // Nomination on request: a USE-CANDIDATE seen here marks the pair as
        // nominated regardless of its current state, so that whenever it (or
        // the valid pair it eventually produces) reaches Succeeded, nomination
        // is already recorded — folding together the "state is already
        // Succeeded" and "still in flight" cases from the controlled side.
        if msg.use_candidate && cfg.role == Role::Controlled {
            self.pairs[pair_id.index()].is_nominated = true;
        }

        let mut response = StunMessage::success(tid);
        response.xor_mapped_address = Some(pkt.source);
        response.fingerprint = true;
        let bytes = codec.encode(&response, Some(cfg.local_credentials.pwd.as_bytes()));
        effects.push(Effect::SendStun {
            stream,
            component_id: pkt.component_id,
            bytes,
            dest: pkt.source,
        });

        self.conclude(stream, cfg, effects);
    }

    /// §4.5: match by transaction id, verify symmetry and integrity, discover
    /// a peer-reflexive local candidate if needed, and update the valid list.
    fn receive_success(
        &mut self,
        stream: usize,
        cfg: &mut SessionConfig,
        codec: &dyn StunCodec,
        pkt: &ReceivedPkt<'_>,
        msg: StunMessage,
        effects: &mut Vec<Effect>,
    ) {
        let Some(pair_idx) = self
            .pairs
            .iter()
            .position(|p| p.state == PairState::InProgress && p.transaction_id == msg.transaction_id)
        else {
            log::debug!("unknown transaction for STUN success from {}, ignoring", pkt.source);
            return;
        };
        let pair_id = PairId(pair_idx as u32);

        let Some(remote_pwd) = self.remote_pwd(cfg).map(str::to_owned) else {
            return;
        };
        if !codec.verify_integrity_short_term(pkt.data, remote_pwd.as_bytes()) {
            log::debug!("STUN success failed integrity check, discarding");
            return;
        }

        let pair_local_taddr = self.local_candidates[self.pairs[pair_id.index()].local].taddr;
        let pair_remote_taddr = self.remote_candidates[self.pairs[pair_id.index()].remote].taddr;
        if pkt.source != pair_remote_taddr || pkt.destination != pair_local_taddr {
            self.pairs[pair_id.index()].state = PairState::Failed;
            log::debug!("non-symmetric STUN response addresses, pair Failed");
            return;
        }

        if msg.username.is_none() || !msg.fingerprint || msg.xor_mapped_address.is_none() {
            log::debug!("STUN success missing required attributes, discarding");
            return;
        }
        let mapped = msg.xor_mapped_address.unwrap();

        let local_id = if mapped != pair_local_taddr {
            match self.local_candidates.iter().find(|(_, c)| c.taddr == mapped).map(|(id, _)| id) {
                Some(id) => id,
                None if self.local_candidates.len() < MAX_CANDIDATES_PER_ARENA => {
                    let base = self.pairs[pair_id.index()].local;
                    let component_id = self.local_candidates[base].component_id;
                    let foundation = idgen::random_foundation();
                    let candidate =
                        crate::Candidate::new_local(CandidateType::PeerReflexive, mapped, component_id, foundation, Some(base));
                    self.local_candidates.insert(candidate)
                }
                None => {
                    log::warn!("local candidate arena full, cannot record discovered peer-reflexive candidate");
                    self.pairs[pair_id.index()].local
                }
            }
        } else {
            self.pairs[pair_id.index()].local
        };

        let remote_id = self.pairs[pair_id.index()].remote;
        let valid_pair_id = match self.find_pair(local_id, remote_id) {
            Some(id) => id,
            None => {
                let id = self.push_pair(local_id, remote_id, cfg.role);
                self.check_list.push(id);
                id
            }
        };

        if self.pairs[pair_id.index()].is_nominated {
            self.pairs[valid_pair_id.index()].is_nominated = true;
        }

        let candidate = ValidPair { valid: valid_pair_id, generated_from: pair_id };
        let already_valid = self
            .valid_list
            .iter()
            .any(|vp| vp.valid == candidate.valid && vp.generated_from == candidate.generated_from);
        if !already_valid {
            let priority = self.pairs[valid_pair_id.index()].priority;
            let pos = self
                .valid_list
                .iter()
                .position(|vp| self.pairs[vp.valid.index()].priority < priority)
                .unwrap_or(self.valid_list.len());
            self.valid_list.insert(pos, candidate);
        }

        self.pairs[pair_id.index()].state = PairState::Succeeded;
        self.unfreeze_siblings(pair_id);

        self.conclude(stream, cfg, effects);
    }

    /// §4.7: match by transaction id, mark Failed, and on a 487 flip role and
    /// retry the check.
    fn receive_error(
        &mut self,
        stream: usize,
        cfg: &mut SessionConfig,
        codec: &dyn StunCodec,
        pkt: &ReceivedPkt<'_>,
        msg: StunMessage,
        effects: &mut Vec<Effect>,
    ) {
        let Some(pair_idx) = self
            .pairs
            .iter()
            .position(|p| p.state == PairState::InProgress && p.transaction_id == msg.transaction_id)
        else {
            log::debug!("unknown transaction for STUN error from {}, ignoring", pkt.source);
            return;
        };
        let pair_id = PairId(pair_idx as u32);

        if let Some(remote_pwd) = self.remote_pwd(cfg).map(str::to_owned) {
            if !codec.verify_integrity_short_term(pkt.data, remote_pwd.as_bytes()) {
                log::debug!("STUN error failed integrity check, discarding");
                return;
            }
        }

        self.pairs[pair_id.index()].state = PairState::Failed;

        if msg.error_code.as_ref().is_some_and(|e| e.number == ErrorCode::ROLE_CONFLICT) {
            let pair_role = self.pairs[pair_id.index()].role;
            cfg.role = pair_role.flipped();
            self.pairs[pair_id.index()].state = PairState::Waiting;
            self.enqueue_triggered(pair_id);
            self.recompute_pair_priorities(cfg.role);
        }

        self.conclude(stream, cfg, effects);
    }
}
