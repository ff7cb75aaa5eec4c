//! §4.2 the per-tick scheduler and §4.6 conclusion logic.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::pair::{PairId, PairState};
use crate::stun::StunCodec;
use crate::{Effect, Role, SessionConfig, ICE_MAX_RETRANSMISSIONS};

use super::{CheckList, CheckListState};

impl CheckList {
    /// Drive this check list forward by one tick. Retransmissions and (while
    /// `Completed`) keepalives happen on every call; at most one new
    /// connectivity check is dispatched per Ta interval.
    pub(crate) fn process(
        &mut self,
        stream: usize,
        now: Instant,
        cfg: &SessionConfig,
        codec: &dyn StunCodec,
        effects: &mut Vec<Effect>,
    ) {
        if self.state == CheckListState::Failed {
            return;
        }

        self.poll_retransmissions(stream, now, cfg, codec, effects);

        if self.state == CheckListState::Completed {
            self.poll_keepalives(stream, now, cfg, codec, effects);
        }

        if let Some(ta_time) = self.ta_time {
            if now.duration_since(ta_time) < Duration::from_millis(cfg.ta_ms()) {
                return;
            }
        }
        self.ta_time = Some(now);

        if let Some(pair_id) = self.triggered_checks_queue.pop_front() {
            self.dispatch(stream, pair_id, now, cfg, codec, effects);
            return;
        }

        if self.state == CheckListState::Running {
            let waiting = self
                .check_list
                .iter()
                .copied()
                .find(|id| self.pairs[id.index()].state == PairState::Waiting);
            if let Some(pair_id) = waiting {
                self.dispatch(stream, pair_id, now, cfg, codec, effects);
                return;
            }

            let frozen = self
                .check_list
                .iter()
                .copied()
                .find(|id| self.pairs[id.index()].state == PairState::Frozen);
            if let Some(pair_id) = frozen {
                self.dispatch(stream, pair_id, now, cfg, codec, effects);
                return;
            }
        }

        let any_in_progress = self.pairs.iter().any(|p| p.state == PairState::InProgress);
        if !any_in_progress {
            self.conclude(stream, cfg, effects);
        }
    }

    fn dispatch(
        &mut self,
        stream: usize,
        pair_id: PairId,
        now: Instant,
        cfg: &SessionConfig,
        codec: &dyn StunCodec,
        effects: &mut Vec<Effect>,
    ) {
        if let Some(bytes) = self.issue_check(pair_id, cfg, now, codec) {
            self.emit_send(stream, pair_id, bytes, effects);
        }
    }

    fn emit_send(&self, stream: usize, pair_id: PairId, bytes: Vec<u8>, effects: &mut Vec<Effect>) {
        let pair = &self.pairs[pair_id.index()];
        let component_id = self.local_candidates[pair.local].component_id;
        let dest = self.remote_candidates[pair.remote].taddr;
        effects.push(Effect::SendStun { stream, component_id, bytes, dest });
    }

    fn poll_retransmissions(
        &mut self,
        stream: usize,
        now: Instant,
        cfg: &SessionConfig,
        codec: &dyn StunCodec,
        effects: &mut Vec<Effect>,
    ) {
        let due: Vec<PairId> = self
            .pairs
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state == PairState::InProgress)
            .filter(|(_, p)| {
                p.transmission_time
                    .is_some_and(|t| now.duration_since(t) >= Duration::from_millis(p.rto_ms as u64))
            })
            .map(|(idx, _)| PairId(idx as u32))
            .collect();

        for pair_id in due {
            self.dispatch(stream, pair_id, now, cfg, codec, effects);
        }
    }

    /// §4.8: while `Completed`, send a STUN indication down every nominated
    /// valid pair every `keepalive_timeout_s`.
    fn poll_keepalives(&mut self, stream: usize, now: Instant, cfg: &SessionConfig, codec: &dyn StunCodec, effects: &mut Vec<Effect>) {
        let Some(keepalive_time) = self.keepalive_time else {
            self.keepalive_time = Some(now);
            return;
        };

        if now.duration_since(keepalive_time) < Duration::from_secs(cfg.keepalive_timeout_s()) {
            return;
        }
        self.keepalive_time = Some(now);

        let nominated: Vec<PairId> = self
            .valid_list
            .iter()
            .filter(|vp| self.pairs[vp.valid.index()].is_nominated)
            .map(|vp| vp.valid)
            .collect();

        for pair_id in nominated {
            let transaction_id = crate::idgen::random_transaction_id();
            let mut msg = crate::stun::StunMessage::indication(transaction_id);
            msg.fingerprint = true;
            let bytes = codec.encode(&msg, None);
            self.emit_send(stream, pair_id, bytes, effects);
        }
    }

    /// §4.6: regular nomination, cancellation of redundant checks, and the
    /// completion/failure tests.
    pub(crate) fn conclude(&mut self, stream: usize, cfg: &SessionConfig, effects: &mut Vec<Effect>) {
        if cfg.role == Role::Controlling {
            let to_nominate: Vec<PairId> = self
                .valid_list
                .iter()
                .filter(|vp| !self.pairs[vp.valid.index()].is_nominated)
                .map(|vp| vp.generated_from)
                .collect();
            for pair_id in to_nominate {
                self.pairs[pair_id.index()].is_nominated = true;
                self.enqueue_triggered(pair_id);
            }
        }

        let nominated_components: HashSet<u16> = self
            .valid_list
            .iter()
            .filter(|vp| self.pairs[vp.valid.index()].is_nominated)
            .map(|vp| self.local_candidates[self.pairs[vp.valid.index()].local].component_id)
            .collect();

        for &component_id in &nominated_components {
            let is_redundant = |pairs: &[crate::pair::CandidatePair], id: PairId, local_candidates: &slotmap::SlotMap<crate::LocalCandidateId, crate::Candidate>| {
                let p = &pairs[id.index()];
                local_candidates[p.local].component_id == component_id
                    && matches!(p.state, PairState::Waiting | PairState::Frozen)
            };

            let pairs = &self.pairs;
            let local_candidates = &self.local_candidates;
            self.check_list.retain(|&id| !is_redundant(pairs, id, local_candidates));
            self.triggered_checks_queue.retain(|&id| !is_redundant(pairs, id, local_candidates));

            for pair in &mut self.pairs {
                if self.local_candidates[pair.local].component_id == component_id && pair.state == PairState::InProgress {
                    pair.retransmissions = ICE_MAX_RETRANSMISSIONS;
                }
            }
        }

        let component_ids: Vec<u16> = self.component_ids.iter().copied().collect();
        let all_components_nominated = component_ids.iter().all(|c| {
            self.valid_list.iter().any(|vp| {
                let p = &self.pairs[vp.valid.index()];
                p.is_nominated && self.local_candidates[p.local].component_id == *c
            })
        });

        if all_components_nominated {
            if self.state != CheckListState::Completed {
                self.state = CheckListState::Completed;
                self.keepalive_time = None;
                effects.push(Effect::StreamCompleted { stream });
            }
            return;
        }

        let all_terminal = !self.check_list.is_empty()
            && self
                .check_list
                .iter()
                .all(|&id| matches!(self.pairs[id.index()].state, PairState::Failed | PairState::Succeeded));

        if all_terminal && self.state != CheckListState::Failed {
            self.state = CheckListState::Failed;
            effects.push(Effect::StreamFailed { stream });
        }
    }
}
