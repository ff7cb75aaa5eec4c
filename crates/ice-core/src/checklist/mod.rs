mod inbound;
mod outbound;
mod scheduler;

use std::collections::{BTreeSet, HashSet, VecDeque};

use slotmap::SlotMap;

use crate::candidate::{Candidate, CandidateType};
use crate::idgen;
use crate::pair::{pair_priority, CandidatePair, PairId, PairState, ValidPair};
use crate::stats::{CheckListSnapshot, PairSnapshot};
use crate::{
    Error, IceCredentials, LocalCandidateId, RemoteCandidateId, Result, Role, SessionConfig,
    TransportAddress, MAX_CANDIDATES_PER_ARENA,
};

/// Lifecycle state of one media stream's check list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckListState {
    Running,
    Completed,
    Failed,
}

/// One per media stream: owns the local/remote candidates, the formed pairs,
/// the prioritized check list, the triggered-check FIFO and the valid list.
pub struct CheckList {
    pub(crate) local_candidates: SlotMap<LocalCandidateId, Candidate>,
    pub(crate) remote_candidates: SlotMap<RemoteCandidateId, Candidate>,
    pub(crate) pairs: Vec<CandidatePair>,
    pub(crate) check_list: Vec<PairId>,
    pub(crate) triggered_checks_queue: VecDeque<PairId>,
    pub(crate) valid_list: Vec<ValidPair>,
    pub(crate) component_ids: BTreeSet<u16>,
    pub(crate) foundations: HashSet<(String, String)>,
    pub(crate) remote_ufrag: Option<String>,
    pub(crate) remote_pwd: Option<String>,
    pub(crate) state: CheckListState,
    pub(crate) ta_time: Option<std::time::Instant>,
    pub(crate) keepalive_time: Option<std::time::Instant>,
    is_first_stream: bool,
    unfrozen_initial: bool,
}

impl CheckList {
    pub(crate) fn new(is_first_stream: bool) -> Self {
        CheckList {
            local_candidates: SlotMap::with_key(),
            remote_candidates: SlotMap::with_key(),
            pairs: Vec::new(),
            check_list: Vec::new(),
            triggered_checks_queue: VecDeque::new(),
            valid_list: Vec::new(),
            component_ids: BTreeSet::new(),
            foundations: HashSet::new(),
            remote_ufrag: None,
            remote_pwd: None,
            state: CheckListState::Running,
            ta_time: None,
            keepalive_time: None,
            is_first_stream,
            unfrozen_initial: false,
        }
    }

    pub fn destroy(self) {}

    pub fn state(&self) -> CheckListState {
        self.state
    }

    pub fn valid_list(&self) -> &[ValidPair] {
        &self.valid_list
    }

    pub fn pairs(&self) -> &[CandidatePair] {
        &self.pairs
    }

    pub fn pair(&self, id: PairId) -> &CandidatePair {
        &self.pairs[id.index()]
    }

    pub fn local_candidate(&self, id: LocalCandidateId) -> &Candidate {
        &self.local_candidates[id]
    }

    pub fn remote_candidate(&self, id: RemoteCandidateId) -> &Candidate {
        &self.remote_candidates[id]
    }

    pub fn set_remote_credentials(&mut self, credentials: IceCredentials) {
        self.remote_ufrag = Some(credentials.ufrag);
        self.remote_pwd = Some(credentials.pwd);
    }

    pub(crate) fn remote_ufrag<'a>(&'a self, cfg: &'a SessionConfig) -> Option<&'a str> {
        self.remote_ufrag
            .as_deref()
            .or_else(|| cfg.remote_credentials.as_ref().map(|c| c.ufrag.as_str()))
    }

    pub(crate) fn remote_pwd<'a>(&'a self, cfg: &'a SessionConfig) -> Option<&'a str> {
        self.remote_pwd
            .as_deref()
            .or_else(|| cfg.remote_credentials.as_ref().map(|c| c.pwd.as_str()))
    }

    /// Whether `addr` is a known remote candidate's address — lets an embedder
    /// demux a non-STUN datagram from a recognized peer before handing it to a
    /// jitter buffer, without duplicating pair-state logic.
    pub fn is_known_remote(&self, addr: TransportAddress) -> bool {
        self.remote_candidates.values().any(|c| c.taddr == addr)
    }

    pub fn add_local_candidate(
        &mut self,
        typ: CandidateType,
        taddr: TransportAddress,
        component_id: u16,
        base: Option<LocalCandidateId>,
    ) -> Result<LocalCandidateId> {
        if self.local_candidates.len() >= MAX_CANDIDATES_PER_ARENA {
            return Err(Error::TooManyCandidates {
                max: MAX_CANDIDATES_PER_ARENA,
            });
        }

        let foundation = self.foundation_for(&self.local_candidates, typ, base_ip(self, base, taddr));
        let candidate = Candidate::new_local(typ, taddr, component_id, foundation, base);
        self.component_ids.insert(component_id);
        Ok(self.local_candidates.insert(candidate))
    }

    pub fn add_remote_candidate(
        &mut self,
        typ: CandidateType,
        taddr: TransportAddress,
        component_id: u16,
        priority: u32,
        foundation: String,
    ) -> Result<RemoteCandidateId> {
        if self.remote_candidates.len() >= MAX_CANDIDATES_PER_ARENA {
            return Err(Error::TooManyCandidates {
                max: MAX_CANDIDATES_PER_ARENA,
            });
        }

        let candidate = Candidate::new_remote(typ, taddr, component_id, priority, foundation);
        Ok(self.remote_candidates.insert(candidate))
    }

    /// Derive a foundation token for a new candidate, reusing an existing one
    /// assigned to the same `(type, base ip)` class within this arena.
    fn foundation_for<K: slotmap::Key>(
        &self,
        arena: &SlotMap<K, Candidate>,
        typ: CandidateType,
        base_ip: std::net::IpAddr,
    ) -> String {
        arena
            .values()
            .find(|c| c.typ == typ && candidate_base_ip(self, c) == base_ip)
            .map(|c| c.foundation.clone())
            .unwrap_or_else(idgen::random_foundation)
    }

    /// Recompute every candidate's foundation from scratch, grouping by
    /// `(type, base ip)`. Idempotent and safe to call repeatedly.
    pub(crate) fn recompute_foundations(&mut self) {
        let mut classes: Vec<(CandidateType, std::net::IpAddr)> = Vec::new();
        let mut assignments: Vec<(LocalCandidateId, String)> = Vec::new();

        for (id, c) in self.local_candidates.iter() {
            let base_ip = c.base.map_or(c.taddr.ip, |b| self.local_candidates[b].taddr.ip);
            let class = (c.typ, base_ip);
            let idx = classes.iter().position(|k| *k == class).unwrap_or_else(|| {
                classes.push(class);
                classes.len() - 1
            });
            assignments.push((id, format!("f{idx}")));
        }

        for (id, foundation) in assignments {
            self.local_candidates[id].foundation = foundation;
        }
    }

    pub(crate) fn choose_default_candidates(&mut self) {
        for c in self.local_candidates.values_mut() {
            c.is_default = false;
        }

        for &component_id in &self.component_ids.clone() {
            let best = self
                .local_candidates
                .iter()
                .filter(|(_, c)| c.component_id == component_id)
                .min_by_key(|(_, c)| match c.typ {
                    CandidateType::Host => 0,
                    CandidateType::ServerReflexive => 1,
                    CandidateType::PeerReflexive => 2,
                    CandidateType::Relayed => 3,
                })
                .map(|(id, _)| id);

            if let Some(id) = best {
                self.local_candidates[id].is_default = true;
            }
        }
    }

    pub(crate) fn find_pair(&self, local: LocalCandidateId, remote: RemoteCandidateId) -> Option<PairId> {
        self.pairs
            .iter()
            .position(|p| p.local == local && p.remote == remote)
            .map(|idx| PairId(idx as u32))
    }

    /// Append a new pair to `pairs` (not to `check_list`) and return its id.
    /// Used both by pair formation and by on-demand pair creation (§4.4, §4.5).
    pub(crate) fn push_pair(&mut self, local: LocalCandidateId, remote: RemoteCandidateId, role: Role) -> PairId {
        let priority = pair_priority(
            self.local_candidates[local].priority,
            self.remote_candidates[remote].priority,
            role,
        );
        self.pairs.push(CandidatePair::new(local, remote, priority, role));
        PairId((self.pairs.len() - 1) as u32)
    }

    pub(crate) fn recompute_pair_priorities(&mut self, role: Role) {
        for pair in &mut self.pairs {
            pair.priority = pair_priority(
                self.local_candidates[pair.local].priority,
                self.remote_candidates[pair.remote].priority,
                role,
            );
            pair.role = role;
        }
        self.resort_check_list();
    }

    fn resort_check_list(&mut self) {
        let pairs = &self.pairs;
        self.check_list.sort_unstable_by(|a, b| {
            pairs[b.index()].priority.cmp(&pairs[a.index()].priority)
        });
    }

    pub(crate) fn truncate_check_list(&mut self, max: usize) {
        self.check_list.truncate(max);
    }

    /// §4.1: form every (local, remote) pair sharing a component id, replace
    /// server-reflexive locals by their base, prune duplicates, build the
    /// sorted/capped check list, derive foundations, and unfreeze the initial pair.
    pub(crate) fn form_pairs(&mut self, cfg: &SessionConfig) {
        let local_ids: Vec<LocalCandidateId> = self.local_candidates.keys().collect();
        let remote_ids: Vec<RemoteCandidateId> = self.remote_candidates.keys().collect();

        for &local in &local_ids {
            for &remote in &remote_ids {
                if self.local_candidates[local].component_id != self.remote_candidates[remote].component_id {
                    continue;
                }
                if self.find_pair(local, remote).is_some() {
                    continue;
                }
                self.push_pair(local, remote, cfg.role);
            }
        }

        self.replace_srflx_bases();
        self.prune_duplicate_pairs();

        self.check_list = (0..self.pairs.len() as u32).map(PairId).collect();
        self.resort_check_list();

        if cfg.max_connectivity_checks() > 0 {
            self.truncate_check_list(cfg.max_connectivity_checks());
        }

        self.recompute_pair_foundations();
        self.unfreeze_initial();
    }

    /// §4.1 "Replace base": rewrite each pair's `local` to its host base when
    /// the local candidate is ServerReflexive. The remote side is untouched.
    fn replace_srflx_bases(&mut self) {
        let mut rewrites = Vec::new();
        for (idx, pair) in self.pairs.iter().enumerate() {
            let local = &self.local_candidates[pair.local];
            if local.typ == CandidateType::ServerReflexive {
                if let Some(base) = local.base {
                    rewrites.push((idx, base));
                }
            }
        }
        for (idx, base) in rewrites {
            self.pairs[idx].local = base;
        }
    }

    fn prune_duplicate_pairs(&mut self) {
        let mut keep: Vec<bool> = vec![true; self.pairs.len()];

        for i in 0..self.pairs.len() {
            if !keep[i] {
                continue;
            }
            for j in (i + 1)..self.pairs.len() {
                if !keep[j] {
                    continue;
                }
                if self.pairs_are_duplicates(i, j) {
                    if self.pairs[j].priority > self.pairs[i].priority {
                        keep[i] = false;
                        break;
                    } else {
                        keep[j] = false;
                    }
                }
            }
        }

        let mut kept_pairs = Vec::with_capacity(self.pairs.len());
        for (idx, pair) in self.pairs.drain(..).enumerate() {
            if keep[idx] {
                kept_pairs.push(pair);
            }
        }
        self.pairs = kept_pairs;
    }

    /// §4.1: pairs are duplicates when both endpoints compare equal in
    /// `(type, taddr, component_id, priority)`. The remote side is the same
    /// candidate arena entry whenever it's the same remote, so comparing by
    /// id is equivalent and cheaper; the local side is compared by value
    /// since `replace_srflx_bases` may have mapped two distinct srflx
    /// candidates onto the same host base.
    fn pairs_are_duplicates(&self, i: usize, j: usize) -> bool {
        let li = &self.local_candidates[self.pairs[i].local];
        let lj = &self.local_candidates[self.pairs[j].local];

        li.typ == lj.typ
            && li.taddr == lj.taddr
            && li.component_id == lj.component_id
            && li.priority == lj.priority
            && self.pairs[i].remote == self.pairs[j].remote
    }

    fn recompute_pair_foundations(&mut self) {
        self.foundations.clear();
        for &pair_id in &self.check_list {
            let pair = &self.pairs[pair_id.index()];
            let local_f = self.local_candidates[pair.local].foundation.clone();
            let remote_f = self.remote_candidates[pair.remote].foundation.clone();
            self.foundations.insert((local_f, remote_f));
        }
    }

    fn pair_foundation(&self, pair_id: PairId) -> (String, String) {
        let pair = &self.pairs[pair_id.index()];
        (
            self.local_candidates[pair.local].foundation.clone(),
            self.remote_candidates[pair.remote].foundation.clone(),
        )
    }

    /// §4.1 "Initial unfreeze": only for the first stream, and only once.
    fn unfreeze_initial(&mut self) {
        if !self.is_first_stream || self.unfrozen_initial || self.check_list.is_empty() {
            return;
        }

        let min_component = self
            .check_list
            .iter()
            .map(|id| self.local_candidates[self.pairs[id.index()].local].component_id)
            .min();

        let Some(min_component) = min_component else {
            return;
        };

        let best = self
            .check_list
            .iter()
            .copied()
            .filter(|id| self.local_candidates[self.pairs[id.index()].local].component_id == min_component)
            .max_by_key(|id| self.pairs[id.index()].priority);

        if let Some(id) = best {
            self.pairs[id.index()].state = PairState::Waiting;
        }

        self.unfrozen_initial = true;
    }

    /// Unfreeze every Frozen pair sharing `pair_id`'s foundation (§4.5).
    pub(crate) fn unfreeze_siblings(&mut self, pair_id: PairId) {
        let (local_f, remote_f) = self.pair_foundation(pair_id);

        for &id in &self.check_list {
            let pair = &mut self.pairs[id.index()];
            if pair.state != PairState::Frozen {
                continue;
            }
            let (lf, rf) = (
                self.local_candidates[pair.local].foundation.clone(),
                self.remote_candidates[pair.remote].foundation.clone(),
            );
            if lf == local_f && rf == remote_f {
                pair.state = PairState::Waiting;
            }
        }
    }

    pub(crate) fn enqueue_triggered(&mut self, pair_id: PairId) {
        if !self.triggered_checks_queue.contains(&pair_id) {
            self.triggered_checks_queue.push_back(pair_id);
        }
    }

    /// §6 `get_remote_addr_and_ports_from_valid_pairs`: the nominated remote
    /// address for RTP and (if present) RTCP.
    pub fn nominated_remote_addrs(&self) -> (Option<TransportAddress>, Option<TransportAddress>) {
        let mut rtp = None;
        let mut rtcp = None;

        for vp in &self.valid_list {
            let pair = &self.pairs[vp.valid.index()];
            if !pair.is_nominated {
                continue;
            }
            let addr = self.remote_candidates[pair.remote].taddr;
            match self.local_candidates[pair.local].component_id {
                1 => rtp = Some(addr),
                2 => rtcp = Some(addr),
                _ => {}
            }
        }

        (rtp, rtcp)
    }

    pub fn dump(&self) -> CheckListSnapshot {
        let snap = |pair: &CandidatePair| {
            PairSnapshot::new(
                self.local_candidates[pair.local].taddr,
                self.remote_candidates[pair.remote].taddr,
                self.local_candidates[pair.local].component_id,
                pair.priority,
                pair.state,
                pair.is_nominated,
            )
        };

        CheckListSnapshot {
            state: match self.state {
                CheckListState::Running => "Running",
                CheckListState::Completed => "Completed",
                CheckListState::Failed => "Failed",
            },
            pairs: self.pairs.iter().map(snap).collect(),
            valid_list: self
                .valid_list
                .iter()
                .map(|vp| snap(&self.pairs[vp.valid.index()]))
                .collect(),
        }
    }
}

fn candidate_base_ip(list: &CheckList, c: &Candidate) -> std::net::IpAddr {
    c.base.map_or(c.taddr.ip, |b| list.local_candidates[b].taddr.ip)
}

fn base_ip(list: &CheckList, base: Option<LocalCandidateId>, taddr: TransportAddress) -> std::net::IpAddr {
    base.map_or(taddr.ip, |b| list.local_candidates[b].taddr.ip)
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::{IceCredentials, SessionConfig};

    fn addr(last: u8, port: u16) -> TransportAddress {
        TransportAddress::new(IpAddr::from([10, 0, 0, last]), port)
    }

    fn controlling_cfg() -> SessionConfig {
        SessionConfig::new(Role::Controlling, IceCredentials::random())
    }

    #[test]
    fn check_list_is_sorted_descending_and_capped() {
        let mut cl = CheckList::new(true);
        let mut cfg = controlling_cfg();
        cfg.set_max_connectivity_checks(25);

        for i in 0..10u8 {
            cl.add_local_candidate(CandidateType::Host, addr(1, 5000 + i as u16), 1, None).unwrap();
        }
        for i in 0..10u8 {
            cl.add_remote_candidate(CandidateType::Host, addr(2, 6000 + i as u16), 1, 100 + i as u32, format!("r{i}"))
                .unwrap();
        }
        cl.form_pairs(&cfg);

        assert_eq!(cl.check_list.len(), 25);
        assert!(cl.check_list.windows(2).all(|w| cl.pairs[w[0].index()].priority >= cl.pairs[w[1].index()].priority));
    }

    #[test]
    fn eleventh_candidate_is_rejected_and_state_is_unchanged() {
        let mut cl = CheckList::new(true);
        for i in 0..10u8 {
            cl.add_local_candidate(CandidateType::Host, addr(1, 5000 + i as u16), 1, None).unwrap();
        }
        let before = cl.local_candidates.len();
        let err = cl.add_local_candidate(CandidateType::Host, addr(1, 5010), 1, None);
        assert!(err.is_err());
        assert_eq!(cl.local_candidates.len(), before);
    }

    #[test]
    fn duplicate_pairs_keep_the_higher_priority_one() {
        let mut cl = CheckList::new(true);
        let cfg = controlling_cfg();

        // Two server-reflexive candidates sharing the same base host rewrite to
        // that host for pairing purposes (§4.1 "Replace base").
        let host = cl.add_local_candidate(CandidateType::Host, addr(1, 5000), 1, None).unwrap();
        cl.add_local_candidate(CandidateType::ServerReflexive, addr(9, 7000), 1, Some(host)).unwrap();
        cl.add_local_candidate(CandidateType::ServerReflexive, addr(9, 7001), 1, Some(host)).unwrap();
        cl.add_remote_candidate(CandidateType::Host, addr(2, 6000), 1, 100, "r0".into()).unwrap();

        cl.form_pairs(&cfg);

        // All three locals rewrite/collapse onto the host base, so only one of
        // the (host, remote) duplicates should survive pruning.
        assert_eq!(cl.pairs.len(), 1);
        assert_eq!(cl.pairs[0].local, host);
    }

    #[test]
    fn first_stream_unfreezes_exactly_one_pair() {
        let mut cl = CheckList::new(true);
        let cfg = controlling_cfg();

        cl.add_local_candidate(CandidateType::Host, addr(1, 5000), 1, None).unwrap();
        cl.add_local_candidate(CandidateType::Host, addr(1, 5001), 2, None).unwrap();
        cl.add_remote_candidate(CandidateType::Host, addr(2, 6000), 1, 100, "r0".into()).unwrap();
        cl.add_remote_candidate(CandidateType::Host, addr(2, 6001), 2, 100, "r1".into()).unwrap();
        cl.form_pairs(&cfg);

        let waiting = cl.pairs.iter().filter(|p| p.state == PairState::Waiting).count();
        let frozen = cl.pairs.iter().filter(|p| p.state == PairState::Frozen).count();
        assert_eq!(waiting, 1);
        assert_eq!(frozen, cl.pairs.len() - 1);
    }

    #[test]
    fn non_first_stream_stays_entirely_frozen() {
        let mut cl = CheckList::new(false);
        let cfg = controlling_cfg();

        cl.add_local_candidate(CandidateType::Host, addr(1, 5000), 1, None).unwrap();
        cl.add_remote_candidate(CandidateType::Host, addr(2, 6000), 1, 100, "r0".into()).unwrap();
        cl.form_pairs(&cfg);

        assert!(cl.pairs.iter().all(|p| p.state == PairState::Frozen));
    }

    #[test]
    fn triggered_queue_never_holds_a_pair_twice() {
        let mut cl = CheckList::new(true);
        let cfg = controlling_cfg();
        cl.add_local_candidate(CandidateType::Host, addr(1, 5000), 1, None).unwrap();
        cl.add_remote_candidate(CandidateType::Host, addr(2, 6000), 1, 100, "r0".into()).unwrap();
        cl.form_pairs(&cfg);

        let id = cl.check_list[0];
        cl.enqueue_triggered(id);
        cl.enqueue_triggered(id);
        assert_eq!(cl.triggered_checks_queue.iter().filter(|&&p| p == id).count(), 1);
    }
}
