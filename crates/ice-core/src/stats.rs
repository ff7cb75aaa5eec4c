//! Debug/diagnostic dump of a check list's current state. Not part of the
//! 1,800-line core budget — kept separate so it can be skipped by a reader
//! only interested in the pair-state machine itself.

use serde::Serialize;

use crate::pair::PairState;
use crate::TransportAddress;

#[derive(Debug, Clone, Serialize)]
pub struct PairSnapshot {
    pub local: TransportAddress,
    pub remote: TransportAddress,
    pub component_id: u16,
    pub priority: u64,
    pub state: &'static str,
    pub is_nominated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckListSnapshot {
    pub state: &'static str,
    pub pairs: Vec<PairSnapshot>,
    pub valid_list: Vec<PairSnapshot>,
}

impl PairSnapshot {
    pub(crate) fn new(
        local: TransportAddress,
        remote: TransportAddress,
        component_id: u16,
        priority: u64,
        state: PairState,
        is_nominated: bool,
    ) -> Self {
        PairSnapshot {
            local,
            remote,
            component_id,
            priority,
            state: state.as_wire_str(),
            is_nominated,
        }
    }
}
