//! Execution records
//!
//! One record per signal id, created before any network effect, with an
//! append-only transition log that is strictly monotonic in the state
//! order. Records live for the process lifetime; persistence is an external
//! collaborator.

use alloy::primitives::B256;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::errors::RejectReason;

/// Execution state machine.
///
/// ```text
/// RECEIVED -> VALIDATED -> SIMULATED -> SUBMITTED -> CONFIRMED
///                                                 -> REVERTED
///          -> REJECTED (any guard fails)
///          -> EXPIRED  (past deadline)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecState {
    Received,
    Validated,
    Simulated,
    Submitted,
    Confirmed,
    Reverted,
    Rejected,
    Expired,
}

impl ExecState {
    /// Position in the linear order; all terminal states rank last so a
    /// transition log is monotonic exactly when each step moves forward.
    pub fn order(&self) -> u8 {
        match self {
            ExecState::Received => 0,
            ExecState::Validated => 1,
            ExecState::Simulated => 2,
            ExecState::Submitted => 3,
            ExecState::Confirmed | ExecState::Reverted | ExecState::Rejected | ExecState::Expired => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.order() == 4
    }

    pub fn tag(&self) -> &'static str {
        match self {
            ExecState::Received => "RECEIVED",
            ExecState::Validated => "VALIDATED",
            ExecState::Simulated => "SIMULATED",
            ExecState::Submitted => "SUBMITTED",
            ExecState::Confirmed => "CONFIRMED",
            ExecState::Reverted => "REVERTED",
            ExecState::Rejected => "REJECTED",
            ExecState::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for ExecState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub state: ExecState,
    pub at: DateTime<Utc>,
}

/// Mutable record for one signal. Single-writer (the engine task owning the
/// signal); the supervisor reads immutable snapshots.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub signal_id: Uuid,
    pub state: ExecState,
    pub transitions: Vec<Transition>,
    pub tx_hash: Option<B256>,
    pub final_net_profit_usd: Option<Decimal>,
    pub failure_reason: Option<RejectReason>,
}

impl ExecutionRecord {
    fn new(signal_id: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            signal_id,
            state: ExecState::Received,
            transitions: vec![Transition { state: ExecState::Received, at }],
            tx_hash: None,
            final_net_profit_usd: None,
            failure_reason: None,
        }
    }

    /// Append a transition. Only forward moves are legal; a violation is a
    /// programming error surfaced loudly in logs and refused.
    fn transition(&mut self, to: ExecState, at: DateTime<Utc>) -> bool {
        if self.state.is_terminal() || to.order() <= self.state.order() {
            tracing::error!(
                signal = %self.signal_id,
                from = %self.state,
                to = %to,
                "illegal state transition refused"
            );
            return false;
        }
        self.state = to;
        self.transitions.push(Transition { state: to, at });
        true
    }
}

/// All execution records, keyed by signal id. At most one record per id.
#[derive(Default)]
pub struct RecordStore {
    records: DashMap<Uuid, ExecutionRecord>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the record for a signal. `Err` means the id was already seen;
    /// the caller must reject the duplicate without side effects.
    pub fn create(&self, signal_id: Uuid, at: DateTime<Utc>) -> Result<(), ()> {
        match self.records.entry(signal_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ExecutionRecord::new(signal_id, at));
                Ok(())
            }
        }
    }

    pub fn transition(&self, signal_id: Uuid, to: ExecState, at: DateTime<Utc>) -> bool {
        self.records
            .get_mut(&signal_id)
            .map(|mut record| record.transition(to, at))
            .unwrap_or(false)
    }

    pub fn set_tx_hash(&self, signal_id: Uuid, hash: B256) {
        if let Some(mut record) = self.records.get_mut(&signal_id) {
            record.tx_hash = Some(hash);
        }
    }

    pub fn set_final_profit(&self, signal_id: Uuid, profit: Decimal) {
        if let Some(mut record) = self.records.get_mut(&signal_id) {
            record.final_net_profit_usd = Some(profit);
        }
    }

    pub fn set_failure(&self, signal_id: Uuid, reason: RejectReason) {
        if let Some(mut record) = self.records.get_mut(&signal_id) {
            record.failure_reason = Some(reason);
        }
    }

    pub fn get(&self, signal_id: Uuid) -> Option<ExecutionRecord> {
        self.records.get(&signal_id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Immutable snapshot for the metrics surface.
    pub fn snapshot(&self) -> Vec<ExecutionRecord> {
        self.records.iter().map(|r| r.clone()).collect()
    }
}
