//! Fast-path claim log: a bounded append-only sidecar that absorbs
//! high-frequency claim intents without paying the full read-modify-write
//! cost of the primary `work_claims` table.

use crate::clock::{new_id, new_trace_id, now_ns};
use crate::error::SwarmResult;
use crate::model::{Priority, WorkId, WorkItem, WorkStatus};
use crate::store::StateStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Default number of most-recent entries retained in the log after a
/// successful compaction.
pub const RETAINED_AFTER_COMPACTION: usize = 50;

/// One line of the fast-path log: everything needed to reconstruct the
/// provisional work item on replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastPathRecord {
    pub work_id: WorkId,
    pub work_type: String,
    pub description: String,
    pub priority: Priority,
    pub team: Option<String>,
    pub required_capabilities: BTreeSet<String>,
    pub preferred_agent: Option<String>,
    pub depends_on: BTreeSet<WorkId>,
    pub created_at_ns: u64,
    pub trace_id: String,
}

impl FastPathRecord {
    fn into_work_item(self, status: WorkStatus) -> WorkItem {
        WorkItem {
            work_id: self.work_id,
            work_type: self.work_type,
            description: self.description,
            priority: self.priority,
            team: self.team,
            required_capabilities: self.required_capabilities,
            preferred_agent: self.preferred_agent,
            depends_on: self.depends_on,
            status,
            claimed_by: None,
            created_at_ns: self.created_at_ns,
            claimed_at_ns: None,
            started_at_ns: None,
            completed_at_ns: None,
            progress_pct: 0,
            phase: None,
            result: None,
            score: None,
            retry_count: 0,
            trace_id: self.trace_id,
        }
    }
}

/// Append a claim intent to the fast-path log, returning the provisional
/// `work_id` immediately. No table lock is taken; the record is reconciled
/// into `work_claims` by [`replay`].
#[allow(clippy::too_many_arguments)]
pub fn claim_fast(
    store: &StateStore,
    work_type: String,
    description: String,
    priority: Priority,
    team: Option<String>,
    required_capabilities: BTreeSet<String>,
    depends_on: BTreeSet<WorkId>,
    preferred_agent: Option<String>,
) -> SwarmResult<WorkId> {
    let record = FastPathRecord {
        work_id: new_id("work"),
        work_type,
        description,
        priority,
        team,
        required_capabilities,
        preferred_agent,
        depends_on,
        created_at_ns: now_ns(),
        trace_id: new_trace_id(),
    };
    let line = serde_json::to_string(&record)?;
    store.append_fast_path_record(&line)?;
    Ok(record.work_id)
}

/// Outcome of replaying one fast-path record into the primary table.
pub struct ReplayOutcome {
    pub accepted: usize,
    pub rejected: Vec<(WorkId, String)>,
}

/// Replay every unreplayed line into `work_claims` under the atomic
/// mutator, preserving append order and enforcing the same invariants a
/// direct `claim` call would. Accepted lines are dropped from the log;
/// the most recent [`RETAINED_AFTER_COMPACTION`] lines are always kept
/// regardless of replay outcome so late-arriving duplicates have a
/// reference window.
pub fn replay(kernel: &crate::kernel::CoordinationKernel) -> SwarmResult<ReplayOutcome> {
    let store = kernel.store();
    let lines = store.read_fast_path_lines()?;
    let mut rejected = Vec::new();
    let mut accepted = 0usize;

    let records: Vec<FastPathRecord> = lines
        .iter()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();

    for record in &records {
        let work_id = record.work_id.clone();
        let result = kernel.mutator().with_table::<WorkItem, ()>(
            crate::store::Table::WorkClaims,
            |mut rows| {
                if rows.iter().any(|r| r.work_id == work_id) {
                    // Already replayed in a prior run; treat as accepted.
                    return Ok((rows, ()));
                }
                let status = if record_deps_satisfied(record, &rows) {
                    WorkStatus::Pending
                } else {
                    WorkStatus::Blocked
                };
                rows.push(record.clone().into_work_item(status));
                Ok((rows, ()))
            },
        );

        match result {
            Ok(()) => accepted += 1,
            Err(e) => rejected.push((record.work_id.clone(), e.to_string())),
        }
    }

    let retained: Vec<String> = lines
        .into_iter()
        .rev()
        .take(RETAINED_AFTER_COMPACTION)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    store.rewrite_fast_path_log(&retained)?;

    Ok(ReplayOutcome { accepted, rejected })
}

fn record_deps_satisfied(record: &FastPathRecord, rows: &[WorkItem]) -> bool {
    record
        .depends_on
        .iter()
        .all(|dep| rows.iter().any(|r| &r.work_id == dep && r.status == WorkStatus::Completed))
}
