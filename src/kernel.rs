//! Coordination kernel: the agent/work-item state machine.
//!
//! Every public method is a single atomic mutator transaction (plus a
//! best-effort telemetry span and coordination-log append once the
//! mutation has committed). Cross-table operations request locks in the
//! fixed order `agents` -> `work_claims` -> `coordination_log`.

use crate::clock::{new_id, new_trace_id, now_ns};
use crate::config::KernelConfig;
use crate::error::{SwarmError, SwarmResult};
use crate::model::{
    Agent, AgentId, AgentStatus, CoordinationEvent, Priority, SpanStatus, TraceId, WorkId,
    WorkItem, WorkStatus,
};
use crate::mutator::AtomicMutator;
use crate::store::{StateStore, Table};
use crate::telemetry::TelemetryEmitter;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Preference hints passed to `claim_as` to narrow which pending item an
/// agent picks up.
#[derive(Debug, Clone, Default)]
pub struct ClaimSelector {
    pub work_type: Option<String>,
    pub team: Option<String>,
}

impl ClaimSelector {
    fn matches(&self, item: &WorkItem) -> bool {
        if let Some(work_type) = &self.work_type {
            if work_type != &item.work_type {
                return false;
            }
        }
        if let Some(team) = &self.team {
            if item.team.as_deref() != Some(team.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Clone)]
pub struct CoordinationKernel {
    mutator: AtomicMutator,
    telemetry: TelemetryEmitter,
    config: KernelConfig,
}

impl CoordinationKernel {
    pub fn open(config: KernelConfig) -> SwarmResult<Self> {
        let store = StateStore::open(&config.coordination_dir)?;
        let mutator = AtomicMutator::new(store.clone(), &config);
        let telemetry = TelemetryEmitter::new(Arc::new(store), &config);
        Ok(Self { mutator, telemetry, config })
    }

    pub fn from_parts(mutator: AtomicMutator, telemetry: TelemetryEmitter, config: KernelConfig) -> Self {
        Self { mutator, telemetry, config }
    }

    pub fn mutator(&self) -> &AtomicMutator {
        &self.mutator
    }

    pub fn store(&self) -> &StateStore {
        self.mutator.store()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    fn find_agent(&self, agent_id: &str) -> SwarmResult<Agent> {
        self.store()
            .read_agents()?
            .into_iter()
            .find(|a| a.agent_id == agent_id)
            .ok_or_else(|| SwarmError::UnknownAgent { agent_id: agent_id.to_string() })
    }

    fn append_event(
        &self,
        kind: &str,
        actor_agent_id: Option<AgentId>,
        work_id: Option<WorkId>,
        attributes: BTreeMap<String, String>,
    ) -> SwarmResult<()> {
        let event = CoordinationEvent {
            event_id: new_id("event"),
            timestamp_ns: now_ns(),
            actor_agent_id,
            kind: kind.to_string(),
            work_id,
            attributes,
        };
        self.mutator
            .with_table::<CoordinationEvent, ()>(Table::CoordinationLog, |mut rows| {
                rows.push(event);
                Ok((rows, ()))
            })
    }

    fn record_span(
        &self,
        operation: &str,
        trace_id: Option<TraceId>,
        start_time_ns: u64,
        status: SpanStatus,
        attributes: BTreeMap<String, String>,
    ) {
        if let Err(e) = self.telemetry.record_span(operation, trace_id, None, start_time_ns, status, attributes) {
            tracing::warn!(error = %e, operation, "telemetry write failed; kernel operation still committed");
        }
    }

    // -- register ---------------------------------------------------------

    pub fn register(
        &self,
        team: String,
        specialization: String,
        capacity: Option<u32>,
        capabilities: BTreeSet<String>,
    ) -> SwarmResult<AgentId> {
        if team.trim().is_empty() || specialization.trim().is_empty() {
            return Err(SwarmError::UsageError {
                message: "team and specialization must be non-empty".to_string(),
            });
        }
        let capacity = capacity.unwrap_or(Agent::DEFAULT_CAPACITY);
        if capacity < 1 {
            return Err(SwarmError::UsageError { message: "capacity must be >= 1".to_string() });
        }

        let now = now_ns();
        let agent_id = new_id("agent");
        let agent = Agent {
            agent_id: agent_id.clone(),
            team: team.clone(),
            specialization: specialization.clone(),
            capacity,
            max_concurrent_work: Agent::DEFAULT_MAX_CONCURRENT_WORK,
            status: AgentStatus::Active,
            last_heartbeat_ns: now,
            capabilities,
        };

        self.mutator.with_table::<Agent, ()>(Table::Agents, |mut rows| {
            if rows.iter().any(|a| a.agent_id == agent_id) {
                return Err(SwarmError::AlreadyExists { agent_id: agent_id.clone() });
            }
            rows.push(agent);
            Ok((rows, ()))
        })?;

        self.append_event("registered", Some(agent_id.clone()), None, BTreeMap::from([
            ("team".to_string(), team),
            ("specialization".to_string(), specialization),
        ]))?;
        self.record_span("coordination.register", None, now, SpanStatus::Ok, BTreeMap::new());
        Ok(agent_id)
    }

    // -- claim (operator-initiated) ----------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn claim(
        &self,
        work_type: String,
        description: String,
        priority: Priority,
        team: Option<String>,
        required_capabilities: BTreeSet<String>,
        depends_on: BTreeSet<WorkId>,
        preferred_agent: Option<AgentId>,
    ) -> SwarmResult<WorkId> {
        if work_type.trim().is_empty() {
            return Err(SwarmError::UsageError { message: "work_type must be non-empty".to_string() });
        }

        let now = now_ns();
        let work_id = new_id("work");
        let trace_id = new_trace_id();
        let work_id_for_closure = work_id.clone();
        let trace_id_for_closure = trace_id.clone();

        self.mutator.with_table::<WorkItem, ()>(Table::WorkClaims, move |mut rows| {
            let status = if depends_on.is_empty() {
                WorkStatus::Pending
            } else {
                let all_done = depends_on.iter().all(|dep| {
                    rows.iter().any(|r| &r.work_id == dep && r.status == WorkStatus::Completed)
                });
                if all_done { WorkStatus::Pending } else { WorkStatus::Blocked }
            };
            rows.push(WorkItem {
                work_id: work_id_for_closure,
                work_type,
                description,
                priority,
                team,
                required_capabilities,
                preferred_agent,
                depends_on,
                status,
                claimed_by: None,
                created_at_ns: now,
                claimed_at_ns: None,
                started_at_ns: None,
                completed_at_ns: None,
                progress_pct: 0,
                phase: None,
                result: None,
                score: None,
                retry_count: 0,
                trace_id: trace_id_for_closure,
            });
            Ok((rows, ()))
        })?;

        self.append_event("work_created", None, Some(work_id.clone()), BTreeMap::new())?;
        self.record_span("coordination.claim", Some(trace_id), now, SpanStatus::Ok, BTreeMap::new());
        Ok(work_id)
    }

    // -- claim_as (worker-facing) -------------------------------------------

    pub fn claim_as(&self, agent_id: &str, selector: ClaimSelector) -> SwarmResult<WorkId> {
        let agent = self.find_agent(agent_id)?;
        let now = now_ns();

        let claimed = self.mutator.with_table::<WorkItem, Option<(WorkId, TraceId)>>(
            Table::WorkClaims,
            move |mut rows| {
                let active_count = rows
                    .iter()
                    .filter(|r| r.claimed_by.as_deref() == Some(agent_id) && r.status.is_active_claim())
                    .count() as u32;
                if active_count >= agent.max_concurrent_work {
                    return Err(SwarmError::CapacityExceeded {
                        agent_id: agent_id.to_string(),
                        max_concurrent_work: agent.max_concurrent_work,
                    });
                }

                let mut eligible: Vec<usize> = rows
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.status == WorkStatus::Pending && r.eligible_for(&agent) && selector.matches(r))
                    .map(|(i, _)| i)
                    .collect();

                if eligible.is_empty() {
                    return Ok((rows, None));
                }

                eligible.sort_by(|&a, &b| {
                    let ra = &rows[a];
                    let rb = &rows[b];
                    rb.priority
                        .rank()
                        .cmp(&ra.priority.rank())
                        .then_with(|| {
                            let a_pref = ra.preferred_agent.as_deref() == Some(agent_id);
                            let b_pref = rb.preferred_agent.as_deref() == Some(agent_id);
                            b_pref.cmp(&a_pref)
                        })
                        .then_with(|| ra.created_at_ns.cmp(&rb.created_at_ns))
                });

                let idx = eligible[0];
                rows[idx].status = WorkStatus::Claimed;
                rows[idx].claimed_by = Some(agent_id.to_string());
                rows[idx].claimed_at_ns = Some(now);
                let outcome = (rows[idx].work_id.clone(), rows[idx].trace_id.clone());
                Ok((rows, Some(outcome)))
            },
        )?;

        match claimed {
            Some((work_id, trace_id)) => {
                self.append_event(
                    "claimed",
                    Some(agent_id.to_string()),
                    Some(work_id.clone()),
                    BTreeMap::new(),
                )?;
                self.record_span("coordination.claim_as", Some(trace_id), now, SpanStatus::Ok, BTreeMap::from([("swarmsh.agent.id".to_string(), agent_id.to_string())]));
                Ok(work_id)
            }
            None => Err(SwarmError::NoEligibleWork { agent_id: agent_id.to_string() }),
        }
    }

    // -- progress ------------------------------------------------------------

    pub fn progress(&self, work_id: &str, agent_id: &str, pct: u8, phase: Option<String>) -> SwarmResult<()> {
        let now = now_ns();
        let work_id_owned = work_id.to_string();
        let agent_id_owned = agent_id.to_string();

        let trace_id = self.mutator.with_table::<WorkItem, TraceId>(Table::WorkClaims, move |mut rows| {
            let item = rows
                .iter_mut()
                .find(|r| r.work_id == work_id_owned)
                .ok_or_else(|| SwarmError::UnknownWorkItem { work_id: work_id_owned.clone() })?;

            if item.claimed_by.as_deref() != Some(agent_id_owned.as_str()) {
                return Err(SwarmError::NotClaimant { work_id: work_id_owned.clone(), agent_id: agent_id_owned.clone() });
            }
            if item.status.is_terminal() {
                return Err(SwarmError::MonotonicityViolation {
                    work_id: work_id_owned.clone(),
                    message: "work item already in a terminal state".to_string(),
                });
            }
            if pct < item.progress_pct {
                return Err(SwarmError::MonotonicityViolation {
                    work_id: work_id_owned.clone(),
                    message: format!("progress_pct regressed from {} to {pct}", item.progress_pct),
                });
            }

            if item.status == WorkStatus::Claimed {
                item.status = WorkStatus::InProgress;
                item.started_at_ns = Some(now);
            }
            item.progress_pct = pct;
            if let Some(phase) = phase {
                item.phase = Some(phase);
            }
            let trace_id = item.trace_id.clone();
            Ok((rows, trace_id))
        })?;

        self.append_event("progressed", Some(agent_id.to_string()), Some(work_id.to_string()), BTreeMap::new())?;
        self.record_span("coordination.progress", Some(trace_id), now, SpanStatus::Ok, BTreeMap::from([("swarmsh.agent.id".to_string(), agent_id.to_string())]));
        Ok(())
    }

    // -- complete --------------------------------------------------------------

    pub fn complete(&self, work_id: &str, agent_id: &str, result: String, score: Option<i64>) -> SwarmResult<()> {
        let now = now_ns();
        let work_id_owned = work_id.to_string();
        let agent_id_owned = agent_id.to_string();

        let (trace_id, started_at_ns) = self.mutator.with_table::<WorkItem, (TraceId, Option<u64>)>(
            Table::WorkClaims,
            move |mut rows| {
                let idx = rows
                    .iter()
                    .position(|r| r.work_id == work_id_owned)
                    .ok_or_else(|| SwarmError::UnknownWorkItem { work_id: work_id_owned.clone() })?;

                if rows[idx].claimed_by.as_deref() != Some(agent_id_owned.as_str()) {
                    return Err(SwarmError::NotClaimant { work_id: work_id_owned.clone(), agent_id: agent_id_owned.clone() });
                }
                if rows[idx].status.is_terminal() {
                    return Err(SwarmError::MonotonicityViolation {
                        work_id: work_id_owned.clone(),
                        message: "work item already in a terminal state".to_string(),
                    });
                }

                rows[idx].status = WorkStatus::Completed;
                rows[idx].completed_at_ns = Some(now);
                rows[idx].result = Some(result);
                rows[idx].score = score;
                rows[idx].progress_pct = 100;

                let trace_id = rows[idx].trace_id.clone();
                let started_at_ns = rows[idx].started_at_ns;
                let completed_work_id = rows[idx].work_id.clone();

                // Re-evaluate dependents blocked on this item, inside the
                // same locked section.
                let statuses: BTreeMap<WorkId, WorkStatus> =
                    rows.iter().map(|r| (r.work_id.clone(), r.status)).collect();
                for item in rows.iter_mut() {
                    if item.status == WorkStatus::Blocked
                        && item.depends_on.contains(&completed_work_id)
                        && item
                            .depends_on
                            .iter()
                            .all(|dep| statuses.get(dep).copied() == Some(WorkStatus::Completed))
                    {
                        item.status = WorkStatus::Pending;
                    }
                }

                Ok((rows, (trace_id, started_at_ns)))
            },
        )?;

        self.append_event("completed", Some(agent_id.to_string()), Some(work_id.to_string()), BTreeMap::new())?;
        let start_for_span = started_at_ns.unwrap_or(now);
        self.record_span("coordination.complete", Some(trace_id), start_for_span, SpanStatus::Ok, BTreeMap::from([("swarmsh.agent.id".to_string(), agent_id.to_string())]));
        Ok(())
    }

    // -- fail ---------------------------------------------------------------

    pub fn fail(&self, work_id: &str, agent_id: &str, reason: String, retriable: bool) -> SwarmResult<()> {
        let now = now_ns();
        let work_id_owned = work_id.to_string();
        let agent_id_owned = agent_id.to_string();
        let max_retries = self.config.max_retries;

        let (trace_id, will_retry) = self.mutator.with_table::<WorkItem, (TraceId, bool)>(
            Table::WorkClaims,
            move |mut rows| {
                let item = rows
                    .iter_mut()
                    .find(|r| r.work_id == work_id_owned)
                    .ok_or_else(|| SwarmError::UnknownWorkItem { work_id: work_id_owned.clone() })?;

                if item.claimed_by.as_deref() != Some(agent_id_owned.as_str()) {
                    return Err(SwarmError::NotClaimant { work_id: work_id_owned.clone(), agent_id: agent_id_owned.clone() });
                }
                if item.status.is_terminal() {
                    return Err(SwarmError::MonotonicityViolation {
                        work_id: work_id_owned.clone(),
                        message: "work item already in a terminal state".to_string(),
                    });
                }

                let will_retry = retriable && item.retry_count < max_retries;
                if will_retry {
                    item.retry_count += 1;
                    item.claimed_by = None;
                    item.claimed_at_ns = None;
                    item.started_at_ns = None;
                    item.progress_pct = 0;
                    item.phase = None;
                    item.status = WorkStatus::Pending;
                } else {
                    item.status = WorkStatus::Failed;
                    item.result = Some(reason.clone());
                }

                let trace_id = item.trace_id.clone();
                Ok((rows, (trace_id, will_retry)))
            },
        )?;

        let kind = if will_retry { "retrying" } else { "failed" };
        self.append_event(
            kind,
            Some(agent_id.to_string()),
            Some(work_id.to_string()),
            BTreeMap::from([("reason".to_string(), reason)]),
        )?;
        self.record_span("coordination.fail", Some(trace_id), now, SpanStatus::Error, BTreeMap::from([("swarmsh.agent.id".to_string(), agent_id.to_string())]));
        Ok(())
    }

    // -- heartbeat ------------------------------------------------------------

    pub fn heartbeat(&self, agent_id: &str) -> SwarmResult<()> {
        let now = now_ns();
        let grace_ns = self.config.recovery_grace.as_nanos() as u64;
        let agent_id_owned = agent_id.to_string();

        self.mutator.with_table::<Agent, ()>(Table::Agents, move |mut rows| {
            let agent = rows
                .iter_mut()
                .find(|a| a.agent_id == agent_id_owned)
                .ok_or_else(|| SwarmError::UnknownAgent { agent_id: agent_id_owned.clone() })?;

            let previous_heartbeat = agent.last_heartbeat_ns;
            match agent.status {
                AgentStatus::Unhealthy => agent.status = AgentStatus::Recovering,
                AgentStatus::Recovering if now.saturating_sub(previous_heartbeat) >= grace_ns => {
                    agent.status = AgentStatus::Active;
                }
                _ => {}
            }
            agent.last_heartbeat_ns = now;
            Ok((rows, ()))
        })?;

        self.record_span("coordination.heartbeat", None, now, SpanStatus::Ok, BTreeMap::from([("swarmsh.agent.id".to_string(), agent_id.to_string())]));
        Ok(())
    }

    // -- reassign -------------------------------------------------------------

    pub fn reassign(&self, work_id: &str, new_agent_id: Option<AgentId>) -> SwarmResult<()> {
        let now = now_ns();
        let new_agent = match &new_agent_id {
            Some(id) => Some(self.find_agent(id)?),
            None => None,
        };
        let work_id_owned = work_id.to_string();

        let trace_id = self.mutator.with_table::<WorkItem, TraceId>(Table::WorkClaims, move |mut rows| {
            let idx = rows
                .iter()
                .position(|r| r.work_id == work_id_owned)
                .ok_or_else(|| SwarmError::UnknownWorkItem { work_id: work_id_owned.clone() })?;

            rows[idx].claimed_by = None;
            rows[idx].status = WorkStatus::Pending;

            if let Some(agent) = &new_agent {
                if !rows[idx].eligible_for(agent) {
                    return Err(SwarmError::EligibilityViolation {
                        work_id: work_id_owned.clone(),
                        message: "reassignment target is not eligible for this work item".to_string(),
                    });
                }
                let active_count = rows
                    .iter()
                    .filter(|r| r.claimed_by.as_deref() == Some(agent.agent_id.as_str()) && r.status.is_active_claim())
                    .count() as u32;
                if active_count >= agent.max_concurrent_work {
                    return Err(SwarmError::CapacityExceeded {
                        agent_id: agent.agent_id.clone(),
                        max_concurrent_work: agent.max_concurrent_work,
                    });
                }
                rows[idx].status = WorkStatus::Claimed;
                rows[idx].claimed_by = Some(agent.agent_id.clone());
                rows[idx].claimed_at_ns = Some(now);
            }

            let trace_id = rows[idx].trace_id.clone();
            Ok((rows, trace_id))
        })?;

        self.append_event("reassigned", new_agent_id, Some(work_id.to_string()), BTreeMap::new())?;
        self.record_span("coordination.reassign", Some(trace_id), now, SpanStatus::Ok, BTreeMap::new());
        Ok(())
    }

    // -- deregister (SUPPLEMENT) ------------------------------------------------

    /// Retire an agent. The record is kept (status `shutdown`) rather than
    /// deleted, so historical `claimed_by` references in `work_claims`
    /// remain resolvable. Requires the agent hold no claims in
    /// {`claimed`,`in_progress`} — callers must `reassign` those first.
    pub fn deregister(&self, agent_id: &str) -> SwarmResult<()> {
        let now = now_ns();
        let active_claims = self
            .store()
            .read_work_claims()?
            .iter()
            .filter(|w| w.claimed_by.as_deref() == Some(agent_id) && w.status.is_active_claim())
            .count() as u32;
        if active_claims > 0 {
            return Err(SwarmError::ActiveClaimsPresent { agent_id: agent_id.to_string(), count: active_claims });
        }

        let agent_id_owned = agent_id.to_string();
        self.mutator.with_table::<Agent, ()>(Table::Agents, move |mut rows| {
            let agent = rows
                .iter_mut()
                .find(|a| a.agent_id == agent_id_owned)
                .ok_or_else(|| SwarmError::UnknownAgent { agent_id: agent_id_owned.clone() })?;
            agent.status = AgentStatus::Shutdown;
            Ok((rows, ()))
        })?;

        self.append_event("deregistered", Some(agent_id.to_string()), None, BTreeMap::new())?;
        self.record_span("coordination.deregister", None, now, SpanStatus::Ok, BTreeMap::new());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel_in(dir: &std::path::Path) -> CoordinationKernel {
        CoordinationKernel::open(KernelConfig::for_dir(dir)).unwrap()
    }

    #[test]
    fn register_then_claim_as_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = kernel_in(dir.path());
        let agent_id = kernel.register("core".into(), "integration".into(), None, BTreeSet::new()).unwrap();
        let work_id = kernel
            .claim("migrate".into(), "migrate table".into(), Priority::High, None, BTreeSet::new(), BTreeSet::new(), None)
            .unwrap();

        let claimed = kernel.claim_as(&agent_id, ClaimSelector::default()).unwrap();
        assert_eq!(claimed, work_id);

        let items = kernel.store().read_work_claims().unwrap();
        assert_eq!(items[0].status, WorkStatus::Claimed);
        assert_eq!(items[0].claimed_by.as_deref(), Some(agent_id.as_str()));
    }

    #[test]
    fn second_claim_as_sees_no_eligible_work() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = kernel_in(dir.path());
        let a1 = kernel.register("T".into(), "x".into(), None, BTreeSet::new()).unwrap();
        let a2 = kernel.register("T".into(), "x".into(), None, BTreeSet::new()).unwrap();
        kernel
            .claim("t".into(), "d".into(), Priority::High, Some("T".into()), BTreeSet::new(), BTreeSet::new(), None)
            .unwrap();

        kernel.claim_as(&a1, ClaimSelector::default()).unwrap();
        let err = kernel.claim_as(&a2, ClaimSelector::default()).unwrap_err();
        assert!(matches!(err, SwarmError::NoEligibleWork { .. }));
    }

    #[test]
    fn dependency_gating_blocks_until_dependency_completes() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = kernel_in(dir.path());
        let agent = kernel.register("T".into(), "x".into(), None, BTreeSet::new()).unwrap();
        let w1 = kernel
            .claim("t".into(), "first".into(), Priority::High, None, BTreeSet::new(), BTreeSet::new(), None)
            .unwrap();
        let w2 = kernel
            .claim(
                "t".into(),
                "second".into(),
                Priority::High,
                None,
                BTreeSet::new(),
                BTreeSet::from([w1.clone()]),
                None,
            )
            .unwrap();

        let items = kernel.store().read_work_claims().unwrap();
        let w2_item = items.iter().find(|i| i.work_id == w2).unwrap();
        assert_eq!(w2_item.status, WorkStatus::Blocked);

        assert_eq!(kernel.claim_as(&agent, ClaimSelector::default()).unwrap(), w1);
        kernel.complete(&w1, &agent, "done".into(), None).unwrap();

        let claimed_second = kernel.claim_as(&agent, ClaimSelector::default()).unwrap();
        assert_eq!(claimed_second, w2);
    }

    #[test]
    fn progress_rejects_regression() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = kernel_in(dir.path());
        let agent = kernel.register("T".into(), "x".into(), None, BTreeSet::new()).unwrap();
        let work_id = kernel
            .claim("t".into(), "d".into(), Priority::Medium, None, BTreeSet::new(), BTreeSet::new(), None)
            .unwrap();
        kernel.claim_as(&agent, ClaimSelector::default()).unwrap();

        kernel.progress(&work_id, &agent, 50, None).unwrap();
        let err = kernel.progress(&work_id, &agent, 30, None).unwrap_err();
        assert!(matches!(err, SwarmError::MonotonicityViolation { .. }));

        let items = kernel.store().read_work_claims().unwrap();
        assert_eq!(items[0].progress_pct, 50);
    }

    #[test]
    fn capacity_bound_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = kernel_in(dir.path());
        let agent = kernel.register("T".into(), "x".into(), None, BTreeSet::new()).unwrap();
        for i in 0..3 {
            kernel
                .claim(format!("t{i}"), "d".into(), Priority::Low, None, BTreeSet::new(), BTreeSet::new(), None)
                .unwrap();
            kernel.claim_as(&agent, ClaimSelector::default()).unwrap();
        }
        kernel
            .claim("overflow".into(), "d".into(), Priority::Low, None, BTreeSet::new(), BTreeSet::new(), None)
            .unwrap();
        let err = kernel.claim_as(&agent, ClaimSelector::default()).unwrap_err();
        assert!(matches!(err, SwarmError::CapacityExceeded { .. }));
    }

    #[test]
    fn deregister_rejects_agent_with_active_claims() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = kernel_in(dir.path());
        let agent = kernel.register("T".into(), "x".into(), None, BTreeSet::new()).unwrap();
        let work_id = kernel
            .claim("t".into(), "d".into(), Priority::Medium, None, BTreeSet::new(), BTreeSet::new(), None)
            .unwrap();
        kernel.claim_as(&agent, ClaimSelector::default()).unwrap();

        let err = kernel.deregister(&agent).unwrap_err();
        assert!(matches!(err, SwarmError::ActiveClaimsPresent { count: 1, .. }));

        let items = kernel.store().read_work_claims().unwrap();
        assert_eq!(items.iter().find(|w| w.work_id == work_id).unwrap().status, WorkStatus::Claimed);
        let agents = kernel.store().read_agents().unwrap();
        assert_ne!(agents.iter().find(|a| a.agent_id == agent).unwrap().status, AgentStatus::Shutdown);

        kernel.complete(&work_id, &agent, "done".into(), None).unwrap();
        kernel.deregister(&agent).unwrap();
        let agents = kernel.store().read_agents().unwrap();
        assert_eq!(agents.iter().find(|a| a.agent_id == agent).unwrap().status, AgentStatus::Shutdown);
    }

    #[test]
    fn fail_retriable_returns_item_to_pending() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = kernel_in(dir.path());
        let agent = kernel.register("T".into(), "x".into(), None, BTreeSet::new()).unwrap();
        let work_id = kernel
            .claim("t".into(), "d".into(), Priority::Medium, None, BTreeSet::new(), BTreeSet::new(), None)
            .unwrap();
        kernel.claim_as(&agent, ClaimSelector::default()).unwrap();

        kernel.fail(&work_id, &agent, "transient".into(), true).unwrap();
        let items = kernel.store().read_work_claims().unwrap();
        assert_eq!(items[0].status, WorkStatus::Pending);
        assert_eq!(items[0].retry_count, 1);

        let reclaimed = kernel.claim_as(&agent, ClaimSelector::default()).unwrap();
        assert_eq!(reclaimed, work_id);
    }

    #[test]
    fn heartbeat_promotes_recovering_agent_after_grace_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KernelConfig::for_dir(dir.path());
        config.recovery_grace = std::time::Duration::from_nanos(1);
        let kernel = CoordinationKernel::open(config).unwrap();
        let agent_id = kernel.register("T".into(), "x".into(), None, BTreeSet::new()).unwrap();

        kernel.mutator().with_table::<Agent, ()>(Table::Agents, |mut rows| {
            rows[0].status = AgentStatus::Unhealthy;
            Ok((rows, ()))
        }).unwrap();

        kernel.heartbeat(&agent_id).unwrap();
        let agents = kernel.store().read_agents().unwrap();
        assert_eq!(agents[0].status, AgentStatus::Recovering);

        std::thread::sleep(std::time::Duration::from_millis(2));
        kernel.heartbeat(&agent_id).unwrap();
        let agents = kernel.store().read_agents().unwrap();
        assert_eq!(agents[0].status, AgentStatus::Active);
    }
}
