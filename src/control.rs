//! Control loops: health scan, compactor, rebalancer, stale-claim reaper.
//! Each loop is a plain function a scheduler (or a manual CLI trigger)
//! calls periodically; none of them bypass the kernel or the atomic
//! mutator.

use crate::clock::now_ns;
use crate::config::HealthWeights;
use crate::error::SwarmResult;
use crate::fast_path;
use crate::kernel::CoordinationKernel;
use crate::model::{Agent, AgentStatus, CoordinationEvent, SpanStatus, WorkStatus};
use crate::store::Table;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-agent health score and its inputs. The formula is a configured
/// weighted sum:
///
/// `score = 100 * (w_hb * heartbeat_freshness + w_span * span_success_rate + w_load * load_headroom)`
///
/// each term clamped to `[0, 1]` before weighting, so the final score is
/// always in `[0, 100]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub agent_id: String,
    pub score: u8,
    pub heartbeat_freshness: f64,
    pub span_success_rate: f64,
    pub load_headroom: f64,
    pub marked_unhealthy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at_ns: u64,
    /// Human-readable mirror of `generated_at_ns`, for operators reading
    /// `system_health_report.json` directly rather than through the CLI.
    pub generated_at_iso: String,
    pub agents: Vec<AgentHealth>,
}

fn to_rfc3339(now_ns: u64) -> String {
    chrono::DateTime::from_timestamp(
        (now_ns / 1_000_000_000) as i64,
        (now_ns % 1_000_000_000) as u32,
    )
    .map(|dt| dt.to_rfc3339())
    .unwrap_or_default()
}

fn score_agent(
    agent: &Agent,
    now: u64,
    heartbeat_interval_ns: u64,
    active_claims: u32,
    recent_spans: &[crate::model::TelemetrySpan],
    weights: &HealthWeights,
) -> AgentHealth {
    let staleness = now.saturating_sub(agent.last_heartbeat_ns) as f64;
    let heartbeat_freshness = (1.0 - (staleness / (heartbeat_interval_ns as f64 * 3.0))).clamp(0.0, 1.0);

    let agent_spans: Vec<_> = recent_spans
        .iter()
        .filter(|s| s.attributes.get("swarmsh.agent.id").map(String::as_str) == Some(agent.agent_id.as_str()))
        .collect();
    let span_success_rate = if agent_spans.is_empty() {
        1.0
    } else {
        let ok = agent_spans.iter().filter(|s| s.status == SpanStatus::Ok).count();
        ok as f64 / agent_spans.len() as f64
    };

    let load_headroom = if agent.max_concurrent_work == 0 {
        0.0
    } else {
        (1.0 - (active_claims as f64 / agent.max_concurrent_work as f64)).clamp(0.0, 1.0)
    };

    let weighted = weights.heartbeat_freshness * heartbeat_freshness
        + weights.span_success_rate * span_success_rate
        + weights.load_headroom * load_headroom;
    let score = (weighted * 100.0).clamp(0.0, 100.0) as u8;

    AgentHealth {
        agent_id: agent.agent_id.clone(),
        score,
        heartbeat_freshness,
        span_success_rate,
        load_headroom,
        marked_unhealthy: false,
    }
}

/// Score every agent, mark the stale ones `unhealthy`, reassign their
/// in-flight work, and persist a `system_health_report.json` snapshot.
pub fn health_scan(kernel: &CoordinationKernel) -> SwarmResult<HealthReport> {
    let now = now_ns();
    let config = kernel.config();
    let heartbeat_interval_ns = config.heartbeat_interval.as_nanos() as u64;
    let unhealthy_after = heartbeat_interval_ns * config.unhealthy_after_missed_heartbeats as u64;

    let agents = kernel.store().read_agents()?;
    let work = kernel.store().read_work_claims()?;
    let recent_spans = kernel.store().read_telemetry_spans()?;

    let mut to_reassign = Vec::new();
    let mut health_entries = Vec::new();

    for agent in &agents {
        let active_claims = work
            .iter()
            .filter(|w| w.claimed_by.as_deref() == Some(agent.agent_id.as_str()) && w.status.is_active_claim())
            .count() as u32;

        let mut health = score_agent(agent, now, heartbeat_interval_ns, active_claims, &recent_spans, &config.health_weights);

        let stale = now.saturating_sub(agent.last_heartbeat_ns) > unhealthy_after;
        if stale && agent.status != AgentStatus::Shutdown {
            health.marked_unhealthy = true;
            kernel.mutator().with_table::<Agent, ()>(Table::Agents, {
                let agent_id = agent.agent_id.clone();
                move |mut rows| {
                    if let Some(a) = rows.iter_mut().find(|a| a.agent_id == agent_id) {
                        a.status = AgentStatus::Unhealthy;
                    }
                    Ok((rows, ()))
                }
            })?;

            for w in &work {
                if w.claimed_by.as_deref() == Some(agent.agent_id.as_str()) && w.status.is_active_claim() {
                    to_reassign.push(w.work_id.clone());
                }
            }
        }

        health_entries.push(health);
    }

    for work_id in &to_reassign {
        kernel.reassign(work_id, None)?;
    }

    let report = HealthReport { generated_at_ns: now, generated_at_iso: to_rfc3339(now), agents: health_entries };
    kernel.store().write_health_report(&report)?;
    append_control_event(kernel, "health_report", BTreeMap::from([
        ("unhealthy_count".to_string(), to_reassign.len().to_string()),
    ]))?;
    Ok(report)
}

/// Replay the fast-path log, segment the telemetry journal once it grows
/// past `segment_threshold` entries, and archive terminal work items past
/// `retention_window_ns`.
pub fn compact(
    kernel: &CoordinationKernel,
    segment_threshold: usize,
    retention_window_ns: u64,
) -> SwarmResult<fast_path::ReplayOutcome> {
    let outcome = fast_path::replay(kernel)?;

    let spans = kernel.store().read_telemetry_spans()?;
    if spans.len() > segment_threshold {
        segment_telemetry_journal(kernel, segment_threshold)?;
    }

    let now = now_ns();
    let work = kernel.store().read_work_claims()?;
    let (archivable, remaining): (Vec<_>, Vec<_>) = work.into_iter().partition(|w| {
        w.status.is_terminal()
            && w.completed_at_ns.map(|t| now.saturating_sub(t) > retention_window_ns).unwrap_or(false)
    });

    if !archivable.is_empty() {
        let archive_path = kernel.store().archive_dir().join(format!("work_claims_{now}.json"));
        let json = serde_json::to_string_pretty(&archivable)?;
        std::fs::write(archive_path, json)?;
        kernel.mutator().with_table::<crate::model::WorkItem, ()>(Table::WorkClaims, move |_| Ok((remaining, ())))?;
        append_control_event(kernel, "archived", BTreeMap::from([
            ("count".to_string(), archivable.len().to_string()),
        ]))?;
    }

    append_control_event(kernel, "compacted", BTreeMap::from([
        ("fast_path_accepted".to_string(), outcome.accepted.to_string()),
        ("fast_path_rejected".to_string(), outcome.rejected.len().to_string()),
    ]))?;
    Ok(outcome)
}

fn segment_telemetry_journal(kernel: &CoordinationKernel, segment_threshold: usize) -> SwarmResult<()> {
    let spans = kernel.store().read_telemetry_spans()?;
    let now = now_ns();
    let (to_archive, to_keep) = spans.split_at(spans.len().saturating_sub(segment_threshold / 2));

    let archive_path = kernel.store().archive_dir().join(format!("telemetry_spans_{now}.jsonl"));
    let mut archived = String::new();
    for span in to_archive {
        archived.push_str(&serde_json::to_string(span)?);
        archived.push('\n');
    }
    std::fs::write(archive_path, archived)?;

    let mut rewritten = String::new();
    for span in to_keep {
        rewritten.push_str(&serde_json::to_string(span)?);
        rewritten.push('\n');
    }
    std::fs::write(kernel.store().telemetry_journal_path(), rewritten)?;
    Ok(())
}

/// Compute per-team load (active claims / total capacity) and reassign
/// work from saturated teams to idle ones, respecting team and capability
/// eligibility.
pub fn rebalance(kernel: &CoordinationKernel) -> SwarmResult<usize> {
    let agents = kernel.store().read_agents()?;
    let work = kernel.store().read_work_claims()?;

    let mut team_capacity: BTreeMap<String, u32> = BTreeMap::new();
    let mut team_load: BTreeMap<String, u32> = BTreeMap::new();
    for agent in &agents {
        if agent.status == AgentStatus::Shutdown {
            continue;
        }
        *team_capacity.entry(agent.team.clone()).or_default() += agent.max_concurrent_work;
        let active = work
            .iter()
            .filter(|w| w.claimed_by.as_deref() == Some(agent.agent_id.as_str()) && w.status.is_active_claim())
            .count() as u32;
        *team_load.entry(agent.team.clone()).or_default() += active;
    }

    let saturated: Vec<&str> = team_capacity
        .iter()
        .filter(|(team, cap)| team_load.get(*team).copied().unwrap_or(0) >= **cap)
        .map(|(team, _)| team.as_str())
        .collect();

    // Running per-agent active-claim count, seeded from the snapshot and
    // incremented as proposals are applied below, so a burst of pending
    // items targeting the same idle agent can never push it past I3.
    let mut active_counts: BTreeMap<String, u32> = BTreeMap::new();
    for agent in &agents {
        let active = work
            .iter()
            .filter(|w| w.claimed_by.as_deref() == Some(agent.agent_id.as_str()) && w.status.is_active_claim())
            .count() as u32;
        active_counts.insert(agent.agent_id.clone(), active);
    }

    let has_headroom = |a: &Agent, counts: &BTreeMap<String, u32>| {
        counts.get(&a.agent_id).copied().unwrap_or(0) < a.max_concurrent_work
    };
    let idle_agents: Vec<&Agent> = agents
        .iter()
        .filter(|a| a.status == AgentStatus::Active && !saturated.contains(&a.team.as_str()) && has_headroom(a, &active_counts))
        .collect();

    let mut reassigned = 0usize;
    for w in work.iter().filter(|w| w.status == WorkStatus::Pending) {
        if let Some(team) = &w.team {
            if !saturated.contains(&team.as_str()) {
                continue;
            }
        }
        if let Some(target) = idle_agents.iter().find(|a| w.eligible_for(a) && has_headroom(a, &active_counts)) {
            kernel.reassign(&w.work_id, Some(target.agent_id.clone()))?;
            *active_counts.entry(target.agent_id.clone()).or_default() += 1;
            reassigned += 1;
        }
    }

    append_control_event(kernel, "rebalanced", BTreeMap::from([
        ("reassigned_count".to_string(), reassigned.to_string()),
    ]))?;
    Ok(reassigned)
}

/// Fail, with `retriable=true`, any claim that has sat in `claimed` or
/// `in_progress` past `kernel.config().stale_claim_timeout`.
pub fn reap_stale(kernel: &CoordinationKernel) -> SwarmResult<usize> {
    let now = now_ns();
    let timeout_ns = kernel.config().stale_claim_timeout.as_nanos() as u64;
    let work = kernel.store().read_work_claims()?;

    let mut reaped = 0usize;
    for item in work.iter().filter(|w| w.status.is_active_claim()) {
        let since = item.claimed_at_ns.unwrap_or(item.created_at_ns);
        if now.saturating_sub(since) > timeout_ns {
            if let Some(agent_id) = &item.claimed_by {
                kernel.fail(&item.work_id, agent_id, "stale claim reaped".to_string(), true)?;
                reaped += 1;
            }
        }
    }

    append_control_event(kernel, "reaped_stale", BTreeMap::from([
        ("count".to_string(), reaped.to_string()),
    ]))?;
    Ok(reaped)
}

fn append_control_event(kernel: &CoordinationKernel, kind: &str, attributes: BTreeMap<String, String>) -> SwarmResult<()> {
    let event = CoordinationEvent {
        event_id: crate::clock::new_id("event"),
        timestamp_ns: now_ns(),
        actor_agent_id: None,
        kind: kind.to_string(),
        work_id: None,
        attributes,
    };
    kernel.mutator().with_table::<CoordinationEvent, ()>(Table::CoordinationLog, |mut rows| {
        rows.push(event);
        Ok((rows, ()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::kernel::ClaimSelector;
    use crate::model::Priority;
    use std::collections::BTreeSet;

    #[test]
    fn stale_claim_reaper_returns_work_to_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KernelConfig::for_dir(dir.path());
        config.stale_claim_timeout = std::time::Duration::from_nanos(1);
        let kernel = CoordinationKernel::open(config).unwrap();

        let agent = kernel.register("T".into(), "x".into(), None, BTreeSet::new()).unwrap();
        let work_id = kernel
            .claim("t".into(), "d".into(), Priority::Medium, None, BTreeSet::new(), BTreeSet::new(), None)
            .unwrap();
        kernel.claim_as(&agent, ClaimSelector::default()).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(2));
        let reaped = reap_stale(&kernel).unwrap();
        assert_eq!(reaped, 1);

        let items = kernel.store().read_work_claims().unwrap();
        assert_eq!(items.iter().find(|w| w.work_id == work_id).unwrap().status, WorkStatus::Pending);
    }

    #[test]
    fn health_scan_marks_unresponsive_agent_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KernelConfig::for_dir(dir.path());
        config.heartbeat_interval = std::time::Duration::from_nanos(1);
        config.unhealthy_after_missed_heartbeats = 1;
        let kernel = CoordinationKernel::open(config).unwrap();
        let agent = kernel.register("T".into(), "x".into(), None, BTreeSet::new()).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(2));
        let report = health_scan(&kernel).unwrap();
        assert!(report.agents.iter().find(|a| a.agent_id == agent).unwrap().marked_unhealthy);

        let agents = kernel.store().read_agents().unwrap();
        assert_eq!(agents[0].status, AgentStatus::Unhealthy);
    }

    #[test]
    fn compaction_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = CoordinationKernel::open(KernelConfig::for_dir(dir.path())).unwrap();
        fast_path::claim_fast(kernel.store(), "t".into(), "d".into(), Priority::Low, None, BTreeSet::new(), BTreeSet::new(), None).unwrap();

        compact(&kernel, 10_000, u64::MAX).unwrap();
        let first = kernel.store().read_work_claims().unwrap().len();
        compact(&kernel, 10_000, u64::MAX).unwrap();
        let second = kernel.store().read_work_claims().unwrap().len();
        assert_eq!(first, second);
    }

    #[test]
    fn rebalance_never_exceeds_target_agents_max_concurrent_work() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = CoordinationKernel::open(KernelConfig::for_dir(dir.path())).unwrap();

        // One idle agent with room for only two concurrent items.
        let idle_agent = kernel.register("idle".into(), "x".into(), None, BTreeSet::new()).unwrap();
        kernel.mutator().with_table::<crate::model::Agent, ()>(crate::store::Table::Agents, {
            let idle_agent = idle_agent.clone();
            move |mut rows| {
                if let Some(a) = rows.iter_mut().find(|a| a.agent_id == idle_agent) {
                    a.max_concurrent_work = 2;
                }
                Ok((rows, ()))
            }
        }).unwrap();

        // Five teamless pending items, all eligible for the one idle agent.
        for i in 0..5 {
            kernel.claim(format!("overflow-{i}"), "d".into(), Priority::Medium, None, BTreeSet::new(), BTreeSet::new(), None).unwrap();
        }

        rebalance(&kernel).unwrap();

        let work = kernel.store().read_work_claims().unwrap();
        let idle_active = work.iter().filter(|w| w.claimed_by.as_deref() == Some(idle_agent.as_str()) && w.status.is_active_claim()).count();
        assert!(idle_active as u32 <= 2, "rebalance must not push an agent past max_concurrent_work, got {idle_active}");
    }
}
