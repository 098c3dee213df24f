//! Operator read projections. Every function here only reads
//! table snapshots — no lock is ever taken, so these always return
//! best-effort results even while the store is under heavy write load or
//! degraded.

use crate::clock::now_ns;
use crate::kernel::CoordinationKernel;
use crate::model::{AgentId, Priority, WorkId, WorkStatus};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
pub struct Dashboard {
    pub by_status: BTreeMap<String, usize>,
    pub by_team: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub oldest_in_progress: Vec<WorkId>,
    pub latest_health_score: Option<f64>,
}

pub fn dashboard(kernel: &CoordinationKernel, top_n: usize) -> crate::error::SwarmResult<Dashboard> {
    let work = kernel.store().read_work_claims()?;

    let mut by_status = BTreeMap::new();
    let mut by_team = BTreeMap::new();
    let mut by_priority = BTreeMap::new();
    for item in &work {
        *by_status.entry(format!("{:?}", item.status)).or_insert(0) += 1;
        if let Some(team) = &item.team {
            *by_team.entry(team.clone()).or_insert(0) += 1;
        }
        *by_priority.entry(format!("{:?}", item.priority)).or_insert(0) += 1;
    }

    let mut in_progress: Vec<_> = work.iter().filter(|w| w.status == WorkStatus::InProgress).collect();
    in_progress.sort_by_key(|w| w.started_at_ns.unwrap_or(w.created_at_ns));
    let oldest_in_progress = in_progress.into_iter().take(top_n).map(|w| w.work_id.clone()).collect();

    let latest_health_score = std::fs::read_to_string(kernel.store().health_report_path())
        .ok()
        .and_then(|s| serde_json::from_str::<crate::control::HealthReport>(&s).ok())
        .map(|report| {
            if report.agents.is_empty() {
                return 0.0;
            }
            report.agents.iter().map(|a| a.score as f64).sum::<f64>() / report.agents.len() as f64
        });

    Ok(Dashboard { by_status, by_team, by_priority, oldest_in_progress, latest_health_score })
}

#[derive(Debug, Default, Clone)]
pub struct WorkFilter {
    pub team: Option<String>,
    pub status: Option<WorkStatus>,
    pub agent: Option<AgentId>,
}

pub fn list_work(kernel: &CoordinationKernel, filter: &WorkFilter) -> crate::error::SwarmResult<Vec<crate::model::WorkItem>> {
    let work = kernel.store().read_work_claims()?;
    Ok(work
        .into_iter()
        .filter(|w| filter.team.as_deref().map(|t| w.team.as_deref() == Some(t)).unwrap_or(true))
        .filter(|w| filter.status.map(|s| w.status == s).unwrap_or(true))
        .filter(|w| filter.agent.as_deref().map(|a| w.claimed_by.as_deref() == Some(a)).unwrap_or(true))
        .collect())
}

pub fn list_agents(kernel: &CoordinationKernel, team: Option<&str>) -> crate::error::SwarmResult<Vec<crate::model::Agent>> {
    let agents = kernel.store().read_agents()?;
    Ok(agents.into_iter().filter(|a| team.map(|t| a.team == t).unwrap_or(true)).collect())
}

#[derive(Debug, Serialize)]
pub struct TelemetryStats {
    pub span_count: usize,
    pub error_count: usize,
    pub error_rate: f64,
    pub top_operations: Vec<(String, usize)>,
}

/// `window_ns = None` scans the whole journal ("all").
pub fn telemetry_stats(kernel: &CoordinationKernel, window_ns: Option<u64>) -> crate::error::SwarmResult<TelemetryStats> {
    let spans = kernel.store().read_telemetry_spans()?;
    let now = now_ns();
    let in_window: Vec<_> = spans
        .into_iter()
        .filter(|s| window_ns.map(|w| now.saturating_sub(s.start_time_ns) <= w).unwrap_or(true))
        .collect();

    let span_count = in_window.len();
    let error_count = in_window.iter().filter(|s| s.status == crate::model::SpanStatus::Error).count();
    let error_rate = if span_count == 0 { 0.0 } else { error_count as f64 / span_count as f64 };

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for span in &in_window {
        *counts.entry(span.operation_name.clone()).or_insert(0) += 1;
    }
    let mut top_operations: Vec<_> = counts.into_iter().collect();
    top_operations.sort_by(|a, b| b.1.cmp(&a.1));
    top_operations.truncate(10);

    Ok(TelemetryStats { span_count, error_count, error_rate, top_operations })
}

#[derive(Debug, Serialize)]
pub struct TeamStatus {
    pub team: String,
    pub agent_count: usize,
    pub active_claims: usize,
    pub total_capacity: u32,
}

#[derive(Debug, Serialize)]
pub struct SwarmStatus {
    pub teams: Vec<TeamStatus>,
    pub agent_count: usize,
    pub unhealthy_agent_count: usize,
}

pub fn swarm_status(kernel: &CoordinationKernel) -> crate::error::SwarmResult<SwarmStatus> {
    let agents = kernel.store().read_agents()?;
    let work = kernel.store().read_work_claims()?;

    let mut teams: BTreeMap<String, TeamStatus> = BTreeMap::new();
    for agent in &agents {
        let entry = teams.entry(agent.team.clone()).or_insert_with(|| TeamStatus {
            team: agent.team.clone(),
            agent_count: 0,
            active_claims: 0,
            total_capacity: 0,
        });
        entry.agent_count += 1;
        entry.total_capacity += agent.max_concurrent_work;
        entry.active_claims += work
            .iter()
            .filter(|w| w.claimed_by.as_deref() == Some(agent.agent_id.as_str()) && w.status.is_active_claim())
            .count();
    }

    let unhealthy_agent_count = agents.iter().filter(|a| a.status == crate::model::AgentStatus::Unhealthy).count();

    Ok(SwarmStatus {
        teams: teams.into_values().collect(),
        agent_count: agents.len(),
        unhealthy_agent_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use std::collections::BTreeSet;

    #[test]
    fn dashboard_counts_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = CoordinationKernel::open(KernelConfig::for_dir(dir.path())).unwrap();
        kernel
            .claim("t".into(), "d".into(), Priority::High, None, BTreeSet::new(), BTreeSet::new(), None)
            .unwrap();
        let board = dashboard(&kernel, 5).unwrap();
        assert_eq!(board.by_status.get("Pending"), Some(&1));
    }

    #[test]
    fn list_work_filters_by_team() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = CoordinationKernel::open(KernelConfig::for_dir(dir.path())).unwrap();
        kernel
            .claim("t".into(), "d".into(), Priority::High, Some("alpha".into()), BTreeSet::new(), BTreeSet::new(), None)
            .unwrap();
        kernel
            .claim("t".into(), "d".into(), Priority::High, Some("beta".into()), BTreeSet::new(), BTreeSet::new(), None)
            .unwrap();

        let filter = WorkFilter { team: Some("alpha".into()), ..Default::default() };
        let filtered = list_work(&kernel, &filter).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].team.as_deref(), Some("alpha"));
    }
}
