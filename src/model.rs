//! Core entity types: `Agent`, `WorkItem`, `CoordinationEvent`, `TelemetrySpan`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type AgentId = String;
pub type WorkId = String;
pub type TraceId = String;
pub type SpanId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Active,
    Degraded,
    Unhealthy,
    Recovering,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: AgentId,
    pub team: String,
    pub specialization: String,
    pub capacity: u32,
    pub max_concurrent_work: u32,
    pub status: AgentStatus,
    pub last_heartbeat_ns: u64,
    pub capabilities: BTreeSet<String>,
}

impl Agent {
    pub const DEFAULT_CAPACITY: u32 = 100;
    pub const DEFAULT_MAX_CONCURRENT_WORK: u32 = 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Higher value sorts first in the claim queue.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 3,
            Priority::High => 2,
            Priority::Medium => 1,
            Priority::Low => 0,
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = crate::error::SwarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(crate::error::SwarmError::UsageError {
                message: format!("unknown priority '{other}' (expected critical|high|medium|low)"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Blocked,
    Claimed,
    InProgress,
    Completed,
    Failed,
    Retrying,
}

impl WorkStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkStatus::Completed | WorkStatus::Failed)
    }

    pub fn is_active_claim(&self) -> bool {
        matches!(self, WorkStatus::Claimed | WorkStatus::InProgress)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub work_id: WorkId,
    pub work_type: String,
    pub description: String,
    pub priority: Priority,
    pub team: Option<String>,
    pub required_capabilities: BTreeSet<String>,
    pub preferred_agent: Option<AgentId>,
    pub depends_on: BTreeSet<WorkId>,
    pub status: WorkStatus,
    pub claimed_by: Option<AgentId>,
    pub created_at_ns: u64,
    pub claimed_at_ns: Option<u64>,
    pub started_at_ns: Option<u64>,
    pub completed_at_ns: Option<u64>,
    pub progress_pct: u8,
    pub phase: Option<String>,
    pub result: Option<String>,
    pub score: Option<i64>,
    pub retry_count: u32,
    pub trace_id: TraceId,
}

impl WorkItem {
    /// Whether `agent` satisfies this item's team and capability
    /// constraints. Dependency gating is checked separately against the
    /// full work table.
    pub fn eligible_for(&self, agent: &Agent) -> bool {
        if let Some(team) = &self.team {
            if team != &agent.team {
                return false;
            }
        }
        self.required_capabilities.is_subset(&agent.capabilities)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationEvent {
    pub event_id: String,
    pub timestamp_ns: u64,
    pub actor_agent_id: Option<AgentId>,
    pub kind: String,
    pub work_id: Option<WorkId>,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySpan {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub operation_name: String,
    pub start_time_ns: u64,
    pub duration_ns: u64,
    pub status: SpanStatus,
    pub attributes: BTreeMap<String, String>,
    pub service: ServiceInfo,
}
