//! Public error taxonomy and CLI exit-code mapping.

use thiserror::Error;

/// The kernel's public error taxonomy. Every kind carries enough context to
/// render the CLI's `kind=...; message=...; work_id=...` stderr line without
/// re-reading the journal.
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("usage error: {message}")]
    UsageError { message: String },

    #[error("agent {agent_id} is not the claimant of {work_id}")]
    NotClaimant { work_id: String, agent_id: String },

    #[error("monotonicity violation on {work_id}: {message}")]
    MonotonicityViolation { work_id: String, message: String },

    #[error("eligibility violation on {work_id}: {message}")]
    EligibilityViolation { work_id: String, message: String },

    #[error("agent {agent_id} at capacity ({max_concurrent_work} concurrent items)")]
    CapacityExceeded { agent_id: String, max_concurrent_work: u32 },

    #[error("timed out waiting for lock on table {table} after {waited_ms}ms")]
    LockTimeout { table: String, waited_ms: u64 },

    #[error("contention detected on table {table}: snapshot changed during commit")]
    Contention { table: String },

    #[error("table {table} snapshot is corrupt: {message}")]
    Corrupt { table: String, message: String },

    #[error("no eligible work for agent {agent_id}")]
    NoEligibleWork { agent_id: String },

    #[error("agent {agent_id} already registered")]
    AlreadyExists { agent_id: String },

    #[error("unknown work item {work_id}")]
    UnknownWorkItem { work_id: String },

    #[error("unknown agent {agent_id}")]
    UnknownAgent { agent_id: String },

    #[error("agent {agent_id} still holds {count} active claim(s); reassign them before deregistering")]
    ActiveClaimsPresent { agent_id: String, count: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl SwarmError {
    /// Whether a caller should retry this operation (with the suggested
    /// backoff from [`SwarmError::min_backoff_ms`]).
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            SwarmError::LockTimeout { .. }
                | SwarmError::Contention { .. }
                | SwarmError::CapacityExceeded { .. }
        )
    }

    /// Suggested minimum backoff before retrying, or `None` for
    /// non-retriable errors.
    pub fn min_backoff_ms(&self) -> Option<u64> {
        match self {
            SwarmError::LockTimeout { .. } => Some(50),
            SwarmError::Contention { .. } => Some(10),
            SwarmError::CapacityExceeded { .. } => Some(500),
            _ => None,
        }
    }

    /// Process exit code: 0 success (handled by caller), 1 non-retriable
    /// error, 2 retriable error, 3 usage error.
    pub fn exit_code(&self) -> i32 {
        match self {
            SwarmError::UsageError { .. } => 3,
            SwarmError::LockTimeout { .. }
            | SwarmError::Contention { .. }
            | SwarmError::CapacityExceeded { .. } => 2,
            _ => 1,
        }
    }

    /// The `work_id=...` field of the structured stderr line, when this
    /// error kind carries one.
    pub fn work_id(&self) -> Option<&str> {
        match self {
            SwarmError::NotClaimant { work_id, .. }
            | SwarmError::MonotonicityViolation { work_id, .. }
            | SwarmError::EligibilityViolation { work_id, .. }
            | SwarmError::UnknownWorkItem { work_id } => Some(work_id),
            _ => None,
        }
    }

    /// Short, stable kind name used in the `kind=...` stderr field.
    pub fn kind(&self) -> &'static str {
        match self {
            SwarmError::UsageError { .. } => "UsageError",
            SwarmError::NotClaimant { .. } => "NotClaimant",
            SwarmError::MonotonicityViolation { .. } => "MonotonicityViolation",
            SwarmError::EligibilityViolation { .. } => "EligibilityViolation",
            SwarmError::CapacityExceeded { .. } => "CapacityExceeded",
            SwarmError::LockTimeout { .. } => "LockTimeout",
            SwarmError::Contention { .. } => "Contention",
            SwarmError::Corrupt { .. } => "Corrupt",
            SwarmError::NoEligibleWork { .. } => "NoEligibleWork",
            SwarmError::AlreadyExists { .. } => "AlreadyExists",
            SwarmError::UnknownWorkItem { .. } => "UnknownWorkItem",
            SwarmError::UnknownAgent { .. } => "UnknownAgent",
            SwarmError::ActiveClaimsPresent { .. } => "ActiveClaimsPresent",
            SwarmError::Io(_) => "Io",
            SwarmError::Serde(_) => "Serde",
        }
    }

    /// Render the structured `kind=...; message=...; work_id=...` line the
    /// CLI prints to stderr.
    pub fn to_stderr_line(&self) -> String {
        match self.work_id() {
            Some(work_id) => format!("kind={}; message={}; work_id={}", self.kind(), self, work_id),
            None => format!("kind={}; message={}", self.kind(), self),
        }
    }
}

pub type SwarmResult<T> = Result<T, SwarmError>;
