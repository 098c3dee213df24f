//! Worker runtime: embodies one agent's poll/claim/execute/progress/
//! complete loop.
//!
//! Work execution itself is delegated to a [`WorkHandler`] — an external
//! collaborator the runtime never assumes anything about beyond the
//! trait's contract. Capacity enforcement lives in the kernel, not here:
//! a worker configured with `max_concurrent_work > 1` simply runs more
//! claim/execute cycles concurrently.

use crate::error::{SwarmError, SwarmResult};
use crate::kernel::{ClaimSelector, CoordinationKernel};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// Outcome of executing one work item.
pub enum HandlerOutcome {
    Completed { result: String, score: Option<i64> },
    Failed { reason: String, retriable: bool },
}

/// External work execution. Implementations perform the actual unit of
/// work and report progress through `on_progress`; the worker loop never
/// inspects the work's payload itself.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn execute(
        &self,
        work_id: &str,
        work_type: &str,
        description: &str,
        on_progress: &(dyn Fn(u8, Option<String>) + Send + Sync),
    ) -> HandlerOutcome;
}

/// A handler that immediately completes every item it receives. Useful
/// for smoke-testing a deployment's coordination plumbing without a real
/// execution backend.
pub struct NoopHandler;

#[async_trait]
impl WorkHandler for NoopHandler {
    async fn execute(
        &self,
        _work_id: &str,
        _work_type: &str,
        _description: &str,
        on_progress: &(dyn Fn(u8, Option<String>) + Send + Sync),
    ) -> HandlerOutcome {
        on_progress(100, None);
        HandlerOutcome::Completed { result: "noop".to_string(), score: None }
    }
}

pub struct WorkerConfig {
    pub agent_id: String,
    pub selector: ClaimSelector,
    pub poll_interval: Duration,
}

/// Drives one agent's loop until `shutdown` fires. Returns once the
/// current in-flight item (if any) has reached a terminal state.
pub async fn run(
    kernel: Arc<CoordinationKernel>,
    handler: Arc<dyn WorkHandler>,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        if let Err(e) = kernel.heartbeat(&config.agent_id) {
            tracing::warn!(agent_id = %config.agent_id, error = %e, "heartbeat failed");
        }

        let claim_result = {
            if *shutdown.borrow() {
                break;
            }
            kernel.claim_as(&config.agent_id, config.selector.clone())
        };

        let work_id = match claim_result {
            Ok(work_id) => work_id,
            Err(SwarmError::NoEligibleWork { .. }) => {
                tokio::select! {
                    _ = sleep(config.poll_interval) => continue,
                    _ = shutdown.changed() => break,
                }
            }
            Err(e) => {
                tracing::error!(agent_id = %config.agent_id, error = %e, "claim_as failed");
                tokio::select! {
                    _ = sleep(config.poll_interval) => continue,
                    _ = shutdown.changed() => break,
                }
            }
        };

        execute_one(&kernel, &handler, &config.agent_id, &work_id).await;
    }

    if let Err(e) = kernel.deregister(&config.agent_id) {
        tracing::warn!(agent_id = %config.agent_id, error = %e, "deregister on shutdown failed");
    }
}

async fn execute_one(kernel: &CoordinationKernel, handler: &Arc<dyn WorkHandler>, agent_id: &str, work_id: &str) {
    let items = match kernel.store().read_work_claims() {
        Ok(items) => items,
        Err(e) => {
            tracing::error!(work_id, error = %e, "failed to read claimed item back");
            return;
        }
    };
    let Some(item) = items.into_iter().find(|w| w.work_id == work_id) else {
        tracing::error!(work_id, "claimed item vanished before execution");
        return;
    };

    let kernel_for_progress = kernel;
    let agent_id_owned = agent_id.to_string();
    let work_id_owned = work_id.to_string();
    let on_progress = move |pct: u8, phase: Option<String>| {
        if let Err(e) = kernel_for_progress.progress(&work_id_owned, &agent_id_owned, pct, phase) {
            tracing::warn!(work_id = %work_id_owned, error = %e, "progress report failed");
        }
    };

    let outcome = handler.execute(&item.work_id, &item.work_type, &item.description, &on_progress).await;

    let result = match outcome {
        HandlerOutcome::Completed { result, score } => kernel.complete(work_id, agent_id, result, score),
        HandlerOutcome::Failed { reason, retriable } => kernel.fail(work_id, agent_id, reason, retriable),
    };

    if let Err(e) = result {
        tracing::error!(work_id, error = %e, "terminal kernel call failed");
    }
}

/// Run the loop to completion and report the maximum number of work
/// items a single call drains, for tests and one-shot CLI invocations
/// (`swarmsh worker --once`).
pub async fn run_once(kernel: &CoordinationKernel, handler: &Arc<dyn WorkHandler>, agent_id: &str, selector: ClaimSelector) -> SwarmResult<bool> {
    match kernel.claim_as(agent_id, selector) {
        Ok(work_id) => {
            execute_one(kernel, handler, agent_id, &work_id).await;
            Ok(true)
        }
        Err(SwarmError::NoEligibleWork { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}
