//! Standalone control-loop runner: drives the health scan, compactor,
//! rebalancer, and stale-claim reaper on their own timers so an operator
//! doesn't need an external scheduler to keep a deployment healthy. Each
//! loop runs independently; a slow or failing tick logs and retries on
//! the next interval rather than taking the process down.

use std::sync::Arc;
use std::time::Duration;
use swarmsh::kernel::CoordinationKernel;
use swarmsh::{control, telemetry, KernelConfig};
use tokio_stream::wrappers::ReadDirStream;
use tokio_stream::StreamExt;

const HEALTH_SCAN_INTERVAL: Duration = Duration::from_secs(15 * 60);
const COMPACT_INTERVAL: Duration = Duration::from_secs(60 * 60);
const REBALANCE_INTERVAL: Duration = Duration::from_secs(30 * 60);
const REAP_STALE_INTERVAL: Duration = Duration::from_secs(5 * 60);

const COMPACT_SEGMENT_THRESHOLD: usize = 10_000;
const COMPACT_RETENTION_WINDOW_NS: u64 = 30 * 24 * 60 * 60 * 1_000_000_000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = KernelConfig::from_env()?;
    let _tracing_guard = telemetry::init_tracing(&config)?;

    let kernel = Arc::new(CoordinationKernel::open(config)?);

    tracing::info!("control loops starting");

    let handles = vec![
        tokio::spawn(run_loop("health_scan", HEALTH_SCAN_INTERVAL, {
            let kernel = kernel.clone();
            move || {
                let kernel = kernel.clone();
                async move { control::health_scan(&kernel).map(|_| ()) }
            }
        })),
        tokio::spawn(run_loop("compact", COMPACT_INTERVAL, {
            let kernel = kernel.clone();
            move || {
                let kernel = kernel.clone();
                async move {
                    let outcome =
                        control::compact(&kernel, COMPACT_SEGMENT_THRESHOLD, COMPACT_RETENTION_WINDOW_NS)?;
                    let segment_count = count_archive_segments(&kernel).await;
                    tracing::info!(
                        fast_path_accepted = outcome.accepted,
                        fast_path_rejected = outcome.rejected.len(),
                        archive_segments = segment_count,
                        "compaction tick finished"
                    );
                    Ok(())
                }
            }
        })),
        tokio::spawn(run_loop("rebalance", REBALANCE_INTERVAL, {
            let kernel = kernel.clone();
            move || {
                let kernel = kernel.clone();
                async move { control::rebalance(&kernel).map(|_| ()) }
            }
        })),
        tokio::spawn(run_loop("reap_stale", REAP_STALE_INTERVAL, {
            let kernel = kernel.clone();
            move || {
                let kernel = kernel.clone();
                async move { control::reap_stale(&kernel).map(|_| ()) }
            }
        })),
    ];

    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

/// Counts entries in the archive directory written by segmented compaction,
/// streamed rather than collected into a `Vec` up front.
async fn count_archive_segments(kernel: &CoordinationKernel) -> usize {
    let dir = match tokio::fs::read_dir(kernel.store().archive_dir()).await {
        Ok(dir) => dir,
        Err(_) => return 0,
    };
    let mut entries = ReadDirStream::new(dir);
    let mut count = 0usize;
    while let Some(entry) = entries.next().await {
        if entry.is_ok() {
            count += 1;
        }
    }
    count
}

/// Ticks `tick` every `period`, logging and continuing past errors so one
/// bad cycle never stops the loop.
async fn run_loop<F, Fut>(name: &'static str, period: Duration, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = swarmsh::SwarmResult<()>>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        tracing::debug!(loop_name = name, "tick");
        if let Err(e) = tick().await {
            tracing::error!(loop_name = name, error = %e, "control loop tick failed");
        }
    }
}
