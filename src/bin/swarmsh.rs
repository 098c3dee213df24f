//! Unified CLI dispatcher: every kernel operation and read projection,
//! behind one `swarmsh` binary.

use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use swarmsh::control;
use swarmsh::fast_path;
use swarmsh::kernel::{ClaimSelector, CoordinationKernel};
use swarmsh::model::{Priority, WorkStatus};
use swarmsh::projections::{self, WorkFilter};
use swarmsh::worker::{self, NoopHandler, WorkHandler};
use swarmsh::{KernelConfig, SwarmError};

#[derive(Parser)]
#[command(name = "swarmsh")]
#[command(about = "SwarmSH - file-based coordination kernel for agent swarms")]
#[command(version)]
struct Cli {
    /// Emit machine-readable JSON instead of plain text.
    #[arg(long, global = true)]
    json: bool,

    /// Override COORDINATION_DIR for this invocation.
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Register {
        team: String,
        specialization: String,
        #[arg(long)]
        capacity: Option<u32>,
        #[arg(long, value_delimiter = ',')]
        capabilities: Vec<String>,
    },
    Claim {
        work_type: String,
        description: String,
        priority: String,
        #[arg(long)]
        team: Option<String>,
        #[arg(long = "requires", value_delimiter = ',')]
        requires: Vec<String>,
        #[arg(long = "depends-on", value_delimiter = ',')]
        depends_on: Vec<String>,
        #[arg(long = "preferred-agent")]
        preferred_agent: Option<String>,
    },
    #[command(name = "claim-fast")]
    ClaimFast {
        work_type: String,
        description: String,
        priority: String,
        #[arg(long)]
        team: Option<String>,
        #[arg(long = "requires", value_delimiter = ',')]
        requires: Vec<String>,
        #[arg(long = "depends-on", value_delimiter = ',')]
        depends_on: Vec<String>,
        #[arg(long = "preferred-agent")]
        preferred_agent: Option<String>,
    },
    Progress {
        work_id: String,
        agent_id: String,
        pct: u8,
        phase: Option<String>,
    },
    Complete {
        work_id: String,
        agent_id: String,
        result: String,
        score: Option<i64>,
    },
    Fail {
        work_id: String,
        agent_id: String,
        reason: String,
        #[arg(long)]
        retriable: bool,
    },
    Heartbeat {
        agent_id: String,
    },
    Reassign {
        work_id: String,
        new_agent_id: Option<String>,
    },
    Deregister {
        agent_id: String,
    },
    #[command(name = "list-work")]
    ListWork {
        #[arg(long)]
        team: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        agent: Option<String>,
    },
    #[command(name = "list-agents")]
    ListAgents {
        #[arg(long)]
        team: Option<String>,
    },
    Dashboard,
    #[command(name = "swarm-status")]
    SwarmStatus,
    #[command(name = "telemetry-stats")]
    TelemetryStats {
        #[arg(long, default_value = "all")]
        window: String,
    },
    #[command(name = "health-scan")]
    HealthScan,
    Compact,
    Rebalance,
    #[command(name = "reap-stale")]
    ReapStale,
    /// Run one agent's poll/claim/execute loop against a no-op handler.
    Worker {
        agent_id: String,
        #[arg(long)]
        once: bool,
    },
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(c) => c,
        Err(e) => return report_error(&e, cli.json),
    };

    let _tracing_guard = match swarmsh::telemetry::init_tracing(&config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("kind=Io; message={e}");
            return 1;
        }
    };

    let kernel = match CoordinationKernel::open(config) {
        Ok(k) => k,
        Err(e) => return report_error(&e, cli.json),
    };

    match dispatch(&cli.command, &kernel, cli.json) {
        Ok(()) => 0,
        Err(e) => report_error(&e, cli.json),
    }
}

fn build_config(cli: &Cli) -> Result<KernelConfig, SwarmError> {
    match &cli.dir {
        Some(dir) => Ok(KernelConfig::for_dir(dir.clone())),
        None => KernelConfig::from_env(),
    }
}

fn report_error(e: &SwarmError, json: bool) -> i32 {
    if json {
        eprintln!("{}", json!({"kind": e.kind(), "message": e.to_string(), "work_id": e.work_id()}));
    } else {
        eprintln!("{}", e.to_stderr_line());
    }
    e.exit_code()
}

fn dispatch(command: &Command, kernel: &CoordinationKernel, json: bool) -> Result<(), SwarmError> {
    match command {
        Command::Register { team, specialization, capacity, capabilities } => {
            let agent_id = kernel.register(
                team.clone(),
                specialization.clone(),
                *capacity,
                capabilities.iter().cloned().collect(),
            )?;
            print_value(json, &agent_id, |v| json!({"agent_id": v}));
        }
        Command::Claim { work_type, description, priority, team, requires, depends_on, preferred_agent } => {
            let work_id = kernel.claim(
                work_type.clone(),
                description.clone(),
                parse_priority(priority)?,
                team.clone(),
                requires.iter().cloned().collect(),
                depends_on.iter().cloned().collect(),
                preferred_agent.clone(),
            )?;
            print_value(json, &work_id, |v| json!({"work_id": v}));
        }
        Command::ClaimFast { work_type, description, priority, team, requires, depends_on, preferred_agent } => {
            let work_id = fast_path::claim_fast(
                kernel.store(),
                work_type.clone(),
                description.clone(),
                parse_priority(priority)?,
                team.clone(),
                requires.iter().cloned().collect(),
                depends_on.iter().cloned().collect(),
                preferred_agent.clone(),
            )?;
            print_value(json, &work_id, |v| json!({"work_id": v}));
        }
        Command::Progress { work_id, agent_id, pct, phase } => {
            kernel.progress(work_id, agent_id, *pct, phase.clone())?;
        }
        Command::Complete { work_id, agent_id, result, score } => {
            kernel.complete(work_id, agent_id, result.clone(), *score)?;
        }
        Command::Fail { work_id, agent_id, reason, retriable } => {
            kernel.fail(work_id, agent_id, reason.clone(), *retriable)?;
        }
        Command::Heartbeat { agent_id } => {
            kernel.heartbeat(agent_id)?;
        }
        Command::Reassign { work_id, new_agent_id } => {
            kernel.reassign(work_id, new_agent_id.clone())?;
        }
        Command::Deregister { agent_id } => {
            kernel.deregister(agent_id)?;
        }
        Command::ListWork { team, status, agent } => {
            let filter = WorkFilter {
                team: team.clone(),
                status: status.as_deref().map(parse_status).transpose()?,
                agent: agent.clone(),
            };
            let items = projections::list_work(kernel, &filter)?;
            print_json_or_table(json, &items, |items| {
                for item in items {
                    println!("{}\t{:?}\t{}", item.work_id, item.status, item.description);
                }
            });
        }
        Command::ListAgents { team } => {
            let agents = projections::list_agents(kernel, team.as_deref())?;
            print_json_or_table(json, &agents, |agents| {
                for a in agents {
                    println!("{}\t{}\t{:?}", a.agent_id, a.team, a.status);
                }
            });
        }
        Command::Dashboard => {
            let board = projections::dashboard(kernel, 10)?;
            print_json_always(&board);
        }
        Command::SwarmStatus => {
            let status = projections::swarm_status(kernel)?;
            print_json_always(&status);
        }
        Command::TelemetryStats { window } => {
            let window_ns = parse_window(window);
            let stats = projections::telemetry_stats(kernel, window_ns)?;
            print_json_always(&stats);
        }
        Command::HealthScan => {
            let report = control::health_scan(kernel)?;
            print_json_always(&report);
        }
        Command::Compact => {
            let outcome = control::compact(kernel, 10_000, 30 * 24 * 60 * 60 * 1_000_000_000)?;
            print_json_always(&json!({"accepted": outcome.accepted, "rejected": outcome.rejected.len()}));
        }
        Command::Rebalance => {
            let reassigned = control::rebalance(kernel)?;
            print_json_always(&json!({"reassigned": reassigned}));
        }
        Command::ReapStale => {
            let reaped = control::reap_stale(kernel)?;
            print_json_always(&json!({"reaped": reaped}));
        }
        Command::Worker { agent_id, once } => {
            let handler: Arc<dyn WorkHandler> = Arc::new(NoopHandler);
            let runtime = tokio::runtime::Runtime::new().map_err(SwarmError::Io)?;
            if *once {
                runtime.block_on(worker::run_once(kernel, &handler, agent_id, ClaimSelector::default()))?;
            } else {
                let (_tx, rx) = tokio::sync::watch::channel(false);
                let kernel_arc = Arc::new(kernel.clone());
                let config = worker::WorkerConfig {
                    agent_id: agent_id.clone(),
                    selector: ClaimSelector::default(),
                    poll_interval: kernel.config().poll_interval,
                };
                runtime.block_on(worker::run(kernel_arc, handler, config, rx));
            }
        }
    }
    Ok(())
}

fn parse_priority(s: &str) -> Result<Priority, SwarmError> {
    s.parse()
}

fn parse_status(s: &str) -> Result<WorkStatus, SwarmError> {
    match s.to_ascii_lowercase().as_str() {
        "pending" => Ok(WorkStatus::Pending),
        "blocked" => Ok(WorkStatus::Blocked),
        "claimed" => Ok(WorkStatus::Claimed),
        "in_progress" | "in-progress" => Ok(WorkStatus::InProgress),
        "completed" => Ok(WorkStatus::Completed),
        "failed" => Ok(WorkStatus::Failed),
        "retrying" => Ok(WorkStatus::Retrying),
        other => Err(SwarmError::UsageError { message: format!("unknown status '{other}'") }),
    }
}

fn parse_window(window: &str) -> Option<u64> {
    match window {
        "24h" => Some(24 * 60 * 60 * 1_000_000_000),
        "7d" => Some(7 * 24 * 60 * 60 * 1_000_000_000),
        _ => None,
    }
}

fn print_value<T: serde::Serialize>(json_mode: bool, value: &str, as_json: impl Fn(&str) -> T) {
    if json_mode {
        println!("{}", serde_json::to_string(&as_json(value)).unwrap_or_default());
    } else {
        println!("{value}");
    }
}

fn print_json_or_table<T: serde::Serialize>(json_mode: bool, values: &[T], as_table: impl Fn(&[T])) {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(values).unwrap_or_default());
    } else {
        as_table(values);
    }
}

fn print_json_always<T: serde::Serialize>(value: &T) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}
