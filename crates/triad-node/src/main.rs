//! triad-node — the orchestration kernel daemon.
//!
//! Startup sequence:
//!   1. Load and validate configuration (YAML + env overrides)
//!   2. Open the durable store (path validation, WAL, schema)
//!   3. Verify the binary integrity baseline
//!   4. Build the gated delegate adapter, consensus engine, phase controller
//!   5. Spawn the worker pool, the escalator tick, and the healing loop
//!   6. Start the JSON-RPC server and run until interrupted
//!
//! Exit codes: 0 success, 1 domain error, 2 configuration/boot error,
//! 3 store unavailable.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use triad_breakers::{BreakerSet, CostTracker, RateLimiter, RateStrategy};
use triad_config::{resolve_state_dir, Config};
use triad_consensus::{AggregationRules, ConsensusEngine, Roster};
use triad_core::constants::TASK_WALL_CLOCK_SECS;
use triad_core::types::{TraceId, WorkerId};
use triad_core::TriadError;
use triad_delegate::{DelegateAdapter, GatedAdapter, HttpDelegateAdapter};
use triad_healing::Supervisor;
use triad_locks::{LockConfig, LockManager};
use triad_node::{integrity, worker};
use triad_phases::PhaseController;
use triad_queue::{Escalator, Scheduler};
use triad_rpc::{RpcServer, RpcServerState};
use triad_store::tasks::ClaimFilter;
use triad_store::Store;

#[derive(Parser, Debug)]
#[command(
    name = "triad-node",
    version,
    about = "Triad — autonomous tri-agent orchestration kernel"
)]
struct Args {
    /// State directory (database, locks, breakers, costs, health).
    #[arg(long, default_value = "~/.triad/state")]
    state_dir: PathBuf,

    /// YAML configuration file (CONFIG_FILE env overrides).
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON-RPC listen address.
    #[arg(long, default_value = "127.0.0.1:8787")]
    rpc_addr: SocketAddr,

    /// Number of worker loops.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Accept a changed node binary and rewrite the integrity baseline.
    #[arg(long)]
    accept_binary_changes: bool,

    /// Seconds between escalator passes.
    #[arg(long, default_value_t = 60)]
    escalation_interval: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = if std::env::var("DEBUG").is_ok() {
        "debug"
    } else {
        "info,triad=debug"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.parse().expect("static filter parses")),
        )
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            error!(error = %e, "node terminated");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

/// Map an error chain to the documented exit codes.
fn exit_code_for(e: &anyhow::Error) -> u8 {
    if let Some(te) = e.downcast_ref::<TriadError>() {
        return match te {
            TriadError::Config(_) | TriadError::Integrity(_) => 2,
            TriadError::StoreUnavailable { .. } | TriadError::Sql(_) => 3,
            _ => 1,
        };
    }
    1
}

async fn run(args: Args) -> anyhow::Result<()> {
    info!("triad node starting");
    let trace = TraceId::from_env_or_generate();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = Config::load_or_default(args.config.as_deref())?;

    // ── State directory & store ───────────────────────────────────────────────
    let state_dir = expand_tilde(&resolve_state_dir(&args.state_dir));
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("creating state dir {}", state_dir.display()))?;
    let store = Arc::new(Store::open(&state_dir).context("opening store")?);

    // ── Integrity baseline ────────────────────────────────────────────────────
    integrity::verify_binary_baseline(&state_dir, &store, args.accept_binary_changes, &trace)?;

    // ── Locks, breakers, cost gate ────────────────────────────────────────────
    let locks = LockManager::new(LockConfig {
        backoff_initial: Duration::from_secs(config.locks.backoff_initial),
        backoff_max: Duration::from_secs(config.locks.backoff_max),
        acquire_timeout: Duration::from_secs(triad_core::constants::LOCK_ACQUIRE_TIMEOUT_SECS),
        stale_timeout_secs: config.locks.stale_timeout_seconds,
        auto_release_stale: config.locks.auto_release_stale,
        deadlock_warn_secs: config.locks.deadlock_warn_seconds,
    });
    let breakers = Arc::new(BreakerSet::new(
        &state_dir,
        Arc::clone(&store),
        config.breakers.failure_threshold,
        config.breakers.cooldown_seconds,
    )?);
    let cost = Arc::new(CostTracker::new(
        &state_dir,
        Arc::clone(&store),
        locks.clone(),
        config.cost_limits.clone(),
    )?);

    // ── Delegate adapter & consensus ──────────────────────────────────────────
    let rate = Arc::new(RateLimiter::new(&state_dir, locks.clone())?);
    let rate_strategy = RateStrategy::TokenBucket {
        capacity: triad_core::constants::RATE_BUCKET_CAPACITY,
        refill_per_sec: triad_core::constants::RATE_REFILL_PER_SEC,
    };
    let http = Arc::new(HttpDelegateAdapter::from_config(&config)?);
    let gated: Arc<dyn DelegateAdapter> = Arc::new(GatedAdapter::new(
        http,
        Arc::clone(&breakers),
        Arc::clone(&cost),
        Some((rate, rate_strategy)),
    ));
    let engine = Arc::new(ConsensusEngine::new(
        Arc::clone(&store),
        gated,
        Roster::from_config(&config.routing),
        AggregationRules {
            approval_threshold: config.consensus.approval_threshold,
            min_confidence: config.consensus.min_confidence,
            reject_confidence: config.consensus.reject_confidence,
        },
        Duration::from_secs(config.consensus.timeout_seconds),
    ));
    let phases = Arc::new(PhaseController::new(Arc::clone(&store), Arc::clone(&engine)));

    // ── Scheduler & workers ───────────────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&store)));
    let deps = Arc::new(worker::WorkerDeps {
        store: Arc::clone(&store),
        scheduler: Arc::clone(&scheduler),
        phases,
        engine,
        claim_filter: ClaimFilter::default(),
        wall_clock_secs: TASK_WALL_CLOCK_SECS,
        idle_sleep: Duration::from_secs(2),
    });
    for i in 0..args.workers.max(1) {
        let deps = Arc::clone(&deps);
        let id = WorkerId::new(format!("worker-{i}-{}", std::process::id()));
        tokio::spawn(async move { worker::run_worker(deps, id).await });
    }

    // ── Escalator tick ────────────────────────────────────────────────────────
    let escalator = Escalator::from_config(&config.priority.escalation);
    let escalation_store = Arc::clone(&store);
    let escalation_interval = args.escalation_interval.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(escalation_interval));
        loop {
            interval.tick().await;
            let now = chrono::Utc::now().timestamp();
            if let Err(e) = escalator.tick(&escalation_store, now) {
                tracing::warn!(error = %e, "escalation pass failed");
            }
        }
    });

    // ── Self-healing supervisor ───────────────────────────────────────────────
    let supervisor = Arc::new(Supervisor::new(
        &state_dir,
        Arc::clone(&store),
        Arc::clone(&breakers),
        Arc::clone(&cost),
    ));
    tokio::spawn(Arc::clone(&supervisor).run(config.healing.interval_seconds));

    // ── RPC server ────────────────────────────────────────────────────────────
    let rpc_state = Arc::new(RpcServerState {
        store: Arc::clone(&store),
        scheduler,
        health_path: state_dir.join(triad_core::constants::HEALTH_FILE),
    });
    let _rpc_handle = RpcServer::new(rpc_state)
        .start(args.rpc_addr)
        .await
        .context("starting RPC server")?;

    info!("node ready");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown requested");
    Ok(())
}

/// Expand a leading `~` to the user's home directory (`HOME` or `USERPROFILE`).
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
