//! forgepoold — the Forgepool daemon.
//!
//! Single binary that assembles the fleet manager:
//! - Instance store (redb)
//! - Provider adapter (HTTP or in-memory for dev runs)
//! - Coordinator client
//! - Reconcile loop + reaper + pinger
//! - Operational REST API
//!
//! # Usage
//!
//! ```text
//! forgepoold run --coordinator ci.internal:8000 --provider-addr compute.internal:7070 \
//!     --pool-min 1 --pool-max 4 --data-dir /data
//! ```
//!
//! Every flag also reads a `FORGEPOOL_*` environment variable, matching
//! how the deployment injects configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::info;

use forgepool_coordinator::{Coordinator, HttpCoordinator};
use forgepool_provider::{HttpProvider, LaunchTemplate, MemoryProvider, Provider};
use forgepool_scaler::{Pinger, Reaper, Reconciler, ReconcilerConfig, ScalePolicy};
use forgepool_state::InstanceStore;

#[derive(Parser)]
#[command(name = "forgepoold", about = "Forgepool fleet-manager daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProviderKind {
    /// REST adapter to a provisioning endpoint.
    Http,
    /// In-memory provider (dev and testing only).
    Memory,
}

#[derive(Subcommand)]
enum Command {
    /// Run the fleet manager.
    Run {
        /// Port the operational API listens on.
        #[arg(long, env = "FORGEPOOL_PORT", default_value = "8080")]
        port: u16,

        /// Data directory for the instance store.
        #[arg(long, env = "FORGEPOOL_DATA_DIR", default_value = "/data")]
        data_dir: PathBuf,

        /// CI coordinator address (host:port).
        #[arg(long, env = "FORGEPOOL_COORDINATOR")]
        coordinator: String,

        /// Compute provider backend.
        #[arg(long, env = "FORGEPOOL_PROVIDER", value_enum, default_value = "http")]
        provider: ProviderKind,

        /// Provisioning endpoint address (host:port), required for --provider http.
        #[arg(long, env = "FORGEPOOL_PROVIDER_ADDR")]
        provider_addr: Option<String>,

        /// Minimum pool size.
        #[arg(long, env = "FORGEPOOL_POOL_MIN", default_value = "1")]
        pool_min: u32,

        /// Maximum pool size.
        #[arg(long, env = "FORGEPOOL_POOL_MAX", default_value = "4")]
        pool_max: u32,

        /// Queued jobs one fresh agent is expected to absorb.
        #[arg(long, env = "FORGEPOOL_JOBS_PER_AGENT", default_value = "1")]
        jobs_per_agent: u32,

        /// Instance type to launch.
        #[arg(long, env = "FORGEPOOL_INSTANCE_TYPE", default_value = "t2.medium")]
        instance_type: String,

        /// Provider region.
        #[arg(long, env = "FORGEPOOL_REGION", default_value = "eu-central-1")]
        region: String,

        /// Subnet for launched instances.
        #[arg(long, env = "FORGEPOOL_SUBNET", default_value = "")]
        subnet: String,

        /// Security group for launched instances.
        #[arg(long, env = "FORGEPOOL_SECURITY_GROUP", default_value = "")]
        security_group: String,

        /// Tag identifying pool-owned instances.
        #[arg(long, env = "FORGEPOOL_POOL_TAG", default_value = "forgepool")]
        pool_tag: String,

        /// Reconcile interval in seconds.
        #[arg(long, env = "FORGEPOOL_RECONCILE_INTERVAL", default_value = "30")]
        reconcile_interval: u64,

        /// Reap interval in seconds.
        #[arg(long, env = "FORGEPOOL_REAP_INTERVAL", default_value = "300")]
        reap_interval: u64,

        /// Ping interval in seconds.
        #[arg(long, env = "FORGEPOOL_PING_INTERVAL", default_value = "120")]
        ping_interval: u64,

        /// How long a record may stay unconfirmed before the reaper drops it.
        #[arg(long, env = "FORGEPOOL_REAPER_GRACE", default_value = "600")]
        reaper_grace: u64,

        /// How long an instance may stay registering before it is probed.
        #[arg(long, env = "FORGEPOOL_REGISTRATION_GRACE", default_value = "900")]
        registration_grace: u64,

        /// Consecutive provider-call failures before an instance is abandoned.
        #[arg(long, env = "FORGEPOOL_MAX_FAILURES", default_value = "5")]
        max_failures: u32,

        /// Timeout for provider and coordinator calls, in seconds.
        #[arg(long, env = "FORGEPOOL_CALL_TIMEOUT", default_value = "30")]
        call_timeout: u64,

        /// Disable the drift reaper.
        #[arg(long)]
        no_reaper: bool,

        /// Disable the registration pinger.
        #[arg(long)]
        no_pinger: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,forgepoold=debug,forgepool=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            port,
            data_dir,
            coordinator,
            provider,
            provider_addr,
            pool_min,
            pool_max,
            jobs_per_agent,
            instance_type,
            region,
            subnet,
            security_group,
            pool_tag,
            reconcile_interval,
            reap_interval,
            ping_interval,
            reaper_grace,
            registration_grace,
            max_failures,
            call_timeout,
            no_reaper,
            no_pinger,
        } => {
            if pool_min > pool_max {
                anyhow::bail!("--pool-min ({pool_min}) exceeds --pool-max ({pool_max})");
            }
            let call_timeout = Duration::from_secs(call_timeout);

            info!("Forgepool daemon starting");

            // Ensure the data directory exists.
            std::fs::create_dir_all(&data_dir)?;
            let db_path = data_dir.join("forgepool.redb");

            // ── Initialize subsystems ──────────────────────────────

            let store = InstanceStore::open(&db_path)?;
            info!(path = ?db_path, "instance store opened");

            let provider: Arc<dyn Provider> = match provider {
                ProviderKind::Http => {
                    let addr = provider_addr
                        .ok_or_else(|| anyhow::anyhow!("--provider-addr is required with --provider http"))?;
                    info!(%addr, "using HTTP provider");
                    Arc::new(HttpProvider::new(addr, call_timeout))
                }
                ProviderKind::Memory => {
                    info!("using in-memory provider (dev mode)");
                    Arc::new(MemoryProvider::new())
                }
            };

            let coordinator: Arc<dyn Coordinator> =
                Arc::new(HttpCoordinator::new(coordinator, call_timeout));

            let policy = ScalePolicy {
                min_size: pool_min,
                max_size: pool_max,
                jobs_per_agent,
            };
            let template = LaunchTemplate {
                instance_type,
                region,
                subnet_id: subnet,
                security_group,
                pool_tag: pool_tag.clone(),
            };
            let mut config = ReconcilerConfig::new(policy, template);
            config.max_failures = max_failures;

            let (reconciler, status_rx) = Reconciler::new(
                store.clone(),
                provider.clone(),
                coordinator,
                config,
            );
            info!(
                interval = reconcile_interval,
                min = pool_min,
                max = pool_max,
                "reconciler initialized"
            );

            let reaper = Reaper::new(
                store.clone(),
                provider.clone(),
                pool_tag,
                Duration::from_secs(reaper_grace),
            )
            .with_enabled(!no_reaper);

            let pinger = Pinger::new(
                store.clone(),
                provider,
                Duration::from_secs(registration_grace),
            )
            .with_enabled(!no_pinger);

            // ── Shutdown signal ────────────────────────────────────

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let reconcile_shutdown = shutdown_rx.clone();
            let reap_shutdown = shutdown_rx.clone();
            let ping_shutdown = shutdown_rx;

            // ── Start background tasks ─────────────────────────────

            let reconcile_handle = tokio::spawn(async move {
                reconciler
                    .run(Duration::from_secs(reconcile_interval), reconcile_shutdown)
                    .await;
            });

            let reap_handle = tokio::spawn(async move {
                reaper
                    .run(Duration::from_secs(reap_interval), reap_shutdown)
                    .await;
            });

            let ping_handle = tokio::spawn(async move {
                pinger
                    .run(Duration::from_secs(ping_interval), ping_shutdown)
                    .await;
            });

            // ── Start API server ───────────────────────────────────

            let router = forgepool_api::build_router(store, status_rx);
            let addr = SocketAddr::from(([0, 0, 0, 0], port));

            info!(%addr, "API server starting");

            let listener = tokio::net::TcpListener::bind(addr).await?;

            // Graceful shutdown on Ctrl-C: stop scheduling new cycles and
            // let the in-flight cycle finish.
            let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                tokio::signal::ctrl_c()
                    .await
                    .expect("failed to install CTRL+C handler");
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            });

            server.await?;

            // Wait for background tasks.
            let _ = reconcile_handle.await;
            let _ = reap_handle.await;
            let _ = ping_handle.await;

            info!("Forgepool daemon stopped");
            Ok(())
        }
    }
}
