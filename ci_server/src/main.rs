//! Relay CI server: receives VCS webhooks, manual build requests and
//! poll ticks, and signals viable builds to the worker queue.
//!
//! `serve` runs the HTTP surface, `changecheck` runs one poll cycle for a
//! repository (driven by cron), `migrate` creates the relational schema.

mod config;
mod db;
mod metrics;
mod migration;
mod nsq;
mod routes;
mod schema;
mod vault;
mod vcs;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use ci_signal::builds::BuildReporter;
use ci_signal::credentials::CredentialResolver;
use ci_signal::cron::{CronWriter, DEFAULT_SCRIPT};
use ci_signal::memory::{MemoryQueue, MemorySecretStore, MemoryStorage};
use ci_signal::models::poll::split_branches;
use ci_signal::poll::{self, BranchOutcome};
use ci_signal::repos::RepoService;
use ci_signal::signaler::Signaler;
use ci_signal::store::{SecretStore, Storage, TaskQueue};
use ci_signal::trigger::TriggerService;

use crate::config::ServerConfig;

#[derive(Parser)]
#[command(name = "relay-ci", about = "Relay CI build signaler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve webhooks and the build API
    Serve {
        /// Server port
        #[arg(short, long, env = "CI_PORT", default_value = "9090")]
        port: u16,

        /// Keep builds, credentials, secrets and tasks in process memory
        #[arg(long)]
        in_memory: bool,
    },
    /// Run one poll cycle for a repository
    Changecheck {
        /// Repository as `account/repo`
        acct_repo: String,

        /// Comma-separated branches to check
        branches: String,
    },
    /// Create or update the database schema
    Migrate,
}

/// The external systems the signaler talks to.
struct Backends {
    store: Arc<dyn Storage>,
    secrets: Arc<dyn SecretStore>,
    queue: Arc<dyn TaskQueue>,
}

impl Backends {
    fn connect(config: &ServerConfig, http: &reqwest::Client) -> anyhow::Result<Self> {
        let pool = db::create_pool(&config.database_url, config.db_pool_size)?;
        Ok(Self {
            store: Arc::new(db::PgStore::new(pool)),
            secrets: Arc::new(vault::VaultClient::new(
                http.clone(),
                &config.vault_addr,
                &config.vault_token,
                &config.vault_throwaway_ttl,
            )),
            queue: Arc::new(nsq::NsqProducer::new(http.clone(), &config.nsqd_http_addr)),
        })
    }

    fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryStorage::new()),
            secrets: Arc::new(MemorySecretStore::new()),
            queue: Arc::new(MemoryQueue::new()),
        }
    }
}

struct Services {
    triggers: TriggerService,
    repos: RepoService,
    reporter: BuildReporter,
}

fn build_services(config: &ServerConfig, http: &reqwest::Client, backends: &Backends) -> Services {
    let factory = Arc::new(vcs::VcsFactory::new(
        http.clone(),
        &config.github_api_url,
        &config.bitbucket_api_url,
        &config.log_base_url,
        &config.webhook_secret,
    ));
    let creds = CredentialResolver::new(backends.store.clone(), backends.secrets.clone());
    let signaler = Signaler::new(
        backends.store.clone(),
        backends.secrets.clone(),
        backends.queue.clone(),
    );
    let triggers = TriggerService::new(
        creds.clone(),
        factory.clone(),
        backends.store.clone(),
        signaler,
    );

    let mut repos = RepoService::new(
        triggers.clone(),
        backends.store.clone(),
        backends.queue.clone(),
        &config.hook_base_url,
    );
    if let Some(dir) = &config.cron_dir {
        repos = repos.with_cron(CronWriter::new(dir, DEFAULT_SCRIPT));
    }

    let reporter = BuildReporter::new(backends.store.clone(), creds, factory);
    Services {
        triggers,
        repos,
        reporter,
    }
}

async fn migrate(config: &ServerConfig) -> anyhow::Result<()> {
    let pool = db::create_pool(&config.database_url, 1)?;
    let mut conn = pool
        .get()
        .await
        .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))?;
    tracing::info!("Running database migration...");
    migration::run_migration(&mut conn).await?;
    tracing::info!("Database migration completed.");
    Ok(())
}

async fn serve(config: ServerConfig, port: u16, in_memory: bool) -> anyhow::Result<()> {
    let http = reqwest::Client::new();
    let backends = if in_memory {
        tracing::warn!("Running with in-memory backends; nothing survives a restart");
        Backends::in_memory()
    } else {
        migrate(&config).await?;
        Backends::connect(&config, &http)?
    };
    let services = build_services(&config, &http, &backends);

    let state = routes::AppState {
        triggers: services.triggers,
        repos: services.repos,
        reporter: services.reporter,
        webhook_secret: config.webhook_secret.clone(),
        metrics: metrics::init_metrics(),
    };
    let app = routes::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Relay CI listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn changecheck(config: ServerConfig, acct_repo: &str, branches: &str) -> anyhow::Result<()> {
    let http = reqwest::Client::new();
    let backends = Backends::connect(&config, &http)?;
    let services = build_services(&config, &http, &backends);
    let branches = split_branches(branches);

    let report = poll::change_check(
        &services.triggers,
        backends.store.as_ref(),
        acct_repo,
        &branches,
    )
    .await?;

    let mut failed = 0;
    for (branch, outcome) in &report.branches {
        match outcome {
            BranchOutcome::Failed(reason) => {
                failed += 1;
                tracing::error!(acct_repo, branch = %branch, "poll failed: {reason}");
            }
            other => tracing::info!(acct_repo, branch = %branch, outcome = ?other, "poll checked"),
        }
    }
    tracing::info!(
        acct_repo,
        branches = report.branches.len(),
        failed,
        "Poll cycle complete"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();
    let config = ServerConfig::from_env();

    match cli.command {
        Command::Serve { port, in_memory } => serve(config, port, in_memory).await,
        Command::Changecheck {
            acct_repo,
            branches,
        } => changecheck(config, &acct_repo, &branches).await,
        Command::Migrate => migrate(&config).await,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
