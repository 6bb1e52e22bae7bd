use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;
use validation_core::{
    CachePolicy, ExecutionPolicy, HookTimeouts, OrchestratorConfig, PublisherConfig, StoreConfig,
};
use validation_service::{build_router, spawn_republish_sweeper, ServiceConfig, ServiceState};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "validationd", version, about = "Payment validation REST service")]
struct Cli {
    /// Socket address to bind, e.g. 127.0.0.1:8093
    #[arg(long, default_value = "127.0.0.1:8093")]
    listen: SocketAddr,
    /// Result persistence backend. `auto` picks postgres when a database url
    /// is configured.
    #[arg(long, value_enum, default_value_t = StoreMode::Auto, env = "VALIDATION_STORE")]
    store: StoreMode,
    /// PostgreSQL url for validation result persistence.
    #[arg(long, env = "VALIDATION_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "VALIDATION_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Run the four rule families one after another instead of concurrently.
    #[arg(long, default_value_t = false)]
    serial_rules: bool,
    /// Upper bound on concurrently running rule family tasks.
    #[arg(long, default_value_t = 4)]
    max_parallel_rules: usize,
    /// Wall-clock budget for one validation fan-out, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    validation_budget_ms: u64,
    /// Disable the per-tenant rule cache.
    #[arg(long, default_value_t = false)]
    no_rule_cache: bool,
    /// Per-tenant rule cache capacity.
    #[arg(long, default_value_t = 1024)]
    rule_cache_capacity: usize,
    /// Per-call budget for the AML screening hook, in milliseconds. Hook
    /// budgets must stay below the validation budget.
    #[arg(long, default_value_t = 500)]
    aml_timeout_ms: u64,
    /// Per-call budget for the sanctions screening hook, in milliseconds.
    #[arg(long, default_value_t = 500)]
    sanctions_timeout_ms: u64,
    /// Per-call budget for the KYC hook (shared by the regulatory-flag
    /// check), in milliseconds.
    #[arg(long, default_value_t = 500)]
    kyc_timeout_ms: u64,
    /// Bounded attempts for each outcome publication.
    #[arg(long, default_value_t = 5)]
    max_publish_attempts: u32,
    /// Outcome topic name on the bus.
    #[arg(long, default_value = "payment.validation.outcome")]
    outcome_topic: String,
    /// Rows older than this many days are removed by retention cleanup.
    #[arg(long, default_value_t = 90, env = "VALIDATION_RETENTION_DAYS")]
    retention_days: i64,
    /// How often the republish sweeper drains publish tombstones, in seconds.
    #[arg(long, default_value_t = 30)]
    republish_interval_secs: u64,
}

fn resolve_store(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let store = match cli.store {
        StoreMode::Memory => StoreConfig::Memory,
        StoreMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("store=postgres requires --database-url or DATABASE_URL")
            })?;
            StoreConfig::postgres(database_url, cli.pg_max_connections)
        }
        StoreMode::Auto => match resolved_url {
            Some(database_url) => StoreConfig::postgres(database_url, cli.pg_max_connections),
            None => StoreConfig::Memory,
        },
    };

    Ok(store)
}

fn service_config(cli: &Cli, store: StoreConfig) -> ServiceConfig {
    ServiceConfig {
        store,
        policy: ExecutionPolicy {
            parallel: !cli.serial_rules,
            max_parallel_rules: cli.max_parallel_rules.max(1),
            budget_ms: cli.validation_budget_ms,
            cache: CachePolicy {
                enabled: !cli.no_rule_cache,
                capacity: cli.rule_cache_capacity.max(1),
            },
        },
        hook_timeouts: HookTimeouts {
            aml_ms: cli.aml_timeout_ms,
            sanctions_ms: cli.sanctions_timeout_ms,
            kyc_ms: cli.kyc_timeout_ms,
        },
        publisher: PublisherConfig {
            topic: cli.outcome_topic.clone(),
            max_attempts: cli.max_publish_attempts,
            ..PublisherConfig::default()
        },
        orchestrator: OrchestratorConfig {
            retention_days: cli.retention_days,
            ..OrchestratorConfig::default()
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "validation_service=info,validation_core=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let store = resolve_store(&cli)?;
    let config = service_config(&cli, store);
    let state = ServiceState::bootstrap(config).await?;

    let _sweeper = spawn_republish_sweeper(
        state.clone(),
        Duration::from_secs(cli.republish_interval_secs.max(1)),
    );

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(
        "validation-service listening on {}",
        listener.local_addr()?
    );
    axum::serve(listener, app).await?;

    Ok(())
}
