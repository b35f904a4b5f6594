use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cirrus_core::convergence::{AgentDispatcher, RuleConvergence};
use cirrus_core::network::NetworkStore;
use cirrus_core::ruleset_log::VmRulesetLog;
use cirrus_core::security_group::{InMemoryPolicy, RuleSet, RuleSignature};
use cirrus_core::storage::{open_database, TransactionExecutor};
use cirrus_core::sync::{SecurityGroupSync, Sweeper, SyncWorker};
use cirrus_core::types::{VmId, WorkerId};
use cirrus_core::work_queue::{SecurityGroupWorkQueue, Step};
use cirrus_core::{CapabilityRegistry, CirrusConfig, CirrusResult, NetworkState};

#[derive(Parser)]
#[command(name = "cirrus")]
#[command(about = "Network control plane: lifecycle, catalog and security-group sync", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "CIRRUS_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// redb holds an exclusive lock on the database file for the life of the process
const STORE_LOCK_NOTE: &str = "Opens the control-plane store directly. The store file is locked by \
whichever process has it open, so this command fails while `cirrus run` is running \
against the same storage.data_dir; stop the daemon first.";

#[derive(Subcommand)]
enum Commands {
    /// Run sync workers and the queue sweeper until interrupted
    Run,
    /// Security-group work queue
    #[command(after_help = STORE_LOCK_NOTE)]
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Per-VM ruleset sequence log
    #[command(after_help = STORE_LOCK_NOTE)]
    Ruleset {
        #[command(subcommand)]
        command: RulesetCommands,
    },
    /// Network records
    #[command(after_help = STORE_LOCK_NOTE)]
    Network {
        #[command(subcommand)]
        command: NetworkCommands,
    },
    /// Service and provider catalog
    Catalog {
        #[command(subcommand)]
        command: CatalogCommands,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List work items
    List {
        /// Only items in this step (scheduled, processing, done, error)
        #[arg(long)]
        step: Option<String>,
    },
    /// Recover abandoned items and delete expired ones once
    Sweep,
}

#[derive(Subcommand)]
enum RulesetCommands {
    /// Show the log entry of one VM, or every entry
    Show {
        #[arg(long)]
        vm: Option<u64>,
    },
    /// Record a rule change for the given VMs and queue their sync
    Bump {
        #[arg(long, num_args = 1.., required = true)]
        vm: Vec<u64>,
    },
}

#[derive(Subcommand)]
enum NetworkCommands {
    /// List networks
    List {
        /// Only networks in this state
        #[arg(long)]
        state: Option<NetworkState>,
    },
}

#[derive(Subcommand)]
enum CatalogCommands {
    /// Check that a provider supports every listed service
    Check {
        #[arg(long)]
        provider: String,
        #[arg(long, num_args = 1.., required = true)]
        service: Vec<String>,
    },
    /// List services and providers
    List,
}

/// Agent dispatcher that only logs what it would push
struct LoggingDispatcher;

#[async_trait]
impl AgentDispatcher for LoggingDispatcher {
    async fn push(&self, vm: VmId, signature: &RuleSignature, rules: &RuleSet) -> CirrusResult<()> {
        info!("Would push {} rules to {} (signature {:?})", rules.len(), vm, signature.as_str());
        Ok(())
    }
}

fn init_logging(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("cirrus=info,cirrus_core=info"))
        .context("invalid log filter")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_step(value: &str) -> Result<Step> {
    match value.to_ascii_lowercase().as_str() {
        "scheduled" => Ok(Step::Scheduled),
        "processing" => Ok(Step::Processing),
        "done" => Ok(Step::Done),
        "error" => Ok(Step::Error),
        other => anyhow::bail!("unknown step '{}'", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    let config = CirrusConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Run => {
            let stores = Stores::open(&config)?;
            run(&config, stores.log, stores.queue).await
        }
        Commands::Queue { command } => handle_queue_command(&config, Stores::open(&config)?.queue, command),
        Commands::Ruleset { command } => {
            let stores = Stores::open(&config)?;
            handle_ruleset_command(stores.log, stores.queue, command).await
        }
        Commands::Network { command } => handle_network_command(Stores::open(&config)?.executor, command),
        Commands::Catalog { command } => handle_catalog_command(&config, command),
    }
}

/// Handles onto the shared control-plane store
struct Stores {
    executor: TransactionExecutor,
    log: VmRulesetLog,
    queue: SecurityGroupWorkQueue,
}

impl Stores {
    fn open(config: &CirrusConfig) -> Result<Self> {
        let path = config.storage.database_path();
        let database = open_database(&path).with_context(|| {
            format!("failed to open control-plane store {} (is `cirrus run` using it?)", path.display())
        })?;
        let executor = TransactionExecutor::new(database);
        Ok(Self {
            log: VmRulesetLog::new(executor.clone(), config.retry.clone()),
            queue: SecurityGroupWorkQueue::new(executor.clone(), config.retry.clone()),
            executor,
        })
    }
}

async fn run(config: &CirrusConfig, log: VmRulesetLog, queue: SecurityGroupWorkQueue) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let policy = Arc::new(InMemoryPolicy::new());
    let convergence = Arc::new(RuleConvergence::new(Arc::new(LoggingDispatcher)));

    let mut tasks = Vec::with_capacity(config.workers.count + 1);
    for index in 0..config.workers.count {
        let worker = SyncWorker::new(
            WorkerId::new(format!("{}-{}", config.workers.server_id, index)),
            queue.clone(),
            log.clone(),
            policy.clone(),
            convergence.clone(),
        )
        .with_poll_interval(config.workers.poll_interval);
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }

    let sweeper = Sweeper::new(queue, config.work_queue.clone());
    tasks.push(tokio::spawn(async move { sweeper.run(shutdown_rx).await }));

    info!(
        "Cirrus running as {} with {} sync workers",
        config.workers.server_id, config.workers.count
    );

    wait_for_signal().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }
    info!("Cirrus stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for SIGINT")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")
}

fn handle_queue_command(
    config: &CirrusConfig,
    queue: SecurityGroupWorkQueue,
    command: QueueCommands,
) -> Result<()> {
    match command {
        QueueCommands::List { step } => {
            let items = match step {
                Some(step) => queue.list_by_step(parse_step(&step)?)?,
                None => queue.list()?,
            };
            print_json(&items)
        }
        QueueCommands::Sweep => {
            let report = Sweeper::new(queue, config.work_queue.clone()).sweep_once()?;
            print_json(&report)
        }
    }
}

async fn handle_ruleset_command(
    log: VmRulesetLog,
    queue: SecurityGroupWorkQueue,
    command: RulesetCommands,
) -> Result<()> {
    match command {
        RulesetCommands::Show { vm: Some(vm) } => match log.entry(VmId(vm))? {
            Some(entry) => print_json(&entry),
            None => {
                println!("{} has no ruleset log entry (sequence 0)", VmId(vm));
                Ok(())
            }
        },
        RulesetCommands::Show { vm: None } => print_json(&log.list()?),
        RulesetCommands::Bump { vm } => {
            let vms: Vec<VmId> = vm.into_iter().map(VmId).collect();
            let scheduled = SecurityGroupSync::new(log, queue).rules_changed(&vms).await?;
            print_json(&scheduled)
        }
    }
}

fn handle_network_command(executor: TransactionExecutor, command: NetworkCommands) -> Result<()> {
    let store = NetworkStore::new(executor);
    match command {
        NetworkCommands::List { state: Some(state) } => print_json(&store.list_by_state(state)?),
        NetworkCommands::List { state: None } => print_json(&store.list()?),
    }
}

fn handle_catalog_command(config: &CirrusConfig, command: CatalogCommands) -> Result<()> {
    let registry = CapabilityRegistry::from_config(&config.catalog)?;
    match command {
        CatalogCommands::Check { provider, service } => {
            registry.check_provider_supports(&provider, service.as_slice())?;
            println!("{} supports {}", provider, service.join(", "));
            Ok(())
        }
        CatalogCommands::List => {
            print_json(&registry.services().collect::<Vec<_>>())?;
            print_json(&registry.providers().collect::<Vec<_>>())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_bump_with_several_vms() {
        let cli = Cli::try_parse_from(["cirrus", "ruleset", "bump", "--vm", "1", "2", "3"]).unwrap();
        match cli.command {
            Commands::Ruleset {
                command: RulesetCommands::Bump { vm },
            } => assert_eq!(vm, vec![1, 2, 3]),
            _ => panic!("expected ruleset bump"),
        }
    }

    #[test]
    fn network_state_filter_is_parsed() {
        let cli = Cli::try_parse_from(["cirrus", "network", "list", "--state", "implemented"]).unwrap();
        match cli.command {
            Commands::Network {
                command: NetworkCommands::List { state },
            } => assert_eq!(state, Some(NetworkState::Implemented)),
            _ => panic!("expected network list"),
        }
    }

    #[test]
    fn store_commands_warn_about_the_running_daemon() {
        let cli = Cli::command();
        for name in ["queue", "ruleset", "network"] {
            let help = cli
                .find_subcommand(name)
                .and_then(|c| c.get_after_help())
                .map(|h| h.to_string())
                .unwrap_or_default();
            assert!(help.contains("cirrus run"), "{name} help: {help}");
        }
        assert!(cli
            .find_subcommand("catalog")
            .and_then(|c| c.get_after_help())
            .is_none());
    }

    #[test]
    fn step_names() {
        assert_eq!(parse_step("Processing").unwrap(), Step::Processing);
        assert!(parse_step("running").is_err());
    }
}
