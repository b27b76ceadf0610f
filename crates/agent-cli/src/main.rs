// ============================================================================
// fleet-agent - device management agent host
// ============================================================================
// Usage:
//   fleet-agent run                             Run the agent, reading events from stdin
//   fleet-agent trigger new-tasks               Run one sync event and exit
//   fleet-agent server-url [URL]                Show or set the management server URL
//   fleet-agent stats                           Show task store statistics
//   fleet-agent list-tasks [--status STATUS]    List tasks (optionally filtered)
//   fleet-agent export --format json            Export the task store as JSON
// ============================================================================

use agent_core::{
    AgentConfig, AgentDb, HostPlatform, HttpTransport, SyncController, SyncEvent, TaskStatus,
    Worker,
};
use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Device management agent
#[derive(Parser)]
#[command(name = "fleet-agent", version, about = "Keep this device in sync with its management server")]
struct Cli {
    /// Path to the database file (default: ~/.fleet-agent/agent.redb)
    #[arg(long, global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent; one event per stdin line until EOF or Ctrl-C
    Run,

    /// Run a single sync event through the worker and exit
    Trigger {
        #[arg(value_enum)]
        event: EventArg,

        /// Installed package name (for package-added)
        #[arg(long)]
        package: Option<String>,

        /// Treat the device as having no connectivity
        #[arg(long)]
        offline: bool,
    },

    /// Show or set the management server base URL
    ServerUrl {
        url: Option<String>,
    },

    /// Show task store statistics
    Stats,

    /// List tasks with optional filters
    ListTasks {
        /// Filter by status: pending, success, failed
        #[arg(long)]
        status: Option<String>,

        /// Only tasks whose status the server has not acknowledged
        #[arg(long)]
        unsynced: bool,
    },

    /// Export the task store as JSON
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum EventArg {
    NewTasks,
    Connectivity,
    PackageAdded,
    PropertiesChanged,
    Boot,
}

fn parse_status(s: &str) -> Result<TaskStatus> {
    match s.to_lowercase().as_str() {
        "pending" => Ok(TaskStatus::Pending),
        "success" => Ok(TaskStatus::Success),
        "failed" => Ok(TaskStatus::Failed),
        _ => anyhow::bail!(
            "Unknown status '{}'. Valid values: pending, success, failed",
            s
        ),
    }
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    // Initialize logging (stderr, so listings on stdout stay clean)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fleet_agent=debug".parse()?)
                .add_directive("agent_core=debug".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AgentConfig::default();
    if cli.db_path.is_some() {
        config.db_path = cli.db_path.clone();
    }

    let db = AgentDb::open(config.db_path.as_deref())?;
    seed_server_url(&db, &config)?;

    match cli.command {
        Commands::Run => cmd_run(db, &config).await,
        Commands::Trigger {
            event,
            package,
            offline,
        } => cmd_trigger(db, &config, event, package, offline).await,
        Commands::ServerUrl { url } => cmd_server_url(&db, url),
        Commands::Stats => cmd_stats(&db),
        Commands::ListTasks { status, unsynced } => cmd_list_tasks(&db, status, unsynced),
        Commands::Export { format } => cmd_export(&db, &format),
    }
}

/// First run: take the server URL from configuration
fn seed_server_url(db: &AgentDb, config: &AgentConfig) -> Result<()> {
    if let Some(url) = &config.server_url {
        if db.server_url()?.is_none() {
            info!("Seeding server url from configuration: {}", url);
            db.set_server_url(url)?;
        }
    }
    Ok(())
}

fn build_agent(db: AgentDb, config: &AgentConfig) -> (Arc<HostPlatform>, Worker) {
    let db = Arc::new(db);
    let transport = Arc::new(HttpTransport::new(config.http_timeout()));
    let platform = Arc::new(HostPlatform::new(
        config.device_id.clone(),
        config.data_dir.clone(),
        config.install_command.clone(),
    ));

    let controller = Arc::new(SyncController::new(db, transport, platform.clone()));
    let worker = Worker::start(controller, config.job_timeout());
    (platform, worker)
}

fn to_event(event: EventArg, package: Option<String>) -> Result<SyncEvent> {
    Ok(match event {
        EventArg::NewTasks => SyncEvent::NewTasksAvailable,
        EventArg::Connectivity => SyncEvent::ConnectivityRestored,
        EventArg::PackageAdded => match package {
            Some(name) => SyncEvent::PackageInstallConfirmed(name),
            None => anyhow::bail!("package-added requires --package NAME"),
        },
        EventArg::PropertiesChanged => SyncEvent::DevicePropertiesChanged,
        EventArg::Boot => SyncEvent::BootCompleted,
    })
}

async fn cmd_trigger(
    db: AgentDb,
    config: &AgentConfig,
    event: EventArg,
    package: Option<String>,
    offline: bool,
) -> Result<()> {
    let event = to_event(event, package)?;
    let (platform, worker) = build_agent(db, config);
    platform.set_connected(!offline);

    worker.submit(event)?;
    let stats = worker.shutdown().await?;
    if stats.timed_out > 0 {
        anyhow::bail!("Sync job timed out after {}s", config.job_timeout_secs);
    }
    Ok(())
}

/// One line of `run` input
#[derive(Debug, PartialEq)]
enum RunInput {
    Event(SyncEvent),
    Online(bool),
}

impl RunInput {
    /// Event to queue for this input. Coming online restores connectivity
    /// just like the host's own connectivity broadcast.
    fn queued_event(&self) -> Option<SyncEvent> {
        match self {
            RunInput::Event(event) => Some(event.clone()),
            RunInput::Online(true) => Some(SyncEvent::ConnectivityRestored),
            RunInput::Online(false) => None,
        }
    }
}

fn parse_run_line(line: &str) -> Result<Option<RunInput>> {
    let mut parts = line.split_whitespace();
    let Some(word) = parts.next() else {
        return Ok(None);
    };

    let input = match word {
        "new-tasks" => RunInput::Event(SyncEvent::NewTasksAvailable),
        "connectivity" => RunInput::Event(SyncEvent::ConnectivityRestored),
        "package-added" => match parts.next() {
            Some(name) => RunInput::Event(SyncEvent::PackageInstallConfirmed(name.to_string())),
            None => anyhow::bail!("package-added needs a package name"),
        },
        "properties-changed" => RunInput::Event(SyncEvent::DevicePropertiesChanged),
        "boot" => RunInput::Event(SyncEvent::BootCompleted),
        "online" => RunInput::Online(true),
        "offline" => RunInput::Online(false),
        other => anyhow::bail!("Unknown input '{}'", other),
    };
    Ok(Some(input))
}

/// Feed parsed input lines to `dispatch` until EOF, an unrecoverable read
/// error, or `interrupt` resolves. Bad lines are logged and skipped.
async fn pump_inputs<R, F>(reader: R, interrupt: impl Future<Output = ()>, mut dispatch: F)
where
    R: AsyncBufRead + Unpin,
    F: FnMut(RunInput) -> Result<()>,
{
    let mut lines = reader.lines();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                        warn!("Skipping unreadable input line: {}", e);
                        continue;
                    }
                    Err(e) => {
                        warn!("Input closed: {}", e);
                        break;
                    }
                };
                match parse_run_line(&line) {
                    Ok(Some(input)) => {
                        if let Err(e) = dispatch(input) {
                            warn!("{}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("{}", e),
                }
            }
            _ = &mut interrupt => {
                info!("Interrupted, draining queued jobs");
                break;
            }
        }
    }
}

async fn cmd_run(db: AgentDb, config: &AgentConfig) -> Result<()> {
    let (platform, worker) = build_agent(db, config);
    info!("Agent running; reading events from stdin");

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    pump_inputs(BufReader::new(tokio::io::stdin()), interrupt, |input| {
        if let RunInput::Online(connected) = input {
            platform.set_connected(connected);
        }
        match input.queued_event() {
            Some(event) => worker.submit(event),
            None => Ok(()),
        }
    })
    .await;

    let stats = worker.shutdown().await?;
    println!(
        "Jobs: {} completed, {} timed out, {} panicked",
        stats.completed, stats.timed_out, stats.panicked
    );
    Ok(())
}

fn cmd_server_url(db: &AgentDb, url: Option<String>) -> Result<()> {
    match url {
        Some(url) => {
            db.set_server_url(&url)?;
            println!("Server url set to {}", url);
        }
        None => match db.server_url()? {
            Some(url) => println!("{}", url),
            None => println!("(not set)"),
        },
    }
    Ok(())
}

fn cmd_stats(db: &AgentDb) -> Result<()> {
    let stats = db.stats()?;

    println!("=== Fleet Agent Task Store ===");
    println!("Database: {}", db.path().display());
    println!();
    println!("Tasks:    {} total", stats.total_tasks);
    for (status, count) in &stats.task_counts {
        println!("  {:12} {}", status, count);
    }
    println!("Unsynced: {}", stats.unsynced_tasks);
    println!(
        "New tasks owed: {}",
        if db.new_tasks_pending()? { "yes" } else { "no" }
    );

    Ok(())
}

fn cmd_list_tasks(db: &AgentDb, status_filter: Option<String>, unsynced: bool) -> Result<()> {
    let filter = status_filter.as_deref().map(parse_status).transpose()?;
    let tasks: Vec<_> = db
        .list_tasks(filter)?
        .into_iter()
        .filter(|t| !unsynced || !t.status_synced)
        .collect();

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<20}  {:<16}  {:<8}  {:<6}  {:<22}  {}",
        "TASK ID", "TYPE", "STATUS", "SYNCED", "UPDATED AT", "NAME / URL"
    );
    println!("{}", "-".repeat(100));

    for task in &tasks {
        let target = task
            .name
            .as_deref()
            .or(task.url.as_deref())
            .unwrap_or("-")
            .chars()
            .take(40)
            .collect::<String>();
        println!(
            "{:<20}  {:<16}  {:<8}  {:<6}  {:<22}  {}",
            task.id,
            task.task_type.as_str(),
            task.status.as_str(),
            if task.status_synced { "yes" } else { "no" },
            format_timestamp(task.updated_at),
            target
        );
    }

    println!("\nTotal: {} tasks", tasks.len());
    Ok(())
}

fn cmd_export(db: &AgentDb, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "server_url": db.server_url()?,
        "new_tasks_pending": db.new_tasks_pending()?,
        "stats": db.stats()?,
        "tasks": db.list_tasks(None)?,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}
