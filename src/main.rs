//! fxlaunch
//!
//! Starts the forex signal bot and its MetaTrader 5 MCP server, making
//! sure exactly one server owns the MCP port.

mod config;
mod db;
mod health;
mod launcher;
mod logging;
mod operator;
mod process;
mod supervisor;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::config::{mask, BotSettings, LauncherConfig};
use crate::db::{Database, SessionSummary, StoredSupervisorEvent};
use crate::health::HealthProbe;
use crate::launcher::{CommandSpec, LaunchReport, LaunchRequest, OsRunner, SingletonLauncher, StartMode};
use crate::logging::{parse_level, setup_logging, DEFAULT_DEPLOY_LOG};
use crate::operator::{AutoOperator, ConsoleOperator, Operator};
use crate::process::SystemProcessTable;
use crate::supervisor::{Supervisor, SupervisorConfig, SupervisorOutcome};

/// Forex bot launcher CLI.
#[derive(Parser)]
#[command(name = "fxlaunch")]
#[command(about = "Start the forex bot and its MetaTrader 5 MCP server", long_about = None)]
struct Cli {
    /// Launch journal database
    #[arg(short, long, default_value = "sqlite:./fxlaunch.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Also write the log to this file (deploy defaults to fxlaunch-deploy.log)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Launcher config file (JSON)
    #[arg(short, long, default_value = "launcher.json")]
    config: PathBuf,

    /// Environment file with the bot settings
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// MCP server host
    #[arg(long, env = "MCP_HOST")]
    host: Option<String>,

    /// MCP server port
    #[arg(long, env = "MCP_PORT")]
    port: Option<u16>,

    /// Never wait for the operator
    #[arg(short, long)]
    yes: bool,

    /// Do not pause before exiting after a failure
    #[arg(long)]
    no_pause: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the MCP server on its port, replacing any previous instance
    Server {
        /// Detach instead of waiting for the server to exit
        #[arg(long)]
        background: bool,

        /// Do not check that the MetaTrader terminal is running
        #[arg(long)]
        skip_terminal_check: bool,

        /// Server command to use instead of the configured one
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Start the MCP server in the background, wait, then run the bot
    Bot {
        /// Start the MCP server even when MT5_ENABLED is false
        #[arg(long)]
        with_mcp: bool,

        /// Do not check that the MetaTrader terminal is running
        #[arg(long)]
        skip_terminal_check: bool,

        /// Bot command to use instead of the configured one
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Kill every process bound to the MCP port
    Stop,

    /// Check that the MCP server is reachable and healthy
    Check {
        /// Number of attempts
        #[arg(short, long)]
        attempts: Option<u32>,

        /// Seconds between attempts
        #[arg(long)]
        delay: Option<u64>,
    },

    /// Run the bot under supervision, restarting it when it exits
    Deploy {
        /// Maximum number of restarts
        #[arg(long)]
        max_restarts: Option<u32>,

        /// Start the MCP server even when MT5_ENABLED is false
        #[arg(long)]
        with_mcp: bool,

        /// Do not check that the MetaTrader terminal is running
        #[arg(long)]
        skip_terminal_check: bool,
    },

    /// Show effective configuration
    Config,

    /// Show recent launches and supervisor events
    Status {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value = "10")]
        limit: i64,

        /// Show every event of one supervisor session
        #[arg(long)]
        session: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_file = cli.log_file.clone().or_else(|| {
        matches!(cli.command, Commands::Deploy { .. }).then(|| PathBuf::from(DEFAULT_DEPLOY_LOG))
    });
    setup_logging(parse_level(&cli.log_level), log_file.as_deref())?;
    if let Some(path) = &log_file {
        info!(path = %path.display(), "Writing log file");
    }

    // The env file may also carry MCP_HOST / MCP_PORT
    let settings = BotSettings::load(&cli.env_file);
    let host = cli.host.clone().or_else(|| std::env::var("MCP_HOST").ok());
    let port = match cli.port {
        Some(port) => Some(port),
        None => match std::env::var("MCP_PORT") {
            Ok(raw) => Some(raw.trim().parse::<u16>().context("Invalid MCP_PORT")?),
            Err(_) => None,
        },
    };

    let config = LauncherConfig::load(&cli.config)?.with_endpoint(host, port);

    let operator: Box<dyn Operator> = if cli.yes {
        Box::new(AutoOperator)
    } else {
        Box::new(ConsoleOperator)
    };
    let processes = SystemProcessTable::new();
    let runner = OsRunner;
    let launcher = SingletonLauncher::new(&processes, &runner, operator.as_ref());

    let success = match cli.command {
        Commands::Server {
            background,
            skip_terminal_check,
            command,
        } => {
            let journal = open_journal(&cli.database).await;
            let command = CommandSpec::from_argv(&command).unwrap_or_else(|| config.server_command.clone());

            println!("\n=== MetaTrader 5 MCP Server ===");
            println!("Address:  {}", config.server_url());
            println!("Command:  {}", command);
            println!("Mode:     {}", if background { "background" } else { "foreground" });
            println!(
                "Account:  {} on {}",
                settings.mt5_account.as_deref().unwrap_or("(not set)"),
                settings.mt5_server.as_deref().unwrap_or("(not set)")
            );
            if !background {
                println!("\nPress Ctrl+C to stop the server.\n");
            }

            let request = server_request(&config, command, background, skip_terminal_check);
            let report = launch_journaled(&launcher, journal.as_ref(), &request).await;
            println!("\n{}", report);
            report.outcome.is_success()
        }

        Commands::Bot {
            with_mcp,
            skip_terminal_check,
            command,
        } => {
            let journal = open_journal(&cli.database).await;

            if settings.mt5_enabled || with_mcp {
                start_mcp_in_background(&launcher, journal.as_ref(), &config, skip_terminal_check).await?;
            } else {
                info!("MT5_ENABLED is false, not starting the MCP server");
            }

            let command = CommandSpec::from_argv(&command).unwrap_or_else(|| config.bot_command.clone());

            println!("\n=== Forex Trading Bot ===");
            println!("Pair:     {}", settings.currency_pair);
            println!("Risk:     {}%", settings.risk_percentage);
            println!("MT5:      {}", if settings.mt5_enabled { "enabled" } else { "disabled" });
            println!("\nPress Ctrl+C to stop the bot.\n");

            let request = LaunchRequest {
                name: "bot".to_string(),
                host: config.host.clone(),
                port: config.port,
                command,
                fallback: config.bot_fallback.clone(),
                install_dir: config.install_dir.clone(),
                mode: StartMode::Foreground,
                require_process: None,
                clear_port: false,
            };
            let report = launch_journaled(&launcher, journal.as_ref(), &request).await;
            println!("\n{}", report);
            report.outcome.is_success()
        }

        Commands::Stop => {
            let (occupants, killed, failures) = launcher.clear_port(config.port).await;

            if occupants.is_empty() {
                println!("Nothing is bound to port {}.", config.port);
            } else {
                println!("Port {} occupants: {:?}", config.port, occupants);
                println!("Killed:            {:?}", killed);
                if !failures.is_empty() {
                    println!("Already gone:      {:?}", failures);
                }
            }
            true
        }

        Commands::Check { attempts, delay } => {
            let attempts = attempts.unwrap_or(config.health_attempts);
            let delay = delay.map(Duration::from_secs).unwrap_or_else(|| config.health_delay());

            println!(
                "Checking MCP server at {} ({} attempts, {}s apart)",
                config.server_url(),
                attempts,
                delay.as_secs()
            );

            let probe = HealthProbe::new(config.host.clone(), config.port)?;
            let report = probe.wait_until_ready(attempts, delay).await;
            println!("\n{}", report);

            if !report.is_ready() {
                println!("Suggested fixes:");
                println!("  1. Start the server with 'fxlaunch server'");
                println!("  2. Check whether another process is using port {}", config.port);
                println!("  3. Make sure MetaTrader 5 is open and logged in");
            }
            report.is_ready()
        }

        Commands::Deploy {
            max_restarts,
            with_mcp,
            skip_terminal_check,
        } => {
            let journal = open_journal(&cli.database).await;

            if settings.mt5_enabled || with_mcp {
                start_mcp_in_background(&launcher, journal.as_ref(), &config, skip_terminal_check).await?;
            }

            let supervisor_config = SupervisorConfig {
                command: config.bot_command.clone(),
                install_dir: config.install_dir.clone(),
                max_restarts: max_restarts.unwrap_or(config.max_restarts),
                restart_delay: config.restart_delay(),
                check_interval: config.check_interval(),
                stop_timeout: Duration::from_secs(5),
            };

            println!("\n=== Forex Trading Bot Deployment ===");
            println!("Command:      {}", supervisor_config.command);
            println!("Max restarts: {}", supervisor_config.max_restarts);
            println!("Started at:   {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
            println!("\nPress Ctrl+C to stop the bot.\n");

            let supervisor = Supervisor::new(supervisor_config, &processes, journal.as_ref());
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Could not listen for Ctrl+C");
                    std::future::pending::<()>().await;
                }
            };

            let summary = supervisor.run(shutdown).await?;
            println!("\n{}", summary);
            summary.outcome == SupervisorOutcome::Stopped
        }

        Commands::Config => {
            print_config(&config, &settings);
            true
        }

        Commands::Status { limit, session } => {
            let db = Database::new(&cli.database).await?;
            match session {
                Some(session) => print_session(&db, &session).await?,
                None => print_status(&db, limit).await?,
            }
            true
        }
    };

    if !success {
        if config.pause_on_exit && !cli.no_pause {
            operator.acknowledge("Press Enter to close...").await;
        }
        std::process::exit(1);
    }

    Ok(())
}

fn server_request(
    config: &LauncherConfig,
    command: CommandSpec,
    background: bool,
    skip_terminal_check: bool,
) -> LaunchRequest {
    LaunchRequest {
        name: "mcp-server".to_string(),
        host: config.host.clone(),
        port: config.port,
        command,
        fallback: config.server_fallback.clone(),
        install_dir: config.install_dir.clone(),
        mode: if background {
            StartMode::Background {
                grace: config.start_grace(),
            }
        } else {
            StartMode::Foreground
        },
        require_process: (!skip_terminal_check).then(|| config.terminal_image.clone()),
        clear_port: true,
    }
}

/// Start the MCP server detached, then wait the fixed startup delay.
async fn start_mcp_in_background(
    launcher: &SingletonLauncher<'_>,
    journal: Option<&Database>,
    config: &LauncherConfig,
    skip_terminal_check: bool,
) -> Result<()> {
    let request = server_request(config, config.server_command.clone(), true, skip_terminal_check);
    let report = launch_journaled(launcher, journal, &request).await;
    println!("\n{}", report);

    if report.outcome.pid().is_none() {
        warn!("MCP server is not running; the bot will run without MetaTrader");
        return Ok(());
    }

    info!(delay_secs = config.startup_delay_secs, "Waiting for MCP server to start");
    tokio::time::sleep(config.startup_delay()).await;

    let probe = HealthProbe::new(config.host.clone(), config.port)?;
    if probe.port_open().await {
        info!(port = config.port, "MCP server port is open");
    } else {
        warn!(port = config.port, "MCP server port is not open yet");
    }

    Ok(())
}

/// Launch and record the launch in the journal when one is available.
async fn launch_journaled(
    launcher: &SingletonLauncher<'_>,
    journal: Option<&Database>,
    request: &LaunchRequest,
) -> LaunchReport {
    let launch_id = match journal {
        Some(db) => match db.record_launch_start(request).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "Failed to journal launch");
                None
            }
        },
        None => None,
    };

    let report = launcher.launch(request).await;

    if let (Some(db), Some(id)) = (journal, launch_id) {
        if let Err(e) = db.record_launch_finish(&id, &report).await {
            warn!(error = %e, "Failed to journal launch result");
        }
    }

    report
}

/// The journal is optional for launches; a broken database must not block a start.
async fn open_journal(database_url: &str) -> Option<Database> {
    match Database::new(database_url).await {
        Ok(db) => Some(db),
        Err(e) => {
            warn!(error = %e, "Launch journal unavailable");
            None
        }
    }
}

fn print_config(config: &LauncherConfig, settings: &BotSettings) {
    println!("\n=== Launcher Configuration ===\n");
    println!("MCP Server:");
    println!("  Address:            {}", config.server_url());
    println!("  Command:            {}", config.server_command);
    println!(
        "  Fallback:           {}",
        config
            .server_fallback
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "(none)".to_string())
    );
    println!("  Terminal Process:   {}", config.terminal_image);
    println!("  Start Grace:        {}s", config.start_grace_secs);

    println!("\nBot:");
    println!("  Command:            {}", config.bot_command);
    println!(
        "  Fallback:           {}",
        config
            .bot_fallback
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "(none)".to_string())
    );
    println!("  Startup Delay:      {}s", config.startup_delay_secs);
    println!("  Install Dir:        {}", config.install_dir.display());

    println!("\nHealth Check:");
    println!("  Attempts:           {}", config.health_attempts);
    println!("  Delay:              {}s", config.health_delay_secs);

    println!("\nSupervisor:");
    println!("  Max Restarts:       {}", config.max_restarts);
    println!("  Restart Delay:      {}s", config.restart_delay_secs);
    println!("  Check Interval:     {}s", config.check_interval_secs);

    println!("\n=== Bot Environment ===\n");
    println!("  Telegram Token:     {}", mask(settings.telegram_bot_token.as_deref()));
    println!(
        "  Telegram Chat:      {}",
        settings.telegram_chat_id.as_deref().unwrap_or("(not set)")
    );
    println!("  Currency Pair:      {}", settings.currency_pair);
    println!("  Risk Percentage:    {}%", settings.risk_percentage);
    println!("  Position Size:      {}", settings.default_position_size);
    println!("  Timezone:           {}", settings.timezone);
    println!(
        "  MT5 Account:        {}",
        settings.mt5_account.as_deref().unwrap_or("(not set)")
    );
    println!("  MT5 Password:       {}", mask(settings.mt5_password.as_deref()));
    println!(
        "  MT5 Server:         {}",
        settings.mt5_server.as_deref().unwrap_or("(not set)")
    );
    println!("  MT5 Server URL:     {}", settings.mt5_server_url);
    println!("  MT5 Enabled:        {}", settings.mt5_enabled);
    println!("  MT5 Auto Trade:     {}", settings.mt5_auto_trade);
}

async fn print_status(db: &Database, limit: i64) -> Result<()> {
    let (total, failed, fallbacks) = db.launch_stats().await?;
    let launches = db.recent_launches(limit).await?;
    let events = db.recent_supervisor_events(limit).await?;

    println!("\n=== Launches ===");
    println!("Total:          {}", total);
    println!("Failed:         {}", failed);
    println!("Used Fallback:  {}", fallbacks);

    if launches.is_empty() {
        println!("\nNo launches recorded. Use 'fxlaunch server' or 'fxlaunch bot' to start one.");
    } else {
        println!(
            "\n{:<26} {:<11} {:>6} {:<11} {:<28} {}",
            "STARTED", "KIND", "PORT", "MODE", "COMMAND", "OUTCOME"
        );
        println!("{}", "-".repeat(100));
        for launch in &launches {
            println!(
                "{:<26} {:<11} {:>6} {:<11} {:<28} {}",
                truncate(&launch.started_at, 25),
                truncate(&launch.kind, 10),
                launch.port,
                launch.mode,
                truncate(&launch.command, 27),
                launch.outcome.as_deref().unwrap_or("running?")
            );
        }
    }

    if let Some(summary) = db.supervisor_summary(None).await? {
        print_session_summary(&summary);
    }

    if !events.is_empty() {
        println!("\n=== Supervisor Events ===");
        for event in &events {
            print_event(event);
        }
    }

    Ok(())
}

async fn print_session(db: &Database, session_id: &str) -> Result<()> {
    let Some(summary) = db.supervisor_summary(Some(session_id)).await? else {
        println!("No supervisor session {}.", session_id);
        return Ok(());
    };
    print_session_summary(&summary);

    println!("\n=== Events ===");
    for event in &db.session_events(session_id).await? {
        print_event(event);
    }
    Ok(())
}

fn print_session_summary(summary: &SessionSummary) {
    println!("\n=== Supervisor Session {} ===", summary.session_id);
    println!("From:       {}", summary.first_at);
    println!("To:         {}", summary.last_at);
    println!("Starts:     {}", summary.starts);
    println!("Exits:      {}", summary.exits);
    println!("Restarts:   {}", summary.restarts);
    println!(
        "Last exit:  {}",
        summary
            .last_exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("State:      {}", summary.last_event);
}

fn print_event(event: &StoredSupervisorEvent) {
    println!(
        "  [{}] {} {:<12} pid={} code={} restarts={}",
        truncate(&event.at, 25),
        truncate(&event.session_id, 8),
        event.event,
        event.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
        event.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
        event.restart_count
    );
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
