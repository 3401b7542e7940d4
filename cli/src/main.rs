//! Outpost CLI: the command-line entry point for the orchestrator.
//!
//! # Usage
//!
//! ```text
//! outpost start --watch -- bitbake core-image-minimal
//! outpost watch
//! outpost status --target builder
//! outpost set-auto-stop
//! outpost deploy squirrel-cam --target controller
//! outpost instance status
//! ```
//!
//! `start --watch` and `watch` follow the job log in the foreground.
//! Interrupting them (Ctrl-C) only detaches: the job keeps running in its
//! remote session and auto-stop is not triggered. Run `outpost watch` again
//! to reattach.

use std::io::Write;
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use outpost_core::deploy::DeployStatus;
use outpost_core::infrastructure::tmux::shell_escape;
use outpost_core::orchestrator::WatchReport;
use outpost_core::policy::AutoStopAction;
use outpost_core::session::{CancelFlag, TerminateOutcome};
use outpost_core::settings::resolve_config_dir;
use outpost_core::{Backends, Orchestrator, OutpostError, Settings};

/// Exit code when a watched job's log shows a build failure.
const BUILD_FAILURE_EXIT: i32 = 20;


#[derive(Parser)]
#[command(name = "outpost")]
#[command(about = "Detached remote sessions, instance lifecycle and container deploys over SSH", long_about = None)]
#[command(version)]
struct Cli {
    /// Target name (defaults to the registry default)
    #[arg(short, long, global = true, env = "OUTPOST_TARGET")]
    target: Option<String>,

    /// Settings directory
    #[arg(long, global = true, env = "OUTPOST_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the job in a detached session
    Start {
        /// Follow the log until the job ends
        #[arg(short, long)]
        watch: bool,
        /// Command to run on the target. Several arguments are quoted one
        /// by one; a single argument is used as a shell command line.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Stream the job log until the session ends (Ctrl-C detaches and
    /// leaves the job running)
    Watch,

    /// Report whether the job is running
    Status,

    /// Kill the job's session
    Terminate,

    /// Print the tail of the job log
    Logs {
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },

    /// Stop the instance when a watched job ends
    SetAutoStop,

    /// Leave the instance running when a watched job ends
    UnsetAutoStop,

    /// Show the auto-stop flag
    CheckAutoStop,

    /// Deploy a container unit
    Deploy {
        unit: String,
        /// Compare identities without building or shipping
        #[arg(long)]
        check: bool,
    },

    /// Mirror a local directory to the target
    Push { local: String, remote: String },

    /// Copy a path from the target
    Pull { remote: String, local: String },

    /// Uptime, disk and container count of the target
    Health,

    /// Control the cloud build instance
    Instance {
        #[command(subcommand)]
        command: InstanceCommands,
    },

    /// List configured targets
    Targets,
}

#[derive(Subcommand)]
enum InstanceCommands {
    Status,
    Start,
    Stop,
    Address,
}


fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("outpost: {:#}", err);
            let code = err
                .downcast_ref::<OutpostError>()
                .map(|e| e.exit_code())
                .unwrap_or(1);
            process::exit(code);
        }
    }
}


fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("OUTPOST_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}


fn run(cli: Cli) -> anyhow::Result<i32> {
    let config_dir = cli.config_dir.clone().unwrap_or_else(resolve_config_dir);
    let settings = Settings::load(&config_dir)
        .with_context(|| format!("loading settings from {}", config_dir.display()))?;
    let backends = Backends::production(&settings, &config_dir);
    let orch = Orchestrator::new(settings, backends)?;
    let target = cli.target.as_deref();
    let json = cli.json;

    match cli.command {
        Commands::Start { watch, command } => {
            let session = orch.start_session(target, &command_line(&command))?;
            if json && !watch {
                print_json(&session)?;
            } else {
                eprintln!(
                    "started session '{}' on {} (log {})",
                    session.name, session.target, session.log_path
                );
            }
            if watch {
                return watch_session(&orch, target);
            }
        }
        Commands::Watch => return watch_session(&orch, target),
        Commands::Status => {
            let status = orch.session_status(target)?;
            if json {
                print_json(&status)?;
            } else {
                println!("{}", status);
            }
        }
        Commands::Terminate => match orch.terminate(target)? {
            TerminateOutcome::Terminated => println!("terminated"),
            TerminateOutcome::NotRunning => println!("no session running"),
        },
        Commands::Logs { lines } => {
            for line in orch.tail(target, lines)? {
                println!("{}", line);
            }
        }
        Commands::SetAutoStop => {
            orch.set_auto_stop()?;
            println!("auto-stop enabled for {}", orch.settings().environment);
        }
        Commands::UnsetAutoStop => {
            orch.unset_auto_stop()?;
            println!("auto-stop disabled for {}", orch.settings().environment);
        }
        Commands::CheckAutoStop => {
            let enabled = orch.auto_stop_enabled()?;
            println!(
                "auto-stop {} for {}",
                if enabled { "enabled" } else { "disabled" },
                orch.settings().environment
            );
        }
        Commands::Deploy { unit, check } => {
            if check {
                let state = orch.deploy_check(&unit, target)?;
                println!("unit:    {} on {}", state.unit, state.target);
                println!("source:  {}", state.source_digest);
                println!("local:   {}", state.local_identity);
                println!("remote:  {}", state.remote_identity);
                println!("{}", if state.up_to_date { "up to date" } else { "out of date" });
                return Ok(0);
            }
            let outcome = orch.deploy(&unit, target, &mut |line| eprintln!("  {}", line))?;
            if json {
                print_json(&outcome)?;
            } else {
                let verb = match outcome.status {
                    DeployStatus::Deployed => "deployed",
                    DeployStatus::Skipped => "unchanged, skipped",
                };
                println!("{} {} on {}: {}", outcome.unit, verb, outcome.target, outcome.identity);
            }
        }
        Commands::Push { local, remote } => {
            let report = orch.push(target, &local, &remote, &mut |line| eprintln!("{}", line))?;
            print_transfer(report.bytes_sent);
        }
        Commands::Pull { remote, local } => {
            let report = orch.pull(target, &remote, &local, &mut |line| eprintln!("{}", line))?;
            print_transfer(report.bytes_sent);
        }
        Commands::Health => {
            let health = orch.health(target)?;
            if json {
                print_json(&health)?;
            } else {
                println!("target:     {}", health.target);
                println!("uptime:     {}", opt(health.uptime_seconds.map(|s| format!("{}h", s / 3600))));
                println!("disk:       {}", opt(health.disk_percent.map(|p| format!("{}%", p))));
                println!("containers: {}", opt(health.containers_running));
                for warning in health.warnings() {
                    eprintln!("warning: {}", warning);
                }
            }
        }
        Commands::Instance { command } => instance_command(&orch, command, json)?,
        Commands::Targets => {
            let registry = orch.registry();
            for entry in registry.entries() {
                let marker = if entry.name == registry.default_name() { "*" } else { " " };
                let host = entry.host.as_deref().unwrap_or("<instance>");
                println!(
                    "{} {:<12} {}@{}:{}",
                    marker, entry.name, entry.user, host, entry.base_dir
                );
            }
        }
    }
    Ok(0)
}


fn watch_session(orch: &Orchestrator, target: Option<&str>) -> anyhow::Result<i32> {
    let sink = Box::new(|line: String| {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", line);
    });
    // Never raised here: a signal ends the process, which detaches from the
    // remote session without stopping it.
    let report = orch.watch(target, sink, &CancelFlag::new())?;
    Ok(report_watch(&report))
}


/// The remote command line for `start`'s trailing arguments.
fn command_line(args: &[String]) -> String {
    match args {
        [single] => single.clone(),
        _ => args.iter().map(|a| shell_escape(a)).collect::<Vec<_>>().join(" "),
    }
}


fn report_watch(report: &WatchReport) -> i32 {
    match report.auto_stop {
        Some(AutoStopAction::Stopped(_)) => eprintln!("auto-stop: instance stop requested"),
        Some(AutoStopAction::Disabled) => eprintln!("auto-stop off: instance left running"),
        _ => {}
    }
    match &report.outcome.failure {
        Some(failure) => {
            eprintln!("build failure detected:");
            for line in &failure.lines {
                eprintln!("  {}", line);
            }
            BUILD_FAILURE_EXIT
        }
        None => 0,
    }
}


fn instance_command(orch: &Orchestrator, command: InstanceCommands, json: bool) -> anyhow::Result<()> {
    match command {
        InstanceCommands::Status => {
            let report = orch.instance_report(Utc::now())?;
            match &report.description {
                None => println!("{}: absent", report.name),
                Some(desc) if json => print_json(desc)?,
                Some(desc) => {
                    println!("{} ({}): {}", report.name, desc.id, desc.state);
                    if let Some(addr) = &desc.public_address {
                        println!("address: {}", addr);
                    }
                    if let Some(hours) = report.uptime_hours {
                        println!("uptime:  {}h", hours);
                    }
                }
            }
            if let Some(warning) = &report.warning {
                eprintln!("warning: {}", warning);
            }
        }
        InstanceCommands::Start => {
            let desc = orch.instance_start()?;
            println!("{}: {} {}", desc.id, desc.state, opt(desc.public_address));
        }
        InstanceCommands::Stop => {
            let outcome = orch.instance_stop()?;
            println!("{:?}", outcome);
        }
        InstanceCommands::Address => println!("{}", orch.instance_address()?),
    }
    Ok(())
}


fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}


fn print_transfer(bytes: Option<u64>) {
    match bytes {
        Some(b) => println!("sent {} bytes", b),
        None => println!("done"),
    }
}


fn opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}
