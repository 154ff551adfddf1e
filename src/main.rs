use clap::{Parser, Subcommand};
use k_dispatch::backup::location::Location;
use k_dispatch::backup::orchestrator::Orchestrator;
use k_dispatch::backup::process::ProcessRunner;
use k_dispatch::backup::result_error::error::Error;
use k_dispatch::backup::result_error::result::{convert_error_vec, Result};
use k_dispatch::backup::result_error::AddMsg;
use k_dispatch::backup::scheduler::simple::LOCK_HELD_EXIT_CODE;
use k_dispatch::backup::signals::SignalCoordinator;
use k_dispatch::backup::synchronizer::wire::parse_timestamp;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

const EXECUTION_FAILED_EXIT_CODE: i32 = 3;

/// Runs and schedules backup rules through external synchronizers
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a rule now through its scheduler
    ExecuteRule { rule: String },
    /// Hand the rules matching the patterns to their schedulers
    Schedule {
        patterns: Vec<String>,
        /// Only print what would be scheduled
        #[arg(long)]
        dry: bool,
    },
    /// Validate the rules matching the patterns
    Check { patterns: Vec<String> },
    /// Run the synchronizer of a rule directly
    Sync { rule: String },
    /// List the versions of a path kept by every rule containing it
    VersionsOf { path: String },
    /// Restore a path as it was at a version
    Restore {
        rule: String,
        path: String,
        version: String,
        destination: Option<PathBuf>,
    },
    /// List the files of a path at a version
    ListFiles {
        rule: String,
        path: String,
        version: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Show the execution history of a rule
    ShowLog { rule: String },
}

impl Command {
    fn failure_exit_code(&self) -> i32 {
        match self {
            Command::ExecuteRule { .. } | Command::Sync { .. } => EXECUTION_FAILED_EXIT_CODE,
            _ => 1,
        }
    }
}

fn location(path: &str) -> Result<Location> {
    if path.contains("://") || path.starts_with('/') {
        return path.parse();
    }
    Ok(Location::local(std::env::current_dir()?.join(path)))
}

fn run(orchestrator: &Orchestrator, command: Command) -> Result<()> {
    match command {
        Command::ExecuteRule { rule } => orchestrator.execute_rule(&rule),
        Command::Schedule { patterns, dry } => orchestrator.schedule(&patterns, dry),
        Command::Check { patterns } => orchestrator.check(&patterns),
        Command::Sync { rule } => orchestrator.sync(&rule),
        Command::VersionsOf { path } => {
            let mut errors = Vec::new();
            for result in orchestrator.versions_of(&location(&path)?)? {
                let rule = result.rule().to_string();
                match result.versions() {
                    Ok(versions) => versions
                        .iter()
                        .for_each(|v| println!("{rule}\t{}", v.to_rfc3339())),
                    Err(e) => errors.push(e),
                }
            }
            convert_error_vec(errors)
        }
        Command::Restore {
            rule,
            path,
            version,
            destination,
        } => orchestrator.restore(
            &rule,
            &location(&path)?,
            &parse_timestamp(&version).add_msg(format!("Invalid version {version:?}"))?,
            destination.as_deref(),
        ),
        Command::ListFiles {
            rule,
            path,
            version,
            recursive,
        } => orchestrator.list_files(
            &rule,
            &location(&path)?,
            &parse_timestamp(&version).add_msg(format!("Invalid version {version:?}"))?,
            recursive,
            &mut |file| println!("{}", file.display()),
        ),
        Command::ShowLog { rule } => {
            for execution in orchestrator.executions(&rule)? {
                let status = match execution.result() {
                    None => "running".to_string(),
                    Some(r) if r.succeeded() => format!("succeeded {}", r.end_time().to_rfc3339()),
                    Some(r) => format!("failed {}", r.end_time().to_rfc3339()),
                };
                println!("{} {status}", execution.start_time().to_rfc3339());
                print!("{}", indent::indent_all_with("  ", execution.output()));
            }
            Ok(())
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let signals = match SignalCoordinator::install() {
        Ok(signals) => Arc::new(signals),
        Err(e) => {
            error!("Installing signal handlers failed: {e}");
            exit(1);
        }
    };
    let failure_exit_code = args.command.failure_exit_code();

    let res = Orchestrator::load(&args.config, ProcessRunner::new(signals.clone()))
        .and_then(|orchestrator| run(&orchestrator, args.command))
        .and_then(|()| signals.checkpoint());

    match res {
        Ok(()) => exit(0),
        Err(e) => {
            error!("{e}");
            if let Some(signal) = e.signal_number() {
                signals.terminate_with(signal);
            }
            exit(exit_code(&e, failure_exit_code));
        }
    }
}

fn exit_code(error: &Error, failure_exit_code: i32) -> i32 {
    if error.is_lock_held() && failure_exit_code == EXECUTION_FAILED_EXIT_CODE {
        LOCK_HELD_EXIT_CODE
    } else {
        failure_exit_code
    }
}
