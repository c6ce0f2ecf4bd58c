mod config;
mod data_dir;
mod dataset;
mod record;
mod runner;
mod signals;
mod supervisor;
mod tools;
mod workspace;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use config::HarnessConfig;

const RED: &str = "\x1b[0;31m";
const GREEN: &str = "\x1b[0;32m";
const NC: &str = "\x1b[0m";

/// Evaluates an AI coding agent against SWE-bench problems: prepare the
/// checkout, run the agent under an idle-timeout supervisor, and keep the
/// log, diff and run record.
#[derive(Parser, Debug)]
#[command(name = "evalsmith", version, about)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "evalsmith.toml", global = true)]
    config: PathBuf,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Evaluate one problem from the dataset
    Run {
        /// Row index into the dataset (default: 0)
        #[arg(value_name = "PROBLEM_ID", env = "PROBLEM_ID")]
        problem_id: Option<String>,

        /// Seconds without agent output before the run is abandoned (overrides config)
        #[arg(long)]
        idle_timeout: Option<u64>,

        /// Directory holding eval_data/, eval_logs/ and eval_output/ (overrides config)
        #[arg(long)]
        base_dir: Option<PathBuf>,

        /// Validate config and print resolved settings, don't run
        #[arg(long)]
        dry_run: bool,
    },
    /// File and shell pass-throughs used by the agent
    Tool {
        /// Directory paths are resolved against
        #[arg(long, default_value = ".")]
        cwd: PathBuf,

        #[command(subcommand)]
        action: ToolAction,
    },
}

#[derive(Subcommand, Debug)]
enum ToolAction {
    /// Print a file
    Read { path: String },
    /// Write content to a file, creating parent directories
    Write { path: String, content: String },
    /// List files in a directory
    List {
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Run a shell command and print its combined output
    Exec {
        command: String,
        /// Seconds before the command is killed
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default = if verbose {
        "evalsmith=debug"
    } else if quiet {
        "evalsmith=warn"
    } else {
        "evalsmith=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    // Stdout carries the live agent output; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    match cli.command {
        Commands::Run {
            problem_id,
            idle_timeout,
            base_dir,
            dry_run,
        } => {
            let mut config = match HarnessConfig::load(&cli.config) {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!(error = %e, "failed to load config");
                    return ExitCode::FAILURE;
                }
            };
            if let Some(secs) = idle_timeout {
                config.supervisor.idle_timeout_secs = secs;
            }
            if let Some(dir) = base_dir {
                config.storage.base_dir = dir;
            }
            if let Err(e) = config.validate() {
                tracing::error!(error = %e, "invalid configuration");
                return ExitCode::FAILURE;
            }
            run(config, problem_id.as_deref(), dry_run).await
        }
        Commands::Tool { cwd, action } => tool(&cwd, action).await,
    }
}

async fn run(config: HarnessConfig, problem_id: Option<&str>, dry_run: bool) -> ExitCode {
    let problem_id = match dataset::parse_problem_id(problem_id) {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(error = %e, "invalid problem id");
            return ExitCode::FAILURE;
        }
    };

    if dry_run {
        println!("evalsmith v{}", env!("CARGO_PKG_VERSION"));
        println!("problem id:    {problem_id}");
        println!("dataset:       {}", config.dataset.url);
        println!(
            "agent:         {} {}",
            config.agent.command,
            config.agent.args.join(" ")
        );
        println!("working dir:   {}", config.agent.working_dir.display());
        println!("idle timeout:  {}s", config.supervisor.idle_timeout_secs);
        println!("sweep pattern: {:?}", config.supervisor.sweep_pattern);
        println!("base dir:      {}", config.storage.base_dir.display());
        return ExitCode::SUCCESS;
    }

    match runner::run_eval(&config, problem_id, signals::shutdown_signal()).await {
        Ok(summary) => {
            let report = &summary.report;
            tracing::info!(
                instance_id = %summary.instance_id,
                outcome = ?report.outcome,
                end = ?report.end,
                lines = report.lines,
                record = %summary.record_path.display(),
                "evaluation finished"
            );
            for warning in &report.warnings {
                tracing::warn!(warning = %warning, "run warning");
            }
            if report.outcome.is_success() {
                println!("{GREEN}Execution completed successfully!{NC}");
                ExitCode::SUCCESS
            } else {
                println!("{RED}Execution failed!{NC}");
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "evaluation aborted");
            eprintln!("{RED}Execution failed!{NC}");
            ExitCode::FAILURE
        }
    }
}

async fn tool(cwd: &std::path::Path, action: ToolAction) -> ExitCode {
    let result = match action {
        ToolAction::Read { path } => tools::read_file(cwd, &path).map(|content| {
            print!("{content}");
        }),
        ToolAction::Write { path, content } => {
            tools::write_file(cwd, &path, &content).map(|written| {
                println!("Wrote {}", written.display());
            })
        }
        ToolAction::List { path, recursive } => {
            println!("{}", tools::list_files(cwd, &path, recursive));
            Ok(())
        }
        ToolAction::Exec { command, timeout } => {
            match tools::execute_command(cwd, &command, Duration::from_secs(timeout)).await {
                Ok(out) => {
                    print!("{}", out.output);
                    return match out.exit_code {
                        Some(0) => ExitCode::SUCCESS,
                        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
                        None => ExitCode::FAILURE,
                    };
                }
                Err(e) => Err(e),
            }
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{RED}Error: {e}{NC}");
            ExitCode::FAILURE
        }
    }
}
