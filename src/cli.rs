//! Command-line interface for stepwright
//!
//! `stepwright run` executes a step script under the engine; `stepwright check`
//! validates one without running anything.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    AuditLog, CliArgs, ConfigError, EngineConfig, ErrorTrap, ExitCode, Orchestrator, ReportOptions,
    StepError, StepScript, init_tracing, spawn_signal_listener,
};

/// stepwright - supervised, strictly ordered step execution
#[derive(Parser)]
#[command(name = "stepwright")]
#[command(about = "Run installer steps one at a time with supervision, cancellation and an audit log")]
#[command(long_about = r#"
stepwright executes an ordered script of named steps. Each step runs in the
background while a spinner shows progress; its output goes to the audit log,
not the screen. The first step that fails ends the run.

EXAMPLES:
  # Validate a script and list its steps
  stepwright check install.toml

  # Run it, writing the audit log to a custom location
  stepwright run install.toml --log-file /var/log/install.log

  # Machine-readable summary on stdout
  stepwright run install.toml --json --no-spinner

CONFIGURATION:
  Precedence: CLI flags > config file > defaults
  The config file is --config, else $STEPWRIGHT_CONFIG, else ./stepwright.toml

EXIT CODES:
  0 success, 1 step failure (or the failing step's own code, unless that is
  2 or 130), 2 invalid arguments/config/script, 130 cancelled by the operator
"#)]
#[command(version)]
pub struct Cli {
    /// Enable verbose diagnostics on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a step script
    Run {
        /// Step script (TOML)
        script: PathBuf,

        /// Path to configuration file (overrides discovery)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Audit log location
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Do not render the progress spinner
        #[arg(long)]
        no_spinner: bool,

        /// Do not offer to page through the log after a failure
        #[arg(long)]
        no_pager: bool,

        /// Print a JSON run summary to stdout
        #[arg(long)]
        json: bool,
    },

    /// Validate a step script and list its steps without running them
    Check {
        /// Step script (TOML)
        script: PathBuf,

        /// Print the step list as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Parse arguments and run the selected command.
///
/// All output, including error reports, is written here; the caller only maps
/// the returned code to the process exit status.
pub fn run() -> Result<(), ExitCode> {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.verbose) {
        eprintln!("warning: diagnostics unavailable: {e}");
    }

    match cli.command {
        Commands::Run {
            script,
            config,
            log_file,
            no_spinner,
            no_pager,
            json,
        } => {
            let cli_args = CliArgs {
                config_path: config,
                log_path: log_file,
                spinner: no_spinner.then_some(false),
                offer_pager: no_pager.then_some(false),
            };
            execute_run(&script, &cli_args, json)
        }
        Commands::Check { script, json } => execute_check(&script, json),
    }
}

fn report_config_error(err: &ConfigError) -> ExitCode {
    eprintln!("error: {err}");
    for hint in err.suggestions() {
        eprintln!("  hint: {hint}");
    }
    err.to_exit_code()
}

fn execute_run(script_path: &Path, cli_args: &CliArgs, json: bool) -> Result<(), ExitCode> {
    let script = StepScript::load(script_path).map_err(|e| report_config_error(&e))?;
    let config = EngineConfig::discover(cli_args).map_err(|e| report_config_error(&e))?;

    let log = AuditLog::open(&config.log.path, &config.log.product_tag).map_err(|e| {
        eprintln!("error: {e}");
        ExitCode::STEP_FAILED
    })?;
    let trap = ErrorTrap::new(log, ReportOptions::from_config(&config.report)).map_err(|e| {
        eprintln!("error: could not create scratch directory: {e}");
        ExitCode::STEP_FAILED
    })?;
    trap.install_panic_hook();

    let runtime = build_runtime().map_err(|e| {
        eprintln!("error: {e:#}");
        ExitCode::STEP_FAILED
    })?;

    let cancel = CancellationToken::new();
    let title = script_path.display().to_string();
    let mut orchestrator = Orchestrator::new(config, &trap, cancel.clone());

    let run = panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(async {
            let listener = spawn_signal_listener(cancel.clone());
            let outcome = match orchestrator.begin(&title) {
                Ok(()) => orchestrator.run_script(&script).await,
                Err(source) => Err(StepError::Log {
                    step: title.clone(),
                    source,
                }),
            };
            listener.abort();
            outcome
        })
    }));
    drop(runtime);

    let (exit, outcome) = match run {
        Ok(outcome) => (trap.finish(&outcome), outcome),
        Err(_) => {
            let exit = trap.finish_unexpected("stepwright hit an internal error");
            return if exit.is_success() { Ok(()) } else { Err(exit) };
        }
    };
    debug!(exit = exit.as_i32(), "run finished");

    if json {
        let summary = orchestrator.summary(&outcome, exit);
        if let Err(e) = emit_json(&summary) {
            eprintln!("error: {e:#}");
        }
    }

    if exit.is_success() { Ok(()) } else { Err(exit) }
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")
}

fn emit_json(value: &impl Serialize) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to serialize summary")?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{text}").context("failed to write summary")?;
    Ok(())
}

#[derive(Serialize)]
struct CheckedStep<'a> {
    name: &'a str,
    retry: bool,
    commands: Vec<String>,
}

#[derive(Serialize)]
struct CheckReport<'a> {
    script: &'a Path,
    steps: Vec<CheckedStep<'a>>,
}

fn execute_check(script_path: &Path, json: bool) -> Result<(), ExitCode> {
    let script = StepScript::load(script_path).map_err(|e| report_config_error(&e))?;

    let report = CheckReport {
        script: script_path,
        steps: script
            .steps
            .iter()
            .map(|step| CheckedStep {
                name: &step.name,
                retry: step.retry,
                commands: step.command_specs().iter().map(ToString::to_string).collect(),
            })
            .collect(),
    };

    if json {
        return emit_json(&report).map_err(|e| {
            eprintln!("error: {e:#}");
            ExitCode::STEP_FAILED
        });
    }

    println!("{}: {} step(s)", script_path.display(), report.steps.len());
    for (index, step) in report.steps.iter().enumerate() {
        let retry = if step.retry { " [retry]" } else { "" };
        println!("  {}. {}{retry}", index + 1, step.name);
        for command in &step.commands {
            println!("       $ {command}");
        }
    }
    Ok(())
}
