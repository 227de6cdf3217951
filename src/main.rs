//! BlockRunner CLI Entry Point
//!
//! Provides command-line interface for workflow execution.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! blockrunner flow.yaml
//!
//! # With an input object and a secret
//! blockrunner flow.yaml --input '{"name": "Ada"}' --env API_KEY=secret
//!
//! # Resume a run paused on a wait block
//! blockrunner --resume 3f2c... --resume-input '{"approved": true}'
//!
//! # List paused runs
//! blockrunner --list-paused
//! ```

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info, warn};
use serde_json::Value;

use blockrunner::checkpoint::FileCheckpointStore;
use blockrunner::config::EngineConfig;
use blockrunner::execution::{CancelHandle, Engine, ExecutionResult, ResumeRequest, RunRequest, RunStatus};
use blockrunner::monitoring::ExecutionTimeline;
use blockrunner::{APP_NAME, VERSION};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    workflow_path: Option<String>,
    input: Option<String>,
    env: HashMap<String, String>,
    max_parallel: Option<usize>,
    checkpoint_dir: Option<PathBuf>,
    execution_id: Option<String>,
    resume: Option<String>,
    resume_input: Option<String>,
    list_paused: bool,
    timeline: bool,
    json: bool,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Block Graph Workflow Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: blockrunner [OPTIONS] <WORKFLOW_FILE>");
    println!("       blockrunner --resume <EXECUTION_ID> [--resume-input JSON]");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>        Path to a workflow YAML or JSON file");
    println!();
    println!("Options:");
    println!("  --input JSON|@FILE     Workflow input (inline JSON or a file)");
    println!("  --env KEY=VALUE        Environment variable for {{{{KEY}}}} references (repeatable)");
    println!("  --parallel N           Maximum blocks in flight");
    println!("  --checkpoint-dir DIR   Where paused runs are stored");
    println!("  --execution-id ID      Execution id (default: random)");
    println!("  --resume ID            Resume a paused execution");
    println!("  --resume-input JSON    Data delivered to the waiting block");
    println!("  --list-paused          List paused executions");
    println!("  --timeline             Print a Gantt chart of block timings");
    println!("  --json                 Print the full result as JSON");
    println!("  --verbose              Enable debug logging");
    println!("  --help                 Show this help message");
    println!("  --version              Show version information");
    println!();
    println!("Examples:");
    println!("  blockrunner flow.yaml --input '{{\"name\": \"Ada\"}}'");
    println!("  blockrunner flow.yaml --env API_KEY=secret --parallel 8");
    println!("  blockrunner --resume 3f2c9a --resume-input '{{\"approved\": true}}'");
}

fn next_value<'a>(args: &'a [String], i: &mut usize, flag: &str, what: &str) -> Result<&'a String, String> {
    *i += 1;
    args.get(*i)
        .ok_or_else(|| format!("{} requires {} argument", flag, what))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => config.verbose = true,
            "--timeline" => config.timeline = true,
            "--json" => config.json = true,
            "--list-paused" => config.list_paused = true,
            "--input" => {
                config.input = Some(next_value(args, &mut i, arg, "a JSON")?.clone());
            }
            "--env" => {
                let pair = next_value(args, &mut i, arg, "a KEY=VALUE")?;
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("Invalid --env value (expected KEY=VALUE): {}", pair))?;
                config.env.insert(key.trim().to_string(), value.to_string());
            }
            "--parallel" => {
                let raw = next_value(args, &mut i, arg, "a number")?;
                let n: usize = raw
                    .parse()
                    .map_err(|_| format!("Invalid parallel value: {}", raw))?;
                config.max_parallel = Some(n);
            }
            "--checkpoint-dir" => {
                config.checkpoint_dir = Some(PathBuf::from(next_value(args, &mut i, arg, "a path")?));
            }
            "--execution-id" => {
                config.execution_id = Some(next_value(args, &mut i, arg, "an id")?.clone());
            }
            "--resume" => {
                config.resume = Some(next_value(args, &mut i, arg, "an execution id")?.clone());
            }
            "--resume-input" => {
                config.resume_input = Some(next_value(args, &mut i, arg, "a JSON")?.clone());
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.workflow_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.workflow_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    if config.workflow_path.is_none() && config.resume.is_none() && !config.list_paused {
        return Err("A workflow file, --resume or --list-paused is required".to_string());
    }

    Ok(config)
}

/// Parses inline JSON, or reads it from a file when prefixed with `@`.
fn parse_json_arg(raw: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let content = match raw.strip_prefix('@') {
        Some(path) => fs::read_to_string(path)
            .map_err(|e| format!("Could not read input file '{}': {}", path, e))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&content).map_err(|e| format!("Invalid JSON input: {}", e).into())
}

/// Prints a colored summary of a run.
fn print_summary(result: &ExecutionResult, show_timeline: bool) {
    println!();
    println!("{}", "=".repeat(60));

    let status = match result.status {
        RunStatus::Completed => "COMPLETED".green().bold(),
        RunStatus::Paused => "PAUSED".yellow().bold(),
        RunStatus::Cancelled => "CANCELLED".yellow().bold(),
        _ => "FAILED".red().bold(),
    };
    println!("Execution {}: {}", result.execution_id, status);
    println!(
        "Blocks executed: {}   Duration: {} ms",
        result.metadata.executed_block_count, result.metadata.duration_ms
    );

    let failed = result.logs.iter().filter(|l| !l.success).count();
    if failed > 0 {
        println!("Failed block runs: {}", failed.to_string().red());
    }

    if let Some(wait) = &result.metadata.wait_block_info {
        println!("Waiting on: {} ({})", wait.block_name.cyan(), wait.reason);
        println!(
            "Resume with: blockrunner --resume {} --resume-input '<JSON>'",
            result.execution_id
        );
    }

    if let Some(err) = &result.error {
        println!("Error: {}", err.red());
        if let Some(token) = &result.metadata.unresolved_token {
            println!("Unresolved reference: {}", token);
        }
    }
    println!("{}", "=".repeat(60));

    if show_timeline {
        print!("{}", ExecutionTimeline::from_logs(&result.logs).gantt_chart());
    }
}

/// Builds the engine from defaults, environment and flags.
fn build_engine(config: &Config) -> Result<Engine, Box<dyn std::error::Error>> {
    let mut engine_config = EngineConfig::from_env();
    if let Some(dir) = &config.checkpoint_dir {
        engine_config = engine_config.with_checkpoint_dir(dir);
    }
    if let Some(n) = config.max_parallel {
        engine_config = engine_config.with_max_concurrency(n);
    }

    let store = FileCheckpointStore::new(&engine_config.checkpoint_dir)?;
    info!("Checkpoints: {}", store.dir().display());

    Ok(Engine::new()
        .with_config(engine_config)
        .with_checkpoint_store(Arc::new(store)))
}

/// Cancels the run on Ctrl-C; blocks already running finish first.
fn cancel_on_ctrl_c() -> CancelHandle {
    let handle = CancelHandle::new();
    let signal = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling after running blocks finish");
            signal.cancel();
        }
    });
    handle
}

/// Main application entry point.
async fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let engine = build_engine(&config)?;

    if config.list_paused {
        let paused = engine.checkpoints().paused_executions().await?;
        if paused.is_empty() {
            println!("No paused executions");
        }
        for id in paused {
            println!("{}", id);
        }
        return Ok(true);
    }

    let cancel = cancel_on_ctrl_c();

    let result = if let Some(execution_id) = &config.resume {
        let resume_input = match &config.resume_input {
            Some(raw) => parse_json_arg(raw)?,
            None => Value::Null,
        };
        info!("Resuming execution: {}", execution_id);
        engine
            .resume(
                ResumeRequest::new(execution_id.clone())
                    .with_input(resume_input)
                    .with_cancel(cancel),
            )
            .await?
    } else {
        let path = config.workflow_path.clone().unwrap_or_default();
        let workflow = engine.load_file(&path).map_err(|e| {
            error!("Failed to load workflow: {}", e);
            format!("Could not load workflow from '{}': {}", path, e)
        })?;

        let mut request = RunRequest::new()
            .with_environment(config.env.clone())
            .with_cancel(cancel);
        if let Some(raw) = &config.input {
            request = request.with_input(parse_json_arg(raw)?);
        }
        if let Some(id) = &config.execution_id {
            request = request.with_execution_id(id.clone());
        }

        engine.execute(workflow, request).await?
    };

    if config.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!();
        println!("Output:");
        println!("{}", serde_json::to_string_pretty(&result.output)?);
    }
    print_summary(&result, config.timeline);

    Ok(result.success)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
