//! Purpose: `wakepool` CLI entry point.
//! Role: Binary crate root; parses args, runs the bench or inspects counter files.
//! Invariants: Commands emit JSON on stdout; tables and diagnostics go to stderr.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::{Parser, Subcommand, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod bench;

use bench::{BenchArgs, BenchFormat, run_bench};
use wakepool::api::{Error, ErrorKind, SharedCounterBlock, to_exit_code};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "wakepool",
    version,
    about = "Worker-pool task dispatch with futex-style wakeups",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Measure dispatch latency and throughput through a pool of built-in handlers.
    Bench {
        /// Worker counts to benchmark, comma separated.
        #[arg(long, value_delimiter = ',', default_value = "1,2")]
        workers: Vec<usize>,
        /// Tasks per benchmark.
        #[arg(long, default_value_t = 1000)]
        tasks: u64,
        /// Payload sizes in bytes, comma separated.
        #[arg(long = "payload-bytes", value_delimiter = ',', default_value = "0,1024")]
        payload_bytes: Vec<usize>,
        /// Disable the counter fast path and rely on message passing only.
        #[arg(long = "no-atomics")]
        no_atomics: bool,
        /// Output format: json | table | both.
        #[arg(long, default_value = "both")]
        format: String,
    },
    /// Print the request/response counters of a file-backed counter block.
    Counters {
        /// Counter file; created and initialized if missing.
        path: PathBuf,
    },
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Run `wakepool --help` for usage."));
            }
        },
    };

    match cli.command {
        Command::Bench {
            workers,
            tasks,
            payload_bytes,
            no_atomics,
            format,
        } => {
            let args = BenchArgs {
                workers,
                payload_sizes: payload_bytes,
                tasks,
                use_atomics: !no_atomics,
                format: BenchFormat::parse(&format)?,
            };
            run_bench(args, env!("CARGO_PKG_VERSION"))?;
        }
        Command::Counters { path } => {
            let block = SharedCounterBlock::open_file(&path).map_err(|err| {
                err.with_hint("Counter files are created by wakepool; check the path.")
            })?;
            let value = json!({
                "path": path.display().to_string(),
                "request_count": block.load_request(),
                "response_count": block.load_response(),
                "request_signal": block.load_request_signal(),
                "response_signal": block.load_response_signal(),
            });
            println!("{}", serde_json::to_string(&value).unwrap_or_else(|_| "{}".to_string()));
        }
    }
    Ok(RunOutcome::ok())
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim_start_matches("error: ").trim().to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::HandlerResolution => "handler not found".to_string(),
        ErrorKind::HandlerExecution => "handler failed".to_string(),
        ErrorKind::Transport => "transport closed".to_string(),
        ErrorKind::Cancelled => "cancelled".to_string(),
        ErrorKind::Aborted => "aborted".to_string(),
        ErrorKind::Timeout => "timed out".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(task_id) = err.task_id() {
        inner.insert("task_id".to_string(), json!(task_id));
    }
    if let Some(worker) = err.worker() {
        inner.insert("worker".to_string(), json!(worker));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}
