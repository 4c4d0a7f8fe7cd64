// Benchmark harness for wakepool.
//
// Purpose:
// - Provide a repeatable baseline for dispatch latency and throughput (round trip, burst,
//   blocking client, movable buffers) with and without the counter fast path.
// - Emit machine-readable JSON to stdout and a human-readable table to stderr.
//
// Design notes:
// - Handlers are built in so results measure dispatch overhead, not handler work.
// - Good enough for trend tracking, not lab-grade profiling.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};

use wakepool::api::{
    Error, ErrorKind, HandlerRef, Module, ModuleLoader, ModuleTable, Pool, PoolOptions, Reply,
    RunOptions, SyncClient, TaskInput, TransferBuffer,
};

const BENCH_MODULE: &str = "bench";

#[derive(Clone, Debug)]
pub struct BenchArgs {
    pub workers: Vec<usize>,
    pub payload_sizes: Vec<usize>,
    pub tasks: u64,
    pub use_atomics: bool,
    pub format: BenchFormat,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BenchFormat {
    Json,
    Table,
    Both,
}

impl BenchFormat {
    pub fn parse(input: &str) -> Result<Self, Error> {
        match input.trim() {
            "json" => Ok(Self::Json),
            "table" => Ok(Self::Table),
            "both" => Ok(Self::Both),
            _ => Err(Error::new(ErrorKind::Usage)
                .with_message("invalid --format (use json|table|both)")),
        }
    }
}

pub fn run_bench(args: BenchArgs, program_version: &str) -> Result<(), Error> {
    if args.workers.iter().any(|workers| *workers == 0) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--workers values must be at least 1"));
    }
    let start = SystemTime::now();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start tokio runtime")
                .with_source(err)
        })?;

    let mut results = Vec::new();
    for workers in &args.workers {
        for payload_bytes in &args.payload_sizes {
            let options = bench_options(*workers, args.use_atomics);
            results.extend(runtime.block_on(bench_pool(
                options,
                *payload_bytes,
                args.tasks,
            ))?);
        }
    }
    for payload_bytes in &args.payload_sizes {
        results.push(bench_blocking(args.use_atomics, *payload_bytes, args.tasks)?);
    }

    let output = json!({
        "name": "wakepool",
        "version": program_version,
        "ts": rfc3339_now(start),
        "system": system_json(),
        "params": {
            "workers": args.workers,
            "payload_sizes": args.payload_sizes,
            "tasks": args.tasks,
            "use_atomics": args.use_atomics,
            "debug_build": cfg!(debug_assertions),
        },
        "results": results,
    });

    emit_bench_output(output, args.format)
}

fn bench_module() -> Arc<dyn ModuleLoader> {
    Arc::new(
        ModuleTable::new().module(
            BENCH_MODULE,
            Module::new()
                .export("echo", |input: TaskInput| async move { Ok(Reply::Plain(input.payload)) })
                .export("double", |input: TaskInput| async move {
                    let n = input.payload.as_i64().ok_or("payload must be an integer")?;
                    Ok(Reply::plain(n * 2))
                })
                .export("bytes", |mut input: TaskInput| async move {
                    let transfers = std::mem::take(&mut input.transfers);
                    Ok(Reply::movable(json!({"buffers": transfers.len()}), transfers))
                }),
        ),
    )
}

fn bench_options(workers: usize, use_atomics: bool) -> PoolOptions {
    let mut options = PoolOptions::new(workers);
    options.use_atomics = use_atomics;
    options.flush = Vec::new();
    options
}

async fn bench_pool(options: PoolOptions, payload_bytes: usize, tasks: u64) -> Result<Vec<Value>, Error> {
    let workers = options.size;
    let pool = Arc::new(Pool::start(bench_module(), options).await?);
    let echo = HandlerRef::new(BENCH_MODULE, "echo");
    let payload = Value::String("x".repeat(payload_bytes));
    let mut results = Vec::new();

    // Round-robin puts one warmup task on each worker, so module loads stay out of the timings.
    let double = HandlerRef::new(BENCH_MODULE, "double");
    for n in 0..workers as i64 {
        let output = pool.run(double.clone(), json!(n)).await?;
        if output.value != json!(n * 2) {
            return Err(Error::new(ErrorKind::Internal)
                .with_message(format!("warmup on worker {} returned {}", output.worker, output.value)));
        }
    }

    let mut latencies = Vec::with_capacity(tasks as usize);
    let begin = Instant::now();
    for _ in 0..tasks {
        let sent = Instant::now();
        pool.run(echo.clone(), payload.clone()).await?;
        latencies.push(sent.elapsed().as_secs_f64() * 1000.0);
    }
    let elapsed = begin.elapsed();
    latencies.sort_by(|a, b| a.total_cmp(b));
    let mut entry = result_entry("round_trip", workers, payload_bytes, tasks, elapsed, None);
    insert(&mut entry, "latency_ms", latency_summary(&latencies));
    results.push(entry);

    let begin = Instant::now();
    let mut set = tokio::task::JoinSet::new();
    for _ in 0..tasks {
        let pool = pool.clone();
        let echo = echo.clone();
        let payload = payload.clone();
        set.spawn(async move { pool.run(echo, payload).await.map(|_| ()) });
    }
    while let Some(joined) = set.join_next().await {
        joined.map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("bench task failed to join")
                .with_source(err)
        })??;
    }
    results.push(result_entry("burst", workers, payload_bytes, tasks, begin.elapsed(), None));

    if payload_bytes > 0 {
        let bytes = HandlerRef::new(BENCH_MODULE, "bytes");
        let begin = Instant::now();
        for _ in 0..tasks {
            let buffer = TransferBuffer::zeroed(payload_bytes);
            let output = pool
                .run_with(bytes.clone(), Value::Null, vec![buffer], RunOptions::default())
                .await?;
            if output.transfers.len() != 1 {
                return Err(Error::new(ErrorKind::Internal).with_message("movable buffer lost"));
            }
        }
        results.push(result_entry(
            "movable",
            workers,
            payload_bytes,
            tasks,
            begin.elapsed(),
            Some("buffer moved both ways"),
        ));
    }

    let stats = pool.stats();
    let requests: u64 = stats.iter().map(|s| s.request_count as u64).sum();
    let responses: u64 = stats.iter().map(|s| s.response_count as u64).sum();
    if let Some(last) = results.last_mut() {
        insert(last, "counters", json!({"request_count": requests, "response_count": responses}));
    }

    let pool = Arc::try_unwrap(pool)
        .map_err(|_| Error::new(ErrorKind::Internal).with_message("bench pool still shared"))?;
    pool.shutdown().await?;
    Ok(results)
}

fn bench_blocking(use_atomics: bool, payload_bytes: usize, tasks: u64) -> Result<Value, Error> {
    let mut client = SyncClient::start(bench_module(), bench_options(1, use_atomics))?;
    let echo = HandlerRef::new(BENCH_MODULE, "echo");
    let payload = Value::String("x".repeat(payload_bytes));
    let begin = Instant::now();
    for _ in 0..tasks {
        client.call_blocking(echo.clone(), payload.clone())?;
    }
    let elapsed = begin.elapsed();
    let mut entry = result_entry("blocking", 1, payload_bytes, tasks, elapsed, None);
    insert(
        &mut entry,
        "counters",
        json!({
            "request_count": client.counters().load_request(),
            "response_count": client.counters().load_response(),
        }),
    );
    client.shutdown()?;
    Ok(entry)
}

fn emit_bench_output(value: Value, format: BenchFormat) -> Result<(), Error> {
    match format {
        BenchFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string()));
            Ok(())
        }
        BenchFormat::Table => emit_table(&value),
        BenchFormat::Both => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string()));
            emit_table(&value)
        }
    }
}

fn emit_table(value: &Value) -> Result<(), Error> {
    let mut stderr = io::stderr().lock();
    let atomics = value
        .pointer("/params/use_atomics")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    writeln!(stderr, "wakepool bench (table, atomics: {})", if atomics { "on" } else { "off" })
        .map_err(table_error)?;

    let results = value
        .get("results")
        .and_then(|v| v.as_array())
        .ok_or_else(|| Error::new(ErrorKind::Internal).with_message("bench results missing"))?;

    writeln!(
        stderr,
        "{:>11}  {:>7}  {:>10}  {:>8}  {:>12}  {:>10}  {}",
        "bench", "workers", "payload", "tasks", "tasks/s", "ms/task", "notes"
    )
    .map_err(table_error)?;

    for item in results {
        let bench = item.get("bench").and_then(|v| v.as_str()).unwrap_or("?");
        let workers = item.get("workers").and_then(|v| v.as_u64()).unwrap_or(0);
        let payload = item.get("payload_bytes").and_then(|v| v.as_u64()).unwrap_or(0);
        let tasks = item.get("tasks").and_then(|v| v.as_u64()).unwrap_or(0);
        let per_sec = item
            .get("tasks_per_sec")
            .and_then(|v| v.as_f64())
            .unwrap_or(f64::NAN);
        let ms_per_task = item
            .get("ms_per_task")
            .and_then(|v| v.as_f64())
            .unwrap_or(f64::NAN);
        let notes = item.get("notes").and_then(|v| v.as_str()).unwrap_or("");

        writeln!(
            stderr,
            "{:>11}  {:>7}  {:>10}  {:>8}  {:>12.1}  {:>10.4}  {}",
            bench,
            workers,
            format_bytes(payload),
            tasks,
            per_sec,
            ms_per_task,
            notes
        )
        .map_err(table_error)?;
    }

    Ok(())
}

fn table_error(err: io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("failed to write bench table")
        .with_source(err)
}

fn result_entry(
    bench: &str,
    workers: usize,
    payload_bytes: usize,
    tasks: u64,
    duration: Duration,
    notes: Option<&str>,
) -> Value {
    let dur_ms = duration.as_secs_f64() * 1000.0;
    let count = if tasks == 0 { 1 } else { tasks } as f64;
    let secs = duration.as_secs_f64().max(1e-9);

    let mut map = BTreeMap::new();
    map.insert("bench".to_string(), json!(bench));
    map.insert("workers".to_string(), json!(workers));
    map.insert("payload_bytes".to_string(), json!(payload_bytes));
    map.insert("tasks".to_string(), json!(tasks));
    map.insert("duration_ms".to_string(), json!(dur_ms));
    map.insert("ms_per_task".to_string(), json!(dur_ms / count));
    map.insert("tasks_per_sec".to_string(), json!(tasks as f64 / secs));
    if let Some(notes) = notes {
        map.insert("notes".to_string(), json!(notes));
    }
    Value::Object(map.into_iter().collect())
}

fn insert(entry: &mut Value, key: &str, value: Value) {
    if let Value::Object(map) = entry {
        map.insert(key.to_string(), value);
    }
}

fn latency_summary(sorted_ms: &[f64]) -> Value {
    if sorted_ms.is_empty() {
        return json!({});
    }
    let mean = sorted_ms.iter().sum::<f64>() / sorted_ms.len() as f64;
    json!({
        "min": sorted_ms.first().copied().unwrap_or(0.0),
        "mean": mean,
        "p50": quantile(sorted_ms, 0.50),
        "p95": quantile(sorted_ms, 0.95),
        "max": sorted_ms.last().copied().unwrap_or(0.0),
    })
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let clamped = q.clamp(0.0, 1.0);
    let idx = ((sorted.len() - 1) as f64 * clamped).round() as usize;
    sorted.get(idx).copied().unwrap_or_else(|| sorted[sorted.len() - 1])
}

fn system_json() -> Value {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    json!({
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "cpus": cpus,
    })
}

fn rfc3339_now(ts: SystemTime) -> String {
    let dur = ts.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = dur.as_secs() as i64;
    let nsec = dur.subsec_nanos();
    let tm = time::OffsetDateTime::from_unix_timestamp(secs).unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
    let tm = tm.replace_nanosecond(nsec).unwrap_or(tm);
    tm.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

fn format_bytes(value: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;

    let v = value as f64;
    if v >= MB {
        format!("{:.1}MiB", v / MB)
    } else if v >= KB {
        format!("{:.1}KiB", v / KB)
    } else {
        format!("{value}B")
    }
}
