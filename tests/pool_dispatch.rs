//! Purpose: End-to-end dispatch through `api::Pool` with real worker threads.
//! Role: Exercises task routing, result matching, errors, transfers, and shutdown.
//! Invariants: Tests use in-process module tables and disable stdio flushing unless testing it.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use wakepool::api::{
    AbortController, Error, ErrorKind, FlushTarget, HandlerRef, LocalBoxFuture, Module,
    ModuleLoader, ModuleTable, Pool, PoolOptions, Reply, RunOptions, TaskInput, TransferBuffer,
    WorkerHooks,
};

#[derive(Default)]
struct Capture {
    pending: Mutex<Vec<String>>,
    flushed: Mutex<Vec<String>>,
}

impl FlushTarget for Capture {
    fn flush(&self) -> io::Result<()> {
        let mut pending = self.pending.lock().expect("pending");
        self.flushed.lock().expect("flushed").append(&mut pending);
        Ok(())
    }
}

fn modules(capture: Arc<Capture>) -> Arc<dyn ModuleLoader> {
    Arc::new(
        ModuleTable::new()
            .module(
                "math",
                Module::new()
                    .export("double", |input: TaskInput| async move {
                        let n = input.payload.as_i64().ok_or("payload must be an integer")?;
                        Ok(Reply::plain(n * 2))
                    })
                    .export("jittered", |input: TaskInput| async move {
                        let n = input.payload.as_u64().ok_or("payload must be an integer")?;
                        tokio::time::sleep(Duration::from_millis((n * 7) % 13)).await;
                        Ok(Reply::plain(json!({"task": input.task_id, "n": n})))
                    })
                    .export("hang", |_input: TaskInput| async move {
                        std::future::pending::<()>().await;
                        Ok(Reply::plain(Value::Null))
                    }),
            )
            .module(
                "bytes",
                Module::new().export("echo", |mut input: TaskInput| async move {
                    let transfers = std::mem::take(&mut input.transfers);
                    Ok(Reply::movable(json!({"count": transfers.len()}), transfers))
                }),
            )
            .module(
                "io",
                Module::new().export("log", move |input: TaskInput| {
                    let capture = capture.clone();
                    async move {
                        capture
                            .pending
                            .lock()
                            .expect("pending")
                            .push(format!("line from task {}", input.task_id));
                        Ok(Reply::plain(true))
                    }
                }),
            ),
    )
}

fn options(size: usize) -> PoolOptions {
    let mut options = PoolOptions::new(size);
    options.idle_wait = Duration::from_millis(20);
    options.flush = Vec::new();
    options
}

async fn start(size: usize) -> Pool {
    Pool::start(modules(Arc::new(Capture::default())), options(size))
        .await
        .expect("start pool")
}

#[tokio::test]
async fn two_workers_double_values() {
    let pool = start(2).await;
    let double = HandlerRef::new("math", "double");
    let (a, b) = tokio::join!(
        pool.run(double.clone(), json!(21)),
        pool.run(double.clone(), json!(10))
    );
    let a = a.expect("a");
    let b = b.expect("b");
    assert_eq!(a.value, json!(42));
    assert_eq!(b.value, json!(20));
    assert_ne!(a.worker, b.worker);
    pool.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn missing_handler_rejects_with_resolution_error() {
    let pool = start(1).await;
    let err = pool
        .run(HandlerRef::new("math", "missing"), json!(1))
        .await
        .expect_err("missing");
    assert_eq!(err.kind(), ErrorKind::HandlerResolution);
    assert!(err.task_id().is_some());
    assert_eq!(err.worker(), Some(0));

    let ok = pool
        .run(HandlerRef::new("math", "double"), json!(2))
        .await
        .expect("pool still works");
    assert_eq!(ok.value, json!(4));
    pool.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn many_tasks_each_get_their_own_result() {
    let pool = Arc::new(start(3).await);
    let mut set = tokio::task::JoinSet::new();
    for n in 0..60u64 {
        let pool = pool.clone();
        set.spawn(async move {
            let output = pool
                .run(HandlerRef::new("math", "jittered"), json!(n))
                .await
                .expect("run");
            (n, output.value)
        });
    }
    let mut seen = Vec::new();
    while let Some(joined) = set.join_next().await {
        let (n, value) = joined.expect("join");
        assert_eq!(value["n"], json!(n));
        seen.push(value["task"].as_u64().expect("task id"));
    }
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 60);

    let stats = pool.stats();
    assert_eq!(stats.iter().map(|s| s.completed).sum::<u64>(), 60);
    for worker in &stats {
        assert_eq!(worker.request_count, worker.response_count);
        assert_eq!(worker.pending, 0);
    }
    let pool = Arc::try_unwrap(pool).ok().expect("sole owner");
    pool.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn message_only_mode_matches_fast_path() {
    let mut opts = options(2);
    opts.use_atomics = false;
    let pool = Pool::start(modules(Arc::new(Capture::default())), opts)
        .await
        .expect("start");
    for n in 0..10 {
        let output = pool
            .run(HandlerRef::new("math", "double"), json!(n))
            .await
            .expect("run");
        assert_eq!(output.value, json!(n * 2));
    }
    pool.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn movable_buffer_round_trips_without_copy() {
    let pool = start(1).await;
    let buffer = TransferBuffer::from_vec((0..=255u8).collect());
    let ptr = buffer.as_ptr();
    let output = pool
        .run_with(
            HandlerRef::new("bytes", "echo"),
            Value::Null,
            vec![buffer],
            RunOptions::default(),
        )
        .await
        .expect("run");
    assert_eq!(output.value, json!({"count": 1}));
    assert_eq!(output.transfers.len(), 1);
    assert_eq!(output.transfers[0].as_ptr(), ptr);
    assert_eq!(output.transfers[0][255], 255);
    pool.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn handler_output_is_flushed_before_completion() {
    let capture = Arc::new(Capture::default());
    let mut opts = options(1);
    opts.flush = vec![capture.clone()];
    let pool = Pool::start(modules(capture.clone()), opts)
        .await
        .expect("start");
    let output = pool
        .run(HandlerRef::new("io", "log"), Value::Null)
        .await
        .expect("run");
    assert_eq!(output.value, json!(true));
    let flushed = capture.flushed.lock().expect("flushed").clone();
    assert_eq!(flushed.len(), 1);
    assert!(flushed[0].starts_with("line from task"));
    pool.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn timeout_and_abort_reject_on_caller_side() {
    let pool = start(1).await;
    let hang = HandlerRef::new("math", "hang");

    let err = pool
        .run_with(
            hang.clone(),
            Value::Null,
            Vec::new(),
            RunOptions::default().with_timeout(Duration::from_millis(30)),
        )
        .await
        .expect_err("timeout");
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let controller = AbortController::new();
    let signal = controller.signal();
    let abort_later = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.abort();
    };
    let (outcome, ()) = tokio::join!(
        pool.run_with(
            hang,
            Value::Null,
            Vec::new(),
            RunOptions::default().with_signal(signal.clone())
        ),
        abort_later
    );
    assert_eq!(outcome.expect_err("aborted").kind(), ErrorKind::Aborted);

    let err = pool
        .run_with(
            HandlerRef::new("math", "double"),
            json!(1),
            Vec::new(),
            RunOptions::default().with_signal(signal),
        )
        .await
        .expect_err("already aborted");
    assert_eq!(err.kind(), ErrorKind::Aborted);

    let ok = pool
        .run(HandlerRef::new("math", "double"), json!(4))
        .await
        .expect("hung tasks only hold their own slot");
    assert_eq!(ok.value, json!(8));
    assert_eq!(pool.stats()[0].pending, 0);
    pool.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn preload_failure_fails_start() {
    let mut opts = options(2);
    opts.preload = Some(HandlerRef::new("nowhere", "run"));
    let err = Pool::start(modules(Arc::new(Capture::default())), opts)
        .await
        .err()
        .expect("preload failure");
    assert_eq!(err.kind(), ErrorKind::HandlerResolution);
}

#[tokio::test]
async fn memory_limit_is_reported_in_stats() {
    let mut opts = options(1);
    opts.memory_limit = Some(1);
    let pool = Pool::start(modules(Arc::new(Capture::default())), opts)
        .await
        .expect("start");
    let output = pool
        .run(HandlerRef::new("math", "double"), json!(1))
        .await
        .expect("run");
    let stats = pool.stats();
    assert_eq!(stats[0].used_memory, output.used_memory);
    assert_eq!(stats[0].over_memory_limit, output.used_memory > 1);
    pool.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn crashed_worker_rejects_pending_task_with_transport() {
    let armed = Arc::new(AtomicBool::new(false));
    let trigger = armed.clone();
    let mut opts = options(1);
    opts.hooks = WorkerHooks::new().on_after_wake(move |_worker| {
        if trigger.load(Ordering::SeqCst) {
            panic!("worker crashed while waking");
        }
    });
    let pool = Pool::start(modules(Arc::new(Capture::default())), opts)
        .await
        .expect("start");
    armed.store(true, Ordering::SeqCst);

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        pool.run(HandlerRef::new("math", "double"), json!(1)),
    )
    .await
    .expect("rejected in time")
    .expect_err("transport");
    assert_eq!(err.kind(), ErrorKind::Transport);

    let err = pool
        .run(HandlerRef::new("math", "double"), json!(2))
        .await
        .expect_err("link is closed");
    assert_eq!(err.kind(), ErrorKind::Transport);

    let err = pool.shutdown().await.expect_err("panicked worker");
    assert_eq!(err.kind(), ErrorKind::Internal);
}

#[tokio::test]
async fn out_of_range_worker_is_usage_error() {
    let pool = start(1).await;
    assert_eq!(pool.size(), 1);
    assert!(pool.counters(0).is_ok());
    let err = pool.rpc(5).err().expect("out of range");
    assert_eq!(err.kind(), ErrorKind::Usage);
    pool.shutdown().await.expect("shutdown");
}

/// Panics while loading "broken"; every other module comes from the regular table.
struct FragileLoader(Arc<dyn ModuleLoader>);

impl ModuleLoader for FragileLoader {
    fn load<'a>(&'a self, module: &'a str) -> LocalBoxFuture<'a, Result<Module, Error>> {
        if module == "broken" {
            panic!("loader exploded on {module}");
        }
        self.0.load(module)
    }
}

#[tokio::test]
async fn panicking_loader_rejects_only_its_task() {
    let loader = FragileLoader(modules(Arc::new(Capture::default())));
    let pool = Pool::start(Arc::new(loader), options(1))
        .await
        .expect("start");
    for _ in 0..2 {
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            pool.run(HandlerRef::new("broken", "run"), Value::Null),
        )
        .await
        .expect("rejected in time")
        .expect_err("broken");
        assert_eq!(err.kind(), ErrorKind::HandlerResolution);
        assert!(err.message().unwrap_or_default().contains("loader exploded"));
    }

    let ok = tokio::time::timeout(
        Duration::from_secs(2),
        pool.run(HandlerRef::new("math", "double"), json!(3)),
    )
    .await
    .expect("answered in time")
    .expect("pool still works");
    assert_eq!(ok.value, json!(6));
    assert_eq!(pool.stats()[0].pending, 0);
    pool.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn first_task_after_start_does_not_wait_out_idle_wait() {
    for _ in 0..10 {
        let mut opts = options(1);
        opts.idle_wait = Duration::from_secs(10);
        let pool = Pool::start(modules(Arc::new(Capture::default())), opts)
            .await
            .expect("start");
        let output = tokio::time::timeout(
            Duration::from_secs(1),
            pool.run(HandlerRef::new("math", "double"), json!(5)),
        )
        .await
        .expect("first task answered promptly")
        .expect("run");
        assert_eq!(output.value, json!(10));
        pool.shutdown().await.expect("shutdown");
    }
}
