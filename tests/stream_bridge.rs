//! Purpose: Run a worker whose data port is carried over a byte stream.
//! Role: Checks framing plus the dispatch loop end to end over `tokio::io::duplex`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use wakepool::api::{ErrorKind, HandlerRef, Module, ModuleTable, Reply, TaskInput, TransferBuffer};
use wakepool::core::channel::Port;
use wakepool::core::control::control_pipe;
use wakepool::core::counters::SharedCounterBlock;
use wakepool::core::envelope::{Message, TaskEnvelope, TaskResult};
use wakepool::core::frame::bridge;
use wakepool::core::worker::{WorkerConfig, spawn_worker};

fn table() -> Arc<ModuleTable> {
    Arc::new(
        ModuleTable::new().module(
            "math",
            Module::new()
                .export("double", |input: TaskInput| async move {
                    let n = input.payload.as_i64().ok_or("payload must be an integer")?;
                    Ok(Reply::plain(n * 2))
                })
                .export("sum_bytes", |mut input: TaskInput| async move {
                    let transfers = std::mem::take(&mut input.transfers);
                    let sum: u64 = transfers
                        .iter()
                        .flat_map(|buffer| buffer.iter())
                        .map(|byte| *byte as u64)
                        .sum();
                    Ok(Reply::movable(json!(sum), transfers))
                }),
        ),
    )
}

struct Bridged {
    port: Port,
    counters: SharedCounterBlock,
    thread: std::thread::JoinHandle<()>,
}

fn start_bridged(use_atomics: bool) -> Bridged {
    let (controller_io, worker_io) = tokio::io::duplex(64 * 1024);
    let port = bridge(controller_io);
    let worker_port = bridge(worker_io);
    let counters = SharedCounterBlock::anonymous().expect("counters");
    let mut config = WorkerConfig::new(0, worker_port, counters.clone(), table());
    config.use_atomics = use_atomics;
    config.idle_wait = Duration::from_millis(10);
    config.flush = Vec::new();

    let (link, endpoint) = control_pipe();
    let thread = spawn_worker(0, endpoint).expect("spawn");
    link.configure(config).expect("configure");
    link.wait_ready(Duration::from_secs(5)).expect("ready");
    Bridged {
        port,
        counters,
        thread,
    }
}

impl Bridged {
    fn post(&self, task_id: u64, export: &str, payload: Value, transfers: Vec<TransferBuffer>) {
        let envelope = TaskEnvelope {
            task_id,
            handler: HandlerRef::new("math", export),
            payload,
        };
        self.port
            .post(Message::Task(envelope), transfers)
            .expect("post");
        self.counters.add_request(1);
        self.counters.notify_request();
    }

    async fn result(&mut self) -> (TaskResult, Vec<TransferBuffer>) {
        let packet = tokio::time::timeout(Duration::from_secs(5), self.port.recv())
            .await
            .expect("result in time")
            .expect("port open");
        match packet.message {
            Message::TaskResult(result) => (result, packet.transfers),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn stop(self) {
        drop(self.port);
        self.counters.notify_request();
        self.thread.join().expect("join");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bridged_worker_runs_tasks() {
    for use_atomics in [false, true] {
        let mut worker = start_bridged(use_atomics);
        worker.post(1, "double", json!(21), Vec::new());
        worker.post(2, "double", json!(10), Vec::new());
        let mut results = vec![worker.result().await.0, worker.result().await.0];
        results.sort_by_key(|result| result.task_id);
        assert_eq!(results[0].clone().into_outcome().expect("ok"), json!(42));
        assert_eq!(results[1].clone().into_outcome().expect("ok"), json!(20));
        assert_eq!(worker.counters.load_response(), 2);
        worker.stop();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bridged_transfers_arrive_by_value() {
    let mut worker = start_bridged(false);
    worker.post(
        1,
        "sum_bytes",
        Value::Null,
        vec![TransferBuffer::from_vec(vec![1; 100]), TransferBuffer::from_vec(vec![2; 50])],
    );
    let (result, transfers) = worker.result().await;
    assert_eq!(result.into_outcome().expect("ok"), json!(200));
    assert_eq!(transfers.len(), 2);
    assert_eq!(transfers[1].len(), 50);
    worker.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_handler_error_crosses_the_stream() {
    let mut worker = start_bridged(false);
    worker.post(9, "missing", Value::Null, Vec::new());
    let (result, _) = worker.result().await;
    let err = result.into_outcome().expect_err("missing");
    assert_eq!(err.kind(), ErrorKind::HandlerResolution);
    assert_eq!(err.task_id(), Some(9));
    worker.stop();
}
