//! Purpose: Drive one worker from a plain thread with no controller-side async runtime.
//! Exports: `SyncClient`.
//! Role: Blocking counterpart to `Pool` for callers that cannot await.
//! Invariants: The caller blocks on the response signal, then pulls the reply with `try_recv`.
//! Invariants: Calls are sequential; one task is outstanding at a time.
#![allow(clippy::result_large_err)]

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::api::pool::{PoolOptions, TaskOutput};
use crate::core::channel::{Port, TryRecv, port_pair};
use crate::core::control::control_pipe;
use crate::core::counters::SharedCounterBlock;
use crate::core::envelope::{HandlerRef, Message, RpcResponse, TaskEnvelope, TransferBuffer};
use crate::core::error::{Error, ErrorKind};
use crate::core::registry::ModuleLoader;
use crate::core::worker::spawn_worker;

const WAIT_SLICE: Duration = Duration::from_millis(50);
const WORKER_ID: usize = 0;

pub struct SyncClient {
    port: Option<Port>,
    counters: SharedCounterBlock,
    thread: Option<JoinHandle<()>>,
    use_atomics: bool,
    next_task_id: u64,
}

impl SyncClient {
    /// Start a single worker; `options.size` is ignored.
    pub fn start(loader: Arc<dyn ModuleLoader>, mut options: PoolOptions) -> Result<Self, Error> {
        options.apply_env(|key| std::env::var(key).ok());
        let (port, worker_port) = port_pair();
        let counters = SharedCounterBlock::anonymous()?;
        let (control, endpoint) = control_pipe();
        let thread = spawn_worker(WORKER_ID, endpoint)?;
        control.configure(options.worker_config(WORKER_ID, worker_port, counters.clone(), loader))?;
        control.wait_ready(options.ready_timeout)?;
        Ok(Self {
            port: Some(port),
            counters,
            thread: Some(thread),
            use_atomics: options.use_atomics,
            next_task_id: 1,
        })
    }

    pub fn counters(&self) -> &SharedCounterBlock {
        &self.counters
    }

    pub fn call_blocking(&mut self, handler: HandlerRef, payload: Value) -> Result<TaskOutput, Error> {
        self.call_blocking_with(handler, payload, Vec::new(), None)
    }

    /// Must not be called from inside an async runtime.
    pub fn call_blocking_with(
        &mut self,
        handler: HandlerRef,
        payload: Value,
        transfers: Vec<TransferBuffer>,
        timeout: Option<Duration>,
    ) -> Result<TaskOutput, Error> {
        let task_id = self.next_task_id;
        self.next_task_id += 1;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let use_atomics = self.use_atomics;
        let counters = self.counters.clone();
        let port = self.port.as_mut().ok_or_else(|| {
            Error::new(ErrorKind::Transport).with_message("client is shut down")
        })?;

        let mut seen = counters.load_response_signal();
        let envelope = TaskEnvelope {
            task_id,
            handler,
            payload,
        };
        port.post(Message::Task(envelope), transfers)
            .map_err(|err| err.with_task(task_id))?;
        counters.add_request(1);
        counters.notify_request();

        loop {
            let packet = match port.try_recv() {
                TryRecv::Packet(packet) => packet,
                TryRecv::Closed => {
                    return Err(Error::new(ErrorKind::Transport)
                        .with_message("worker port closed")
                        .with_task(task_id));
                }
                TryRecv::Empty => {
                    let slice = match deadline {
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                return Err(Error::new(ErrorKind::Timeout)
                                    .with_message("task did not finish in time")
                                    .with_task(task_id));
                            }
                            WAIT_SLICE.min(deadline - now)
                        }
                        None => WAIT_SLICE,
                    };
                    if use_atomics {
                        counters.wait_response_signal(seen, Some(slice));
                        seen = counters.load_response_signal();
                        continue;
                    }
                    if deadline.is_some() {
                        std::thread::sleep(Duration::from_millis(1).min(slice));
                        continue;
                    }
                    match port.blocking_recv() {
                        Some(packet) => packet,
                        None => continue,
                    }
                }
            };

            match packet.message {
                Message::TaskResult(result) if result.task_id == task_id => {
                    let used_memory = result.used_memory;
                    let value = result.into_outcome().map_err(|err| err.with_worker(WORKER_ID))?;
                    return Ok(TaskOutput {
                        value,
                        transfers: packet.transfers,
                        used_memory,
                        worker: WORKER_ID,
                    });
                }
                Message::TaskResult(stale) => {
                    tracing::warn!(task_id = stale.task_id, "discarding stale task result");
                }
                Message::RpcRequest(request) => {
                    let body = Error::new(ErrorKind::Usage)
                        .with_message(format!(
                            "blocking client does not serve rpc method \"{}\"",
                            request.method
                        ))
                        .to_body();
                    port.post(
                        Message::RpcResponse(RpcResponse::failure(request.call_id, body)),
                        Vec::new(),
                    )?;
                }
                other => {
                    tracing::debug!(kind = other.kind_name(), "ignoring message on blocking client");
                }
            }
        }
    }

    pub fn shutdown(mut self) -> Result<(), Error> {
        self.release();
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| {
                Error::new(ErrorKind::Internal).with_message("worker thread panicked")
            }),
            None => Ok(()),
        }
    }

    fn release(&mut self) {
        if self.port.take().is_some() {
            self.counters.notify_request();
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.release();
    }
}
