//! Purpose: Controller-side pool that starts workers, submits tasks, and matches results.
//! Exports: `Pool`, `PoolOptions`, `RunOptions`, `TaskOutput`, `WorkerStats`, `DISABLE_ATOMICS_ENV`.
//! Role: Public entry point; owns every worker thread, data port, and counter block.
//! Invariants: Results are matched by `task_id` only; completion order is irrelevant.
//! Invariants: A closed worker port rejects each of its pending tasks with `Transport`.
//! Invariants: Tasks are posted only after the worker reported `Ready`.
#![allow(clippy::result_large_err)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::core::abort::AbortSignal;
use crate::core::channel::{Port, PortReceiver, PortSender, port_pair};
use crate::core::control::{ControlLink, control_pipe};
use crate::core::counters::SharedCounterBlock;
use crate::core::envelope::{HandlerRef, Message, TaskEnvelope, TaskResult, TransferBuffer};
use crate::core::error::{Error, ErrorKind};
use crate::core::registry::ModuleLoader;
use crate::core::rpc::{RpcMethods, RpcPeer};
use crate::core::worker::{
    DEFAULT_IDLE_WAIT, FlushTarget, WorkerConfig, WorkerHooks, default_flush_targets, spawn_worker,
};

pub const DISABLE_ATOMICS_ENV: &str = "WAKEPOOL_DISABLE_ATOMICS";

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct PoolOptions {
    pub size: usize,
    pub use_atomics: bool,
    pub idle_wait: Duration,
    pub ready_timeout: Duration,
    /// Caller-side default; the worker never interrupts a running handler.
    pub task_timeout: Option<Duration>,
    /// Reported through `stats`; nothing is recycled here.
    pub memory_limit: Option<u64>,
    pub preload: Option<HandlerRef>,
    pub flush: Vec<Arc<dyn FlushTarget>>,
    pub hooks: WorkerHooks,
    rpc_methods: RpcMethods,
    worker_rpc_methods: RpcMethods,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            use_atomics: true,
            idle_wait: DEFAULT_IDLE_WAIT,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            task_timeout: None,
            memory_limit: None,
            preload: None,
            flush: default_flush_targets(),
            hooks: WorkerHooks::default(),
            rpc_methods: RpcMethods::new(),
            worker_rpc_methods: RpcMethods::new(),
        }
    }
}

impl std::fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolOptions")
            .field("size", &self.size)
            .field("use_atomics", &self.use_atomics)
            .field("idle_wait", &self.idle_wait)
            .field("ready_timeout", &self.ready_timeout)
            .field("task_timeout", &self.task_timeout)
            .field("memory_limit", &self.memory_limit)
            .field("preload", &self.preload)
            .field("flush_targets", &self.flush.len())
            .field("hooks", &self.hooks)
            .field("rpc_methods", &self.rpc_methods)
            .field("worker_rpc_methods", &self.worker_rpc_methods)
            .finish()
    }
}

impl PoolOptions {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    /// Method served on the controller; handlers reach it through `TaskInput::rpc`.
    pub fn rpc_method<F, Fut>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Error>> + Send + 'static,
    {
        self.rpc_methods.register(name, method);
        self
    }

    /// Method served on every worker; the controller reaches it through `Pool::rpc`.
    pub fn worker_rpc_method<F, Fut>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Error>> + Send + 'static,
    {
        self.worker_rpc_methods.register(name, method);
        self
    }

    /// Apply environment overrides through `lookup`, e.g. `|key| std::env::var(key).ok()`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup(DISABLE_ATOMICS_ENV) {
            if matches!(value.trim(), "1" | "true") {
                self.use_atomics = false;
            }
        }
    }

    pub(crate) fn worker_config(
        &self,
        worker_id: usize,
        port: Port,
        counters: SharedCounterBlock,
        loader: Arc<dyn ModuleLoader>,
    ) -> WorkerConfig {
        let mut config = WorkerConfig::new(worker_id, port, counters, loader);
        config.use_atomics = self.use_atomics;
        config.idle_wait = self.idle_wait;
        config.preload = self.preload.clone();
        config.flush = self.flush.clone();
        config.hooks = self.hooks.clone();
        config.rpc_methods = self.worker_rpc_methods.clone();
        config
    }
}

#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub timeout: Option<Duration>,
    pub signal: Option<AbortSignal>,
}

impl RunOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

#[derive(Debug)]
pub struct TaskOutput {
    pub value: Value,
    pub transfers: Vec<TransferBuffer>,
    pub used_memory: u64,
    pub worker: usize,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct WorkerStats {
    pub worker_id: usize,
    pub completed: u64,
    pub pending: usize,
    pub used_memory: u64,
    pub over_memory_limit: bool,
    pub request_count: u32,
    pub response_count: u32,
}

type Responder = oneshot::Sender<Result<TaskOutput, Error>>;

#[derive(Default)]
struct PendingTable {
    tasks: HashMap<u64, Responder>,
    closed: Option<String>,
}

struct WorkerLink {
    worker_id: usize,
    sender: Mutex<Option<PortSender>>,
    counters: SharedCounterBlock,
    rpc: RpcPeer,
    pending: Mutex<PendingTable>,
    completed: AtomicU64,
    used_memory: AtomicU64,
    memory_limit: Option<u64>,
}

impl WorkerLink {
    fn submit(
        &self,
        task_id: u64,
        handler: HandlerRef,
        payload: Value,
        transfers: Vec<TransferBuffer>,
    ) -> Result<oneshot::Receiver<Result<TaskOutput, Error>>, Error> {
        let sender = lock(&self.sender).clone().ok_or_else(|| {
            Error::new(ErrorKind::Transport)
                .with_message("pool is shut down")
                .with_task(task_id)
                .with_worker(self.worker_id)
        })?;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if let Some(reason) = &pending.closed {
                return Err(Error::new(ErrorKind::Transport)
                    .with_message(reason.clone())
                    .with_task(task_id)
                    .with_worker(self.worker_id));
            }
            pending.tasks.insert(task_id, tx);
        }

        let envelope = TaskEnvelope {
            task_id,
            handler,
            payload,
        };
        if let Err(err) = sender.post(Message::Task(envelope), transfers) {
            self.forget(task_id);
            return Err(err.with_task(task_id).with_worker(self.worker_id));
        }
        self.counters.add_request(1);
        self.counters.notify_request();
        Ok(rx)
    }

    fn complete(&self, result: TaskResult, transfers: Vec<TransferBuffer>) {
        let task_id = result.task_id;
        let used_memory = result.used_memory;
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.used_memory.store(used_memory, Ordering::Relaxed);
        if let Some(limit) = self.memory_limit {
            if used_memory > limit {
                tracing::warn!(
                    worker_id = self.worker_id,
                    used_memory,
                    limit,
                    "worker exceeds memory limit"
                );
            }
        }

        let responder = lock(&self.pending).tasks.remove(&task_id);
        let Some(responder) = responder else {
            tracing::warn!(worker_id = self.worker_id, task_id, "discarding result for unknown task");
            return;
        };
        let worker = self.worker_id;
        let outcome = result
            .into_outcome()
            .map(|value| TaskOutput {
                value,
                transfers,
                used_memory,
                worker,
            })
            .map_err(|err| err.with_worker(worker));
        let _ = responder.send(outcome);
    }

    fn forget(&self, task_id: u64) {
        lock(&self.pending).tasks.remove(&task_id);
    }

    fn fail_all(&self, reason: &str) {
        let tasks = {
            let mut pending = lock(&self.pending);
            pending.closed = Some(reason.to_string());
            std::mem::take(&mut pending.tasks)
        };
        if !tasks.is_empty() {
            tracing::error!(worker_id = self.worker_id, pending = tasks.len(), reason, "rejecting pending tasks");
        }
        for (task_id, responder) in tasks {
            let err = Error::new(ErrorKind::Transport)
                .with_message(reason)
                .with_task(task_id)
                .with_worker(self.worker_id);
            let _ = responder.send(Err(err));
        }
        self.rpc
            .close(&Error::new(ErrorKind::Transport).with_message(reason));
    }

    /// Release the controller's senders so the worker sees its port close.
    fn close(&self) {
        lock(&self.sender).take();
        self.rpc
            .close(&Error::new(ErrorKind::Transport).with_message("pool is shut down"));
        self.counters.notify_request();
    }

    fn stats(&self) -> WorkerStats {
        let used_memory = self.used_memory.load(Ordering::Relaxed);
        WorkerStats {
            worker_id: self.worker_id,
            completed: self.completed.load(Ordering::Relaxed),
            pending: lock(&self.pending).tasks.len(),
            used_memory,
            over_memory_limit: self.memory_limit.is_some_and(|limit| used_memory > limit),
            request_count: self.counters.load_request(),
            response_count: self.counters.load_response(),
        }
    }
}

/// Routes everything a worker posts until its port closes.
async fn read_link(link: Arc<WorkerLink>, mut receiver: PortReceiver) {
    while let Some(packet) = receiver.recv().await {
        match packet.message {
            Message::TaskResult(result) => link.complete(result, packet.transfers),
            message if message.is_rpc() => {
                if let Some(serve) = link.rpc.handle_incoming(message) {
                    tokio::spawn(serve);
                }
            }
            other => tracing::warn!(
                worker_id = link.worker_id,
                kind = other.kind_name(),
                "ignoring unexpected message from worker"
            ),
        }
    }
    link.fail_all(&format!("worker {} port closed", link.worker_id));
}

/// Removes the pending entry if the caller stops waiting.
struct PendingTask<'a> {
    link: &'a WorkerLink,
    task_id: u64,
}

impl Drop for PendingTask<'_> {
    fn drop(&mut self) {
        self.link.forget(self.task_id);
    }
}

struct StartingWorker {
    control: ControlLink,
    thread: JoinHandle<()>,
    port: Port,
    counters: SharedCounterBlock,
}

pub struct Pool {
    links: Vec<Arc<WorkerLink>>,
    threads: Vec<JoinHandle<()>>,
    readers: Vec<tokio::task::JoinHandle<()>>,
    next_worker: AtomicUsize,
    next_task_id: AtomicU64,
    task_timeout: Option<Duration>,
}

impl Pool {
    /// Spawn `options.size` workers and wait until each reports ready.
    ///
    /// Must be called inside a tokio runtime. `WAKEPOOL_DISABLE_ATOMICS=1` in the
    /// process environment turns the counter fast path off.
    pub async fn start(loader: Arc<dyn ModuleLoader>, mut options: PoolOptions) -> Result<Pool, Error> {
        options.apply_env(|key| std::env::var(key).ok());
        if options.size == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("pool size must be at least 1")
                .with_hint("Pass a size of 1 or more to PoolOptions::new."));
        }

        let mut starting = Vec::with_capacity(options.size);
        for worker_id in 0..options.size {
            let (port, worker_port) = port_pair();
            let counters = SharedCounterBlock::anonymous()?;
            let (control, endpoint) = control_pipe();
            let thread = spawn_worker(worker_id, endpoint)?;
            control.configure(options.worker_config(
                worker_id,
                worker_port,
                counters.clone(),
                loader.clone(),
            ))?;
            starting.push(StartingWorker {
                control,
                thread,
                port,
                counters,
            });
        }

        let ready_timeout = options.ready_timeout;
        let starting = tokio::task::spawn_blocking(move || {
            for worker in &starting {
                worker.control.wait_ready(ready_timeout)?;
            }
            Ok::<_, Error>(starting)
        })
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("worker startup task failed")
                .with_source(err)
        })??;

        let mut links = Vec::with_capacity(starting.len());
        let mut threads = Vec::with_capacity(starting.len());
        let mut readers = Vec::with_capacity(starting.len());
        for (worker_id, worker) in starting.into_iter().enumerate() {
            let (sender, receiver) = worker.port.split();
            let wake_counters = worker.counters.clone();
            // Controller RPC leaves request_count alone; the notify still moves the request signal.
            let rpc = RpcPeer::with_wake(sender.clone(), options.rpc_methods.clone(), move || {
                wake_counters.notify_request()
            });
            let link = Arc::new(WorkerLink {
                worker_id,
                sender: Mutex::new(Some(sender)),
                counters: worker.counters,
                rpc,
                pending: Mutex::new(PendingTable::default()),
                completed: AtomicU64::new(0),
                used_memory: AtomicU64::new(0),
                memory_limit: options.memory_limit,
            });
            readers.push(tokio::spawn(read_link(link.clone(), receiver)));
            links.push(link);
            threads.push(worker.thread);
        }
        tracing::debug!(workers = links.len(), use_atomics = options.use_atomics, "pool started");

        Ok(Pool {
            links,
            threads,
            readers,
            next_worker: AtomicUsize::new(0),
            next_task_id: AtomicU64::new(1),
            task_timeout: options.task_timeout,
        })
    }

    pub fn size(&self) -> usize {
        self.links.len()
    }

    pub async fn run(&self, handler: HandlerRef, payload: Value) -> Result<TaskOutput, Error> {
        self.run_with(handler, payload, Vec::new(), RunOptions::default())
            .await
    }

    pub async fn run_with(
        &self,
        handler: HandlerRef,
        payload: Value,
        transfers: Vec<TransferBuffer>,
        options: RunOptions,
    ) -> Result<TaskOutput, Error> {
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let RunOptions { timeout, signal } = options;
        let mut signal = signal;
        if signal.as_ref().is_some_and(AbortSignal::is_aborted) {
            return Err(aborted(task_id));
        }

        let link = self.pick();
        let rx = link.submit(task_id, handler, payload, transfers)?;
        let _pending = PendingTask {
            link: link.as_ref(),
            task_id,
        };

        let timeout = timeout.or(self.task_timeout);
        let expired = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };
        let cancelled = async {
            match signal.as_mut() {
                Some(signal) => signal.aborted().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            outcome = rx => outcome.unwrap_or_else(|_| {
                Err(Error::new(ErrorKind::Transport)
                    .with_message("result channel dropped")
                    .with_task(task_id)
                    .with_worker(link.worker_id))
            }),
            _ = expired => {
                let waited = timeout.map(|timeout| timeout.as_millis()).unwrap_or_default();
                Err(Error::new(ErrorKind::Timeout)
                    .with_message(format!("task did not finish within {waited}ms"))
                    .with_task(task_id)
                    .with_worker(link.worker_id))
            }
            _ = cancelled => Err(aborted(task_id).with_worker(link.worker_id)),
        }
    }

    /// The controller's RPC peer for one worker.
    pub fn rpc(&self, worker: usize) -> Result<RpcPeer, Error> {
        Ok(self.link(worker)?.rpc.clone())
    }

    pub fn counters(&self, worker: usize) -> Result<SharedCounterBlock, Error> {
        Ok(self.link(worker)?.counters.clone())
    }

    pub fn stats(&self) -> Vec<WorkerStats> {
        self.links.iter().map(|link| link.stats()).collect()
    }

    /// Drain RPC traffic, close every port, and join the worker threads.
    pub async fn shutdown(mut self) -> Result<(), Error> {
        for link in &self.links {
            link.rpc.drain().await;
        }
        for link in &self.links {
            link.close();
        }

        let threads = std::mem::take(&mut self.threads);
        let panicked = tokio::task::spawn_blocking(move || {
            threads
                .into_iter()
                .map(|thread| thread.join())
                .filter(Result::is_err)
                .count()
        })
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("worker join task failed")
                .with_source(err)
        })?;
        for reader in std::mem::take(&mut self.readers) {
            let _ = reader.await;
        }
        if panicked > 0 {
            return Err(Error::new(ErrorKind::Internal)
                .with_message(format!("{panicked} worker thread(s) panicked")));
        }
        tracing::debug!("pool shut down");
        Ok(())
    }

    fn pick(&self) -> &Arc<WorkerLink> {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.links.len();
        &self.links[index]
    }

    fn link(&self, worker: usize) -> Result<&Arc<WorkerLink>, Error> {
        self.links.get(worker).ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message(format!(
                "worker {worker} out of range (pool has {})",
                self.links.len()
            ))
        })
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        for link in &self.links {
            link.close();
        }
    }
}

fn aborted(task_id: u64) -> Error {
    Error::new(ErrorKind::Aborted)
        .with_message("task was aborted by the caller")
        .with_task(task_id)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_disables_atomics() {
        let mut options = PoolOptions::new(2);
        options.apply_env(|key| (key == DISABLE_ATOMICS_ENV).then(|| "1".to_string()));
        assert!(!options.use_atomics);

        let mut options = PoolOptions::new(2);
        options.apply_env(|key| (key == DISABLE_ATOMICS_ENV).then(|| "0".to_string()));
        assert!(options.use_atomics);

        let mut options = PoolOptions::new(2);
        options.apply_env(|_| None);
        assert!(options.use_atomics);
    }

    #[test]
    fn worker_config_carries_pool_options() {
        let mut options = PoolOptions::new(1);
        options.use_atomics = false;
        options.idle_wait = Duration::from_millis(7);
        options.preload = Some(HandlerRef::new("math", "double"));
        options.flush = Vec::new();
        let (_controller, worker_port) = port_pair();
        let counters = SharedCounterBlock::anonymous().expect("counters");
        let loader: Arc<dyn ModuleLoader> = Arc::new(crate::core::registry::ModuleTable::new());
        let config = options.worker_config(3, worker_port, counters, loader);
        assert_eq!(config.worker_id, 3);
        assert!(!config.use_atomics);
        assert_eq!(config.idle_wait, Duration::from_millis(7));
        assert_eq!(config.preload, Some(HandlerRef::new("math", "double")));
        assert!(config.flush.is_empty());
    }

    #[tokio::test]
    async fn zero_size_pool_is_usage_error() {
        let loader: Arc<dyn ModuleLoader> = Arc::new(crate::core::registry::ModuleTable::new());
        let err = Pool::start(loader, PoolOptions::new(0))
            .await
            .err()
            .expect("usage");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
