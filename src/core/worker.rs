//! Purpose: Worker thread entry and dispatch loop for one pool slot.
//! Exports: `WorkerConfig`, `WorkerHooks`, `FlushTarget`, `StdStream`, `spawn_worker`,
//! `resident_memory`, `DEFAULT_IDLE_WAIT`.
//! Role: Waits on the request signal while idle, drains the data port, runs handlers.
//! Invariants: The loop blocks on the signal only while no task or RPC serve is in flight.
//! Invariants: The signal is snapshotted before `Ready` and re-read after every wake, before the drain.
//! Invariants: A successful result is flushed, posted, then counted; posting failure ends the loop.
//! Notes: Blocking in the idle wait is deliberate; nothing else is runnable on this thread then.

use std::any::Any;
use std::io::{self, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::LocalSet;

use crate::core::channel::{Packet, Port, PortSender, TryRecv};
use crate::core::control::{ControlEndpoint, WorkerStatus};
use crate::core::counters::{SharedCounterBlock, WaitOutcome};
use crate::core::envelope::{HandlerRef, Message, Reply, TaskEnvelope, TaskResult, TransferBuffer};
use crate::core::error::{Error, ErrorKind};
use crate::core::registry::{HandlerError, HandlerRegistry, ModuleLoader, TaskInput, panic_detail};
use crate::core::rpc::{RpcMethods, RpcPeer};

pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(100);

/// Something buffered that must reach its sink before a task is reported complete.
pub trait FlushTarget: Send + Sync {
    fn flush(&self) -> io::Result<()>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StdStream {
    Stdout,
    Stderr,
}

impl FlushTarget for StdStream {
    fn flush(&self) -> io::Result<()> {
        match self {
            StdStream::Stdout => io::stdout().flush(),
            StdStream::Stderr => io::stderr().flush(),
        }
    }
}

pub fn default_flush_targets() -> Vec<Arc<dyn FlushTarget>> {
    vec![Arc::new(StdStream::Stdout), Arc::new(StdStream::Stderr)]
}

type AfterWake = Arc<dyn Fn(usize) + Send + Sync>;

/// Test seams inside the dispatch loop.
#[derive(Clone, Default)]
pub struct WorkerHooks {
    after_wake: Option<AfterWake>,
}

impl WorkerHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs on the worker thread after every return from the idle wait, before the drain.
    pub fn on_after_wake(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.after_wake = Some(Arc::new(hook));
        self
    }

    fn after_wake(&self, worker_id: usize) {
        if let Some(hook) = &self.after_wake {
            hook(worker_id);
        }
    }
}

impl std::fmt::Debug for WorkerHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHooks")
            .field("after_wake", &self.after_wake.is_some())
            .finish()
    }
}

/// Everything a worker needs, delivered over the control pipe.
pub struct WorkerConfig {
    pub worker_id: usize,
    pub port: Port,
    pub counters: SharedCounterBlock,
    pub loader: Arc<dyn ModuleLoader>,
    pub use_atomics: bool,
    pub idle_wait: Duration,
    pub preload: Option<HandlerRef>,
    pub flush: Vec<Arc<dyn FlushTarget>>,
    pub hooks: WorkerHooks,
    pub rpc_methods: RpcMethods,
}

impl WorkerConfig {
    pub fn new(
        worker_id: usize,
        port: Port,
        counters: SharedCounterBlock,
        loader: Arc<dyn ModuleLoader>,
    ) -> Self {
        Self {
            worker_id,
            port,
            counters,
            loader,
            use_atomics: true,
            idle_wait: DEFAULT_IDLE_WAIT,
            preload: None,
            flush: default_flush_targets(),
            hooks: WorkerHooks::default(),
            rpc_methods: RpcMethods::new(),
        }
    }
}

/// Start a worker thread that waits for `Configure` on `endpoint`.
pub fn spawn_worker(index: usize, endpoint: ControlEndpoint) -> Result<JoinHandle<()>, Error> {
    std::thread::Builder::new()
        .name(format!("wakepool-worker-{index}"))
        .spawn(move || worker_main(endpoint))
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to spawn worker thread")
                .with_worker(index)
                .with_source(err)
        })
}

fn worker_main(endpoint: ControlEndpoint) {
    let Some(config) = endpoint.recv_configure() else {
        tracing::debug!("worker released before configuration");
        return;
    };
    let worker_id = config.worker_id;
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let error = Error::new(ErrorKind::Internal)
                .with_message("failed to build worker runtime")
                .with_source(err);
            endpoint.report(WorkerStatus::SetupFailed {
                worker_id,
                error: error.to_body(),
            });
            return;
        }
    };

    let local = LocalSet::new();
    let outcome = local.block_on(&runtime, async move {
        let dispatcher = match Dispatcher::setup(config).await {
            Ok(dispatcher) => dispatcher,
            Err(err) => {
                tracing::warn!(worker_id, error = %err, "worker setup failed");
                endpoint.report(WorkerStatus::SetupFailed {
                    worker_id,
                    error: err.to_body(),
                });
                return Ok(());
            }
        };
        endpoint.report(WorkerStatus::Ready { worker_id });
        dispatcher.run().await
    });
    match outcome {
        Ok(()) => tracing::debug!(worker_id, "worker stopped"),
        Err(err) => tracing::error!(worker_id, error = %err, "worker loop failed"),
    }
}

struct TaskContext {
    worker_id: usize,
    sender: PortSender,
    counters: SharedCounterBlock,
    registry: HandlerRegistry,
    rpc: RpcPeer,
    flush: Vec<Arc<dyn FlushTarget>>,
}

type Completion = Result<(), Error>;

struct Dispatcher {
    port: Port,
    ctx: Rc<TaskContext>,
    use_atomics: bool,
    idle_wait: Duration,
    hooks: WorkerHooks,
    seen: u32,
}

impl Dispatcher {
    async fn setup(config: WorkerConfig) -> Result<Self, Error> {
        let WorkerConfig {
            worker_id,
            port,
            counters,
            loader,
            use_atomics,
            idle_wait,
            preload,
            flush,
            hooks,
            rpc_methods,
        } = config;

        let sender = port.sender();
        let wake_counters = counters.clone();
        // Worker-originated RPC wakes a controller blocked on the response signal.
        let rpc = RpcPeer::with_wake(sender.clone(), rpc_methods, move || {
            wake_counters.notify_response()
        });
        let registry = HandlerRegistry::new(loader);
        if let Some(handler) = &preload {
            registry
                .resolve(handler)
                .await
                .map_err(|err| err.with_worker(worker_id))?;
            tracing::debug!(worker_id, %handler, "preloaded handler");
        }

        // Taken before `Ready` goes out; anything posted after it moves the signal.
        let seen = counters.load_request_signal();
        Ok(Self {
            port,
            ctx: Rc::new(TaskContext {
                worker_id,
                sender,
                counters,
                registry,
                rpc,
                flush,
            }),
            use_atomics,
            idle_wait,
            hooks,
            seen,
        })
    }

    async fn run(self) -> Result<(), Error> {
        let Dispatcher {
            mut port,
            ctx,
            use_atomics,
            idle_wait,
            hooks,
            mut seen,
        } = self;
        let worker_id = ctx.worker_id;
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
        let mut in_flight = 0usize;

        loop {
            if in_flight == 0 && use_atomics {
                let outcome = ctx.counters.wait_request_signal(seen, Some(idle_wait));
                hooks.after_wake(worker_id);
                seen = ctx.counters.load_request_signal();
                if outcome != WaitOutcome::TimedOut {
                    tracing::debug!(
                        worker_id,
                        ?outcome,
                        request_count = ctx.counters.load_request(),
                        "worker woke"
                    );
                }
                loop {
                    match port.try_recv() {
                        TryRecv::Packet(packet) => dispatch(&ctx, packet, &done_tx, &mut in_flight),
                        TryRecv::Empty => break,
                        TryRecv::Closed => return port_closed(&ctx, in_flight),
                    }
                }
                if in_flight == 0 {
                    continue;
                }
            }

            tokio::select! {
                packet = port.recv() => match packet {
                    Some(packet) => dispatch(&ctx, packet, &done_tx, &mut in_flight),
                    None => return port_closed(&ctx, in_flight),
                },
                Some(done) = done_rx.recv() => {
                    in_flight -= 1;
                    done?;
                }
            }
        }
    }
}

fn dispatch(
    ctx: &Rc<TaskContext>,
    packet: Packet,
    done: &mpsc::UnboundedSender<Completion>,
    in_flight: &mut usize,
) {
    let Packet { message, transfers } = packet;
    match message {
        Message::Task(envelope) => {
            tracing::debug!(
                worker_id = ctx.worker_id,
                task_id = envelope.task_id,
                handler = %envelope.handler,
                "dispatching task"
            );
            *in_flight += 1;
            let ctx = Rc::clone(ctx);
            let done = done.clone();
            tokio::task::spawn_local(async move {
                let _ = done.send(run_task(&ctx, envelope, transfers).await);
            });
        }
        message if message.is_rpc() => {
            if let Some(serve) = ctx.rpc.handle_incoming(message) {
                *in_flight += 1;
                let done = done.clone();
                tokio::task::spawn_local(async move {
                    serve.await;
                    let _ = done.send(Ok(()));
                });
            }
        }
        other => tracing::warn!(
            worker_id = ctx.worker_id,
            kind = other.kind_name(),
            "ignoring unexpected message on worker port"
        ),
    }
}

fn port_closed(ctx: &TaskContext, in_flight: usize) -> Result<(), Error> {
    tracing::debug!(worker_id = ctx.worker_id, in_flight, "data port closed");
    ctx.rpc.close(&Error::new(ErrorKind::Transport).with_message("data port closed"));
    Ok(())
}

async fn run_task(
    ctx: &TaskContext,
    envelope: TaskEnvelope,
    transfers: Vec<TransferBuffer>,
) -> Result<(), Error> {
    let task_id = envelope.task_id;
    let outcome = execute(ctx, envelope, transfers).await;
    let used_memory = resident_memory();

    let (result, transfers) = match outcome {
        Ok(reply) => {
            for target in &ctx.flush {
                if let Err(err) = target.flush() {
                    tracing::warn!(worker_id = ctx.worker_id, task_id, error = %err, "flush failed");
                }
            }
            let (value, transfers) = reply.into_parts();
            (TaskResult::success(task_id, value, used_memory), transfers)
        }
        Err(err) => {
            tracing::debug!(worker_id = ctx.worker_id, task_id, error = %err, "task failed");
            (TaskResult::failure(task_id, &err, used_memory), Vec::new())
        }
    };
    ctx.sender
        .post(Message::TaskResult(result), transfers)
        .map_err(|err| err.with_task(task_id).with_worker(ctx.worker_id))?;
    ctx.counters.add_response(1);
    ctx.counters.notify_response();
    Ok(())
}

async fn execute(
    ctx: &TaskContext,
    envelope: TaskEnvelope,
    transfers: Vec<TransferBuffer>,
) -> Result<Reply, Error> {
    let TaskEnvelope {
        task_id,
        handler: key,
        payload,
    } = envelope;
    let handler = ctx.registry.resolve(&key).await?;
    let input = TaskInput::new(task_id, payload, transfers, ctx.worker_id, ctx.rpc.clone());

    let future = catch_unwind(AssertUnwindSafe(|| handler(input)))
        .map_err(|panic| panicked(&key, panic))?;
    match tokio::task::spawn_local(future).await {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(err)) => Err(handler_failed(err)),
        Err(join) if join.is_panic() => Err(panicked(&key, join.into_panic())),
        Err(_) => Err(Error::new(ErrorKind::HandlerExecution)
            .with_message(format!("handler {key} was cancelled"))),
    }
}

fn handler_failed(err: HandlerError) -> Error {
    match err.downcast::<Error>() {
        Ok(err) => *err,
        Err(other) => Error::new(ErrorKind::HandlerExecution).with_message(other.to_string()),
    }
}

fn panicked(key: &HandlerRef, panic: Box<dyn Any + Send>) -> Error {
    let detail = panic_detail(panic.as_ref());
    Error::new(ErrorKind::HandlerExecution).with_message(format!("handler {key} panicked: {detail}"))
}

/// Resident set size of this process in bytes; 0 where unavailable.
#[cfg(target_os = "linux")]
pub fn resident_memory() -> u64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    let pages = statm
        .split_whitespace()
        .nth(1)
        .and_then(|field| field.parse::<u64>().ok())
        .unwrap_or(0);
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size > 0 {
        pages * page_size as u64
    } else {
        pages * 4096
    }
}

#[cfg(not(target_os = "linux"))]
pub fn resident_memory() -> u64 {
    0
}
