//! Purpose: Resolve `(module, export)` references to handlers, loading each module once.
//! Exports: `Handler`, `HandlerError`, `TaskInput`, `Module`, `ModuleLoader`, `ModuleTable`,
//! `HandlerRegistry`, `HandlerId`, `LoadState`, `handler`.
//! Role: Per-worker cache between the dispatch loop and user handler code.
//! Invariants: Concurrent resolves of one key share a single in-flight load.
//! Invariants: Failures are cached as terminal and returned again without reloading.
//! Invariants: A loader that panics is a failed load, never an unwinding resolve.
//! Invariants: The registry is owned by one worker thread (`Rc`/`RefCell`); never shared.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::OnceCell;

use crate::core::envelope::{HandlerRef, Reply, TransferBuffer};
use crate::core::error::{Error, ErrorBody, ErrorKind};
use crate::core::rpc::RpcPeer;

pub type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;
pub type HandlerError = Box<dyn StdError + Send + Sync>;
pub type HandlerResult = Result<Reply, HandlerError>;
pub type Handler = Arc<dyn Fn(TaskInput) -> LocalBoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + 'static,
{
    Arc::new(move |input: TaskInput| -> LocalBoxFuture<'static, HandlerResult> {
        Box::pin(f(input))
    })
}

/// What a handler receives for one task.
pub struct TaskInput {
    pub task_id: u64,
    pub payload: Value,
    pub transfers: Vec<TransferBuffer>,
    worker_id: usize,
    rpc: RpcPeer,
}

impl TaskInput {
    pub(crate) fn new(
        task_id: u64,
        payload: Value,
        transfers: Vec<TransferBuffer>,
        worker_id: usize,
        rpc: RpcPeer,
    ) -> Self {
        Self {
            task_id,
            payload,
            transfers,
            worker_id,
            rpc,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Control-plane calls back to the controller.
    pub fn rpc(&self) -> &RpcPeer {
        &self.rpc
    }
}

#[derive(Clone, Default)]
pub struct Module {
    exports: HashMap<String, Handler>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + 'static,
    {
        self.exports.insert(name.into(), handler(f));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, handler: Handler) {
        self.exports.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.exports.get(name).cloned()
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.exports.keys()).finish()
    }
}

/// Loads a module by reference. Loads may suspend; they run on the worker's event loop.
pub trait ModuleLoader: Send + Sync {
    fn load<'a>(&'a self, module: &'a str) -> LocalBoxFuture<'a, Result<Module, Error>>;
}

impl<F> ModuleLoader for F
where
    F: Fn(&str) -> Result<Module, Error> + Send + Sync,
{
    fn load<'a>(&'a self, module: &'a str) -> LocalBoxFuture<'a, Result<Module, Error>> {
        Box::pin(async move { self(module) })
    }
}

/// In-process modules, shared by every worker of a pool.
#[derive(Clone, Debug, Default)]
pub struct ModuleTable {
    modules: HashMap<String, Module>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn module(mut self, name: impl Into<String>, module: Module) -> Self {
        self.modules.insert(name.into(), module);
        self
    }
}

impl ModuleLoader for ModuleTable {
    fn load<'a>(&'a self, module: &'a str) -> LocalBoxFuture<'a, Result<Module, Error>> {
        Box::pin(async move {
            self.modules.get(module).cloned().ok_or_else(|| {
                Error::new(ErrorKind::HandlerResolution)
                    .with_message(format!("cannot find module \"{module}\""))
            })
        })
    }
}

/// Polls the inner future, turning a panic in any poll into `Err(detail)`.
struct CatchPanic<'a, T>(LocalBoxFuture<'a, T>);

impl<T> Future for CatchPanic<'_, T> {
    type Output = Result<T, String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = self.0.as_mut();
        match catch_unwind(AssertUnwindSafe(|| inner.poll(cx))) {
            Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(panic) => Poll::Ready(Err(panic_detail(panic.as_ref()))),
        }
    }
}

pub(crate) fn panic_detail(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct HandlerId(u32);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

struct LoadSlot<T> {
    loading: Cell<bool>,
    cell: OnceCell<Result<T, ErrorBody>>,
}

impl<T> LoadSlot<T> {
    fn new() -> Self {
        Self {
            loading: Cell::new(false),
            cell: OnceCell::new(),
        }
    }

    fn state(&self) -> LoadState {
        match self.cell.get() {
            Some(Ok(_)) => LoadState::Ready,
            Some(Err(_)) => LoadState::Failed,
            None if self.loading.get() => LoadState::Loading,
            None => LoadState::Unloaded,
        }
    }
}

pub struct HandlerRegistry {
    loader: Arc<dyn ModuleLoader>,
    modules: RefCell<HashMap<String, Rc<LoadSlot<Rc<Module>>>>>,
    index: RefCell<HashMap<HandlerRef, HandlerId>>,
    arena: RefCell<Vec<Rc<LoadSlot<Handler>>>>,
    module_loads: Cell<usize>,
}

impl HandlerRegistry {
    pub fn new(loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            loader,
            modules: RefCell::new(HashMap::new()),
            index: RefCell::new(HashMap::new()),
            arena: RefCell::new(Vec::new()),
            module_loads: Cell::new(0),
        }
    }

    pub async fn resolve(&self, key: &HandlerRef) -> Result<Handler, Error> {
        let id = self.intern(key);
        let slot = self.arena.borrow()[id.0 as usize].clone();
        let outcome = slot
            .cell
            .get_or_init(|| async {
                slot.loading.set(true);
                let outcome = match self.load_module(&key.module).await {
                    Ok(module) => module.get(&key.export).ok_or_else(|| {
                        Error::new(ErrorKind::HandlerResolution)
                            .with_message(format!(
                                "no handler \"{}\" exported from \"{}\"",
                                key.export, key.module
                            ))
                            .to_body()
                    }),
                    Err(body) => Err(body),
                };
                slot.loading.set(false);
                outcome
            })
            .await;
        outcome.clone().map_err(Error::from_body)
    }

    pub fn state(&self, key: &HandlerRef) -> LoadState {
        let Some(id) = self.index.borrow().get(key).copied() else {
            return LoadState::Unloaded;
        };
        self.arena.borrow()[id.0 as usize].state()
    }

    pub fn id_of(&self, key: &HandlerRef) -> Option<HandlerId> {
        self.index.borrow().get(key).copied()
    }

    /// Number of module loads attempted so far.
    pub fn module_loads(&self) -> usize {
        self.module_loads.get()
    }

    fn intern(&self, key: &HandlerRef) -> HandlerId {
        if let Some(id) = self.index.borrow().get(key) {
            return *id;
        }
        let mut arena = self.arena.borrow_mut();
        let id = HandlerId(arena.len() as u32);
        arena.push(Rc::new(LoadSlot::new()));
        self.index.borrow_mut().insert(key.clone(), id);
        id
    }

    async fn load_module(&self, module: &str) -> Result<Rc<Module>, ErrorBody> {
        let slot = self
            .modules
            .borrow_mut()
            .entry(module.to_string())
            .or_insert_with(|| Rc::new(LoadSlot::new()))
            .clone();
        slot.cell
            .get_or_init(|| async {
                slot.loading.set(true);
                self.module_loads.set(self.module_loads.get() + 1);
                tracing::debug!(module, "loading handler module");
                // `load` itself runs inside the first poll, so a synchronous panic is caught too.
                let guarded = CatchPanic(Box::pin(async move { self.loader.load(module).await }));
                let outcome = match guarded.await {
                    Ok(Ok(loaded)) => Ok(Rc::new(loaded)),
                    Ok(Err(err)) => {
                        tracing::debug!(module, error = %err, "handler module failed to load");
                        Err(Error::new(ErrorKind::HandlerResolution)
                            .with_message(format!(
                                "failed to load module \"{module}\": {}",
                                err.message().unwrap_or("load error")
                            ))
                            .to_body())
                    }
                    Err(detail) => {
                        tracing::warn!(module, panic = %detail, "handler module panicked while loading");
                        Err(Error::new(ErrorKind::HandlerResolution)
                            .with_message(format!(
                                "module \"{module}\" panicked while loading: {detail}"
                            ))
                            .to_body())
                    }
                };
                slot.loading.set(false);
                outcome
            })
            .await
            .clone()
    }
}
