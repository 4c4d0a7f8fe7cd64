//! Purpose: Define the public Rust API boundary for wakepool.
//! Exports: Pool, blocking client, handler registration, and the types they exchange.
//! Role: Public, additive-only surface over the core modules.
//! Invariants: Everything a pool user needs is reachable from this module alone.

mod pool;
mod sync_client;

pub use crate::core::abort::{AbortController, AbortSignal};
pub use crate::core::counters::{SharedCounterBlock, WaitOutcome, WaitStrategy};
pub use crate::core::envelope::{HandlerRef, Reply, TransferBuffer};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::registry::{
    Handler, HandlerError, HandlerResult, LocalBoxFuture, Module, ModuleLoader, ModuleTable,
    TaskInput, handler,
};
pub use crate::core::rpc::RpcPeer;
pub use crate::core::worker::{FlushTarget, StdStream, WorkerHooks};
pub use pool::{DISABLE_ATOMICS_ENV, Pool, PoolOptions, RunOptions, TaskOutput, WorkerStats};
pub use sync_client::SyncClient;
