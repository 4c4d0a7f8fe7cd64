//! Purpose: Worker-pool task dispatch library used by the `wakepool` CLI and tests.
//! Exports: `api` (pool, blocking client, handlers) and `core` (counters, ports, protocol).
//! Role: Hands tasks from a controller to worker threads with futex-style wakeups.
//! Invariants: `api` is the stable surface; `core` is exposed for transports and tests.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
