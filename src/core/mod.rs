// Core modules: counters, ports, framing, envelopes, handlers, RPC, and the worker loop.
pub mod abort;
pub mod channel;
pub mod control;
pub mod counters;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod registry;
pub mod rpc;
pub mod worker;
