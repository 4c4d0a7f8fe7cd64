//! Purpose: Wire shapes for task requests, task results, and RPC traffic on one port.
//! Exports: `Message`, `HandlerRef`, `TaskEnvelope`, `TaskResult`, `RpcRequest`,
//! `RpcResponse`, `Reply`, `TransferBuffer`.
//! Role: Shared vocabulary between controller, worker, framing, and RPC layer.
//! Invariants: `Message` is tagged by `kind`, so tasks and RPC frames never alias.
//! Invariants: Exactly one of `result`/`error` is set on `TaskResult` and `RpcResponse`.
//! Invariants: `TransferBuffer` is not `Clone`; moving it moves the only owner.

use std::fmt;
use std::ops::{Deref, DerefMut};

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{Error, ErrorBody, ErrorKind};

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct HandlerRef {
    pub module: String,
    pub export: String,
}

impl HandlerRef {
    pub fn new(module: impl Into<String>, export: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            export: export.into(),
        }
    }
}

impl fmt::Display for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.module, self.export)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: u64,
    pub handler: HandlerRef,
    pub payload: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: u64,
    pub result: Option<Value>,
    pub error: Option<ErrorBody>,
    pub used_memory: u64,
}

impl TaskResult {
    pub fn success(task_id: u64, value: Value, used_memory: u64) -> Self {
        Self {
            task_id,
            result: Some(value),
            error: None,
            used_memory,
        }
    }

    pub fn failure(task_id: u64, err: &Error, used_memory: u64) -> Self {
        let mut body = err.to_body();
        body.task_id = Some(task_id);
        Self {
            task_id,
            result: None,
            error: Some(body),
            used_memory,
        }
    }

    pub fn into_outcome(self) -> Result<Value, Error> {
        match (self.result, self.error) {
            (_, Some(body)) => Err(Error::from_body(body).with_task(self.task_id)),
            (Some(value), None) => Ok(value),
            (None, None) => Err(Error::new(ErrorKind::Corrupt)
                .with_message("task result carries neither value nor error")
                .with_task(self.task_id)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub call_id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub call_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl RpcResponse {
    pub fn success(call_id: u64, value: Value) -> Self {
        Self {
            call_id,
            result: Some(value),
            error: None,
        }
    }

    pub fn failure(call_id: u64, body: ErrorBody) -> Self {
        Self {
            call_id,
            result: None,
            error: Some(body),
        }
    }
}

/// Everything that travels on a data port, discriminated by `kind`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Task(TaskEnvelope),
    TaskResult(TaskResult),
    RpcRequest(RpcRequest),
    RpcResponse(RpcResponse),
    RpcCancel { call_id: u64 },
}

impl Message {
    pub fn is_rpc(&self) -> bool {
        matches!(
            self,
            Message::RpcRequest(_) | Message::RpcResponse(_) | Message::RpcCancel { .. }
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Task(_) => "task",
            Message::TaskResult(_) => "task_result",
            Message::RpcRequest(_) => "rpc_request",
            Message::RpcResponse(_) => "rpc_response",
            Message::RpcCancel { .. } => "rpc_cancel",
        }
    }
}

/// A byte buffer whose ownership moves across a port instead of being copied.
///
/// Once a buffer is placed in a transfer list the sender no longer holds it:
///
/// ```compile_fail
/// use wakepool::core::envelope::{Reply, TransferBuffer};
///
/// let buffer = TransferBuffer::from_vec(vec![1, 2, 3]);
/// let reply = Reply::movable(serde_json::json!({"len": 3}), vec![buffer]);
/// println!("{}", buffer.len());
/// # drop(reply);
/// ```
#[derive(Debug, Eq, PartialEq)]
pub struct TransferBuffer {
    bytes: BytesMut,
}

impl TransferBuffer {
    pub fn new(bytes: BytesMut) -> Self {
        Self { bytes }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: BytesMut::from(&bytes[..]),
        }
    }

    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: BytesMut::zeroed(len),
        }
    }

    /// Address of the backing allocation; unchanged by in-process transfer.
    pub fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    pub fn into_inner(self) -> BytesMut {
        self.bytes
    }
}

impl Deref for TransferBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for TransferBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// What a handler hands back: a plain value, or a value plus buffers to move.
#[derive(Debug)]
pub enum Reply {
    Plain(Value),
    Movable {
        value: Value,
        transfers: Vec<TransferBuffer>,
    },
}

impl Reply {
    pub fn plain(value: impl Into<Value>) -> Self {
        Reply::Plain(value.into())
    }

    pub fn movable(value: impl Into<Value>, transfers: Vec<TransferBuffer>) -> Self {
        Reply::Movable {
            value: value.into(),
            transfers,
        }
    }

    pub fn into_parts(self) -> (Value, Vec<TransferBuffer>) {
        match self {
            Reply::Plain(value) => (value, Vec::new()),
            Reply::Movable { value, transfers } => (value, transfers),
        }
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Plain(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_kind_tag_is_on_the_wire() {
        let message = Message::Task(TaskEnvelope {
            task_id: 1,
            handler: HandlerRef::new("math", "double"),
            payload: json!(21),
        });
        let encoded = serde_json::to_value(&message).expect("encode");
        assert_eq!(encoded["kind"], "task");
        assert_eq!(encoded["handler"]["export"], "double");

        let cancel = serde_json::to_value(Message::RpcCancel { call_id: 9 }).expect("encode");
        assert_eq!(cancel, json!({"kind": "rpc_cancel", "call_id": 9}));
    }

    #[test]
    fn rpc_and_task_messages_are_distinguished() {
        let raw = json!({"kind": "rpc_request", "call_id": 3, "method": "fetch", "params": ["a"]});
        let message: Message = serde_json::from_value(raw).expect("decode");
        assert!(message.is_rpc());
        assert_eq!(message.kind_name(), "rpc_request");

        let raw = json!({"kind": "task_result", "task_id": 3, "result": 1, "error": null, "used_memory": 0});
        let message: Message = serde_json::from_value(raw).expect("decode");
        assert!(!message.is_rpc());
    }

    #[test]
    fn failed_result_becomes_error_with_task_id() {
        let err = Error::new(ErrorKind::HandlerResolution).with_message("no handler");
        let result = TaskResult::failure(5, &err, 128);
        assert!(result.result.is_none());
        let err = result.into_outcome().expect_err("error");
        assert_eq!(err.kind(), ErrorKind::HandlerResolution);
        assert_eq!(err.task_id(), Some(5));
    }

    #[test]
    fn empty_result_is_corrupt() {
        let result = TaskResult {
            task_id: 2,
            result: None,
            error: None,
            used_memory: 0,
        };
        let err = result.into_outcome().expect_err("corrupt");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn movable_reply_splits_value_and_buffers() {
        let buffer = TransferBuffer::from_vec(vec![7; 16]);
        let ptr = buffer.as_ptr();
        let (value, transfers) = Reply::movable(json!({"len": 16}), vec![buffer]).into_parts();
        assert_eq!(value, json!({"len": 16}));
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].as_ptr(), ptr);

        let (value, transfers) = Reply::plain(4).into_parts();
        assert_eq!(value, json!(4));
        assert!(transfers.is_empty());
    }
}
