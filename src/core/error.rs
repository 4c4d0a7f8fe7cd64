//! Purpose: Single error type shared by the controller, workers, and RPC layer.
//! Exports: `Error`, `ErrorKind`, `ErrorBody`, `to_exit_code`.
//! Role: Structured errors that can cross the port as `ErrorBody` and be rebuilt.
//! Invariants: Kinds are stable; `ErrorBody` round-trips kind, message, and task id.
//! Invariants: Only `Transport` is fatal to a worker loop; every other kind is per-task.
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Internal,
    Usage,
    HandlerResolution,
    HandlerExecution,
    Transport,
    Cancelled,
    Aborted,
    Timeout,
    Corrupt,
    Io,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    task_id: Option<u64>,
    worker: Option<usize>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            task_id: None,
            worker: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn task_id(&self) -> Option<u64> {
        self.task_id
    }

    pub fn worker(&self) -> Option<usize> {
        self.worker
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_task(mut self, task_id: u64) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_worker(mut self, worker: usize) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind,
            message: self.message.clone().unwrap_or_else(|| format!("{:?}", self.kind)),
            task_id: self.task_id,
        }
    }

    pub fn from_body(body: ErrorBody) -> Self {
        let mut err = Error::new(body.kind).with_message(body.message);
        err.task_id = body.task_id;
        err
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(task_id) = self.task_id {
            write!(f, " (task: {task_id})")?;
        }
        if let Some(worker) = self.worker {
            write!(f, " (worker: {worker})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

/// Wire form of an [`Error`], carried in task results and RPC faults.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<u64>,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        err.to_body()
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::HandlerResolution => 3,
        ErrorKind::HandlerExecution => 4,
        ErrorKind::Transport => 5,
        ErrorKind::Cancelled => 6,
        ErrorKind::Aborted => 7,
        ErrorKind::Timeout => 8,
        ErrorKind::Corrupt => 9,
        ErrorKind::Io => 10,
    }
}
