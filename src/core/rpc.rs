//! Purpose: Request/response RPC multiplexed on a data port next to task traffic.
//! Exports: `RpcPeer`, `RpcMethods`, `RpcServe`.
//! Role: Control-plane calls (resolve, fetch, announce) in both directions.
//! Invariants: Each call gets a fresh `call_id`; a call ends Resolved, Rejected, or Cancelled.
//! Invariants: Responses for unknown or cancelled ids are discarded, never misrouted.
//! Invariants: `drain` returns only when no call is pending and no request is being served.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::{Notify, oneshot};

use crate::core::abort::AbortSignal;
use crate::core::channel::PortSender;
use crate::core::envelope::{Message, RpcRequest, RpcResponse};
use crate::core::error::{Error, ErrorBody, ErrorKind};

pub type RpcFuture = Pin<Box<dyn Future<Output = Result<Value, Error>> + Send>>;
pub type RpcMethod = Arc<dyn Fn(Value) -> RpcFuture + Send + Sync>;
/// Serves one incoming request; the receiver of the request decides where to spawn it.
pub type RpcServe = Pin<Box<dyn Future<Output = ()> + Send>>;

type Wake = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
pub struct RpcMethods {
    methods: HashMap<String, RpcMethod>,
}

impl RpcMethods {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, method: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Error>> + Send + 'static,
    {
        let method: RpcMethod = Arc::new(move |params: Value| -> RpcFuture { Box::pin(method(params)) });
        self.methods.insert(name.into(), method);
    }

    pub fn with<F, Fut>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Error>> + Send + 'static,
    {
        self.register(name, method);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    fn get(&self, name: &str) -> Option<RpcMethod> {
        self.methods.get(name).cloned()
    }
}

impl std::fmt::Debug for RpcMethods {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.methods.keys()).finish()
    }
}

#[derive(Clone)]
pub struct RpcPeer {
    inner: Arc<RpcInner>,
}

struct RpcInner {
    wake: Option<Wake>,
    methods: RpcMethods,
    next_call_id: AtomicU64,
    state: Mutex<RpcState>,
    idle: Notify,
}

struct RpcState {
    outbound: Option<PortSender>,
    pending: HashMap<u64, oneshot::Sender<Result<Value, Error>>>,
    serving: HashMap<u64, oneshot::Sender<()>>,
    closed: Option<ErrorBody>,
}

impl RpcPeer {
    pub fn new(outbound: PortSender, methods: RpcMethods) -> Self {
        Self::build(outbound, methods, None)
    }

    /// Like `new`, but runs `wake` after every post so an idle peer notices RPC traffic.
    pub fn with_wake(
        outbound: PortSender,
        methods: RpcMethods,
        wake: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self::build(outbound, methods, Some(Arc::new(wake)))
    }

    fn build(outbound: PortSender, methods: RpcMethods, wake: Option<Wake>) -> Self {
        Self {
            inner: Arc::new(RpcInner {
                wake,
                methods,
                next_call_id: AtomicU64::new(1),
                state: Mutex::new(RpcState {
                    outbound: Some(outbound),
                    pending: HashMap::new(),
                    serving: HashMap::new(),
                    closed: None,
                }),
                idle: Notify::new(),
            }),
        }
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, Error> {
        let (call_id, rx) = self.start_call(method, params)?;
        let mut pending = PendingCall::new(self, call_id);
        let outcome = settle(rx.await);
        pending.disarm();
        outcome
    }

    pub async fn call_with_signal(
        &self,
        method: &str,
        params: Value,
        mut signal: AbortSignal,
    ) -> Result<Value, Error> {
        if signal.is_aborted() {
            return Err(cancelled(method));
        }
        let (call_id, rx) = self.start_call(method, params)?;
        let mut pending = PendingCall::new(self, call_id);
        tokio::select! {
            outcome = rx => {
                pending.disarm();
                settle(outcome)
            }
            _ = signal.aborted() => {
                pending.disarm();
                self.cancel(call_id);
                Err(cancelled(method))
            }
        }
    }

    /// Route an incoming RPC frame. Requests come back as a future to spawn.
    pub fn handle_incoming(&self, message: Message) -> Option<RpcServe> {
        match message {
            Message::RpcResponse(response) => {
                self.complete(response);
                None
            }
            Message::RpcCancel { call_id } => {
                let cancel = self.lock_state().serving.remove(&call_id);
                if let Some(cancel) = cancel {
                    tracing::debug!(call_id, "rpc request cancelled by caller");
                    let _ = cancel.send(());
                }
                self.notify_if_idle();
                None
            }
            Message::RpcRequest(request) => Some(self.serve(request)),
            other => {
                tracing::warn!(kind = other.kind_name(), "non-rpc message routed to rpc layer");
                None
            }
        }
    }

    /// Wait until nothing is pending or being served.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Reject every pending call, stop serving, and release the outbound sender.
    pub fn close(&self, reason: &Error) {
        let (pending, serving) = {
            let mut state = self.lock_state();
            state.closed = Some(reason.to_body());
            state.outbound = None;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.serving),
            )
        };
        for (call_id, responder) in pending {
            let err = Error::new(ErrorKind::Transport).with_message(format!(
                "rpc call {call_id} aborted: {}",
                reason.message().unwrap_or("transport closed")
            ));
            let _ = responder.send(Err(err));
        }
        drop(serving);
        self.inner.idle.notify_waiters();
    }

    pub fn pending_calls(&self) -> usize {
        self.lock_state().pending.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.lock_state();
        state.pending.is_empty() && state.serving.is_empty()
    }

    fn start_call(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(u64, oneshot::Receiver<Result<Value, Error>>), Error> {
        let call_id = self.inner.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock_state();
            if let Some(reason) = &state.closed {
                return Err(Error::new(ErrorKind::Transport)
                    .with_message(format!("rpc layer closed: {}", reason.message)));
            }
            state.pending.insert(call_id, tx);
        }
        let request = Message::RpcRequest(RpcRequest {
            call_id,
            method: method.to_string(),
            params,
        });
        if let Err(err) = self.post(request) {
            self.forget(call_id);
            return Err(err);
        }
        tracing::debug!(call_id, method, "rpc call posted");
        Ok((call_id, rx))
    }

    fn cancel(&self, call_id: u64) {
        self.forget(call_id);
        if let Err(err) = self.post(Message::RpcCancel { call_id }) {
            tracing::debug!(call_id, error = %err, "rpc cancel not delivered");
        }
    }

    fn complete(&self, response: RpcResponse) {
        let responder = self.lock_state().pending.remove(&response.call_id);
        match responder {
            Some(responder) => {
                let outcome = match (response.result, response.error) {
                    (_, Some(body)) => Err(Error::from_body(body)),
                    (Some(value), None) => Ok(value),
                    (None, None) => Ok(Value::Null),
                };
                let _ = responder.send(outcome);
            }
            None => {
                tracing::warn!(call_id = response.call_id, "discarding rpc response for unknown call");
            }
        }
        self.notify_if_idle();
    }

    fn serve(&self, request: RpcRequest) -> RpcServe {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.lock_state().serving.insert(request.call_id, cancel_tx);
        let peer = self.clone();
        Box::pin(async move {
            let call_id = request.call_id;
            let outcome = match peer.inner.methods.get(&request.method) {
                Some(method) => {
                    let work = method(request.params);
                    tokio::select! {
                        outcome = work => Some(outcome),
                        _ = cancel_rx => None,
                    }
                }
                None => Some(Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("unknown rpc method \"{}\"", request.method)))),
            };
            if let Some(outcome) = outcome {
                let response = match outcome {
                    Ok(value) => RpcResponse::success(call_id, value),
                    Err(err) => RpcResponse::failure(call_id, err.to_body()),
                };
                if let Err(err) = peer.post(Message::RpcResponse(response)) {
                    tracing::warn!(call_id, error = %err, "rpc response not delivered");
                }
            }
            peer.lock_state().serving.remove(&call_id);
            peer.notify_if_idle();
        })
    }

    fn post(&self, message: Message) -> Result<(), Error> {
        let outbound = self.lock_state().outbound.clone();
        let Some(outbound) = outbound else {
            return Err(Error::new(ErrorKind::Transport).with_message("rpc layer closed"));
        };
        outbound.post(message, Vec::new())?;
        if let Some(wake) = &self.inner.wake {
            wake();
        }
        Ok(())
    }

    fn forget(&self, call_id: u64) {
        self.lock_state().pending.remove(&call_id);
        self.notify_if_idle();
    }

    fn notify_if_idle(&self) {
        if self.is_idle() {
            self.inner.idle.notify_waiters();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RpcState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Removes the pending entry if the awaiting future is dropped early.
struct PendingCall<'a> {
    peer: &'a RpcPeer,
    call_id: u64,
    armed: bool,
}

impl<'a> PendingCall<'a> {
    fn new(peer: &'a RpcPeer, call_id: u64) -> Self {
        Self {
            peer,
            call_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.peer.cancel(self.call_id);
        }
    }
}

fn settle(
    outcome: Result<Result<Value, Error>, oneshot::error::RecvError>,
) -> Result<Value, Error> {
    outcome.unwrap_or_else(|_| {
        Err(Error::new(ErrorKind::Transport).with_message("rpc responder dropped"))
    })
}

fn cancelled(method: &str) -> Error {
    Error::new(ErrorKind::Cancelled).with_message(format!("rpc call \"{method}\" was cancelled"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::abort::AbortController;
    use crate::core::channel::{Port, TryRecv, port_pair};
    use serde_json::json;
    use std::time::Duration;

    /// Pump frames from one port into a peer until the port closes.
    fn pump(mut port: Port, peer: RpcPeer) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(packet) = port.recv().await {
                if let Some(serve) = peer.handle_incoming(packet.message) {
                    tokio::spawn(serve);
                }
            }
        })
    }

    fn connected(methods_a: RpcMethods, methods_b: RpcMethods) -> (RpcPeer, RpcPeer) {
        let (left, right) = port_pair();
        let a = RpcPeer::new(left.sender(), methods_a);
        let b = RpcPeer::new(right.sender(), methods_b);
        pump(left, a.clone());
        pump(right, b.clone());
        (a, b)
    }

    #[tokio::test]
    async fn call_resolves_with_remote_result() {
        let methods = RpcMethods::new().with("resolve_id", |params: Value| async move {
            let id = params.as_str().unwrap_or_default().to_string();
            Ok(json!({"id": format!("/abs/{id}")}))
        });
        let (caller, _server) = connected(RpcMethods::new(), methods);
        let value = caller.call("resolve_id", json!("dep.js")).await.expect("call");
        assert_eq!(value, json!({"id": "/abs/dep.js"}));
        assert!(caller.is_idle());
    }

    #[tokio::test]
    async fn remote_error_rejects_call() {
        let methods = RpcMethods::new().with("fetch", |_params: Value| async move {
            Err(Error::new(ErrorKind::HandlerExecution).with_message("no such file"))
        });
        let (caller, _server) = connected(RpcMethods::new(), methods);
        let err = caller.call("fetch", json!("x")).await.expect_err("rejected");
        assert_eq!(err.kind(), ErrorKind::HandlerExecution);
        assert_eq!(err.message(), Some("no such file"));
    }

    #[tokio::test]
    async fn unknown_method_is_usage_error() {
        let (caller, _server) = connected(RpcMethods::new(), RpcMethods::new());
        let err = caller.call("nope", Value::Null).await.expect_err("rejected");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn cancelled_call_discards_late_response() {
        let (left, mut right) = port_pair();
        let caller = RpcPeer::new(left.sender(), RpcMethods::new());
        let controller = AbortController::new();
        let signal = controller.signal();

        let call = {
            let caller = caller.clone();
            tokio::spawn(async move { caller.call_with_signal("slow", Value::Null, signal).await })
        };
        let request = right.recv().await.expect("request");
        let Message::RpcRequest(request) = request.message else {
            panic!("expected request");
        };
        controller.abort();
        let err = call.await.expect("join").expect_err("cancelled");
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        let cancel = right.recv().await.expect("cancel frame");
        assert_eq!(cancel.message, Message::RpcCancel { call_id: request.call_id });

        caller.handle_incoming(Message::RpcResponse(RpcResponse::success(
            request.call_id,
            json!("late"),
        )));
        assert!(caller.is_idle());
        drop(left);
    }

    #[tokio::test]
    async fn drain_waits_for_pending_calls() {
        let (left, mut right) = port_pair();
        let caller = RpcPeer::new(left.sender(), RpcMethods::new());
        let call = {
            let caller = caller.clone();
            tokio::spawn(async move { caller.call("announce", json!({"ready": true})).await })
        };
        let Message::RpcRequest(request) = right.recv().await.expect("request").message else {
            panic!("expected request");
        };
        assert_eq!(caller.pending_calls(), 1);

        let drained = {
            let caller = caller.clone();
            tokio::spawn(async move { caller.drain().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drained.is_finished());

        caller.handle_incoming(Message::RpcResponse(RpcResponse::success(
            request.call_id,
            json!("ok"),
        )));
        tokio::time::timeout(Duration::from_secs(1), drained)
            .await
            .expect("drained")
            .expect("join");
        assert_eq!(call.await.expect("join").expect("call"), json!("ok"));
        drop(left);
    }

    #[tokio::test]
    async fn close_rejects_pending_with_transport_error() {
        let (left, mut right) = port_pair();
        let caller = RpcPeer::new(left.sender(), RpcMethods::new());
        let call = {
            let caller = caller.clone();
            tokio::spawn(async move { caller.call("fetch", Value::Null).await })
        };
        right.recv().await.expect("request");
        caller.close(&Error::new(ErrorKind::Transport).with_message("worker exited"));
        let err = call.await.expect("join").expect_err("rejected");
        assert_eq!(err.kind(), ErrorKind::Transport);
        caller.drain().await;

        let err = caller.call("fetch", Value::Null).await.expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(matches!(right.try_recv(), TryRecv::Empty));
    }

    #[tokio::test]
    async fn cancel_frame_stops_serving_without_response() {
        let (left, mut right) = port_pair();
        let methods = RpcMethods::new().with("hang", |_params: Value| async move {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        });
        let server = RpcPeer::new(left.sender(), methods);
        let serve = server
            .handle_incoming(Message::RpcRequest(RpcRequest {
                call_id: 4,
                method: "hang".to_string(),
                params: Value::Null,
            }))
            .expect("serve future");
        let task = tokio::spawn(serve);
        assert!(!server.is_idle());

        server.handle_incoming(Message::RpcCancel { call_id: 4 });
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("stopped")
            .expect("join");
        server.drain().await;
        assert!(matches!(right.try_recv(), TryRecv::Empty));
    }
}
