//! Purpose: In-memory duplex message ports with zero-copy transfer lists.
//! Exports: `Packet`, `Port`, `PortSender`, `PortReceiver`, `TryRecv`, `port_pair`.
//! Role: Data pipe between a controller link and one worker's dispatch loop.
//! Invariants: Each direction delivers packets in post order.
//! Invariants: `try_recv` never awaits; it reports `Empty` vs `Closed` distinctly.
//! Invariants: Posting to a dropped peer is a `Transport` error, never a silent drop.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::core::envelope::{Message, TransferBuffer};
use crate::core::error::{Error, ErrorKind};

/// One message plus the buffers whose ownership travels with it.
#[derive(Debug)]
pub struct Packet {
    pub message: Message,
    pub transfers: Vec<TransferBuffer>,
}

impl Packet {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            transfers: Vec::new(),
        }
    }

    pub fn with_transfers(message: Message, transfers: Vec<TransferBuffer>) -> Self {
        Self { message, transfers }
    }
}

#[derive(Debug)]
pub enum TryRecv {
    Packet(Packet),
    Empty,
    Closed,
}

#[derive(Clone, Debug)]
pub struct PortSender {
    tx: mpsc::UnboundedSender<Packet>,
}

impl PortSender {
    pub fn post(&self, message: Message, transfers: Vec<TransferBuffer>) -> Result<(), Error> {
        self.post_packet(Packet::with_transfers(message, transfers))
    }

    pub fn post_packet(&self, packet: Packet) -> Result<(), Error> {
        let kind = packet.message.kind_name();
        self.tx.send(packet).map_err(|_| {
            Error::new(ErrorKind::Transport)
                .with_message(format!("failed to post {kind}: peer port is closed"))
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct PortReceiver {
    rx: mpsc::UnboundedReceiver<Packet>,
}

impl PortReceiver {
    pub fn try_recv(&mut self) -> TryRecv {
        match self.rx.try_recv() {
            Ok(packet) => TryRecv::Packet(packet),
            Err(TryRecvError::Empty) => TryRecv::Empty,
            Err(TryRecvError::Disconnected) => TryRecv::Closed,
        }
    }

    /// Waits for the next packet; `None` once the peer sender is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    /// Blocking receive for threads outside any async runtime.
    pub fn blocking_recv(&mut self) -> Option<Packet> {
        self.rx.blocking_recv()
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// One end of a duplex pipe.
#[derive(Debug)]
pub struct Port {
    sender: PortSender,
    receiver: PortReceiver,
}

impl Port {
    pub fn new(sender: PortSender, receiver: PortReceiver) -> Self {
        Self { sender, receiver }
    }

    pub fn post(&self, message: Message, transfers: Vec<TransferBuffer>) -> Result<(), Error> {
        self.sender.post(message, transfers)
    }

    pub fn try_recv(&mut self) -> TryRecv {
        self.receiver.try_recv()
    }

    pub async fn recv(&mut self) -> Option<Packet> {
        self.receiver.recv().await
    }

    /// Panics if called from inside an async runtime.
    pub fn blocking_recv(&mut self) -> Option<Packet> {
        self.receiver.blocking_recv()
    }

    pub fn sender(&self) -> PortSender {
        self.sender.clone()
    }

    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.sender, self.receiver)
    }
}

/// Create two connected ports; what one posts the other receives.
pub fn port_pair() -> (Port, Port) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        Port::new(PortSender { tx: a_tx }, PortReceiver { rx: a_rx }),
        Port::new(PortSender { tx: b_tx }, PortReceiver { rx: b_rx }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::envelope::RpcRequest;
    use serde_json::json;

    fn request(call_id: u64) -> Message {
        Message::RpcRequest(RpcRequest {
            call_id,
            method: "ping".to_string(),
            params: json!(null),
        })
    }

    #[test]
    fn try_recv_reports_empty_then_packets_in_order() {
        let (left, mut right) = port_pair();
        assert!(matches!(right.try_recv(), TryRecv::Empty));
        for id in 0..3 {
            left.post(request(id), Vec::new()).expect("post");
        }
        for id in 0..3 {
            match right.try_recv() {
                TryRecv::Packet(packet) => assert_eq!(packet.message, request(id)),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(matches!(right.try_recv(), TryRecv::Empty));
    }

    #[test]
    fn try_recv_reports_closed_after_peer_drop() {
        let (left, mut right) = port_pair();
        left.post(request(1), Vec::new()).expect("post");
        drop(left);
        assert!(matches!(right.try_recv(), TryRecv::Packet(_)));
        assert!(matches!(right.try_recv(), TryRecv::Closed));
    }

    #[test]
    fn post_to_dropped_peer_is_transport_error() {
        let (left, right) = port_pair();
        drop(right);
        let err = left.post(request(1), Vec::new()).expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn transfers_move_without_copy() {
        let (left, mut right) = port_pair();
        let buffer = TransferBuffer::from_vec(vec![1, 2, 3, 4]);
        let ptr = buffer.as_ptr();
        left.post(request(1), vec![buffer]).expect("post");
        let TryRecv::Packet(packet) = right.try_recv() else {
            panic!("expected packet");
        };
        assert_eq!(packet.transfers.len(), 1);
        assert_eq!(packet.transfers[0].as_ptr(), ptr);
        assert_eq!(&packet.transfers[0][..], &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn recv_is_duplex() {
        let (mut left, mut right) = port_pair();
        left.post(request(1), Vec::new()).expect("post");
        right.post(request(2), Vec::new()).expect("post");
        assert_eq!(right.recv().await.expect("packet").message, request(1));
        assert_eq!(left.recv().await.expect("packet").message, request(2));
    }
}
