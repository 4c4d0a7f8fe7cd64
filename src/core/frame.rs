//! Purpose: Byte framing for packets and a bridge from a byte stream to a `Port`.
//! Exports: `FrameHeader`, `read_packet`, `write_packet`, `bridge`, `FRAME_MAGIC`, `MAX_FRAME_LEN`.
//! Role: Carries the data-port protocol over sockets, pipes, or child stdio.
//! Invariants: A frame is header, JSON message, then each transfer with a u32 length prefix.
//! Invariants: Oversized or torn frames are `Corrupt`; a failed stream closes the bridged port.
//! Notes: Transfers are copied here, at the process boundary, and nowhere else.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::channel::{Packet, Port, PortReceiver, PortSender, port_pair};
use crate::core::envelope::{Message, TransferBuffer};
use crate::core::error::{Error, ErrorKind};

pub const FRAME_MAGIC: [u8; 4] = *b"WKF1";
pub const FRAME_HEADER_LEN: usize = 20;
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub header_len: u32,
    pub json_len: u32,
    pub json_len_xor: u32,
    pub transfer_count: u32,
}

impl FrameHeader {
    pub fn new(json_len: u32, transfer_count: u32) -> Self {
        Self {
            header_len: FRAME_HEADER_LEN as u32,
            json_len,
            json_len_xor: json_len ^ 0xFFFF_FFFF,
            transfer_count,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..4].copy_from_slice(&FRAME_MAGIC);
        write_u32(&mut buf, 4, self.header_len);
        write_u32(&mut buf, 8, self.json_len);
        write_u32(&mut buf, 12, self.json_len_xor);
        write_u32(&mut buf, 16, self.transfer_count);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("frame header too small"));
        }
        if buf[0..4] != FRAME_MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message("bad frame magic"));
        }
        Ok(Self {
            header_len: read_u32(buf, 4),
            json_len: read_u32(buf, 8),
            json_len_xor: read_u32(buf, 12),
            transfer_count: read_u32(buf, 16),
        })
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.header_len as usize != FRAME_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unexpected header length"));
        }
        if self.json_len ^ self.json_len_xor != 0xFFFF_FFFF {
            return Err(Error::new(ErrorKind::Corrupt).with_message("message length xor mismatch"));
        }
        if self.json_len as usize > MAX_FRAME_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("message length exceeds max"));
        }
        Ok(())
    }
}

/// Encode one packet into a single contiguous frame.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, Error> {
    let json = serde_json::to_vec(&packet.message).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode message")
            .with_source(err)
    })?;
    let transfer_bytes: usize = packet
        .transfers
        .iter()
        .map(|buffer| 4 + buffer.len())
        .sum();
    let total = FRAME_HEADER_LEN + json.len() + transfer_bytes;
    if total > MAX_FRAME_LEN {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("frame of {total} bytes exceeds {MAX_FRAME_LEN}")));
    }

    let header = FrameHeader::new(json.len() as u32, packet.transfers.len() as u32);
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(&json);
    for buffer in &packet.transfers {
        frame.extend_from_slice(&(buffer.len() as u32).to_le_bytes());
        frame.extend_from_slice(buffer);
    }
    Ok(frame)
}

pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_packet(packet)?;
    writer.write_all(&frame).await.map_err(io_error)?;
    writer.flush().await.map_err(io_error)
}

/// Read the next packet; `Ok(None)` on a clean end of stream between frames.
pub async fn read_packet<R>(reader: &mut R) -> Result<Option<Packet>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        let n = reader.read(&mut header_buf[filled..]).await.map_err(io_error)?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::new(ErrorKind::Corrupt).with_message("truncated frame header"));
        }
        filled += n;
    }
    let header = FrameHeader::decode(&header_buf)?;
    header.validate()?;

    let mut json = vec![0u8; header.json_len as usize];
    read_body(reader, &mut json).await?;
    let message: Message = serde_json::from_slice(&json).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("invalid frame message")
            .with_source(err)
    })?;

    let mut budget = MAX_FRAME_LEN.saturating_sub(FRAME_HEADER_LEN + json.len());
    let mut transfers = Vec::with_capacity((header.transfer_count as usize).min(64));
    for _ in 0..header.transfer_count {
        let mut len = [0u8; 4];
        read_body(reader, &mut len).await?;
        let len = u32::from_le_bytes(len) as usize;
        if len + 4 > budget {
            return Err(Error::new(ErrorKind::Corrupt).with_message("transfer exceeds frame limit"));
        }
        budget -= len + 4;
        let mut bytes = BytesMut::zeroed(len);
        read_body(reader, &mut bytes).await?;
        transfers.push(TransferBuffer::new(bytes));
    }
    Ok(Some(Packet::with_transfers(message, transfers)))
}

/// Connect a port to a byte stream. Must be called inside a tokio runtime.
///
/// The returned port behaves like one end of `port_pair`; the far end is whatever
/// speaks frames on the other side of `io`.
pub fn bridge<S>(io: S) -> Port
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (local, remote) = port_pair();
    let (sender, receiver) = remote.split();
    let (read_half, write_half) = tokio::io::split(io);
    tokio::spawn(async move {
        let mut reader = tokio::spawn(read_loop(read_half, sender));
        let mut writer = tokio::spawn(write_loop(write_half, receiver));
        tokio::select! {
            _ = &mut reader => writer.abort(),
            _ = &mut writer => reader.abort(),
        }
    });
    local
}

async fn read_loop<R>(mut reader: R, sender: PortSender)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_packet(&mut reader).await {
            Ok(Some(packet)) => {
                if let Err(err) = sender.post_packet(packet) {
                    tracing::debug!(error = %err, "bridge reader stopped");
                    return;
                }
            }
            Ok(None) => {
                tracing::debug!("bridged stream reached end");
                return;
            }
            Err(err) => {
                tracing::error!(error = %err, "bridged stream failed");
                return;
            }
        }
    }
}

async fn write_loop<W>(mut writer: W, mut receiver: PortReceiver)
where
    W: AsyncWrite + Unpin,
{
    while let Some(packet) = receiver.recv().await {
        if let Err(err) = write_packet(&mut writer, &packet).await {
            tracing::error!(error = %err, kind = packet.message.kind_name(), "bridged write failed");
            return;
        }
    }
    if let Err(err) = writer.shutdown().await {
        tracing::debug!(error = %err, "bridged stream shutdown failed");
    }
}

async fn read_body<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    reader.read_exact(buf).await.map(|_| ()).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::new(ErrorKind::Corrupt)
                .with_message("truncated frame body")
                .with_source(err)
        } else {
            io_error(err)
        }
    })
}

fn io_error(err: std::io::Error) -> Error {
    Error::new(ErrorKind::Transport)
        .with_message("stream io failed")
        .with_source(err)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
