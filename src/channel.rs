// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Framed request/response channel to the emulation process.
//
// Frame layout (little-endian):
//   call     : [u32 payload_len][u32 opcode][payload]
//   response : [u32 payload_len][u32 status][payload]
//
// The protocol is strictly one outstanding exchange per connection, so
// `Transport` serializes callers with a mutex (the API lock). A reset or EOF
// marks the channel lost; a malformed header marks it broken. Either way every
// later exchange fails without touching the socket.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::error::{ShimError, ShimResult};
use crate::proto::message::{self, Opcode, STATUS_OK};

/// Bytes of header preceding every payload.
pub const HEADER_LEN: usize = 8;

/// Allowance on top of the data chunk size for payload framing overhead.
pub const FRAME_SLACK: usize = 4096;

// ---------------------------------------------------------------------------
// Frame codec (shared with the device side)
// ---------------------------------------------------------------------------

/// Header of one frame: payload length plus opcode (calls) or status (responses).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub len: u32,
    pub code: u32,
}

impl FrameHeader {
    pub fn encode(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.len.to_le_bytes());
        out[4..].copy_from_slice(&self.code.to_le_bytes());
        out
    }

    pub fn decode(bytes: [u8; HEADER_LEN]) -> Self {
        Self {
            len: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            code: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// Write one frame.
pub fn write_frame<W: Write>(w: &mut W, code: u32, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame payload exceeds u32"))?;
    w.write_all(&FrameHeader { len, code }.encode())?;
    w.write_all(payload)?;
    w.flush()
}

/// Read one frame. Returns `Ok(None)` on a clean EOF before the header.
///
/// A payload longer than `max_len` is rejected with `InvalidData` before any
/// of it is read.
pub fn read_frame<R: Read>(r: &mut R, max_len: usize) -> io::Result<Option<(u32, Vec<u8>)>> {
    let mut hdr = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match r.read(&mut hdr[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    let hdr = FrameHeader::decode(hdr);
    if hdr.len as usize > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit {max_len}", hdr.len),
        ));
    }
    let mut payload = vec![0u8; hdr.len as usize];
    r.read_exact(&mut payload)?;
    Ok(Some((hdr.code, payload)))
}

// ---------------------------------------------------------------------------
// RpcChannel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Broken {
    Lost(String),
    Protocol(String),
}

impl Broken {
    fn to_error(&self) -> ShimError {
        match self {
            Broken::Lost(m) => ShimError::TransportLost(m.clone()),
            Broken::Protocol(m) => ShimError::ProtocolError(m.clone()),
        }
    }
}

/// One connection to the emulation process.
#[derive(Debug)]
pub struct RpcChannel {
    stream: UnixStream,
    max_frame: usize,
    broken: Option<Broken>,
}

impl RpcChannel {
    /// Wrap a connected stream. `message_size` bounds one payload chunk.
    pub fn new(stream: UnixStream, message_size: usize) -> Self {
        Self {
            stream,
            max_frame: message_size.saturating_add(FRAME_SLACK),
            broken: None,
        }
    }

    /// Largest frame accepted in either direction.
    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    pub fn is_broken(&self) -> bool {
        self.broken.is_some()
    }

    /// Send one call and block until its response. Returns `(status, payload)`.
    pub fn exchange(&mut self, opcode: Opcode, payload: &[u8]) -> ShimResult<(u32, Vec<u8>)> {
        if let Some(b) = &self.broken {
            return Err(b.to_error());
        }
        if payload.len() > self.max_frame {
            // Caller bug, not a peer failure: the channel stays usable.
            return Err(ShimError::InvalidRange {
                offset: 0,
                size: payload.len() as u64,
                len: self.max_frame as u64,
            });
        }

        if let Err(e) = write_frame(&mut self.stream, opcode as u32, payload) {
            return Err(self.fail(Broken::Lost(format!("sending {opcode}: {e}"))));
        }

        match read_frame(&mut self.stream, self.max_frame) {
            Ok(Some(resp)) => Ok(resp),
            Ok(None) => Err(self.fail(Broken::Lost(format!(
                "peer closed the connection during {opcode}"
            )))),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                Err(self.fail(Broken::Protocol(format!("response to {opcode}: {e}"))))
            }
            Err(e) => Err(self.fail(Broken::Lost(format!("receiving {opcode}: {e}")))),
        }
    }

    /// Mark the channel unusable after a payload-level protocol violation.
    pub fn poison(&mut self, reason: &str) -> ShimError {
        self.fail(Broken::Protocol(reason.to_owned()))
    }

    fn fail(&mut self, why: Broken) -> ShimError {
        let err = why.to_error();
        warn!(error = %err, "transport channel failed");
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.broken = Some(why);
        err
    }
}

// ---------------------------------------------------------------------------
// Transport: the API-serialization lock around the channel
// ---------------------------------------------------------------------------

/// Serialized access to the (optional) channel of one shim.
#[derive(Debug, Default)]
pub struct Transport {
    chan: Mutex<Option<RpcChannel>>,
    exchanges: AtomicU64,
}

impl Transport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh channel, replacing any previous one.
    pub fn install(&self, chan: RpcChannel) {
        *self.lock() = Some(chan);
    }

    /// Drop the channel. Later calls fail with `DeviceClosed`.
    pub fn take(&self) -> Option<RpcChannel> {
        self.lock().take()
    }

    /// Number of completed exchanges (successful or remote-error responses).
    pub fn exchanges(&self) -> u64 {
        self.exchanges.load(Ordering::Relaxed)
    }

    /// Perform one typed exchange.
    pub fn call<Q, R>(&self, opcode: Opcode, req: &Q) -> ShimResult<R>
    where
        Q: prost::Message,
        R: prost::Message + Default,
    {
        let payload = message::encode(req);
        let mut guard = self.lock();
        let chan = guard.as_mut().ok_or(ShimError::DeviceClosed)?;
        let (status, body) = chan.exchange(opcode, &payload)?;
        self.exchanges.fetch_add(1, Ordering::Relaxed);

        if status != STATUS_OK {
            let message = message::error_message(&body);
            debug!(%opcode, status, %message, "remote error");
            return Err(ShimError::Remote {
                opcode: opcode.name(),
                status,
                message,
            });
        }
        match message::decode::<R>(opcode, &body) {
            Ok(r) => Ok(r),
            Err(e) => Err(chan.poison(&e.to_string())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<RpcChannel>> {
        self.chan.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
