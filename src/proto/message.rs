// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Operation codes and protobuf payloads exchanged with the emulation process.
// Every call carries one of the `*Call` messages; a successful response carries
// the matching reply (or `Empty`), an error response carries `ErrorReply`.

use prost::Message as _;

use crate::error::{ShimError, ShimResult};

/// Protocol revision checked during the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Response status for a successful exchange.
pub const STATUS_OK: u32 = 0;
/// The request referenced memory or a compute unit the device does not know.
pub const STATUS_INVALID: u32 = 1;
/// The opcode is not understood by the peer.
pub const STATUS_UNSUPPORTED: u32 = 2;
/// The payload could not be decoded.
pub const STATUS_BAD_PAYLOAD: u32 = 3;

// ---------------------------------------------------------------------------
// Opcode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    Handshake = 1,
    LoadImage = 2,
    AllocBuffer = 3,
    FreeBuffer = 4,
    WriteMem = 5,
    ReadMem = 6,
    CopyBuffer = 7,
    RegRead = 8,
    RegWrite = 9,
    ExecBuf = 10,
    PollCompletions = 11,
    Close = 12,
}

impl Opcode {
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Handshake => "Handshake",
            Opcode::LoadImage => "LoadImage",
            Opcode::AllocBuffer => "AllocBuffer",
            Opcode::FreeBuffer => "FreeBuffer",
            Opcode::WriteMem => "WriteMem",
            Opcode::ReadMem => "ReadMem",
            Opcode::CopyBuffer => "CopyBuffer",
            Opcode::RegRead => "RegRead",
            Opcode::RegWrite => "RegWrite",
            Opcode::ExecBuf => "ExecBuf",
            Opcode::PollCompletions => "PollCompletions",
            Opcode::Close => "Close",
        }
    }
}

impl TryFrom<u32> for Opcode {
    type Error = u32;

    fn try_from(v: u32) -> Result<Self, u32> {
        Ok(match v {
            1 => Opcode::Handshake,
            2 => Opcode::LoadImage,
            3 => Opcode::AllocBuffer,
            4 => Opcode::FreeBuffer,
            5 => Opcode::WriteMem,
            6 => Opcode::ReadMem,
            7 => Opcode::CopyBuffer,
            8 => Opcode::RegRead,
            9 => Opcode::RegWrite,
            10 => Opcode::ExecBuf,
            11 => Opcode::PollCompletions,
            12 => Opcode::Close,
            other => return Err(other),
        })
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrorReply {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HandshakeCall {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(uint32, tag = "2")]
    pub device_index: u32,
    #[prost(uint32, tag = "3")]
    pub host_pid: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HandshakeReply {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(string, tag = "2")]
    pub device_name: String,
    #[prost(uint32, tag = "3")]
    pub pid: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CuDescriptor {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint64, tag = "2")]
    pub base_address: u64,
    #[prost(uint64, tag = "3")]
    pub address_range: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LoadImageCall {
    #[prost(bytes = "vec", tag = "1")]
    pub uuid: Vec<u8>,
    /// Compute units in index order.
    #[prost(message, repeated, tag = "2")]
    pub compute_units: Vec<CuDescriptor>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AllocBufferCall {
    #[prost(uint64, tag = "1")]
    pub addr: u64,
    #[prost(uint64, tag = "2")]
    pub size: u64,
    /// `BoFlags` in packed form.
    #[prost(uint32, tag = "3")]
    pub flags: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FreeBufferCall {
    #[prost(uint64, tag = "1")]
    pub addr: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteMemCall {
    #[prost(uint64, tag = "1")]
    pub addr: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReadMemCall {
    #[prost(uint64, tag = "1")]
    pub addr: u64,
    #[prost(uint64, tag = "2")]
    pub size: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReadMemReply {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CopyBufferCall {
    #[prost(uint64, tag = "1")]
    pub dst_addr: u64,
    #[prost(uint64, tag = "2")]
    pub src_addr: u64,
    #[prost(uint64, tag = "3")]
    pub size: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RegReadCall {
    #[prost(uint32, tag = "1")]
    pub cu_index: u32,
    #[prost(uint32, tag = "2")]
    pub offset: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RegReadReply {
    #[prost(uint32, tag = "1")]
    pub value: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RegWriteCall {
    #[prost(uint32, tag = "1")]
    pub cu_index: u32,
    #[prost(uint32, tag = "2")]
    pub offset: u32,
    #[prost(uint32, tag = "3")]
    pub value: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ExecBufCall {
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    #[prost(uint32, tag = "2")]
    pub cu_index: u32,
    /// Command buffer contents, written to the CU argument registers.
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Completion {
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    #[prost(uint32, tag = "2")]
    pub status: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PollCompletionsReply {
    /// Requests finished since the previous poll, in completion order.
    #[prost(message, repeated, tag = "1")]
    pub completed: Vec<Completion>,
}

// ---------------------------------------------------------------------------
// Codec helpers
// ---------------------------------------------------------------------------

pub fn encode<M: prost::Message>(msg: &M) -> Vec<u8> {
    msg.encode_to_vec()
}

/// Decode a payload. A malformed payload from the peer is a protocol violation.
pub fn decode<M: prost::Message + Default>(opcode: Opcode, bytes: &[u8]) -> ShimResult<M> {
    M::decode(bytes)
        .map_err(|e| ShimError::ProtocolError(format!("malformed {opcode} payload: {e}")))
}

/// Best-effort decode of an error reply; an undecodable one yields an empty message.
pub fn error_message(bytes: &[u8]) -> String {
    ErrorReply::decode(bytes)
        .map(|r| r.message)
        .unwrap_or_default()
}
