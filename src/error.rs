// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy shared by every layer of the shim.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShimError {
    #[error("invalid buffer handle")]
    InvalidHandle,

    #[error("buffer handle refers to a freed or revoked buffer")]
    StaleHandle,

    #[error("cannot allocate {size} bytes of device memory")]
    AllocationFailed { size: u64 },

    #[error("out of device memory")]
    OutOfMemory,

    #[error("range [{offset:#x}, +{size:#x}) exceeds buffer of {len:#x} bytes")]
    InvalidRange { offset: u64, size: u64, len: u64 },

    #[error("register offset {offset:#x} outside compute unit range {range:#x}")]
    InvalidOffset { offset: u32, range: u64 },

    #[error("invalid compute unit index {0}")]
    InvalidCu(u32),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("transport to emulation process lost: {0}")]
    TransportLost(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("device is closed")]
    DeviceClosed,

    #[error("operation timed out")]
    TimedOut,

    #[error("command {id} failed with status {status}")]
    CommandFailed { id: u64, status: u32 },

    #[error("emulation process rejected {opcode}: status {status}: {message}")]
    Remote {
        opcode: &'static str,
        status: u32,
        message: String,
    },

    #[error("cannot launch emulation process: {0}")]
    Launch(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShimError {
    /// Errors after which the shim instance cannot be used again until reopened.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TransportLost(_) | Self::ProtocolError(_))
    }
}

pub type ShimResult<T> = Result<T, ShimError>;
