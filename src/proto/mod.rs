// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Protocol layer: wire messages and the emulation process lifecycle.

pub mod message;
pub mod process_manager;
pub mod supervisor;

pub use message::{Opcode, PROTOCOL_VERSION};
pub use process_manager::{
    force_kill, request_shutdown, shutdown, spawn, try_reap, wait_for_exit, ProcessHandle,
    WaitResult,
};
pub use supervisor::{handshake, Supervisor};
