// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Software-emulated PCIe FPGA accelerator shim.
// Buffer objects, register access and command execution are served by a
// separate emulation process over a framed request/response socket.

pub mod config;
pub mod emulator;
pub mod proto;

mod error;
pub use error::{ShimError, ShimResult};

mod buffer;
pub use buffer::HostBuffer;

mod mem;
pub use mem::{Bank, MemoryManager, ALIGNMENT};

mod handle;
pub use handle::{BoHandle, HandleTable};

mod bo;
pub use bo::{BoFlags, BoOrigin, BoProperties, BoRecord, BufferRegistry, SyncDirection};

pub mod channel;
pub use channel::{RpcChannel, Transport};

mod image;
pub use image::{ComputeUnit, ImageLayout};

mod scheduler;
pub use scheduler::{Failure, RequestId, RequestState, Scheduler};

mod context;
pub use context::{AccessMode, ContextId, HwContext, Qos};

mod registry;
pub use registry::{DeviceRegistry, ExportEntry, ExportFd};

mod shim;
pub use shim::{BankInfo, DeviceInfo, Shim};

pub use config::{BankConfig, Config};
