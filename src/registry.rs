// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-wide shim factory.
//
// Owns the device-index -> shim map and the table of exported buffer
// descriptors. Shims hold a clone of the registry and go through it for any
// cross-device lookup (P2P imports); nothing here is ambient global state.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info};

use crate::bo::BoFlags;
use crate::buffer::HostBuffer;
use crate::config::Config;
use crate::error::{ShimError, ShimResult};
use crate::handle::BoHandle;
use crate::shim::Shim;

/// Cross-process descriptor returned by `export_bo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExportFd(i32);

impl ExportFd {
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for ExportFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// What an export descriptor resolves to.
#[derive(Debug, Clone)]
pub struct ExportEntry {
    pub device: u32,
    pub owner: BoHandle,
    pub addr: u64,
    pub size: u64,
    pub shadow: HostBuffer,
    pub flags: BoFlags,
}

/// First descriptor value; keeps clear of stdio-looking numbers.
const FIRST_EXPORT_FD: i32 = 3;

#[derive(Debug)]
struct ExportTable {
    next: i32,
    entries: HashMap<ExportFd, ExportEntry>,
}

impl Default for ExportTable {
    fn default() -> Self {
        Self {
            next: FIRST_EXPORT_FD,
            entries: HashMap::new(),
        }
    }
}

struct RegistryInner {
    config: Config,
    devices: Mutex<HashMap<u32, Weak<Shim>>>,
    exports: Mutex<ExportTable>,
}

/// Factory and lookup table for shim instances.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("device_count", &self.inner.config.device_count)
            .finish()
    }
}

impl DeviceRegistry {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                devices: Mutex::new(HashMap::new()),
                exports: Mutex::new(ExportTable::default()),
            }),
        }
    }

    /// Registry configured from `SWEMU_*` environment variables.
    pub fn from_env() -> ShimResult<Self> {
        Ok(Self::new(Config::from_env()?))
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Number of emulated devices available.
    pub fn probe(&self) -> u32 {
        self.inner.config.device_count
    }

    /// Open device `index`, launching its emulation process.
    ///
    /// Returns the existing shim if the device is already open, relaunching it
    /// if it was closed. The device map stays locked for the duration of the
    /// launch, so concurrent opens of the same index never spawn twice.
    pub fn open(&self, index: u32) -> ShimResult<Arc<Shim>> {
        self.check_index(index)?;
        let mut devices = self.devices();
        if let Some(shim) = devices.get(&index).and_then(Weak::upgrade) {
            if !shim.is_good() {
                shim.reopen()?;
            }
            return Ok(shim);
        }
        let shim = Shim::launch(self.clone(), index)?;
        devices.insert(index, Arc::downgrade(&shim));
        info!(index, "device opened");
        Ok(shim)
    }

    /// Open device `index` over an already-connected emulation process.
    pub fn attach(&self, index: u32, stream: UnixStream) -> ShimResult<Arc<Shim>> {
        self.check_index(index)?;
        let mut devices = self.devices();
        if devices.get(&index).and_then(Weak::upgrade).is_some() {
            return Err(ShimError::Busy(format!("device {index} is already open")));
        }
        let shim = Shim::attach(self.clone(), index, stream)?;
        devices.insert(index, Arc::downgrade(&shim));
        info!(index, "device attached");
        Ok(shim)
    }

    /// The live shim for `index`, if any.
    pub fn get(&self, index: u32) -> Option<Arc<Shim>> {
        self.devices().get(&index).and_then(Weak::upgrade)
    }

    fn check_index(&self, index: u32) -> ShimResult<()> {
        if index >= self.probe() {
            return Err(ShimError::NotFound(format!("device {index}")));
        }
        Ok(())
    }

    // --- export descriptors ---

    pub(crate) fn export(&self, entry: ExportEntry) -> ExportFd {
        let mut table = self.exports();
        let fd = ExportFd(table.next);
        table.next = table.next.checked_add(1).unwrap_or(FIRST_EXPORT_FD);
        debug!(%fd, device = entry.device, owner = %entry.owner, "bo exported");
        table.entries.insert(fd, entry);
        fd
    }

    pub(crate) fn lookup_export(&self, fd: ExportFd) -> Option<ExportEntry> {
        self.exports().entries.get(&fd).cloned()
    }

    pub(crate) fn revoke(&self, fd: ExportFd) {
        if self.exports().entries.remove(&fd).is_some() {
            debug!(%fd, "export revoked");
        }
    }

    /// Revoke every descriptor exported by `device`.
    pub(crate) fn revoke_device(&self, device: u32) {
        self.exports().entries.retain(|_, e| e.device != device);
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<u32, Weak<Shim>>> {
        self.inner
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn exports(&self) -> MutexGuard<'_, ExportTable> {
        self.inner
            .exports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
