// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Hardware contexts and compute-unit reservations.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};
use uuid::Uuid;

use crate::bo::BoFlags;
use crate::buffer::HostBuffer;
use crate::error::{ShimError, ShimResult};
use crate::handle::BoHandle;
use crate::scheduler::RequestId;
use crate::shim::Shim;

/// Identifier of a hardware context within one shim.
pub type ContextId = u32;

/// Quality-of-service hints. Recorded, never enforced.
pub type Qos = BTreeMap<String, u32>;

/// How a context holds the compute units it opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
struct ContextEntry {
    uuid: Uuid,
    mode: AccessMode,
    cus: BTreeSet<u32>,
}

/// Context and CU-reservation bookkeeping of one shim.
#[derive(Debug, Default)]
pub(crate) struct ContextTable {
    next_id: ContextId,
    contexts: HashMap<ContextId, ContextEntry>,
}

impl ContextTable {
    pub fn create(&mut self, uuid: Uuid, mode: AccessMode) -> ContextId {
        self.next_id += 1;
        let id = self.next_id;
        self.contexts.insert(
            id,
            ContextEntry {
                uuid,
                mode,
                cus: BTreeSet::new(),
            },
        );
        id
    }

    /// Reserve `cu` for `ctx`.
    ///
    /// Fails with `Busy` if `ctx` is exclusive and anyone else holds the CU, or
    /// if another context holds it exclusively.
    pub fn open_cu(&mut self, ctx: ContextId, cu: u32) -> ShimResult<()> {
        let mode = self
            .contexts
            .get(&ctx)
            .map(|c| c.mode)
            .ok_or_else(|| ShimError::NotFound(format!("hardware context {ctx}")))?;
        for (&other, entry) in &self.contexts {
            if other == ctx || !entry.cus.contains(&cu) {
                continue;
            }
            if mode == AccessMode::Exclusive || entry.mode == AccessMode::Exclusive {
                return Err(ShimError::Busy(format!(
                    "compute unit {cu} is held by context {other}"
                )));
            }
        }
        if let Some(entry) = self.contexts.get_mut(&ctx) {
            entry.cus.insert(cu);
        }
        Ok(())
    }

    pub fn close_cu(&mut self, ctx: ContextId, cu: u32) -> ShimResult<()> {
        if self
            .contexts
            .get_mut(&ctx)
            .is_some_and(|entry| entry.cus.remove(&cu))
        {
            Ok(())
        } else {
            Err(ShimError::InvalidCu(cu))
        }
    }

    pub fn holds(&self, ctx: ContextId, cu: u32) -> bool {
        self.contexts.get(&ctx).is_some_and(|c| c.cus.contains(&cu))
    }

    /// Remove `ctx`, returning the CUs it still held.
    pub fn destroy(&mut self, ctx: ContextId) -> Vec<u32> {
        let Some(entry) = self.contexts.remove(&ctx) else {
            return Vec::new();
        };
        trace!(ctx, uuid = %entry.uuid, "context removed");
        entry.cus.into_iter().collect()
    }

    pub fn live(&self) -> usize {
        self.contexts.len()
    }
}

// ---------------------------------------------------------------------------
// HwContext
// ---------------------------------------------------------------------------

/// A hardware context bound to a loaded image.
///
/// Dropping it closes every compute unit it opened.
#[derive(Debug)]
pub struct HwContext {
    shim: Arc<Shim>,
    id: ContextId,
    uuid: Uuid,
    qos: Qos,
    mode: AccessMode,
}

impl HwContext {
    pub(crate) fn new(
        shim: Arc<Shim>,
        id: ContextId,
        uuid: Uuid,
        qos: Qos,
        mode: AccessMode,
    ) -> Self {
        Self {
            shim,
            id,
            uuid,
            qos,
            mode,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn qos(&self) -> &Qos {
        &self.qos
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Memory slot of the context. A single image is loaded at a time.
    pub fn slot(&self) -> u8 {
        0
    }

    pub fn shim(&self) -> &Arc<Shim> {
        &self.shim
    }

    /// Reserve the compute unit named `name`; returns its index.
    pub fn open_cu_context(&self, name: &str) -> ShimResult<u32> {
        self.shim.open_cu(self.id, name)
    }

    pub fn close_cu_context(&self, cu: u32) -> ShimResult<()> {
        self.shim.close_cu(self.id, cu)
    }

    /// Allocate a BO tagged with this context's slot.
    pub fn alloc_bo(&self, size: u64, flags: BoFlags) -> ShimResult<BoHandle> {
        self.shim.alloc_bo(size, flags.slot(self.slot()))
    }

    pub fn alloc_userptr_bo(
        &self,
        host: HostBuffer,
        size: u64,
        flags: BoFlags,
    ) -> ShimResult<BoHandle> {
        self.shim.alloc_userptr_bo(host, size, flags.slot(self.slot()))
    }

    /// Submit `cmd` to `cu`, which must be open in this context.
    pub fn exec_buf(&self, cu: u32, cmd: BoHandle) -> ShimResult<RequestId> {
        self.shim.submit(cu, cmd, Some(self.id))
    }

    pub fn exec_wait(&self, id: RequestId, timeout: Duration) -> ShimResult<()> {
        self.shim.exec_wait(id, timeout)
    }
}

impl Drop for HwContext {
    fn drop(&mut self) {
        let closed = self.shim.destroy_context(self.id);
        debug!(ctx = self.id, ?closed, "hardware context destroyed");
    }
}
