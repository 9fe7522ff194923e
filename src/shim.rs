// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Device engine: one shim instance per opened device.
//
// Lock order: registry device map -> supervisor (launch lock) -> resources ->
// registry exports -> transport. The transport lock is a leaf. The scheduler
// table and the context table are leaves, never taken while the transport
// lock is held.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bo::{BoFlags, BoOrigin, BoProperties, BoRecord, BufferRegistry, SyncDirection};
use crate::buffer::HostBuffer;
use crate::channel::{RpcChannel, Transport};
use crate::config::Config;
use crate::context::{AccessMode, ContextId, ContextTable, HwContext, Qos};
use crate::error::{ShimError, ShimResult};
use crate::handle::BoHandle;
use crate::image::ImageLayout;
use crate::mem::MemoryManager;
use crate::proto::message::{
    AllocBufferCall, CopyBufferCall, Empty, ExecBufCall, FreeBufferCall, HandshakeReply,
    LoadImageCall, Opcode, PollCompletionsReply, ReadMemCall, ReadMemReply, RegReadCall,
    RegReadReply, RegWriteCall, WriteMemCall,
};
use crate::proto::supervisor::{self, Supervisor};
use crate::registry::{DeviceRegistry, ExportEntry, ExportFd};
use crate::scheduler::{Failure, RequestId, RequestState, Scheduler};

// ---------------------------------------------------------------------------
// DeviceCore: state shared with the completion poller
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct DeviceCore {
    index: u32,
    transport: Transport,
    scheduler: Scheduler,
    closed: AtomicBool,
    message_size: usize,
    poll_interval: Duration,
}

impl DeviceCore {
    fn ensure_open(&self) -> ShimResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ShimError::DeviceClosed);
        }
        Ok(())
    }

    /// One exchange. A terminal failure closes the device.
    fn call<Q, R>(&self, opcode: Opcode, req: &Q) -> ShimResult<R>
    where
        Q: prost::Message,
        R: prost::Message + Default,
    {
        self.ensure_open()?;
        let r = self.transport.call(opcode, req);
        if let Err(e) = &r {
            if e.is_terminal() {
                self.mark_lost(e);
            }
        }
        r
    }

    fn mark_lost(&self, e: &ShimError) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            error!(device = self.index, error = %e, "emulation process lost, device closed");
        }
        self.scheduler.fail_all(Failure::TransportLost(e.to_string()));
        self.scheduler.shutdown();
    }

    fn write_mem(&self, addr: u64, data: &[u8]) -> ShimResult<()> {
        let mut at = addr;
        for chunk in data.chunks(self.message_size.max(1)) {
            self.call::<_, Empty>(
                Opcode::WriteMem,
                &WriteMemCall {
                    addr: at,
                    data: chunk.to_vec(),
                },
            )?;
            at += chunk.len() as u64;
        }
        Ok(())
    }

    fn read_mem(&self, addr: u64, len: u64) -> ShimResult<Vec<u8>> {
        let chunk = self.message_size.max(1) as u64;
        let mut out = Vec::with_capacity(len as usize);
        let mut done = 0u64;
        while done < len {
            let n = chunk.min(len - done);
            let reply: ReadMemReply = self.call(
                Opcode::ReadMem,
                &ReadMemCall {
                    addr: addr + done,
                    size: n,
                },
            )?;
            if reply.data.len() as u64 != n {
                let e = ShimError::ProtocolError(format!(
                    "ReadMem returned {} bytes, expected {n}",
                    reply.data.len()
                ));
                self.mark_lost(&e);
                return Err(e);
            }
            out.extend_from_slice(&reply.data);
            done += n;
        }
        Ok(out)
    }
}

fn spawn_poller(core: Arc<DeviceCore>) -> ShimResult<JoinHandle<()>> {
    let name = format!("swemu-poll-{}", core.index);
    let handle = std::thread::Builder::new()
        .name(name)
        .spawn(move || poll_loop(&core))?;
    Ok(handle)
}

/// Ask the device for finished requests while any are pending.
fn poll_loop(core: &DeviceCore) {
    while core.scheduler.wait_for_work(core.poll_interval) {
        match core.call::<_, PollCompletionsReply>(Opcode::PollCompletions, &Empty {}) {
            Ok(reply) => core.scheduler.complete(&reply.completed),
            Err(ShimError::DeviceClosed) => break,
            Err(e) if e.is_terminal() => break,
            Err(e) => warn!(device = core.index, error = %e, "completion poll failed"),
        }
    }
    debug!(device = core.index, "completion poller stopped");
}

// ---------------------------------------------------------------------------
// Public value types
// ---------------------------------------------------------------------------

/// One memory bank as seen by `device_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankInfo {
    pub tag: String,
    pub base: u64,
    pub size: u64,
    pub used: u64,
}

/// Snapshot returned by [`Shim::device_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: String,
    pub banks: Vec<BankInfo>,
    pub compute_units: usize,
    pub image: Option<Uuid>,
    pub message_size: usize,
}

struct Resources {
    mm: MemoryManager,
    bos: BufferRegistry,
}

/// Where transfers for a handle go.
struct Target {
    core: Arc<DeviceCore>,
    addr: u64,
    size: u64,
    shadow: HostBuffer,
}

impl Target {
    fn check_range(&self, offset: u64, size: u64) -> ShimResult<()> {
        match offset.checked_add(size) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(ShimError::InvalidRange {
                offset,
                size,
                len: self.size,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Shim
// ---------------------------------------------------------------------------

/// Emulated device handle.
pub struct Shim {
    index: u32,
    registry: DeviceRegistry,
    core: Arc<DeviceCore>,
    supervisor: Mutex<Supervisor>,
    resources: Mutex<Resources>,
    contexts: Mutex<ContextTable>,
    image: RwLock<Option<Arc<ImageLayout>>>,
    device_name: RwLock<String>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Shim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shim")
            .field("index", &self.index)
            .field("good", &self.is_good())
            .finish()
    }
}

impl Shim {
    pub(crate) fn launch(registry: DeviceRegistry, index: u32) -> ShimResult<Arc<Self>> {
        let mut sup = Supervisor::new(registry.config());
        let (chan, hello) = sup.launch(index)?;
        Self::start(registry, index, sup, chan, hello)
    }

    pub(crate) fn attach(
        registry: DeviceRegistry,
        index: u32,
        stream: std::os::unix::net::UnixStream,
    ) -> ShimResult<Arc<Self>> {
        let sup = Supervisor::detached(registry.config());
        let mut chan = RpcChannel::new(stream, registry.config().message_size);
        let hello = supervisor::handshake(&mut chan, index)?;
        Self::start(registry, index, sup, chan, hello)
    }

    fn start(
        registry: DeviceRegistry,
        index: u32,
        sup: Supervisor,
        chan: RpcChannel,
        hello: HandshakeReply,
    ) -> ShimResult<Arc<Self>> {
        let config: &Config = registry.config();
        let core = Arc::new(DeviceCore {
            index,
            transport: Transport::new(),
            scheduler: Scheduler::new(),
            closed: AtomicBool::new(false),
            message_size: config.message_size,
            poll_interval: config.poll_interval,
        });
        core.transport.install(chan);
        let poller = spawn_poller(Arc::clone(&core))?;
        let mm = MemoryManager::new(&config.banks);
        info!(device = index, name = %hello.device_name, pid = hello.pid, "shim ready");

        Ok(Arc::new(Self {
            index,
            core,
            supervisor: Mutex::new(sup),
            resources: Mutex::new(Resources {
                mm,
                bos: BufferRegistry::new(),
            }),
            contexts: Mutex::new(ContextTable::default()),
            image: RwLock::new(None),
            device_name: RwLock::new(hello.device_name),
            poller: Mutex::new(Some(poller)),
            registry,
        }))
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// False once the device was closed or its emulation process was lost.
    pub fn is_good(&self) -> bool {
        !self.core.closed.load(Ordering::Acquire)
    }

    /// Completed transport exchanges since the shim was created.
    pub fn exchange_count(&self) -> u64 {
        self.core.transport.exchanges()
    }

    /// Pid of the supervised emulation process. `None` for attached shims.
    pub fn device_pid(&self) -> Option<u32> {
        self.lock_supervisor().pid()
    }

    pub fn device_info(&self) -> DeviceInfo {
        let image = self.image();
        let banks = self
            .lock_resources()
            .mm
            .banks()
            .iter()
            .map(|b| BankInfo {
                tag: b.tag().to_owned(),
                base: b.base(),
                size: b.size(),
                used: b.used(),
            })
            .collect();
        DeviceInfo {
            index: self.index,
            name: self
                .device_name
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            banks,
            compute_units: image.as_ref().map_or(0, |l| l.compute_units().len()),
            image: image.map(|l| l.uuid()),
            message_size: self.core.message_size,
        }
    }

    // --- image ---

    /// Install `layout` as the loaded image. Refused while contexts are live.
    pub fn load_image(&self, layout: ImageLayout) -> ShimResult<()> {
        let _launch = self.lock_supervisor();
        self.core.ensure_open()?;
        let live = self.lock_contexts().live();
        if live > 0 {
            return Err(ShimError::Busy(format!("{live} hardware context(s) are live")));
        }
        self.send_image(&layout)?;
        info!(
            device = self.index,
            uuid = %layout.uuid(),
            cus = layout.compute_units().len(),
            "image loaded"
        );
        *self.image.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(layout));
        Ok(())
    }

    fn send_image(&self, layout: &ImageLayout) -> ShimResult<()> {
        self.core.call::<_, Empty>(
            Opcode::LoadImage,
            &LoadImageCall {
                uuid: layout.uuid().as_bytes().to_vec(),
                compute_units: layout.descriptors(),
            },
        )?;
        Ok(())
    }

    pub fn image(&self) -> Option<Arc<ImageLayout>> {
        self.image
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn cu_index_by_name(&self, name: &str) -> ShimResult<u32> {
        self.image()
            .ok_or_else(|| ShimError::NotFound("no image loaded".into()))?
            .index_of(name)
    }

    // --- buffer objects ---

    pub fn alloc_bo(&self, size: u64, mut flags: BoFlags) -> ShimResult<BoHandle> {
        flags.userptr = false;
        flags.imported = false;
        // The shadow is sized only after the device range is reserved, so a
        // request no bank can hold never reaches the host allocator.
        self.create_bo(size, flags, || {
            usize::try_from(size)
                .ok()
                .and_then(HostBuffer::try_zeroed)
                .ok_or(ShimError::AllocationFailed { size })
        })
    }

    /// Allocate a BO whose host side is the caller's `host` buffer.
    pub fn alloc_userptr_bo(
        &self,
        host: HostBuffer,
        size: u64,
        mut flags: BoFlags,
    ) -> ShimResult<BoHandle> {
        if (host.len() as u64) < size {
            return Err(ShimError::InvalidRange {
                offset: 0,
                size,
                len: host.len() as u64,
            });
        }
        flags.userptr = true;
        flags.imported = false;
        self.create_bo(size, flags, || Ok(host))
    }

    fn create_bo(
        &self,
        size: u64,
        flags: BoFlags,
        shadow: impl FnOnce() -> ShimResult<HostBuffer>,
    ) -> ShimResult<BoHandle> {
        self.core.ensure_open()?;
        let mut res = self.lock_resources();
        let Resources { mm, bos } = &mut *res;
        let handle = bos.create_with(mm, size, flags, shadow)?;
        let addr = bos.get(handle)?.addr;
        let call = AllocBufferCall {
            addr,
            size,
            flags: flags.to_bits(),
        };
        if let Err(e) = self.core.call::<_, Empty>(Opcode::AllocBuffer, &call) {
            let _ = bos.free(mm, handle);
            return Err(e);
        }
        Ok(handle)
    }

    pub fn free_bo(&self, handle: BoHandle) -> ShimResult<()> {
        self.core.ensure_open()?;
        let mut res = self.lock_resources();
        let Resources { mm, bos } = &mut *res;
        let record = bos.free(mm, handle)?;
        if let Some(fd) = record.export {
            self.registry.revoke(fd);
        }
        if record.owns_range() {
            self.core.call::<_, Empty>(
                Opcode::FreeBuffer,
                &FreeBufferCall { addr: record.addr },
            )?;
        }
        Ok(())
    }

    /// Host view of the BO: the shadow buffer, or the caller's memory for user-pointer BOs.
    pub fn map_bo(&self, handle: BoHandle) -> ShimResult<HostBuffer> {
        Ok(self.target(handle)?.shadow)
    }

    /// Move `size` bytes at `offset` between the shadow and simulated device memory.
    pub fn sync_bo(
        &self,
        handle: BoHandle,
        dir: SyncDirection,
        size: u64,
        offset: u64,
    ) -> ShimResult<()> {
        self.core.ensure_open()?;
        let t = self.target(handle)?;
        t.check_range(offset, size)?;
        if size == 0 {
            return Ok(());
        }
        let (off, len) = (offset as usize, size as usize);
        match dir {
            SyncDirection::ToDevice => {
                let bytes = t.shadow.read_vec(off, len)?;
                t.core.write_mem(t.addr + offset, &bytes)
            }
            SyncDirection::FromDevice => {
                let bytes = t.core.read_mem(t.addr + offset, size)?;
                t.shadow.write(off, &bytes)
            }
        }
    }

    /// Write `src` into the BO at `seek` and push it to the device.
    pub fn write_bo(&self, handle: BoHandle, src: &[u8], seek: u64) -> ShimResult<()> {
        self.core.ensure_open()?;
        let t = self.target(handle)?;
        t.check_range(seek, src.len() as u64)?;
        if src.is_empty() {
            return Ok(());
        }
        t.shadow.write(seek as usize, src)?;
        t.core.write_mem(t.addr + seek, src)
    }

    /// Pull `dst.len()` bytes at `skip` from the device into the shadow and `dst`.
    pub fn read_bo(&self, handle: BoHandle, dst: &mut [u8], skip: u64) -> ShimResult<()> {
        self.core.ensure_open()?;
        let t = self.target(handle)?;
        t.check_range(skip, dst.len() as u64)?;
        if dst.is_empty() {
            return Ok(());
        }
        let bytes = t.core.read_mem(t.addr + skip, dst.len() as u64)?;
        t.shadow.write(skip as usize, &bytes)?;
        dst.copy_from_slice(&bytes);
        Ok(())
    }

    /// Device-side copy. Crosses devices with a host round trip.
    pub fn copy_bo(
        &self,
        dst: BoHandle,
        src: BoHandle,
        size: u64,
        dst_offset: u64,
        src_offset: u64,
    ) -> ShimResult<()> {
        self.core.ensure_open()?;
        let d = self.target(dst)?;
        let s = self.target(src)?;
        d.check_range(dst_offset, size)?;
        s.check_range(src_offset, size)?;
        if size == 0 {
            return Ok(());
        }
        if Arc::ptr_eq(&d.core, &s.core) {
            d.core.call::<_, Empty>(
                Opcode::CopyBuffer,
                &CopyBufferCall {
                    dst_addr: d.addr + dst_offset,
                    src_addr: s.addr + src_offset,
                    size,
                },
            )?;
            return Ok(());
        }
        let bytes = s.core.read_mem(s.addr + src_offset, size)?;
        d.core.write_mem(d.addr + dst_offset, &bytes)
    }

    pub fn bo_properties(&self, handle: BoHandle) -> ShimResult<BoProperties> {
        let res = self.lock_resources();
        let rec = res.bos.get(handle)?;
        self.check_import(rec)?;
        Ok(BoProperties {
            handle,
            size: rec.size,
            flags: rec.flags,
            paddr: rec.addr,
        })
    }

    /// Share the BO. Exporting again returns the same descriptor.
    pub fn export_bo(&self, handle: BoHandle) -> ShimResult<ExportFd> {
        self.core.ensure_open()?;
        let mut res = self.lock_resources();
        let rec = res.bos.get_mut(handle)?;
        if let BoOrigin::Imported { fd, .. } = rec.origin {
            return match self.registry.lookup_export(fd) {
                Some(_) => Ok(fd),
                None => Err(ShimError::StaleHandle),
            };
        }
        if let Some(fd) = rec.export {
            return Ok(fd);
        }
        let fd = self.registry.export(ExportEntry {
            device: self.index,
            owner: handle,
            addr: rec.addr,
            size: rec.size,
            shadow: rec.shadow.clone(),
            flags: rec.flags,
        });
        rec.export = Some(fd);
        Ok(fd)
    }

    /// Create a non-owning alias of an exported BO. Importing the same
    /// descriptor again returns the same handle.
    pub fn import_bo(&self, fd: ExportFd, flags: BoFlags) -> ShimResult<BoHandle> {
        self.core.ensure_open()?;
        let entry = self
            .registry
            .lookup_export(fd)
            .ok_or(ShimError::InvalidHandle)?;
        let mut res = self.lock_resources();
        if let Some(handle) = res.bos.cached_import(fd) {
            return Ok(handle);
        }
        let flags = BoFlags {
            bank: entry.flags.bank,
            imported: true,
            userptr: false,
            p2p: flags.p2p || entry.device != self.index,
            ..flags
        };
        let handle = res.bos.insert_import(
            fd,
            BoRecord {
                size: entry.size,
                flags,
                addr: entry.addr,
                shadow: entry.shadow,
                origin: BoOrigin::Imported {
                    fd,
                    device: entry.device,
                },
                export: None,
            },
        );
        debug!(%handle, %fd, from = entry.device, "bo imported");
        Ok(handle)
    }

    fn check_import(&self, rec: &BoRecord) -> ShimResult<()> {
        match rec.origin {
            BoOrigin::Imported { fd, .. } if self.registry.lookup_export(fd).is_none() => {
                Err(ShimError::StaleHandle)
            }
            _ => Ok(()),
        }
    }

    fn target(&self, handle: BoHandle) -> ShimResult<Target> {
        let (origin, addr, size, shadow) = {
            let res = self.lock_resources();
            let rec = res.bos.get(handle)?;
            self.check_import(rec)?;
            (rec.origin, rec.addr, rec.size, rec.shadow.clone())
        };
        // The device map is never taken under the resource lock.
        let core = match origin {
            BoOrigin::Imported { device, .. } if device != self.index => self
                .registry
                .get(device)
                .map(|peer| Arc::clone(&peer.core))
                .ok_or(ShimError::StaleHandle)?,
            _ => Arc::clone(&self.core),
        };
        Ok(Target {
            core,
            addr,
            size,
            shadow,
        })
    }

    // --- registers ---

    fn check_register(&self, cu: u32, offset: u32) -> ShimResult<()> {
        let layout = self.image().ok_or(ShimError::InvalidCu(cu))?;
        let range = layout.cu(cu)?.address_range;
        if offset % 4 != 0 || u64::from(offset) + 4 > range {
            return Err(ShimError::InvalidOffset { offset, range });
        }
        Ok(())
    }

    pub fn reg_read(&self, cu: u32, offset: u32) -> ShimResult<u32> {
        self.core.ensure_open()?;
        self.check_register(cu, offset)?;
        let reply: RegReadReply = self.core.call(
            Opcode::RegRead,
            &RegReadCall {
                cu_index: cu,
                offset,
            },
        )?;
        Ok(reply.value)
    }

    pub fn reg_write(&self, cu: u32, offset: u32, value: u32) -> ShimResult<()> {
        self.core.ensure_open()?;
        self.check_register(cu, offset)?;
        self.core.call::<_, Empty>(
            Opcode::RegWrite,
            &RegWriteCall {
                cu_index: cu,
                offset,
                value,
            },
        )?;
        Ok(())
    }

    // --- execution ---

    /// Submit the command BO `cmd` to compute unit `cu`.
    pub fn exec_buf(&self, cu: u32, cmd: BoHandle) -> ShimResult<RequestId> {
        self.submit(cu, cmd, None)
    }

    pub(crate) fn submit(
        &self,
        cu: u32,
        cmd: BoHandle,
        ctx: Option<ContextId>,
    ) -> ShimResult<RequestId> {
        self.core.ensure_open()?;
        let layout = self.image().ok_or(ShimError::InvalidCu(cu))?;
        layout.cu(cu)?;
        if let Some(ctx) = ctx {
            if !self.lock_contexts().holds(ctx, cu) {
                return Err(ShimError::InvalidCu(cu));
            }
        }
        let t = self.target(cmd)?;
        let payload = t.shadow.read_vec(0, t.size as usize)?;

        let id = self.core.scheduler.enqueue(cu);
        let call = ExecBufCall {
            request_id: id,
            cu_index: cu,
            payload,
        };
        match self.core.call::<_, Empty>(Opcode::ExecBuf, &call) {
            Ok(_) => {
                self.core.scheduler.mark_submitted(id);
                debug!(device = self.index, id, cu, "request submitted");
                Ok(id)
            }
            Err(e) => {
                self.core.scheduler.discard(id);
                Err(e)
            }
        }
    }

    /// Wait for request `id`. On `TimedOut` the request stays pending.
    pub fn exec_wait(&self, id: RequestId, timeout: Duration) -> ShimResult<()> {
        self.core.ensure_open()?;
        self.core.scheduler.wait(id, timeout)
    }

    pub fn request_state(&self, id: RequestId) -> Option<RequestState> {
        self.core.scheduler.state(id)
    }

    // --- hardware contexts ---

    /// Bind a context to the loaded image `uuid`.
    pub fn create_hw_context(
        self: &Arc<Self>,
        uuid: Uuid,
        qos: Qos,
        mode: AccessMode,
    ) -> ShimResult<HwContext> {
        // Held across the uuid check and the insert; `load_image` holds it too.
        let _launch = self.lock_supervisor();
        self.core.ensure_open()?;
        let layout = self
            .image()
            .ok_or_else(|| ShimError::NotFound("no image loaded".into()))?;
        if layout.uuid() != uuid {
            return Err(ShimError::NotFound(format!("image {uuid}")));
        }
        let id = self.lock_contexts().create(uuid, mode);
        debug!(device = self.index, ctx = id, ?mode, "hardware context created");
        Ok(HwContext::new(Arc::clone(self), id, uuid, qos, mode))
    }

    pub(crate) fn open_cu(&self, ctx: ContextId, name: &str) -> ShimResult<u32> {
        let cu = self.cu_index_by_name(name)?;
        self.lock_contexts().open_cu(ctx, cu)?;
        debug!(ctx, cu, name, "cu context opened");
        Ok(cu)
    }

    pub(crate) fn close_cu(&self, ctx: ContextId, cu: u32) -> ShimResult<()> {
        self.lock_contexts().close_cu(ctx, cu)
    }

    pub(crate) fn destroy_context(&self, ctx: ContextId) -> Vec<u32> {
        self.lock_contexts().destroy(ctx)
    }

    // --- lifecycle ---

    /// Close the device and stop its emulation process. Idempotent.
    pub fn close(&self) {
        let mut sup = self.lock_supervisor();
        self.teardown(&mut sup);
    }

    fn teardown(&self, sup: &mut Supervisor) {
        let was_open = !self.core.closed.swap(true, Ordering::AcqRel);
        self.core.scheduler.fail_all(Failure::DeviceClosed);
        self.core.scheduler.shutdown();
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(h) = poller {
            let _ = h.join();
        }
        if was_open {
            if let Err(e) = self.core.transport.call::<_, Empty>(Opcode::Close, &Empty {}) {
                debug!(device = self.index, error = %e, "close exchange failed");
            }
            info!(device = self.index, "device closed");
        }
        let had_session = self.core.transport.take().is_some();
        sup.shutdown();
        if had_session {
            self.registry.revoke_device(self.index);
        }
    }

    /// Relaunch the emulation process of a closed device.
    ///
    /// The device starts empty: every handle issued before becomes stale. The
    /// loaded image, if any, is sent again.
    pub fn reopen(&self) -> ShimResult<()> {
        let mut sup = self.lock_supervisor();
        if self.is_good() {
            return Ok(());
        }
        if !sup.can_launch() {
            return Err(ShimError::DeviceClosed);
        }
        self.teardown(&mut sup);
        let (chan, hello) = sup.launch(self.index)?;

        {
            let mut res = self.lock_resources();
            let dropped = res.bos.clear();
            res.mm = MemoryManager::new(&self.registry.config().banks);
            debug!(device = self.index, dropped = dropped.len(), "buffer objects invalidated");
        }
        *self
            .device_name
            .write()
            .unwrap_or_else(PoisonError::into_inner) = hello.device_name;

        self.core.scheduler.reset();
        self.core.transport.install(chan);
        self.core.closed.store(false, Ordering::Release);
        let poller = spawn_poller(Arc::clone(&self.core))?;
        *self.poller.lock().unwrap_or_else(PoisonError::into_inner) = Some(poller);

        if let Some(layout) = self.image() {
            self.send_image(&layout)?;
        }
        info!(device = self.index, pid = hello.pid, "device reopened");
        Ok(())
    }

    /// SIGKILL the emulation process without closing the shim.
    pub fn kill_device(&self) -> bool {
        self.lock_supervisor().kill()
    }

    fn lock_supervisor(&self) -> MutexGuard<'_, Supervisor> {
        self.supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_resources(&self) -> MutexGuard<'_, Resources> {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_contexts(&self) -> MutexGuard<'_, ContextTable> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Shim {
    fn drop(&mut self) {
        self.close();
    }
}
