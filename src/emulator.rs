// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Device half of the protocol: simulated DDR, CU register files and the
// execution queue. Runs inside the `swemu-device` binary, or on a thread in
// tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::bo::BoFlags;
use crate::channel::{read_frame, write_frame, FRAME_SLACK};
use crate::config::DEFAULT_MESSAGE_SIZE;
use crate::error::{ShimError, ShimResult};
use crate::proto::message::{
    self, AllocBufferCall, Completion, CopyBufferCall, Empty, ErrorReply, ExecBufCall,
    FreeBufferCall, HandshakeCall, HandshakeReply, LoadImageCall, Opcode, PollCompletionsReply,
    ReadMemCall, ReadMemReply, RegReadCall, RegReadReply, RegWriteCall, WriteMemCall,
    PROTOCOL_VERSION, STATUS_BAD_PAYLOAD, STATUS_INVALID, STATUS_OK, STATUS_UNSUPPORTED,
};

// Control register bits (offset 0 of every CU).
pub const CONTROL_AP_START: u32 = 0x1;
pub const AP_DONE: u32 = 0x2;
pub const AP_IDLE: u32 = 0x4;
pub const AP_CONTINUE: u32 = 0x10;

/// First argument register; command payload words land here.
pub const ARG_OFFSET: u32 = 0x10;

/// Tunables of one emulated device.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub name: String,
    /// Simulated execution time of every command.
    pub exec_latency: Duration,
    /// Largest data chunk a call may carry.
    pub message_size: usize,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            name: "swemu".to_owned(),
            exec_latency: Duration::ZERO,
            message_size: DEFAULT_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug)]
struct CuRegs {
    name: String,
    range: u64,
    regs: HashMap<u32, u32>,
}

impl CuRegs {
    fn new(name: String, range: u64) -> Self {
        let mut regs = HashMap::new();
        regs.insert(0, AP_IDLE);
        Self { name, range, regs }
    }

    fn check(&self, offset: u32) -> Result<(), String> {
        if u64::from(offset) + 4 > self.range {
            return Err(format!(
                "offset {offset:#x} outside {} (range {:#x})",
                self.name, self.range
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    /// Simulated memory: start address -> contents.
    regions: BTreeMap<u64, Vec<u8>>,
    cus: Vec<CuRegs>,
    completed: VecDeque<Completion>,
}

impl DeviceState {
    fn region(&mut self, addr: u64, len: u64) -> Result<&mut [u8], String> {
        let (start, buf) = self
            .regions
            .range_mut(..=addr)
            .next_back()
            .ok_or_else(|| format!("address {addr:#x} is not allocated"))?;
        let off = addr - start;
        match off.checked_add(len) {
            Some(end) if end <= buf.len() as u64 => Ok(&mut buf[off as usize..end as usize]),
            _ => Err(format!(
                "range {addr:#x}+{len:#x} exceeds region at {start:#x} of {:#x} bytes",
                buf.len()
            )),
        }
    }

    fn run(&mut self, job: &ExecBufCall) -> u32 {
        let Some(cu) = self.cus.get_mut(job.cu_index as usize) else {
            return STATUS_INVALID;
        };
        let mut offset = ARG_OFFSET;
        for word in job.payload.chunks(4) {
            let mut b = [0u8; 4];
            b[..word.len()].copy_from_slice(word);
            if u64::from(offset) + 4 > cu.range {
                break;
            }
            cu.regs.insert(offset, u32::from_le_bytes(b));
            offset += 4;
        }
        cu.regs.insert(0, AP_DONE | AP_IDLE);
        STATUS_OK
    }
}

type Reply = Result<Vec<u8>, (u32, String)>;

fn ok<M: prost::Message>(m: &M) -> Reply {
    Ok(message::encode(m))
}

fn invalid(msg: String) -> (u32, String) {
    (STATUS_INVALID, msg)
}

fn parse<M: prost::Message + Default>(op: Opcode, bytes: &[u8]) -> Result<M, (u32, String)> {
    message::decode(op, bytes).map_err(|e| (STATUS_BAD_PAYLOAD, e.to_string()))
}

// ---------------------------------------------------------------------------
// DeviceServer
// ---------------------------------------------------------------------------

/// One emulated device serving one host connection.
#[derive(Debug)]
pub struct DeviceServer {
    index: u32,
    options: DeviceOptions,
    state: Arc<Mutex<DeviceState>>,
}

impl DeviceServer {
    pub fn new(index: u32, options: DeviceOptions) -> Self {
        Self {
            index,
            options,
            state: Arc::new(Mutex::new(DeviceState::default())),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Serve calls until the host sends `Close` or disconnects.
    pub fn serve(&self, stream: UnixStream) -> ShimResult<()> {
        let max_frame = self.options.message_size.saturating_add(FRAME_SLACK);
        let mut reader = stream.try_clone()?;
        let mut writer = stream;

        let (tx, rx) = mpsc::channel::<ExecBufCall>();
        let worker = {
            let state = Arc::clone(&self.state);
            let latency = self.options.exec_latency;
            std::thread::Builder::new()
                .name(format!("swemu-exec-{}", self.index))
                .spawn(move || exec_loop(&state, latency, &rx))?
        };

        let result = loop {
            let (code, payload) = match read_frame(&mut reader, max_frame) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!(device = self.index, "host disconnected");
                    break Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    break Err(ShimError::ProtocolError(e.to_string()));
                }
                Err(e) => break Err(ShimError::TransportLost(e.to_string())),
            };
            let op = Opcode::try_from(code);
            let reply = match op {
                Ok(op) => self.dispatch(op, &payload, &tx),
                Err(code) => Err((STATUS_UNSUPPORTED, format!("unknown opcode {code}"))),
            };
            let sent = match reply {
                Ok(body) => write_frame(&mut writer, STATUS_OK, &body),
                Err((status, msg)) => {
                    debug!(device = self.index, code, status, %msg, "call rejected");
                    write_frame(&mut writer, status, &message::encode(&ErrorReply { message: msg }))
                }
            };
            if let Err(e) = sent {
                break Err(ShimError::TransportLost(e.to_string()));
            }
            if op == Ok(Opcode::Close) {
                info!(device = self.index, "close requested");
                break Ok(());
            }
        };

        drop(tx);
        if worker.join().is_err() {
            warn!(device = self.index, "exec worker panicked");
        }
        result
    }

    fn dispatch(&self, op: Opcode, payload: &[u8], exec: &mpsc::Sender<ExecBufCall>) -> Reply {
        trace!(device = self.index, %op, len = payload.len(), "call");
        match op {
            Opcode::Handshake => {
                let call: HandshakeCall = parse(op, payload)?;
                if call.version != PROTOCOL_VERSION {
                    return Err(invalid(format!("unsupported protocol {}", call.version)));
                }
                info!(device = self.index, host = call.host_pid, "handshake");
                ok(&HandshakeReply {
                    version: PROTOCOL_VERSION,
                    device_name: format!("{}:{}", self.options.name, self.index),
                    pid: std::process::id(),
                })
            }
            Opcode::LoadImage => {
                let call: LoadImageCall = parse(op, payload)?;
                let mut st = self.lock();
                st.cus = call
                    .compute_units
                    .into_iter()
                    .map(|cu| CuRegs::new(cu.name, cu.address_range))
                    .collect();
                let uuid = uuid::Uuid::from_slice(&call.uuid).unwrap_or_default();
                debug!(device = self.index, %uuid, cus = st.cus.len(), "image loaded");
                ok(&Empty {})
            }
            Opcode::AllocBuffer => {
                let call: AllocBufferCall = parse(op, payload)?;
                let len = usize::try_from(call.size)
                    .map_err(|_| invalid(format!("size {:#x} too large", call.size)))?;
                let flags = BoFlags::from_bits(call.flags);
                trace!(device = self.index, addr = call.addr, len, ?flags, "region allocated");
                self.lock().regions.insert(call.addr, vec![0u8; len]);
                ok(&Empty {})
            }
            Opcode::FreeBuffer => {
                let call: FreeBufferCall = parse(op, payload)?;
                match self.lock().regions.remove(&call.addr) {
                    Some(_) => ok(&Empty {}),
                    None => Err(invalid(format!("no region at {:#x}", call.addr))),
                }
            }
            Opcode::WriteMem => {
                let call: WriteMemCall = parse(op, payload)?;
                let mut st = self.lock();
                let dst = st
                    .region(call.addr, call.data.len() as u64)
                    .map_err(invalid)?;
                dst.copy_from_slice(&call.data);
                ok(&Empty {})
            }
            Opcode::ReadMem => {
                let call: ReadMemCall = parse(op, payload)?;
                let mut st = self.lock();
                let src = st.region(call.addr, call.size).map_err(invalid)?;
                ok(&ReadMemReply { data: src.to_vec() })
            }
            Opcode::CopyBuffer => {
                let call: CopyBufferCall = parse(op, payload)?;
                let mut st = self.lock();
                let bytes = st.region(call.src_addr, call.size).map_err(invalid)?.to_vec();
                st.region(call.dst_addr, call.size)
                    .map_err(invalid)?
                    .copy_from_slice(&bytes);
                ok(&Empty {})
            }
            Opcode::RegRead => {
                let call: RegReadCall = parse(op, payload)?;
                let st = self.lock();
                let cu = st
                    .cus
                    .get(call.cu_index as usize)
                    .ok_or_else(|| invalid(format!("no compute unit {}", call.cu_index)))?;
                cu.check(call.offset).map_err(invalid)?;
                let value = cu.regs.get(&call.offset).copied().unwrap_or(0);
                ok(&RegReadReply { value })
            }
            Opcode::RegWrite => {
                let call: RegWriteCall = parse(op, payload)?;
                let mut st = self.lock();
                let cu = st
                    .cus
                    .get_mut(call.cu_index as usize)
                    .ok_or_else(|| invalid(format!("no compute unit {}", call.cu_index)))?;
                cu.check(call.offset).map_err(invalid)?;
                cu.regs.insert(call.offset, call.value);
                ok(&Empty {})
            }
            Opcode::ExecBuf => {
                let call: ExecBufCall = parse(op, payload)?;
                self.lock()
                    .cus
                    .get_mut(call.cu_index as usize)
                    .ok_or_else(|| invalid(format!("no compute unit {}", call.cu_index)))?
                    .regs
                    .insert(0, CONTROL_AP_START);
                exec.send(call)
                    .map_err(|_| invalid("execution queue stopped".to_owned()))?;
                ok(&Empty {})
            }
            Opcode::PollCompletions => {
                let completed = self.lock().completed.drain(..).collect();
                ok(&PollCompletionsReply { completed })
            }
            Opcode::Close => ok(&Empty {}),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run commands in submission order.
fn exec_loop(state: &Mutex<DeviceState>, latency: Duration, rx: &mpsc::Receiver<ExecBufCall>) {
    for job in rx {
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
        let status = st.run(&job);
        trace!(id = job.request_id, cu = job.cu_index, status, "command done");
        st.completed.push_back(Completion {
            request_id: job.request_id,
            status,
        });
    }
}
