// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Emulation process supervisor: launch, readiness, shutdown.
//
// A launch binds a private socket, spawns the device binary pointed at it,
// accepts its connection and performs the handshake. The process only counts
// as running once the handshake succeeded.

use std::io;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::message::{self, HandshakeCall, HandshakeReply, Opcode, PROTOCOL_VERSION, STATUS_OK};
use super::process_manager::{force_kill, shutdown, spawn, try_reap, ProcessHandle, WaitResult};
use crate::channel::RpcChannel;
use crate::config::Config;
use crate::error::{ShimError, ShimResult};

const ACCEPT_POLL: Duration = Duration::from_millis(5);

/// Perform the version handshake on a freshly connected channel.
pub fn handshake(chan: &mut RpcChannel, device_index: u32) -> ShimResult<HandshakeReply> {
    let call = HandshakeCall {
        version: PROTOCOL_VERSION,
        device_index,
        host_pid: std::process::id(),
    };
    let (status, body) = chan.exchange(Opcode::Handshake, &message::encode(&call))?;
    if status != STATUS_OK {
        return Err(ShimError::Launch(format!(
            "handshake rejected: {}",
            message::error_message(&body)
        )));
    }
    let reply: HandshakeReply = message::decode(Opcode::Handshake, &body)?;
    if reply.version != PROTOCOL_VERSION {
        return Err(chan.poison(&format!(
            "device speaks protocol {}, expected {PROTOCOL_VERSION}",
            reply.version
        )));
    }
    Ok(reply)
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Owns at most one emulation process for one device.
#[derive(Debug)]
pub struct Supervisor {
    binary: Option<PathBuf>,
    extra_args: Vec<String>,
    socket_dir: PathBuf,
    message_size: usize,
    launch_timeout: Duration,
    shutdown_grace: Duration,
    debug: bool,
    proc: Option<ProcessHandle>,
    launches: u32,
}

impl Supervisor {
    /// Supervisor that launches `config.device_binary`.
    pub fn new(config: &Config) -> Self {
        Self {
            binary: config.device_binary.clone(),
            extra_args: config.device_args.clone(),
            socket_dir: config.socket_dir.clone(),
            message_size: config.message_size,
            launch_timeout: config.launch_timeout,
            shutdown_grace: config.shutdown_grace,
            debug: config.debug,
            proc: None,
            launches: 0,
        }
    }

    /// Supervisor for a connection made elsewhere; it never launches.
    pub fn detached(config: &Config) -> Self {
        let mut sup = Self::new(config);
        sup.binary = None;
        sup
    }

    pub fn can_launch(&self) -> bool {
        self.binary.is_some()
    }

    /// Pid of the supervised process, if one was launched and not yet reaped.
    pub fn pid(&self) -> Option<u32> {
        self.proc.as_ref().map(|p| p.pid)
    }

    /// Whether the launched process has not exited yet. Reaps it if it has.
    pub fn is_running(&mut self) -> bool {
        match &self.proc {
            None => false,
            Some(p) => {
                if let Some(r) = try_reap(p) {
                    debug!(pid = p.pid, ?r, "emulation process exited");
                    self.proc = None;
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Launch the emulation process for `device_index` and wait for it to be ready.
    pub fn launch(&mut self, device_index: u32) -> ShimResult<(RpcChannel, HandshakeReply)> {
        if self.is_running() {
            return Err(ShimError::Busy(format!(
                "emulation process for device {device_index} is already running"
            )));
        }
        let binary = self.binary.clone().ok_or_else(|| {
            ShimError::Launch("no device binary configured (SWEMU_DEVICE_BINARY)".into())
        })?;

        std::fs::create_dir_all(&self.socket_dir)?;
        let socket = self.socket_dir.join(format!(
            "swemu-{}-{}-{}.sock",
            std::process::id(),
            device_index,
            self.launches
        ));
        self.launches += 1;
        let _ = std::fs::remove_file(&socket);
        let listener = UnixListener::bind(&socket)?;
        listener.set_nonblocking(true)?;

        let result = self.spawn_and_connect(&binary, &socket, &listener, device_index);
        if !self.debug {
            let _ = std::fs::remove_file(&socket);
        }
        result
    }

    fn spawn_and_connect(
        &mut self,
        binary: &Path,
        socket: &Path,
        listener: &UnixListener,
        device_index: u32,
    ) -> ShimResult<(RpcChannel, HandshakeReply)> {
        let mut args = vec![
            "--socket".to_owned(),
            socket.display().to_string(),
            "--device".to_owned(),
            device_index.to_string(),
            "--message-size".to_owned(),
            self.message_size.to_string(),
        ];
        if self.debug {
            args.push("--debug".to_owned());
        }
        args.extend(self.extra_args.iter().cloned());

        let name = format!("swemu-device.{device_index}");
        let proc = spawn(&name, &binary.display().to_string(), &args)
            .map_err(|e| ShimError::Launch(format!("spawning {}: {e}", binary.display())))?;
        debug!(
            pid = proc.pid,
            name = %proc.name,
            executable = %proc.executable,
            socket = %socket.display(),
            "emulation process spawned"
        );

        let deadline = Instant::now() + self.launch_timeout;
        let stream = loop {
            match listener.accept() {
                Ok((stream, _)) => break stream,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if let Some(r) = try_reap(&proc) {
                        return Err(ShimError::Launch(format!(
                            "emulation process exited before connecting ({})",
                            describe_exit(&r)
                        )));
                    }
                    if Instant::now() >= deadline {
                        kill_and_reap(&proc);
                        return Err(ShimError::Launch(format!(
                            "emulation process did not connect within {:?}",
                            self.launch_timeout
                        )));
                    }
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    kill_and_reap(&proc);
                    return Err(e.into());
                }
            }
        };

        let ready = stream
            .set_nonblocking(false)
            .map_err(ShimError::from)
            .and_then(|()| {
                let mut chan = RpcChannel::new(stream, self.message_size);
                handshake(&mut chan, device_index).map(|hello| (chan, hello))
            });
        match ready {
            Ok((chan, hello)) => {
                info!(
                    device = device_index,
                    pid = proc.pid,
                    name = %hello.device_name,
                    "emulation process ready"
                );
                self.proc = Some(proc);
                Ok((chan, hello))
            }
            Err(e) => {
                kill_and_reap(&proc);
                Err(ShimError::Launch(format!("handshake failed: {e}")))
            }
        }
    }

    /// Stop the process: SIGTERM, grace period, then SIGKILL.
    pub fn shutdown(&mut self) -> Option<WaitResult> {
        let proc = self.proc.take()?;
        let r = shutdown(&proc, self.shutdown_grace);
        if r.finished() {
            debug!(
                pid = proc.pid,
                name = %proc.name,
                exit = %describe_exit(&r),
                "emulation process stopped"
            );
        } else {
            warn!(pid = proc.pid, name = %proc.name, "emulation process did not exit");
        }
        Some(r)
    }

    /// SIGKILL the process without waiting for it. Used to simulate a crash.
    pub fn kill(&self) -> bool {
        self.proc.as_ref().is_some_and(force_kill)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn kill_and_reap(proc: &ProcessHandle) {
    force_kill(proc);
    super::process_manager::wait_for_exit(proc, Duration::from_secs(1));
}

fn describe_exit(r: &WaitResult) -> String {
    if r.signaled {
        format!("signal {}", r.signal)
    } else if r.exited {
        format!("exit code {}", r.exit_code)
    } else {
        "unknown".to_owned()
    }
}
