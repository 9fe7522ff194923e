// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Spawning, signalling and reaping of the emulation process.

use std::ffi::CString;
use std::io;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// ProcessHandle
// ---------------------------------------------------------------------------

/// Handle to a spawned child process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: u32,
    /// Logical name, used in logs.
    pub name: String,
    /// Path to the binary.
    pub executable: String,
}

impl ProcessHandle {
    pub fn valid(&self) -> bool {
        self.pid > 0
    }

    /// Whether the pid still exists. A zombie that has not been reaped counts
    /// as alive; use [`try_reap`] for children.
    pub fn is_alive(&self) -> bool {
        if !self.valid() {
            return false;
        }
        let ret = unsafe { libc::kill(self.pid as libc::pid_t, 0) };
        ret == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }
}

// ---------------------------------------------------------------------------
// WaitResult
// ---------------------------------------------------------------------------

/// Result of a [`wait_for_exit`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WaitResult {
    pub exited: bool,
    pub exit_code: i32,
    pub signaled: bool,
    pub signal: i32,
}

impl WaitResult {
    /// The child is gone (either way).
    pub fn finished(&self) -> bool {
        self.exited || self.signaled
    }

    fn from_status(status: libc::c_int) -> Self {
        let mut r = WaitResult::default();
        if libc::WIFEXITED(status) {
            r.exited = true;
            r.exit_code = libc::WEXITSTATUS(status);
        }
        if libc::WIFSIGNALED(status) {
            r.signaled = true;
            r.signal = libc::WTERMSIG(status);
        }
        r
    }
}

// ---------------------------------------------------------------------------
// spawn
// ---------------------------------------------------------------------------

extern "C" {
    static mut environ: *mut *mut libc::c_char;
}

/// Spawn `executable` with `args`, inheriting the environment.
pub fn spawn(name: &str, executable: &str, args: &[String]) -> io::Result<ProcessHandle> {
    let to_cstring = |s: &str| {
        CString::new(s).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in argument"))
    };

    let exe = to_cstring(executable)?;
    let mut argv: Vec<CString> = Vec::with_capacity(args.len() + 1);
    argv.push(exe.clone());
    for a in args {
        argv.push(to_cstring(a)?);
    }
    let mut argv_ptrs: Vec<*mut libc::c_char> = argv
        .iter()
        .map(|s| s.as_ptr() as *mut libc::c_char)
        .collect();
    argv_ptrs.push(std::ptr::null_mut());

    let mut pid: libc::pid_t = -1;
    let err = unsafe {
        libc::posix_spawn(
            &mut pid,
            exe.as_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            argv_ptrs.as_mut_ptr(),
            environ,
        )
    };
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }

    Ok(ProcessHandle {
        pid: pid as u32,
        name: name.to_owned(),
        executable: executable.to_owned(),
    })
}

// ---------------------------------------------------------------------------
// request_shutdown / force_kill
// ---------------------------------------------------------------------------

/// Send SIGTERM to request graceful shutdown.
pub fn request_shutdown(h: &ProcessHandle) -> bool {
    h.valid() && unsafe { libc::kill(h.pid as libc::pid_t, libc::SIGTERM) == 0 }
}

/// Send SIGKILL.
pub fn force_kill(h: &ProcessHandle) -> bool {
    h.valid() && unsafe { libc::kill(h.pid as libc::pid_t, libc::SIGKILL) == 0 }
}

// ---------------------------------------------------------------------------
// try_reap / wait_for_exit
// ---------------------------------------------------------------------------

/// Reap the child if it has exited, without blocking.
pub fn try_reap(h: &ProcessHandle) -> Option<WaitResult> {
    if !h.valid() {
        return None;
    }
    let mut status: libc::c_int = 0;
    let ret = unsafe { libc::waitpid(h.pid as libc::pid_t, &mut status, libc::WNOHANG) };
    if ret == h.pid as libc::pid_t {
        Some(WaitResult::from_status(status))
    } else {
        None
    }
}

/// Wait for a child to exit, with a timeout.
/// Returns immediately if the process has already exited.
pub fn wait_for_exit(h: &ProcessHandle, timeout: Duration) -> WaitResult {
    if !h.valid() {
        return WaitResult::default();
    }

    let deadline = Instant::now() + timeout;
    loop {
        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(h.pid as libc::pid_t, &mut status, libc::WNOHANG) };
        if ret == h.pid as libc::pid_t {
            return WaitResult::from_status(status);
        }
        if ret == -1 || Instant::now() >= deadline {
            return WaitResult::default();
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

// ---------------------------------------------------------------------------
// shutdown (graceful: SIGTERM → wait → SIGKILL)
// ---------------------------------------------------------------------------

/// Gracefully shut down a child: SIGTERM, wait `grace`, then SIGKILL if still alive.
pub fn shutdown(h: &ProcessHandle, grace: Duration) -> WaitResult {
    if !h.valid() {
        return WaitResult::default();
    }
    request_shutdown(h);
    let r = wait_for_exit(h, grace);
    if !r.finished() && h.is_alive() {
        force_kill(h);
        return wait_for_exit(h, Duration::from_secs(1));
    }
    r
}
