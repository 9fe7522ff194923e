// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Command scheduler: request table, completion delivery, waiting.
//
// Each request moves Queued -> Submitted -> Completed | Failed. A timed-out
// wait does not change the state, so a later wait can still observe the
// completion. A terminal state is consumed by exactly one successful wait.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{ShimError, ShimResult};
use crate::proto::message::{Completion, STATUS_OK};

/// Identifier of a submitted command.
pub type RequestId = u64;

/// Why a request did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The device reported a non-zero status.
    Status(u32),
    /// The emulation process went away while the request was pending.
    TransportLost(String),
    /// The shim was closed while the request was pending.
    DeviceClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    Queued,
    Submitted,
    Completed,
    Failed(Failure),
}

impl RequestState {
    fn is_pending(&self) -> bool {
        matches!(self, Self::Queued | Self::Submitted)
    }
}

#[derive(Debug)]
struct Entry {
    cu: u32,
    state: RequestState,
    queued_at: Instant,
}

#[derive(Debug, Default)]
struct Table {
    entries: HashMap<RequestId, Entry>,
    /// Pending requests in submission order.
    pending: VecDeque<RequestId>,
    quit: bool,
}

impl Table {
    fn settle(&mut self, id: RequestId, state: RequestState) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        if !entry.state.is_pending() {
            return false;
        }
        entry.state = state;
        self.pending.retain(|&p| p != id);
        true
    }
}

/// Request table shared by submitters, waiters and the completion poller.
#[derive(Debug)]
pub struct Scheduler {
    table: Mutex<Table>,
    cond: Condvar,
    next_id: AtomicU64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table::default()),
            cond: Condvar::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Record a new request for `cu` in the `Queued` state.
    pub fn enqueue(&self, cu: u32) -> RequestId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut t = self.lock();
        t.entries.insert(
            id,
            Entry {
                cu,
                state: RequestState::Queued,
                queued_at: Instant::now(),
            },
        );
        t.pending.push_back(id);
        trace!(id, cu, "request queued");
        id
    }

    /// The device acknowledged the request. No-op if it already settled.
    pub fn mark_submitted(&self, id: RequestId) {
        let mut t = self.lock();
        if let Some(e) = t.entries.get_mut(&id) {
            if e.state == RequestState::Queued {
                e.state = RequestState::Submitted;
            }
        }
        self.cond.notify_all();
    }

    /// Forget a request whose submission never reached the device.
    pub fn discard(&self, id: RequestId) {
        let mut t = self.lock();
        t.entries.remove(&id);
        t.pending.retain(|&p| p != id);
    }

    /// Apply completions reported by the device and wake waiters.
    pub fn complete(&self, completed: &[Completion]) {
        if completed.is_empty() {
            return;
        }
        let mut t = self.lock();
        for c in completed {
            let state = if c.status == STATUS_OK {
                RequestState::Completed
            } else {
                RequestState::Failed(Failure::Status(c.status))
            };
            if t.settle(c.request_id, state) {
                if let Some(e) = t.entries.get(&c.request_id) {
                    debug!(
                        id = c.request_id,
                        cu = e.cu,
                        status = c.status,
                        elapsed = ?e.queued_at.elapsed(),
                        "request completed"
                    );
                }
            } else {
                debug!(id = c.request_id, "completion for unknown request");
            }
        }
        self.cond.notify_all();
    }

    /// Fail every pending request with `why` and wake all waiters.
    pub fn fail_all(&self, why: Failure) {
        let mut t = self.lock();
        let pending: Vec<RequestId> = t.pending.drain(..).collect();
        for id in &pending {
            if let Some(e) = t.entries.get_mut(id) {
                e.state = RequestState::Failed(why.clone());
            }
        }
        if !pending.is_empty() {
            debug!(count = pending.len(), ?why, "pending requests failed");
        }
        self.cond.notify_all();
    }

    /// Block until `id` reaches a terminal state or `timeout` elapses.
    ///
    /// Success and device failure consume the request. `TimedOut` leaves it in
    /// place. Unknown or already-consumed ids yield `NotFound`.
    pub fn wait(&self, id: RequestId, timeout: Duration) -> ShimResult<()> {
        let deadline = Instant::now().checked_add(timeout);
        let mut t = self.lock();
        loop {
            let state = match t.entries.get(&id) {
                None => return Err(ShimError::NotFound(format!("request {id}"))),
                Some(e) => e.state.clone(),
            };
            match state {
                RequestState::Completed => {
                    t.entries.remove(&id);
                    return Ok(());
                }
                RequestState::Failed(why) => {
                    t.entries.remove(&id);
                    return Err(match why {
                        Failure::Status(status) => ShimError::CommandFailed { id, status },
                        Failure::TransportLost(m) => ShimError::TransportLost(m),
                        Failure::DeviceClosed => ShimError::DeviceClosed,
                    });
                }
                RequestState::Queued | RequestState::Submitted => {}
            }
            let remaining = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if remaining.is_zero() {
                return Err(ShimError::TimedOut);
            }
            t = self
                .cond
                .wait_timeout(t, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn state(&self, id: RequestId) -> Option<RequestState> {
        self.lock().entries.get(&id).map(|e| e.state.clone())
    }

    /// Requests not yet settled.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Used by the poller: sleep until work is pending, then for one poll
    /// interval. Returns `false` once shut down.
    pub(crate) fn wait_for_work(&self, interval: Duration) -> bool {
        let mut t = self.lock();
        while !t.quit && t.pending.is_empty() {
            t = self.cond.wait(t).unwrap_or_else(PoisonError::into_inner);
        }
        if t.quit {
            return false;
        }
        let t = self
            .cond
            .wait_timeout(t, interval)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
        !t.quit
    }

    /// Stop the poller loop.
    pub(crate) fn shutdown(&self) {
        self.lock().quit = true;
        self.cond.notify_all();
    }

    /// Drop every request and re-arm the poller loop. Used on reopen.
    pub(crate) fn reset(&self) {
        let mut t = self.lock();
        t.entries.clear();
        t.pending.clear();
        t.quit = false;
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
