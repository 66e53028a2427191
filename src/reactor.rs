//! The event loop: a directory of pending per-descriptor operations, a
//! `poll(2)` vector kept in lockstep with it, and two deadline heaps (one
//! for timed descriptor operations, one for plain delayed callbacks).

use std::collections::{BTreeMap, VecDeque};
use std::os::unix::io::RawFd;

use log::{debug, trace, warn};

use crate::clock::now_ms;
use crate::error::Status;
use crate::heap::{Deadline, Heap};
use crate::mask::{self, EventKind};
use crate::node::{status_slot, EventNode, Handler, HeapIndex, RemainingSlot, StatusSlot};

/// Tunables for the reactor's backing storage. Mirrors the
/// `Events::with_capacity` convention: sizing is a performance hint, not
/// a hard limit — every collection here still grows on demand.
#[derive(Clone, Debug)]
pub struct Config {
    pub poll_capacity: usize,
    pub queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            poll_capacity: 64,
            queue_capacity: 16,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Ready,
    Running,
    Stopping,
    Done,
}

struct TimedEntry {
    deadline: i64,
    fd: RawFd,
    kind: EventKind,
    index: HeapIndex,
}

impl Deadline for TimedEntry {
    fn deadline(&self) -> i64 {
        self.deadline
    }
}

struct DelayEntry {
    deadline: i64,
    handler: Option<Handler>,
    status: Option<StatusSlot>,
}

impl Deadline for DelayEntry {
    fn deadline(&self) -> i64 {
        self.deadline
    }
}

/// The reactor core: multiplexes descriptors via `poll(2)`, dispatches
/// their completion handlers, and runs delayed callbacks, all on the
/// thread that calls [`Reactor::run`].
pub struct Reactor {
    directory: BTreeMap<RawFd, EventNode>,
    poll_vec: Vec<libc::pollfd>,
    timed_heap: Heap<TimedEntry>,
    delay_heap: Heap<DelayEntry>,
    sync_queue: VecDeque<Handler>,
    state: State,
}

impl Default for Reactor {
    fn default() -> Self {
        Reactor::new(Config::default())
    }
}

impl Reactor {
    pub fn new(config: Config) -> Self {
        Reactor {
            directory: BTreeMap::new(),
            poll_vec: Vec::with_capacity(config.poll_capacity),
            timed_heap: Heap::new(),
            delay_heap: Heap::new(),
            sync_queue: VecDeque::with_capacity(config.queue_capacity),
            state: State::Ready,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Schedule `handler` to run for `kind` readiness on `fd`, with no
    /// deadline.
    pub fn sched(&mut self, fd: RawFd, kind: EventKind, handler: Handler, status: Option<StatusSlot>) -> Status {
        match self.enqueue(fd, kind, handler, status, None) {
            Ok(()) => Status::Ok,
            Err(s) => s,
        }
    }

    /// Schedule `handler` to run for `kind` readiness on `fd`, or after
    /// `timeout_ms` elapses, whichever comes first.
    pub fn sched_timeout(
        &mut self,
        fd: RawFd,
        kind: EventKind,
        timeout_ms: i64,
        handler: Handler,
        status: Option<StatusSlot>,
        remaining: Option<RemainingSlot>,
    ) -> Status {
        match self.enqueue(fd, kind, handler, status, Some((timeout_ms, remaining))) {
            Ok(()) => Status::Ok,
            Err(s) => s,
        }
    }

    fn enqueue(
        &mut self,
        fd: RawFd,
        kind: EventKind,
        handler: Handler,
        status: Option<StatusSlot>,
        timeout: Option<(i64, Option<RemainingSlot>)>,
    ) -> Result<(), Status> {
        if !matches!(self.state, State::Ready | State::Running) {
            return Err(Status::Stopped);
        }

        if !self.directory.contains_key(&fd) {
            let poll_index = self.poll_vec.len();
            self.poll_vec.push(libc::pollfd {
                fd,
                events: 0,
                revents: 0,
            });
            self.directory.insert(fd, EventNode::new(fd, poll_index));
        }

        let node = self.directory.get_mut(&fd).expect("just inserted");
        if node.has_pending(kind) {
            return Err(Status::InProgress);
        }

        let remaining_slot = timeout.as_ref().and_then(|(_, r)| r.clone());
        let record = node.reserve(kind);
        record.fill(handler, status, remaining_slot);

        let pidx = node.poll_index;
        self.poll_vec[pidx].events |= mask::interest_mask(kind);

        if let Some((timeout_ms, _)) = timeout {
            let now = now_ms();
            let index_cell: HeapIndex = std::rc::Rc::new(std::cell::Cell::new(0));
            record.heap_index = Some(index_cell.clone());
            let entry = TimedEntry {
                deadline: now + timeout_ms.max(0),
                fd,
                kind,
                index: index_cell.clone(),
            };
            let idx = self.timed_heap.push(entry, |e, i| e.index.set(i));
            index_cell.set(idx);
        }

        trace!("sched fd={fd} kind={kind:?}");
        Ok(())
    }

    /// Remove the pending operation for `(fd, kind)`, write `status` and
    /// the remaining deadline (if any) into their slots, and return the
    /// handler for the caller to invoke.
    fn dequeue(&mut self, fd: RawFd, kind: EventKind, now: i64, status: Status) -> Option<Handler> {
        let node = self.directory.get_mut(&fd)?;
        let pidx = node.poll_index;
        let record = node.record_mut(kind)?;
        if record.is_vacant() {
            return None;
        }

        if let Some(index_cell) = record.heap_index.take() {
            let idx = index_cell.get();
            if let Some(entry) = self.timed_heap.get(idx) {
                if let Some(remaining_slot) = &record.remaining {
                    remaining_slot.set((entry.deadline - now).max(0));
                }
            }
            self.timed_heap.remove(idx, |e, i| e.index.set(i));
        }

        if let Some(status_slot) = &record.status {
            status_slot.set(status);
        }

        let handler = record.take();

        self.poll_vec[pidx].events &= !mask::dequeue_mask(kind);
        self.poll_vec[pidx].events = mask::clear_error_if_idle(self.poll_vec[pidx].events);

        if matches!(kind, EventKind::Readable | EventKind::Writable) {
            node.reset_tag_if_idle();
        }

        handler
    }

    /// Remove `fd` from the directory and poll vector once it holds no
    /// live operation in any of its three slots. Returns whether the
    /// entry was removed, so callers iterating the poll vector know a
    /// `swap_remove` may have brought a new entry into the current slot.
    fn cleanup_if_idle(&mut self, fd: RawFd) -> bool {
        let idle = self.directory.get(&fd).map_or(false, |n| n.is_idle());
        if !idle {
            return false;
        }
        let node = self.directory.remove(&fd).expect("checked idle above");
        let idx = node.poll_index;
        self.poll_vec.swap_remove(idx);
        if idx < self.poll_vec.len() {
            let moved_fd = self.poll_vec[idx].fd;
            if let Some(moved_node) = self.directory.get_mut(&moved_fd) {
                moved_node.poll_index = idx;
            }
        }
        true
    }

    /// Enqueue `handler` to run on the next drain of the synchronous post
    /// queue, ahead of the next `poll(2)` wait.
    pub fn post(&mut self, handler: Handler) -> Status {
        match self.state {
            State::Running | State::Ready => {
                self.sync_queue.push_back(handler);
                Status::Ok
            }
            _ => Status::Stopped,
        }
    }

    /// Enqueue `handler` to run after `delay_ms`, independent of any
    /// descriptor.
    pub fn post_delay(&mut self, delay_ms: i64, handler: Handler, status: Option<StatusSlot>) -> Status {
        if delay_ms < 0 {
            return Status::Invalid;
        }
        if matches!(self.state, State::Stopping | State::Done) {
            return Status::Stopped;
        }
        let deadline = now_ms() + delay_ms;
        self.delay_heap.push(
            DelayEntry {
                deadline,
                handler: Some(handler),
                status,
            },
            |_, _| {},
        );
        Status::Ok
    }

    /// Cancel the pending operation for `(fd, kind)`: dequeue it with
    /// status `Cancelled` and invoke its handler synchronously.
    pub fn cancel(&mut self, fd: RawFd, kind: EventKind) -> Status {
        if self.state != State::Running {
            return Status::Invalid;
        }
        if !self.directory.get(&fd).map_or(false, |n| n.has_pending(kind)) {
            return Status::NoEntry;
        }
        let now = now_ms();
        if let Some(mut handler) = self.dequeue(fd, kind, now, Status::Cancelled) {
            handler();
        }
        self.cleanup_if_idle(fd);
        Status::Ok
    }

    pub fn stop(&mut self) -> Status {
        match self.state {
            State::Running => {
                self.state = State::Stopping;
                Status::Ok
            }
            State::Stopping => Status::InProgress,
            _ => Status::NoEntry,
        }
    }

    pub fn reset(&mut self) -> Status {
        match self.state {
            State::Running | State::Stopping => Status::InProgress,
            _ => {
                self.state = State::Ready;
                Status::Ok
            }
        }
    }

    /// Run the loop until every pending operation has completed, been
    /// cancelled, or been drained by a `stop`.
    pub fn run(&mut self) -> Status {
        match self.state {
            State::Done => return Status::Invalid,
            State::Running | State::Stopping => return Status::InProgress,
            State::Ready => {}
        }
        self.state = State::Running;
        trace!("reactor starting");

        loop {
            self.drain_sync_queue();

            if self.state == State::Stopping {
                self.stop_drain();
                break;
            }

            if self.poll_vec.is_empty() && self.timed_heap.is_empty() && self.delay_heap.is_empty() {
                break;
            }

            let deadline = self.next_deadline();
            let timeout_ms = deadline.map(|(d, _)| (d - now_ms()).max(0));

            let t0 = now_ms();
            let ready = match self.poll_wait(timeout_ms) {
                Ok(n) => n,
                Err(err) => {
                    warn!("poll(2) failed, stopping reactor: {err}");
                    self.state = State::Stopping;
                    continue;
                }
            };
            let t1 = now_ms();

            if ready == 0 {
                if deadline.is_some() {
                    self.fire_earliest();
                }
            } else {
                let elapsed = t1 - t0;
                let requested = timeout_ms.unwrap_or(0);
                self.dispatch_ready();
                if deadline.is_some() && elapsed >= requested {
                    self.fire_earliest();
                }
            }
        }

        let result = if self.state == State::Stopping {
            Status::Stopped
        } else {
            Status::Ok
        };
        self.state = State::Done;
        debug!("reactor finished: {result}");
        result
    }

    fn drain_sync_queue(&mut self) {
        while let Some(mut handler) = self.sync_queue.pop_front() {
            handler();
        }
    }

    /// The earliest deadline across both heaps, tagged with whether it
    /// came from the timed-event heap (`true`) or the delay heap
    /// (`false`).
    fn next_deadline(&self) -> Option<(i64, bool)> {
        let t = self.timed_heap.peek().map(|e| e.deadline);
        let d = self.delay_heap.peek().map(|e| e.deadline);
        match (t, d) {
            (Some(t), Some(d)) => Some(if t <= d { (t, true) } else { (d, false) }),
            (Some(t), None) => Some((t, true)),
            (None, Some(d)) => Some((d, false)),
            (None, None) => None,
        }
    }

    fn poll_wait(&mut self, timeout_ms: Option<i64>) -> std::io::Result<i32> {
        let timeout: libc::c_int = match timeout_ms {
            None => -1,
            Some(ms) => ms.clamp(0, libc::c_int::MAX as i64) as libc::c_int,
        };
        loop {
            let n = unsafe {
                libc::poll(
                    self.poll_vec.as_mut_ptr(),
                    self.poll_vec.len() as libc::nfds_t,
                    timeout,
                )
            };
            if n >= 0 {
                return Ok(n);
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
    }

    fn fire_earliest(&mut self) {
        let now = now_ms();
        let timed_top = self.timed_heap.peek().map(|e| e.deadline);
        let delay_top = self.delay_heap.peek().map(|e| e.deadline);

        let pick_delay = match (timed_top, delay_top) {
            (Some(t), Some(d)) => d <= t,
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (None, None) => return,
        };

        if pick_delay {
            if let Some(mut entry) = self.delay_heap.pop_min(|_, _| {}) {
                if let Some(status_slot) = entry.status.take() {
                    status_slot.set(Status::Ok);
                }
                if let Some(mut handler) = entry.handler.take() {
                    handler();
                }
            }
        } else if let Some(entry) = self.timed_heap.peek() {
            let fd = entry.fd;
            let kind = entry.kind;
            if let Some(mut handler) = self.dequeue(fd, kind, now, Status::Timeout) {
                handler();
                self.cleanup_if_idle(fd);
            }
        }
    }

    fn dispatch_ready(&mut self) {
        let mut i = 0;
        while i < self.poll_vec.len() {
            let revents = self.poll_vec[i].revents;
            if revents == 0 {
                i += 1;
                continue;
            }
            let fd = self.poll_vec[i].fd;
            self.poll_vec[i].revents = 0;

            if revents & (libc::POLLNVAL as libc::c_short) != 0 {
                self.fire_invalid(fd);
                if self.cleanup_if_idle(fd) {
                    continue;
                }
                i += 1;
                continue;
            }

            let now = now_ms();

            if mask::is_exceptional(revents) {
                self.fire_kind(fd, EventKind::Exceptional, now);
            }

            let has_read = self.directory.get(&fd).map_or(false, |n| n.has_pending(EventKind::Readable));
            let has_write = self.directory.get(&fd).map_or(false, |n| n.has_pending(EventKind::Writable));
            let error_only = mask::is_error_only(revents);

            // A bare POLLERR with both directions pending is attributed
            // to the read side by convention; with only one direction
            // pending, it goes to whichever that is.
            let read_ready = mask::is_readable(revents) || (error_only && has_read);
            let write_ready = mask::is_writable(revents) || (error_only && has_write && !has_read);

            if read_ready {
                self.fire_kind(fd, EventKind::Readable, now);
            }
            if write_ready {
                self.fire_kind(fd, EventKind::Writable, now);
            }

            if self.cleanup_if_idle(fd) {
                continue;
            }
            i += 1;
        }
    }

    fn fire_kind(&mut self, fd: RawFd, kind: EventKind, now: i64) {
        if let Some(mut handler) = self.dequeue(fd, kind, now, Status::Ok) {
            handler();
        }
    }

    fn fire_invalid(&mut self, fd: RawFd) {
        let now = now_ms();
        for kind in [EventKind::Exceptional, EventKind::Readable, EventKind::Writable] {
            if let Some(mut handler) = self.dequeue(fd, kind, now, Status::Invalid) {
                handler();
            }
        }
    }

    fn stop_drain(&mut self) {
        debug!(
            "stop drain: {} delayed posts, {} descriptors",
            self.delay_heap.len(),
            self.directory.len()
        );

        for mut entry in self.delay_heap.drain().collect::<Vec<_>>() {
            if let Some(status_slot) = entry.status.take() {
                status_slot.set(Status::Stopped);
            }
            if let Some(mut handler) = entry.handler.take() {
                handler();
            }
        }

        let now = now_ms();
        let fds: Vec<RawFd> = self.directory.keys().copied().collect();
        for fd in fds {
            for kind in [EventKind::Exceptional, EventKind::Readable, EventKind::Writable] {
                if let Some(mut handler) = self.dequeue(fd, kind, now, Status::Stopped) {
                    handler();
                }
            }
        }

        self.directory.clear();
        self.poll_vec.clear();
        self.timed_heap.clear();
    }
}

/// Convenience constructor for a status cell pre-registered at
/// `Status::InProgress`, the sentinel value an operation's status reads
/// as until the reactor completes it.
pub fn new_status_slot() -> StatusSlot {
    status_slot()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{remaining_slot, status_slot};
    use std::cell::RefCell;
    use std::os::unix::io::AsRawFd;
    use std::rc::Rc;

    fn pipe() -> (std::fs::File, std::fs::File) {
        use std::os::unix::io::FromRawFd;
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        unsafe { (std::fs::File::from_raw_fd(fds[0]), std::fs::File::from_raw_fd(fds[1])) }
    }

    #[test]
    fn lifecycle_transitions() {
        let mut r = Reactor::default();
        assert_eq!(r.state(), State::Ready);
        assert_eq!(r.stop(), Status::NoEntry);
        assert_eq!(r.run(), Status::Ok);
        assert_eq!(r.state(), State::Done);
        assert_eq!(r.run(), Status::Invalid);
        assert_eq!(r.reset(), Status::Ok);
        assert_eq!(r.state(), State::Ready);
    }

    #[test]
    fn read_fires_on_writable_pipe() {
        let (rd, mut wr) = pipe();
        let mut r = Reactor::default();
        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();

        std::io::Write::write_all(&mut wr, b"x").unwrap();

        let status = status_slot();
        let s = r.sched(
            rd.as_raw_fd(),
            EventKind::Readable,
            Box::new(move || {
                *fired2.borrow_mut() = true;
            }),
            Some(status.clone()),
        );
        assert_eq!(s, Status::Ok);
        assert_eq!(r.run(), Status::Ok);
        assert!(*fired.borrow());
        assert_eq!(status.get(), Status::Ok);
    }

    #[test]
    fn sched_timeout_fires_timeout_status() {
        let (rd, _wr) = pipe();
        let mut r = Reactor::default();
        let status = status_slot();
        let remaining = remaining_slot();

        let s = r.sched_timeout(
            rd.as_raw_fd(),
            EventKind::Readable,
            10,
            Box::new(|| {}),
            Some(status.clone()),
            Some(remaining.clone()),
        );
        assert_eq!(s, Status::Ok);
        assert_eq!(r.run(), Status::Ok);
        assert_eq!(status.get(), Status::Timeout);
        assert_eq!(remaining.get(), 0);
    }

    #[test]
    fn duplicate_schedule_is_in_progress() {
        let (rd, _wr) = pipe();
        let mut r = Reactor::default();
        assert_eq!(
            r.sched(rd.as_raw_fd(), EventKind::Readable, Box::new(|| {}), None),
            Status::Ok
        );
        assert_eq!(
            r.sched(rd.as_raw_fd(), EventKind::Readable, Box::new(|| {}), None),
            Status::InProgress
        );
    }

    #[test]
    fn cancel_before_run_is_invalid() {
        let (rd, _wr) = pipe();
        let mut r = Reactor::default();
        let status = status_slot();

        r.sched(rd.as_raw_fd(), EventKind::Readable, Box::new(|| {}), Some(status.clone()));
        assert_eq!(r.cancel(rd.as_raw_fd(), EventKind::Readable), Status::Invalid);
    }

    #[test]
    fn cancel_while_running_invokes_handler_with_cancelled_status() {
        let (rd, _wr) = pipe();
        let mut r = Reactor::default();
        let status = status_slot();

        r.sched(rd.as_raw_fd(), EventKind::Readable, Box::new(|| {}), Some(status.clone()));

        // `cancel` is only valid once the loop is `Running`; tests live
        // in a child module of `reactor`, so they can reach past the
        // public API to flip that bit directly rather than needing a
        // second thread or a self-referential handler to drive it.
        r.state = State::Running;
        assert_eq!(r.cancel(rd.as_raw_fd(), EventKind::Readable), Status::Ok);
        assert_eq!(status.get(), Status::Cancelled);
        assert!(r.directory.is_empty());
        assert!(r.poll_vec.is_empty());
    }

    #[test]
    fn post_runs_before_poll_wait() {
        let mut r = Reactor::default();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        r.post(Box::new(move || o1.borrow_mut().push(1)));
        r.post(Box::new(move || o2.borrow_mut().push(2)));
        assert_eq!(r.run(), Status::Ok);
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn post_delay_runs_with_ok_status() {
        let mut r = Reactor::default();
        let status = status_slot();
        r.post_delay(1, Box::new(|| {}), Some(status.clone()));
        assert_eq!(r.run(), Status::Ok);
        assert_eq!(status.get(), Status::Ok);
    }

    #[test]
    fn stop_drains_pending_operations_as_stopped() {
        let (rd, _wr) = pipe();
        let mut r = Reactor::default();
        let status = status_slot();
        let delay_status = status_slot();

        r.sched(rd.as_raw_fd(), EventKind::Readable, Box::new(|| {}), Some(status.clone()));
        r.post_delay(60_000, Box::new(|| {}), Some(delay_status.clone()));
        r.state = State::Stopping;

        r.stop_drain();

        assert_eq!(status.get(), Status::Stopped);
        assert_eq!(delay_status.get(), Status::Stopped);
        assert!(r.directory.is_empty());
        assert!(r.poll_vec.is_empty());
        assert!(r.timed_heap.is_empty());
    }
}
