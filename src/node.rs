//! Per-descriptor storage: one node per registered file descriptor, with
//! up to three pending operations (read, write, exceptional).

use std::cell::Cell;
use std::rc::Rc;

use crate::error::Status;
use crate::mask::EventKind;

/// A completion callback. Replaces the C `(callback, ctx)` pair: context
/// that used to live behind a `void *` is captured by the closure
/// instead.
pub type Handler = Box<dyn FnMut()>;

/// A status cell shared between the reactor and the caller that scheduled
/// the operation. The reactor writes into it immediately before invoking
/// the handler; the handler reads it to learn how the operation finished.
pub type StatusSlot = Rc<Cell<Status>>;

/// A "milliseconds remaining" cell, written for timed operations that
/// complete before their deadline.
pub type RemainingSlot = Rc<Cell<i64>>;

pub fn status_slot() -> StatusSlot {
    Rc::new(Cell::new(Status::InProgress))
}

pub fn remaining_slot() -> RemainingSlot {
    Rc::new(Cell::new(0))
}

/// Back-index into the timed-event heap, shared between the
/// [`EventRecord`] and the heap entry itself so the heap's swap hook can
/// keep it current without looking anything up through a directory.
pub type HeapIndex = Rc<Cell<usize>>;

/// A single pending operation: its handler, an optional status
/// out-parameter, and (if scheduled with a timeout) its index into the
/// timed-event heap.
#[derive(Default)]
pub struct EventRecord {
    pub handler: Option<Handler>,
    pub status: Option<StatusSlot>,
    pub remaining: Option<RemainingSlot>,
    pub heap_index: Option<HeapIndex>,
}

impl EventRecord {
    pub fn is_vacant(&self) -> bool {
        self.handler.is_none()
    }

    pub fn fill(
        &mut self,
        handler: Handler,
        status: Option<StatusSlot>,
        remaining: Option<RemainingSlot>,
    ) {
        self.handler = Some(handler);
        self.status = status;
        self.remaining = remaining;
        self.heap_index = None;
    }

    /// Clear the record and hand back the handler, for the caller to
    /// invoke once dispatch bookkeeping is done.
    pub fn take(&mut self) -> Option<Handler> {
        self.status = None;
        self.remaining = None;
        self.heap_index = None;
        self.handler.take()
    }
}

/// Which direction currently occupies a node's inline slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RwTag {
    None,
    Read,
    Write,
}

/// Per-descriptor state: its position in the poll vector and up to three
/// pending operations. `inline` always holds whichever of read/write was
/// registered first; `aux` is a lazily allocated slot for the other
/// direction, and `exceptional` a lazily allocated slot for `POLLPRI`
/// interest. `aux`/`exceptional` boxes are retained after use so a
/// descriptor that repeatedly alternates direction doesn't reallocate.
pub struct EventNode {
    pub fd: std::os::unix::io::RawFd,
    pub poll_index: usize,
    pub tag: RwTag,
    pub inline: EventRecord,
    pub aux: Option<Box<EventRecord>>,
    pub exceptional: Option<Box<EventRecord>>,
}

impl EventNode {
    pub fn new(fd: std::os::unix::io::RawFd, poll_index: usize) -> Self {
        EventNode {
            fd,
            poll_index,
            tag: RwTag::None,
            inline: EventRecord::default(),
            aux: None,
            exceptional: None,
        }
    }

    fn rw_tag_of(kind: EventKind) -> Option<RwTag> {
        match kind {
            EventKind::Readable => Some(RwTag::Read),
            EventKind::Writable => Some(RwTag::Write),
            EventKind::Exceptional => None,
        }
    }

    /// Returns the record for `kind` if one is currently occupying a
    /// slot (whether vacant or filled is up to the caller to check).
    pub fn record(&self, kind: EventKind) -> Option<&EventRecord> {
        match kind {
            EventKind::Exceptional => self.exceptional.as_deref(),
            _ => {
                let want = Self::rw_tag_of(kind).unwrap();
                if self.tag == want {
                    Some(&self.inline)
                } else {
                    self.aux.as_deref()
                }
            }
        }
    }

    pub fn record_mut(&mut self, kind: EventKind) -> Option<&mut EventRecord> {
        match kind {
            EventKind::Exceptional => self.exceptional.as_deref_mut(),
            _ => {
                let want = Self::rw_tag_of(kind).unwrap();
                if self.tag == want {
                    Some(&mut self.inline)
                } else {
                    self.aux.as_deref_mut()
                }
            }
        }
    }

    /// Find or allocate the slot for `kind`, following the storage
    /// policy: exceptional reuses/steals/allocates independently; for
    /// read/write, an empty inline slot is claimed outright, a matching
    /// tag reuses inline, and a mismatched tag reuses or allocates `aux`.
    pub fn reserve(&mut self, kind: EventKind) -> &mut EventRecord {
        match kind {
            EventKind::Exceptional => {
                if self.exceptional.is_none() {
                    self.exceptional = Some(Box::new(EventRecord::default()));
                }
                self.exceptional.as_mut().unwrap()
            }
            _ => {
                let want = Self::rw_tag_of(kind).unwrap();
                if self.tag == RwTag::None {
                    self.tag = want;
                    &mut self.inline
                } else if self.tag == want {
                    &mut self.inline
                } else {
                    if self.aux.is_none() {
                        self.aux = Some(Box::new(EventRecord::default()));
                    }
                    self.aux.as_mut().unwrap()
                }
            }
        }
    }

    /// True once neither the inline nor the aux slot holds a pending
    /// read/write operation, at which point `tag` should revert to
    /// `None`.
    pub fn rw_idle(&self) -> bool {
        self.inline.is_vacant() && self.aux.as_ref().map_or(true, |a| a.is_vacant())
    }

    pub fn reset_tag_if_idle(&mut self) {
        if self.rw_idle() {
            self.tag = RwTag::None;
        }
    }

    pub fn is_idle(&self) -> bool {
        self.rw_idle() && self.exceptional.as_ref().map_or(true, |e| e.is_vacant())
    }

    pub fn has_pending(&self, kind: EventKind) -> bool {
        self.record(kind).map_or(false, |r| !r.is_vacant())
    }
}
