//! Chunked IN transfers
//!
//! A [`Transfer`] tracks one endpoint's outgoing data. It splits the data into
//! packets no larger than the endpoint's capacity, and it advances only when
//! the peripheral reports that the previous packet was acknowledged. The
//! transfer never touches hardware; it tells the caller what to load next.
//!
//! Data endpoint transfers always end with one zero-length packet when the
//! completion handler doesn't queue another transfer. If the handler does
//! queue a transfer, and the finished transfer was an exact multiple of the
//! packet size, a zero-length packet still goes out before the queued data
//! so that the host sees the end of the first transfer.
//!
//! Control transfers follow the standard rule instead: a zero-length packet
//! only when the data is a multiple of the packet size and shorter than the
//! host asked for.

/// Where a transfer's bytes come from
#[derive(Clone, Copy, Debug)]
pub enum Source<'a> {
    /// Caller memory that outlives the transfer
    Borrowed(&'a [u8]),
    /// The control endpoint's staging buffer
    Staged,
    /// Already copied into packet memory
    Loaded,
}

/// When a transfer ends with a zero-length packet
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Termination {
    /// After every transfer that isn't followed by another
    Always,
    /// When needed to end a control read of `requested` bytes
    Control { requested: u16 },
}

/// What to do with the endpoint's transmit buffer
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Step {
    /// Load `len` bytes, starting at `offset` of the source, and send them
    Load { offset: usize, len: usize },
    /// Send a zero-length packet
    Zlp,
    /// The whole transfer of this many bytes was acknowledged
    Complete(usize),
    /// Nothing to send
    Idle,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Idle,
    Sending,
    /// Last packet acknowledged, waiting for `finish`
    Completing,
    /// Trailing zero-length packet in flight
    Flushing,
}

#[derive(Clone, Copy, Debug)]
struct Queued<'a> {
    source: Source<'a>,
    total: usize,
}

/// An endpoint's transmit progress
pub struct Transfer<'a> {
    source: Source<'a>,
    total: usize,
    sent: usize,
    phase: Phase,
    termination: Termination,
    queued: Option<Queued<'a>>,
}

impl<'a> Transfer<'a> {
    pub const fn new(termination: Termination) -> Self {
        Transfer {
            source: Source::Loaded,
            total: 0,
            sent: 0,
            phase: Phase::Idle,
            termination,
            queued: None,
        }
    }

    /// The source of the transfer that's currently sending
    pub fn source(&self) -> Source<'a> {
        self.source
    }

    /// Starts sending `total` bytes from `source`
    ///
    /// If the previous transfer is finishing, the new transfer waits behind it,
    /// and this returns `Step::Idle`. Otherwise, any progress of the previous
    /// transfer is forgotten.
    pub fn begin(&mut self, source: Source<'a>, total: usize, capacity: usize) -> Step {
        match self.phase {
            Phase::Completing | Phase::Flushing => {
                self.queued = Some(Queued { source, total });
                Step::Idle
            }
            Phase::Idle | Phase::Sending => self.start(Queued { source, total }, capacity),
        }
    }

    fn start(&mut self, queued: Queued<'a>, capacity: usize) -> Step {
        self.source = queued.source;
        self.total = queued.total;
        self.sent = 0;
        self.phase = Phase::Sending;
        self.next_packet(capacity)
    }

    fn next_packet(&mut self, capacity: usize) -> Step {
        let offset = self.sent;
        let len = capacity.min(self.total - self.sent);
        self.sent += len;
        Step::Load { offset, len }
    }

    /// Advances after the peripheral reports a sent packet
    pub fn acknowledge(&mut self, capacity: usize) -> Step {
        match self.phase {
            Phase::Sending if self.sent < self.total => self.next_packet(capacity),
            Phase::Sending => {
                self.phase = Phase::Completing;
                Step::Complete(self.total)
            }
            Phase::Flushing => match self.queued.take() {
                Some(queued) => self.start(queued, capacity),
                None => {
                    self.phase = Phase::Idle;
                    Step::Idle
                }
            },
            Phase::Idle | Phase::Completing => Step::Idle,
        }
    }

    /// Decides what follows a completed transfer
    ///
    /// Call once the completion is handled, and after any transfer the handler
    /// queued with [`begin`](Self::begin).
    pub fn finish(&mut self, capacity: usize) -> Step {
        if self.phase != Phase::Completing {
            return Step::Idle;
        }
        let boundary = self.total != 0 && self.total % capacity == 0;
        match (self.termination, self.queued.take()) {
            (Termination::Always, Some(queued)) if !boundary => self.start(queued, capacity),
            (Termination::Always, queued) => {
                self.queued = queued;
                self.phase = Phase::Flushing;
                Step::Zlp
            }
            (Termination::Control { requested }, _) if boundary && self.total < requested as usize => {
                self.phase = Phase::Flushing;
                Step::Zlp
            }
            (Termination::Control { .. }, _) => {
                self.phase = Phase::Idle;
                Step::Idle
            }
        }
    }

    /// Returns `true` while data is sending, or waiting to send
    pub fn is_pending(&self) -> bool {
        self.phase == Phase::Sending || self.queued.is_some()
    }

    /// Forgets all progress and anything queued
    pub fn cancel(&mut self) {
        self.phase = Phase::Idle;
        self.queued = None;
        self.total = 0;
        self.sent = 0;
    }
}
