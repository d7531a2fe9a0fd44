//! `ioreq`: one in-flight (or free) guest I/O request, per SPEC_FULL.md §3.

use smallvec::SmallVec;

use crate::wire::{BlkifStatus, MAX_SEGMENTS_PER_REQUEST, PAGE_SIZE, Request};

/// One scatter/gather entry derived from parsing: a byte range within the
/// request's bounce buffer, plus the grant reference it was (or will be)
/// copied to/from.
#[derive(Debug, Clone, Copy, Default)]
pub struct SgEntry {
    pub gref: u32,
    /// Offset of this segment's data within the guest page identified by
    /// `gref` (`first_sect * SECTOR_SIZE`).
    pub guest_offset: usize,
    /// Offset of this segment's bounce-buffer slot within `IoReq::pages`
    /// (always `index * PAGE_SIZE`, so pages never share a cache line with
    /// a neighboring segment's partial write).
    pub bounce_offset: usize,
    pub len: usize,
}

/// Explicit state machine for the presync ratchet (SPEC_FULL.md §9,
/// replacing the original's synthetic zero-ret completion callback).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresyncState {
    #[default]
    Idle,
    FlushInflight,
    DataInflight,
    Done,
}

/// A pool slot. Lives for the lifetime of the pool; `reset` clears
/// scalars between uses but never shrinks `pages`/`sg`.
pub struct IoReq {
    pub req: Request,
    pub status: BlkifStatus,

    pub start: u64,
    pub sg: SmallVec<[SgEntry; MAX_SEGMENTS_PER_REQUEST]>,
    pub presync: PresyncState,
    /// Set during parse: true for a FLUSH_DISKCACHE that also carries data
    /// segments (flush-then-write). Pure flushes and non-flush ops never
    /// drive the presync ratchet in `on_complete`.
    pub presync_needed: bool,

    /// Owned bounce-buffer area, `MAX_SEGMENTS_PER_REQUEST * PAGE_SIZE`
    /// bytes, allocated once and reused for the slot's lifetime.
    pub pages: Vec<u8>,

    pub aio_inflight: u32,
    pub aio_errors: u32,

    /// Accounting cookie, opaque to the engine; carries the operation
    /// class used for "done"/"failed"/"invalid" bookkeeping.
    pub acct: Option<AcctClass>,

    /// Index of this slot in `RequestPool`'s arena. Constant for the
    /// slot's lifetime; used by the intrusive freelist/inflight lists.
    pub slot: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcctClass {
    Read,
    Write,
    Flush,
}

impl IoReq {
    pub(crate) fn new(slot: u32) -> Self {
        IoReq {
            req: Request::default(),
            status: BlkifStatus::Okay,
            start: 0,
            sg: SmallVec::new(),
            presync: PresyncState::default(),
            presync_needed: false,
            pages: vec![0u8; MAX_SEGMENTS_PER_REQUEST * PAGE_SIZE],
            aio_inflight: 0,
            aio_errors: 0,
            acct: None,
            slot,
        }
    }

    /// Reset all state except the preallocated bounce region and its
    /// capacity, matching `ioreq_reset` in the original.
    pub(crate) fn reset(&mut self) {
        self.req = Request::default();
        self.status = BlkifStatus::Okay;
        self.start = 0;
        self.sg.clear();
        self.presync = PresyncState::Idle;
        self.presync_needed = false;
        self.aio_inflight = 0;
        self.aio_errors = 0;
        self.acct = None;
        // `pages` is intentionally left untouched: stale bytes in an
        // unused bounce slot are never read before being overwritten by
        // the next grant copy.
    }

    pub fn total_len(&self) -> usize {
        self.sg.iter().map(|s| s.len).sum()
    }
}
