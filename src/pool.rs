//! Request pool (C3): owns `ioreq` objects on free/inflight lists and
//! recycles them. per SPEC_FULL.md §9, the original's intrusive
//! doubly-linked lists are a detail, so this implementation uses an arena
//! of slots indexed by `u32`, with two intrusive next-indices, so there is
//! no allocation in the hot path and no pointer aliasing across ownership
//! boundaries.

use crate::ioreq::IoReq;

const NIL: u32 = u32::MAX;

/// Which list a slot is on, and (for `Inflight`) whether `finish()` has
/// already removed it from the inflight list and decremented
/// `requests_inflight`. Tracked explicitly rather than inferred from
/// freelist membership: a slot that was `acquire()`d but never `finish()`ed
/// (the parse-rejected path) and one that was `finish()`ed are both "not on
/// the freelist", but only the former still owes `release()` an inflight
/// decrement.
#[derive(Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Inflight,
    Finished,
}

struct Slot {
    req: IoReq,
    /// Next index on whichever list currently owns this slot, or `NIL`.
    next: u32,
    state: SlotState,
}

/// Arena-backed free/inflight list pair. `max_requests` is fixed at
/// construction (set once the wire protocol and ring size are known at
/// connect time) and never changes afterward.
pub struct RequestPool {
    slots: Vec<Slot>,
    free_head: u32,
    inflight_head: u32,
    max_requests: u32,
    requests_total: u32,
    requests_inflight: u32,
}

impl RequestPool {
    pub fn new(max_requests: u32) -> Self {
        RequestPool {
            slots: Vec::new(),
            free_head: NIL,
            inflight_head: NIL,
            max_requests,
            requests_total: 0,
            requests_inflight: 0,
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn requests_total(&self) -> u32 {
        self.requests_total
    }

    pub fn requests_inflight(&self) -> u32 {
        self.requests_inflight
    }

    /// Return the head of the freelist, or allocate a new slot iff
    /// `requests_total < max_requests`. `None` means backpressure: the
    /// caller sets `more_work` and stops dequeuing for this pass.
    pub fn acquire(&mut self) -> Option<u32> {
        let idx = if self.free_head != NIL {
            let idx = self.free_head;
            self.free_head = self.slots[idx as usize].next;
            idx
        } else if self.requests_total < self.max_requests {
            let idx = self.slots.len() as u32;
            self.slots.push(Slot {
                req: IoReq::new(idx),
                next: NIL,
                state: SlotState::Free,
            });
            self.requests_total += 1;
            idx
        } else {
            return None;
        };

        let slot = &mut self.slots[idx as usize];
        slot.state = SlotState::Inflight;
        slot.next = self.inflight_head;
        self.inflight_head = idx;
        self.requests_inflight += 1;
        Some(idx)
    }

    pub fn get(&self, idx: u32) -> &IoReq {
        &self.slots[idx as usize].req
    }

    pub fn get_mut(&mut self, idx: u32) -> &mut IoReq {
        &mut self.slots[idx as usize].req
    }

    /// Move a slot out of the inflight list only; the pool entry stays
    /// pinned until `release`. Used once the response has been produced
    /// but before the caller is done touching the slot's bounce buffer.
    /// The only place `requests_inflight` is decremented: `release()`
    /// must not repeat it for a slot that passed through here.
    pub fn finish(&mut self, idx: u32) {
        debug_assert!(
            self.slots[idx as usize].state == SlotState::Inflight,
            "finish() called on a slot that is not inflight"
        );
        self.remove_from_inflight(idx);
        self.slots[idx as usize].state = SlotState::Finished;
        self.requests_inflight -= 1;
    }

    /// Reset scalars and push the slot back onto the freelist head. May be
    /// called either after `finish` or directly (parse-rejected requests
    /// never go through `finish`, since they never left the dequeue loop's
    /// bookkeeping as genuinely "inflight" I/O): `release()` only removes
    /// the slot from the inflight list and decrements `requests_inflight`
    /// itself when `finish()` has not already done so.
    pub fn release(&mut self, idx: u32) {
        match self.slots[idx as usize].state {
            SlotState::Free => {
                debug_assert!(false, "release() called on a slot that is already free");
            }
            SlotState::Inflight => {
                self.remove_from_inflight(idx);
                self.requests_inflight -= 1;
            }
            SlotState::Finished => {}
        }
        self.slots[idx as usize].req.reset();
        self.slots[idx as usize].state = SlotState::Free;
        self.slots[idx as usize].next = self.free_head;
        self.free_head = idx;
    }

    fn remove_from_inflight(&mut self, idx: u32) {
        if self.inflight_head == idx {
            self.inflight_head = self.slots[idx as usize].next;
            return;
        }
        let mut cur = self.inflight_head;
        while cur != NIL {
            let next = self.slots[cur as usize].next;
            if next == idx {
                self.slots[cur as usize].next = self.slots[idx as usize].next;
                return;
            }
            cur = next;
        }
    }

    /// Walk the freelist, dropping per-request buffers (done implicitly by
    /// `Vec`'s `Drop`). panics if any request is still inflight: freeing
    /// a device with inflight requests is a programming error per
    /// SPEC_FULL.md §4.4.
    pub fn destroy_all(&mut self) {
        assert_eq!(
            self.requests_inflight, 0,
            "destroy_all called with {} requests still inflight",
            self.requests_inflight
        );
        self.slots.clear();
        self.free_head = NIL;
        self.inflight_head = NIL;
        self.requests_total = 0;
    }

    #[cfg(test)]
    pub fn inflight_count_via_walk(&self) -> usize {
        let mut n = 0;
        let mut cur = self.inflight_head;
        while cur != NIL {
            n += 1;
            cur = self.slots[cur as usize].next;
        }
        n
    }
}
