//! Ring descriptor (C2): a polymorphic view over the shared ring in one of
//! three wire layouts, per SPEC_FULL.md §9 ("the three wire layouts map
//! naturally onto a tagged sum with a single trait/interface"). avoids a
//! virtual-pointer-per-field soup by parameterizing the engine on the
//! layout chosen once, at connect time.
//!
//! Ring memory layout mirrors the real `blkif_sring_t`: a small header of
//! atomically-updated producer/consumer indices (the only fields the
//! frontend and this backend both write), followed by a flat array of
//! entries where request and response share the same storage slot (the
//! frontend never reads a slot back after submitting it; the backend
//! never reads a slot after producing a response into it).

use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering, compiler_fence, fence};

use crate::wire::{
    Request, RequestNative, RequestX86_32, RequestX86_64, Response, ResponseNative,
    ResponseX86_32, ResponseX86_64,
};

/// The only part of ring memory both sides touch concurrently.
#[repr(C)]
pub struct SringHeader {
    pub req_prod: AtomicU32,
    pub req_event: AtomicU32,
    pub rsp_prod: AtomicU32,
    pub rsp_event: AtomicU32,
    _reserved: [u8; 48],
}

impl SringHeader {
    pub const SIZE: usize = std::mem::size_of::<SringHeader>();
}

/// Operations the engine needs, independent of wire layout.
pub trait BackRing {
    /// Backend-private consumer index (not shared memory).
    fn req_cons(&self) -> u32;

    /// Read the request at `cons_idx` into host-endian form. The caller
    /// must have already issued an acquire fence after reading
    /// `sring.req_prod` before calling this for the first time in a batch
    /// (SPEC_FULL.md §5); this function itself inserts the mandatory
    /// compiler fence immediately after the copy so later reads cannot be
    /// reordered back onto shared memory.
    fn get_request(&mut self, cons_idx: u32) -> Request;

    fn advance_req_cons(&mut self, new_rc: u32);

    /// Write `resp` into the slot at the engine's private response
    /// producer index and advance it. Does not publish or notify.
    fn put_response(&mut self, resp: Response);

    /// Combined publish (release fence) + notify-check, matching
    /// `RING_PUSH_RESPONSES_AND_CHECK_NOTIFY`.
    fn push_responses_and_check_notify(&mut self) -> bool;

    fn has_unconsumed_requests(&self) -> bool;

    /// `RING_FINAL_CHECK_FOR_REQUESTS`: re-checks for requests that slipped
    /// in between the last `has_unconsumed_requests` check and now.
    fn final_check_for_requests(&mut self) -> bool;

    /// true if consuming up to `rc` would read past what the ring's
    /// capacity allows, the overflow check in SPEC_FULL.md §4.3.
    fn request_cons_overflow(&self, rc: u32) -> bool;

    fn rsp_prod_pvt(&self) -> u32;

    fn nr_ents(&self) -> u32;

    /// Snapshot the shared producer index with the mandated acquire fence.
    fn snapshot_req_prod(&self) -> u32;
}

fn round_down_to_power_of_two(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    1 << (usize::BITS - 1 - n.leading_zeros())
}

macro_rules! define_back_ring {
    ($name:ident, $req_wire:ty, $rsp_wire:ty) => {
        pub struct $name {
            base: *mut u8,
            nr_ents: u32,
            req_cons: u32,
            rsp_prod_pvt: u32,
        }

        // SAFETY: `base` points at memory the engine owns exclusive
        // single-threaded access to while this device's deferred-work
        // item is running; the struct itself is never shared across
        // threads.
        unsafe impl Send for $name {}

        impl $name {
            const ENTRY_SIZE: usize = {
                let r = std::mem::size_of::<$req_wire>();
                let s = std::mem::size_of::<$rsp_wire>();
                if r > s { r } else { s }
            };

            /// Byte offset of `seg` within the wire request struct: the
            /// point at which `struct blkif_request_discard` overlays its
            /// own genuine 8-byte `nr_sectors` field. `pub` so tests
            /// outside this module can poke a discard's `nr_sectors`
            /// directly onto a wire request they've constructed.
            pub const SEG_OFFSET: usize = std::mem::offset_of!($req_wire, seg);

            /// `base` must point at `nr_ents * Self::ENTRY_SIZE +
            /// SringHeader::SIZE` bytes of mapped, writable memory that
            /// outlives this struct.
            pub fn new(base: *mut u8, nr_ents: u32) -> Self {
                $name {
                    base,
                    nr_ents,
                    req_cons: 0,
                    rsp_prod_pvt: 0,
                }
            }

            fn header(&self) -> &SringHeader {
                // SAFETY: see `new`'s contract.
                unsafe { &*(self.base as *const SringHeader) }
            }

            fn entry_ptr(&self, idx: u32) -> *mut u8 {
                let slot = (idx & (self.nr_ents - 1)) as usize;
                // SAFETY: see `new`'s contract; `slot < nr_ents`.
                unsafe {
                    self.base
                        .add(SringHeader::SIZE)
                        .add(slot * Self::ENTRY_SIZE)
                }
            }

            /// Ring capacity for `page_count` pages of `page_size` bytes,
            /// rounded down to the ring's power-of-two convention
            /// (mirrors `__CONST_RING_SIZE`).
            pub fn ring_size_for(page_count: u32, page_size: usize) -> u32 {
                let bytes = page_count as usize * page_size - SringHeader::SIZE;
                round_down_to_power_of_two(bytes / Self::ENTRY_SIZE) as u32
            }
        }

        impl BackRing for $name {
            fn req_cons(&self) -> u32 {
                self.req_cons
            }

            fn get_request(&mut self, cons_idx: u32) -> Request {
                let ptr = self.entry_ptr(cons_idx) as *const $req_wire;
                // SAFETY: `ptr` is within the mapped ring and properly
                // sized; the wire struct has no padding-sensitive
                // invariants (all-bits-valid).
                let wire: $req_wire = unsafe { ptr::read_unaligned(ptr) };
                // `struct blkif_request_discard`'s `nr_sectors` occupies
                // these same 8 bytes as a genuine u64, not two narrowed
                // fields recombined after widening; grab it here while the
                // raw bytes are still addressable.
                let discard_nr_sectors_raw = unsafe {
                    ptr::read_unaligned((ptr as *const u8).add(Self::SEG_OFFSET) as *const u64)
                };
                // Prevent the compiler from accessing the on-ring fields
                // instead of this local copy for any subsequent reads.
                compiler_fence(Ordering::SeqCst);
                let mut req: Request = wire.into();
                req.discard_nr_sectors_raw = discard_nr_sectors_raw;
                req
            }

            fn advance_req_cons(&mut self, new_rc: u32) {
                self.req_cons = new_rc;
            }

            fn put_response(&mut self, resp: Response) {
                let wire: $rsp_wire = resp.into();
                let ptr = self.entry_ptr(self.rsp_prod_pvt) as *mut $rsp_wire;
                // SAFETY: see `new`'s contract.
                unsafe { ptr::write_unaligned(ptr, wire) };
                self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);
            }

            fn push_responses_and_check_notify(&mut self) -> bool {
                let old = self.header().rsp_prod.load(Ordering::Relaxed);
                let new = self.rsp_prod_pvt;
                // Release fence: publish the response bytes before the
                // producer index that makes them visible to the peer.
                fence(Ordering::Release);
                self.header().rsp_prod.store(new, Ordering::Relaxed);
                fence(Ordering::SeqCst);
                let rsp_event = self.header().rsp_event.load(Ordering::Relaxed);
                new.wrapping_sub(rsp_event) < new.wrapping_sub(old)
            }

            fn has_unconsumed_requests(&self) -> bool {
                let req_prod = self.header().req_prod.load(Ordering::Acquire);
                req_prod != self.req_cons
            }

            fn final_check_for_requests(&mut self) -> bool {
                if self.has_unconsumed_requests() {
                    return true;
                }
                self.header()
                    .req_event
                    .store(self.req_cons.wrapping_add(1), Ordering::Relaxed);
                fence(Ordering::SeqCst);
                self.has_unconsumed_requests()
            }

            fn request_cons_overflow(&self, rc: u32) -> bool {
                let req_prod = self.header().req_prod.load(Ordering::Relaxed);
                req_prod.wrapping_sub(rc) > self.nr_ents
            }

            fn rsp_prod_pvt(&self) -> u32 {
                self.rsp_prod_pvt
            }

            fn nr_ents(&self) -> u32 {
                self.nr_ents
            }

            fn snapshot_req_prod(&self) -> u32 {
                let rp = self.header().req_prod.load(Ordering::Relaxed);
                // Ensure we see queued requests up to `rp` before reading
                // any request body.
                fence(Ordering::Acquire);
                rp
            }
        }
    };
}

define_back_ring!(NativeBackRing, RequestNative, ResponseNative);
define_back_ring!(X86_32BackRing, RequestX86_32, ResponseX86_32);
define_back_ring!(X86_64BackRing, RequestX86_64, ResponseX86_64);

/// Tagged sum over the three layouts, selected once at connect time.
pub enum AnyBackRing {
    Native(NativeBackRing),
    X86_32(X86_32BackRing),
    X86_64(X86_64BackRing),
}

macro_rules! delegate {
    ($self:expr, $method:ident $(, $arg:expr)*) => {
        match $self {
            AnyBackRing::Native(r) => r.$method($($arg),*),
            AnyBackRing::X86_32(r) => r.$method($($arg),*),
            AnyBackRing::X86_64(r) => r.$method($($arg),*),
        }
    };
}

impl BackRing for AnyBackRing {
    fn req_cons(&self) -> u32 {
        delegate!(self, req_cons)
    }
    fn get_request(&mut self, cons_idx: u32) -> Request {
        delegate!(self, get_request, cons_idx)
    }
    fn advance_req_cons(&mut self, new_rc: u32) {
        delegate!(self, advance_req_cons, new_rc)
    }
    fn put_response(&mut self, resp: Response) {
        delegate!(self, put_response, resp)
    }
    fn push_responses_and_check_notify(&mut self) -> bool {
        delegate!(self, push_responses_and_check_notify)
    }
    fn has_unconsumed_requests(&self) -> bool {
        delegate!(self, has_unconsumed_requests)
    }
    fn final_check_for_requests(&mut self) -> bool {
        delegate!(self, final_check_for_requests)
    }
    fn request_cons_overflow(&self, rc: u32) -> bool {
        delegate!(self, request_cons_overflow, rc)
    }
    fn rsp_prod_pvt(&self) -> u32 {
        delegate!(self, rsp_prod_pvt)
    }
    fn nr_ents(&self) -> u32 {
        delegate!(self, nr_ents)
    }
    fn snapshot_req_prod(&self) -> u32 {
        delegate!(self, snapshot_req_prod)
    }
}
