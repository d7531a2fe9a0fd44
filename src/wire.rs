//! On-wire request/response layouts for the three protocol variants a
//! frontend may negotiate, and the host-endian forms the rest of the
//! engine operates on.
//!
//! The wire structs exist only to be read out of (or written into) shared
//! ring memory with `ptr::read_unaligned`/`ptr::write_unaligned`; nothing
//! outside `crate::ring` should ever construct one directly.

use std::fmt;

/// Maximum number of `{gref, first_sect, last_sect}` segments a single
/// request can carry. Fixed by the wire protocol, not configurable.
pub const MAX_SEGMENTS_PER_REQUEST: usize = 11;

/// Sectors are always 512 bytes regardless of the backing image's native
/// block size.
pub const SECTOR_SIZE: u64 = 512;

/// Page size assumed for ring pages and bounce buffers.
pub const PAGE_SIZE: usize = 4096;

/// Wire-format tag negotiated at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Native,
    X86_32,
    X86_64,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Native => "native",
            Protocol::X86_32 => "x86_32-abi",
            Protocol::X86_64 => "x86_64-abi",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Protocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "x86_32-abi" => Ok(Protocol::X86_32),
            "x86_64-abi" => Ok(Protocol::X86_64),
            "" | "native" => Ok(Protocol::Native),
            _ => Err(()),
        }
    }
}

/// Accepted request opcodes. Anything else is rejected during parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    FlushDiskCache,
    Discard,
}

impl Operation {
    pub fn from_wire(op: u8) -> Option<Operation> {
        match op {
            0 => Some(Operation::Read),
            1 => Some(Operation::Write),
            3 => Some(Operation::FlushDiskCache),
            5 => Some(Operation::Discard),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Operation::Read => 0,
            Operation::Write => 1,
            Operation::FlushDiskCache => 3,
            Operation::Discard => 5,
        }
    }
}

/// Response status, written verbatim into the response slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlkifStatus {
    Okay,
    Error,
    Unsupported,
}

impl BlkifStatus {
    pub fn to_wire(self) -> i16 {
        match self {
            BlkifStatus::Okay => 0,
            BlkifStatus::Error => -1,
            BlkifStatus::Unsupported => -2,
        }
    }
}

/// One scatter/gather segment as carried on the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireSegment {
    pub gref: u32,
    pub first_sect: u8,
    pub last_sect: u8,
}

/// Host-endian, protocol-independent form of a guest request. This is what
/// `crate::ring` produces and everything above it consumes.
#[derive(Debug, Clone)]
pub struct Request {
    pub operation_raw: u8,
    pub nr_segments: u8,
    pub handle: u16,
    pub id: u64,
    pub sector_number: u64,
    pub seg: [WireSegment; MAX_SEGMENTS_PER_REQUEST],
    /// `struct blkif_request_discard`'s `nr_sectors` field, read by
    /// `crate::ring::get_request` as the raw 8 bytes occupying the slot
    /// where `seg` begins, before the per-protocol segment widening loses
    /// that byte range. Meaningless for any operation other than DISCARD.
    pub discard_nr_sectors_raw: u64,
}

impl Default for Request {
    fn default() -> Self {
        Request {
            operation_raw: 0,
            nr_segments: 0,
            handle: 0,
            id: 0,
            sector_number: 0,
            seg: [WireSegment::default(); MAX_SEGMENTS_PER_REQUEST],
            discard_nr_sectors_raw: 0,
        }
    }
}

impl Request {
    pub fn operation(&self) -> Option<Operation> {
        Operation::from_wire(self.operation_raw)
    }

    /// `struct blkif_request_discard` overlays the common request header
    /// with a genuine 8-byte `nr_sectors` field occupying the space where
    /// `seg` begins; `discard_nr_sectors_raw` is that field's raw bytes,
    /// captured whole by `crate::ring::get_request` (see
    /// `examples/original_source/hw/block/xen_disk.c`'s
    /// `struct blkif_request_discard *req = (void *)&ioreq->req`).
    pub fn discard_nr_sectors(&self) -> u64 {
        self.discard_nr_sectors_raw
    }
}

/// Host-endian response, written back by the engine; the ring descriptor
/// translates it into whichever wire layout is active.
#[derive(Debug, Clone, Copy)]
pub struct Response {
    pub id: u64,
    pub operation: u8,
    pub status: i16,
}

// ---------------------------------------------------------------------
// Wire layouts
// ---------------------------------------------------------------------

/// Native layout: natural alignment, as produced by a same-bitness
/// frontend/backend pair. No explicit packing.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct WireSegmentNative {
    pub gref: u32,
    pub first_sect: u8,
    pub last_sect: u8,
    pub _pad: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RequestNative {
    pub operation: u8,
    pub nr_segments: u8,
    pub handle: u16,
    pub _pad0: u32,
    pub id: u64,
    pub sector_number: u64,
    pub seg: [WireSegmentNative; MAX_SEGMENTS_PER_REQUEST],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ResponseNative {
    pub id: u64,
    pub operation: u8,
    pub status: i16,
}

/// 32-bit legacy layout: a 32-bit frontend talking to this (64-bit)
/// backend. Tightly packed, no implicit alignment padding anywhere.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct WireSegmentX86_32 {
    pub gref: u32,
    pub first_sect: u8,
    pub last_sect: u8,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct RequestX86_32 {
    pub operation: u8,
    pub nr_segments: u8,
    pub handle: u16,
    pub id: u64,
    pub sector_number: u64,
    pub seg: [WireSegmentX86_32; MAX_SEGMENTS_PER_REQUEST],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct ResponseX86_32 {
    pub id: u64,
    pub operation: u8,
    pub status: i16,
}

/// 64-bit legacy layout: differs from native only in that it carries no
/// reserved padding field after `handle` (an artifact of how the compat
/// struct was hand-packed upstream rather than generated from the same
/// definition as native).
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct WireSegmentX86_64 {
    pub gref: u32,
    pub first_sect: u8,
    pub last_sect: u8,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct RequestX86_64 {
    pub operation: u8,
    pub nr_segments: u8,
    pub handle: u16,
    pub id: u64,
    pub sector_number: u64,
    pub seg: [WireSegmentX86_64; MAX_SEGMENTS_PER_REQUEST],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct ResponseX86_64 {
    pub id: u64,
    pub operation: u8,
    pub status: i16,
}

macro_rules! widen_request {
    ($src:expr, $seg_ty:ty) => {{
        let src = $src;
        let mut dst = Request {
            operation_raw: src.operation,
            nr_segments: src.nr_segments,
            handle: src.handle,
            id: src.id,
            sector_number: src.sector_number,
            seg: [WireSegment::default(); MAX_SEGMENTS_PER_REQUEST],
            discard_nr_sectors_raw: 0,
        };
        for (d, s) in dst.seg.iter_mut().zip(src.seg.iter()) {
            *d = WireSegment {
                gref: s.gref,
                first_sect: s.first_sect,
                last_sect: s.last_sect,
            };
        }
        dst
    }};
}

impl From<RequestNative> for Request {
    fn from(src: RequestNative) -> Request {
        widen_request!(src, WireSegmentNative)
    }
}

impl From<RequestX86_32> for Request {
    fn from(src: RequestX86_32) -> Request {
        widen_request!(src, WireSegmentX86_32)
    }
}

impl From<RequestX86_64> for Request {
    fn from(src: RequestX86_64) -> Request {
        widen_request!(src, WireSegmentX86_64)
    }
}

impl From<Response> for ResponseNative {
    fn from(r: Response) -> Self {
        ResponseNative {
            id: r.id,
            operation: r.operation,
            status: r.status,
        }
    }
}

impl From<Response> for ResponseX86_32 {
    fn from(r: Response) -> Self {
        ResponseX86_32 {
            id: r.id,
            operation: r.operation,
            status: r.status,
        }
    }
}

impl From<Response> for ResponseX86_64 {
    fn from(r: Response) -> Self {
        ResponseX86_64 {
            id: r.id,
            operation: r.operation,
            status: r.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_response_round_trips_fields() {
        let r = Response { id: 42, operation: Operation::Read.to_wire(), status: BlkifStatus::Okay.to_wire() };
        let wire: ResponseNative = r.into();
        assert_eq!(wire.id, 42);
        assert_eq!(wire.operation, 0);
        assert_eq!(wire.status, 0);
    }

    #[test]
    fn widen_preserves_segment_bounds() {
        let mut native = RequestX86_32 {
            operation: Operation::Write.to_wire(),
            nr_segments: 1,
            handle: 0,
            id: 7,
            sector_number: 100,
            seg: [WireSegmentX86_32 { gref: 0, first_sect: 0, last_sect: 0 }; MAX_SEGMENTS_PER_REQUEST],
        };
        native.seg[0] = WireSegmentX86_32 { gref: 9, first_sect: 2, last_sect: 3 };
        let widened: Request = native.into();
        assert_eq!(widened.id, 7);
        assert_eq!(widened.seg[0].gref, 9);
        assert_eq!(widened.seg[0].first_sect, 2);
        assert_eq!(widened.seg[0].last_sect, 3);
    }
}
