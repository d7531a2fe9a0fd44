//! Grant-table map/copy. The real primitive atomically copies bytes
//! between a guest page (identified by grant reference) and a local
//! buffer; guest memory is never dereferenced directly by the engine.

use std::io;
use std::sync::{Arc, RwLock};

use memmap2::MmapMut;

/// One segment of a batched grant copy: either guest-to-local (`to_local =
/// true`, used for writes) or local-to-guest (`to_local = false`, used for
/// reads).
pub struct GrantCopySegment<'a> {
    pub gref: u32,
    pub guest_offset: usize,
    pub local: &'a mut [u8],
    pub len: usize,
    pub to_local: bool,
}

/// Map/copy grant references. `map` is called once at connect time for the
/// shared ring pages; `copy` is called per-request for data segments.
pub trait GrantTable: Send + Sync {
    /// Map `refs` read-write and return a pointer to the mapped region
    /// (`nr_ring_ref` contiguous pages).
    fn map(&self, refs: &[u32]) -> io::Result<*mut u8>;

    /// Unmap a region previously returned by `map`.
    ///
    /// # Safety
    /// `ptr`/`len` must be exactly a previous `map` return value and its
    /// page count; the region must not be accessed afterward.
    unsafe fn unmap(&self, ptr: *mut u8, pages: usize) -> io::Result<()>;

    /// Batched grant copy, all segments in one hypercall-equivalent.
    fn copy(&self, segs: &mut [GrantCopySegment<'_>]) -> io::Result<()>;

    /// Advisory cap on how many grant references this device may hold
    /// mapped/copied concurrently (ring pages + one per inflight segment).
    fn set_max_grant_refs(&self, count: usize);
}

/// Test/reference implementation: "guest memory" is one flat
/// `memmap2`-backed region, and a "grant reference" is just a page index
/// into it. This is the natural desugaring once the Xen hypercall layer is
/// removed, and mirrors how the pack's vhost-user sibling treats
/// `GuestMemoryMmap` as one mapped region addressed by offset.
pub struct MmapGrantTable {
    guest: Arc<RwLock<MmapMut>>,
    page_size: usize,
}

impl MmapGrantTable {
    pub fn new(guest_pages: usize, page_size: usize) -> io::Result<Self> {
        let mmap = MmapMut::map_anon(guest_pages * page_size)?;
        Ok(MmapGrantTable {
            guest: Arc::new(RwLock::new(mmap)),
            page_size,
        })
    }

    /// Direct access for tests that want to seed/inspect "guest memory"
    /// without going through a grant copy.
    pub fn with_guest_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.guest.write().unwrap();
        f(&mut guard[..])
    }
}

impl GrantTable for MmapGrantTable {
    fn map(&self, refs: &[u32]) -> io::Result<*mut u8> {
        let guard = self.guest.read().unwrap();
        let base = refs
            .first()
            .copied()
            .unwrap_or(0) as usize
            * self.page_size;
        if base + refs.len() * self.page_size > guard.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "grant ref out of range"));
        }
        // SAFETY: caller owns the returned pointer for exactly the
        // lifetime documented on `unmap`; the backing mmap outlives it via
        // the Arc held by `self`.
        Ok(unsafe { guard.as_ptr().add(base) as *mut u8 })
    }

    unsafe fn unmap(&self, _ptr: *mut u8, _pages: usize) -> io::Result<()> {
        // Nothing to do: the pointer is a view into the shared mmap, not a
        // separate mapping.
        Ok(())
    }

    fn copy(&self, segs: &mut [GrantCopySegment<'_>]) -> io::Result<()> {
        let mut guard = self.guest.write().unwrap();
        for seg in segs.iter_mut() {
            let gref_base = seg.gref as usize * self.page_size;
            let start = gref_base + seg.guest_offset;
            let end = start + seg.len;
            if end > guard.len() || seg.len > seg.local.len() {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "grant copy out of range"));
            }
            if seg.to_local {
                seg.local[..seg.len].copy_from_slice(&guard[start..end]);
            } else {
                guard[start..end].copy_from_slice(&seg.local[..seg.len]);
            }
        }
        Ok(())
    }

    fn set_max_grant_refs(&self, _count: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_round_trips_into_and_out_of_guest_memory() {
        let table = MmapGrantTable::new(4, 4096).unwrap();
        let payload = vec![0xABu8; 16];
        let mut local = payload.clone();
        let mut segs = vec![GrantCopySegment {
            gref: 1,
            guest_offset: 0,
            local: &mut local,
            len: 16,
            to_local: false,
        }];
        table.copy(&mut segs).unwrap();

        let mut readback = vec![0u8; 16];
        let mut segs = vec![GrantCopySegment {
            gref: 1,
            guest_offset: 0,
            local: &mut readback,
            len: 16,
            to_local: true,
        }];
        table.copy(&mut segs).unwrap();
        assert_eq!(readback, payload);
    }
}
