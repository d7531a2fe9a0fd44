//! Device lifecycle (C5): `ALLOC -> init -> INITED -> connect -> CONNECTED
//! -> disconnect -> INITED -> free -> ⊥`, per SPEC_FULL.md §4.4.

use std::io;
use std::sync::Arc;

use log::{info, warn};

use crate::error::{ConfigError, DeviceError};
use crate::pool::RequestPool;
use crate::ring::{AnyBackRing, BackRing, NativeBackRing, X86_32BackRing, X86_64BackRing};
use crate::transport::{EventChannel, GrantTable, XenStore};
use crate::wire::{PAGE_SIZE, Protocol};

pub const MAX_RING_PAGE_ORDER: u32 = 4;
pub const IO_PLUG_THRESHOLD: u32 = 1;
pub const MAX_DISCARD_BYTES: u64 = 32 * 1024 * 1024;
const SECTOR_SIZE: u64 = crate::wire::SECTOR_SIZE;

const VDISK_READONLY: u32 = 1 << 0;
const VDISK_CDROM: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Disk,
    Cdrom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Alloc,
    Inited,
    Connected,
}

pub struct Device {
    pub num: u32,
    pub state: DeviceState,

    pub kind: DeviceKind,
    pub writable: bool,
    pub direct_io_safe: bool,
    pub discard_enabled: bool,

    pub params: String,
    pub fileproto: String,
    pub filename: String,
    pub devtype: Option<String>,

    pub protocol: Protocol,
    pub ring_refs: Vec<u32>,
    pub remote_event_channel: u32,

    pub sector_size: u64,
    pub sectors: u64,

    pub errcount: u32,
    pub more_work: bool,

    pub pool: RequestPool,
    pub ring: Option<AnyBackRing>,
    pub grant_table: Option<Arc<dyn GrantTable>>,
    pub evtchn: Option<Box<dyn EventChannel>>,
    pub block: Option<Arc<dyn crate::block_backend::BlockBackend>>,
    ring_base_ptr: Option<usize>,
    nr_ring_pages: u32,
}

impl Device {
    /// `alloc`: initialize empty free/inflight lists (and everything
    /// else to its zero state). Every device starts here.
    pub fn alloc(num: u32) -> Self {
        Device {
            num,
            state: DeviceState::Alloc,
            kind: DeviceKind::Disk,
            writable: false,
            direct_io_safe: false,
            discard_enabled: false,
            params: String::new(),
            fileproto: String::new(),
            filename: String::new(),
            devtype: None,
            protocol: Protocol::Native,
            ring_refs: Vec::new(),
            remote_event_channel: 0,
            sector_size: SECTOR_SIZE,
            sectors: 0,
            errcount: 0,
            more_work: false,
            pool: RequestPool::new(0),
            ring: None,
            grant_table: None,
            evtchn: None,
            block: None,
            ring_base_ptr: None,
            nr_ring_pages: 0,
        }
    }

    /// `init`: read configuration keys, publish capability flags. on
    /// failure nothing partial is committed, the device stays `Alloc`.
    pub fn init(&mut self, store: &dyn XenStore) -> Result<(), ConfigError> {
        assert_eq!(self.state, DeviceState::Alloc, "init() called out of order");

        let params = store.read("params").ok_or(ConfigError::MissingKey("params"))?;
        let mode = store.read("mode").ok_or(ConfigError::MissingKey("mode"))?;
        let _typ = store.read("type").ok_or(ConfigError::MissingKey("type"))?;
        let _dev = store.read("dev").ok_or(ConfigError::MissingKey("dev"))?;

        let devtype = store.read("device-type");
        let direct_io_safe = store
            .read("direct-io-safe")
            .map(|v| v != "0" && !v.is_empty())
            .unwrap_or(false);

        let (fileproto, filename) = split_params(&params);
        let fileproto = alias_fileproto(fileproto);

        let writable = mode == "w";
        let kind = match devtype.as_deref() {
            Some("cdrom") => DeviceKind::Cdrom,
            _ => DeviceKind::Disk,
        };

        // default true, overridden by an explicit "discard-enable" value
        let discard_enabled = store
            .read("discard-enable")
            .map(|v| v != "0")
            .unwrap_or(true);

        // Everything validated; commit.
        self.params = params;
        self.fileproto = fileproto.to_string();
        self.filename = filename.to_string();
        self.devtype = devtype;
        self.direct_io_safe = direct_io_safe;
        self.writable = writable;
        self.kind = kind;
        self.discard_enabled = discard_enabled;

        let mut info = 0u32;
        if !self.writable {
            info |= VDISK_READONLY;
        }
        if self.kind == DeviceKind::Cdrom {
            info |= VDISK_CDROM;
        }

        store.write("feature-flush-cache", "1".to_string());
        store.write("info", info.to_string());
        store.write("max-ring-page-order", MAX_RING_PAGE_ORDER.to_string());
        if self.discard_enabled {
            store.write("feature-discard", "1".to_string());
        }

        self.state = DeviceState::Inited;
        Ok(())
    }

    /// `connect`: open the backing image, map the ring, bind the event
    /// channel. already-published xenstore keys are not rolled back on
    /// failure, the peer is expected to retry.
    pub fn connect(
        &mut self,
        store: &dyn XenStore,
        grant_table: Arc<dyn GrantTable>,
        bind_evtchn: impl FnOnce(u32) -> io::Result<Box<dyn EventChannel>>,
        open_block: impl FnOnce(&str, bool, bool) -> io::Result<Arc<dyn crate::block_backend::BlockBackend>>,
    ) -> Result<(), DeviceError> {
        assert_eq!(self.state, DeviceState::Inited, "connect() called out of order");

        let block = open_block(&self.filename, self.writable, self.discard_enabled)
            .map_err(|source| DeviceError::OpenImage {
                path: self.filename.clone(),
                source,
            })?;

        let file_size = block.size_bytes();
        self.sectors = file_size / self.sector_size;
        store.write("sector-size", self.sector_size.to_string());
        store.write("sectors", self.sectors.to_string());

        let ring_refs = read_ring_refs(store)?;
        let remote_port: u32 = store
            .read("event-channel")
            .ok_or(ConfigError::MissingKey("event-channel"))?
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                key: "event-channel",
                value: String::new(),
            })?;

        let protocol = match store.read("protocol") {
            None => Protocol::Native,
            Some(s) => s.parse().map_err(|_| DeviceError::UnknownProtocol(s.clone()))?,
        };

        grant_table.set_max_grant_refs(ring_refs.len());
        let base = grant_table
            .map(&ring_refs)
            .map_err(|source| DeviceError::GrantMap {
                count: ring_refs.len(),
                source,
            })?;

        let nr_pages = ring_refs.len() as u32;
        let nr_ents = match protocol {
            Protocol::Native => NativeBackRing::ring_size_for(nr_pages, PAGE_SIZE),
            Protocol::X86_32 => X86_32BackRing::ring_size_for(nr_pages, PAGE_SIZE),
            Protocol::X86_64 => X86_64BackRing::ring_size_for(nr_pages, PAGE_SIZE),
        };

        let ring = match protocol {
            Protocol::Native => AnyBackRing::Native(NativeBackRing::new(base, nr_ents)),
            Protocol::X86_32 => AnyBackRing::X86_32(X86_32BackRing::new(base, nr_ents)),
            Protocol::X86_64 => AnyBackRing::X86_64(X86_64BackRing::new(base, nr_ents)),
        };

        let evtchn = bind_evtchn(remote_port).map_err(|source| DeviceError::BindEventChannel { source })?;

        self.pool = RequestPool::new(nr_ents);
        self.ring_refs = ring_refs;
        self.remote_event_channel = remote_port;
        self.protocol = protocol;
        self.ring_base_ptr = Some(base as usize);
        self.nr_ring_pages = nr_pages;
        self.ring = Some(ring);
        self.grant_table = Some(grant_table);
        self.evtchn = Some(evtchn);
        self.block = Some(block);
        self.state = DeviceState::Connected;

        info!(
            "device {}: ok: proto {}, nr-ring-ref {}, remote port {}, max_requests {}",
            self.num, self.protocol, self.nr_ring_pages, self.remote_event_channel, nr_ents
        );
        Ok(())
    }

    /// Drain already-queued work, quiesce the block backend, and release
    /// transport resources. the request pool still owns its entries after
    /// this returns; `free` finishes the job.
    pub fn disconnect(&mut self) {
        if self.state != DeviceState::Connected {
            return;
        }

        loop {
            crate::engine::handle_requests(self);
            let processed = crate::engine::drain_completions_blocking(self);
            if !self.more_work && self.pool.requests_inflight() == 0 {
                break;
            }
            if !processed && self.more_work {
                // Nothing left to wait on but the ring thinks there's
                // more work: the peer has stopped producing requests (its
                // own state machine is expected to have done so by now),
                // so we break out rather than spin.
                warn!("device {}: disconnect drain saw more_work with no progress", self.num);
                break;
            }
        }

        if let Some(evtchn) = self.evtchn.take() {
            drop(evtchn);
        }
        if let (Some(grant_table), Some(base)) = (self.grant_table.take(), self.ring_base_ptr.take()) {
            // SAFETY: `base` is exactly the pointer `map` returned for
            // `nr_ring_pages` pages, and nothing accesses it after this.
            unsafe {
                let _ = grant_table.unmap(base as *mut u8, self.nr_ring_pages as usize);
            }
        }
        self.ring = None;
        self.block = None;
        self.state = DeviceState::Inited;
    }

    /// `free`: disconnect defensively, drain the freelist, release
    /// configuration strings. Programming error to call with requests
    /// still inflight.
    pub fn free(&mut self) {
        self.disconnect();
        if self.pool.requests_inflight() != 0 {
            panic!("free() called on device {} with requests still inflight", self.num);
        }
        self.pool.destroy_all();
        self.params.clear();
        self.fileproto.clear();
        self.filename.clear();
        self.devtype = None;
        self.state = DeviceState::Alloc;
    }
}

fn split_params(params: &str) -> (&str, &str) {
    match params.split_once(':') {
        Some((proto, rest)) => (proto, rest),
        None => ("<unset>", params),
    }
}

fn alias_fileproto(proto: &str) -> &str {
    match proto {
        "aio" => "raw",
        "vhd" => "vpc",
        other => other,
    }
}

fn read_ring_refs(store: &dyn XenStore) -> Result<Vec<u32>, ConfigError> {
    if let Some(order_str) = store.read("ring-page-order") {
        let order: u32 = order_str.parse().map_err(|_| ConfigError::InvalidValue {
            key: "ring-page-order",
            value: order_str.clone(),
        })?;
        if order > MAX_RING_PAGE_ORDER {
            return Err(ConfigError::RingPageOrderOutOfRange(order));
        }
        let count = 1u32 << order;
        let mut refs = Vec::with_capacity(count as usize);
        for i in 0..count {
            let key = format!("ring-ref{i}");
            let v = store.read(&key).ok_or(ConfigError::MissingKey("ring-ref<i>"))?;
            refs.push(v.parse().map_err(|_| ConfigError::InvalidValue { key: "ring-ref<i>", value: v })?);
        }
        Ok(refs)
    } else {
        let v = store.read("ring-ref").ok_or(ConfigError::MissingKey("ring-ref"))?;
        let r: u32 = v.parse().map_err(|_| ConfigError::InvalidValue { key: "ring-ref", value: v })?;
        Ok(vec![r])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemXenStore;

    #[test]
    fn init_requires_all_core_keys() {
        let store = MemXenStore::new();
        store.set("params", "raw:/tmp/x").set("mode", "r").set("type", "phy");
        let mut dev = Device::alloc(0);
        let err = dev.init(&store).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey("dev")));
        assert_eq!(dev.state, DeviceState::Alloc);
    }

    #[test]
    fn init_publishes_capability_keys_and_aliases_fileproto() {
        let store = MemXenStore::new();
        store
            .set("params", "aio:/tmp/x")
            .set("mode", "r")
            .set("type", "phy")
            .set("dev", "xvda");
        let mut dev = Device::alloc(0);
        dev.init(&store).unwrap();
        assert_eq!(dev.fileproto, "raw");
        assert_eq!(dev.filename, "/tmp/x");
        assert!(!dev.writable);
        assert_eq!(store.read("feature-flush-cache").as_deref(), Some("1"));
        assert_eq!(store.read("info").as_deref(), Some(&(VDISK_READONLY).to_string()));
        assert_eq!(dev.state, DeviceState::Inited);
    }

    #[test]
    fn discard_enable_explicit_zero_suppresses_feature() {
        let store = MemXenStore::new();
        store
            .set("params", "raw:/tmp/x")
            .set("mode", "w")
            .set("type", "phy")
            .set("dev", "xvda")
            .set("discard-enable", "0");
        let mut dev = Device::alloc(0);
        dev.init(&store).unwrap();
        assert!(!dev.discard_enabled);
        assert_eq!(store.read("feature-discard"), None);
    }
}
