//! Thin façades over the hypervisor primitives the engine consumes (C1).
//!
//! Everything here is a trait plus one concrete, locally testable
//! implementation; a real deployment would swap the implementation for one
//! that talks to the actual hypervisor interface (grant table device,
//! event channel, xenstore), without touching `engine`/`device`.

pub mod evtchn;
pub mod grant;
pub mod xenstore;

pub use evtchn::{EventChannel, EventFdChannel};
pub use grant::{GrantCopySegment, GrantTable, MmapGrantTable};
pub use xenstore::{MemXenStore, XenStore};
