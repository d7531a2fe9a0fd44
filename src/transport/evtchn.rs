//! Event channel: a lightweight interrupt-like signal between backend and
//! peer. Bind once at connect time, notify after producing responses,
//! unbind at disconnect.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use vmm_sys_util::eventfd::{EFD_NONBLOCK, EventFd};

pub trait EventChannel: Send {
    /// Raise the signal; the peer observes it on its own binding.
    fn notify(&self) -> io::Result<()>;

    /// Raw fd the main loop can register for readability (i.e. "the peer
    /// signaled us").
    fn as_raw_fd(&self) -> RawFd;

    /// Consume one pending wakeup so the fd can be re-armed (eventfd
    /// requires draining the counter to clear readability).
    fn ack(&self) -> io::Result<()>;
}

/// `eventfd`-backed stand-in for a bound Xen event channel port.
pub struct EventFdChannel {
    fd: EventFd,
}

impl EventFdChannel {
    pub fn new() -> io::Result<Self> {
        Ok(EventFdChannel {
            fd: EventFd::new(EFD_NONBLOCK)?,
        })
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(EventFdChannel {
            fd: self.fd.try_clone()?,
        })
    }
}

impl EventChannel for EventFdChannel {
    fn notify(&self) -> io::Result<()> {
        self.fd.write(1)
    }

    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn ack(&self) -> io::Result<()> {
        // EventFd::read blocks if the counter is already zero only when
        // the fd is not EFD_NONBLOCK; production binding sets NONBLOCK.
        match self.fd.read() {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_then_ack_drains_counter() {
        let chan = EventFdChannel::new().unwrap();
        chan.notify().unwrap();
        chan.ack().unwrap();
    }
}
