//! Main loop & scheduler hooks (C7): a single-threaded cooperative `mio`
//! reactor. per SPEC_FULL.md §4.6, the process-wide "iothread lock" the
//! original holds while servicing events degenerates here to an invariant:
//! nothing in `engine`/`device` is reachable except from inside this
//! loop's own callbacks, so no data structure needs its own mutex.
//!
//! The glossary's "deferred-work item" is modeled as a small pending-set
//! plus a `VecDeque` of device numbers: an event-channel signal or an
//! `on_complete` callback schedules a device rather than re-entering
//! `handle_requests` inline, exactly as the original defers to its event
//! loop's bottom-half mechanism instead of recursing.

use std::cell::Cell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use log::{info, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::device::Device;
use crate::engine;
use crate::monitor::Monitor;
use crate::transport::EventChannel;

const MONITOR_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const FIRST_DYNAMIC_TOKEN: usize = 2;

enum Owner {
    MonitorConnection,
    Device(u32),
}

pub struct MainLoop {
    poll: Poll,
    events: Events,
    waker: std::sync::Arc<Waker>,
    monitor: Monitor,
    devices: HashMap<u32, Device>,
    device_tokens: HashMap<u32, Token>,
    owners: HashMap<Token, Owner>,
    next_token: usize,
    deferred: VecDeque<u32>,
    pending: HashSet<u32>,
    run: Rc<Cell<bool>>,
}

impl MainLoop {
    pub fn new(control_socket_path: &str) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = std::sync::Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let monitor = Monitor::bind(control_socket_path)?;
        poll.registry().register(
            &mut SourceFd(&monitor.listener_fd()),
            MONITOR_TOKEN,
            Interest::READABLE,
        )?;

        Ok(MainLoop {
            poll,
            events: Events::with_capacity(128),
            waker,
            monitor,
            devices: HashMap::new(),
            device_tokens: HashMap::new(),
            owners: HashMap::new(),
            next_token: FIRST_DYNAMIC_TOKEN,
            deferred: VecDeque::new(),
            pending: HashSet::new(),
            run: Rc::new(Cell::new(true)),
        })
    }

    /// Handed to `block_backend::FileBlockBackend::open` (and any other
    /// `BlockBackend` impl that completes work off-thread) so completions
    /// wake this loop instead of being polled for.
    pub fn waker(&self) -> std::sync::Arc<Waker> {
        self.waker.clone()
    }

    /// Register a freshly `connect`-ed device's event channel with the
    /// reactor and take ownership of it.
    pub fn attach_device(&mut self, dev: Device) -> io::Result<()> {
        let evtchn_fd: RawFd = dev.evtchn.as_ref().expect("attach_device requires a connected device").as_raw_fd();
        let token = self.alloc_token();
        self.poll.registry().register(&mut SourceFd(&evtchn_fd), token, Interest::READABLE)?;
        self.owners.insert(token, Owner::Device(dev.num));
        self.device_tokens.insert(dev.num, token);
        self.devices.insert(dev.num, dev);
        Ok(())
    }

    /// Quiesce and drop a device, per its lifecycle's `disconnect` +
    /// `free`. Used both for orderly teardown and for a peer-initiated
    /// detach.
    pub fn detach_device(&mut self, dev_num: u32) {
        if let Some(token) = self.device_tokens.remove(&dev_num) {
            self.owners.remove(&token);
        }
        if let Some(mut dev) = self.devices.remove(&dev_num) {
            dev.free();
        }
        self.pending.remove(&dev_num);
    }

    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    fn schedule(&mut self, dev_num: u32) {
        if self.pending.insert(dev_num) {
            self.deferred.push_back(dev_num);
        }
    }

    /// Run until a `quit` command (or external shutdown request) clears
    /// the run flag, then execute the shutdown sequence: close all block
    /// backends, destroy the monitor, release control-channel resources.
    pub fn run(&mut self) -> io::Result<()> {
        while self.run.get() {
            match self.poll.poll(&mut self.events, Some(Duration::from_millis(200))) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
            for token in tokens {
                self.handle_event(token);
            }

            self.drain_deferred();
        }

        self.shutdown();
        Ok(())
    }

    fn handle_event(&mut self, token: Token) {
        if token == MONITOR_TOKEN {
            let next_token = &mut self.next_token;
            let registry = self.poll.registry();
            let tokens = self.monitor.accept_all(|| {
                let t = Token(*next_token);
                *next_token += 1;
                t
            });
            for t in tokens {
                if let Some(fd) = self.monitor.connection_raw_fd(t) {
                    if let Err(e) = registry.register(&mut SourceFd(&fd), t, Interest::READABLE) {
                        warn!("failed to register monitor connection: {e}");
                    }
                }
                self.owners.insert(t, Owner::MonitorConnection);
            }
            return;
        }

        if token == WAKER_TOKEN {
            // A block backend posted one or more completions; we don't
            // know which device without a per-device waker, so give every
            // connected device a chance to drain. `drain_deferred` is a
            // no-op for devices with nothing buffered.
            let dev_nums: Vec<u32> = self.devices.keys().copied().collect();
            for dev_num in dev_nums {
                self.schedule(dev_num);
            }
            return;
        }

        match self.owners.get(&token) {
            Some(Owner::Device(dev_num)) => {
                let dev_num = *dev_num;
                if let Some(dev) = self.devices.get(&dev_num) {
                    if let Some(evtchn) = &dev.evtchn {
                        let _ = evtchn.ack();
                    }
                }
                self.schedule(dev_num);
            }
            Some(Owner::MonitorConnection) => {
                self.service_monitor_connection(token);
            }
            None => {}
        }
    }

    fn service_monitor_connection(&mut self, token: Token) {
        if let Some(conn) = self.monitor.connections.get_mut(&token) {
            conn.on_readable(&self.run);
            if !conn.closed {
                conn.on_writable();
            }
        }
        let closed = self.monitor.connections.get(&token).map(|c| c.closed).unwrap_or(true);
        if closed {
            if let Some(fd) = self.monitor.connection_raw_fd(token) {
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            }
            self.monitor.connections.remove(&token);
            self.owners.remove(&token);
        }
    }

    fn drain_deferred(&mut self) {
        while let Some(dev_num) = self.deferred.pop_front() {
            self.pending.remove(&dev_num);
            let Some(dev) = self.devices.get_mut(&dev_num) else { continue };
            engine::drain_available_completions(dev);
            engine::handle_requests(dev);
            if dev.more_work && dev.pool.requests_inflight() < dev.pool.max_requests() {
                self.schedule(dev_num);
            }
        }
    }

    fn shutdown(&mut self) {
        info!("main loop: shutting down");
        let dev_nums: Vec<u32> = self.devices.keys().copied().collect();
        for dev_num in dev_nums {
            self.detach_device(dev_num);
        }
        self.monitor.connections.clear();
    }

    pub fn run_flag(&self) -> Rc<Cell<bool>> {
        self.run.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_allocation_never_collides_with_fixed_tokens() {
        let mut next = FIRST_DYNAMIC_TOKEN;
        let a = Token(next);
        next += 1;
        let b = Token(next);
        assert_ne!(a, MONITOR_TOKEN);
        assert_ne!(b, WAKER_TOKEN);
    }
}
