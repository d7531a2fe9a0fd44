//! The host block layer (§1 names this an external collaborator; a backend
//! with no concrete implementation has no testable I/O path, so one ships
//! here: `FileBlockBackend`, the minimum needed to exercise the full
//! request lifecycle).
//!
//! Completions may arrive from a different call stack than the one that
//! submitted the operation (§5): a small fixed-size worker pool performs
//! the blocking syscalls, grounded in `perunner`'s `worker::Pool` pattern
//! (bounded `crossbeam` channels, one thread per worker, `Input`/`Output`
//! shuttled by value) from the same retrieval pack.

use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use log::warn;
use mio::Waker;

/// One unit of work handed to a worker thread. `token` round-trips through
/// to the matching `Completion` so the engine can find the right `ioreq`.
pub struct Job {
    pub token: u64,
    pub kind: JobKind,
}

pub enum JobKind {
    Read { offset: u64, len: usize },
    Write { offset: u64, buf: Vec<u8> },
    Flush,
    Discard { offset: u64, len: u64 },
}

pub struct Completion {
    pub token: u64,
    /// `Ok(())` on success; `Err` carries the errno-equivalent.
    pub result: io::Result<()>,
    /// Populated for `Read` jobs: the bytes read, sized to the request.
    pub buf: Option<Vec<u8>>,
}

/// Hint passed to `plug`/`unplug`; a real implementation might defer
/// `fdatasync` or batch `io_uring` submissions, here it is a no-op counter
/// used only so the engine's plug/unplug ratchet has something to call.
pub trait BlockBackend: Send + Sync {
    fn submit(&self, job: Job);
    fn plug(&self) {}
    fn unplug(&self) {}
    /// Total image size in bytes, used for bounds checks during parse.
    fn size_bytes(&self) -> u64;
    /// Whether `Discard` is actually implemented against this image
    /// (if not, discard requests complete with `Unsupported`).
    fn supports_discard(&self) -> bool {
        false
    }
    /// Pull one completion if already available; never blocks.
    fn try_recv_completion(&self) -> Option<Completion> {
        None
    }
    /// Pull one completion, blocking up to `timeout`. Used by the
    /// synchronous disconnect-drain phase.
    fn recv_completion_timeout(&self, _timeout: Duration) -> Option<Completion> {
        None
    }
}

/// File-backed implementation: the qemu `raw`/`file` driver's equivalent.
/// Opens a regular file or block special node and performs blocking
/// pread/pwrite/fsync/fallocate on a worker pool.
pub struct FileBlockBackend {
    workers: Vec<JoinHandle<()>>,
    job_tx: Sender<Job>,
    completion_rx: Receiver<Completion>,
    size_bytes: u64,
    discard_enabled: bool,
}

const WORKER_COUNT: usize = 2;

impl FileBlockBackend {
    pub fn open(path: &str, writable: bool, discard_enabled: bool, waker: Arc<Waker>) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;
        let size_bytes = file.metadata()?.len();

        let (job_tx, job_rx) = channel::bounded::<Job>(WORKER_COUNT * 4);
        let (completion_tx, completion_rx) = channel::bounded::<Completion>(WORKER_COUNT * 4);

        let workers = (0..WORKER_COUNT)
            .map(|i| {
                let file = file.try_clone().expect("dup block image fd");
                let job_rx = job_rx.clone();
                let completion_tx = completion_tx.clone();
                let waker = waker.clone();
                spawn_worker(i, file, job_rx, completion_tx, waker)
            })
            .collect();

        Ok(FileBlockBackend {
            workers,
            job_tx,
            completion_rx,
            size_bytes,
            discard_enabled,
        })
    }

    /// Drain every completion currently available without blocking. Called
    /// by the main loop after being woken.
    pub fn drain_completions(&self) -> Vec<Completion> {
        self.completion_rx.try_iter().collect()
    }

    pub fn completion_receiver(&self) -> &Receiver<Completion> {
        &self.completion_rx
    }

    pub fn shutdown(mut self) {
        drop(self.job_tx.clone());
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

impl BlockBackend for FileBlockBackend {
    fn submit(&self, job: Job) {
        if self.job_tx.send(job).is_err() {
            warn!("block backend worker pool is gone, dropping job");
        }
    }

    fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    fn supports_discard(&self) -> bool {
        self.discard_enabled
    }

    fn try_recv_completion(&self) -> Option<Completion> {
        self.completion_rx.try_recv().ok()
    }

    fn recv_completion_timeout(&self, timeout: Duration) -> Option<Completion> {
        self.completion_rx.recv_timeout(timeout).ok()
    }
}

fn spawn_worker(
    index: usize,
    file: File,
    job_rx: Receiver<Job>,
    completion_tx: Sender<Completion>,
    waker: Arc<Waker>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("blk-io-{index}"))
        .spawn(move || {
            for job in job_rx.iter() {
                let (result, buf) = run_job(&file, job.kind);
                let completion = Completion {
                    token: job.token,
                    result,
                    buf,
                };
                if completion_tx.send(completion).is_err() {
                    break;
                }
                if let Err(e) = waker.wake() {
                    warn!("failed to wake main loop after I/O completion: {e}");
                }
            }
        })
        .expect("spawn block backend worker thread")
}

fn run_job(file: &File, kind: JobKind) -> (io::Result<()>, Option<Vec<u8>>) {
    match kind {
        JobKind::Read { offset, len } => {
            let mut buf = vec![0u8; len];
            match rustix::io::pread(file.as_fd(), &mut buf, offset) {
                Ok(n) if n == len => (Ok(()), Some(buf)),
                Ok(n) => {
                    buf.truncate(n);
                    buf.resize(len, 0);
                    (Ok(()), Some(buf))
                }
                Err(e) => (Err(e.into()), None),
            }
        }
        JobKind::Write { offset, buf } => match rustix::io::pwrite(file.as_fd(), &buf, offset) {
            Ok(_) => (Ok(()), None),
            Err(e) => (Err(e.into()), None),
        },
        JobKind::Flush => match rustix::fs::fsync(file.as_fd()) {
            Ok(()) => (Ok(()), None),
            Err(e) => (Err(e.into()), None),
        },
        JobKind::Discard { offset, len } => {
            #[cfg(target_os = "linux")]
            {
                match rustix::fs::fallocate(
                    file.as_fd(),
                    rustix::fs::FallocateFlags::PUNCH_HOLE | rustix::fs::FallocateFlags::KEEP_SIZE,
                    offset,
                    len,
                ) {
                    Ok(()) => (Ok(()), None),
                    Err(e) => (Err(e.into()), None),
                }
            }
            #[cfg(not(target_os = "linux"))]
            {
                let _ = (offset, len);
                (Err(io::Error::from(io::ErrorKind::Unsupported)), None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use mio::{Poll, Token};

    fn backend(path: &std::path::Path, writable: bool) -> (FileBlockBackend, Arc<Waker>) {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        let backend = FileBlockBackend::open(path.to_str().unwrap(), writable, true, waker.clone()).unwrap();
        (backend, waker)
    }

    #[test]
    fn read_after_write_round_trips() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; 4096]).unwrap();
        tmp.flush().unwrap();
        let (backend, _waker) = backend(tmp.path(), true);

        backend.submit(Job {
            token: 1,
            kind: JobKind::Write {
                offset: 512,
                buf: vec![0x42u8; 256],
            },
        });
        let completion = backend.completion_receiver().recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(completion.token, 1);
        assert!(completion.result.is_ok());

        backend.submit(Job {
            token: 2,
            kind: JobKind::Read { offset: 512, len: 256 },
        });
        let completion = backend.completion_receiver().recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(completion.buf.unwrap(), vec![0x42u8; 256]);
    }
}
