//! Purpose: Shared request/response counters with futex-style wait and notify.
//! Exports: `SharedCounterBlock`, `WaitOutcome`, `WaitStrategy`.
//! Role: Fast-path wakeup between the controller and one worker slot.
//! Invariants: `request_count` moves once per posted task; `response_count` once per completion.
//! Invariants: Every notify bumps that side's signal word, so a notify is never lost on a
//! waiter that snapshotted the signal before it.
//! Invariants: Counters live in a mapping; clones of a block share it, never copy it.
//! Invariants: Waits re-check the value first, so a change before the wait returns `NotEqual`.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use memmap2::{MmapMut, MmapOptions};

use crate::core::error::{Error, ErrorKind};

const MAGIC: [u8; 4] = *b"WKPL";
const VERSION: u32 = 2;
const HEADER_LEN: usize = 8;
const REQUEST_COUNT_OFFSET: usize = HEADER_LEN;
const RESPONSE_COUNT_OFFSET: usize = HEADER_LEN + 4;
const REQUEST_SIGNAL_OFFSET: usize = HEADER_LEN + 8;
const RESPONSE_SIGNAL_OFFSET: usize = HEADER_LEN + 12;
pub const BLOCK_LEN: usize = HEADER_LEN + 16;

const POLL_SLICE: Duration = Duration::from_millis(1);

/// Result of a blocking wait, mirroring `ok | not-equal | timed-out`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    Woken,
    NotEqual,
    TimedOut,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum WaitStrategy {
    /// Kernel futex where available, polling elsewhere.
    #[default]
    Futex,
    /// Sleep-and-recheck; never relies on notify.
    Poll,
}

pub(crate) trait WaitBackend: Send + Sync {
    fn wait(&self, cell: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome;
    fn wake_all(&self, cell: &AtomicU32);
}

struct Region {
    map: MmapMut,
    path: Option<PathBuf>,
}

#[derive(Clone)]
pub struct SharedCounterBlock {
    region: Arc<Region>,
    backend: Arc<dyn WaitBackend>,
}

impl std::fmt::Debug for SharedCounterBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCounterBlock")
            .field("request_count", &self.load_request())
            .field("response_count", &self.load_response())
            .field("request_signal", &self.load_request_signal())
            .field("response_signal", &self.load_response_signal())
            .field("path", &self.region.path)
            .finish()
    }
}

impl SharedCounterBlock {
    pub fn anonymous() -> Result<Self, Error> {
        Self::anonymous_with(WaitStrategy::default())
    }

    pub fn anonymous_with(strategy: WaitStrategy) -> Result<Self, Error> {
        let mut map = MmapOptions::new().len(BLOCK_LEN).map_anon().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to map counter block")
                .with_source(err)
        })?;
        write_header(&mut map);
        Ok(Self {
            region: Arc::new(Region { map, path: None }),
            backend: backend_for(strategy),
        })
    }

    /// Map a file-backed block so separate processes can share counters.
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message(format!("failed to open counter file {}", path.display()))
                    .with_source(err)
            })?;
        let len = file
            .metadata()
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to stat counter file")
                    .with_source(err)
            })?
            .len();
        let fresh = len == 0;
        if fresh {
            file.set_len(BLOCK_LEN as u64).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to size counter file")
                    .with_source(err)
            })?;
        } else if len < BLOCK_LEN as u64 {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("counter file {} is truncated", path.display())));
        }

        let mut map = unsafe { MmapOptions::new().len(BLOCK_LEN).map_mut(&file) }.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to map counter file")
                .with_source(err)
        })?;
        if fresh {
            write_header(&mut map);
        } else {
            validate_header(&map)?;
        }

        Ok(Self {
            region: Arc::new(Region {
                map,
                path: Some(path),
            }),
            backend: backend_for(WaitStrategy::default()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.region.path.as_deref()
    }

    pub fn load_request(&self) -> u32 {
        self.request_cell().load(Ordering::SeqCst)
    }

    pub fn load_response(&self) -> u32 {
        self.response_cell().load(Ordering::SeqCst)
    }

    /// Bumped by every `notify_request`, including notifies that move no counter.
    pub fn load_request_signal(&self) -> u32 {
        self.cell(REQUEST_SIGNAL_OFFSET).load(Ordering::SeqCst)
    }

    pub fn load_response_signal(&self) -> u32 {
        self.cell(RESPONSE_SIGNAL_OFFSET).load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn add_request(&self, n: u32) -> u32 {
        self.request_cell().fetch_add(n, Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn add_response(&self, n: u32) -> u32 {
        self.response_cell().fetch_add(n, Ordering::SeqCst)
    }

    pub fn wait_request(&self, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
        self.backend.wait(self.request_cell(), expected, timeout)
    }

    pub fn wait_response(&self, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
        self.backend.wait(self.response_cell(), expected, timeout)
    }

    /// Block while the request signal equals `expected`; see `notify_request`.
    pub fn wait_request_signal(&self, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
        self.backend.wait(self.cell(REQUEST_SIGNAL_OFFSET), expected, timeout)
    }

    pub fn wait_response_signal(&self, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
        self.backend.wait(self.cell(RESPONSE_SIGNAL_OFFSET), expected, timeout)
    }

    /// Bump the request signal, then wake waiters on it and on `request_count`.
    pub fn notify_request(&self) {
        self.signal(REQUEST_SIGNAL_OFFSET, REQUEST_COUNT_OFFSET);
    }

    pub fn notify_response(&self) {
        self.signal(RESPONSE_SIGNAL_OFFSET, RESPONSE_COUNT_OFFSET);
    }

    fn signal(&self, signal_offset: usize, count_offset: usize) {
        let signal = self.cell(signal_offset);
        signal.fetch_add(1, Ordering::SeqCst);
        self.backend.wake_all(signal);
        self.backend.wake_all(self.cell(count_offset));
    }

    fn request_cell(&self) -> &AtomicU32 {
        self.cell(REQUEST_COUNT_OFFSET)
    }

    fn response_cell(&self) -> &AtomicU32 {
        self.cell(RESPONSE_COUNT_OFFSET)
    }

    fn cell(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset + 4 <= BLOCK_LEN && offset % 4 == 0);
        // Mappings are page aligned and the offsets are 4-byte aligned; the
        // region outlives every borrow through `self.region`.
        unsafe { &*(self.region.map.as_ptr().add(offset) as *const AtomicU32) }
    }
}

fn write_header(map: &mut MmapMut) {
    map[0..4].copy_from_slice(&MAGIC);
    map[4..8].copy_from_slice(&VERSION.to_le_bytes());
}

fn validate_header(map: &MmapMut) -> Result<(), Error> {
    if map[0..4] != MAGIC {
        return Err(Error::new(ErrorKind::Corrupt).with_message("bad counter block magic"));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&map[4..8]);
    if u32::from_le_bytes(version) != VERSION {
        return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported counter block version"));
    }
    Ok(())
}

fn backend_for(strategy: WaitStrategy) -> Arc<dyn WaitBackend> {
    match strategy {
        #[cfg(target_os = "linux")]
        WaitStrategy::Futex => Arc::new(FutexBackend),
        #[cfg(not(target_os = "linux"))]
        WaitStrategy::Futex => Arc::new(PollBackend),
        WaitStrategy::Poll => Arc::new(PollBackend),
    }
}

#[cfg(target_os = "linux")]
struct FutexBackend;

#[cfg(target_os = "linux")]
impl WaitBackend for FutexBackend {
    fn wait(&self, cell: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
        if cell.load(Ordering::SeqCst) != expected {
            return WaitOutcome::NotEqual;
        }
        let ts = timeout.map(|duration| libc::timespec {
            tv_sec: duration.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: duration.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);
        // FUTEX_WAIT without the private flag so file-backed mappings work across processes.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                cell.as_ptr(),
                libc::FUTEX_WAIT,
                expected,
                ts_ptr,
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        if rc == 0 {
            return WaitOutcome::Woken;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(code) if code == libc::EAGAIN => WaitOutcome::NotEqual,
            Some(code) if code == libc::ETIMEDOUT => WaitOutcome::TimedOut,
            // EINTR and anything else: treat as a wake; callers re-read the counter.
            _ => WaitOutcome::Woken,
        }
    }

    fn wake_all(&self, cell: &AtomicU32) {
        unsafe {
            libc::syscall(libc::SYS_futex, cell.as_ptr(), libc::FUTEX_WAKE, i32::MAX);
        }
    }
}

struct PollBackend;

impl WaitBackend for PollBackend {
    fn wait(&self, cell: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
        if cell.load(Ordering::SeqCst) != expected {
            return WaitOutcome::NotEqual;
        }
        let start = Instant::now();
        loop {
            let slice = match timeout {
                Some(timeout) => {
                    let elapsed = start.elapsed();
                    if elapsed >= timeout {
                        return WaitOutcome::TimedOut;
                    }
                    POLL_SLICE.min(timeout - elapsed)
                }
                None => POLL_SLICE,
            };
            std::thread::sleep(slice);
            if cell.load(Ordering::SeqCst) != expected {
                return WaitOutcome::Woken;
            }
        }
    }

    fn wake_all(&self, _cell: &AtomicU32) {}
}
