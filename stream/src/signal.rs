//! Consumer wake-up hints.
//!
//! A signal never carries frame data. It only tells a consumer that calling
//! `read_frame` is worthwhile; the frame store decides whether a frame is
//! actually there.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use pwstream_common::config::ConsumerMode;
use tracing::{debug, warn};

use crate::error::StreamError;

pub enum ReadinessSignal {
    Edge(EdgeSignal),
    Blocking(CreditSemaphore),
}

impl ReadinessSignal {
    pub fn new(mode: ConsumerMode) -> io::Result<Self> {
        match mode {
            ConsumerMode::BlockingSemaphore => Ok(Self::Blocking(CreditSemaphore::new())),
            ConsumerMode::EdgePipe | ConsumerMode::Invalid => Ok(Self::Edge(EdgeSignal::new()?)),
        }
    }

    pub fn mode(&self) -> ConsumerMode {
        match self {
            Self::Edge(_) => ConsumerMode::EdgePipe,
            Self::Blocking(_) => ConsumerMode::BlockingSemaphore,
        }
    }

    /// Producer side: a frame was published. Called with the store lock held.
    pub fn notify(&self) {
        match self {
            Self::Edge(edge) => edge.arm(),
            Self::Blocking(sem) => sem.post(),
        }
    }

    /// Consumer side: a frame was taken from the store. Called with the store
    /// lock held.
    pub fn acknowledge(&self) {
        match self {
            Self::Edge(edge) => edge.drain(),
            // Credits are taken by `wait`, not by reads.
            Self::Blocking(_) => {}
        }
    }

    /// Blocks until a frame has been signalled or the signal is closed.
    pub fn wait(&self) -> Result<(), StreamError> {
        match self {
            Self::Edge(_) => Err(StreamError::InvalidArgument(
                "wait_for_frame requires blocking_semaphore mode",
            )),
            Self::Blocking(sem) => sem.wait(),
        }
    }

    /// Wakes every thread blocked in `wait`; they and all later waits
    /// resolve to `StreamError::Closed`.
    pub fn interrupt(&self) {
        if let Self::Blocking(sem) = self {
            sem.close();
        }
    }

    /// Stops accepting new signals and frees the pipe's write end.
    pub fn release(&self) {
        match self {
            Self::Edge(edge) => edge.close(),
            Self::Blocking(sem) => sem.close(),
        }
    }

    /// Read end of the self-pipe, for poll/epoll integration.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        match self {
            Self::Edge(edge) => Some(edge.reader.as_fd()),
            Self::Blocking(_) => None,
        }
    }

    /// Number of signals a consumer could currently collect.
    pub fn pending(&self) -> usize {
        match self {
            Self::Edge(edge) => edge.pending(),
            Self::Blocking(sem) => sem.available(),
        }
    }
}

/// Non-blocking self-pipe holding at most one pending byte.
///
/// The write end is dropped on close, so a poller watching the read end sees
/// end-of-file instead of waiting forever.
pub struct EdgeSignal {
    reader: File,
    writer: Mutex<Option<File>>,
}

impl EdgeSignal {
    pub fn new() -> io::Result<Self> {
        let mut fds: [libc::c_int; 2] = [-1, -1];
        // SAFETY: `fds` is a valid two-element array for pipe(2) to fill.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe(2) succeeded, so both descriptors are open and owned by us.
        let (read_end, write_end) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        for fd in [read_end.as_raw_fd(), write_end.as_raw_fd()] {
            set_nonblocking_cloexec(fd)?;
        }
        debug!(
            read_fd = read_end.as_raw_fd(),
            write_fd = write_end.as_raw_fd(),
            "created non-blocking readiness pipe"
        );

        Ok(Self {
            reader: File::from(read_end),
            writer: Mutex::new(Some(File::from(write_end))),
        })
    }

    fn arm(&self) {
        let writer = lock(&self.writer);
        let Some(writer) = writer.as_ref() else {
            return;
        };
        // Drop a stale byte first so the pipe never holds more than one.
        self.drain();
        match (&*writer).write(&[0u8]) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "failed to write readiness byte"),
        }
    }

    fn drain(&self) {
        let mut byte = [0u8; 1];
        match (&self.reader).read(&mut byte) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "failed to drain readiness byte"),
        }
    }

    fn close(&self) {
        let mut writer = lock(&self.writer);
        if writer.take().is_some() {
            debug!("closed write end of readiness pipe");
        }
    }

    fn pending(&self) -> usize {
        let mut n: libc::c_int = 0;
        // SAFETY: FIONREAD writes a single c_int through the provided pointer.
        let rc = unsafe {
            libc::ioctl(
                self.reader.as_raw_fd(),
                libc::FIONREAD,
                &mut n as *mut libc::c_int,
            )
        };
        if rc < 0 {
            return 0;
        }
        n.max(0) as usize
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: `fd` is an open descriptor owned by the caller.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Counting semaphore: one credit per published frame, one taken per wait.
pub struct CreditSemaphore {
    credits: Mutex<Credits>,
    available: Condvar,
}

struct Credits {
    count: usize,
    closed: bool,
}

impl CreditSemaphore {
    pub fn new() -> Self {
        Self {
            credits: Mutex::new(Credits {
                count: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    fn post(&self) {
        let mut credits = lock(&self.credits);
        if credits.closed {
            return;
        }
        credits.count += 1;
        self.available.notify_one();
    }

    fn wait(&self) -> Result<(), StreamError> {
        let mut credits = lock(&self.credits);
        loop {
            if credits.closed {
                return Err(StreamError::Closed);
            }
            if credits.count > 0 {
                credits.count -= 1;
                return Ok(());
            }
            credits = self
                .available
                .wait(credits)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn close(&self) {
        let mut credits = lock(&self.credits);
        credits.closed = true;
        credits.count = 0;
        self.available.notify_all();
    }

    fn available(&self) -> usize {
        lock(&self.credits).count
    }
}

/// Locks a mutex, recovering the guard if a holder panicked. The protected
/// state is always left consistent between statements, so a poisoned lock is
/// still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn edge_arm_keeps_one_pending_byte() {
        let signal = ReadinessSignal::new(ConsumerMode::EdgePipe).unwrap();
        assert_eq!(signal.pending(), 0);
        for _ in 0..50 {
            signal.notify();
        }
        assert_eq!(signal.pending(), 1);
        signal.acknowledge();
        assert_eq!(signal.pending(), 0);
    }

    #[test]
    fn edge_drain_on_empty_pipe_is_tolerated() {
        let signal = ReadinessSignal::new(ConsumerMode::EdgePipe).unwrap();
        signal.acknowledge();
        signal.acknowledge();
        assert_eq!(signal.pending(), 0);
    }

    #[test]
    fn edge_fd_is_non_blocking() {
        let signal = ReadinessSignal::new(ConsumerMode::EdgePipe).unwrap();
        let fd = signal.fd().unwrap().as_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
    }

    #[test]
    fn edge_release_stops_arming() {
        let signal = ReadinessSignal::new(ConsumerMode::EdgePipe).unwrap();
        signal.interrupt();
        signal.notify();
        assert_eq!(signal.pending(), 1);
        signal.acknowledge();
        signal.release();
        signal.notify();
        assert_eq!(signal.pending(), 0);
    }

    #[test]
    fn edge_rejects_wait() {
        let signal = ReadinessSignal::new(ConsumerMode::EdgePipe).unwrap();
        assert!(matches!(signal.wait(), Err(StreamError::InvalidArgument(_))));
    }

    #[test]
    fn semaphore_accumulates_credits() {
        let signal = ReadinessSignal::new(ConsumerMode::BlockingSemaphore).unwrap();
        for _ in 0..5 {
            signal.notify();
        }
        assert_eq!(signal.pending(), 5);
        for _ in 0..5 {
            signal.wait().unwrap();
        }
        assert_eq!(signal.pending(), 0);
        assert!(signal.fd().is_none());
    }

    #[test]
    fn semaphore_wait_wakes_on_post() {
        let signal = Arc::new(ReadinessSignal::new(ConsumerMode::BlockingSemaphore).unwrap());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait())
        };
        thread::sleep(Duration::from_millis(20));
        signal.notify();
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn semaphore_close_wakes_waiters() {
        let signal = Arc::new(ReadinessSignal::new(ConsumerMode::BlockingSemaphore).unwrap());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let signal = Arc::clone(&signal);
                thread::spawn(move || signal.wait())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        signal.interrupt();
        for waiter in waiters {
            assert!(matches!(waiter.join().unwrap(), Err(StreamError::Closed)));
        }
        signal.notify();
        assert!(matches!(signal.wait(), Err(StreamError::Closed)));
    }
}
