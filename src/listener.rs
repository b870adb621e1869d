//! Request and control listener threads.
//!
//! Each topic runs one long-lived thread blocked on its `request` FIFO and,
//! when enabled, a second on its `control` FIFO. Both block in `poll(2)`
//! multiplexed with a self-pipe; `close` wakes the self-pipe and joins the
//! thread within a bounded wait.
//!
//! Connect, disconnect, request, and control callbacks all run on these
//! threads (or, for disconnects observed mid-publish, on the producer
//! thread), and always outside the crate's internal locks.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use parking_lot::Mutex;
use zerocopy::IntoBytes;

use crate::error::{Error, Result};
use crate::fifo;
use crate::server::{MAX_CLIENTS_PER_CHANNEL, Topic};
use crate::slot::ClientState;

/// Read buffer for join requests; requests are short name strings.
const REQUEST_BUF_SIZE: usize = 256;

/// Highest suffix tried when disambiguating a requested client name.
const MAX_NAME_SUFFIXES: u32 = 8;

/// How often and how long to retry opening a fresh client FIFO for writing
/// while the peer opens its read end.
const JOIN_OPEN_ATTEMPTS: u32 = 500;
const JOIN_OPEN_INTERVAL: Duration = Duration::from_millis(1);

/// Backoff after an unexpected listener read error, so a wedged FIFO does
/// not turn the listener into a busy loop.
const LISTENER_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// One listener thread plus the self-pipe used to cancel its blocking wait.
pub(crate) struct ListenerHandle {
    wake_rx: OwnedFd,
    wake_tx: OwnedFd,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerHandle {
    pub(crate) fn new() -> Result<Self> {
        let (wake_rx, wake_tx) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?;
        Ok(ListenerHandle {
            wake_rx,
            wake_tx,
            thread: Mutex::new(None),
        })
    }

    fn set_thread(&self, handle: JoinHandle<()>) {
        *self.thread.lock() = Some(handle);
    }

    /// Wake the listener out of its blocking poll.
    pub(crate) fn wake(&self) {
        if let Err(e) = nix::unistd::write(&self.wake_tx, &[1u8]) {
            warn!("failed to wake listener thread: {e}");
        }
    }

    /// Join the listener, giving up (and leaking the thread) after
    /// `timeout`. A leaked thread exits on its own once it observes the
    /// topic is no longer running.
    pub(crate) fn join(&self, timeout: Duration) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("timed out joining listener thread");
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let _ = handle.join();
    }
}

enum Wake {
    Data,
    Shutdown,
}

/// Block until the data fd is readable or the self-pipe fires.
fn wait_readable(data_fd: BorrowedFd<'_>, wake_fd: BorrowedFd<'_>) -> io::Result<Wake> {
    loop {
        let mut fds = [
            PollFd::new(data_fd, PollFlags::POLLIN),
            PollFd::new(wake_fd, PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
            Ok(_) => {
                if fds[1].revents().is_some_and(|r| !r.is_empty()) {
                    return Ok(Wake::Shutdown);
                }
                let data_ready = fds[0].revents().is_some_and(|r| {
                    r.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP)
                });
                if data_ready {
                    return Ok(Wake::Data);
                }
            }
        }
    }
}

pub(crate) fn spawn_request_listener(topic: &Arc<Topic>) -> Result<()> {
    let worker = Arc::clone(topic);
    let handle = thread::Builder::new()
        .name(format!("pipebus-req-{}", topic.index))
        .spawn(move || request_loop(worker))
        .map_err(Error::Filesystem)?;
    topic.request_listener.set_thread(handle);
    Ok(())
}

fn request_loop(topic: Arc<Topic>) {
    let mut buf = [0u8; REQUEST_BUF_SIZE];
    while topic.running.load(Ordering::Acquire) {
        match wait_readable(
            topic.request_fd.as_fd(),
            topic.request_listener.wake_rx.as_fd(),
        ) {
            Ok(Wake::Shutdown) => break,
            Ok(Wake::Data) => match nix::unistd::read(topic.request_fd.as_fd(), &mut buf) {
                Ok(n) if n > 0 => {
                    let raw = &buf[..n];
                    match add_client(&topic, raw) {
                        Ok(client) => {
                            let cb = topic.callbacks.request.lock().clone();
                            if let Some(cb) = cb {
                                cb(topic.index, raw, client);
                            }
                        }
                        Err(e) => {
                            warn!("channel {} join request failed: {e}", topic.index);
                        }
                    }
                }
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => {
                    warn!("channel {} request read error: {e}", topic.index);
                    thread::sleep(LISTENER_ERROR_BACKOFF);
                }
            },
            Err(e) => {
                warn!("channel {} request poll error: {e}", topic.index);
                thread::sleep(LISTENER_ERROR_BACKOFF);
            }
        }
    }
    debug!("channel {} request listener exiting", topic.index);
}

pub(crate) fn spawn_control_listener(topic: &Arc<Topic>) -> Result<()> {
    let Some(handle_slot) = &topic.control_listener else {
        return Err(Error::ControlNotAvailable);
    };
    let worker = Arc::clone(topic);
    let handle = thread::Builder::new()
        .name(format!("pipebus-ctl-{}", topic.index))
        .spawn(move || control_loop(worker))
        .map_err(Error::Filesystem)?;
    handle_slot.set_thread(handle);
    Ok(())
}

fn control_loop(topic: Arc<Topic>) {
    let (Some(control_fd), Some(handle)) = (&topic.control_fd, &topic.control_listener) else {
        return;
    };
    if topic.control_thread_priority > 0 {
        set_realtime_priority(topic.control_thread_priority);
    }
    let mut buf = vec![0u8; topic.control_read_buf_size];
    while topic.running.load(Ordering::Acquire) {
        match wait_readable(control_fd.as_fd(), handle.wake_rx.as_fd()) {
            Ok(Wake::Shutdown) => break,
            Ok(Wake::Data) => match nix::unistd::read(control_fd.as_fd(), &mut buf) {
                Ok(n) if n > 0 => {
                    let cb = topic.callbacks.control.lock().clone();
                    if let Some(cb) = cb {
                        cb(topic.index, &buf[..n]);
                    }
                }
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => {
                    warn!("channel {} control read error: {e}", topic.index);
                    thread::sleep(LISTENER_ERROR_BACKOFF);
                }
            },
            Err(e) => {
                warn!("channel {} control poll error: {e}", topic.index);
                thread::sleep(LISTENER_ERROR_BACKOFF);
            }
        }
    }
    debug!("channel {} control listener exiting", topic.index);
}

/// Switch the calling thread to SCHED_FIFO at the given priority (1-99).
fn set_realtime_priority(priority: i32) {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc != 0 {
        warn!(
            "failed to set control thread priority {priority}: {}",
            io::Error::from_raw_os_error(rc)
        );
    }
}

/// Reduce a raw join request to its base name: truncate at the first byte
/// outside the printable range and reject empty or oversized results.
fn sanitize_name(raw: &[u8]) -> Result<&str> {
    let end = raw
        .iter()
        .position(|&b| !(0x20..=0x7a).contains(&b))
        .unwrap_or(raw.len());
    let trimmed = &raw[..end];
    if trimmed.is_empty() {
        return Err(Error::InvalidArgument("empty client name"));
    }
    if trimmed.len() >= fifo::MAX_NAME_LEN {
        return Err(Error::InvalidArgument("client name too long"));
    }
    // printable ASCII by construction
    std::str::from_utf8(trimmed).map_err(|_| Error::InvalidArgument("client name not ASCII"))
}

/// Provision (or re-provision) a client slot for a join request.
///
/// The assigned name is the requested base plus the smallest suffix in
/// `0..8` whose path does not exist, so concurrent subscribers may share a
/// base name. A request matching the recorded name of a slot that has since
/// disconnected reuses that slot.
pub(crate) fn add_client(topic: &Topic, raw: &[u8]) -> Result<usize> {
    if !topic.running.load(Ordering::Acquire) {
        return Err(Error::NotRunning);
    }
    let base = sanitize_name(raw)?;

    let mut state = topic.state.lock();

    let mut assigned = None;
    for suffix in 0..MAX_NAME_SUFFIXES {
        let candidate = format!("{base}{suffix}");
        let path = topic.base_dir.join(&candidate);
        if !path.exists() {
            assigned = Some((candidate, path));
            break;
        }
    }
    let Some((name, path)) = assigned else {
        return Err(Error::ReachedMaxNameIndex);
    };

    let count = topic.slot_count();
    let mut client = None;
    for i in 0..count {
        let io = topic.slots[i].io.lock();
        if io.name == name {
            if io.state == Some(ClientState::Disconnected) {
                debug!("client {name} (id {i}) reconnecting to channel {}", topic.index);
            } else {
                warn!(
                    "client {name} rejoined channel {} while still attached",
                    topic.index
                );
            }
            client = Some(i);
            break;
        }
    }
    let is_new = client.is_none();
    if is_new && count >= MAX_CLIENTS_PER_CHANNEL {
        warn!("channel {} client table is full", topic.index);
        return Err(Error::Other);
    }
    let client = client.unwrap_or(count);

    fifo::make_fifo(&path)?;
    debug!("channel {} created fifo {}", topic.index, path.display());

    // The peer may still be opening its read end; retry briefly. A slot
    // that fails past this point stays recorded as disconnected so a retry
    // under the same name lands back on it.
    let record_failed_join = |state_err: Error| -> Error {
        {
            let mut io = topic.slots[client].io.lock();
            io.name = name.clone();
            io.path = path.clone();
            io.disconnect();
        }
        if is_new {
            topic.n_clients.store(client + 1, Ordering::Release);
        }
        state_err
    };

    let fd = match fifo::open_writer_retry(&path, JOIN_OPEN_ATTEMPTS, JOIN_OPEN_INTERVAL) {
        Ok(fd) => fd,
        Err(e) => {
            warn!(
                "channel {} client {name} never opened {}, aborting join",
                topic.index,
                path.display()
            );
            return Err(record_failed_join(e));
        }
    };

    let requested = state.info.size_bytes;
    let granted = match fifo::set_pipe_capacity(fd.as_fd(), requested) {
        Ok(granted) => granted,
        Err(e) => return Err(record_failed_join(e)),
    };
    if granted < requested {
        // remember the achievable capacity for future joins
        state.info.size_bytes = granted;
    }

    // Encoded streams: the slot's first record must be the sticky header.
    // Replay it under the slot mutex, before the slot becomes visible to
    // the fan-out, so no concurrent publish can get in front of it.
    let header = topic.sticky_header.lock().clone();
    {
        let mut io = topic.slots[client].io.lock();
        io.name = name.clone();
        io.path = path;
        io.attach(fd, granted);
        if let Some(header) = &header {
            let meta = header.meta;
            let _ = io.write_record(&[meta.as_bytes(), &header.payload]);
        }
    }
    if is_new {
        topic.n_clients.store(client + 1, Ordering::Release);
    }
    drop(state);

    let cb = topic.callbacks.connect.lock().clone();
    if let Some(cb) = cb {
        cb(topic.index, client, &name);
    }

    Ok(client)
}

#[cfg(test)]
mod test {
    use super::sanitize_name;

    #[test]
    fn sanitize_truncates_at_terminator() {
        assert_eq!(sanitize_name(b"tester\0garbage").unwrap(), "tester");
        assert_eq!(sanitize_name(b"tester\n").unwrap(), "tester");
        assert_eq!(sanitize_name(b"tester").unwrap(), "tester");
    }

    #[test]
    fn sanitize_rejects_empty_and_oversized() {
        assert!(sanitize_name(b"").is_err());
        assert!(sanitize_name(b"\0abc").is_err());
        let long = [b'a'; 64];
        assert!(sanitize_name(&long).is_err());
    }
}
