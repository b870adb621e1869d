//! Named-pipe and topic-directory primitives.
//!
//! Everything that touches the filesystem rendezvous lives here: FIFO
//! creation, the non-blocking writer open with its retry loop, kernel pipe
//! capacity control, and the queued-byte query the backpressure policy is
//! built on.

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::error::{Error, Result};

/// Recommended root for topic directories. Lives on a tmpfs so stale
/// rendezvous state cannot survive a reboot.
#[cfg(not(target_os = "android"))]
pub const DEFAULT_BASE_DIR: &str = "/run/mpa/";
/// Recommended root for topic directories (Android build).
#[cfg(target_os = "android")]
pub const DEFAULT_BASE_DIR: &str = "/data/data/com.pipebus.server/mpa/";

/// Maximum length of a topic directory path, including the trailing slash.
#[cfg(not(target_os = "android"))]
pub const MAX_DIR_LEN: usize = 64;
/// Maximum length of a topic directory path (Android build).
#[cfg(target_os = "android")]
pub const MAX_DIR_LEN: usize = 128;

/// Maximum length of a client or topic name, including the terminator.
pub const MAX_NAME_LEN: usize = 32;
/// Maximum length of a full pipe path.
pub const MAX_PATH_LEN: usize = MAX_DIR_LEN + MAX_NAME_LEN;
/// Maximum length of the advertised payload type tag.
pub const MAX_TYPE_LEN: usize = 32;

/// Default capacity requested for client data pipes.
pub const DEFAULT_PIPE_SIZE: usize = 1024 * 1024;

const FIFO_MODE: Mode = Mode::from_bits_truncate(0o666);

/// Expand a topic name or partial location into a canonical directory path
/// with a trailing slash.
///
/// ```text
/// imu0     -> /run/mpa/imu0/
/// imu0/    -> /run/mpa/imu0/
/// /foo/bar -> /foo/bar/
/// /foo     -> /foo/
/// ```
///
/// Only the string is normalized; the path is not required to exist.
pub fn expand_location(input: &str) -> Result<PathBuf> {
    if input.is_empty() {
        return Err(Error::InvalidArgument("empty pipe location"));
    }
    let mut out = if input.starts_with('/') {
        String::from(input)
    } else {
        let mut s = String::from(DEFAULT_BASE_DIR);
        s.push_str(input);
        s
    };
    if !out.ends_with('/') {
        out.push('/');
    }
    if out.len() > MAX_DIR_LEN {
        return Err(Error::InvalidArgument("pipe location too long"));
    }
    Ok(PathBuf::from(out))
}

/// Check whether a topic looks live: its directory holds a `request` FIFO
/// that a server opened for reading.
pub fn topic_exists(name_or_location: &str) -> bool {
    match expand_location(name_or_location) {
        Ok(dir) => dir.join("request").exists(),
        Err(_) => false,
    }
}

/// Create a FIFO at `path`, tolerating one that already exists.
pub(crate) fn make_fifo(path: &Path) -> Result<()> {
    match mkfifo(path, FIFO_MODE) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Open a FIFO for both reading and writing.
///
/// Opening read-only would block until a writer appears, so the owner of a
/// listening FIFO holds both ends even though it never writes to it.
pub(crate) fn open_rdwr(path: &Path) -> Result<OwnedFd> {
    Ok(open(path, OFlag::O_RDWR, Mode::empty())?)
}

/// Open a FIFO for non-blocking writes, waiting for the reader to appear.
///
/// A freshly provisioned client may not have opened its read end yet, in
/// which case the kernel refuses the writer with `ENXIO`. Retry at
/// `interval` for up to `attempts` tries before giving up with
/// [`Error::Timeout`].
pub(crate) fn open_writer_retry(path: &Path, attempts: u32, interval: Duration) -> Result<OwnedFd> {
    let mut tries = 0;
    loop {
        match open(path, OFlag::O_WRONLY | OFlag::O_NONBLOCK, Mode::empty()) {
            Ok(fd) => {
                debug!(
                    "fifo {} opened for writing after {} tries",
                    path.display(),
                    tries + 1
                );
                return Ok(fd);
            }
            Err(e) => {
                tries += 1;
                if tries >= attempts {
                    return match e {
                        nix::errno::Errno::ENXIO => Err(Error::Timeout),
                        other => Err(other.into()),
                    };
                }
                thread::sleep(interval);
            }
        }
    }
}

/// Read the system-wide unprivileged pipe capacity limit.
fn system_pipe_max() -> Option<usize> {
    let text = fs::read_to_string("/proc/sys/fs/pipe-max-size").ok()?;
    text.trim().parse::<usize>().ok()
}

/// Ask the kernel to grow a pipe to `requested` bytes and report what it
/// actually granted.
///
/// If the kernel refuses (typically `EPERM` against the system-wide
/// unprivileged limit), fall back to `/proc/sys/fs/pipe-max-size` and retry
/// once. Some kernels leave the capacity at zero after a refused resize, so
/// a non-positive grant is reported as a hard error rather than a usable
/// size.
pub(crate) fn set_pipe_capacity(fd: BorrowedFd<'_>, requested: usize) -> Result<usize> {
    use nix::fcntl::{FcntlArg, fcntl};

    let mut target = requested;
    let granted = match fcntl(fd, FcntlArg::F_SETPIPE_SZ(target as libc::c_int)) {
        Ok(n) if n as usize >= requested => n,
        first => {
            if let Err(e) = first {
                warn!("failed to set pipe capacity to {requested}: {e}");
                if e == nix::errno::Errno::EPERM {
                    warn!("raising a pipe past the system limit requires privilege");
                }
            }
            target = match system_pipe_max() {
                Some(max) => requested.min(max),
                None => DEFAULT_PIPE_SIZE,
            };
            fcntl(fd, FcntlArg::F_SETPIPE_SZ(target as libc::c_int)).unwrap_or(0)
        }
    };

    if granted <= 0 {
        return Err(Error::Filesystem(io::Error::other(format!(
            "kernel granted pipe capacity {granted} (requested {target})"
        ))));
    }
    Ok(granted as usize)
}

/// Current capacity of a pipe in bytes.
pub(crate) fn pipe_capacity(fd: BorrowedFd<'_>) -> Result<usize> {
    use nix::fcntl::{FcntlArg, fcntl};
    let size = fcntl(fd, FcntlArg::F_GETPIPE_SZ)?;
    Ok(size.max(0) as usize)
}

nix::ioctl_read_bad!(ioctl_fionread, libc::FIONREAD, libc::c_int);

/// Number of bytes currently queued in the pipe behind `fd`.
pub(crate) fn bytes_queued(fd: BorrowedFd<'_>) -> Result<usize> {
    let mut queued: libc::c_int = 0;
    unsafe { ioctl_fionread(fd.as_raw_fd(), &mut queued) }?;
    Ok(queued.max(0) as usize)
}

/// Remove a file, tolerating its absence.
pub(crate) fn remove_file_quiet(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("failed to remove {}: {}", path.display(), e);
        }
    }
}

/// Remove a directory tree, tolerating its absence.
pub(crate) fn remove_tree_quiet(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("failed to remove {}: {}", path.display(), e);
        }
    }
}

/// Neutralize SIGPIPE so a vanished reader surfaces as `EPIPE` from `write`
/// instead of killing the process.
pub(crate) fn neutralize_sigpipe() {
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    if let Err(e) = unsafe { sigaction(Signal::SIGPIPE, &action) } {
        warn!("failed to ignore SIGPIPE: {e}");
    }
}

#[cfg(test)]
mod test {
    use std::os::fd::AsFd;

    use super::*;

    #[test]
    fn expand_bare_name() {
        assert_eq!(
            expand_location("imu0").unwrap(),
            PathBuf::from("/run/mpa/imu0/")
        );
        assert_eq!(
            expand_location("imu0/").unwrap(),
            PathBuf::from("/run/mpa/imu0/")
        );
    }

    #[test]
    fn expand_absolute_paths() {
        assert_eq!(expand_location("/foo/bar").unwrap(), PathBuf::from("/foo/bar/"));
        assert_eq!(expand_location("/foo").unwrap(), PathBuf::from("/foo/"));
    }

    #[test]
    fn expand_rejects_bad_input() {
        assert!(expand_location("").is_err());
        let long = "x".repeat(MAX_DIR_LEN + 1);
        assert!(expand_location(&long).is_err());
    }

    #[test]
    fn fifo_roundtrip_and_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        make_fifo(&path).unwrap();
        // second creation is a no-op
        make_fifo(&path).unwrap();

        let fd = open_rdwr(&path).unwrap();
        assert_eq!(bytes_queued(fd.as_fd()).unwrap(), 0);
        nix::unistd::write(&fd, b"abc").unwrap();
        assert_eq!(bytes_queued(fd.as_fd()).unwrap(), 3);

        let granted = set_pipe_capacity(fd.as_fd(), 64 * 1024).unwrap();
        assert!(granted >= 64 * 1024);
        assert_eq!(pipe_capacity(fd.as_fd()).unwrap(), granted);
    }

    #[test]
    fn writer_open_times_out_without_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        make_fifo(&path).unwrap();
        let err = open_writer_retry(&path, 3, Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }
}
