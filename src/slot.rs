//! Per-subscriber slot state and the non-blocking record write primitive.

use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::fifo;

/// Lifecycle state of a subscriber slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientState {
    /// The slot's FIFO is open for writing but no write has succeeded yet;
    /// the peer may still be opening its read end.
    Initialized,
    /// At least one record has been delivered.
    Connected,
    /// A write failed terminally. The FIFO has been unlinked and the name
    /// is free for the peer to reclaim by rejoining.
    Disconnected,
}

/// One subscriber slot. The mutex serializes writes to this slot only;
/// writes to different slots proceed in parallel.
pub(crate) struct ClientSlot {
    pub(crate) io: Mutex<SlotIo>,
}

impl ClientSlot {
    pub(crate) fn empty() -> Self {
        ClientSlot {
            io: Mutex::new(SlotIo::default()),
        }
    }
}

/// Everything behind a slot's mutex.
#[derive(Default)]
pub(crate) struct SlotIo {
    /// Assigned (suffix-disambiguated) name. Survives disconnection so a
    /// rejoining peer can be matched back to its old slot.
    pub(crate) name: String,
    pub(crate) path: PathBuf,
    pub(crate) fd: Option<OwnedFd>,
    /// Pipe capacity as actually granted by the kernel, the bound for the
    /// backpressure check.
    pub(crate) capacity: usize,
    /// `None` until the slot is first allocated.
    pub(crate) state: Option<ClientState>,
    /// Encoded video only: the slot has seen an I-frame since it last
    /// (re)joined and may receive P-frames.
    pub(crate) accepting_p_frames: bool,
}

enum WriteAttempt {
    Delivered,
    Partial { chunk: usize, wrote: usize, expected: usize },
    Congested,
    Terminal(nix::errno::Errno),
}

impl SlotIo {
    pub(crate) fn is_live(&self) -> bool {
        matches!(
            self.state,
            Some(ClientState::Initialized) | Some(ClientState::Connected)
        )
    }

    /// Write one record, supplied as an ordered run of chunks, to the
    /// slot's pipe.
    ///
    /// The record is dropped whole if the pipe lacks room for all chunks
    /// together; the producer never blocks. A terminal write error drives
    /// the slot to [`ClientState::Disconnected`] and unlinks its FIFO (the
    /// caller is responsible for firing the disconnect callback once the
    /// slot mutex is released).
    pub(crate) fn write_record(&mut self, chunks: &[&[u8]]) -> Result<()> {
        if !self.is_live() {
            return Err(Error::NotConnected);
        }
        let Some(fd) = &self.fd else {
            return Err(Error::NotConnected);
        };

        let total: usize = chunks.iter().map(|c| c.len()).sum();
        let queued = match fifo::bytes_queued(fd.as_fd()) {
            Ok(n) => n,
            Err(_) => {
                // the fd is beyond queries, let the write path classify it
                0
            }
        };
        if queued + total > self.capacity {
            debug!(
                "client {} pipe backed up ({queued} of {} queued), dropping {total} byte record",
                self.name, self.capacity
            );
            return Err(Error::Backpressure);
        }

        let mut attempt = WriteAttempt::Delivered;
        for (i, chunk) in chunks.iter().enumerate() {
            match nix::unistd::write(fd.as_fd(), chunk) {
                Ok(n) if n == chunk.len() => continue,
                Ok(n) => {
                    attempt = WriteAttempt::Partial {
                        chunk: i,
                        wrote: n,
                        expected: chunk.len(),
                    };
                    break;
                }
                Err(nix::errno::Errno::EAGAIN) => {
                    attempt = WriteAttempt::Congested;
                    break;
                }
                Err(e) => {
                    attempt = WriteAttempt::Terminal(e);
                    break;
                }
            }
        }

        match attempt {
            WriteAttempt::Delivered => {
                self.state = Some(ClientState::Connected);
                Ok(())
            }
            WriteAttempt::Partial { chunk, wrote, expected } => {
                warn!(
                    "client {} pipe full mid-record: chunk {chunk} took {wrote} of {expected} bytes",
                    self.name
                );
                Err(Error::Backpressure)
            }
            WriteAttempt::Congested => {
                debug!("client {} pipe refused a {total} byte record", self.name);
                Err(Error::Backpressure)
            }
            WriteAttempt::Terminal(errno) => {
                debug!("client {} write failed ({errno}), disconnecting", self.name);
                self.disconnect();
                Err(Error::NotConnected)
            }
        }
    }

    /// Close the pipe and unlink its path, freeing the name for a rejoin.
    pub(crate) fn disconnect(&mut self) {
        self.fd = None;
        self.state = Some(ClientState::Disconnected);
        self.accepting_p_frames = false;
        if !self.path.as_os_str().is_empty() {
            fifo::remove_file_quiet(&self.path);
        }
    }

    /// Reset the slot for a fresh attach, keeping the recorded name.
    pub(crate) fn attach(&mut self, fd: OwnedFd, capacity: usize) {
        self.fd = Some(fd);
        self.capacity = capacity;
        self.state = Some(ClientState::Initialized);
        self.accepting_p_frames = false;
    }
}
