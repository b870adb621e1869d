//! Topic registry, lifecycle, and the fan-out publisher.
//!
//! A [`PipeServer`] owns a fixed table of topic cells addressed by integer
//! channel indices, which double as the public channel identifiers. Each
//! running topic owns a directory of FIFOs, a request listener thread, an
//! optional control listener thread, and a table of subscriber slots.
//!
//! Locking is layered claim -> topic -> slot: a single claim mutex guards
//! channel reservation, one mutex per topic serializes lifecycle and the
//! join handshake, and one mutex per slot serializes writes to that slot.
//! The publish path takes only the slot mutex, so a slow subscriber can
//! never stall the join handshake, the control loop, or another
//! subscriber.

use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use zerocopy::IntoBytes;

use crate::error::{Error, Result};
use crate::fifo;
use crate::info::{self, TopicInfo};
use crate::listener::{self, ListenerHandle};
use crate::records::{CAMERA_MAGIC_NUMBER, CameraImageMeta, POINT_CLOUD_MAGIC_NUMBER, PointCloudMeta};
use crate::slot::{ClientSlot, ClientState};
use crate::video;

/// Number of topic cells in a server's registry.
pub const MAX_CHANNELS: usize = 16;

/// Number of subscriber slots per topic.
pub const MAX_CLIENTS_PER_CHANNEL: usize = 32;

/// Bounded wait applied when joining each listener thread on close.
const LISTENER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

const DEFAULT_CONTROL_PIPE_SIZE: usize = 64 * 1024;
const DEFAULT_CONTROL_READ_BUF_SIZE: usize = 1024;
const PIPE_SIZE_SANE_MAX: usize = 256 * 1024 * 1024;

bitflags! {
    /// Feature flags applied at topic creation.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ServerFlags: u32 {
        /// Create a `control` FIFO and run a listener thread for it.
        const CONTROL_PIPE = 1 << 0;
        /// Accepted for compatibility with old clients; the info document
        /// is always served as a regular file.
        const INFO_PIPE = 1 << 1;
        /// Extra per-record diagnostics.
        const DEBUG = 1 << 2;
    }
}

/// Invoked from the request listener when a subscriber finishes attaching:
/// `(channel, client, assigned_name)`.
pub type ConnectCallback = dyn Fn(usize, usize, &str) + Send + Sync;
/// Invoked when a write to a subscriber fails terminally:
/// `(channel, client, assigned_name)`. Runs on whichever thread observed
/// the failure.
pub type DisconnectCallback = dyn Fn(usize, usize, &str) + Send + Sync;
/// Invoked with each command string read from the control FIFO:
/// `(channel, bytes)`.
pub type ControlCallback = dyn Fn(usize, &[u8]) + Send + Sync;
/// Invoked with the raw bytes of each join request after the client has
/// been provisioned: `(channel, raw_request, client)`.
pub type RequestCallback = dyn Fn(usize, &[u8], usize) + Send + Sync;

#[derive(Default)]
pub(crate) struct CallbackSet {
    pub(crate) connect: Mutex<Option<Arc<ConnectCallback>>>,
    pub(crate) disconnect: Mutex<Option<Arc<DisconnectCallback>>>,
    pub(crate) control: Mutex<Option<Arc<ControlCallback>>>,
    pub(crate) request: Mutex<Option<Arc<RequestCallback>>>,
}

impl CallbackSet {
    fn clear(&self) {
        *self.connect.lock() = None;
        *self.disconnect.lock() = None;
        *self.control.lock() = None;
        *self.request.lock() = None;
    }
}

/// Per-channel settings that survive create/close cycles.
struct ChannelConfig {
    control_pipe_size: usize,
    control_read_buf_size: usize,
    control_thread_priority: i32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            control_pipe_size: DEFAULT_CONTROL_PIPE_SIZE,
            control_read_buf_size: DEFAULT_CONTROL_READ_BUF_SIZE,
            control_thread_priority: 0,
        }
    }
}

struct ChannelCell {
    config: Mutex<ChannelConfig>,
    callbacks: Arc<CallbackSet>,
    topic: RwLock<Option<Arc<Topic>>>,
}

impl ChannelCell {
    fn empty() -> Self {
        ChannelCell {
            config: Mutex::new(ChannelConfig::default()),
            callbacks: Arc::new(CallbackSet::default()),
            topic: RwLock::new(None),
        }
    }
}

/// Mutable topic state behind the per-topic mutex.
pub(crate) struct TopicState {
    pub(crate) info: TopicInfo,
    pub(crate) doc: serde_json::Value,
}

/// One running topic.
pub(crate) struct Topic {
    pub(crate) index: usize,
    pub(crate) base_dir: PathBuf,
    pub(crate) request_path: PathBuf,
    pub(crate) control_path: Option<PathBuf>,
    pub(crate) info_path: PathBuf,
    pub(crate) request_fd: OwnedFd,
    pub(crate) control_fd: Option<OwnedFd>,
    pub(crate) control_read_buf_size: usize,
    pub(crate) control_thread_priority: i32,
    pub(crate) running: AtomicBool,
    /// Slots ever allocated this topic life; monotonic, published with
    /// release ordering once the newest slot is observable.
    pub(crate) n_clients: AtomicUsize,
    pub(crate) state: Mutex<TopicState>,
    pub(crate) slots: Vec<ClientSlot>,
    pub(crate) sticky_header: Mutex<Option<video::StickyHeader>>,
    pub(crate) callbacks: Arc<CallbackSet>,
    pub(crate) request_listener: ListenerHandle,
    pub(crate) control_listener: Option<ListenerHandle>,
}

impl Topic {
    pub(crate) fn slot_count(&self) -> usize {
        self.n_clients.load(Ordering::Acquire)
    }

    /// Write one record to one slot and fire the disconnect callback if
    /// this write was the one that discovered the peer is gone.
    pub(crate) fn write_record_to(&self, client: usize, chunks: &[&[u8]]) -> Result<()> {
        if client >= self.slot_count() {
            return Err(Error::InvalidArgument("client id out of range"));
        }
        let (result, hangup) = {
            let mut io = self.slots[client].io.lock();
            let was_live = io.is_live();
            let result = io.write_record(chunks);
            let hangup = was_live && io.state == Some(ClientState::Disconnected);
            (result, hangup.then(|| io.name.clone()))
        };
        if let Some(name) = hangup {
            debug!(
                "client {name} (id {client}) disconnected from channel {}",
                self.index
            );
            let cb = self.callbacks.disconnect.lock().clone();
            if let Some(cb) = cb {
                cb(self.index, client, &name);
            }
        }
        result
    }

    /// Fan one record out to every slot. Per-slot failures are the slot's
    /// own problem and never interrupt delivery to the others.
    pub(crate) fn broadcast(&self, chunks: &[&[u8]]) {
        for client in 0..self.slot_count() {
            let _ = self.write_record_to(client, chunks);
        }
    }

    pub(crate) fn accepting_p_frames(&self, client: usize) -> bool {
        self.slots[client].io.lock().accepting_p_frames
    }

    pub(crate) fn set_accepting_p_frames(&self, client: usize, accepting: bool) {
        self.slots[client].io.lock().accepting_p_frames = accepting;
    }
}

struct Registry {
    claim: Mutex<[bool; MAX_CHANNELS]>,
    cells: Vec<ChannelCell>,
}

impl Registry {
    fn cell(&self, channel: usize) -> Result<&ChannelCell> {
        self.cells.get(channel).ok_or(Error::ChannelOutOfBounds)
    }

    fn topic(&self, channel: usize) -> Result<Arc<Topic>> {
        self.cell(channel)?
            .topic
            .read()
            .clone()
            .ok_or(Error::NotRunning)
    }
}

/// A process-wide pipe server hosting up to [`MAX_CHANNELS`] topics.
///
/// All methods take `&self`; the server may be shared across producer
/// threads freely. Dropping the server closes every topic and removes its
/// directories.
pub struct PipeServer {
    registry: Arc<Registry>,
}

impl Default for PipeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PipeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let live: Vec<usize> = (0..MAX_CHANNELS)
            .filter(|&ch| self.registry.cells[ch].topic.read().is_some())
            .collect();
        f.debug_struct("PipeServer").field("live_channels", &live).finish()
    }
}

impl PipeServer {
    /// A server with every channel unclaimed.
    pub fn new() -> Self {
        PipeServer {
            registry: Arc::new(Registry {
                claim: Mutex::new([false; MAX_CHANNELS]),
                cells: (0..MAX_CHANNELS).map(|_| ChannelCell::empty()).collect(),
            }),
        }
    }

    /// Atomically reserve the lowest unclaimed channel index.
    pub fn next_available_channel(&self) -> Result<usize> {
        let mut claimed = self.registry.claim.lock();
        for (channel, taken) in claimed.iter_mut().enumerate() {
            if !*taken {
                *taken = true;
                return Ok(channel);
            }
        }
        Err(Error::Other)
    }

    /// Create a topic on `channel` and start listening for subscribers.
    ///
    /// `info.name` must be non-empty, contain no `/`, and not be the
    /// literal `unknown`. An empty or relative `info.location` is derived
    /// from the name under [`crate::DEFAULT_BASE_DIR`]; the canonical
    /// location and the server pid are written back into the advertised
    /// info document.
    pub fn create(&self, channel: usize, info: TopicInfo, flags: ServerFlags) -> Result<()> {
        let cell = self.registry.cell(channel)?;

        // claim the channel up front so concurrent allocators skip it
        let old_claim = {
            let mut claimed = self.registry.claim.lock();
            let old = claimed[channel];
            claimed[channel] = true;
            old
        };

        if cell.topic.read().is_some() {
            return Err(Error::AlreadyRunning);
        }

        let result = self.create_inner(channel, cell, info, flags);
        if result.is_err() && !old_claim {
            self.registry.claim.lock()[channel] = false;
        }
        result
    }

    fn create_inner(
        &self,
        channel: usize,
        cell: &ChannelCell,
        mut info: TopicInfo,
        flags: ServerFlags,
    ) -> Result<()> {
        if info.name.is_empty() {
            return Err(Error::InvalidArgument("empty pipe name"));
        }
        if info.name.contains('/') {
            return Err(Error::InvalidArgument("pipe name cannot contain '/'"));
        }
        if info.name == "unknown" {
            return Err(Error::InvalidArgument("pipe name cannot be 'unknown'"));
        }

        let dir = if info.location.starts_with('/') {
            fifo::expand_location(&info.location)?
        } else {
            fifo::expand_location(&info.name)?
        };
        info.location = dir.to_string_lossy().into_owned();
        info.server_pid = std::process::id() as i32;

        if info.size_bytes < 4096 {
            warn!(
                "channel {channel} requested pipe size {} below 4K, using 1M",
                info.size_bytes
            );
            info.size_bytes = fifo::DEFAULT_PIPE_SIZE;
        }
        if info.size_bytes > PIPE_SIZE_SANE_MAX {
            warn!("channel {channel} pipe size over 256MiB probably won't work");
        }

        for other in &self.registry.cells {
            if let Some(topic) = other.topic.read().as_ref() {
                if topic.base_dir == dir {
                    warn!(
                        "{} already in use by channel {}",
                        dir.display(),
                        topic.index
                    );
                    return Err(Error::DirectoryInUse);
                }
            }
        }

        let (control_pipe_size, control_read_buf_size, control_thread_priority) = {
            let config = cell.config.lock();
            (
                config.control_pipe_size,
                config.control_read_buf_size,
                config.control_thread_priority,
            )
        };

        // a vanished reader must surface as EPIPE, not kill the process
        fifo::neutralize_sigpipe();

        std::fs::create_dir_all(&dir).map_err(Error::Filesystem)?;

        match Self::build_topic(
            channel,
            cell,
            &dir,
            info,
            flags,
            control_pipe_size,
            control_read_buf_size,
            control_thread_priority,
        ) {
            Ok(topic) => {
                *cell.topic.write() = Some(Arc::clone(&topic));
                let spawned = listener::spawn_request_listener(&topic).and_then(|()| {
                    if topic.control_listener.is_some() {
                        listener::spawn_control_listener(&topic)
                    } else {
                        Ok(())
                    }
                });
                if let Err(e) = spawned {
                    *cell.topic.write() = None;
                    topic.running.store(false, Ordering::SeqCst);
                    topic.request_listener.wake();
                    fifo::remove_tree_quiet(&dir);
                    return Err(e);
                }
                info!("channel {channel} serving topic at {}", dir.display());
                Ok(())
            }
            Err(e) => {
                fifo::remove_tree_quiet(&dir);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_topic(
        channel: usize,
        cell: &ChannelCell,
        dir: &std::path::Path,
        info: TopicInfo,
        flags: ServerFlags,
        control_pipe_size: usize,
        control_read_buf_size: usize,
        control_thread_priority: i32,
    ) -> Result<Arc<Topic>> {
        let doc = info::document_from_info(&info)?;
        let info_path = dir.join("info");
        info::write_document(&info_path, &doc)?;

        let request_path = dir.join("request");
        fifo::make_fifo(&request_path)?;
        // held open read-write so the fd stays valid with no client around
        let request_fd = fifo::open_rdwr(&request_path)?;

        let (control_path, control_fd) = if flags.contains(ServerFlags::CONTROL_PIPE) {
            let path = dir.join("control");
            fifo::make_fifo(&path)?;
            let fd = fifo::open_rdwr(&path)?;
            let granted = fifo::set_pipe_capacity(fd.as_fd(), control_pipe_size)?;
            if granted < control_pipe_size {
                return Err(Error::Filesystem(std::io::Error::other(format!(
                    "control pipe capacity {granted} below requested {control_pipe_size}"
                ))));
            }
            (Some(path), Some(fd))
        } else {
            (None, None)
        };

        if flags.contains(ServerFlags::INFO_PIPE) {
            debug!("channel {channel} info pipe flag set; info is served as a regular file");
        }

        let control_listener = if control_fd.is_some() {
            Some(ListenerHandle::new()?)
        } else {
            None
        };

        Ok(Arc::new(Topic {
            index: channel,
            base_dir: dir.to_path_buf(),
            request_path,
            control_path,
            info_path,
            request_fd,
            control_fd,
            control_read_buf_size,
            control_thread_priority,
            running: AtomicBool::new(true),
            n_clients: AtomicUsize::new(0),
            state: Mutex::new(TopicState { info, doc }),
            slots: (0..MAX_CLIENTS_PER_CHANNEL)
                .map(|_| ClientSlot::empty())
                .collect(),
            sticky_header: Mutex::new(None),
            callbacks: Arc::clone(&cell.callbacks),
            request_listener: ListenerHandle::new()?,
            control_listener,
        }))
    }

    /// Stop a topic: cancel and join its listeners, close every pipe, and
    /// remove the topic directory. Closing a channel that is not running
    /// is a no-op.
    pub fn close(&self, channel: usize) -> Result<()> {
        let cell = self.registry.cell(channel)?;
        let Some(topic) = cell.topic.write().take() else {
            return Ok(());
        };

        topic.running.store(false, Ordering::SeqCst);
        // drop callbacks first so late events from the dying listeners and
        // producer threads are discarded
        cell.callbacks.clear();

        topic.request_listener.wake();
        topic.request_listener.join(LISTENER_JOIN_TIMEOUT);
        if let Some(control) = &topic.control_listener {
            control.wake();
            control.join(LISTENER_JOIN_TIMEOUT);
        }

        for slot in &topic.slots {
            let mut io = slot.io.lock();
            io.fd = None;
            io.state = None;
            io.name.clear();
            io.accepting_p_frames = false;
        }
        topic.n_clients.store(0, Ordering::SeqCst);

        fifo::remove_file_quiet(&topic.request_path);
        if let Some(path) = &topic.control_path {
            fifo::remove_file_quiet(path);
        }
        fifo::remove_tree_quiet(&topic.base_dir);

        self.registry.claim.lock()[channel] = false;
        info!("channel {channel} closed");
        Ok(())
    }

    /// Close every running topic.
    pub fn close_all(&self) {
        for channel in 0..MAX_CHANNELS {
            let _ = self.close(channel);
        }
    }

    /// Provision a client slot directly, exactly as if `name` had arrived
    /// on the request FIFO. Returns the client id.
    pub fn add_client(&self, channel: usize, name: &str) -> Result<usize> {
        let topic = self.registry.topic(channel)?;
        listener::add_client(&topic, name.as_bytes())
    }

    /// Publish one record to every subscriber.
    ///
    /// Always succeeds once the topic is resolved; per-slot outcomes are
    /// only observable through the disconnect callback and the client
    /// queries.
    pub fn write(&self, channel: usize, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidArgument("empty record"));
        }
        let topic = self.registry.topic(channel)?;
        topic.broadcast(&[data]);
        Ok(())
    }

    /// Publish one record supplied as an ordered list of chunks. The
    /// capacity check covers the total, so subscribers see the whole
    /// record or none of it.
    pub fn write_list(&self, channel: usize, chunks: &[&[u8]]) -> Result<()> {
        if chunks.is_empty() {
            return Err(Error::InvalidArgument("no chunks to send"));
        }
        if chunks.iter().any(|chunk| chunk.is_empty()) {
            return Err(Error::InvalidArgument("empty chunk"));
        }
        let topic = self.registry.topic(channel)?;
        topic.broadcast(chunks);
        Ok(())
    }

    /// Publish one record to a single subscriber.
    pub fn write_to_client(&self, channel: usize, client: usize, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidArgument("empty record"));
        }
        let topic = self.registry.topic(channel)?;
        topic.write_record_to(client, &[data])
    }

    /// Publish a string record including its NUL terminator.
    pub fn write_string(&self, channel: usize, text: &str) -> Result<()> {
        if text.is_empty() {
            return Err(Error::InvalidArgument("empty string"));
        }
        let mut record = Vec::with_capacity(text.len() + 1);
        record.extend_from_slice(text.as_bytes());
        record.push(0);
        self.write(channel, &record)
    }

    /// Publish a camera frame as a metadata-then-payload record.
    ///
    /// H.264/H.265 frames are routed through the encoded-video gate:
    /// headers are held for attach replay, and P-frames are withheld from
    /// subscribers that have not yet received an I-frame. The magic number
    /// is filled in here. Encoded payloads must use the Annex-B 4-byte
    /// start code framing.
    pub fn write_camera_frame(
        &self,
        channel: usize,
        meta: CameraImageMeta,
        payload: &[u8],
    ) -> Result<()> {
        let topic = self.registry.topic(channel)?;
        video::publish_camera_frame(&topic, meta, payload)
    }

    /// Publish a stereo frame as a metadata, left-half, right-half record.
    /// `meta.size_bytes` covers both halves together.
    pub fn write_stereo_frame(
        &self,
        channel: usize,
        mut meta: CameraImageMeta,
        left: &[u8],
        right: &[u8],
    ) -> Result<()> {
        let size = meta.size_bytes;
        if size <= 0 {
            return Err(Error::InvalidArgument("frame size must be positive"));
        }
        if size % 2 != 0 {
            return Err(Error::InvalidArgument("stereo frame size must be even"));
        }
        let half = size as usize / 2;
        if left.len() != half || right.len() != half {
            return Err(Error::InvalidArgument("stereo halves do not match metadata size"));
        }
        meta.magic_number = CAMERA_MAGIC_NUMBER;
        let topic = self.registry.topic(channel)?;
        topic.broadcast(&[meta.as_bytes(), left, right]);
        Ok(())
    }

    /// Publish a point cloud as a metadata-then-payload record. The
    /// payload length must match the size implied by `(n_points, format)`.
    pub fn write_point_cloud(
        &self,
        channel: usize,
        mut meta: PointCloudMeta,
        payload: &[u8],
    ) -> Result<()> {
        meta.magic_number = POINT_CLOUD_MAGIC_NUMBER;
        let expected = meta.payload_size()?;
        if payload.len() != expected {
            return Err(Error::InvalidArgument("payload does not match point count"));
        }
        let topic = self.registry.topic(channel)?;
        topic.broadcast(&[meta.as_bytes(), payload]);
        Ok(())
    }

    /// Number of subscribers currently initialized or connected.
    pub fn num_clients(&self, channel: usize) -> Result<usize> {
        let topic = self.registry.topic(channel)?;
        let live = (0..topic.slot_count())
            .filter(|&client| topic.slots[client].io.lock().is_live())
            .count();
        Ok(live)
    }

    /// Lifecycle state of one subscriber slot.
    pub fn client_state(&self, channel: usize, client: usize) -> Result<ClientState> {
        let topic = self.registry.topic(channel)?;
        if client >= MAX_CLIENTS_PER_CHANNEL {
            return Err(Error::InvalidArgument("client id out of range"));
        }
        topic.slots[client]
            .io
            .lock()
            .state
            .ok_or(Error::NotConnected)
    }

    /// Look up a subscriber by its assigned name.
    pub fn client_id_from_name(&self, channel: usize, name: &str) -> Result<Option<usize>> {
        let topic = self.registry.topic(channel)?;
        for client in 0..topic.slot_count() {
            if topic.slots[client].io.lock().name == name {
                return Ok(Some(client));
            }
        }
        Ok(None)
    }

    /// Assigned name of a subscriber slot, if it has ever been attached.
    pub fn client_name_from_id(&self, channel: usize, client: usize) -> Result<Option<String>> {
        let topic = self.registry.topic(channel)?;
        if client >= MAX_CLIENTS_PER_CHANNEL {
            return Err(Error::InvalidArgument("client id out of range"));
        }
        let io = topic.slots[client].io.lock();
        if io.name.is_empty() {
            Ok(None)
        } else {
            Ok(Some(io.name.clone()))
        }
    }

    /// Bytes currently queued in a subscriber's pipe.
    pub fn bytes_in_pipe(&self, channel: usize, client: usize) -> Result<usize> {
        let topic = self.registry.topic(channel)?;
        if client >= topic.slot_count() {
            return Err(Error::InvalidArgument("client id out of range"));
        }
        let io = topic.slots[client].io.lock();
        let fd = io.fd.as_ref().ok_or(Error::NotConnected)?;
        fifo::bytes_queued(fd.as_fd())
    }

    /// Kernel capacity of a subscriber's pipe.
    pub fn pipe_size(&self, channel: usize, client: usize) -> Result<usize> {
        let topic = self.registry.topic(channel)?;
        if client >= topic.slot_count() {
            return Err(Error::InvalidArgument("client id out of range"));
        }
        let io = topic.slots[client].io.lock();
        let fd = io.fd.as_ref().ok_or(Error::NotConnected)?;
        fifo::pipe_capacity(fd.as_fd())
    }

    /// Resize a subscriber's pipe, returning the capacity the kernel
    /// granted. The granted size replaces the slot's capacity bound so the
    /// backpressure check stays truthful.
    pub fn set_pipe_size(&self, channel: usize, client: usize, size_bytes: usize) -> Result<usize> {
        let topic = self.registry.topic(channel)?;
        if client >= topic.slot_count() {
            return Err(Error::InvalidArgument("client id out of range"));
        }
        let mut io = topic.slots[client].io.lock();
        let fd = io.fd.as_ref().ok_or(Error::NotConnected)?;
        let granted = fifo::set_pipe_capacity(fd.as_fd(), size_bytes)?;
        io.capacity = granted;
        Ok(granted)
    }

    /// Configure the control FIFO capacity and listener read buffer size.
    /// Must be called before [`PipeServer::create`].
    pub fn set_control_pipe_size(
        &self,
        channel: usize,
        pipe_size: usize,
        read_buf_size: usize,
    ) -> Result<()> {
        let cell = self.registry.cell(channel)?;
        if cell.topic.read().is_some() {
            return Err(Error::AlreadyRunning);
        }
        if pipe_size == 0 || read_buf_size == 0 {
            return Err(Error::InvalidArgument("sizes must be positive"));
        }
        if pipe_size > PIPE_SIZE_SANE_MAX {
            warn!("channel {channel} control pipe size over 256MiB probably won't work");
        }
        let mut config = cell.config.lock();
        config.control_pipe_size = pipe_size;
        config.control_read_buf_size = read_buf_size;
        Ok(())
    }

    /// Configure the control listener's scheduling priority: 0 inherits
    /// the process default, 1-99 selects realtime FIFO scheduling. Must be
    /// called before [`PipeServer::create`].
    pub fn set_control_thread_priority(&self, channel: usize, priority: i32) -> Result<()> {
        let cell = self.registry.cell(channel)?;
        if !(0..=99).contains(&priority) {
            return Err(Error::InvalidArgument("priority must be in 0..=99"));
        }
        if cell.topic.read().is_some() {
            return Err(Error::AlreadyRunning);
        }
        cell.config.lock().control_thread_priority = priority;
        Ok(())
    }

    /// Register the connect callback. See [`ConnectCallback`] for the
    /// threading contract.
    pub fn set_connect_callback(
        &self,
        channel: usize,
        callback: impl Fn(usize, usize, &str) + Send + Sync + 'static,
    ) -> Result<()> {
        let cell = self.registry.cell(channel)?;
        *cell.callbacks.connect.lock() = Some(Arc::new(callback));
        Ok(())
    }

    /// Register the disconnect callback.
    pub fn set_disconnect_callback(
        &self,
        channel: usize,
        callback: impl Fn(usize, usize, &str) + Send + Sync + 'static,
    ) -> Result<()> {
        let cell = self.registry.cell(channel)?;
        *cell.callbacks.disconnect.lock() = Some(Arc::new(callback));
        Ok(())
    }

    /// Register the control callback, invoked with each command string
    /// read from the control FIFO.
    pub fn set_control_callback(
        &self,
        channel: usize,
        callback: impl Fn(usize, &[u8]) + Send + Sync + 'static,
    ) -> Result<()> {
        let cell = self.registry.cell(channel)?;
        *cell.callbacks.control.lock() = Some(Arc::new(callback));
        Ok(())
    }

    /// Register the request callback, invoked with the raw bytes of each
    /// join request after the client has been provisioned.
    pub fn set_request_callback(
        &self,
        channel: usize,
        callback: impl Fn(usize, &[u8], usize) + Send + Sync + 'static,
    ) -> Result<()> {
        let cell = self.registry.cell(channel)?;
        *cell.callbacks.request.lock() = Some(Arc::new(callback));
        Ok(())
    }

    /// Mutate the live info document. Changes become visible to clients
    /// after the next [`PipeServer::update_info`].
    pub fn with_info_json<R>(
        &self,
        channel: usize,
        mutate: impl FnOnce(&mut serde_json::Value) -> R,
    ) -> Result<R> {
        let topic = self.registry.topic(channel)?;
        let mut state = topic.state.lock();
        Ok(mutate(&mut state.doc))
    }

    /// Rewrite the topic's `info` file from the live document.
    pub fn update_info(&self, channel: usize) -> Result<()> {
        let topic = self.registry.topic(channel)?;
        let state = topic.state.lock();
        info::write_document(&topic.info_path, &state.doc)
    }

    /// Replace the advertised `available_commands` array with the entries
    /// of a comma-separated list and persist the info document.
    pub fn set_available_control_commands(&self, channel: usize, commands: &str) -> Result<()> {
        let topic = self.registry.topic(channel)?;
        let mut state = topic.state.lock();
        info::set_available_commands(&mut state.doc, commands);
        info::write_document(&topic.info_path, &state.doc)
    }
}

impl Drop for PipeServer {
    fn drop(&mut self) {
        self.close_all();
    }
}
