//! Publish/subscribe IPC over named pipes in a shared directory tree.
//!
//! A server owns a *topic*: a directory (conventionally under `/run/mpa/`)
//! holding a `request` FIFO, an optional `control` FIFO, a JSON `info`
//! file, and one data FIFO per subscriber. Clients discover the topic
//! through the filesystem, write a short name to `request`, and receive
//! the published stream on a private FIFO created for them.
//!
//! The publisher never blocks: every record is preceded by a queued-bytes
//! check against the pipe's kernel capacity, and a record that does not
//! fit is dropped whole for that subscriber only. A misbehaving or slow
//! subscriber loses data; it cannot stall the producer or its peers.
//!
//! ```no_run
//! use pipebus::{PipeServer, ServerFlags, TopicInfo};
//!
//! let server = PipeServer::new();
//! let channel = server.next_available_channel()?;
//! let mut info = TopicInfo::new("hello");
//! info.type_tag = "text".to_string();
//! info.server_name = "hello-server".to_string();
//! server.create(channel, info, ServerFlags::empty())?;
//! server.write_string(channel, "hello")?;
//! # Ok::<(), pipebus::Error>(())
//! ```
//!
//! Subscriber lifecycle is reported through connect/disconnect callbacks,
//! which run on the crate's listener threads (or on the producer thread
//! that observed a disconnect) and never under internal locks.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::error::{Error, Result};
pub use crate::fifo::{
    DEFAULT_BASE_DIR, DEFAULT_PIPE_SIZE, MAX_DIR_LEN, MAX_NAME_LEN, MAX_PATH_LEN, MAX_TYPE_LEN,
    expand_location, topic_exists,
};
pub use crate::info::{TopicInfo, read_info, read_info_document};
pub use crate::records::{
    CAMERA_MAGIC_NUMBER, CameraImageMeta, ImageFormat, POINT_CLOUD_MAGIC_NUMBER, PointCloudFormat,
    PointCloudMeta,
};
pub use crate::server::{
    ConnectCallback, ControlCallback, DisconnectCallback, MAX_CHANNELS, MAX_CLIENTS_PER_CHANNEL,
    PipeServer, RequestCallback, ServerFlags,
};
pub use crate::slot::ClientState;

mod error;
mod fifo;
mod info;
mod listener;
mod records;
mod server;
mod slot;
mod video;
