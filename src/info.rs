//! The per-topic `info` document.
//!
//! Every topic directory carries a regular JSON file named `info` that
//! advertises the topic to prospective subscribers. The server keeps a live
//! JSON tree in memory; the host application may graft arbitrary fields
//! onto it (lens calibration, available commands, ...) and persist it again
//! at any time.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::fifo::{self, DEFAULT_PIPE_SIZE};

/// The fixed subset of the info document.
///
/// Extra fields added by the application live only in the JSON tree, not
/// here; [`read_info`] ignores them when parsing the document back.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopicInfo {
    /// Short topic name, e.g. `imu0`.
    pub name: String,
    /// Full topic directory, e.g. `/run/mpa/imu0/`. May be left empty, in
    /// which case it is derived from `name` under the default root.
    pub location: String,
    /// Advertised payload type tag, e.g. `camera_image_metadata`.
    #[serde(rename = "type")]
    pub type_tag: String,
    /// Display name of the owning server process.
    pub server_name: String,
    /// Pipe capacity requested for each subscriber's data FIFO.
    pub size_bytes: usize,
    /// Process id of the owning server, filled in at topic creation.
    pub server_pid: i32,
}

impl TopicInfo {
    /// Info for a topic called `name`, with every other field at its
    /// default. The defaults advertise nothing useful; set `type_tag` and
    /// `server_name` before creating the topic.
    pub fn new(name: impl Into<String>) -> Self {
        TopicInfo {
            name: name.into(),
            location: String::new(),
            type_tag: "unknown".to_string(),
            server_name: "unknown".to_string(),
            size_bytes: DEFAULT_PIPE_SIZE,
            server_pid: 0,
        }
    }
}

/// Build the live JSON tree from the fixed info fields.
pub(crate) fn document_from_info(info: &TopicInfo) -> Result<Value> {
    serde_json::to_value(info).map_err(|_| Error::Other)
}

/// Persist the document to the `info` file.
///
/// The document is written to a sibling temp file and renamed into place so
/// readers never observe a half-written file.
pub(crate) fn write_document(path: &Path, doc: &Value) -> Result<()> {
    let mut text = serde_json::to_string_pretty(doc).map_err(|_| Error::Other)?;
    text.push('\n');
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Replace the document's `available_commands` array with the entries of a
/// comma-separated list.
pub(crate) fn set_available_commands(doc: &mut Value, commands: &str) {
    let list: Vec<Value> = commands
        .split(',')
        .filter(|token| !token.is_empty())
        .map(|token| Value::String(token.to_string()))
        .collect();
    doc["available_commands"] = Value::Array(list);
}

/// Read and parse a topic's info document into the fixed info fields.
///
/// Accepts a bare topic name (resolved under the default root) or a full
/// location path, like the other discovery helpers.
pub fn read_info(name_or_location: &str) -> Result<TopicInfo> {
    let doc = read_info_document(name_or_location)?;
    serde_json::from_value(doc).map_err(|_| Error::InfoNotAvailable)
}

/// Read a topic's complete info document, including application fields.
pub fn read_info_document(name_or_location: &str) -> Result<Value> {
    let dir = fifo::expand_location(name_or_location)?;
    let text = fs::read_to_string(dir.join("info")).map_err(|_| Error::InfoNotAvailable)?;
    serde_json::from_str(&text).map_err(|_| Error::InfoNotAvailable)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn document_has_required_keys() {
        let mut info = TopicInfo::new("imu0");
        info.location = "/run/mpa/imu0/".to_string();
        info.server_pid = 42;
        let doc = document_from_info(&info).unwrap();
        for key in ["name", "location", "type", "server_name", "size_bytes", "server_pid"] {
            assert!(doc.get(key).is_some(), "missing {key}");
        }
        assert_eq!(doc["name"], "imu0");
        assert_eq!(doc["server_pid"], 42);
        assert_eq!(doc["size_bytes"], DEFAULT_PIPE_SIZE);
    }

    #[test]
    fn available_commands_replaced() {
        let info = TopicInfo::new("t");
        let mut doc = document_from_info(&info).unwrap();
        set_available_commands(&mut doc, "reset,start_logging,stop_logging");
        let cmds = doc["available_commands"].as_array().unwrap();
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[0], "reset");
        // a second call replaces rather than appends
        set_available_commands(&mut doc, "reset");
        assert_eq!(doc["available_commands"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info");
        let mut info = TopicInfo::new("hello");
        info.location = format!("{}/", dir.path().display());
        let mut doc = document_from_info(&info).unwrap();
        doc["description"] = Value::String("greeting stream".to_string());
        write_document(&path, &doc).unwrap();

        let parsed = read_info_document(&info.location).unwrap();
        assert_eq!(parsed["description"], "greeting stream");
        let fixed = read_info(&info.location).unwrap();
        assert_eq!(fixed.name, "hello");
    }
}
