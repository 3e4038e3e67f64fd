//! File-backed tag images.
//!
//! A tag image is a small JSON document standing in for a physical tag on
//! hosts without tag hardware:
//!
//! ```json
//! { "capacity": 137, "writable": true, "ndef": "0Ao..." }
//! ```
//!
//! `ndef` holds the encoded NDEF message in standard base64 and is empty for
//! a blank tag.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::ndef::NdefMessage;
use crate::transport::{ScanAction, ScanEvent, TagAdapter, TagIoError, TagSession};

/// NTAG215, the usual sticker size.
pub const DEFAULT_CAPACITY: usize = 496;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageDoc {
    capacity: usize,
    writable: bool,
    #[serde(default)]
    ndef: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("no tag image at {}", .0.display())]
    Missing(PathBuf),
    #[error("tag image {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("tag image {} is not valid: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },
}

#[derive(Debug, Clone)]
pub struct TagImage {
    path: PathBuf,
    capacity: usize,
    writable: bool,
    raw: Vec<u8>,
    connected: bool,
}

impl TagImage {
    /// Create (or overwrite) a blank image.
    pub fn format(path: &Path, capacity: usize, writable: bool) -> Result<Self, ImageError> {
        let image = Self {
            path: path.to_path_buf(),
            capacity,
            writable,
            raw: Vec::new(),
            connected: false,
        };
        image.persist().map_err(|source| ImageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), capacity, writable, "formatted tag image");
        Ok(image)
    }

    pub fn open(path: &Path) -> Result<Self, ImageError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ImageError::Missing(path.to_path_buf()))
            }
            Err(source) => {
                return Err(ImageError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let invalid = |reason: String| ImageError::Invalid {
            path: path.to_path_buf(),
            reason,
        };
        let doc: ImageDoc = serde_json::from_slice(&data).map_err(|e| invalid(e.to_string()))?;
        let raw = STANDARD
            .decode(doc.ndef.trim())
            .map_err(|e| invalid(format!("ndef field: {}", e)))?;
        Ok(Self {
            path: path.to_path_buf(),
            capacity: doc.capacity,
            writable: doc.writable,
            raw,
            connected: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Size of the stored NDEF message in bytes.
    pub fn used(&self) -> usize {
        self.raw.len()
    }

    /// The stored message. A blank or corrupt image has none.
    pub fn message(&self) -> Option<NdefMessage> {
        if self.raw.is_empty() {
            return None;
        }
        match NdefMessage::parse(&self.raw) {
            Ok(message) => Some(message),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "ignoring unreadable NDEF data");
                None
            }
        }
    }

    /// A scan of this image as the platform would deliver it.
    pub fn scan_event(self) -> ScanEvent {
        let mut event = ScanEvent::new(ScanAction::NdefDiscovered);
        if let Some(message) = self.message() {
            event = event.with_message(message);
        }
        event.with_tag(Box::new(self))
    }

    fn persist(&self) -> std::io::Result<()> {
        let doc = ImageDoc {
            capacity: self.capacity,
            writable: self.writable,
            ndef: STANDARD.encode(&self.raw),
        };
        let mut bytes = serde_json::to_vec_pretty(&doc).map_err(std::io::Error::other)?;
        bytes.push(b'\n');
        atomic_write_bytes(&self.path, &bytes)
    }
}

impl TagSession for TagImage {
    fn max_size(&self) -> usize {
        self.capacity
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn connect(&mut self) -> Result<(), TagIoError> {
        if !self.path.exists() {
            return Err(TagIoError::Lost);
        }
        self.connected = true;
        Ok(())
    }

    fn write_message(&mut self, message: &NdefMessage) -> Result<(), TagIoError> {
        if !self.connected {
            return Err(TagIoError::Lost);
        }
        let raw = message
            .to_bytes()
            .map_err(|e| TagIoError::Format(e.to_string()))?;
        let previous = std::mem::replace(&mut self.raw, raw);
        if let Err(err) = self.persist() {
            self.raw = previous;
            return Err(err.into());
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), TagIoError> {
        self.connected = false;
        Ok(())
    }
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tag");
    let tmp = path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)
}

/// Adapter over a directory of tag images. "Hardware" is present when the
/// directory exists.
#[derive(Debug)]
pub struct ImageAdapter {
    dir: PathBuf,
    dispatching: AtomicBool,
}

impl ImageAdapter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            dispatching: AtomicBool::new(false),
        }
    }

    pub fn is_dispatching(&self) -> bool {
        self.dispatching.load(Ordering::SeqCst)
    }
}

impl TagAdapter for ImageAdapter {
    fn is_enabled(&self) -> bool {
        self.dir.is_dir()
    }

    fn enable_foreground_dispatch(&self) {
        self.dispatching.store(true, Ordering::SeqCst);
        tracing::debug!(dir = %self.dir.display(), "foreground dispatch enabled");
    }

    fn disable_foreground_dispatch(&self) {
        self.dispatching.store(false, Ordering::SeqCst);
        tracing::debug!(dir = %self.dir.display(), "foreground dispatch disabled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{self, TagFailure, CONTENT_TYPE};

    #[test]
    fn blank_image_scans_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("blank.tag");
        TagImage::format(&path, DEFAULT_CAPACITY, true).expect("format");
        let image = TagImage::open(&path).expect("open");
        assert_eq!(image.used(), 0);
        assert!(image.message().is_none());
        assert!(transport::read(&image.scan_event()).is_empty());
    }

    #[test]
    fn flashed_script_persists_across_opens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tags").join("desk.tag");
        TagImage::format(&path, DEFAULT_CAPACITY, true).expect("format");

        let script = b"#!/bin/sh\necho from the desk tag\n";
        let mut event = TagImage::open(&path).expect("open").scan_event();
        transport::write(&mut event, script).expect("write");

        let reopened = TagImage::open(&path).expect("reopen");
        assert!(reopened.used() > CONTENT_TYPE.len());
        assert_eq!(transport::read(&reopened.scan_event()), script);
    }

    #[test]
    fn read_only_image_is_not_modified() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ro.tag");
        TagImage::format(&path, DEFAULT_CAPACITY, false).expect("format");
        let before = fs::read(&path).expect("read");
        let mut event = TagImage::open(&path).expect("open").scan_event();
        assert_eq!(transport::write(&mut event, b"echo hi"), Err(TagFailure::NotWritable));
        assert_eq!(fs::read(&path).expect("read"), before);
    }

    #[test]
    fn removed_image_reports_tag_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gone.tag");
        TagImage::format(&path, DEFAULT_CAPACITY, true).expect("format");
        let mut event = TagImage::open(&path).expect("open").scan_event();
        fs::remove_file(&path).expect("remove");
        assert_eq!(transport::write(&mut event, b"echo hi"), Err(TagFailure::TagRemoved));
    }

    #[test]
    fn missing_and_corrupt_images_are_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.tag");
        assert!(matches!(TagImage::open(&missing), Err(ImageError::Missing(_))));

        let corrupt = dir.path().join("corrupt.tag");
        fs::write(&corrupt, b"{\"capacity\": 10, \"writable\": true, \"ndef\": \"***\"}").expect("write");
        assert!(matches!(TagImage::open(&corrupt), Err(ImageError::Invalid { .. })));
    }

    #[test]
    fn adapter_tracks_directory_and_dispatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = ImageAdapter::new(dir.path());
        assert!(adapter.is_enabled());
        adapter.enable_foreground_dispatch();
        assert!(adapter.is_dispatching());
        adapter.disable_foreground_dispatch();
        assert!(!adapter.is_dispatching());
        assert!(!ImageAdapter::new(dir.path().join("absent")).is_enabled());
    }
}
