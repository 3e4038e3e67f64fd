//! Moving script payloads on and off a proximity tag.
//!
//! A tag holds a single NDEF message whose first record carries the
//! compressed script under [`CONTENT_TYPE`]. The hardware side is reached
//! through [`TagSession`] and [`TagAdapter`] so the same read/write rules
//! apply to a real radio, a tag image on disk, or a test double.

use crate::codec;
use crate::ndef::{NdefMessage, NdefRecord};

/// Content type of the script record. It is stored on the tag, so it counts
/// against capacity.
pub const CONTENT_TYPE: &str = "text/tagsh";

/// Why a write did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TagFailure {
    #[error("there is no scanned tag")]
    NoTagPresent,
    #[error("contents are too large for this tag")]
    TooLarge,
    #[error("tag is not writable")]
    NotWritable,
    #[error("there was an internal error formatting the tag")]
    Malformed,
    #[error("tag was removed from the device")]
    TagRemoved,
}

/// Low-level failures a tag session can report.
#[derive(Debug, thiserror::Error)]
pub enum TagIoError {
    #[error("malformed NDEF data: {0}")]
    Format(String),
    #[error("tag I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("tag connection lost")]
    Lost,
}

impl From<TagIoError> for TagFailure {
    fn from(err: TagIoError) -> Self {
        match err {
            TagIoError::Format(_) => TagFailure::Malformed,
            TagIoError::Io(_) | TagIoError::Lost => TagFailure::TagRemoved,
        }
    }
}

/// An NDEF-capable tag in range.
pub trait TagSession: Send {
    /// Largest NDEF message, in bytes, the tag accepts.
    fn max_size(&self) -> usize;
    fn is_writable(&self) -> bool;
    fn connect(&mut self) -> Result<(), TagIoError>;
    fn write_message(&mut self, message: &NdefMessage) -> Result<(), TagIoError>;
    fn close(&mut self) -> Result<(), TagIoError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAction {
    NdefDiscovered,
    TagDiscovered,
    Other,
}

/// What the platform delivers when a tag is scanned: the messages it had
/// already read, plus a handle to the tag for writing.
pub struct ScanEvent {
    pub action: ScanAction,
    pub messages: Vec<NdefMessage>,
    pub tag: Option<Box<dyn TagSession>>,
}

impl ScanEvent {
    pub fn new(action: ScanAction) -> Self {
        Self {
            action,
            messages: Vec::new(),
            tag: None,
        }
    }

    pub fn with_message(mut self, message: NdefMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_tag(mut self, tag: Box<dyn TagSession>) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn is_tag_scan(&self) -> bool {
        matches!(
            self.action,
            ScanAction::NdefDiscovered | ScanAction::TagDiscovered
        )
    }
}

/// Script bytes stored on a scanned tag. A blank tag yields empty bytes.
pub fn read(event: &ScanEvent) -> Vec<u8> {
    let Some(record) = event.messages.first().and_then(NdefMessage::first_record) else {
        tracing::debug!("scan carried no NDEF message");
        return Vec::new();
    };
    codec::safe_decompress(&record.payload)
}

/// Compress `bytes` and store them as the tag's only record.
pub fn write(event: &mut ScanEvent, bytes: &[u8]) -> Result<(), TagFailure> {
    let tag = event.tag.as_mut().ok_or(TagFailure::NoTagPresent)?;
    let packed = codec::safe_compress(bytes);

    if !tag.is_writable() {
        return Err(TagFailure::NotWritable);
    }
    let needed = CONTENT_TYPE.len() + packed.len();
    if needed > tag.max_size() {
        tracing::info!(needed, max_size = tag.max_size(), "script does not fit on tag");
        return Err(TagFailure::TooLarge);
    }

    let message = NdefMessage::single(NdefRecord::mime(CONTENT_TYPE, packed));
    let result = write_connected(tag.as_mut(), &message);
    if let Err(failure) = &result {
        tracing::warn!(%failure, "tag write failed");
    } else {
        tracing::info!(bytes = bytes.len(), stored = needed, "script written to tag");
    }
    result
}

fn write_connected(tag: &mut dyn TagSession, message: &NdefMessage) -> Result<(), TagFailure> {
    tag.connect()?;
    match tag.write_message(message) {
        Ok(()) => tag.close().map_err(TagFailure::from),
        Err(err) => {
            let _ = tag.close();
            Err(err.into())
        }
    }
}

/// Capability of the device's tag hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportState {
    Unsupported,
    SupportedOff,
    SupportedOn,
}

impl SupportState {
    pub fn as_str(self) -> &'static str {
        match self {
            SupportState::Unsupported => "unsupported",
            SupportState::SupportedOff => "supported_off",
            SupportState::SupportedOn => "supported_on",
        }
    }
}

/// Platform tag adapter.
pub trait TagAdapter: Send + Sync {
    fn is_enabled(&self) -> bool;
    /// Route scans to the running application instead of launching a new one.
    fn enable_foreground_dispatch(&self);
    fn disable_foreground_dispatch(&self);
}

/// Owns the (optional) adapter. Hosts without tag hardware register none.
#[derive(Default)]
pub struct Transport {
    adapter: Option<Box<dyn TagAdapter>>,
}

impl Transport {
    pub fn new(adapter: Option<Box<dyn TagAdapter>>) -> Self {
        Self { adapter }
    }

    pub fn support_state(&self) -> SupportState {
        match &self.adapter {
            None => SupportState::Unsupported,
            Some(adapter) if !adapter.is_enabled() => SupportState::SupportedOff,
            Some(_) => SupportState::SupportedOn,
        }
    }

    /// Call when the application becomes active.
    pub fn enable_foreground(&self) {
        if self.support_state() != SupportState::SupportedOn {
            return;
        }
        if let Some(adapter) = &self.adapter {
            adapter.enable_foreground_dispatch();
        }
    }

    /// Call when the application goes inactive.
    pub fn disable_foreground(&self) {
        if self.support_state() != SupportState::SupportedOn {
            return;
        }
        if let Some(adapter) = &self.adapter {
            adapter.disable_foreground_dispatch();
        }
    }

    pub fn read(&self, event: &ScanEvent) -> Vec<u8> {
        read(event)
    }

    pub fn write(&self, event: &mut ScanEvent, bytes: &[u8]) -> Result<(), TagFailure> {
        write(event, bytes)
    }
}

/// In-memory tag. Shares its state through an `Arc` so a test can inspect
/// what was written after the session is handed to a [`ScanEvent`].
#[derive(Clone)]
pub struct MemoryTag {
    state: std::sync::Arc<std::sync::Mutex<MemoryTagState>>,
}

#[derive(Debug, Default)]
pub struct MemoryTagState {
    pub max_size: usize,
    pub writable: bool,
    pub stored: Option<NdefMessage>,
    pub connects: usize,
    pub closes: usize,
    pub writes: usize,
    /// Error to raise on the next `write_message`.
    pub fail_next_write: Option<fn() -> TagIoError>,
}

impl MemoryTag {
    pub fn new(max_size: usize, writable: bool) -> Self {
        Self {
            state: std::sync::Arc::new(std::sync::Mutex::new(MemoryTagState {
                max_size,
                writable,
                ..MemoryTagState::default()
            })),
        }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut MemoryTagState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// A scan of this tag as the platform would deliver it.
    pub fn scan(&self) -> ScanEvent {
        let mut event = ScanEvent::new(ScanAction::NdefDiscovered).with_tag(Box::new(self.clone()));
        if let Some(message) = self.with_state(|s| s.stored.clone()) {
            event = event.with_message(message);
        }
        event
    }
}

impl TagSession for MemoryTag {
    fn max_size(&self) -> usize {
        self.with_state(|s| s.max_size)
    }

    fn is_writable(&self) -> bool {
        self.with_state(|s| s.writable)
    }

    fn connect(&mut self) -> Result<(), TagIoError> {
        self.with_state(|s| s.connects += 1);
        Ok(())
    }

    fn write_message(&mut self, message: &NdefMessage) -> Result<(), TagIoError> {
        self.with_state(|s| {
            if let Some(make_err) = s.fail_next_write.take() {
                return Err(make_err());
            }
            s.writes += 1;
            s.stored = Some(message.clone());
            Ok(())
        })
    }

    fn close(&mut self) -> Result<(), TagIoError> {
        self.with_state(|s| s.closes += 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn noise(len: usize) -> Vec<u8> {
        let mut seed: u32 = 0x1234_5678;
        (0..len)
            .map(|_| {
                seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (seed >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn blank_scan_reads_as_empty() {
        let event = ScanEvent::new(ScanAction::TagDiscovered);
        assert!(read(&event).is_empty());
    }

    #[test]
    fn read_uses_first_record_of_first_message() {
        let first = NdefMessage::new(vec![
            NdefRecord::mime(CONTENT_TYPE, codec::safe_compress(b"echo first")),
            NdefRecord::mime(CONTENT_TYPE, codec::safe_compress(b"echo second")),
        ]);
        let other = NdefMessage::single(NdefRecord::mime(CONTENT_TYPE, b"echo other".to_vec()));
        let event = ScanEvent::new(ScanAction::NdefDiscovered)
            .with_message(first)
            .with_message(other);
        assert_eq!(read(&event), b"echo first");
    }

    #[test]
    fn uncompressed_records_read_back_verbatim() {
        let event = ScanEvent::new(ScanAction::NdefDiscovered).with_message(NdefMessage::single(
            NdefRecord::mime(CONTENT_TYPE, b"echo legacy".to_vec()),
        ));
        assert_eq!(read(&event), b"echo legacy");
    }

    #[test]
    fn write_then_scan_round_trips() {
        let tag = MemoryTag::new(512, true);
        let script = b"#!/bin/sh\necho hello from the tag\n";
        write(&mut tag.scan(), script).expect("write");
        assert_eq!(read(&tag.scan()), script);
        tag.with_state(|s| {
            assert_eq!(s.writes, 1);
            assert_eq!(s.connects, 1);
            assert_eq!(s.closes, 1);
        });
    }

    #[test]
    fn missing_tag_is_reported() {
        let mut event = ScanEvent::new(ScanAction::TagDiscovered);
        assert_eq!(write(&mut event, b"echo hi"), Err(TagFailure::NoTagPresent));
    }

    #[test]
    fn oversized_payload_is_refused_without_writing() {
        let tag = MemoryTag::new(40, true);
        let payload = noise(50);
        assert!(CONTENT_TYPE.len() + codec::safe_compress(&payload).len() > 40);
        assert_eq!(write(&mut tag.scan(), &payload), Err(TagFailure::TooLarge));
        tag.with_state(|s| {
            assert_eq!(s.writes, 0);
            assert_eq!(s.connects, 0);
            assert!(s.stored.is_none());
        });
    }

    #[test]
    fn capacity_counts_the_content_type() {
        let payload = b"echo exact fit".to_vec();
        let needed = CONTENT_TYPE.len() + codec::safe_compress(&payload).len();

        let tight = MemoryTag::new(needed, true);
        assert_eq!(write(&mut tight.scan(), &payload), Ok(()));

        let short = MemoryTag::new(needed - 1, true);
        assert_eq!(write(&mut short.scan(), &payload), Err(TagFailure::TooLarge));
    }

    #[test]
    fn read_only_tag_is_refused_regardless_of_size() {
        for payload in [b"x".to_vec(), noise(4096)] {
            let tag = MemoryTag::new(64, false);
            assert_eq!(write(&mut tag.scan(), &payload), Err(TagFailure::NotWritable));
            tag.with_state(|s| assert_eq!(s.writes, 0));
        }
    }

    #[test]
    fn io_failures_map_and_still_close() {
        let cases: [(fn() -> TagIoError, TagFailure); 3] = [
            (|| TagIoError::Format("bad length".into()), TagFailure::Malformed),
            (|| TagIoError::Lost, TagFailure::TagRemoved),
            (
                || TagIoError::Io(std::io::Error::other("cancelled")),
                TagFailure::TagRemoved,
            ),
        ];
        for (make_err, expected) in cases {
            let tag = MemoryTag::new(256, true);
            tag.with_state(|s| s.fail_next_write = Some(make_err));
            assert_eq!(write(&mut tag.scan(), b"echo hi"), Err(expected));
            tag.with_state(|s| {
                assert_eq!(s.closes, 1, "close must be attempted after {expected}");
                assert!(s.stored.is_none());
            });
        }
    }

    struct FakeAdapter {
        enabled: bool,
        dispatching: Arc<AtomicBool>,
        toggles: Arc<AtomicUsize>,
    }

    impl TagAdapter for FakeAdapter {
        fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn enable_foreground_dispatch(&self) {
            self.dispatching.store(true, Ordering::SeqCst);
            self.toggles.fetch_add(1, Ordering::SeqCst);
        }

        fn disable_foreground_dispatch(&self) {
            self.dispatching.store(false, Ordering::SeqCst);
            self.toggles.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn support_state_and_foreground_toggle() {
        assert_eq!(Transport::default().support_state(), SupportState::Unsupported);

        let toggles = Arc::new(AtomicUsize::new(0));
        let dispatching = Arc::new(AtomicBool::new(false));
        let off = Transport::new(Some(Box::new(FakeAdapter {
            enabled: false,
            dispatching: dispatching.clone(),
            toggles: toggles.clone(),
        })));
        assert_eq!(off.support_state(), SupportState::SupportedOff);
        off.enable_foreground();
        assert_eq!(toggles.load(Ordering::SeqCst), 0);

        let on = Transport::new(Some(Box::new(FakeAdapter {
            enabled: true,
            dispatching: dispatching.clone(),
            toggles: toggles.clone(),
        })));
        assert_eq!(on.support_state(), SupportState::SupportedOn);
        on.enable_foreground();
        assert!(dispatching.load(Ordering::SeqCst));
        on.disable_foreground();
        assert!(!dispatching.load(Ordering::SeqCst));
        assert_eq!(toggles.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn only_tag_actions_count_as_scans() {
        assert!(ScanEvent::new(ScanAction::NdefDiscovered).is_tag_scan());
        assert!(ScanEvent::new(ScanAction::TagDiscovered).is_tag_scan());
        assert!(!ScanEvent::new(ScanAction::Other).is_tag_scan());
    }
}
