//! Events emitted while a transfer runs.
//!

use crate::checkpoint::TransferKind;
use crate::error::Error;
use crate::part::Part;
use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::sync::Arc;

/// The kind of event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    CreateMultipartUploadSucceeded,
    CreateMultipartUploadFailed,
    PartSucceeded,
    PartFailed,
    PartAborted,
    CompleteMultipartUploadSucceeded,
    CompleteMultipartUploadFailed,
    RenameTempFileSucceeded,
    RenameTempFileFailed,
}

/// Part information attached to part events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartEvent {
    pub part_number: u64,
    pub range_start: u64,
    pub range_end: u64,
    pub e_tag: Option<String>,
    pub crc64: Option<u64>,
}

impl From<&Part> for PartEvent {
    fn from(part: &Part) -> Self {
        Self {
            part_number: part.part_number(),
            range_start: part.range_start(),
            range_end: part.range_end(),
            e_tag: part.e_tag().map(|e_tag| e_tag.to_string()),
            crc64: part.crc64(),
        }
    }
}

/// An event posted to a transfer listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub event_type: EventType,
    pub kind: TransferKind,
    pub bucket: String,
    pub key: String,
    pub upload_id: Option<String>,
    pub checkpoint_file: Option<PathBuf>,
    pub part: Option<PartEvent>,
    pub part_number: Option<u64>,
    pub error: Option<String>,
}

/// Receives transfer events.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &TransferEvent);
}

/// Posts events for one transfer to an optional listener.
#[derive(Clone)]
pub struct EventSink {
    listener: Option<Arc<dyn EventListener>>,
    kind: TransferKind,
    bucket: String,
    key: String,
    upload_id: Option<String>,
    checkpoint_file: Option<PathBuf>,
}

impl Debug for EventSink {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("kind", &self.kind)
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("upload_id", &self.upload_id)
            .finish_non_exhaustive()
    }
}

impl EventSink {
    /// Create a sink for a transfer to or from `bucket` and `key`.
    pub fn new(
        listener: Option<Arc<dyn EventListener>>,
        kind: TransferKind,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            listener,
            kind,
            bucket: bucket.into(),
            key: key.into(),
            upload_id: None,
            checkpoint_file: None,
        }
    }

    /// A sink that discards events.
    pub fn disabled(kind: TransferKind) -> Self {
        Self::new(None, kind, "", "")
    }

    /// Set the checkpoint file reported in events.
    pub fn with_checkpoint_file(mut self, checkpoint_file: Option<PathBuf>) -> Self {
        self.checkpoint_file = checkpoint_file;
        self
    }

    /// Set the upload id reported in events.
    pub fn with_upload_id(mut self, upload_id: Option<String>) -> Self {
        self.upload_id = upload_id;
        self
    }

    fn post(
        &self,
        event_type: EventType,
        part: Option<PartEvent>,
        part_number: Option<u64>,
        error: Option<&Error>,
    ) {
        let Some(listener) = &self.listener else {
            return;
        };

        listener.on_event(&TransferEvent {
            event_type,
            kind: self.kind,
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            upload_id: self.upload_id.clone(),
            checkpoint_file: self.checkpoint_file.clone(),
            part_number: part.as_ref().map(|part| part.part_number).or(part_number),
            part,
            error: error.map(|err| err.to_string()),
        });
    }

    /// Post an event that does not relate to a part.
    pub fn succeeded(&self, event_type: EventType) {
        self.post(event_type, None, None, None);
    }

    /// Post a failure that does not relate to a part.
    pub fn failed(&self, event_type: EventType, err: &Error) {
        self.post(event_type, None, None, Some(err));
    }

    /// Post a part that completed.
    pub fn part_succeeded(&self, part: &Part) {
        self.post(EventType::PartSucceeded, Some(part.into()), None, None);
    }

    /// Post a part that failed and may be retried in a later run.
    pub fn part_failed(&self, part_number: u64, err: &Error) {
        self.post(EventType::PartFailed, None, Some(part_number), Some(err));
    }

    /// Post a part whose failure aborted the transfer.
    pub fn part_aborted(&self, part_number: u64, err: &Error) {
        self.post(EventType::PartAborted, None, Some(part_number), Some(err));
    }
}
