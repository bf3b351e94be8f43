//! Upload, download and copy orchestration. Each transfer plans its parts, resumes or creates
//! a checkpoint, runs the part tasks and then completes or tears down the transfer.
//!

use crate::checkpoint::{Checkpoint, TransferKind};
use crate::error::Error::{
    Cancelled, ChecksumMismatch, IncompleteTransfer, MissingChecksum, ParameterError,
};
use crate::error::{Error, Result, SessionState};
use crate::event::{EventListener, EventSink, EventType};
use crate::io::control::{DataTransferListener, RateLimiter, TransferControls};
use crate::io::{CompleteOutput, CreateMultipartRequest, MultipartTarget, ObjectStore};
use crate::part::{clamp_part_size, DEFAULT_PART_SIZE};
use crate::task::group::{GroupOutcome, GroupState, MAX_TASK_NUM};
use cancel::CancelHook;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod cancel;
pub mod copy;
pub mod download;
pub mod upload;

/// The number of concurrent part tasks used when none is given.
pub const DEFAULT_TASK_NUM: usize = 1;

/// The maximum length of an object key in bytes.
pub const MAX_KEY_LENGTH: usize = 1024;

/// How the checksum of a transferred object is verified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyMode {
    /// Never verify.
    Skip,
    /// Verify when the object store reports a CRC64 checksum.
    #[default]
    IfAvailable,
    /// Fail when the object store does not report a CRC64 checksum.
    Required,
}

/// Options shared by uploads, downloads and copies.
#[derive(Clone)]
pub struct TransferOptions {
    part_size: u64,
    task_num: usize,
    enable_checkpoint: bool,
    checkpoint_file: Option<PathBuf>,
    verify: VerifyMode,
    listener: Option<Arc<dyn EventListener>>,
    progress: Option<Arc<dyn DataTransferListener>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    cancel_hook: CancelHook,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            task_num: DEFAULT_TASK_NUM,
            enable_checkpoint: false,
            checkpoint_file: None,
            verify: VerifyMode::default(),
            listener: None,
            progress: None,
            rate_limiter: None,
            cancel_hook: CancelHook::default(),
        }
    }
}

impl Debug for TransferOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOptions")
            .field("part_size", &self.part_size)
            .field("task_num", &self.task_num)
            .field("enable_checkpoint", &self.enable_checkpoint)
            .field("checkpoint_file", &self.checkpoint_file)
            .field("verify", &self.verify)
            .finish_non_exhaustive()
    }
}

impl TransferOptions {
    /// Set the part size. This is clamped to the part size bounds of the object store.
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = clamp_part_size(part_size);
        self
    }

    /// Set the number of concurrent part tasks, clamped to `[1, 1000]`.
    pub fn with_task_num(mut self, task_num: usize) -> Self {
        self.task_num = task_num.clamp(1, MAX_TASK_NUM);
        self
    }

    /// Record progress in a checkpoint file so that a failed transfer can be resumed.
    pub fn with_checkpoint(mut self, enable_checkpoint: bool) -> Self {
        self.enable_checkpoint = enable_checkpoint;
        self
    }

    /// Set the checkpoint file instead of deriving it from the transfer.
    pub fn with_checkpoint_file(mut self, checkpoint_file: Option<PathBuf>) -> Self {
        self.checkpoint_file = checkpoint_file;
        self
    }

    /// Set the verification mode.
    pub fn with_verify(mut self, verify: VerifyMode) -> Self {
        self.verify = verify;
        self
    }

    /// Set the event listener.
    pub fn with_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Set the progress listener.
    pub fn with_progress(mut self, progress: Arc<dyn DataTransferListener>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Set the rate limiter.
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Set the hook used to cancel the transfer.
    pub fn with_cancel_hook(mut self, cancel_hook: CancelHook) -> Self {
        self.cancel_hook = cancel_hook;
        self
    }

    /// Get the part size.
    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Get the number of concurrent part tasks.
    pub fn task_num(&self) -> usize {
        self.task_num
    }

    /// Whether checkpointing is enabled.
    pub fn enable_checkpoint(&self) -> bool {
        self.enable_checkpoint
    }

    /// Get the checkpoint file if one was set.
    pub fn checkpoint_file(&self) -> Option<&PathBuf> {
        self.checkpoint_file.as_ref()
    }

    /// Get the verification mode.
    pub fn verify(&self) -> VerifyMode {
        self.verify
    }

    /// Get the cancel hook.
    pub fn cancel_hook(&self) -> &CancelHook {
        &self.cancel_hook
    }

    /// Create an event sink for a transfer.
    pub(crate) fn events(&self, kind: TransferKind, bucket: &str, key: &str) -> EventSink {
        EventSink::new(self.listener.clone(), kind, bucket, key)
    }

    /// Create the progress and rate limiting controls for an object of `total` bytes.
    pub(crate) fn controls(&self, total: u64, consumed: u64) -> TransferControls {
        TransferControls::new(
            self.progress.clone(),
            self.rate_limiter.clone(),
            total,
            consumed,
        )
    }
}

/// Check that a bucket name is legal: 3 to 63 lowercase letters, digits, dots or hyphens,
/// starting and ending with a letter or digit.
pub fn validate_bucket(bucket: &str) -> Result<()> {
    let bytes = bucket.as_bytes();
    let legal_chars = bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'.' || *b == b'-');
    let legal_ends = bytes.first().is_some_and(u8::is_ascii_alphanumeric)
        && bytes.last().is_some_and(u8::is_ascii_alphanumeric);

    if !(3..=63).contains(&bytes.len()) || !legal_chars || !legal_ends {
        return Err(ParameterError(format!("invalid bucket name: {bucket}")));
    }

    Ok(())
}

/// Check that an object key is legal: not empty and at most 1024 bytes.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(ParameterError(format!(
            "object key must be between 1 and {MAX_KEY_LENGTH} bytes"
        )));
    }

    Ok(())
}

/// Compare the checksum the object should have with the checksum it has. Returns whether
/// the checksums were compared.
pub(crate) fn verify(mode: VerifyMode, expected: Option<u64>, actual: Option<u64>) -> Result<bool> {
    if mode == VerifyMode::Skip {
        return Ok(false);
    }

    match (expected, actual) {
        (Some(expected), Some(actual)) if expected == actual => Ok(true),
        (Some(expected), Some(actual)) => Err(ChecksumMismatch { expected, actual }),
        _ if mode == VerifyMode::Required => Err(MissingChecksum(format!(
            "expected {}, actual {}",
            format_crc64(expected),
            format_crc64(actual)
        ))),
        _ => {
            debug!("no CRC64 available, skipping verification");
            Ok(false)
        }
    }
}

fn format_crc64(crc64: Option<u64>) -> String {
    crc64.map_or_else(|| "none".to_string(), |crc64| format!("{crc64:016x}"))
}

/// The error for a group that finished with failed parts.
pub(crate) fn incomplete(failed: usize, total: usize, errors: &[Error]) -> Error {
    IncompleteTransfer {
        failed,
        total,
        message: errors
            .first()
            .map(|err| err.to_string())
            .unwrap_or_default(),
    }
}

/// The multipart session of an upload or copy. Decides whether a failed transfer keeps the
/// session for resuming or aborts it.
pub(crate) struct MultipartSession<'a> {
    store: &'a dyn ObjectStore,
    target: Arc<MultipartTarget>,
    events: EventSink,
    enable_checkpoint: bool,
}

impl<'a> MultipartSession<'a> {
    /// Resume the session recorded in the checkpoint, or create one and record it.
    pub(crate) async fn open(
        store: &'a dyn ObjectStore,
        checkpoint: &mut Checkpoint,
        request: CreateMultipartRequest,
        options: &TransferOptions,
    ) -> Result<Self> {
        let enable_checkpoint = options.enable_checkpoint();
        let events = options
            .events(checkpoint.kind(), &request.bucket, &request.key)
            .with_checkpoint_file(enable_checkpoint.then(|| checkpoint.path().to_path_buf()));

        let (upload_id, created) = match checkpoint.upload_id() {
            Some(upload_id) => {
                debug!(upload_id, "resuming multipart upload");
                (upload_id.to_string(), false)
            }
            None => match store.create_multipart_upload(&request).await {
                Ok(upload_id) => (upload_id, true),
                Err(err) => {
                    events.failed(EventType::CreateMultipartUploadFailed, &err);
                    return Err(err);
                }
            },
        };

        let session = Self {
            store,
            target: Arc::new(MultipartTarget {
                bucket: request.bucket,
                key: request.key,
                upload_id: upload_id.clone(),
                sse: request.sse,
            }),
            events: events.with_upload_id(Some(upload_id.clone())),
            enable_checkpoint,
        };

        if created {
            info!(
                bucket = %session.target.bucket,
                key = %session.target.key,
                %upload_id,
                "created multipart upload"
            );
            checkpoint.set_upload_id(upload_id);
            session
                .events
                .succeeded(EventType::CreateMultipartUploadSucceeded);

            if enable_checkpoint {
                if let Err(err) = checkpoint.persist().await {
                    return Err(session.abort(checkpoint, err).await);
                }
            }
        }

        Ok(session)
    }

    /// Get the session that parts are written to.
    pub(crate) fn target(&self) -> Arc<MultipartTarget> {
        self.target.clone()
    }

    /// Get the upload id.
    pub(crate) fn upload_id(&self) -> &str {
        &self.target.upload_id
    }

    /// Get the event sink for this session.
    pub(crate) fn events(&self) -> &EventSink {
        &self.events
    }

    /// Abort the session and remove the checkpoint. Failing to abort is logged so that the
    /// original error is returned.
    pub(crate) async fn abort(&self, checkpoint: &Checkpoint, err: Error) -> Error {
        match self.store.abort_multipart_upload(&self.target).await {
            Ok(()) => info!(upload_id = self.upload_id(), "aborted multipart upload"),
            Err(abort_err) => warn!(
                upload_id = self.upload_id(),
                err = %abort_err,
                "failed to abort multipart upload"
            ),
        }
        checkpoint.remove().await;

        err.with_session(SessionState::Aborted(self.upload_id().to_string()))
    }

    /// Stop after an error that a later run can recover from. The session is kept when there
    /// is a checkpoint to resume it with.
    pub(crate) async fn stop(&self, checkpoint: &Checkpoint, err: Error, abort: bool) -> Error {
        if abort || !self.enable_checkpoint {
            self.abort(checkpoint, err).await
        } else {
            debug!(
                upload_id = self.upload_id(),
                checkpoint = %checkpoint.path().display(),
                "keeping multipart upload for resuming"
            );
            err.with_session(SessionState::Open(self.upload_id().to_string()))
        }
    }

    /// Map the outcome of the part tasks to the result of the transfer.
    pub(crate) async fn handle_outcome(
        &self,
        checkpoint: &Checkpoint,
        outcome: GroupOutcome,
        cancel_hook: &CancelHook,
    ) -> Result<()> {
        let GroupOutcome {
            total,
            failed,
            state,
            ..
        } = outcome;

        match state {
            GroupState::Completed => Ok(()),
            GroupState::Aborted(err) => Err(self.abort(checkpoint, err).await),
            GroupState::Incomplete(errors) => Err(self
                .stop(checkpoint, incomplete(failed, total, &errors), false)
                .await),
            GroupState::Cancelled => Err(self
                .stop(checkpoint, Cancelled, cancel_hook.is_abort())
                .await),
        }
    }

    /// Assemble the parts recorded in the checkpoint into the object.
    pub(crate) async fn complete(&self, checkpoint: &Checkpoint) -> Result<CompleteOutput> {
        match self
            .store
            .complete_multipart_upload(&self.target, checkpoint.completed_parts())
            .await
        {
            Ok(output) => {
                info!(
                    upload_id = self.upload_id(),
                    e_tag = ?output.e_tag,
                    "completed multipart upload"
                );
                self.events
                    .succeeded(EventType::CompleteMultipartUploadSucceeded);
                Ok(output)
            }
            Err(err) => {
                self.events
                    .failed(EventType::CompleteMultipartUploadFailed, &err);
                if err.is_fatal() {
                    Err(self.abort(checkpoint, err).await)
                } else {
                    Err(self.stop(checkpoint, err, false).await)
                }
            }
        }
    }

    /// Check the completed object and remove the checkpoint. The session is complete at this
    /// point, so a mismatch is reported with a completed session.
    pub(crate) async fn finish(
        &self,
        checkpoint: &Checkpoint,
        mode: VerifyMode,
        expected: Option<u64>,
        actual: Option<u64>,
    ) -> Result<bool> {
        checkpoint.remove().await;

        verify(mode, expected, actual).map_err(|err| {
            warn!(upload_id = self.upload_id(), %err, "verification failed");
            err.with_session(SessionState::Completed(self.upload_id().to_string()))
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bucket_names() {
        for bucket in ["abc", "my-bucket.1", "0bucket9"] {
            assert!(validate_bucket(bucket).is_ok(), "{bucket}");
        }
        let long = "a".repeat(64);
        for bucket in ["ab", "-bucket", "bucket.", "Bucket", "bucket_1", long.as_str()] {
            assert!(validate_bucket(bucket).is_err(), "{bucket}");
        }
    }

    #[test]
    fn object_keys() {
        assert!(validate_key("a/b/c").is_ok());
        assert!(validate_key(&"k".repeat(MAX_KEY_LENGTH)).is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key(&"k".repeat(MAX_KEY_LENGTH + 1)).is_err());
    }

    #[test]
    fn verify_modes() {
        assert!(verify(VerifyMode::IfAvailable, Some(1), Some(1)).unwrap());
        assert!(!verify(VerifyMode::IfAvailable, Some(1), None).unwrap());
        assert!(!verify(VerifyMode::Skip, Some(1), Some(2)).unwrap());
        assert!(matches!(
            verify(VerifyMode::IfAvailable, Some(1), Some(2)),
            Err(ChecksumMismatch {
                expected: 1,
                actual: 2
            })
        ));
        assert!(matches!(
            verify(VerifyMode::Required, Some(1), None),
            Err(MissingChecksum(_))
        ));
    }

    #[test]
    fn options_are_clamped() {
        let options = TransferOptions::default()
            .with_part_size(1)
            .with_task_num(5000);
        assert_eq!(options.part_size(), crate::part::MIN_PART_SIZE);
        assert_eq!(options.task_num(), MAX_TASK_NUM);
        assert_eq!(TransferOptions::default().with_task_num(0).task_num(), 1);
    }
}
