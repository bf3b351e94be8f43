//! Server-side copy of an object using a multipart session.
//!

use crate::checkpoint::{default_path, Checkpoint, ObjectIdentity, TransferIdentity, TransferKind};
use crate::error::Error::ParseError;
use crate::error::Result;
use crate::io::{
    Conditions, CreateMultipartRequest, HeadRequest, ObjectLocation, ObjectMeta, ObjectStore,
    SseCustomer,
};
use crate::task::copy::{CopyPartTask, CopySourceObject};
use crate::task::group::TaskGroup;
use crate::task::BoxedTask;
use crate::transfer::{validate_bucket, validate_key, MultipartSession, TransferOptions};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// The result of a copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyOutput {
    pub source_bucket: String,
    pub source_key: String,
    pub source_version_id: Option<String>,
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub e_tag: Option<String>,
    pub crc64: Option<u64>,
    pub version_id: Option<String>,
    pub parts_total: usize,
    pub parts_transferred: usize,
    pub resumed: bool,
    pub verified: bool,
}

/// Build a copy.
#[derive(Default)]
pub struct CopyBuilder {
    store: Option<Arc<dyn ObjectStore>>,
    source_bucket: Option<String>,
    source_key: Option<String>,
    source_version_id: Option<String>,
    source_conditions: Conditions,
    source_sse: Option<SseCustomer>,
    bucket: Option<String>,
    key: Option<String>,
    sse: Option<SseCustomer>,
    options: TransferOptions,
}

impl CopyBuilder {
    /// Set the object store.
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the source bucket.
    pub fn with_source_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.source_bucket = Some(bucket.into());
        self
    }

    /// Set the source key.
    pub fn with_source_key(mut self, key: impl Into<String>) -> Self {
        self.source_key = Some(key.into());
        self
    }

    /// Copy a specific version of the source.
    pub fn with_source_version_id(mut self, version_id: Option<String>) -> Self {
        self.source_version_id = version_id;
        self
    }

    /// Only copy if the source satisfies the conditions.
    pub fn with_source_conditions(mut self, conditions: Conditions) -> Self {
        self.source_conditions = conditions;
        self
    }

    /// Decrypt the source with a customer provided key.
    pub fn with_source_sse(mut self, sse: Option<SseCustomer>) -> Self {
        self.source_sse = sse;
        self
    }

    /// Set the destination bucket.
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the destination key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Encrypt the destination with a customer provided key.
    pub fn with_sse(mut self, sse: Option<SseCustomer>) -> Self {
        self.sse = sse;
        self
    }

    /// Set the transfer options.
    pub fn with_options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }

    fn get_components(self) -> Result<ObjectCopy> {
        let error_fn = || {
            ParseError(
                "store, source bucket, source key, bucket and key are required in `CopyBuilder`"
                    .to_string(),
            )
        };

        Ok(ObjectCopy {
            store: self.store.ok_or_else(error_fn)?,
            source: ObjectLocation::new(
                self.source_bucket.ok_or_else(error_fn)?,
                self.source_key.ok_or_else(error_fn)?,
            )
            .with_version_id(self.source_version_id),
            source_conditions: self.source_conditions,
            source_sse: self.source_sse,
            bucket: self.bucket.ok_or_else(error_fn)?,
            key: self.key.ok_or_else(error_fn)?,
            sse: self.sse,
            options: self.options,
        })
    }

    /// Build the copy, checking the source and destination buckets and keys.
    pub fn build(self) -> Result<ObjectCopy> {
        let copy = self.get_components()?;

        validate_bucket(&copy.source.bucket)?;
        validate_key(&copy.source.key)?;
        validate_bucket(&copy.bucket)?;
        validate_key(&copy.key)?;

        Ok(copy)
    }
}

/// Copies an object part by part, resuming from a checkpoint if there is one.
pub struct ObjectCopy {
    store: Arc<dyn ObjectStore>,
    source: ObjectLocation,
    source_conditions: Conditions,
    source_sse: Option<SseCustomer>,
    bucket: String,
    key: String,
    sse: Option<SseCustomer>,
    options: TransferOptions,
}

impl ObjectCopy {
    fn identity(&self) -> TransferIdentity {
        TransferIdentity {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            source_bucket: Some(self.source.bucket.clone()),
            source_key: Some(self.source.key.clone()),
            version_id: self.source.version_id.clone(),
            part_size: self.options.part_size(),
            conditions: self.source_conditions.clone(),
            sse: self.sse.as_ref().map(SseCustomer::identity),
            source_sse: self.source_sse.as_ref().map(SseCustomer::identity),
            file_path: None,
        }
    }

    /// There is no local file, so the checkpoint is kept in the temporary directory by default.
    fn checkpoint_path(&self) -> PathBuf {
        if let Some(path) = self.options.checkpoint_file() {
            return path.clone();
        }

        let name = self
            .key
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or("object");
        default_path(
            &env::temp_dir(),
            name,
            TransferKind::Copy,
            &[
                self.source.bucket.as_str(),
                self.source.key.as_str(),
                self.source.version_id.as_deref().unwrap_or_default(),
                self.bucket.as_str(),
                self.key.as_str(),
            ],
        )
    }

    /// Part copies must read the object that was checked, so they match its ETag unless the
    /// caller gave one.
    fn copy_source(&self, meta: &ObjectMeta) -> CopySourceObject {
        let mut conditions = self.source_conditions.clone();
        if conditions.if_match.is_none() {
            conditions.if_match = meta.e_tag.clone();
        }

        CopySourceObject {
            location: self.source.clone(),
            conditions,
            sse: self.source_sse.clone(),
        }
    }

    /// Run the copy.
    pub async fn run(self) -> Result<CopyOutput> {
        let meta = self
            .store
            .head_object(&HeadRequest {
                location: self.source.clone(),
                conditions: self.source_conditions.clone(),
                sse: self.source_sse.clone(),
            })
            .await?;

        let enable_checkpoint = self.options.enable_checkpoint();
        let (mut checkpoint, resumed) = Checkpoint::resume_or_init(
            self.store.as_ref(),
            self.checkpoint_path(),
            enable_checkpoint,
            TransferKind::Copy,
            self.identity(),
            ObjectIdentity::from(&meta),
        )
        .await?;

        info!(
            source = %self.source,
            bucket = %self.bucket,
            key = %self.key,
            parts = checkpoint.parts().len(),
            pending = checkpoint.pending_parts().len(),
            "starting copy"
        );

        let session = MultipartSession::open(
            self.store.as_ref(),
            &mut checkpoint,
            CreateMultipartRequest {
                bucket: self.bucket.clone(),
                key: self.key.clone(),
                sse: self.sse.clone(),
                content_type: meta.content_type.clone(),
                metadata: meta.metadata.clone(),
            },
            &self.options,
        )
        .await?;

        let controls = self.options.controls(meta.size, checkpoint.completed_size());
        controls.start();

        let target = session.target();
        let source = Arc::new(self.copy_source(&meta));
        let tasks = checkpoint
            .pending_parts()
            .into_iter()
            .map(|part| {
                Box::new(CopyPartTask::new(
                    self.store.clone(),
                    target.clone(),
                    source.clone(),
                    controls.clone(),
                    part,
                )) as BoxedTask
            })
            .collect();

        let outcome = match TaskGroup::new(
            tasks,
            self.options.task_num(),
            self.options.cancel_hook().token(),
        )
        .with_persist(enable_checkpoint)
        .with_events(session.events().clone())
        .run(&mut checkpoint)
        .await
        {
            Ok(outcome) => outcome,
            Err(err) => return Err(session.abort(&checkpoint, err).await),
        };
        let parts_transferred = outcome.succeeded;

        session
            .handle_outcome(&checkpoint, outcome, self.options.cancel_hook())
            .await?;
        let output = session.complete(&checkpoint).await?;
        let verified = session
            .finish(&checkpoint, self.options.verify(), meta.crc64, output.crc64)
            .await?;

        Ok(CopyOutput {
            source_bucket: self.source.bucket,
            source_key: self.source.key,
            source_version_id: meta.version_id,
            bucket: self.bucket,
            key: self.key,
            upload_id: session.upload_id().to_string(),
            e_tag: output.e_tag,
            crc64: output.crc64,
            version_id: output.version_id,
            parts_total: checkpoint.parts().len(),
            parts_transferred,
            resumed,
            verified,
        })
    }
}
