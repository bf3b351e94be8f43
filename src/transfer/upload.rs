//! Upload a local file as a multipart object.
//!

use crate::checkpoint::{default_path, Checkpoint, ObjectIdentity, TransferIdentity, TransferKind};
use crate::error::Error::{ParameterError, ParseError};
use crate::error::Result;
use crate::io::{CreateMultipartRequest, ObjectStore, SseCustomer};
use crate::task::group::TaskGroup;
use crate::task::upload::UploadPartTask;
use crate::task::BoxedTask;
use crate::transfer::{validate_bucket, validate_key, MultipartSession, TransferOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::info;

/// The result of an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOutput {
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

/// Build an upload.
#[derive(Default)]
pub struct UploadBuilder {
    store: Option<Arc<dyn ObjectStore>>,
    file: Option<PathBuf>,
    bucket: Option<String>,
    key: Option<String>,
    sse: Option<SseCustomer>,
    content_type: Option<String>,
    metadata: HashMap<String, String>,
    options: TransferOptions,
}

impl UploadBuilder {
    /// Set the object store.
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the file to upload.
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
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

    /// Encrypt the object with a customer provided key.
    pub fn with_sse(mut self, sse: Option<SseCustomer>) -> Self {
        self.sse = sse;
        self
    }

    /// Set the content type of the object.
    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    /// Set the user metadata of the object.
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the transfer options.
    pub fn with_options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }

    fn get_components(self) -> Result<Upload> {
        let error_fn = || {
            ParseError("store, file, bucket and key are required in `UploadBuilder`".to_string())
        };

        Ok(Upload {
            store: self.store.ok_or_else(error_fn)?,
            file: self.file.ok_or_else(error_fn)?,
            bucket: self.bucket.ok_or_else(error_fn)?,
            key: self.key.ok_or_else(error_fn)?,
            sse: self.sse,
            content_type: self.content_type,
            metadata: self.metadata,
            options: self.options,
        })
    }

    /// Build the upload, checking the bucket and key.
    pub fn build(self) -> Result<Upload> {
        let upload = self.get_components()?;

        validate_bucket(&upload.bucket)?;
        validate_key(&upload.key)?;

        Ok(upload)
    }
}

/// Uploads a file using a multipart session, resuming from a checkpoint if there is one.
pub struct Upload {
    store: Arc<dyn ObjectStore>,
    file: PathBuf,
    bucket: String,
    key: String,
    sse: Option<SseCustomer>,
    content_type: Option<String>,
    metadata: HashMap<String, String>,
    options: TransferOptions,
}

impl Upload {
    fn identity(&self) -> TransferIdentity {
        TransferIdentity {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            part_size: self.options.part_size(),
            sse: self.sse.as_ref().map(SseCustomer::identity),
            file_path: Some(self.file.to_string_lossy().to_string()),
            ..Default::default()
        }
    }

    /// The checkpoint is kept next to the file by default.
    fn checkpoint_path(&self) -> Result<PathBuf> {
        if let Some(path) = self.options.checkpoint_file() {
            return Ok(path.clone());
        }

        let name = self.file.file_name().ok_or_else(|| {
            ParameterError(format!("{} is not a file", self.file.display()))
        })?;
        let directory = self.file.parent().unwrap_or(Path::new(""));

        Ok(default_path(
            directory,
            &name.to_string_lossy(),
            TransferKind::Upload,
            &[self.bucket.as_str(), self.key.as_str()],
        ))
    }

    /// Run the upload.
    pub async fn run(self) -> Result<UploadOutput> {
        let metadata = fs::metadata(&self.file).await?;
        if metadata.is_dir() {
            return Err(ParameterError(format!(
                "{} is a directory",
                self.file.display()
            )));
        }

        let enable_checkpoint = self.options.enable_checkpoint();
        let (mut checkpoint, resumed) = Checkpoint::resume_or_init(
            self.store.as_ref(),
            self.checkpoint_path()?,
            enable_checkpoint,
            TransferKind::Upload,
            self.identity(),
            ObjectIdentity::from_file(&metadata),
        )
        .await?;

        info!(
            file = %self.file.display(),
            bucket = %self.bucket,
            key = %self.key,
            parts = checkpoint.parts().len(),
            pending = checkpoint.pending_parts().len(),
            "starting upload"
        );

        let session = MultipartSession::open(
            self.store.as_ref(),
            &mut checkpoint,
            CreateMultipartRequest {
                bucket: self.bucket.clone(),
                key: self.key.clone(),
                sse: self.sse.clone(),
                content_type: self.content_type.clone(),
                metadata: self.metadata.clone(),
            },
            &self.options,
        )
        .await?;

        let controls = self
            .options
            .controls(checkpoint.source().size, checkpoint.completed_size());
        controls.start();

        let target = session.target();
        let file = Arc::new(self.file.clone());
        let tasks = checkpoint
            .pending_parts()
            .into_iter()
            .map(|part| {
                Box::new(UploadPartTask::new(
                    self.store.clone(),
                    target.clone(),
                    file.clone(),
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
            .finish(
                &checkpoint,
                self.options.verify(),
                checkpoint.combined_crc64(),
                output.crc64,
            )
            .await?;

        Ok(UploadOutput {
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

#[cfg(test)]
mod test {
    use super::*;
    use crate::part::MIN_PART_SIZE;
    use crate::test::{MemoryStore, TestFileBuilder};
    use tempfile::tempdir;

    #[test]
    fn build_requires_components() {
        let store = Arc::new(MemoryStore::default());

        assert!(UploadBuilder::default()
            .with_file("file")
            .with_bucket("bucket")
            .with_key("key")
            .build()
            .is_err());
        assert!(matches!(
            UploadBuilder::default()
                .with_store(store.clone())
                .with_file("file")
                .with_bucket("Bucket")
                .with_key("key")
                .build(),
            Err(ParameterError(_))
        ));
        assert!(UploadBuilder::default()
            .with_store(store)
            .with_file("file")
            .with_bucket("bucket")
            .with_key("key")
            .build()
            .is_ok());
    }

    #[tokio::test]
    async fn upload_file() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let builder = TestFileBuilder::default().with_directory(dir.path());
        let contents = builder.contents()?;
        let file = builder.generate().await?;
        let store = Arc::new(MemoryStore::default());

        let output = UploadBuilder::default()
            .with_store(store.clone())
            .with_file(&file)
            .with_bucket("bucket")
            .with_key("key")
            .with_options(
                TransferOptions::default()
                    .with_part_size(MIN_PART_SIZE)
                    .with_task_num(3),
            )
            .build()?
            .run()
            .await?;

        assert_eq!(output.parts_total, 3);
        assert_eq!(output.parts_transferred, 3);
        assert!(!output.resumed);
        assert!(output.verified);
        assert_eq!(store.object("bucket", "key"), Some(contents));
        assert_eq!(store.open_uploads(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn directory_is_rejected() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = Arc::new(MemoryStore::default());

        let result = UploadBuilder::default()
            .with_store(store.clone())
            .with_file(dir.path())
            .with_bucket("bucket")
            .with_key("key")
            .build()?
            .run()
            .await;

        assert!(matches!(result, Err(ParameterError(_))));
        assert_eq!(store.calls().create, 0);

        Ok(())
    }
}
