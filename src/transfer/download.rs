//! Download an object to a local file. Parts are written into a temporary file which is
//! renamed once every part is downloaded and verified.
//!

use crate::checkpoint::{default_path, Checkpoint, ObjectIdentity, TransferIdentity, TransferKind};
use crate::error::Error::{Cancelled, IOError, ParseError};
use crate::error::Result;
use crate::event::{EventSink, EventType};
use crate::io::{Conditions, HeadRequest, ObjectLocation, ObjectMeta, ObjectStore, SseCustomer};
use crate::task::download::{DownloadPartTask, DownloadSource};
use crate::task::group::{GroupOutcome, GroupState, TaskGroup};
use crate::task::BoxedTask;
use crate::transfer::{incomplete, validate_bucket, validate_key, verify, TransferOptions};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

/// The suffix of the temporary file parts are written to.
pub const TEMP_FILE_SUFFIX: &str = ".temp";

/// The result of a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOutput {
    pub bucket: String,
    pub key: String,
    pub file: PathBuf,
    pub size: u64,
    pub e_tag: Option<String>,
    pub crc64: Option<u64>,
    pub version_id: Option<String>,
    pub parts_total: usize,
    pub parts_transferred: usize,
    pub resumed: bool,
    pub verified: bool,
}

/// Build a download.
#[derive(Default)]
pub struct DownloadBuilder {
    store: Option<Arc<dyn ObjectStore>>,
    bucket: Option<String>,
    key: Option<String>,
    version_id: Option<String>,
    file: Option<PathBuf>,
    conditions: Conditions,
    sse: Option<SseCustomer>,
    options: TransferOptions,
}

impl DownloadBuilder {
    /// Set the object store.
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the source bucket.
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the source key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Download a specific version of the object.
    pub fn with_version_id(mut self, version_id: Option<String>) -> Self {
        self.version_id = version_id;
        self
    }

    /// Set the destination file. A directory destination downloads into a file named after
    /// the last segment of the key.
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Only download if the object satisfies the conditions.
    pub fn with_conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = conditions;
        self
    }

    /// Decrypt the object with a customer provided key.
    pub fn with_sse(mut self, sse: Option<SseCustomer>) -> Self {
        self.sse = sse;
        self
    }

    /// Set the transfer options.
    pub fn with_options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }

    fn get_components(self) -> Result<Download> {
        let error_fn = || {
            ParseError("store, bucket, key and file are required in `DownloadBuilder`".to_string())
        };

        Ok(Download {
            store: self.store.ok_or_else(error_fn)?,
            location: ObjectLocation::new(
                self.bucket.ok_or_else(error_fn)?,
                self.key.ok_or_else(error_fn)?,
            )
            .with_version_id(self.version_id),
            file: self.file.ok_or_else(error_fn)?,
            conditions: self.conditions,
            sse: self.sse,
            options: self.options,
        })
    }

    /// Build the download, checking the bucket and key.
    pub fn build(self) -> Result<Download> {
        let download = self.get_components()?;

        validate_bucket(&download.location.bucket)?;
        validate_key(&download.location.key)?;

        Ok(download)
    }
}

/// Downloads an object in parts, resuming from a checkpoint if there is one.
pub struct Download {
    store: Arc<dyn ObjectStore>,
    location: ObjectLocation,
    file: PathBuf,
    conditions: Conditions,
    sse: Option<SseCustomer>,
    options: TransferOptions,
}

impl Download {
    /// The file to write to, appending the key name to directory destinations.
    async fn destination(&self) -> PathBuf {
        let ends_with_separator = self
            .file
            .to_string_lossy()
            .ends_with(['/', MAIN_SEPARATOR]);
        let is_dir = fs::metadata(&self.file)
            .await
            .is_ok_and(|metadata| metadata.is_dir());

        if ends_with_separator || is_dir {
            let name = self
                .location
                .key
                .rsplit('/')
                .next()
                .unwrap_or(&self.location.key);
            self.file.join(name)
        } else {
            self.file.clone()
        }
    }

    fn identity(&self, file: &Path) -> TransferIdentity {
        TransferIdentity {
            bucket: self.location.bucket.clone(),
            key: self.location.key.clone(),
            version_id: self.location.version_id.clone(),
            part_size: self.options.part_size(),
            conditions: self.conditions.clone(),
            sse: self.sse.as_ref().map(SseCustomer::identity),
            file_path: Some(file.to_string_lossy().to_string()),
            ..Default::default()
        }
    }

    /// The checkpoint is kept next to the destination file by default.
    fn checkpoint_path(&self, file: &Path) -> PathBuf {
        if let Some(path) = self.options.checkpoint_file() {
            return path.clone();
        }

        let name = file
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        default_path(
            file.parent().unwrap_or(Path::new("")),
            &name,
            TransferKind::Download,
            &[
                self.location.bucket.as_str(),
                self.location.key.as_str(),
                self.location.version_id.as_deref().unwrap_or_default(),
            ],
        )
    }

    /// Ranged gets must read the object that was checked, so they match its ETag unless the
    /// caller gave one.
    fn source(&self, meta: &ObjectMeta) -> DownloadSource {
        let mut conditions = self.conditions.clone();
        if conditions.if_match.is_none() {
            conditions.if_match = meta.e_tag.clone();
        }

        DownloadSource {
            location: self.location.clone(),
            conditions,
            sse: self.sse.clone(),
        }
    }

    fn output(&self, meta: ObjectMeta, file: PathBuf) -> DownloadOutput {
        DownloadOutput {
            bucket: self.location.bucket.clone(),
            key: self.location.key.clone(),
            file,
            size: meta.size,
            e_tag: meta.e_tag,
            crc64: meta.crc64,
            version_id: meta.version_id,
            parts_total: 0,
            parts_transferred: 0,
            resumed: false,
            verified: false,
        }
    }

    /// Run the download.
    pub async fn run(self) -> Result<DownloadOutput> {
        let meta = self
            .store
            .head_object(&HeadRequest {
                location: self.location.clone(),
                conditions: self.conditions.clone(),
                sse: self.sse.clone(),
            })
            .await?;

        // Keys ending in a slash are directory markers.
        if self.location.key.ends_with('/') {
            fs::create_dir_all(&self.file).await?;
            debug!(directory = %self.file.display(), "created directory for directory marker");
            return Ok(self.output(meta, self.file.clone()));
        }

        let file = self.destination().await;
        if let Some(parent) = file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let temp_file = temp_file_path(&file);

        let enable_checkpoint = self.options.enable_checkpoint();
        let checkpoint_path = self.checkpoint_path(&file);
        let identity = self.identity(&file);
        let source = ObjectIdentity::from(&meta);
        let (mut checkpoint, mut resumed) = Checkpoint::resume_or_init(
            self.store.as_ref(),
            checkpoint_path.clone(),
            enable_checkpoint,
            TransferKind::Download,
            identity.clone(),
            source.clone(),
        )
        .await?;

        // Downloaded parts only exist in the temporary file.
        if resumed
            && (checkpoint.temp_file_path() != Some(temp_file.as_path())
                || !fs::try_exists(&temp_file).await.unwrap_or(false))
        {
            debug!(
                temp_file = %temp_file.display(),
                "temporary file is missing, restarting download"
            );
            checkpoint.remove().await;
            checkpoint =
                Checkpoint::init(checkpoint_path, TransferKind::Download, identity, source)?;
            resumed = false;
        }

        if !resumed {
            let created = fs::File::create(&temp_file).await?;
            created.set_len(meta.size).await?;
        }
        checkpoint.set_temp_file_path(temp_file.clone());

        let cleanup = Cleanup {
            temp_file: temp_file.clone(),
        };
        if enable_checkpoint {
            if let Err(err) = checkpoint.persist().await {
                cleanup.run(&checkpoint).await;
                return Err(err);
            }
        }

        info!(
            bucket = %self.location.bucket,
            key = %self.location.key,
            file = %file.display(),
            parts = checkpoint.parts().len(),
            pending = checkpoint.pending_parts().len(),
            "starting download"
        );

        let events = self
            .options
            .events(TransferKind::Download, &self.location.bucket, &self.location.key)
            .with_checkpoint_file(enable_checkpoint.then(|| checkpoint.path().to_path_buf()));
        let controls = self.options.controls(meta.size, checkpoint.completed_size());
        controls.start();

        let download_source = Arc::new(self.source(&meta));
        let temp = Arc::new(temp_file.clone());
        let tasks = checkpoint
            .pending_parts()
            .into_iter()
            .map(|part| {
                Box::new(DownloadPartTask::new(
                    self.store.clone(),
                    download_source.clone(),
                    temp.clone(),
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
        .with_events(events.clone())
        .run(&mut checkpoint)
        .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                cleanup.run(&checkpoint).await;
                return Err(err);
            }
        };
        let parts_transferred = outcome.succeeded;

        self.handle_outcome(&cleanup, &checkpoint, outcome).await?;

        let verified = match verify(
            self.options.verify(),
            meta.crc64,
            checkpoint.combined_crc64(),
        ) {
            Ok(verified) => verified,
            Err(err) => {
                warn!(%err, "verification failed");
                cleanup.run(&checkpoint).await;
                return Err(err);
            }
        };

        rename(&events, &temp_file, &file).await?;
        checkpoint.remove().await;

        Ok(DownloadOutput {
            parts_total: checkpoint.parts().len(),
            parts_transferred,
            resumed,
            verified,
            ..self.output(meta, file)
        })
    }

    /// Map the outcome of the part tasks to the result of the download. Downloaded parts are
    /// kept when there is a checkpoint to resume them with.
    async fn handle_outcome(
        &self,
        cleanup: &Cleanup,
        checkpoint: &Checkpoint,
        outcome: GroupOutcome,
    ) -> Result<()> {
        let GroupOutcome {
            total,
            failed,
            state,
            ..
        } = outcome;

        let keep = self.options.enable_checkpoint();
        let (err, remove) = match state {
            GroupState::Completed => return Ok(()),
            GroupState::Aborted(err) => (err, true),
            GroupState::Incomplete(errors) => (incomplete(failed, total, &errors), !keep),
            GroupState::Cancelled => (Cancelled, self.options.cancel_hook().is_abort() || !keep),
        };

        if remove {
            cleanup.run(checkpoint).await;
        } else {
            debug!(checkpoint = %checkpoint.path().display(), "keeping download for resuming");
        }

        Err(err)
    }
}

/// Local files to remove when a download cannot be resumed.
struct Cleanup {
    temp_file: PathBuf,
}

impl Cleanup {
    async fn run(&self, checkpoint: &Checkpoint) {
        checkpoint.remove().await;

        match fs::remove_file(&self.temp_file).await {
            Ok(()) => debug!(temp_file = %self.temp_file.display(), "removed temporary file"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                temp_file = %self.temp_file.display(),
                %err,
                "failed to remove temporary file"
            ),
        }
    }
}

/// The temporary file for a destination, `<file>.temp`.
pub fn temp_file_path(file: &Path) -> PathBuf {
    let mut path = OsString::from(file.as_os_str());
    path.push(TEMP_FILE_SUFFIX);
    path.into()
}

async fn rename(events: &EventSink, temp_file: &Path, file: &Path) -> Result<()> {
    match fs::rename(temp_file, file).await {
        Ok(()) => {
            events.succeeded(EventType::RenameTempFileSucceeded);
            Ok(())
        }
        Err(err) => {
            let err = IOError(format!(
                "renaming {} to {}: {}",
                temp_file.display(),
                file.display(),
                err
            ));
            events.failed(EventType::RenameTempFileFailed, &err);
            Err(err)
        }
    }
}
