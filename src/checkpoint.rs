//! Checkpoint files which record the progress of a transfer so that it can be resumed.
//!

use crate::checksum::combine_parts;
use crate::error::Error::CheckpointError;
use crate::error::Result;
use crate::io::{Conditions, CompletedPart, MultipartTarget, ObjectMeta, ObjectStore, SseIdentity};
use crate::part::{plan_parts, Part};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{Display, Formatter};
use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// The version of the checkpoint format.
pub const CHECKPOINT_VERSION: &str = "1";

/// The direction of a transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TransferKind {
    Upload,
    Download,
    Copy,
}

impl Display for TransferKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferKind::Upload => f.write_str("upload"),
            TransferKind::Download => f.write_str("download"),
            TransferKind::Copy => f.write_str("copy"),
        }
    }
}

/// The request parameters a checkpoint belongs to. A checkpoint is only reused by a request
/// with identical parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct TransferIdentity {
    pub bucket: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    pub part_size: u64,
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse: Option<SseIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_sse: Option<SseIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

/// The state of the source when the checkpoint was created. Any change to the source
/// invalidates the checkpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ObjectIdentity {
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc64: Option<u64>,
}

impl From<&ObjectMeta> for ObjectIdentity {
    fn from(meta: &ObjectMeta) -> Self {
        Self {
            size: meta.size,
            e_tag: meta.e_tag.clone(),
            last_modified: meta.last_modified.clone(),
            crc64: meta.crc64,
        }
    }
}

impl ObjectIdentity {
    /// The identity of a local file, using its size and modification time.
    pub fn from_file(metadata: &Metadata) -> Self {
        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
            .map(|modified| format!("{}.{:09}", modified.as_secs(), modified.subsec_nanos()));

        Self {
            size: metadata.len(),
            e_tag: None,
            last_modified,
            crc64: None,
        }
    }
}

/// The progress of a transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Checkpoint {
    #[serde(skip)]
    path: PathBuf,
    version: String,
    kind: TransferKind,
    identity: TransferIdentity,
    source: ObjectIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    upload_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    temp_file_path: Option<PathBuf>,
    parts_info: Vec<Part>,
}

impl Checkpoint {
    /// Create a new checkpoint with freshly planned parts and no multipart session.
    pub fn init(
        path: PathBuf,
        kind: TransferKind,
        identity: TransferIdentity,
        source: ObjectIdentity,
    ) -> Result<Self> {
        let parts_info = plan_parts(source.size, identity.part_size)?;

        Ok(Self {
            path,
            version: CHECKPOINT_VERSION.to_string(),
            kind,
            identity,
            source,
            upload_id: None,
            temp_file_path: None,
            parts_info,
        })
    }

    /// Load a checkpoint. Any error reading or parsing the file means there is no checkpoint.
    pub async fn load(path: &Path) -> Option<Self> {
        let contents = match fs::read(path).await {
            Ok(contents) => contents,
            Err(err) => {
                debug!(path = %path.display(), %err, "no checkpoint loaded");
                return None;
            }
        };

        match serde_json::from_slice::<Self>(&contents) {
            Ok(mut checkpoint) => {
                checkpoint.path = path.to_path_buf();
                Some(checkpoint)
            }
            Err(err) => {
                debug!(path = %path.display(), %err, "ignoring unreadable checkpoint");
                None
            }
        }
    }

    /// Whether this checkpoint can be used to resume a transfer with the given parameters
    /// and source state.
    pub fn is_valid(
        &self,
        kind: TransferKind,
        identity: &TransferIdentity,
        source: &ObjectIdentity,
    ) -> bool {
        if self.version != CHECKPOINT_VERSION
            || self.kind != kind
            || &self.identity != identity
            || &self.source != source
        {
            return false;
        }

        // Parts written to a multipart session can only be completed with their ETag.
        if kind != TransferKind::Download
            && self
                .parts_info
                .iter()
                .any(|part| part.is_completed() && part.e_tag().is_none())
        {
            return false;
        }

        let Ok(planned) = plan_parts(source.size, identity.part_size) else {
            return false;
        };
        planned.len() == self.parts_info.len()
            && planned
                .iter()
                .zip(&self.parts_info)
                .all(|(planned, part)| planned.same_range(part))
    }

    /// Load a valid checkpoint or create a new one. A stale checkpoint that references a
    /// multipart session has that session aborted before it is replaced. Returns whether an
    /// existing checkpoint was reused.
    pub async fn resume_or_init(
        store: &dyn ObjectStore,
        path: PathBuf,
        enabled: bool,
        kind: TransferKind,
        identity: TransferIdentity,
        source: ObjectIdentity,
    ) -> Result<(Self, bool)> {
        if enabled {
            if let Some(checkpoint) = Self::load(&path).await {
                if checkpoint.is_valid(kind, &identity, &source) {
                    debug!(
                        path = %path.display(),
                        completed = checkpoint.completed_count(),
                        total = checkpoint.parts_info.len(),
                        "resuming from checkpoint"
                    );
                    return Ok((checkpoint, true));
                }

                debug!(path = %path.display(), "checkpoint does not match the transfer");
                checkpoint.abort_stale_session(store).await;
                checkpoint.remove().await;
            }
        }

        Ok((Self::init(path, kind, identity, source)?, false))
    }

    /// Abort the session of a checkpoint that will not be resumed.
    async fn abort_stale_session(&self, store: &dyn ObjectStore) {
        let Some(upload_id) = &self.upload_id else {
            return;
        };

        let target = MultipartTarget {
            bucket: self.identity.bucket.clone(),
            key: self.identity.key.clone(),
            upload_id: upload_id.to_string(),
            sse: None,
        };
        if let Err(err) = store.abort_multipart_upload(&target).await {
            warn!(%upload_id, %err, "failed to abort stale multipart upload");
        }
    }

    /// Write the checkpoint to a temporary file and rename it over the checkpoint so that a
    /// crash never leaves a partially written checkpoint.
    pub async fn persist(&self) -> Result<()> {
        self.write()
            .await
            .map_err(|err| CheckpointError(format!("{}: {}", self.path.display(), err)))
    }

    async fn write(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let contents = serde_json::to_vec(self)?;
        let temp = self.write_path();

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&temp).await?;
        file.write_all(&contents).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp, &self.path).await?;
        Ok(())
    }

    fn write_path(&self) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(".tmp");
        path.into()
    }

    /// Delete the checkpoint file, logging any failure.
    pub async fn remove(&self) {
        match fs::remove_file(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "removed checkpoint"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), %err, "failed to remove checkpoint"),
        }
    }

    /// Record a transferred part. The part number and range must match the planned part.
    pub fn update_part(&mut self, part: Part) -> Result<()> {
        let index = usize::try_from(part.part_number().saturating_sub(1))?;

        match self.parts_info.get_mut(index) {
            Some(existing) if existing.same_range(&part) => {
                *existing = part;
                Ok(())
            }
            _ => Err(CheckpointError(format!(
                "part {} does not match the planned parts",
                part.part_number()
            ))),
        }
    }

    /// Get the path of the checkpoint file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the kind of transfer.
    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    /// Get the transfer parameters.
    pub fn identity(&self) -> &TransferIdentity {
        &self.identity
    }

    /// Get the source state.
    pub fn source(&self) -> &ObjectIdentity {
        &self.source
    }

    /// Get the multipart session id.
    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    /// Set the multipart session id.
    pub fn set_upload_id(&mut self, upload_id: String) {
        self.upload_id = Some(upload_id);
    }

    /// Get the temporary file that a download writes to.
    pub fn temp_file_path(&self) -> Option<&Path> {
        self.temp_file_path.as_deref()
    }

    /// Set the temporary file that a download writes to.
    pub fn set_temp_file_path(&mut self, temp_file_path: PathBuf) {
        self.temp_file_path = Some(temp_file_path);
    }

    /// Get all parts.
    pub fn parts(&self) -> &[Part] {
        &self.parts_info
    }

    /// Get the parts that have not been transferred, ordered by part number.
    pub fn pending_parts(&self) -> Vec<Part> {
        self.parts_info
            .iter()
            .filter(|part| !part.is_completed())
            .cloned()
            .collect()
    }

    /// The number of transferred parts.
    pub fn completed_count(&self) -> usize {
        self.parts_info
            .iter()
            .filter(|part| part.is_completed())
            .count()
    }

    /// The number of bytes in transferred parts.
    pub fn completed_size(&self) -> u64 {
        self.parts_info
            .iter()
            .filter(|part| part.is_completed())
            .map(Part::size)
            .sum()
    }

    /// Whether every part has been transferred.
    pub fn is_complete(&self) -> bool {
        self.parts_info.iter().all(Part::is_completed)
    }

    /// The parts to complete the multipart session with.
    pub fn completed_parts(&self) -> Vec<CompletedPart> {
        self.parts_info
            .iter()
            .map(|part| CompletedPart {
                part_number: part.part_number(),
                e_tag: part.e_tag().map(|e_tag| e_tag.to_string()),
                crc64: part.crc64(),
            })
            .collect()
    }

    /// The checksum of the whole object, if every part has a checksum.
    pub fn combined_crc64(&self) -> Option<u64> {
        let parts = self
            .parts_info
            .iter()
            .map(|part| part.crc64().map(|crc| (crc, part.size())))
            .collect::<Option<Vec<_>>>()?;

        Some(combine_parts(parts))
    }
}

/// The default checkpoint location: `<directory>/<name>.<hash>.<kind>` where the hash is
/// taken over the transfer's object identifiers.
pub fn default_path(directory: &Path, name: &str, kind: TransferKind, ids: &[&str]) -> PathBuf {
    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.as_bytes());
        hasher.update([0]);
    }
    let hash = hex::encode(&hasher.finalize()[..8]);

    directory.join(format!("{name}.{hash}.{kind}"))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::checksum::crc64;
    use crate::io::CreateMultipartRequest;
    use crate::part::MIN_PART_SIZE;
    use crate::test::MemoryStore;
    use tempfile::tempdir;

    fn identity() -> TransferIdentity {
        TransferIdentity {
            bucket: "bucket".to_string(),
            key: "key".to_string(),
            part_size: MIN_PART_SIZE,
            ..Default::default()
        }
    }

    fn source() -> ObjectIdentity {
        ObjectIdentity {
            size: 2 * MIN_PART_SIZE + 1,
            e_tag: Some("\"etag\"".to_string()),
            last_modified: Some("2024-01-01T00:00:00Z".to_string()),
            crc64: Some(1),
        }
    }

    fn checkpoint(path: PathBuf) -> anyhow::Result<Checkpoint> {
        Ok(Checkpoint::init(
            path,
            TransferKind::Download,
            identity(),
            source(),
        )?)
    }

    #[tokio::test]
    async fn persist_and_load() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("checkpoint");
        let mut checkpoint = checkpoint(path.clone())?;

        let part = checkpoint.parts()[1].clone().complete(None, Some(5));
        checkpoint.update_part(part)?;
        checkpoint.persist().await?;

        assert!(!checkpoint.write_path().exists());
        let loaded = Checkpoint::load(&path).await.unwrap();
        assert_eq!(loaded, checkpoint);
        assert_eq!(loaded.completed_count(), 1);
        assert_eq!(loaded.pending_parts().len(), 2);
        assert_eq!(loaded.completed_size(), MIN_PART_SIZE);

        Ok(())
    }

    #[tokio::test]
    async fn required_fields_are_always_written() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let checkpoint = checkpoint(dir.path().join("checkpoint"))?;

        let value = serde_json::to_value(&checkpoint)?;
        let part = &value["PartsInfo"][0];
        assert_eq!(part["RangeStart"], 0);
        assert_eq!(part["IsCompleted"], false);
        assert!(part.get("Crc64").is_none());

        Ok(())
    }

    #[tokio::test]
    async fn truncated_checkpoint_is_ignored() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("checkpoint");
        let checkpoint = checkpoint(path.clone())?;
        checkpoint.persist().await?;

        let contents = fs::read(&path).await?;
        fs::write(&path, &contents[..contents.len() / 2]).await?;
        assert!(Checkpoint::load(&path).await.is_none());

        let mut value = serde_json::to_value(&checkpoint)?;
        value["PartsInfo"][0]
            .as_object_mut()
            .unwrap()
            .remove("IsCompleted");
        fs::write(&path, serde_json::to_vec(&value)?).await?;
        assert!(Checkpoint::load(&path).await.is_none());

        assert!(Checkpoint::load(&dir.path().join("missing")).await.is_none());

        Ok(())
    }

    #[test]
    fn source_changes_invalidate() -> anyhow::Result<()> {
        let checkpoint = checkpoint(PathBuf::from("checkpoint"))?;
        let kind = TransferKind::Download;

        assert!(checkpoint.is_valid(kind, &identity(), &source()));
        assert!(!checkpoint.is_valid(TransferKind::Copy, &identity(), &source()));

        let changes: [fn(&mut ObjectIdentity); 4] = [
            |source| source.size += 1,
            |source| source.e_tag = Some("\"other\"".to_string()),
            |source| source.last_modified = None,
            |source| source.crc64 = Some(2),
        ];
        for change in changes {
            let mut changed = source();
            change(&mut changed);
            assert!(!checkpoint.is_valid(kind, &identity(), &changed));
        }

        let mut changed = identity();
        changed.version_id = Some("v2".to_string());
        assert!(!checkpoint.is_valid(kind, &changed, &source()));

        let mut changed = identity();
        changed.part_size += 1;
        assert!(!checkpoint.is_valid(kind, &changed, &source()));

        Ok(())
    }

    #[test]
    fn parts_are_immutable() -> anyhow::Result<()> {
        let mut checkpoint = checkpoint(PathBuf::from("checkpoint"))?;

        let moved = Part::new(1, 1, MIN_PART_SIZE).complete(None, None);
        assert!(checkpoint.update_part(moved).is_err());
        let missing = Part::new(4, 0, 1).complete(None, None);
        assert!(checkpoint.update_part(missing).is_err());
        let zero = Part::new(0, 0, 1).complete(None, None);
        assert!(checkpoint.update_part(zero).is_err());

        assert_eq!(checkpoint.completed_count(), 0);

        Ok(())
    }

    #[test]
    fn completed_upload_parts_need_e_tags() -> anyhow::Result<()> {
        let mut checkpoint = Checkpoint::init(
            PathBuf::from("checkpoint"),
            TransferKind::Upload,
            identity(),
            source(),
        )?;
        let part = checkpoint.parts()[0].clone().complete(None, Some(1));
        checkpoint.update_part(part)?;

        assert!(!checkpoint.is_valid(TransferKind::Upload, &identity(), &source()));

        Ok(())
    }

    #[test]
    fn combined_crc64() -> anyhow::Result<()> {
        let data = crate::test::random_bytes(2 * MIN_PART_SIZE as usize + 1, 3);
        let mut checkpoint = checkpoint(PathBuf::from("checkpoint"))?;
        assert_eq!(checkpoint.combined_crc64(), None);

        for part in checkpoint.pending_parts() {
            let range = part.range_start() as usize..=part.range_end() as usize;
            let crc = crc64(&data[range]);
            checkpoint.update_part(part.complete(None, Some(crc)))?;
        }

        assert!(checkpoint.is_complete());
        assert_eq!(checkpoint.combined_crc64(), Some(crc64(&data)));

        Ok(())
    }

    #[tokio::test]
    async fn stale_checkpoint_aborts_session() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("checkpoint");
        let store = MemoryStore::default();

        let upload_id = store
            .create_multipart_upload(&CreateMultipartRequest {
                bucket: "bucket".to_string(),
                key: "key".to_string(),
                ..Default::default()
            })
            .await?;
        let mut stale = checkpoint(path.clone())?;
        stale.set_upload_id(upload_id);
        stale.persist().await?;

        let mut changed = source();
        changed.size += 1;
        let (checkpoint, resumed) = Checkpoint::resume_or_init(
            &store,
            path.clone(),
            true,
            TransferKind::Download,
            identity(),
            changed,
        )
        .await?;

        assert!(!resumed);
        assert_eq!(checkpoint.upload_id(), None);
        assert_eq!(store.calls().abort, 1);
        assert_eq!(store.open_uploads(), 0);
        assert!(!path.exists());

        Ok(())
    }

    #[tokio::test]
    async fn valid_checkpoint_is_resumed() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("checkpoint");
        let store = MemoryStore::default();
        checkpoint(path.clone())?.persist().await?;

        let (_, resumed) = Checkpoint::resume_or_init(
            &store,
            path.clone(),
            true,
            TransferKind::Download,
            identity(),
            source(),
        )
        .await?;
        assert!(resumed);

        let (_, resumed) = Checkpoint::resume_or_init(
            &store,
            path,
            false,
            TransferKind::Download,
            identity(),
            source(),
        )
        .await?;
        assert!(!resumed);

        Ok(())
    }

    #[test]
    fn default_paths() {
        let dir = Path::new("/data");
        let a = default_path(dir, "file", TransferKind::Upload, &["bucket", "key"]);
        let b = default_path(dir, "file", TransferKind::Upload, &["bucket", "key"]);
        let c = default_path(dir, "file", TransferKind::Upload, &["bucket", "other"]);
        let d = default_path(dir, "file", TransferKind::Upload, &["bucketk", "ey"]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.starts_with(dir));
        assert!(a.to_string_lossy().ends_with(".upload"));
    }
}
