//! Upload a byte range of a local file as one part.
//!

use crate::checksum::crc64;
use crate::error::Error::ChecksumMismatch;
use crate::error::Result;
use crate::io::control::TransferControls;
use crate::io::{MultipartTarget, ObjectStore};
use crate::part::Part;
use crate::task::PartTask;
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// The size of reads from the local file, which is also the granularity of rate limiting.
const READ_CHUNK_SIZE: usize = 1024 * 1024;

/// Uploads one part of a local file.
pub struct UploadPartTask {
    store: Arc<dyn ObjectStore>,
    target: Arc<MultipartTarget>,
    file: Arc<PathBuf>,
    controls: TransferControls,
    part: Part,
}

impl UploadPartTask {
    /// Create the task.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        target: Arc<MultipartTarget>,
        file: Arc<PathBuf>,
        controls: TransferControls,
        part: Part,
    ) -> Self {
        Self {
            store,
            target,
            file,
            controls,
            part,
        }
    }

    /// Read the part's range from the file.
    async fn read_range(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0; usize::try_from(self.part.size())?];
        if buf.is_empty() {
            return Ok(buf);
        }

        let mut file = File::open(self.file.as_path()).await?;
        file.seek(SeekFrom::Start(self.part.range_start())).await?;
        for chunk in buf.chunks_mut(READ_CHUNK_SIZE) {
            self.controls.throttle(chunk.len() as u64).await;
            file.read_exact(chunk).await?;
        }

        Ok(buf)
    }
}

#[async_trait]
impl PartTask for UploadPartTask {
    fn part(&self) -> &Part {
        &self.part
    }

    async fn run(&self) -> Result<Part> {
        let body = self.read_range().await?;
        let size = body.len() as u64;
        let local = crc64(&body);

        let output = self
            .store
            .upload_part(&self.target, self.part.part_number(), body)
            .await?;
        if let Some(remote) = output.crc64 {
            if remote != local {
                return Err(ChecksumMismatch {
                    expected: local,
                    actual: remote,
                });
            }
        }

        self.controls.progress(size);
        Ok(self.part.clone().complete(output.e_tag, Some(local)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::CreateMultipartRequest;
    use crate::part::plan_parts;
    use crate::test::{MemoryStore, TestFileBuilder};
    use tempfile::tempdir;

    #[tokio::test]
    async fn upload_part() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let builder = TestFileBuilder::default()
            .with_directory(dir.path())
            .with_file_size(100);
        let contents = builder.contents()?;
        let file = builder.generate().await?;

        let store = Arc::new(MemoryStore::default());
        let upload_id = store
            .create_multipart_upload(&CreateMultipartRequest {
                bucket: "bucket".to_string(),
                key: "key".to_string(),
                ..Default::default()
            })
            .await?;
        let target = Arc::new(MultipartTarget {
            bucket: "bucket".to_string(),
            key: "key".to_string(),
            upload_id: upload_id.clone(),
            sse: None,
        });

        let part = plan_parts(100, 40)?.remove(1);
        let task = UploadPartTask::new(
            store.clone(),
            target,
            Arc::new(file),
            TransferControls::default(),
            part,
        );
        let completed = task.run().await?;

        assert!(completed.is_completed());
        assert!(completed.e_tag().is_some());
        assert_eq!(completed.crc64(), Some(crc64(&contents[40..80])));
        assert_eq!(store.uploaded_parts(&upload_id), vec![2]);

        Ok(())
    }
}
