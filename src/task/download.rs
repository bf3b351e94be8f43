//! Download one byte range into its position in the temporary file.
//!

use crate::error::Error::IOError;
use crate::error::Result;
use crate::io::control::TransferControls;
use crate::io::{Conditions, ObjectLocation, ObjectStore, RangeRequest, SseCustomer};
use crate::part::Part;
use crate::task::PartTask;
use async_trait::async_trait;
use crc64fast_nvme::Digest;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

const BUFFER_SIZE: usize = 64 * 1024;

/// The object a download reads from.
#[derive(Debug, Clone)]
pub struct DownloadSource {
    pub location: ObjectLocation,
    pub conditions: Conditions,
    pub sse: Option<SseCustomer>,
}

/// Downloads one part into the temporary file.
pub struct DownloadPartTask {
    store: Arc<dyn ObjectStore>,
    source: Arc<DownloadSource>,
    temp_file: Arc<PathBuf>,
    controls: TransferControls,
    part: Part,
}

impl DownloadPartTask {
    /// Create the task.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        source: Arc<DownloadSource>,
        temp_file: Arc<PathBuf>,
        controls: TransferControls,
        part: Part,
    ) -> Self {
        Self {
            store,
            source,
            temp_file,
            controls,
            part,
        }
    }
}

#[async_trait]
impl PartTask for DownloadPartTask {
    fn part(&self) -> &Part {
        &self.part
    }

    async fn run(&self) -> Result<Part> {
        let mut digest = Digest::new();
        if self.part.is_zero_size() {
            return Ok(self.part.clone().complete(None, Some(digest.sum64())));
        }

        let mut body = self
            .store
            .get_range(&RangeRequest {
                location: self.source.location.clone(),
                conditions: self.source.conditions.clone(),
                sse: self.source.sse.clone(),
                range_start: self.part.range_start(),
                range_end: self.part.range_end(),
            })
            .await?;

        // Each task writes to its own disjoint range using its own handle.
        let mut file = OpenOptions::new()
            .write(true)
            .open(self.temp_file.as_path())
            .await?;
        file.seek(SeekFrom::Start(self.part.range_start())).await?;

        let size = self.part.size();
        let mut buf = vec![0; BUFFER_SIZE];
        let mut written = 0;
        loop {
            let n = body.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            // Bytes past the end of the range belong to another part.
            if written + n as u64 > size {
                return Err(IOError(format!(
                    "part {} expected {} bytes but received more",
                    self.part.part_number(),
                    size
                )));
            }

            self.controls.throttle(n as u64).await;
            file.write_all(&buf[..n]).await?;
            digest.write(&buf[..n]);
            written += n as u64;
            self.controls.progress(n as u64);
        }
        file.flush().await?;

        if written != size {
            return Err(IOError(format!(
                "part {} expected {} bytes but received {}",
                self.part.part_number(),
                size,
                written
            )));
        }

        Ok(self.part.clone().complete(None, Some(digest.sum64())))
    }
}
