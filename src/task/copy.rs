//! Server-side copy of one byte range into a part.
//!

use crate::error::Result;
use crate::io::control::TransferControls;
use crate::io::{Conditions, CopySource, MultipartTarget, ObjectLocation, ObjectStore, SseCustomer};
use crate::part::Part;
use crate::task::PartTask;
use async_trait::async_trait;
use std::sync::Arc;

/// The object a copy reads from.
#[derive(Debug, Clone)]
pub struct CopySourceObject {
    pub location: ObjectLocation,
    pub conditions: Conditions,
    pub sse: Option<SseCustomer>,
}

/// Copies one part of the source object.
pub struct CopyPartTask {
    store: Arc<dyn ObjectStore>,
    target: Arc<MultipartTarget>,
    source: Arc<CopySourceObject>,
    controls: TransferControls,
    part: Part,
}

impl CopyPartTask {
    /// Create the task.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        target: Arc<MultipartTarget>,
        source: Arc<CopySourceObject>,
        controls: TransferControls,
        part: Part,
    ) -> Self {
        Self {
            store,
            target,
            source,
            controls,
            part,
        }
    }
}

#[async_trait]
impl PartTask for CopyPartTask {
    fn part(&self) -> &Part {
        &self.part
    }

    async fn run(&self) -> Result<Part> {
        // An empty range cannot be copied, so an empty source becomes one empty part.
        let output = if self.part.is_zero_size() {
            self.store
                .upload_part(&self.target, self.part.part_number(), vec![])
                .await?
        } else {
            let source = CopySource {
                location: self.source.location.clone(),
                conditions: self.source.conditions.clone(),
                sse: self.source.sse.clone(),
                range_start: self.part.range_start(),
                range_end: self.part.range_end(),
            };
            self.store
                .copy_part(&self.target, self.part.part_number(), &source)
                .await?
        };

        self.controls.progress(self.part.size());
        Ok(self.part.clone().complete(output.e_tag, output.crc64))
    }
}
