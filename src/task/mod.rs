//! Tasks which transfer a single part, and the group that runs them concurrently.
//!

use crate::error::Result;
use crate::part::Part;
use async_trait::async_trait;

pub mod copy;
pub mod download;
pub mod group;
pub mod upload;

/// The transfer of one part. A task does not retry, failures are reported to the group.
#[async_trait]
pub trait PartTask: Send + Sync {
    /// The part this task transfers.
    fn part(&self) -> &Part;

    /// Transfer the part, returning it marked as completed with its ETag and checksum.
    async fn run(&self) -> Result<Part>;
}

/// A boxed part task.
pub type BoxedTask = Box<dyn PartTask>;
