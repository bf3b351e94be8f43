//! Structs related to output statistics.
//!

use crate::transfer::copy::CopyOutput;
use crate::transfer::download::DownloadOutput;
use crate::transfer::upload::UploadOutput;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The result of one of the transfer subcommands.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferResult {
    Upload(UploadOutput),
    Download(DownloadOutput),
    Copy(CopyOutput),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransferStats {
    pub(crate) elapsed_seconds: f64,
    #[serde(flatten)]
    pub(crate) result: TransferResult,
}

impl TransferStats {
    pub fn new(elapsed: Duration, result: TransferResult) -> Self {
        Self {
            elapsed_seconds: elapsed.as_secs_f64(),
            result,
        }
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed_seconds
    }

    pub fn result(&self) -> &TransferResult {
        &self.result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn stats_are_keyed_by_transfer() -> anyhow::Result<()> {
        let stats = TransferStats::new(
            Duration::from_millis(1500),
            TransferResult::Upload(UploadOutput {
                bucket: "bucket".to_string(),
                key: "key".to_string(),
                upload_id: "id".to_string(),
                e_tag: None,
                crc64: Some(1),
                version_id: None,
                parts_total: 2,
                parts_transferred: 1,
                resumed: true,
                verified: true,
            }),
        );

        let value = serde_json::to_value(&stats)?;
        assert_eq!(value["elapsed_seconds"], json!(1.5));
        assert_eq!(value["upload"]["parts_transferred"], json!(1));
        assert_eq!(value["upload"]["resumed"], json!(true));

        Ok(())
    }
}
