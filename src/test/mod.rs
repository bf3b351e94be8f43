//! Test related functionality used internally within resumable-transfer.
//!

#![doc(hidden)]


pub use store::{Calls, MemoryStore};

use crate::error::Result;
use crate::event::{EventListener, EventType, TransferEvent};
use crate::io::control::{DataTransferListener, DataTransferStatus};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::fs;

const CONSTANT_SEED: u64 = 42;

/// The default test file size. 12 MiB, which is three parts at the minimum part size.
pub const TEST_FILE_SIZE: u64 = 12 * 1024 * 1024;

/// The default test file name.
pub const TEST_FILE_NAME: &str = "test_file";

/// Generate repeatable random bytes.
pub fn random_bytes(size: usize, seed: u64) -> Vec<u8> {
    let mut buf = vec![0; size];
    StdRng::seed_from_u64(seed).fill_bytes(&mut buf);
    buf
}

/// Generate test files in a directory.
pub struct TestFileBuilder {
    directory: PathBuf,
    seed: u64,
    file_size: u64,
    file_name: String,
}

impl Default for TestFileBuilder {
    fn default() -> Self {
        Self {
            directory: std::env::temp_dir(),
            seed: CONSTANT_SEED,
            file_size: TEST_FILE_SIZE,
            file_name: TEST_FILE_NAME.to_string(),
        }
    }
}

impl TestFileBuilder {
    /// Add the random seed to generate the file with.
    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the file size.
    pub fn with_file_size(mut self, file_size: u64) -> Self {
        self.file_size = file_size;
        self
    }

    /// Set the directory to write the file to.
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    /// Get the contents the file will be generated with.
    pub fn contents(&self) -> Result<Vec<u8>> {
        Ok(random_bytes(usize::try_from(self.file_size)?, self.seed))
    }

    /// Generate the file, overwriting any existing file.
    pub async fn generate(self) -> Result<PathBuf> {
        fs::create_dir_all(&self.directory).await?;

        let file = self.directory.join(&self.file_name);
        fs::write(&file, self.contents()?).await?;

        Ok(file)
    }
}

/// Records every event it receives.
#[derive(Debug, Default)]
pub struct EventRecorder(Mutex<Vec<TransferEvent>>);

impl EventRecorder {
    /// Get the recorded events.
    pub fn events(&self) -> Vec<TransferEvent> {
        self.0.lock().expect("poisoned recorder").clone()
    }

    /// Count the recorded events of a type.
    pub fn count(&self, event_type: EventType) -> usize {
        self.events()
            .iter()
            .filter(|event| event.event_type == event_type)
            .count()
    }
}

impl EventListener for EventRecorder {
    fn on_event(&self, event: &TransferEvent) {
        self.0.lock().expect("poisoned recorder").push(event.clone());
    }
}

/// Records the last progress update.
#[derive(Debug, Default)]
pub struct ProgressRecorder(Mutex<Option<DataTransferStatus>>);

impl ProgressRecorder {
    /// Get the last progress update.
    pub fn last(&self) -> Option<DataTransferStatus> {
        *self.0.lock().expect("poisoned recorder")
    }
}

impl DataTransferListener for ProgressRecorder {
    fn on_progress(&self, status: DataTransferStatus) {
        let mut last = self.0.lock().expect("poisoned recorder");
        // Updates from concurrent workers can arrive out of order.
        if last.map_or(true, |last| last.consumed_bytes <= status.consumed_bytes) {
            *last = Some(status);
        }
    }
}
