//! Resumable, checkpointed multipart transfers for S3-compatible object stores.
//!
//! Objects are split into parts which are uploaded, downloaded or server-side copied
//! concurrently. Progress is recorded in a checkpoint file so that an interrupted transfer
//! continues where it left off, and the result is verified using a CRC64 combined from the
//! part checksums.
//!

pub mod checkpoint;
pub mod checksum;
pub mod cli;
pub mod error;
pub mod event;
pub mod io;
pub mod part;
pub mod stats;
pub mod task;
pub mod transfer;

#[doc(hidden)]
pub mod test;

pub use cli::Command;
