//! Cli commands and code.
//!

use crate::error::Error::ParseError;
use crate::error::Result;
use crate::event::{EventListener, TransferEvent};
use crate::io::aws::S3Builder;
use crate::io::control::{BandwidthLimiter, DataTransferListener, DataTransferStatus};
use crate::io::{ObjectStore, Provider};
use crate::part::DEFAULT_PART_SIZE;
use crate::stats::{TransferResult, TransferStats};
use crate::transfer::cancel::CancelHook;
use crate::transfer::copy::CopyBuilder;
use crate::transfer::download::DownloadBuilder;
use crate::transfer::upload::UploadBuilder;
use crate::transfer::{TransferOptions, VerifyMode};
use clap::{Args, Parser, Subcommand};
use humantime::Duration;
use indicatif::{ProgressBar, ProgressStyle};
use parse_size::parse_size;
use serde::Serialize;
use serde_json::{to_string, to_string_pretty};
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tracing::{debug, warn};

/// Args for the resumable-transfer CLI.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
pub struct Command {
    /// The amount of time to transfer for. Once this timeout is reached the transfer stops and
    /// its progress is kept in the checkpoint file, if checkpointing is enabled.
    #[arg(global = true, short, long, env)]
    pub timeout: Option<Duration>,
    /// The subcommands for resumable-transfer.
    #[command(subcommand)]
    pub commands: Subcommands,
    /// Options that control how parts are transferred.
    #[command(flatten)]
    pub transfer: TransferArgs,
    /// Options related to outputting data from the CLI.
    #[command(flatten)]
    pub output: Output,
}

impl Command {
    /// Parse args and set default values.
    pub fn parse_args() -> Result<Self> {
        let args = Self::parse();
        Self::validate(&args)?;
        Ok(args)
    }

    /// Parse the command from an iterator.
    pub fn parse_from_iter<I, T>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let args = Self::parse_from(iter);
        Self::validate(&args)?;
        Ok(args)
    }

    /// Validate commands.
    pub fn validate(args: &Self) -> Result<()> {
        match &args.commands {
            Subcommands::Upload(upload) => {
                parse_s3(&upload.destination)?;
            }
            Subcommands::Download(download) => {
                parse_s3(&download.source)?;
            }
            Subcommands::Copy(copy) => {
                parse_s3(&copy.source)?;
                parse_s3(&copy.destination)?;
            }
        }

        Ok(())
    }

    /// Execute the command from the args.
    pub async fn execute(self) -> Result<()> {
        let store = Arc::new(S3Builder::default().with_default_client().await?.build()?);

        let pretty_json = self.output.pretty_json;
        let stats = self.run(store).await?;
        Self::print_stats(Some(&stats), pretty_json)?;

        Ok(())
    }

    /// Run the transfer against an object store. Ctrl-C and the timeout stop the transfer,
    /// keeping its progress.
    pub async fn run(self, store: Arc<dyn ObjectStore>) -> Result<TransferStats> {
        let now = Instant::now();

        let cancel_hook = CancelHook::new();
        spawn_interrupt(cancel_hook.clone());
        if let Some(timeout) = self.timeout {
            spawn_timeout(cancel_hook.clone(), timeout);
        }

        let progress = if self.transfer.progress {
            Some(ProgressBarListener::new()?)
        } else {
            None
        };
        let options = self.transfer.options(cancel_hook, progress.clone());

        let result = match self.commands {
            Subcommands::Upload(upload) => upload.upload(store, options).await,
            Subcommands::Download(download) => download.download(store, options).await,
            Subcommands::Copy(copy) => copy.copy(store, options).await,
        };

        if let Some(progress) = progress {
            progress.finish();
        }

        Ok(TransferStats::new(now.elapsed(), result?))
    }

    /// Print output statistics
    pub fn print_stats<T>(stats: Option<&T>, pretty_json: bool) -> Result<()>
    where
        T: Serialize,
    {
        let Some(stats) = stats else { return Ok(()) };

        if pretty_json {
            println!("{}", to_string_pretty(stats)?);
        } else {
            println!("{}", to_string(stats)?);
        }

        Ok(())
    }
}

fn parse_s3(url: &str) -> Result<(String, String)> {
    Provider::parse_s3_url(url)?.into_s3()
}

fn spawn_interrupt(cancel_hook: CancelHook) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping transfer");
            cancel_hook.cancel(false);
        }
    });
}

fn spawn_timeout(cancel_hook: CancelHook, timeout: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(timeout.into()).await;
        if cancel_hook.cancel(false) {
            warn!(%timeout, "timeout reached, stopping transfer");
        }
    });
}

/// The upload subcommand components.
#[derive(Debug, Args)]
pub struct UploadArgs {
    /// The file to upload.
    #[arg(required = true)]
    pub source: String,
    /// The destination object, e.g. `s3://bucket/key`.
    #[arg(required = true)]
    pub destination: String,
    /// The content type of the uploaded object.
    #[arg(long, env)]
    pub content_type: Option<String>,
}

impl UploadArgs {
    /// Perform the upload sub command from the args.
    pub async fn upload(
        self,
        store: Arc<dyn ObjectStore>,
        options: TransferOptions,
    ) -> Result<TransferResult> {
        let (bucket, key) = parse_s3(&self.destination)?;
        let file = Provider::parse_file_url(&self.source).into_file()?;

        let output = UploadBuilder::default()
            .with_store(store)
            .with_file(file)
            .with_bucket(bucket)
            .with_key(key)
            .with_content_type(self.content_type)
            .with_options(options)
            .build()?
            .run()
            .await?;

        Ok(TransferResult::Upload(output))
    }
}

/// The download subcommand components.
#[derive(Debug, Args)]
pub struct DownloadArgs {
    /// The object to download, e.g. `s3://bucket/key`.
    #[arg(required = true)]
    pub source: String,
    /// The file to download to. If this is a directory, the object is downloaded into it using
    /// the last segment of the key as the file name.
    #[arg(required = true)]
    pub destination: String,
    /// Download a specific version of the object.
    #[arg(long, env)]
    pub version_id: Option<String>,
}

impl DownloadArgs {
    /// Perform the download sub command from the args.
    pub async fn download(
        self,
        store: Arc<dyn ObjectStore>,
        options: TransferOptions,
    ) -> Result<TransferResult> {
        let (bucket, key) = parse_s3(&self.source)?;
        let file = Provider::parse_file_url(&self.destination).into_file()?;

        let output = DownloadBuilder::default()
            .with_store(store)
            .with_bucket(bucket)
            .with_key(key)
            .with_version_id(self.version_id)
            .with_file(file)
            .with_options(options)
            .build()?
            .run()
            .await?;

        Ok(TransferResult::Download(output))
    }
}

/// The copy subcommand components.
#[derive(Debug, Args)]
pub struct CopyArgs {
    /// The object to copy from, e.g. `s3://bucket/key`.
    #[arg(required = true)]
    pub source: String,
    /// The object to copy to.
    #[arg(required = true)]
    pub destination: String,
    /// Copy a specific version of the source object.
    #[arg(long, env)]
    pub version_id: Option<String>,
}

impl CopyArgs {
    /// Perform the copy sub command from the args.
    pub async fn copy(
        self,
        store: Arc<dyn ObjectStore>,
        options: TransferOptions,
    ) -> Result<TransferResult> {
        let (source_bucket, source_key) = parse_s3(&self.source)?;
        let (bucket, key) = parse_s3(&self.destination)?;

        let output = CopyBuilder::default()
            .with_store(store)
            .with_source_bucket(source_bucket)
            .with_source_key(source_key)
            .with_source_version_id(self.version_id)
            .with_bucket(bucket)
            .with_key(key)
            .with_options(options)
            .build()?
            .run()
            .await?;

        Ok(TransferResult::Copy(output))
    }
}

/// The subcommands for resumable-transfer.
#[derive(Subcommand, Debug)]
pub enum Subcommands {
    /// Upload a local file to an object using a multipart upload.
    Upload(#[arg(flatten)] UploadArgs),
    /// Download an object to a local file using ranged reads.
    Download(#[arg(flatten)] DownloadArgs),
    /// Copy an object to another object using server-side part copies.
    Copy(#[arg(flatten)] CopyArgs),
}

/// Options that control how parts are transferred.
#[derive(Args, Debug, Clone)]
#[group(required = false)]
pub struct TransferArgs {
    /// The size of each part. This can be specified with a size unit, e.g. 8mib. The part size
    /// is clamped between 5 MiB and 5 GiB.
    #[arg(global = true, long, env, default_value_t = DEFAULT_PART_SIZE, value_parser = |s: &str| parse_size(s))]
    pub part_size: u64,
    /// The number of parts to transfer at the same time, between 1 and 1000.
    #[arg(global = true, long, env, default_value_t = 10)]
    pub task_num: usize,
    /// Record progress in a checkpoint file so that an interrupted or failed transfer can be
    /// resumed by running the same command again.
    #[arg(global = true, long, env)]
    pub checkpoint: bool,
    /// The checkpoint file to use. By default, the checkpoint is written next to the local file,
    /// or into the temporary directory for copies.
    #[arg(global = true, long, env)]
    pub checkpoint_file: Option<PathBuf>,
    /// How to verify the CRC64 of the transferred object.
    #[arg(global = true, long, env, default_value = "if-available")]
    pub verify: VerifyMode,
    /// Limit the transfer rate in bytes per second. This can be specified with a size unit,
    /// e.g. 10mib.
    #[arg(global = true, long, env, value_parser = |s: &str| parse_size(s))]
    pub rate_limit: Option<u64>,
    /// Show a progress bar on stderr.
    #[arg(global = true, long, env)]
    pub progress: bool,
}

impl TransferArgs {
    /// Convert the args into transfer options.
    pub fn options(
        &self,
        cancel_hook: CancelHook,
        progress: Option<ProgressBarListener>,
    ) -> TransferOptions {
        let mut options = TransferOptions::default()
            .with_part_size(self.part_size)
            .with_task_num(self.task_num)
            .with_checkpoint(self.checkpoint)
            .with_checkpoint_file(self.checkpoint_file.clone())
            .with_verify(self.verify)
            .with_listener(Arc::new(LogListener))
            .with_cancel_hook(cancel_hook);

        if let Some(rate_limit) = self.rate_limit {
            options = options.with_rate_limiter(Arc::new(BandwidthLimiter::new(rate_limit)));
        }
        if let Some(progress) = progress {
            options = options.with_progress(Arc::new(progress));
        }

        options
    }
}

/// Options related to outputting information from the CLI.
#[derive(Args, Debug)]
#[group(required = false)]
pub struct Output {
    /// Print the output statistics using indented and multi-line json rather than on a single line.
    #[arg(global = true, long, env)]
    pub pretty_json: bool,
}

/// Logs transfer events.
#[derive(Debug)]
pub struct LogListener;

impl EventListener for LogListener {
    fn on_event(&self, event: &TransferEvent) {
        match &event.error {
            Some(err) => warn!(
                event = ?event.event_type,
                key = %event.key,
                part_number = ?event.part_number,
                err = %err,
                "transfer event"
            ),
            None => debug!(
                event = ?event.event_type,
                key = %event.key,
                part_number = ?event.part_number,
                "transfer event"
            ),
        }
    }
}

/// Shows transfer progress as a progress bar.
#[derive(Clone)]
pub struct ProgressBarListener {
    bar: ProgressBar,
}

impl ProgressBarListener {
    /// Create a progress bar which is sized by the first update.
    pub fn new() -> Result<Self> {
        let style = ProgressStyle::with_template(
            "[{elapsed_precise}] {wide_bar} {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        )
        .map_err(|err| ParseError(err.to_string()))?;

        let bar = ProgressBar::new(0);
        bar.set_style(style);
        Ok(Self { bar })
    }

    /// Remove the progress bar.
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl DataTransferListener for ProgressBarListener {
    fn on_progress(&self, status: DataTransferStatus) {
        self.bar.set_length(status.total_bytes);
        self.bar.set_position(status.consumed_bytes);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::part::MIN_PART_SIZE;
    use crate::test::{MemoryStore, TestFileBuilder};
    use tempfile::tempdir;

    #[test]
    fn parse_transfer_args() -> anyhow::Result<()> {
        let args = Command::parse_from_iter([
            "resumable-transfer",
            "download",
            "s3://bucket/key",
            "file",
            "--part-size",
            "8mib",
            "--task-num",
            "4",
            "--checkpoint",
            "--verify",
            "required",
        ])?;

        assert_eq!(args.transfer.part_size, 8 * 1024 * 1024);
        assert_eq!(args.transfer.task_num, 4);
        assert!(args.transfer.checkpoint);
        assert_eq!(args.transfer.verify, VerifyMode::Required);
        assert!(matches!(args.commands, Subcommands::Download(_)));

        Ok(())
    }

    #[test]
    fn urls_are_validated() {
        assert!(Command::parse_from_iter(["resumable-transfer", "upload", "file", "bucket/key"])
            .is_err());
        assert!(Command::parse_from_iter([
            "resumable-transfer",
            "copy",
            "s3://bucket/key",
            "file"
        ])
        .is_err());
    }

    #[tokio::test]
    async fn run_upload_and_download() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let builder = TestFileBuilder::default().with_directory(dir.path());
        let contents = builder.contents()?;
        let file = builder.generate().await?.to_string_lossy().to_string();
        let downloaded = dir.path().join("downloaded");
        let destination = downloaded.to_string_lossy().to_string();
        let store = Arc::new(MemoryStore::default());
        let part_size = MIN_PART_SIZE.to_string();

        let stats = Command::parse_from_iter([
            "resumable-transfer",
            "upload",
            file.as_str(),
            "s3://bucket/key",
            "--part-size",
            part_size.as_str(),
        ])?
        .run(store.clone())
        .await?;
        assert!(matches!(
            stats.result(),
            TransferResult::Upload(output) if output.parts_total == 3 && output.verified
        ));

        let stats = Command::parse_from_iter([
            "resumable-transfer",
            "download",
            "s3://bucket/key",
            destination.as_str(),
            "--part-size",
            part_size.as_str(),
        ])?
        .run(store)
        .await?;
        assert!(matches!(stats.result(), TransferResult::Download(_)));
        assert_eq!(tokio::fs::read(&downloaded).await?, contents);

        Ok(())
    }
}
