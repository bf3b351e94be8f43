//! Integration tests that run transfers against AWS S3 directly. These require AWS credentials
//! and a test bucket.
//!

use anyhow::Result;
use dotenvy::dotenv;
use envy::prefixed;
use resumable_transfer::io::aws::S3Builder;
use resumable_transfer::io::{ObjectStore, Provider};
use resumable_transfer::part::MIN_PART_SIZE;
use resumable_transfer::test::TestFileBuilder;
use resumable_transfer::transfer::copy::CopyBuilder;
use resumable_transfer::transfer::download::DownloadBuilder;
use resumable_transfer::transfer::upload::UploadBuilder;
use resumable_transfer::transfer::{TransferOptions, VerifyMode};
use serde::Deserialize;
use std::sync::Arc;
use tempfile::tempdir;

/// Configuration for integration tests.
#[derive(Debug, Deserialize)]
struct TestConfig {
    bucket_uri: String,
}

impl TestConfig {
    fn load() -> Result<Self> {
        dotenv().ok();

        let mut env: Self = prefixed("RESUMABLE_TRANSFER_TEST_").from_env()?;

        env.bucket_uri = env
            .bucket_uri
            .strip_suffix("/")
            .unwrap_or(&env.bucket_uri)
            .to_string();

        Ok(env)
    }

    fn location(&self, path: &str) -> Result<(String, String)> {
        Ok(Provider::parse_s3_url(&format!("{}/{}", self.bucket_uri, path))?.into_s3()?)
    }
}

#[ignore]
#[tokio::test]
async fn s3_round_trip() -> Result<()> {
    let config = TestConfig::load()?;
    let dir = tempdir()?;
    let builder = TestFileBuilder::default().with_directory(dir.path());
    let contents = builder.contents()?;
    let file = builder.generate().await?;

    let store: Arc<dyn ObjectStore> =
        Arc::new(S3Builder::default().with_default_client().await?.build()?);
    let options = TransferOptions::default()
        .with_part_size(MIN_PART_SIZE)
        .with_task_num(3)
        .with_checkpoint(true)
        .with_verify(VerifyMode::Required);

    let (bucket, key) = config.location("resumable-transfer/upload")?;
    let upload = UploadBuilder::default()
        .with_store(store.clone())
        .with_file(&file)
        .with_bucket(&bucket)
        .with_key(&key)
        .with_options(options.clone())
        .build()?
        .run()
        .await?;
    assert!(upload.verified);

    let (copy_bucket, copy_key) = config.location("resumable-transfer/copy")?;
    let copy = CopyBuilder::default()
        .with_store(store.clone())
        .with_source_bucket(&bucket)
        .with_source_key(&key)
        .with_bucket(copy_bucket.as_str())
        .with_key(copy_key.as_str())
        .with_options(options.clone())
        .build()?
        .run()
        .await?;
    assert!(copy.verified);
    assert_eq!(copy.crc64, upload.crc64);

    let downloaded = dir.path().join("downloaded");
    let download = DownloadBuilder::default()
        .with_store(store)
        .with_bucket(copy_bucket)
        .with_key(copy_key)
        .with_file(&downloaded)
        .with_options(options)
        .build()?
        .run()
        .await?;
    assert!(download.verified);
    assert_eq!(tokio::fs::read(&downloaded).await?, contents);

    Ok(())
}
