use resumable_transfer::cli::Command;
use resumable_transfer::error::Result;
use std::io::stderr;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(stderr)
        .init();

    let args = Command::parse_args()?;

    args.execute().await?;

    Ok(())
}
