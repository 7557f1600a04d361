use anyhow::{Context, Result};
use objstore_bridge::{BackendConfig, Config, DataTransfer, ProcessEnv, RetryPolicy, TransferConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Usage: s3_transfer <local-file> <bucket> <key>
///
/// Credentials come from AWS_REGION, AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY
/// and, for S3-compatible services, AWS_ENDPOINT_URL.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let (local, bucket, key) = match (args.next(), args.next(), args.next()) {
        (Some(local), Some(bucket), Some(key)) => (PathBuf::from(local), bucket, key),
        _ => anyhow::bail!("usage: s3_transfer <local-file> <bucket> <key>"),
    };

    let config = Config {
        backend: BackendConfig::s3(),
        transfer: TransferConfig::default().with_retry(RetryPolicy::exponential(3)),
    };
    let transfer =
        DataTransfer::from_config(&config, &ProcessEnv).context("connecting to S3")?;

    println!("==> Uploading {} to s3://{}/{}", local.display(), bucket, key);
    let put = transfer
        .put_data(&local, &bucket, &key)
        .await
        .context("upload failed")?;
    println!("  ✓ {} bytes (bucket created: {})", put.bytes, put.container_created);

    let copy = local.with_extension("downloaded");
    transfer
        .get_data(&bucket, &key, &copy, false)
        .await
        .context("download failed")?;
    println!("  ✓ Downloaded back to {}", copy.display());

    let merged = local.with_extension("bucket");
    let outcome = transfer
        .get_all_data(&bucket, &merged)
        .await
        .context("bucket download failed")?;
    println!(
        "  ✓ {} object(s), {} bytes concatenated into {}",
        outcome.objects.len(),
        outcome.bytes,
        merged.display()
    );

    Ok(())
}
