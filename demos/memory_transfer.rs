use anyhow::Result;
use objstore_bridge::{
    BackendCall, DataTransfer, Error, FaultKind, GetAllMode, MemoryBackend, RetryPolicy,
    TransferConfig,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing; RUST_LOG=objstore_bridge=debug shows every call
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("==> In-memory transfer example");

    let dir = tempfile::tempdir()?;
    let backend = MemoryBackend::new().with_chunk_size(8);
    let transfer = DataTransfer::with_config(
        backend.clone(),
        TransferConfig::default()
            .with_retry(RetryPolicy::exponential(3).with_backoff(
                Duration::from_millis(50),
                Duration::from_millis(500),
            ))
            .with_get_all_mode(GetAllMode::Atomic),
    );

    // Upload three quarterly reports; the container appears on first use
    for quarter in 1..=3 {
        let path = dir.path().join(format!("q{}.csv", quarter));
        std::fs::write(&path, format!("q{},{}\n", quarter, quarter * 100))?;

        let put = transfer
            .put_data(&path, "reports", &format!("q{}.csv", quarter))
            .await?;
        println!(
            "  ✓ Uploaded {} ({} bytes, container created: {})",
            put.key, put.bytes, put.container_created
        );
    }

    // A transient failure on the next download is absorbed by the retry policy
    backend.inject_fault(BackendCall::Download, FaultKind::Transient);
    let single = dir.path().join("q2-copy.csv");
    let get = transfer.get_data("reports", "q2.csv", &single, false).await?;
    println!("  ✓ Downloaded {} ({} bytes)", get.key, get.bytes);

    let all = dir.path().join("all.csv");
    let outcome = transfer.get_all_data("reports", &all).await?;
    println!(
        "  ✓ Concatenated {:?} into {} ({} bytes)",
        outcome.objects,
        all.display(),
        outcome.bytes
    );
    print!("{}", std::fs::read_to_string(&all)?);

    // Missing objects never touch the destination
    match transfer.get_data("reports", "q4.csv", &single, false).await {
        Err(Error::ObjectNotFound { container, key }) => {
            println!("  ✓ {}/{} does not exist, {} kept", container, key, single.display())
        }
        other => println!("  ✗ Unexpected result: {:?}", other),
    }

    println!("\n==> Done");
    Ok(())
}
