use anyhow::Result;
use objstore_bridge::{
    BackendConfig, BackendKind, DataTransfer, ProcessEnv, StorageBackend, StorageClient,
};
use tracing_subscriber::EnvFilter;

/// Runs the same transfer against any backend through the StorageBackend trait
async fn exercise<B: StorageBackend>(transfer: &DataTransfer<B>, container: &str) -> Result<()> {
    let name = transfer.backend().kind();
    println!("\n==> Testing {} backend", name);

    let dir = tempfile::tempdir()?;
    let input = dir.path().join("hello.txt");
    std::fs::write(&input, format!("Hello from {}!\n", name))?;

    let key = format!("demos/unified-{}.txt", name);
    let put = transfer.put_data(&input, container, &key).await?;
    println!("  ✓ Put object ({} bytes)", put.bytes);

    let containers = transfer.backend().list_containers().await?;
    println!("  ✓ {} container(s) visible", containers.len());

    let output = dir.path().join("hello-copy.txt");
    transfer.get_data(container, &key, &output, false).await?;
    assert_eq!(std::fs::read(&output)?, std::fs::read(&input)?);
    println!("  ✓ Got object back unchanged");

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("==> Unified Client Example");
    println!("Set OBJSTORE_BACKENDS=s3,azure,gcs,dataverse to include cloud backends");

    let container =
        std::env::var("OBJSTORE_DEMO_CONTAINER").unwrap_or_else(|_| "objstore-bridge-demo".to_string());

    let mut kinds = vec![BackendKind::Memory];
    if let Ok(list) = std::env::var("OBJSTORE_BACKENDS") {
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            kinds.push(serde_json::from_value(serde_json::Value::String(name.to_string()))?);
        }
    }

    for kind in kinds {
        let client = match StorageClient::connect(&BackendConfig::new(kind), &ProcessEnv) {
            Ok(client) => client,
            Err(e) => {
                println!("\n==> Skipping {}: {}", kind, e);
                continue;
            }
        };
        if let Err(e) = exercise(&DataTransfer::new(client), &container).await {
            println!("  ✗ {} failed: {}", kind, e);
        }
    }

    Ok(())
}
