//! End-to-end transfers through the connection factory against mock HTTP
//! servers. No real credentials or network access are needed.

use mockito::Matcher;
use objstore_bridge::{
    BackendConfig, Config, CredentialField, DataTransfer, Error, Operation, RetryPolicy,
    TransferConfig,
};
use std::collections::HashMap;
use std::time::Duration;

fn no_env() -> HashMap<String, String> {
    HashMap::new()
}

fn s3_config(endpoint: &str) -> Config {
    Config {
        backend: BackendConfig::s3()
            .with_credential(CredentialField::Region, "us-east-1")
            .with_credential(CredentialField::AccessKeyId, "AKIDEXAMPLE")
            .with_credential(CredentialField::SecretAccessKey, "secret")
            .with_credential(CredentialField::Endpoint, endpoint),
        transfer: TransferConfig::default(),
    }
}

const EMPTY_BUCKETS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListAllMyBucketsResult><Buckets></Buckets></ListAllMyBucketsResult>"#;

#[tokio::test]
async fn test_s3_put_creates_bucket_then_uploads() {
    let mut server = mockito::Server::new_async().await;
    let list = server
        .mock("GET", "/")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(EMPTY_BUCKETS)
        .create_async()
        .await;
    let create = server
        .mock("PUT", "/reports")
        .match_query(Matcher::Any)
        .with_status(200)
        .create_async()
        .await;
    let upload = server
        .mock("PUT", "/reports/q1.csv")
        .match_query(Matcher::Any)
        .match_header("authorization", Matcher::Regex("^AWS4-HMAC-SHA256 ".into()))
        .with_status(200)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("q1.csv");
    std::fs::write(&input, "region,total\nnorth,10\n").unwrap();

    let transfer = DataTransfer::from_config(&s3_config(&server.url()), &no_env()).unwrap();
    let put = transfer.put_data(&input, "reports", "q1.csv").await.unwrap();

    list.assert_async().await;
    create.assert_async().await;
    upload.assert_async().await;
    assert!(put.container_created);
    assert_eq!(put.bytes, 22);
}

#[tokio::test]
async fn test_s3_get_all_concatenates_listing() {
    let mut server = mockito::Server::new_async().await;
    let _list = server
        .mock("GET", "/logs")
        .match_query(Matcher::UrlEncoded("list-type".into(), "2".into()))
        .with_status(200)
        .with_body(
            "<ListBucketResult><IsTruncated>false</IsTruncated>\
             <Contents><Key>a.log</Key></Contents>\
             <Contents><Key>b.log</Key></Contents></ListBucketResult>",
        )
        .create_async()
        .await;
    let _a = server
        .mock("GET", "/logs/a.log")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body("first\n")
        .create_async()
        .await;
    let _b = server
        .mock("GET", "/logs/b.log")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body("second\n")
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("all.log");

    let transfer = DataTransfer::from_config(&s3_config(&server.url()), &no_env()).unwrap();
    let outcome = transfer.get_all_data("logs", &out).await.unwrap();

    assert_eq!(outcome.objects, vec!["a.log", "b.log"]);
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "first\nsecond\n");
}

#[tokio::test]
async fn test_s3_missing_key_leaves_destination() {
    let mut server = mockito::Server::new_async().await;
    let _missing = server
        .mock("GET", "/reports/absent.csv")
        .match_query(Matcher::Any)
        .with_status(404)
        .with_body("<Error><Code>NoSuchKey</Code></Error>")
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.csv");
    std::fs::write(&out, "keep").unwrap();

    let transfer = DataTransfer::from_config(&s3_config(&server.url()), &no_env()).unwrap();
    let err = transfer
        .get_data("reports", "absent.csv", &out, false)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ObjectNotFound { .. }));
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "keep");
}

#[tokio::test]
async fn test_s3_server_errors_are_retried() {
    let mut server = mockito::Server::new_async().await;
    let failing = server
        .mock("GET", "/reports/q1.csv")
        .match_query(Matcher::Any)
        .with_status(503)
        .with_body("<Error><Code>SlowDown</Code></Error>")
        .expect(3)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = s3_config(&server.url());
    config.transfer = TransferConfig::default().with_retry(
        RetryPolicy::exponential(2).with_backoff(Duration::from_millis(1), Duration::from_millis(2)),
    );

    let transfer = DataTransfer::from_config(&config, &no_env()).unwrap();
    let err = transfer
        .get_data("reports", "q1.csv", dir.path().join("out.csv"), false)
        .await
        .unwrap_err();

    failing.assert_async().await;
    match err {
        Error::RemoteRead {
            operation, target, ..
        } => {
            assert_eq!(operation, Operation::GetData);
            assert_eq!(target, "reports/q1.csv");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!dir.path().join("out.csv").exists());
}

#[tokio::test]
async fn test_s3_rejected_credentials() {
    let mut server = mockito::Server::new_async().await;
    let _denied = server
        .mock("GET", "/")
        .match_query(Matcher::Any)
        .with_status(403)
        .with_body("<Error><Code>InvalidAccessKeyId</Code></Error>")
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("q1.csv");
    std::fs::write(&input, "a").unwrap();

    let transfer = DataTransfer::from_config(&s3_config(&server.url()), &no_env()).unwrap();
    let err = transfer.put_data(&input, "reports", "q1.csv").await.unwrap_err();
    assert!(matches!(err, Error::Authentication { .. }));
}

#[tokio::test]
async fn test_s3_create_existing_bucket_conflicts() {
    // us-east-1 answers 200 when the caller already owns the bucket
    let mut server = mockito::Server::new_async().await;
    let list = server
        .mock("GET", "/")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            "<ListAllMyBucketsResult><Buckets>\
             <Bucket><Name>reports</Name></Bucket></Buckets></ListAllMyBucketsResult>",
        )
        .create_async()
        .await;
    let create = server
        .mock("PUT", "/reports")
        .match_query(Matcher::Any)
        .with_status(200)
        .expect(0)
        .create_async()
        .await;

    let transfer = DataTransfer::from_config(&s3_config(&server.url()), &no_env()).unwrap();
    let err = transfer.create_container("reports").await.unwrap_err();

    list.assert_async().await;
    create.assert_async().await;
    assert!(matches!(err, Error::ContainerConflict(name) if name == "reports"));
}

#[tokio::test]
async fn test_gcs_emulator_round_trip() {
    let mut server = mockito::Server::new_async().await;
    let _buckets = server
        .mock("GET", "/storage/v1/b")
        .match_query(Matcher::UrlEncoded("project".into(), "test-project".into()))
        .with_status(200)
        .with_body(r#"{"kind":"storage#buckets","items":[{"name":"reports"}]}"#)
        .create_async()
        .await;
    let upload = server
        .mock("PUT", "/reports/q1.csv")
        .match_query(Matcher::Any)
        .match_body("a,b\n")
        .with_status(200)
        .with_header("etag", "\"c0ffee\"")
        .create_async()
        .await;
    let _download = server
        .mock("GET", "/reports/q1.csv")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-length", "4")
        .with_header("last-modified", "Mon, 01 Jan 2024 00:00:00 GMT")
        .with_header("etag", "\"c0ffee\"")
        .with_body("a,b\n")
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("q1.csv");
    let output = dir.path().join("copy.csv");
    std::fs::write(&input, "a,b\n").unwrap();

    let env: HashMap<String, String> = [
        ("STORAGE_EMULATOR_HOST", server.url()),
        ("GOOGLE_CLOUD_PROJECT", "test-project".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    let config = Config {
        backend: BackendConfig::gcs(),
        transfer: TransferConfig::default(),
    };

    let transfer = DataTransfer::from_config(&config, &env).unwrap();
    let put = transfer.put_data(&input, "reports", "q1.csv").await.unwrap();
    assert!(!put.container_created);
    upload.assert_async().await;

    transfer.get_data("reports", "q1.csv", &output, false).await.unwrap();
    assert_eq!(std::fs::read(&output).unwrap(), b"a,b\n");
}
