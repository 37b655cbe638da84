//! HTTP tests for the stream load client
//!
//! Uses wiremock to stand in for front-end and back-end nodes:
//! - Request shape (method, path, auth, label, format headers, body)
//! - Front-end → back-end redirect
//! - Duplicate label handling
//! - Error classification

use std::sync::Arc;
use streamload::client::{DelimitedSerializer, SinkLoader, StreamLoadClient};
use streamload::models::{Batch, Config, LoadError, Record, Value};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, method, path},
};

const LOAD_PATH: &str = "/api/starrocks_demo/demo2_flink_tb1/_stream_load";

/// Basic auth for user "root" with an empty password
const ROOT_AUTH: &str = "Basic cm9vdDo=";

fn client(load_url: &str) -> StreamLoadClient {
    let config: Config = toml::from_str(&format!(
        r#"
[source]
kind = "generator"

[sink]
load_url = "{load_url}"
database = "starrocks_demo"
table = "demo2_flink_tb1"
"#
    ))
    .unwrap();
    let serializer = Arc::new(DelimitedSerializer::from_config(&config).unwrap());
    StreamLoadClient::new(&config.sink, String::new(), serializer).unwrap()
}

fn demo_batch() -> Batch {
    Batch {
        sequence_id: 0,
        first_offset: 0,
        last_offset: 1,
        records: vec![
            Record::new(vec![Value::from("alice"), Value::from(42i64)]),
            Record::new(vec![Value::from("bob"), Value::from(7i64)]),
        ],
    }
}

fn success_response(rows: u64) -> serde_json::Value {
    serde_json::json!({
        "TxnId": 1001,
        "Label": "streamload-run-0-1",
        "Status": "Success",
        "Message": "OK",
        "NumberTotalRows": rows,
        "NumberLoadedRows": rows,
        "NumberFilteredRows": 0
    })
}

// ============================================================================
// Request shape
// ============================================================================

#[tokio::test]
async fn test_load_sends_batch_with_label_and_format() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(LOAD_PATH))
        .and(header("authorization", ROOT_AUTH))
        .and(header("label", "streamload-run-0-1"))
        .and(header("format", "csv"))
        .and(header("column_separator", "\\x01"))
        .and(header("row_delimiter", "\\x02"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_response(2)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client(&mock_server.uri());
    let ack = client
        .load("streamload-run-0-1", &demo_batch())
        .await
        .unwrap();

    assert_eq!(ack.rows_loaded, 2);
    assert!(!ack.duplicate);
    assert_eq!(client.total_rows(), 2);

    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests[0].body, b"alice\x0142\x02bob\x017".to_vec());
    // The header matcher splits values on commas, so compare the raw value
    assert_eq!(
        requests[0]
            .headers
            .get("columns")
            .and_then(|v| v.to_str().ok()),
        Some("name,score")
    );
}

#[tokio::test]
async fn test_load_follows_redirect_to_backend() {
    let frontend = MockServer::start().await;
    let backend = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(LOAD_PATH))
        .respond_with(
            ResponseTemplate::new(307)
                .insert_header("Location", format!("{}/be{LOAD_PATH}", backend.uri())),
        )
        .expect(1)
        .mount(&frontend)
        .await;

    // Credentials and label must survive the redirect
    Mock::given(method("PUT"))
        .and(path(format!("/be{LOAD_PATH}")))
        .and(header("authorization", ROOT_AUTH))
        .and(header("label", "streamload-run-0-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_response(2)))
        .expect(1)
        .mount(&backend)
        .await;

    let client = client(&frontend.uri());
    let ack = client
        .load("streamload-run-0-1", &demo_batch())
        .await
        .unwrap();
    assert_eq!(ack.rows_loaded, 2);
    assert_eq!(client.total_requests(), 1);

    let requests = backend.received_requests().await.unwrap();
    assert_eq!(requests[0].body, b"alice\x0142\x02bob\x017".to_vec());
}

// ============================================================================
// Response handling
// ============================================================================

#[tokio::test]
async fn test_existing_finished_label_is_duplicate() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(LOAD_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "Status": "Label Already Exists",
            "ExistingJobStatus": "FINISHED",
            "Message": "Label [streamload-run-0-1] has already been used."
        })))
        .mount(&mock_server)
        .await;

    let ack = client(&mock_server.uri())
        .load("streamload-run-0-1", &demo_batch())
        .await
        .unwrap();
    assert!(ack.duplicate);
    assert_eq!(ack.rows_loaded, 0);
}

#[tokio::test]
async fn test_unauthorized_is_not_retryable() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(LOAD_PATH))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    let err = client(&mock_server.uri())
        .load("streamload-run-0-1", &demo_batch())
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::AuthenticationFailed));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_server_error_is_retryable() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(LOAD_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("backend busy"))
        .mount(&mock_server)
        .await;

    let err = client(&mock_server.uri())
        .load("streamload-run-0-1", &demo_batch())
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::Http { status: 503, .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_rejected_batch_is_not_retryable() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(LOAD_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "Status": "Fail",
            "Message": "too many filtered rows"
        })))
        .mount(&mock_server)
        .await;

    let err = client(&mock_server.uri())
        .load("streamload-run-0-1", &demo_batch())
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::Rejected { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_unparseable_body_is_invalid_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(LOAD_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy</html>"))
        .mount(&mock_server)
        .await;

    let err = client(&mock_server.uri())
        .load("streamload-run-0-1", &demo_batch())
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::InvalidResponse(_)));
}
