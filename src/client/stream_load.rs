//! HTTP stream load client.
//!
//! One batch is one `PUT {load_url}/api/{database}/{table}/_stream_load`
//! request authenticated with HTTP basic auth. Front-end nodes answer with a
//! redirect to a back-end node; the redirect is followed by hand so the
//! credentials travel with it.

use crate::client::{RowSerializer, SinkLoader};
use crate::models::{Batch, LoadAck, LoadError, SinkConfig};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, LOCATION};
use reqwest::{StatusCode, redirect};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Stream load response body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StreamLoadResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    number_loaded_rows: Option<u64>,
    #[serde(default)]
    existing_job_status: Option<String>,
    #[serde(default, rename = "ErrorURL")]
    error_url: Option<String>,
}

/// Stream load client for StarRocks-compatible stores.
pub struct StreamLoadClient {
    client: reqwest::Client,
    /// Full stream load URL
    url: String,
    username: String,
    password: String,
    serializer: Arc<dyn RowSerializer>,
    timeout: Duration,
    // Load tracking
    total_requests: AtomicU64,
    total_rows: AtomicU64,
    total_bytes: AtomicU64,
}

impl StreamLoadClient {
    /// Create a new stream load client.
    pub fn new(
        config: &SinkConfig,
        password: String,
        serializer: Arc<dyn RowSerializer>,
    ) -> Result<Self, LoadError> {
        let timeout = config.timeout();

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(LoadError::Network)?;

        let url = format!(
            "{}/api/{}/{}/_stream_load",
            normalize_base_url(&config.load_url),
            config.database,
            config.table
        );

        Ok(Self {
            client,
            url,
            username: config.username.clone(),
            password,
            serializer,
            timeout,
            total_requests: AtomicU64::new(0),
            total_rows: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
        })
    }

    /// Get the stream load URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Build headers for a request.
    fn headers(&self, label: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        if let Ok(value) = HeaderValue::from_str(label) {
            headers.insert("label", value);
        }

        for (key, value) in self.serializer.headers() {
            if let (Ok(name), Ok(val)) = (
                HeaderName::try_from(key),
                HeaderValue::from_str(&value),
            ) {
                headers.insert(name, val);
            }
        }

        headers
    }

    async fn put(&self, url: &str, label: &str, body: Vec<u8>) -> Result<reqwest::Response, LoadError> {
        self.client
            .put(url)
            .basic_auth(&self.username, Some(&self.password))
            .headers(self.headers(label))
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LoadError::Timeout(self.timeout)
                } else {
                    LoadError::Network(e)
                }
            })
    }

    /// Total rows acknowledged by the store.
    pub fn total_rows(&self) -> u64 {
        self.total_rows.load(Ordering::Relaxed)
    }

    /// Total requests sent, redirects excluded.
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Total body bytes sent.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Map a parsed response body to an acknowledgment or a load error.
    fn interpret(batch: &Batch, body: StreamLoadResponse) -> Result<LoadAck, LoadError> {
        let message = body.message.clone().unwrap_or_default();
        match body.status.as_str() {
            // Publish Timeout: the transaction is committed, visibility is pending
            "Success" | "Publish Timeout" => Ok(LoadAck {
                sequence_id: batch.sequence_id,
                rows_loaded: body.number_loaded_rows.unwrap_or(batch.len() as u64),
                duplicate: false,
            }),
            "Label Already Exists" => match body.existing_job_status.as_deref() {
                Some("FINISHED") | Some("VISIBLE") | Some("COMMITTED") => Ok(LoadAck {
                    sequence_id: batch.sequence_id,
                    rows_loaded: 0,
                    duplicate: true,
                }),
                // Another attempt with this label is still running
                other => Err(LoadError::Unavailable(format!(
                    "label in use by a {} load",
                    other.unwrap_or("pending")
                ))),
            },
            status => {
                let message = match body.error_url {
                    Some(url) => format!("{message} (see {url})"),
                    None => message,
                };
                Err(LoadError::Rejected {
                    status: status.to_string(),
                    message,
                })
            }
        }
    }
}

#[async_trait]
impl SinkLoader for StreamLoadClient {
    async fn load(&self, label: &str, batch: &Batch) -> Result<LoadAck, LoadError> {
        let start = Instant::now();
        let body = self.serializer.encode(batch)?;
        let body_len = body.len() as u64;

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut response = self.put(&self.url, label, body.clone()).await?;

        // Front-end → back-end redirect, followed once
        if matches!(
            response.status(),
            StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
        ) {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| {
                    LoadError::InvalidResponse("redirect without Location header".to_string())
                })?;
            debug!(label = %label, location = %location, "Following stream load redirect");
            response = self.put(&location, label, body).await?;
        }

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(LoadError::AuthenticationFailed);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LoadError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let body: StreamLoadResponse = response
            .json()
            .await
            .map_err(|e| LoadError::InvalidResponse(format!("Failed to parse response: {e}")))?;

        let ack = Self::interpret(batch, body)?;
        self.total_rows.fetch_add(ack.rows_loaded, Ordering::Relaxed);
        self.total_bytes.fetch_add(body_len, Ordering::Relaxed);

        debug!(
            label = %label,
            sequence_id = batch.sequence_id,
            rows = ack.rows_loaded,
            duplicate = ack.duplicate,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Stream load complete"
        );
        Ok(ack)
    }
}

/// Prefix a scheme when the configured address has none.
fn normalize_base_url(load_url: &str) -> String {
    let trimmed = load_url.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Record, Value};

    fn batch() -> Batch {
        Batch {
            sequence_id: 7,
            first_offset: 10,
            last_offset: 11,
            records: vec![
                Record::new(vec![Value::from("alice"), Value::from(42)]),
                Record::new(vec![Value::from("bob"), Value::from(7)]),
            ],
        }
    }

    fn response(json: &str) -> StreamLoadResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("master1:8030"), "http://master1:8030");
        assert_eq!(normalize_base_url("https://fe:8030/"), "https://fe:8030");
    }

    #[test]
    fn test_interpret_success() {
        let ack = StreamLoadClient::interpret(
            &batch(),
            response(r#"{"Status":"Success","Message":"OK","NumberLoadedRows":2}"#),
        )
        .unwrap();
        assert_eq!(ack.sequence_id, 7);
        assert_eq!(ack.rows_loaded, 2);
        assert!(!ack.duplicate);
    }

    #[test]
    fn test_interpret_label_exists() {
        let ack = StreamLoadClient::interpret(
            &batch(),
            response(r#"{"Status":"Label Already Exists","ExistingJobStatus":"FINISHED"}"#),
        )
        .unwrap();
        assert!(ack.duplicate);

        let err = StreamLoadClient::interpret(
            &batch(),
            response(r#"{"Status":"Label Already Exists","ExistingJobStatus":"RUNNING"}"#),
        )
        .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_interpret_failure() {
        let err = StreamLoadClient::interpret(
            &batch(),
            response(
                r#"{"Status":"Fail","Message":"too many filtered rows","ErrorURL":"http://be/err"}"#,
            ),
        )
        .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("too many filtered rows"));
        assert!(err.to_string().contains("http://be/err"));
    }
}
