//! Tinybird Execution Engine
//!
//! Tinybird exposes ClickHouse over HTTP: `POST {host}/v0/sql` with a bearer
//! token and a JSON body `{"q": "<query>"}`.

use crate::config::TinybirdConfig;
use crate::error::ExecutionError;
use crate::execution::engine::QueryEngine;
use crate::execution::result::ExecutionResult;
use crate::normalizer::NormalizedQuery;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info};

pub struct TinybirdEngine {
    host: String,
    token: String,
    client: Client,
}

impl TinybirdEngine {
    /// # Arguments
    /// * `host` - API host (e.g., "https://api.tinybird.co")
    /// * `token` - token with read access to the data source
    /// * `timeout` - per-request timeout
    pub fn new(host: String, token: String, timeout: Duration) -> Result<Self, ExecutionError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| {
                ExecutionError::BackendUnavailable(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            host: host.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    pub fn from_config(config: &TinybirdConfig) -> Result<Self, ExecutionError> {
        Self::new(config.host.clone(), config.token.clone(), config.timeout)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    async fn submit(&self, sql: &str) -> Result<(u16, Value), ExecutionError> {
        let url = format!("{}/v0/sql", self.host);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Content-Type", "application/json")
            .json(&json!({ "q": sql }))
            .send()
            .await
            .map_err(|e| {
                ExecutionError::BackendUnavailable(format!("Failed to submit Tinybird query: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            // Body is passed through verbatim; it carries ClickHouse's own message
            let detail = response.text().await.unwrap_or_default();
            return Err(ExecutionError::BackendRejected {
                status: status.as_u16(),
                detail,
            });
        }

        let body: Value = response.json().await.map_err(|e| {
            ExecutionError::MalformedResponse(format!("Failed to parse Tinybird response: {}", e))
        })?;
        Ok((status.as_u16(), body))
    }
}

#[async_trait]
impl QueryEngine for TinybirdEngine {
    fn name(&self) -> &'static str {
        "tinybird"
    }

    async fn execute(&self, query: &NormalizedQuery) -> Result<ExecutionResult, ExecutionError> {
        let start_time = std::time::Instant::now();
        info!("Executing query with Tinybird: {}", query);

        let (status, body) = self.submit(query.as_str()).await?;
        let result = ExecutionResult::from_response(status, &body)?;

        info!(
            "Tinybird returned {} rows in {}ms",
            result.row_count,
            start_time.elapsed().as_millis()
        );
        Ok(result)
    }

    async fn health_check(&self) -> bool {
        match self.submit("SELECT 1 FORMAT JSON").await {
            Ok(_) => true,
            Err(e) => {
                error!("Tinybird health check failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::SafetyNormalizer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP server answering with `status` and `body`; returns the
    /// address and a handle yielding the raw request it received.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buffer = [0u8; 4096];
            loop {
                let n = stream.read(&mut buffer).await.unwrap();
                request.extend_from_slice(&buffer[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    fn query(sql: &str) -> NormalizedQuery {
        SafetyNormalizer::default().normalize(sql).unwrap()
    }

    #[tokio::test]
    async fn test_posts_query_with_bearer_token() {
        let (host, request) = serve_once(
            "200 OK",
            r#"{"meta":[{"name":"c","type":"UInt64"}],"data":[{"c":1470}],"rows":1}"#,
        )
        .await;
        let engine = TinybirdEngine::new(host, "p.token".to_string(), Duration::from_secs(5)).unwrap();

        let result = engine
            .execute(&query("SELECT count(*) AS c FROM IBM_HR_Employee_Attrition"))
            .await
            .unwrap();
        assert_eq!(result.row_count, 1);
        assert_eq!(result.rows[0]["c"], 1470);

        let raw = request.await.unwrap();
        assert!(raw.starts_with("POST /v0/sql"));
        assert!(raw.to_ascii_lowercase().contains("authorization: bearer p.token"));
        assert!(raw.contains(r#"{"q":"SELECT count(*) AS c FROM IBM_HR_Employee_Attrition FORMAT JSON"}"#));
    }

    #[tokio::test]
    async fn test_server_error_keeps_status_and_body() {
        let (host, _request) = serve_once(
            "500 Internal Server Error",
            r#"{"error":"[Error] Missing columns: 'salary'"}"#,
        )
        .await;
        let engine = TinybirdEngine::new(host, "t".to_string(), Duration::from_secs(5)).unwrap();

        let err = engine.execute(&query("SELECT salary FROM t")).await.unwrap_err();
        assert_eq!(
            err,
            ExecutionError::BackendRejected {
                status: 500,
                detail: r#"{"error":"[Error] Missing columns: 'salary'"}"#.to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_success_without_rows_is_malformed() {
        let (host, _request) = serve_once("200 OK", r#"{"data": []}"#).await;
        let engine = TinybirdEngine::new(host, "t".to_string(), Duration::from_secs(5)).unwrap();

        let err = engine.execute(&query("SELECT 1")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_unavailable() {
        let engine = TinybirdEngine::new(
            "http://127.0.0.1:9".to_string(),
            "t".to_string(),
            Duration::from_secs(2),
        )
        .unwrap();
        let err = engine.execute(&query("SELECT 1")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::BackendUnavailable(_)));
        assert!(!engine.health_check().await);
    }
}
