//! HTTP server for the query UI
//! Simple HTTP server using tokio and basic HTTP handling

use grammarsql::config::AppConfig;
use grammarsql::error::PipelineError;
use grammarsql::evals;
use grammarsql::logging::init_logging;
use grammarsql::pipeline::Pipeline;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

const MAX_REQUEST_BYTES: usize = 1024 * 1024;
const INDEX_PATH: &str = "ui/index.html";

struct AppState {
    pipeline: Pipeline,
    index_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    let config = AppConfig::from_env()?;
    init_logging(&config.log_level)?;

    info!("Starting grammarsql API server...");

    // Grammar, schema and both backends must be usable before we accept traffic
    let pipeline = Pipeline::from_config(&config)?;
    let state = Arc::new(AppState {
        pipeline,
        index_path: PathBuf::from(INDEX_PATH),
    });

    let listener = TcpListener::bind(&config.server_addr).await?;
    info!("Server listening on http://{}", config.server_addr);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("New connection from: {}", addr);
        tokio::spawn(handle_connection(stream, state.clone()));
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<AppState>) {
    match read_request(&mut stream).await {
        Ok(request) => {
            let response = handle_request(&request, &state).await;

            if let Err(e) = stream.write_all(response.as_bytes()).await {
                error!("Failed to write response: {}", e);
            }
        }
        Err(e) => {
            error!("Failed to read from stream: {}", e);
        }
    }
}

/// Read headers, then as much body as `Content-Length` announces.
async fn read_request(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut request = Vec::new();
    let mut buffer = [0; 4096];

    loop {
        let size = stream.read(&mut buffer).await?;
        if size == 0 {
            break;
        }
        request.extend_from_slice(&buffer[..size]);

        let text = String::from_utf8_lossy(&request);
        if let Some(header_end) = text.find("\r\n\r\n") {
            let expected = header_end + 4 + content_length(&text[..header_end]);
            if request.len() >= expected {
                break;
            }
        }
        if request.len() > MAX_REQUEST_BYTES {
            break;
        }
    }

    Ok(String::from_utf8_lossy(&request).to_string())
}

fn content_length(headers: &str) -> usize {
    headers
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Method and normalized path of the request line.
fn parse_request_line(request: &str) -> Option<(&str, String)> {
    let request_line = request.lines().next()?;
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return None;
    }

    let mut path = parts[1];
    // Remove query parameters if present
    if let Some(query_start) = path.find('?') {
        path = &path[..query_start];
    }
    // Normalize path (remove trailing slash except for root)
    let path = path.trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };
    Some((parts[0], path.to_string()))
}

fn parse_headers(request: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for line in request.lines().skip(1) {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }
    headers
}

fn request_body(request: &str) -> &str {
    match request.find("\r\n\r\n") {
        Some(body_start) => request[body_start + 4..].trim(),
        None => "",
    }
}

async fn handle_request(request: &str, state: &AppState) -> String {
    let Some((method, path)) = parse_request_line(request) else {
        return create_response(400, "Bad Request", "application/json", "{}");
    };
    let headers = parse_headers(request);
    info!(
        "Request: {} {} ({})",
        method,
        path,
        headers.get("user-agent").map(String::as_str).unwrap_or("-")
    );

    match (method, path.as_str()) {
        ("GET", "/") => match tokio::fs::read_to_string(&state.index_path).await {
            Ok(html) => create_response(200, "OK", "text/html; charset=utf-8", &html),
            Err(e) => {
                warn!("Failed to read {}: {}", state.index_path.display(), e);
                json_response(404, "Not Found", &serde_json::json!({"error": "UI not found"}))
            }
        },
        ("GET", "/health") => {
            let backend_ok = state.pipeline.engine().health_check().await;
            json_response(
                200,
                "OK",
                &serde_json::json!({
                    "status": if backend_ok { "ok" } else { "degraded" },
                    "service": "grammarsql",
                    "analytical_backend": state.pipeline.engine().name(),
                    "analytical_backend_reachable": backend_ok,
                }),
            )
        }
        ("POST", "/query") => {
            let query = serde_json::from_str::<serde_json::Value>(request_body(request))
                .ok()
                .and_then(|json| json.get("query").and_then(|v| v.as_str()).map(str::to_string))
                .unwrap_or_default();

            if query.trim().is_empty() {
                return json_response(
                    400,
                    "Bad Request",
                    &serde_json::json!({"error": "Query is required"}),
                );
            }

            match state.pipeline.generate_and_run(&query).await {
                Ok(outcome) => json_response(
                    200,
                    "OK",
                    &serde_json::json!({
                        "natural_language_query": outcome.question,
                        "generated_sql": outcome.generated_query,
                        "mode": outcome.mode,
                        "results": outcome.result,
                    }),
                ),
                Err(failure) => {
                    let (status, status_text) = failure_status(&failure.error);
                    json_response(
                        status,
                        status_text,
                        &serde_json::json!({
                            "error": failure.error.to_string(),
                            "error_kind": failure.kind(),
                            "state": failure.state,
                            "generated_sql": failure.generated_query,
                            "natural_language_query": failure.question,
                        }),
                    )
                }
            }
        }
        ("GET", "/run-evals") => {
            let report = evals::run_evals(&state.pipeline, None).await;
            let status = if report.all_passed() { "success" } else { "partial" };
            json_response(
                200,
                "OK",
                &serde_json::json!({
                    "status": status,
                    "message": format!("{}/{} evals passed", report.passed, report.total),
                    "report": report,
                }),
            )
        }
        ("POST", "/grammar/reload") => match state.pipeline.reload_grammar() {
            Ok(grammar) => json_response(
                200,
                "OK",
                &serde_json::json!({
                    "status": "reloaded",
                    "root": grammar.root_name(),
                    "rules": grammar.rule_count(),
                }),
            ),
            Err(e) => {
                error!("Grammar reload failed: {}", e);
                json_response(
                    500,
                    "Internal Server Error",
                    &serde_json::json!({"error": e.to_string(), "status": "kept_previous"}),
                )
            }
        },
        ("GET", "/requests") => {
            let recent = state
                .pipeline
                .request_log()
                .map(|log| log.recent(50))
                .unwrap_or_default();
            json_response(200, "OK", &serde_json::json!({ "requests": recent }))
        }
        ("OPTIONS", _) => {
            // Handle CORS preflight
            create_response(200, "OK", "application/json", "")
        }
        _ => {
            warn!("404: {} {} not found", method, path);
            json_response(
                404,
                "Not Found",
                &serde_json::json!({"error": format!("Endpoint not found: {} {}", method, path)}),
            )
        }
    }
}

/// Rejected candidates are the caller's problem; backend trouble is ours.
fn failure_status(error: &PipelineError) -> (u16, &'static str) {
    match error {
        PipelineError::Validation(_) | PipelineError::Normalization(_) => {
            (422, "Unprocessable Entity")
        }
        PipelineError::Generation(_) | PipelineError::Execution(_) => (502, "Bad Gateway"),
    }
}

fn json_response(status: u16, status_text: &str, body: &serde_json::Value) -> String {
    let body = serde_json::to_string(body)
        .unwrap_or_else(|_| r#"{"error":"Failed to serialize response"}"#.to_string());
    create_response(status, status_text, "application/json", &body)
}

fn create_response(status: u16, status_text: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        status_text,
        content_type,
        body.len(),
        body
    )
}
