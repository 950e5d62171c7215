//! Shared fixtures: a scripted generation backend and an in-process mock of
//! the analytical backend.

#![allow(dead_code)]

use async_trait::async_trait;
use grammarsql::error::GenerationError;
use grammarsql::execution::{QueryEngine, TinybirdEngine};
use grammarsql::generator::{BackendCapabilities, BackendOutput, ConstrainedGenerator, GenerationBackend};
use grammarsql::grammar::GrammarCatalog;
use grammarsql::normalizer::SafetyNormalizer;
use grammarsql::pipeline::Pipeline;
use grammarsql::schema::SchemaCatalog;
use grammarsql::validator::GrammarValidator;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub fn shipped_grammar_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("grammar/clickhouse_sql.lark")
}

pub fn shipped_grammar() -> Arc<GrammarCatalog> {
    Arc::new(GrammarCatalog::load(&shipped_grammar_path(), "start").unwrap())
}

/// Backend that answers each call with the next scripted output and
/// remembers the prompts it saw.
pub struct ScriptedBackend {
    outputs: Mutex<VecDeque<Result<Option<BackendOutput>, GenerationError>>>,
    pub prompts: Mutex<Vec<String>>,
    pub grammars: Mutex<Vec<Option<String>>>,
}

impl ScriptedBackend {
    pub fn new(outputs: Vec<Result<Option<BackendOutput>, GenerationError>>) -> Arc<Self> {
        Arc::new(Self {
            outputs: Mutex::new(outputs.into()),
            prompts: Mutex::new(Vec::new()),
            grammars: Mutex::new(Vec::new()),
        })
    }

    /// One constrained tool call per entry.
    pub fn tool_calls(queries: &[&str]) -> Arc<Self> {
        Self::new(
            queries
                .iter()
                .map(|q| Ok(Some(BackendOutput::ToolInput(q.to_string()))))
                .collect(),
        )
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::constrained()
    }

    async fn complete(
        &self,
        prompt: &str,
        grammar: Option<&str>,
    ) -> Result<Option<BackendOutput>, GenerationError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.grammars.lock().unwrap().push(grammar.map(str::to_string));
        self.outputs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(GenerationError::NoOutput("script exhausted".to_string())))
    }
}

/// Mock analytical backend. Answers successive connections with the given
/// `(status line, body)` pairs and records the raw requests.
pub struct MockBackend {
    pub host: String,
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl MockBackend {
    pub async fn start(responses: Vec<(&'static str, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();

        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let raw = read_http_request(&mut stream).await;
                seen.lock().unwrap().push(raw);
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        Self {
            host: format!("http://{}", addr),
            requests,
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// The `q` field of every JSON body received so far.
    pub fn submitted_queries(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|raw| raw.split_once("\r\n\r\n").map(|(_, body)| body.to_string()))
            .filter_map(|body| serde_json::from_str::<serde_json::Value>(&body).ok())
            .filter_map(|json| json["q"].as_str().map(str::to_string))
            .collect()
    }
}

async fn read_http_request(stream: &mut tokio::net::TcpStream) -> String {
    let mut request = Vec::new();
    let mut buffer = [0u8; 4096];
    loop {
        let n = match stream.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        request.extend_from_slice(&buffer[..n]);
        let text = String::from_utf8_lossy(&request).to_string();
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .filter_map(|l| l.split_once(':'))
                .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if request.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&request).to_string()
}

/// JSON body shaped like a ClickHouse `FORMAT JSON` answer.
pub fn rows_body(rows: serde_json::Value) -> String {
    let count = rows.as_array().map(|r| r.len()).unwrap_or(0);
    serde_json::json!({
        "data": rows,
        "rows": count,
        "statistics": {"elapsed": 0.001, "rows_read": 1470, "bytes_read": 23520}
    })
    .to_string()
}

pub fn pipeline(backend: Arc<ScriptedBackend>, host: &str) -> Pipeline {
    pipeline_with_grammar(backend, host, shipped_grammar())
}

/// Same wiring as [`pipeline`] but validating against `grammar`.
pub fn pipeline_with_grammar(
    backend: Arc<ScriptedBackend>,
    host: &str,
    grammar: Arc<GrammarCatalog>,
) -> Pipeline {
    let generator = ConstrainedGenerator::new(
        backend,
        Arc::new(SchemaCatalog::hr_attrition()),
        grammar.clone(),
    );
    let engine: Arc<dyn QueryEngine> = Arc::new(
        TinybirdEngine::new(host.to_string(), "test-token".to_string(), Duration::from_secs(5))
            .unwrap(),
    );
    Pipeline::new(
        generator,
        GrammarValidator::earley(grammar),
        SafetyNormalizer::default(),
        engine,
    )
}
