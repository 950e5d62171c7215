//! Constrained Generator
//!
//! Turns a natural-language question into one candidate query. The generator
//! is polymorphic over backends: a backend that can take the grammar as an
//! output constraint gets it, one that cannot gets only the prompt. Either way
//! the candidate is untrusted until the validator accepts it.

pub mod openai;

use crate::error::GenerationError;
use crate::grammar::GrammarCatalog;
use crate::schema::SchemaCatalog;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub text: String,
    /// Opaque correlation id carried through logs and results
    pub request_id: Uuid,
}

impl GenerationRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            request_id: Uuid::new_v4(),
        }
    }
}

/// Which backend mode produced the candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    /// Tool-call argument produced under the grammar constraint
    Constrained,
    /// Chat-style text, no syntactic guarantee
    FreeformFallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub candidate: String,
    pub mode: GenerationMode,
    pub model: String,
    pub request_id: Uuid,
}

/// What a backend is able to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    /// Accepts a grammar as an output constraint for a single tool call
    pub constrained: bool,
    /// Returns chat-style text
    pub freeform: bool,
}

impl BackendCapabilities {
    pub fn constrained() -> Self {
        Self {
            constrained: true,
            freeform: true,
        }
    }

    pub fn freeform() -> Self {
        Self {
            constrained: false,
            freeform: true,
        }
    }
}

/// Raw payload extracted from a backend response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendOutput {
    /// Argument of the grammar-constrained tool invocation
    ToolInput(String),
    /// Unconstrained message text, possibly fenced
    Text(String),
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Backend name (e.g., "openai-responses")
    fn name(&self) -> &'static str;

    fn model(&self) -> &str;

    fn capabilities(&self) -> BackendCapabilities;

    /// Send the prompt, with the grammar source when the backend is
    /// constrained-capable. `Ok(None)` means the backend answered but
    /// produced nothing extractable.
    async fn complete(
        &self,
        prompt: &str,
        grammar: Option<&str>,
    ) -> Result<Option<BackendOutput>, GenerationError>;
}

pub struct ConstrainedGenerator {
    backend: Arc<dyn GenerationBackend>,
    schema: Arc<SchemaCatalog>,
    grammar: Arc<GrammarCatalog>,
}

impl ConstrainedGenerator {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        schema: Arc<SchemaCatalog>,
        grammar: Arc<GrammarCatalog>,
    ) -> Self {
        Self {
            backend,
            schema,
            grammar,
        }
    }

    pub fn backend(&self) -> &Arc<dyn GenerationBackend> {
        &self.backend
    }

    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, GenerationError> {
        let capabilities = self.backend.capabilities();
        let prompt = build_prompt(&self.schema, &request.text);

        // Snapshot held for the duration of the call
        let grammar = capabilities.constrained.then(|| self.grammar.get());
        info!(
            "Generating query with {} ({}, {} mode)",
            self.backend.name(),
            self.backend.model(),
            if grammar.is_some() { "constrained" } else { "freeform" }
        );

        let output = self
            .backend
            .complete(&prompt, grammar.as_deref().map(|g| g.source()))
            .await?;

        let (candidate, mode) = match output {
            Some(BackendOutput::ToolInput(input)) => {
                (input.trim().to_string(), GenerationMode::Constrained)
            }
            Some(BackendOutput::Text(text)) => {
                if capabilities.constrained {
                    warn!("Backend answered with text instead of a tool call, using freeform fallback");
                }
                (strip_code_fences(&text), GenerationMode::FreeformFallback)
            }
            None => {
                return Err(GenerationError::NoOutput(format!(
                    "{} returned neither a tool call nor text",
                    self.backend.name()
                )))
            }
        };

        if candidate.is_empty() {
            return Err(GenerationError::NoOutput(format!(
                "{} returned an empty candidate",
                self.backend.name()
            )));
        }

        debug!("Candidate query: {}", candidate);
        Ok(GenerationResult {
            candidate,
            mode,
            model: self.backend.model().to_string(),
            request_id: request.request_id,
        })
    }
}

/// Prompt embedding the schema, the read-only constraints and the question.
pub fn build_prompt(schema: &SchemaCatalog, question: &str) -> String {
    format!(
        r#"Convert the following natural language query into a ClickHouse SQL query for the {table} table.

{schema}
Natural language query: {question}

Generate a valid ClickHouse SQL query that:
1. Uses SELECT statements only (read-only queries); a WITH clause of common table expressions may precede the SELECT
2. Queries from the table: {table}
3. Matches the exact column names from the schema above
4. Uses comparison operators =, !=, >, <, >=, <= (not EQ, NEQ, etc.)
5. Uses proper spacing between keywords, operators and function calls, e.g. CASE WHEN condition THEN value ELSE value END
6. Always ends with FORMAT JSON

Return only the SQL query, without explanations or markdown formatting."#,
        table = schema.table,
        schema = schema.describe(),
        question = question.trim(),
    )
}

lazy_static! {
    static ref OPENING_FENCE: Regex = Regex::new(r"(?i)^```[a-z]*[ \t]*\r?\n?").unwrap();
    static ref CLOSING_FENCE: Regex = Regex::new(r"\r?\n?```\s*$").unwrap();
}

/// Remove a surrounding markdown code fence (```` ```sql ```` or ```` ``` ````)
/// and whitespace.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let without_open = OPENING_FENCE.replace(trimmed, "");
    let without_close = CLOSING_FENCE.replace(&without_open, "");
    without_close.trim().to_string()
}
