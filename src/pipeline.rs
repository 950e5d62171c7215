//! Pipeline
//!
//! One request runs strictly in sequence: generate, validate, normalize,
//! execute. Each stage yields its typed value or a typed failure that ends
//! the run. Nothing is retried and nothing is defaulted.

use crate::config::AppConfig;
use crate::error::{GrammarError, PipelineError, Result, StartupError};
use crate::execution::{ExecutionResult, QueryEngine, TinybirdEngine};
use crate::generator::{openai, ConstrainedGenerator, GenerationMode, GenerationRequest};
use crate::grammar::{Grammar, GrammarCatalog};
use crate::normalizer::{NormalizedQuery, SafetyNormalizer};
use crate::observability::{RequestLog, RequestLogEntry};
use crate::schema::SchemaCatalog;
use crate::validator::GrammarValidator;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Received,
    Generating,
    Generated,
    GenerationFailed,
    Validating,
    Valid,
    Invalid,
    Normalizing,
    Normalized,
    NormalizationFailed,
    Executing,
    Executed,
    ExecutionFailed,
}

impl PipelineState {
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Received, Generating)
                | (Generating, Generated)
                | (Generating, GenerationFailed)
                | (Generated, Validating)
                | (Validating, Valid)
                | (Validating, Invalid)
                | (Valid, Normalizing)
                | (Normalizing, Normalized)
                | (Normalizing, NormalizationFailed)
                | (Normalized, Executing)
                | (Executing, Executed)
                | (Executing, ExecutionFailed)
        )
    }

    pub fn is_terminal(self) -> bool {
        use PipelineState::*;
        matches!(
            self,
            GenerationFailed | Invalid | NormalizationFailed | Executed | ExecutionFailed
        )
    }

    pub fn as_str(self) -> &'static str {
        use PipelineState::*;
        match self {
            Received => "received",
            Generating => "generating",
            Generated => "generated",
            GenerationFailed => "generation_failed",
            Validating => "validating",
            Valid => "valid",
            Invalid => "invalid",
            Normalizing => "normalizing",
            Normalized => "normalized",
            NormalizationFailed => "normalization_failed",
            Executing => "executing",
            Executed => "executed",
            ExecutionFailed => "execution_failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: PipelineState,
    pub to: PipelineState,
    /// Milliseconds since the request was received
    pub at_ms: u64,
}

/// Terminal success of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub request_id: Uuid,
    pub question: String,
    /// Candidate exactly as generated
    pub generated_query: String,
    /// Text that was sent to the analytical backend
    pub normalized_query: NormalizedQuery,
    pub mode: GenerationMode,
    pub result: ExecutionResult,
    pub transitions: Vec<StateTransition>,
}

/// Terminal failure of one request, with the state it failed in.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error}")]
pub struct PipelineFailure {
    pub request_id: Uuid,
    pub question: String,
    pub generated_query: Option<String>,
    pub state: PipelineState,
    pub error: PipelineError,
    pub transitions: Vec<StateTransition>,
}

impl PipelineFailure {
    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }
}

const REQUEST_LOG_CAPACITY: usize = 200;

/// Load the grammar named by configuration and log its size.
pub fn load_grammar(config: &AppConfig) -> std::result::Result<GrammarCatalog, StartupError> {
    let catalog = GrammarCatalog::load(&config.grammar_path, &config.grammar_root)?;
    let grammar = catalog.get();
    info!(
        "Loaded grammar {} (root '{}'): {} rules, {} productions, {} terminals",
        config.grammar_path.display(),
        grammar.root_name(),
        grammar.rule_count(),
        grammar.production_count(),
        grammar.terminal_count()
    );
    Ok(catalog)
}

struct Run {
    state: PipelineState,
    transitions: Vec<StateTransition>,
    started: Instant,
}

impl Run {
    fn new() -> Self {
        Self {
            state: PipelineState::Received,
            transitions: Vec::new(),
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: PipelineState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        debug!("{} -> {}", self.state, next);
        self.transitions.push(StateTransition {
            from: self.state,
            to: next,
            at_ms: self.elapsed_ms(),
        });
        self.state = next;
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

pub struct Pipeline {
    generator: ConstrainedGenerator,
    validator: GrammarValidator,
    normalizer: SafetyNormalizer,
    engine: Arc<dyn QueryEngine>,
    request_log: Option<Arc<RequestLog>>,
}

impl Pipeline {
    pub fn new(
        generator: ConstrainedGenerator,
        validator: GrammarValidator,
        normalizer: SafetyNormalizer,
        engine: Arc<dyn QueryEngine>,
    ) -> Self {
        Self {
            generator,
            validator,
            normalizer,
            engine,
            request_log: None,
        }
    }

    /// Wire every component from configuration. Fails if the grammar does
    /// not load or either backend is not configured.
    pub fn from_config(config: &AppConfig) -> std::result::Result<Self, StartupError> {
        let grammar = Arc::new(load_grammar(config)?);
        let schema = Arc::new(match &config.schema_path {
            Some(path) => SchemaCatalog::load(path)?,
            None => SchemaCatalog::hr_attrition(),
        });
        info!(
            "Schema catalog: table {} with {} columns",
            schema.table,
            schema.columns.len()
        );

        let backend = openai::from_config(config.generation()?, &schema.table)?;
        let engine: Arc<dyn QueryEngine> =
            Arc::new(TinybirdEngine::from_config(config.tinybird()?)?);

        let generator = ConstrainedGenerator::new(backend, schema, grammar.clone());
        let pipeline = Self::new(
            generator,
            GrammarValidator::earley(grammar),
            SafetyNormalizer::default(),
            engine,
        )
        .with_request_log(Arc::new(RequestLog::new(
            config.query_log_path.clone(),
            REQUEST_LOG_CAPACITY,
        )));
        Ok(pipeline)
    }

    pub fn with_request_log(mut self, log: Arc<RequestLog>) -> Self {
        self.request_log = Some(log);
        self
    }

    pub fn validator(&self) -> &GrammarValidator {
        &self.validator
    }

    pub fn engine(&self) -> &Arc<dyn QueryEngine> {
        &self.engine
    }

    pub fn request_log(&self) -> Option<&Arc<RequestLog>> {
        self.request_log.as_ref()
    }

    /// Re-read the grammar file behind the validator. Requests already in
    /// flight keep the grammar they started with. With [`Pipeline::from_config`]
    /// the generator shares the same catalog and sees the new grammar too.
    pub fn reload_grammar(&self) -> std::result::Result<Arc<Grammar>, GrammarError> {
        self.validator.catalog().reload()
    }

    /// Validate and normalize a query without touching any backend.
    pub fn check(&self, sql: &str) -> Result<NormalizedQuery> {
        self.validator.check(sql)?;
        Ok(self.normalizer.normalize(sql)?)
    }

    /// Natural language in, generated query and rows out.
    pub async fn generate_and_run(
        &self,
        text: &str,
    ) -> std::result::Result<PipelineOutcome, PipelineFailure> {
        let request = GenerationRequest::new(text);
        let span = tracing::info_span!("request", id = %request.request_id);
        let outcome = self.run(&request).instrument(span).await;
        self.record(&request, &outcome);
        outcome
    }

    async fn run(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<PipelineOutcome, PipelineFailure> {
        let mut run = Run::new();
        info!("Received question: {}", request.text);

        let fail = |run: Run, state: PipelineState, generated: Option<String>, error: PipelineError| {
            warn!("Request failed in state {}: {}", state, error);
            PipelineFailure {
                request_id: request.request_id,
                question: request.text.clone(),
                generated_query: generated,
                state,
                error,
                transitions: run.transitions,
            }
        };

        run.advance(PipelineState::Generating);
        let generated = match self.generator.generate(request).await {
            Ok(generated) => generated,
            Err(e) => {
                run.advance(PipelineState::GenerationFailed);
                return Err(fail(run, PipelineState::GenerationFailed, None, e.into()));
            }
        };
        run.advance(PipelineState::Generated);

        run.advance(PipelineState::Validating);
        if let Err(e) = self.validator.check(&generated.candidate) {
            run.advance(PipelineState::Invalid);
            return Err(fail(
                run,
                PipelineState::Invalid,
                Some(generated.candidate),
                e.into(),
            ));
        }
        run.advance(PipelineState::Valid);

        run.advance(PipelineState::Normalizing);
        let normalized = match self.normalizer.normalize(&generated.candidate) {
            Ok(normalized) => normalized,
            Err(e) => {
                run.advance(PipelineState::NormalizationFailed);
                return Err(fail(
                    run,
                    PipelineState::NormalizationFailed,
                    Some(generated.candidate),
                    e.into(),
                ));
            }
        };
        run.advance(PipelineState::Normalized);

        run.advance(PipelineState::Executing);
        let result = match self.engine.execute(&normalized).await {
            Ok(result) => result,
            Err(e) => {
                run.advance(PipelineState::ExecutionFailed);
                return Err(fail(
                    run,
                    PipelineState::ExecutionFailed,
                    Some(generated.candidate),
                    e.into(),
                ));
            }
        };
        run.advance(PipelineState::Executed);
        info!(
            "Executed {} in {}ms, {} rows",
            normalized,
            run.elapsed_ms(),
            result.row_count
        );

        Ok(PipelineOutcome {
            request_id: request.request_id,
            question: request.text.clone(),
            generated_query: generated.candidate,
            normalized_query: normalized,
            mode: generated.mode,
            result,
            transitions: run.transitions,
        })
    }

    fn record(
        &self,
        request: &GenerationRequest,
        outcome: &std::result::Result<PipelineOutcome, PipelineFailure>,
    ) {
        let Some(log) = &self.request_log else {
            return;
        };
        let (generated_query, final_state, error, rows_returned, transitions) = match outcome {
            Ok(o) => (
                Some(o.generated_query.clone()),
                PipelineState::Executed,
                None,
                Some(o.result.row_count),
                &o.transitions,
            ),
            Err(f) => (
                f.generated_query.clone(),
                f.state,
                Some(&f.error),
                None,
                &f.transitions,
            ),
        };
        log.record(RequestLogEntry {
            timestamp: Utc::now(),
            request_id: request.request_id,
            question: request.text.clone(),
            generated_query,
            final_state: final_state.to_string(),
            error_kind: error.map(|e| e.kind().to_string()),
            error_message: error.map(|e| e.to_string()),
            rows_returned,
            elapsed_ms: transitions.last().map(|t| t.at_ms).unwrap_or(0),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_edges_follow_the_happy_path() {
        use PipelineState::*;
        let path = [
            Received, Generating, Generated, Validating, Valid, Normalizing, Normalized,
            Executing, Executed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(Executed.is_terminal());
    }

    #[test]
    fn test_illegal_edges() {
        use PipelineState::*;
        assert!(!Received.can_transition_to(Executing));
        assert!(!Generated.can_transition_to(Normalizing));
        assert!(!Invalid.can_transition_to(Normalizing));
        assert!(!Executed.can_transition_to(Received));
        for terminal in [GenerationFailed, Invalid, NormalizationFailed, ExecutionFailed, Executed] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(Generating));
        }
    }
}
