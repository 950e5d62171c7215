use crate::validator::Diagnostic;
use thiserror::Error;

/// Problems with the grammar source. Always fatal at startup.
#[derive(Error, Debug)]
pub enum GrammarError {
    #[error("Failed to read grammar source {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Grammar syntax error at line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("Undefined symbol '{symbol}' referenced by '{referenced_by}'")]
    UndefinedSymbol { symbol: String, referenced_by: String },

    #[error("Root symbol '{0}' is not defined")]
    MissingRoot(String),

    #[error("Invalid terminal '{name}': {message}")]
    InvalidTerminal { name: String, message: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Generation backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Generation backend returned no candidate query: {0}")]
    NoOutput(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Query does not conform to the grammar: {0}")]
    GrammarViolation(Diagnostic),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("Statement is not read-only: {0}")]
    NonReadOnlyStatement(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Analytical backend rejected the query ({status}): {detail}")]
    BackendRejected { status: u16, detail: String },

    #[error("Malformed response from analytical backend: {0}")]
    MalformedResponse(String),

    #[error("Analytical backend unavailable: {0}")]
    BackendUnavailable(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing configuration: {0}")]
    Missing(String),

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("Failed to read {path}: {message}")]
    File { path: String, message: String },
}

/// Anything that stops the process before it can serve a request.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Grammar(#[from] GrammarError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// Typed failure surfaced by the pipeline. Stage errors pass through verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Normalization(#[from] NormalizationError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl PipelineError {
    /// Stable machine-readable kind, e.g. `execution.backend_rejected`.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Generation(GenerationError::BackendUnavailable(_)) => {
                "generation.backend_unavailable"
            }
            PipelineError::Generation(GenerationError::NoOutput(_)) => "generation.no_output",
            PipelineError::Validation(ValidationError::GrammarViolation(_)) => {
                "validation.grammar_violation"
            }
            PipelineError::Normalization(NormalizationError::NonReadOnlyStatement(_)) => {
                "normalization.non_read_only_statement"
            }
            PipelineError::Execution(ExecutionError::BackendRejected { .. }) => {
                "execution.backend_rejected"
            }
            PipelineError::Execution(ExecutionError::MalformedResponse(_)) => {
                "execution.malformed_response"
            }
            PipelineError::Execution(ExecutionError::BackendUnavailable(_)) => {
                "execution.backend_unavailable"
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_rejected_keeps_status_and_detail() {
        let err: PipelineError = ExecutionError::BackendRejected {
            status: 500,
            detail: "[Error] Missing columns: 'salary'".to_string(),
        }
        .into();

        assert_eq!(err.kind(), "execution.backend_rejected");
        let message = err.to_string();
        assert!(message.contains("500"));
        assert!(message.contains("[Error] Missing columns: 'salary'"));
    }
}
