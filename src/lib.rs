//! Natural-language questions to grammar-checked, read-only ClickHouse SQL.
//!
//! A question flows through a generator (optionally constrained by the
//! grammar), the grammar validator, the safety normalizer and finally the
//! analytical backend. See [`pipeline::Pipeline::generate_and_run`].

pub mod config;
pub mod error;
pub mod evals;
pub mod execution;
pub mod generator;
pub mod grammar;
pub mod logging;
pub mod normalizer;
pub mod observability;
pub mod pipeline;
pub mod schema;
pub mod validator;

pub use config::AppConfig;
pub use error::{
    ConfigError, ExecutionError, GenerationError, GrammarError, NormalizationError,
    PipelineError, StartupError, ValidationError,
};
pub use execution::{ExecutionResult, QueryEngine, TinybirdEngine};
pub use generator::{
    ConstrainedGenerator, GenerationBackend, GenerationMode, GenerationRequest, GenerationResult,
};
pub use grammar::{Grammar, GrammarCatalog};
pub use normalizer::{NormalizedQuery, SafetyNormalizer};
pub use pipeline::{Pipeline, PipelineFailure, PipelineOutcome, PipelineState};
pub use schema::SchemaCatalog;
pub use validator::{Diagnostic, GrammarValidator, ValidationOutcome};
