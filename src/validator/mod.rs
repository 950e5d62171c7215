//! Grammar Validator
//!
//! The single authority on whether a candidate query is in the language.
//! Runs regardless of which generation backend produced the candidate.

pub mod earley;

pub use earley::EarleyParser;

use crate::error::ValidationError;
use crate::grammar::{Grammar, GrammarCatalog};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where and why a candidate was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Byte offset of the offending token
    pub offset: usize,
    /// 1-based line
    pub line: usize,
    /// 1-based column (in characters)
    pub column: usize,
    /// Offending token text, or `end of input`
    pub found: String,
    /// Terminals that would have been accepted at this position
    pub expected: Vec<String>,
}

impl Diagnostic {
    pub fn at(text: &str, offset: usize, expected: Vec<String>) -> Self {
        let mut offset = offset.min(text.len());
        while !text.is_char_boundary(offset) {
            offset -= 1;
        }
        let before = &text[..offset];
        let line = before.matches('\n').count() + 1;
        let column = before
            .rsplit('\n')
            .next()
            .map(|l| l.chars().count())
            .unwrap_or(0)
            + 1;
        Self {
            offset,
            line,
            column,
            found: token_at(text, offset),
            expected,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unexpected {} at line {}, column {} (offset {})",
            if self.found == END_OF_INPUT {
                END_OF_INPUT.to_string()
            } else {
                format!("'{}'", self.found)
            },
            self.line,
            self.column,
            self.offset
        )?;
        if !self.expected.is_empty() {
            write!(f, "; expected one of: {}", self.expected.join(", "))?;
        }
        Ok(())
    }
}

const END_OF_INPUT: &str = "end of input";

/// Text of the token starting at `offset`: a word, or a single other character.
fn token_at(text: &str, offset: usize) -> String {
    let rest = &text[offset..];
    let mut chars = rest.chars();
    match chars.next() {
        None => END_OF_INPUT.to_string(),
        Some(c) if c.is_alphanumeric() || c == '_' => rest
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect(),
        Some(c) => c.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub accepted: bool,
    pub diagnostic: Option<Diagnostic>,
}

impl ValidationOutcome {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            diagnostic: None,
        }
    }

    pub fn rejected(diagnostic: Diagnostic) -> Self {
        Self {
            accepted: false,
            diagnostic: Some(diagnostic),
        }
    }
}

/// Any general context-free recognizer. Acceptance means at least one
/// derivation from the grammar's root exists.
pub trait GrammarParser: Send + Sync {
    fn parse(&self, grammar: &Grammar, text: &str) -> ValidationOutcome;
}

pub struct GrammarValidator {
    catalog: Arc<GrammarCatalog>,
    parser: Arc<dyn GrammarParser>,
}

impl GrammarValidator {
    pub fn new(catalog: Arc<GrammarCatalog>, parser: Arc<dyn GrammarParser>) -> Self {
        Self { catalog, parser }
    }

    /// Validator backed by the built-in Earley recognizer.
    pub fn earley(catalog: Arc<GrammarCatalog>) -> Self {
        Self::new(catalog, Arc::new(EarleyParser::new()))
    }

    pub fn catalog(&self) -> &Arc<GrammarCatalog> {
        &self.catalog
    }

    pub fn validate(&self, text: &str) -> ValidationOutcome {
        let grammar = self.catalog.get();
        let outcome = self.parser.parse(&grammar, text);
        match &outcome.diagnostic {
            None => debug!("Candidate accepted by grammar root '{}'", grammar.root_name()),
            Some(diagnostic) => warn!("Candidate rejected: {}", diagnostic),
        }
        outcome
    }

    /// `validate` as a `Result`, for use inside the pipeline.
    pub fn check(&self, text: &str) -> Result<(), ValidationError> {
        let outcome = self.validate(text);
        match outcome.diagnostic {
            None if outcome.accepted => Ok(()),
            Some(diagnostic) => Err(ValidationError::GrammarViolation(diagnostic)),
            None => Err(ValidationError::GrammarViolation(Diagnostic::at(
                text,
                0,
                Vec::new(),
            ))),
        }
    }
}
