//! Grammar Catalog
//!
//! Owns the compiled grammar. Readers take an `Arc` snapshot; a reload swaps
//! the whole snapshot at once, so in-flight validations keep the grammar they
//! started with.

use crate::error::GrammarError;
use crate::grammar::Grammar;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

pub struct GrammarCatalog {
    path: Option<PathBuf>,
    root: String,
    current: RwLock<Arc<Grammar>>,
}

impl GrammarCatalog {
    /// Read and compile the grammar at `path`. Any failure is fatal to startup.
    pub fn load(path: &Path, root: &str) -> Result<Self, GrammarError> {
        let grammar = Self::read(path, root)?;
        info!(
            "Loaded grammar from {} (root '{}', {} rules, {} terminals)",
            path.display(),
            root,
            grammar.rule_count(),
            grammar.terminal_count()
        );
        Ok(Self {
            path: Some(path.to_path_buf()),
            root: root.to_string(),
            current: RwLock::new(Arc::new(grammar)),
        })
    }

    /// Catalog over in-memory grammar text. Such a catalog cannot be reloaded.
    pub fn from_source(source: &str, root: &str) -> Result<Self, GrammarError> {
        let grammar = Grammar::compile(source, root)?;
        Ok(Self {
            path: None,
            root: root.to_string(),
            current: RwLock::new(Arc::new(grammar)),
        })
    }

    /// Current immutable grammar handle.
    pub fn get(&self) -> Arc<Grammar> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-read the grammar source and swap it in. On failure the previous
    /// grammar stays active and the error is returned.
    pub fn reload(&self) -> Result<Arc<Grammar>, GrammarError> {
        let Some(path) = &self.path else {
            return Ok(self.get());
        };
        let grammar = match Self::read(path, &self.root) {
            Ok(grammar) => Arc::new(grammar),
            Err(e) => {
                warn!("Grammar reload from {} failed, keeping previous grammar: {}", path.display(), e);
                return Err(e);
            }
        };
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::clone(&grammar);
        info!("Reloaded grammar from {}", path.display());
        Ok(grammar)
    }

    fn read(path: &Path, root: &str) -> Result<Grammar, GrammarError> {
        let source = std::fs::read_to_string(path).map_err(|e| GrammarError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Grammar::compile(&source, root)
    }
}
