//! Grammar
//!
//! Compiles grammar source text into an immutable set of productions over
//! rule and terminal symbols. A `Grammar` is what the Grammar Catalog hands
//! out and what the recognizer runs against.

pub mod catalog;
pub mod notation;

pub use catalog::GrammarCatalog;

use crate::error::GrammarError;
use notation::{is_terminal_name, Definition, Expr};
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    Rule(usize),
    Terminal(usize),
}

#[derive(Debug, Clone)]
pub struct Production {
    pub lhs: usize,
    pub rhs: Vec<Symbol>,
}

/// A lexical terminal compiled to an anchored regex.
#[derive(Debug, Clone)]
pub struct Terminal {
    /// Name used in diagnostics: `IDENTIFIER`, `"SELECT"`, `/[0-9]+/`
    pub display: String,
    regex: Regex,
    /// Set for literals that look like words (keywords)
    keyword: bool,
    literal: bool,
}

impl Terminal {
    /// Byte offset where a match starting at `at` ends, if any.
    pub fn match_at(&self, text: &str, at: usize, reserved: &HashSet<String>) -> Option<usize> {
        if !text.is_char_boundary(at) {
            return None;
        }
        let m = self.regex.find(&text[at..])?;
        if m.start() != 0 || m.end() == 0 {
            return None;
        }
        let end = at + m.end();
        if self.keyword && text[end..].chars().next().map_or(false, is_word_char) {
            return None;
        }
        if !self.literal && reserved.contains(&text[at..end].to_ascii_uppercase()) {
            return None;
        }
        Some(end)
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_word(value: &str) -> bool {
    let mut chars = value.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_') && chars.all(is_word_char)
}

#[derive(Debug, Clone)]
pub struct Grammar {
    source: String,
    root: usize,
    rule_names: Vec<String>,
    productions: Vec<Production>,
    by_lhs: Vec<Vec<usize>>,
    nullable: Vec<bool>,
    terminals: Vec<Terminal>,
    ignore: Vec<Regex>,
    reserved: HashSet<String>,
}

impl Grammar {
    /// Parse and compile grammar source with `root` as the start symbol.
    pub fn compile(source: &str, root: &str) -> Result<Self, GrammarError> {
        let definitions = notation::parse_notation(source)?;
        let mut builder = Builder::default();

        // Terminal expressions first so rules can refer to them by name
        let mut terminal_exprs: BTreeMap<String, Expr> = BTreeMap::new();
        let mut rule_exprs: Vec<(String, Expr)> = Vec::new();
        let mut ignores: Vec<Expr> = Vec::new();

        for located in definitions {
            match located.definition {
                Definition::Terminal { name, expr } => {
                    if terminal_exprs.insert(name.clone(), expr).is_some() {
                        return Err(GrammarError::Syntax {
                            line: located.line,
                            message: format!("terminal '{}' is defined twice", name),
                        });
                    }
                }
                Definition::Rule { name, expr } => {
                    if rule_exprs.iter().any(|(n, _)| n == &name) {
                        return Err(GrammarError::Syntax {
                            line: located.line,
                            message: format!("rule '{}' is defined twice", name),
                        });
                    }
                    rule_exprs.push((name, expr));
                }
                Definition::Import { module, names } => {
                    if module != "common" {
                        return Err(GrammarError::Syntax {
                            line: located.line,
                            message: format!("unsupported import module '{}'", module),
                        });
                    }
                    for (local, imported) in names {
                        let pattern = common_terminal(&imported).ok_or_else(|| {
                            GrammarError::InvalidTerminal {
                                name: imported.clone(),
                                message: "not available in common".to_string(),
                            }
                        })?;
                        terminal_exprs.insert(
                            local,
                            Expr::Pattern {
                                pattern: pattern.to_string(),
                                flags: String::new(),
                            },
                        );
                    }
                }
                Definition::Ignore(expr) => ignores.push(expr),
            }
        }

        let mut resolver = TerminalResolver {
            exprs: &terminal_exprs,
            resolved: HashMap::new(),
            in_progress: HashSet::new(),
        };

        for (name, _) in &rule_exprs {
            builder.rule_id(name);
        }
        for (name, expr) in &rule_exprs {
            let lhs = builder.rule_id(name);
            builder.add_alternatives(lhs, name, expr, &mut resolver)?;
        }

        for (idx, defined) in builder.defined.iter().enumerate() {
            if !defined {
                let symbol = builder.rule_names[idx].clone();
                let referenced_by = builder
                    .first_reference
                    .get(&idx)
                    .cloned()
                    .unwrap_or_default();
                return Err(GrammarError::UndefinedSymbol {
                    symbol,
                    referenced_by,
                });
            }
        }

        let root_id = builder
            .rule_index
            .get(root)
            .copied()
            .ok_or_else(|| GrammarError::MissingRoot(root.to_string()))?;

        let mut ignore = Vec::new();
        for expr in &ignores {
            let pattern = resolver.pattern(expr, "%ignore")?;
            ignore.push(anchored("%ignore", &pattern)?);
        }

        let reserved: HashSet<String> = builder
            .terminals
            .iter()
            .filter(|t| t.keyword)
            .map(|t| t.display.trim_matches('"').to_ascii_uppercase())
            .collect();

        let nullable = compute_nullable(builder.rule_names.len(), &builder.productions);
        let mut by_lhs = vec![Vec::new(); builder.rule_names.len()];
        for (idx, production) in builder.productions.iter().enumerate() {
            by_lhs[production.lhs].push(idx);
        }

        debug!(
            "Compiled grammar: {} rules, {} productions, {} terminals, {} reserved words",
            builder.rule_names.len(),
            builder.productions.len(),
            builder.terminals.len(),
            reserved.len()
        );

        Ok(Self {
            source: source.to_string(),
            root: root_id,
            rule_names: builder.rule_names,
            productions: builder.productions,
            by_lhs,
            nullable,
            terminals: builder.terminals,
            ignore,
            reserved,
        })
    }

    /// Grammar text exactly as loaded; handed to constrained backends verbatim.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn root_name(&self) -> &str {
        &self.rule_names[self.root]
    }

    pub fn rule_name(&self, rule: usize) -> &str {
        &self.rule_names[rule]
    }

    pub fn production(&self, idx: usize) -> &Production {
        &self.productions[idx]
    }

    pub fn productions_for(&self, rule: usize) -> &[usize] {
        &self.by_lhs[rule]
    }

    pub fn is_nullable(&self, rule: usize) -> bool {
        self.nullable[rule]
    }

    pub fn terminal(&self, idx: usize) -> &Terminal {
        &self.terminals[idx]
    }

    pub fn reserved_words(&self) -> &HashSet<String> {
        &self.reserved
    }

    /// Number of user-visible rules (excluding generated helper rules).
    pub fn rule_count(&self) -> usize {
        self.rule_names.iter().filter(|n| !n.starts_with("__")).count()
    }

    pub fn production_count(&self) -> usize {
        self.productions.len()
    }

    pub fn terminal_count(&self) -> usize {
        self.terminals.len()
    }

    /// Advance past ignored input (whitespace, comments) starting at `at`.
    pub fn skip_ignored(&self, text: &str, mut at: usize) -> usize {
        if !text.is_char_boundary(at) {
            return at;
        }
        loop {
            let before = at;
            for re in &self.ignore {
                if let Some(m) = re.find(&text[at..]) {
                    if m.start() == 0 && m.end() > 0 {
                        at += m.end();
                    }
                }
            }
            if at == before {
                return at;
            }
        }
    }

    pub fn match_terminal(&self, terminal: usize, text: &str, at: usize) -> Option<usize> {
        self.terminals[terminal].match_at(text, at, &self.reserved)
    }
}

fn anchored(name: &str, pattern: &str) -> Result<Regex, GrammarError> {
    Regex::new(&format!("^(?:{})", pattern)).map_err(|e| GrammarError::InvalidTerminal {
        name: name.to_string(),
        message: e.to_string(),
    })
}

/// Terminals available through `%import common.NAME`.
fn common_terminal(name: &str) -> Option<&'static str> {
    let pattern = match name {
        "WS" => r"[ \t\f\r\n]+",
        "WS_INLINE" => r"[ \t]+",
        "NEWLINE" => r"(?:\r?\n[\t ]*)+",
        "CNAME" => r"[A-Za-z_][A-Za-z0-9_]*",
        "LETTER" => r"[A-Za-z]",
        "DIGIT" => r"[0-9]",
        "WORD" => r"[A-Za-z]+",
        "INT" => r"[0-9]+",
        "SIGNED_INT" => r"[+-]?[0-9]+",
        "DECIMAL" => r"(?:[0-9]+\.[0-9]*|\.[0-9]+)",
        "FLOAT" => r"(?:[0-9]+[eE][+-]?[0-9]+|(?:[0-9]+\.[0-9]*|\.[0-9]+)(?:[eE][+-]?[0-9]+)?)",
        "NUMBER" => r"(?:(?:[0-9]+[eE][+-]?[0-9]+|(?:[0-9]+\.[0-9]*|\.[0-9]+)(?:[eE][+-]?[0-9]+)?)|[0-9]+)",
        "SIGNED_NUMBER" => r"[+-]?(?:(?:[0-9]+[eE][+-]?[0-9]+|(?:[0-9]+\.[0-9]*|\.[0-9]+)(?:[eE][+-]?[0-9]+)?)|[0-9]+)",
        "ESCAPED_STRING" => r#""(?:[^"\\]|\\.)*""#,
        _ => return None,
    };
    Some(pattern)
}

fn compute_nullable(rule_count: usize, productions: &[Production]) -> Vec<bool> {
    let mut nullable = vec![false; rule_count];
    let mut changed = true;
    while changed {
        changed = false;
        for production in productions {
            if nullable[production.lhs] {
                continue;
            }
            let all_nullable = production.rhs.iter().all(|symbol| match symbol {
                Symbol::Rule(r) => nullable[*r],
                Symbol::Terminal(_) => false,
            });
            if all_nullable {
                nullable[production.lhs] = true;
                changed = true;
            }
        }
    }
    nullable
}

/// Turns terminal expressions into regex source, following references.
struct TerminalResolver<'a> {
    exprs: &'a BTreeMap<String, Expr>,
    resolved: HashMap<String, String>,
    in_progress: HashSet<String>,
}

impl<'a> TerminalResolver<'a> {
    fn named(&mut self, name: &str, referenced_by: &str) -> Result<String, GrammarError> {
        if let Some(pattern) = self.resolved.get(name) {
            return Ok(pattern.clone());
        }
        let expr = self
            .exprs
            .get(name)
            .ok_or_else(|| GrammarError::UndefinedSymbol {
                symbol: name.to_string(),
                referenced_by: referenced_by.to_string(),
            })?;
        if !self.in_progress.insert(name.to_string()) {
            return Err(GrammarError::InvalidTerminal {
                name: name.to_string(),
                message: "terminal refers to itself".to_string(),
            });
        }
        let pattern = self.pattern(expr, name)?;
        self.in_progress.remove(name);
        self.resolved.insert(name.to_string(), pattern.clone());
        Ok(pattern)
    }

    fn pattern(&mut self, expr: &Expr, owner: &str) -> Result<String, GrammarError> {
        let pattern = match expr {
            Expr::Literal {
                value,
                case_insensitive,
            } => {
                if *case_insensitive {
                    format!("(?i:{})", regex::escape(value))
                } else {
                    regex::escape(value)
                }
            }
            Expr::Pattern { pattern, flags } => {
                let flags: String = flags.chars().filter(|c| "imsxu".contains(*c)).collect();
                if flags.is_empty() {
                    format!("(?:{})", pattern)
                } else {
                    format!("(?{}:{})", flags, pattern)
                }
            }
            Expr::Range { from, to } => format!(
                "[{}-{}]",
                regex::escape(&from.to_string()),
                regex::escape(&to.to_string())
            ),
            Expr::Name(name) => {
                if !is_terminal_name(name) {
                    return Err(GrammarError::InvalidTerminal {
                        name: owner.to_string(),
                        message: format!("terminals cannot refer to rule '{}'", name),
                    });
                }
                format!("(?:{})", self.named(name, owner)?)
            }
            Expr::Seq(items) => {
                let mut out = String::from("(?:");
                for item in items {
                    out.push_str(&self.pattern(item, owner)?);
                }
                out.push(')');
                out
            }
            Expr::Alt(alts) => {
                let parts = alts
                    .iter()
                    .map(|a| self.pattern(a, owner))
                    .collect::<Result<Vec<_>, _>>()?;
                format!("(?:{})", parts.join("|"))
            }
            Expr::Repeat { expr, min, max } => {
                let inner = self.pattern(expr, owner)?;
                match (min, max) {
                    (0, Some(1)) => format!("(?:{})?", inner),
                    (0, None) => format!("(?:{})*", inner),
                    (1, None) => format!("(?:{})+", inner),
                    (n, None) => format!("(?:{}){{{},}}", inner, n),
                    (n, Some(m)) => format!("(?:{}){{{},{}}}", inner, n, m),
                }
            }
        };
        Ok(pattern)
    }
}

#[derive(Default)]
struct Builder {
    rule_names: Vec<String>,
    rule_index: HashMap<String, usize>,
    defined: Vec<bool>,
    first_reference: HashMap<usize, String>,
    productions: Vec<Production>,
    terminals: Vec<Terminal>,
    terminal_index: HashMap<String, usize>,
    helper_count: usize,
}

impl Builder {
    fn rule_id(&mut self, name: &str) -> usize {
        if let Some(id) = self.rule_index.get(name) {
            return *id;
        }
        let id = self.rule_names.len();
        self.rule_names.push(name.to_string());
        self.rule_index.insert(name.to_string(), id);
        self.defined.push(false);
        id
    }

    fn helper_rule(&mut self, owner: &str) -> usize {
        self.helper_count += 1;
        let id = self.rule_id(&format!("__{}_{}", owner, self.helper_count));
        self.defined[id] = true;
        id
    }

    fn add_alternatives(
        &mut self,
        lhs: usize,
        owner: &str,
        expr: &Expr,
        resolver: &mut TerminalResolver,
    ) -> Result<(), GrammarError> {
        self.defined[lhs] = true;
        let alternatives: Vec<&Expr> = match expr {
            Expr::Alt(alts) => alts.iter().collect(),
            other => vec![other],
        };
        for alternative in alternatives {
            let mut rhs = Vec::new();
            self.sequence(alternative, owner, resolver, &mut rhs)?;
            self.productions.push(Production { lhs, rhs });
        }
        Ok(())
    }

    fn sequence(
        &mut self,
        expr: &Expr,
        owner: &str,
        resolver: &mut TerminalResolver,
        rhs: &mut Vec<Symbol>,
    ) -> Result<(), GrammarError> {
        match expr {
            Expr::Seq(items) => {
                for item in items {
                    self.sequence(item, owner, resolver, rhs)?;
                }
            }
            other => rhs.push(self.symbol(other, owner, resolver)?),
        }
        Ok(())
    }

    fn symbol(
        &mut self,
        expr: &Expr,
        owner: &str,
        resolver: &mut TerminalResolver,
    ) -> Result<Symbol, GrammarError> {
        match expr {
            Expr::Name(name) if is_terminal_name(name) => {
                let key = format!("name:{}", name);
                if let Some(idx) = self.terminal_index.get(&key) {
                    return Ok(Symbol::Terminal(*idx));
                }
                let pattern = resolver.named(name, owner)?;
                let idx = self.push_terminal(key, name.clone(), &pattern, false, false)?;
                Ok(Symbol::Terminal(idx))
            }
            Expr::Name(name) => {
                let id = self.rule_id(name);
                self.first_reference
                    .entry(id)
                    .or_insert_with(|| owner.to_string());
                Ok(Symbol::Rule(id))
            }
            Expr::Literal {
                value,
                case_insensitive,
            } => {
                let key = format!("lit:{}:{}", case_insensitive, value);
                if let Some(idx) = self.terminal_index.get(&key) {
                    return Ok(Symbol::Terminal(*idx));
                }
                let pattern = resolver.pattern(expr, owner)?;
                let display = format!("\"{}\"", value);
                let idx = self.push_terminal(key, display, &pattern, true, is_word(value))?;
                Ok(Symbol::Terminal(idx))
            }
            Expr::Pattern { pattern, flags } => {
                let key = format!("re:{}:{}", flags, pattern);
                if let Some(idx) = self.terminal_index.get(&key) {
                    return Ok(Symbol::Terminal(*idx));
                }
                let source = resolver.pattern(expr, owner)?;
                let display = format!("/{}/{}", pattern, flags);
                let idx = self.push_terminal(key, display, &source, false, false)?;
                Ok(Symbol::Terminal(idx))
            }
            Expr::Range { .. } => {
                let source = resolver.pattern(expr, owner)?;
                let key = format!("range:{}", source);
                if let Some(idx) = self.terminal_index.get(&key) {
                    return Ok(Symbol::Terminal(*idx));
                }
                let idx = self.push_terminal(key, source.clone(), &source, false, false)?;
                Ok(Symbol::Terminal(idx))
            }
            Expr::Seq(_) | Expr::Alt(_) => {
                let helper = self.helper_rule(owner);
                self.add_alternatives(helper, owner, expr, resolver)?;
                Ok(Symbol::Rule(helper))
            }
            Expr::Repeat { expr: inner, min, max } => {
                let item = self.symbol(inner, owner, resolver)?;
                Ok(Symbol::Rule(self.repeat(item, *min, *max, owner)))
            }
        }
    }

    /// Helper rule deriving `item{min,max}`. Unbounded repetition is left recursive.
    fn repeat(&mut self, item: Symbol, min: usize, max: Option<usize>, owner: &str) -> usize {
        let helper = self.helper_rule(owner);
        match max {
            None => {
                // helper -> item^min | helper item
                self.productions.push(Production {
                    lhs: helper,
                    rhs: vec![item; min],
                });
                self.productions.push(Production {
                    lhs: helper,
                    rhs: vec![Symbol::Rule(helper), item],
                });
            }
            Some(max) => {
                for count in min..=max.max(min) {
                    self.productions.push(Production {
                        lhs: helper,
                        rhs: vec![item; count],
                    });
                }
            }
        }
        helper
    }

    fn push_terminal(
        &mut self,
        key: String,
        display: String,
        pattern: &str,
        literal: bool,
        keyword: bool,
    ) -> Result<usize, GrammarError> {
        let regex = anchored(&display, pattern)?;
        let idx = self.terminals.len();
        self.terminals.push(Terminal {
            display,
            regex,
            keyword,
            literal,
        });
        self.terminal_index.insert(key, idx);
        Ok(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY: &str = r#"
start: "SELECT"i item ("," item)* "FORMAT"i "JSON"i
item: NAME | INT
NAME: /[a-z_]+/
%import common.INT
%import common.WS
%ignore WS
"#;

    #[test]
    fn test_compile_builds_root_and_terminals() {
        let grammar = Grammar::compile(TINY, "start").unwrap();
        assert_eq!(grammar.root_name(), "start");
        assert_eq!(grammar.rule_count(), 2);
        assert!(grammar.reserved_words().contains("SELECT"));
        assert!(grammar.reserved_words().contains("FORMAT"));
        assert!(grammar.reserved_words().contains("JSON"));
        assert_eq!(grammar.source(), TINY);
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let err = Grammar::compile(TINY, "query").unwrap_err();
        assert!(matches!(err, GrammarError::MissingRoot(ref r) if r == "query"));
    }

    #[test]
    fn test_undefined_rule_is_fatal() {
        let err = Grammar::compile("start: expr\n", "start").unwrap_err();
        match err {
            GrammarError::UndefinedSymbol {
                symbol,
                referenced_by,
            } => {
                assert_eq!(symbol, "expr");
                assert_eq!(referenced_by, "start");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_undefined_terminal_is_fatal() {
        let err = Grammar::compile("start: NUMBER\n", "start").unwrap_err();
        assert!(matches!(err, GrammarError::UndefinedSymbol { ref symbol, .. } if symbol == "NUMBER"));
    }

    #[test]
    fn test_invalid_regex_is_fatal() {
        let err = Grammar::compile("start: BAD\nBAD: /[a-/\n", "start").unwrap_err();
        assert!(matches!(err, GrammarError::InvalidTerminal { .. }));
    }

    #[test]
    fn test_composite_terminal() {
        let grammar =
            Grammar::compile("start: DEC\nDEC: INT \".\" INT\n%import common.INT\n", "start").unwrap();
        let terminal = match grammar.production(grammar.productions_for(grammar.root())[0]).rhs[0] {
            Symbol::Terminal(t) => t,
            Symbol::Rule(_) => panic!("expected terminal"),
        };
        assert_eq!(grammar.match_terminal(terminal, "12.50 rest", 0), Some(5));
        assert_eq!(grammar.match_terminal(terminal, "12 rest", 0), None);
    }

    #[test]
    fn test_keywords_need_word_boundary_and_are_reserved() {
        let grammar = Grammar::compile(TINY, "start").unwrap();
        let select = (0..grammar.terminal_count())
            .find(|&t| grammar.terminal(t).display == "\"SELECT\"")
            .unwrap();
        let name = (0..grammar.terminal_count())
            .find(|&t| grammar.terminal(t).display == "NAME")
            .unwrap();

        assert_eq!(grammar.match_terminal(select, "select x", 0), Some(6));
        assert_eq!(grammar.match_terminal(select, "selection", 0), None);
        assert_eq!(grammar.match_terminal(name, "format", 0), None);
        assert_eq!(grammar.match_terminal(name, "formats", 0), Some(7));
    }

    #[test]
    fn test_nullable_rules() {
        let grammar = Grammar::compile("start: a b\na: \"x\"?\nb: a*\n", "start").unwrap();
        assert!(grammar.is_nullable(grammar.root()));
    }

    #[test]
    fn test_skip_ignored() {
        let grammar = Grammar::compile(TINY, "start").unwrap();
        assert_eq!(grammar.skip_ignored("   SELECT", 0), 3);
        assert_eq!(grammar.skip_ignored("SELECT", 0), 0);
    }
}
