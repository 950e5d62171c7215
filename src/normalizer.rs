//! Safety Normalizer
//!
//! Last gate before execution. Only read-only statements pass, and every
//! query leaves here with exactly one trailing output-format directive.
//! This is the single enforcement point for read-only safety; the grammar
//! is not trusted for it.

use crate::error::NormalizationError;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use tracing::debug;

/// Directive appended to every normalized query.
pub const DEFAULT_FORMAT: &str = "JSON";

const READ_ONLY_LEADERS: [&str; 2] = ["SELECT", "WITH"];

/// Query text that begins with a read-only statement and ends with exactly
/// one `FORMAT` directive. Only constructed by [`SafetyNormalizer`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedQuery(String);

impl NormalizedQuery {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for NormalizedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NormalizedQuery {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct SafetyNormalizer {
    format: String,
}

impl Default for SafetyNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_FORMAT)
    }
}

impl SafetyNormalizer {
    pub fn new(format: &str) -> Self {
        Self {
            format: format.to_ascii_uppercase(),
        }
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn normalize(&self, text: &str) -> Result<NormalizedQuery, NormalizationError> {
        let uncommented = strip_comments(text);
        let body = strip_trailing_directives(&uncommented);

        if body.is_empty() {
            return Err(NormalizationError::NonReadOnlyStatement(
                "empty statement".to_string(),
            ));
        }
        if let Some(offset) = statement_separator(body) {
            return Err(NormalizationError::NonReadOnlyStatement(format!(
                "multiple statements (separator at offset {})",
                offset
            )));
        }

        let leader = leading_keyword(body);
        if !READ_ONLY_LEADERS
            .iter()
            .any(|k| leader.eq_ignore_ascii_case(k))
        {
            return Err(NormalizationError::NonReadOnlyStatement(if leader.is_empty() {
                format!("statement does not start with a keyword: '{}'", preview(body))
            } else {
                format!("'{}' is not a read-only statement", leader.to_ascii_uppercase())
            }));
        }

        let normalized = format!("{} FORMAT {}", body, self.format);
        debug!("Normalized query: {}", normalized);
        Ok(NormalizedQuery(normalized))
    }
}

/// Drop `-- ...` line comments and `/* ... */` block comments outside
/// quotes. A block comment becomes one space so adjacent tokens stay apart;
/// an unterminated one runs to the end of the text.
fn strip_comments(text: &str) -> Cow<'_, str> {
    if !text.contains("--") && !text.contains("/*") {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        let next = chars.peek().copied();
        match (c, next) {
            ('-', Some('-')) => {
                while chars.peek().map_or(false, |&n| n != '\n') {
                    chars.next();
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for n in chars.by_ref() {
                    if prev == '*' && n == '/' {
                        break;
                    }
                    prev = n;
                }
                out.push(' ');
            }
            _ => {
                if matches!(c, '\'' | '"' | '`') {
                    quote = Some(c);
                }
                out.push(c);
            }
        }
    }
    Cow::Owned(out)
}

/// Strip trailing whitespace, semicolons and `FORMAT <name>` directives
/// until none remain.
fn strip_trailing_directives(text: &str) -> &str {
    let mut body = text.trim();
    loop {
        let before = body.len();
        body = body.trim_end_matches(|c: char| c == ';' || c.is_whitespace());
        if let Some(stripped) = strip_format_suffix(body) {
            body = stripped;
        }
        if body.len() == before {
            return body;
        }
    }
}

/// `body` without a trailing `FORMAT <ident>`, if it has one.
fn strip_format_suffix(body: &str) -> Option<&str> {
    let name_start = body
        .rfind(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .map(|i| i + 1)
        .unwrap_or(0);
    if name_start == body.len() {
        return None;
    }
    let head = &body[..name_start];
    let trimmed = head.trim_end();
    if trimmed.len() == head.len() || trimmed.len() < "FORMAT".len() {
        return None;
    }
    let keyword_start = trimmed.len() - "FORMAT".len();
    if !trimmed.is_char_boundary(keyword_start)
        || !trimmed[keyword_start..].eq_ignore_ascii_case("FORMAT")
    {
        return None;
    }
    let before_keyword = &trimmed[..keyword_start];
    if before_keyword
        .chars()
        .next_back()
        .map_or(false, |c| c.is_ascii_alphanumeric() || c == '_')
    {
        return None;
    }
    Some(before_keyword.trim_end())
}

/// Offset of a `;` outside string literals and quoted identifiers.
fn statement_separator(body: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (idx, c) in body.char_indices() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                ';' => return Some(idx),
                _ => {}
            },
        }
    }
    None
}

/// First word of the statement, skipping opening parentheses.
fn leading_keyword(body: &str) -> &str {
    let rest = body.trim_start_matches(|c: char| c == '(' || c.is_whitespace());
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    &rest[..end]
}

fn preview(body: &str) -> String {
    body.chars().take(32).collect()
}
