//! Grammar Notation Parser
//!
//! Parses the Lark-style notation the grammar source is written in into a list
//! of definitions. Compilation into productions happens in the parent module.

use crate::error::GrammarError;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::{char as pchar, digit1, multispace0, one_of};
use nom::combinator::{all_consuming, map, map_res, opt, recognize};
use nom::multi::{many0, separated_list1};
use nom::sequence::{delimited, pair, preceded, terminated, tuple};
use nom::IResult;

/// Right-hand-side expression of a rule or terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Literal { value: String, case_insensitive: bool },
    Pattern { pattern: String, flags: String },
    Range { from: char, to: char },
    Name(String),
    Seq(Vec<Expr>),
    Alt(Vec<Expr>),
    Repeat { expr: Box<Expr>, min: usize, max: Option<usize> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Definition {
    Rule { name: String, expr: Expr },
    Terminal { name: String, expr: Expr },
    /// `%import module.NAME [-> ALIAS]` or `%import module (A, B)`
    Import { module: String, names: Vec<(String, String)> },
    Ignore(Expr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub line: usize,
    pub definition: Definition,
}

/// Terminals are spelled in upper case, rules in lower case.
pub fn is_terminal_name(name: &str) -> bool {
    name.chars()
        .find(|c| c.is_ascii_alphabetic())
        .map(|c| c.is_ascii_uppercase())
        .unwrap_or(false)
}

pub fn parse_notation(source: &str) -> Result<Vec<Located>, GrammarError> {
    let mut out = Vec::new();
    for (line, text) in split_definitions(source) {
        let definition = parse_definition(&text, line)?;
        out.push(Located { line, definition });
    }
    Ok(out)
}

/// Group physical lines into logical definitions. Continuation lines are
/// indented or start with `|`.
fn split_definitions(source: &str) -> Vec<(usize, String)> {
    let mut defs: Vec<(usize, String)> = Vec::new();
    for (idx, raw) in source.lines().enumerate() {
        let line = strip_comment(raw);
        if line.trim().is_empty() {
            continue;
        }
        let continues = line.starts_with(char::is_whitespace) || line.trim_start().starts_with('|');
        match defs.last_mut() {
            Some((_, text)) if continues => {
                text.push('\n');
                text.push_str(line);
            }
            _ => defs.push((idx + 1, line.to_string())),
        }
    }
    defs
}

/// Remove a trailing `//` comment, skipping over string literals and regexes.
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => i = skip_delimited(bytes, i, b'"'),
            b'/' if bytes.get(i + 1) == Some(&b'/') => return &line[..i],
            b'/' => i = skip_delimited(bytes, i, b'/'),
            _ => i += 1,
        }
    }
    line
}

fn skip_delimited(bytes: &[u8], start: usize, delim: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == delim => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

fn parse_definition(text: &str, line: usize) -> Result<Definition, GrammarError> {
    let result = if text.trim_start().starts_with('%') {
        all_consuming(delimited(multispace0, directive, multispace0))(text)
    } else {
        all_consuming(delimited(multispace0, named_definition, multispace0))(text)
    };

    match result {
        Ok((_, definition)) => Ok(definition),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let offset = text.len() - e.input.len();
            let error_line = line + text[..offset].matches('\n').count();
            let near: String = e.input.chars().take(24).collect();
            Err(GrammarError::Syntax {
                line: error_line,
                message: if near.trim().is_empty() {
                    "unexpected end of definition".to_string()
                } else {
                    format!("unexpected input near '{}'", near.trim())
                },
            })
        }
        Err(nom::Err::Incomplete(_)) => Err(GrammarError::Syntax {
            line,
            message: "incomplete definition".to_string(),
        }),
    }
}

fn named_definition(input: &str) -> IResult<&str, Definition> {
    let (input, _) = opt(one_of("?!"))(input)?;
    let (input, name) = name(input)?;
    let (input, _) = opt(preceded(pchar('.'), pair(opt(pchar('-')), digit1)))(input)?;
    let (input, _) = ws(pchar(':'))(input)?;
    let (input, expr) = expansions(input)?;

    let definition = if is_terminal_name(&name) {
        Definition::Terminal { name, expr }
    } else {
        Definition::Rule { name, expr }
    };
    Ok((input, definition))
}

fn directive(input: &str) -> IResult<&str, Definition> {
    alt((import_directive, ignore_directive))(input)
}

fn import_directive(input: &str) -> IResult<&str, Definition> {
    let (input, _) = terminated(tag("%import"), multispace0)(input)?;
    alt((
        // %import common (WS, NUMBER)
        map(
            tuple((
                dotted_name,
                ws(pchar('(')),
                separated_list1(ws(pchar(',')), name),
                ws(pchar(')')),
            )),
            |(module, _, names, _)| Definition::Import {
                module,
                names: names.into_iter().map(|n| (n.clone(), n)).collect(),
            },
        ),
        // %import common.WS [-> ALIAS]
        map(
            pair(dotted_name, opt(preceded(ws(tag("->")), name))),
            |(path, alias)| {
                let (module, imported) = match path.rsplit_once('.') {
                    Some((m, n)) => (m.to_string(), n.to_string()),
                    None => (String::new(), path.clone()),
                };
                let local = alias.unwrap_or_else(|| imported.clone());
                Definition::Import {
                    module,
                    names: vec![(local, imported)],
                }
            },
        ),
    ))(input)
}

fn ignore_directive(input: &str) -> IResult<&str, Definition> {
    map(
        preceded(terminated(tag("%ignore"), multispace0), expansions),
        Definition::Ignore,
    )(input)
}

/// `alt ( "|" alt )*`
fn expansions(input: &str) -> IResult<&str, Expr> {
    map(separated_list1(ws(pchar('|')), alternative), |mut alts| {
        if alts.len() == 1 {
            alts.remove(0)
        } else {
            Expr::Alt(alts)
        }
    })(input)
}

fn alternative(input: &str) -> IResult<&str, Expr> {
    let (input, items) = many0(preceded(multispace0, item))(input)?;
    let (input, _) = opt(preceded(ws(tag("->")), name))(input)?;
    let expr = if items.len() == 1 {
        items.into_iter().next().unwrap_or(Expr::Seq(Vec::new()))
    } else {
        Expr::Seq(items)
    };
    Ok((input, expr))
}

fn item(input: &str) -> IResult<&str, Expr> {
    let (input, base) = atom(input)?;
    let (input, op) = opt(alt((
        map(pchar('?'), |_| (0, Some(1))),
        map(pchar('*'), |_| (0, None)),
        map(pchar('+'), |_| (1, None)),
        map(
            preceded(
                ws(pchar('~')),
                pair(number, opt(preceded(ws(tag("..")), number))),
            ),
            |(min, max)| (min, Some(max.unwrap_or(min))),
        ),
    )))(input)?;

    let expr = match op {
        Some((min, max)) => Expr::Repeat {
            expr: Box::new(base),
            min,
            max,
        },
        None => base,
    };
    Ok((input, expr))
}

fn atom(input: &str) -> IResult<&str, Expr> {
    alt((
        delimited(pchar('('), ws(expansions), pchar(')')),
        map(delimited(pchar('['), ws(expansions), pchar(']')), |e| {
            Expr::Repeat {
                expr: Box::new(e),
                min: 0,
                max: Some(1),
            }
        }),
        range,
        literal,
        pattern,
        // A name directly followed by ':' starts the next definition
        map(terminated(name, nom::combinator::not(ws(pchar(':')))), Expr::Name),
    ))(input)
}

fn range(input: &str) -> IResult<&str, Expr> {
    map_res(
        tuple((string_body, ws(tag("..")), string_body)),
        |(from, _, to)| {
            let mut f = from.chars();
            let mut t = to.chars();
            match (f.next(), f.next(), t.next(), t.next()) {
                (Some(from), None, Some(to), None) if from <= to => Ok(Expr::Range { from, to }),
                _ => Err("range bounds must be single characters"),
            }
        },
    )(input)
}

fn literal(input: &str) -> IResult<&str, Expr> {
    let flag = terminated(
        pchar('i'),
        nom::combinator::not(nom::character::complete::satisfy(|c: char| {
            c.is_ascii_alphanumeric() || c == '_'
        })),
    );
    map(pair(string_body, opt(flag)), |(value, flag)| {
        Expr::Literal {
            value,
            case_insensitive: flag.is_some(),
        }
    })(input)
}

/// A double-quoted string with backslash escapes, returned unescaped.
fn string_body(input: &str) -> IResult<&str, String> {
    let (body, _) = pchar('"')(input)?;
    let mut value = String::new();
    let mut chars = body.char_indices();
    let mut end = None;
    while let Some((idx, c)) = chars.next() {
        match c {
            '"' => {
                end = Some(idx + 1);
                break;
            }
            '\\' => match chars.next() {
                Some((_, 'n')) => value.push('\n'),
                Some((_, 't')) => value.push('\t'),
                Some((_, 'r')) => value.push('\r'),
                Some((_, other)) => value.push(other),
                None => break,
            },
            other => value.push(other),
        }
    }
    match end {
        Some(end) => Ok((&body[end..], value)),
        None => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Char,
        ))),
    }
}

/// `/regex/flags`. Escapes are kept as written except `\/`.
fn pattern(input: &str) -> IResult<&str, Expr> {
    let (body, _) = pchar('/')(input)?;
    let mut pattern = String::new();
    let mut chars = body.char_indices();
    let mut end = None;
    while let Some((idx, c)) = chars.next() {
        match c {
            '/' => {
                end = Some(idx + 1);
                break;
            }
            '\\' => match chars.next() {
                Some((_, '/')) => pattern.push('/'),
                Some((_, other)) => {
                    pattern.push('\\');
                    pattern.push(other);
                }
                None => break,
            },
            other => pattern.push(other),
        }
    }
    let end = match end {
        Some(end) if !pattern.is_empty() => end,
        _ => {
            return Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Char,
            )))
        }
    };
    let (rest, flags) = take_while(|c: char| "imsxlu".contains(c))(&body[end..])?;
    Ok((
        rest,
        Expr::Pattern {
            pattern,
            flags: flags.to_string(),
        },
    ))
}

fn name(input: &str) -> IResult<&str, String> {
    map(
        recognize(pair(
            take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
            take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        )),
        |s: &str| s.to_string(),
    )(input)
}

fn dotted_name(input: &str) -> IResult<&str, String> {
    map(
        recognize(separated_list1(pchar('.'), name)),
        |s: &str| s.to_string(),
    )(input)
}

fn number(input: &str) -> IResult<&str, usize> {
    map_res(digit1, |d: &str| d.parse::<usize>())(input)
}

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(value: &str, case_insensitive: bool) -> Expr {
        Expr::Literal {
            value: value.to_string(),
            case_insensitive,
        }
    }

    #[test]
    fn test_rule_with_continuation_lines() {
        let defs = parse_notation(
            "sort: \"ASC\"i\n    | \"DESC\"i   // direction\n\nstart: sort\n",
        )
        .unwrap();

        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].line, 1);
        assert_eq!(
            defs[0].definition,
            Definition::Rule {
                name: "sort".to_string(),
                expr: Expr::Alt(vec![lit("ASC", true), lit("DESC", true)]),
            }
        );
        assert_eq!(defs[1].line, 4);
    }

    #[test]
    fn test_operators_groups_and_optionals() {
        let defs = parse_notation("?list: item (\",\" item)* [\";\"]\n").unwrap();
        let Definition::Rule { name, expr } = &defs[0].definition else {
            panic!("expected rule");
        };
        assert_eq!(name, "list");
        assert_eq!(
            expr,
            &Expr::Seq(vec![
                Expr::Name("item".to_string()),
                Expr::Repeat {
                    expr: Box::new(Expr::Seq(vec![
                        lit(",", false),
                        Expr::Name("item".to_string())
                    ])),
                    min: 0,
                    max: None,
                },
                Expr::Repeat {
                    expr: Box::new(lit(";", false)),
                    min: 0,
                    max: Some(1),
                },
            ])
        );
    }

    #[test]
    fn test_terminal_with_regex_and_priority() {
        let defs = parse_notation("IDENT.2: /[a-z_][a-z0-9_]*/i | /`[^`]+`/\n").unwrap();
        assert_eq!(
            defs[0].definition,
            Definition::Terminal {
                name: "IDENT".to_string(),
                expr: Expr::Alt(vec![
                    Expr::Pattern {
                        pattern: "[a-z_][a-z0-9_]*".to_string(),
                        flags: "i".to_string()
                    },
                    Expr::Pattern {
                        pattern: "`[^`]+`".to_string(),
                        flags: String::new()
                    },
                ]),
            }
        );
    }

    #[test]
    fn test_regex_escapes_survive_comment_stripping() {
        let defs = parse_notation("STRING: /'([^'\\\\]|\\\\.)*'/ // quoted\n").unwrap();
        let Definition::Terminal { expr, .. } = &defs[0].definition else {
            panic!("expected terminal");
        };
        assert_eq!(
            expr,
            &Expr::Pattern {
                pattern: "'([^'\\\\]|\\\\.)*'".to_string(),
                flags: String::new()
            }
        );
    }

    #[test]
    fn test_directives() {
        let defs = parse_notation("%import common.WS\n%import common (INT, CNAME)\n%ignore WS\n").unwrap();
        assert_eq!(
            defs[0].definition,
            Definition::Import {
                module: "common".to_string(),
                names: vec![("WS".to_string(), "WS".to_string())],
            }
        );
        assert_eq!(
            defs[1].definition,
            Definition::Import {
                module: "common".to_string(),
                names: vec![
                    ("INT".to_string(), "INT".to_string()),
                    ("CNAME".to_string(), "CNAME".to_string())
                ],
            }
        );
        assert_eq!(defs[2].definition, Definition::Ignore(Expr::Name("WS".to_string())));
    }

    #[test]
    fn test_character_range() {
        let defs = parse_notation("DIGIT: \"0\"..\"9\"\n").unwrap();
        let Definition::Terminal { expr, .. } = &defs[0].definition else {
            panic!("expected terminal");
        };
        assert_eq!(expr, &Expr::Range { from: '0', to: '9' });
    }

    #[test]
    fn test_syntax_error_reports_line() {
        let err = parse_notation("start: a\n\na: \"x\" )\n").unwrap_err();
        match err {
            GrammarError::Syntax { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unterminated_literal_is_rejected() {
        assert!(matches!(
            parse_notation("start: \"SELECT\n"),
            Err(GrammarError::Syntax { .. })
        ));
    }
}
