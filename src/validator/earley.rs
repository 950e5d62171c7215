//! Earley recognizer
//!
//! Scannerless Earley over byte positions: terminals are matched directly
//! against the input after skipping ignored text, so ambiguous grammars and
//! keyword/identifier overlaps are handled by the chart rather than a lexer.
//! Nullable rules use the Aycock-Horspool prediction shortcut.

use super::{Diagnostic, GrammarParser, ValidationOutcome};
use crate::grammar::{Grammar, Symbol};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Item {
    production: usize,
    dot: usize,
    origin: usize,
}

#[derive(Default)]
struct EarleySet {
    items: Vec<Item>,
    seen: HashSet<Item>,
    /// Items whose next symbol is the keyed rule
    waiting: HashMap<usize, Vec<Item>>,
}

impl EarleySet {
    fn add(&mut self, item: Item, grammar: &Grammar) {
        if !self.seen.insert(item) {
            return;
        }
        if let Some(Symbol::Rule(rule)) = next_symbol(grammar, item) {
            self.waiting.entry(rule).or_default().push(item);
        }
        self.items.push(item);
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn next_symbol(grammar: &Grammar, item: Item) -> Option<Symbol> {
    grammar.production(item.production).rhs.get(item.dot).copied()
}

fn advance(item: Item) -> Item {
    Item {
        dot: item.dot + 1,
        ..item
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EarleyParser;

impl EarleyParser {
    pub fn new() -> Self {
        Self
    }
}

impl GrammarParser for EarleyParser {
    fn parse(&self, grammar: &Grammar, text: &str) -> ValidationOutcome {
        let len = text.len();
        let root = grammar.root();
        let mut chart: Vec<EarleySet> = (0..=len).map(|_| EarleySet::default()).collect();

        for &production in grammar.productions_for(root) {
            chart[0].add(
                Item {
                    production,
                    dot: 0,
                    origin: 0,
                },
                grammar,
            );
        }

        let mut furthest = 0;
        for pos in 0..=len {
            if chart[pos].is_empty() {
                continue;
            }
            furthest = pos;
            let token_start = grammar.skip_ignored(text, pos);
            let mut scanned: HashMap<usize, Option<usize>> = HashMap::new();

            let mut idx = 0;
            while idx < chart[pos].items.len() {
                let item = chart[pos].items[idx];
                idx += 1;

                match next_symbol(grammar, item) {
                    None => {
                        // Completion. Same-position completions of nullable
                        // rules were already advanced during prediction.
                        if item.origin == pos {
                            continue;
                        }
                        let lhs = grammar.production(item.production).lhs;
                        let parents = chart[item.origin]
                            .waiting
                            .get(&lhs)
                            .cloned()
                            .unwrap_or_default();
                        for parent in parents {
                            chart[pos].add(advance(parent), grammar);
                        }
                    }
                    Some(Symbol::Rule(rule)) => {
                        for &production in grammar.productions_for(rule) {
                            chart[pos].add(
                                Item {
                                    production,
                                    dot: 0,
                                    origin: pos,
                                },
                                grammar,
                            );
                        }
                        if grammar.is_nullable(rule) {
                            chart[pos].add(advance(item), grammar);
                        }
                    }
                    Some(Symbol::Terminal(terminal)) => {
                        let end = *scanned.entry(terminal).or_insert_with(|| {
                            grammar.match_terminal(terminal, text, token_start)
                        });
                        if let Some(end) = end {
                            chart[end].add(advance(item), grammar);
                        }
                    }
                }
            }
        }

        // Empty sets may sit inside a multi-byte char
        let accepted = (0..=len).any(|pos| {
            !chart[pos].is_empty()
                && grammar.skip_ignored(text, pos) == len
                && chart[pos].items.iter().any(|item| {
                    item.origin == 0
                        && grammar.production(item.production).lhs == root
                        && next_symbol(grammar, *item).is_none()
                })
        });
        if accepted {
            return ValidationOutcome::accepted();
        }

        // Report the furthest position any derivation reached
        let expected: BTreeSet<String> = chart[furthest]
            .items
            .iter()
            .filter_map(|item| match next_symbol(grammar, *item) {
                Some(Symbol::Terminal(t)) => Some(grammar.terminal(t).display.clone()),
                _ => None,
            })
            .collect();
        let offset = grammar.skip_ignored(text, furthest);
        ValidationOutcome::rejected(Diagnostic::at(text, offset, expected.into_iter().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::Grammar;

    fn grammar(source: &str) -> Grammar {
        Grammar::compile(source, "start").unwrap()
    }

    const ARITH: &str = r#"
start: expr
?expr: expr "+" expr
     | expr "*" expr
     | "(" expr ")"
     | INT
%import common.INT
%import common.WS
%ignore WS
"#;

    #[test]
    fn test_ambiguous_grammar_is_accepted() {
        let g = grammar(ARITH);
        let parser = EarleyParser::new();
        assert!(parser.parse(&g, "1 + 2 * 3 + 4").accepted);
        assert!(parser.parse(&g, "  (1+2) * (3) ").accepted);
    }

    #[test]
    fn test_multibyte_input_is_scanned_on_char_boundaries() {
        let g = grammar(
            r#"
start: "say" STRING
STRING: /'[^']*'/
%import common.WS
%ignore WS
"#,
        );
        let parser = EarleyParser::new();
        assert!(parser.parse(&g, "say 'naïve café'").accepted);

        let outcome = parser.parse(&g, "say ünïcode");
        assert!(!outcome.accepted);
        assert_eq!(outcome.diagnostic.unwrap().offset, 4);
    }

    #[test]
    fn test_rejection_names_furthest_position() {
        let g = grammar(ARITH);
        let outcome = EarleyParser::new().parse(&g, "1 + * 3");
        assert!(!outcome.accepted);
        let diagnostic = outcome.diagnostic.unwrap();
        assert_eq!(diagnostic.offset, 4);
        assert_eq!(diagnostic.found, "*");
        assert!(diagnostic.expected.contains(&"INT".to_string()));
        assert!(diagnostic.expected.contains(&"\"(\"".to_string()));
    }

    #[test]
    fn test_truncated_input_reports_end_of_input() {
        let g = grammar(ARITH);
        let diagnostic = EarleyParser::new().parse(&g, "(1 + 2").diagnostic.unwrap();
        assert_eq!(diagnostic.found, "end of input");
        assert!(diagnostic.expected.contains(&"\")\"".to_string()));
    }

    #[test]
    fn test_nullable_and_repetition() {
        let g = grammar(
            "start: \"a\"i* opt \"b\"+\nopt: \"c\"?\n%import common.WS\n%ignore WS\n",
        );
        let parser = EarleyParser::new();
        assert!(parser.parse(&g, "b").accepted);
        assert!(parser.parse(&g, "a A a c b b").accepted);
        assert!(!parser.parse(&g, "a c").accepted);
        assert!(!parser.parse(&g, "").accepted);
    }

    #[test]
    fn test_keyword_is_not_an_identifier() {
        let g = grammar(
            "start: \"SELECT\"i NAME alias? \"FROM\"i NAME\nalias: NAME\nNAME: /[a-z_]+/i\n%import common.WS\n%ignore WS\n",
        );
        let parser = EarleyParser::new();
        assert!(parser.parse(&g, "select a b from t").accepted);
        assert!(parser.parse(&g, "select a from t").accepted);
        assert!(!parser.parse(&g, "select from from t").accepted);
        assert!(!parser.parse(&g, "selecta from t").accepted);
    }
}
