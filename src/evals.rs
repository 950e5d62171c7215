//! Evaluation suite
//!
//! Questions with expectations about the generated query and its results,
//! grouped into categories. Every case first requires the query to pass the
//! grammar; a case fails on the first pipeline error unless only execution
//! failed and the case does not need results.

use crate::execution::ExecutionResult;
use crate::pipeline::{Pipeline, PipelineState};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalCategory {
    GrammarCompliance,
    QueryExecution,
    SemanticAccuracy,
    AdvancedFeatures,
    ProductionFeatures,
}

impl EvalCategory {
    pub const ALL: [EvalCategory; 5] = [
        EvalCategory::GrammarCompliance,
        EvalCategory::QueryExecution,
        EvalCategory::SemanticAccuracy,
        EvalCategory::AdvancedFeatures,
        EvalCategory::ProductionFeatures,
    ];

    pub fn label(self) -> &'static str {
        match self {
            EvalCategory::GrammarCompliance => "Grammar Compliance",
            EvalCategory::QueryExecution => "Query Execution",
            EvalCategory::SemanticAccuracy => "Semantic Accuracy",
            EvalCategory::AdvancedFeatures => "Advanced Features",
            EvalCategory::ProductionFeatures => "Production Features",
        }
    }
}

impl fmt::Display for EvalCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EvalCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        EvalCategory::ALL
            .into_iter()
            .find(|c| {
                c.label()
                    .chars()
                    .filter(|c| c.is_ascii_alphanumeric())
                    .collect::<String>()
                    .to_ascii_lowercase()
                    == key
            })
            .ok_or_else(|| format!("unknown eval category '{}'", s))
    }
}

/// One expectation about a generated query or its results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    /// Upper-cased query contains the text
    ContainsKeyword(&'static str),
    /// Lower-cased query contains at least one of the texts
    ContainsAny(&'static [&'static str]),
    MentionsColumn(&'static str),
    StartsWith(&'static str),
    LimitEquals(u64),
    GroupByReferences(&'static [&'static str]),
    /// A JOIN, if present, has ON or USING
    JoinHasConstraint,
    RowCountAtMost(u64),
    RowCountAtLeast(u64),
    SingleRowNonNegativeCount,
}

impl Check {
    fn needs_result(&self) -> bool {
        matches!(
            self,
            Check::RowCountAtMost(_) | Check::RowCountAtLeast(_) | Check::SingleRowNonNegativeCount
        )
    }

    /// `None` when satisfied, otherwise why not.
    pub fn evaluate(&self, sql: &str, result: Option<&ExecutionResult>) -> Option<String> {
        let upper = sql.to_ascii_uppercase();
        let lower = sql.to_ascii_lowercase();
        let ok = match self {
            Check::ContainsKeyword(k) => upper.contains(k),
            Check::ContainsAny(options) => options.iter().any(|o| lower.contains(&o.to_ascii_lowercase())),
            Check::MentionsColumn(c) => lower.contains(&c.to_ascii_lowercase()),
            Check::StartsWith(k) => upper.trim_start().starts_with(k),
            Check::LimitEquals(n) => limit_value(sql) == Some(*n),
            Check::GroupByReferences(columns) => match group_by_clause(sql) {
                Some(clause) => columns.iter().all(|c| clause.contains(&c.to_ascii_lowercase())),
                None => false,
            },
            Check::JoinHasConstraint => {
                !JOIN.is_match(sql) || upper.contains(" ON ") || upper.contains("USING")
            }
            Check::RowCountAtMost(n) => result.map_or(false, |r| r.row_count <= *n),
            Check::RowCountAtLeast(n) => result.map_or(false, |r| r.row_count >= *n),
            Check::SingleRowNonNegativeCount => result.map_or(false, |r| {
                r.rows.len() == 1 && r.scalar().and_then(numeric).map_or(false, |v| v >= 0.0)
            }),
        };
        if ok {
            None
        } else {
            Some(format!("{:?} not satisfied", self))
        }
    }
}

lazy_static! {
    static ref LIMIT: Regex = Regex::new(r"(?i)\bLIMIT\s+(\d+)").unwrap();
    static ref GROUP_BY: Regex = Regex::new(
        r"(?is)\bGROUP\s+BY\b(.*?)(?:\bHAVING\b|\bORDER\s+BY\b|\bLIMIT\b|\bFORMAT\b|\)|$)"
    )
    .unwrap();
    static ref JOIN: Regex = Regex::new(r"(?i)\bJOIN\b").unwrap();
}

fn limit_value(sql: &str) -> Option<u64> {
    LIMIT.captures(sql)?.get(1)?.as_str().parse().ok()
}

fn group_by_clause(sql: &str) -> Option<String> {
    Some(GROUP_BY.captures(sql)?.get(1)?.as_str().to_ascii_lowercase())
}

/// ClickHouse quotes 64-bit integers in JSON output, so accept both forms.
fn numeric(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct EvalCase {
    pub category: EvalCategory,
    pub name: &'static str,
    pub question: &'static str,
    pub checks: Vec<Check>,
}

impl EvalCase {
    fn new(
        category: EvalCategory,
        name: &'static str,
        question: &'static str,
        checks: Vec<Check>,
    ) -> Self {
        Self {
            category,
            name,
            question,
            checks,
        }
    }

    fn needs_result(&self) -> bool {
        self.checks.iter().any(Check::needs_result)
    }
}

/// The shipped suite for the HR attrition table.
pub fn default_suite() -> Vec<EvalCase> {
    use Check::*;
    use EvalCategory::*;

    vec![
        EvalCase::new(GrammarCompliance, "Simple SELECT",
            "Show me all employee numbers and their monthly income",
            vec![StartsWith("SELECT")]),
        EvalCase::new(GrammarCompliance, "SELECT with WHERE",
            "Show employees in the Sales department",
            vec![ContainsKeyword("WHERE")]),
        EvalCase::new(GrammarCompliance, "SELECT with GROUP BY",
            "Count employees by department",
            vec![ContainsKeyword("GROUP BY")]),
        EvalCase::new(GrammarCompliance, "SELECT with ORDER BY and LIMIT",
            "Show the top 5 employees by monthly income",
            vec![ContainsKeyword("ORDER BY"), LimitEquals(5)]),
        EvalCase::new(GrammarCompliance, "Complex multi-clause",
            "Show the top 3 departments by average monthly income for employees who have left",
            vec![ContainsKeyword("WHERE"), ContainsKeyword("GROUP BY"), ContainsKeyword("ORDER BY"), LimitEquals(3)]),

        EvalCase::new(QueryExecution, "Basic count",
            "How many employees are there?",
            vec![StartsWith("SELECT"), SingleRowNonNegativeCount]),
        EvalCase::new(QueryExecution, "Aggregation",
            "What is the average monthly income?",
            vec![RowCountAtLeast(1)]),
        EvalCase::new(QueryExecution, "Filtered query",
            "How many employees are in the Sales department?",
            vec![ContainsKeyword("WHERE"), RowCountAtLeast(0)]),
        EvalCase::new(QueryExecution, "Grouped query",
            "What is the average monthly income by department?",
            vec![RowCountAtLeast(1)]),
        EvalCase::new(QueryExecution, "Complex query",
            "Show the count of employees by gender who have left the company, ordered by count descending",
            vec![RowCountAtLeast(1)]),

        EvalCase::new(SemanticAccuracy, "Correct columns",
            "Show me employee numbers and their monthly income",
            vec![MentionsColumn("employeenumber"), MentionsColumn("monthlyincome"), RowCountAtLeast(1)]),
        EvalCase::new(SemanticAccuracy, "Correct filtering",
            "Show employees in the Sales department who have left the company",
            vec![ContainsKeyword("WHERE"), MentionsColumn("department"), MentionsColumn("attrition")]),
        EvalCase::new(SemanticAccuracy, "Correct aggregation",
            "What is the average monthly income by department?",
            vec![ContainsAny(&["avg", "average"]), MentionsColumn("monthlyincome"), GroupByReferences(&["department"])]),
        EvalCase::new(SemanticAccuracy, "Correct grouping",
            "Count employees by gender and department",
            vec![GroupByReferences(&["gender", "department"])]),
        EvalCase::new(SemanticAccuracy, "Correct ordering",
            "Show the top 10 employees by monthly income in descending order",
            vec![ContainsKeyword("ORDER BY"), ContainsKeyword("DESC"), MentionsColumn("monthlyincome"), LimitEquals(10), RowCountAtMost(10)]),

        EvalCase::new(AdvancedFeatures, "String functions",
            "Show the length of department names and convert them to uppercase",
            vec![ContainsAny(&["length(", "upper(", "lower(", "concat(", "department"])]),
        EvalCase::new(AdvancedFeatures, "Arithmetic operations",
            "Show monthly income divided by 1000 for each employee",
            vec![ContainsAny(&["/", "*", "+", "-", "monthlyincome"])]),
        EvalCase::new(AdvancedFeatures, "HAVING clause",
            "Show departments where the average monthly income is greater than 5000",
            vec![ContainsKeyword("HAVING"), ContainsKeyword("GROUP BY"), ContainsAny(&["avg", "average"])]),
        EvalCase::new(AdvancedFeatures, "CASE expressions",
            "Show employees with a case statement categorizing income as high if above 6000, medium if above 3000, else low",
            vec![ContainsKeyword("CASE"), ContainsKeyword("WHEN"), ContainsKeyword("THEN")]),
        EvalCase::new(AdvancedFeatures, "Advanced aggregates",
            "Show the standard deviation of monthly income by department",
            vec![ContainsAny(&["stddev", "variance", "varpop", "varsamp", "avg(", "sum(", "min(", "max("]), ContainsKeyword("GROUP BY")]),

        EvalCase::new(ProductionFeatures, "CTEs",
            "With high_earners as (Select * from IBM_HR_Employee_Attrition where monthlyincome > 5000) Select count(*) from high_earners",
            vec![ContainsKeyword("WITH "), ContainsKeyword("AS (")]),
        EvalCase::new(ProductionFeatures, "Window functions",
            "Show employee number and their rank by income within their department",
            vec![ContainsKeyword("OVER"), ContainsKeyword("PARTITION BY")]),
        EvalCase::new(ProductionFeatures, "Self join",
            "Show employees who have the same role as employee 1001",
            vec![JoinHasConstraint]),
        EvalCase::new(ProductionFeatures, "Dynamic functions",
            "Show the unique count of job roles using the uniq function",
            vec![ContainsAny(&["uniq("])]),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalCaseResult {
    pub category: EvalCategory,
    pub name: String,
    pub question: String,
    pub passed: bool,
    pub generated_query: Option<String>,
    pub error_kind: Option<String>,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub category: EvalCategory,
    pub passed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalReport {
    pub cases: Vec<EvalCaseResult>,
    pub categories: Vec<CategorySummary>,
    pub passed: usize,
    pub total: usize,
}

impl EvalReport {
    fn from_cases(cases: Vec<EvalCaseResult>) -> Self {
        let categories = EvalCategory::ALL
            .into_iter()
            .filter_map(|category| {
                let in_category: Vec<&EvalCaseResult> =
                    cases.iter().filter(|c| c.category == category).collect();
                (!in_category.is_empty()).then(|| CategorySummary {
                    category,
                    passed: in_category.iter().filter(|c| c.passed).count(),
                    total: in_category.len(),
                })
            })
            .collect();
        let passed = cases.iter().filter(|c| c.passed).count();
        let total = cases.len();
        Self {
            cases,
            categories,
            passed,
            total,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }
}

/// Run `cases` one after another through the pipeline.
pub async fn run_suite(pipeline: &Pipeline, cases: &[EvalCase]) -> EvalReport {
    let mut results = Vec::with_capacity(cases.len());
    for case in cases {
        info!("Running eval {} / {}", case.category, case.name);
        let outcome = pipeline.generate_and_run(case.question).await;

        let (generated, result, error) = match &outcome {
            Ok(o) => (Some(o.generated_query.clone()), Some(&o.result), None),
            Err(f) => (f.generated_query.clone(), None, Some(f)),
        };

        let mut failures = Vec::new();
        let blocking_error = error.filter(|f| f.state != PipelineState::ExecutionFailed || case.needs_result());
        if let Some(f) = blocking_error {
            failures.push(f.error.to_string());
        } else if let Some(sql) = &generated {
            failures.extend(case.checks.iter().filter_map(|check| check.evaluate(sql, result)));
        }

        let passed = failures.is_empty();
        info!(
            "{} {} / {}",
            if passed { "PASSED" } else { "FAILED" },
            case.category,
            case.name
        );
        results.push(EvalCaseResult {
            category: case.category,
            name: case.name.to_string(),
            question: case.question.to_string(),
            passed,
            generated_query: generated,
            error_kind: error.map(|f| f.kind().to_string()),
            failures,
        });
    }
    EvalReport::from_cases(results)
}

/// Run the shipped suite, optionally restricted to one category.
pub async fn run_evals(pipeline: &Pipeline, category: Option<EvalCategory>) -> EvalReport {
    let cases: Vec<EvalCase> = default_suite()
        .into_iter()
        .filter(|c| category.map_or(true, |wanted| c.category == wanted))
        .collect();
    run_suite(pipeline, &cases).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(body: serde_json::Value) -> ExecutionResult {
        ExecutionResult::from_response(200, &body).unwrap()
    }

    #[test]
    fn test_suite_covers_every_category() {
        let suite = default_suite();
        assert_eq!(suite.len(), 24);
        for category in EvalCategory::ALL {
            assert!(suite.iter().any(|c| c.category == category));
        }
    }

    #[test]
    fn test_category_parsing() {
        assert_eq!("grammar-compliance".parse(), Ok(EvalCategory::GrammarCompliance));
        assert_eq!("Production Features".parse(), Ok(EvalCategory::ProductionFeatures));
        assert!("performance".parse::<EvalCategory>().is_err());
    }

    #[test]
    fn test_query_checks() {
        let sql = "SELECT gender, department, count(*) FROM IBM_HR_Employee_Attrition \
                   GROUP BY gender, department ORDER BY count(*) DESC LIMIT 10 FORMAT JSON";
        assert_eq!(Check::LimitEquals(10).evaluate(sql, None), None);
        assert!(Check::LimitEquals(5).evaluate(sql, None).is_some());
        assert_eq!(Check::GroupByReferences(&["gender", "department"]).evaluate(sql, None), None);
        assert!(Check::GroupByReferences(&["jobrole"]).evaluate(sql, None).is_some());
        assert_eq!(Check::StartsWith("SELECT").evaluate(sql, None), None);
        assert_eq!(Check::JoinHasConstraint.evaluate(sql, None), None);
        assert!(Check::JoinHasConstraint
            .evaluate("SELECT * FROM a JOIN b FORMAT JSON", None)
            .is_some());
    }

    #[test]
    fn test_group_by_clause_stops_at_next_clause() {
        let sql = "SELECT department FROM t GROUP BY department ORDER BY gender FORMAT JSON";
        assert!(Check::GroupByReferences(&["gender"]).evaluate(sql, None).is_some());
    }

    #[test]
    fn test_result_checks() {
        let count = result(json!({"data": [{"count()": "1470"}], "rows": 1}));
        assert_eq!(Check::SingleRowNonNegativeCount.evaluate("", Some(&count)), None);
        assert_eq!(Check::RowCountAtMost(1).evaluate("", Some(&count)), None);
        assert!(Check::RowCountAtLeast(2).evaluate("", Some(&count)).is_some());
        assert!(Check::SingleRowNonNegativeCount.evaluate("", None).is_some());

        let negative = result(json!({"data": [{"x": -1}], "rows": 1}));
        assert!(Check::SingleRowNonNegativeCount.evaluate("", Some(&negative)).is_some());
    }

    #[test]
    fn test_report_summaries() {
        let case = |category, passed| EvalCaseResult {
            category,
            name: "n".to_string(),
            question: "q".to_string(),
            passed,
            generated_query: None,
            error_kind: None,
            failures: Vec::new(),
        };
        let report = EvalReport::from_cases(vec![
            case(EvalCategory::GrammarCompliance, true),
            case(EvalCategory::GrammarCompliance, false),
            case(EvalCategory::QueryExecution, true),
        ]);
        assert_eq!(report.passed, 2);
        assert_eq!(report.total, 3);
        assert!(!report.all_passed());
        assert_eq!(report.categories.len(), 2);
        assert_eq!(report.categories[0].passed, 1);
        assert_eq!(report.categories[0].total, 2);
    }
}
