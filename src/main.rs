use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use grammarsql::config::AppConfig;
use grammarsql::evals::{self, EvalCategory};
use grammarsql::grammar::GrammarCatalog;
use grammarsql::logging::init_logging;
use grammarsql::normalizer::SafetyNormalizer;
use grammarsql::pipeline::{load_grammar, Pipeline};
use grammarsql::validator::GrammarValidator;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "grammarsql")]
#[command(about = "Natural-language questions to grammar-checked, read-only ClickHouse SQL")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a query for the question, check it and run it
    Ask {
        /// The question in natural language
        question: String,
    },

    /// Check a query against the grammar and print its normalized form
    Validate {
        sql: String,
    },

    /// Load a grammar and print a summary of it
    Grammar {
        /// Grammar file (default: GRAMMAR_PATH or grammar/clickhouse_sql.lark)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },

    /// Run the evaluation suite against the configured backends
    Evals {
        /// Only run one category, e.g. "grammar-compliance"
        #[arg(short, long)]
        category: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    dotenv::dotenv().ok();
    let config = AppConfig::from_env()?;
    init_logging(&config.log_level)?;

    match args.command {
        Command::Ask { question } => ask(&config, &question).await,
        Command::Validate { sql } => validate(&config, &sql),
        Command::Grammar { path } => grammar(&config, path),
        Command::Evals { category } => run_evals(&config, category).await,
    }
}

async fn ask(config: &AppConfig, question: &str) -> Result<()> {
    let pipeline = Pipeline::from_config(config)?;

    match pipeline.generate_and_run(question).await {
        Ok(outcome) => {
            println!("\n=== Generated SQL ({:?}) ===", outcome.mode);
            println!("{}", outcome.generated_query);
            println!("\n=== Results ({} rows) ===", outcome.result.row_count);
            println!("{}", serde_json::to_string_pretty(&outcome.result.rows)?);
            Ok(())
        }
        Err(failure) => {
            if let Some(sql) = &failure.generated_query {
                println!("\n=== Generated SQL ===");
                println!("{}", sql);
            }
            error!("Failed in state {} ({})", failure.state, failure.kind());
            Err(failure.into())
        }
    }
}

fn validate(config: &AppConfig, sql: &str) -> Result<()> {
    let validator = GrammarValidator::earley(Arc::new(load_grammar(config)?));
    validator.check(sql)?;
    let normalized = SafetyNormalizer::default().normalize(sql)?;

    println!("valid");
    println!("{}", normalized);
    Ok(())
}

fn grammar(config: &AppConfig, path: Option<PathBuf>) -> Result<()> {
    let path = path.unwrap_or_else(|| config.grammar_path.clone());
    let catalog = GrammarCatalog::load(&path, &config.grammar_root)
        .with_context(|| format!("loading grammar {}", path.display()))?;
    let grammar = catalog.get();

    println!("Grammar: {}", path.display());
    println!("  root:        {}", grammar.root_name());
    println!("  rules:       {}", grammar.rule_count());
    println!("  productions: {}", grammar.production_count());
    println!("  terminals:   {}", grammar.terminal_count());
    Ok(())
}

async fn run_evals(config: &AppConfig, category: Option<String>) -> Result<()> {
    let category = category
        .map(|c| c.parse::<EvalCategory>())
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let pipeline = Pipeline::from_config(config)?;

    info!("Running evals{}", category.map(|c| format!(" for {}", c)).unwrap_or_default());
    let report = evals::run_evals(&pipeline, category).await;

    for case in &report.cases {
        let marker = if case.passed { "PASS" } else { "FAIL" };
        println!("[{}] {} / {}", marker, case.category, case.name);
        for failure in &case.failures {
            println!("       {}", failure);
        }
    }
    println!();
    for summary in &report.categories {
        println!("{}: {}/{}", summary.category, summary.passed, summary.total);
    }
    println!("Overall: {}/{}", report.passed, report.total);

    if report.all_passed() {
        Ok(())
    } else {
        anyhow::bail!("{} of {} evals failed", report.total - report.passed, report.total)
    }
}
