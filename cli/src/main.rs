//! Vigil CLI
//!
//! Command-line front end for the query engine: check, explain, translate
//! and run KQL queries against a catalog.

#![deny(unsafe_code)]

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use engine::query::{parse_query, validate, Dataset, ExecuteOptions, QueryExecutor};
use engine::schema::{InMemorySchemaProvider, SchemaProvider};
use engine::storage::{BackingStore, ClickHouseStore, InMemoryStore};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Vigil: compile and run KQL queries.
#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Compile, explain and run KQL queries", long_about = None)]
#[command(version)]
struct Cli {
    /// Catalog file describing tables and columns (JSON)
    #[arg(short, long, env = "VIGIL_CATALOG", global = true)]
    catalog: Option<PathBuf>,

    /// Organization whose rows are visible
    #[arg(short, long, env = "VIGIL_ORG", default_value = "default", global = true)]
    org: String,

    /// Log output format: "text" or "json"
    #[arg(long, env = "VIGIL_LOG_FORMAT", default_value = "text", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a query and list every problem found
    Validate {
        /// Query text
        query: String,
    },
    /// Show the plan before and after optimization with estimated costs
    Explain {
        /// Query text
        query: String,
    },
    /// Print the parameterized SQL a query compiles to
    Sql {
        /// Query text
        query: String,
    },
    /// Suggest completions at a cursor position
    Complete {
        /// Query text
        query: String,
        /// Byte offset of the cursor (defaults to the end of the text)
        #[arg(long)]
        cursor: Option<usize>,
    },
    /// Run a query against ClickHouse
    Run {
        /// Query text
        query: String,
        /// Timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Maximum rows returned
        #[arg(long)]
        max_rows: Option<u64>,
    },
    /// Evaluate a query in memory over a JSON data file
    Eval {
        /// Query text
        query: String,
        /// JSON object mapping table names to arrays of row objects
        #[arg(short, long)]
        data: PathBuf,
        /// Evaluate the optimized plan instead of the original
        #[arg(long)]
        optimized: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format.eq_ignore_ascii_case("json"));

    let config = Config::from_env()?;
    let schema: Arc<dyn SchemaProvider> = Arc::new(load_catalog(cli.catalog.as_deref())?);

    match cli.command {
        Commands::Validate { query } => {
            let report = offline(schema, &config).validate(&query);
            print_json(&report)?;
            if !report.valid {
                std::process::exit(1);
            }
        }
        Commands::Explain { query } => {
            print_json(&offline(schema, &config).explain(&query)?)?;
        }
        Commands::Sql { query } => {
            print_json(&offline(schema, &config).compile(&query, &cli.org)?)?;
        }
        Commands::Complete { query, cursor } => {
            let cursor = cursor.unwrap_or(query.len());
            print_json(&offline(schema, &config).complete(&query, cursor))?;
        }
        Commands::Run {
            query,
            timeout_ms,
            max_rows,
        } => {
            let store = ClickHouseStore::new_shared(Arc::new(config.clickhouse_client()));
            store
                .ping()
                .await
                .with_context(|| format!("cannot reach ClickHouse at {}", config.db_url))?;
            let executor = QueryExecutor::new(schema, store, config.engine.clone());

            let mut options = ExecuteOptions::default();
            if let Some(timeout_ms) = timeout_ms {
                options = options.with_timeout_ms(timeout_ms);
            }
            if let Some(max_rows) = max_rows {
                options = options.with_max_rows(max_rows);
            }

            match executor.execute(&query, &cli.org, options).await {
                Ok(result) => print_json(&result)?,
                Err(failure) => {
                    tracing::error!(state = %failure.state, error = %failure.error, "Query failed");
                    bail!(failure);
                }
            }
        }
        Commands::Eval {
            query,
            data,
            optimized,
        } => {
            let json = std::fs::read_to_string(&data)
                .with_context(|| format!("cannot read {}", data.display()))?;
            let dataset = Dataset::from_json(&json, schema.as_ref())
                .with_context(|| format!("{} is not a JSON object of row arrays", data.display()))?;

            let mut parsed = parse_query(&query)?;
            validate(&parsed, schema.as_ref())?;
            if optimized {
                parsed = engine::query::optimize(&parsed, schema.as_ref());
            }
            let rows = dataset.evaluate(&parsed)?;
            print_json(&rows.to_json_objects())?;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Executor for commands that never reach a database.
fn offline(schema: Arc<dyn SchemaProvider>, config: &Config) -> QueryExecutor {
    let store: Arc<dyn BackingStore> = InMemoryStore::new_shared();
    QueryExecutor::new(schema, store, config.engine.clone())
}

fn load_catalog(path: Option<&Path>) -> Result<InMemorySchemaProvider> {
    let Some(path) = path else {
        tracing::warn!("No catalog given, only built-in functions are known");
        return Ok(InMemorySchemaProvider::new());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read catalog {}", path.display()))?;
    InMemorySchemaProvider::from_json(&json)
        .with_context(|| format!("invalid catalog {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "tables": [
            {
                "name": "SecurityEvent",
                "columns": [
                    {"name": "EventID", "kind": "long"},
                    {"name": "Account", "kind": "string"}
                ]
            }
        ]
    }"#;

    fn executor() -> QueryExecutor {
        let schema: Arc<dyn SchemaProvider> =
            Arc::new(InMemorySchemaProvider::from_json(CATALOG).unwrap());
        let config = Config {
            engine: engine::config::EngineConfig::default(),
            db_url: "http://localhost:8123".to_string(),
            db_name: "default".to_string(),
            db_user: None,
            db_password: None,
        };
        offline(schema, &config)
    }

    #[test]
    fn test_cli_parse() {
        let cli = Cli::try_parse_from(["vigil", "sql", "SecurityEvent | take 5"]).unwrap();
        assert_eq!(cli.org, "default");
        assert_eq!(cli.log_format, "text");
        assert!(matches!(cli.command, Commands::Sql { .. }));
    }

    #[test]
    fn test_cli_global_args() {
        let cli = Cli::try_parse_from([
            "vigil",
            "run",
            "SecurityEvent",
            "--org",
            "acme",
            "--max-rows",
            "20",
        ])
        .unwrap();
        assert_eq!(cli.org, "acme");
        match cli.command {
            Commands::Run { max_rows, timeout_ms, .. } => {
                assert_eq!(max_rows, Some(20));
                assert_eq!(timeout_ms, None);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_eval_requires_data() {
        assert!(Cli::try_parse_from(["vigil", "eval", "SecurityEvent"]).is_err());
    }

    #[test]
    fn test_offline_compile() {
        let sql = executor()
            .compile("SecurityEvent | where EventID == 4625", "acme")
            .unwrap();
        assert!(sql.sql.contains("org_id = $2"));
        assert_eq!(sql.params.len(), 2);
    }

    #[test]
    fn test_offline_validate() {
        let report = executor().validate("SecurityEvent | where Nope == 1");
        assert!(!report.valid);
        assert!(!report.diagnostics.is_empty());
    }

    #[test]
    fn test_missing_catalog_is_empty() {
        let schema = load_catalog(None).unwrap();
        assert!(schema.list_tables().is_empty());
    }
}
