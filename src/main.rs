//! unidb - Main entry point.
//!
//! Runs one query, statement or schema listing against a database and prints
//! the result.

use std::time::Instant;

use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use unidb::config::{Command, Config, OutputFormat, parse_bind_param};
use unidb::db::ConnectionHandle;
use unidb::error::DbResult;
use unidb::format::{format_result, listing, to_pretty_json};
use unidb::models::{DefaultValue, ExecuteOutcome, HostValue};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn text(value: impl Into<String>) -> HostValue {
    HostValue::Text(value.into())
}

/// Print a descriptor list: JSON as is, otherwise as a table.
fn print_listing<T: serde::Serialize>(
    format: OutputFormat,
    items: &[T],
    headers: &[&str],
    row: impl Fn(&T) -> Vec<HostValue>,
    started: Instant,
) -> DbResult<()> {
    let out = match format {
        OutputFormat::Json => to_pretty_json(items)?,
        other => {
            let table = listing(headers, items.iter().map(row).collect());
            format_result(&table, other, started.elapsed())?
        }
    };
    println!("{}", out);
    Ok(())
}

async fn run(config: &Config) -> DbResult<bool> {
    let settings = config.connection_settings()?;
    let handle = ConnectionHandle::open(settings).await?;
    let started = Instant::now();
    let format = config.format;

    let ok = match &config.command {
        Command::Query {
            sql,
            params,
            max_rows,
        } => {
            let binds = params
                .iter()
                .map(|p| parse_bind_param(p))
                .collect::<DbResult<Vec<_>>>()?;
            let table = handle.execute_query(sql, &binds, *max_rows).await?;
            println!("{}", format_result(&table, format, started.elapsed())?);
            true
        }
        Command::Execute { sql } => {
            match handle.execute(sql).await? {
                ExecuteOutcome::Table(table) => {
                    println!("{}", format_result(&table, format, started.elapsed())?);
                }
                ExecuteOutcome::RowsAffected { rows_affected } => match format {
                    OutputFormat::Json => println!(
                        "{}",
                        to_pretty_json(&serde_json::json!({ "rows_affected": rows_affected }))?
                    ),
                    _ => println!(
                        "Query OK, {} rows affected ({:.2} sec)",
                        rows_affected,
                        started.elapsed().as_secs_f64()
                    ),
                },
            }
            true
        }
        Command::Tables { schema } => {
            let tables = handle.introspector().tables(schema.as_deref()).await?;
            print_listing(
                format,
                &tables,
                &["name", "schema", "type"],
                |t| {
                    vec![
                        text(&t.name),
                        t.schema.clone().into(),
                        text(t.table_type.to_string()),
                    ]
                },
                started,
            )?;
            true
        }
        Command::Columns { table } => {
            let columns = handle.introspector().columns(table).await?;
            print_listing(
                format,
                &columns,
                &["name", "type", "nullable", "default", "primary_key"],
                |c| {
                    let default = match &c.default_value {
                        None => HostValue::Null,
                        Some(DefaultValue::Value(v)) => v.clone(),
                        Some(DefaultValue::Expression(e)) => text(e),
                    };
                    vec![
                        text(&c.name),
                        text(&c.data_type),
                        HostValue::Bool(c.nullable),
                        default,
                        HostValue::Bool(c.is_primary_key),
                    ]
                },
                started,
            )?;
            true
        }
        Command::Indexes { table } => {
            let indexes = handle.introspector().indexes(table).await?;
            print_listing(
                format,
                &indexes,
                &["name", "columns", "unique", "primary"],
                |i| {
                    vec![
                        text(&i.name),
                        text(i.columns.join(", ")),
                        HostValue::Bool(i.is_unique),
                        HostValue::Bool(i.is_primary),
                    ]
                },
                started,
            )?;
            true
        }
        Command::ForeignKeys { table } => {
            let keys = handle.introspector().foreign_keys(table).await?;
            print_listing(
                format,
                &keys,
                &["name", "column", "references", "on_delete", "on_update"],
                |k| {
                    vec![
                        k.name.clone().into(),
                        text(&k.column),
                        text(format!("{}({})", k.references_table, k.references_column)),
                        text(k.on_delete.to_string()),
                        text(k.on_update.to_string()),
                    ]
                },
                started,
            )?;
            true
        }
        Command::PrimaryKeys { table } => {
            let keys = handle.introspector().primary_keys(table).await?;
            print_listing(
                format,
                &keys,
                &["column", "key_sequence", "constraint"],
                |k| {
                    vec![
                        text(&k.column),
                        HostValue::from(k.key_sequence as i64),
                        k.constraint_name.clone().into(),
                    ]
                },
                started,
            )?;
            true
        }
        Command::Ping => {
            let alive = handle.is_active().await;
            let version = handle.server_version().await;
            match format {
                OutputFormat::Json => println!(
                    "{}",
                    to_pretty_json(&serde_json::json!({ "alive": alive, "server_version": version }))?
                ),
                _ => println!(
                    "{} ({})",
                    if alive { "alive" } else { "not alive" },
                    version.as_deref().unwrap_or("unknown version")
                ),
            }
            alive
        }
    };

    handle.disconnect().await;
    Ok(ok)
}

#[tokio::main]
async fn main() {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    info!("Starting unidb v{}", env!("CARGO_PKG_VERSION"));

    match run(&config).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {}", e);
            if let Some(suggestion) = e.suggestion() {
                eprintln!("Hint: {}", suggestion);
            }
            std::process::exit(1);
        }
    }
}
