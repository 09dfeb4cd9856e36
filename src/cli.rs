//! Command-line surface over [`crate::AppContext`].
//!
//! - `import` - merge a CSV upload into a table
//! - `register` - submit one record as `column=value` pairs
//! - `replace` - rewrite a table from a CSV file
//! - `list` - print the stored rows of a table
//! - `adherence` - planned-vs-executed scores for audits
//! - `login` - store the Sheets access token in the OS keyring
//! - `health` - show the effective configuration

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use secrecy::SecretString;

use crate::audit;
use crate::config::{AppConfig, BackendKind};
use crate::ingestion;
use crate::records::{AuditRecord, RawRow, Record, TableKind};
use crate::secrets::{SecretVault, SHEETS_TOKEN_ALIAS, VAULT_SERVICE_NAME};
use crate::sync::{SyncOutcome, SyncSummary};
use crate::{init_tracing, AppContext};

#[derive(Debug, Parser)]
#[command(name = "geotec-ledger")]
#[command(author, version, about = "Idempotent record sync for the geotechnology ledger", long_about = None)]
pub struct Cli {
    /// Storage backend; overrides GEOTEC_BACKEND.
    #[arg(long, global = true)]
    pub backend: Option<String>,

    /// Data directory; overrides GEOTEC_DATA_DIR.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Merge a CSV upload into a table, skipping rows already stored.
    Import(ImportArgs),
    /// Submit one record given as column=value pairs.
    Register(RegisterArgs),
    /// Replace every row of a table with the contents of a CSV file.
    Replace(ReplaceArgs),
    /// Print the rows stored in a table.
    List(TableArg),
    /// Planned-vs-executed adherence over all stored audits.
    Adherence(AdherenceArgs),
    /// Store the Sheets access token in the OS keyring.
    Login(LoginArgs),
    /// Show the effective configuration and storage locations.
    Health,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Args)]
pub struct TableArg {
    /// tasks, extra_activities, audits or post_application
    #[arg(long, short = 't')]
    pub table: String,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[command(flatten)]
    pub table: TableArg,

    pub file: PathBuf,

    /// Keep only these operations (post-application uploads). Repeatable.
    #[arg(long = "operation")]
    pub operations: Vec<String>,

    /// Print the operations found in the file and exit without writing.
    #[arg(long, conflicts_with = "operations")]
    pub list_operations: bool,
}

#[derive(Debug, Args)]
pub struct RegisterArgs {
    #[command(flatten)]
    pub table: TableArg,

    /// column=value; column names and their spreadsheet synonyms are accepted.
    #[arg(required = true)]
    pub fields: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ReplaceArgs {
    #[command(flatten)]
    pub table: TableArg,

    pub file: PathBuf,
}

#[derive(Debug, Args)]
pub struct AdherenceArgs {
    /// Also print every audit with its per-item scores.
    #[arg(long)]
    pub per_audit: bool,
}

#[derive(Debug, Args)]
pub struct LoginArgs {
    /// Token value; read from stdin when omitted.
    #[arg(long)]
    pub token: Option<String>,
}

pub fn run() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    if let Some(backend) = &cli.backend {
        config.backend = BackendKind::parse(backend)?;
    }
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }

    if let Command::Login(args) = &cli.command {
        return login(args);
    }

    let context = AppContext::initialize(config).context("failed to initialize")?;
    let result = execute(&context, &cli);
    if let Err(err) = context.flush() {
        tracing::warn!(?err, "failed to flush status journal");
    }
    result
}

fn execute(context: &AppContext, cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Import(args) => {
            let table = TableKind::parse(&args.table.table)?;
            let bytes = std::fs::read(&args.file)
                .with_context(|| format!("failed to read {}", args.file.display()))?;
            if args.list_operations {
                let batch = ingestion::parse_upload(table, &bytes)?;
                return print_operations(&batch.operations(), cli.format);
            }
            let operations = (!args.operations.is_empty()).then_some(args.operations.as_slice());
            let summary = context.sync().import_upload(table, &bytes, operations);
            report(&summary, cli.format)
        }
        Command::Register(args) => {
            let table = TableKind::parse(&args.table.table)?;
            let raw = parse_fields(table, &args.fields)?;
            let record = Record::from_raw(table, &raw)?;
            report(&context.sync().register(record), cli.format)
        }
        Command::Replace(args) => {
            let table = TableKind::parse(&args.table.table)?;
            let bytes = std::fs::read(&args.file)
                .with_context(|| format!("failed to read {}", args.file.display()))?;
            let batch = ingestion::parse_upload(table, &bytes)?;
            report(&context.sync().replace_table(table, batch.records), cli.format)
        }
        Command::List(args) => {
            let table = TableKind::parse(&args.table)?;
            let Some(records) = context.sync().load_table(table) else {
                bail!("could not read {table}");
            };
            print_records(table, &records, cli.format)
        }
        Command::Adherence(args) => {
            let Some(records) = context.sync().load_table(TableKind::Audits) else {
                bail!("could not read {}", TableKind::Audits);
            };
            let audits: Vec<_> = records
                .into_iter()
                .filter_map(|record| match record {
                    Record::Audit(audit) => Some(audit),
                    _ => None,
                })
                .collect();
            print_adherence(&audits, args.per_audit, cli.format)
        }
        Command::Health => {
            let health = context.health()?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&health)?),
                OutputFormat::Text => {
                    println!("backend:         {}", health.backend);
                    println!("data dir:        {}", health.config.data_dir);
                    if let Some(path) = &health.database_path {
                        println!("database:        {path}");
                    }
                    println!("settings:        {}", health.settings_path);
                    if let Some(path) = &health.status_journal_path {
                        println!("status journal:  {path}");
                    }
                    println!(
                        "sheets token:    {}",
                        if health.config.has_sheets_access_token || health.has_stored_sheets_token {
                            "available"
                        } else {
                            "missing"
                        }
                    );
                }
            }
            Ok(())
        }
        Command::Login(args) => login(args),
    }
}

fn login(args: &LoginArgs) -> Result<()> {
    let token = match &args.token {
        Some(token) => token.clone(),
        None => {
            let mut line = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .context("failed to read token from stdin")?;
            line
        }
    };
    let vault = SecretVault::new(VAULT_SERVICE_NAME);
    vault.write_secret(SHEETS_TOKEN_ALIAS, &SecretString::from(token.trim().to_string()))?;
    println!("Sheets access token stored");
    Ok(())
}

/// Maps `column=value` arguments onto canonical column names.
fn parse_fields(table: TableKind, fields: &[String]) -> Result<RawRow> {
    let mut raw = RawRow::new();
    for field in fields {
        let Some((name, value)) = field.split_once('=') else {
            bail!("expected column=value, got {field:?}");
        };
        let Some(column) = table.resolve_header(name) else {
            bail!(
                "{table} has no column {name:?}; expected one of: {}",
                table.column_names().join(", ")
            );
        };
        raw.insert(column.to_string(), value.to_string());
    }
    Ok(raw)
}

fn report(summary: &SyncSummary, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(summary)?),
        OutputFormat::Text => println!(
            "{}: {} incoming, {} appended, {} duplicate(s), {} without a key",
            summary.table, summary.incoming, summary.appended, summary.duplicates, summary.unkeyed
        ),
    }
    match summary.outcome {
        SyncOutcome::Completed => Ok(()),
        SyncOutcome::Aborted => bail!("{} sync aborted after {} row(s)", summary.table, summary.appended),
        SyncOutcome::Rejected => bail!("{} input rejected", summary.table),
    }
}

fn print_adherence(audits: &[AuditRecord], per_audit: bool, format: OutputFormat) -> Result<()> {
    let summary = audit::summarize(audits);
    match format {
        OutputFormat::Json => {
            let detail: Vec<_> = if per_audit {
                audits
                    .iter()
                    .map(|audit| {
                        serde_json::json!({
                            "date": audit.date,
                            "unit": audit.unit,
                            "sector": audit.sector,
                            "adherence": audit.adherence(),
                            "items": audit.item_adherence(),
                        })
                    })
                    .collect()
            } else {
                Vec::new()
            };
            let body = serde_json::json!({ "summary": summary, "audits": detail });
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        OutputFormat::Text => {
            if per_audit {
                for audit in audits {
                    println!(
                        "{} {} sector {}: {}",
                        audit.date,
                        audit.unit,
                        audit.sector,
                        percent(audit.adherence())
                    );
                    for item in audit.item_adherence() {
                        println!(
                            "  {:<20} {:>10} / {:<10} {:>7}",
                            item.item,
                            item.planned,
                            item.executed,
                            percent(item.percent)
                        );
                    }
                }
                println!();
            }
            println!("{} audit(s)", summary.audits);
            for (item, percent) in &summary.per_item {
                println!("  {item:<20} {percent:>6.1}%");
            }
            match summary.overall {
                Some(overall) => println!("  {:<20} {overall:>6.1}%", "overall"),
                None => println!("  no audits recorded"),
            }
        }
    }
    Ok(())
}

fn percent(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{value:.1}%"),
        None => "-".to_string(),
    }
}

fn print_operations(operations: &[String], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(operations)?),
        OutputFormat::Text => {
            for operation in operations {
                println!("{operation}");
            }
        }
    }
    Ok(())
}

fn print_records(table: TableKind, records: &[Record], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(records)?),
        OutputFormat::Text => {
            println!("{}", table.column_names().join("\t"));
            for record in records {
                println!("{}", record.to_cells().join("\t"));
            }
        }
    }
    Ok(())
}
