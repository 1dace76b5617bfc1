#![allow(clippy::print_stdout)]

use anyhow::{Context, Result, bail};
use clap::Parser;
use grabdesk_ledger::db::LedgerDb;
use tracing::info;

const LEDGER_SCHEMA_SQL: &str = include_str!("../../migrations/0001_ledger_schema.sql");

#[derive(Parser, Debug)]
#[command(about = "Apply the grabdesk ledger schema to Postgres")]
struct Args {
    /// Postgres connection string. Falls back to `DB_URL` / `DATABASE_URL`.
    #[arg(long)]
    database_url: Option<String>,
    /// Print the schema instead of applying it.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.dry_run {
        println!("{LEDGER_SCHEMA_SQL}");
        return Ok(());
    }

    let database_url = match args.database_url {
        Some(url) => url,
        None => std::env::var("DB_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .context("DB_URL or DATABASE_URL must be set (or pass --database-url)")?,
    };
    if database_url.trim().is_empty() {
        bail!("database url is empty");
    }

    let db = LedgerDb::connect(database_url.trim()).await?;
    db.batch_execute(LEDGER_SCHEMA_SQL)
        .await
        .context("apply ledger schema")?;
    info!(migration = "0001_ledger_schema", "ledger migrations applied");
    Ok(())
}
