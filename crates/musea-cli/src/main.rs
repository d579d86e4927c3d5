use anyhow::Result;
use clap::Parser;
use musea_reconcile::{ConfigError, ReconcileConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "musea-dedup")]
#[command(about = "Deduplicate the musea table on museum_id and add a unique constraint")]
struct Cli {
    /// Fetch and deduplicate, but leave the table untouched.
    #[arg(long)]
    dry_run: bool,
    /// Table to reconcile instead of MUSEA_TABLE / musea.
    #[arg(long)]
    table: Option<String>,
    /// Key field instead of MUSEA_KEY_FIELD / museum_id.
    #[arg(long)]
    key_field: Option<String>,
}

impl Cli {
    /// Resolve the full config before any store exists; flags win over variables.
    fn load_config<F>(self, lookup: F) -> Result<ReconcileConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        ReconcileConfig::from_lookup(lookup).map(|config| self.apply(config))
    }

    fn apply(self, mut config: ReconcileConfig) -> ReconcileConfig {
        if let Some(table) = self.table {
            config = config.with_table(table);
        }
        if let Some(key_field) = self.key_field {
            config = config.with_key_field(key_field);
        }
        config.with_dry_run(self.dry_run)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = cli
        .load_config(|name| std::env::var(name).ok())
        .unwrap_or_else(|e| {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        });

    tracing::info!(
        supabase_url = %config.supabase_url,
        table = %config.table,
        key_field = %config.key_field,
        dry_run = config.dry_run,
        "starting reconciliation"
    );

    let summary = musea_reconcile::reconcile_once(config).await?;
    println!(
        "dedup complete: run_id={} table={} fetched={} kept={} removed={} dry_run={} constraint={}",
        summary.run_id,
        summary.table,
        summary.fetched,
        summary.kept,
        summary.removed,
        summary.dry_run,
        summary.constraint
    );

    Ok(())
}
