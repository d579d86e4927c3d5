//! Fetch, deduplicate and replace the musea table, then ask for a unique constraint.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use musea_core::{partition_duplicates, DEFAULT_KEY_FIELD};
use musea_store::{RemoteStore, RestStore, RestStoreConfig, Url};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "musea-reconcile";

pub const DEFAULT_TABLE: &str = "musea";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Server-side function that executes administrative SQL.
pub const EXEC_SQL_FUNCTION: &str = "exec_sql";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set (SUPABASE_URL and SUPABASE_SERVICE_KEY are required)")]
    Missing(&'static str),
    #[error("{name} is not a valid URL ({value}): {reason}")]
    InvalidUrl {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("{name} must be a positive whole number of seconds, got {value:?}")]
    InvalidTimeout { name: &'static str, value: String },
}

#[derive(Clone)]
pub struct ReconcileConfig {
    pub supabase_url: Url,
    pub service_key: String,
    pub table: String,
    pub key_field: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub dry_run: bool,
}

impl fmt::Debug for ReconcileConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcileConfig")
            .field("supabase_url", &self.supabase_url.as_str())
            .field("service_key", &"<redacted>")
            .field("table", &self.table)
            .field("key_field", &self.key_field)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("user_agent", &self.user_agent)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl ReconcileConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the config from any variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let raw_url = var("SUPABASE_URL").ok_or(ConfigError::Missing("SUPABASE_URL"))?;
        let service_key = var("SUPABASE_SERVICE_KEY")
            .or_else(|| var("SUPABASE_SERVICE_ROLE_KEY"))
            .ok_or(ConfigError::Missing("SUPABASE_SERVICE_KEY"))?;

        let supabase_url = Url::parse(raw_url.trim()).map_err(|err| ConfigError::InvalidUrl {
            name: "SUPABASE_URL",
            value: raw_url.clone(),
            reason: err.to_string(),
        })?;

        let http_timeout_secs = match var("MUSEA_HTTP_TIMEOUT_SECS") {
            Some(value) => match value.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    return Err(ConfigError::InvalidTimeout {
                        name: "MUSEA_HTTP_TIMEOUT_SECS",
                        value,
                    })
                }
            },
            None => DEFAULT_HTTP_TIMEOUT_SECS,
        };

        Ok(Self {
            supabase_url,
            service_key,
            table: var("MUSEA_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string()),
            key_field: var("MUSEA_KEY_FIELD").unwrap_or_else(|| DEFAULT_KEY_FIELD.to_string()),
            http_timeout_secs,
            user_agent: var("MUSEA_USER_AGENT")
                .unwrap_or_else(|| format!("musea-dedup/{}", env!("CARGO_PKG_VERSION"))),
            dry_run: false,
        })
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_key_field(mut self, key_field: impl Into<String>) -> Self {
        self.key_field = key_field.into();
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn options(&self) -> ReconcileOptions {
        ReconcileOptions {
            table: self.table.clone(),
            key_field: self.key_field.clone(),
            dry_run: self.dry_run,
        }
    }

    pub fn rest_store_config(&self) -> RestStoreConfig {
        RestStoreConfig {
            base_url: self.supabase_url.clone(),
            service_key: self.service_key.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub table: String,
    pub key_field: String,
    pub dry_run: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            key_field: DEFAULT_KEY_FIELD.to_string(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConstraintOutcome {
    Applied,
    Skipped { reason: String },
    NotAttempted,
}

impl fmt::Display for ConstraintOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied => f.write_str("applied"),
            Self::Skipped { .. } => f.write_str("skipped"),
            Self::NotAttempted => f.write_str("not-attempted"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub table: String,
    pub key_field: String,
    pub fetched: usize,
    pub kept: usize,
    pub removed: usize,
    pub inserted: bool,
    pub dry_run: bool,
    pub constraint: ConstraintOutcome,
}

/// `ALTER TABLE` statement adding `<table>_<key>_key UNIQUE (<key>)`.
pub fn unique_constraint_sql(table: &str, key_field: &str) -> String {
    format!(
        "ALTER TABLE IF EXISTS {} ADD CONSTRAINT {} UNIQUE ({});",
        quote_ident(table),
        quote_ident(&format!("{table}_{key_field}_key")),
        quote_ident(key_field)
    )
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub struct Reconciler {
    store: Box<dyn RemoteStore>,
    options: ReconcileOptions,
}

impl Reconciler {
    pub fn new(store: Box<dyn RemoteStore>, options: ReconcileOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    /// Fetch, dedup, delete, insert, then best-effort constrain.
    ///
    /// There is no rollback: if the insert fails after the delete went through,
    /// the table is left empty and the error is returned.
    pub async fn run(&self) -> Result<ReconcileSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "reconcile",
            %run_id,
            table = %self.options.table,
            key_field = %self.options.key_field
        );
        self.run_steps(run_id).instrument(span).await
    }

    async fn run_steps(&self, run_id: Uuid) -> Result<ReconcileSummary> {
        let started_at = Utc::now();
        let table = self.options.table.as_str();
        let key_field = self.options.key_field.as_str();

        let rows = self
            .store
            .select(table, "*")
            .await
            .with_context(|| format!("fetching rows from {table}"))?;
        let fetched = rows.len();

        let partition = partition_duplicates(rows, key_field);
        let kept = partition.kept.len();
        let removed = partition.removed();
        info!(fetched, kept, removed, "deduplicated rows");

        if self.options.dry_run {
            for duplicate in &partition.duplicates {
                debug!(key = ?duplicate.dedup_key(key_field), "would remove duplicate row");
            }
            return Ok(ReconcileSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                table: table.to_string(),
                key_field: key_field.to_string(),
                fetched,
                kept,
                removed,
                inserted: false,
                dry_run: true,
                constraint: ConstraintOutcome::NotAttempted,
            });
        }

        self.store
            .delete_all(table, key_field)
            .await
            .with_context(|| format!("deleting rows from {table}"))?;

        let inserted = if partition.kept.is_empty() {
            debug!("nothing to insert");
            false
        } else {
            if let Err(err) = self.store.insert(table, &partition.kept).await {
                warn!(lost_rows = kept, "insert failed after delete; table left empty");
                return Err(anyhow::Error::new(err)
                    .context(format!("inserting {kept} unique rows into {table}")));
            }
            true
        };

        let constraint = self.ensure_unique_constraint().await;

        Ok(ReconcileSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            table: table.to_string(),
            key_field: key_field.to_string(),
            fetched,
            kept,
            removed,
            inserted,
            dry_run: false,
            constraint,
        })
    }

    /// Never fails: a missing function, an existing constraint or a privilege
    /// error all leave the dedup result intact.
    async fn ensure_unique_constraint(&self) -> ConstraintOutcome {
        let sql = unique_constraint_sql(&self.options.table, &self.options.key_field);
        match self.store.rpc(EXEC_SQL_FUNCTION, &json!({ "sql": sql })).await {
            Ok(_) => {
                debug!("unique constraint request accepted");
                ConstraintOutcome::Applied
            }
            Err(err) => {
                debug!(error = %err, "unique constraint not added");
                ConstraintOutcome::Skipped {
                    reason: err.to_string(),
                }
            }
        }
    }
}

/// Run one reconciliation against the REST store described by `config`.
pub async fn reconcile_once(config: ReconcileConfig) -> Result<ReconcileSummary> {
    let store = RestStore::new(config.rest_store_config())?;
    let reconciler = Reconciler::new(Box::new(store), config.options());
    reconciler.run().await
}
