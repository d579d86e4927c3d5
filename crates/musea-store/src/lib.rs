//! Remote table access for musea: the capability trait, a PostgREST client, and an in-memory store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use musea_core::{Record, RecordSet};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Method, Request, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub use reqwest::Url;

pub const CRATE_NAME: &str = "musea-store";

/// Path under the project URL where the table and RPC endpoints live.
pub const REST_PATH: &str = "rest/v1";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("invalid response body from {url}: {source}")]
    InvalidBody {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status).ok(),
            Self::Request(err) => err.status(),
            _ => None,
        }
    }
}

/// What the reconciler needs from the hosted table.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(&self, table: &str, columns: &str) -> Result<RecordSet, StoreError>;

    /// Remove every row. `anchor_column` is a column all rows carry; stores that
    /// refuse filterless deletes phrase the match-all filter on it.
    async fn delete_all(&self, table: &str, anchor_column: &str) -> Result<(), StoreError>;

    async fn insert(&self, table: &str, records: &[Record]) -> Result<(), StoreError>;

    /// Call a server-side function. Returns `None` when the function has no result body.
    async fn rpc(&self, function: &str, params: &JsonValue) -> Result<Option<JsonValue>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    pub base_url: Url,
    pub service_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

/// PostgREST-style client authenticated with a service key.
#[derive(Debug)]
pub struct RestStore {
    client: reqwest::Client,
    rest_root: String,
    apikey: HeaderValue,
    bearer: HeaderValue,
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        let mut apikey = HeaderValue::from_str(&config.service_key)
            .context("service key is not a valid header value")?;
        apikey.set_sensitive(true);
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", config.service_key))
            .context("service key is not a valid header value")?;
        bearer.set_sensitive(true);

        let rest_root = format!(
            "{}/{REST_PATH}",
            config.base_url.as_str().trim_end_matches('/')
        );

        Ok(Self {
            client,
            rest_root,
            apikey,
            bearer,
        })
    }

    pub fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.rest_root, table)
    }

    pub fn rpc_url(&self, function: &str) -> String {
        format!("{}/rpc/{}", self.rest_root, function)
    }

    pub fn select_request(&self, table: &str, columns: &str) -> reqwest::Result<Request> {
        self.authorized(Method::GET, self.table_url(table))
            .query(&[("select", columns)])
            .build()
    }

    pub fn delete_all_request(&self, table: &str, anchor_column: &str) -> reqwest::Result<Request> {
        self.authorized(Method::DELETE, self.table_url(table))
            .query(&[("or", match_all_filter(anchor_column))])
            .header("Prefer", "return=minimal")
            .build()
    }

    pub fn insert_request(&self, table: &str, records: &[Record]) -> reqwest::Result<Request> {
        self.authorized(Method::POST, self.table_url(table))
            .header("Prefer", "return=minimal")
            .json(records)
            .build()
    }

    pub fn rpc_request(&self, function: &str, params: &JsonValue) -> reqwest::Result<Request> {
        self.authorized(Method::POST, self.rpc_url(function))
            .json(params)
            .build()
    }

    fn authorized(&self, method: Method, url: String) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", self.apikey.clone())
            .header(AUTHORIZATION, self.bearer.clone())
    }

    async fn execute(&self, request: Request) -> Result<reqwest::Response, StoreError> {
        let method = request.method().clone();
        let url = request.url().to_string();
        debug!(%method, %url, "sending store request");

        let resp = self.client.execute(request).await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let url = resp.url().to_string();
        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::HttpStatus {
            status: status.as_u16(),
            url,
            body,
        })
    }
}

/// PostgREST rejects filterless deletes; this `or` filter matches every row.
pub fn match_all_filter(column: &str) -> String {
    format!("({column}.is.null,{column}.not.is.null)")
}

#[async_trait]
impl RemoteStore for RestStore {
    async fn select(&self, table: &str, columns: &str) -> Result<RecordSet, StoreError> {
        let request = self.select_request(table, columns)?;
        let resp = self.execute(request).await?;
        let url = resp.url().to_string();
        let text = resp.text().await?;
        let rows: RecordSet = serde_json::from_str(&text)
            .map_err(|source| StoreError::InvalidBody { url, source })?;
        debug!(table, rows = rows.len(), "selected rows");
        Ok(rows)
    }

    async fn delete_all(&self, table: &str, anchor_column: &str) -> Result<(), StoreError> {
        let request = self.delete_all_request(table, anchor_column)?;
        self.execute(request).await?;
        Ok(())
    }

    async fn insert(&self, table: &str, records: &[Record]) -> Result<(), StoreError> {
        let request = self.insert_request(table, records)?;
        self.execute(request).await?;
        Ok(())
    }

    async fn rpc(&self, function: &str, params: &JsonValue) -> Result<Option<JsonValue>, StoreError> {
        let request = self.rpc_request(function, params)?;
        let resp = self.execute(request).await?;
        let url = resp.url().to_string();
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| StoreError::InvalidBody { url, source })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Select,
    Delete,
    Insert,
    Rpc,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Select { table: String, columns: String },
    DeleteAll { table: String },
    Insert { table: String, rows: usize },
    Rpc { function: String, params: JsonValue },
}

impl StoreCall {
    pub fn capability(&self) -> Capability {
        match self {
            Self::Select { .. } => Capability::Select,
            Self::DeleteAll { .. } => Capability::Delete,
            Self::Insert { .. } => Capability::Insert,
            Self::Rpc { .. } => Capability::Rpc,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, RecordSet>,
    calls: Vec<StoreCall>,
    failures: HashMap<Capability, String>,
}

impl MemoryState {
    fn record(&mut self, call: StoreCall) -> Result<(), StoreError> {
        let capability = call.capability();
        self.calls.push(call);
        match self.failures.get(&capability) {
            Some(message) => Err(StoreError::Backend(message.clone())),
            None => Ok(()),
        }
    }
}

/// In-process store with the same capabilities as [`RestStore`].
///
/// Clones share state, so a caller can keep a handle while the reconciler owns
/// another and inspect rows and calls afterwards.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, table: &str, rows: RecordSet) {
        let mut state = self.state.lock().await;
        state.tables.insert(table.to_string(), rows);
    }

    /// Make every later call to `capability` fail with `message`.
    pub async fn fail_on(&self, capability: Capability, message: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.failures.insert(capability, message.into());
    }

    pub async fn rows(&self, table: &str) -> RecordSet {
        let state = self.state.lock().await;
        state.tables.get(table).cloned().unwrap_or_default()
    }

    pub async fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().await.calls.clone()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn select(&self, table: &str, columns: &str) -> Result<RecordSet, StoreError> {
        let mut state = self.state.lock().await;
        state.record(StoreCall::Select {
            table: table.to_string(),
            columns: columns.to_string(),
        })?;
        Ok(state.tables.get(table).cloned().unwrap_or_default())
    }

    async fn delete_all(&self, table: &str, _anchor_column: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.record(StoreCall::DeleteAll {
            table: table.to_string(),
        })?;
        state.tables.remove(table);
        Ok(())
    }

    async fn insert(&self, table: &str, records: &[Record]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.record(StoreCall::Insert {
            table: table.to_string(),
            rows: records.len(),
        })?;
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(records.iter().cloned());
        Ok(())
    }

    async fn rpc(&self, function: &str, params: &JsonValue) -> Result<Option<JsonValue>, StoreError> {
        let mut state = self.state.lock().await;
        state.record(StoreCall::Rpc {
            function: function.to_string(),
            params: params.clone(),
        })?;
        Ok(None)
    }
}
