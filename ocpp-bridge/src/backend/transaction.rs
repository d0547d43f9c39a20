//! Transaction lookup against the backend HTTP API
//!
//! `GET {base_url}/api/transaction/tag/{tag}/` answers
//! `{"status": true, "data": {"id": 123, ...}}` for the transaction the backend
//! opened for an id tag.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Default timeout for a lookup request
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the transaction lookup
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("No transaction for tag {0}")]
    NotFound(String),

    #[error("Invalid base url: {0}")]
    InvalidBaseUrl(String),
}

/// Transaction record as stored by the backend.
///
/// The backend serializes decimals as strings (`"100.00"`); `limit` and
/// `amount` keep that text and also accept a bare number.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TransactionRecord {
    pub id: i32,
    pub conn: i32,
    pub status: String,
    #[serde(deserialize_with = "decimal_text")]
    pub limit: String,
    #[serde(deserialize_with = "decimal_text")]
    pub amount: String,
    pub tag: String,
    pub meter_start: i32,
    pub meter_stop: i32,
    #[serde(deserialize_with = "lenient_f64")]
    pub meter_consumed: f64,
    pub soc: i32,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

fn decimal_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected decimal, got {}", other))),
    }
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(0.0),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom(format!("decimal out of range: {}", n))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("expected decimal, got {:?}", s))),
        other => Err(serde::de::Error::custom(format!("expected decimal, got {}", other))),
    }
}

#[derive(Debug, Deserialize)]
struct TransactionEnvelope {
    #[serde(default)]
    status: bool,
    #[serde(default)]
    data: Option<TransactionRecord>,
}

/// Resolves the backend transaction opened for an id tag
#[async_trait]
pub trait TransactionLookup: Send + Sync {
    async fn lookup_by_tag(&self, tag: &str) -> Result<TransactionRecord, TransactionError>;
}

/// [`TransactionLookup`] over the backend HTTP API
pub struct HttpTransactionClient {
    client: reqwest::Client,
    base_url: Url,
}

impl From<reqwest::Error> for TransactionError {
    fn from(e: reqwest::Error) -> Self {
        TransactionError::Transport(e.to_string())
    }
}

impl HttpTransactionClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransactionError> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| TransactionError::InvalidBaseUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(TransactionError::InvalidBaseUrl(base_url.to_string()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self { client, base_url })
    }

    /// `{base}/api/transaction/tag/{tag}/` with the tag percent-encoded as one segment
    fn tag_url(&self, tag: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["api", "transaction", "tag", tag, ""]);
        }
        url
    }
}

#[async_trait]
impl TransactionLookup for HttpTransactionClient {
    async fn lookup_by_tag(&self, tag: &str) -> Result<TransactionRecord, TransactionError> {
        let url = self.tag_url(tag);
        debug!("Looking up transaction: {}", url);

        let resp = self.client.get(url).send().await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(TransactionError::NotFound(tag.to_string()));
        }
        if !resp.status().is_success() {
            return Err(TransactionError::Transport(format!(
                "Transaction lookup failed: {}",
                resp.status()
            )));
        }

        let body = resp.text().await?;
        let envelope: TransactionEnvelope = serde_json::from_str(&body).map_err(|e| {
            debug!("Undecodable transaction body: {}", body);
            e
        })?;
        match envelope.data {
            Some(record) if envelope.status && record.id != 0 => Ok(record),
            _ => Err(TransactionError::NotFound(tag.to_string())),
        }
    }
}
