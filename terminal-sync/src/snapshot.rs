//! REST snapshot source
//!
//! Fetches the full state of one topic's entity out of band, used on first
//! acquisition and whenever the sequencer asks for a resync.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use terminal_core::{fields_from_json, FieldMap, TopicKey};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Full entity state as served by the snapshot endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    pub topic: TopicKey,
    pub seq: u64,
    pub fields: FieldMap,
    pub timestamp: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("Snapshot request failed: {0}")]
    Network(String),

    #[error("No snapshot for {0}")]
    NotFound(String),

    #[error("Snapshot endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid snapshot: {0}")]
    Parse(String),
}

/// Source of out-of-band entity snapshots
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, topic: &TopicKey) -> Result<EntitySnapshot, SnapshotError>;
}

#[derive(Debug, Deserialize)]
struct SnapshotBody {
    seq: u64,
    fields: serde_json::Value,
    /// Epoch milliseconds
    #[serde(default)]
    timestamp: Option<i64>,
}

/// `GET {base}/{kind}/{id}` snapshot client
#[derive(Debug, Clone)]
pub struct RestSnapshotClient {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl RestSnapshotClient {
    pub fn new(base_url: Url, api_key: Option<String>) -> Result<Self, SnapshotError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SnapshotError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    /// Resource URL for a topic
    pub fn url_for(&self, topic: &TopicKey) -> Result<Url, SnapshotError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SnapshotError::Parse(format!("Cannot use {} as a base URL", self.base_url)))?
            .pop_if_empty()
            .push(topic.kind.as_str())
            .push(&topic.id);
        Ok(url)
    }
}

#[async_trait]
impl SnapshotSource for RestSnapshotClient {
    async fn fetch(&self, topic: &TopicKey) -> Result<EntitySnapshot, SnapshotError> {
        let url = self.url_for(topic)?;
        debug!("[Sync REST] Fetching snapshot {}", url);

        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SnapshotError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SnapshotError::NotFound(topic.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SnapshotError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| SnapshotError::Network(e.to_string()))?;
        parse_snapshot(topic, &body)
    }
}

/// Decode a snapshot response body
pub fn parse_snapshot(topic: &TopicKey, body: &str) -> Result<EntitySnapshot, SnapshotError> {
    let raw: SnapshotBody =
        serde_json::from_str(body).map_err(|e| SnapshotError::Parse(e.to_string()))?;
    let fields = fields_from_json(&raw.fields)
        .ok_or_else(|| SnapshotError::Parse("fields must be an object".to_string()))?;
    let timestamp = raw
        .timestamp
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    Ok(EntitySnapshot {
        topic: topic.clone(),
        seq: raw.seq,
        fields,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use terminal_core::FieldValue;

    fn topic() -> TopicKey {
        "deal:T 1".parse().unwrap()
    }

    #[test]
    fn test_url_for_escapes_id() {
        let client =
            RestSnapshotClient::new(Url::parse("http://localhost:9400/snapshots/").unwrap(), None).unwrap();
        assert_eq!(
            client.url_for(&topic()).unwrap().as_str(),
            "http://localhost:9400/snapshots/deal/T%201"
        );
    }

    #[test]
    fn test_parse_snapshot_body() {
        let snapshot = parse_snapshot(
            &topic(),
            r#"{"seq":42,"fields":{"quantity":100,"side":"buy"},"timestamp":1700000000000}"#,
        )
        .unwrap();

        assert_eq!(snapshot.seq, 42);
        assert_eq!(snapshot.fields["quantity"], FieldValue::Number(dec!(100)));
        assert_eq!(snapshot.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_parse_snapshot_rejects_non_object_fields() {
        assert!(matches!(
            parse_snapshot(&topic(), r#"{"seq":1,"fields":[1]}"#),
            Err(SnapshotError::Parse(_))
        ));
        assert!(parse_snapshot(&topic(), "not json").is_err());
    }
}
