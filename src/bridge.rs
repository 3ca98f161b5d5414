//! HTTP client for the bridge's stats endpoint and the document model it
//! returns.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{PushError, Result};

/// Key under which the document's capture time is injected into each
/// conference before diffing.
pub const TIMESTAMP_KEY: &str = "timestamp";

/// Connection settings for the bridge REST API.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Base URL, e.g. `http://127.0.0.1:8080`.
    pub base_url: String,
    /// Path appended to the base URL (default `stats`).
    pub stats_path: String,
    /// TCP connection timeout.
    pub connect_timeout: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl BridgeConfig {
    /// Create a config with the default path and timeouts.
    ///
    /// - stats_path: `stats`
    /// - connect_timeout: 3 s
    /// - request_timeout: 10 s
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            stats_path: "stats".to_string(),
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Full URL of the stats endpoint.
    pub fn stats_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.stats_path.trim_start_matches('/')
        )
    }
}

/// Top-level shape of the bridge stats document.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeDocument {
    /// Capture time in epoch milliseconds.
    #[serde(default)]
    pub time: Value,
    pub conferences: Map<String, Value>,
}

impl BridgeDocument {
    /// Parse a raw body. A body that is not JSON or lacks a `conferences`
    /// object is a [`PushError::Document`].
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| PushError::Document {
            detail: e.to_string(),
        })
    }

    /// Reportable conferences, in conference-id order.
    ///
    /// A conference is reportable when it has a string `name` and its
    /// `rtcstatsEnabled` flag is `true` or absent. The returned data carries
    /// the document time under [`TIMESTAMP_KEY`].
    pub fn conferences(&self) -> Vec<ConferenceSnapshot> {
        let mut out: Vec<ConferenceSnapshot> = self
            .conferences
            .iter()
            .filter_map(|(id, conf)| ConferenceSnapshot::from_value(id, conf, &self.time))
            .collect();
        out.sort_by(|a, b| a.conf_id.cmp(&b.conf_id));
        out
    }
}

/// One conference as seen in a single poll.
#[derive(Debug, Clone, PartialEq)]
pub struct ConferenceSnapshot {
    pub conf_id: String,
    pub name: String,
    pub meeting_id: Option<String>,
    /// `statsId` of each endpoint currently in the conference.
    pub endpoint_stats_ids: Vec<String>,
    /// The full conference object with the capture timestamp injected.
    pub data: Value,
}

impl ConferenceSnapshot {
    /// Build a snapshot from one entry of the `conferences` map, or `None`
    /// if the conference is unnamed or has opted out of reporting.
    pub fn from_value(conf_id: &str, conf: &Value, time: &Value) -> Option<Self> {
        let obj = conf.as_object()?;
        let name = obj.get("name").and_then(Value::as_str)?;

        match obj.get("rtcstatsEnabled") {
            None | Some(Value::Bool(true)) => {}
            Some(_) => return None,
        }

        let meeting_id = obj
            .get("meeting_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let endpoint_stats_ids = obj
            .get("endpoints")
            .and_then(Value::as_object)
            .map(|eps| {
                eps.values()
                    .filter_map(|ep| ep.get("statsId").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut data = obj.clone();
        data.insert(TIMESTAMP_KEY.to_string(), time.clone());

        Some(Self {
            conf_id: conf_id.to_string(),
            name: name.to_string(),
            meeting_id,
            endpoint_stats_ids,
            data: Value::Object(data),
        })
    }
}

/// Fetches stats documents from the bridge.
pub struct BridgeClient {
    config: BridgeConfig,
    client: reqwest::Client,
}

impl BridgeClient {
    pub fn new(config: BridgeConfig) -> Self {
        // Builder failure only happens in broken TLS environments; fall back
        // to a default client instead of aborting startup.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Fetch and parse the current stats document.
    ///
    /// # Returns
    /// - `Ok(BridgeDocument)` on a 2xx response with a well-formed body.
    /// - `Err(PushError::Fetch)` when the connection or body read fails.
    /// - `Err(PushError::Http)` when the bridge replies with a non-2xx code.
    /// - `Err(PushError::Document)` when the body has the wrong shape.
    pub async fn fetch_document(&self) -> Result<BridgeDocument> {
        let url = self.config.stats_url();
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PushError::Fetch {
                url: url.clone(),
                detail: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(PushError::Http {
                status: resp.status().as_u16(),
                url,
            });
        }

        let bytes = resp.bytes().await.map_err(|e| PushError::Fetch {
            url: url.clone(),
            detail: e.to_string(),
        })?;

        BridgeDocument::from_slice(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn stats_url_joins_without_double_slash() {
        let mut cfg = BridgeConfig::new("http://127.0.0.1:8080/");
        assert_eq!(cfg.stats_url(), "http://127.0.0.1:8080/stats");
        cfg.stats_path = "/debug".to_string();
        assert_eq!(cfg.stats_url(), "http://127.0.0.1:8080/debug");
    }

    #[test]
    fn config_defaults() {
        let cfg = BridgeConfig::new("http://jvb:8080");
        assert_eq!(cfg.stats_path, "stats");
        assert_eq!(cfg.connect_timeout, Duration::from_secs(3));
        assert_eq!(cfg.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn document_without_conferences_is_rejected() {
        let err = BridgeDocument::from_slice(br#"{"time": 1}"#).unwrap_err();
        assert!(matches!(err, PushError::Document { .. }));
    }

    #[test]
    fn non_json_body_is_rejected() {
        let err = BridgeDocument::from_slice(b"<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, PushError::Document { .. }));
    }

    #[rstest]
    #[case(json!({"name": "room"}), true)]
    #[case(json!({"name": "room", "rtcstatsEnabled": true}), true)]
    #[case(json!({"name": "room", "rtcstatsEnabled": false}), false)]
    #[case(json!({"rtcstatsEnabled": true}), false)]
    #[case(json!({"name": null}), false)]
    #[case(json!("not an object"), false)]
    fn reportable_filter(#[case] conf: Value, #[case] reportable: bool) {
        assert_eq!(
            ConferenceSnapshot::from_value("c1", &conf, &json!(1)).is_some(),
            reportable
        );
    }

    #[test]
    fn snapshot_extracts_fields_and_injects_time() {
        let conf = json!({
            "name": "room",
            "meeting_id": "9a1b-full-uuid",
            "endpoints": {
                "ep1": {"statsId": "Alice"},
                "ep2": {"statsId": "Bob"},
                "ep3": {"noStatsId": true}
            },
            "bitrate": 1200
        });
        let snap = ConferenceSnapshot::from_value("c1", &conf, &json!(1_700_000_000_000u64)).unwrap();
        assert_eq!(snap.name, "room");
        assert_eq!(snap.meeting_id.as_deref(), Some("9a1b-full-uuid"));
        let mut ids = snap.endpoint_stats_ids.clone();
        ids.sort();
        assert_eq!(ids, vec!["Alice".to_string(), "Bob".to_string()]);
        assert_eq!(snap.data["timestamp"], json!(1_700_000_000_000u64));
        assert_eq!(snap.data["bitrate"], json!(1200));
    }

    #[test]
    fn document_conferences_are_filtered_and_sorted() {
        let doc = BridgeDocument::from_slice(
            json!({
                "time": 42,
                "conferences": {
                    "z": {"name": "zed"},
                    "a": {"name": "ay"},
                    "m": {"rtcstatsEnabled": true}
                }
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap();
        let ids: Vec<String> = doc.conferences().into_iter().map(|c| c.conf_id).collect();
        assert_eq!(ids, vec!["a".to_string(), "z".to_string()]);
    }
}
