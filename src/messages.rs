//! Outbound wire messages sent to the rtcstats collector.
//!
//! Every message is a JSON object with a `type` tag. Stats entries carry
//! their payload as a JSON-encoded string in `data`; identity messages carry
//! a plain object.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::registry::SessionState;

/// Identity payload: the full current roster plus session metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityData {
    pub conf_name: String,
    pub display_name: String,
    pub meeting_unique_id: String,
    pub application_name: String,
    pub endpoints: Vec<String>,
}

impl From<&SessionState> for IdentityData {
    fn from(state: &SessionState) -> Self {
        Self {
            conf_name: state.conf_name.clone(),
            display_name: state.display_name.clone(),
            meeting_unique_id: state.meeting_unique_id.clone(),
            application_name: state.application_name.to_string(),
            endpoints: state.known_endpoints().iter().cloned().collect(),
        }
    }
}

/// A message on the collector link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "identity")]
    Identity {
        #[serde(rename = "statsSessionId")]
        stats_session_id: String,
        data: IdentityData,
    },
    #[serde(rename = "close")]
    Close {
        #[serde(rename = "statsSessionId")]
        stats_session_id: String,
    },
    #[serde(rename = "stats-entry")]
    StatsEntry {
        #[serde(rename = "statsSessionId")]
        stats_session_id: String,
        data: String,
    },
}

impl OutboundMessage {
    pub fn identity(state: &SessionState) -> Self {
        OutboundMessage::Identity {
            stats_session_id: state.stats_session_id.clone(),
            data: IdentityData::from(state),
        }
    }

    pub fn close(stats_session_id: impl Into<String>) -> Self {
        OutboundMessage::Close {
            stats_session_id: stats_session_id.into(),
        }
    }

    /// Stats entry carrying a snapshot delta.
    pub fn stats(stats_session_id: impl Into<String>, delta: &Value) -> Self {
        OutboundMessage::StatsEntry {
            stats_session_id: stats_session_id.into(),
            data: delta.to_string(),
        }
    }

    /// Stats entry carrying buffered bridge log lines, encoded as
    /// `["logs", null, [{"text": .., "count": 1}, ..], <epoch-ms>]`.
    pub fn logs(stats_session_id: impl Into<String>, lines: &[String], now_ms: u64) -> Self {
        let entries: Vec<Value> = lines
            .iter()
            .map(|text| json!({ "text": text, "count": 1 }))
            .collect();
        OutboundMessage::StatsEntry {
            stats_session_id: stats_session_id.into(),
            data: json!(["logs", null, entries, now_ms]).to_string(),
        }
    }

    pub fn stats_session_id(&self) -> &str {
        match self {
            OutboundMessage::Identity { stats_session_id, .. }
            | OutboundMessage::Close { stats_session_id }
            | OutboundMessage::StatsEntry { stats_session_id, .. } => stats_session_id,
        }
    }

    /// Wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Identity { .. } => "identity",
            OutboundMessage::Close { .. } => "close",
            OutboundMessage::StatsEntry { .. } => "stats-entry",
        }
    }
}
