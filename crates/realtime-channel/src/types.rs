//! Public types for the realtime-channel crate.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite;

/// Well-known envelope type tags.
///
/// The registry is open-ended: servers may introduce new tags at any time
/// and they are routed exactly like these.
pub mod event_type {
    pub const CONNECTION_STATUS: &str = "connection_status";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const ERROR: &str = "error";
    pub const AGENT_ACTIVITY: &str = "agent_activity";
    pub const AGENT_ACTION: &str = "agent_action";
    pub const CREW_AGENT_START: &str = "crew_agent_start";
    pub const CREW_AGENT_PROGRESS: &str = "crew_agent_progress";
    pub const CREW_AGENT_COMPLETE: &str = "crew_agent_complete";
    pub const PROSPECT_FOUND: &str = "prospect_found";
    pub const CAMPAIGN_UPDATE: &str = "campaign_update";

    /// Filter string that matches every type.
    pub const WILDCARD: &str = "*";
}

/// The message unit exchanged over the connection in both directions.
///
/// Handed to subscribers by shared reference, so a payload is never mutated
/// between receipt and delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event category (inbound) or command (outbound).
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-dependent payload. Never interpreted by the channel.
    pub data: serde_json::Value,
    /// Sender-assigned ISO-8601 timestamp, display only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Envelope {
    /// Build an outbound envelope without a timestamp.
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: None,
        }
    }

    /// The locally generated `connection_status` envelope.
    pub fn connection_status(connected: bool) -> Self {
        Self {
            kind: event_type::CONNECTION_STATUS.to_string(),
            data: serde_json::json!({ "connected": connected }),
            timestamp: Some(
                chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            ),
        }
    }

    /// Parse one inbound frame. `type` and `data` are required.
    pub fn from_json(frame: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(frame)?)
    }

    pub(crate) fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Which envelopes a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeFilter {
    /// Only envelopes whose `type` equals this tag.
    Type(String),
    /// Every envelope.
    Any,
}

impl From<&str> for TypeFilter {
    fn from(s: &str) -> Self {
        if s == event_type::WILDCARD {
            TypeFilter::Any
        } else {
            TypeFilter::Type(s.to_string())
        }
    }
}

impl From<String> for TypeFilter {
    fn from(s: String) -> Self {
        if s == event_type::WILDCARD {
            TypeFilter::Any
        } else {
            TypeFilter::Type(s)
        }
    }
}

impl fmt::Display for TypeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeFilter::Type(t) => f.write_str(t),
            TypeFilter::Any => f.write_str(event_type::WILDCARD),
        }
    }
}

/// Status of the transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Errors returned by this crate.
///
/// Only configuration and setup paths return these to callers. Transport
/// failures are logged and surface as `connection_status` envelopes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("config error: {0}")]
    Config(String),

    #[error("connection attempt timed out")]
    Timeout,

    #[error("a process-wide realtime channel is already installed")]
    AlreadyInstalled,
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_parses_full_frame() {
        let env = Envelope::from_json(
            r#"{"type":"prospect_found","data":{"company_name":"Acme"},"timestamp":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(env.kind, "prospect_found");
        assert_eq!(env.data, serde_json::json!({"company_name": "Acme"}));
        assert_eq!(env.timestamp.as_deref(), Some("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn envelope_timestamp_is_optional() {
        let env = Envelope::from_json(r#"{"type":"campaign_update","data":{"status":"running"}}"#)
            .unwrap();
        assert_eq!(env.kind, "campaign_update");
        assert!(env.timestamp.is_none());
    }

    #[test]
    fn envelope_rejects_missing_type_or_data() {
        assert!(Envelope::from_json(r#"{"data":{}}"#).is_err());
        assert!(Envelope::from_json(r#"{"type":"x"}"#).is_err());
        assert!(Envelope::from_json("not json").is_err());
        assert!(Envelope::from_json(r#"{"type":42,"data":{}}"#).is_err());
    }

    #[test]
    fn outbound_envelope_omits_timestamp() {
        let json = Envelope::new("ping", serde_json::json!({})).to_json().unwrap();
        assert_eq!(json, r#"{"type":"ping","data":{}}"#);
    }

    #[test]
    fn connection_status_envelope_shape() {
        let env = Envelope::connection_status(true);
        assert_eq!(env.kind, event_type::CONNECTION_STATUS);
        assert_eq!(env.data, serde_json::json!({"connected": true}));
        assert!(env.timestamp.is_some());
    }

    #[test]
    fn wildcard_string_maps_to_any() {
        assert_eq!(TypeFilter::from("*"), TypeFilter::Any);
        assert_eq!(
            TypeFilter::from("pong".to_string()),
            TypeFilter::Type("pong".to_string())
        );
        assert_eq!(TypeFilter::Any.to_string(), "*");
    }
}
