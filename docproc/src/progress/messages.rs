//! Real-time notification protocol.
//!
//! Messages are JSON objects tagged by `type`:
//!
//! - client: `subscribe`, `unsubscribe`, `ping`, `pong`
//! - server: `subscription_confirmed`, `progress_update`, `channel_message`,
//!   `ping`, `pong`, `error`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::snapshot::ProgressSnapshot;

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Subscribe {
        #[serde(default)]
        job_ids: Vec<String>,
        #[serde(default)]
        channels: Vec<String>,
        #[serde(default)]
        user_id: Option<String>,
    },
    Unsubscribe {
        #[serde(default)]
        job_ids: Vec<String>,
        #[serde(default)]
        channels: Vec<String>,
    },
    Ping,
    Pong,
}

/// Messages pushed to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    SubscriptionConfirmed {
        connection_id: String,
        job_ids: Vec<String>,
        channels: Vec<String>,
    },
    ProgressUpdate {
        job_id: String,
        data: ProgressSnapshot,
    },
    ChannelMessage {
        channel: String,
        message_type: String,
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    Ping {
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: Utc::now(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscribe() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","jobIds":["a","b"],"channels":["notifications"]}"#)
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                job_ids: vec!["a".into(), "b".into()],
                channels: vec!["notifications".into()],
                user_id: None,
            }
        );
    }

    #[test]
    fn test_parse_ping_and_defaults() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"subscribe"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { job_ids, .. } if job_ids.is_empty()));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn test_progress_update_shape() {
        let msg = ServerMessage::ProgressUpdate {
            job_id: "job-1".into(),
            data: ProgressSnapshot::initial("job-1", 6),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "progress_update");
        assert_eq!(json["jobId"], "job-1");
        assert_eq!(json["data"]["totalSteps"], 6);

        let pong = serde_json::to_value(ServerMessage::pong()).unwrap();
        assert_eq!(pong["type"], "pong");
    }
}
