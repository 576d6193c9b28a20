//! Frames exchanged over an action WebSocket.

use serde::{Deserialize, Serialize};

use crate::commit::CommitBundle;
use crate::event::EventMessage;

/// Client to daycare. The first frame must carry the commit bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaycareRequest {
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_bundle: Option<CommitBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

/// Daycare to client. Exactly one field is set per frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaycareResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_bundle: Option<CommitBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<EventMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaycareRequest {
    pub fn with_bundle(bundle: CommitBundle) -> Self {
        Self {
            commit_bundle: Some(bundle),
            ..Default::default()
        }
    }
}

impl DaycareResponse {
    pub fn event(event: EventMessage) -> Self {
        Self {
            event: Some(event),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn bundle(bundle: CommitBundle) -> Self {
        Self {
            commit_bundle: Some(bundle),
            ..Default::default()
        }
    }
}
