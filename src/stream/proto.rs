use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorizationMsg {
    pub host: String,
    #[serde(rename = "Authorization")]
    pub authorization: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtensionsMsg {
    pub authorization: AuthorizationMsg,
}

/// Payload of a `start` frame. `data` is the query document JSON-encoded as
/// a string, not a nested object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartPayload {
    pub data: String,
    pub extensions: ExtensionsMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryMsg {
    pub query: String,
    pub variables: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Start { id: String, payload: StartPayload },
    Stop { id: String },
}

impl ClientFrame {
    /// Builds a `start` frame for `query` authorized with `api_key` on `host`.
    pub fn start(
        id: impl Into<String>,
        query: &str,
        variables: Option<Value>,
        host: &str,
        api_key: &str,
    ) -> Result<Self, serde_json::Error> {
        let data = serde_json::to_string(&QueryMsg {
            query: query.to_string(),
            variables,
        })?;
        Ok(ClientFrame::Start {
            id: id.into(),
            payload: StartPayload {
                data,
                extensions: ExtensionsMsg {
                    authorization: AuthorizationMsg {
                        host: host.to_string(),
                        authorization: api_key.to_string(),
                    },
                },
            },
        })
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl StartPayload {
    /// Decodes the embedded query document.
    pub fn query(&self) -> Result<QueryMsg, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

/// Frame kinds the realtime service sends. Unknown kinds are server-push
/// payload types and are routed like `data`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Start,
    StartAck,
    Data,
    Error,
    Complete,
    #[serde(rename = "ka")]
    KeepAlive,
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ServerFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Returns `payload.data`, or `null` when the frame carries none.
    pub fn data(&self) -> Value {
        self.payload
            .as_ref()
            .and_then(|payload| payload.get("data"))
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Returns the error details of an `error` frame.
    ///
    /// Prefers `payload.errors`; falls back to the whole payload, which is
    /// how some servers report a bare error array.
    pub fn errors(&self) -> Value {
        match self.payload.as_ref() {
            Some(payload) => payload
                .get("errors")
                .cloned()
                .unwrap_or_else(|| payload.clone()),
            None => Value::Null,
        }
    }
}
