//! Connection-time authentication for the realtime service.
//!
//! The service authenticates the websocket upgrade through a base64 encoded
//! JSON header carried in the query string rather than an HTTP header.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use secrecy::{ExposeSecret, SecretString};

use crate::stream::client::RealtimeError;

/// Host the auth header is scoped to unless overridden.
pub const DEFAULT_HOST: &str = "realtime.api.defined.fi";
/// Production websocket endpoint for the realtime service.
pub const DEFAULT_WEBSOCKET_ROOT: &str = "wss://realtime.api.defined.fi/graphql/realtime";
/// Base64 of `{}`, sent as the `payload` query parameter on every connect.
pub const EMPTY_PAYLOAD: &str = "e30=";

/// API key plus the host it authorizes against.
#[derive(Clone)]
pub struct Credential {
    api_key: SecretString,
    host: String,
}

impl Credential {
    /// Creates a credential scoped to [`DEFAULT_HOST`].
    pub fn new(api_key: SecretString) -> Result<Self, RealtimeError> {
        Self::with_host(api_key, DEFAULT_HOST)
    }

    /// Creates a credential scoped to an explicit host.
    pub fn with_host(api_key: SecretString, host: impl Into<String>) -> Result<Self, RealtimeError> {
        if api_key.expose_secret().trim().is_empty() {
            return Err(RealtimeError::Configuration(
                "api key cannot be empty".to_string(),
            ));
        }
        let host = host.into();
        if host.trim().is_empty() {
            return Err(RealtimeError::Configuration(
                "host cannot be empty".to_string(),
            ));
        }
        Ok(Self { api_key, host })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn api_key(&self) -> &SecretString {
        &self.api_key
    }

    /// Encodes this credential into the `header` query parameter value.
    pub fn auth_header(&self) -> String {
        render_auth_header(self.api_key.expose_secret(), &self.host)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("api_key", &"[REDACTED]")
            .field("host", &self.host)
            .finish()
    }
}

/// Encodes an API key into the base64 auth header for `host`.
///
/// The output is deterministic: identical inputs always produce identical
/// bytes, so it can be embedded in URLs and compared directly.
pub fn encode_auth_header(api_key: &str, host: &str) -> Result<String, RealtimeError> {
    if api_key.trim().is_empty() {
        return Err(RealtimeError::Configuration(
            "api key cannot be empty".to_string(),
        ));
    }
    Ok(render_auth_header(api_key, host))
}

/// Builds the authenticated websocket URL from a root and an encoded header.
pub fn websocket_url(websocket_root: &str, auth_header: &str) -> String {
    format!("{websocket_root}?header={auth_header}&payload={EMPTY_PAYLOAD}")
}

// The service matches this exact layout, including the spacing.
fn render_auth_header(api_key: &str, host: &str) -> String {
    let json = format!(
        "{{\"host\": {}, \"Authorization\": {} }}",
        json_string(host),
        json_string(api_key)
    );
    BASE64_STANDARD.encode(json)
}

fn json_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}
