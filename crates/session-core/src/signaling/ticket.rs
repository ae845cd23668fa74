//! Login token and reconnection ticket decoding

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;

use crate::errors::{Result, SessionError};

fn decode_json(encoded: &str) -> Result<Value> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| SessionError::invalid_token(format!("not base64: {}", e)))?;
    serde_json::from_slice(&bytes).map_err(|e| SessionError::invalid_token(format!("not JSON: {}", e)))
}

/// Base64-encode a JSON value the way the server encodes tokens and tickets
pub fn encode_json(value: &Value) -> String {
    STANDARD.encode(value.to_string())
}

/// Conference login token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginToken {
    pub host: String,
    pub secure: bool,
}

impl LoginToken {
    pub fn decode(token: &str) -> Result<Self> {
        let value = decode_json(token)?;
        let host = value
            .get("host")
            .and_then(Value::as_str)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| SessionError::invalid_token("token has no host"))?
            .to_string();
        let secure = value.get("secure").and_then(Value::as_bool).unwrap_or(false);
        Ok(Self { host, secure })
    }

    pub fn url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}", scheme, self.host)
    }
}

/// Credential used to resume a conference session after a transient disconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectionTicket {
    pub raw: String,
    /// Expiry in milliseconds since the Unix epoch
    pub not_after_ms: Option<i64>,
}

impl ReconnectionTicket {
    pub fn decode(raw: &str) -> Result<Self> {
        let value = decode_json(raw)?;
        // Servers send the expiry either as a number or as a numeric string.
        let not_after_ms = match value.get("notAfter") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.parse::<i64>().ok(),
            _ => None,
        };
        Ok(Self {
            raw: raw.to_string(),
            not_after_ms,
        })
    }

    /// When to refresh, relative to `now_ms`.
    ///
    /// `None` when the ticket carries no expiry. An already expired ticket
    /// gets `fallback`.
    pub fn refresh_delay(&self, now_ms: i64, margin: Duration, fallback: Duration) -> Option<Duration> {
        let not_after = self.not_after_ms?;
        let remaining = not_after - now_ms;
        if remaining < 0 {
            return Some(fallback);
        }
        let delay = (remaining as u64).saturating_sub(margin.as_millis() as u64);
        Some(Duration::from_millis(delay))
    }
}
