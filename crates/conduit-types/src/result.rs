//! Uniform envelope for results handed back to embedders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Success-or-error envelope with a timestamp, serialized for callers that
/// dispatch operations by name rather than through the typed API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ToolResult<T> {
    /// Wrap a successful payload.
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Wrap an error message.
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            timestamp: Utc::now(),
        }
    }
}

impl<T, E: std::fmt::Display> From<Result<T, E>> for ToolResult<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::err(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_round_trip() {
        let ok: ToolResult<u32> = ToolResult::ok(7);
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"], 7);
        assert!(json.get("error").is_none());

        let err: ToolResult<u32> = ToolResult::err("boom");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "boom");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn from_result_maps_both_arms() {
        let ok: ToolResult<&str> = Ok::<_, std::io::Error>("fine").into();
        assert!(ok.success);
        let err: ToolResult<&str> = Err::<&str, _>(std::io::Error::other("nope")).into();
        assert_eq!(err.error.as_deref(), Some("nope"));
    }
}
