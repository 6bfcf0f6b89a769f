use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Lifecycle state of an outbound backend connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of an inbound client session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output format for CLI commands (`--format`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_status_display() {
        assert_eq!(BackendStatus::Connected.to_string(), "connected");
        assert_eq!(BackendStatus::Error.to_string(), "error");
    }

    #[test]
    fn test_status_serde_lowercase() {
        let json = serde_json::to_string(&BackendStatus::Connecting).unwrap();
        assert_eq!(json, "\"connecting\"");
        let back: SessionStatus = serde_json::from_str("\"disconnected\"").unwrap();
        assert_eq!(back, SessionStatus::Disconnected);
    }
}
