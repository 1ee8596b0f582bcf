use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// A dump device reachable on the LAN.
#[derive(Debug, Clone)]
pub struct Device {
    /// Host plus the HTTP port the device advertised. Registry key.
    pub addr: SocketAddr,
    pub name: String,
    pub version: String,
    /// Monotonic sighting time, used for staleness.
    pub last_seen: Instant,
    /// Wall-clock sighting time, for display.
    pub last_seen_at: DateTime<Utc>,
}

impl Device {
    pub fn new(addr: SocketAddr, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            addr,
            name: name.into(),
            version: version.into(),
            last_seen: Instant::now(),
            last_seen_at: Utc::now(),
        }
    }

    /// Base URL of the device HTTP surface, e.g. `http://10.0.0.5:8080`.
    pub fn base_url(&self) -> String {
        // SocketAddr's Display brackets IPv6 hosts already
        format!("http://{}", self.addr)
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.last_seen_at = Utc::now();
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TitleKind {
    Cartridge,
    Digital,
    #[default]
    #[serde(other)]
    Other,
}

/// A content item listed by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Title {
    pub title_id: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "type", default)]
    pub kind: TitleKind,
    #[serde(rename = "isExtractable", alias = "extractable", default)]
    pub extractable: bool,
}

/// Lifecycle of a remote extraction, ordered by rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Transitions are monotonic: a session never revisits an earlier status
    /// and never leaves a terminal one.
    pub fn can_advance_to(&self, next: SessionStatus) -> bool {
        if self.is_terminal() {
            return *self == next;
        }
        next >= *self
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }
}

/// Device-side view of one extraction, as returned by `/api/status/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSession {
    pub operation_id: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub bytes_transferred: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TransferSession {
    /// Percentage complete, 0 when the total is unknown.
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.bytes_transferred as f64 / self.total_bytes as f64 * 100.0).min(100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_ipv4_and_ipv6() {
        let v4 = Device::new("10.0.0.5:8080".parse().unwrap(), "Switch", "1.0");
        assert_eq!(v4.base_url(), "http://10.0.0.5:8080");

        let v6 = Device::new("[fe80::1]:8080".parse().unwrap(), "Switch", "1.0");
        assert_eq!(v6.base_url(), "http://[fe80::1]:8080");
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        use SessionStatus::*;
        assert!(Pending.can_advance_to(InProgress));
        assert!(InProgress.can_advance_to(InProgress));
        assert!(InProgress.can_advance_to(Failed));
        assert!(!InProgress.can_advance_to(Pending));
        assert!(!Completed.can_advance_to(Failed));
        assert!(Completed.can_advance_to(Completed));
    }

    #[test]
    fn test_percentage_unknown_total() {
        let session = TransferSession {
            operation_id: "op".to_string(),
            status: SessionStatus::InProgress,
            bytes_transferred: 500,
            total_bytes: 0,
            error_message: None,
        };
        assert_eq!(session.percentage(), 0.0);
    }

    #[test]
    fn test_parse_title_wire_format() {
        let json = r#"{"titleId":"0100000000010000","name":"Super Mario 64","version":"1.0.0",
            "size":4194304,"type":"Cartridge","isExtractable":true}"#;
        let title: Title = serde_json::from_str(json).unwrap();
        assert_eq!(title.title_id, "0100000000010000");
        assert_eq!(title.kind, TitleKind::Cartridge);
        assert!(title.extractable);

        let json = r#"{"titleId":"x","name":"y","type":"Homebrew","extractable":false}"#;
        let title: Title = serde_json::from_str(json).unwrap();
        assert_eq!(title.kind, TitleKind::Other);
        assert_eq!(title.size, 0);
    }

    #[test]
    fn test_title_without_type_still_decodes() {
        let json = r#"[{"titleId":"0100000000010000","name":"Super Mario 64","size":1},
            {"titleId":"0100000000020000","name":"F-Zero","type":"Digital"}]"#;
        let titles: Vec<Title> = serde_json::from_str(json).unwrap();
        assert_eq!(titles.len(), 2);
        assert_eq!(titles[0].kind, TitleKind::Other);
        assert!(!titles[0].extractable);
        assert_eq!(titles[1].kind, TitleKind::Digital);
    }

    #[test]
    fn test_parse_status_wire_format() {
        let json = r#"{"operationId":"op-1","status":"Failed","bytesTransferred":10,
            "totalBytes":100,"errorMessage":"disk full"}"#;
        let session: TransferSession = serde_json::from_str(json).unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.error_message.as_deref(), Some("disk full"));
    }
}
