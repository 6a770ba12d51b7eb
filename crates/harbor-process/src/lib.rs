use std::collections::BTreeMap;

use specta::Type;

/// Lifecycle status of the supervised server.
///
/// `Starting` and `Failed` are never terminal: every new start goes back through `Starting`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type,
)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    #[default]
    Stopped,
    Starting,
    Started,
    Failed,
}

impl ServerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct ServerInfo {
    pub url: Option<String>,
    pub status: ServerStatus,
    pub pid: Option<u32>,
    pub reachable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct StartOutcome {
    /// Display URL (wildcard bind addresses rewritten to `localhost`).
    pub url: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct StartOptions {
    /// Bind on all interfaces instead of loopback.
    #[serde(default)]
    pub expose: Option<bool>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct ProxyRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub base_override: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl ProxyRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: default_method(),
            path: path.into(),
            headers: BTreeMap::new(),
            body: None,
            base_override: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct ProxyResponse {
    pub ok: bool,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body_text: String,
}

impl ProxyResponse {
    /// Transport-level failure: the request never produced an HTTP status.
    pub fn failure(message: impl std::fmt::Display) -> Self {
        Self {
            ok: false,
            status: 0,
            headers: BTreeMap::new(),
            body_text: format!("Proxy error: {message}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct DownloadProgress {
    /// Only known when the server sent a non-zero `Content-Length`.
    pub percent: Option<f64>,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
}

impl DownloadProgress {
    pub fn new(downloaded_bytes: u64, total_bytes: Option<u64>) -> Self {
        let total_bytes = total_bytes.filter(|t| *t > 0);
        let percent = total_bytes
            .map(|total| (downloaded_bytes as f64 / total as f64 * 100.0).clamp(0.0, 100.0));
        Self {
            percent,
            downloaded_bytes,
            total_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct PackageState {
    pub package_name: String,
    pub is_installed: bool,
    pub installed_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct QuickChatInfo {
    pub base_url: String,
    pub status: ServerStatus,
    pub reachable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct LogTail {
    pub lines: Vec<String>,
    pub next_cursor: u64,
}

/// Notifications pushed to UI collaborators.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LauncherEvent {
    Status { status: ServerStatus },
    Started { url: String, pid: u32 },
    Reachable { url: String },
    Failed { message: String },
    Exited { pid: u32, code: Option<i32> },
    Log { line: String },
    Download { progress: DownloadProgress },
    RuntimeInstalled { installed: bool },
    PackageInstalled { installed: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        let v = serde_json::to_value(ServerStatus::Started).unwrap();
        assert_eq!(v, serde_json::json!("started"));
        assert_eq!(ServerStatus::default(), ServerStatus::Stopped);
    }

    #[test]
    fn progress_without_total_has_no_percent() {
        let p = DownloadProgress::new(1024, None);
        assert_eq!(p.percent, None);
        let p = DownloadProgress::new(1024, Some(0));
        assert_eq!(p.percent, None);
        assert_eq!(p.total_bytes, None);
    }

    #[test]
    fn progress_percent_from_total() {
        let p = DownloadProgress::new(50, Some(200));
        assert_eq!(p.percent, Some(25.0));
    }

    #[test]
    fn proxy_request_defaults_to_get() {
        let req: ProxyRequest = serde_json::from_str(r#"{"path":"/api/models"}"#).unwrap();
        assert_eq!(req.method, "GET");
        assert!(req.headers.is_empty());
        assert!(req.base_override.is_none());
    }

    #[test]
    fn events_are_tagged() {
        let v = serde_json::to_value(LauncherEvent::Status {
            status: ServerStatus::Failed,
        })
        .unwrap();
        assert_eq!(v["type"], "status");
        assert_eq!(v["status"], "failed");
    }

    #[test]
    fn failure_response_has_zero_status() {
        let r = ProxyResponse::failure("connection refused");
        assert!(!r.ok);
        assert_eq!(r.status, 0);
        assert_eq!(r.body_text, "Proxy error: connection refused");
    }
}
