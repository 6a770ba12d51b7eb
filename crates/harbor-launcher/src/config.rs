use std::{path::Path, str::FromStr, time::Duration};

use anyhow::Context;
use tokio::io::AsyncWriteExt;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_PACKAGE: &str = "open-webui";
pub const DEFAULT_API_PORT: u16 = 7181;

/// Trimmed, non-empty value of an environment variable.
pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|v| v.parse().ok())
}

pub(crate) fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_flag(name: &str) -> Option<bool> {
    env_string(name).and_then(|v| parse_flag(&v))
}

fn env_millis(name: &str, default: u64, min: u64, max: u64) -> Duration {
    Duration::from_millis(env_parse::<u64>(name).map_or(default, |v| v.clamp(min, max)))
}

/// How long a started server is polled before `reachable` is given up on.
pub(crate) fn reachability_timeout() -> Duration {
    env_millis("HARBOR_REACHABILITY_TIMEOUT_MS", 10 * 60 * 1000, 1000, 60 * 60 * 1000)
}

pub(crate) fn stop_wait_timeout() -> Duration {
    env_millis("HARBOR_STOP_WAIT_MS", 5000, 100, 60_000)
}

/// Loopback port of the control API (`HARBOR_API_PORT`).
pub fn api_port() -> u16 {
    env_parse::<u16>("HARBOR_API_PORT")
        .filter(|v| *v != 0)
        .unwrap_or(DEFAULT_API_PORT)
}

/// One-line rendering of an error and its causes, repeated messages collapsed.
pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts: Vec<String> = err
        .chain()
        .map(|cause| cause.to_string())
        .filter(|s| !s.is_empty())
        .collect();
    parts.dedup();
    if parts.is_empty() {
        return "unknown error".to_string();
    }
    parts.join(": ")
}

/// User-editable launcher settings, persisted as `config.json` in the user-data directory.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub serve_on_local_network: bool,
    pub port: u16,
    pub auto_update: bool,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            serve_on_local_network: false,
            port: DEFAULT_PORT,
            auto_update: true,
        }
    }
}

impl LauncherConfig {
    /// Missing or unreadable files fall back to defaults; environment overrides win.
    pub async fn load(path: &Path) -> Self {
        let mut cfg = match tokio::fs::read(path).await {
            Ok(raw) => match serde_json::from_slice::<LauncherConfig>(&raw) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "invalid config.json, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };
        cfg.apply_env();
        cfg
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_flag("HARBOR_SERVE_ON_LOCAL_NETWORK") {
            self.serve_on_local_network = v;
        }
        if let Some(port) = env_parse::<u16>("HARBOR_PORT").filter(|p| *p != 0) {
            self.port = port;
        }
        if let Some(v) = env_flag("HARBOR_AUTO_UPDATE") {
            self.auto_update = v;
        }
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", path.display()))?;
        tokio::fs::create_dir_all(dir)
            .await
            .context("create config dir")?;
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(self).context("serialize config.json")?;
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .context("create config.json.tmp")?;
        f.write_all(&data).await.context("write config.json.tmp")?;
        f.flush().await.ok();
        tokio::fs::rename(&tmp, path)
            .await
            .context("persist config.json")?;
        Ok(())
    }
}
