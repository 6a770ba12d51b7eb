use std::process::Stdio;

use anyhow::Context;
use harbor_process::PackageState;
use tokio::{
    io::{AsyncRead, BufReader},
    process::Command,
};

use crate::{
    logs::{LogSink, read_console_line},
    runtime_install::RuntimeInstaller,
};

/// Installs and queries packages inside the managed runtime through `uv`.
#[derive(Clone)]
pub struct PackageManager {
    runtime: RuntimeInstaller,
    sink: Option<LogSink>,
}

impl PackageManager {
    pub fn new(runtime: RuntimeInstaller) -> Self {
        Self {
            runtime,
            sink: None,
        }
    }

    pub(crate) fn with_sink(mut self, sink: LogSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// `Ok(false)` when the installer exits non-zero; `Err` when the runtime is
    /// missing or the installer cannot be spawned.
    pub async fn install(&self, name: &str, version: Option<&str>) -> anyhow::Result<bool> {
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("package name is required");
        }
        if !self.runtime.is_installed(None).await {
            anyhow::bail!("runtime is not installed");
        }

        let mut args = vec![
            "-m".to_string(),
            "uv".to_string(),
            "pip".to_string(),
            "install".to_string(),
        ];
        match version.map(str::trim).filter(|v| !v.is_empty()) {
            Some(v) => args.push(format!("{name}=={v}")),
            None => {
                args.push(name.to_string());
                args.push("-U".to_string());
            }
        }

        let exe = self.runtime.executable(None);
        tracing::info!(package = name, version = ?version, "installing package");
        self.emit(format!("[harbor] uv pip install {}", args[4..].join(" ")))
            .await;

        let mut child = Command::new(&exe)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn {} -m uv pip install", exe.display()))?;

        let out_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(pump_lines(out, self.sink.clone(), "[stdout]")));
        let err_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(pump_lines(err, self.sink.clone(), "[stderr]")));

        let status = child.wait().await.context("wait for package install")?;
        for task in [out_task, err_task].into_iter().flatten() {
            let _ = task.await;
        }

        if status.success() {
            tracing::info!(package = name, "package installed");
            Ok(true)
        } else {
            tracing::error!(package = name, code = ?status.code(), "package install failed");
            self.emit(format!(
                "[harbor] package install failed (code {})",
                status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string())
            ))
            .await;
            Ok(false)
        }
    }

    pub async fn is_installed(&self, name: &str) -> bool {
        self.state(name).await.is_installed
    }

    pub async fn state(&self, name: &str) -> PackageState {
        let name = name.trim().to_string();
        let mut state = PackageState {
            package_name: name.clone(),
            is_installed: false,
            installed_version: None,
        };
        if name.is_empty() {
            return state;
        }

        let exe = self.runtime.executable(None);
        let out = match Command::new(&exe)
            .args(["-m", "uv", "pip", "show", name.as_str()])
            .stdin(Stdio::null())
            .output()
            .await
        {
            Ok(out) => out,
            Err(e) => {
                tracing::debug!(package = %name, error = %e, "package query failed");
                return state;
            }
        };
        let text = String::from_utf8_lossy(&out.stdout);
        state.is_installed = show_lists_package(&text, &name);
        if state.is_installed {
            state.installed_version = parse_show_field(&text, "Version");
        }
        state
    }

    async fn emit(&self, line: String) {
        if let Some(sink) = &self.sink {
            sink.emit(line).await;
        }
    }
}

async fn pump_lines<R>(reader: R, sink: Option<LogSink>, prefix: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        let line = match read_console_line(&mut reader, &mut buf).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "installer output read failed");
                break;
            }
        };
        tracing::debug!(target: "harbor::package", "{line}");
        if let Some(sink) = &sink {
            sink.emit(format!("{prefix} {line}")).await;
        }
    }
}

fn show_lists_package(text: &str, name: &str) -> bool {
    parse_show_field(text, "Name").is_some_and(|n| n.eq_ignore_ascii_case(name))
}

fn parse_show_field(text: &str, field: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == field)
            .then(|| value.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOW_OUTPUT: &str = "Name: open-webui\nVersion: 0.6.5\nLocation: /x/lib/python3.11/site-packages\nRequires: fastapi\n";

    #[test]
    fn show_output_is_parsed() {
        assert!(show_lists_package(SHOW_OUTPUT, "open-webui"));
        assert!(!show_lists_package(SHOW_OUTPUT, "open"));
        assert_eq!(
            parse_show_field(SHOW_OUTPUT, "Version").as_deref(),
            Some("0.6.5")
        );
        assert_eq!(parse_show_field("", "Version"), None);
    }

    #[tokio::test]
    async fn installer_output_survives_invalid_utf8() {
        let sink = LogSink::new(crate::logs::LogBuffer::with_capacity(10));
        let out: &[u8] = b"Resolved 3 packages\n\xff\xfe broken\nInstalled 1 package\n";
        pump_lines(out, Some(sink.clone()), "[stdout]").await;
        assert_eq!(
            sink.tail(0, 10).await.lines,
            vec![
                "[stdout] Resolved 3 packages",
                "[stdout] \u{fffd}\u{fffd} broken",
                "[stdout] Installed 1 package",
            ]
        );
    }

    #[tokio::test]
    async fn install_without_runtime_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pm = PackageManager::new(RuntimeInstaller::new(crate::paths::AppPaths::new(
            dir.path(),
        )));
        assert!(pm.install("open-webui", None).await.is_err());
        assert!(!pm.is_installed("open-webui").await);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use crate::{
            logs::{LogBuffer, LogSink},
            paths::AppPaths,
            test_support,
        };

        fn manager(root: &std::path::Path) -> (PackageManager, LogSink) {
            let paths = AppPaths::new(root);
            test_support::install_fake_runtime(&paths.runtime_dir());
            let sink = LogSink::new(LogBuffer::with_capacity(100));
            let pm = PackageManager::new(RuntimeInstaller::new(paths)).with_sink(sink.clone());
            (pm, sink)
        }

        #[tokio::test]
        async fn install_then_query() {
            let dir = tempfile::tempdir().unwrap();
            let (pm, sink) = manager(dir.path());

            assert!(!pm.is_installed("open-webui").await);
            assert!(pm.install("open-webui", Some("0.6.9")).await.unwrap());

            let state = pm.state("open-webui").await;
            assert!(state.is_installed);
            assert_eq!(state.installed_version.as_deref(), Some("0.6.9"));

            let logs = sink.tail(0, 50).await.lines;
            assert!(logs.iter().any(|l| l.contains("Installed 1 package")));
        }

        #[tokio::test]
        async fn upgrade_without_version() {
            let dir = tempfile::tempdir().unwrap();
            let (pm, _sink) = manager(dir.path());
            assert!(pm.install("open-webui", None).await.unwrap());
            assert!(pm.is_installed("open-webui").await);
        }

        #[tokio::test]
        async fn failing_install_is_false() {
            let dir = tempfile::tempdir().unwrap();
            let (pm, sink) = manager(dir.path());
            assert!(!pm.install("does-not-exist", None).await.unwrap());
            let logs = sink.tail(0, 50).await.lines;
            assert!(logs.iter().any(|l| l.starts_with("[stderr]")));
        }
    }
}
