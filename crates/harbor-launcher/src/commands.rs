use std::{path::Path, sync::Arc};

use anyhow::Context;
use harbor_process::{
    DownloadProgress, LauncherEvent, LogTail, PackageState, ProxyRequest, ProxyResponse,
    QuickChatInfo, ServerInfo, StartOptions, StartOutcome,
};
use reqwest::cookie::Jar;
use tokio::sync::{RwLock, broadcast, mpsc};

use crate::{
    config::{DEFAULT_PACKAGE, LauncherConfig},
    controller::{ServerController, SharedConfig},
    package_manager::PackageManager,
    paths::AppPaths,
    process_tree::{TreeTerminator, platform_terminator},
    proxy::{ProxyBridge, resolve_base},
    ready_signal::normalize_display_url,
    runtime_install::RuntimeInstaller,
    supervisor::{PackageServerCommand, ServerCommand, StartError},
};

/// Every operation the UI shell can invoke, over one shared set of components.
#[derive(Clone)]
pub struct Launcher {
    paths: AppPaths,
    config: SharedConfig,
    runtime: RuntimeInstaller,
    packages: PackageManager,
    controller: ServerController,
    proxy: ProxyBridge,
    package_name: String,
}

impl Launcher {
    /// Must be called inside a tokio runtime.
    pub fn new(paths: AppPaths, config: LauncherConfig) -> Self {
        let command = Arc::new(PackageServerCommand::new(paths.runtime_dir()));
        Self::with_parts(paths, config, command, platform_terminator())
    }

    pub fn with_parts(
        paths: AppPaths,
        config: LauncherConfig,
        command: Arc<dyn ServerCommand>,
        terminator: Arc<dyn TreeTerminator>,
    ) -> Self {
        let config: SharedConfig = Arc::new(RwLock::new(config));
        let runtime = RuntimeInstaller::new(paths.clone());
        let controller = ServerController::new(paths.clone(), config.clone(), command, terminator);
        let packages = PackageManager::new(runtime.clone()).with_sink(controller.sink().clone());
        Self {
            paths,
            config,
            runtime,
            packages,
            controller,
            proxy: ProxyBridge::new(Arc::new(Jar::default())),
            package_name: DEFAULT_PACKAGE.to_string(),
        }
    }

    pub fn with_runtime(mut self, runtime: RuntimeInstaller) -> Self {
        self.packages = PackageManager::new(runtime.clone()).with_sink(self.controller.sink().clone());
        self.runtime = runtime;
        self
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn controller(&self) -> &ServerController {
        &self.controller
    }

    pub fn cookie_jar(&self) -> &Arc<Jar> {
        self.proxy.cookie_jar()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LauncherEvent> {
        self.controller.subscribe()
    }

    fn emit(&self, event: LauncherEvent) {
        let _ = self.controller.events().send(event);
    }

    pub async fn install_runtime(&self, root: Option<&Path>) -> anyhow::Result<bool> {
        let (tx, mut rx) = mpsc::unbounded_channel::<DownloadProgress>();
        let events = self.controller.events().clone();
        let forward = tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                let _ = events.send(LauncherEvent::Download { progress });
            }
        });

        let res = self.runtime.install(root, Some(&tx)).await;
        drop(tx);
        let _ = forward.await;

        let installed = *res.as_ref().unwrap_or(&false);
        self.emit(LauncherEvent::RuntimeInstalled { installed });
        res
    }

    /// Runtime present and `uv` bootstrapped into it.
    pub async fn runtime_status(&self, root: Option<&Path>) -> bool {
        self.runtime.is_installed(root).await && self.runtime.is_package_manager_installed(root).await
    }

    pub async fn uninstall_runtime(&self, root: Option<&Path>) -> bool {
        let removed = self.runtime.uninstall(root).await;
        if removed {
            self.emit(LauncherEvent::RuntimeInstalled { installed: false });
        }
        removed
    }

    fn package<'a>(&'a self, name: Option<&'a str>) -> &'a str {
        name.map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(self.package_name.as_str())
    }

    pub async fn install_package(
        &self,
        name: Option<&str>,
        version: Option<&str>,
    ) -> anyhow::Result<bool> {
        let res = self.packages.install(self.package(name), version).await;
        let installed = *res.as_ref().unwrap_or(&false);
        self.emit(LauncherEvent::PackageInstalled { installed });
        res
    }

    pub async fn package_status(&self, name: Option<&str>) -> PackageState {
        self.packages.state(self.package(name)).await
    }

    pub async fn start_server(&self, options: StartOptions) -> Result<StartOutcome, StartError> {
        self.controller.start(options).await
    }

    pub async fn stop_server(&self) -> bool {
        self.controller.stop().await
    }

    pub async fn restart_server(&self) -> Result<StartOutcome, StartError> {
        self.controller.restart().await
    }

    pub async fn server_info(&self) -> ServerInfo {
        self.controller.info().await
    }

    pub async fn server_logs(&self, cursor: u64, limit: usize) -> LogTail {
        self.controller.logs(cursor, limit).await
    }

    async fn base_url(&self, base_override: Option<&str>) -> String {
        let tracked = self.controller.current_url().await;
        let port = self.config.read().await.port;
        resolve_base(base_override, tracked.as_deref(), port)
    }

    pub async fn proxy(&self, req: ProxyRequest) -> ProxyResponse {
        let base = self.base_url(req.base_override.as_deref()).await;
        self.proxy.forward(&req, &base).await
    }

    pub async fn quick_chat_info(&self) -> QuickChatInfo {
        let info = self.controller.info().await;
        QuickChatInfo {
            base_url: self.base_url(None).await,
            status: info.status,
            reachable: info.reachable,
        }
    }

    pub async fn config(&self) -> LauncherConfig {
        self.config.read().await.clone()
    }

    /// Persists and applies new settings; they take effect on the next start.
    pub async fn set_config(&self, cfg: LauncherConfig) -> anyhow::Result<LauncherConfig> {
        if cfg.port == 0 {
            anyhow::bail!("port must be between 1 and 65535");
        }
        cfg.save(&self.paths.config_file()).await?;
        *self.config.write().await = cfg.clone();
        tracing::info!(
            port = cfg.port,
            serve_on_local_network = cfg.serve_on_local_network,
            auto_update = cfg.auto_update,
            "config updated"
        );
        Ok(cfg)
    }

    /// Opens `url` (default: the running server) in the system browser.
    pub async fn open_in_browser(&self, url: Option<&str>) -> anyhow::Result<String> {
        let target = match url.map(str::trim).filter(|u| !u.is_empty()) {
            Some(u) => normalize_display_url(u),
            None => self
                .controller
                .current_url()
                .await
                .ok_or_else(|| anyhow::anyhow!("server is not running"))?,
        };
        let parsed = reqwest::Url::parse(&target).with_context(|| format!("invalid url {target}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            anyhow::bail!("refusing to open {} url", parsed.scheme());
        }
        open::that_detached(&target).with_context(|| format!("open {target}"))?;
        Ok(target)
    }

    /// Stops the server and removes the runtime and its archive. Data, key and config survive.
    pub async fn reset(&self) -> anyhow::Result<()> {
        self.controller.stop().await;
        self.runtime.uninstall(None).await;
        let archive = self.paths.runtime_archive();
        match tokio::fs::remove_file(&archive).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("remove {}", archive.display()));
            }
        }
        tracing::info!("application reset");
        self.emit(LauncherEvent::RuntimeInstalled { installed: false });
        self.emit(LauncherEvent::PackageInstalled { installed: false });
        Ok(())
    }

    /// Startup flow: upgrade (when enabled) and start the server if the package is installed.
    pub async fn autostart(&self) -> anyhow::Result<Option<StartOutcome>> {
        if !self.packages.is_installed(&self.package_name).await {
            tracing::info!(package = %self.package_name, "package not installed, waiting for install");
            return Ok(None);
        }
        if self.config.read().await.auto_update {
            match self.install_package(None, None).await {
                Ok(true) => {}
                Ok(false) => tracing::warn!("package upgrade failed, starting installed version"),
                Err(e) => tracing::warn!(error = %e, "package upgrade could not run"),
            }
        }
        let outcome = self.controller.start(StartOptions::default()).await?;
        Ok(Some(outcome))
    }

    pub async fn shutdown(&self) {
        self.controller.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn config_updates_persist() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::new(dir.path());
        let launcher = Launcher::new(paths.clone(), LauncherConfig::default());

        let mut cfg = launcher.config().await;
        cfg.port = 9191;
        cfg.serve_on_local_network = true;
        launcher.set_config(cfg.clone()).await.unwrap();

        assert_eq!(launcher.config().await, cfg);
        let raw = std::fs::read_to_string(paths.config_file()).unwrap();
        let on_disk: LauncherConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(on_disk, cfg);

        cfg.port = 0;
        assert!(launcher.set_config(cfg).await.is_err());
    }

    #[tokio::test]
    async fn quick_chat_falls_back_to_configured_port() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LauncherConfig {
            port: 8123,
            ..LauncherConfig::default()
        };
        let launcher = Launcher::new(AppPaths::new(dir.path()), cfg);
        let info = launcher.quick_chat_info().await;
        assert_eq!(info.base_url, "http://localhost:8123");
        assert!(!info.reachable);
    }

    #[tokio::test]
    async fn fresh_install_reports_nothing_installed() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Launcher::new(AppPaths::new(dir.path()), LauncherConfig::default());
        assert!(!launcher.runtime_status(None).await);
        assert!(!launcher.package_status(None).await.is_installed);
        assert_eq!(launcher.package_status(None).await.package_name, "open-webui");
        assert!(!launcher.uninstall_runtime(None).await);
        assert_eq!(launcher.autostart().await.unwrap(), None);
    }

    #[tokio::test]
    async fn open_without_server_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Launcher::new(AppPaths::new(dir.path()), LauncherConfig::default());
        assert!(launcher.open_in_browser(None).await.is_err());
        assert!(launcher.open_in_browser(Some("file:///etc/passwd")).await.is_err());
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use crate::test_support;

        #[tokio::test]
        async fn install_reports_progress_and_status() {
            let dir = tempfile::tempdir().unwrap();
            let paths = AppPaths::new(dir.path());
            test_support::write_fake_runtime_archive(&paths.runtime_archive());
            let launcher = Launcher::new(paths.clone(), LauncherConfig::default())
                .with_runtime(RuntimeInstaller::new(paths).with_base_url("http://127.0.0.1:9"));
            let mut events = launcher.subscribe();

            assert!(launcher.install_runtime(None).await.unwrap());
            assert!(launcher.runtime_status(None).await);

            let mut installed = None;
            while let Ok(ev) = events.try_recv() {
                if let LauncherEvent::RuntimeInstalled { installed: v } = ev {
                    installed = Some(v);
                }
            }
            assert_eq!(installed, Some(true));

            assert!(launcher.install_package(None, Some("0.6.7")).await.unwrap());
            let state = launcher.package_status(None).await;
            assert_eq!(state.installed_version.as_deref(), Some("0.6.7"));
        }

        #[tokio::test]
        async fn reset_removes_runtime_but_keeps_data() {
            let dir = tempfile::tempdir().unwrap();
            let paths = AppPaths::new(dir.path());
            test_support::install_fake_runtime(&paths.runtime_dir());
            std::fs::write(paths.runtime_archive(), b"archive").unwrap();
            std::fs::create_dir_all(paths.server_data_dir()).unwrap();
            std::fs::write(paths.secret_key_file(), "k").unwrap();

            let launcher = Launcher::new(paths.clone(), LauncherConfig::default());
            launcher.reset().await.unwrap();

            assert!(!paths.runtime_dir().exists());
            assert!(!paths.runtime_archive().exists());
            assert!(paths.secret_key_file().exists());
            assert_eq!(launcher.server_info().await.status, harbor_process::ServerStatus::Stopped);

            // Idempotent.
            launcher.reset().await.unwrap();
        }
    }
}
