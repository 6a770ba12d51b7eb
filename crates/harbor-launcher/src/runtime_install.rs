use std::{
    path::{Component, Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use anyhow::Context;
use harbor_process::DownloadProgress;
use tokio::{process::Command, sync::mpsc};

use crate::{download::ArchiveDownload, paths::AppPaths};

pub const RUNTIME_VERSION: &str = "3.11.13";
pub const RUNTIME_RELEASE: &str = "20250723";
const DEFAULT_BASE_URL: &str =
    "https://desktop.openwebui.com/astral-sh/python-build-standalone/releases/download";

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Vendor platform triple suffix for `std::env::consts::OS`.
pub fn platform_triple(os: &str) -> &'static str {
    match os {
        "macos" => "apple-darwin",
        "windows" => "pc-windows-msvc",
        _ => "unknown-linux-gnu",
    }
}

/// Vendor architecture name for `std::env::consts::ARCH`.
pub fn arch_name(arch: &str) -> &'static str {
    match arch {
        "aarch64" => "aarch64",
        "x86" => "i686",
        _ => "x86_64",
    }
}

pub fn download_url(base_url: &str, os: &str, arch: &str) -> String {
    format!(
        "{}/{RUNTIME_RELEASE}/cpython-{RUNTIME_VERSION}+{RUNTIME_RELEASE}-{}-{}-install_only.tar.gz",
        base_url.trim_end_matches('/'),
        arch_name(arch),
        platform_triple(os),
    )
}

/// Interpreter location inside an unpacked runtime tree.
pub fn runtime_executable(root: &Path) -> PathBuf {
    if cfg!(windows) {
        root.join("python.exe")
    } else {
        root.join("bin").join("python3")
    }
}

fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .user_agent(concat!("harbor-launcher/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default()
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInstallation {
    pub install_root: PathBuf,
    pub archive_path: PathBuf,
    pub is_downloaded: bool,
    pub is_installed: bool,
}

/// Downloads, unpacks, probes and removes the language runtime.
#[derive(Debug, Clone)]
pub struct RuntimeInstaller {
    paths: AppPaths,
    base_url: String,
}

impl RuntimeInstaller {
    pub fn new(paths: AppPaths) -> Self {
        let base_url = crate::config::env_string("HARBOR_RUNTIME_BASE_URL")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self { paths, base_url }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn install_root(&self, root: Option<&Path>) -> PathBuf {
        root.map(Path::to_path_buf)
            .unwrap_or_else(|| self.paths.runtime_dir())
    }

    pub fn executable(&self, root: Option<&Path>) -> PathBuf {
        runtime_executable(&self.install_root(root))
    }

    pub fn archive_url(&self) -> String {
        download_url(
            &self.base_url,
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }

    pub async fn installation(&self, root: Option<&Path>) -> RuntimeInstallation {
        let archive_path = self.paths.runtime_archive();
        RuntimeInstallation {
            install_root: self.install_root(root),
            is_downloaded: tokio::fs::try_exists(&archive_path).await.unwrap_or(false),
            archive_path,
            is_installed: self.is_installed(root).await,
        }
    }

    /// Executable present and answering `--version`. Any failure means "not installed".
    pub async fn is_installed(&self, root: Option<&Path>) -> bool {
        let exe = self.executable(root);
        if !exe.is_file() {
            tracing::debug!(exe = %exe.display(), "runtime executable not found");
            return false;
        }
        match probe(&exe, &["--version"]).await {
            Ok(version) => {
                tracing::debug!(version = %version, "runtime present");
                true
            }
            Err(e) => {
                tracing::warn!(exe = %exe.display(), error = %e, "runtime version probe failed");
                false
            }
        }
    }

    pub async fn is_package_manager_installed(&self, root: Option<&Path>) -> bool {
        let exe = self.executable(root);
        if !exe.is_file() {
            return false;
        }
        match probe(&exe, &["-m", "uv", "--version"]).await {
            Ok(version) => {
                tracing::debug!(version = %version, "uv present");
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "uv not available");
                false
            }
        }
    }

    /// Installs the runtime into `root` (default: the user-data runtime dir).
    ///
    /// The archive is downloaded only when not already on disk. Download failures
    /// are errors; unpack, probe and bootstrap failures resolve to `Ok(false)`.
    pub async fn install(
        &self,
        root: Option<&Path>,
        observer: Option<&mpsc::UnboundedSender<DownloadProgress>>,
    ) -> anyhow::Result<bool> {
        let root = self.install_root(root);
        let archive = self.paths.runtime_archive();

        if tokio::fs::try_exists(&archive).await.unwrap_or(false) {
            tracing::info!(archive = %archive.display(), "runtime archive present, skipping download");
        } else {
            self.download(&archive, observer).await?;
        }

        if !archive.is_file() {
            tracing::error!(archive = %archive.display(), "runtime archive not found after download");
            return Ok(false);
        }

        let unpack_src = archive.clone();
        let unpack_dest = root.clone();
        let unpacked =
            tokio::task::spawn_blocking(move || unpack_archive(&unpack_src, &unpack_dest)).await;
        match unpacked {
            Ok(Ok(entries)) => {
                tracing::info!(root = %root.display(), entries, "runtime unpacked");
            }
            Ok(Err(e)) => {
                tracing::error!(error = %crate::config::format_error_chain(&e), "runtime unpack failed");
                return Ok(false);
            }
            Err(e) => {
                tracing::error!(error = %e, "runtime unpack task failed");
                return Ok(false);
            }
        }

        if !self.is_installed(Some(&root)).await {
            tracing::error!(root = %root.display(), "runtime not usable after unpack");
            return Ok(false);
        }

        let exe = runtime_executable(&root);
        match Command::new(&exe)
            .args(["-m", "pip", "install", "uv"])
            .stdin(std::process::Stdio::null())
            .output()
            .await
        {
            Ok(out) if out.status.success() => {
                tracing::info!("installed uv into runtime");
                Ok(true)
            }
            Ok(out) => {
                tracing::error!(
                    code = ?out.status.code(),
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "uv bootstrap failed"
                );
                Ok(false)
            }
            Err(e) => {
                tracing::error!(exe = %exe.display(), error = %e, "uv bootstrap could not run");
                Ok(false)
            }
        }
    }

    async fn download(
        &self,
        archive: &Path,
        observer: Option<&mpsc::UnboundedSender<DownloadProgress>>,
    ) -> anyhow::Result<()> {
        let url = self.archive_url();
        tracing::info!(
            os = std::env::consts::OS,
            arch = std::env::consts::ARCH,
            url = %url,
            dest = %archive.display(),
            "downloading runtime"
        );

        let mut dl = ArchiveDownload::begin(http_client(), &url, archive).await?;
        let mut last_logged_step: u64 = 0;
        while let Some(ev) = dl.next().await {
            let progress = ev?;
            if let Some(tx) = observer {
                let _ = tx.send(progress);
            }
            // Log every 10% (or every 16 MiB without a known size).
            let step = match progress.percent {
                Some(p) => (p / 10.0) as u64,
                None => progress.downloaded_bytes / (16 * 1024 * 1024),
            };
            if step > last_logged_step {
                last_logged_step = step;
                tracing::info!(
                    percent = ?progress.percent,
                    downloaded = progress.downloaded_bytes,
                    total = ?progress.total_bytes,
                    "downloading runtime"
                );
            }
        }
        tracing::info!(archive = %archive.display(), "runtime downloaded");
        Ok(())
    }

    /// Removes the runtime tree. `false` when it does not exist or cannot be removed.
    pub async fn uninstall(&self, root: Option<&Path>) -> bool {
        let root = self.install_root(root);
        if !tokio::fs::try_exists(&root).await.unwrap_or(false) {
            tracing::warn!(root = %root.display(), "runtime installation not found");
            return false;
        }
        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => {
                tracing::info!(root = %root.display(), "runtime removed");
                true
            }
            Err(e) => {
                tracing::error!(root = %root.display(), error = %e, "failed to remove runtime");
                false
            }
        }
    }
}

async fn probe(exe: &Path, args: &[&str]) -> anyhow::Result<String> {
    let out = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new(exe)
            .args(args)
            .stdin(std::process::Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("{} {} timed out", exe.display(), args.join(" ")))?
    .with_context(|| format!("run {}", exe.display()))?;
    if !out.status.success() {
        anyhow::bail!(
            "{} {} exited with {:?}",
            exe.display(),
            args.join(" "),
            out.status.code()
        );
    }
    let mut text = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if text.is_empty() {
        text = String::from_utf8_lossy(&out.stderr).trim().to_string();
    }
    Ok(text)
}

/// Archive entry path relative to the install root, without the leading `python/`
/// directory. `None` for entries that would escape the root.
fn relative_entry_path(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for (i, c) in path.components().enumerate() {
        match c {
            Component::Normal(seg) if i == 0 && seg == "python" => {}
            Component::Normal(seg) => out.push(seg),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Whether a link at `rel` pointing to `target` resolves under the unpack root.
fn link_stays_inside(rel: &Path, target: &Path) -> bool {
    let mut depth = rel.components().count().saturating_sub(1);
    for c in target.components() {
        match c {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return false,
            },
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

/// Whether any directory above `rel` is already a symlink on disk.
fn parent_is_symlink(dest: &Path, rel: &Path) -> bool {
    let mut cur = dest.to_path_buf();
    for c in rel.parent().map(Path::components).into_iter().flatten() {
        cur.push(c);
        if std::fs::symlink_metadata(&cur).is_ok_and(|m| m.file_type().is_symlink()) {
            return true;
        }
    }
    false
}

/// Replaces `dest` with the contents of a `.tar.gz` runtime archive. Returns the entry count.
fn unpack_archive(archive: &Path, dest: &Path) -> anyhow::Result<usize> {
    if dest.exists() {
        std::fs::remove_dir_all(dest)
            .with_context(|| format!("clear {}", dest.display()))?;
    }
    std::fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;

    let f = std::fs::File::open(archive)
        .with_context(|| format!("open {}", archive.display()))?;
    let gz = flate2::read::GzDecoder::new(f);
    let mut ar = tar::Archive::new(gz);
    ar.set_preserve_permissions(true);

    let mut count = 0usize;
    for entry in ar.entries().context("read archive entries")? {
        let mut entry = entry.context("read archive entry")?;
        let path = entry.path().context("archive entry path")?.to_path_buf();
        let Some(rel) = relative_entry_path(&path) else {
            continue;
        };
        if parent_is_symlink(dest, &rel) {
            anyhow::bail!("archive entry {} is nested under a symlink", path.display());
        }
        if entry.header().entry_type().is_symlink() {
            let target = entry
                .link_name()
                .context("symlink target")?
                .ok_or_else(|| anyhow::anyhow!("symlink {} has no target", path.display()))?;
            if !link_stays_inside(&rel, &target) {
                anyhow::bail!(
                    "symlink {} -> {} leaves the runtime directory",
                    path.display(),
                    target.display()
                );
            }
        }
        let out_path = dest.join(&rel);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if entry.header().entry_type().is_hard_link() {
            // Hard link targets are archive paths; re-root them under `dest`.
            let target = entry
                .link_name()
                .context("hard link target")?
                .and_then(|t| relative_entry_path(&t))
                .ok_or_else(|| anyhow::anyhow!("bad hard link {}", path.display()))?;
            std::fs::hard_link(dest.join(&target), &out_path)
                .or_else(|_| std::fs::copy(dest.join(&target), &out_path).map(|_| ()))
                .with_context(|| format!("link {}", path.display()))?;
        } else {
            entry
                .unpack(&out_path)
                .with_context(|| format!("unpack {}", path.display()))?;
        }
        count += 1;
    }

    if count == 0 {
        anyhow::bail!("archive {} contained no entries", archive.display());
    }
    Ok(count)
}
