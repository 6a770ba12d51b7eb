use std::path::{Path, PathBuf};

/// Default user-data root: `HARBOR_DATA_ROOT`, else the platform data directory.
pub fn data_root() -> PathBuf {
    if let Some(raw) = crate::config::env_string("HARBOR_DATA_ROOT") {
        let p = PathBuf::from(raw);
        let abs = if p.is_absolute() {
            p
        } else {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(p)
        };
        // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
        return std::fs::canonicalize(&abs).unwrap_or(abs);
    }

    directories::ProjectDirs::from("com", "Harbor", "Harbor")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// On-disk layout under the user-data root.
#[derive(Debug, Clone)]
pub struct AppPaths {
    root: PathBuf,
}

impl AppPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Self {
        Self::new(data_root())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Working data directory handed to the server (`DATA_DIR`).
    pub fn server_data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn secret_key_file(&self) -> PathBuf {
        self.server_data_dir().join(".key")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join("python")
    }

    pub fn runtime_archive(&self) -> PathBuf {
        self.root.join("py.tar.gz")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn server_console_log(&self) -> PathBuf {
        self.logs_dir().join("server.log")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.server_data_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}
