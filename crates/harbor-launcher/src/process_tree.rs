use std::sync::Arc;

/// Kills a process together with everything it spawned.
pub trait TreeTerminator: Send + Sync {
    fn terminate_tree(&self, pid: u32) -> std::io::Result<()>;
}

/// POSIX: the server runs in its own session, so its pid is the process group id.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessGroupKill;

#[cfg(unix)]
impl TreeTerminator for ProcessGroupKill {
    fn terminate_tree(&self, pid: u32) -> std::io::Result<()> {
        let pgid = i32::try_from(pid).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("pid {pid} out of range"))
        })?;
        if pgid <= 1 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("refusing to signal process group {pgid}"),
            ));
        }
        let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
        if rc == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Windows: `taskkill /T /F` walks the child tree.
#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskkillTree;

#[cfg(windows)]
impl TreeTerminator for TaskkillTree {
    fn terminate_tree(&self, pid: u32) -> std::io::Result<()> {
        let status = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!(
                "taskkill exited with {:?}",
                status.code()
            )))
        }
    }
}

pub fn platform_terminator() -> Arc<dyn TreeTerminator> {
    #[cfg(unix)]
    {
        Arc::new(ProcessGroupKill)
    }
    #[cfg(windows)]
    {
        Arc::new(TaskkillTree)
    }
}
