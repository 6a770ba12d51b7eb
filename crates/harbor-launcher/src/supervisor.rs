use std::{
    collections::BTreeMap,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use anyhow::Context;
use tokio::{
    io::{AsyncRead, BufReader},
    process::Command,
    sync::{mpsc, watch},
};

use crate::{
    logs::{LogSink, read_console_line},
    ready_signal::{ReadyLine, ReadySignal, UvicornReady},
};

/// How long console lines are still drained after the process exits.
const EXIT_DRAIN: Duration = Duration::from_millis(250);

/// Why a start attempt did not produce a running server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error("no free port found at or above {start}")]
    NoFreePort { start: u16 },
    #[error("failed to launch server: {0}")]
    Spawn(String),
    #[error(
        "Process exited unexpectedly with code {}. No server URL detected.",
        display_code(.code)
    )]
    ExitedBeforeReady { code: Option<i32> },
    #[error("failed to monitor server output: {0}")]
    Monitor(String),
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Fully resolved program invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn command_line(&self) -> String {
        let mut out = self.program.display().to_string();
        for a in &self.args {
            out.push(' ');
            out.push_str(a);
        }
        out
    }
}

/// Builds the server invocation for a bind address.
pub trait ServerCommand: Send + Sync {
    fn build(&self, host: &str, port: u16) -> anyhow::Result<LaunchSpec>;

    fn ready_signal(&self) -> Box<dyn ReadySignal> {
        Box::new(UvicornReady)
    }
}

/// The web UI server installed into the managed runtime.
#[derive(Debug, Clone)]
pub struct PackageServerCommand {
    runtime_root: PathBuf,
}

impl PackageServerCommand {
    pub fn new(runtime_root: impl Into<PathBuf>) -> Self {
        Self {
            runtime_root: runtime_root.into(),
        }
    }

    pub fn executable(&self) -> PathBuf {
        if cfg!(windows) {
            self.runtime_root.join("Scripts").join("uvicorn.exe")
        } else {
            self.runtime_root.join("bin").join("open-webui")
        }
    }
}

impl ServerCommand for PackageServerCommand {
    fn build(&self, host: &str, port: u16) -> anyhow::Result<LaunchSpec> {
        let exe = self.executable();
        if !exe.is_file() {
            anyhow::bail!("server executable not found: {}", exe.display());
        }
        let spec = if cfg!(windows) {
            LaunchSpec::new(exe)
                .arg("open_webui.main:app")
                .arg("--host")
                .arg(host)
                .arg("--forwarded-allow-ips")
                .arg("*")
                .arg("--port")
                .arg(port.to_string())
        } else {
            LaunchSpec::new(exe)
                .arg("serve")
                .arg("--host")
                .arg(host)
                .arg("--port")
                .arg(port.to_string())
        };
        Ok(spec)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProcessExit {
    pub code: Option<i32>,
}

/// Resolves once the process has exited.
pub(crate) async fn wait_exit(exit: &mut watch::Receiver<Option<ProcessExit>>) -> ProcessExit {
    loop {
        if let Some(done) = *exit.borrow_and_update() {
            return done;
        }
        if exit.changed().await.is_err() {
            // Waiter task gone without reporting; treat as exited.
            return (*exit.borrow()).unwrap_or(ProcessExit { code: None });
        }
    }
}

/// A freshly spawned server whose console is still being watched for the ready line.
pub(crate) struct SpawnedServer {
    pub pid: u32,
    lines: mpsc::UnboundedReceiver<String>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl SpawnedServer {
    pub(crate) fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit.clone()
    }

    /// Feeds console lines to `signal` until it fires or the process exits.
    ///
    /// There is no deadline: a hung server that never prints the ready line keeps this pending.
    pub(crate) async fn wait_ready(
        &mut self,
        signal: &mut dyn ReadySignal,
    ) -> Result<ReadyLine, StartError> {
        let mut lines_open = true;
        loop {
            tokio::select! {
                biased;
                line = self.lines.recv(), if lines_open => match line {
                    Some(line) => {
                        if let Some(ready) = signal.feed(&line) {
                            return Ok(ready);
                        }
                    }
                    None => lines_open = false,
                },
                changed = self.exit.changed() => {
                    if changed.is_err() && self.exit.borrow().is_none() {
                        return Err(StartError::Monitor("process waiter stopped unexpectedly".to_string()));
                    }
                    let Some(exit) = *self.exit.borrow() else {
                        continue;
                    };
                    // Output written right before exit may still be in flight.
                    while let Ok(Some(line)) = tokio::time::timeout(EXIT_DRAIN, self.lines.recv()).await {
                        if let Some(ready) = signal.feed(&line) {
                            return Ok(ready);
                        }
                    }
                    return Err(StartError::ExitedBeforeReady { code: exit.code });
                }
            }
        }
    }
}

/// Spawns `spec` detached from the launcher's process group, with both pipes mirrored into `sink`.
pub(crate) fn spawn_server(spec: &LaunchSpec, sink: &LogSink) -> anyhow::Result<SpawnedServer> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = spec.cwd.as_deref() {
        cmd.current_dir(cwd);
    }

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {}", spec.program.display()))?;
    let pid = child
        .id()
        .ok_or_else(|| anyhow::anyhow!("{} exited before reporting a pid", spec.program.display()))?;

    let (line_tx, lines) = mpsc::unbounded_channel::<String>();
    if let Some(out) = child.stdout.take() {
        tokio::spawn(pump_console(out, sink.clone(), line_tx.clone()));
    }
    if let Some(err) = child.stderr.take() {
        tokio::spawn(pump_console(err, sink.clone(), line_tx));
    }

    let (exit_tx, exit) = watch::channel::<Option<ProcessExit>>(None);
    let wait_sink = sink.clone();
    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(pid, error = %e, "wait for server process failed");
                None
            }
        };
        tracing::info!(pid, code = ?code, "server process exited");
        wait_sink
            .emit(format!("[harbor] process {pid} exited (code {})", display_code(&code)))
            .await;
        let _ = exit_tx.send(Some(ProcessExit { code }));
    });

    Ok(SpawnedServer { pid, lines, exit })
}

async fn pump_console<R>(reader: R, sink: LogSink, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        match read_console_line(&mut reader, &mut buf).await {
            Ok(Some(line)) => {
                sink.emit(line.clone()).await;
                let _ = tx.send(line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "server console read failed");
                break;
            }
        }
    }
}

pub(crate) fn unix_ms_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
