use std::{collections::BTreeSet, sync::Arc, time::Duration};

use harbor_process::{LauncherEvent, LogTail, ServerInfo, ServerStatus, StartOptions, StartOutcome};
use tokio::sync::{Mutex, RwLock, broadcast, watch};

use crate::{
    config::{LauncherConfig, format_error_chain, reachability_timeout, stop_wait_timeout},
    logs::{CONSOLE_HISTORY_LINES, LogBuffer, LogSink},
    paths::AppPaths,
    port_probe, reachability, secret_key,
    process_tree::TreeTerminator,
    supervisor::{self, ProcessExit, ServerCommand, StartError, unix_ms_now, wait_exit},
};

pub type SharedConfig = Arc<RwLock<LauncherConfig>>;

const EVENT_CAPACITY: usize = 256;

/// The one server process a controller is tracking.
#[derive(Debug)]
struct ServerProcess {
    pid: u32,
    process_group_id: Option<u32>,
    host: String,
    port: u16,
    bind_url: Option<String>,
    url: Option<String>,
    started_at_unix_ms: u64,
    exit: watch::Receiver<Option<ProcessExit>>,
}

#[derive(Debug, Default)]
struct ControllerState {
    status: ServerStatus,
    current: Option<ServerProcess>,
    /// Every pid spawned and not yet torn down by a stop.
    registry: BTreeSet<u32>,
    last_options: Option<StartOptions>,
    reachable: bool,
    last_error: Option<String>,
    /// Bumped on every start/stop; background tasks from older runs compare and bail.
    generation: u64,
}

/// Start/stop/restart state machine around a single server process.
#[derive(Clone)]
pub struct ServerController {
    paths: AppPaths,
    config: SharedConfig,
    command: Arc<dyn ServerCommand>,
    terminator: Arc<dyn TreeTerminator>,
    lifecycle: Arc<Mutex<()>>,
    state: Arc<Mutex<ControllerState>>,
    events: broadcast::Sender<LauncherEvent>,
    sink: LogSink,
    http: reqwest::Client,
    stop_wait: Duration,
    reachability_timeout: Duration,
}

impl ServerController {
    /// Must be called inside a tokio runtime (spawns the console log writer).
    pub fn new(
        paths: AppPaths,
        config: SharedConfig,
        command: Arc<dyn ServerCommand>,
        terminator: Arc<dyn TreeTerminator>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let sink = LogSink::new(LogBuffer::with_capacity(CONSOLE_HISTORY_LINES))
            .with_file(paths.server_console_log())
            .with_events(events.clone());
        Self {
            paths,
            config,
            command,
            terminator,
            lifecycle: Arc::new(Mutex::new(())),
            state: Arc::new(Mutex::new(ControllerState::default())),
            events,
            sink,
            http: reachability::probe_client(),
            stop_wait: stop_wait_timeout(),
            reachability_timeout: reachability_timeout(),
        }
    }

    pub fn with_stop_wait(mut self, stop_wait: Duration) -> Self {
        self.stop_wait = stop_wait;
        self
    }

    pub(crate) fn sink(&self) -> &LogSink {
        &self.sink
    }

    pub(crate) fn events(&self) -> &broadcast::Sender<LauncherEvent> {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LauncherEvent> {
        self.events.subscribe()
    }

    pub async fn status(&self) -> ServerStatus {
        self.state.lock().await.status
    }

    pub async fn info(&self) -> ServerInfo {
        let st = self.state.lock().await;
        ServerInfo {
            url: st.current.as_ref().and_then(|c| c.url.clone()),
            status: st.status,
            pid: st.current.as_ref().map(|c| c.pid),
            reachable: st.reachable,
        }
    }

    /// Display URL of the running server, if it reported one.
    pub async fn current_url(&self) -> Option<String> {
        let st = self.state.lock().await;
        st.current.as_ref().and_then(|c| c.url.clone())
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.lock().await.last_error.clone()
    }

    pub async fn tracked_pids(&self) -> Vec<u32> {
        self.state.lock().await.registry.iter().copied().collect()
    }

    pub async fn logs(&self, cursor: u64, limit: usize) -> LogTail {
        self.sink.tail(cursor, limit).await
    }

    pub async fn start(&self, options: StartOptions) -> Result<StartOutcome, StartError> {
        let _guard = self.lifecycle.lock().await;
        self.start_locked(options).await
    }

    /// Always succeeds; termination failures are logged.
    pub async fn stop(&self) -> bool {
        let _guard = self.lifecycle.lock().await;
        self.teardown().await;
        true
    }

    /// Stop, then start again with the options of the previous start.
    pub async fn restart(&self) -> Result<StartOutcome, StartError> {
        let _guard = self.lifecycle.lock().await;
        let options = self.state.lock().await.last_options.clone().unwrap_or_default();
        self.start_locked(options).await
    }

    /// Tears everything down without waiting for an in-flight start to settle.
    pub async fn shutdown(&self) {
        self.teardown().await;
    }

    async fn start_locked(&self, options: StartOptions) -> Result<StartOutcome, StartError> {
        self.teardown().await;

        let generation = {
            let mut st = self.state.lock().await;
            st.generation = st.generation.wrapping_add(1);
            st.status = ServerStatus::Starting;
            st.last_options = Some(options.clone());
            st.last_error = None;
            st.reachable = false;
            st.generation
        };
        self.emit(LauncherEvent::Status {
            status: ServerStatus::Starting,
        });

        match self.launch(&options, generation).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.fail(generation, e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        options: &StartOptions,
        generation: u64,
    ) -> Result<StartOutcome, StartError> {
        let cfg = self.config.read().await.clone();
        let expose = options.expose.unwrap_or(cfg.serve_on_local_network);
        let host = if expose { "0.0.0.0" } else { "127.0.0.1" };
        let requested = options.port.filter(|p| *p != 0).unwrap_or(cfg.port);

        self.paths
            .ensure_dirs()
            .map_err(|e| StartError::Spawn(format!("prepare data directory: {e}")))?;
        let secret = secret_key::load_or_create(&self.paths.secret_key_file())
            .await
            .map_err(|e| StartError::Spawn(format_error_chain(&e)))?;

        let port = port_probe::find_free_port(requested, host)
            .await
            .ok_or(StartError::NoFreePort { start: requested })?;
        if port != requested {
            tracing::info!(requested, port, "requested port busy, using next free port");
        }

        let mut spec = self
            .command
            .build(host, port)
            .map_err(|e| StartError::Spawn(format_error_chain(&e)))?;
        spec.env.insert(
            "DATA_DIR".to_string(),
            self.paths.server_data_dir().display().to_string(),
        );
        spec.env.insert("WEBUI_SECRET_KEY".to_string(), secret);
        if cfg!(windows) {
            spec.env.insert("FROM_INIT_PY".to_string(), "true".to_string());
        }

        self.sink
            .emit(format!("[harbor] exec: {} (host {host}, port {port})", spec.command_line()))
            .await;
        // No await between spawn and registration: a cancelled start cannot orphan the child.
        let mut spawned = {
            let mut st = self.state.lock().await;
            let spawned = supervisor::spawn_server(&spec, &self.sink)
                .map_err(|e| StartError::Spawn(format_error_chain(&e)))?;
            let pid = spawned.pid;
            st.registry.insert(pid);
            st.current = Some(ServerProcess {
                pid,
                process_group_id: cfg!(unix).then_some(pid),
                host: host.to_string(),
                port,
                bind_url: None,
                url: None,
                started_at_unix_ms: unix_ms_now(),
                exit: spawned.exit_watch(),
            });
            spawned
        };
        let pid = spawned.pid;
        tracing::info!(pid, host, port, "server process spawned");

        let mut signal = self.command.ready_signal();
        let ready = match spawned.wait_ready(signal.as_mut()).await {
            Ok(ready) => ready,
            Err(e) => {
                if matches!(e, StartError::ExitedBeforeReady { .. }) {
                    let mut st = self.state.lock().await;
                    if st.current.as_ref().is_some_and(|c| c.pid == pid) {
                        st.current = None;
                    }
                }
                return Err(e);
            }
        };

        let url = ready.display_url();
        {
            let mut st = self.state.lock().await;
            let Some(cur) = st.current.as_mut().filter(|c| c.pid == pid) else {
                return Err(StartError::Monitor(
                    "server was torn down while starting".to_string(),
                ));
            };
            cur.bind_url = Some(ready.bind_url.clone());
            cur.url = Some(url.clone());
            st.status = ServerStatus::Started;
        }

        tracing::info!(pid, url = %url, bind_url = %ready.bind_url, "server started");
        self.sink
            .emit(format!("[harbor] server ready at {url}"))
            .await;
        self.emit(LauncherEvent::Started {
            url: url.clone(),
            pid,
        });
        self.emit(LauncherEvent::Status {
            status: ServerStatus::Started,
        });

        self.watch_exit(pid, spawned.exit_watch());
        self.watch_reachability(generation, url.clone());

        Ok(StartOutcome { url, pid })
    }

    async fn fail(&self, generation: u64, message: String) {
        {
            let mut st = self.state.lock().await;
            if st.generation != generation {
                return;
            }
            st.status = ServerStatus::Failed;
            st.last_error = Some(message.clone());
        }
        tracing::error!(error = %message, "server start failed");
        self.sink.emit(format!("[harbor] start failed: {message}")).await;
        self.emit(LauncherEvent::Failed { message });
        self.emit(LauncherEvent::Status {
            status: ServerStatus::Failed,
        });
    }

    /// Kills every registered process tree, then resets to `stopped`.
    async fn teardown(&self) {
        let (current, pids, was) = {
            let mut st = self.state.lock().await;
            st.generation = st.generation.wrapping_add(1);
            let pids: Vec<u32> = st.registry.iter().copied().collect();
            (st.current.take(), pids, st.status)
        };

        if !pids.is_empty() {
            self.sink
                .emit(format!("[harbor] stopping {} process(es)", pids.len()))
                .await;
        }
        for pid in &pids {
            let pid = *pid;
            let terminator = self.terminator.clone();
            match tokio::task::spawn_blocking(move || terminator.terminate_tree(pid)).await {
                Ok(Ok(())) => tracing::info!(pid, "terminated server process tree"),
                Ok(Err(e)) => tracing::warn!(pid, error = %e, "failed to terminate process tree"),
                Err(e) => tracing::warn!(pid, error = %e, "terminate task failed"),
            }
        }

        {
            let mut st = self.state.lock().await;
            for pid in &pids {
                st.registry.remove(pid);
            }
            st.status = ServerStatus::Stopped;
            st.reachable = false;
        }

        if let Some(mut cur) = current {
            match tokio::time::timeout(self.stop_wait, wait_exit(&mut cur.exit)).await {
                Ok(exit) => tracing::debug!(pid = cur.pid, code = ?exit.code, "server process gone"),
                Err(_) => tracing::warn!(
                    pid = cur.pid,
                    wait_ms = self.stop_wait.as_millis() as u64,
                    "server process still running after stop"
                ),
            }
            tracing::debug!(
                pid = cur.pid,
                pgid = ?cur.process_group_id,
                host = %cur.host,
                port = cur.port,
                bind_url = ?cur.bind_url,
                started_at_unix_ms = cur.started_at_unix_ms,
                "released server process"
            );
        }

        if was != ServerStatus::Stopped {
            self.emit(LauncherEvent::Status {
                status: ServerStatus::Stopped,
            });
        }
    }

    fn watch_exit(&self, pid: u32, mut exit: watch::Receiver<Option<ProcessExit>>) {
        let this = self.clone();
        tokio::spawn(async move {
            let done = wait_exit(&mut exit).await;
            let crash_message = {
                let mut st = this.state.lock().await;
                if !st.current.as_ref().is_some_and(|c| c.pid == pid) {
                    // Already released by a stop.
                    return;
                }
                // The pid stays registered so the next stop still signals its group.
                st.current = None;
                st.reachable = false;
                if st.status == ServerStatus::Started {
                    let message = format!(
                        "Server exited unexpectedly with code {}",
                        done.code
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "unknown".to_string())
                    );
                    st.status = ServerStatus::Failed;
                    st.last_error = Some(message.clone());
                    Some(message)
                } else {
                    None
                }
            };

            this.emit(LauncherEvent::Exited {
                pid,
                code: done.code,
            });
            if let Some(message) = crash_message {
                tracing::warn!(pid, code = ?done.code, "server crashed");
                this.emit(LauncherEvent::Failed { message });
                this.emit(LauncherEvent::Status {
                    status: ServerStatus::Failed,
                });
            }
        });
    }

    fn watch_reachability(&self, generation: u64, url: String) {
        let this = self.clone();
        tokio::spawn(async move {
            if !reachability::wait_until_reachable(&this.http, &url, this.reachability_timeout)
                .await
            {
                tracing::warn!(url = %url, "server did not become reachable");
                return;
            }
            {
                let mut st = this.state.lock().await;
                if st.generation != generation || st.status != ServerStatus::Started {
                    return;
                }
                st.reachable = true;
            }
            tracing::info!(url = %url, "server reachable");
            this.emit(LauncherEvent::Reachable { url });
        });
    }

    fn emit(&self, event: LauncherEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
