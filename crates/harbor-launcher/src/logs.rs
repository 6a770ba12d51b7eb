use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Arc,
};

use harbor_process::{LauncherEvent, LogTail};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt},
    sync::{Mutex, broadcast, mpsc},
};

/// Console lines kept in memory for `server logs`.
pub(crate) const CONSOLE_HISTORY_LINES: usize = 1000;
/// `server.log` rolls over to `server.log.1` past this size.
const CONSOLE_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Next `\n`-terminated line from a child pipe, without the line ending.
///
/// Bytes that are not UTF-8 are replaced rather than ending the stream, so the pipe
/// keeps draining until EOF.
pub(crate) async fn read_console_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

/// Console history addressed by sequence numbers; the oldest lines fall off first.
#[derive(Debug)]
pub(crate) struct LogBuffer {
    next_seq: u64,
    capacity: usize,
    lines: VecDeque<(u64, String)>,
}

impl LogBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            next_seq: 1,
            capacity: capacity.max(1),
            lines: VecDeque::new(),
        }
    }

    pub(crate) fn push_line(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back((self.next_seq, line));
        self.next_seq += 1;
    }

    /// Lines after `cursor`, oldest first. Cursor 0 asks for the newest `limit` lines.
    pub(crate) fn tail_after(&self, cursor: u64, limit: usize) -> LogTail {
        let limit = limit.max(1);
        let page: Vec<&(u64, String)> = if cursor == 0 {
            let skip = self.lines.len().saturating_sub(limit);
            self.lines.iter().skip(skip).collect()
        } else {
            self.lines
                .iter()
                .filter(|(seq, _)| *seq > cursor)
                .take(limit)
                .collect()
        };
        LogTail {
            next_cursor: page.last().map(|(seq, _)| *seq).unwrap_or(cursor),
            lines: page.into_iter().map(|(_, line)| line.clone()).collect(),
        }
    }
}

/// Fan-out for server console lines: ring buffer, console file, event stream.
#[derive(Clone)]
pub(crate) struct LogSink {
    buffer: Arc<Mutex<LogBuffer>>,
    file_tx: Option<mpsc::UnboundedSender<String>>,
    events: Option<broadcast::Sender<LauncherEvent>>,
}

impl LogSink {
    pub(crate) fn new(buffer: LogBuffer) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(buffer)),
            file_tx: None,
            events: None,
        }
    }

    /// Mirrors every line into `path`. Must be called inside a runtime.
    pub(crate) fn with_file(mut self, path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut file = match ConsoleFile::open(path.clone(), CONSOLE_FILE_MAX_BYTES).await {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "server console log disabled");
                    return;
                }
            };
            while let Some(line) = rx.recv().await {
                if let Err(e) = file.append(&line).await {
                    tracing::debug!(path = %path.display(), error = %e, "console log write failed");
                }
            }
        });
        self.file_tx = Some(tx);
        self
    }

    pub(crate) fn with_events(mut self, events: broadcast::Sender<LauncherEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub(crate) async fn emit(&self, line: impl Into<String>) {
        let line = line.into();
        self.buffer.lock().await.push_line(line.clone());
        if let Some(tx) = &self.file_tx {
            let _ = tx.send(line.clone());
        }
        if let Some(events) = &self.events {
            let _ = events.send(LauncherEvent::Log { line });
        }
    }

    pub(crate) async fn tail(&self, cursor: u64, limit: usize) -> LogTail {
        self.buffer.lock().await.tail_after(cursor, limit)
    }
}

/// Append-only console file with a single `.1` backup.
struct ConsoleFile {
    path: PathBuf,
    max_bytes: u64,
    written: u64,
    file: tokio::fs::File,
}

impl ConsoleFile {
    async fn open(path: PathBuf, max_bytes: u64) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = Self::open_append(&path).await?;
        let written = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_bytes,
            written,
            file,
        })
    }

    async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
    }

    async fn append(&mut self, line: &str) -> std::io::Result<()> {
        let len = line.len() as u64 + 1;
        if self.written > 0 && self.written + len > self.max_bytes {
            self.file.flush().await?;
            let backup = PathBuf::from(format!("{}.1", self.path.display()));
            tokio::fs::rename(&self.path, backup).await?;
            self.file = Self::open_append(&self.path).await?;
            self.written = 0;
        }
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.written += len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_drops_oldest_lines() {
        let mut buf = LogBuffer::with_capacity(3);
        for i in 1..=5 {
            buf.push_line(format!("line {i}"));
        }
        let tail = buf.tail_after(0, 10);
        assert_eq!(tail.lines, vec!["line 3", "line 4", "line 5"]);
        assert_eq!(tail.next_cursor, 5);
    }

    #[test]
    fn cursor_resumes_after_last_seen_line() {
        let mut buf = LogBuffer::with_capacity(100);
        for i in 1..=4 {
            buf.push_line(format!("l{i}"));
        }
        let first = buf.tail_after(0, 2);
        assert_eq!(first.lines, vec!["l3", "l4"]);

        let page = buf.tail_after(1, 2);
        assert_eq!(page.lines, vec!["l2", "l3"]);
        assert_eq!(page.next_cursor, 3);

        let empty = buf.tail_after(4, 10);
        assert!(empty.lines.is_empty());
        assert_eq!(empty.next_cursor, 4);
    }

    #[tokio::test]
    async fn console_file_keeps_one_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        let mut f = ConsoleFile::open(path.clone(), 16).await.unwrap();
        f.append("0123456789").await.unwrap();
        f.append("abcdefghij").await.unwrap();
        f.append("klmnopqrst").await.unwrap();
        f.file.flush().await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "klmnopqrst\n");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("server.log.1")).unwrap(),
            "abcdefghij\n"
        );
        assert!(!dir.path().join("server.log.2").exists());
    }

    #[tokio::test]
    async fn non_utf8_bytes_do_not_end_the_stream() {
        let mut reader: &[u8] = b"caf\xe9\r\nnext\nlast";
        let mut buf = Vec::new();
        let mut lines = Vec::new();
        while let Some(line) = read_console_line(&mut reader, &mut buf).await.unwrap() {
            lines.push(line);
        }
        assert_eq!(lines, vec!["caf\u{fffd}", "next", "last"]);
    }

    #[tokio::test]
    async fn sink_publishes_log_events() {
        let (tx, mut rx) = broadcast::channel(8);
        let sink = LogSink::new(LogBuffer::with_capacity(10)).with_events(tx);
        sink.emit("hello").await;
        match rx.recv().await.unwrap() {
            LauncherEvent::Log { line } => assert_eq!(line, "hello"),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(sink.tail(0, 5).await.lines, vec!["hello"]);
    }
}
