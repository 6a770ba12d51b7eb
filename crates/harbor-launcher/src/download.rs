use std::path::{Path, PathBuf};

use anyhow::Context;
use harbor_process::DownloadProgress;
use tokio::io::AsyncWriteExt;

/// An in-flight archive download, consumed as a finite sequence of progress events.
///
/// Bytes are streamed to `<dest>.part`; the file is renamed to `dest` only after the
/// body ends, so an interrupted download never looks like a complete archive. The
/// sequence cannot be restarted.
pub struct ArchiveDownload {
    response: reqwest::Response,
    file: Option<tokio::fs::File>,
    part_path: PathBuf,
    dest: PathBuf,
    downloaded: u64,
    total: Option<u64>,
    finished: bool,
}

impl ArchiveDownload {
    /// Issues the request. Non-success HTTP statuses are errors.
    pub async fn begin(client: &reqwest::Client, url: &str, dest: &Path) -> anyhow::Result<Self> {
        let response = client
            .get(url)
            .send()
            .await
            .with_context(|| format!("download {url}"))?
            .error_for_status()
            .with_context(|| format!("download {url} (status)"))?;
        let total = response.content_length().filter(|len| *len > 0);

        if let Some(dir) = dest.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .context("create download dir")?;
        }
        let part_path = PathBuf::from(format!("{}.part", dest.display()));
        let file = tokio::fs::File::create(&part_path)
            .await
            .with_context(|| format!("create {}", part_path.display()))?;

        Ok(Self {
            response,
            file: Some(file),
            part_path,
            dest: dest.to_path_buf(),
            downloaded: 0,
            total,
            finished: false,
        })
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total
    }

    /// Next progress event, or `None` once the archive has been persisted.
    pub async fn next(&mut self) -> Option<anyhow::Result<DownloadProgress>> {
        if self.finished {
            return None;
        }
        match self.pull().await {
            Ok(Some(progress)) => Some(Ok(progress)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                self.file = None;
                let _ = tokio::fs::remove_file(&self.part_path).await;
                Some(Err(e))
            }
        }
    }

    async fn pull(&mut self) -> anyhow::Result<Option<DownloadProgress>> {
        let chunk = self
            .response
            .chunk()
            .await
            .context("read archive body chunk")?;
        let Some(chunk) = chunk else {
            self.persist().await?;
            return Ok(None);
        };

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("download already finished"))?;
        file.write_all(&chunk)
            .await
            .context("write archive chunk")?;
        self.downloaded = self.downloaded.saturating_add(chunk.len() as u64);
        Ok(Some(DownloadProgress::new(self.downloaded, self.total)))
    }

    async fn persist(&mut self) -> anyhow::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await.context("flush archive")?;
            file.sync_all().await.ok();
        }
        tokio::fs::rename(&self.part_path, &self.dest)
            .await
            .with_context(|| format!("persist {}", self.dest.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use axum::{Router, http::header, routing::get};

    #[tokio::test]
    async fn streams_body_to_dest_with_progress() {
        let body = vec![7u8; 256 * 1024];
        let len = body.len();
        let app = Router::new().route(
            "/py.tar.gz",
            get(move || {
                let body = body.clone();
                async move { ([(header::CONTENT_LENGTH, len.to_string())], body) }
            }),
        );
        let base = test_support::serve(app).await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("py.tar.gz");
        let client = reqwest::Client::new();
        let mut dl = ArchiveDownload::begin(&client, &format!("{base}/py.tar.gz"), &dest)
            .await
            .unwrap();
        assert_eq!(dl.total_bytes(), Some(len as u64));

        let mut last = None;
        while let Some(ev) = dl.next().await {
            last = Some(ev.unwrap());
        }
        let last = last.unwrap();
        assert_eq!(last.downloaded_bytes, len as u64);
        assert_eq!(last.percent, Some(100.0));
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), len as u64);
        assert!(!dir.path().join("py.tar.gz.part").exists());

        // Exhausted sequences stay exhausted.
        assert!(dl.next().await.is_none());
    }

    #[tokio::test]
    async fn http_error_status_is_an_error() {
        let app = Router::new();
        let base = test_support::serve(app).await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("py.tar.gz");
        let client = reqwest::Client::new();
        let res = ArchiveDownload::begin(&client, &format!("{base}/missing"), &dest).await;
        assert!(res.is_err());
        assert!(!dest.exists());
    }
}
