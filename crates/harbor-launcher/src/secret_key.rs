use std::path::Path;

use anyhow::Context;
use rand::RngCore;

const KEY_BYTES: usize = 64;

/// Loads the signing key, generating and persisting one on first use. Never rotated.
pub async fn load_or_create(path: &Path) -> anyhow::Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(existing) => return Ok(existing),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("read secret key {}", path.display()));
        }
    }

    let key = generate();
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .context("create secret key dir")?;
    }
    tokio::fs::write(path, &key)
        .await
        .with_context(|| format!("write secret key {}", path.display()))?;
    tracing::info!(path = %path.display(), "generated server secret key");
    Ok(key)
}

fn generate() -> String {
    let mut buf = [0u8; KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn key_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join(".key");

        let first = load_or_create(&path).await.unwrap();
        assert_eq!(first.len(), KEY_BYTES * 2);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));

        let second = load_or_create(&path).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn existing_key_is_read_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".key");
        std::fs::write(&path, "abc123").unwrap();
        assert_eq!(load_or_create(&path).await.unwrap(), "abc123");
    }
}
