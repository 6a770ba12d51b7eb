//! Helpers shared by unit tests: mock HTTP servers and a fake runtime.

use std::path::Path;

use axum::Router;

/// Serves `app` on an ephemeral loopback port and returns its base URL.
pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind mock server");
    let addr = listener.local_addr().expect("mock server addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

/// Shell stand-in for the runtime interpreter.
///
/// Answers `--version`, `-m uv --version`, `-m pip install uv`, and keeps
/// `uv pip install/show` state as marker files next to `bin/`.
#[cfg(unix)]
pub const FAKE_PYTHON: &str = r#"#!/bin/sh
root="$(cd "$(dirname "$0")/.." && pwd)"
if [ "$1" = "--version" ]; then
  echo "Python 3.11.13"
  exit 0
fi
if [ "$1" = "-m" ] && [ "$2" = "pip" ]; then
  echo "Successfully installed $4"
  touch "$root/uv-installed"
  exit 0
fi
if [ "$1" = "-m" ] && [ "$2" = "uv" ]; then
  if [ "$3" = "--version" ]; then
    [ -f "$root/uv-installed" ] || exit 1
    echo "uv 0.8.0"
    exit 0
  fi
  name="${5%%==*}"
  if [ "$4" = "show" ]; then
    if [ -f "$root/pkg-$name" ]; then
      echo "Name: $name"
      echo "Version: $(cat "$root/pkg-$name")"
      exit 0
    fi
    echo "warning: Package(s) not found for: $name" >&2
    exit 1
  fi
  if [ "$4" = "install" ]; then
    if [ "$name" = "does-not-exist" ]; then
      echo "error: No solution found" >&2
      exit 1
    fi
    version="${5#*==}"
    [ "$version" = "$5" ] && version="0.6.5"
    echo "$version" > "$root/pkg-$name"
    echo "Installed 1 package"
    exit 0
  fi
fi
exit 2
"#;

/// Writes [`FAKE_PYTHON`] as an already-unpacked runtime under `root`.
#[cfg(unix)]
pub fn install_fake_runtime(root: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let bin = root.join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let exe = bin.join("python3");
    std::fs::write(&exe, FAKE_PYTHON).unwrap();
    std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Builds a `.tar.gz` laid out like a standalone runtime release (`python/bin/python3`).
#[cfg(unix)]
pub fn write_fake_runtime_archive(path: &Path) {
    let file = std::fs::File::create(path).unwrap();
    let gz = flate2::write::GzEncoder::new(file, flate2::Compression::fast());
    let mut builder = tar::Builder::new(gz);

    let data = FAKE_PYTHON.as_bytes();
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder
        .append_data(&mut header, "python/bin/python3", data)
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap();
}
