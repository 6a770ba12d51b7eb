use std::sync::OnceLock;

use regex::Regex;

/// A server announced where it is listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyLine {
    /// URL exactly as printed (may carry a wildcard host).
    pub bind_url: String,
}

impl ReadyLine {
    pub fn display_url(&self) -> String {
        normalize_display_url(&self.bind_url)
    }
}

/// Recognizes the "server is up" line in console output.
pub trait ReadySignal: Send {
    fn feed(&mut self, line: &str) -> Option<ReadyLine>;
}

/// Matches `Uvicorn running on <url> (Press CTRL+C to quit)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UvicornReady;

fn uvicorn_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Uvicorn running on (https?://[^\s]+) \(Press CTRL\+C to quit\)")
            .expect("ready pattern is a valid regex")
    })
}

impl ReadySignal for UvicornReady {
    fn feed(&mut self, line: &str) -> Option<ReadyLine> {
        let caps = uvicorn_pattern().captures(line)?;
        Some(ReadyLine {
            bind_url: caps.get(1)?.as_str().to_string(),
        })
    }
}

/// Rewrites wildcard hosts (`0.0.0.0`, `::`) to `localhost`. Unparseable input is returned as is.
pub fn normalize_display_url(raw: &str) -> String {
    let Ok(mut url) = reqwest::Url::parse(raw) else {
        return raw.to_string();
    };
    let wildcard = matches!(url.host_str(), Some("0.0.0.0") | Some("[::]") | Some("::"));
    if wildcard && url.set_host(Some("localhost")).is_ok() {
        let s = url.to_string();
        // Url serializes an empty path as "/"; keep the server's spelling.
        if !raw.ends_with('/') {
            return s.strip_suffix('/').map(str::to_string).unwrap_or(s);
        }
        return s;
    }
    raw.to_string()
}
