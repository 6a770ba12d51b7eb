use std::{collections::BTreeMap, sync::Arc, time::Duration};

use harbor_process::{ProxyRequest, ProxyResponse};
use reqwest::{
    Method, Url,
    cookie::{CookieStore, Jar},
    header::{self, HeaderMap, HeaderName, HeaderValue},
};

use crate::ready_signal::normalize_display_url;

const PROXY_TIMEOUT: Duration = Duration::from_secs(120);

/// Base URL for a proxied request: explicit override, then the running server, then the
/// configured port on localhost. Wildcard hosts become `localhost`; no trailing slash.
pub fn resolve_base(base_override: Option<&str>, tracked: Option<&str>, default_port: u16) -> String {
    let raw = base_override
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| tracked.map(str::to_string))
        .unwrap_or_else(|| format!("http://localhost:{default_port}"));
    normalize_display_url(&raw).trim_end_matches('/').to_string()
}

/// Forwards requests from the quick-chat surface to the local server with the UI session's cookies.
#[derive(Clone)]
pub struct ProxyBridge {
    client: reqwest::Client,
    cookies: Arc<Jar>,
}

impl ProxyBridge {
    pub fn new(cookies: Arc<Jar>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROXY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, cookies }
    }

    /// Session cookie store shared with the UI shell.
    pub fn cookie_jar(&self) -> &Arc<Jar> {
        &self.cookies
    }

    /// Never fails: transport errors come back as `status: 0` with a `Proxy error:` body.
    pub async fn forward(&self, req: &ProxyRequest, base: &str) -> ProxyResponse {
        match self.try_forward(req, base).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(method = %req.method, path = %req.path, base, error = %e, "proxy request failed");
                ProxyResponse::failure(e)
            }
        }
    }

    async fn try_forward(&self, req: &ProxyRequest, base: &str) -> anyhow::Result<ProxyResponse> {
        let method = Method::from_bytes(req.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| anyhow::anyhow!("invalid method {:?}", req.method))?;
        let url = join_url(base, &req.path)?;

        let mut headers = HeaderMap::new();
        for (name, value) in &req.headers {
            let Ok(name) = HeaderName::from_bytes(name.trim().as_bytes()) else {
                tracing::debug!(header = %name, "dropping invalid header name");
                continue;
            };
            if name == header::COOKIE || name == header::HOST || name == header::CONTENT_LENGTH {
                continue;
            }
            let Ok(value) = HeaderValue::from_str(value) else {
                tracing::debug!(header = %name, "dropping invalid header value");
                continue;
            };
            headers.append(name, value);
        }
        // The session's cookies replace whatever the caller sent.
        if let Some(cookie) = self.cookies.cookies(&url) {
            headers.insert(header::COOKIE, cookie);
        }

        let mut builder = self.client.request(method, url.clone()).headers(headers);
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }

        let resp = builder.send().await?;
        let status = resp.status();

        let mut set_cookies = resp.headers().get_all(header::SET_COOKIE).iter().peekable();
        if set_cookies.peek().is_some() {
            self.cookies.set_cookies(&mut set_cookies, &url);
        }
        let headers = flatten_headers(resp.headers());
        let body_text = resp.text().await?;

        tracing::debug!(url = %url, status = status.as_u16(), "proxied request");
        Ok(ProxyResponse {
            ok: status.is_success(),
            status: status.as_u16(),
            headers,
            body_text,
        })
    }
}

fn join_url(base: &str, path: &str) -> anyhow::Result<Url> {
    let base = base.trim_end_matches('/');
    let joined = if path.is_empty() || path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    };
    Url::parse(&joined).map_err(|e| anyhow::anyhow!("invalid url {joined}: {e}"))
}

fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::<String, String>::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name.as_str().to_string())
            .and_modify(|v| {
                v.push_str(", ");
                v.push_str(&value);
            })
            .or_insert(value);
    }
    out
}

#[cfg(test)]
mod tests {
    use axum::{
        Router,
        http::{HeaderMap as AxumHeaders, StatusCode},
        response::AppendHeaders,
        routing::{get, post},
    };

    use super::*;
    use crate::test_support;

    fn echo_server() -> Router {
        Router::new()
            .route(
                "/x",
                get(|| async {
                    (
                        AppendHeaders([("x-multi", "a"), ("x-multi", "b")]),
                        "ok",
                    )
                }),
            )
            .route(
                "/cookie",
                get(|headers: AxumHeaders| async move {
                    headers
                        .get("cookie")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string()
                }),
            )
            .route(
                "/api/chat",
                post(|body: String| async move { (StatusCode::CREATED, format!("got {body}")) }),
            )
            .route(
                "/login",
                get(|| async { (AppendHeaders([("set-cookie", "token=t1; Path=/")]), "in") }),
            )
    }

    #[tokio::test]
    async fn passes_status_headers_and_body_through() {
        let base = test_support::serve(echo_server()).await;
        let bridge = ProxyBridge::new(Arc::new(Jar::default()));

        let resp = bridge.forward(&ProxyRequest::get("/x"), &base).await;
        assert!(resp.ok);
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body_text, "ok");
        assert_eq!(resp.headers.get("x-multi").map(String::as_str), Some("a, b"));

        let missing = bridge.forward(&ProxyRequest::get("/nope"), &base).await;
        assert!(!missing.ok);
        assert_eq!(missing.status, 404);
    }

    #[tokio::test]
    async fn posts_body_with_method() {
        let base = test_support::serve(echo_server()).await;
        let bridge = ProxyBridge::new(Arc::new(Jar::default()));
        let req = ProxyRequest {
            method: "post".to_string(),
            path: "/api/chat".to_string(),
            headers: BTreeMap::from([("content-type".to_string(), "text/plain".to_string())]),
            body: Some("hello".to_string()),
            base_override: None,
        };
        let resp = bridge.forward(&req, &base).await;
        assert_eq!(resp.status, 201);
        assert_eq!(resp.body_text, "got hello");
    }

    #[tokio::test]
    async fn session_cookies_replace_caller_cookie() {
        let base = test_support::serve(echo_server()).await;
        let jar = Arc::new(Jar::default());
        let mut req = ProxyRequest::get("/cookie");
        req.headers
            .insert("Cookie".to_string(), "forged=1".to_string());

        let bridge = ProxyBridge::new(jar.clone());
        let resp = bridge.forward(&req, &base).await;
        assert_eq!(resp.body_text, "");

        jar.add_cookie_str("token=abc", &Url::parse(&base).unwrap());
        let resp = bridge.forward(&req, &base).await;
        assert_eq!(resp.body_text, "token=abc");
    }

    #[tokio::test]
    async fn response_cookies_join_the_session() {
        let base = test_support::serve(echo_server()).await;
        let bridge = ProxyBridge::new(Arc::new(Jar::default()));
        bridge.forward(&ProxyRequest::get("/login"), &base).await;
        let resp = bridge.forward(&ProxyRequest::get("/cookie"), &base).await;
        assert_eq!(resp.body_text, "token=t1");
    }

    #[tokio::test]
    async fn unreachable_server_is_a_status_zero_response() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let bridge = ProxyBridge::new(Arc::new(Jar::default()));
        let resp = bridge
            .forward(&ProxyRequest::get("/x"), &format!("http://127.0.0.1:{port}"))
            .await;
        assert!(!resp.ok);
        assert_eq!(resp.status, 0);
        assert!(resp.headers.is_empty());
        assert!(resp.body_text.starts_with("Proxy error: "));
    }

    #[tokio::test]
    async fn invalid_method_is_reported_not_raised() {
        let bridge = ProxyBridge::new(Arc::new(Jar::default()));
        let mut req = ProxyRequest::get("/x");
        req.method = "NOT A METHOD".to_string();
        let resp = bridge.forward(&req, "http://127.0.0.1:9").await;
        assert_eq!(resp.status, 0);
    }

    #[test]
    fn base_resolution_order() {
        assert_eq!(
            resolve_base(Some("http://0.0.0.0:9000/"), Some("http://127.0.0.1:8080"), 8080),
            "http://localhost:9000"
        );
        assert_eq!(
            resolve_base(Some("  "), Some("http://127.0.0.1:8081"), 8080),
            "http://127.0.0.1:8081"
        );
        assert_eq!(resolve_base(None, None, 3000), "http://localhost:3000");
    }
}
