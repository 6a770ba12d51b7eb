use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub(crate) fn probe_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap_or_default()
}

/// Any HTTP response counts; only transport failures mean "not reachable".
pub async fn is_reachable(client: &reqwest::Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(resp) => {
            tracing::trace!(url, status = resp.status().as_u16(), "reachability probe answered");
            true
        }
        Err(e) => {
            tracing::trace!(url, error = %e, "reachability probe failed");
            false
        }
    }
}

pub async fn wait_until_reachable(client: &reqwest::Client, url: &str, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if is_reachable(client, url).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use axum::{Router, http::StatusCode, routing::get};

    use super::*;
    use crate::test_support;

    #[tokio::test]
    async fn error_status_still_counts_as_reachable() {
        let app = Router::new().route("/", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let base = test_support::serve(app).await;
        assert!(is_reachable(&probe_client(), &base).await);
    }

    #[tokio::test]
    async fn closed_port_times_out() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let url = format!("http://127.0.0.1:{port}");
        assert!(!wait_until_reachable(&probe_client(), &url, Duration::from_millis(200)).await);
    }
}
