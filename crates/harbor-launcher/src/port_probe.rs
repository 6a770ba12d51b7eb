use std::time::Duration;

use tokio::net::TcpStream;

/// Upper bound on candidates tried by [`find_free_port`].
pub const PORT_PROBE_LIMIT: u32 = 1000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Wildcard bind addresses are probed through loopback.
pub fn probe_host(host: &str) -> &str {
    match host.trim() {
        "" | "0.0.0.0" => "127.0.0.1",
        "::" | "[::]" => "::1",
        other => other,
    }
}

/// True when something accepts TCP connections on `host:port`.
///
/// Never fails: refusal, timeout and any other connect error all mean "free".
pub async fn is_port_in_use(port: u16, host: &str) -> bool {
    let host = probe_host(host);
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        Ok(Err(e)) => {
            tracing::trace!(port, host, error = %e, "port probe: connect failed");
            false
        }
        Err(_) => {
            tracing::trace!(port, host, "port probe: connect timed out");
            false
        }
    }
}

/// First free port at or above `start`, probing linearly.
pub async fn find_free_port(start: u16, host: &str) -> Option<u16> {
    let mut port = start.max(1);
    for _ in 0..PORT_PROBE_LIMIT {
        if !is_port_in_use(port, host).await {
            return Some(port);
        }
        tracing::debug!(port, "port in use, trying next");
        port = port.checked_add(1)?;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_probes_loopback() {
        assert_eq!(probe_host("0.0.0.0"), "127.0.0.1");
        assert_eq!(probe_host("127.0.0.1"), "127.0.0.1");
        assert_eq!(probe_host("::"), "::1");
    }

    #[tokio::test]
    async fn listener_is_detected() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_port_in_use(port, "127.0.0.1").await);
        assert!(is_port_in_use(port, "0.0.0.0").await);
        drop(listener);
        assert!(!is_port_in_use(port, "127.0.0.1").await);
    }

    #[tokio::test]
    async fn free_port_skips_occupied_ones() {
        let first = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = first.local_addr().unwrap().port();
        if port > u16::MAX - 2 {
            return;
        }
        let Ok(second) = tokio::net::TcpListener::bind(("127.0.0.1", port + 1)).await else {
            // Neighbouring port is taken by something else on this machine.
            return;
        };

        if is_port_in_use(port + 2, "127.0.0.1").await {
            return;
        }

        let found = find_free_port(port, "127.0.0.1").await.unwrap();
        assert_eq!(found, port + 2);
        drop((first, second));
    }

    #[tokio::test]
    async fn free_start_port_is_returned_as_is() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert_eq!(find_free_port(port, "127.0.0.1").await, Some(port));
    }
}
