//! Liveness probe against an instance's agent endpoint.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Empty;
use tracing::debug;

/// Perform an HTTP liveness probe; true only for a 2xx response.
///
/// Connection errors, non-2xx responses, and timeouts all count as dead —
/// the pinger treats an unreachable agent as a failed launch either way.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> bool {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "liveness probe connection failed");
                return false;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "liveness probe handshake failed");
                return false;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "forgepool-pinger/0.1")
            .body(Empty::<Bytes>::new())
        {
            Ok(req) => req,
            Err(_) => return false,
        };

        match sender.send_request(req).await {
            Ok(resp) => {
                let alive = resp.status().is_success();
                if !alive {
                    debug!(status = %resp.status(), %uri, "liveness probe non-2xx");
                }
                alive
            }
            Err(e) => {
                debug!(error = %e, %uri, "liveness probe request failed");
                false
            }
        }
    })
    .await;

    match result {
        Ok(alive) => alive,
        Err(_) => {
            debug!(%uri, "liveness probe timed out");
            false
        }
    }
}
