//! HTTP coordinator adapter.
//!
//! Reads demand from the CI coordinator's REST API:
//!
//! | Method | Path | Meaning |
//! |---|---|---|
//! | GET | `/api/queue` | pending job count (`{"pending": n}`) |
//! | GET | `/api/agents` | registered agents (`[{"agent_id", "busy"}]`) |
//! | POST | `/api/agents/{id}/drain` | stop assigning jobs to an agent |
//!
//! Every failure — connect, timeout, non-2xx, decode — maps to
//! [`CoordinatorError::Unavailable`]; a 404 on drain is tolerated (the
//! agent is already gone, which is what draining wanted).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use serde::Deserialize;
use tracing::debug;

use crate::types::AgentInfo;
use crate::{Coordinator, CoordinatorError, CoordinatorResult};

/// REST adapter to the CI coordinator.
pub struct HttpCoordinator {
    /// Coordinator address, `host:port`.
    addr: String,
    /// Per-call timeout.
    timeout: Duration,
}

#[derive(Deserialize)]
struct QueueResponse {
    pending: u64,
}

impl HttpCoordinator {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    async fn request(&self, method: Method, path: String) -> CoordinatorResult<(StatusCode, Bytes)> {
        let uri = format!("http://{}{}", self.addr, path);
        let unavailable = |msg: String| CoordinatorError::Unavailable(msg);

        let call = async {
            let stream = tokio::net::TcpStream::connect(&self.addr)
                .await
                .map_err(|e| unavailable(format!("connect {}: {e}", self.addr)))?;

            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, Full<Bytes>>(io)
                .await
                .map_err(|e| unavailable(format!("handshake {uri}: {e}")))?;

            tokio::spawn(async move {
                let _ = conn.await;
            });

            let req = http::Request::builder()
                .method(method)
                .uri(&uri)
                .header("host", &self.addr)
                .header("user-agent", "forgepool-coordinator/0.1")
                .body(Full::new(Bytes::new()))
                .map_err(|e| unavailable(format!("build request {uri}: {e}")))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| unavailable(format!("request {uri}: {e}")))?;

            let status = resp.status();
            let bytes = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| unavailable(format!("read body {uri}: {e}")))?
                .to_bytes();
            Ok((status, bytes))
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                debug!(%uri, "coordinator request timed out");
                Err(CoordinatorError::Unavailable(format!(
                    "request to {uri} timed out"
                )))
            }
        }
    }
}

#[async_trait]
impl Coordinator for HttpCoordinator {
    async fn pending_jobs(&self) -> CoordinatorResult<u64> {
        let (status, bytes) = self.request(Method::GET, "/api/queue".to_string()).await?;
        if !status.is_success() {
            return Err(CoordinatorError::Unavailable(format!(
                "queue read returned {status}"
            )));
        }
        let queue: QueueResponse = serde_json::from_slice(&bytes)
            .map_err(|e| CoordinatorError::Unavailable(format!("decode queue: {e}")))?;
        Ok(queue.pending)
    }

    async fn active_agents(&self) -> CoordinatorResult<Vec<AgentInfo>> {
        let (status, bytes) = self.request(Method::GET, "/api/agents".to_string()).await?;
        if !status.is_success() {
            return Err(CoordinatorError::Unavailable(format!(
                "agent list returned {status}"
            )));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| CoordinatorError::Unavailable(format!("decode agents: {e}")))
    }

    async fn drain_agent(&self, agent_id: &str) -> CoordinatorResult<()> {
        let (status, _) = self
            .request(Method::POST, format!("/api/agents/{agent_id}/drain"))
            .await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!(%agent_id, "drain signal delivered");
            Ok(())
        } else {
            Err(CoordinatorError::Unavailable(format!(
                "drain returned {status}"
            )))
        }
    }
}
