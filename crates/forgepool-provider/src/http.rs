//! HTTP provider adapter.
//!
//! Speaks plain HTTP/1.1 to a provisioning endpoint that fronts the actual
//! cloud API, keeping vendor SDKs out of the pool entirely:
//!
//! | Method | Path | Meaning |
//! |---|---|---|
//! | POST | `/v1/instances` | launch (body: [`LaunchSpec`]) |
//! | DELETE | `/v1/instances/{id}` | terminate |
//! | GET | `/v1/instances?tag={tag}` | list pool-owned instances |
//! | GET | `/v1/instances/{id}` | describe |
//!
//! Every call carries the configured timeout; timeouts and connection
//! errors are transient, 429/5xx are transient, 404 is `NotFound`, and any
//! other 4xx is permanent.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use serde::Deserialize;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};
use crate::types::{LaunchSpec, ProviderInstance};
use crate::Provider;

/// REST adapter to a provisioning endpoint.
pub struct HttpProvider {
    /// Endpoint address, `host:port`.
    addr: String,
    /// Per-call timeout.
    timeout: Duration,
}

#[derive(Deserialize)]
struct LaunchResponse {
    id: String,
}

impl HttpProvider {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    /// Issue one request and collect the response body.
    async fn request(
        &self,
        method: Method,
        path: String,
        body: Option<Vec<u8>>,
    ) -> ProviderResult<(StatusCode, Bytes)> {
        let uri = format!("http://{}{}", self.addr, path);

        let call = async {
            let stream = tokio::net::TcpStream::connect(&self.addr)
                .await
                .map_err(|e| ProviderError::Transient(format!("connect {}: {e}", self.addr)))?;

            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) =
                hyper::client::conn::http1::handshake::<_, Full<Bytes>>(io)
                    .await
                    .map_err(|e| ProviderError::Transient(format!("handshake {uri}: {e}")))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let mut builder = http::Request::builder()
                .method(method)
                .uri(&uri)
                .header("host", &self.addr)
                .header("user-agent", "forgepool-provider/0.1");
            if body.is_some() {
                builder = builder.header("content-type", "application/json");
            }
            let req = builder
                .body(Full::new(Bytes::from(body.unwrap_or_default())))
                .map_err(|e| ProviderError::Permanent(format!("build request {uri}: {e}")))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| ProviderError::Transient(format!("request {uri}: {e}")))?;

            let status = resp.status();
            let bytes = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| ProviderError::Transient(format!("read body {uri}: {e}")))?
                .to_bytes();
            Ok((status, bytes))
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                debug!(%uri, "provider request timed out");
                Err(ProviderError::Transient(format!(
                    "request to {uri} timed out"
                )))
            }
        }
    }

    /// Map a non-success status onto the error taxonomy.
    fn status_error(status: StatusCode, subject: &str) -> ProviderError {
        if status == StatusCode::NOT_FOUND {
            ProviderError::NotFound(subject.to_string())
        } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            ProviderError::Transient(format!("{subject}: provider returned {status}"))
        } else {
            ProviderError::Permanent(format!("{subject}: provider returned {status}"))
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn launch(&self, spec: &LaunchSpec) -> ProviderResult<String> {
        let body = serde_json::to_vec(spec)
            .map_err(|e| ProviderError::Permanent(format!("encode launch spec: {e}")))?;
        let (status, bytes) = self
            .request(Method::POST, "/v1/instances".to_string(), Some(body))
            .await?;
        if !status.is_success() {
            return Err(Self::status_error(status, &spec.name));
        }
        let resp: LaunchResponse = serde_json::from_slice(&bytes)
            .map_err(|e| ProviderError::Transient(format!("decode launch response: {e}")))?;
        debug!(id = %resp.id, "instance launch accepted");
        Ok(resp.id)
    }

    async fn terminate(&self, id: &str) -> ProviderResult<()> {
        let (status, _) = self
            .request(Method::DELETE, format!("/v1/instances/{id}"), None)
            .await?;
        if !status.is_success() {
            return Err(Self::status_error(status, id));
        }
        debug!(%id, "instance terminate accepted");
        Ok(())
    }

    async fn list_tagged(&self, pool_tag: &str) -> ProviderResult<Vec<ProviderInstance>> {
        let (status, bytes) = self
            .request(Method::GET, format!("/v1/instances?tag={pool_tag}"), None)
            .await?;
        if !status.is_success() {
            return Err(Self::status_error(status, pool_tag));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| ProviderError::Transient(format!("decode instance list: {e}")))
    }

    async fn describe(&self, id: &str) -> ProviderResult<ProviderInstance> {
        let (status, bytes) = self
            .request(Method::GET, format!("/v1/instances/{id}"), None)
            .await?;
        if !status.is_success() {
            return Err(Self::status_error(status, id));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| ProviderError::Transient(format!("decode instance: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Serve one canned HTTP response, then close.
    async fn serve_once(response: String) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = sock.read(&mut buf).await;
            sock.write_all(response.as_bytes()).await.unwrap();
            let _ = sock.shutdown().await;
        });
        addr
    }

    fn json_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[tokio::test]
    async fn describe_parses_instance() {
        let body = r#"{"id":"agent-1","state":"running","address":"10.0.0.5:9631","launched_at":1000}"#;
        let addr = serve_once(json_response("200 OK", body)).await;

        let provider = HttpProvider::new(addr, Duration::from_secs(2));
        let instance = provider.describe("agent-1").await.unwrap();

        assert_eq!(instance.id, "agent-1");
        assert_eq!(instance.address.as_deref(), Some("10.0.0.5:9631"));
    }

    #[tokio::test]
    async fn describe_404_is_not_found() {
        let addr = serve_once(json_response("404 Not Found", "{}")).await;
        let provider = HttpProvider::new(addr, Duration::from_secs(2));

        let err = provider.describe("agent-1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_tagged_parses_array() {
        let body = r#"[{"id":"agent-1","state":"pending","address":null,"launched_at":1}]"#;
        let addr = serve_once(json_response("200 OK", body)).await;
        let provider = HttpProvider::new(addr, Duration::from_secs(2));

        let listed = provider.list_tagged("forgepool").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "agent-1");
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let addr = serve_once(json_response("500 Internal Server Error", "{}")).await;
        let provider = HttpProvider::new(addr, Duration::from_secs(2));

        let err = provider.terminate("agent-1").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn client_error_is_permanent() {
        let addr = serve_once(json_response("400 Bad Request", "{}")).await;
        let provider = HttpProvider::new(addr, Duration::from_secs(2));

        let spec = crate::LaunchTemplate {
            instance_type: "t2.medium".to_string(),
            region: "eu-central-1".to_string(),
            subnet_id: "subnet-1".to_string(),
            security_group: "sg-1".to_string(),
            pool_tag: "forgepool".to_string(),
        }
        .to_spec("agent-1", "tok");

        let err = provider.launch(&spec).await.unwrap_err();
        assert!(matches!(err, ProviderError::Permanent(_)));
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        // Port 1 won't be listening.
        let provider = HttpProvider::new("127.0.0.1:1", Duration::from_millis(500));
        let err = provider.describe("agent-1").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn silent_server_times_out_as_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // Accept but never respond.
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let provider = HttpProvider::new(addr, Duration::from_millis(200));
        let err = provider.describe("agent-1").await.unwrap_err();
        assert!(err.is_transient());
    }
}
