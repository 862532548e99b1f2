use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use url::Url;

use crate::error::{ToolManagerError, ToolManagerErrorCode, ToolManagerResult};

/// Raw response of a proxied GET, passed through regardless of status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ToolCallClient {
    client: Client,
}

impl ToolCallClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed building tool call client")?;
        Ok(Self { client })
    }

    /// GET when `payload` is absent or empty, otherwise POST it as JSON. Non-2xx
    /// answers become `ToolError` carrying the tool's body.
    pub async fn call(
        &self,
        port: u16,
        endpoint: &str,
        payload: Option<Vec<u8>>,
    ) -> ToolManagerResult<Vec<u8>> {
        let url = tool_url(port, endpoint)?;
        let request = match payload.filter(|body| !body.is_empty()) {
            Some(body) => self
                .client
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .body(body),
            None => self.client.get(url),
        };
        let response = request.send().await.map_err(call_failed)?;
        let status = response.status();
        let body = response.bytes().await.map_err(call_failed)?.to_vec();
        if !status.is_success() {
            return Err(ToolManagerError::tool_error(status.as_u16(), body));
        }
        Ok(body)
    }

    pub async fn proxy_get(&self, port: u16, path: &str) -> ToolManagerResult<ProxyResponse> {
        let url = tool_url(port, path)?;
        let response = self.client.get(url).send().await.map_err(call_failed)?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_owned();
        let body = response.bytes().await.map_err(call_failed)?.to_vec();
        Ok(ProxyResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Resolves `endpoint` against the tool's loopback origin. Anything that would leave
/// `127.0.0.1:<port>` is rejected.
pub fn tool_url(port: u16, endpoint: &str) -> ToolManagerResult<Url> {
    let endpoint = endpoint.trim();
    if endpoint.contains("://") || endpoint.starts_with("//") || endpoint.contains('\\') {
        return Err(invalid_endpoint(endpoint));
    }
    let base = Url::parse(&format!("http://127.0.0.1:{port}/"))
        .map_err(|err| ToolManagerError::new(ToolManagerErrorCode::CallFailed, err.to_string()))?;
    let url = base
        .join(endpoint.trim_start_matches('/'))
        .map_err(|_| invalid_endpoint(endpoint))?;
    if url.host_str() != Some("127.0.0.1") || url.port() != Some(port) {
        return Err(invalid_endpoint(endpoint));
    }
    Ok(url)
}

fn invalid_endpoint(endpoint: &str) -> ToolManagerError {
    ToolManagerError::new(
        ToolManagerErrorCode::CallFailed,
        format!("invalid tool endpoint `{endpoint}`"),
    )
}

fn call_failed(err: reqwest::Error) -> ToolManagerError {
    ToolManagerError::new(
        ToolManagerErrorCode::CallFailed,
        format!("call to tool failed: {err}"),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{bind_stub, StubState};

    fn client() -> ToolCallClient {
        ToolCallClient::new(Duration::from_secs(2)).expect("client")
    }

    #[test]
    fn tool_url_stays_on_loopback_port() {
        assert_eq!(
            tool_url(9100, "/api/run?x=1").expect("url").as_str(),
            "http://127.0.0.1:9100/api/run?x=1"
        );
        assert_eq!(
            tool_url(9100, "run").expect("url").as_str(),
            "http://127.0.0.1:9100/run"
        );
        assert_eq!(
            tool_url(9100, "/a/../../b").expect("url").as_str(),
            "http://127.0.0.1:9100/b"
        );
        for bad in ["http://example.com/x", "//example.com/x", "\\\\host\\x"] {
            let err = tool_url(9100, bad).expect_err("must reject");
            assert!(err.is(ToolManagerErrorCode::CallFailed), "{bad}");
        }
    }

    #[tokio::test]
    async fn call_uses_get_without_payload_and_post_with_one() {
        let (port, server) = bind_stub(Arc::new(StubState::default())).await;
        let client = client();

        let got = client.call(port, "/echo", None).await.expect("get");
        assert_eq!(got, b"GET");
        let got = client.call(port, "/echo", Some(Vec::new())).await.expect("empty");
        assert_eq!(got, b"GET");
        let got = client
            .call(port, "echo", Some(br#"{"q":"rain"}"#.to_vec()))
            .await
            .expect("post");
        assert_eq!(got, br#"{"q":"rain"}"#);
        server.abort();
    }

    #[tokio::test]
    async fn non_success_status_returns_tool_error_with_body() {
        let (port, server) = bind_stub(Arc::new(StubState::default())).await;
        let err = client()
            .call(port, "/fail", Some(b"{}".to_vec()))
            .await
            .expect_err("tool error");
        assert!(err.is(ToolManagerErrorCode::ToolError));
        assert_eq!(err.http_status, Some(500));
        assert_eq!(err.body.as_deref(), Some(&b"tool exploded"[..]));
        server.abort();
    }

    #[tokio::test]
    async fn unreachable_tool_is_call_failed() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        let err = client().call(port, "/echo", None).await.expect_err("refused");
        assert!(err.is(ToolManagerErrorCode::CallFailed));
    }

    #[tokio::test]
    async fn proxy_get_passes_through_status_and_content_type() {
        let (port, server) = bind_stub(Arc::new(StubState::default())).await;
        let client = client();
        let page = client.proxy_get(port, "/page").await.expect("page");
        assert_eq!(page.status, 200);
        assert_eq!(page.content_type, "text/html");
        assert_eq!(page.body, b"<p>widget</p>");

        let missing = client.proxy_get(port, "/nope").await.expect("404 is data");
        assert_eq!(missing.status, 404);
        server.abort();
    }
}
