// ABOUTME: JSON-RPC 2.0 over HTTP client for talking to tool workers (MCP style).
// ABOUTME: The Connector/ToolClient traits are the seam tests use to script workers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const PROTOCOL_VERSION: &str = "2024-11-05";
const SESSION_HEADER: &str = "mcp-session-id";

/// One tool advertised by a worker's `tools/list`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "parameters")]
    pub input_schema: Value,
}

/// Text result of a `tools/call`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

/// A connected worker.
#[async_trait]
pub trait ToolClient: Send + Sync {
    /// The tool catalogue. Also used as the health probe.
    async fn list_tools(&self) -> Result<Vec<ToolInfo>>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput>;
}

/// Opens clients to worker endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ToolClient>>;
}

/// JSON-RPC 2.0 request
#[derive(Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

/// JSON-RPC 2.0 response
#[derive(Deserialize, Debug)]
pub(crate) struct JsonRpcResponse {
    #[allow(dead_code)]
    #[serde(default)]
    id: Option<Value>,
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcError {
    #[allow(dead_code)]
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct ToolsListResult {
    #[serde(default)]
    tools: Vec<ToolInfo>,
}

#[derive(Deserialize)]
struct McpContent {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolsCallResult {
    #[serde(default)]
    content: Vec<McpContent>,
    #[serde(default)]
    is_error: bool,
}

/// Connects over HTTP and performs the `initialize` handshake.
pub struct HttpConnector {
    request_timeout: Duration,
}

impl HttpConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ToolClient>> {
        let client = HttpToolClient::new(endpoint, self.request_timeout)?;
        client.initialize().await?;
        Ok(Arc::new(client))
    }
}

/// HTTP client for one worker endpoint.
pub struct HttpToolClient {
    client: Client,
    endpoint: url::Url,
    next_id: AtomicU64,
    session: Mutex<Option<String>>,
}

impl HttpToolClient {
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self> {
        let endpoint = url::Url::parse(endpoint)
            .with_context(|| format!("Invalid worker endpoint: {}", endpoint))?;
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            next_id: AtomicU64::new(1),
            session: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    /// Initialize the MCP connection (handshake).
    pub async fn initialize(&self) -> Result<()> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "wko-supervisor",
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        self.request("initialize", Some(params)).await?.into_result("initialize")?;

        if let Err(e) = self.notify("notifications/initialized").await {
            tracing::debug!(error = %e, "Worker ignored initialized notification");
        }

        tracing::debug!(endpoint = %self.endpoint, "MCP connection initialized");
        Ok(())
    }

    async fn request(&self, method: &'static str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id: Some(self.next_id.fetch_add(1, Ordering::Relaxed)),
            method,
            params,
        };

        let resp = self
            .post(&req)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", method))?;
        self.remember_session(&resp);

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("{} returned HTTP {}", method, status);
        }

        let event_stream = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));
        let body = resp
            .text()
            .await
            .with_context(|| format!("Failed to read {} response", method))?;

        parse_rpc_body(&body, event_stream)
            .with_context(|| format!("Failed to parse {} response", method))
    }

    async fn notify(&self, method: &'static str) -> Result<()> {
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id: None,
            method,
            params: None,
        };
        let resp = self.post(&req).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("{} returned HTTP {}", method, resp.status());
        }
        Ok(())
    }

    fn post(&self, req: &JsonRpcRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(req);
        if let Some(session) = self.session().clone() {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder
    }

    fn remember_session(&self, resp: &reqwest::Response) {
        if let Some(id) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session() = Some(id.to_string());
        }
    }

    fn session(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ToolClient for HttpToolClient {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let result = self.request("tools/list", None).await?.into_result("tools/list")?;
        let list: ToolsListResult =
            serde_json::from_value(result).context("Failed to parse tools list")?;
        Ok(list.tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments
        });
        let resp = self.request("tools/call", Some(params)).await?;

        if let Some(err) = resp.error {
            return Ok(ToolOutput {
                text: format!("MCP error: {}", err.message),
                is_error: true,
            });
        }

        let result: ToolsCallResult = serde_json::from_value(resp.result.unwrap_or_default())
            .context("Failed to parse tool result")?;

        // Combine all text content
        let text = result
            .content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ToolOutput {
            text,
            is_error: result.is_error,
        })
    }
}

impl JsonRpcResponse {
    fn into_result(self, method: &str) -> Result<Value> {
        if let Some(err) = self.error {
            anyhow::bail!("MCP {} failed: {}", method, err.message);
        }
        Ok(self.result.unwrap_or_default())
    }
}

/// Decode a response body. Streamable HTTP servers may answer with an SSE
/// stream; the last `data:` event holding a JSON-RPC response wins.
pub(crate) fn parse_rpc_body(body: &str, event_stream: bool) -> Result<JsonRpcResponse> {
    if !event_stream {
        return serde_json::from_str(body).context("Invalid JSON-RPC response");
    }

    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<JsonRpcResponse>(data.trim()).ok())
        .last()
        .context("Event stream carried no JSON-RPC response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json_body() {
        let resp = parse_rpc_body(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#, false)
            .unwrap();
        assert!(resp.error.is_none());
        assert_eq!(resp.result.unwrap()["tools"], serde_json::json!([]));
    }

    #[test]
    fn test_parse_event_stream_body() {
        let body = "event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":3,\"error\":{\"code\":-32601,\"message\":\"nope\"}}\n\n";
        let resp = parse_rpc_body(body, true).unwrap();
        assert_eq!(resp.error.unwrap().message, "nope");
        assert!(parse_rpc_body("event: ping\n\n", true).is_err());
    }

    #[test]
    fn test_error_response_becomes_err() {
        let resp =
            parse_rpc_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":1,"message":"boom"}}"#, false)
                .unwrap();
        let err = resp.into_result("tools/list").unwrap_err();
        assert_eq!(err.to_string(), "MCP tools/list failed: boom");
    }

    #[test]
    fn test_tool_info_accepts_parameters_alias() {
        let info: ToolInfo = serde_json::from_value(serde_json::json!({
            "name": "plan",
            "parameters": {"type": "object"}
        }))
        .unwrap();
        assert_eq!(info.description, None);
        assert_eq!(info.input_schema["type"], "object");
    }

    #[test]
    fn test_invalid_endpoint_is_rejected() {
        assert!(HttpToolClient::new("not a url", Duration::from_secs(1)).is_err());
        let client = HttpToolClient::new("http://localhost:9000/mcp", Duration::from_secs(1)).unwrap();
        assert_eq!(client.endpoint(), "http://localhost:9000/mcp");
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = HttpConnector::new(Duration::from_secs(2));
        let err = connector
            .connect(&format!("http://127.0.0.1:{}/mcp", port))
            .await
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("Failed to send initialize request"));
    }
}
