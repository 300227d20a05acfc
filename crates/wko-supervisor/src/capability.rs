// ABOUTME: Capabilities: discovered worker tools, namespaced by worker id and invocable by callers.
// ABOUTME: Invocation never fails outwardly; errors come back as descriptive text.

use crate::rpc::{ToolClient, ToolInfo};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

const DEFAULT_DESCRIPTION: &str = "No description provided.";

/// A tool exposed by a running worker.
#[derive(Clone)]
pub struct Capability {
    /// `<worker id>_<tool name>`
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub worker_id: String,
    pub tool_name: String,
    client: Arc<dyn ToolClient>,
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("worker_id", &self.worker_id)
            .field("tool_name", &self.tool_name)
            .finish_non_exhaustive()
    }
}

impl Capability {
    pub fn new(worker_id: &str, info: ToolInfo, client: Arc<dyn ToolClient>) -> Self {
        let description = info
            .description
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string());

        Self {
            name: format!("{}_{}", worker_id, info.name),
            description: format!("[{}] {}", worker_id, description),
            parameters: info.input_schema,
            worker_id: worker_id.to_string(),
            tool_name: info.name,
            client,
        }
    }

    /// Call the tool on its worker and return the result as text.
    pub async fn invoke(&self, arguments: Value) -> String {
        invoke_remote_tool(self.client.as_ref(), &self.worker_id, &self.tool_name, arguments).await
    }
}

/// Forward a call to a worker's tool. Failures are rendered as text so one
/// broken tool cannot take down the caller.
pub async fn invoke_remote_tool(
    client: &dyn ToolClient,
    worker_id: &str,
    tool_name: &str,
    arguments: Value,
) -> String {
    match client.call_tool(tool_name, arguments).await {
        Ok(output) if output.is_error => {
            tracing::warn!(worker = %worker_id, tool = %tool_name, "Tool reported an error");
            format!("Error from tool {}: {}", tool_name, output.text)
        }
        Ok(output) => output.text,
        Err(e) => {
            tracing::error!(worker = %worker_id, tool = %tool_name, error = %e, "Tool call failed");
            format!("Error calling tool {}: {:#}", tool_name, e)
        }
    }
}

/// One capability per advertised tool.
pub fn build_capabilities(
    worker_id: &str,
    tools: Vec<ToolInfo>,
    client: &Arc<dyn ToolClient>,
) -> Vec<Capability> {
    tools
        .into_iter()
        .map(|info| Capability::new(worker_id, info, Arc::clone(client)))
        .collect()
}
