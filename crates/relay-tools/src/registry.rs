use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use relay_core::error::{RelayError, Result};
use relay_core::traits::Tool;
use relay_core::types::{ToolCall, ToolDefinition, ToolResult};

use crate::args::prepare_arguments;

/// A tool call together with its outcome and wall time.
#[derive(Debug, Clone)]
pub struct ExecutedTool {
    pub call: ToolCall,
    pub result: ToolResult,
    pub elapsed: Duration,
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all registered tools, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Tool definitions for the given names, in the given order. Unknown names are skipped.
    pub fn definitions_for(&self, names: &[String]) -> Vec<ToolDefinition> {
        names
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| t.definition())
            .collect()
    }

    /// Get tool definitions for every registered tool.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    /// Execute a tool by name under its own timeout. Arguments are checked
    /// against the tool's input schema first.
    pub async fn execute(
        &self,
        name: &str,
        args: serde_json::Map<String, serde_json::Value>,
    ) -> Result<String> {
        let tool = self
            .get(name)
            .ok_or_else(|| RelayError::ToolNotFound(name.to_string()))?;
        let args = prepare_arguments(name, &tool.input_schema(), args)?;
        run_with_timeout(tool.as_ref(), args, Duration::from_secs(tool.timeout_secs())).await
    }

    /// Run calls sequentially for an agent restricted to `allowed`.
    ///
    /// Every call yields a result: unknown or unauthorized tools, invalid
    /// arguments, failures and timeouts become error results. The effective timeout is the tool's own,
    /// capped at `timeout_cap`.
    pub async fn execute_calls(
        &self,
        calls: &[ToolCall],
        allowed: &[String],
        timeout_cap: Duration,
    ) -> Vec<ExecutedTool> {
        let mut executed = Vec::with_capacity(calls.len());

        for call in calls {
            let start = Instant::now();
            let tool = self
                .get(&call.name)
                .filter(|_| allowed.iter().any(|a| a == &call.name));

            let result = match tool {
                None => {
                    warn!(tool = %call.name, "Tool not available to agent");
                    ToolResult::error(&call.name, RelayError::ToolNotFound(call.name.clone()).to_string())
                }
                Some(tool) => {
                    let timeout = Duration::from_secs(tool.timeout_secs()).min(timeout_cap);
                    let outcome = match prepare_arguments(&call.name, &tool.input_schema(), call.arguments.clone()) {
                        Ok(args) => run_with_timeout(tool.as_ref(), args, timeout).await,
                        Err(e) => Err(e),
                    };
                    match outcome {
                        Ok(output) => ToolResult::success(&call.name, output),
                        Err(e) => {
                            warn!(tool = %call.name, error = %e, "Tool execution failed");
                            ToolResult::error(&call.name, e.to_string())
                        }
                    }
                }
            };

            let elapsed = start.elapsed();
            debug!(tool = %call.name, elapsed_ms = elapsed.as_millis() as u64, ok = !result.is_error(), "Tool finished");
            executed.push(ExecutedTool {
                call: call.clone(),
                result,
                elapsed,
            });
        }

        executed
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_with_timeout(
    tool: &dyn Tool,
    args: serde_json::Map<String, serde_json::Value>,
    timeout: Duration,
) -> Result<String> {
    match tokio::time::timeout(timeout, tool.execute(args)).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::ToolTimeout {
            tool: tool.name().to_string(),
            timeout_secs: timeout.as_secs(),
        }),
    }
}
