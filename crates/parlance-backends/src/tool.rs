//! Tool executors.
//!
//! A tool is anything the model can invoke by name with structured
//! arguments: an in-process callback or a remote JSON-over-HTTP sidecar.
//! Side effects are entirely the tool's business; the runtime only records
//! the invocation and its outcome.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::{BackendError, Result};
use crate::llm::ToolSchema;

/// Structured result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub value: Value,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn success(value: Value) -> Self {
        Self {
            value,
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            value: Value::String(message.into()),
            is_error: true,
        }
    }
}

/// Trait every tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name (e.g. `"get_weather"`).
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the input parameters.
    fn input_schema(&self) -> Value;
    async fn execute(&self, input: Value) -> ToolOutcome;
}

/// Named collection of tools, looked up at call time.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas advertised to the model.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Find and execute the named tool. An unknown name is an error outcome,
    /// not a panic — the model sometimes invents tools.
    pub async fn execute(&self, name: &str, input: Value) -> ToolOutcome {
        match self.tools.iter().find(|t| t.name() == name) {
            Some(tool) => {
                debug!(tool = %name, "executing tool");
                tool.execute(input).await
            }
            None => ToolOutcome::error(format!("unknown tool: {name}")),
        }
    }
}

/// A tool backed by a remote JSON-over-HTTP sidecar.
///
/// POSTs `{"arguments": …}` to the endpoint; a 2xx JSON body is the result,
/// anything else is a structured error outcome.
pub struct RemoteTool {
    http: reqwest::Client,
    endpoint: String,
    name: String,
    description: String,
    schema: Value,
}

impl RemoteTool {
    pub fn new(
        endpoint: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            name: name.into(),
            description: description.into(),
            schema,
        }
    }

    async fn call(&self, input: Value) -> Result<Value> {
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&serde_json::json!({ "arguments": input }))
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Api { status, body });
        }
        resp.json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, input: Value) -> ToolOutcome {
        match self.call(input).await {
            Ok(value) => ToolOutcome::success(value),
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input back"
        }
        fn input_schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, input: Value) -> ToolOutcome {
            ToolOutcome::success(input)
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(Echo));
        let outcome = registry
            .execute("echo", serde_json::json!({"x": 1}))
            .await;
        assert!(!outcome.is_error);
        assert_eq!(outcome.value["x"], 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_outcome() {
        let registry = ToolRegistry::new();
        let outcome = registry.execute("nope", Value::Null).await;
        assert!(outcome.is_error);
    }

    #[test]
    fn schemas_reflect_registered_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(Echo));
        let schemas = registry.schemas();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].name, "echo");
    }
}
