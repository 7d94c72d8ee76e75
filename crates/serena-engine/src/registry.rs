use std::collections::HashMap;
use std::sync::Arc;

use serena_core::tools::{Tool, ToolDefinition, ToolKind};

/// Static name → tool table the supervisor dispatches through.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. A later registration under the same name replaces
    /// the earlier one.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(Arc::clone)
    }

    pub fn kind(&self, name: &str) -> Option<ToolKind> {
        self.tools.get(name).map(|t| t.kind())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Function declarations for the routing model, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use serena_core::tools::{ToolContext, ToolError, ToolResult};

    struct DummyTool {
        name: &'static str,
        kind: ToolKind,
    }

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "test tool"
        }
        fn kind(&self) -> ToolKind {
            self.kind
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn invoke(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::ok(Map::new()))
        }
    }

    fn tool(name: &'static str, kind: ToolKind) -> Arc<dyn Tool> {
        Arc::new(DummyTool { name, kind })
    }

    #[test]
    fn register_and_lookup() {
        let registry = ToolRegistry::new()
            .with(tool("call_bq_agent", ToolKind::Query))
            .with(tool("call_email_agent", ToolKind::Email));
        assert_eq!(registry.count(), 2);
        assert!(registry.contains("call_bq_agent"));
        assert!(registry.get("call_poster_agent").is_none());
        assert_eq!(registry.kind("call_email_agent"), Some(ToolKind::Email));
    }

    #[test]
    fn names_and_definitions_sorted() {
        let registry = ToolRegistry::new()
            .with(tool("call_visualization_agent", ToolKind::Visualization))
            .with(tool("call_chat_agent", ToolKind::Conversation))
            .with(tool("call_bq_agent", ToolKind::Query));
        assert_eq!(
            registry.names(),
            vec!["call_bq_agent", "call_chat_agent", "call_visualization_agent"]
        );
        let defs = registry.definitions();
        assert_eq!(defs[0].name, "call_bq_agent");
        assert_eq!(defs[2].description, "test tool");
    }

    #[test]
    fn re_registering_replaces() {
        let mut registry = ToolRegistry::new();
        registry.register(tool("call_chat_agent", ToolKind::Conversation));
        registry.register(tool("call_chat_agent", ToolKind::Query));
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.kind("call_chat_agent"), Some(ToolKind::Query));
    }
}
