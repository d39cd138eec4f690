use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::codec::Frame;
use crate::openai::{FunctionDefinition, Tool};

/// Registry of tool functions advertised by workers.
///
/// Keyed by tenant (`app_id`), then by the 32-bit tag that routes an
/// invocation to its worker. Mutated by register/unregister control
/// frames; read by every request. Reads take snapshots so the lock is
/// never held across network I/O.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Mutex<HashMap<String, HashMap<u32, FunctionDefinition>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the tool at `(app_id, tag)`.
    pub fn register(&self, app_id: &str, tag: u32, definition: FunctionDefinition) {
        let mut tools = self.tools.lock().unwrap();
        tools
            .entry(app_id.to_string())
            .or_default()
            .insert(tag, definition);
    }

    /// Removes every tool of `app_id` whose function name matches.
    /// The tenant entry itself is dropped once its tool set is empty.
    pub fn unregister(&self, app_id: &str, name: &str) {
        let mut tools = self.tools.lock().unwrap();
        if let Some(app_tools) = tools.get_mut(app_id) {
            app_tools.retain(|_, def| def.name != name);
            if app_tools.is_empty() {
                tools.remove(app_id);
            }
        }
    }

    /// Snapshot of the tenant's tool set, `tag → definition`.
    pub fn list(&self, app_id: &str) -> HashMap<u32, FunctionDefinition> {
        self.tools
            .lock()
            .unwrap()
            .get(app_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Tenant tool set shaped for the request `tools` field, sorted by
    /// name for deterministic request bodies.
    pub fn list_tools(&self, app_id: &str) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self
            .list(app_id)
            .into_values()
            .map(Tool::function)
            .collect();
        tools.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        tools
    }

    /// Applies a worker control frame. Data frames are ignored here;
    /// a register frame with an undecodable definition is dropped.
    pub fn handle_control_frame(&self, frame: &Frame) {
        match frame {
            Frame::RegisterFunction(f) => {
                let definition: FunctionDefinition = match serde_json::from_slice(&f.definition) {
                    Ok(def) => def,
                    Err(e) => {
                        warn!(
                            app_id = %f.app_id,
                            name = %f.name,
                            "Dropping register frame with invalid definition: {e}"
                        );
                        return;
                    }
                };
                debug!(app_id = %f.app_id, name = %f.name, tag = f.tag, "Registered tool");
                self.register(&f.app_id, f.tag, definition);
            }
            Frame::UnregisterFunction(f) => {
                debug!(app_id = %f.app_id, name = %f.name, "Unregistered tool");
                self.unregister(&f.app_id, &f.name);
            }
            _ => {}
        }
    }
}

/// Opaque per-credential key/value bag handed to providers and workers.
///
/// The authoritative copy lives on the Caller; the orchestrator clones
/// it per request so a request can never mutate the cached copy. The
/// tool registry rides along behind an accessor so callers of
/// [`Metadata::tool_registry`] never see the storage scheme.
#[derive(Clone)]
pub struct Metadata {
    app_id: String,
    values: HashMap<String, String>,
    registry: Arc<ToolRegistry>,
}

impl Metadata {
    pub fn new(app_id: impl Into<String>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            app_id: app_id.into(),
            values: HashMap::new(),
            registry,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn tool_registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Tool set of this metadata's tenant, shaped for a request.
    pub fn tools(&self) -> Vec<Tool> {
        self.registry.list_tools(&self.app_id)
    }

    /// The key/value bag serialized for the function-call frame.
    pub fn to_frame_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.values).unwrap_or_else(|_| b"{}".to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{RegisterFunctionFrame, UnregisterFunctionFrame};
    use serde_json::json;

    fn weather_def(name: &str) -> FunctionDefinition {
        FunctionDefinition {
            name: name.to_string(),
            description: format!("{name} lookup"),
            parameters: json!({
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"]
            }),
        }
    }

    #[test]
    fn test_register_and_list() {
        let registry = ToolRegistry::new();
        registry.register("app-1", 0x10, weather_def("get_weather"));

        let tools = registry.list("app-1");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[&0x10].name, "get_weather");
    }

    #[test]
    fn test_register_same_tag_replaces() {
        let registry = ToolRegistry::new();
        registry.register("app-1", 0x10, weather_def("old_tool"));
        registry.register("app-1", 0x10, weather_def("new_tool"));

        let tools = registry.list("app-1");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[&0x10].name, "new_tool");
    }

    #[test]
    fn test_unregister_removes_all_tags_with_name() {
        let registry = ToolRegistry::new();
        registry.register("app-1", 0x10, weather_def("get_weather"));
        registry.register("app-1", 0x11, weather_def("get_weather"));
        registry.register("app-1", 0x12, weather_def("get_news"));

        registry.unregister("app-1", "get_weather");

        let tools = registry.list("app-1");
        assert_eq!(tools.len(), 1);
        assert!(tools.contains_key(&0x12));
    }

    #[test]
    fn test_unregister_last_tool_drops_tenant() {
        let registry = ToolRegistry::new();
        registry.register("app-1", 0x10, weather_def("get_weather"));
        registry.unregister("app-1", "get_weather");

        assert!(registry.tools.lock().unwrap().is_empty());
        assert!(registry.list("app-1").is_empty());
    }

    #[test]
    fn test_tenants_are_isolated() {
        let registry = ToolRegistry::new();
        registry.register("app-1", 0x10, weather_def("get_weather"));
        registry.register("app-2", 0x10, weather_def("get_news"));

        assert_eq!(registry.list("app-1")[&0x10].name, "get_weather");
        assert_eq!(registry.list("app-2")[&0x10].name, "get_news");

        registry.unregister("app-1", "get_weather");
        assert!(registry.list("app-1").is_empty());
        assert_eq!(registry.list("app-2").len(), 1);
    }

    #[test]
    fn test_list_tools_sorted_by_name() {
        let registry = ToolRegistry::new();
        registry.register("app-1", 0x12, weather_def("zeta"));
        registry.register("app-1", 0x10, weather_def("alpha"));
        registry.register("app-1", 0x11, weather_def("mid"));

        let tools = registry.list_tools("app-1");
        let names: Vec<&str> = tools.iter().map(|t| t.function.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_list_unknown_tenant_is_empty() {
        let registry = ToolRegistry::new();
        assert!(registry.list("nobody").is_empty());
        assert!(registry.list_tools("nobody").is_empty());
    }

    #[test]
    fn test_handle_register_frame() {
        let registry = ToolRegistry::new();
        let frame = Frame::RegisterFunction(RegisterFunctionFrame {
            app_id: "app-1".to_string(),
            name: "get_weather".to_string(),
            tag: 0x10,
            definition: serde_json::to_vec(&weather_def("get_weather")).unwrap(),
        });
        registry.handle_control_frame(&frame);

        assert_eq!(registry.list("app-1")[&0x10].name, "get_weather");
    }

    #[test]
    fn test_handle_register_frame_bad_definition_dropped() {
        let registry = ToolRegistry::new();
        let frame = Frame::RegisterFunction(RegisterFunctionFrame {
            app_id: "app-1".to_string(),
            name: "broken".to_string(),
            tag: 0x10,
            definition: b"not json".to_vec(),
        });
        registry.handle_control_frame(&frame);

        assert!(registry.list("app-1").is_empty());
    }

    #[test]
    fn test_handle_unregister_frame() {
        let registry = ToolRegistry::new();
        registry.register("app-1", 0x10, weather_def("get_weather"));
        let frame = Frame::UnregisterFunction(UnregisterFunctionFrame {
            app_id: "app-1".to_string(),
            name: "get_weather".to_string(),
        });
        registry.handle_control_frame(&frame);

        assert!(registry.list("app-1").is_empty());
    }

    #[test]
    fn test_metadata_clone_does_not_leak_mutation() {
        let registry = Arc::new(ToolRegistry::new());
        let mut original = Metadata::new("app-1", registry);
        original.set("tenant", "acme");

        let mut cloned = original.clone();
        cloned.set("tenant", "other");
        cloned.set("request", "abc");

        assert_eq!(original.get("tenant"), Some("acme"));
        assert_eq!(original.get("request"), None);
    }

    #[test]
    fn test_metadata_reaches_registry_tools() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register("app-1", 0x10, weather_def("get_weather"));
        let md = Metadata::new("app-1", registry);

        let tools = md.tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].kind, "function");
        assert_eq!(tools[0].function.name, "get_weather");
    }

    #[test]
    fn test_metadata_frame_bytes_is_json_object() {
        let registry = Arc::new(ToolRegistry::new());
        let mut md = Metadata::new("app-1", registry);
        md.set("tenant", "acme");

        let bytes = md.to_frame_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["tenant"], "acme");
    }
}
