// ABOUTME: Registry pattern for runtime backend selection.
// ABOUTME: Backends register factories; callers create them by type name from config.

use crate::config::BackendConfig;
use crate::error::{AgentError, Result};
use crate::traits::SharedBackend;
use serde_json::Value;
use std::collections::HashMap;

/// Factory function that creates a backend from its JSON config
pub type BackendFactory = Box<dyn Fn(&Value) -> Result<SharedBackend> + Send + Sync>;

/// Registry for runtime backend selection
pub struct AgentRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl AgentRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a backend factory by type name
    pub fn register<F>(mut self, backend_type: &str, factory: F) -> Self
    where
        F: Fn(&Value) -> Result<SharedBackend> + Send + Sync + 'static,
    {
        self.factories
            .insert(backend_type.to_string(), Box::new(factory));
        self
    }

    /// Create a backend by type name with the given config
    pub fn create(&self, backend_type: &str, config: &Value) -> Result<SharedBackend> {
        let factory = self
            .factories
            .get(backend_type)
            .ok_or_else(|| AgentError::Config(format!("Unknown backend type: {}", backend_type)))?;
        factory(config)
    }

    /// List available backend type names, sorted
    pub fn available(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Create the backend configured under `[backends.<name>]`.
    ///
    /// The table name becomes the backend's name unless the table sets one.
    pub fn create_from_config(&self, name: &str, config: &BackendConfig) -> Result<SharedBackend> {
        let mut json_config = config.to_json_value();
        if let Value::Object(map) = &mut json_config {
            map.entry("name")
                .or_insert_with(|| Value::String(name.to_string()));
        }
        tracing::debug!(backend = %name, backend_type = %config.backend_type(), "Creating backend");
        self.create(config.backend_type(), &json_config)
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        use crate::backends::mock::MockBackend;
        use crate::backends::stdio::StdioAgent;

        let registry = Self::new()
            .register("mock", MockBackend::factory())
            .register("stdio", StdioAgent::factory());

        #[cfg(feature = "http")]
        let registry = {
            use crate::backends::http_sse::HttpSseAgent;
            registry.register("http-sse", HttpSseAgent::factory())
        };

        registry
    }
}
