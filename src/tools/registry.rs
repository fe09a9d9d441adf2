use std::collections::HashMap;
use std::sync::Arc;

use super::manifest::{enabled_definitions, Manifest, ToolDefinition};
use super::{all_handlers, ToolHandler};
use crate::config::FeaturesConfig;
use crate::error::ToolError;
use crate::schema::{self, Validator};

struct RegisteredTool {
    handler: Arc<dyn ToolHandler>,
    validator: Validator,
}

/// Enabled tools keyed by name, each with its handler and compiled validator.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    manifest: Manifest,
}

impl ToolRegistry {
    pub fn new(features: &FeaturesConfig) -> Result<Self, ToolError> {
        let mut handlers: HashMap<&'static str, Arc<dyn ToolHandler>> =
            all_handlers().into_iter().map(|h| (h.name(), h)).collect();

        let definitions = enabled_definitions(features)
            .map_err(|e| ToolError::Configuration(format!("bad tool manifest: {e}")))?;
        let mut tools = HashMap::with_capacity(definitions.len());
        for definition in &definitions {
            let handler = handlers.remove(definition.name.as_str()).ok_or_else(|| {
                ToolError::Configuration(format!("no handler registered for tool '{}'", definition.name))
            })?;
            tools.insert(
                definition.name.clone(),
                RegisteredTool {
                    handler,
                    validator: schema::convert(&definition.input_schema),
                },
            );
        }

        log::debug!("registered {} tools", tools.len());
        Ok(Self {
            tools,
            manifest: Manifest::new(definitions),
        })
    }

    pub fn handler(&self, name: &str) -> Option<&Arc<dyn ToolHandler>> {
        self.tools.get(name).map(|t| &t.handler)
    }

    pub fn validator(&self, name: &str) -> Option<&Validator> {
        self.tools.get(name).map(|t| &t.validator)
    }

    pub fn definition(&self, name: &str) -> Option<&ToolDefinition> {
        self.manifest.tools.iter().find(|d| d.name == name)
    }

    /// Enabled tool names in manifest order.
    pub fn names(&self) -> Vec<String> {
        self.manifest.names()
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }
}
