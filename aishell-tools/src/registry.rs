//! ABOUTME: Catalog of callable tools with compiled input schemas
//! ABOUTME: Rejects duplicate names and malformed schemas at registration time

use aishell_core::{AiShellError, Result, Tool, ToolDescriptor};
use dashmap::DashMap;
use jsonschema::JSONSchema;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// A registered tool with its compiled input schema
pub struct RegisteredTool {
    pub descriptor: ToolDescriptor,
    pub callable: Arc<dyn Tool>,
    schema: JSONSchema,
}

impl RegisteredTool {
    /// Validate invocation parameters against the tool's input schema
    pub fn validate_params(&self, params: &Value) -> Result<()> {
        if let Err(errors) = self.schema.validate(params) {
            let details: Vec<String> = errors.map(|e| e.to_string()).collect();
            return Err(AiShellError::SchemaViolation {
                message: format!(
                    "parameters for '{}' rejected: {}",
                    self.descriptor.name,
                    details.join("; ")
                ),
            });
        }
        Ok(())
    }
}

/// Tool catalog.
///
/// Registration compiles the input schema once; duplicate names and
/// schemas that fail to compile are rejected.
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, Arc<RegisteredTool>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its descriptor name
    pub fn register(&self, callable: Arc<dyn Tool>) -> Result<()> {
        let descriptor = callable.descriptor().clone();
        if self.tools.contains_key(&descriptor.name) {
            return Err(AiShellError::SchemaViolation {
                message: format!("tool '{}' is already registered", descriptor.name),
            });
        }
        let schema = JSONSchema::compile(&descriptor.input_schema).map_err(|err| {
            AiShellError::SchemaViolation {
                message: format!("input schema for '{}' is invalid: {err}", descriptor.name),
            }
        })?;
        info!(tool = %descriptor.name, risk = %descriptor.risk_level, "tool registered");
        self.tools.insert(
            descriptor.name.clone(),
            Arc::new(RegisteredTool {
                descriptor,
                callable,
                schema,
            }),
        );
        Ok(())
    }

    /// Look up a tool by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<RegisteredTool>> {
        self.tools.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Descriptors of every registered tool, sorted by name
    #[must_use]
    pub fn list(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> = self
            .tools
            .iter()
            .map(|entry| entry.value().descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
