// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Node traits and metadata.
//!
//! - [`ProcessorNode`]: object-safe invocation interface used by the host
//! - [`NativeNode`]: construction and metadata, implemented by node types
//! - [`NodeMetadata`]: declared kind, display name, inputs, outputs and categories

use serde::{Deserialize, Serialize};

use crate::error::NodeError;
use crate::types::{InputKind, InputSpec, NodeInputs, NodeValue, OutputSpec, ValueType};

/// Static description of a node type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Internal name the host uses to address the node type.
    pub kind: String,
    /// Name shown to end users.
    pub display_name: String,
    pub description: Option<String>,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
    /// JSON schema of the instance parameters accepted by `NativeNode::new`.
    pub param_schema: serde_json::Value,
    pub categories: Vec<String>,
}

impl NodeMetadata {
    /// Create a builder for node metadata
    pub fn builder(kind: &str) -> NodeMetadataBuilder {
        NodeMetadataBuilder {
            kind: kind.to_string(),
            display_name: None,
            description: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            param_schema: serde_json::json!({}),
            categories: Vec::new(),
        }
    }

    /// Looks up a declared input by name.
    pub fn input(&self, name: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// Inputs filled with their declared defaults.
    pub fn default_inputs(&self) -> NodeInputs {
        let mut inputs = NodeInputs::new();
        for spec in &self.inputs {
            inputs.insert(&spec.name, spec.kind.default_value());
        }
        inputs
    }
}

/// Builder for NodeMetadata
pub struct NodeMetadataBuilder {
    kind: String,
    display_name: Option<String>,
    description: Option<String>,
    inputs: Vec<InputSpec>,
    outputs: Vec<OutputSpec>,
    param_schema: serde_json::Value,
    categories: Vec<String>,
}

impl NodeMetadataBuilder {
    /// Set the display name (defaults to the kind)
    #[must_use]
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Set the node description
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a required input
    #[must_use]
    pub fn input(mut self, name: &str, kind: InputKind) -> Self {
        self.inputs.push(InputSpec { name: name.to_string(), kind });
        self
    }

    /// Add an output
    #[must_use]
    pub fn output(mut self, name: &str, value_type: ValueType) -> Self {
        self.outputs.push(OutputSpec { name: name.to_string(), value_type });
        self
    }

    /// Set parameter schema
    #[must_use]
    pub fn param_schema(mut self, schema: serde_json::Value) -> Self {
        self.param_schema = schema;
        self
    }

    /// Add a category
    #[must_use]
    pub fn category(mut self, category: &str) -> Self {
        self.categories.push(category.to_string());
        self
    }

    /// Build the metadata
    pub fn build(self) -> NodeMetadata {
        NodeMetadata {
            display_name: self.display_name.unwrap_or_else(|| self.kind.clone()),
            kind: self.kind,
            description: self.description,
            inputs: self.inputs,
            outputs: self.outputs,
            param_schema: self.param_schema,
            categories: self.categories,
        }
    }
}

/// Invocation interface of a node instance.
///
/// Invocation is synchronous and takes `&mut self`: the host serializes calls
/// to one instance. Inputs have already been validated against the node's
/// declared [`InputSpec`]s when `invoke` runs.
pub trait ProcessorNode: Send {
    /// Runs the node once and returns one value per declared output.
    ///
    /// # Errors
    ///
    /// Returns an error if the node fails; the host presents it to the user.
    fn invoke(&mut self, inputs: &NodeInputs) -> Result<Vec<NodeValue>, NodeError>;

    /// Update instance parameters (optional)
    ///
    /// # Errors
    ///
    /// Returns an error if the new parameters are invalid
    fn update_params(&mut self, _params: Option<&serde_json::Value>) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Construction side of a node type, used by the registry.
pub trait NativeNode: ProcessorNode + Sized + 'static {
    /// Return metadata about this node type
    fn metadata() -> NodeMetadata;

    /// Create a new instance of the node
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails (e.g., invalid parameters)
    fn new(params: Option<&serde_json::Value>) -> Result<Self, NodeError>;
}
