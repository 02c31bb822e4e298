// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Node factory registry and discovery.
//!
//! - [`NodeRegistry`]: every node type the host can construct, keyed by kind
//! - [`NodeDefinition`]: serializable node metadata for frontends
//! - [`NodeInstance`]: a constructed node that validates inputs before invoking

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::NodeError;
use crate::node::{NativeNode, NodeMetadata, ProcessorNode};
use crate::types::{InputSpec, NodeInputs, NodeValue, OutputSpec};

/// Factory closure producing boxed node instances from instance parameters.
pub type NodeFactory =
    Arc<dyn Fn(Option<&serde_json::Value>) -> Result<Box<dyn ProcessorNode>, NodeError> + Send + Sync>;

/// A serializable representation of a node's definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub kind: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub param_schema: serde_json::Value,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
    pub categories: Vec<String>,
}

impl From<&NodeMetadata> for NodeDefinition {
    fn from(meta: &NodeMetadata) -> Self {
        Self {
            kind: meta.kind.clone(),
            display_name: meta.display_name.clone(),
            description: meta.description.clone(),
            param_schema: meta.param_schema.clone(),
            inputs: meta.inputs.clone(),
            outputs: meta.outputs.clone(),
            categories: meta.categories.clone(),
        }
    }
}

#[derive(Clone)]
struct NodeInfo {
    metadata: NodeMetadata,
    factory: NodeFactory,
}

/// The NodeRegistry holds all available node types that the host can construct.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    info: BTreeMap<String, NodeInfo>,
}

impl NodeRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node type under the kind declared in its metadata.
    ///
    /// Registering the same kind twice replaces the earlier entry.
    pub fn register<N: NativeNode>(&mut self) {
        let metadata = N::metadata();
        tracing::debug!(kind = %metadata.kind, display_name = %metadata.display_name, "Registering node");
        let factory: NodeFactory = Arc::new(|params: Option<&serde_json::Value>| {
            N::new(params).map(|n| Box::new(n) as Box<dyn ProcessorNode>)
        });
        self.info.insert(metadata.kind.clone(), NodeInfo { metadata, factory });
    }

    /// Creates an instance of a node by its registered kind.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::UnknownNode` if the kind is not registered, or the
    /// error returned by the node's constructor.
    pub fn create(
        &self,
        kind: &str,
        params: Option<&serde_json::Value>,
    ) -> Result<NodeInstance, NodeError> {
        let info = self.info.get(kind).ok_or_else(|| NodeError::UnknownNode(kind.to_string()))?;
        let node = (info.factory)(params)?;
        Ok(NodeInstance { metadata: info.metadata.clone(), node })
    }

    /// Metadata of a registered kind.
    pub fn metadata(&self, kind: &str) -> Option<&NodeMetadata> {
        self.info.get(kind).map(|i| &i.metadata)
    }

    /// Internal name to display name, for every registered node.
    pub fn display_name_mappings(&self) -> BTreeMap<String, String> {
        self.info.iter().map(|(k, i)| (k.clone(), i.metadata.display_name.clone())).collect()
    }

    /// Returns a list of definitions for all registered nodes.
    pub fn definitions(&self) -> Vec<NodeDefinition> {
        self.info.values().map(|i| NodeDefinition::from(&i.metadata)).collect()
    }

    /// Removes a node definition from the registry.
    /// Returns true if a definition with the provided name was present.
    pub fn unregister(&mut self, kind: &str) -> bool {
        self.info.remove(kind).is_some()
    }

    /// Checks whether a node definition exists in the registry.
    pub fn contains(&self, kind: &str) -> bool {
        self.info.contains_key(kind)
    }
}

/// A constructed node together with its metadata.
pub struct NodeInstance {
    metadata: NodeMetadata,
    node: Box<dyn ProcessorNode>,
}

impl NodeInstance {
    pub const fn metadata(&self) -> &NodeMetadata {
        &self.metadata
    }

    /// Validates `inputs` against the declared schema, then invokes the node.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidInput` if validation fails, a runtime error if
    /// the node returns a number of values different from its declared outputs,
    /// or the node's own error.
    pub fn invoke(&mut self, inputs: &NodeInputs) -> Result<Vec<NodeValue>, NodeError> {
        inputs.validate(&self.metadata.inputs)?;
        let outputs = self.node.invoke(inputs)?;
        if outputs.len() != self.metadata.outputs.len() {
            return Err(NodeError::Runtime(format!(
                "Node '{}' returned {} values, declared {}",
                self.metadata.kind,
                outputs.len(),
                self.metadata.outputs.len()
            )));
        }
        Ok(outputs)
    }

    /// Forwards new instance parameters to the node.
    ///
    /// # Errors
    ///
    /// Returns the node's error if the parameters are rejected.
    pub fn update_params(&mut self, params: Option<&serde_json::Value>) -> Result<(), NodeError> {
        self.node.update_params(params)
    }
}
