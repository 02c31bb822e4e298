// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Lisa Core - host-facing protocol for graph nodes.
//!
//! ## Core Modules
//!
//! - [`types`]: Input schema and invocation values
//! - [`node`]: ProcessorNode / NativeNode traits and node metadata
//! - [`registry`]: Node factory and discovery system
//! - [`error`]: Error types and handling
//! - [`helpers`]: Utility functions for configuration
//!
//! ## Quick Start
//!
//! ```ignore
//! use lisa_core::{NativeNode, NodeMetadata, NodeRegistry, ProcessorNode};
//!
//! struct Upper;
//!
//! impl ProcessorNode for Upper {
//!     fn invoke(&mut self, inputs: &NodeInputs) -> Result<Vec<NodeValue>, NodeError> { /* ... */ }
//! }
//!
//! impl NativeNode for Upper {
//!     fn metadata() -> NodeMetadata { /* ... */ }
//!     fn new(params: Option<&serde_json::Value>) -> Result<Self, NodeError> { /* ... */ }
//! }
//!
//! let mut registry = NodeRegistry::new();
//! registry.register::<Upper>();
//! ```

pub mod error;
pub mod helpers;
pub mod node;
pub mod registry;
pub mod types;

// Error handling
pub use error::NodeError;

// Core node abstractions
pub use node::{NativeNode, NodeMetadata, NodeMetadataBuilder, ProcessorNode};

// Registry and factory
pub use registry::{NodeDefinition, NodeInstance, NodeRegistry};

// Schema and values
pub use types::{InputKind, InputSpec, NodeInputs, NodeValue, OutputSpec, ValueType};

pub use helpers::config_helpers;
