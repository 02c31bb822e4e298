// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Input schema and invocation values.
//!
//! A node declares its required inputs as a list of [`InputSpec`]s and its
//! results as [`OutputSpec`]s. At invocation time the host passes a
//! [`NodeInputs`] map, validated against the declared specs, and receives a
//! `Vec<NodeValue>` with one entry per declared output.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::NodeError;

/// The kind of value carried by an input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValueType {
    String,
    Float,
    Int,
    Boolean,
}

/// Declared shape of a single required input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputKind {
    /// Free-form text.
    String {
        default: String,
        #[serde(default)]
        multiline: bool,
    },
    /// One of a fixed set of string options.
    Choice { options: Vec<String>, default: String },
    /// Bounded float with a UI step.
    Float { default: f64, min: f64, max: f64, step: f64 },
    /// Bounded integer.
    Int { default: i64, min: i64, max: i64 },
    Boolean { default: bool },
}

impl InputKind {
    /// Value type accepted for this input.
    pub const fn value_type(&self) -> ValueType {
        match self {
            Self::String { .. } | Self::Choice { .. } => ValueType::String,
            Self::Float { .. } => ValueType::Float,
            Self::Int { .. } => ValueType::Int,
            Self::Boolean { .. } => ValueType::Boolean,
        }
    }

    /// Default value declared for this input.
    pub fn default_value(&self) -> NodeValue {
        match self {
            Self::String { default, .. } | Self::Choice { default, .. } => {
                NodeValue::String(default.clone())
            },
            Self::Float { default, .. } => NodeValue::Float(*default),
            Self::Int { default, .. } => NodeValue::Int(*default),
            Self::Boolean { default } => NodeValue::Bool(*default),
        }
    }
}

/// A named, required input of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: InputKind,
}

impl InputSpec {
    /// Checks a single value against this spec.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidInput`] if the value has the wrong type, is
    /// outside the declared bounds or is not one of the declared options.
    pub fn check(&self, value: &NodeValue) -> Result<(), NodeError> {
        match (&self.kind, value) {
            (InputKind::String { .. }, NodeValue::String(_)) => Ok(()),
            (InputKind::Choice { options, .. }, NodeValue::String(s)) => {
                if options.iter().any(|o| o == s) {
                    Ok(())
                } else {
                    Err(NodeError::invalid_input(
                        &self.name,
                        format!("'{s}' is not one of {options:?}"),
                    ))
                }
            },
            (InputKind::Float { min, max, .. }, v @ (NodeValue::Float(_) | NodeValue::Int(_))) => {
                let x = v.as_f64().unwrap_or(f64::NAN);
                if x.is_nan() {
                    Err(NodeError::invalid_input(&self.name, "value is NaN"))
                } else if x < *min {
                    Err(NodeError::invalid_input(&self.name, format!("{x} is below the minimum {min}")))
                } else if x > *max {
                    Err(NodeError::invalid_input(&self.name, format!("{x} is above the maximum {max}")))
                } else {
                    Ok(())
                }
            },
            (InputKind::Int { min, max, .. }, NodeValue::Int(x)) => {
                if x < min || x > max {
                    Err(NodeError::invalid_input(
                        &self.name,
                        format!("{x} is outside [{min}, {max}]"),
                    ))
                } else {
                    Ok(())
                }
            },
            (InputKind::Boolean { .. }, NodeValue::Bool(_)) => Ok(()),
            (kind, other) => Err(NodeError::invalid_input(
                &self.name,
                format!("expected {:?}, got {:?}", kind.value_type(), other.value_type()),
            )),
        }
    }
}

/// A named result of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
}

/// A value passed into or returned from a node invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl NodeValue {
    pub const fn value_type(&self) -> ValueType {
        match self {
            Self::Bool(_) => ValueType::Boolean,
            Self::Int(_) => ValueType::Int,
            Self::Float(_) => ValueType::Float,
            Self::String(_) => ValueType::String,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view; integers widen to floats.
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(x) => Some(*x),
            Self::Int(x) => Some(*x as f64),
            _ => None,
        }
    }
}

impl From<&str> for NodeValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for NodeValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<f64> for NodeValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

/// Named inputs for a single invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeInputs(BTreeMap<String, NodeValue>);

impl NodeInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<NodeValue>) -> Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<NodeValue>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&NodeValue> {
        self.0.get(name)
    }

    /// Parses inputs from a JSON object as sent by a host frontend.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Configuration`] if the value is not an object of
    /// scalar values.
    pub fn from_json(value: serde_json::Value) -> Result<Self, NodeError> {
        serde_json::from_value(value)
            .map_err(|e| NodeError::Configuration(format!("Failed to parse node inputs: {e}")))
    }

    /// Returns a string input.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidInput`] if the input is missing or not a string.
    pub fn str(&self, name: &str) -> Result<&str, NodeError> {
        self.get(name)
            .ok_or_else(|| NodeError::invalid_input(name, "missing"))?
            .as_str()
            .ok_or_else(|| NodeError::invalid_input(name, "expected a string"))
    }

    /// Returns a numeric input as `f64`.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidInput`] if the input is missing or not numeric.
    pub fn float(&self, name: &str) -> Result<f64, NodeError> {
        self.get(name)
            .ok_or_else(|| NodeError::invalid_input(name, "missing"))?
            .as_f64()
            .ok_or_else(|| NodeError::invalid_input(name, "expected a number"))
    }

    /// Validates every declared input.
    ///
    /// Missing inputs are reported, never defaulted: defaults are a frontend
    /// concern. Extra inputs are ignored.
    ///
    /// # Errors
    ///
    /// Returns the first [`NodeError::InvalidInput`] encountered.
    pub fn validate(&self, specs: &[InputSpec]) -> Result<(), NodeError> {
        for spec in specs {
            let value =
                self.get(&spec.name).ok_or_else(|| NodeError::invalid_input(&spec.name, "missing"))?;
            spec.check(value)?;
        }
        Ok(())
    }
}
