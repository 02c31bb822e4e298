// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Utility functions for node configuration.

/// Helper functions for parsing node configuration from JSON values.
pub mod config_helpers {
    use crate::error::NodeError;
    use serde::Deserialize;

    /// Parses configuration from an optional JSON value, using defaults if not provided.
    /// A present but malformed value is an error, never replaced by defaults.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Configuration` if `params` is present and fails to deserialize.
    pub fn parse_config_optional<T>(params: Option<&serde_json::Value>) -> Result<T, NodeError>
    where
        T: for<'de> Deserialize<'de> + Default,
    {
        match params {
            None | Some(serde_json::Value::Null) => Ok(T::default()),
            Some(p) => serde_json::from_value(p.clone())
                .map_err(|e| NodeError::Configuration(format!("Failed to parse config: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::config_helpers::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(default)]
    struct Cfg {
        device: String,
        steps: u32,
    }

    #[test]
    fn test_optional_uses_defaults() {
        let cfg: Cfg = parse_config_optional(None).unwrap();
        assert_eq!(cfg, Cfg::default());
        assert!(cfg.device.is_empty());
        let cfg: Cfg = parse_config_optional(Some(&serde_json::json!({"steps": 4}))).unwrap();
        assert_eq!(cfg.steps, 4);
        let cfg: Cfg = parse_config_optional(Some(&serde_json::Value::Null)).unwrap();
        assert_eq!(cfg, Cfg::default());
    }

    #[test]
    fn test_optional_rejects_malformed() {
        let params = serde_json::json!({"steps": "many"});
        assert!(parse_config_optional::<Cfg>(Some(&params)).is_err());
    }
}
