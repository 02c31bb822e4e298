// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structural model configuration and its JSON codec.
//!
//! The on-disk document has exactly four top-level keys: `backbone`,
//! `prefix_conditioner`, `eos_token_id` and `masked_token_id`. Decoding checks
//! the keys, deserializes the typed schema, then validates dimensions so a
//! malformed cache entry fails with a descriptive [`ConfigError`] instead of a
//! shape error deep inside model construction.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// The only state-space layer type the backbone implements.
pub const MAMBA2_LAYER: &str = "Mamba2";

/// Top-level keys of the serialized config, in document order.
pub const CONFIG_KEYS: [&str; 4] = ["backbone", "prefix_conditioner", "eos_token_id", "masked_token_id"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config is not valid JSON: {0}")]
    Syntax(serde_json::Error),

    #[error("config must be a JSON object")]
    NotAnObject,

    #[error("missing top-level key `{0}`")]
    MissingKey(&'static str),

    /// Wrong type or missing nested field.
    #[error("malformed config: {0}")]
    Schema(serde_json::Error),

    #[error("invalid `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid { field: field.into(), reason: reason.into() }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_norm_epsilon() -> f64 {
    1e-5
}

const fn default_one() -> usize {
    1
}

const fn default_d_state() -> usize {
    128
}

const fn default_d_conv() -> usize {
    4
}

const fn default_expand() -> usize {
    2
}

const fn default_headdim() -> usize {
    64
}

fn default_ssm_layer() -> String {
    MAMBA2_LAYER.to_string()
}

const fn default_std() -> f64 {
    1.0
}

const fn default_fourier_max() -> f64 {
    1.0
}

const fn default_integer_max() -> i64 {
    512
}

/// Attention layer parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    #[serde(default = "default_true")]
    pub causal: bool,
    pub num_heads: usize,
    pub num_heads_kv: usize,
    /// Rotated dimensions per head; 0 means the full head dimension.
    #[serde(default)]
    pub rotary_emb_dim: usize,
    #[serde(default)]
    pub qkv_proj_bias: bool,
    #[serde(default)]
    pub out_proj_bias: bool,
}

/// Settings of the state-space layers of a hybrid backbone.
///
/// Decoded from `backbone.ssm_cfg`; absent keys take the Mamba2 defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mamba2Config {
    #[serde(default = "default_ssm_layer")]
    pub layer: String,
    #[serde(default = "default_d_state")]
    pub d_state: usize,
    #[serde(default = "default_d_conv")]
    pub d_conv: usize,
    #[serde(default = "default_expand")]
    pub expand: usize,
    #[serde(default = "default_headdim")]
    pub headdim: usize,
    #[serde(default = "default_one")]
    pub ngroups: usize,
    #[serde(default = "default_true")]
    pub rmsnorm: bool,
    #[serde(default)]
    pub norm_before_gate: bool,
    #[serde(default = "default_true")]
    pub conv_bias: bool,
    #[serde(default)]
    pub bias: bool,
}

impl Mamba2Config {
    /// Width of the inner (expanded) stream.
    pub const fn d_inner(&self, d_model: usize) -> usize {
        self.expand * d_model
    }

    pub const fn nheads(&self, d_model: usize) -> usize {
        self.d_inner(d_model) / self.headdim
    }

    /// Channels passing through the depthwise convolution: `x`, `B` and `C`.
    pub const fn conv_dim(&self, d_model: usize) -> usize {
        self.d_inner(d_model) + 2 * self.ngroups * self.d_state
    }
}

/// Backbone parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneConfig {
    pub d_model: usize,
    #[serde(default)]
    pub d_intermediate: usize,
    pub attn_mlp_d_intermediate: usize,
    pub n_layer: usize,
    /// State-space layer settings; non-empty for hybrid backbones.
    #[serde(default)]
    pub ssm_cfg: Map<String, Value>,
    #[serde(default)]
    pub attn_layer_idx: Vec<usize>,
    pub attn_cfg: AttentionConfig,
    #[serde(default)]
    pub rms_norm: bool,
    #[serde(default)]
    pub residual_in_fp32: bool,
    #[serde(default = "default_norm_epsilon")]
    pub norm_epsilon: f64,
}

impl BackboneConfig {
    /// True when every layer is an attention layer.
    pub fn is_pure_transformer(&self) -> bool {
        (0..self.n_layer).all(|i| self.is_attention_layer(i))
    }

    /// Whether layer `i` mixes with attention rather than a state-space layer.
    pub fn is_attention_layer(&self, i: usize) -> bool {
        self.ssm_cfg.is_empty() || self.attn_layer_idx.contains(&i)
    }

    /// Typed state-space settings, `None` for a pure transformer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `ssm_cfg` does not decode.
    pub fn mamba(&self) -> Result<Option<Mamba2Config>, ConfigError> {
        if self.is_pure_transformer() {
            return Ok(None);
        }
        serde_json::from_value(Value::Object(self.ssm_cfg.clone()))
            .map(Some)
            .map_err(|e| ConfigError::invalid("backbone.ssm_cfg", e.to_string()))
    }

    /// Hidden width of the gated MLP after layer `i`; 0 means no MLP.
    pub fn mlp_width(&self, i: usize) -> usize {
        if self.is_attention_layer(i) {
            self.attn_mlp_d_intermediate
        } else {
            self.d_intermediate
        }
    }

    pub const fn head_dim(&self) -> usize {
        self.d_model / self.attn_cfg.num_heads
    }

    pub const fn rotary_dim(&self) -> usize {
        if self.attn_cfg.rotary_emb_dim == 0 {
            self.head_dim()
        } else {
            self.attn_cfg.rotary_emb_dim
        }
    }
}

/// Projection applied after a conditioner (or after the whole prefix).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Projection {
    #[default]
    None,
    Linear,
    Mlp,
}

/// What a conditioner produces when its input is absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UncondType {
    /// No unconditional form: the input is required.
    #[default]
    None,
    /// A learned vector stands in for the missing input.
    Learned,
}

/// Conditioner-specific parameters, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConditionerKind {
    /// Text (phoneme/grapheme) tokens embedded per symbol.
    EspeakPhonemeConditioner,
    /// Scalar or vector features encoded with random Fourier features.
    FourierConditioner {
        #[serde(default = "default_one")]
        input_dim: usize,
        #[serde(default = "default_std")]
        std: f64,
        #[serde(default)]
        min_val: f64,
        #[serde(default = "default_fourier_max")]
        max_val: f64,
    },
    /// Integer ids embedded through a lookup table.
    IntegerConditioner {
        #[serde(default)]
        min_val: i64,
        #[serde(default = "default_integer_max")]
        max_val: i64,
    },
    /// Precomputed embeddings (e.g. speaker) passed through.
    PassthroughConditioner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionerConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond_dim: Option<usize>,
    #[serde(default)]
    pub projection: Projection,
    #[serde(default)]
    pub uncond_type: UncondType,
    #[serde(flatten)]
    pub kind: ConditionerKind,
}

impl ConditionerConfig {
    /// Width of the conditioner output before projection.
    pub fn cond_dim_or(&self, d_model: usize) -> usize {
        self.cond_dim.unwrap_or(d_model)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefixConditionerConfig {
    pub conditioners: Vec<ConditionerConfig>,
    #[serde(default)]
    pub projection: Projection,
}

impl PrefixConditionerConfig {
    pub fn conditioner(&self, name: &str) -> Option<&ConditionerConfig> {
        self.conditioners.iter().find(|c| c.name == name)
    }
}

/// Full structural configuration of a Zonos model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZonosConfig {
    pub backbone: BackboneConfig,
    pub prefix_conditioner: PrefixConditionerConfig,
    pub eos_token_id: u32,
    pub masked_token_id: u32,
}

impl ZonosConfig {
    /// Encodes the config as a JSON value with the four top-level keys.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Schema`] if serialization fails.
    pub fn to_json(&self) -> Result<Value, ConfigError> {
        serde_json::to_value(self).map_err(ConfigError::Schema)
    }

    /// Pretty-printed JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Schema`] if serialization fails.
    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(ConfigError::Schema)
    }

    /// Decodes and validates a config document.
    ///
    /// Unknown top-level keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first problem found.
    pub fn from_json(value: &Value) -> Result<Self, ConfigError> {
        let object = value.as_object().ok_or(ConfigError::NotAnObject)?;
        for key in CONFIG_KEYS {
            if !object.contains_key(key) {
                return Err(ConfigError::MissingKey(key));
            }
        }
        let config: Self = serde_json::from_value(value.clone()).map_err(ConfigError::Schema)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses, decodes and validates a config document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Syntax`] for invalid JSON, otherwise as [`Self::from_json`].
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(s).map_err(ConfigError::Syntax)?;
        Self::from_json(&value)
    }

    /// Checks dimensional consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.backbone;
        let attn = &b.attn_cfg;

        if b.d_model == 0 {
            return Err(ConfigError::invalid("backbone.d_model", "must be positive"));
        }
        if b.n_layer == 0 {
            return Err(ConfigError::invalid("backbone.n_layer", "must be positive"));
        }
        if attn.num_heads == 0 || attn.num_heads_kv == 0 {
            return Err(ConfigError::invalid(
                "backbone.attn_cfg",
                "num_heads and num_heads_kv must be positive",
            ));
        }
        if b.d_model % attn.num_heads != 0 {
            return Err(ConfigError::invalid(
                "backbone.d_model",
                format!("{} is not divisible by num_heads {}", b.d_model, attn.num_heads),
            ));
        }
        if attn.num_heads % attn.num_heads_kv != 0 {
            return Err(ConfigError::invalid(
                "backbone.attn_cfg.num_heads",
                format!("{} is not divisible by num_heads_kv {}", attn.num_heads, attn.num_heads_kv),
            ));
        }
        let rotary = b.rotary_dim();
        if rotary > b.head_dim() || rotary % 2 != 0 {
            return Err(ConfigError::invalid(
                "backbone.attn_cfg.rotary_emb_dim",
                format!("{rotary} must be even and at most the head dimension {}", b.head_dim()),
            ));
        }
        if let Some(&idx) = b.attn_layer_idx.iter().find(|&&i| i >= b.n_layer) {
            return Err(ConfigError::invalid(
                "backbone.attn_layer_idx",
                format!("layer {idx} is out of range for n_layer {}", b.n_layer),
            ));
        }
        let has_attention = (0..b.n_layer).any(|i| b.is_attention_layer(i));
        if has_attention && b.attn_mlp_d_intermediate == 0 {
            return Err(ConfigError::invalid(
                "backbone.attn_mlp_d_intermediate",
                "must be positive for attention layers",
            ));
        }
        if let Some(ssm) = b.mamba()? {
            Self::validate_mamba(&ssm, b.d_model)?;
        }
        if b.norm_epsilon <= 0.0 {
            return Err(ConfigError::invalid("backbone.norm_epsilon", "must be positive"));
        }
        if self.masked_token_id <= self.eos_token_id {
            return Err(ConfigError::invalid(
                "masked_token_id",
                format!(
                    "{} must be greater than eos_token_id {}",
                    self.masked_token_id, self.eos_token_id
                ),
            ));
        }

        self.validate_conditioners()
    }

    fn validate_mamba(ssm: &Mamba2Config, d_model: usize) -> Result<(), ConfigError> {
        if ssm.d_state == 0 || ssm.d_conv == 0 || ssm.expand == 0 || ssm.headdim == 0 || ssm.ngroups == 0 {
            return Err(ConfigError::invalid(
                "backbone.ssm_cfg",
                "d_state, d_conv, expand, headdim and ngroups must be positive",
            ));
        }
        let d_inner = ssm.d_inner(d_model);
        if d_inner % ssm.headdim != 0 {
            return Err(ConfigError::invalid(
                "backbone.ssm_cfg.headdim",
                format!("inner width {d_inner} is not divisible by headdim {}", ssm.headdim),
            ));
        }
        let nheads = ssm.nheads(d_model);
        if nheads % ssm.ngroups != 0 {
            return Err(ConfigError::invalid(
                "backbone.ssm_cfg.ngroups",
                format!("{nheads} heads are not divisible into {} groups", ssm.ngroups),
            ));
        }
        Ok(())
    }

    fn validate_conditioners(&self) -> Result<(), ConfigError> {
        let d_model = self.backbone.d_model;
        let conditioners = &self.prefix_conditioner.conditioners;
        if conditioners.is_empty() {
            return Err(ConfigError::invalid("prefix_conditioner.conditioners", "must not be empty"));
        }

        let mut seen = HashSet::new();
        for c in conditioners {
            let field = format!("prefix_conditioner.conditioners[{}]", c.name);
            if !seen.insert(c.name.as_str()) {
                return Err(ConfigError::invalid(field, "duplicate conditioner name"));
            }
            let cond_dim = c.cond_dim_or(d_model);
            if cond_dim == 0 {
                return Err(ConfigError::invalid(field, "cond_dim must be positive"));
            }
            if c.projection == Projection::None && cond_dim != d_model {
                return Err(ConfigError::invalid(
                    field,
                    format!("cond_dim {cond_dim} differs from d_model {d_model} without a projection"),
                ));
            }
            match &c.kind {
                ConditionerKind::FourierConditioner { input_dim, min_val, max_val, .. } => {
                    if cond_dim % 2 != 0 {
                        return Err(ConfigError::invalid(field, format!("cond_dim {cond_dim} must be even")));
                    }
                    if *input_dim == 0 {
                        return Err(ConfigError::invalid(field, "input_dim must be positive"));
                    }
                    if max_val <= min_val {
                        return Err(ConfigError::invalid(field, "max_val must be greater than min_val"));
                    }
                },
                ConditionerKind::IntegerConditioner { min_val, max_val } => {
                    if max_val < min_val {
                        return Err(ConfigError::invalid(field, "max_val must not be less than min_val"));
                    }
                },
                ConditionerKind::EspeakPhonemeConditioner | ConditionerKind::PassthroughConditioner => {},
            }
        }
        Ok(())
    }

    /// Names of conditioners that have no unconditional form.
    pub fn required_conditioners(&self) -> Vec<&str> {
        self.prefix_conditioner
            .conditioners
            .iter()
            .filter(|c| c.uncond_type == UncondType::None)
            .map(|c| c.name.as_str())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample_json() -> Value {
        json!({
            "backbone": {
                "d_model": 64,
                "d_intermediate": 0,
                "attn_mlp_d_intermediate": 128,
                "n_layer": 2,
                "ssm_cfg": {},
                "attn_layer_idx": [],
                "attn_cfg": {
                    "causal": true,
                    "num_heads": 4,
                    "num_heads_kv": 2,
                    "rotary_emb_dim": 16,
                    "qkv_proj_bias": false,
                    "out_proj_bias": false
                },
                "rms_norm": false,
                "residual_in_fp32": false,
                "norm_epsilon": 1e-5
            },
            "prefix_conditioner": {
                "conditioners": [
                    {"type": "EspeakPhonemeConditioner", "name": "espeak"},
                    {"cond_dim": 16, "uncond_type": "learned", "projection": "linear",
                     "type": "PassthroughConditioner", "name": "speaker"},
                    {"input_dim": 8, "uncond_type": "learned", "type": "FourierConditioner", "name": "emotion"},
                    {"uncond_type": "learned", "type": "FourierConditioner", "name": "fmax",
                     "min_val": 0, "max_val": 24000},
                    {"min_val": 0, "max_val": 126, "uncond_type": "learned",
                     "type": "IntegerConditioner", "name": "language_id"}
                ],
                "projection": "none"
            },
            "eos_token_id": 1024,
            "masked_token_id": 1025
        })
    }

    #[test]
    fn test_decode_typed_fields() {
        let config = ZonosConfig::from_json(&sample_json()).unwrap();
        assert_eq!(config.backbone.head_dim(), 16);
        assert!(config.backbone.is_pure_transformer());
        assert_eq!(config.prefix_conditioner.conditioners.len(), 5);
        assert_eq!(config.required_conditioners(), vec!["espeak"]);
        let fmax = config.prefix_conditioner.conditioner("fmax").unwrap();
        assert!(matches!(
            fmax.kind,
            ConditionerKind::FourierConditioner { input_dim: 1, max_val, .. } if (max_val - 24000.0).abs() < f64::EPSILON
        ));
    }

    #[test]
    fn test_encode_has_exactly_four_keys() {
        let config = ZonosConfig::from_json(&sample_json()).unwrap();
        let value = config.to_json().unwrap();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        let mut expected = CONFIG_KEYS.to_vec();
        expected.sort_unstable();
        let mut keys = keys;
        keys.sort_unstable();
        assert_eq!(keys, expected);

        let decoded = ZonosConfig::from_json_str(&config.to_json_string().unwrap()).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_missing_eos_token_id() {
        let mut value = sample_json();
        value.as_object_mut().unwrap().remove("eos_token_id");
        let err = ZonosConfig::from_json(&value).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey("eos_token_id")));
    }

    #[test]
    fn test_wrong_type_is_schema_error() {
        let mut value = sample_json();
        value["backbone"]["n_layer"] = json!("two");
        assert!(matches!(ZonosConfig::from_json(&value), Err(ConfigError::Schema(_))));

        assert!(matches!(ZonosConfig::from_json(&json!([1, 2])), Err(ConfigError::NotAnObject)));
        assert!(matches!(ZonosConfig::from_json_str("{"), Err(ConfigError::Syntax(_))));
    }

    #[test]
    fn test_inconsistent_dimensions() {
        let mut value = sample_json();
        value["backbone"]["attn_cfg"]["num_heads"] = json!(5);
        let err = ZonosConfig::from_json(&value).unwrap_err();
        assert!(err.to_string().contains("backbone.d_model"));

        let mut value = sample_json();
        value["backbone"]["attn_cfg"]["num_heads_kv"] = json!(3);
        assert!(ZonosConfig::from_json(&value).is_err());

        let mut value = sample_json();
        value["prefix_conditioner"]["conditioners"][1]["projection"] = json!("none");
        let err = ZonosConfig::from_json(&value).unwrap_err();
        assert!(err.to_string().contains("speaker"));
    }

    #[test]
    fn test_token_ids_out_of_order() {
        let mut value = sample_json();
        value["masked_token_id"] = json!(1024);
        let err = ZonosConfig::from_json(&value).unwrap_err();
        assert!(err.to_string().contains("masked_token_id"));
    }

    #[test]
    fn test_duplicate_conditioner_names() {
        let mut value = sample_json();
        value["prefix_conditioner"]["conditioners"][3]["name"] = json!("emotion");
        let err = ZonosConfig::from_json(&value).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_hybrid_backbone_detection() {
        let mut value = sample_json();
        value["backbone"]["ssm_cfg"] = json!({"layer": "Mamba2"});
        value["backbone"]["attn_layer_idx"] = json!([1]);
        let config = ZonosConfig::from_json(&value).unwrap();
        assert!(!config.backbone.is_pure_transformer());

        let ssm = config.backbone.mamba().unwrap().unwrap();
        assert_eq!((ssm.d_state, ssm.d_conv, ssm.headdim, ssm.ngroups), (128, 4, 64, 1));
        assert_eq!(ssm.nheads(64), 2);
        assert!(ssm.rmsnorm && ssm.conv_bias && !ssm.bias);
        assert!(!config.backbone.is_attention_layer(0));
        assert_eq!(config.backbone.mlp_width(0), 0);
        assert_eq!(config.backbone.mlp_width(1), 128);

        value["backbone"]["attn_layer_idx"] = json!([0, 1]);
        let config = ZonosConfig::from_json(&value).unwrap();
        assert!(config.backbone.is_pure_transformer());
        assert!(config.backbone.mamba().unwrap().is_none());
    }

    #[test]
    fn test_invalid_ssm_settings() {
        let mut value = sample_json();
        value["backbone"]["ssm_cfg"] = json!({"layer": "Mamba2", "headdim": 48});
        value["backbone"]["attn_layer_idx"] = json!([1]);
        let err = ZonosConfig::from_json(&value).unwrap_err();
        assert!(err.to_string().contains("headdim"), "{err}");

        value["backbone"]["ssm_cfg"] = json!({"layer": "Mamba2", "d_state": "wide"});
        let err = ZonosConfig::from_json(&value).unwrap_err();
        assert!(err.to_string().contains("ssm_cfg"), "{err}");

        value["backbone"]["ssm_cfg"] = json!({"layer": "Mamba2"});
        value["backbone"]["attn_layer_idx"] = json!([2]);
        let err = ZonosConfig::from_json(&value).unwrap_err();
        assert!(err.to_string().contains("attn_layer_idx"), "{err}");
    }
}
