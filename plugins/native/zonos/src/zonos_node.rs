// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The host-facing Zonos text-to-speech node.

use std::path::PathBuf;
use std::sync::Arc;

use lisa_core::config_helpers::parse_config_optional;
use lisa_core::{InputKind, NativeNode, NodeError, NodeInputs, NodeMetadata, NodeValue, ProcessorNode, ValueType};
use serde_json::Value;

use crate::cache::{LoadOrigin, ModelCache};
use crate::config::ZonosNodeConfig;
use crate::device::get_device;
use crate::error::ZonosError;
use crate::hub::{HfHubSource, LocalDirSource, ModelSource};
use crate::model::Zonos;
use crate::phonemizer::{EspeakPhonemizer, Phonemizer};
use crate::pipeline::{generate_speech, GenerationRequest};

pub const LANGUAGES: [&str; 2] = ["en-us", "ja-jp"];
pub const MODEL_NAMES: [&str; 2] = ["Zyphra/Zonos-v0.1-transformer", "Zyphra/Zonos-v0.1-hybrid"];

/// A model together with the identifier it was loaded from.
pub struct LoadedModel {
    pub identifier: String,
    pub model: Zonos,
}

pub struct ZonosNode {
    config: ZonosNodeConfig,
    cache: ModelCache,
    phonemizer: Arc<dyn Phonemizer>,
    loaded: Option<LoadedModel>,
}

fn build_cache(config: &ZonosNodeConfig) -> Result<ModelCache, NodeError> {
    let device = get_device(&config.device, config.device_index)
        .map_err(|e| NodeError::Configuration(e.to_string()))?;
    let source: Arc<dyn ModelSource> = match &config.mirror_dir {
        Some(dir) => Arc::new(LocalDirSource::new(dir)),
        None => Arc::new(
            HfHubSource::new(config.hub_cache_dir.as_deref().map(std::path::Path::new))
                .map_err(|e| NodeError::Configuration(e.to_string()))?,
        ),
    };
    tracing::info!(
        models_dir = %config.models_dir,
        device = ?device,
        mirror = config.mirror_dir.is_some(),
        "Configured Zonos model cache"
    );
    Ok(ModelCache::new(config.models_path(), device, source, config.autoencoder.clone())
        .with_speaker_encoder_source(config.speaker_encoder.clone()))
}

fn build_phonemizer(config: &ZonosNodeConfig) -> Arc<dyn Phonemizer> {
    Arc::new(EspeakPhonemizer::new(config.espeak_program.clone()))
}

impl ZonosNode {
    /// Node using a prepared cache and the configured espeak phonemizer.
    pub fn with_cache(config: ZonosNodeConfig, cache: ModelCache) -> Self {
        let phonemizer = build_phonemizer(&config);
        Self { config, cache, phonemizer, loaded: None }
    }

    #[must_use]
    pub fn with_phonemizer(mut self, phonemizer: Arc<dyn Phonemizer>) -> Self {
        self.phonemizer = phonemizer;
        self
    }

    pub const fn config(&self) -> &ZonosNodeConfig {
        &self.config
    }

    pub fn loaded_identifier(&self) -> Option<&str> {
        self.loaded.as_ref().map(|l| l.identifier.as_str())
    }

    /// Returns the model for `identifier`, replacing any model loaded under
    /// another identifier.
    ///
    /// # Errors
    ///
    /// Fails if the model cannot be resolved; the previous model is gone either way.
    pub fn ensure_model(&mut self, identifier: &str) -> Result<&Zonos, ZonosError> {
        if !matches!(&self.loaded, Some(l) if l.identifier == identifier) {
            if let Some(old) = self.loaded.take() {
                tracing::info!(from = %old.identifier, to = identifier, "Switching model");
            }
            let resolved = self.cache.resolve(identifier)?;
            match &resolved.origin {
                LoadOrigin::Cache => tracing::info!(identifier, "Loaded model from cache"),
                LoadOrigin::Fresh => tracing::info!(identifier, "Downloaded and cached model"),
                LoadOrigin::Fallback { reason } => {
                    tracing::warn!(identifier, reason = %reason, "Loaded model through fallback download");
                },
            }
            self.loaded = Some(LoadedModel { identifier: identifier.to_string(), model: resolved.model });
        }
        self.loaded
            .as_ref()
            .map(|l| &l.model)
            .ok_or_else(|| ZonosError::Model(format!("model '{identifier}' is not loaded")))
    }

    fn request_from_inputs(inputs: &NodeInputs) -> Result<GenerationRequest, NodeError> {
        let audio_file = inputs.str("audio_file")?.trim();
        let mut request = GenerationRequest::new(inputs.str("text")?, inputs.str("language")?)
            .with_cfg_scale(inputs.float("cfg_scale")?);
        if !audio_file.is_empty() {
            request = request.with_reference_audio(PathBuf::from(audio_file));
        }
        Ok(request)
    }
}

impl ProcessorNode for ZonosNode {
    fn invoke(&mut self, inputs: &NodeInputs) -> Result<Vec<NodeValue>, NodeError> {
        let model_name = inputs.str("model_name")?.to_string();
        let request = Self::request_from_inputs(inputs)?;
        tracing::debug!(
            model = %model_name,
            language = %request.language,
            chars = request.text.chars().count(),
            cfg_scale = request.cfg_scale,
            "Zonos invocation"
        );

        let params = self.config.generation_params();
        let output_dir = self.config.output_path();
        let phonemizer = Arc::clone(&self.phonemizer);
        let model = self.ensure_model(&model_name)?;
        let path = generate_speech(model, phonemizer.as_ref(), &request, &params, &output_dir)?;
        Ok(vec![NodeValue::String(path.to_string_lossy().into_owned())])
    }

    fn update_params(&mut self, params: Option<&Value>) -> Result<(), NodeError> {
        let config: ZonosNodeConfig = parse_config_optional(params)?;
        config.validate().map_err(NodeError::Configuration)?;
        if config.requires_reload(&self.config) {
            self.cache = build_cache(&config)?;
            if let Some(old) = self.loaded.take() {
                tracing::info!(identifier = %old.identifier, "Cache settings changed, dropping loaded model");
            }
        }
        if config.espeak_program != self.config.espeak_program {
            tracing::info!(program = ?config.espeak_program, "Phonemizer changed");
            self.phonemizer = build_phonemizer(&config);
        }
        self.config = config;
        Ok(())
    }
}

impl NativeNode for ZonosNode {
    fn metadata() -> NodeMetadata {
        NodeMetadata::builder(crate::NODE_KIND)
            .display_name(crate::DISPLAY_NAME)
            .description(
                "Text-to-speech with Zyphra Zonos. Optionally clones the voice of a reference \
                 audio file and returns the path of the generated WAV file.",
            )
            .input("text", InputKind::String { default: "Hello, world!".to_string(), multiline: true })
            .input(
                "language",
                InputKind::Choice {
                    options: LANGUAGES.iter().map(ToString::to_string).collect(),
                    default: LANGUAGES[0].to_string(),
                },
            )
            .input(
                "model_name",
                InputKind::Choice {
                    options: MODEL_NAMES.iter().map(ToString::to_string).collect(),
                    default: MODEL_NAMES[0].to_string(),
                },
            )
            .input("audio_file", InputKind::String { default: String::new(), multiline: false })
            .input("cfg_scale", InputKind::Float { default: 2.0, min: 1.0, max: 10.0, step: 0.1 })
            .output("audio_path", ValueType::String)
            .param_schema(serde_json::json!({
                "type": "object",
                "properties": {
                    "models_dir": {
                        "type": "string",
                        "description": "Local model cache root, one folder per model",
                        "default": "models/TTS/Zonos"
                    },
                    "output_dir": {
                        "type": "string",
                        "description": "Directory generated WAV files are written to",
                        "default": "output"
                    },
                    "device": {
                        "type": "string",
                        "description": "Device to use: 'cpu', 'cuda', or 'auto'",
                        "default": "cpu",
                        "enum": ["cpu", "cuda", "auto"]
                    },
                    "device_index": {
                        "type": "integer",
                        "description": "GPU device index (only used when device is 'cuda')",
                        "default": 0,
                        "minimum": 0
                    },
                    "max_new_tokens": {
                        "type": "integer",
                        "description": "Maximum generated frames (86 per second of audio)",
                        "default": 2580,
                        "minimum": 1
                    },
                    "seed": {
                        "type": ["integer", "null"],
                        "description": "Fixed sampling seed; random per call when unset",
                        "default": null
                    },
                    "sampling": {
                        "type": "object",
                        "properties": {
                            "temperature": {"type": "number", "default": 1.0},
                            "top_p": {"type": "number", "default": 0.0, "minimum": 0.0, "maximum": 1.0},
                            "top_k": {"type": "integer", "default": 0, "minimum": 0},
                            "min_p": {"type": "number", "default": 0.1, "minimum": 0.0, "maximum": 1.0},
                            "repetition_penalty": {"type": "number", "default": 3.0},
                            "repetition_penalty_window": {"type": "integer", "default": 2, "minimum": 1}
                        }
                    },
                    "autoencoder": {
                        "type": "object",
                        "description": "Repository and file holding the 44.1 kHz DAC weights",
                        "properties": {
                            "repo": {"type": "string", "default": "parler-tts/parler-tts-mini-v1"},
                            "filename": {"type": "string", "default": "model.safetensors"},
                            "prefix": {"type": "string", "default": "audio_encoder"}
                        }
                    },
                    "speaker_encoder": {
                        "type": "object",
                        "description": "Repository and files of the speaker embedding model used for voice cloning",
                        "properties": {
                            "repo": {"type": "string", "default": "Zyphra/Zonos-v0.1-speaker-embedding"},
                            "model_file": {"type": "string", "default": "ResNet293_SimAM_ASP_base.pt"},
                            "lda_file": {"type": "string", "default": "ResNet293_SimAM_ASP_base_LDA-128.pt"}
                        }
                    },
                    "espeak_program": {
                        "type": ["string", "null"],
                        "description": "espeak program used for phonemization; espeak-ng or espeak on PATH when unset",
                        "default": null
                    },
                    "hub_cache_dir": {
                        "type": ["string", "null"],
                        "description": "Hugging Face Hub cache directory override",
                        "default": null
                    },
                    "mirror_dir": {
                        "type": ["string", "null"],
                        "description": "Read models from <mirror_dir>/<repo_id>/ instead of the hub",
                        "default": null
                    }
                }
            }))
            .category("audio")
            .build()
    }

    fn new(params: Option<&Value>) -> Result<Self, NodeError> {
        let config: ZonosNodeConfig = parse_config_optional(params)?;
        config.validate().map_err(|e| {
            tracing::error!(error = %e, "Configuration validation failed");
            NodeError::Configuration(e)
        })?;
        let cache = build_cache(&config)?;
        Ok(Self::with_cache(config, cache))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_inputs() {
        let meta = ZonosNode::metadata();
        let names: Vec<&str> = meta.inputs.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["text", "language", "model_name", "audio_file", "cfg_scale"]);
        assert_eq!(meta.outputs.len(), 1);
        assert_eq!(meta.outputs[0].name, "audio_path");

        let defaults = meta.default_inputs();
        assert_eq!(defaults.str("text").unwrap(), "Hello, world!");
        assert_eq!(defaults.str("model_name").unwrap(), "Zyphra/Zonos-v0.1-transformer");
        assert!((defaults.float("cfg_scale").unwrap() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_request_from_inputs() {
        let inputs = ZonosNode::metadata().default_inputs().with("audio_file", "  ");
        let request = ZonosNode::request_from_inputs(&inputs).unwrap();
        assert!(request.reference_audio.is_none());

        let inputs = inputs.with("audio_file", "voice.wav").with("cfg_scale", 10.0);
        let request = ZonosNode::request_from_inputs(&inputs).unwrap();
        assert_eq!(request.reference_audio, Some(PathBuf::from("voice.wav")));
        assert!((request.cfg_scale - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let params = serde_json::json!({"device": "tpu"});
        assert!(matches!(ZonosNode::new(Some(&params)), Err(NodeError::Configuration(_))));
        let params = serde_json::json!({"max_new_tokens": "many"});
        assert!(matches!(ZonosNode::new(Some(&params)), Err(NodeError::Configuration(_))));
    }
}
