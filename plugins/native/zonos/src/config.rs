// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Configuration for the Zonos text-to-speech node.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::VALID_DEVICES;
use crate::model::autoencoder::AutoencoderSource;
use crate::model::sampling::SamplingParams;
use crate::model::speaker::SpeakerEncoderSource;
use crate::model::GenerationParams;

/// Instance parameters of the Zonos node.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ZonosNodeConfig {
    /// Root of the local model cache, one folder per model.
    #[serde(default = "default_models_dir")]
    pub models_dir: String,

    /// Directory generated WAV files are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Device to use: "cpu", "cuda", or "auto"
    #[serde(default = "default_device")]
    pub device: String,

    /// GPU device index (only used when device is "cuda")
    #[serde(default)]
    pub device_index: usize,

    /// Upper bound on generated frames (86 per second of audio).
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    /// Fixed sampling seed; a fresh one is drawn per call when unset.
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub sampling: SamplingParams,

    #[serde(default)]
    pub autoencoder: AutoencoderSource,

    /// Speaker embedding model used for reference audio.
    #[serde(default)]
    pub speaker_encoder: SpeakerEncoderSource,

    /// espeak program used for phonemization; `espeak-ng`, then `espeak`,
    /// are looked up on `PATH` when unset.
    #[serde(default)]
    pub espeak_program: Option<String>,

    /// Overrides the Hugging Face Hub cache directory.
    #[serde(default)]
    pub hub_cache_dir: Option<String>,

    /// Reads `<mirror_dir>/<repo_id>/<file>` instead of contacting the hub.
    #[serde(default)]
    pub mirror_dir: Option<String>,
}

fn default_models_dir() -> String {
    "models/TTS/Zonos".to_string()
}

fn default_output_dir() -> String {
    "output".to_string()
}

fn default_device() -> String {
    "cpu".to_string()
}

const fn default_max_new_tokens() -> usize {
    86 * 30
}

impl Default for ZonosNodeConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            output_dir: default_output_dir(),
            device: default_device(),
            device_index: 0,
            max_new_tokens: default_max_new_tokens(),
            seed: None,
            sampling: SamplingParams::default(),
            autoencoder: AutoencoderSource::default(),
            speaker_encoder: SpeakerEncoderSource::default(),
            espeak_program: None,
            hub_cache_dir: None,
            mirror_dir: None,
        }
    }
}

impl ZonosNodeConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.models_dir.trim().is_empty() {
            return Err("models_dir must not be empty".to_string());
        }
        if self.output_dir.trim().is_empty() {
            return Err("output_dir must not be empty".to_string());
        }

        if !VALID_DEVICES.contains(&self.normalized_device().as_str()) {
            return Err(format!(
                "Invalid device '{}'. Must be one of: {:?}",
                self.device, VALID_DEVICES
            ));
        }

        if self.max_new_tokens == 0 {
            return Err("max_new_tokens must be greater than 0".to_string());
        }

        if self.autoencoder.repo.is_empty() || self.autoencoder.filename.is_empty() {
            return Err("autoencoder.repo and autoencoder.filename must not be empty".to_string());
        }

        let spk = &self.speaker_encoder;
        if spk.repo.is_empty() || spk.model_file.is_empty() || spk.lda_file.is_empty() {
            return Err("speaker_encoder.repo, model_file and lda_file must not be empty".to_string());
        }

        if self.espeak_program.as_deref().is_some_and(|p| p.trim().is_empty()) {
            return Err("espeak_program must not be empty when set".to_string());
        }

        self.sampling.validate().map_err(|e| format!("Invalid sampling parameters: {e}"))
    }

    /// Get the normalized device string (lowercase).
    #[must_use]
    pub fn normalized_device(&self) -> String {
        self.device.to_lowercase()
    }

    pub fn models_path(&self) -> PathBuf {
        PathBuf::from(&self.models_dir)
    }

    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(&self.output_dir)
    }

    pub const fn generation_params(&self) -> GenerationParams {
        GenerationParams { max_new_tokens: self.max_new_tokens, sampling: self.sampling, seed: self.seed }
    }

    /// True when switching from `other` invalidates a loaded model.
    pub fn requires_reload(&self, other: &Self) -> bool {
        self.models_dir != other.models_dir
            || self.normalized_device() != other.normalized_device()
            || self.device_index != other.device_index
            || self.autoencoder != other.autoencoder
            || self.speaker_encoder != other.speaker_encoder
            || self.hub_cache_dir != other.hub_cache_dir
            || self.mirror_dir != other.mirror_dir
    }
}
