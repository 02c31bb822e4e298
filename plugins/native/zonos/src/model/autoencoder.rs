// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Codes-to-waveform decoding.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::dac;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hub::ModelSource;

/// Turns generated codes into audio.
pub trait AudioDecoder: Send + Sync {
    fn num_codebooks(&self) -> usize;

    /// Codes at or above this value are not valid entries.
    fn codebook_size(&self) -> usize;

    fn sampling_rate(&self) -> u32;

    /// `[batch, num_codebooks, frames]` u32 codes to `[batch, 1, samples]` f32 audio.
    ///
    /// # Errors
    ///
    /// Fails on tensor errors.
    fn decode(&self, codes: &Tensor) -> Result<Tensor>;
}

/// Where to fetch DAC weights from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoencoderSource {
    pub repo: String,
    pub filename: String,
    /// Key prefix the codec weights live under, stripped before loading.
    pub prefix: String,
}

impl Default for AutoencoderSource {
    fn default() -> Self {
        Self {
            repo: "parler-tts/parler-tts-mini-v1".to_string(),
            filename: "model.safetensors".to_string(),
            prefix: "audio_encoder".to_string(),
        }
    }
}

/// 44.1 kHz Descript Audio Codec.
pub struct DacAutoencoder {
    model: dac::Model,
    config: dac::Config,
}

impl DacAutoencoder {
    pub const fn config_44khz() -> dac::Config {
        dac::Config {
            num_codebooks: 9,
            model_bitrate: 8,
            codebook_size: 1024,
            latent_dim: 1024,
            frame_rate: 86,
            sampling_rate: 44_100,
        }
    }

    /// Loads codec weights from a safetensors file, keeping only the keys
    /// under `prefix` (all keys when empty).
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or lacks codec weights.
    pub fn load(path: &Path, prefix: &str, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)?;
        let tensors: HashMap<String, Tensor> = if prefix.is_empty() {
            tensors
        } else {
            let prefix = format!("{prefix}.");
            tensors
                .into_iter()
                .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|k| (k.to_string(), v)))
                .collect()
        };
        tracing::debug!(path = %path.display(), tensors = tensors.len(), "Loading DAC weights");
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        let config = Self::config_44khz();
        let model = dac::Model::new(&config, vb)?;
        Ok(Self { model, config })
    }

    /// Fetches the weights file through `source`, then loads it.
    ///
    /// # Errors
    ///
    /// Fails if the fetch or the load fails.
    pub fn from_source(source: &dyn ModelSource, ae: &AutoencoderSource, device: &Device) -> Result<Self> {
        let path = source.fetch(&ae.repo, &ae.filename)?;
        tracing::info!(repo = %ae.repo, path = %path.display(), "Loading DAC autoencoder");
        Self::load(&path, &ae.prefix, device)
    }
}

impl AudioDecoder for DacAutoencoder {
    fn num_codebooks(&self) -> usize {
        self.config.num_codebooks
    }

    fn codebook_size(&self) -> usize {
        self.config.codebook_size
    }

    fn sampling_rate(&self) -> u32 {
        self.config.sampling_rate
    }

    fn decode(&self, codes: &Tensor) -> Result<Tensor> {
        Ok(self.model.decode_codes(codes)?.to_dtype(DType::F32)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    const HOP: usize = 8 * 8 * 4 * 2;

    /// Writes randomly initialised 44.1 kHz DAC weights under `audio_encoder.`.
    fn write_dac_weights(dir: &Path) -> std::path::PathBuf {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        dac::Model::new(&DacAutoencoder::config_44khz(), vb.pp("audio_encoder")).unwrap();
        for var in varmap.all_vars() {
            let noise = Tensor::rand(-0.1f32, 0.1, var.shape(), &Device::Cpu).unwrap();
            var.set(&noise).unwrap();
        }
        let path = dir.join("model.safetensors");
        varmap.save(&path).unwrap();
        path
    }

    #[test]
    fn test_load_and_decode() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_dac_weights(dir.path());
        let ae = DacAutoencoder::load(&path, "audio_encoder", &Device::Cpu).unwrap();
        assert_eq!(ae.num_codebooks(), 9);
        assert_eq!(ae.codebook_size(), 1024);
        assert_eq!(ae.sampling_rate(), 44_100);

        let frames = 3;
        let codes = Tensor::zeros((1, 9, frames), DType::U32, &Device::Cpu).unwrap();
        let wav = ae.decode(&codes).unwrap();
        assert_eq!(wav.dims(), [1, 1, frames * HOP]);
        assert_eq!(wav.dtype(), DType::F32);
        let peak = wav.abs().unwrap().flatten_all().unwrap().max(0).unwrap().to_scalar::<f32>().unwrap();
        assert!(peak.is_finite());
    }

    #[test]
    fn test_wrong_prefix_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_dac_weights(dir.path());
        assert!(DacAutoencoder::load(&path, "decoder", &Device::Cpu).is_err());
        assert!(DacAutoencoder::load(&path, "", &Device::Cpu).is_err());
    }
}
