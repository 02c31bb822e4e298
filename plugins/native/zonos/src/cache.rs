// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Local model cache: load from disk, or download and persist, with a
//! direct-download fallback.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use candle_core::Device;
use once_cell::sync::OnceCell;

use crate::error::Result;
use crate::hub::ModelSource;
use crate::model::autoencoder::{AudioDecoder, AutoencoderSource, DacAutoencoder};
use crate::model::config::ZonosConfig;
use crate::model::speaker::{LazySpeakerEncoder, SpeakerEncoderSource};
use crate::model::{Zonos, CONFIG_FILE, WEIGHTS_FILE};

/// Local folder name of a model identifier: its last path segment.
///
/// `Zyphra/Zonos-v0.1-transformer` and `other/Zonos-v0.1-transformer` share
/// a folder.
pub fn model_folder_name(model_id: &str) -> &str {
    let trimmed = model_id.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// On-disk record of one model: `config.json` and `model.safetensors`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalModelRecord {
    dir: PathBuf,
}

impl LocalModelRecord {
    pub fn for_model(root: &Path, model_id: &str) -> Self {
        Self { dir: root.join(model_folder_name(model_id)) }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn weights_path(&self) -> PathBuf {
        self.dir.join(WEIGHTS_FILE)
    }

    /// Both files exist. Contents are not checked.
    pub fn is_complete(&self) -> bool {
        self.config_path().is_file() && self.weights_path().is_file()
    }

    /// # Errors
    ///
    /// Fails if the file cannot be read or the config is invalid.
    pub fn read_config(&self) -> Result<ZonosConfig> {
        Ok(ZonosConfig::from_json_str(&std::fs::read_to_string(self.config_path())?)?)
    }

    /// Writes the structural config, then the weights, overwriting both.
    ///
    /// # Errors
    ///
    /// Fails if the directory or either file cannot be written.
    pub fn write(&self, model: &Zonos) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.config_path(), model.config().to_json_string()?)?;
        model.save_safetensors(&self.weights_path())?;
        Ok(())
    }
}

/// How [`ModelCache::resolve`] obtained a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOrigin {
    /// Rebuilt from the local record.
    Cache,
    /// Downloaded and saved to the local record.
    Fresh,
    /// Downloaded directly after the cache path failed.
    Fallback { reason: String },
}

impl std::fmt::Display for LoadOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cache => f.write_str("cache"),
            Self::Fresh => f.write_str("fresh download"),
            Self::Fallback { .. } => f.write_str("fallback download"),
        }
    }
}

#[derive(Debug)]
pub struct ResolvedModel {
    pub model: Zonos,
    pub origin: LoadOrigin,
}

type AutoencoderLoader = Box<dyn Fn(&dyn ModelSource, &Device) -> Result<Arc<dyn AudioDecoder>> + Send + Sync>;

/// Resolves model identifiers to loaded models, backed by a cache directory.
///
/// Every model shares one autoencoder, loaded on first use, and one speaker
/// encoder, loaded the first time reference audio is embedded.
pub struct ModelCache {
    root: PathBuf,
    device: Device,
    source: Arc<dyn ModelSource>,
    autoencoder: OnceCell<Arc<dyn AudioDecoder>>,
    load_autoencoder: AutoencoderLoader,
    speaker_encoder: Arc<LazySpeakerEncoder>,
}

impl ModelCache {
    /// Cache whose autoencoder is the DAC codec fetched from `ae`.
    pub fn new(root: impl Into<PathBuf>, device: Device, source: Arc<dyn ModelSource>, ae: AutoencoderSource) -> Self {
        let speaker_encoder = default_speaker_encoder(&source, &device);
        Self {
            root: root.into(),
            device,
            source,
            speaker_encoder,
            autoencoder: OnceCell::new(),
            load_autoencoder: Box::new(move |source: &dyn ModelSource, device: &Device| {
                Ok(Arc::new(DacAutoencoder::from_source(source, &ae, device)?) as Arc<dyn AudioDecoder>)
            }),
        }
    }

    /// Cache using an already loaded autoencoder.
    pub fn with_autoencoder(
        root: impl Into<PathBuf>,
        device: Device,
        source: Arc<dyn ModelSource>,
        autoencoder: Arc<dyn AudioDecoder>,
    ) -> Self {
        let speaker_encoder = default_speaker_encoder(&source, &device);
        Self {
            root: root.into(),
            device,
            source,
            speaker_encoder,
            autoencoder: OnceCell::with_value(autoencoder),
            load_autoencoder: Box::new(|_: &dyn ModelSource, _: &Device| {
                Err(crate::error::ZonosError::Model("autoencoder already provided".to_string()))
            }),
        }
    }

    /// Fetches the speaker encoder from `spk` instead of the default repository.
    #[must_use]
    pub fn with_speaker_encoder_source(mut self, spk: SpeakerEncoderSource) -> Self {
        self.speaker_encoder =
            Arc::new(LazySpeakerEncoder::from_source(Arc::clone(&self.source), spk, self.device.clone()));
        self
    }

    pub const fn speaker_encoder(&self) -> &Arc<LazySpeakerEncoder> {
        &self.speaker_encoder
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub const fn device(&self) -> &Device {
        &self.device
    }

    pub fn record(&self, model_id: &str) -> LocalModelRecord {
        LocalModelRecord::for_model(&self.root, model_id)
    }

    /// # Errors
    ///
    /// Fails if the autoencoder weights cannot be fetched or loaded.
    pub fn autoencoder(&self) -> Result<Arc<dyn AudioDecoder>> {
        self.autoencoder
            .get_or_try_init(|| (self.load_autoencoder)(self.source.as_ref(), &self.device))
            .cloned()
    }

    /// Loads `model_id` from the local record when complete, otherwise
    /// downloads and saves it. If either path fails the model is downloaded
    /// directly, without saving.
    ///
    /// # Errors
    ///
    /// Fails if the autoencoder cannot be loaded or the fallback download fails.
    pub fn resolve(&self, model_id: &str) -> Result<ResolvedModel> {
        let started = Instant::now();
        let autoencoder = self.autoencoder()?;
        let record = self.record(model_id);

        let attempt = if record.is_complete() {
            tracing::info!(model_id, dir = %record.dir().display(), "Loading model from local cache");
            self.load_cached(&record, &autoencoder).map(|m| (m, LoadOrigin::Cache))
        } else {
            tracing::info!(model_id, dir = %record.dir().display(), "Model not cached, downloading");
            self.download_and_save(model_id, &record, &autoencoder).map(|m| (m, LoadOrigin::Fresh))
        };

        let (model, origin) = match attempt {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(model_id, error = %e, "Cached load failed, retrying with a direct download");
                let model = Zonos::from_pretrained(self.source.as_ref(), model_id, &self.device, autoencoder)?;
                (model, LoadOrigin::Fallback { reason: e.to_string() })
            },
        };
        let model = model.with_speaker_encoder(Arc::clone(&self.speaker_encoder));
        tracing::info!(
            model_id,
            origin = %origin,
            elapsed_ms = started.elapsed().as_millis(),
            "Model ready"
        );
        Ok(ResolvedModel { model, origin })
    }

    fn load_cached(&self, record: &LocalModelRecord, autoencoder: &Arc<dyn AudioDecoder>) -> Result<Zonos> {
        let config = record.read_config()?;
        let tensors = candle_core::safetensors::load(record.weights_path(), &self.device)?;
        Zonos::from_state_dict(config, tensors, &self.device, Arc::clone(autoencoder))
    }

    fn download_and_save(
        &self,
        model_id: &str,
        record: &LocalModelRecord,
        autoencoder: &Arc<dyn AudioDecoder>,
    ) -> Result<Zonos> {
        let model = Zonos::from_pretrained(self.source.as_ref(), model_id, &self.device, Arc::clone(autoencoder))?;
        record.write(&model)?;
        tracing::info!(model_id, dir = %record.dir().display(), "Saved model to local cache");
        Ok(model)
    }
}

fn default_speaker_encoder(source: &Arc<dyn ModelSource>, device: &Device) -> Arc<LazySpeakerEncoder> {
    Arc::new(LazySpeakerEncoder::from_source(Arc::clone(source), SpeakerEncoderSource::default(), device.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_folder_name() {
        assert_eq!(model_folder_name("Zyphra/Zonos-v0.1-transformer"), "Zonos-v0.1-transformer");
        assert_eq!(model_folder_name("Zyphra/Zonos-v0.1-hybrid/"), "Zonos-v0.1-hybrid");
        assert_eq!(model_folder_name("local-model"), "local-model");
    }

    #[test]
    fn test_record_completeness() {
        let dir = tempfile::tempdir().unwrap();
        let record = LocalModelRecord::for_model(dir.path(), "org/model");
        assert_eq!(record.dir(), dir.path().join("model"));
        assert!(!record.is_complete());

        std::fs::create_dir_all(record.dir()).unwrap();
        std::fs::write(record.config_path(), "{}").unwrap();
        assert!(!record.is_complete());
        std::fs::write(record.weights_path(), b"").unwrap();
        assert!(record.is_complete());
        assert!(record.read_config().is_err());
    }
}
