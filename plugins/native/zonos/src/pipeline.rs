// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Text to WAV file with an already loaded model.

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{Device, IndexOp};

use crate::audio::{load_audio, unique_output_path, write_wav};
use crate::error::Result;
use crate::model::conditioning::{ConditioningParams, ConditioningSpec};
use crate::model::{GenerationParams, Zonos};
use crate::phonemizer::Phonemizer;

/// One synthesis call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub text: String,
    /// Language tag, e.g. `en-us` or `ja-jp`.
    pub language: String,
    /// Reference voice; ignored when empty or missing on disk.
    pub reference_audio: Option<PathBuf>,
    pub cfg_scale: f64,
}

impl GenerationRequest {
    pub fn new(text: impl Into<String>, language: impl Into<String>) -> Self {
        Self { text: text.into(), language: language.into(), reference_audio: None, cfg_scale: 2.0 }
    }

    #[must_use]
    pub fn with_reference_audio(mut self, path: impl Into<PathBuf>) -> Self {
        self.reference_audio = Some(path.into());
        self
    }

    #[must_use]
    pub const fn with_cfg_scale(mut self, cfg_scale: f64) -> Self {
        self.cfg_scale = cfg_scale;
        self
    }

    /// The reference path, if it names an existing file.
    pub fn existing_reference(&self) -> Option<&Path> {
        self.reference_audio.as_deref().filter(|p| !p.as_os_str().is_empty() && p.is_file())
    }
}

/// Generates speech for `request` and writes it to a new WAV file in
/// `output_dir`, returning the file's absolute path.
///
/// An existing reference file is always used for cloning, so a speaker
/// encoder that cannot be loaded fails the call.
///
/// # Errors
///
/// Any failure is returned unchanged; nothing is retried.
pub fn generate_speech(
    model: &Zonos,
    phonemizer: &dyn Phonemizer,
    request: &GenerationRequest,
    params: &GenerationParams,
    output_dir: &Path,
) -> Result<PathBuf> {
    let started = Instant::now();

    let speaker = match request.existing_reference() {
        Some(path) => {
            let (samples, sample_rate) = load_audio(path)?;
            tracing::info!(path = %path.display(), sample_rate, "Using reference audio");
            Some(model.make_speaker_embedding(&samples, sample_rate)?)
        },
        None => {
            if let Some(path) = &request.reference_audio {
                if !path.as_os_str().is_empty() {
                    tracing::warn!(path = %path.display(), "Reference audio not found, continuing without it");
                }
            }
            None
        },
    };

    let conditioning = ConditioningParams::new(&request.text, &request.language, speaker);
    let spec = ConditioningSpec::from_params(&conditioning, phonemizer)?;
    let prefix = model.prepare_conditioning(&spec, None)?;
    let codes = model.generate(&prefix, request.cfg_scale, params)?;

    let autoencoder = model.autoencoder();
    let wav = autoencoder.decode(&codes)?.to_device(&Device::Cpu)?;
    let samples = wav.i((0, 0))?.to_vec1::<f32>()?;

    std::fs::create_dir_all(output_dir)?;
    let path = std::path::absolute(unique_output_path(output_dir))?;
    write_wav(&path, &samples, autoencoder.sampling_rate())?;

    tracing::info!(
        path = %path.display(),
        samples = samples.len(),
        sample_rate = autoencoder.sampling_rate(),
        cfg_scale = request.cfg_scale,
        elapsed_ms = started.elapsed().as_millis(),
        "Wrote generated speech"
    );
    Ok(path)
}
