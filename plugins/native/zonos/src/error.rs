// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Error type for model loading, generation and file output.

use lisa_core::NodeError;
use thiserror::Error;

use crate::hub::HubError;
use crate::model::config::ConfigError;

#[derive(Debug, Error)]
pub enum ZonosError {
    /// The structural model config is malformed or inconsistent.
    #[error("Invalid model config: {0}")]
    Config(#[from] ConfigError),

    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Reference audio could not be decoded or resampled.
    #[error("Audio error: {0}")]
    Audio(String),

    #[error("WAV write error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Device error: {0}")]
    Device(String),

    /// The config describes a backbone this implementation cannot run.
    #[error("Unsupported backbone: {0}")]
    UnsupportedBackbone(String),

    /// Text could not be converted to phonemes.
    #[error("Phonemizer error: {0}")]
    Phonemizer(String),

    #[error("Unsupported language '{0}'")]
    UnsupportedLanguage(String),

    /// A conditioner without an unconditional vector received no input.
    #[error("Missing conditioning input for '{0}'")]
    MissingConditioning(String),

    #[error("Model error: {0}")]
    Model(String),
}

pub type Result<T> = std::result::Result<T, ZonosError>;

impl From<ZonosError> for NodeError {
    fn from(err: ZonosError) -> Self {
        Self::Runtime(err.to_string())
    }
}
