// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Zonos text-to-speech node for Lisa
//!
//! Generates speech with Zyphra's Zonos model via the Candle ML framework
//! (pure Rust, no Python runtime) and hands the host the path of a WAV file.
//!
//! # Features
//!
//! - Local model cache with download-and-save and a direct-download fallback
//! - espeak-ng phonemization of the input text
//! - Voice cloning from a reference audio file
//! - Classifier-free guidance with a configurable scale
//! - CPU and CUDA GPU support via Candle
//!
//! # License
//!
//! Plugin code: MPL-2.0
//! Zonos models: Apache 2.0

pub mod audio;
pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod hub;
pub mod model;
pub mod phonemizer;
pub mod pipeline;
pub mod zonos_node;

use lisa_core::NodeRegistry;

pub use cache::{LoadOrigin, LocalModelRecord, ModelCache, ResolvedModel};
pub use config::ZonosNodeConfig;
pub use error::ZonosError;
pub use model::{GenerationParams, Zonos};
pub use phonemizer::{EspeakPhonemizer, Phonemizer};
pub use pipeline::{generate_speech, GenerationRequest};
pub use zonos_node::ZonosNode;

/// Internal name the node is registered under.
pub const NODE_KIND: &str = "ZonosTextToSpeech";

/// Name shown to users.
pub const DISPLAY_NAME: &str = "Lisa Zonos Text to Speech";

/// Registers every node of this plugin.
pub fn register(registry: &mut NodeRegistry) {
    registry.register::<ZonosNode>();
}
