// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde_json::{json, Value};
use zonos::hub::{HubError, LocalDirSource, ModelSource};
use zonos::model::autoencoder::AudioDecoder;
use zonos::model::config::ZonosConfig;
use zonos::model::speaker::{SpeakerEncoder, SpeakerEncoderShape, SpeakerEncoderSource};
use zonos::{ModelCache, Phonemizer, Zonos, ZonosError};

pub const TRANSFORMER_ID: &str = "Zyphra/Zonos-v0.1-transformer";
pub const HYBRID_ID: &str = "Zyphra/Zonos-v0.1-hybrid";
pub const SPEAKER_ID: &str = "Zyphra/Zonos-v0.1-speaker-embedding";

/// Speaker encoder small enough for CPU tests; its 16-wide embedding fits
/// the speaker conditioner of [`tiny_config_json`].
pub const TINY_SPEAKER: SpeakerEncoderShape = SpeakerEncoderShape {
    in_planes: 4,
    blocks: [1, 1, 1, 1],
    n_mels: 16,
    attention_dim: 8,
    embedding_dim: 12,
    lda_dim: 16,
};

/// Two-layer model with every conditioner kind, small enough for CPU tests.
pub fn tiny_config_json() -> Value {
    json!({
        "backbone": {
            "d_model": 32,
            "d_intermediate": 0,
            "attn_mlp_d_intermediate": 64,
            "n_layer": 2,
            "ssm_cfg": {},
            "attn_layer_idx": [],
            "attn_cfg": {
                "causal": true,
                "num_heads": 4,
                "num_heads_kv": 2,
                "rotary_emb_dim": 8,
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
                {"uncond_type": "learned", "type": "FourierConditioner", "name": "pitch_std",
                 "min_val": 0, "max_val": 400},
                {"uncond_type": "learned", "type": "FourierConditioner", "name": "speaking_rate",
                 "min_val": 0, "max_val": 40},
                {"min_val": 0, "max_val": 126, "uncond_type": "learned",
                 "type": "IntegerConditioner", "name": "language_id"},
                {"min_val": 0, "max_val": 1, "uncond_type": "learned",
                 "type": "IntegerConditioner", "name": "speaker_noised"}
            ],
            "projection": "none"
        },
        "eos_token_id": 1024,
        "masked_token_id": 1025
    })
}

/// [`tiny_config_json`] with a Mamba2 first layer and an attention second layer.
pub fn hybrid_config_json() -> Value {
    let mut config = tiny_config_json();
    config["backbone"]["d_intermediate"] = json!(64);
    config["backbone"]["ssm_cfg"] = json!({"layer": "Mamba2", "d_state": 8, "headdim": 16});
    config["backbone"]["attn_layer_idx"] = json!([1]);
    config
}

pub fn tiny_config() -> ZonosConfig {
    ZonosConfig::from_json(&tiny_config_json()).unwrap()
}

/// Decoder producing silence, 64 samples per frame.
pub struct StubDecoder;

impl AudioDecoder for StubDecoder {
    fn num_codebooks(&self) -> usize {
        9
    }

    fn codebook_size(&self) -> usize {
        1024
    }

    fn sampling_rate(&self) -> u32 {
        8000
    }

    fn decode(&self, codes: &Tensor) -> Result<Tensor, ZonosError> {
        let (batch, _, frames) = codes.dims3()?;
        Ok(Tensor::zeros((batch, 1, frames * 64), DType::F32, codes.device())?)
    }
}

pub fn stub_decoder() -> Arc<dyn AudioDecoder> {
    Arc::new(StubDecoder)
}

/// Writes a randomly initialised model as `<root>/<repo_id>/{config.json,model.safetensors}`.
pub fn write_fixture_repo(root: &Path, repo_id: &str) -> Zonos {
    write_fixture_repo_with(root, repo_id, &tiny_config_json())
}

pub fn write_fixture_repo_with(root: &Path, repo_id: &str, config: &Value) -> Zonos {
    let config = ZonosConfig::from_json(config).unwrap();
    let model = Zonos::new(config, &Device::Cpu, stub_decoder()).unwrap();
    let dir = root.join(repo_id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("config.json"), model.config().to_json_string().unwrap()).unwrap();
    model.save_safetensors(&dir.join("model.safetensors")).unwrap();
    model
}

/// Where [`write_speaker_repo`] puts the speaker encoder.
pub fn speaker_source() -> SpeakerEncoderSource {
    SpeakerEncoderSource {
        repo: SPEAKER_ID.to_string(),
        model_file: "resnet.safetensors".to_string(),
        lda_file: "lda.safetensors".to_string(),
    }
}

/// Writes a randomly initialised [`TINY_SPEAKER`] encoder under `<root>/<SPEAKER_ID>`.
pub fn write_speaker_repo(root: &Path) {
    let model = VarMap::new();
    let lda = VarMap::new();
    SpeakerEncoder::new(
        &TINY_SPEAKER,
        VarBuilder::from_varmap(&model, DType::F32, &Device::Cpu),
        VarBuilder::from_varmap(&lda, DType::F32, &Device::Cpu),
    )
    .unwrap();
    let spk = speaker_source();
    let dir = root.join(&spk.repo);
    std::fs::create_dir_all(&dir).unwrap();
    model.save(dir.join(&spk.model_file)).unwrap();
    lda.save(dir.join(&spk.lda_file)).unwrap();
}

/// Passes text through unchanged so tests do not need espeak installed.
pub struct StubPhonemizer;

impl Phonemizer for StubPhonemizer {
    fn phonemize(&self, text: &str, _language: &str) -> Result<String, ZonosError> {
        Ok(text.to_lowercase())
    }
}

pub fn stub_phonemizer() -> Arc<dyn Phonemizer> {
    Arc::new(StubPhonemizer)
}

/// Local mirror that counts fetches.
pub struct CountingSource {
    inner: LocalDirSource,
    fetches: AtomicUsize,
}

impl CountingSource {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { inner: LocalDirSource::new(root), fetches: AtomicUsize::new(0) })
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ModelSource for CountingSource {
    fn fetch(&self, repo_id: &str, filename: &str) -> Result<PathBuf, HubError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(repo_id, filename)
    }
}

pub fn model_cache(models_dir: &Path, source: &Arc<CountingSource>) -> ModelCache {
    ModelCache::with_autoencoder(models_dir, Device::Cpu, Arc::clone(source) as Arc<dyn ModelSource>, stub_decoder())
        .with_speaker_encoder_source(speaker_source())
}

/// Mono 16-bit WAV with a quiet tone.
pub fn write_reference_wav(path: &Path, sample_rate: u32, seconds: f32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let frames = (sample_rate as f32 * seconds) as usize;
    for i in 0..frames {
        #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
        let sample = ((i as f32 * 0.07).sin() * 8000.0) as i16;
        writer.write_sample(sample).unwrap();
    }
    writer.finalize().unwrap();
}
