// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Candle implementation of the Zonos text-to-speech network.
//!
//! A conditioning prefix (text, speaker, auxiliary features) is followed by
//! autoregressively generated audio codes in a delay pattern. Each step sums
//! the per-codebook embeddings of the previous frame, runs the transformer
//! backbone and samples one token per codebook from its head.

pub mod autoencoder;
pub mod backbone;
pub mod conditioning;
pub mod config;
pub mod delay;
pub mod sampling;
pub mod speaker;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use self::autoencoder::AudioDecoder;
use self::backbone::{Backbone, InferenceCache};
use self::conditioning::{ConditioningSpec, PrefixConditioner};
use self::config::{ConditionerKind, ZonosConfig, MAMBA2_LAYER};
use self::delay::{delay_template, revert_delay, UNKNOWN_TOKEN};
use self::sampling::{Sampler, SamplingParams};
use self::speaker::{LazySpeakerEncoder, SPEAKER_SAMPLE_RATE};
use crate::error::{Result, ZonosError};
use crate::hub::ModelSource;

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Name of the conditioner fed by reference audio.
pub const SPEAKER_CONDITIONER: &str = "speaker";

/// Generation limits and sampling for one `generate` call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub sampling: SamplingParams,
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self { max_new_tokens: 86 * 30, sampling: SamplingParams::default(), seed: None }
    }
}

pub struct Zonos {
    config: ZonosConfig,
    device: Device,
    backbone: Backbone,
    prefix_conditioner: PrefixConditioner,
    embeddings: Vec<Embedding>,
    heads: Vec<Linear>,
    speaker_encoder: Option<Arc<LazySpeakerEncoder>>,
    autoencoder: Arc<dyn AudioDecoder>,
    tensors: HashMap<String, Tensor>,
}

impl std::fmt::Debug for Zonos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zonos")
            .field("d_model", &self.config.backbone.d_model)
            .field("n_layer", &self.config.backbone.n_layer)
            .field("n_q", &self.heads.len())
            .field("device", &self.device)
            .field("speaker_encoder", &self.speaker_encoder.is_some())
            .finish_non_exhaustive()
    }
}

fn speaker_dim(config: &ZonosConfig) -> Option<usize> {
    config.prefix_conditioner.conditioner(SPEAKER_CONDITIONER).and_then(|c| match c.kind {
        ConditionerKind::PassthroughConditioner => Some(c.cond_dim_or(config.backbone.d_model)),
        _ => None,
    })
}

fn check_supported(config: &ZonosConfig) -> Result<()> {
    config.validate()?;
    if let Some(ssm) = config.backbone.mamba()? {
        if ssm.layer != MAMBA2_LAYER {
            return Err(ZonosError::UnsupportedBackbone(format!(
                "state-space layer `{}` (only {MAMBA2_LAYER} is implemented)",
                ssm.layer
            )));
        }
    }
    Ok(())
}

impl Zonos {
    /// Randomly initialised model for `config`, without a speaker encoder.
    ///
    /// # Errors
    ///
    /// Returns [`ZonosError::Config`] or [`ZonosError::UnsupportedBackbone`]
    /// for configs this implementation cannot build.
    pub fn new(config: ZonosConfig, device: &Device, autoencoder: Arc<dyn AudioDecoder>) -> Result<Self> {
        check_supported(&config)?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        Self::build(&config, vb, autoencoder.num_codebooks())?;
        let tensors = varmap
            .data()
            .lock()
            .map_err(|e| ZonosError::Model(e.to_string()))?
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        Self::from_state_dict(config, tensors, device, autoencoder)
    }

    /// Model with the given weights, without a speaker encoder.
    ///
    /// # Errors
    ///
    /// Fails if a weight is missing or has the wrong shape, or the config is
    /// unsupported.
    pub fn from_state_dict(
        config: ZonosConfig,
        tensors: HashMap<String, Tensor>,
        device: &Device,
        autoencoder: Arc<dyn AudioDecoder>,
    ) -> Result<Self> {
        check_supported(&config)?;
        let tensors: HashMap<String, Tensor> = tensors
            .into_iter()
            .map(|(k, v)| -> Result<(String, Tensor)> { Ok((k, v.to_device(device)?.to_dtype(DType::F32)?)) })
            .collect::<Result<_>>()?;
        let vb = VarBuilder::from_tensors(tensors.clone(), DType::F32, device);
        let parts = Self::build(&config, vb, autoencoder.num_codebooks())?;
        Ok(Self {
            config,
            device: device.clone(),
            backbone: parts.backbone,
            prefix_conditioner: parts.prefix_conditioner,
            embeddings: parts.embeddings,
            heads: parts.heads,
            speaker_encoder: None,
            autoencoder,
            tensors,
        })
    }

    fn build(config: &ZonosConfig, vb: VarBuilder, n_q: usize) -> Result<Parts> {
        let d_model = config.backbone.d_model;
        let embeddings = (0..n_q)
            .map(|k| embedding(config.masked_token_id as usize + 1, d_model, vb.pp("embeddings").pp(k)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let heads = (0..n_q)
            .map(|k| linear_no_bias(d_model, config.eos_token_id as usize + 1, vb.pp("heads").pp(k)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Parts {
            backbone: Backbone::new(&config.backbone, config.backbone.mamba()?.as_ref(), vb.pp("backbone"))?,
            prefix_conditioner: PrefixConditioner::new(
                &config.prefix_conditioner,
                d_model,
                vb.pp("prefix_conditioner"),
            )?,
            embeddings,
            heads,
        })
    }

    /// Attaches the encoder used by [`Self::make_speaker_embedding`].
    #[must_use]
    pub fn with_speaker_encoder(mut self, encoder: Arc<LazySpeakerEncoder>) -> Self {
        self.speaker_encoder = Some(encoder);
        self
    }

    /// Replaces every weight. The structural config and the speaker encoder
    /// are unchanged.
    ///
    /// # Errors
    ///
    /// Fails if a weight is missing or has the wrong shape; the model is
    /// left untouched in that case.
    pub fn load_state_dict(&mut self, tensors: HashMap<String, Tensor>) -> Result<()> {
        let mut model =
            Self::from_state_dict(self.config.clone(), tensors, &self.device, Arc::clone(&self.autoencoder))?;
        model.speaker_encoder = self.speaker_encoder.take();
        *self = model;
        Ok(())
    }

    /// Fetches `config.json` and `model.safetensors` of `repo_id` and builds the model.
    ///
    /// # Errors
    ///
    /// Fails if a fetch fails, the config is invalid or unsupported, or the
    /// weights do not match it.
    pub fn from_pretrained(
        source: &dyn ModelSource,
        repo_id: &str,
        device: &Device,
        autoencoder: Arc<dyn AudioDecoder>,
    ) -> Result<Self> {
        let config_path = source.fetch(repo_id, CONFIG_FILE)?;
        let config = ZonosConfig::from_json_str(&std::fs::read_to_string(&config_path)?)?;
        check_supported(&config)?;
        let weights_path = source.fetch(repo_id, WEIGHTS_FILE)?;
        tracing::info!(repo_id, weights = %weights_path.display(), "Loading pretrained weights");
        let tensors = candle_core::safetensors::load(&weights_path, device)?;
        Self::from_state_dict(config, tensors, device, autoencoder)
    }

    pub const fn config(&self) -> &ZonosConfig {
        &self.config
    }

    pub const fn device(&self) -> &Device {
        &self.device
    }

    pub fn autoencoder(&self) -> &dyn AudioDecoder {
        self.autoencoder.as_ref()
    }

    pub const fn has_speaker_encoder(&self) -> bool {
        self.speaker_encoder.is_some()
    }

    /// Every weight by name.
    pub const fn state_dict(&self) -> &HashMap<String, Tensor> {
        &self.tensors
    }

    /// # Errors
    ///
    /// Fails if the file cannot be written.
    pub fn save_safetensors(&self, path: &Path) -> Result<()> {
        candle_core::safetensors::save(&self.tensors, path)?;
        Ok(())
    }

    /// Speaker embedding of mono `samples` recorded at `sample_rate`,
    /// `[1, 1, speaker_dim]`. Loads the speaker encoder on first use.
    ///
    /// # Errors
    ///
    /// Fails if no encoder is attached, it cannot be loaded, its width does
    /// not match the speaker conditioner, or resampling fails.
    pub fn make_speaker_embedding(&self, samples: &[f32], sample_rate: u32) -> Result<Tensor> {
        let expected = speaker_dim(&self.config)
            .ok_or_else(|| ZonosError::Model("model has no speaker conditioner".to_string()))?;
        let encoder = self
            .speaker_encoder
            .as_ref()
            .ok_or_else(|| ZonosError::Model("no speaker encoder is attached".to_string()))?
            .get()?;
        if encoder.embedding_dim() != expected {
            return Err(ZonosError::Model(format!(
                "speaker encoder produces {}-dim embeddings, the speaker conditioner expects {expected}",
                encoder.embedding_dim()
            )));
        }
        let samples = crate::audio::resample(samples, sample_rate, SPEAKER_SAMPLE_RATE)?;
        Ok(encoder.embed(&samples)?)
    }

    /// Prefix hidden states for the conditional and unconditional branches,
    /// stacked on the batch axis: `[2, S, d_model]`.
    ///
    /// Without an explicit `uncond`, the unconditional branch keeps only the
    /// inputs of conditioners that have no unconditional form.
    ///
    /// # Errors
    ///
    /// Returns [`ZonosError::MissingConditioning`] if a required input is absent.
    pub fn prepare_conditioning(&self, cond: &ConditioningSpec, uncond: Option<&ConditioningSpec>) -> Result<Tensor> {
        let default_uncond;
        let uncond = if let Some(u) = uncond {
            u
        } else {
            default_uncond = cond.restricted_to(&self.prefix_conditioner.required_keys());
            &default_uncond
        };
        let cond = self.prefix_conditioner.forward(cond, &self.device)?;
        let uncond = self.prefix_conditioner.forward(uncond, &self.device)?;
        if cond.dims() != uncond.dims() {
            return Err(ZonosError::Model(format!(
                "conditional prefix {:?} and unconditional prefix {:?} differ in shape",
                cond.dims(),
                uncond.dims()
            )));
        }
        Ok(Tensor::cat(&[cond, uncond], 0)?)
    }

    fn embed_frame(&self, frame: &[u32], batch: usize) -> Result<Tensor> {
        let mut sum: Option<Tensor> = None;
        for (emb, &id) in self.embeddings.iter().zip(frame) {
            let ids = Tensor::new(vec![id; batch], &self.device)?.reshape((batch, 1))?;
            let e = emb.forward(&ids)?;
            sum = Some(match sum {
                Some(s) => (s + e)?,
                None => e,
            });
        }
        sum.ok_or_else(|| ZonosError::Model("model has no codebooks".to_string()))
    }

    /// Per-codebook logits of the last position, guided when the batch holds
    /// both branches: `[n_q][vocab]`.
    fn step(&self, hidden: &Tensor, cache: &mut InferenceCache, cfg_scale: f64) -> Result<Vec<Vec<f32>>> {
        let out = self.backbone.forward(hidden, cache)?;
        let last = out.narrow(1, out.dim(1)? - 1, 1)?;
        let logits = self.heads.iter().map(|h| h.forward(&last)).collect::<candle_core::Result<Vec<_>>>()?;
        let logits = Tensor::cat(&logits, 1)?;
        let logits = if logits.dim(0)? == 2 {
            let cond = logits.narrow(0, 0, 1)?;
            let uncond = logits.narrow(0, 1, 1)?;
            (&uncond + ((cond - &uncond)? * cfg_scale)?)?
        } else {
            logits
        };
        Ok(logits.squeeze(0)?.to_dtype(DType::F32)?.to_vec2::<f32>()?)
    }

    /// Generates codes `[1, n_q, frames]` (u32) after the prefix produced by
    /// [`Self::prepare_conditioning`].
    ///
    /// A guidance scale of 1.0 runs the conditional branch alone. Generation
    /// stops once end-of-speech has propagated through every codebook or
    /// `max_new_tokens` frames are produced.
    ///
    /// # Errors
    ///
    /// Fails on tensor errors or an empty token budget.
    pub fn generate(&self, prefix: &Tensor, cfg_scale: f64, params: &GenerationParams) -> Result<Tensor> {
        if params.max_new_tokens == 0 {
            return Err(ZonosError::Model("max_new_tokens must be positive".to_string()));
        }
        let started = Instant::now();
        let n_q = self.heads.len();
        let eos_index = self.config.eos_token_id as usize;
        let eos = i64::from(self.config.eos_token_id);
        let window = params.sampling.repetition_penalty_window;
        let masked = i64::from(self.config.masked_token_id);
        let guided = (cfg_scale - 1.0).abs() > f64::EPSILON;
        let prefix = if guided { prefix.clone() } else { prefix.narrow(0, 0, 1)? };
        let batch = prefix.dim(0)?;

        let mut delayed = delay_template(n_q, params.max_new_tokens, masked);
        let width = params.max_new_tokens + n_q;
        let mut sampler = Sampler::new(params.sampling, params.seed);
        let mut cache = InferenceCache::new(self.backbone.n_layer());

        let first = self.embed_frame(&column(&delayed, 0), batch)?;
        let hidden = Tensor::cat(&[&prefix, &first], 1)?;
        let mut logits = self.step(&hidden, &mut cache, cfg_scale)?;
        let next: Vec<i64> = logits.iter_mut().map(|row| i64::from(sampler.sample(row, None))).collect();
        write_column(&mut delayed, 1, &next);

        let mut offset = 1;
        let mut remaining = width - offset;
        let mut stopping = false;
        while remaining > 0 {
            offset += 1;
            if offset >= width {
                break;
            }
            let input = self.embed_frame(&column(&delayed, offset - 1), batch)?;
            let mut logits = self.step(&input, &mut cache, cfg_scale)?;
            let mut next = Vec::with_capacity(n_q);
            for (k, row) in logits.iter_mut().enumerate() {
                if k > 0 {
                    if let Some(l) = row.get_mut(eos_index) {
                        *l = f32::NEG_INFINITY;
                    }
                }
                let recent = history(&delayed[k][offset.saturating_sub(window)..offset], row.len());
                next.push(i64::from(sampler.sample(row, Some(&recent))));
            }

            if next[0] == eos {
                remaining = remaining.min(n_q);
                stopping = true;
            }
            if stopping {
                let idx = (n_q - remaining.min(n_q)).min(n_q - 1);
                for token in &mut next[..idx] {
                    *token = masked;
                }
                next[idx] = eos;
            }
            write_column(&mut delayed, offset, &next);
            remaining -= 1;
        }

        let frames = offset.saturating_sub(n_q);
        let codebook_size = i64::try_from(self.autoencoder.codebook_size()).unwrap_or(i64::MAX);
        let codes: Vec<u32> = revert_delay(&delayed)
            .into_iter()
            .flat_map(|row| row.into_iter().take(frames))
            .map(|c| if (0..codebook_size).contains(&c) { u32::try_from(c).unwrap_or(0) } else { 0 })
            .collect();
        let frames = codes.len() / n_q.max(1);
        tracing::debug!(
            frames,
            steps = offset,
            stopped_early = stopping,
            seed = sampler.seed(),
            elapsed_ms = started.elapsed().as_millis(),
            "Generated codes"
        );
        Ok(Tensor::from_vec(codes, (1, n_q, frames), &self.device)?)
    }
}

struct Parts {
    backbone: Backbone,
    prefix_conditioner: PrefixConditioner,
    embeddings: Vec<Embedding>,
    heads: Vec<Linear>,
}

fn column(delayed: &[Vec<i64>], t: usize) -> Vec<u32> {
    delayed.iter().map(|row| u32::try_from(row[t]).unwrap_or(0)).collect()
}

/// Fills only the still-unknown slots of column `t`.
fn write_column(delayed: &mut [Vec<i64>], t: usize, tokens: &[i64]) {
    for (row, &token) in delayed.iter_mut().zip(tokens) {
        if let Some(slot) = row.get_mut(t) {
            if *slot == UNKNOWN_TOKEN {
                *slot = token;
            }
        }
    }
}

fn history(row: &[i64], vocab: usize) -> Vec<u32> {
    let last = u32::try_from(vocab.saturating_sub(1)).unwrap_or(u32::MAX);
    row.iter().filter_map(|&t| u32::try_from(t).ok()).map(|t| t.min(last)).collect()
}
