// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Speaker encoder: reference audio to a fixed-size voice embedding.
//!
//! Mean-normalized log-mel features feed a SimAM ResNet, attentive statistics
//! pooling collapses time, and a bottleneck plus LDA projection yields the
//! embedding. The network ships separately from the TTS checkpoint, as a
//! ResNet state dict and an LDA state dict, and is loaded on first use.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Module, ModuleT, Tensor};
use candle_nn::{
    batch_norm, conv1d, conv2d_no_bias, linear, BatchNorm, Conv1d, Conv2d, Conv2dConfig, Linear, VarBuilder,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ZonosError};
use crate::hub::ModelSource;

pub const SPEAKER_SAMPLE_RATE: u32 = 16_000;
const N_FFT: usize = 512;
const WIN_LENGTH: usize = 400;
const HOP_LENGTH: usize = 160;
const LOG_EPS: f64 = 1e-6;
const BN_EPS: f64 = 1e-5;
const SIMAM_LAMBDA: f64 = 1e-4;
const POOL_VAR_FLOOR: f64 = 1e-5;
const LAYER_STRIDES: [usize; 4] = [1, 2, 2, 2];
const LAYER_WIDTHS: [usize; 4] = [1, 2, 4, 8];

/// Where to fetch the speaker encoder from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakerEncoderSource {
    pub repo: String,
    /// ResNet state dict, pickled (`.pt`) or safetensors.
    pub model_file: String,
    /// LDA projection with `weight` and `bias`.
    pub lda_file: String,
}

impl Default for SpeakerEncoderSource {
    fn default() -> Self {
        Self {
            repo: "Zyphra/Zonos-v0.1-speaker-embedding".to_string(),
            model_file: "ResNet293_SimAM_ASP_base.pt".to_string(),
            lda_file: "ResNet293_SimAM_ASP_base_LDA-128.pt".to_string(),
        }
    }
}

/// Network dimensions. The published checkpoint is ResNet293: 64 planes,
/// `[10, 20, 64, 10]` blocks, 80 mels, a 256-wide bottleneck and 128 LDA outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeakerEncoderShape {
    pub in_planes: usize,
    pub blocks: [usize; 4],
    pub n_mels: usize,
    pub attention_dim: usize,
    pub embedding_dim: usize,
    pub lda_dim: usize,
}

impl SpeakerEncoderShape {
    /// Channels times frequency bins entering the pooling layer.
    pub const fn pooled_channels(&self) -> usize {
        self.in_planes * 8 * (self.n_mels / 8)
    }

    /// Reads the dimensions off the weights themselves.
    ///
    /// # Errors
    ///
    /// Returns [`ZonosError::Model`] naming the first tensor that is missing
    /// or has an unexpected rank.
    pub fn infer(model: &HashMap<String, Tensor>, lda: &HashMap<String, Tensor>) -> Result<Self> {
        let dims = |map: &HashMap<String, Tensor>, key: &str, rank: usize| -> Result<Vec<usize>> {
            let dims = map
                .get(key)
                .ok_or_else(|| ZonosError::Model(format!("speaker encoder weights lack `{key}`")))?
                .dims()
                .to_vec();
            if dims.len() != rank {
                return Err(ZonosError::Model(format!("speaker encoder `{key}` has shape {dims:?}")));
            }
            Ok(dims)
        };

        let in_planes = dims(model, "front.conv1.weight", 4)?[0];
        let mut blocks = [0; 4];
        for (l, count) in blocks.iter_mut().enumerate() {
            *count = (0..).take_while(|j| model.contains_key(&format!("front.layer{}.{j}.conv1.weight", l + 1))).count();
            if *count == 0 {
                return Err(ZonosError::Model(format!("speaker encoder has no blocks in layer{}", l + 1)));
            }
        }
        let attention = dims(model, "pooling.attention.0.weight", 3)?;
        let bottleneck = dims(model, "bottleneck.weight", 2)?;
        let lda_weight = dims(lda, "weight", 2)?;
        Ok(Self {
            in_planes,
            blocks,
            n_mels: attention[1] / (in_planes * 8) * 8,
            attention_dim: attention[0],
            embedding_dim: bottleneck[0],
            lda_dim: lda_weight[0],
        })
    }
}

fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}

/// Triangular HTK mel filters up to Nyquist, row-major `[n_fft / 2 + 1, n_mels]`.
pub fn mel_filterbank(sample_rate: u32, n_fft: usize, n_mels: usize) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let nyquist = f64::from(sample_rate) / 2.0;
    let top = hz_to_mel(nyquist);
    #[allow(clippy::cast_precision_loss)]
    let points: Vec<f64> = (0..n_mels + 2).map(|i| mel_to_hz(top * i as f64 / (n_mels + 1) as f64)).collect();

    let mut bank = vec![0f32; n_freqs * n_mels];
    for k in 0..n_freqs {
        #[allow(clippy::cast_precision_loss)]
        let freq = k as f64 * f64::from(sample_rate) / n_fft as f64;
        for m in 0..n_mels {
            let (lo, center, hi) = (points[m], points[m + 1], points[m + 2]);
            let rising = (freq - lo) / (center - lo);
            let falling = (hi - freq) / (hi - center);
            #[allow(clippy::cast_possible_truncation)]
            let weight = rising.min(falling).max(0.0) as f32;
            bank[k * n_mels + m] = weight;
        }
    }
    bank
}

/// Periodic Hann window of `win_length`, zero-padded to `n_fft` and centered.
fn padded_hann_window(win_length: usize, n_fft: usize) -> Vec<f32> {
    let offset = (n_fft - win_length) / 2;
    let mut window = vec![0f32; n_fft];
    for i in 0..win_length {
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let w = (0.5 - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / win_length as f64).cos()) as f32;
        window[offset + i] = w;
    }
    window
}

/// Real DFT basis as two `[n_fft, n_fft / 2 + 1]` matrices.
fn dft_basis(n_fft: usize) -> (Vec<f32>, Vec<f32>) {
    let n_freqs = n_fft / 2 + 1;
    let mut cos = vec![0f32; n_fft * n_freqs];
    let mut sin = vec![0f32; n_fft * n_freqs];
    for n in 0..n_fft {
        for k in 0..n_freqs {
            #[allow(clippy::cast_precision_loss)]
            let angle = 2.0 * std::f64::consts::PI * (n * k) as f64 / n_fft as f64;
            #[allow(clippy::cast_possible_truncation)]
            {
                cos[n * n_freqs + k] = angle.cos() as f32;
                sin[n * n_freqs + k] = -angle.sin() as f32;
            }
        }
    }
    (cos, sin)
}

/// Reflect-pads by `pad` on both sides, zero-extending signals too short to mirror.
fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    let mut signal = samples.to_vec();
    if signal.len() <= pad {
        signal.resize(pad + 1, 0.0);
    }
    let len = signal.len();
    (0..len + 2 * pad)
        .map(|i| {
            let j = if i < pad {
                pad - i
            } else if i - pad >= len {
                2 * (len - 1) - (i - pad)
            } else {
                i - pad
            };
            signal[j]
        })
        .collect()
}

/// Parameter-free attention weighting each activation by its distinctiveness
/// within its channel.
fn simam(x: &Tensor) -> candle_core::Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    #[allow(clippy::cast_precision_loss)]
    let n = (h * w).saturating_sub(1).max(1) as f64;
    let d = x.broadcast_sub(&x.mean_keepdim((2, 3))?)?.sqr()?;
    let v = (d.sum_keepdim((2, 3))? / n)?;
    let e_inv = (d.broadcast_div(&((v + SIMAM_LAMBDA)? * 4.0)?)? + 0.5)?;
    x * candle_nn::ops::sigmoid(&e_inv)?
}

struct SimAmBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    downsample: Option<(Conv2d, BatchNorm)>,
}

impl SimAmBlock {
    fn new(in_planes: usize, planes: usize, stride: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let strided = Conv2dConfig { padding: 1, stride, ..Default::default() };
        let same = Conv2dConfig { padding: 1, ..Default::default() };
        let downsample = if stride != 1 || in_planes != planes {
            let ds = vb.pp("downsample");
            Some((
                conv2d_no_bias(in_planes, planes, 1, Conv2dConfig { stride, ..Default::default() }, ds.pp(0))?,
                batch_norm(planes, BN_EPS, ds.pp(1))?,
            ))
        } else {
            None
        };
        Ok(Self {
            conv1: conv2d_no_bias(in_planes, planes, 3, strided, vb.pp("conv1"))?,
            bn1: batch_norm(planes, BN_EPS, vb.pp("bn1"))?,
            conv2: conv2d_no_bias(planes, planes, 3, same, vb.pp("conv2"))?,
            bn2: batch_norm(planes, BN_EPS, vb.pp("bn2"))?,
            downsample,
        })
    }
}

impl Module for SimAmBlock {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let out = self.bn1.forward_t(&self.conv1.forward(x)?, false)?.relu()?;
        let out = simam(&self.bn2.forward_t(&self.conv2.forward(&out)?, false)?)?;
        let shortcut = match &self.downsample {
            Some((conv, bn)) => bn.forward_t(&conv.forward(x)?, false)?,
            None => x.clone(),
        };
        (out + shortcut)?.relu()
    }
}

/// Attentive statistics pooling over time: weighted mean and standard deviation.
struct AttentiveStatsPool {
    conv1: Conv1d,
    bn: BatchNorm,
    conv2: Conv1d,
}

impl AttentiveStatsPool {
    fn new(channels: usize, attention_dim: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let vb = vb.pp("attention");
        Ok(Self {
            conv1: conv1d(channels, attention_dim, 1, Default::default(), vb.pp(0))?,
            bn: batch_norm(attention_dim, BN_EPS, vb.pp(2))?,
            conv2: conv1d(attention_dim, channels, 1, Default::default(), vb.pp(3))?,
        })
    }
}

impl Module for AttentiveStatsPool {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let (b, c, f, t) = x.dims4()?;
        let x = x.reshape((b, c * f, t))?;
        let w = self.bn.forward_t(&self.conv1.forward(&x)?.relu()?, false)?;
        let w = candle_nn::ops::softmax(&self.conv2.forward(&w)?, 2)?;
        let mu = (&x * &w)?.sum(2)?;
        let var = ((x.sqr()? * &w)?.sum(2)? - mu.sqr()?)?;
        let sg = var.maximum(POOL_VAR_FLOOR)?.sqrt()?;
        Tensor::cat(&[mu, sg], 1)
    }
}

pub struct SpeakerEncoder {
    shape: SpeakerEncoderShape,
    window: Vec<f32>,
    dft_cos: Tensor,
    dft_sin: Tensor,
    mel_bank: Tensor,
    conv1: Conv2d,
    bn1: BatchNorm,
    blocks: Vec<SimAmBlock>,
    pooling: AttentiveStatsPool,
    bottleneck: Linear,
    lda: Linear,
    device: Device,
}

impl std::fmt::Debug for SpeakerEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeakerEncoder").field("shape", &self.shape).field("device", &self.device).finish_non_exhaustive()
    }
}

impl SpeakerEncoder {
    /// Builds the network from `vb` (ResNet keys: `front`, `pooling`,
    /// `bottleneck`) and `lda_vb` (`weight`, `bias`).
    ///
    /// # Errors
    ///
    /// Fails if a weight is missing or has the wrong shape.
    pub fn new(shape: &SpeakerEncoderShape, vb: VarBuilder, lda_vb: VarBuilder) -> candle_core::Result<Self> {
        let device = vb.device().clone();
        let front = vb.pp("front");
        let mut blocks = Vec::with_capacity(shape.blocks.iter().sum());
        let mut in_planes = shape.in_planes;
        for (l, &count) in shape.blocks.iter().enumerate() {
            let planes = shape.in_planes * LAYER_WIDTHS[l];
            let layer = front.pp(format!("layer{}", l + 1));
            for j in 0..count {
                let stride = if j == 0 { LAYER_STRIDES[l] } else { 1 };
                blocks.push(SimAmBlock::new(in_planes, planes, stride, layer.pp(j))?);
                in_planes = planes;
            }
        }

        let n_freqs = N_FFT / 2 + 1;
        let (cos, sin) = dft_basis(N_FFT);
        let mel_bank = mel_filterbank(SPEAKER_SAMPLE_RATE, N_FFT, shape.n_mels);
        let stem = Conv2dConfig { padding: 1, ..Default::default() };
        Ok(Self {
            shape: *shape,
            window: padded_hann_window(WIN_LENGTH, N_FFT),
            dft_cos: Tensor::from_vec(cos, (N_FFT, n_freqs), &device)?,
            dft_sin: Tensor::from_vec(sin, (N_FFT, n_freqs), &device)?,
            mel_bank: Tensor::from_vec(mel_bank, (n_freqs, shape.n_mels), &device)?,
            conv1: conv2d_no_bias(1, shape.in_planes, 3, stem, front.pp("conv1"))?,
            bn1: batch_norm(shape.in_planes, BN_EPS, front.pp("bn1"))?,
            blocks,
            pooling: AttentiveStatsPool::new(shape.pooled_channels(), shape.attention_dim, vb.pp("pooling"))?,
            bottleneck: linear(2 * shape.pooled_channels(), shape.embedding_dim, vb.pp("bottleneck"))?,
            lda: linear(shape.embedding_dim, shape.lda_dim, lda_vb)?,
            device,
        })
    }

    /// Builds the network from loaded state dicts, inferring its shape.
    ///
    /// # Errors
    ///
    /// Fails if a weight is missing or has the wrong shape.
    pub fn from_tensors(
        model: HashMap<String, Tensor>,
        lda: HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<Self> {
        let shape = SpeakerEncoderShape::infer(&model, &lda)?;
        let vb = VarBuilder::from_tensors(model, DType::F32, device);
        let lda_vb = VarBuilder::from_tensors(lda, DType::F32, device);
        Ok(Self::new(&shape, vb, lda_vb)?)
    }

    /// Loads both state dicts from disk.
    ///
    /// # Errors
    ///
    /// Fails if either file cannot be read or the weights do not fit together.
    pub fn load(model_path: &Path, lda_path: &Path, device: &Device) -> Result<Self> {
        let model = read_state_dict(model_path, device)?;
        let lda = read_state_dict(lda_path, device)?;
        tracing::debug!(path = %model_path.display(), tensors = model.len(), "Loading speaker encoder weights");
        Self::from_tensors(model, lda, device)
    }

    /// Fetches both files through `source`, then loads them.
    ///
    /// # Errors
    ///
    /// Fails if a fetch or the load fails.
    pub fn from_source(source: &dyn ModelSource, spk: &SpeakerEncoderSource, device: &Device) -> Result<Self> {
        let model_path = source.fetch(&spk.repo, &spk.model_file)?;
        let lda_path = source.fetch(&spk.repo, &spk.lda_file)?;
        tracing::info!(repo = %spk.repo, path = %model_path.display(), "Loading speaker encoder");
        let encoder = Self::load(&model_path, &lda_path, device)?;
        tracing::debug!(shape = ?encoder.shape, "Speaker encoder ready");
        Ok(encoder)
    }

    pub const fn shape(&self) -> &SpeakerEncoderShape {
        &self.shape
    }

    /// Width of the embedding returned by [`Self::embed`].
    pub const fn embedding_dim(&self) -> usize {
        self.shape.lda_dim
    }

    /// Log-mel features of 16 kHz audio, mean-normalized over time: `[n_mels, frames]`.
    ///
    /// # Errors
    ///
    /// Fails on tensor errors.
    pub fn features(&self, samples: &[f32]) -> candle_core::Result<Tensor> {
        let padded = reflect_pad(samples, N_FFT / 2);
        let n_frames = 1 + (padded.len() - N_FFT) / HOP_LENGTH;
        let mut frames = Vec::with_capacity(n_frames * N_FFT);
        for f in 0..n_frames {
            let start = f * HOP_LENGTH;
            frames.extend(padded[start..start + N_FFT].iter().zip(&self.window).map(|(s, w)| s * w));
        }
        let frames = Tensor::from_vec(frames, (n_frames, N_FFT), &self.device)?;
        let re = frames.matmul(&self.dft_cos)?;
        let im = frames.matmul(&self.dft_sin)?;
        let power = (re.sqr()? + im.sqr()?)?;
        let mel = (power.matmul(&self.mel_bank)? + LOG_EPS)?.log()?.t()?;
        mel.broadcast_sub(&mel.mean_keepdim(1)?)
    }

    /// LDA-projected embedding of 16 kHz mono audio, `[1, 1, lda_dim]`.
    ///
    /// # Errors
    ///
    /// Fails on tensor errors.
    pub fn embed(&self, samples: &[f32]) -> candle_core::Result<Tensor> {
        let features = self.features(samples)?;
        let (n_mels, frames) = features.dims2()?;
        let x = features.contiguous()?.reshape((1, 1, n_mels, frames))?;
        let mut x = self.bn1.forward_t(&self.conv1.forward(&x)?, false)?.relu()?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        let embedding = self.bottleneck.forward(&self.pooling.forward(&x)?)?;
        self.lda.forward(&embedding)?.to_dtype(DType::F32)?.unsqueeze(0)
    }
}

fn read_state_dict(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    if path.extension().is_some_and(|ext| ext == "safetensors") {
        return Ok(candle_core::safetensors::load(path, device)?);
    }
    candle_core::pickle::read_all(path)?
        .into_iter()
        .map(|(name, tensor)| Ok((name, tensor.to_device(device)?)))
        .collect()
}

type SpeakerLoader = Box<dyn Fn() -> Result<SpeakerEncoder> + Send + Sync>;

/// Speaker encoder loaded on first use and shared by every model.
///
/// A failed load is not remembered: the next call tries again.
pub struct LazySpeakerEncoder {
    cell: OnceCell<SpeakerEncoder>,
    load: SpeakerLoader,
}

impl std::fmt::Debug for LazySpeakerEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazySpeakerEncoder").field("loaded", &self.is_loaded()).finish_non_exhaustive()
    }
}

impl LazySpeakerEncoder {
    pub fn new(load: impl Fn() -> Result<SpeakerEncoder> + Send + Sync + 'static) -> Self {
        Self { cell: OnceCell::new(), load: Box::new(load) }
    }

    /// Encoder fetched from `spk` through `source` when first needed.
    pub fn from_source(source: Arc<dyn ModelSource>, spk: SpeakerEncoderSource, device: Device) -> Self {
        Self::new(move || SpeakerEncoder::from_source(source.as_ref(), &spk, &device))
    }

    pub fn loaded(encoder: SpeakerEncoder) -> Self {
        Self {
            cell: OnceCell::with_value(encoder),
            load: Box::new(|| Err(ZonosError::Model("speaker encoder already provided".to_string()))),
        }
    }

    /// # Errors
    ///
    /// Fails if the encoder is not loaded yet and loading it fails.
    pub fn get(&self) -> Result<&SpeakerEncoder> {
        self.cell.get_or_try_init(|| (self.load)())
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_nn::VarMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) const TINY: SpeakerEncoderShape = SpeakerEncoderShape {
        in_planes: 4,
        blocks: [1, 2, 1, 1],
        n_mels: 16,
        attention_dim: 8,
        embedding_dim: 12,
        lda_dim: 16,
    };

    /// Randomly initialised ResNet and LDA state dicts for `TINY`.
    pub(crate) fn tiny_state_dicts() -> (HashMap<String, Tensor>, HashMap<String, Tensor>) {
        let model = VarMap::new();
        let lda = VarMap::new();
        SpeakerEncoder::new(
            &TINY,
            VarBuilder::from_varmap(&model, DType::F32, &Device::Cpu),
            VarBuilder::from_varmap(&lda, DType::F32, &Device::Cpu),
        )
        .unwrap();
        let collect = |map: &VarMap| -> HashMap<String, Tensor> {
            map.data().lock().unwrap().iter().map(|(k, v)| (k.clone(), v.as_tensor().clone())).collect()
        };
        (collect(&model), collect(&lda))
    }

    fn tone(len: usize) -> Vec<f32> {
        #[allow(clippy::cast_precision_loss)]
        (0..len).map(|i| (i as f32 * 0.05).sin() * 0.5).collect()
    }

    #[test]
    fn test_filterbank_covers_every_band() {
        let bank = mel_filterbank(SPEAKER_SAMPLE_RATE, N_FFT, 80);
        assert_eq!(bank.len(), 257 * 80);
        assert!(bank.iter().all(|w| (0.0..=1.0).contains(w)));
        for m in 0..80 {
            let column: f32 = (0..257).map(|k| bank[k * 80 + m]).sum();
            assert!(column > 0.0, "mel band {m} is empty");
        }
    }

    #[test]
    fn test_window_is_centered() {
        let window = padded_hann_window(WIN_LENGTH, N_FFT);
        assert_eq!(window.len(), N_FFT);
        assert!(window[..56].iter().all(|w| *w == 0.0));
        assert!(window[56 + WIN_LENGTH..].iter().all(|w| *w == 0.0));
        assert!((window[56 + WIN_LENGTH / 2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_reflect_pad() {
        assert_eq!(reflect_pad(&[1.0, 2.0, 3.0, 4.0], 2), vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0]);
        assert_eq!(reflect_pad(&[5.0], 2).len(), 7);
    }

    #[test]
    fn test_simam_on_flat_input() {
        let x = Tensor::full(2f32, (1, 3, 4, 5), &Device::Cpu).unwrap();
        let y = simam(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let expected = 2.0 / (1.0 + (-0.5f32).exp());
        assert!(y.iter().all(|v| (v - expected).abs() < 1e-5));
    }

    #[test]
    fn test_shape_is_inferred_from_weights() {
        let (model, lda) = tiny_state_dicts();
        assert!(model.contains_key("front.layer2.1.conv2.weight"));
        assert!(model.contains_key("front.layer2.0.downsample.1.running_var"));
        assert!(!model.contains_key("front.layer1.0.downsample.0.weight"));
        assert_eq!(model["pooling.attention.0.weight"].dims(), &[8, 64, 1]);
        assert_eq!(model["bottleneck.weight"].dims(), &[12, 128]);
        assert_eq!(SpeakerEncoderShape::infer(&model, &lda).unwrap(), TINY);

        let mut broken = model;
        broken.remove("bottleneck.weight");
        let err = SpeakerEncoderShape::infer(&broken, &lda).unwrap_err();
        assert!(err.to_string().contains("bottleneck.weight"), "{err}");
    }

    #[test]
    fn test_embedding_shape() {
        let (model, lda) = tiny_state_dicts();
        let encoder = SpeakerEncoder::from_tensors(model, lda, &Device::Cpu).unwrap();
        assert_eq!(encoder.embedding_dim(), 16);

        // 8000 samples at hop 160, centered: 51 frames.
        assert_eq!(encoder.features(&tone(8000)).unwrap().dims(), &[16, 51]);
        let embedding = encoder.embed(&tone(8000)).unwrap();
        assert_eq!(embedding.dims(), &[1, 1, 16]);
        let values = embedding.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
        // Shorter than one window.
        assert_eq!(encoder.embed(&[0.1; 10]).unwrap().dims(), &[1, 1, 16]);
    }

    #[test]
    fn test_load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let (model, lda) = tiny_state_dicts();
        let model_path = dir.path().join("resnet.safetensors");
        let lda_path = dir.path().join("lda.safetensors");
        candle_core::safetensors::save(&model, &model_path).unwrap();
        candle_core::safetensors::save(&lda, &lda_path).unwrap();

        let encoder = SpeakerEncoder::load(&model_path, &lda_path, &Device::Cpu).unwrap();
        assert_eq!(*encoder.shape(), TINY);
        assert!(SpeakerEncoder::load(&model_path, &dir.path().join("missing.pt"), &Device::Cpu).is_err());
    }

    #[test]
    fn test_lazy_encoder_retries_after_failure() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let lazy = LazySpeakerEncoder::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ZonosError::Model("offline".to_string()));
            }
            let (model, lda) = tiny_state_dicts();
            SpeakerEncoder::from_tensors(model, lda, &Device::Cpu)
        });

        assert!(lazy.get().is_err());
        assert!(!lazy.is_loaded());
        assert_eq!(lazy.get().unwrap().embedding_dim(), 16);
        lazy.get().unwrap();
        assert!(lazy.is_loaded());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
