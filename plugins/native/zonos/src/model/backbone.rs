// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Backbone stack: grouped-query attention with interleaved rotary
//! embeddings, interleaved with Mamba2 state-space layers in hybrid models.
//!
//! Every layer keeps its own decoding state in [`InferenceCache`]: attention
//! layers a KV cache, state-space layers a rolling convolution window and the
//! SSM state. Prefill and decode share the same recurrence, so feeding a
//! sequence in pieces matches a single pass.

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{layer_norm, linear_b, linear_no_bias, rms_norm, Init, LayerNorm, Linear, RmsNorm, VarBuilder};

use super::config::{BackboneConfig, Mamba2Config};

const ROPE_BASE: f32 = 10_000.0;
const GATED_NORM_EPS: f64 = 1e-5;
const SOFTPLUS_THRESHOLD: f64 = 20.0;

#[derive(Default)]
struct LayerState {
    kv: Option<(Tensor, Tensor)>,
    /// Last `d_conv` inputs of the depthwise convolution, `[batch, conv_dim, d_conv]`.
    conv: Option<Tensor>,
    /// `[batch, nheads, headdim, d_state]`
    ssm: Option<Tensor>,
}

/// Decoding state shared by every layer of one generation.
pub struct InferenceCache {
    layers: Vec<LayerState>,
    seqlen_offset: usize,
}

impl InferenceCache {
    pub fn new(n_layer: usize) -> Self {
        Self { layers: (0..n_layer).map(|_| LayerState::default()).collect(), seqlen_offset: 0 }
    }

    /// Number of positions already processed.
    pub const fn seqlen_offset(&self) -> usize {
        self.seqlen_offset
    }
}

struct RotaryEmbedding {
    inv_freq: Tensor,
}

impl RotaryEmbedding {
    #[allow(clippy::cast_precision_loss)]
    fn new(dim: usize, device: &Device) -> candle_core::Result<Self> {
        let inv_freq: Vec<f32> =
            (0..dim).step_by(2).map(|i| 1.0 / ROPE_BASE.powf(i as f32 / dim as f32)).collect();
        let len = inv_freq.len();
        Ok(Self { inv_freq: Tensor::from_vec(inv_freq, (1, len), device)? })
    }

    /// `(cos, sin)` of shape `[len, dim / 2]` for positions `offset..offset + len`.
    fn cos_sin(&self, offset: usize, len: usize) -> candle_core::Result<(Tensor, Tensor)> {
        let start = u32::try_from(offset).map_err(candle_core::Error::wrap)?;
        let end = u32::try_from(offset + len).map_err(candle_core::Error::wrap)?;
        let positions = Tensor::arange(start, end, self.inv_freq.device())?
            .to_dtype(DType::F32)?
            .reshape((len, 1))?;
        let freqs = positions.matmul(&self.inv_freq)?;
        Ok((freqs.cos()?, freqs.sin()?))
    }
}

struct Attention {
    in_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    num_heads_kv: usize,
    head_dim: usize,
    rotary_dim: usize,
}

impl Attention {
    fn new(cfg: &BackboneConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let attn = &cfg.attn_cfg;
        let head_dim = cfg.head_dim();
        let total = (attn.num_heads + 2 * attn.num_heads_kv) * head_dim;
        Ok(Self {
            in_proj: linear_b(cfg.d_model, total, attn.qkv_proj_bias, vb.pp("in_proj"))?,
            out_proj: linear_b(attn.num_heads * head_dim, cfg.d_model, attn.out_proj_bias, vb.pp("out_proj"))?,
            num_heads: attn.num_heads,
            num_heads_kv: attn.num_heads_kv,
            head_dim,
            rotary_dim: cfg.rotary_dim(),
        })
    }

    fn rotate(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> candle_core::Result<Tensor> {
        if self.rotary_dim == self.head_dim {
            return candle_nn::rotary_emb::rope_i(&x.contiguous()?, cos, sin);
        }
        let rot = x.narrow(D::Minus1, 0, self.rotary_dim)?.contiguous()?;
        let pass = x.narrow(D::Minus1, self.rotary_dim, self.head_dim - self.rotary_dim)?;
        let rot = candle_nn::rotary_emb::rope_i(&rot, cos, sin)?;
        Tensor::cat(&[&rot, &pass], D::Minus1)
    }

    fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        cache: &mut Option<(Tensor, Tensor)>,
    ) -> candle_core::Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        let q_size = self.num_heads * self.head_dim;
        let kv_size = self.num_heads_kv * self.head_dim;

        let qkv = self.in_proj.forward(x)?;
        let q = qkv
            .narrow(D::Minus1, 0, q_size)?
            .reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = qkv
            .narrow(D::Minus1, q_size, kv_size)?
            .reshape((b, t, self.num_heads_kv, self.head_dim))?
            .transpose(1, 2)?;
        let v = qkv
            .narrow(D::Minus1, q_size + kv_size, kv_size)?
            .reshape((b, t, self.num_heads_kv, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = self.rotate(&q, cos, sin)?;
        let k = self.rotate(&k, cos, sin)?;

        let (k, v) = match cache.take() {
            Some((past_k, past_v)) => (Tensor::cat(&[&past_k, &k], 2)?, Tensor::cat(&[&past_v, &v], 2)?),
            None => (k, v),
        };
        *cache = Some((k.clone(), v.clone()));
        let kv_len = k.dim(2)?;

        let n_rep = self.num_heads / self.num_heads_kv;
        let k = candle_transformers::utils::repeat_kv(k, n_rep)?.contiguous()?;
        let v = candle_transformers::utils::repeat_kv(v, n_rep)?.contiguous()?;

        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.contiguous()?.matmul(&k.t()?)? * scale)?;
        let scores = if t > 1 {
            scores.broadcast_add(&causal_mask(t, kv_len, x.device())?)?
        } else {
            scores
        };
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let y = probs.matmul(&v)?.transpose(1, 2)?.reshape((b, t, q_size))?;
        self.out_proj.forward(&y)
    }
}

/// Additive mask letting query `i` see keys up to its own absolute position.
fn causal_mask(t: usize, kv_len: usize, device: &Device) -> candle_core::Result<Tensor> {
    let past = kv_len - t;
    let mask: Vec<f32> = (0..t)
        .flat_map(|i| (0..kv_len).map(move |j| if j > past + i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (t, kv_len), device)
}

struct FeedForward {
    fc1: Linear,
    fc2: Linear,
}

impl FeedForward {
    fn new(d_model: usize, width: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            fc1: linear_no_bias(d_model, 2 * width, vb.pp("fc1"))?,
            fc2: linear_no_bias(width, d_model, vb.pp("fc2"))?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.fc1.forward(x)?;
        let half = h.dim(D::Minus1)? / 2;
        let y = h.narrow(D::Minus1, 0, half)?;
        let gate = h.narrow(D::Minus1, half, half)?;
        self.fc2.forward(&(y * candle_nn::ops::silu(&gate)?)?)
    }
}

fn softplus(x: &Tensor) -> candle_core::Result<Tensor> {
    let soft = (x.exp()? + 1.0)?.log()?;
    x.gt(SOFTPLUS_THRESHOLD)?.where_cond(x, &soft)
}

/// Mamba2 selective state-space mixer, evaluated step by step.
struct Mamba2 {
    in_proj: Linear,
    /// Depthwise kernel, `[conv_dim, d_conv]`.
    conv_weight: Tensor,
    conv_bias: Option<Tensor>,
    dt_bias: Tensor,
    /// `-exp(A_log)`
    a: Tensor,
    d: Tensor,
    norm_weight: Option<Tensor>,
    out_proj: Linear,
    d_inner: usize,
    d_state: usize,
    d_conv: usize,
    nheads: usize,
    headdim: usize,
    ngroups: usize,
    norm_before_gate: bool,
}

impl Mamba2 {
    fn new(d_model: usize, ssm: &Mamba2Config, vb: VarBuilder) -> candle_core::Result<Self> {
        let d_inner = ssm.d_inner(d_model);
        let nheads = ssm.nheads(d_model);
        let conv_dim = ssm.conv_dim(d_model);
        let d_in_proj = d_inner + conv_dim + nheads;

        let conv = vb.pp("conv1d");
        let conv_weight = conv
            .get_with_hints((conv_dim, 1, ssm.d_conv), "weight", Init::Uniform { lo: -0.5, up: 0.5 })?
            .squeeze(1)?;
        let conv_bias = if ssm.conv_bias { Some(conv.get_with_hints(conv_dim, "bias", Init::Const(0.0))?) } else { None };
        let a_log = vb.get_with_hints(nheads, "A_log", Init::Const(0.0))?;
        let norm_weight =
            if ssm.rmsnorm { Some(vb.pp("norm").get_with_hints(d_inner, "weight", Init::Const(1.0))?) } else { None };

        Ok(Self {
            in_proj: linear_b(d_model, d_in_proj, ssm.bias, vb.pp("in_proj"))?,
            conv_weight,
            conv_bias,
            dt_bias: vb.get_with_hints(nheads, "dt_bias", Init::Const(0.0))?,
            a: a_log.exp()?.neg()?,
            d: vb.get_with_hints(nheads, "D", Init::Const(1.0))?,
            norm_weight,
            out_proj: linear_b(d_inner, d_model, ssm.bias, vb.pp("out_proj"))?,
            d_inner,
            d_state: ssm.d_state,
            d_conv: ssm.d_conv,
            nheads,
            headdim: ssm.headdim,
            ngroups: ssm.ngroups,
            norm_before_gate: ssm.norm_before_gate,
        })
    }

    const fn conv_dim(&self) -> usize {
        self.d_inner + 2 * self.ngroups * self.d_state
    }

    fn forward(&self, x: &Tensor, state: &mut LayerState) -> candle_core::Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        let zxbcdt = self.in_proj.forward(x)?;
        let mut conv_state = match state.conv.take() {
            Some(s) => s,
            None => Tensor::zeros((b, self.conv_dim(), self.d_conv), x.dtype(), x.device())?,
        };
        let mut ssm_state = match state.ssm.take() {
            Some(s) => s,
            None => Tensor::zeros((b, self.nheads, self.headdim, self.d_state), x.dtype(), x.device())?,
        };

        let mut outputs = Vec::with_capacity(t);
        for i in 0..t {
            let step = zxbcdt.narrow(1, i, 1)?.squeeze(1)?;
            outputs.push(self.step(&step, &mut conv_state, &mut ssm_state)?);
        }
        state.conv = Some(conv_state);
        state.ssm = Some(ssm_state);
        self.out_proj.forward(&Tensor::stack(&outputs, 1)?)
    }

    /// One position: `zxbcdt` is `[batch, d_in_proj]`, returns `[batch, d_inner]`.
    fn step(&self, zxbcdt: &Tensor, conv_state: &mut Tensor, ssm_state: &mut Tensor) -> candle_core::Result<Tensor> {
        let b = zxbcdt.dim(0)?;
        let conv_dim = self.conv_dim();
        let group_width = self.ngroups * self.d_state;
        let z = zxbcdt.narrow(1, 0, self.d_inner)?;
        let xbc = zxbcdt.narrow(1, self.d_inner, conv_dim)?;
        let dt = zxbcdt.narrow(1, self.d_inner + conv_dim, self.nheads)?;

        let window = Tensor::cat(&[&conv_state.narrow(2, 1, self.d_conv - 1)?, &xbc.unsqueeze(2)?], 2)?;
        let mut xbc = window.broadcast_mul(&self.conv_weight.unsqueeze(0)?)?.sum(2)?;
        if let Some(bias) = &self.conv_bias {
            xbc = xbc.broadcast_add(bias)?;
        }
        *conv_state = window;
        let xbc = candle_nn::ops::silu(&xbc)?;

        let x = xbc.narrow(1, 0, self.d_inner)?.reshape((b, self.nheads, self.headdim))?;
        let heads_per_group = self.nheads / self.ngroups;
        let per_head = |t: Tensor| -> candle_core::Result<Tensor> {
            t.reshape((b, self.ngroups, 1, self.d_state))?
                .broadcast_as((b, self.ngroups, heads_per_group, self.d_state))?
                .contiguous()?
                .reshape((b, self.nheads, self.d_state))
        };
        let b_t = per_head(xbc.narrow(1, self.d_inner, group_width)?)?;
        let c_t = per_head(xbc.narrow(1, self.d_inner + group_width, group_width)?)?;

        let dt = softplus(&dt.broadcast_add(&self.dt_bias)?)?;
        let decay = dt.broadcast_mul(&self.a)?.exp()?.reshape((b, self.nheads, 1, 1))?;
        let dx = x.broadcast_mul(&dt.unsqueeze(2)?)?;
        let update = dx.unsqueeze(3)?.broadcast_mul(&b_t.unsqueeze(2)?)?;
        *ssm_state = (ssm_state.broadcast_mul(&decay)? + update)?;

        let y = ssm_state.matmul(&c_t.unsqueeze(3)?)?.squeeze(3)?;
        let y = (y + x.broadcast_mul(&self.d.reshape((1, self.nheads, 1))?)?)?;
        let y = y.reshape((b, self.d_inner))?;
        self.gate(&y, &z)
    }

    fn gate(&self, y: &Tensor, z: &Tensor) -> candle_core::Result<Tensor> {
        let gate = candle_nn::ops::silu(z)?;
        let Some(weight) = &self.norm_weight else {
            return y * gate;
        };
        if self.norm_before_gate {
            self.group_rms(y)?.broadcast_mul(weight)? * gate
        } else {
            self.group_rms(&(y * gate)?)?.broadcast_mul(weight)
        }
    }

    fn group_rms(&self, y: &Tensor) -> candle_core::Result<Tensor> {
        let (b, width) = y.dims2()?;
        let grouped = y.reshape((b, self.ngroups, width / self.ngroups))?;
        let ms = grouped.sqr()?.mean_keepdim(D::Minus1)?;
        grouped.broadcast_div(&(ms + GATED_NORM_EPS)?.sqrt()?)?.reshape((b, width))
    }
}

enum Norm {
    Layer(LayerNorm),
    Rms(RmsNorm),
}

impl Norm {
    fn new(cfg: &BackboneConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        if cfg.rms_norm {
            Ok(Self::Rms(rms_norm(cfg.d_model, cfg.norm_epsilon, vb)?))
        } else {
            Ok(Self::Layer(layer_norm(cfg.d_model, cfg.norm_epsilon, vb)?))
        }
    }
}

impl Module for Norm {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Layer(norm) => norm.forward(x),
            Self::Rms(norm) => norm.forward(x),
        }
    }
}

enum Mixer {
    Attention(Attention),
    Mamba(Mamba2),
}

/// Pre-norm residual block; the MLP is absent when its width is 0.
struct Block {
    norm: Norm,
    mixer: Mixer,
    mlp: Option<(Norm, FeedForward)>,
}

impl Block {
    fn new(cfg: &BackboneConfig, ssm: Option<&Mamba2Config>, i: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let mixer = match ssm {
            Some(ssm) if !cfg.is_attention_layer(i) => Mixer::Mamba(Mamba2::new(cfg.d_model, ssm, vb.pp("mixer"))?),
            _ => Mixer::Attention(Attention::new(cfg, vb.pp("mixer"))?),
        };
        let width = cfg.mlp_width(i);
        let mlp = if width == 0 {
            None
        } else {
            Some((Norm::new(cfg, vb.pp("norm2"))?, FeedForward::new(cfg.d_model, width, vb.pp("mlp"))?))
        };
        Ok(Self { norm: Norm::new(cfg, vb.pp("norm"))?, mixer, mlp })
    }

    fn forward(&self, x: &Tensor, cos: &Tensor, sin: &Tensor, state: &mut LayerState) -> candle_core::Result<Tensor> {
        let h = self.norm.forward(x)?;
        let h = match &self.mixer {
            Mixer::Attention(attn) => attn.forward(&h, cos, sin, &mut state.kv)?,
            Mixer::Mamba(mamba) => mamba.forward(&h, state)?,
        };
        let x = (x + h)?;
        match &self.mlp {
            Some((norm2, mlp)) => &x + mlp.forward(&norm2.forward(&x)?)?,
            None => Ok(x),
        }
    }
}

pub struct Backbone {
    layers: Vec<Block>,
    norm_f: Norm,
    rotary: RotaryEmbedding,
}

impl Backbone {
    /// Builds the backbone from `vb` (expected prefix: `backbone`).
    ///
    /// `ssm` must be the decoded `ssm_cfg` of a hybrid config, `None` otherwise.
    ///
    /// # Errors
    ///
    /// Fails if a weight is missing or has the wrong shape.
    pub fn new(cfg: &BackboneConfig, ssm: Option<&Mamba2Config>, vb: VarBuilder) -> candle_core::Result<Self> {
        let layers = (0..cfg.n_layer)
            .map(|i| Block::new(cfg, ssm, i, vb.pp("layers").pp(i)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            norm_f: Norm::new(cfg, vb.pp("norm_f"))?,
            rotary: RotaryEmbedding::new(cfg.rotary_dim(), vb.device())?,
        })
    }

    pub fn n_layer(&self) -> usize {
        self.layers.len()
    }

    /// Runs `hidden` (`[batch, seq, d_model]`) after the positions already in `cache`.
    ///
    /// # Errors
    ///
    /// Fails on shape mismatches, including a cache built for another batch size.
    pub fn forward(&self, hidden: &Tensor, cache: &mut InferenceCache) -> candle_core::Result<Tensor> {
        let t = hidden.dim(1)?;
        let (cos, sin) = self.rotary.cos_sin(cache.seqlen_offset, t)?;
        let mut x = hidden.clone();
        for (layer, state) in self.layers.iter().zip(cache.layers.iter_mut()) {
            x = layer.forward(&x, &cos, &sin, state)?;
        }
        cache.seqlen_offset += t;
        self.norm_f.forward(&x)
    }
}
