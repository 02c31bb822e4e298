// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Prefix conditioning: phoneme tokens, speaker embedding and auxiliary
//! features turned into the hidden-state prefix the backbone continues from.

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, layer_norm, linear, Embedding, Init, LayerNorm, Linear, VarBuilder};
use once_cell::sync::Lazy;

use super::config::{ConditionerConfig, ConditionerKind, PrefixConditionerConfig, Projection, UncondType};
use crate::error::{Result, ZonosError};
use crate::phonemizer::Phonemizer;

pub const PAD_ID: u32 = 0;
pub const UNK_ID: u32 = 1;
pub const BOS_ID: u32 = 2;
pub const EOS_ID: u32 = 3;
const SPECIAL_TOKENS: u32 = 4;

const PAD: char = '_';
const PUNCTUATION: &str = ";:,.!?¡¿—…\"«»“” ";
const LETTERS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const LETTERS_IPA: &str = "ɑɐɒæɓʙβɔɕçɗɖðʤəɘɚɛɜɝɞɟʄɡɠɢʛɦɧħɥʜɨɪʝɭɬɫɮʟɱɯɰŋɳɲɴøɵɸθœɶʘɹɺɾɻʀʁɽʂʃʈʧʉʊʋⱱʌɣɤʍχʎʏʑʐʒʔʡʕʢǀǁǂǃˈˌːˑʼʴʰʱʲʷˠˤ˞↓↑→↗↘'\u{329}'ᵻ";

fn symbols() -> impl Iterator<Item = char> {
    std::iter::once(PAD).chain(PUNCTUATION.chars()).chain(LETTERS.chars()).chain(LETTERS_IPA.chars())
}

// Later duplicates win.
static SYMBOL_IDS: Lazy<HashMap<char, u32>> = Lazy::new(|| {
    symbols().zip(SPECIAL_TOKENS..).collect()
});

/// Rows of the phoneme embedding table.
pub fn phoneme_vocab_size() -> usize {
    SPECIAL_TOKENS as usize + symbols().count()
}

/// Tokenizes a phoneme string symbol by symbol, wrapped in BOS/EOS.
///
/// Symbols outside the table map to [`UNK_ID`].
pub fn tokenize_text(text: &str) -> Vec<u32> {
    std::iter::once(BOS_ID)
        .chain(text.chars().map(|c| SYMBOL_IDS.get(&c).copied().unwrap_or(UNK_ID)))
        .chain(std::iter::once(EOS_ID))
        .collect()
}

/// Language codes with a learned id, indexed by `language_id`.
pub const SUPPORTED_LANGUAGE_CODES: &[&str] = &[
    "af", "am", "an", "ar", "as", "az", "ba", "bg", "bn", "bpy", "bs", "ca", "cmn", "cs", "cy", "da",
    "de", "el", "en-029", "en-gb", "en-gb-scotland", "en-gb-x-gbclan", "en-gb-x-gbcwmd", "en-gb-x-rp",
    "en-us", "eo", "es", "es-419", "et", "eu", "fa", "fa-latn", "fi", "fr-be", "fr-ch", "fr-fr", "ga",
    "gd", "gn", "grc", "gu", "hak", "hi", "hr", "ht", "hu", "hy", "hyw", "ia", "id", "is", "it", "ja",
    "jbo", "ka", "kk", "kl", "kn", "ko", "kok", "ku", "ky", "la", "lfn", "lt", "lv", "mi", "mk", "ml",
    "mr", "ms", "mt", "my", "nb", "nci", "ne", "nl", "om", "or", "pa", "pap", "pl", "pt", "pt-br", "py",
    "quc", "ro", "ru", "ru-lv", "sd", "shn", "si", "sk", "sl", "sq", "sr", "sv", "sw", "ta", "te", "tn",
    "tr", "tt", "ur", "uz", "vi", "vi-vn-x-central", "vi-vn-x-south", "yue",
];

/// Resolves a language tag to a supported code.
///
/// Exact (case-insensitive) matches win; otherwise the primary subtag is
/// tried, so `ja-jp` resolves to `ja`.
///
/// # Errors
///
/// Returns [`ZonosError::UnsupportedLanguage`] if neither form is supported.
pub fn resolve_language(tag: &str) -> Result<&'static str> {
    let tag = tag.trim().to_lowercase();
    let primary = tag.split('-').next().unwrap_or_default();
    SUPPORTED_LANGUAGE_CODES
        .iter()
        .find(|code| **code == tag)
        .or_else(|| SUPPORTED_LANGUAGE_CODES.iter().find(|code| **code == primary))
        .copied()
        .ok_or(ZonosError::UnsupportedLanguage(tag))
}

/// Id of a supported language code.
pub fn language_id(code: &str) -> Option<usize> {
    SUPPORTED_LANGUAGE_CODES.iter().position(|c| *c == code)
}

/// Input to one conditioner.
#[derive(Debug, Clone)]
pub enum CondValue {
    Text(String),
    Floats(Vec<f32>),
    Integer(i64),
    Embedding(Tensor),
}

/// Named conditioner inputs; absent names use the conditioner's unconditional vector.
#[derive(Debug, Clone, Default)]
pub struct ConditioningSpec {
    values: BTreeMap<String, CondValue>,
}

impl ConditioningSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: CondValue) {
        self.values.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&CondValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Copy restricted to `names`.
    #[must_use]
    pub fn restricted_to(&self, names: &[&str]) -> Self {
        Self {
            values: self
                .values
                .iter()
                .filter(|(k, _)| names.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Builds the standard conditioning inputs, phonemizing the text in the
    /// resolved language.
    ///
    /// The emotion vector is normalized to sum to one; keys listed in
    /// `unconditional_keys` are left out.
    ///
    /// # Errors
    ///
    /// Returns [`ZonosError::UnsupportedLanguage`] for an unknown language,
    /// or the phonemizer's error.
    pub fn from_params(params: &ConditioningParams, phonemizer: &dyn Phonemizer) -> Result<Self> {
        let language = resolve_language(&params.language)?;
        let language_id = language_id(language)
            .ok_or_else(|| ZonosError::UnsupportedLanguage(language.to_string()))?;
        let phonemes = phonemizer.phonemize(&params.text, language)?;

        let mut spec = Self::new();
        spec.insert("espeak", CondValue::Text(phonemes));
        if let Some(speaker) = &params.speaker {
            spec.insert("speaker", CondValue::Embedding(speaker.clone()));
        }
        let total: f32 = params.emotion.iter().sum();
        let emotion = if total > 0.0 {
            params.emotion.iter().map(|e| e / total).collect()
        } else {
            params.emotion.to_vec()
        };
        spec.insert("emotion", CondValue::Floats(emotion));
        spec.insert("fmax", CondValue::Floats(vec![params.fmax]));
        spec.insert("pitch_std", CondValue::Floats(vec![params.pitch_std]));
        spec.insert("speaking_rate", CondValue::Floats(vec![params.speaking_rate]));
        #[allow(clippy::cast_possible_wrap)]
        spec.insert("language_id", CondValue::Integer(language_id as i64));
        spec.insert("vqscore_8", CondValue::Floats(params.vqscore_8.to_vec()));
        spec.insert("ctc_loss", CondValue::Floats(vec![params.ctc_loss]));
        spec.insert("dnsmos_ovrl", CondValue::Floats(vec![params.dnsmos_ovrl]));
        spec.insert("speaker_noised", CondValue::Integer(i64::from(params.speaker_noised)));

        for key in &params.unconditional_keys {
            spec.values.remove(key);
        }
        Ok(spec)
    }
}

/// Text, language, optional speaker embedding and auxiliary features.
#[derive(Debug, Clone)]
pub struct ConditioningParams {
    pub text: String,
    pub language: String,
    /// `[1, 1, speaker_dim]`
    pub speaker: Option<Tensor>,
    pub emotion: [f32; 8],
    pub fmax: f32,
    pub pitch_std: f32,
    pub speaking_rate: f32,
    pub vqscore_8: [f32; 8],
    pub ctc_loss: f32,
    pub dnsmos_ovrl: f32,
    pub speaker_noised: bool,
    pub unconditional_keys: Vec<String>,
}

impl ConditioningParams {
    pub fn new(text: &str, language: &str, speaker: Option<Tensor>) -> Self {
        Self { text: text.to_string(), language: language.to_string(), speaker, ..Self::default() }
    }
}

impl Default for ConditioningParams {
    fn default() -> Self {
        Self {
            text: String::new(),
            language: "en-us".to_string(),
            speaker: None,
            emotion: [0.3077, 0.0256, 0.0256, 0.0256, 0.0256, 0.0256, 0.2564, 0.3077],
            fmax: 22_050.0,
            pitch_std: 20.0,
            speaking_rate: 15.0,
            vqscore_8: [0.78; 8],
            ctc_loss: 0.0,
            dnsmos_ovrl: 4.0,
            speaker_noised: false,
            unconditional_keys: vec!["vqscore_8".to_string(), "dnsmos_ovrl".to_string()],
        }
    }
}

enum Projector {
    Linear(Linear),
    Mlp(Linear, Linear),
}

impl Projector {
    fn new(kind: Projection, in_dim: usize, out_dim: usize, vb: VarBuilder) -> candle_core::Result<Option<Self>> {
        Ok(match kind {
            Projection::None => None,
            Projection::Linear => Some(Self::Linear(linear(in_dim, out_dim, vb.pp("project"))?)),
            Projection::Mlp => Some(Self::Mlp(
                linear(in_dim, out_dim, vb.pp("project").pp(0))?,
                linear(out_dim, out_dim, vb.pp("project").pp(2))?,
            )),
        })
    }
}

impl Module for Projector {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Linear(l) => l.forward(x),
            Self::Mlp(a, b) => b.forward(&candle_nn::ops::silu(&a.forward(x)?)?),
        }
    }
}

enum Encoder {
    Text { embedder: Embedding },
    Fourier { weight: Tensor, input_dim: usize, min_val: f64, max_val: f64 },
    Integer { embedder: Embedding, min_val: i64, max_val: i64 },
    Passthrough { cond_dim: usize },
}

struct Conditioner {
    name: String,
    encoder: Encoder,
    cond_dim: usize,
    project: Option<Projector>,
    uncond_vector: Option<Tensor>,
}

impl Conditioner {
    fn new(cfg: &ConditionerConfig, d_model: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let cond_dim = cfg.cond_dim_or(d_model);
        let encoder = match &cfg.kind {
            ConditionerKind::EspeakPhonemeConditioner => Encoder::Text {
                embedder: embedding(phoneme_vocab_size(), cond_dim, vb.pp("phoneme_embedder"))?,
            },
            ConditionerKind::FourierConditioner { input_dim, std, min_val, max_val } => Encoder::Fourier {
                weight: vb.get_with_hints(
                    (cond_dim / 2, *input_dim),
                    "weight",
                    Init::Randn { mean: 0.0, stdev: *std },
                )?,
                input_dim: *input_dim,
                min_val: *min_val,
                max_val: *max_val,
            },
            ConditionerKind::IntegerConditioner { min_val, max_val } => {
                let rows = usize::try_from(max_val - min_val + 1).map_err(candle_core::Error::wrap)?;
                Encoder::Integer {
                    embedder: embedding(rows, cond_dim, vb.pp("int_embedder"))?,
                    min_val: *min_val,
                    max_val: *max_val,
                }
            },
            ConditionerKind::PassthroughConditioner => Encoder::Passthrough { cond_dim },
        };
        let uncond_vector = match cfg.uncond_type {
            UncondType::Learned => Some(vb.get_with_hints(d_model, "uncond_vector", Init::Const(0.0))?),
            UncondType::None => None,
        };
        Ok(Self {
            name: cfg.name.clone(),
            encoder,
            cond_dim,
            project: Projector::new(cfg.projection, cond_dim, d_model, vb)?,
            uncond_vector,
        })
    }

    /// `[1, T, d_model]`
    fn forward(&self, value: Option<&CondValue>, device: &Device) -> Result<Tensor> {
        let Some(value) = value else {
            let uncond =
                self.uncond_vector.as_ref().ok_or_else(|| ZonosError::MissingConditioning(self.name.clone()))?;
            return Ok(uncond.reshape((1, 1, ()))?);
        };
        let cond = self.encode(value, device)?;
        Ok(match &self.project {
            Some(p) => p.forward(&cond)?,
            None => cond,
        })
    }

    fn encode(&self, value: &CondValue, device: &Device) -> Result<Tensor> {
        match (&self.encoder, value) {
            (Encoder::Text { embedder }, CondValue::Text(text)) => {
                let ids = tokenize_text(text);
                let ids = Tensor::new(ids.as_slice(), device)?.unsqueeze(0)?;
                Ok(embedder.forward(&ids)?)
            },
            (Encoder::Fourier { weight, input_dim, min_val, max_val }, CondValue::Floats(x)) => {
                if x.len() != *input_dim {
                    return Err(ZonosError::Model(format!(
                        "conditioner '{}' expects {input_dim} values, got {}",
                        self.name,
                        x.len()
                    )));
                }
                #[allow(clippy::cast_possible_truncation)]
                let normalized: Vec<f32> =
                    x.iter().map(|v| ((f64::from(*v) - min_val) / (max_val - min_val)) as f32).collect();
                let x = Tensor::from_vec(normalized, (1, *input_dim), device)?;
                let f = (x.matmul(&weight.t()?)? * (2.0 * std::f64::consts::PI))?;
                let features = Tensor::cat(&[f.cos()?, f.sin()?], D::Minus1)?;
                Ok(features.unsqueeze(0)?)
            },
            (Encoder::Integer { embedder, min_val, max_val }, CondValue::Integer(v)) => {
                if v < min_val || v > max_val {
                    return Err(ZonosError::Model(format!(
                        "conditioner '{}' value {v} is outside [{min_val}, {max_val}]",
                        self.name
                    )));
                }
                let index = u32::try_from(v - min_val).map_err(|e| ZonosError::Model(e.to_string()))?;
                let ids = Tensor::new(&[[index]], device)?;
                Ok(embedder.forward(&ids)?)
            },
            (Encoder::Passthrough { cond_dim }, CondValue::Embedding(t)) => {
                let t = t.to_device(device)?.to_dtype(DType::F32)?;
                if t.dim(D::Minus1)? != *cond_dim {
                    return Err(ZonosError::Model(format!(
                        "conditioner '{}' expects width {cond_dim}, got shape {:?}",
                        self.name,
                        t.dims()
                    )));
                }
                Ok(t.reshape((1, (), *cond_dim))?)
            },
            _ => Err(ZonosError::Model(format!(
                "conditioner '{}' received an input of the wrong kind",
                self.name
            ))),
        }
    }
}

/// Concatenates every conditioner's output along the sequence axis, then
/// projects and normalizes.
pub struct PrefixConditioner {
    conditioners: Vec<Conditioner>,
    project: Option<Projector>,
    norm: LayerNorm,
    required_keys: Vec<String>,
}

impl PrefixConditioner {
    /// Builds the conditioner from `vb` (expected prefix: `prefix_conditioner`).
    ///
    /// # Errors
    ///
    /// Fails if a weight is missing or has the wrong shape.
    pub fn new(cfg: &PrefixConditionerConfig, d_model: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let conditioners = cfg
            .conditioners
            .iter()
            .enumerate()
            .map(|(i, c)| Conditioner::new(c, d_model, vb.pp("conditioners").pp(i)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let required_keys =
            conditioners.iter().filter(|c| c.uncond_vector.is_none()).map(|c| c.name.clone()).collect();
        Ok(Self {
            conditioners,
            project: Projector::new(cfg.projection, d_model, d_model, vb.clone())?,
            norm: layer_norm(d_model, 1e-5, vb.pp("norm"))?,
            required_keys,
        })
    }

    /// Conditioners that must receive an input.
    pub fn required_keys(&self) -> Vec<&str> {
        self.required_keys.iter().map(String::as_str).collect()
    }

    /// Width expected by the passthrough conditioner named `name`.
    pub fn passthrough_dim(&self, name: &str) -> Option<usize> {
        self.conditioners.iter().find(|c| c.name == name).and_then(|c| match c.encoder {
            Encoder::Passthrough { .. } => Some(c.cond_dim),
            _ => None,
        })
    }

    /// `[1, S, d_model]` prefix for one conditioning spec.
    ///
    /// # Errors
    ///
    /// Returns [`ZonosError::MissingConditioning`] if a required input is absent.
    pub fn forward(&self, spec: &ConditioningSpec, device: &Device) -> Result<Tensor> {
        if let Some(missing) = self.required_keys.iter().find(|k| !spec.contains(k)) {
            return Err(ZonosError::MissingConditioning(missing.clone()));
        }
        let conds = self
            .conditioners
            .iter()
            .map(|c| c.forward(spec.get(&c.name), device))
            .collect::<Result<Vec<_>>>()?;
        let x = Tensor::cat(&conds, 1)?;
        let x = match &self.project {
            Some(p) => p.forward(&x)?,
            None => x,
        };
        Ok(self.norm.forward(&x)?)
    }
}
