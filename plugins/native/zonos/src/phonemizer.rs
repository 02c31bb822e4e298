// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Text to IPA phonemes for the text conditioner.
//!
//! The default backend runs the `espeak-ng` (or legacy `espeak`) program once
//! per run of words. Punctuation is kept out of espeak and re-inserted
//! verbatim, since the phoneme table has its own punctuation symbols.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{Result, ZonosError};

/// Programs tried, in order, when none is configured.
pub const ESPEAK_PROGRAMS: [&str; 2] = ["espeak-ng", "espeak"];

const MARKS: &str = ";:,.!?¡¿—…\"«»“”";

/// Converts text to the phoneme string the text conditioner tokenizes.
pub trait Phonemizer: Send + Sync {
    /// IPA transcription of `text`; `language` is a resolved espeak voice code.
    ///
    /// # Errors
    ///
    /// Fails if the backend is unavailable or rejects the input.
    fn phonemize(&self, text: &str, language: &str) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Words(&'a str),
    Marks(&'a str),
}

fn is_mark(c: char) -> bool {
    MARKS.contains(c)
}

/// Splits text into alternating runs of words and punctuation. Whitespace
/// next to punctuation belongs to the punctuation run.
fn segments(text: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_marks = false;
    for (i, c) in text.char_indices() {
        let mark = is_mark(c) || (c.is_whitespace() && in_marks);
        if mark != in_marks && i > start {
            let run = &text[start..i];
            out.push(if in_marks { Segment::Marks(run) } else { Segment::Words(run) });
            start = i;
        }
        in_marks = mark;
    }
    if start < text.len() {
        let run = &text[start..];
        out.push(if in_marks { Segment::Marks(run) } else { Segment::Words(run) });
    }
    out
}

/// Drops espeak's language-switch flags such as `(en)` or `(fr-fr)`.
fn strip_language_flags(phonemes: &str) -> String {
    let mut out = String::with_capacity(phonemes.len());
    let mut rest = phonemes;
    while let Some(open) = rest.find('(') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        match tail.find(')') {
            Some(close) if tail[1..close].chars().all(|c| c.is_ascii_lowercase() || c == '-') => {
                rest = &tail[close + 1..];
            },
            _ => {
                out.push('(');
                rest = &tail[1..];
            },
        }
    }
    out.push_str(rest);
    out
}

/// Phonemizes every word run with `backend`, keeps punctuation, and
/// collapses whitespace.
fn phonemize_segments(text: &str, mut backend: impl FnMut(&str) -> Result<String>) -> Result<String> {
    let mut out = String::new();
    for segment in segments(text) {
        match segment {
            Segment::Words(words) if words.trim().is_empty() => out.push(' '),
            Segment::Words(words) => {
                out.push_str(strip_language_flags(&backend(words.trim())?).trim());
            },
            Segment::Marks(marks) => out.push_str(marks),
        }
    }
    Ok(out.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Phonemizer backed by the espeak-ng command-line program.
#[derive(Debug, Clone, Default)]
pub struct EspeakPhonemizer {
    program: Option<String>,
}

impl EspeakPhonemizer {
    /// `program` overrides the search for [`ESPEAK_PROGRAMS`] on `PATH`.
    pub const fn new(program: Option<String>) -> Self {
        Self { program }
    }

    /// Resolves the program to run. Looked up on every call so installing
    /// espeak does not require a restart.
    ///
    /// # Errors
    ///
    /// Returns [`ZonosError::Phonemizer`] if no program is found.
    pub fn program(&self) -> Result<PathBuf> {
        match &self.program {
            Some(program) => which::which(program)
                .map_err(|e| ZonosError::Phonemizer(format!("phonemizer '{program}' not found: {e}"))),
            None => ESPEAK_PROGRAMS.iter().find_map(|p| which::which(p).ok()).ok_or_else(|| {
                ZonosError::Phonemizer(format!(
                    "no espeak phonemizer found on PATH (tried: {})",
                    ESPEAK_PROGRAMS.join(", ")
                ))
            }),
        }
    }

    fn run(program: &Path, words: &str, language: &str) -> Result<String> {
        let output = Command::new(program)
            .args(["-q", "--ipa", "-v", language])
            .arg(words)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| ZonosError::Phonemizer(format!("failed to run '{}': {e}", program.display())))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ZonosError::Phonemizer(format!(
                "'{}' failed for voice '{language}': {}",
                program.display(),
                stderr.trim()
            )));
        }
        String::from_utf8(output.stdout)
            .map_err(|_| ZonosError::Phonemizer("phonemizer emitted non-UTF-8 output".to_string()))
    }
}

impl Phonemizer for EspeakPhonemizer {
    fn phonemize(&self, text: &str, language: &str) -> Result<String> {
        let program = self.program()?;
        let phonemes = phonemize_segments(text, |words| Self::run(&program, words, language))?;
        tracing::debug!(program = %program.display(), language, phonemes = %phonemes, "Phonemized text");
        Ok(phonemes)
    }
}

/// Returns text unchanged, for exercising the model without espeak.
#[cfg(test)]
pub(crate) struct Verbatim;

#[cfg(test)]
impl Phonemizer for Verbatim {
    fn phonemize(&self, text: &str, _language: &str) -> Result<String> {
        Ok(text.to_string())
    }
}
