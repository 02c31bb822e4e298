// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Reference audio decoding, resampling and WAV output.

use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use rubato::{FastFixedIn, Resampler};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use uuid::Uuid;

use crate::error::{Result, ZonosError};

const RESAMPLE_CHUNK: usize = 1024;

/// Decodes an audio file to mono f32 samples, returning them with the
/// file's sample rate. Channels are averaged.
///
/// # Errors
///
/// Returns [`ZonosError::Audio`] if the format is not recognized or decoding fails.
pub fn load_audio(path: &Path) -> Result<(Vec<f32>, u32)> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), MediaSourceStreamOptions::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let mut format_reader = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| ZonosError::Audio(format!("Unrecognized audio format in {}: {e}", path.display())))?
        .format;

    let track = format_reader
        .default_track()
        .ok_or_else(|| ZonosError::Audio(format!("No default track in {}", path.display())))?;
    let codec_params = &track.codec_params;
    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| ZonosError::Audio(format!("No sample rate in {}", path.display())))?;
    let track_id = track.id;

    let mut decoder = symphonia::default::get_codecs()
        .make(codec_params, &DecoderOptions::default())
        .map_err(|e| ZonosError::Audio(format!("Failed to create decoder: {e}")))?;

    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut mono = Vec::new();
    loop {
        let packet = match format_reader.next_packet() {
            Ok(packet) => packet,
            Err(Error::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(ZonosError::Audio(format!("Error reading packet: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(audio_buf) => {
                let spec = *audio_buf.spec();
                let channels = spec.channels.count().max(1);
                let buf = sample_buf
                    .get_or_insert_with(|| SampleBuffer::<f32>::new(audio_buf.capacity() as u64, spec));
                buf.copy_interleaved_ref(audio_buf);
                #[allow(clippy::cast_precision_loss)]
                mono.extend(
                    buf.samples().chunks_exact(channels).map(|frame| frame.iter().sum::<f32>() / channels as f32),
                );
            },
            Err(Error::DecodeError(err)) => {
                tracing::warn!(path = %path.display(), error = %err, "Decode error (continuing)");
            },
            Err(e) => return Err(ZonosError::Audio(format!("Failed to decode packet: {e}"))),
        }
    }

    tracing::debug!(path = %path.display(), sample_rate, samples = mono.len(), "Decoded reference audio");
    Ok((mono, sample_rate))
}

/// Resamples mono audio. The output length is the input length scaled by
/// the rate ratio, rounded.
///
/// # Errors
///
/// Returns [`ZonosError::Audio`] if either rate is zero or rubato fails.
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    if from == 0 || to == 0 {
        return Err(ZonosError::Audio(format!("Invalid resampling {from} Hz -> {to} Hz")));
    }
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let ratio = f64::from(to) / f64::from(from);
    let mut resampler =
        FastFixedIn::<f32>::new(ratio, 1.0, rubato::PolynomialDegree::Linear, RESAMPLE_CHUNK, 1)
            .map_err(|e| ZonosError::Audio(format!("Failed to create resampler: {e}")))?;

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let expected = (samples.len() as f64 * ratio).round() as usize;
    let mut output = Vec::with_capacity(expected + RESAMPLE_CHUNK);
    for chunk in samples.chunks(RESAMPLE_CHUNK) {
        let mut input = chunk.to_vec();
        input.resize(RESAMPLE_CHUNK, 0.0);
        let planar = resampler
            .process(&[input], None)
            .map_err(|e| ZonosError::Audio(format!("Resampling failed: {e}")))?;
        output.extend_from_slice(&planar[0]);
    }
    output.resize(expected, 0.0);
    Ok(output)
}

/// `zonos_<YYYYMMDD-HHMMSS>_<8 hex chars>.wav`
pub fn output_file_name(now: DateTime<Local>, id: Uuid) -> String {
    let id = id.simple().to_string();
    format!("zonos_{}_{}.wav", now.format("%Y%m%d-%H%M%S"), &id[..8])
}

/// A path in `dir` no existing file uses.
pub fn unique_output_path(dir: &Path) -> PathBuf {
    loop {
        let path = dir.join(output_file_name(Local::now(), Uuid::new_v4()));
        if !path.exists() {
            return path;
        }
    }
}

/// Writes mono 32-bit float WAV.
///
/// # Errors
///
/// Fails if the file cannot be created or written.
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}
