// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Compute device selection.

use candle_core::Device;

use crate::error::{Result, ZonosError};

pub const VALID_DEVICES: [&str; 3] = ["cpu", "cuda", "auto"];

/// Resolves `"cpu"`, `"cuda"` or `"auto"` (case-insensitive) to a candle device.
///
/// `"auto"` picks CUDA when it was compiled in and a device is present, and
/// CPU otherwise.
///
/// # Errors
///
/// Returns [`ZonosError::Device`] for an unknown name or an unavailable CUDA device.
pub fn get_device(name: &str, index: usize) -> Result<Device> {
    match name.to_lowercase().as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" => {
            #[cfg(feature = "cuda")]
            {
                Device::new_cuda(index)
                    .map_err(|e| ZonosError::Device(format!("CUDA device {index} not available: {e}")))
            }
            #[cfg(not(feature = "cuda"))]
            {
                Err(ZonosError::Device(format!(
                    "CUDA device {index} requested but CUDA support is not compiled in; rebuild with --features cuda"
                )))
            }
        },
        "auto" => {
            if candle_core::utils::cuda_is_available() {
                match Device::new_cuda(index) {
                    Ok(device) => return Ok(device),
                    Err(e) => tracing::warn!(index, error = %e, "CUDA unavailable, using CPU"),
                }
            }
            Ok(Device::Cpu)
        },
        other => Err(ZonosError::Device(format!(
            "Invalid device '{other}'. Use one of {VALID_DEVICES:?}"
        ))),
    }
}
