//! Re-encode requests and their validation.
//!
//! A [`ReencodeRequest`] carries what the host sent; [`ReencodeRequest::validate`]
//! turns it into a [`ReencodeJob`] that engines can run without further checks.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

const FILE_SCHEME: &str = "file://";

/// Bitrate bounds in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitrateLimits {
    pub min: u64,
    pub default: u64,
    pub max: u64,
}

impl Default for BitrateLimits {
    fn default() -> Self {
        Self {
            min: 100_000,
            default: 1_000_000,
            max: 100_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReencodeRequest {
    pub input_path: String,
    pub output_path: String,
    pub width: u32,
    pub height: u32,
    /// `None` or `Some(0)` selects the default bitrate.
    pub bitrate: Option<u64>,
}

/// A validated request, ready for an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReencodeJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub width: u32,
    pub height: u32,
    pub bitrate: u64,
    pub preset: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReencodeError {
    #[error("Bitrate {bitrate} is too low. Minimum is {min} bps")]
    BitrateTooLow { bitrate: u64, min: u64 },
    #[error("Bitrate {bitrate} is too high. Maximum is {max} bps")]
    BitrateTooHigh { bitrate: u64, max: u64 },
    #[error("target size {width}x{height} is invalid, both sides must be positive")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("{which} path is empty")]
    EmptyPath { which: &'static str },
    #[error("input and output both point at {0}")]
    SamePath(PathBuf),
}

impl ReencodeRequest {
    pub fn validate(&self, limits: &BitrateLimits, preset: &str) -> Result<ReencodeJob, ReencodeError> {
        let bitrate = resolve_bitrate(self.bitrate, limits)?;

        if self.width == 0 || self.height == 0 {
            return Err(ReencodeError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }

        let input = strip_file_scheme(&self.input_path);
        if input.is_empty() {
            return Err(ReencodeError::EmptyPath { which: "input" });
        }
        let output = strip_file_scheme(&self.output_path);
        if output.is_empty() {
            return Err(ReencodeError::EmptyPath { which: "output" });
        }
        if input == output {
            return Err(ReencodeError::SamePath(PathBuf::from(input)));
        }

        Ok(ReencodeJob {
            input: PathBuf::from(input),
            output: PathBuf::from(output),
            width: self.width,
            height: self.height,
            bitrate,
            preset: preset.to_string(),
        })
    }
}

fn resolve_bitrate(requested: Option<u64>, limits: &BitrateLimits) -> Result<u64, ReencodeError> {
    let bitrate = match requested {
        None | Some(0) => limits.default,
        Some(bitrate) => bitrate,
    };

    if bitrate < limits.min {
        return Err(ReencodeError::BitrateTooLow {
            bitrate,
            min: limits.min,
        });
    }
    if bitrate > limits.max {
        return Err(ReencodeError::BitrateTooHigh {
            bitrate,
            max: limits.max,
        });
    }
    Ok(bitrate)
}

/// Hosts hand over `file://` URLs; engines want plain paths.
pub fn strip_file_scheme(path: &str) -> &str {
    path.strip_prefix(FILE_SCHEME).unwrap_or(path)
}
