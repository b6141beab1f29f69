//! Capture session configuration
//!
//! Validation and defaulting happen here, before any resource is acquired.
//! The decode parameters (`FrameLayout`) are derived from the configuration
//! once at `start` and then travel with the decode thread.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Bars per frame when the caller asks for 0.
pub const DEFAULT_BARS: usize = 128;

/// Ring capacity hint when the caller does not care.
pub const DEFAULT_RING_FRAMES: usize = 16;

/// Generator executable resolved on `PATH`.
pub const DEFAULT_PROGRAM: &str = "cava";

/// Error type for configuration validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported bit format {0:?} (expected \"8bit\" or \"16bit\")")]
    InvalidBitFormat(String),
}

/// Sample depth of the generator's raw output stream.
///
/// The wire strings (`"8bit"` / `"16bit"`) are what the generator's config
/// file format understands, so parsing and display round-trip through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitFormat {
    #[serde(rename = "8bit")]
    Bits8,
    #[serde(rename = "16bit")]
    Bits16,
}

impl BitFormat {
    /// Size of one sample on the wire
    pub fn bytes_per_sample(self) -> usize {
        match self {
            BitFormat::Bits8 => 1,
            BitFormat::Bits16 => 2,
        }
    }

    /// Largest raw sample value; decoded bars are `raw / full_scale`.
    pub fn full_scale(self) -> f32 {
        match self {
            BitFormat::Bits8 => 255.0,
            BitFormat::Bits16 => 65535.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BitFormat::Bits8 => "8bit",
            BitFormat::Bits16 => "16bit",
        }
    }
}

impl Default for BitFormat {
    fn default() -> Self {
        BitFormat::Bits16
    }
}

impl fmt::Display for BitFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BitFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "8bit" => Ok(BitFormat::Bits8),
            "16bit" => Ok(BitFormat::Bits16),
            other => Err(ConfigError::InvalidBitFormat(other.to_string())),
        }
    }
}

/// Configuration for a capture session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Sample depth requested from the generator
    pub bit_format: BitFormat,
    /// Bars per frame; 0 selects [`DEFAULT_BARS`]
    pub bars: usize,
    /// Ring capacity hint in frames; clamped to at least 2 and rounded up
    /// to the next power of two
    pub ring_frames: usize,
    /// Generator executable, resolved on `PATH`
    pub program: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            bit_format: BitFormat::default(),
            bars: DEFAULT_BARS,
            ring_frames: DEFAULT_RING_FRAMES,
            program: DEFAULT_PROGRAM.to_string(),
        }
    }
}

impl CaptureConfig {
    /// Bars per frame with the zero-means-default rule applied
    pub fn effective_bars(&self) -> usize {
        if self.bars == 0 {
            DEFAULT_BARS
        } else {
            self.bars
        }
    }

    /// Derive the decode parameters for this configuration
    pub fn layout(&self) -> FrameLayout {
        FrameLayout {
            bars: self.effective_bars(),
            format: self.bit_format,
        }
    }
}

/// Decode parameters for one session, fixed at start
#[derive(Debug, Clone, Copy)]
pub struct FrameLayout {
    pub bars: usize,
    pub format: BitFormat,
}

impl FrameLayout {
    /// Exact size of one frame on the wire; framing is purely byte-count-based
    pub fn chunk_len(&self) -> usize {
        self.bars * self.format.bytes_per_sample()
    }
}
