//! Configuration for a comparison run

use crate::window::WindowKind;
use crate::{MdfError, Result};
use serde::{Deserialize, Serialize};

/// Lowest start frequency for the analysis range (Hz)
pub const START_HZ: f64 = 10.0;
/// Default end of the analysis range (Hz)
pub const END_HZ: f64 = 20000.0;
/// Highest allowed end frequency (Hz)
pub const MAX_HZ: f64 = 48000.0;
/// Default number of frequencies kept per block
pub const FREQ_COUNT: usize = 2000;
/// Upper bound for the number of frequencies kept per block
pub const MAX_FREQ_COUNT: usize = 20000;
/// Default significance level (dBFS)
pub const SIGNIFICANT_VOLUME: f64 = -60.0;
/// Default amplitude match tolerance (dB)
pub const BAR_DIFF_DB_TOLERANCE: f64 = 1.0;

/// Audio channel fed to the analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Left,
    Right,
    /// Average of all channels
    #[default]
    Stereo,
}

impl Channel {
    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'l' => Some(Channel::Left),
            'r' => Some(Channel::Right),
            's' => Some(Channel::Stereo),
            _ => None,
        }
    }
}

/// How block magnitudes are brought to a common 0 dBFS reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationMode {
    /// Time-domain peak of the block maps to 0 dBFS before the transform
    MaxTime,
    /// Strongest bin of the spectrum maps to 0 dBFS
    #[default]
    MaxFrequency,
    /// Mean magnitude of the block's fundamentals maps to 0 dBFS
    Average,
    /// Absolute dBFS, no scaling
    None,
}

impl NormalizationMode {
    pub fn from_code(code: char) -> Option<Self> {
        match code {
            't' => Some(NormalizationMode::MaxTime),
            'f' => Some(NormalizationMode::MaxFrequency),
            'a' => Some(NormalizationMode::Average),
            'n' => Some(NormalizationMode::None),
            _ => None,
        }
    }
}

/// Immutable options for one comparison run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Window applied to every block
    pub window: WindowKind,

    /// Channel(s) to analyze
    pub channel: Channel,

    /// Start of the analysis range (Hz)
    pub start_hz: f64,

    /// End of the analysis range (Hz)
    pub end_hz: f64,

    /// Strongest frequencies kept per block
    pub max_frequencies: usize,

    /// Normalization mode
    pub normalization: NormalizationMode,

    /// Re-anchor quiet comparison blocks on other reference peaks
    pub normalization_tolerant: bool,

    /// Reference peaks tried when re-anchoring
    pub normalization_tries: usize,

    /// Level drop (dB) under the reference peak that triggers re-anchoring
    pub normalization_tolerance_db: f64,

    /// Frequencies at or below this level (dBFS) are not significant
    pub significant_amplitude: f64,

    /// Amplitude differences up to this value (dB) are a match
    pub amplitude_bar_tolerance: f64,

    /// Amplitude differences above this value (dB) are high severity
    pub amplitude_hi_diff: f64,

    /// Missing frequencies louder than this (dBFS) are high severity
    pub missing_hi_diff: f64,

    /// Extra frequencies louder than this (dBFS) are high severity
    pub extra_hi_diff: f64,

    /// Zero-pad blocks to 1 Hz bins
    pub zero_pad: bool,

    /// Relax sync pulse acceptance and widen the onset search
    pub sync_tolerance: bool,

    /// Do not drop bins under the silence noise floor
    pub ignore_noise_floor: bool,

    /// Treat both captures as running at the nominal frame rate
    pub ignore_framerate_difference: bool,

    /// Level-match left and right before mixing to mono
    pub channel_balance: bool,

    /// Skip profile-declared harmless frequencies when reporting extras
    pub use_extra_data: bool,

    /// Round magnitudes to 0.001 dB
    pub quantize_round: bool,

    /// Shorten paired blocks until the comparison length is a whole number
    /// of samples at the frame-rate ratio
    pub compress_to_blocks: bool,

    /// Sync format (profile index) of the reference capture
    pub reference_format: usize,

    /// Sync format (profile index) of the comparison capture
    pub comparison_format: usize,

    /// Worker threads for block analysis (None = rayon default)
    pub threads: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            window: WindowKind::Tukey,
            channel: Channel::Stereo,
            start_hz: START_HZ,
            end_hz: END_HZ,
            max_frequencies: FREQ_COUNT,
            normalization: NormalizationMode::MaxFrequency,
            normalization_tolerant: false,
            normalization_tries: 0,
            normalization_tolerance_db: 6.0,
            significant_amplitude: SIGNIFICANT_VOLUME,
            amplitude_bar_tolerance: BAR_DIFF_DB_TOLERANCE,
            amplitude_hi_diff: 6.0,
            missing_hi_diff: -50.0,
            extra_hi_diff: -50.0,
            zero_pad: false,
            sync_tolerance: false,
            ignore_noise_floor: false,
            ignore_framerate_difference: false,
            channel_balance: true,
            use_extra_data: true,
            quantize_round: true,
            compress_to_blocks: false,
            reference_format: 0,
            comparison_format: 0,
            threads: None,
        }
    }
}

impl RunConfig {
    /// Exact comparison: no window, no normalization, tight tolerance
    pub fn strict() -> Self {
        Self {
            window: WindowKind::None,
            normalization: NormalizationMode::None,
            amplitude_bar_tolerance: 0.1,
            quantize_round: false,
            ..Default::default()
        }
    }

    /// Noisy captures: relaxed sync and normalization retries
    pub fn tolerant() -> Self {
        Self {
            sync_tolerance: true,
            normalization_tolerant: true,
            normalization_tries: 4,
            amplitude_bar_tolerance: 3.0,
            ..Default::default()
        }
    }

    /// Builder pattern: set window
    pub fn with_window(mut self, window: WindowKind) -> Self {
        self.window = window;
        self
    }

    /// Builder pattern: set channel
    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    /// Builder pattern: set frequency range
    pub fn with_freq_range(mut self, start_hz: f64, end_hz: f64) -> Self {
        self.start_hz = start_hz;
        self.end_hz = end_hz;
        self
    }

    /// Builder pattern: set normalization
    pub fn with_normalization(mut self, mode: NormalizationMode) -> Self {
        self.normalization = mode;
        self
    }

    /// Builder pattern: enable tolerant normalization with `tries` retries
    pub fn with_normalization_retries(mut self, tries: usize) -> Self {
        self.normalization_tolerant = tries > 0;
        self.normalization_tries = tries;
        self
    }

    /// Builder pattern: set significance level (dBFS)
    pub fn with_significant_amplitude(mut self, dbfs: f64) -> Self {
        self.significant_amplitude = dbfs;
        self
    }

    /// Builder pattern: set amplitude tolerance (dB)
    pub fn with_bar_tolerance(mut self, db: f64) -> Self {
        self.amplitude_bar_tolerance = db;
        self
    }

    /// Builder pattern: enable zero padding
    pub fn with_zero_padding(mut self) -> Self {
        self.zero_pad = true;
        self
    }

    /// Builder pattern: enable exact block pairing
    pub fn with_block_compression(mut self) -> Self {
        self.compress_to_blocks = true;
        self
    }

    /// Builder pattern: select sync formats
    pub fn with_formats(mut self, reference: usize, comparison: usize) -> Self {
        self.reference_format = reference;
        self.comparison_format = comparison;
        self
    }

    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| MdfError::InvalidArgument(format!("configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check option ranges
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(MdfError::InvalidArgument(msg));

        if !(self.start_hz >= 1.0) {
            return invalid(format!("start frequency {} below 1 Hz", self.start_hz));
        }
        if self.end_hz < self.start_hz * 2.0 {
            return invalid(format!(
                "end frequency {} must be at least twice the start frequency {}",
                self.end_hz, self.start_hz
            ));
        }
        if self.end_hz > MAX_HZ {
            return invalid(format!("end frequency {} above {} Hz", self.end_hz, MAX_HZ));
        }
        if self.max_frequencies == 0 || self.max_frequencies > MAX_FREQ_COUNT {
            return invalid(format!(
                "frequency count {} outside 1..={}",
                self.max_frequencies, MAX_FREQ_COUNT
            ));
        }
        if self.significant_amplitude <= -120.0 || self.significant_amplitude >= -1.0 {
            return invalid(format!(
                "significant amplitude {} dBFS outside (-120, -1)",
                self.significant_amplitude
            ));
        }
        if !(0.0..=16.0).contains(&self.amplitude_bar_tolerance) {
            return invalid(format!(
                "amplitude tolerance {} dB outside 0..=16",
                self.amplitude_bar_tolerance
            ));
        }
        if self.normalization_tries > 16 {
            return invalid(format!("{} normalization tries (max 16)", self.normalization_tries));
        }
        if self.threads == Some(0) {
            return invalid("thread count must be greater than zero".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert_eq!(config.window, WindowKind::Tukey);
        assert_eq!(config.normalization, NormalizationMode::MaxFrequency);
        assert_eq!(config.significant_amplitude, -60.0);
        assert_eq!(config.amplitude_bar_tolerance, 1.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_validate() {
        assert!(RunConfig::strict().validate().is_ok());
        assert!(RunConfig::tolerant().validate().is_ok());
        assert!(RunConfig::tolerant().normalization_tolerant);
    }

    #[test]
    fn test_builder_pattern() {
        let config = RunConfig::default()
            .with_window(WindowKind::Hann)
            .with_freq_range(20.0, 8000.0)
            .with_normalization_retries(3)
            .with_zero_padding()
            .with_block_compression();

        assert_eq!(config.window, WindowKind::Hann);
        assert_eq!(config.start_hz, 20.0);
        assert_eq!(config.normalization_tries, 3);
        assert!(config.normalization_tolerant);
        assert!(config.zero_pad);
        assert!(config.compress_to_blocks);
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        assert!(RunConfig::default().with_freq_range(100.0, 150.0).validate().is_err());
        assert!(RunConfig::default().with_freq_range(10.0, 60000.0).validate().is_err());
        assert!(RunConfig::default().with_significant_amplitude(-0.5).validate().is_err());
        assert!(RunConfig::default().with_bar_tolerance(20.0).validate().is_err());
    }

    #[test]
    fn test_codes() {
        assert_eq!(Channel::from_code('l'), Some(Channel::Left));
        assert_eq!(NormalizationMode::from_code('a'), Some(NormalizationMode::Average));
        assert_eq!(WindowKind::from_code('f'), Some(WindowKind::FlatTop));
        assert_eq!(WindowKind::from_code('x'), None);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = RunConfig::from_json_str(r#"{"window":"hann","zero_pad":true}"#).unwrap();
        assert_eq!(config.window, WindowKind::Hann);
        assert!(config.zero_pad);
        assert_eq!(config.max_frequencies, FREQ_COUNT);

        assert!(RunConfig::from_json_str(r#"{"end_hz":90000.0}"#).is_err());
        assert!(RunConfig::from_json_str(r#"{"window":"blackman"}"#).is_err());
    }
}
