//! FFT-based block spectra and normalization

use crate::config::{NormalizationMode, RunConfig};
use crate::window::{WindowCache, WindowKind};
use crate::{MdfError, Result};
use num_complex::Complex64;
use parking_lot::Mutex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Magnitudes at or below this are treated as empty bins
const MAGNITUDE_FLOOR: f64 = 1e-12;

/// Prepared plans; planners are created on a miss and not kept
#[derive(Default)]
struct PlanStore {
    forward: HashMap<usize, Arc<dyn RealToComplex<f64>>>,
    inverse: HashMap<usize, Arc<dyn ComplexToReal<f64>>>,
}

/// Linear single-sided magnitudes of one block
#[derive(Debug, Clone, PartialEq)]
pub struct RawSpectrum {
    /// Amplitude per bin (a full-scale sine reads 1.0)
    pub magnitudes: Vec<f64>,

    /// Hz per bin
    pub resolution_hz: f64,

    pub sample_rate: u32,

    /// Unpadded block length in samples
    pub length: usize,

    /// Gain (dB) applied to the samples before the transform
    pub pre_gain_db: f64,
}

impl RawSpectrum {
    pub fn bin_frequency(&self, bin: usize) -> f64 {
        bin as f64 * self.resolution_hz
    }

    /// Nearest bin to a frequency, if inside the spectrum
    pub fn bin_for(&self, frequency: f64) -> Option<usize> {
        if frequency.is_nan() || frequency < 0.0 {
            return None;
        }
        let bin = (frequency / self.resolution_hz).round() as usize;
        (bin < self.magnitudes.len()).then_some(bin)
    }

    pub fn magnitude_at(&self, frequency: f64) -> f64 {
        self.bin_for(frequency)
            .map(|bin| self.magnitudes[bin])
            .unwrap_or(0.0)
    }

    /// Bins whose frequency lies in `[start_hz, end_hz]`
    pub fn bins_in_range(&self, start_hz: f64, end_hz: f64) -> std::ops::Range<usize> {
        let first = (start_hz / self.resolution_hz).ceil().max(0.0) as usize;
        let last = ((end_hz / self.resolution_hz).floor() as usize).saturating_add(1);
        first.min(self.magnitudes.len())..last.min(self.magnitudes.len())
    }

    /// Strongest bin in range as (bin, dB)
    pub fn peak_in_range(&self, start_hz: f64, end_hz: f64) -> Option<(usize, f64)> {
        self.bins_in_range(start_hz, end_hz)
            .filter(|&bin| self.magnitudes[bin] > MAGNITUDE_FLOOR)
            .max_by(|&a, &b| self.magnitudes[a].total_cmp(&self.magnitudes[b]))
            .map(|bin| (bin, to_db(self.magnitudes[bin])))
    }

    /// Loudest level in range as captured, undoing any pre-transform gain
    pub fn absolute_peak_db(&self, start_hz: f64, end_hz: f64) -> Option<f64> {
        self.peak_in_range(start_hz, end_hz)
            .map(|(_, db)| db - self.pre_gain_db)
    }
}

/// One frequency of a normalized spectrum
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectralBin {
    pub frequency: f64,
    /// Relative dBFS
    pub magnitude: f64,
}

/// Normalized spectrum of one block, sorted by frequency
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    pub bins: Vec<SpectralBin>,
    pub resolution_hz: f64,
    /// Offset (dB) subtracted during normalization
    pub normalization_db: f64,
}

impl Spectrum {
    /// Build from (frequency, dB) pairs
    pub fn from_pairs(pairs: &[(f64, f64)], resolution_hz: f64) -> Self {
        let mut bins: Vec<SpectralBin> = pairs
            .iter()
            .map(|&(frequency, magnitude)| SpectralBin { frequency, magnitude })
            .collect();
        bins.sort_by(|a, b| a.frequency.total_cmp(&b.frequency));
        Self {
            bins,
            resolution_hz,
            normalization_db: 0.0,
        }
    }

    /// Closest bin within `tolerance_hz` of `frequency`
    pub fn lookup(&self, frequency: f64, tolerance_hz: f64) -> Option<&SpectralBin> {
        let index = self.bins.partition_point(|b| b.frequency < frequency);
        let below = index.checked_sub(1).and_then(|i| self.bins.get(i));
        let above = self.bins.get(index);

        [below, above]
            .into_iter()
            .flatten()
            .filter(|b| (b.frequency - frequency).abs() <= tolerance_hz)
            .min_by(|a, b| {
                (a.frequency - frequency)
                    .abs()
                    .total_cmp(&(b.frequency - frequency).abs())
            })
    }

    pub fn peak(&self) -> Option<&SpectralBin> {
        self.bins.iter().max_by(|a, b| a.magnitude.total_cmp(&b.magnitude))
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }
}

/// Windowed FFT analysis of blocks
///
/// Plans are created lazily once per (length, direction) and released with
/// the analyzer.
pub struct SpectralAnalyzer {
    config: RunConfig,
    windows: WindowCache,
    plans: Mutex<PlanStore>,
}

impl SpectralAnalyzer {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            config: config.clone(),
            windows: WindowCache::new(),
            plans: Mutex::new(PlanStore::default()),
        }
    }

    pub fn windows(&self) -> &WindowCache {
        &self.windows
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Number of prepared transform plans
    pub fn plan_count(&self) -> usize {
        let store = self.plans.lock();
        store.forward.len() + store.inverse.len()
    }

    fn forward_plan(&self, length: usize) -> Arc<dyn RealToComplex<f64>> {
        let mut store = self.plans.lock();
        Arc::clone(
            store
                .forward
                .entry(length)
                .or_insert_with(|| RealFftPlanner::<f64>::new().plan_fft_forward(length)),
        )
    }

    fn inverse_plan(&self, length: usize) -> Arc<dyn ComplexToReal<f64>> {
        let mut store = self.plans.lock();
        Arc::clone(
            store
                .inverse
                .entry(length)
                .or_insert_with(|| RealFftPlanner::<f64>::new().plan_fft_inverse(length)),
        )
    }

    /// Transform length for a block, padded to whole-Hz bins when enabled
    pub fn fft_length(&self, length: usize, sample_rate: u32) -> usize {
        if self.config.zero_pad {
            let rate = sample_rate as usize;
            length.div_ceil(rate) * rate
        } else {
            length
        }
    }

    /// Transform lengths for a block pair
    ///
    /// The comparison holds `stretch` samples per reference sample. With
    /// zero-padding the comparison is padded in the same proportion, so bin
    /// `k` covers the same content frequency on both sides.
    pub fn paired_fft_lengths(
        &self,
        reference_len: usize,
        comparison_len: usize,
        reference_rate: u32,
        stretch: f64,
    ) -> (usize, usize) {
        if !self.config.zero_pad {
            return (reference_len, comparison_len);
        }
        let reference = self.fft_length(reference_len, reference_rate);
        let comparison = ((reference as f64 * stretch).round() as usize).max(comparison_len);
        (reference, comparison)
    }

    /// Window, transform and scale one block
    pub fn transform(
        &self,
        samples: &[f64],
        sample_rate: u32,
        block: usize,
    ) -> Result<RawSpectrum> {
        let fft_length = self.fft_length(samples.len(), sample_rate);
        self.transform_padded(samples, sample_rate, fft_length, block)
    }

    /// Window and transform one block, zero-padded to `fft_length`
    pub fn transform_padded(
        &self,
        samples: &[f64],
        sample_rate: u32,
        fft_length: usize,
        block: usize,
    ) -> Result<RawSpectrum> {
        let kind = self.config.window;
        let length = samples.len();
        let window = self.windows.get_window(length, sample_rate, kind)?;
        if fft_length < length {
            return Err(MdfError::InvalidArgument(format!(
                "transform of {} bins is shorter than the {} sample block",
                fft_length, length
            )));
        }

        let gain = if self.config.normalization == NormalizationMode::MaxTime {
            let peak = samples.iter().fold(0.0, |acc: f64, s| acc.max(s.abs()));
            if peak > 0.0 {
                1.0 / peak
            } else {
                1.0
            }
        } else {
            1.0
        };

        let fft = self.forward_plan(fft_length);

        let mut input = fft.make_input_vec();
        for ((slot, &sample), &w) in input.iter_mut().zip(samples).zip(window.iter()) {
            *slot = sample * w * gain;
        }
        let mut output = fft.make_output_vec();
        fft.process(&mut input, &mut output)
            .map_err(|e| MdfError::Transform {
                block,
                message: e.to_string(),
            })?;

        let scale = self.windows.compensation(length, sample_rate, kind)?
            * self.windows.correction_factor(length);
        let mut magnitudes: Vec<f64> = output.iter().map(|c| c.norm() * scale).collect();

        // DC and Nyquist are not doubled
        if let Some(dc) = magnitudes.first_mut() {
            *dc /= 2.0;
        }
        if fft_length % 2 == 0 && magnitudes.len() > 1 {
            if let Some(nyquist) = magnitudes.last_mut() {
                *nyquist /= 2.0;
            }
        }

        Ok(RawSpectrum {
            magnitudes,
            resolution_hz: sample_rate as f64 / fft_length as f64,
            sample_rate,
            length,
            pre_gain_db: to_db(gain),
        })
    }

    /// Offset (dB) that maps the spectrum to the configured 0 dBFS reference
    ///
    /// `paired_reference` is the reference block's spectrum when `raw` belongs
    /// to the comparison capture; `frequency_scale` maps reference frequencies
    /// onto the comparison capture.
    pub fn normalization_offset(
        &self,
        raw: &RawSpectrum,
        fundamentals: &[f64],
        paired_reference: Option<&RawSpectrum>,
        frequency_scale: f64,
    ) -> f64 {
        let (start, end) = (self.config.start_hz, self.config.end_hz);
        match self.config.normalization {
            NormalizationMode::MaxTime | NormalizationMode::None => 0.0,
            NormalizationMode::Average => {
                let bins: Vec<usize> = if fundamentals.is_empty() {
                    raw.bins_in_range(start, end).collect()
                } else {
                    fundamentals.iter().filter_map(|&f| raw.bin_for(f)).collect()
                };
                if bins.is_empty() {
                    return 0.0;
                }
                let mean = bins.iter().map(|&b| raw.magnitudes[b]).sum::<f64>() / bins.len() as f64;
                if mean > MAGNITUDE_FLOOR {
                    to_db(mean)
                } else {
                    0.0
                }
            }
            NormalizationMode::MaxFrequency => {
                let Some((_, own_peak)) = raw.peak_in_range(start, end) else {
                    return 0.0;
                };
                match paired_reference {
                    Some(reference) if self.config.normalization_tolerant => self
                        .relaxed_anchor(raw, own_peak, reference, frequency_scale)
                        .unwrap_or(own_peak),
                    _ => own_peak,
                }
            }
        }
    }

    /// Anchor a quiet comparison block on a reference peak it shares
    fn relaxed_anchor(
        &self,
        raw: &RawSpectrum,
        own_peak: f64,
        reference: &RawSpectrum,
        frequency_scale: f64,
    ) -> Option<f64> {
        let (start, end) = (self.config.start_hz, self.config.end_hz);
        let (_, reference_peak) = reference.peak_in_range(start, end)?;
        if own_peak >= reference_peak - self.config.normalization_tolerance_db {
            return None;
        }

        let mut candidates: Vec<usize> = reference
            .bins_in_range(start, end)
            .filter(|&b| reference.magnitudes[b] > MAGNITUDE_FLOOR)
            .collect();
        candidates.sort_by(|&a, &b| reference.magnitudes[b].total_cmp(&reference.magnitudes[a]));

        let tries = self.config.normalization_tries;
        for (attempt, bin) in candidates.into_iter().take(tries).enumerate() {
            let reference_db = to_db(reference.magnitudes[bin]);
            let frequency = reference.bin_frequency(bin) * frequency_scale;
            let comparison_db = to_db(raw.magnitude_at(frequency));

            if comparison_db - own_peak > self.config.significant_amplitude {
                let anchor = comparison_db - (reference_db - reference_peak);
                log::debug!(
                    "Normalization retry {}: anchored on {:.1}Hz ({:.2}dB)",
                    attempt + 1,
                    frequency,
                    anchor
                );
                return Some(anchor);
            }
        }
        None
    }

    /// Convert to a bounded, normalized spectrum
    ///
    /// Bins at or below `noise_floor_db` (absolute dBFS) are dropped unless
    /// the noise floor is ignored.
    pub fn finish(
        &self,
        raw: &RawSpectrum,
        offset_db: f64,
        noise_floor_db: Option<f64>,
    ) -> Spectrum {
        let config = &self.config;
        let nyquist = raw.sample_rate as f64 / 2.0;
        let floor = noise_floor_db.filter(|_| !config.ignore_noise_floor);

        let mut bins: Vec<SpectralBin> = raw
            .bins_in_range(config.start_hz, config.end_hz.min(nyquist))
            .filter_map(|bin| {
                let db = to_db(raw.magnitudes[bin]);
                if !db.is_finite() {
                    return None;
                }
                if floor.is_some_and(|f| db - raw.pre_gain_db <= f) {
                    return None;
                }
                let mut magnitude = db - offset_db;
                if config.quantize_round {
                    magnitude = (magnitude * 1000.0).round() / 1000.0;
                }
                Some(SpectralBin {
                    frequency: raw.bin_frequency(bin),
                    magnitude,
                })
            })
            .collect();

        if bins.len() > config.max_frequencies {
            bins.sort_by(|a, b| b.magnitude.total_cmp(&a.magnitude));
            bins.truncate(config.max_frequencies);
            bins.sort_by(|a, b| a.frequency.total_cmp(&b.frequency));
        }

        Spectrum {
            bins,
            resolution_hz: raw.resolution_hz,
            normalization_db: offset_db,
        }
    }

    /// Transform and normalize a single block on its own
    pub fn analyze(
        &self,
        samples: &[f64],
        sample_rate: u32,
        block: usize,
        fundamentals: &[f64],
    ) -> Result<Spectrum> {
        let raw = self.transform(samples, sample_rate, block)?;
        let offset = self.normalization_offset(&raw, fundamentals, None, 1.0);
        Ok(self.finish(&raw, offset, None))
    }

    /// Cross-correlation of `template` against every lag of `region`
    ///
    /// Returns `region.len() - template.len() + 1` values, computed through
    /// forward and inverse transforms.
    pub fn cross_correlate(
        &self,
        region: &[f64],
        template: &[f64],
        block: usize,
    ) -> Result<Vec<f64>> {
        if template.is_empty() || region.len() < template.len() {
            return Err(MdfError::InvalidArgument(format!(
                "cannot correlate {} samples against a {} sample template",
                region.len(),
                template.len()
            )));
        }

        let size = (region.len() + template.len()).next_power_of_two();
        let forward = self.forward_plan(size);
        let inverse = self.inverse_plan(size);
        let transform_err = |e: realfft::FftError| MdfError::Transform {
            block,
            message: e.to_string(),
        };

        let mut a = forward.make_input_vec();
        a[..region.len()].copy_from_slice(region);
        let mut spectrum_a = forward.make_output_vec();
        forward.process(&mut a, &mut spectrum_a).map_err(transform_err)?;

        let mut b = forward.make_input_vec();
        b[..template.len()].copy_from_slice(template);
        let mut spectrum_b = forward.make_output_vec();
        forward.process(&mut b, &mut spectrum_b).map_err(transform_err)?;

        let mut product: Vec<Complex64> = spectrum_a
            .iter()
            .zip(&spectrum_b)
            .map(|(x, y)| x * y.conj())
            .collect();
        // Real input: DC and Nyquist must be purely real for the inverse
        if let Some(dc) = product.first_mut() {
            dc.im = 0.0;
        }
        if let Some(nyquist) = product.last_mut() {
            nyquist.im = 0.0;
        }

        let mut correlation = inverse.make_output_vec();
        inverse.process(&mut product, &mut correlation).map_err(transform_err)?;

        let lags = region.len() - template.len() + 1;
        let norm = 1.0 / size as f64;
        Ok(correlation[..lags].iter().map(|c| c * norm).collect())
    }

    /// Frequency of the strongest tone within `±search` (fraction) of `nominal_hz`
    ///
    /// Zero-pads to at least eight times the block length and refines the peak
    /// with parabolic interpolation.
    pub fn measure_frequency(
        &self,
        samples: &[f64],
        sample_rate: u32,
        nominal_hz: f64,
        search: f64,
        block: usize,
    ) -> Result<Option<f64>> {
        let window = self.windows.get_window(samples.len(), sample_rate, WindowKind::Hann)?;
        let size = (samples.len() * 8).next_power_of_two();
        let fft = self.forward_plan(size);

        let mut input = fft.make_input_vec();
        for ((slot, &s), &w) in input.iter_mut().zip(samples).zip(window.iter()) {
            *slot = s * w;
        }
        let mut output = fft.make_output_vec();
        fft.process(&mut input, &mut output)
            .map_err(|e| MdfError::Transform {
                block,
                message: e.to_string(),
            })?;

        let resolution = sample_rate as f64 / size as f64;
        let low = ((nominal_hz * (1.0 - search)) / resolution).floor().max(1.0) as usize;
        let high =
            (((nominal_hz * (1.0 + search)) / resolution).ceil() as usize).min(output.len() - 2);
        if low >= high {
            return Ok(None);
        }

        let magnitude = |bin: usize| output[bin].norm();
        let Some(peak) = (low..=high).max_by(|&a, &b| magnitude(a).total_cmp(&magnitude(b))) else {
            return Ok(None);
        };
        if magnitude(peak) <= MAGNITUDE_FLOOR {
            return Ok(None);
        }

        let (left, center, right) = (
            to_db(magnitude(peak - 1).max(MAGNITUDE_FLOOR)),
            to_db(magnitude(peak)),
            to_db(magnitude(peak + 1).max(MAGNITUDE_FLOOR)),
        );
        let denom = left - 2.0 * center + right;
        let delta = if denom.abs() > f64::EPSILON {
            (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
        } else {
            0.0
        };

        Ok(Some((peak as f64 + delta) * resolution))
    }
}

/// Convert linear amplitude to dB
pub fn to_db(amplitude: f64) -> f64 {
    if amplitude <= 0.0 {
        -f64::INFINITY
    } else {
        20.0 * amplitude.log10()
    }
}

/// Convert dB to linear amplitude
pub fn from_db(db: f64) -> f64 {
    10.0_f64.powf(db / 20.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    const RATE: u32 = 48000;

    fn sine(freq: f64, amplitude: f64, len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * freq * i as f64 / RATE as f64).sin())
            .collect()
    }

    fn plain_config() -> RunConfig {
        RunConfig {
            window: WindowKind::None,
            normalization: NormalizationMode::None,
            quantize_round: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_bin_centered_sine_level() {
        let analyzer = SpectralAnalyzer::new(&plain_config());
        // 4800 samples -> 10 Hz bins, 1 kHz is bin centered
        let spectrum = analyzer.analyze(&sine(1000.0, 0.5, 4800), RATE, 0, &[]).unwrap();

        let peak = spectrum.peak().unwrap();
        assert_abs_diff_eq!(peak.frequency, 1000.0, epsilon = 1e-9);
        assert_abs_diff_eq!(peak.magnitude, to_db(0.5), epsilon = 1e-6);
        assert_abs_diff_eq!(spectrum.resolution_hz, 10.0);
    }

    #[test]
    fn test_max_frequency_is_scale_invariant() {
        let config = RunConfig {
            quantize_round: false,
            ..Default::default()
        };
        let analyzer = SpectralAnalyzer::new(&config);

        let loud: Vec<f64> = sine(1000.0, 0.8, 4800)
            .iter()
            .zip(sine(2500.0, 0.1, 4800))
            .map(|(a, b)| a + b)
            .collect();
        let quiet: Vec<f64> = loud.iter().map(|s| s * 0.125).collect();

        let a = analyzer.analyze(&loud, RATE, 0, &[]).unwrap();
        let b = analyzer.analyze(&quiet, RATE, 1, &[]).unwrap();

        assert_eq!(a.len(), b.len());
        assert_abs_diff_eq!(a.peak().unwrap().magnitude, 0.0, epsilon = 1e-9);
        for (x, y) in a.bins.iter().zip(&b.bins) {
            assert_eq!(x.frequency, y.frequency);
            assert_abs_diff_eq!(x.magnitude, y.magnitude, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_max_time_normalization() {
        let config = plain_config().with_normalization(NormalizationMode::MaxTime);
        let analyzer = SpectralAnalyzer::new(&config);
        let spectrum = analyzer.analyze(&sine(1000.0, 0.25, 4800), RATE, 0, &[]).unwrap();
        assert_abs_diff_eq!(spectrum.peak().unwrap().magnitude, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_average_normalization_uses_fundamentals() {
        let config = plain_config().with_normalization(NormalizationMode::Average);
        let analyzer = SpectralAnalyzer::new(&config);
        let samples: Vec<f64> = sine(1000.0, 0.5, 4800)
            .iter()
            .zip(sine(2000.0, 0.25, 4800))
            .map(|(a, b)| a + b)
            .collect();

        let spectrum = analyzer.analyze(&samples, RATE, 0, &[1000.0, 2000.0]).unwrap();
        // Mean of 0.5 and 0.25 is the 0 dB reference
        let expected = to_db(0.5) - to_db(0.375);
        let level = spectrum.lookup(1000.0, 1.0).unwrap().magnitude;
        assert_abs_diff_eq!(level, expected, epsilon = 1e-6);
    }

    #[test]
    fn test_zero_padding_gives_one_hz_bins() {
        let analyzer = SpectralAnalyzer::new(&plain_config().with_zero_padding());
        let raw = analyzer.transform(&sine(1000.0, 0.5, 4800), RATE, 0).unwrap();
        assert_abs_diff_eq!(raw.resolution_hz, 1.0);
        assert_eq!(raw.length, 4800);
        assert_eq!(analyzer.fft_length(4800, RATE), 48000);
        assert_eq!(analyzer.fft_length(60000, RATE), 96000);
    }

    #[test]
    fn test_tukey_level_independent_of_block_length() {
        let config = RunConfig {
            normalization: NormalizationMode::None,
            quantize_round: false,
            ..Default::default()
        };
        let analyzer = SpectralAnalyzer::new(&config);

        // 0.2 s has an uncapped taper, 1 s and 2 s are capped at 50 ms
        for length in [9600usize, 48000, 96000] {
            let spectrum = analyzer.analyze(&sine(1000.0, 0.1, length), RATE, 0, &[]).unwrap();
            let peak = spectrum.peak().unwrap();
            assert_abs_diff_eq!(peak.frequency, 1000.0, epsilon = 1e-9);
            assert_abs_diff_eq!(peak.magnitude, -20.0, epsilon = 0.01);
        }
    }

    #[test]
    fn test_paired_padding_keeps_bins_aligned() {
        let plain = SpectralAnalyzer::new(&plain_config());
        assert_eq!(plain.paired_fft_lengths(9599, 9589, RATE, 1.0 / 1.001), (9599, 9589));

        let padded = SpectralAnalyzer::new(&plain_config().with_zero_padding());
        let (reference, comparison) = padded.paired_fft_lengths(9599, 9589, RATE, 1.0 / 1.001);
        assert_eq!(reference, 48000);
        assert_eq!(comparison, 47952);

        // 1 kHz in the reference and 1.001 kHz in the comparison share a bin
        let a = padded
            .transform_padded(&sine(1000.0, 0.5, 9599), RATE, reference, 0)
            .unwrap();
        let b = padded
            .transform_padded(&sine(1001.0, 0.5, 9589), RATE, comparison, 0)
            .unwrap();
        let peak = |raw: &RawSpectrum| raw.peak_in_range(900.0, 1100.0).unwrap().0;
        assert_eq!(peak(&a), 1000);
        assert_eq!(peak(&b), 1000);
        assert_abs_diff_eq!(b.resolution_hz / a.resolution_hz, 1.001, epsilon = 1e-5);

        assert!(matches!(
            padded.transform_padded(&sine(1000.0, 0.5, 4800), RATE, 4000, 0),
            Err(MdfError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_empty_block_rejected() {
        let analyzer = SpectralAnalyzer::new(&RunConfig::default());
        assert!(matches!(
            analyzer.transform(&[], RATE, 3),
            Err(MdfError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_plans_reused_per_length() {
        let analyzer = SpectralAnalyzer::new(&plain_config());
        for _ in 0..3 {
            analyzer.transform(&sine(1000.0, 0.5, 4800), RATE, 0).unwrap();
        }
        analyzer.transform(&sine(1000.0, 0.5, 2400), RATE, 1).unwrap();
        assert_eq!(analyzer.plan_count(), 2);
        assert_eq!(analyzer.windows().len(), 2);
    }

    #[test]
    fn test_finish_applies_range_cap_and_floor() {
        let config = RunConfig {
            max_frequencies: 2,
            ..plain_config()
        }
        .with_freq_range(100.0, 5000.0);
        let analyzer = SpectralAnalyzer::new(&config);

        let raw = RawSpectrum {
            magnitudes: vec![1.0, 0.5, 0.1, 0.01, 0.001, 0.3],
            resolution_hz: 1000.0,
            sample_rate: 12000,
            length: 12,
            pre_gain_db: 0.0,
        };

        // DC is out of range; the two strongest remaining are 1000 and 5000 Hz
        let spectrum = analyzer.finish(&raw, 0.0, None);
        let freqs: Vec<f64> = spectrum.bins.iter().map(|b| b.frequency).collect();
        assert_eq!(freqs, vec![1000.0, 5000.0]);

        // Floor at -12 dBFS keeps 1000 Hz (-6.0) and 5000 Hz (-10.5)
        let config = RunConfig {
            max_frequencies: 10,
            ..config
        };
        let analyzer = SpectralAnalyzer::new(&config);
        let spectrum = analyzer.finish(&raw, 0.0, Some(-12.0));
        let freqs: Vec<f64> = spectrum.bins.iter().map(|b| b.frequency).collect();
        assert_eq!(freqs, vec![1000.0, 5000.0]);
        let spectrum = analyzer.finish(&raw, 0.0, Some(-8.0));
        assert_eq!(spectrum.len(), 1);

        let config = RunConfig {
            ignore_noise_floor: true,
            ..config
        };
        let spectrum = SpectralAnalyzer::new(&config).finish(&raw, 0.0, Some(-8.0));
        assert_eq!(spectrum.len(), 5);
    }

    #[test]
    fn test_tolerant_normalization_retries_reference_peaks() {
        let reference = RawSpectrum {
            magnitudes: vec![0.0, 1.0, 0.5, 0.0],
            resolution_hz: 1000.0,
            sample_rate: 6000,
            length: 6,
            pre_gain_db: 0.0,
        };
        // Reference peak (1 kHz) is gone, 2 kHz is 12 dB down
        let comparison = RawSpectrum {
            magnitudes: vec![0.0, 1e-6, 0.25, 0.0],
            ..reference.clone()
        };

        let plain = SpectralAnalyzer::new(&RunConfig::default());
        let own = plain.normalization_offset(&comparison, &[], Some(&reference), 1.0);
        assert_abs_diff_eq!(own, to_db(0.25), epsilon = 1e-9);

        let tolerant = SpectralAnalyzer::new(&RunConfig::default().with_normalization_retries(2));
        let anchored = tolerant.normalization_offset(&comparison, &[], Some(&reference), 1.0);
        assert_abs_diff_eq!(anchored, to_db(0.25) - to_db(0.5), epsilon = 1e-9);

        // A single try only sees the missing peak and falls back
        let single = SpectralAnalyzer::new(&RunConfig::default().with_normalization_retries(1));
        let fallback = single.normalization_offset(&comparison, &[], Some(&reference), 1.0);
        assert_abs_diff_eq!(fallback, own, epsilon = 1e-9);
    }

    #[test]
    fn test_cross_correlate_finds_template() {
        let analyzer = SpectralAnalyzer::new(&RunConfig::default());
        let template = sine(8000.0, 1.0, 120);
        let mut region = vec![0.0; 600];
        region[237..357].copy_from_slice(&template);

        let corr = analyzer.cross_correlate(&region, &template, 0).unwrap();
        assert_eq!(corr.len(), 481);
        let best = corr
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(best, 237);

        let energy: f64 = template.iter().map(|s| s * s).sum();
        assert_abs_diff_eq!(corr[237], energy, epsilon = 1e-6);
    }

    #[test]
    fn test_measure_frequency() {
        let analyzer = SpectralAnalyzer::new(&RunConfig::default());
        let measured = analyzer
            .measure_frequency(&sine(1002.0, 0.5, 9600), RATE, 1000.0, 0.05, 0)
            .unwrap()
            .unwrap();
        assert!((measured - 1002.0).abs() < 0.5, "measured {}", measured);
    }

    #[test]
    fn test_spectrum_lookup() {
        let spectrum = Spectrum::from_pairs(&[(3000.0, -30.0), (1000.0, -20.0)], 1.0);
        assert_eq!(spectrum.bins[0].frequency, 1000.0);
        assert_eq!(spectrum.lookup(1000.4, 0.5).unwrap().magnitude, -20.0);
        assert!(spectrum.lookup(1001.0, 0.5).is_none());
        assert_eq!(spectrum.lookup(2999.6, 0.5).unwrap().frequency, 3000.0);
    }

    #[test]
    fn test_to_from_db() {
        assert!((to_db(1.0) - 0.0).abs() < 0.001);
        assert!((to_db(0.5) - (-6.02)).abs() < 0.1);
        assert!((from_db(-6.0) - 0.5).abs() < 0.01);
        assert!((from_db(0.0) - 1.0).abs() < 0.001);
    }
}
