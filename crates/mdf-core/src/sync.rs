//! Sync pulse detection and frame-rate drift estimation

use crate::block::place;
use crate::catalog::{BlockTypeCatalog, SyncFormat};
use crate::config::RunConfig;
use crate::signal::{ChannelMix, Signal};
use crate::spectral::SpectralAnalyzer;
use crate::{MdfError, Result, SignalRole};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Coarse scan acceptance (quadrature score)
const SCAN_THRESHOLD: f64 = 0.70;
const SCAN_THRESHOLD_TOLERANT: f64 = 0.50;

/// Fine search acceptance (normalized correlation envelope)
const MATCH_THRESHOLD: f64 = 0.75;
const MATCH_THRESHOLD_TOLERANT: f64 = 0.50;

/// Search window around the expected closing sync, as a fraction of the distance
const END_SEARCH_RATIO: f64 = 0.05;

/// Accepted deviation of the clock block from its nominal frequency
const CLOCK_SEARCH_RATIO: f64 = 0.05;

/// Envelope flanks are fitted over this fraction of the pulse length
const FLANK_FIT_DIVISOR: usize = 8;

/// Where a capture's timeline starts and how fast it runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub role: SignalRole,
    /// Sync format index in the profile
    pub format: usize,
    /// Onset sample of the first sync pulse
    pub offset: usize,
    /// Measured frame rate over nominal
    pub drift: f64,
    /// Onset sample of the closing sync pulse, when found
    pub end_offset: Option<usize>,
    /// Measured clock block frequency (Hz)
    pub clock_hz: Option<f64>,
}

/// Sync results of both captures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPair {
    pub reference: SyncResult,
    pub comparison: SyncResult,
}

impl SyncPair {
    /// Comparison frame rate relative to the reference
    pub fn framerate_ratio(&self) -> f64 {
        self.comparison.drift / self.reference.drift
    }
}

/// A located pulse train
#[derive(Debug, Clone, Copy, PartialEq)]
struct Onset {
    /// Peak of the correlation envelope
    sample: usize,
    /// Meeting point of the envelope flanks
    fine: f64,
}

/// Finds the sync pulse trains in each capture
pub struct Synchronizer<'a> {
    catalog: &'a BlockTypeCatalog,
    config: &'a RunConfig,
    analyzer: &'a SpectralAnalyzer,
}

/// Per-format detection parameters at a given sample rate
struct PulseSearch {
    pulse_len: usize,
    period: f64,
    count: usize,
    cos: Vec<f64>,
    sin: Vec<f64>,
}

impl PulseSearch {
    fn new(format: &SyncFormat, sample_rate: u32) -> Self {
        let pulse_samples = format.frames_to_samples(format.pulse.pulse_frames, sample_rate);
        let pulse_len = (pulse_samples.round() as usize).max(1);
        let omega = 2.0 * PI * format.pulse.frequency_hz / sample_rate as f64;
        Self {
            pulse_len,
            period: format.frames_to_samples(format.pulse.period_frames(), sample_rate),
            count: format.pulse.count,
            cos: (0..pulse_len).map(|n| (omega * n as f64).cos()).collect(),
            sin: (0..pulse_len).map(|n| (omega * n as f64).sin()).collect(),
        }
    }

    /// Samples from the first onset to the end of the last pulse
    fn train_len(&self) -> usize {
        (self.period * (self.count - 1) as f64).round() as usize + self.pulse_len
    }

    /// How much of the window is a tone at the pulse frequency (0..=1)
    fn score(&self, window: &[f64]) -> f64 {
        let (mut re, mut im, mut energy) = (0.0, 0.0, 0.0);
        for ((&x, &c), &s) in window.iter().zip(&self.cos).zip(&self.sin) {
            re += x * c;
            im += x * s;
            energy += x * x;
        }
        if energy <= f64::EPSILON {
            return 0.0;
        }
        (re.hypot(im) / (energy.sqrt() * (window.len() as f64 / 2.0).sqrt())).min(1.0)
    }

    fn rms(window: &[f64]) -> f64 {
        if window.is_empty() {
            return 0.0;
        }
        (window.iter().map(|x| x * x).sum::<f64>() / window.len() as f64).sqrt()
    }
}

impl<'a> Synchronizer<'a> {
    pub fn new(
        catalog: &'a BlockTypeCatalog,
        config: &'a RunConfig,
        analyzer: &'a SpectralAnalyzer,
    ) -> Self {
        Self {
            catalog,
            config,
            analyzer,
        }
    }

    fn scan_threshold(&self) -> f64 {
        if self.config.sync_tolerance {
            SCAN_THRESHOLD_TOLERANT
        } else {
            SCAN_THRESHOLD
        }
    }

    fn match_threshold(&self) -> f64 {
        if self.config.sync_tolerance {
            MATCH_THRESHOLD_TOLERANT
        } else {
            MATCH_THRESHOLD
        }
    }

    /// Synchronize both captures
    pub fn synchronize_pair(&self, reference: &Signal, comparison: &Signal) -> Result<SyncPair> {
        let pair = SyncPair {
            reference: self.synchronize(reference, SignalRole::Reference)?,
            comparison: self.synchronize(comparison, SignalRole::Comparison)?,
        };
        log::info!(
            "Sync: reference @{} (drift {:.6}), comparison @{} (drift {:.6}), ratio {:.6}",
            pair.reference.offset,
            pair.reference.drift,
            pair.comparison.offset,
            pair.comparison.drift,
            pair.framerate_ratio()
        );
        Ok(pair)
    }

    /// Locate the first sync pulse train and measure drift
    pub fn synchronize(&self, signal: &Signal, role: SignalRole) -> Result<SyncResult> {
        let format_index = match role {
            SignalRole::Reference => self.config.reference_format,
            SignalRole::Comparison => self.config.comparison_format,
        };
        let format = self.catalog.sync_format(format_index)?;
        let sample_rate = signal.sample_rate();
        let track = ChannelMix::raw(signal, self.config.channel);
        let track = track.samples();

        let syncs = self.catalog.sync_entries();
        let first = syncs.first().ok_or(MdfError::SyncNotFound { signal: role })?;
        let first_index = self.timeline_index(first.start_frames);
        let search = PulseSearch::new(format, sample_rate);

        let onset = self
            .find_pulse_train(track, &search, 0, track.len(), first_index)?
            .ok_or(MdfError::SyncNotFound { signal: role })?;
        log::debug!(
            "{}: sync '{}' onset at sample {} ({:.2})",
            role,
            format.name,
            onset.sample,
            onset.fine
        );

        let mut result = SyncResult {
            role,
            format: format_index,
            offset: onset.sample,
            drift: 1.0,
            end_offset: None,
            clock_hz: None,
        };

        if self.config.ignore_framerate_difference {
            return Ok(result);
        }

        if let Some(last) = syncs.last().filter(|_| syncs.len() > 1) {
            let distance =
                format.frames_to_samples(last.start_frames - first.start_frames, sample_rate);
            let expected = onset.sample as f64 + distance;
            let reach = (distance * END_SEARCH_RATIO).max(2.0 * search.pulse_len as f64);
            let from = (expected - reach).max(0.0) as usize;
            let to = ((expected + reach) as usize).min(track.len());
            let last_index = self.timeline_index(last.start_frames);

            match self.find_pulse_train(track, &search, from, to, last_index)? {
                Some(end) if end.fine > onset.fine => {
                    result.end_offset = Some(end.sample);
                    result.drift = distance / (end.fine - onset.fine);
                }
                _ => log::warn!("{}: closing sync not found, assuming nominal frame rate", role),
            }
        }

        if let Some(clock_hz) = self.measure_clock(track, sample_rate, format, &result)? {
            if let Some(clock) = &self.catalog.clock {
                result.clock_hz = Some(clock_hz);
                result.drift = clock_hz / clock.frequency_hz;
            }
        }

        Ok(result)
    }

    fn timeline_index(&self, start_frames: f64) -> usize {
        self.catalog
            .timeline()
            .iter()
            .position(|e| e.start_frames == start_frames)
            .unwrap_or(0)
    }

    /// Onset of the first pulse train whose scan window starts in `[from, to)`
    fn find_pulse_train(
        &self,
        track: &[f64],
        search: &PulseSearch,
        from: usize,
        to: usize,
        block: usize,
    ) -> Result<Option<Onset>> {
        let len = search.pulse_len;
        if track.len() < search.train_len() {
            return Ok(None);
        }
        let hop = (len / 4).max(1);
        let last_start = (track.len() - len).min(to);

        let mut position = from;
        while position <= last_start {
            if search.score(&track[position..position + len]) >= self.scan_threshold() {
                if let Some(onset) = self.refine_onset(track, search, position, block)? {
                    if self.confirm_train(track, search, onset.sample) {
                        return Ok(Some(onset));
                    }
                }
                log::trace!("Rejected sync candidate near sample {}", position);
                position += len;
            } else {
                position += hop;
            }
        }
        Ok(None)
    }

    /// Onset near a coarse hit, from the quadrature correlation envelope
    ///
    /// Correlating against both quadrature templates gives an envelope that
    /// does not depend on the pulse phase or polarity. Its peak places the
    /// blocks. The lines fitted to its flanks meet at a sub-sample position
    /// whose phase bias is the same for every train of a capture, so drift
    /// is measured between those.
    fn refine_onset(
        &self,
        track: &[f64],
        search: &PulseSearch,
        hit: usize,
        block: usize,
    ) -> Result<Option<Onset>> {
        let len = search.pulse_len;
        let reach = if self.config.sync_tolerance { 2 * len } else { len };
        let lo = hit.saturating_sub(reach);
        let hi = (hit + reach + len).min(track.len());
        if hi - lo < len {
            return Ok(None);
        }
        let region = &track[lo..hi];

        let in_phase = self.analyzer.cross_correlate(region, &search.sin, block)?;
        let quadrature = self.analyzer.cross_correlate(region, &search.cos, block)?;
        let envelope: Vec<f64> = in_phase
            .iter()
            .zip(&quadrature)
            .map(|(s, c)| s.hypot(*c))
            .collect();

        let Some(peak) = (0..envelope.len()).max_by(|&a, &b| envelope[a].total_cmp(&envelope[b]))
        else {
            return Ok(None);
        };
        let energy: f64 = region[peak..peak + len].iter().map(|x| x * x).sum();
        if energy <= f64::EPSILON {
            return Ok(None);
        }
        let score = envelope[peak] / (energy.sqrt() * (len as f64 / 2.0).sqrt());
        if score < self.match_threshold() {
            return Ok(None);
        }

        let apex = triangle_apex(&envelope, peak, (len / FLANK_FIT_DIVISOR).max(2));
        Ok(Some(Onset {
            sample: lo + peak,
            fine: lo as f64 + apex,
        }))
    }

    /// Every pulse of the train present and the gaps quieter than the pulses
    fn confirm_train(&self, track: &[f64], search: &PulseSearch, onset: usize) -> bool {
        let len = search.pulse_len;
        (0..search.count).all(|j| {
            let start = onset + (search.period * j as f64).round() as usize;
            let Some(pulse) = track.get(start..start + len) else {
                return false;
            };
            if search.score(pulse) < self.scan_threshold() {
                return false;
            }

            let gap_end = (onset as f64 + search.period * (j + 1) as f64).round() as usize;
            let gap = track.get(start + len..gap_end.min(track.len())).unwrap_or(&[]);
            gap.len() < len / 4 || PulseSearch::rms(gap) < 0.5 * PulseSearch::rms(pulse)
        })
    }

    /// Frequency of the profile's clock block, if it has one
    fn measure_clock(
        &self,
        track: &[f64],
        sample_rate: u32,
        format: &SyncFormat,
        sync: &SyncResult,
    ) -> Result<Option<f64>> {
        let Some(clock) = &self.catalog.clock else {
            return Ok(None);
        };
        let Some(type_index) = self.catalog.type_index(&clock.block) else {
            return Ok(None);
        };
        let timeline = self.catalog.timeline();
        let first_sync = self
            .catalog
            .sync_entries()
            .first()
            .map(|e| e.start_frames)
            .unwrap_or(0.0);
        let Some((index, entry)) = timeline
            .iter()
            .enumerate()
            .find(|(_, e)| e.type_index == type_index)
        else {
            return Ok(None);
        };

        let (start, length) =
            place(entry, first_sync, format, sample_rate, sync.offset, sync.drift);
        if start < 0 || start as usize + length > track.len() || length == 0 {
            log::warn!("{}: clock block outside the capture", sync.role);
            return Ok(None);
        }
        let samples = &track[start as usize..start as usize + length];

        let measured = self.analyzer.measure_frequency(
            samples,
            sample_rate,
            clock.frequency_hz,
            CLOCK_SEARCH_RATIO,
            index,
        )?;
        match measured {
            Some(hz) => log::debug!(
                "{}: clock {:.3}Hz (nominal {:.3}Hz)",
                sync.role,
                hz,
                clock.frequency_hz
            ),
            None => log::warn!(
                "{}: clock tone not found near {:.1}Hz",
                sync.role,
                clock.frequency_hz
            ),
        }
        Ok(measured)
    }
}

/// Fractional lag where the rising and falling flanks of a correlation
/// triangle meet; `peak` itself when the flanks cannot be fitted
fn triangle_apex(envelope: &[f64], peak: usize, width: usize) -> f64 {
    let fallback = peak as f64;
    // Two lags either side of the peak are left out of the fits
    let left_width = width.min(peak.saturating_sub(1));
    let right_width = width.min(envelope.len().saturating_sub(peak + 2));
    if left_width < 2 || right_width < 2 {
        return fallback;
    }

    let left = fit_line(envelope, peak - 1 - left_width..peak - 1);
    let right = fit_line(envelope, peak + 2..peak + 2 + right_width);
    match (left, right) {
        (Some((a1, b1)), Some((a2, b2))) if b1 > 0.0 && b2 < 0.0 => {
            let apex = (a2 - a1) / (b1 - b2);
            if apex.is_finite() {
                apex.clamp(fallback - 2.0, fallback + 2.0)
            } else {
                fallback
            }
        }
        _ => fallback,
    }
}

/// Least-squares `(intercept, slope)` of `values[lag]` over `lags`
fn fit_line(values: &[f64], lags: std::ops::Range<usize>) -> Option<(f64, f64)> {
    let n = lags.len() as f64;
    let (mut sx, mut sy, mut sxx, mut sxy) = (0.0, 0.0, 0.0, 0.0);
    for lag in lags {
        let (x, y) = (lag as f64, *values.get(lag)?);
        sx += x;
        sy += y;
        sxx += x * x;
        sxy += x * y;
    }
    let denom = n * sxx - sx * sx;
    if denom.abs() <= f64::EPSILON {
        return None;
    }
    let slope = (n * sxy - sx * sy) / denom;
    Some(((sy - slope * sx) / n, slope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::PROFILE;
    use crate::catalog::ClockReference;
    use crate::generate::{Generator, GeneratorOptions};
    use approx::assert_abs_diff_eq;

    fn catalog() -> BlockTypeCatalog {
        BlockTypeCatalog::from_json_str(PROFILE).unwrap()
    }

    fn render(catalog: &BlockTypeCatalog, options: GeneratorOptions) -> Signal {
        Generator::new(catalog, options).render().unwrap()
    }

    #[test]
    fn test_exact_offset_without_drift() {
        let catalog = catalog();
        let config = RunConfig::default();
        let analyzer = SpectralAnalyzer::new(&config);
        let sync = Synchronizer::new(&catalog, &config, &analyzer);

        for offset in [0usize, 1234, 7777] {
            let signal = render(
                &catalog,
                GeneratorOptions {
                    lead_in: offset,
                    ..Default::default()
                },
            );
            let result = sync.synchronize(&signal, SignalRole::Reference).unwrap();
            assert_eq!(result.offset, offset);
            assert_eq!(result.end_offset, Some(offset + 48000));
            assert_abs_diff_eq!(result.drift, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_inverted_capture_locks_on_same_onset() {
        let catalog = catalog();
        let config = RunConfig::default();
        let analyzer = SpectralAnalyzer::new(&config);
        let sync = Synchronizer::new(&catalog, &config, &analyzer);

        let signal = render(
            &catalog,
            GeneratorOptions {
                lead_in: 1000,
                ..Default::default()
            },
        );
        let inverted: Vec<f64> = signal.channel(0).unwrap().iter().map(|s| -s).collect();
        let inverted = Signal::mono(inverted, 48000).unwrap();

        let normal = sync.synchronize(&signal, SignalRole::Reference).unwrap();
        let flipped = sync.synchronize(&inverted, SignalRole::Comparison).unwrap();
        assert_eq!(normal.offset, 1000);
        assert_eq!(flipped.offset, 1000);
        assert_eq!(flipped.end_offset, normal.end_offset);
        assert_abs_diff_eq!(flipped.drift, normal.drift, epsilon = 1e-9);
    }

    #[test]
    fn test_onset_independent_of_pulse_phase() {
        let catalog = catalog();
        let config = RunConfig::default();
        let analyzer = SpectralAnalyzer::new(&config);
        let sync = Synchronizer::new(&catalog, &config, &analyzer);

        // NTSC train: 960-sample 8 kHz pulses every 1920 samples
        let omega = 2.0 * PI * 8000.0 / 48000.0;
        for phase in [PI / 2.0, 1.0, PI] {
            let mut track = vec![0.0; 60000];
            for j in 0..4 {
                let onset = 1000 + 1920 * j;
                for n in 0..960 {
                    track[onset + n] = 0.5 * (omega * n as f64 + phase).sin();
                }
            }
            let signal = Signal::mono(track, 48000).unwrap();
            let result = sync.synchronize(&signal, SignalRole::Reference).unwrap();
            assert_eq!(result.offset, 1000, "phase {}", phase);
        }
    }

    #[test]
    fn test_drift_from_sync_spacing() {
        let catalog = catalog();
        let config = RunConfig::default();
        let analyzer = SpectralAnalyzer::new(&config);
        let sync = Synchronizer::new(&catalog, &config, &analyzer);

        let signal = render(
            &catalog,
            GeneratorOptions {
                lead_in: 500,
                drift: 1.002,
                ..Default::default()
            },
        );
        let result = sync.synchronize(&signal, SignalRole::Comparison).unwrap();
        // Pulses are shorter than the template, so the envelope peak is flat
        // over a couple of samples
        assert!(result.offset.abs_diff(500) <= 2, "offset {}", result.offset);
        assert_abs_diff_eq!(result.drift, 1.002, epsilon = 1e-4);
    }

    #[test]
    fn test_ignore_framerate_difference() {
        let catalog = catalog();
        let config = RunConfig {
            ignore_framerate_difference: true,
            ..Default::default()
        };
        let analyzer = SpectralAnalyzer::new(&config);
        let sync = Synchronizer::new(&catalog, &config, &analyzer);

        let signal = render(
            &catalog,
            GeneratorOptions {
                drift: 1.002,
                ..Default::default()
            },
        );
        let result = sync.synchronize(&signal, SignalRole::Comparison).unwrap();
        assert_eq!(result.drift, 1.0);
        assert_eq!(result.end_offset, None);
    }

    #[test]
    fn test_clock_overrides_spacing() {
        let mut catalog = catalog();
        catalog.clock = Some(ClockReference {
            block: "Tone".into(),
            frequency_hz: 1000.0,
        });
        let config = RunConfig::default();
        let analyzer = SpectralAnalyzer::new(&config);
        let sync = Synchronizer::new(&catalog, &config, &analyzer);

        let signal = render(
            &catalog,
            GeneratorOptions {
                drift: 1.001,
                ..Default::default()
            },
        );
        let result = sync.synchronize(&signal, SignalRole::Comparison).unwrap();
        let clock = result.clock_hz.unwrap();
        assert!((clock - 1001.0).abs() < 0.5, "clock {}", clock);
        assert_abs_diff_eq!(result.drift, clock / 1000.0, epsilon = 1e-12);
    }

    #[test]
    fn test_silence_has_no_sync() {
        let catalog = catalog();
        let config = RunConfig::default();
        let analyzer = SpectralAnalyzer::new(&config);
        let sync = Synchronizer::new(&catalog, &config, &analyzer);

        let signal = Signal::mono(vec![0.0; 96000], 48000).unwrap();
        let err = sync.synchronize(&signal, SignalRole::Comparison).unwrap_err();
        assert!(matches!(
            err,
            MdfError::SyncNotFound {
                signal: SignalRole::Comparison
            }
        ));
    }

    #[test]
    fn test_steady_tone_is_not_a_pulse_train() {
        let catalog = catalog();
        let config = RunConfig::default();
        let analyzer = SpectralAnalyzer::new(&config);
        let sync = Synchronizer::new(&catalog, &config, &analyzer);

        let tone: Vec<f64> = (0..96000)
            .map(|i| 0.5 * (2.0 * PI * 8000.0 * i as f64 / 48000.0).sin())
            .collect();
        let signal = Signal::mono(tone, 48000).unwrap();
        assert!(sync.synchronize(&signal, SignalRole::Reference).is_err());
    }

    #[test]
    fn test_framerate_ratio() {
        let base = SyncResult {
            role: SignalRole::Reference,
            format: 0,
            offset: 0,
            drift: 1.0,
            end_offset: None,
            clock_hz: None,
        };
        let pair = SyncPair {
            reference: base.clone(),
            comparison: SyncResult {
                role: SignalRole::Comparison,
                drift: 1.01,
                ..base
            },
        };
        assert_abs_diff_eq!(pair.framerate_ratio(), 1.01);
    }
}
