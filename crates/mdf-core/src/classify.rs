//! Per-block difference classification

use crate::block::Block;
use crate::catalog::{BlockKind, ExtraData};
use crate::config::RunConfig;
use crate::spectral::{SpectralBin, Spectrum};
use serde::{Deserialize, Serialize};

/// A frequency present on one side only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyDifference {
    pub frequency: f64,
    /// Relative dBFS on the side where it is present
    pub magnitude: f64,
    pub hi_diff: bool,
}

/// A frequency present on both sides at different levels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmplitudeDifference {
    /// Reference frequency
    pub frequency: f64,
    pub reference: f64,
    pub comparison: f64,
    /// comparison - reference (dB)
    pub delta: f64,
    pub hi_diff: bool,
}

/// A frequency present on both sides, within the bar tolerance or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedFrequency {
    /// Reference frequency
    pub frequency: f64,
    pub reference: f64,
    pub comparison: f64,
    /// comparison - reference (dB)
    pub delta: f64,
}

/// What a watermark block encodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkState {
    Valid,
    Invalid,
    Indeterminate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkCheck {
    pub reference: WatermarkState,
    pub comparison: WatermarkState,
    pub passed: bool,
}

/// Differences found in one block pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDifference {
    pub index: usize,
    pub name: String,
    pub kind: String,
    pub repetition: usize,
    pub missing: Vec<FrequencyDifference>,
    pub extra: Vec<FrequencyDifference>,
    pub amplitude: Vec<AmplitudeDifference>,
    /// Every reference frequency found in the comparison
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matched: Vec<MatchedFrequency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watermark: Option<WatermarkCheck>,
}

impl BlockDifference {
    fn empty(block: &Block) -> Self {
        Self {
            index: block.index,
            name: block.name.clone(),
            kind: block.kind.label().to_string(),
            repetition: block.repetition,
            missing: Vec::new(),
            extra: Vec::new(),
            amplitude: Vec::new(),
            matched: Vec::new(),
            watermark: None,
        }
    }

    pub fn has_differences(&self) -> bool {
        !self.missing.is_empty()
            || !self.extra.is_empty()
            || !self.amplitude.is_empty()
            || self.watermark.as_ref().is_some_and(|w| !w.passed)
    }

    /// High-severity entries across all lists
    pub fn hi_diff_count(&self) -> usize {
        self.missing.iter().filter(|d| d.hi_diff).count()
            + self.extra.iter().filter(|d| d.hi_diff).count()
            + self.amplitude.iter().filter(|d| d.hi_diff).count()
    }
}

/// Block-level facts the classifier needs besides the two spectra
#[derive(Debug, Clone, Copy)]
pub struct BlockContext<'a> {
    pub block: &'a Block,
    /// Maps reference frequencies onto the comparison capture
    pub frequency_scale: f64,
    /// Harmless artifact frequencies (reference domain)
    pub extra_data: Option<&'a ExtraData>,
}

/// Compares two normalized spectra of the same block
#[derive(Debug, Clone)]
pub struct DifferenceClassifier {
    significant_amplitude: f64,
    bar_tolerance: f64,
    amplitude_hi_diff: f64,
    missing_hi_diff: f64,
    extra_hi_diff: f64,
    use_extra_data: bool,
}

impl DifferenceClassifier {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            significant_amplitude: config.significant_amplitude,
            bar_tolerance: config.amplitude_bar_tolerance,
            amplitude_hi_diff: config.amplitude_hi_diff,
            missing_hi_diff: config.missing_hi_diff,
            extra_hi_diff: config.extra_hi_diff,
            use_extra_data: config.use_extra_data,
        }
    }

    /// Strictly above the significance level
    pub fn is_significant(&self, magnitude: f64) -> bool {
        magnitude > self.significant_amplitude
    }

    pub fn classify(
        &self,
        reference: &Spectrum,
        comparison: &Spectrum,
        context: &BlockContext,
    ) -> BlockDifference {
        let mut diff = BlockDifference::empty(context.block);
        let scale = context.frequency_scale;

        match &context.block.kind {
            BlockKind::Sync => {}
            BlockKind::Watermark { valid_hz, invalid_hz } => {
                let reference_state = self.watermark_state(reference, *valid_hz, *invalid_hz);
                let comparison_state =
                    self.watermark_state(comparison, valid_hz * scale, invalid_hz * scale);
                diff.watermark = Some(WatermarkCheck {
                    reference: reference_state,
                    comparison: comparison_state,
                    passed: comparison_state == WatermarkState::Valid,
                });
            }
            BlockKind::Silence | BlockKind::Regular { .. } => {
                self.compare_bins(reference, comparison, context, &mut diff);
            }
        }

        diff
    }

    fn compare_bins(
        &self,
        reference: &Spectrum,
        comparison: &Spectrum,
        context: &BlockContext,
        diff: &mut BlockDifference,
    ) {
        let scale = context.frequency_scale;
        let tolerance = 0.5 * (reference.resolution_hz * scale).max(comparison.resolution_hz);

        for bin in reference.bins.iter().filter(|b| self.is_significant(b.magnitude)) {
            match self.find_present(comparison, bin.frequency * scale, tolerance) {
                Some(index) => {
                    let other = comparison.bins[index].magnitude;
                    let delta = other - bin.magnitude;
                    diff.matched.push(MatchedFrequency {
                        frequency: bin.frequency,
                        reference: bin.magnitude,
                        comparison: other,
                        delta,
                    });
                    if delta.abs() > self.bar_tolerance {
                        diff.amplitude.push(AmplitudeDifference {
                            frequency: bin.frequency,
                            reference: bin.magnitude,
                            comparison: other,
                            delta,
                            hi_diff: delta.abs() > self.amplitude_hi_diff,
                        });
                    }
                }
                None => diff.missing.push(FrequencyDifference {
                    frequency: bin.frequency,
                    magnitude: bin.magnitude,
                    hi_diff: bin.magnitude > self.missing_hi_diff,
                }),
            }
        }

        // Extras are looked up in the reference domain
        let reverse_tolerance = tolerance / scale;
        let extra_data = context.extra_data.filter(|_| self.use_extra_data);
        for bin in comparison.bins.iter().filter(|b| self.is_significant(b.magnitude)) {
            let frequency = bin.frequency / scale;
            if self.find_present(reference, frequency, reverse_tolerance).is_some() {
                continue;
            }
            if extra_data.is_some_and(|e| e.contains(frequency)) {
                continue;
            }
            diff.extra.push(FrequencyDifference {
                frequency: bin.frequency,
                magnitude: bin.magnitude,
                hi_diff: bin.magnitude > self.extra_hi_diff,
            });
        }
    }

    /// Index of the closest present bin within `tolerance` Hz
    fn find_present(&self, spectrum: &Spectrum, frequency: f64, tolerance: f64) -> Option<usize> {
        let split = spectrum.bins.partition_point(|b| b.frequency < frequency);
        let distance = |b: &SpectralBin| (b.frequency - frequency).abs();

        [split.checked_sub(1), Some(split)]
            .into_iter()
            .flatten()
            .filter_map(|i| spectrum.bins.get(i).map(|b| (i, b)))
            .filter(|(_, b)| distance(b) <= tolerance && self.is_significant(b.magnitude))
            .min_by(|a, b| distance(a.1).total_cmp(&distance(b.1)))
            .map(|(i, _)| i)
    }

    fn watermark_state(
        &self,
        spectrum: &Spectrum,
        valid_hz: f64,
        invalid_hz: f64,
    ) -> WatermarkState {
        let tolerance = (0.5 * spectrum.resolution_hz).max(f64::EPSILON);
        let present = |f: f64| self.find_present(spectrum, f, tolerance).is_some();
        match (present(valid_hz), present(invalid_hz)) {
            (true, false) => WatermarkState::Valid,
            (false, true) => WatermarkState::Invalid,
            _ => WatermarkState::Indeterminate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn block(kind: BlockKind) -> Block {
        Block {
            index: 2,
            type_index: 1,
            repetition: 0,
            name: "Tone".into(),
            kind,
            start: 0,
            length: 48000,
        }
    }

    fn regular() -> Block {
        block(BlockKind::Regular {
            frequencies: vec![1000.0],
        })
    }

    fn context(block: &Block) -> BlockContext<'_> {
        BlockContext {
            block,
            frequency_scale: 1.0,
            extra_data: None,
        }
    }

    #[test]
    fn test_threshold_boundary() {
        let classifier = DifferenceClassifier::new(&RunConfig::default());
        assert!(!classifier.is_significant(-60.0));
        assert!(classifier.is_significant(-59.0));

        let block = regular();
        let reference = Spectrum::from_pairs(&[(1000.0, -20.0)], 1.0);
        let comparison =
            Spectrum::from_pairs(&[(1000.0, -20.0), (2000.0, -60.0), (4000.0, -59.0)], 1.0);
        let diff = classifier.classify(&reference, &comparison, &context(&block));

        assert_eq!(diff.extra.len(), 1);
        assert_eq!(diff.extra[0].frequency, 4000.0);
    }

    #[test]
    fn test_amplitude_and_extra() {
        let classifier = DifferenceClassifier::new(&RunConfig::default().with_bar_tolerance(1.0));
        let block = regular();
        let reference = Spectrum::from_pairs(&[(1000.0, -20.0)], 1.0);
        let comparison = Spectrum::from_pairs(&[(1000.0, -22.0), (3000.0, -30.0)], 1.0);

        let diff = classifier.classify(&reference, &comparison, &context(&block));

        assert!(diff.missing.is_empty());
        assert_eq!(diff.amplitude.len(), 1);
        assert_eq!(diff.amplitude[0].frequency, 1000.0);
        assert_abs_diff_eq!(diff.amplitude[0].delta, -2.0);
        assert!(!diff.amplitude[0].hi_diff);
        assert_eq!(diff.extra.len(), 1);
        assert_eq!(diff.extra[0].frequency, 3000.0);
        assert!(diff.extra[0].hi_diff);
        assert!(diff.has_differences());

        assert_eq!(diff.matched.len(), 1);
        assert_eq!(diff.matched[0].comparison, -22.0);
        assert_abs_diff_eq!(diff.matched[0].delta, -2.0);
    }

    #[test]
    fn test_extra_uses_reverse_lookup() {
        let classifier = DifferenceClassifier::new(&RunConfig::default());
        let block = regular();
        let reference = Spectrum::from_pairs(&[(1000.0, -20.0)], 1.0);
        // Both comparison bins sit within half a bin of the reference tone
        let comparison = Spectrum::from_pairs(&[(999.8, -20.0), (1000.4, -40.0)], 1.0);

        let diff = classifier.classify(&reference, &comparison, &context(&block));
        assert!(diff.extra.is_empty(), "{:?}", diff.extra);
        assert!(diff.missing.is_empty());
        assert_eq!(diff.matched[0].comparison, -20.0);
    }

    #[test]
    fn test_extra_mapped_back_by_scale() {
        let classifier = DifferenceClassifier::new(&RunConfig::default());
        let block = regular();
        // Comparison bins are 2 Hz wide and run 1% fast
        let reference = Spectrum::from_pairs(&[(1000.0, -20.0), (1002.0, -30.0)], 2.0);
        let comparison = Spectrum::from_pairs(
            &[(1010.0, -20.0), (1012.02, -30.0), (1500.0, -35.0)],
            2.02,
        );
        let scaled = BlockContext {
            frequency_scale: 1.01,
            ..context(&block)
        };

        let diff = classifier.classify(&reference, &comparison, &scaled);
        assert!(diff.missing.is_empty());
        assert_eq!(diff.matched.len(), 2);
        assert_eq!(diff.extra.len(), 1);
        assert_eq!(diff.extra[0].frequency, 1500.0);
    }

    #[test]
    fn test_missing_below_threshold() {
        let classifier = DifferenceClassifier::new(&RunConfig::default());
        let block = regular();
        let reference = Spectrum::from_pairs(&[(1000.0, -20.0), (5000.0, -55.0)], 1.0);
        let comparison = Spectrum::from_pairs(&[(1000.0, -20.5), (5000.0, -65.0)], 1.0);

        let diff = classifier.classify(&reference, &comparison, &context(&block));

        assert!(diff.amplitude.is_empty());
        assert_eq!(diff.missing.len(), 1);
        assert_eq!(diff.missing[0].frequency, 5000.0);
        assert!(!diff.missing[0].hi_diff);
        assert!(diff.extra.is_empty());
    }

    #[test]
    fn test_hi_diff_amplitude() {
        let classifier = DifferenceClassifier::new(&RunConfig::default());
        let block = regular();
        let reference = Spectrum::from_pairs(&[(1000.0, -10.0)], 1.0);
        let comparison = Spectrum::from_pairs(&[(1000.0, -17.0)], 1.0);

        let diff = classifier.classify(&reference, &comparison, &context(&block));
        assert!(diff.amplitude[0].hi_diff);
        assert_eq!(diff.hi_diff_count(), 1);
    }

    #[test]
    fn test_frequency_scale_matching() {
        let classifier = DifferenceClassifier::new(&RunConfig::default());
        let block = regular();
        let reference = Spectrum::from_pairs(&[(1000.0, -20.0)], 1.0);
        let comparison = Spectrum::from_pairs(&[(1010.0, -20.0)], 1.0);

        let unscaled = classifier.classify(&reference, &comparison, &context(&block));
        assert_eq!(unscaled.missing.len(), 1);
        assert_eq!(unscaled.extra.len(), 1);

        let scaled = BlockContext {
            frequency_scale: 1.01,
            ..context(&block)
        };
        let diff = classifier.classify(&reference, &comparison, &scaled);
        assert!(!diff.has_differences());
    }

    #[test]
    fn test_extra_data_suppression() {
        let extra = ExtraData {
            frequencies: vec![60.0],
            tolerance_hz: 1.0,
        };
        let block = regular();
        let reference = Spectrum::from_pairs(&[(1000.0, -20.0)], 1.0);
        let comparison = Spectrum::from_pairs(&[(60.0, -40.0), (1000.0, -20.0)], 1.0);
        let with_extra = BlockContext {
            extra_data: Some(&extra),
            ..context(&block)
        };

        let classifier = DifferenceClassifier::new(&RunConfig::default());
        assert!(!classifier.classify(&reference, &comparison, &with_extra).has_differences());

        let config = RunConfig {
            use_extra_data: false,
            ..Default::default()
        };
        let classifier = DifferenceClassifier::new(&config);
        assert_eq!(classifier.classify(&reference, &comparison, &with_extra).extra.len(), 1);
    }

    #[test]
    fn test_watermark_states() {
        let classifier = DifferenceClassifier::new(&RunConfig::default());
        let block = block(BlockKind::Watermark {
            valid_hz: 3000.0,
            invalid_hz: 5000.0,
        });
        let valid = Spectrum::from_pairs(&[(3000.0, 0.0), (5000.0, -80.0)], 1.0);
        let invalid = Spectrum::from_pairs(&[(5000.0, 0.0)], 1.0);
        let both = Spectrum::from_pairs(&[(3000.0, 0.0), (5000.0, -3.0)], 1.0);

        let diff = classifier.classify(&valid, &valid, &context(&block));
        let check = diff.watermark.as_ref().unwrap();
        assert_eq!(check.comparison, WatermarkState::Valid);
        assert!(check.passed);
        assert!(diff.missing.is_empty() && diff.extra.is_empty());
        assert!(!diff.has_differences());

        let diff = classifier.classify(&valid, &invalid, &context(&block));
        assert_eq!(diff.watermark.as_ref().unwrap().comparison, WatermarkState::Invalid);
        assert!(diff.has_differences());

        let diff = classifier.classify(&valid, &both, &context(&block));
        assert_eq!(diff.watermark.as_ref().unwrap().comparison, WatermarkState::Indeterminate);
        assert!(!diff.watermark.unwrap().passed);
    }

    #[test]
    fn test_self_compare_is_clean() {
        let classifier = DifferenceClassifier::new(&RunConfig::default());
        let block = regular();
        let spectrum = Spectrum::from_pairs(
            &[(100.0, -40.0), (1000.0, 0.0), (1500.0, -59.5), (2000.0, -70.0)],
            1.0,
        );
        let diff = classifier.classify(&spectrum, &spectrum, &context(&block));
        assert!(!diff.has_differences());
        assert_eq!(diff.matched.len(), 3);
    }
}
