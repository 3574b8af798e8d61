//! Full comparison run: sync, layout, spectra, classification

use crate::block::{paired_lengths, Block, BlockLayout};
use crate::catalog::{BlockKind, BlockTypeCatalog};
use crate::classify::{BlockContext, BlockDifference, DifferenceClassifier};
use crate::config::RunConfig;
use crate::report::{DifferenceReport, ResultAggregator};
use crate::signal::{ChannelMix, Signal};
use crate::spectral::{RawSpectrum, SpectralAnalyzer};
use crate::sync::{SyncPair, Synchronizer};
use crate::{MdfError, Result, SignalRole};
use rayon::prelude::*;

/// Raw spectra of one block pair
struct BlockSpectra {
    index: usize,
    reference: RawSpectrum,
    comparison: RawSpectrum,
}

impl BlockSpectra {
    /// Maps reference frequencies onto the comparison bins
    fn frequency_scale(&self) -> f64 {
        self.comparison.resolution_hz / self.reference.resolution_hz
    }
}

/// Compares a reference capture against a comparison capture
pub struct SpectralCompare<'a> {
    catalog: &'a BlockTypeCatalog,
    config: &'a RunConfig,
    analyzer: SpectralAnalyzer,
    classifier: DifferenceClassifier,
}

impl<'a> SpectralCompare<'a> {
    /// Validate inputs and prepare the analyzer
    pub fn new(catalog: &'a BlockTypeCatalog, config: &'a RunConfig) -> Result<Self> {
        catalog.validate()?;
        config.validate()?;
        catalog.sync_format(config.reference_format)?;
        catalog.sync_format(config.comparison_format)?;

        Ok(Self {
            catalog,
            config,
            analyzer: SpectralAnalyzer::new(config),
            classifier: DifferenceClassifier::new(config),
        })
    }

    pub fn analyzer(&self) -> &SpectralAnalyzer {
        &self.analyzer
    }

    /// Run the comparison, on a dedicated pool when a thread count is set
    pub fn run(&self, reference: &Signal, comparison: &Signal) -> Result<DifferenceReport> {
        match self.config.threads {
            Some(threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .map_err(|e| MdfError::InvalidArgument(format!("thread pool: {}", e)))?;
                pool.install(|| self.run_blocks(reference, comparison))
            }
            None => self.run_blocks(reference, comparison),
        }
    }

    /// Sync both captures without comparing blocks
    pub fn synchronize(&self, reference: &Signal, comparison: &Signal) -> Result<SyncPair> {
        Synchronizer::new(self.catalog, self.config, &self.analyzer)
            .synchronize_pair(reference, comparison)
    }

    fn run_blocks(&self, reference: &Signal, comparison: &Signal) -> Result<DifferenceReport> {
        let sync = self.synchronize(reference, comparison)?;
        let (reference_layout, comparison_layout) = self.layouts(reference, comparison, &sync)?;

        let reference_track = ChannelMix::prepare(reference, self.config);
        let comparison_track = ChannelMix::prepare(comparison, self.config);

        let pairs: Vec<(&Block, &Block)> = reference_layout
            .compared()
            .zip(comparison_layout.compared())
            .collect();
        log::info!("Analyzing {} block pairs", pairs.len());

        let stretch = comparison_track.sample_rate() as f64
            / (reference_track.sample_rate() as f64 * sync.framerate_ratio());
        let spectra: Vec<BlockSpectra> = pairs
            .par_iter()
            .map(|(r, c)| {
                let reference_samples = r.samples(reference_track.samples());
                let comparison_samples = c.samples(comparison_track.samples());
                let (reference_len, comparison_len) = paired_lengths(
                    reference_samples.len(),
                    comparison_samples.len(),
                    stretch,
                    self.config.compress_to_blocks,
                );
                let (reference_fft, comparison_fft) = self.analyzer.paired_fft_lengths(
                    reference_len,
                    comparison_len,
                    reference_track.sample_rate(),
                    stretch,
                );
                log::trace!(
                    "Block {}: {} vs {} samples, {} vs {} bins",
                    r.index,
                    reference_len,
                    comparison_len,
                    reference_fft,
                    comparison_fft
                );

                Ok(BlockSpectra {
                    index: r.index,
                    reference: self.analyzer.transform_padded(
                        &reference_samples[..reference_len],
                        reference_track.sample_rate(),
                        reference_fft,
                        r.index,
                    )?,
                    comparison: self.analyzer.transform_padded(
                        &comparison_samples[..comparison_len],
                        comparison_track.sample_rate(),
                        comparison_fft,
                        c.index,
                    )?,
                })
            })
            .collect::<Result<_>>()?;

        let reference_floor = self.noise_floor(&reference_layout, &spectra, SignalRole::Reference);
        let comparison_floor =
            self.noise_floor(&reference_layout, &spectra, SignalRole::Comparison);

        let extra_data = Some(&self.catalog.extra_data).filter(|e| !e.frequencies.is_empty());

        let diffs: Vec<BlockDifference> = spectra
            .par_iter()
            .filter_map(|pair| reference_layout.get(pair.index).map(|block| (block, pair)))
            .map(|(block, pair)| {
                let scale = pair.frequency_scale();
                let fundamentals = block.kind.fundamentals();
                let scaled: Vec<f64> = fundamentals.iter().map(|f| f * scale).collect();

                let reference_offset = self
                    .analyzer
                    .normalization_offset(&pair.reference, fundamentals, None, 1.0);
                let comparison_offset = self.analyzer.normalization_offset(
                    &pair.comparison,
                    &scaled,
                    Some(&pair.reference),
                    scale,
                );

                let reference_spectrum = self
                    .analyzer
                    .finish(&pair.reference, reference_offset, reference_floor);
                let comparison_spectrum = self
                    .analyzer
                    .finish(&pair.comparison, comparison_offset, comparison_floor);

                let context = BlockContext {
                    block,
                    frequency_scale: scale,
                    extra_data,
                };
                self.classifier
                    .classify(&reference_spectrum, &comparison_spectrum, &context)
            })
            .collect();

        let mut aggregator = ResultAggregator::new(self.catalog.name.clone(), sync);
        for diff in diffs {
            aggregator.record(diff);
        }
        let report = aggregator.finish();
        log::info!("{}", report.summary());
        Ok(report)
    }

    fn layouts(
        &self,
        reference: &Signal,
        comparison: &Signal,
        sync: &SyncPair,
    ) -> Result<(BlockLayout, BlockLayout)> {
        let reference_layout = BlockLayout::for_signal(
            self.catalog,
            self.catalog.sync_format(self.config.reference_format)?,
            reference.sample_rate(),
            &sync.reference,
            reference.num_frames(),
            SignalRole::Reference,
        )?;
        let comparison_layout = BlockLayout::for_signal(
            self.catalog,
            self.catalog.sync_format(self.config.comparison_format)?,
            comparison.sample_rate(),
            &sync.comparison,
            comparison.num_frames(),
            SignalRole::Comparison,
        )?;
        Ok((reference_layout, comparison_layout))
    }

    /// Loudest silence-block level of one capture (absolute dBFS)
    fn noise_floor(
        &self,
        layout: &BlockLayout,
        spectra: &[BlockSpectra],
        role: SignalRole,
    ) -> Option<f64> {
        if self.config.ignore_noise_floor {
            return None;
        }

        let floor = spectra
            .iter()
            .filter(|s| layout.get(s.index).is_some_and(|b| b.kind == BlockKind::Silence))
            .filter_map(|s| {
                let raw = match role {
                    SignalRole::Reference => &s.reference,
                    SignalRole::Comparison => &s.comparison,
                };
                raw.absolute_peak_db(self.config.start_hz, self.config.end_hz)
            })
            .reduce(f64::max);

        if let Some(db) = floor {
            log::debug!("{} noise floor {:.2} dBFS", role, db);
        }
        floor
    }
}
