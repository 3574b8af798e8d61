//! Synthetic captures rendered from a profile
//!
//! Used for self-tests and for reproducing hardware artifacts: lead-in,
//! frame-rate drift, extra tones and seeded noise.

use crate::block::place;
use crate::catalog::{BlockKind, BlockTypeCatalog};
use crate::signal::Signal;
use crate::spectral::from_db;
use crate::{MdfError, Result};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::f64::consts::PI;
use std::path::Path;

/// Rendering options
#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    pub sample_rate: u32,
    /// Sync format (profile index) to render with
    pub format: usize,
    /// Silent samples before the first block
    pub lead_in: usize,
    /// Silent samples after the last block
    pub tail: usize,
    /// Clock speed over nominal; scales timing and pitch
    pub drift: f64,
    /// Level of every block tone (dBFS)
    pub tone_db: f64,
    /// Level of the sync pulses (dBFS)
    pub pulse_db: f64,
    /// Additional (frequency, dBFS) tones mixed into regular blocks
    pub extra_tones: Vec<(f64, f64)>,
    /// Render watermarks with their valid frequency
    pub watermark_valid: bool,
    /// Peak level of uniform noise over the whole capture (dBFS)
    pub noise_db: Option<f64>,
    pub seed: u64,
    pub channels: usize,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            format: 0,
            lead_in: 0,
            tail: 4800,
            drift: 1.0,
            tone_db: -6.0,
            pulse_db: -6.0,
            extra_tones: Vec::new(),
            watermark_valid: true,
            noise_db: None,
            seed: 0,
            channels: 1,
        }
    }
}

/// Renders a profile timeline to a capture
pub struct Generator<'a> {
    catalog: &'a BlockTypeCatalog,
    options: GeneratorOptions,
}

impl<'a> Generator<'a> {
    pub fn new(catalog: &'a BlockTypeCatalog, options: GeneratorOptions) -> Self {
        Self { catalog, options }
    }

    pub fn render(&self) -> Result<Signal> {
        let options = &self.options;
        if options.sample_rate == 0 || options.channels == 0 || !(options.drift > 0.0) {
            return Err(MdfError::InvalidArgument(
                "generator needs a sample rate, a channel and a positive drift".into(),
            ));
        }

        let format = self.catalog.sync_format(options.format)?;
        let rate = options.sample_rate;
        let first_sync = self
            .catalog
            .sync_entries()
            .first()
            .map(|e| e.start_frames)
            .ok_or_else(|| MdfError::Profile("no sync block in profile".into()))?;

        let mut placed = Vec::new();
        for entry in self.catalog.timeline() {
            let (start, length) =
                place(&entry, first_sync, format, rate, options.lead_in, options.drift);
            if start < 0 {
                return Err(MdfError::InvalidArgument(format!(
                    "lead-in of {} samples too short for blocks before the first sync",
                    options.lead_in
                )));
            }
            placed.push((entry, start as usize, length));
        }

        let end = placed.iter().map(|(_, start, length)| start + length).max().unwrap_or(0);
        let mut samples = vec![0.0; end + options.tail];

        for (entry, start, length) in &placed {
            let block = &self.catalog.blocks[entry.type_index];
            let region = &mut samples[*start..start + length];
            match &block.kind {
                BlockKind::Sync => {
                    let pulse = &format.pulse;
                    let drift = options.drift;
                    let pulse_samples = format.frames_to_samples(pulse.pulse_frames, rate);
                    let pulse_len = (pulse_samples / drift).round() as usize;
                    let period = format.frames_to_samples(pulse.period_frames(), rate) / drift;
                    let frequency = pulse.frequency_hz * drift;
                    for j in 0..pulse.count {
                        let onset = (period * j as f64).round() as usize;
                        let stop = (onset + pulse_len).min(region.len());
                        if onset < stop {
                            add_tone(&mut region[onset..stop], frequency, options.pulse_db, rate);
                        }
                    }
                }
                BlockKind::Silence => {}
                BlockKind::Regular { frequencies } => {
                    for &frequency in frequencies {
                        add_tone(region, frequency * options.drift, options.tone_db, rate);
                    }
                    for &(frequency, db) in &options.extra_tones {
                        add_tone(region, frequency * options.drift, db, rate);
                    }
                }
                BlockKind::Watermark { valid_hz, invalid_hz } => {
                    let frequency = if options.watermark_valid { *valid_hz } else { *invalid_hz };
                    add_tone(region, frequency * options.drift, options.tone_db, rate);
                }
            }
        }

        if let Some(noise_db) = options.noise_db {
            let amplitude = from_db(noise_db);
            let mut rng = ChaCha8Rng::seed_from_u64(options.seed);
            for s in samples.iter_mut() {
                *s += amplitude * (rng.random::<f64>() * 2.0 - 1.0);
            }
        }

        log::debug!(
            "Rendered '{}': {} samples @ {}Hz, drift {}",
            self.catalog.name,
            samples.len(),
            rate,
            options.drift
        );
        Signal::new(
            vec![samples; options.channels],
            rate,
            format!("generated:{}", self.catalog.name),
        )
    }
}

/// Add a sine starting at phase zero on the region's first sample
fn add_tone(region: &mut [f64], frequency: f64, db: f64, sample_rate: u32) {
    let amplitude = from_db(db);
    let omega = 2.0 * PI * frequency / sample_rate as f64;
    for (n, s) in region.iter_mut().enumerate() {
        *s += amplitude * (omega * n as f64).sin();
    }
}

/// Write a capture as 32-bit float WAV
pub fn write_wav<P: AsRef<Path>>(signal: &Signal, path: P) -> Result<()> {
    let path = path.as_ref();
    let write_err = |e: hound::Error| MdfError::Load(format!("{}: {}", path.display(), e));

    let spec = hound::WavSpec {
        channels: signal.num_channels() as u16,
        sample_rate: signal.sample_rate(),
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec).map_err(write_err)?;
    for frame in 0..signal.num_frames() {
        for channel in signal.channels() {
            writer.write_sample(channel[frame] as f32).map_err(write_err)?;
        }
    }
    writer.finalize().map_err(write_err)?;

    log::info!("Wrote {} ({:.3}s)", path.display(), signal.duration());
    Ok(())
}
