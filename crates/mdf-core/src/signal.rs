//! Captured signals and channel mixing

use crate::config::{Channel, RunConfig};
use crate::{MdfError, Result};
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// One capture: planar samples in [-1, 1]
#[derive(Debug, Clone)]
pub struct Signal {
    channels: Vec<Vec<f64>>,
    sample_rate: u32,
    source: String,
}

impl Signal {
    /// Build a signal from planar channel data
    pub fn new(
        channels: Vec<Vec<f64>>,
        sample_rate: u32,
        source: impl Into<String>,
    ) -> Result<Self> {
        if channels.is_empty() {
            return Err(MdfError::InvalidArgument("signal has no channels".into()));
        }
        if sample_rate == 0 {
            return Err(MdfError::InvalidArgument("sample rate must be greater than zero".into()));
        }
        let frames = channels[0].len();
        if channels.iter().any(|ch| ch.len() != frames) {
            return Err(MdfError::InvalidArgument("channels differ in length".into()));
        }

        Ok(Self {
            channels,
            sample_rate,
            source: source.into(),
        })
    }

    /// Single-channel signal
    pub fn mono(samples: Vec<f64>, sample_rate: u32) -> Result<Self> {
        Self::new(vec![samples], sample_rate, "memory")
    }

    /// Load a capture; WAV through hound, other PCM containers through symphonia
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let is_wav = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("wav"))
            .unwrap_or(false);

        let signal = if is_wav {
            Self::load_wav(path)?
        } else {
            Self::load_symphonia(path)?
        };

        log::info!(
            "Loaded {}: {} channel(s), {}Hz, {:.3}s",
            signal.source,
            signal.num_channels(),
            signal.sample_rate,
            signal.duration()
        );
        Ok(signal)
    }

    fn load_wav(path: &Path) -> Result<Self> {
        let source = path.display().to_string();
        let load_err = |e: hound::Error| MdfError::Load(format!("{}: {}", source, e));

        let reader = hound::WavReader::open(path).map_err(load_err)?;
        let spec = reader.spec();
        let num_channels = spec.channels as usize;

        let interleaved: Vec<f64> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .map(|s| s.map(f64::from))
                .collect::<std::result::Result<_, _>>()
                .map_err(load_err)?,
            hound::SampleFormat::Int => {
                let full_scale = (1i64 << (spec.bits_per_sample - 1)) as f64;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f64 / full_scale))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(load_err)?
            }
        };

        Self::new(deinterleave(&interleaved, num_channels), spec.sample_rate, source)
    }

    fn load_symphonia(path: &Path) -> Result<Self> {
        let source = path.display().to_string();
        let load_err =
            |e: symphonia::core::errors::Error| MdfError::Load(format!("{}: {}", source, e));

        let file = std::fs::File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(load_err)?;
        let mut format = probed.format;

        let track = format
            .default_track()
            .ok_or_else(|| MdfError::Load(format!("{}: no audio track", source)))?;
        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| MdfError::Load(format!("{}: unknown sample rate", source)))?;
        let num_channels = track
            .codec_params
            .channels
            .map(|c| c.count())
            .ok_or_else(|| MdfError::Load(format!("{}: unknown channels", source)))?;
        let track_id = track.id;

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(load_err)?;

        let mut interleaved = Vec::new();
        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(symphonia::core::errors::Error::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break
                }
                Err(e) => return Err(load_err(e)),
            };
            if packet.track_id() != track_id {
                continue;
            }

            let decoded = decoder.decode(&packet).map_err(load_err)?;
            let mut buffer = SampleBuffer::<f64>::new(decoded.capacity() as u64, *decoded.spec());
            buffer.copy_interleaved_ref(decoded);
            interleaved.extend_from_slice(buffer.samples());
        }

        Self::new(deinterleave(&interleaved, num_channels), sample_rate, source)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel
    pub fn num_frames(&self) -> usize {
        self.channels[0].len()
    }

    pub fn duration(&self) -> f64 {
        self.num_frames() as f64 / self.sample_rate as f64
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn channel(&self, index: usize) -> Option<&[f64]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    pub fn channels(&self) -> &[Vec<f64>] {
        &self.channels
    }

    /// Average of all channels
    pub fn to_mono(&self) -> Vec<f64> {
        if self.channels.len() == 1 {
            return self.channels[0].clone();
        }
        mix(&self.channels, &vec![1.0; self.channels.len()])
    }

    /// Absolute peak of one channel
    pub fn channel_peak(&self, index: usize) -> f64 {
        self.channel(index)
            .map(|ch| ch.iter().fold(0.0, |acc: f64, s| acc.max(s.abs())))
            .unwrap_or(0.0)
    }

    /// Absolute peak across all channels
    pub fn peak(&self) -> f64 {
        (0..self.num_channels())
            .map(|i| self.channel_peak(i))
            .fold(0.0, f64::max)
    }
}

fn deinterleave(interleaved: &[f64], num_channels: usize) -> Vec<Vec<f64>> {
    let num_channels = num_channels.max(1);
    let frames = interleaved.len() / num_channels;
    let mut channels = vec![Vec::with_capacity(frames); num_channels];
    for frame in interleaved.chunks_exact(num_channels) {
        for (channel, &sample) in channels.iter_mut().zip(frame) {
            channel.push(sample);
        }
    }
    channels
}

fn mix(channels: &[Vec<f64>], gains: &[f64]) -> Vec<f64> {
    let frames = channels.first().map(Vec::len).unwrap_or(0);
    let scale = 1.0 / channels.len() as f64;
    (0..frames)
        .map(|i| {
            channels
                .iter()
                .zip(gains)
                .map(|(ch, gain)| ch[i] * gain)
                .sum::<f64>()
                * scale
        })
        .collect()
}

/// The single analysis track derived from a capture
#[derive(Debug, Clone)]
pub struct ChannelMix {
    samples: Vec<f64>,
    sample_rate: u32,
}

impl ChannelMix {
    /// Select or mix channels as configured, balancing stereo levels first
    pub fn prepare(signal: &Signal, config: &RunConfig) -> Self {
        let samples = match config.channel {
            Channel::Left => Self::select(signal, 0),
            Channel::Right => Self::select(signal, 1),
            Channel::Stereo if signal.num_channels() == 1 => signal.channels[0].clone(),
            Channel::Stereo if config.channel_balance => {
                let gains = balance_gains(signal);
                log::debug!("{}: channel balance gains {:?}", signal.source, gains);
                mix(&signal.channels, &gains)
            }
            Channel::Stereo => signal.to_mono(),
        };

        Self {
            samples,
            sample_rate: signal.sample_rate,
        }
    }

    /// Raw mono track for sync detection (no balance)
    pub fn raw(signal: &Signal, channel: Channel) -> Self {
        let samples = match channel {
            Channel::Left => Self::select(signal, 0),
            Channel::Right => Self::select(signal, 1),
            Channel::Stereo => signal.to_mono(),
        };
        Self {
            samples,
            sample_rate: signal.sample_rate,
        }
    }

    fn select(signal: &Signal, index: usize) -> Vec<f64> {
        match signal.channel(index) {
            Some(channel) => channel.to_vec(),
            None => {
                log::warn!(
                    "{}: channel {} not present, using channel 0",
                    signal.source,
                    index
                );
                signal.channels[0].clone()
            }
        }
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Gains that bring every channel to the loudest channel's peak
fn balance_gains(signal: &Signal) -> Vec<f64> {
    let peaks: Vec<f64> = (0..signal.num_channels())
        .map(|i| signal.channel_peak(i))
        .collect();
    let loudest = peaks.iter().copied().fold(0.0, f64::max);
    peaks
        .iter()
        .map(|&peak| if peak > 0.0 { loudest / peak } else { 1.0 })
        .collect()
}
