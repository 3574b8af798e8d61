//! Profile: expected timeline of the test signal

use crate::{MdfError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What a block of the test signal carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    /// Sync pulse train of the active sync format
    Sync,
    /// Silence; measures the capture's noise floor
    Silence,
    /// Tone block, optionally with its fundamental frequencies
    Regular {
        #[serde(default)]
        frequencies: Vec<f64>,
    },
    /// Binary valid/invalid marker
    Watermark { valid_hz: f64, invalid_hz: f64 },
}

impl BlockKind {
    pub fn label(&self) -> &'static str {
        match self {
            BlockKind::Sync => "sync",
            BlockKind::Silence => "silence",
            BlockKind::Regular { .. } => "regular",
            BlockKind::Watermark { .. } => "watermark",
        }
    }

    /// Explicit frequencies declared for the block
    pub fn fundamentals(&self) -> &[f64] {
        match self {
            BlockKind::Regular { frequencies } => frequencies,
            _ => &[],
        }
    }

    pub fn is_compared(&self) -> bool {
        !matches!(self, BlockKind::Sync)
    }
}

/// One entry of the profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockType {
    pub name: String,
    #[serde(flatten)]
    pub kind: BlockKind,
    /// Duration of one instance, in frames of the active sync format
    pub frames: f64,
    /// Instances laid out back to back
    #[serde(default = "one")]
    pub count: usize,
}

fn one() -> usize {
    1
}

/// Sync pulse train layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulsePattern {
    pub frequency_hz: f64,
    /// Length of each pulse in frames
    pub pulse_frames: f64,
    /// Silence between pulses in frames
    pub gap_frames: f64,
    pub count: usize,
}

impl PulsePattern {
    /// Frames from one pulse onset to the next
    pub fn period_frames(&self) -> f64 {
        self.pulse_frames + self.gap_frames
    }
}

/// Timing definition of one video format the hardware can run in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFormat {
    pub name: String,
    /// Duration of one frame in milliseconds
    pub frame_ms: f64,
    pub pulse: PulsePattern,
}

impl SyncFormat {
    pub fn frames_to_seconds(&self, frames: f64) -> f64 {
        frames * self.frame_ms / 1000.0
    }

    pub fn frames_to_samples(&self, frames: f64, sample_rate: u32) -> f64 {
        self.frames_to_seconds(frames) * sample_rate as f64
    }
}

/// Frequencies known to come from harmless hardware artifacts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtraData {
    pub frequencies: Vec<f64>,
    #[serde(default = "default_extra_tolerance")]
    pub tolerance_hz: f64,
}

fn default_extra_tolerance() -> f64 {
    1.0
}

impl ExtraData {
    pub fn contains(&self, frequency: f64) -> bool {
        self.frequencies
            .iter()
            .any(|f| (f - frequency).abs() <= self.tolerance_hz)
    }

    /// Copy with every frequency multiplied by `scale`
    pub fn scaled(&self, scale: f64) -> Self {
        Self {
            frequencies: self.frequencies.iter().map(|f| f * scale).collect(),
            tolerance_hz: self.tolerance_hz,
        }
    }
}

/// Block emitting the hardware oscillator at a known frequency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockReference {
    /// Name of the block type; its first instance is measured
    pub block: String,
    pub frequency_hz: f64,
}

/// One timeline position: which block type and which repetition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineEntry {
    pub type_index: usize,
    pub repetition: usize,
    /// Frames from the start of the timeline
    pub start_frames: f64,
    pub frames: f64,
}

/// Ordered profile of the test signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTypeCatalog {
    pub name: String,
    pub sync_formats: Vec<SyncFormat>,
    pub blocks: Vec<BlockType>,
    #[serde(default)]
    pub extra_data: ExtraData,
    #[serde(default)]
    pub clock: Option<ClockReference>,
}

impl BlockTypeCatalog {
    /// Parse a JSON profile
    pub fn from_json_str(json: &str) -> Result<Self> {
        let catalog: Self =
            serde_json::from_str(json).map_err(|e| MdfError::Profile(e.to_string()))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load a JSON profile from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let catalog = Self::from_json_str(&json)
            .map_err(|e| MdfError::Profile(format!("{}: {}", path.display(), e)))?;
        log::info!(
            "Profile '{}': {} block types, {} sync format(s)",
            catalog.name,
            catalog.blocks.len(),
            catalog.sync_formats.len()
        );
        Ok(catalog)
    }

    /// Reject profiles that cannot drive a comparison
    pub fn validate(&self) -> Result<()> {
        if self.blocks.is_empty() {
            return Err(MdfError::EmptyCatalog);
        }
        if !self.blocks.iter().any(|b| b.count > 0 && b.kind.is_compared()) {
            return Err(MdfError::NoBlocks);
        }
        if !self.blocks.iter().any(|b| b.count > 0 && b.kind == BlockKind::Sync) {
            return Err(MdfError::Profile("no sync block in profile".into()));
        }
        if self.sync_formats.is_empty() || self.sync_formats.len() > 2 {
            return Err(MdfError::Profile(format!(
                "expected one or two sync formats, found {}",
                self.sync_formats.len()
            )));
        }
        for format in &self.sync_formats {
            let pulse = &format.pulse;
            if format.frame_ms <= 0.0 || pulse.pulse_frames <= 0.0 || pulse.count == 0 {
                return Err(MdfError::Profile(format!(
                    "sync format '{}' has no pulse",
                    format.name
                )));
            }
        }
        if let Some(block) = self.blocks.iter().find(|b| !(b.frames > 0.0)) {
            return Err(MdfError::Profile(format!("block '{}' has no duration", block.name)));
        }
        if let Some(clock) = &self.clock {
            if self.type_index(&clock.block).is_none() {
                return Err(MdfError::Profile(format!("clock block '{}' not defined", clock.block)));
            }
        }
        Ok(())
    }

    /// Sync format by index
    pub fn sync_format(&self, index: usize) -> Result<&SyncFormat> {
        self.sync_formats.get(index).ok_or_else(|| {
            MdfError::InvalidArgument(format!(
                "sync format {} not in profile ({} defined)",
                index,
                self.sync_formats.len()
            ))
        })
    }

    pub fn type_index(&self, name: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.name == name)
    }

    /// Expand block types and repetitions into timeline order
    pub fn timeline(&self) -> Vec<TimelineEntry> {
        let mut entries = Vec::new();
        let mut position = 0.0;
        for (type_index, block) in self.blocks.iter().enumerate() {
            for repetition in 0..block.count {
                entries.push(TimelineEntry {
                    type_index,
                    repetition,
                    start_frames: position,
                    frames: block.frames,
                });
                position += block.frames;
            }
        }
        entries
    }

    /// Timeline entries of sync blocks, in order
    pub fn sync_entries(&self) -> Vec<TimelineEntry> {
        self.timeline()
            .into_iter()
            .filter(|e| self.blocks[e.type_index].kind == BlockKind::Sync)
            .collect()
    }

    /// Total duration of the timeline in frames
    pub fn total_frames(&self) -> f64 {
        self.blocks.iter().map(|b| b.frames * b.count as f64).sum()
    }
}
