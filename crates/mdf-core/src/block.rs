//! Block positions inside a synchronized capture

use crate::catalog::{BlockKind, BlockTypeCatalog, SyncFormat, TimelineEntry};
use crate::sync::SyncResult;
use crate::{MdfError, Result, SignalRole};

/// Slack when fitting a stretched length into a whole number of samples
const LENGTH_EPSILON: f64 = 1e-6;

/// Largest fractional sample an exact pair may be off by
const EXACT_PAIR_TOLERANCE: f64 = 0.01;

/// Exact pairing searches down to this fraction below the longest length
const EXACT_SEARCH_SPAN: usize = 8;

/// One analyzable segment of a capture
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Position in the expanded timeline
    pub index: usize,
    pub type_index: usize,
    pub repetition: usize,
    pub name: String,
    pub kind: BlockKind,
    /// First sample
    pub start: usize,
    /// Length in samples
    pub length: usize,
}

impl Block {
    pub fn end(&self) -> usize {
        self.start + self.length
    }

    /// The block's samples within its analysis track
    pub fn samples<'a>(&self, track: &'a [f64]) -> &'a [f64] {
        &track[self.start.min(track.len())..self.end().min(track.len())]
    }

    pub fn is_compared(&self) -> bool {
        self.kind.is_compared()
    }
}

/// Start (possibly before the capture) and length of a timeline entry
///
/// Positions are relative to the first sync block's onset and stretched
/// by the capture's frame-rate drift.
pub(crate) fn place(
    entry: &TimelineEntry,
    first_sync_frames: f64,
    format: &SyncFormat,
    sample_rate: u32,
    offset: usize,
    drift: f64,
) -> (i64, usize) {
    let from_sync = format.frames_to_samples(entry.start_frames - first_sync_frames, sample_rate);
    let start = offset as i64 + (from_sync / drift).round() as i64;
    let length = (format.frames_to_samples(entry.frames, sample_rate) / drift).round() as usize;
    (start, length)
}

/// Analysis lengths of a block pair covering the same content
///
/// `stretch` is the number of comparison samples per reference sample. The
/// reference keeps as much as the comparison block can mirror, and the
/// comparison takes the stretched length. With `exact` both are shortened
/// until the stretched length lands on a whole sample.
pub fn paired_lengths(
    reference: usize,
    comparison: usize,
    stretch: f64,
    exact: bool,
) -> (usize, usize) {
    if !(stretch > 0.0) || stretch.is_infinite() {
        return (reference.min(comparison), reference.min(comparison));
    }
    let mirrored = (comparison as f64 / stretch + LENGTH_EPSILON).floor() as usize;
    let longest = reference.min(mirrored);
    let stretched = |length: usize| ((length as f64 * stretch).round() as usize).min(comparison);
    if !exact {
        return (longest, stretched(longest));
    }

    let shortest = (longest - longest / EXACT_SEARCH_SPAN).max(1);
    let mut best = (longest, f64::MAX);
    for length in (shortest..=longest).rev() {
        let scaled = length as f64 * stretch;
        let error = (scaled - scaled.round()).abs();
        if error < best.1 {
            best = (length, error);
        }
        if error <= EXACT_PAIR_TOLERANCE {
            break;
        }
    }
    (best.0, stretched(best.0))
}

/// All blocks of one capture in timeline order
#[derive(Debug, Clone, Default)]
pub struct BlockLayout {
    blocks: Vec<Block>,
}

impl BlockLayout {
    /// Lay the profile timeline over a synchronized capture of `available` samples
    pub fn for_signal(
        catalog: &BlockTypeCatalog,
        format: &SyncFormat,
        sample_rate: u32,
        sync: &SyncResult,
        available: usize,
        role: SignalRole,
    ) -> Result<Self> {
        let timeline = catalog.timeline();
        let first_sync = catalog
            .sync_entries()
            .first()
            .map(|e| e.start_frames)
            .ok_or_else(|| MdfError::Profile("no sync block in profile".into()))?;

        let mut blocks = Vec::with_capacity(timeline.len());
        for (index, entry) in timeline.iter().enumerate() {
            let block_type = &catalog.blocks[entry.type_index];
            let (start, length) =
                place(entry, first_sync, format, sample_rate, sync.offset, sync.drift);

            if start < 0 || start as usize + length > available {
                return Err(MdfError::SignalTooShort { signal: role, block: index });
            }

            blocks.push(Block {
                index,
                type_index: entry.type_index,
                repetition: entry.repetition,
                name: block_type.name.clone(),
                kind: block_type.kind.clone(),
                start: start as usize,
                length,
            });
        }

        log::debug!(
            "{} layout: {} blocks, last ends at sample {}",
            role,
            blocks.len(),
            blocks.last().map(Block::end).unwrap_or(0)
        );
        Ok(Self { blocks })
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn get(&self, index: usize) -> Option<&Block> {
        self.blocks.get(index)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Blocks that take part in the comparison
    pub fn compared(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.is_compared())
    }
}
