//! # mdf-core
//!
//! Windowed spectral block comparison for validating audio hardware revisions.
//!
//! Two captures of the same test signal (a reference and a comparison) are
//! aligned on the sync pulses described by a profile, cut into the profile's
//! blocks, transformed and compared frequency by frequency.
//!
//! ## Pipeline
//!
//! - **Windows**: memoized analysis windows per block length ([`WindowCache`])
//! - **Sync**: pulse detection and frame-rate drift estimation ([`Synchronizer`])
//! - **Spectra**: windowed FFT with normalization ([`SpectralAnalyzer`])
//! - **Classification**: missing / extra / amplitude differences ([`DifferenceClassifier`])
//! - **Report**: ordered per-block results and totals ([`DifferenceReport`])
//!
//! ## Example
//!
//! ```rust,ignore
//! use mdf_core::{BlockTypeCatalog, ReportFormat, RunConfig, Signal, SpectralCompare};
//!
//! let catalog = BlockTypeCatalog::load("genesis.json")?;
//! let reference = Signal::load("model1.wav")?;
//! let comparison = Signal::load("model2.wav")?;
//!
//! let config = RunConfig::default();
//! let report = SpectralCompare::new(&catalog, &config)?.run(&reference, &comparison)?;
//! print!("{}", report.render(ReportFormat::Text));
//! ```

pub mod block;
pub mod catalog;
pub mod classify;
pub mod compare;
pub mod config;
pub mod generate;
pub mod report;
pub mod signal;
pub mod spectral;
pub mod sync;
pub mod window;

pub use block::{Block, BlockLayout};
pub use catalog::{
    BlockKind, BlockType, BlockTypeCatalog, ClockReference, ExtraData, PulsePattern, SyncFormat,
};
pub use classify::{
    AmplitudeDifference, BlockContext, BlockDifference, DifferenceClassifier, FrequencyDifference,
    WatermarkCheck, WatermarkState,
};
pub use compare::SpectralCompare;
pub use config::{Channel, NormalizationMode, RunConfig};
pub use generate::{write_wav, Generator, GeneratorOptions};
pub use report::{DifferenceReport, ReportFormat, ReportTotals, ResultAggregator, TextDetail};
pub use signal::{ChannelMix, Signal};
pub use spectral::{RawSpectrum, SpectralAnalyzer, SpectralBin, Spectrum};
pub use sync::{SyncPair, SyncResult, Synchronizer};
pub use window::{WindowCache, WindowKind};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Which of the two captures an operation refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalRole {
    Reference,
    Comparison,
}

impl fmt::Display for SignalRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalRole::Reference => f.write_str("reference"),
            SignalRole::Comparison => f.write_str("comparison"),
        }
    }
}

/// Errors that can occur during a comparison run
#[derive(Error, Debug)]
pub enum MdfError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Sync pulse not found in {signal} signal")]
    SyncNotFound { signal: SignalRole },

    #[error("Profile defines no block types")]
    EmptyCatalog,

    #[error("Profile timeline has no comparable blocks")]
    NoBlocks,

    #[error("FFT failed on block {block}: {message}")]
    Transform { block: usize, message: String },

    #[error("{signal} signal ends before block {block}")]
    SignalTooShort { signal: SignalRole, block: usize },

    #[error("Failed to load audio file: {0}")]
    Load(String),

    #[error("Invalid profile: {0}")]
    Profile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MdfError>;

/// Compare two captures with the given profile and configuration
pub fn compare_signals(
    catalog: &BlockTypeCatalog,
    config: &RunConfig,
    reference: &Signal,
    comparison: &Signal,
) -> Result<DifferenceReport> {
    SpectralCompare::new(catalog, config)?.run(reference, comparison)
}
