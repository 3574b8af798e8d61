//! Analysis windows, memoized per block length

use crate::{MdfError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::{Arc, OnceLock};

/// Tukey taper ratio (fraction of the block that is tapered)
const TUKEY_ALPHA: f64 = 0.5;

/// Longest taper on each side of a Tukey window, in seconds
pub const TUKEY_MAX_TAPER_SECONDS: f64 = 0.05;

/// Flat-top coefficients (amplitude accurate, 5 terms)
const FLATTOP: [f64; 5] = [
    0.215_578_95,
    0.416_631_58,
    0.277_263_158,
    0.083_578_947,
    0.006_947_368,
];

/// Window function applied to each block before the transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// Rectangular (no window)
    None,
    /// Tukey with a taper bounded in time (default)
    #[default]
    Tukey,
    /// Hann window
    Hann,
    /// Flat-top window (amplitude accuracy)
    FlatTop,
    /// Hamming window
    Hamming,
}

impl WindowKind {
    /// Generate window coefficients
    ///
    /// `sample_rate` only matters for [`WindowKind::Tukey`], whose taper is
    /// capped at [`TUKEY_MAX_TAPER_SECONDS`].
    pub fn generate(&self, length: usize, sample_rate: u32) -> Vec<f64> {
        if length == 1 {
            return vec![1.0];
        }

        let denom = (length - 1) as f64;
        match self {
            WindowKind::None => vec![1.0; length],
            WindowKind::Hann => (0..length)
                .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f64 / denom).cos())
                .collect(),
            WindowKind::Hamming => (0..length)
                .map(|n| 0.54 - 0.46 * (2.0 * PI * n as f64 / denom).cos())
                .collect(),
            WindowKind::FlatTop => (0..length)
                .map(|n| {
                    let x = 2.0 * PI * n as f64 / denom;
                    FLATTOP[0] - FLATTOP[1] * x.cos() + FLATTOP[2] * (2.0 * x).cos()
                        - FLATTOP[3] * (3.0 * x).cos()
                        + FLATTOP[4] * (4.0 * x).cos()
                })
                .collect(),
            WindowKind::Tukey => tukey(length, sample_rate),
        }
    }

    /// Nominal inverse coherent gain of the shape, independent of length
    pub fn compensation_factor(&self) -> f64 {
        match self {
            WindowKind::None => 1.0,
            WindowKind::Tukey => 1.0 / (1.0 - TUKEY_ALPHA / 2.0),
            WindowKind::Hann => 2.0,
            WindowKind::Hamming => 1.0 / 0.54,
            WindowKind::FlatTop => 1.0 / FLATTOP[0],
        }
    }

    /// Parse the single-letter code used on the command line
    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'n' => Some(WindowKind::None),
            't' => Some(WindowKind::Tukey),
            'h' => Some(WindowKind::Hann),
            'f' => Some(WindowKind::FlatTop),
            'm' => Some(WindowKind::Hamming),
            _ => None,
        }
    }
}

fn tukey(length: usize, sample_rate: u32) -> Vec<f64> {
    let max_taper = (TUKEY_MAX_TAPER_SECONDS * sample_rate as f64).floor() as usize;
    let taper = ((length as f64 * TUKEY_ALPHA / 2.0).floor() as usize).min(max_taper);
    if taper == 0 {
        return vec![1.0; length];
    }

    (0..length)
        .map(|n| {
            let edge = n.min(length - 1 - n);
            if edge < taper {
                0.5 * (1.0 - (PI * edge as f64 / taper as f64).cos())
            } else {
                1.0
            }
        })
        .collect()
}

/// Cache key: coefficients depend only on these three values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub length: usize,
    pub sample_rate: u32,
    pub kind: WindowKind,
}

/// Coefficients and the inverse of their coherent gain
struct CachedWindow {
    coefficients: Arc<[f64]>,
    compensation: f64,
}

impl CachedWindow {
    fn new(kind: WindowKind, length: usize, sample_rate: u32) -> Self {
        let coefficients: Arc<[f64]> = Arc::from(kind.generate(length, sample_rate));
        let sum: f64 = coefficients.iter().sum();
        // Degenerate shapes (two-sample Hann) keep the nominal factor
        let compensation = if sum > f64::EPSILON {
            length as f64 / sum
        } else {
            kind.compensation_factor()
        };
        Self {
            coefficients,
            compensation,
        }
    }
}

type Slot = Arc<OnceLock<CachedWindow>>;

/// Append-only window store shared by all block workers
///
/// Each key owns its own slot, so two workers asking for the same missing
/// window wait on one computation instead of racing.
#[derive(Default)]
pub struct WindowCache {
    slots: RwLock<HashMap<WindowKey, Slot>>,
}

impl WindowCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or compute and store) the window for this key
    pub fn get_window(
        &self,
        length: usize,
        sample_rate: u32,
        kind: WindowKind,
    ) -> Result<Arc<[f64]>> {
        self.with_cached(length, sample_rate, kind, |w| Arc::clone(&w.coefficients))
    }

    /// Inverse coherent gain (`length / sum`) of the cached window
    ///
    /// Equals [`WindowKind::compensation_factor`] for shapes that scale with
    /// the block; a time-capped Tukey taper flattens long blocks and needs
    /// less correction.
    pub fn compensation(&self, length: usize, sample_rate: u32, kind: WindowKind) -> Result<f64> {
        self.with_cached(length, sample_rate, kind, |w| w.compensation)
    }

    fn with_cached<T>(
        &self,
        length: usize,
        sample_rate: u32,
        kind: WindowKind,
        read: impl FnOnce(&CachedWindow) -> T,
    ) -> Result<T> {
        if length == 0 {
            return Err(MdfError::InvalidArgument(
                "window length must be greater than zero".into(),
            ));
        }

        let key = WindowKey { length, sample_rate, kind };
        let slot = self.slot(key);
        let window = slot.get_or_init(|| {
            log::debug!("Creating {:?} window: {} samples @ {}Hz", kind, length, sample_rate);
            CachedWindow::new(kind, length, sample_rate)
        });

        Ok(read(window))
    }

    fn slot(&self, key: WindowKey) -> Slot {
        if let Some(slot) = self.slots.read().get(&key) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write();
        Arc::clone(slots.entry(key).or_default())
    }

    /// Fixed per-kind energy correction
    pub fn compensation_factor(&self, kind: WindowKind) -> f64 {
        kind.compensation_factor()
    }

    /// Single-sided amplitude scale for an unpadded block of `length` samples
    pub fn correction_factor(&self, length: usize) -> f64 {
        if length == 0 {
            0.0
        } else {
            2.0 / length as f64
        }
    }

    /// Number of distinct windows computed so far
    pub fn len(&self) -> usize {
        self.slots.read().values().filter(|s| s.get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KINDS: [WindowKind; 5] = [
        WindowKind::None,
        WindowKind::Tukey,
        WindowKind::Hann,
        WindowKind::FlatTop,
        WindowKind::Hamming,
    ];

    #[test]
    fn test_zero_length_rejected() {
        let cache = WindowCache::new();
        let err = cache.get_window(0, 48000, WindowKind::Hann).unwrap_err();
        assert!(matches!(err, MdfError::InvalidArgument(_)));
    }

    #[test]
    fn test_get_window_idempotent() {
        let cache = WindowCache::new();
        for kind in KINDS {
            for length in [1usize, 2, 7, 480, 4096] {
                let first = cache.get_window(length, 44100, kind).unwrap();
                let second = cache.get_window(length, 44100, kind).unwrap();
                assert_eq!(first.len(), length);
                assert!(Arc::ptr_eq(&first, &second));

                let fresh = kind.generate(length, 44100);
                let same_bits = first
                    .iter()
                    .zip(fresh.iter())
                    .all(|(a, b)| a.to_bits() == b.to_bits());
                assert!(same_bits, "{:?} window of {} not reproducible", kind, length);
            }
        }
        assert_eq!(cache.len(), KINDS.len() * 5);
    }

    #[test]
    fn test_hann_shape() {
        let window = WindowKind::Hann.generate(1025, 48000);
        assert!(window[0].abs() < 1e-12);
        assert!(window[1024].abs() < 1e-12);
        assert!((window[512] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_tukey_taper_bounded_in_time() {
        // 2 seconds at 1 kHz: alpha would taper 500 samples, time cap is 50
        let window = WindowKind::Tukey.generate(2000, 1000);
        assert!(window[0] < 1e-12);
        assert_eq!(window[50], 1.0);
        assert_eq!(window[1000], 1.0);
        assert!(window[1999] < 1e-12);

        // Short block: alpha taper wins
        let short = WindowKind::Tukey.generate(40, 48000);
        assert!(short[9] < 1.0);
        assert_eq!(short[10], 1.0);
    }

    #[test]
    fn test_sample_rate_is_part_of_key() {
        let cache = WindowCache::new();
        let a = cache.get_window(8000, 1000, WindowKind::Tukey).unwrap();
        let b = cache.get_window(8000, 48000, WindowKind::Tukey).unwrap();
        assert_ne!(a[60], b[60]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_factors() {
        let cache = WindowCache::new();
        assert_eq!(cache.compensation_factor(WindowKind::None), 1.0);
        assert_eq!(cache.compensation_factor(WindowKind::Hann), 2.0);
        assert!(cache.compensation_factor(WindowKind::FlatTop) > 4.6);
        assert_eq!(cache.correction_factor(1000), 0.002);
    }

    #[test]
    fn test_measured_compensation() {
        let cache = WindowCache::new();

        // Uncapped taper matches the nominal 4/3
        let short = cache.compensation(9600, 48000, WindowKind::Tukey).unwrap();
        assert!((short - 4.0 / 3.0).abs() < 1e-3, "compensation {}", short);

        // One second: 2400-sample tapers cover a tenth of the block
        let long = cache.compensation(48000, 48000, WindowKind::Tukey).unwrap();
        assert!((long - 48000.0 / 45600.0).abs() < 1e-3, "compensation {}", long);

        let hann = cache.compensation(4096, 48000, WindowKind::Hann).unwrap();
        assert!((hann - 2.0).abs() < 1e-3);
        assert_eq!(cache.compensation(2, 48000, WindowKind::Hann).unwrap(), 2.0);
        assert_eq!(cache.compensation(100, 48000, WindowKind::None).unwrap(), 1.0);
        assert!(cache.compensation(0, 48000, WindowKind::Tukey).is_err());
    }

    #[test]
    fn test_concurrent_lookups_share_one_window() {
        let cache = WindowCache::new();
        let windows: Vec<Arc<[f64]>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| cache.get_window(2048, 48000, WindowKind::Hamming).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(windows.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(cache.len(), 1);
    }
}
