//! Run-wide totals and report rendering

use crate::classify::BlockDifference;
use crate::sync::SyncPair;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Write;
use std::path::Path;

/// Report format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    /// Plain text report
    #[default]
    Text,
    /// JSON report
    Json,
    /// One row per difference
    Csv,
    /// Markdown report
    Markdown,
}

impl ReportFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "text" | "txt" => Some(ReportFormat::Text),
            "json" => Some(ReportFormat::Json),
            "csv" => Some(ReportFormat::Csv),
            "markdown" | "md" => Some(ReportFormat::Markdown),
            _ => None,
        }
    }
}

/// How much of each block the text report shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextDetail {
    /// Blocks with differences
    #[default]
    Differences,
    /// Header and totals only
    Totals,
    /// Blocks with differences, plus every matched frequency in them
    Extended,
    /// Every block, with its matched frequencies
    Matched,
}

impl TextDetail {
    fn lists_matched(self) -> bool {
        matches!(self, TextDetail::Extended | TextDetail::Matched)
    }
}

/// Run-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportTotals {
    pub blocks_compared: usize,
    pub blocks_with_differences: usize,
    pub missing: usize,
    pub extra: usize,
    /// missing + extra
    pub frequency_differences: usize,
    pub amplitude_differences: usize,
    pub watermark_failures: usize,
}

/// Folds block results into a report in block order
#[derive(Debug)]
pub struct ResultAggregator {
    profile: String,
    sync: SyncPair,
    blocks: BTreeMap<usize, BlockDifference>,
    totals: ReportTotals,
}

impl ResultAggregator {
    pub fn new(profile: impl Into<String>, sync: SyncPair) -> Self {
        Self {
            profile: profile.into(),
            sync,
            blocks: BTreeMap::new(),
            totals: ReportTotals::default(),
        }
    }

    /// Add one block's result; a block index is only counted once
    pub fn record(&mut self, diff: BlockDifference) {
        if self.blocks.contains_key(&diff.index) {
            log::warn!("Block {} recorded twice, keeping the first result", diff.index);
            return;
        }

        let totals = &mut self.totals;
        totals.blocks_compared += 1;
        if diff.has_differences() {
            totals.blocks_with_differences += 1;
        }
        totals.missing += diff.missing.len();
        totals.extra += diff.extra.len();
        totals.frequency_differences += diff.missing.len() + diff.extra.len();
        totals.amplitude_differences += diff.amplitude.len();
        if diff.watermark.as_ref().is_some_and(|w| !w.passed) {
            totals.watermark_failures += 1;
        }

        self.blocks.insert(diff.index, diff);
    }

    pub fn totals(&self) -> &ReportTotals {
        &self.totals
    }

    pub fn finish(self) -> DifferenceReport {
        DifferenceReport {
            profile: self.profile,
            sync: self.sync,
            blocks: self.blocks.into_values().collect(),
            totals: self.totals,
        }
    }
}

/// Outcome of one comparison run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferenceReport {
    /// Profile name
    pub profile: String,

    pub sync: SyncPair,

    /// Compared blocks in timeline order
    pub blocks: Vec<BlockDifference>,

    pub totals: ReportTotals,
}

impl DifferenceReport {
    /// No block differs
    pub fn passed(&self) -> bool {
        self.totals.blocks_with_differences == 0
    }

    pub fn block(&self, index: usize) -> Option<&BlockDifference> {
        self.blocks.iter().find(|b| b.index == index)
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        let t = &self.totals;
        format!(
            "{}: {}/{} blocks differ | missing {} | extra {} | amplitude {} | watermark failures {}",
            self.profile,
            t.blocks_with_differences,
            t.blocks_compared,
            t.missing,
            t.extra,
            t.amplitude_differences,
            t.watermark_failures
        )
    }

    /// Render report in specified format
    pub fn render(&self, format: ReportFormat) -> String {
        self.render_detailed(format, TextDetail::default())
    }

    /// Render report, with `detail` selecting the text report's contents
    pub fn render_detailed(&self, format: ReportFormat, detail: TextDetail) -> String {
        match format {
            ReportFormat::Text => self.to_text(detail),
            ReportFormat::Json => self.to_json(),
            ReportFormat::Csv => self.to_csv(),
            ReportFormat::Markdown => self.to_markdown(),
        }
    }

    /// Save report to file
    pub fn save<P: AsRef<Path>>(&self, path: P, format: ReportFormat) -> Result<()> {
        self.save_detailed(path, format, TextDetail::default())
    }

    pub fn save_detailed<P: AsRef<Path>>(
        &self,
        path: P,
        format: ReportFormat,
        detail: TextDetail,
    ) -> Result<()> {
        let content = self.render_detailed(format, detail);
        let mut file = std::fs::File::create(path)?;
        file.write_all(content.as_bytes())?;
        Ok(())
    }

    fn to_text(&self, detail: TextDetail) -> String {
        let mut output = String::new();
        let title = format!("Spectral comparison: {}", self.profile);

        let _ = writeln!(output, "{}", title);
        let _ = writeln!(output, "{}\n", "=".repeat(title.len()));
        let _ = writeln!(
            output,
            "Sync: reference @{} drift {:.6} | comparison @{} drift {:.6}",
            self.sync.reference.offset,
            self.sync.reference.drift,
            self.sync.comparison.offset,
            self.sync.comparison.drift
        );
        let _ = writeln!(output, "{}\n", self.summary());

        output.push_str(&"-".repeat(80));
        output.push('\n');

        let shown = self.blocks.iter().filter(|b| match detail {
            TextDetail::Totals => false,
            TextDetail::Differences | TextDetail::Extended => b.has_differences(),
            TextDetail::Matched => true,
        });
        for block in shown {
            let _ = writeln!(
                output,
                "[{}] {} #{} ({})",
                block.index,
                block.name,
                block.repetition + 1,
                block.kind
            );
            for d in &block.amplitude {
                let _ = writeln!(
                    output,
                    "  {} amplitude {:>10.2}Hz  {:>8.2}dB -> {:>8.2}dB  ({:+.2}dB)",
                    marker(d.hi_diff),
                    d.frequency,
                    d.reference,
                    d.comparison,
                    d.delta
                );
            }
            for d in &block.missing {
                let _ = writeln!(
                    output,
                    "  {} missing   {:>10.2}Hz  {:>8.2}dB",
                    marker(d.hi_diff),
                    d.frequency,
                    d.magnitude
                );
            }
            for d in &block.extra {
                let _ = writeln!(
                    output,
                    "  {} extra     {:>10.2}Hz  {:>8.2}dB",
                    marker(d.hi_diff),
                    d.frequency,
                    d.magnitude
                );
            }
            if let Some(w) = block.watermark.as_ref().filter(|w| !w.passed) {
                let _ = writeln!(
                    output,
                    "  ! watermark reference {:?}, comparison {:?}",
                    w.reference, w.comparison
                );
            }
            if detail.lists_matched() {
                for m in &block.matched {
                    let _ = writeln!(
                        output,
                        "    matched   {:>10.2}Hz  {:>8.2}dB -> {:>8.2}dB  ({:+.2}dB)",
                        m.frequency, m.reference, m.comparison, m.delta
                    );
                }
            }
        }

        output.push_str(&"-".repeat(80));
        output.push('\n');
        output.push_str(if self.passed() { "Result: MATCH\n" } else { "Result: DIFFERENT\n" });
        output
    }

    fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".into())
    }

    fn to_csv(&self) -> String {
        let mut output = String::from(
            "block,name,repetition,kind,category,frequency_hz,\
             reference_db,comparison_db,delta_db,hi_diff\n",
        );

        for block in &self.blocks {
            let prefix = format!(
                "{},{},{},{}",
                block.index,
                csv_field(&block.name),
                block.repetition,
                block.kind
            );
            for d in &block.amplitude {
                let _ = writeln!(
                    output,
                    "{},amplitude,{:.3},{:.3},{:.3},{:.3},{}",
                    prefix, d.frequency, d.reference, d.comparison, d.delta, d.hi_diff
                );
            }
            for d in &block.missing {
                let _ = writeln!(
                    output,
                    "{},missing,{:.3},{:.3},,,{}",
                    prefix, d.frequency, d.magnitude, d.hi_diff
                );
            }
            for d in &block.extra {
                let _ = writeln!(
                    output,
                    "{},extra,{:.3},,{:.3},,{}",
                    prefix, d.frequency, d.magnitude, d.hi_diff
                );
            }
            if let Some(w) = block.watermark.as_ref().filter(|w| !w.passed) {
                let _ = writeln!(
                    output,
                    "{},watermark,,{:?},{:?},,true",
                    prefix, w.reference, w.comparison
                );
            }
        }

        output
    }

    fn to_markdown(&self) -> String {
        let mut output = String::new();
        let t = &self.totals;

        let _ = writeln!(output, "# Spectral comparison: {}\n", self.profile);
        output.push_str("| Metric | Value |\n|--------|-------|\n");
        let _ = writeln!(output, "| Blocks compared | {} |", t.blocks_compared);
        let _ = writeln!(output, "| Blocks with differences | {} |", t.blocks_with_differences);
        let _ = writeln!(output, "| Missing | {} |", t.missing);
        let _ = writeln!(output, "| Extra | {} |", t.extra);
        let _ = writeln!(output, "| Amplitude | {} |", t.amplitude_differences);
        let _ = writeln!(output, "| Watermark failures | {} |", t.watermark_failures);
        let _ = writeln!(output, "| Frame rate ratio | {:.6} |\n", self.sync.framerate_ratio());

        if self.passed() {
            output.push_str("All blocks match.\n");
            return output;
        }

        output.push_str("## Differences\n\n");
        output.push_str("| Block | Missing | Extra | Amplitude | Watermark |\n");
        output.push_str("|-------|---------|-------|-----------|-----------|\n");
        for block in self.blocks.iter().filter(|b| b.has_differences()) {
            let watermark = match &block.watermark {
                Some(w) if !w.passed => "FAIL",
                Some(_) => "ok",
                None => "-",
            };
            let _ = writeln!(
                output,
                "| {} #{} | {} | {} | {} | {} |",
                block.name,
                block.repetition + 1,
                block.missing.len(),
                block.extra.len(),
                block.amplitude.len(),
                watermark
            );
        }
        output
    }
}

fn marker(hi_diff: bool) -> char {
    if hi_diff {
        '!'
    } else {
        '-'
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
