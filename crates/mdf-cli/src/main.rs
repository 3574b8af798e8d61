//! MDFourier command line
//!
//! Usage:
//!   mdfourier compare -P profile.json -r model1.wav -c model2.wav
//!   mdfourier generate -P profile.json -o reference.wav

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use mdf_core::{
    BlockTypeCatalog, Channel, Generator, GeneratorOptions, NormalizationMode, ReportFormat,
    RunConfig, Signal, SpectralCompare, TextDetail, WindowKind,
};

#[derive(Parser)]
#[command(name = "mdfourier", version, about = "Compare audio captures of the same test signal")]
struct Cli {
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare a capture against a reference capture
    Compare(CompareArgs),
    /// Render a profile to a WAV test signal
    Generate(GenerateArgs),
}

#[derive(Args)]
struct CompareArgs {
    /// Profile (JSON)
    #[arg(short = 'P', long)]
    profile: PathBuf,

    /// Reference capture
    #[arg(short = 'r', long)]
    reference: PathBuf,

    /// Comparison capture
    #[arg(short = 'c', long)]
    comparison: PathBuf,

    /// Base run configuration (JSON); flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Channel: l, r or s
    #[arg(short = 'a', long, value_parser = parse_channel)]
    channel: Option<Channel>,

    /// Window: n, t, f, h or m
    #[arg(short = 'w', long, value_parser = parse_window)]
    window: Option<WindowKind>,

    /// Start of the analysis range (Hz)
    #[arg(short = 's', long)]
    start_hz: Option<f64>,

    /// End of the analysis range (Hz)
    #[arg(short = 'e', long)]
    end_hz: Option<f64>,

    /// Strongest frequencies kept per block
    #[arg(short = 'f', long)]
    max_frequencies: Option<usize>,

    /// Normalization: t (time), f (frequency), a (average) or n (none)
    #[arg(short = 'n', long, value_parser = parse_normalization)]
    normalization: Option<NormalizationMode>,

    /// Re-anchor quiet comparison blocks on up to this many reference peaks
    #[arg(long)]
    normalization_tries: Option<usize>,

    /// Significance level (dBFS)
    #[arg(short = 'p', long, allow_hyphen_values = true)]
    significant: Option<f64>,

    /// Amplitude match tolerance (dB)
    #[arg(short = 'b', long)]
    bar: Option<f64>,

    /// Zero-pad blocks to 1 Hz bins
    #[arg(short = 'z', long)]
    zero_pad: bool,

    /// Relaxed sync detection
    #[arg(short = 'T', long)]
    sync_tolerance: bool,

    /// Keep bins under the silence noise floor
    #[arg(short = 'i', long)]
    ignore_floor: bool,

    /// Assume both captures run at the nominal frame rate
    #[arg(short = 'I', long)]
    ignore_framerate: bool,

    /// Do not level-match stereo channels
    #[arg(short = 'B', long)]
    no_balance: bool,

    /// Report profile extra-data frequencies as extra
    #[arg(short = 'X', long)]
    no_extra_data: bool,

    /// Do not round magnitudes to 0.001 dB
    #[arg(short = 'q', long)]
    no_quantize: bool,

    /// Shorten paired blocks to whole-sample lengths at the frame-rate ratio
    #[arg(long)]
    compress: bool,

    /// Sync format index of the reference
    #[arg(short = 'Y', long)]
    reference_format: Option<usize>,

    /// Sync format index of the comparison
    #[arg(short = 'Z', long)]
    comparison_format: Option<usize>,

    /// Swap reference and comparison
    #[arg(short = 'R', long)]
    reverse: bool,

    /// Report format: text, json, csv or markdown
    #[arg(long, default_value = "text", value_parser = parse_format)]
    format: ReportFormat,

    /// Text report: totals only
    #[arg(short = 'j', long, conflicts_with_all = ["extended", "matched"])]
    totals: bool,

    /// Text report: also list matched frequencies of differing blocks
    #[arg(short = 'x', long, conflicts_with = "matched")]
    extended: bool,

    /// Text report: every block with its matched frequencies
    #[arg(short = 'm', long)]
    matched: bool,

    /// Write the report here instead of stdout
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Worker threads for block analysis
    #[arg(long)]
    threads: Option<usize>,

    /// Exit with status 1 when any block differs
    #[arg(long)]
    check: bool,
}

#[derive(Args)]
struct GenerateArgs {
    /// Profile (JSON)
    #[arg(short = 'P', long)]
    profile: PathBuf,

    /// Output WAV file
    #[arg(short = 'o', long)]
    output: PathBuf,

    /// Sync format index to render
    #[arg(short = 'Y', long, default_value_t = 0)]
    format: usize,

    #[arg(long, default_value_t = 48000)]
    sample_rate: u32,

    #[arg(long, default_value_t = 1)]
    channels: usize,

    /// Silent samples before the first block
    #[arg(long, default_value_t = 0)]
    offset: usize,

    /// Clock speed over nominal
    #[arg(long, default_value_t = 1.0)]
    drift: f64,

    /// Tone level (dBFS)
    #[arg(long, default_value_t = -6.0, allow_hyphen_values = true)]
    tone_db: f64,

    /// Noise level (dBFS)
    #[arg(long, allow_hyphen_values = true)]
    noise_db: Option<f64>,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Render watermarks with their invalid frequency
    #[arg(long)]
    invalid_watermark: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match cli.command {
        Commands::Compare(args) => compare(args),
        Commands::Generate(args) => generate(args),
    }
}

fn compare(args: CompareArgs) -> Result<()> {
    let catalog = load_profile(&args.profile)?;
    let config = build_config(&args)?;

    let (reference_path, comparison_path) = if args.reverse {
        (&args.comparison, &args.reference)
    } else {
        (&args.reference, &args.comparison)
    };
    let reference = Signal::load(reference_path)
        .with_context(|| format!("Failed to load reference {}", reference_path.display()))?;
    let comparison = Signal::load(comparison_path)
        .with_context(|| format!("Failed to load comparison {}", comparison_path.display()))?;

    let report = SpectralCompare::new(&catalog, &config)
        .context("Invalid run configuration")?
        .run(&reference, &comparison)
        .context("Comparison failed")?;

    let detail = text_detail(&args);
    match &args.output {
        Some(path) => {
            report
                .save_detailed(path, args.format, detail)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            log::info!("Report written to {}", path.display());
        }
        None => print!("{}", report.render_detailed(args.format, detail)),
    }

    if args.check && !report.passed() {
        std::process::exit(1);
    }
    Ok(())
}

fn text_detail(args: &CompareArgs) -> TextDetail {
    if args.totals {
        TextDetail::Totals
    } else if args.matched {
        TextDetail::Matched
    } else if args.extended {
        TextDetail::Extended
    } else {
        TextDetail::Differences
    }
}

fn build_config(args: &CompareArgs) -> Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            RunConfig::from_json_str(&json)
                .with_context(|| format!("Invalid configuration in {}", path.display()))?
        }
        None => RunConfig::default(),
    };

    if let Some(channel) = args.channel {
        config.channel = channel;
    }
    if let Some(window) = args.window {
        config.window = window;
    }
    if let Some(start_hz) = args.start_hz {
        config.start_hz = start_hz;
    }
    if let Some(end_hz) = args.end_hz {
        config.end_hz = end_hz;
    }
    if let Some(count) = args.max_frequencies {
        config.max_frequencies = count;
    }
    if let Some(mode) = args.normalization {
        config.normalization = mode;
    }
    if let Some(tries) = args.normalization_tries {
        config = config.with_normalization_retries(tries);
    }
    if let Some(dbfs) = args.significant {
        config.significant_amplitude = dbfs;
    }
    if let Some(db) = args.bar {
        config.amplitude_bar_tolerance = db;
    }
    if let Some(index) = args.reference_format {
        config.reference_format = index;
    }
    if let Some(index) = args.comparison_format {
        config.comparison_format = index;
    }
    if args.reverse {
        std::mem::swap(&mut config.reference_format, &mut config.comparison_format);
    }
    if args.threads.is_some() {
        config.threads = args.threads;
    }

    config.zero_pad |= args.zero_pad;
    config.sync_tolerance |= args.sync_tolerance;
    config.ignore_noise_floor |= args.ignore_floor;
    config.ignore_framerate_difference |= args.ignore_framerate;
    config.compress_to_blocks |= args.compress;
    config.channel_balance &= !args.no_balance;
    config.use_extra_data &= !args.no_extra_data;
    config.quantize_round &= !args.no_quantize;

    config.validate()?;
    Ok(config)
}

fn generate(args: GenerateArgs) -> Result<()> {
    let catalog = load_profile(&args.profile)?;
    if !(args.drift > 0.5 && args.drift < 2.0) {
        bail!("Drift {} outside (0.5, 2.0)", args.drift);
    }

    let options = GeneratorOptions {
        sample_rate: args.sample_rate,
        format: args.format,
        lead_in: args.offset,
        drift: args.drift,
        tone_db: args.tone_db,
        noise_db: args.noise_db,
        seed: args.seed,
        channels: args.channels,
        watermark_valid: !args.invalid_watermark,
        ..Default::default()
    };

    let signal = Generator::new(&catalog, options)
        .render()
        .context("Failed to render profile")?;
    mdf_core::write_wav(&signal, &args.output)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;

    println!(
        "{}: {:.3}s, {} channel(s) @ {}Hz",
        args.output.display(),
        signal.duration(),
        signal.num_channels(),
        signal.sample_rate()
    );
    Ok(())
}

fn load_profile(path: &Path) -> Result<BlockTypeCatalog> {
    BlockTypeCatalog::load(path)
        .with_context(|| format!("Failed to load profile {}", path.display()))
}

fn parse_channel(value: &str) -> std::result::Result<Channel, String> {
    single_code(value)
        .and_then(Channel::from_code)
        .ok_or_else(|| format!("invalid channel '{}': use l, r or s", value))
}

fn parse_window(value: &str) -> std::result::Result<WindowKind, String> {
    single_code(value)
        .and_then(WindowKind::from_code)
        .ok_or_else(|| format!("invalid window '{}': use n, t, f, h or m", value))
}

fn parse_normalization(value: &str) -> std::result::Result<NormalizationMode, String> {
    single_code(value)
        .and_then(NormalizationMode::from_code)
        .ok_or_else(|| format!("invalid normalization '{}': use t, f, a or n", value))
}

fn parse_format(value: &str) -> std::result::Result<ReportFormat, String> {
    ReportFormat::from_name(value)
        .ok_or_else(|| format!("invalid format '{}': use text, json, csv or markdown", value))
}

fn single_code(value: &str) -> Option<char> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c.to_ascii_lowercase()),
        _ => None,
    }
}
