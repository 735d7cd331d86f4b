//! indexamajig — run the per-frame pipeline: peak search, indexing,
//! prediction, integration, stream output.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use clap::Parser;

use sfxpipe_cli::MsgpackFileSource;
use sfxpipe_core::cell::{parse as cellparse, CellTolerances};
use sfxpipe_core::geometry::parse::load_geometry;
use sfxpipe_core::image::BeamParams;
use sfxpipe_core::index::{Indexer, IndexingConfig, IndexingDriver, TemplateIndexer};
use sfxpipe_core::integrate::{IntegrationConfig, IntegrationMethod};
use sfxpipe_core::peaks::{PeakSearchConfig, PeakSearchMethod};
use sfxpipe_core::pipeline::{process_frames, PipelineConfig};
use sfxpipe_core::stream::StreamWriter;

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "indexamajig")]
#[command(about = "Index and integrate snapshot diffraction frames into a stream")]
#[command(version)]
struct Cli {
    /// List of input frame filenames (MessagePack frames, one per line).
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// Detector geometry file.
    #[arg(short = 'g', long = "geometry")]
    geometry: PathBuf,

    /// Output stream filename.
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Run this many analyses in parallel.
    #[arg(short = 'j', default_value = "1")]
    n_threads: usize,

    /// Target unit cell (cell file or PDB).
    #[arg(short = 'p', long = "pdb")]
    cell: Option<PathBuf>,

    /// Peak search method: zaef, peakfinder8, peakfinder9, msgpack, none.
    #[arg(long = "peaks", default_value = "zaef")]
    peaks: String,

    /// Intensity threshold for peak detection (zaef).
    #[arg(short = 't', long = "threshold", default_value = "800.0")]
    threshold: f64,

    /// Minimum squared gradient (zaef).
    #[arg(long = "min-squared-gradient", default_value = "100000.0")]
    min_sq_gradient: f64,

    /// Minimum signal/noise ratio (peakfinder8/9).
    #[arg(long = "min-snr", default_value = "5.0")]
    min_snr: f64,

    /// Minimum pixels per peak (peakfinder8/9).
    #[arg(long = "min-pix-count", default_value = "2")]
    min_pix_count: usize,

    /// Maximum pixels per peak (peakfinder8/9).
    #[arg(long = "max-pix-count", default_value = "200")]
    max_pix_count: usize,

    /// Local background radius in pixels (peakfinder8/9).
    #[arg(long = "local-bg-radius", default_value = "3")]
    local_bg_radius: usize,

    /// Minimum peak resolution in pixels from the beam axis.
    #[arg(long = "min-res", default_value = "0.0")]
    min_res: f64,

    /// Maximum peak resolution in pixels from the beam axis.
    #[arg(long = "max-res", default_value = "1200.0")]
    max_res: f64,

    /// Minimum number of peaks for indexing.
    #[arg(long = "min-peaks", default_value = "0")]
    min_peaks: usize,

    /// Median filter half-width in pixels (0 = off).
    #[arg(long = "median-filter", default_value = "0")]
    median_filter: usize,

    /// Apply the noise filter to raw pixels.
    #[arg(long = "filter-noise")]
    filter_noise: bool,

    /// Integration radii inner,mid,outer in pixels.
    #[arg(long = "int-radius", default_value = "4.0,5.0,7.0")]
    int_radius: String,

    /// Integration method descriptor, e.g. rings-cen-grad.
    #[arg(long = "integration", default_value = "rings")]
    integration: String,

    /// Fix the prediction profile radius (m^-1).
    #[arg(long = "fix-profile-radius")]
    fix_profile_radius: Option<f64>,

    /// Fix the beam divergence (rad, full angle).
    #[arg(long = "fix-divergence")]
    fix_divergence: Option<f64>,

    /// Cell comparison tolerances: a,b,c in percent, angles in degrees.
    #[arg(long = "tolerance", default_value = "5.0,1.5")]
    tolerance: String,

    /// Don't check candidate cells against the target cell.
    #[arg(long = "no-check-cell")]
    no_check_cell: bool,

    /// Don't try further indexing engines after a failure.
    #[arg(long = "no-retry")]
    no_retry: bool,

    /// Repeat indexing to find overlapping lattices.
    #[arg(long = "multi")]
    multi: bool,

    /// Skip prediction refinement.
    #[arg(long = "no-refine")]
    no_refine: bool,

    /// Don't require detected peaks to match the predicted lattice.
    #[arg(long = "no-check-peaks")]
    no_check_peaks: bool,

    /// Integrate predictions even when no peak is nearby.
    #[arg(long = "overpredict")]
    overpredict: bool,

    /// Resolution cutoff in Angstroms for scalable reflections.
    #[arg(long = "highres")]
    highres: Option<f64>,

    /// Reject peaks containing saturated pixels.
    #[arg(long = "no-use-saturated")]
    no_use_saturated: bool,

    /// Don't add 0.5 px to imported peak coordinates.
    #[arg(long = "no-half-pixel-shift")]
    no_half_pixel_shift: bool,

    /// Location for temporary indexer scratch directories.
    #[arg(long = "temp-dir", default_value = ".")]
    temp_dir: PathBuf,

    /// First frame serial number in the stream.
    #[arg(long = "serial-start", default_value = "1")]
    serial_start: usize,
}

fn parse_radii(arg: &str) -> CliResult<(f64, f64, f64)> {
    let parts: Vec<f64> = arg
        .split(',')
        .map(|t| t.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| -> CliError { format!("invalid --int-radius '{arg}'").into() })?;
    if parts.len() != 3 || parts[0] <= 0.0 || parts[0] >= parts[1] || parts[1] >= parts[2] {
        return Err(format!("--int-radius needs inner < mid < outer, got '{arg}'").into());
    }
    Ok((parts[0], parts[1], parts[2]))
}

fn parse_tolerances(arg: &str) -> CliResult<CellTolerances> {
    let parts: Vec<f64> = arg
        .split(',')
        .map(|t| t.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| -> CliError { format!("invalid --tolerance '{arg}'").into() })?;
    match parts.as_slice() {
        [percent, degrees] => Ok(CellTolerances {
            length_frac: percent / 100.0,
            angle_rad: degrees.to_radians(),
        }),
        _ => Err(format!("--tolerance needs 'percent,degrees', got '{arg}'").into()),
    }
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let argv: Vec<String> = std::env::args().collect();

    let (detector, beam_defaults, geometry_text) = load_geometry(&cli.geometry)
        .map_err(|e| -> CliError { format!("failed to load geometry: {e}").into() })?;

    let target_cell = match &cli.cell {
        Some(path) => Some(
            cellparse::load_cell(path)
                .map_err(|e| -> CliError { format!("failed to load cell: {e}").into() })?,
        ),
        None => None,
    };

    let mut beam = BeamParams::default().with_geometry_defaults(&beam_defaults);
    if let Some(div) = cli.fix_divergence {
        beam.divergence = div;
    }
    if let Some(r) = cli.fix_profile_radius {
        beam.profile_radius = r;
    }

    // Peak search configuration.
    let mut peak_search = PeakSearchConfig::default();
    let import_peaks = cli.peaks == "msgpack";
    peak_search.method = if import_peaks {
        PeakSearchMethod::None
    } else {
        PeakSearchMethod::from_str_opt(&cli.peaks)
            .ok_or_else(|| -> CliError { format!("unknown peak method '{}'", cli.peaks).into() })?
    };
    peak_search.zaef.threshold = cli.threshold;
    peak_search.zaef.min_sq_gradient = cli.min_sq_gradient;
    peak_search.peakfinder.adu_threshold = cli.threshold;
    peak_search.peakfinder.min_snr = cli.min_snr;
    peak_search.peakfinder.min_pix_count = cli.min_pix_count;
    peak_search.peakfinder.max_pix_count = cli.max_pix_count;
    peak_search.peakfinder.local_bg_radius = cli.local_bg_radius;
    peak_search.peakfinder.min_res = cli.min_res;
    peak_search.peakfinder.max_res = cli.max_res;

    // Integration configuration.
    let (ir_inn, ir_mid, ir_out) = parse_radii(&cli.int_radius)?;
    let mut method = IntegrationMethod::parse(&cli.integration)
        .map_err(|e| -> CliError { e.to_string().into() })?;
    if cli.no_use_saturated {
        method.use_saturated = false;
    }
    let integration = IntegrationConfig {
        method,
        ir_inn,
        ir_mid,
        ir_out,
        // Angstroms to 1/d in inverse metres.
        highres_limit: cli.highres.map_or(f64::INFINITY, |a| 1.0 / (a * 1e-10)),
        overpredict: cli.overpredict,
    };

    // Indexing driver. The in-process template engine needs a target
    // cell; without one, indexing is disabled and the run only finds
    // peaks.
    let methods: Vec<Box<dyn Indexer>> = match &target_cell {
        Some(cell) => vec![Box::new(TemplateIndexer::new(cell.clone()))],
        None => {
            tracing::warn!("no target cell given: indexing disabled, writing peaks only");
            Vec::new()
        }
    };
    let driver = IndexingDriver::new(
        methods,
        IndexingConfig {
            check_cell: !cli.no_check_cell && target_cell.is_some(),
            refine: !cli.no_refine,
            check_peaks: !cli.no_check_peaks,
            retry: !cli.no_retry,
            multi: cli.multi,
            tolerances: parse_tolerances(&cli.tolerance)?,
            target_cell: target_cell.clone(),
            ..IndexingConfig::default()
        },
    );

    let config = PipelineConfig {
        peak_search,
        median_filter: cli.median_filter,
        noise_filter: cli.filter_noise,
        min_peaks: cli.min_peaks,
        integration,
        profile_radius: beam.profile_radius,
        serial_start: cli.serial_start,
        ..PipelineConfig::default()
    };

    // Input and output.
    let files = MsgpackFileSource::read_file_list(&cli.input)
        .map_err(|e| -> CliError { format!("failed to read input list: {e}").into() })?;
    if files.is_empty() {
        return Err("input list names no frames".into());
    }
    let mut source = MsgpackFileSource::new(files, detector, beam);
    source.import_peaks = import_peaks;
    source.half_pixel_shift = !cli.no_half_pixel_shift;

    let out = File::create(&cli.output)
        .map_err(|e| -> CliError { format!("failed to open stream output: {e}").into() })?;
    let writer = StreamWriter::new(BufWriter::new(out));
    writer.write_prologue(
        &format!("sfxpipe {}", sfxpipe_core::VERSION),
        &argv,
        &geometry_text,
        target_cell.as_ref(),
    )?;

    let summary = process_frames(
        Box::new(source),
        &driver,
        &writer,
        &config,
        cli.n_threads,
        &cli.temp_dir,
        None,
    )?;

    println!(
        "{} frames processed, {} hits ({:.1}%), {} indexed ({:.1}%), {} crystals",
        summary.n_frames,
        summary.n_hits,
        summary.hit_rate() * 100.0,
        summary.n_indexed,
        summary.indexing_rate() * 100.0,
        summary.n_crystals
    );
    Ok(())
}
