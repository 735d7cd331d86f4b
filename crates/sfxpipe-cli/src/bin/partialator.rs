//! partialator — scaling and post-refinement of a stream into a merged
//! reflection list.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use clap::Parser;

use sfxpipe_cli::{read_hkl, write_hkl, BarProgress};
use sfxpipe_core::geometry::parse::geometry_from_str;
use sfxpipe_core::image::BeamParams;
use sfxpipe_core::pool::Progress;
use sfxpipe_core::scale::{scale_and_post_refine, ScaleConfig};
use sfxpipe_core::stream::{chunk_beam, count_chunks, StreamReader};
use sfxpipe_core::symmetry::PointGroup;
use sfxpipe_core::Crystal;

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "partialator")]
#[command(about = "Scaling and post-refinement of partial reflections from a stream")]
#[command(version)]
struct Cli {
    /// Input stream.
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// Output merged reflection list.
    #[arg(short = 'o', long = "output", default_value = "partialator.hkl")]
    output: PathBuf,

    /// Merge according to this point group.
    #[arg(short = 'y', long = "symmetry")]
    symmetry: String,

    /// Beam parameter file (initial divergence, bandwidth, profile
    /// radius, nominal photon energy).
    #[arg(short = 'b', long = "beam")]
    beam: PathBuf,

    /// Cycles of scaling and post-refinement.
    #[arg(short = 'n', long = "iterations", default_value = "10")]
    iterations: usize,

    /// Run this many analyses in parallel.
    #[arg(short = 'j', default_value = "1")]
    n_threads: usize,

    /// Refine against this reflection list instead of the running merge.
    #[arg(long = "reference")]
    reference: Option<PathBuf>,

    /// Drop negative observations from the scale step.
    #[arg(long = "exclude-negative")]
    exclude_negative: bool,
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let pg = PointGroup::parse(&cli.symmetry)
        .map_err(|e| -> CliError { format!("bad point group: {e}").into() })?;
    let beam_text = fs::read_to_string(&cli.beam)
        .map_err(|e| -> CliError { format!("failed to read beam file: {e}").into() })?;
    let beam = BeamParams::parse(&beam_text)
        .map_err(|e| -> CliError { format!("bad beam file: {e}").into() })?;

    let reference = match &cli.reference {
        Some(path) => {
            let text = fs::read_to_string(path)
                .map_err(|e| -> CliError { format!("failed to read reference: {e}").into() })?;
            Some(read_hkl(&text)?.asymmetric_indices(&pg))
        }
        None => None,
    };

    // First pass: count chunks so loading can report progress.
    let n_chunks = count_chunks(BufReader::new(File::open(&cli.input)?))?;
    if n_chunks == 0 {
        return Err("no chunks to process".into());
    }
    tracing::info!(n_chunks, "patterns to process");

    // Load the stream: one crystal list per indexed pattern, keyed by
    // asymmetric-unit indices.
    let mut reader = StreamReader::new(BufReader::new(File::open(&cli.input)?));
    let mut crystals: Vec<Crystal> = Vec::new();
    let bar = BarProgress::new(n_chunks as u64);
    let mut n_read = 0usize;
    while let Some(chunk) = reader.read_chunk()? {
        n_read += 1;
        bar.report(n_read, n_chunks, "Loading");
        for sc in &chunk.crystals {
            let mut snapshot = chunk_beam(&chunk);
            snapshot.divergence = beam.divergence;
            snapshot.bandwidth = beam.bandwidth;
            let mut crystal = sc.to_crystal(snapshot);
            if crystal.reflections.is_empty() {
                continue;
            }
            crystal.profile_radius = beam.profile_radius;
            crystal.reflections = crystal.reflections.asymmetric_indices(&pg);
            crystals.push(crystal);
        }
    }
    bar.finish();
    if crystals.is_empty() {
        return Err("stream holds no indexed crystals".into());
    }
    tracing::info!(n_crystals = crystals.len(), "usable patterns loaded");

    // The stream prologue carries the geometry this data was processed
    // with; predictions during refinement need it.
    let geometry_text = reader
        .geometry_text
        .as_deref()
        .ok_or_else(|| -> CliError { "stream carries no geometry".into() })?;
    let (detector, _defaults) = geometry_from_str(geometry_text)
        .map_err(|e| -> CliError { format!("bad geometry in stream: {e}").into() })?;

    let config = ScaleConfig {
        n_iter: cli.iterations,
        n_threads: cli.n_threads,
        include_negative: !cli.exclude_negative,
        ..ScaleConfig::default()
    };
    let refine_bar = BarProgress::new(crystals.len() as u64);
    let full = scale_and_post_refine(
        &mut crystals,
        &detector,
        reference.as_ref(),
        &config,
        Some(&refine_bar),
    )
    .map_err(|e| -> CliError { format!("scaling failed: {e}").into() })?;
    refine_bar.finish();

    // Final per-pattern report.
    let n_dud = crystals.iter().filter(|c| c.pr_dud).count();
    println!("Final scale factors:");
    for (i, c) in crystals.iter().enumerate() {
        println!("{i:5} : {:7.3}{}", c.osf, if c.pr_dud { "  (dud)" } else { "" });
    }
    println!(
        "{} of {} patterns could not be refined on the last cycle.",
        n_dud,
        crystals.len()
    );

    let out = File::create(&cli.output)
        .map_err(|e| -> CliError { format!("failed to open output: {e}").into() })?;
    write_hkl(BufWriter::new(out), &full)?;
    tracing::info!(
        n_reflections = full.len(),
        output = %cli.output.display(),
        "merged reflection list written"
    );
    Ok(())
}
