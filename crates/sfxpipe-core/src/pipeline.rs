//! Per-frame processing pipeline.
//!
//! Frames are pulled from a [`FrameSource`] (the image decoder is an
//! external collaborator behind that trait), pushed through optional
//! pixel filters, peak search, indexing, prediction and integration, and
//! emitted as stream chunks. Frames are dispatched to the worker pool in
//! streaming mode; chunk writing serialises on the stream writer's own
//! lock, so chunks land byte-contiguous in the output in completion
//! order.
//!
//! Per-frame failures never abort the run: the failure becomes the
//! chunk's status token and processing moves on.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::Result;
use crate::image::Image;
use crate::index::{IndexingDriver, IndexingOutcome};
use crate::integrate::{integrate_crystal, IntegrationConfig};
use crate::peaks::{search_peaks, PeakSearchConfig, PeakSearchMethod};
use crate::pool;
use crate::predict::predict_reflections;
use crate::stream::{StreamChunk, StreamCrystal, StreamPeak, StreamWriter};

/// Source of decoded frames.
///
/// Implementations wrap whatever file format or network feed provides the
/// data. `next_frame` is called under the pool lock; decoding work should
/// happen in the returned frame's buffers, not in the factory itself,
/// when it can be deferred.
pub trait FrameSource: Send {
    /// The next frame, `Ok(None)` at end of input. Decode failures are
    /// reported per frame and skipped by the pipeline.
    fn next_frame(&mut self) -> Result<Option<Image>>;
}

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub peak_search: PeakSearchConfig,
    /// Median-filter half-width in pixels; 0 disables.
    pub median_filter: usize,
    pub noise_filter: bool,
    /// Frames with fewer peaks than this are not sent to the indexers.
    pub min_peaks: usize,
    pub integration: IntegrationConfig,
    /// Initial reciprocal-space profile radius for accepted crystals
    /// (m⁻¹).
    pub profile_radius: f64,
    /// Emit the peak table into the stream.
    pub stream_peaks: bool,
    /// Emit reflection tables into the stream.
    pub stream_refls: bool,
    /// Emit chunks for frames that were not hits.
    pub stream_nonhits: bool,
    /// First serial number assigned to a frame.
    pub serial_start: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            peak_search: PeakSearchConfig::default(),
            median_filter: 0,
            noise_filter: false,
            min_peaks: 0,
            integration: IntegrationConfig::default(),
            profile_radius: 3.0e6,
            stream_peaks: true,
            stream_refls: true,
            stream_nonhits: true,
            serial_start: 1,
        }
    }
}

/// Totals reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub n_frames: usize,
    pub n_load_failed: usize,
    pub n_hits: usize,
    pub n_indexed: usize,
    pub n_crystals: usize,
}

impl PipelineSummary {
    pub fn indexing_rate(&self) -> f64 {
        if self.n_frames == 0 {
            0.0
        } else {
            self.n_indexed as f64 / self.n_frames as f64
        }
    }

    pub fn hit_rate(&self) -> f64 {
        if self.n_frames == 0 {
            0.0
        } else {
            self.n_hits as f64 / self.n_frames as f64
        }
    }
}

struct FrameCounters {
    n_frames: AtomicUsize,
    n_hits: AtomicUsize,
    n_indexed: AtomicUsize,
    n_crystals: AtomicUsize,
}

/// Process one decoded frame into a stream chunk.
///
/// Public so that hosts with their own scheduling can drive frames
/// individually; [`process_frames`] is the pooled entry point.
pub fn process_frame(
    image: &mut Image,
    driver: &IndexingDriver,
    config: &PipelineConfig,
    scratch: &Path,
) -> StreamChunk {
    if config.median_filter > 0 {
        for panel in &mut image.panels {
            panel.median_filter(config.median_filter);
        }
    }
    if config.noise_filter {
        for panel in &mut image.panels {
            panel.noise_filter();
        }
    }

    let mut status = "not_indexed".to_string();
    let mut indexed_by = "none".to_string();

    if config.peak_search.method != PeakSearchMethod::None {
        if let Err(e) = search_peaks(image, &config.peak_search) {
            status = e.status_token().to_string();
        }
    }

    let hit = image.features.len() >= config.min_peaks;
    if hit && !image.features.is_empty() {
        match driver.index_image(image, scratch) {
            IndexingOutcome::Indexed { method, .. } => {
                status = "indexed".into();
                indexed_by = method;
                for crystal in &mut image.crystals {
                    crystal.profile_radius = config.profile_radius;
                    if let Err(e) = predict_reflections(crystal, &image.detector) {
                        tracing::warn!(error = %e, "prediction failed");
                        continue;
                    }
                }
                // Integration borrows the frame immutably, so crystals
                // step out of the image for the duration.
                let mut crystals = std::mem::take(&mut image.crystals);
                for crystal in &mut crystals {
                    if let Err(e) = integrate_crystal(crystal, image, &config.integration) {
                        tracing::warn!(error = %e, "integration failed");
                        status = e.status_token().to_string();
                    }
                }
                image.crystals = crystals;
            }
            IndexingOutcome::Rejected(e) => {
                status = e.status_token().to_string();
            }
        }
    } else {
        status = "too_few_peaks".into();
    }

    tracing::info!(
        "{} {} {} n_peaks={} n_cryst={}",
        image.filename,
        if image.event.is_empty() { "-" } else { &image.event },
        status,
        image.features.len(),
        image.crystals.len()
    );

    let mut chunk = StreamChunk {
        filename: image.filename.clone(),
        event: image.event.clone(),
        serial: image.serial,
        status,
        indexed_by,
        photon_energy_ev: crate::image::PHOTON_EV_M / image.lambda,
        divergence: image.divergence,
        bandwidth: image.bandwidth,
        peaks: Vec::new(),
        crystals: Vec::new(),
    };

    if config.stream_peaks {
        chunk.peaks = image
            .features
            .iter()
            .map(|p| StreamPeak {
                fs: p.fs,
                ss: p.ss,
                panel: image.detector.panels[p.panel].name.clone(),
                intensity: p.intensity,
            })
            .collect();
    }
    if config.stream_refls {
        for crystal in &image.crystals {
            match StreamCrystal::from_crystal(crystal) {
                Ok(c) => chunk.crystals.push(c),
                Err(e) => tracing::warn!(error = %e, "crystal could not be serialised"),
            }
        }
    }
    chunk
}

/// Run the full pipeline over every frame of `source` on `n_threads`
/// workers, writing chunks to `writer`.
pub fn process_frames<W: Write + Send>(
    mut source: Box<dyn FrameSource>,
    driver: &IndexingDriver,
    writer: &StreamWriter<W>,
    config: &PipelineConfig,
    n_threads: usize,
    temp_dir: &Path,
    stop: Option<&AtomicBool>,
) -> Result<PipelineSummary> {
    let counters = FrameCounters {
        n_frames: AtomicUsize::new(0),
        n_hits: AtomicUsize::new(0),
        n_indexed: AtomicUsize::new(0),
        n_crystals: AtomicUsize::new(0),
    };
    let n_load_failed = AtomicUsize::new(0);
    let serial = AtomicUsize::new(config.serial_start);
    let write_errors = Mutex::new(Vec::new());

    pool::run_stream(
        n_threads,
        || loop {
            match source.next_frame() {
                Ok(Some(mut image)) => {
                    image.serial = serial.fetch_add(1, Ordering::Relaxed);
                    return Some(image);
                }
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load a frame, skipping");
                    n_load_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        },
        |mut image| {
            // Child indexer processes drop their files into a scratch
            // directory private to this frame.
            let scratch = match tempfile::Builder::new()
                .prefix("sfxpipe-")
                .tempdir_in(temp_dir)
            {
                Ok(dir) => dir,
                Err(e) => {
                    tracing::warn!(error = %e, "no scratch directory, skipping frame");
                    return;
                }
            };

            let chunk = process_frame(&mut image, driver, config, scratch.path());

            counters.n_frames.fetch_add(1, Ordering::Relaxed);
            if chunk.status != "too_few_peaks" {
                counters.n_hits.fetch_add(1, Ordering::Relaxed);
            }
            if !image.crystals.is_empty() {
                counters.n_indexed.fetch_add(1, Ordering::Relaxed);
                counters
                    .n_crystals
                    .fetch_add(image.crystals.len(), Ordering::Relaxed);
            }

            if config.stream_nonhits || !image.crystals.is_empty() {
                if let Err(e) = writer.write_chunk(&chunk) {
                    write_errors.lock().expect("write error lock").push(e);
                }
            }
        },
        || {},
        usize::MAX,
        stop,
    );

    if let Some(e) = write_errors
        .into_inner()
        .expect("write error lock")
        .into_iter()
        .next()
    {
        return Err(e);
    }

    let summary = PipelineSummary {
        n_frames: counters.n_frames.into_inner(),
        n_load_failed: n_load_failed.into_inner(),
        n_hits: counters.n_hits.into_inner(),
        n_indexed: counters.n_indexed.into_inner(),
        n_crystals: counters.n_crystals.into_inner(),
    };
    tracing::info!(
        frames = summary.n_frames,
        hits = summary.n_hits,
        indexed = summary.n_indexed,
        crystals = summary.n_crystals,
        "pipeline finished: hit rate {:.1}%, indexing rate {:.1}%",
        summary.hit_rate() * 100.0,
        summary.indexing_rate() * 100.0
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::UnitCell;
    use crate::crystal::BeamSnapshot;
    use crate::error::EngineError;
    use crate::geometry::Detector;
    use crate::image::BeamParams;
    use crate::index::{IndexingConfig, TemplateIndexer};
    use crate::predict::find_intersections;
    use crate::stream::StreamReader;
    use std::f64::consts::FRAC_PI_2;
    use std::io::BufReader;

    const R_P: f64 = 3.0e6;

    fn cubic_10nm() -> UnitCell {
        UnitCell::from_parameters(10e-9, 10e-9, 10e-9, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2)
    }

    fn paint_gaussian(panel: &mut crate::image::PanelData, cx: f64, cy: f64, amp: f64) {
        let sigma = 1.5f64;
        let r = 8i64;
        let x0 = cx.round() as i64;
        let y0 = cy.round() as i64;
        for y in (y0 - r).max(0)..(y0 + r).min(panel.h as i64) {
            for x in (x0 - r).max(0)..(x0 + r).min(panel.w as i64) {
                let dx = x as f64 - cx;
                let dy = y as f64 - cy;
                let v = amp * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
                let i = panel.idx(x as usize, y as usize);
                panel.data[i] += v as f32;
            }
        }
    }

    /// Frames carrying diffraction-like spots at the predicted positions
    /// of the known cell.
    struct SyntheticSource {
        remaining: usize,
        detector: Detector,
        cell: UnitCell,
        fail_one: bool,
    }

    impl FrameSource for SyntheticSource {
        fn next_frame(&mut self) -> Result<Option<Image>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            if self.fail_one {
                self.fail_one = false;
                return Err(EngineError::MalformedInput("corrupt frame".into()));
            }

            let mut img = Image::new(&self.detector, &BeamParams::default())?;
            img.filename = format!("synth-{:04}.h5", self.remaining);
            let snapshot = BeamSnapshot {
                lambda: img.lambda,
                divergence: img.divergence,
                bandwidth: img.bandwidth,
            };
            let predicted =
                find_intersections(&self.cell, &snapshot, R_P, &self.detector)?;
            for refl in predicted.iter() {
                let d = refl.get();
                paint_gaussian(&mut img.panels[d.panel], d.fs, d.ss, 10_000.0);
            }
            Ok(Some(img))
        }
    }

    #[test]
    fn synthetic_frames_index_and_stream() {
        let detector = Detector::simple(1024, 1024, 13333.3, 80e-3);
        let cell = cubic_10nm();
        let source = Box::new(SyntheticSource {
            remaining: 3,
            detector: detector.clone(),
            cell: cell.clone(),
            fail_one: true,
        });

        let driver = IndexingDriver::new(
            vec![Box::new(TemplateIndexer::new(cell.clone()))],
            IndexingConfig {
                target_cell: Some(cell),
                ..IndexingConfig::default()
            },
        );
        let writer = StreamWriter::new(Vec::<u8>::new());
        let config = PipelineConfig {
            min_peaks: 10,
            profile_radius: R_P,
            integration: IntegrationConfig {
                overpredict: true,
                ..IntegrationConfig::default()
            },
            ..PipelineConfig::default()
        };
        let tmp = tempfile::tempdir().unwrap();

        let summary = process_frames(
            source,
            &driver,
            &writer,
            &config,
            2,
            tmp.path(),
            None,
        )
        .unwrap();

        assert_eq!(summary.n_frames, 2);
        assert_eq!(summary.n_load_failed, 1);
        assert_eq!(summary.n_indexed, 2, "both good frames should index");
        assert!(summary.n_crystals >= 2);

        let text = String::from_utf8(writer.into_inner()).unwrap();
        let mut reader = StreamReader::new(BufReader::new(text.as_bytes()));
        let mut n_chunks = 0;
        while let Some(chunk) = reader.read_chunk().unwrap() {
            n_chunks += 1;
            assert_eq!(chunk.status, "indexed");
            assert!(!chunk.peaks.is_empty());
            assert_eq!(chunk.crystals.len(), 1);
            assert!(!chunk.crystals[0].reflections.is_empty());
        }
        assert_eq!(n_chunks, 2);
    }

    #[test]
    fn empty_frames_are_recorded_as_non_hits() {
        let detector = Detector::simple(256, 256, 10000.0, 0.1);
        struct EmptySource(usize, Detector);
        impl FrameSource for EmptySource {
            fn next_frame(&mut self) -> Result<Option<Image>> {
                if self.0 == 0 {
                    return Ok(None);
                }
                self.0 -= 1;
                let mut img = Image::new(&self.1, &BeamParams::default())?;
                img.filename = "blank.h5".into();
                Ok(Some(img))
            }
        }

        let driver = IndexingDriver::new(
            vec![Box::new(TemplateIndexer::new(cubic_10nm()))],
            IndexingConfig {
                target_cell: Some(cubic_10nm()),
                ..IndexingConfig::default()
            },
        );
        let writer = StreamWriter::new(Vec::<u8>::new());
        let config = PipelineConfig {
            min_peaks: 5,
            ..PipelineConfig::default()
        };
        let tmp = tempfile::tempdir().unwrap();

        let summary = process_frames(
            Box::new(EmptySource(2, detector)),
            &driver,
            &writer,
            &config,
            1,
            tmp.path(),
            None,
        )
        .unwrap();
        assert_eq!(summary.n_frames, 2);
        assert_eq!(summary.n_hits, 0);
        assert_eq!(summary.n_indexed, 0);

        let text = String::from_utf8(writer.into_inner()).unwrap();
        let mut reader = StreamReader::new(BufReader::new(text.as_bytes()));
        let chunk = reader.read_chunk().unwrap().expect("non-hits are streamed");
        assert_eq!(chunk.status, "too_few_peaks");
    }
}
