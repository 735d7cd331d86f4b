//! Indexing driver.
//!
//! The actual auto-indexing engines are external programs (or in-process
//! stand-ins for testing); each one sits behind the [`Indexer`] trait. The
//! driver feeds them reciprocal-space peak positions, applies the
//! acceptance gates (cell match, prediction refinement, peak alignment)
//! to every candidate cell, and handles the retry and multi-lattice
//! policies.
//!
//! Contract for implementations: `index` must honour the scratch
//! directory it is given (child processes drop their files there, each
//! worker gets a private one) and should return within
//! [`Indexer::timeout`]; the driver counts an overrun as an indexer
//! timeout and cancels the engine.

use std::path::Path;
use std::time::{Duration, Instant};

use nalgebra::Vector3;

use crate::cell::{match_cell, CellTolerances, UnitCell};
use crate::crystal::{BeamSnapshot, Crystal};
use crate::error::{EngineError, Result};
use crate::image::Image;
use crate::refine::{self, RefineConfig};

/// Default per-call indexer timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(240);
/// Extended timeout for slow engines.
pub const SLOW_TIMEOUT: Duration = Duration::from_secs(3000);

/// A detected peak mapped into reciprocal space.
#[derive(Debug, Clone, Copy)]
pub struct IndexablePeak {
    pub fs: f64,
    pub ss: f64,
    pub panel: usize,
    pub intensity: f64,
    /// Scattering vector in m⁻¹.
    pub q: Vector3<f64>,
}

/// Frame-level values an indexing engine may need.
#[derive(Debug, Clone, Copy)]
pub struct ImageMeta {
    pub lambda: f64,
    /// Largest |q| reachable on the detector (m⁻¹).
    pub largest_q: f64,
}

/// One auto-indexing engine, set up for a run.
///
/// Construction is the `setup` step of the engine lifecycle; dropping the
/// boxed engine is `teardown`.
pub trait Indexer: Send + Sync {
    fn name(&self) -> &str;

    /// Per-call wall-clock budget.
    fn timeout(&self) -> Duration {
        DEFAULT_TIMEOUT
    }

    /// Produce candidate cells for the peaks of one frame. `scratch` is a
    /// private directory for any files the engine (or its child process)
    /// needs to drop.
    fn index(
        &self,
        peaks: &[IndexablePeak],
        meta: &ImageMeta,
        scratch: &Path,
    ) -> Result<Vec<UnitCell>>;

    /// Ask a running call to stop (used on timeout and cancellation).
    fn cancel(&self) {}
}

/// Acceptance gates and policies for the driver.
#[derive(Debug, Clone)]
pub struct IndexingConfig {
    /// Match every candidate against the target cell.
    pub check_cell: bool,
    /// Run prediction refinement on accepted candidates.
    pub refine: bool,
    /// Require detected peaks to line up with the candidate lattice.
    pub check_peaks: bool,
    /// Try the next engine when one fails.
    pub retry: bool,
    /// After a success, remove explained peaks and look for further
    /// lattices.
    pub multi: bool,
    pub tolerances: CellTolerances,
    pub target_cell: Option<UnitCell>,
    /// Fraction of peaks that must sit near predicted lattice points for
    /// the peak-alignment gate.
    pub min_peak_fraction: f64,
    /// Fractional-index distance below which a peak counts as explained.
    pub index_tolerance: f64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            check_cell: true,
            refine: true,
            check_peaks: true,
            retry: true,
            multi: false,
            tolerances: CellTolerances::default(),
            target_cell: None,
            min_peak_fraction: 0.1,
            index_tolerance: 0.25,
        }
    }
}

/// Map the frame's features into reciprocal space, skipping panels that
/// are excluded from indexing.
pub fn map_peaks(image: &Image) -> Vec<IndexablePeak> {
    let k = 1.0 / image.lambda;
    image
        .features
        .iter()
        .filter(|f| !image.detector.panels[f.panel].no_index)
        .map(|f| IndexablePeak {
            fs: f.fs,
            ss: f.ss,
            panel: f.panel,
            intensity: f.intensity,
            q: image.detector.panels[f.panel].scattering_vector(f.fs, f.ss, k),
        })
        .collect()
}

/// Fraction of peaks whose fractional Miller indices under `cell` are
/// within `tol` of integers.
pub fn aligned_peak_fraction(peaks: &[IndexablePeak], cell: &UnitCell, tol: f64) -> Result<f64> {
    if peaks.is_empty() {
        return Ok(0.0);
    }
    let direct = cell.cartesian()?;
    let mut n_good = 0usize;
    for p in peaks {
        // h = a·q, k = b·q, l = c·q.
        let frac = direct.transpose() * p.q;
        let near = frac
            .iter()
            .all(|component| (component - component.round()).abs() <= tol);
        if near {
            n_good += 1;
        }
    }
    Ok(n_good as f64 / peaks.len() as f64)
}

fn explained_by(peak: &IndexablePeak, cell: &UnitCell, tol: f64) -> bool {
    match cell.cartesian() {
        Ok(direct) => {
            let frac = direct.transpose() * peak.q;
            frac.iter().all(|c| (c - c.round()).abs() <= tol)
        }
        Err(_) => false,
    }
}

/// Why a frame ended up without (more) crystals.
#[derive(Debug)]
pub enum IndexingOutcome {
    /// At least one crystal was accepted.
    Indexed {
        n_crystals: usize,
        /// Name of the engine whose candidate was accepted first.
        method: String,
    },
    /// Every engine and candidate was rejected.
    Rejected(EngineError),
}

/// The indexing driver: an ordered list of engines plus the policies.
pub struct IndexingDriver {
    methods: Vec<Box<dyn Indexer>>,
    pub config: IndexingConfig,
    refine_config: RefineConfig,
}

impl IndexingDriver {
    pub fn new(methods: Vec<Box<dyn Indexer>>, config: IndexingConfig) -> Self {
        Self {
            methods,
            config,
            refine_config: RefineConfig::default(),
        }
    }

    /// The longest timeout any engine asks for (used for scheduling hints).
    pub fn max_timeout(&self) -> Duration {
        self.methods
            .iter()
            .map(|m| m.timeout())
            .max()
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Index one frame, appending accepted crystals to it.
    ///
    /// `scratch` must be a private directory for this worker. Returns how
    /// many crystals were added, or the last rejection.
    pub fn index_image(&self, image: &mut Image, scratch: &Path) -> IndexingOutcome {
        let beam = BeamSnapshot {
            lambda: image.lambda,
            divergence: image.divergence,
            bandwidth: image.bandwidth,
        };
        let meta = ImageMeta {
            lambda: image.lambda,
            largest_q: image.detector.largest_q(image.lambda),
        };

        let mut peaks = map_peaks(image);
        let mut n_accepted = 0usize;
        let mut method = String::new();
        let mut last_error =
            EngineError::IndexerRejected("no indexing engines configured".into());

        loop {
            let accepted_this_pass =
                match self.one_pass(image, &peaks, &meta, &beam, scratch) {
                    Ok((crystal, engine)) => {
                        if method.is_empty() {
                            method = engine;
                        }
                        if self.config.multi {
                            let cell = crystal.cell.clone();
                            let tol = self.config.index_tolerance;
                            peaks.retain(|p| !explained_by(p, &cell, tol));
                        }
                        image.crystals.push(crystal);
                        n_accepted += 1;
                        true
                    }
                    Err(e) => {
                        last_error = e;
                        false
                    }
                };

            // Only the multi policy loops, and only while it keeps
            // finding lattices with enough peaks left over.
            if !(self.config.multi && accepted_this_pass && peaks.len() >= 3) {
                break;
            }
        }

        if n_accepted > 0 {
            IndexingOutcome::Indexed {
                n_crystals: n_accepted,
                method,
            }
        } else {
            IndexingOutcome::Rejected(last_error)
        }
    }

    /// Try every engine once over the given peaks; first accepted
    /// candidate wins.
    fn one_pass(
        &self,
        image: &Image,
        peaks: &[IndexablePeak],
        meta: &ImageMeta,
        beam: &BeamSnapshot,
        scratch: &Path,
    ) -> Result<(Crystal, String)> {
        let mut last_error =
            EngineError::IndexerRejected("no indexing engines configured".into());

        for method in &self.methods {
            let started = Instant::now();
            let candidates = match method.index(peaks, meta, scratch) {
                Ok(c) => c,
                Err(e) => {
                    tracing::debug!(engine = method.name(), error = %e, "indexing failed");
                    last_error = e;
                    if self.config.retry {
                        continue;
                    }
                    break;
                }
            };
            if started.elapsed() > method.timeout() {
                method.cancel();
                last_error = EngineError::IndexerTimeout(method.timeout().as_secs());
                tracing::warn!(engine = method.name(), "indexer exceeded its time budget");
                if self.config.retry {
                    continue;
                }
                break;
            }
            if candidates.is_empty() {
                last_error =
                    EngineError::IndexerRejected(format!("{}: no candidate cells", method.name()));
                if self.config.retry {
                    continue;
                }
                break;
            }

            for candidate in candidates {
                match self.vet_candidate(image, peaks, beam, candidate) {
                    Ok(crystal) => return Ok((crystal, method.name().to_string())),
                    Err(e) => last_error = e,
                }
            }
            if !self.config.retry {
                break;
            }
        }

        Err(last_error)
    }

    /// Apply the acceptance gates to one candidate cell.
    fn vet_candidate(
        &self,
        image: &Image,
        peaks: &[IndexablePeak],
        beam: &BeamSnapshot,
        candidate: UnitCell,
    ) -> Result<Crystal> {
        let cell = if self.config.check_cell {
            let Some(target) = self.config.target_cell.as_ref() else {
                return Err(EngineError::MalformedInput(
                    "cell checking requested without a target cell".into(),
                ));
            };
            match match_cell(&candidate, target, &self.config.tolerances)? {
                Some(matched) => matched,
                None => {
                    return Err(EngineError::IndexerRejected(
                        "candidate cell does not match the target".into(),
                    ))
                }
            }
        } else {
            candidate
        };

        let mut crystal = Crystal::new(cell, *beam);

        if self.config.refine {
            refine::refine_prediction(&mut crystal, image, &self.refine_config)?;
        }

        if self.config.check_peaks {
            let frac =
                aligned_peak_fraction(peaks, &crystal.cell, self.config.index_tolerance)?;
            if frac < self.config.min_peak_fraction {
                return Err(EngineError::IndexerRejected(format!(
                    "only {:.0}% of peaks align with the candidate lattice",
                    frac * 100.0
                )));
            }
        }

        Ok(crystal)
    }
}

/// Test/bring-up engine that always proposes a fixed cell.
pub struct TemplateIndexer {
    pub cell: UnitCell,
    pub timeout: Duration,
}

impl TemplateIndexer {
    pub fn new(cell: UnitCell) -> Self {
        Self {
            cell,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Indexer for TemplateIndexer {
    fn name(&self) -> &str {
        "template"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn index(
        &self,
        peaks: &[IndexablePeak],
        _meta: &ImageMeta,
        _scratch: &Path,
    ) -> Result<Vec<UnitCell>> {
        if peaks.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![self.cell.clone()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Detector;
    use crate::image::{BeamParams, Image, Peak};
    use crate::predict::find_intersections;
    use std::f64::consts::FRAC_PI_2;

    fn cubic_10nm() -> UnitCell {
        UnitCell::from_parameters(10e-9, 10e-9, 10e-9, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2)
    }

    fn beam() -> BeamParams {
        BeamParams {
            photon_energy: crate::geometry::ValueOrRef::Value(8000.0),
            divergence: 1.0e-3,
            bandwidth: 0.01,
            profile_radius: 3.0e6,
        }
    }

    /// A frame whose peaks are exactly the predicted spot positions of the
    /// known cell.
    fn synthetic_frame() -> (Image, UnitCell) {
        let det = Detector::simple(1024, 1024, 13333.3, 80e-3);
        let cell = cubic_10nm();
        let mut img = Image::new(&det, &beam()).unwrap();
        let snapshot = BeamSnapshot {
            lambda: img.lambda,
            divergence: img.divergence,
            bandwidth: img.bandwidth,
        };
        let predicted = find_intersections(&cell, &snapshot, 3.0e6, &det).unwrap();
        for refl in predicted.iter() {
            let d = refl.get();
            img.features.push(Peak {
                fs: d.fs,
                ss: d.ss,
                panel: d.panel,
                intensity: 1000.0,
            });
        }
        assert!(img.features.len() > 10);
        (img, cell)
    }

    #[test]
    fn template_engine_indexes_its_own_frame() {
        let (mut img, cell) = synthetic_frame();
        let config = IndexingConfig {
            target_cell: Some(cell.clone()),
            refine: false,
            ..IndexingConfig::default()
        };
        let driver = IndexingDriver::new(
            vec![Box::new(TemplateIndexer::new(cell))],
            config,
        );
        let scratch = tempfile::tempdir().unwrap();
        match driver.index_image(&mut img, scratch.path()) {
            IndexingOutcome::Indexed { n_crystals, method } => {
                assert_eq!(n_crystals, 1);
                assert_eq!(method, "template");
            }
            IndexingOutcome::Rejected(e) => panic!("rejected: {e}"),
        }
        assert_eq!(img.crystals.len(), 1);
    }

    #[test]
    fn wrong_cell_fails_the_peak_alignment_gate() {
        let (mut img, _cell) = synthetic_frame();
        let wrong = UnitCell::from_parameters(
            3.7e-9,
            5.3e-9,
            7.1e-9,
            FRAC_PI_2,
            80.0_f64.to_radians(),
            FRAC_PI_2,
        );
        let config = IndexingConfig {
            check_cell: false,
            refine: false,
            min_peak_fraction: 0.5,
            ..IndexingConfig::default()
        };
        let driver = IndexingDriver::new(
            vec![Box::new(TemplateIndexer::new(wrong))],
            config,
        );
        let scratch = tempfile::tempdir().unwrap();
        match driver.index_image(&mut img, scratch.path()) {
            IndexingOutcome::Indexed { .. } => panic!("a wrong cell must be rejected"),
            IndexingOutcome::Rejected(e) => {
                assert!(matches!(e, EngineError::IndexerRejected(_)))
            }
        }
    }

    #[test]
    fn cell_check_rejects_mismatched_target() {
        let (mut img, cell) = synthetic_frame();
        let other_target = UnitCell::from_parameters(
            4.1e-9,
            4.1e-9,
            9.3e-9,
            FRAC_PI_2,
            FRAC_PI_2,
            FRAC_PI_2,
        );
        let config = IndexingConfig {
            target_cell: Some(other_target),
            refine: false,
            check_peaks: false,
            ..IndexingConfig::default()
        };
        let driver = IndexingDriver::new(
            vec![Box::new(TemplateIndexer::new(cell))],
            config,
        );
        let scratch = tempfile::tempdir().unwrap();
        assert!(matches!(
            driver.index_image(&mut img, scratch.path()),
            IndexingOutcome::Rejected(_)
        ));
    }

    #[test]
    fn retry_moves_to_the_second_engine() {
        struct FailingIndexer;
        impl Indexer for FailingIndexer {
            fn name(&self) -> &str {
                "failing"
            }
            fn index(
                &self,
                _peaks: &[IndexablePeak],
                _meta: &ImageMeta,
                _scratch: &Path,
            ) -> Result<Vec<UnitCell>> {
                Err(EngineError::IndexerRejected("nothing found".into()))
            }
        }

        let (mut img, cell) = synthetic_frame();
        let config = IndexingConfig {
            target_cell: Some(cell.clone()),
            refine: false,
            ..IndexingConfig::default()
        };
        let driver = IndexingDriver::new(
            vec![Box::new(FailingIndexer), Box::new(TemplateIndexer::new(cell))],
            config,
        );
        let scratch = tempfile::tempdir().unwrap();
        assert!(matches!(
            driver.index_image(&mut img, scratch.path()),
            IndexingOutcome::Indexed { n_crystals: 1, .. }
        ));
    }

    #[test]
    fn aligned_fraction_is_high_for_the_true_cell() {
        let (img, cell) = synthetic_frame();
        let peaks = map_peaks(&img);
        let frac = aligned_peak_fraction(&peaks, &cell, 0.25).unwrap();
        assert!(frac > 0.9, "aligned fraction {frac}");

        let wrong = UnitCell::from_parameters(
            3.7e-9,
            5.3e-9,
            7.1e-9,
            FRAC_PI_2,
            80.0_f64.to_radians(),
            FRAC_PI_2,
        );
        let frac_wrong = aligned_peak_fraction(&peaks, &wrong, 0.25).unwrap();
        assert!(frac_wrong < frac);
    }
}
