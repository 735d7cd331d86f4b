//! Prediction refinement.
//!
//! After indexing, the predicted spot positions rarely sit exactly on the
//! observed peaks. This stage pairs peaks with predictions and minimises
//! the summed squared position deviation (Δfs, Δss) by adjusting the nine
//! reciprocal-axis components of the cell together with small per-panel
//! translations. Gradients are analytic; the solver is damped
//! Gauss–Newton with Huber down-weighting of outlier pairs.

use nalgebra::{DMatrix, DVector, Matrix2, Matrix3, Vector2, Vector3};

use crate::crystal::Crystal;
use crate::error::{EngineError, Result};
use crate::geometry::Panel;
use crate::image::Image;
use crate::predict::find_intersections;
use crate::symmetry::Hkl;

/// Tuning for the position fit.
#[derive(Debug, Clone)]
pub struct RefineConfig {
    /// Pair a peak with a prediction at most this far away (pixels).
    pub pairing_radius: f64,
    /// Huber soft threshold on the pair residual norm (pixels).
    pub huber_delta: f64,
    pub max_iters: usize,
    /// Stop when the scaled parameter step drops below this.
    pub convergence_step: f64,
    /// Minimum number of pairs to attempt a fit.
    pub min_pairs: usize,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            pairing_radius: 10.0,
            huber_delta: 2.0,
            max_iters: 10,
            convergence_step: 1e-6,
            min_pairs: 10,
        }
    }
}

/// Outcome of one refinement run.
#[derive(Debug, Clone, Default)]
pub struct RefineResult {
    pub n_pairs: usize,
    pub n_iters: usize,
    /// RMS position residual before and after, in pixels.
    pub initial_rms: f64,
    pub final_rms: f64,
    /// Fitted per-panel corner translations (pixels). These absorb
    /// per-frame geometry error during the fit; they are reported rather
    /// than written back to the shared geometry.
    pub panel_shifts: Vec<(f64, f64)>,
}

#[inline]
fn huber_weight(abs_r: f64, delta: f64) -> f64 {
    if abs_r <= delta {
        1.0
    } else {
        delta / abs_r
    }
}

/// Predicted panel-relative position of `hkl` on `panel`, ignoring panel
/// bounds, plus the intersection geometry needed for gradients.
fn predicted_position(
    reciprocal: &Matrix3<f64>,
    hkl: Hkl,
    panel: &Panel,
    shift: (f64, f64),
    k: f64,
) -> Option<(f64, f64)> {
    let node = reciprocal * Vector3::new(hkl.0 as f64, hkl.1 as f64, hkl.2 as f64);
    let scattered = Vector3::new(node.x, node.y, node.z + k);
    if scattered.z <= 0.0 {
        return None;
    }
    let x = panel.clen_value * scattered.x / scattered.z;
    let y = panel.clen_value * scattered.y / scattered.z;
    let dx_px = x * panel.res - (panel.cnx + shift.0);
    let dy_px = y * panel.res - (panel.cny + shift.1);
    let basis = Matrix2::new(panel.fsx, panel.ssx, panel.fsy, panel.ssy);
    let sol = basis.lu().solve(&Vector2::new(dx_px, dy_px))?;
    Some((sol.x, sol.y))
}

/// ∂(fs, ss)/∂node for a reflection on `panel`.
fn position_node_jacobian(
    reciprocal: &Matrix3<f64>,
    hkl: Hkl,
    panel: &Panel,
    k: f64,
) -> Option<[Vector2<f64>; 3]> {
    let node = reciprocal * Vector3::new(hkl.0 as f64, hkl.1 as f64, hkl.2 as f64);
    let scattered = Vector3::new(node.x, node.y, node.z + k);
    if scattered.z <= 0.0 {
        return None;
    }
    let basis = Matrix2::new(panel.fsx, panel.ssx, panel.fsy, panel.ssy);
    let basis_inv = basis.lu().try_inverse()?;

    let sz = scattered.z;
    let c = panel.clen_value * panel.res;
    // d(px)/d(node) rows for x and y of the intersection, in pixels.
    let dpx = Vector3::new(c / sz, 0.0, -c * scattered.x / (sz * sz));
    let dpy = Vector3::new(0.0, c / sz, -c * scattered.y / (sz * sz));

    let mut out = [Vector2::zeros(); 3];
    for component in 0..3 {
        out[component] = basis_inv * Vector2::new(dpx[component], dpy[component]);
    }
    Some(out)
}

/// ∂(fs, ss)/∂(panel corner shift): moving the corner by one pixel moves
/// every prediction by −B⁻¹ in that direction.
fn position_shift_jacobian(panel: &Panel) -> Option<[Vector2<f64>; 2]> {
    let basis = Matrix2::new(panel.fsx, panel.ssx, panel.fsy, panel.ssy);
    let basis_inv = basis.lu().try_inverse()?;
    Some([
        basis_inv * Vector2::new(-1.0, 0.0),
        basis_inv * Vector2::new(0.0, -1.0),
    ])
}

struct Pair {
    hkl: Hkl,
    panel: usize,
    obs_fs: f64,
    obs_ss: f64,
}

/// Match observed peaks to the predictions of `cell` within the pairing
/// radius.
fn pair_peaks(crystal: &Crystal, image: &Image, config: &RefineConfig) -> Result<Vec<Pair>> {
    let predicted = find_intersections(
        &crystal.cell,
        &crystal.beam,
        crystal.profile_radius,
        &image.detector,
    )?;

    let mut pairs = Vec::new();
    for feature in &image.features {
        let mut best: Option<(f64, Hkl)> = None;
        for refl in predicted.iter() {
            let d = refl.get();
            if d.panel != feature.panel {
                continue;
            }
            let dist = ((d.fs - feature.fs).powi(2) + (d.ss - feature.ss).powi(2)).sqrt();
            if dist <= config.pairing_radius && best.map_or(true, |(b, _)| dist < b) {
                best = Some((dist, refl.indices()));
            }
        }
        if let Some((_, hkl)) = best {
            pairs.push(Pair {
                hkl,
                panel: feature.panel,
                obs_fs: feature.fs,
                obs_ss: feature.ss,
            });
        }
    }
    Ok(pairs)
}

fn rms_residual(
    pairs: &[Pair],
    reciprocal: &Matrix3<f64>,
    shifts: &[(f64, f64)],
    image: &Image,
    k: f64,
) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for pair in pairs {
        let panel = &image.detector.panels[pair.panel];
        if let Some((fs, ss)) =
            predicted_position(reciprocal, pair.hkl, panel, shifts[pair.panel], k)
        {
            sum += (fs - pair.obs_fs).powi(2) + (ss - pair.obs_ss).powi(2);
            n += 2;
        }
    }
    if n == 0 {
        0.0
    } else {
        (sum / n as f64).sqrt()
    }
}

/// Refine the crystal's cell against the observed peak positions.
///
/// On success the crystal's cell is replaced by the refined one. A frame
/// with too few pairable peaks leaves the cell untouched.
pub fn refine_prediction(
    crystal: &mut Crystal,
    image: &Image,
    config: &RefineConfig,
) -> Result<RefineResult> {
    let k = 1.0 / crystal.beam.lambda;
    let pairs = pair_peaks(crystal, image, config)?;
    let n_panels = image.detector.panels.len();
    let mut result = RefineResult {
        n_pairs: pairs.len(),
        panel_shifts: vec![(0.0, 0.0); n_panels],
        ..RefineResult::default()
    };
    if pairs.len() < config.min_pairs {
        tracing::debug!(
            n_pairs = pairs.len(),
            "not enough peak/prediction pairs, skipping refinement"
        );
        return Ok(result);
    }

    let mut reciprocal = crystal.cell.reciprocal()?;
    let mut shifts = vec![(0.0f64, 0.0f64); n_panels];

    // Parameter layout: 9 reciprocal components (column-major axis by
    // axis), then (dx, dy) per panel. Parameters are scaled so one unit
    // means roughly one pixel of position change.
    let n_params = 9 + 2 * n_panels;
    let cell_scale = reciprocal.norm() * 1e-4;

    result.initial_rms = rms_residual(&pairs, &reciprocal, &shifts, image, k);

    for iter in 0..config.max_iters {
        let mut normal = DMatrix::<f64>::zeros(n_params, n_params);
        let mut rhs = DVector::<f64>::zeros(n_params);

        for pair in &pairs {
            let panel = &image.detector.panels[pair.panel];
            let Some((fs, ss)) =
                predicted_position(&reciprocal, pair.hkl, panel, shifts[pair.panel], k)
            else {
                continue;
            };
            let Some(node_jac) = position_node_jacobian(&reciprocal, pair.hkl, panel, k) else {
                continue;
            };
            let Some(shift_jac) = position_shift_jacobian(panel) else {
                continue;
            };

            let res = Vector2::new(fs - pair.obs_fs, ss - pair.obs_ss);
            let w = huber_weight(res.norm(), config.huber_delta);

            // Row of the Jacobian for each parameter, as the (dfs, dss)
            // response to a unit scaled step.
            let mut jac = vec![Vector2::<f64>::zeros(); n_params];
            let index = [pair.hkl.0 as f64, pair.hkl.1 as f64, pair.hkl.2 as f64];
            for axis in 0..3 {
                for component in 0..3 {
                    jac[axis * 3 + component] = node_jac[component] * index[axis] * cell_scale;
                }
            }
            jac[9 + 2 * pair.panel] = shift_jac[0];
            jac[9 + 2 * pair.panel + 1] = shift_jac[1];

            for a in 0..n_params {
                rhs[a] -= w * jac[a].dot(&res);
                for b in a..n_params {
                    let v = w * jac[a].dot(&jac[b]);
                    normal[(a, b)] += v;
                    if a != b {
                        normal[(b, a)] += v;
                    }
                }
            }
        }

        for i in 0..n_params {
            normal[(i, i)] += 1e-9;
        }

        let step = normal
            .lu()
            .solve(&rhs)
            .ok_or(EngineError::LinAlgSingular("prediction refinement"))?;

        for axis in 0..3 {
            for component in 0..3 {
                reciprocal[(component, axis)] += step[axis * 3 + component] * cell_scale;
            }
        }
        for (pi, shift) in shifts.iter_mut().enumerate() {
            shift.0 += step[9 + 2 * pi];
            shift.1 += step[9 + 2 * pi + 1];
        }

        result.n_iters = iter + 1;
        if step.norm() < config.convergence_step {
            break;
        }
    }

    result.final_rms = rms_residual(&pairs, &reciprocal, &shifts, image, k);
    result.panel_shifts = shifts;

    // A fit that made things worse indicates a degenerate pairing; keep
    // the original cell in that case.
    if result.final_rms <= result.initial_rms {
        crystal.cell.set_reciprocal(reciprocal);
    } else {
        tracing::debug!(
            initial = result.initial_rms,
            after = result.final_rms,
            "refinement increased the residual, keeping the unrefined cell"
        );
    }
    Ok(result)
}
