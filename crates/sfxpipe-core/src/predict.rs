//! Reflection prediction under a finite-bandwidth, finite-divergence beam.
//!
//! Each reciprocal-lattice node is modelled as a sphere of radius equal to
//! the crystal's profile radius, and is tested against two limiting Ewald
//! spheres: one for the long-wavelength edge of the bandwidth,
//! k_low = 1/(λ(1+Δλ/2)), and one for the short edge,
//! k_high = 1/(λ(1−Δλ/2)). The beam divergence tilts the two sphere
//! centres apart, widening the excited shell further.
//!
//! With r₁ and r₂ the signed excitation errors against the two spheres,
//! each clamped to ±r_p, the partiality is the sphere-segment volume
//! fraction
//!
//! ```text
//! s = (r₁ + r₂) / (2 r_p),   q = 1 − |s|,   p = (3q − q³) / 2
//! ```
//!
//! A reflection clamped at both ends is fully excited (p = 1). Analytic
//! derivatives of p with respect to the nine reciprocal-axis components
//! and the divergence are provided for refinement; they are checked
//! against central finite differences in the test suite.

use nalgebra::{Matrix3, Vector3};

use crate::crystal::{BeamSnapshot, Crystal};
use crate::error::Result;
use crate::geometry::Detector;
use crate::reflist::RefList;
use crate::symmetry::Hkl;

/// Floor for cos 2θ in the Lorentz factor, keeping it finite as the
/// scattering angle approaches 90°.
const LORENTZ_COS_FLOOR: f64 = 0.1;

/// Outcome of testing one node against the two Ewald spheres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Partiality {
    /// Whether the node is excited at all.
    pub excited: bool,
    /// Clamped signed excitation errors (m⁻¹).
    pub r1: f64,
    pub r2: f64,
    /// Unclamped mean excitation error (m⁻¹).
    pub excitation_error: f64,
    pub clamp_low: bool,
    pub clamp_high: bool,
    /// Partiality in [0, 1].
    pub p: f64,
}

/// A parameter of the prediction model that refinement may vary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineParam {
    /// One Cartesian component of one reciprocal axis:
    /// `axis` 0..3 = a*, b*, c*; `component` 0..3 = x, y, z.
    CellAxis { axis: usize, component: usize },
    /// The full beam divergence angle.
    Divergence,
}

impl RefineParam {
    /// The nine reciprocal-axis parameters, a*x first.
    pub fn cell_axes() -> impl Iterator<Item = RefineParam> {
        (0..3).flat_map(|axis| (0..3).map(move |component| RefineParam::CellAxis { axis, component }))
    }
}

/// The two limiting wavenumbers for a fractional bandwidth.
fn limiting_wavenumbers(lambda: f64, bandwidth: f64) -> (f64, f64) {
    let k_low = 1.0 / (lambda * (1.0 + bandwidth / 2.0));
    let k_high = 1.0 / (lambda * (1.0 - bandwidth / 2.0));
    (k_low, k_high)
}

/// Sphere centre in the (transverse, z) plane through the node, for a
/// sphere of wavenumber `k` tilted by half the divergence. The smaller
/// sphere tilts away from the node's transverse direction, the larger one
/// towards it, bounding the excited band on both sides.
fn sphere_centre(k: f64, half_div: f64, towards_node: bool) -> (f64, f64) {
    let sign = if towards_node { 1.0 } else { -1.0 };
    (sign * half_div.sin() * k, -half_div.cos() * k)
}

fn excitation_error(tl: f64, zl: f64, k: f64, centre: (f64, f64)) -> f64 {
    let dt = tl - centre.0;
    let dz = zl - centre.1;
    k - (dt * dt + dz * dz).sqrt()
}

/// Evaluate the partiality of a node `q` (lab frame, m⁻¹) for the given
/// beam and profile radius.
pub fn partiality_for_node(q: &Vector3<f64>, beam: &BeamSnapshot, r_p: f64) -> Partiality {
    let (k_low, k_high) = limiting_wavenumbers(beam.lambda, beam.bandwidth);
    let half_div = beam.divergence / 2.0;
    let tl = (q.x * q.x + q.y * q.y).sqrt();
    let zl = q.z;

    let raw_r1 = excitation_error(tl, zl, k_low, sphere_centre(k_low, half_div, false));
    let raw_r2 = excitation_error(tl, zl, k_high, sphere_centre(k_high, half_div, true));

    let excitation_error = (raw_r1 + raw_r2) / 2.0;

    // Both errors on the same side of the shell and outside the node
    // sphere: nothing is excited.
    if raw_r1.signum() == raw_r2.signum() && raw_r1.abs() > r_p && raw_r2.abs() > r_p {
        return Partiality {
            excited: false,
            r1: raw_r1.clamp(-r_p, r_p),
            r2: raw_r2.clamp(-r_p, r_p),
            excitation_error,
            clamp_low: raw_r1.abs() >= r_p,
            clamp_high: raw_r2.abs() >= r_p,
            p: 0.0,
        };
    }

    let clamp_low = raw_r1.abs() >= r_p;
    let clamp_high = raw_r2.abs() >= r_p;
    let r1 = raw_r1.clamp(-r_p, r_p);
    let r2 = raw_r2.clamp(-r_p, r_p);

    let s = (r1 + r2) / (2.0 * r_p);
    let p = if s.abs() <= 1.0 {
        let qq = 1.0 - s.abs();
        0.5 * (3.0 * qq - qq * qq * qq)
    } else {
        0.0
    };

    Partiality {
        excited: true,
        r1,
        r2,
        excitation_error,
        clamp_low,
        clamp_high,
        p,
    }
}

/// Lorentz factor for a node: the obliquity of the exit ray, 1 at the
/// untilted orientation and floored near grazing exit.
pub fn lorentz_factor(q: &Vector3<f64>, k: f64) -> f64 {
    let scattered = Vector3::new(q.x, q.y, q.z + k);
    let cos_two_theta = scattered.z / scattered.norm();
    1.0 / cos_two_theta.max(LORENTZ_COS_FLOOR)
}

/// Analytic gradient of the partiality with respect to the node position
/// (first three slots) and the divergence (fourth slot).
fn partiality_node_gradient(
    q: &Vector3<f64>,
    beam: &BeamSnapshot,
    r_p: f64,
) -> (Vector3<f64>, f64) {
    let part = partiality_for_node(q, beam, r_p);
    if !part.excited {
        return (Vector3::zeros(), 0.0);
    }

    let s = (part.r1 + part.r2) / (2.0 * r_p);
    if s.abs() >= 1.0 {
        return (Vector3::zeros(), 0.0);
    }
    let qq = 1.0 - s.abs();
    // dp/ds = d/ds [ (3q - q^3)/2 ] with q = 1 - |s|.
    let dp_ds = -s.signum() * 1.5 * (1.0 - qq * qq);

    let (k_low, k_high) = limiting_wavenumbers(beam.lambda, beam.bandwidth);
    let half_div = beam.divergence / 2.0;
    let tl = (q.x * q.x + q.y * q.y).sqrt();
    let zl = q.z;

    let mut grad_node = Vector3::zeros();
    let mut grad_div = 0.0;

    for (k, towards, clamped) in [
        (k_low, false, part.clamp_low),
        (k_high, true, part.clamp_high),
    ] {
        if clamped {
            continue;
        }
        let centre = sphere_centre(k, half_div, towards);
        let dt = tl - centre.0;
        let dz = zl - centre.1;
        let dist = (dt * dt + dz * dz).sqrt();
        if dist <= 0.0 {
            continue;
        }
        // dr/d(node): r = k - |node_tz - centre|.
        let dr_dtl = -dt / dist;
        let dr_dzl = -dz / dist;
        let (dtl_dx, dtl_dy) = if tl > 0.0 {
            (q.x / tl, q.y / tl)
        } else {
            (0.0, 0.0)
        };
        let dr_ds_factor = dp_ds / (2.0 * r_p);
        grad_node.x += dr_ds_factor * dr_dtl * dtl_dx;
        grad_node.y += dr_ds_factor * dr_dtl * dtl_dy;
        grad_node.z += dr_ds_factor * dr_dzl;

        // Centre motion with divergence.
        let sign = if towards { 1.0 } else { -1.0 };
        let dcet_ddiv = sign * half_div.cos() * k / 2.0;
        let dcez_ddiv = half_div.sin() * k / 2.0;
        let dr_ddiv = (dt * dcet_ddiv + dz * dcez_ddiv) / dist;
        grad_div += dr_ds_factor * dr_ddiv;
    }

    (grad_node, grad_div)
}

/// Analytic ∂p/∂θ for one reflection.
///
/// `reciprocal` holds the reciprocal axes as columns; the node is
/// `reciprocal · (h, k, l)`.
pub fn partiality_gradient(
    hkl: Hkl,
    reciprocal: &Matrix3<f64>,
    beam: &BeamSnapshot,
    r_p: f64,
    param: RefineParam,
) -> f64 {
    let node = reciprocal * Vector3::new(hkl.0 as f64, hkl.1 as f64, hkl.2 as f64);
    let (grad_node, grad_div) = partiality_node_gradient(&node, beam, r_p);
    match param {
        RefineParam::CellAxis { axis, component } => {
            let index = [hkl.0 as f64, hkl.1 as f64, hkl.2 as f64][axis];
            grad_node[component] * index
        }
        RefineParam::Divergence => grad_div,
    }
}

/// Statistics from re-evaluating predictions on an existing list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PredictionUpdate {
    pub n_expected: usize,
    pub n_mapped: usize,
    pub n_lost: usize,
}

/// Predict all reflections of `cell` within the detector's reach and
/// return them as a fresh list.
pub fn find_intersections(
    cell: &crate::cell::UnitCell,
    beam: &BeamSnapshot,
    r_p: f64,
    detector: &Detector,
) -> Result<RefList> {
    let reciprocal = cell.reciprocal()?;
    let k_cen = 1.0 / beam.lambda;
    let q_max = detector.largest_q(beam.lambda) + r_p;

    let mut limits = [0i32; 3];
    for (axis, limit) in limits.iter_mut().enumerate() {
        *limit = (q_max / reciprocal.column(axis).norm()).ceil() as i32;
    }

    let mut list = RefList::new();
    for h in -limits[0]..=limits[0] {
        for k in -limits[1]..=limits[1] {
            for l in -limits[2]..=limits[2] {
                if h == 0 && k == 0 && l == 0 {
                    continue;
                }
                let node = reciprocal * Vector3::new(h as f64, k as f64, l as f64);
                if node.norm() > q_max {
                    continue;
                }
                let part = partiality_for_node(&node, beam, r_p);
                if !part.excited {
                    continue;
                }
                let Some((panel, fs, ss)) = detector.reverse_map(&node, k_cen) else {
                    continue;
                };
                let refl = list.add((h, k, l));
                refl.update(|d| {
                    d.fs = fs;
                    d.ss = ss;
                    d.panel = panel;
                    d.r1 = part.r1;
                    d.r2 = part.r2;
                    d.clamp_low = part.clamp_low;
                    d.clamp_high = part.clamp_high;
                    d.partiality = part.p;
                    d.excitation_error = part.excitation_error;
                    d.lorentz = lorentz_factor(&node, k_cen);
                    d.symmetric = (h, k, l);
                });
            }
        }
    }
    Ok(list)
}

/// Fill a crystal's reflection list from its own cell and beam snapshot.
pub fn predict_reflections(crystal: &mut Crystal, detector: &Detector) -> Result<()> {
    crystal.reflections =
        find_intersections(&crystal.cell, &crystal.beam, crystal.profile_radius, detector)?;
    Ok(())
}

/// Recompute partialities, Lorentz factors and detector positions for the
/// reflections already on a crystal, preserving measured intensities.
///
/// Reflections whose scattered ray no longer lands on a panel keep their
/// old position and get the freshly computed (possibly zero) partiality.
pub fn update_predictions(crystal: &mut Crystal, detector: &Detector) -> Result<PredictionUpdate> {
    let reciprocal = crystal.cell.reciprocal()?;
    let k_cen = 1.0 / crystal.beam.lambda;
    let mut stats = PredictionUpdate::default();

    for refl in crystal.reflections.iter() {
        // The list may carry asymmetric-unit keys; predict from the raw
        // indices observed on the frame.
        let (h, k, l) = refl.get().symmetric;
        let node = reciprocal * Vector3::new(h as f64, k as f64, l as f64);
        let part = partiality_for_node(&node, &crystal.beam, crystal.profile_radius);
        stats.n_expected += 1;

        let mapped = detector.reverse_map(&node, k_cen);
        match mapped {
            Some(_) => stats.n_mapped += 1,
            None => stats.n_lost += 1,
        }
        refl.update(|d| {
            d.r1 = part.r1;
            d.r2 = part.r2;
            d.clamp_low = part.clamp_low;
            d.clamp_high = part.clamp_high;
            d.partiality = if part.excited { part.p } else { 0.0 };
            d.excitation_error = part.excitation_error;
            d.lorentz = lorentz_factor(&node, k_cen);
            if let Some((panel, fs, ss)) = mapped {
                d.panel = panel;
                d.fs = fs;
                d.ss = ss;
            }
        });
    }
    Ok(stats)
}
