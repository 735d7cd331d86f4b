//! Scaling and post-refinement of partial observations.
//!
//! Many crystals, each with a list of scalable partial reflections, are
//! jointly reduced to one merged list of full intensities. The outer loop
//! alternates three stages:
//!
//! 1. **Scale** – estimate the full intensity of every symmetry-unique
//!    reflection as a partiality- and Lorentz-weighted mean over all
//!    observations, then update each crystal's overall scale factor by
//!    weighted linear least squares; the two sub-steps alternate until the
//!    aggregate residual settles.
//! 2. **Post-refine** – each crystal independently adjusts its nine
//!    reciprocal-axis components to bring its predicted partialities in
//!    line with the merged intensities (Gauss–Newton, analytic gradients,
//!    outlier down-weighting). Crystals run in parallel on the worker
//!    pool.
//! 3. **Re-predict** – the profile radius is re-estimated from the median
//!    excitation-error magnitude, partialities are recomputed and the
//!    scalable/refinable flags refreshed.
//!
//! A crystal whose solve goes singular or whose refinement diverges is
//! marked as a dud for the iteration and sits out the scale step; it may
//! recover in the next cycle.

use std::sync::{Mutex, RwLock};

use nalgebra::{Matrix3, SMatrix, SVector};

use crate::crystal::Crystal;
use crate::error::{EngineError, Result};
use crate::geometry::Detector;
use crate::pool::{self, Progress};
use crate::predict::{self, partiality_gradient, RefineParam};
use crate::reflist::RefList;

/// Tuning for scaling and post-refinement.
#[derive(Debug, Clone)]
pub struct ScaleConfig {
    /// Outer iterations of scale → refine → re-predict.
    pub n_iter: usize,
    pub n_threads: usize,
    /// Keep negative observations in the scale step.
    pub include_negative: bool,
    /// Outer-loop termination: largest osf change between iterations.
    pub osf_convergence: f64,
    /// Inner alternation termination: relative residual change.
    pub scale_tolerance: f64,
    pub max_scale_iters: usize,
    /// Down-weight observations beyond this many σ.
    pub outlier_sigma: f64,
    /// Gauss–Newton iterations per crystal per cycle.
    pub refine_max_iters: usize,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            n_iter: 10,
            n_threads: 1,
            include_negative: true,
            osf_convergence: 1e-4,
            scale_tolerance: 1e-6,
            max_scale_iters: 30,
            outlier_sigma: 3.0,
            refine_max_iters: 5,
        }
    }
}

/// Mark which reflections of a crystal can enter the scale step.
///
/// A reflection is scalable when its partiality and intensity are
/// meaningful; with a reference list, it must additionally be present in
/// the reference. Returns the number of scalable observations.
pub fn select_scalable(
    crystal: &Crystal,
    reference: Option<&RefList>,
    include_negative: bool,
) -> usize {
    let mut n_obs = 0usize;
    for refl in crystal.reflections.iter() {
        let mut d = refl.lock();
        d.negative_intensity = d.intensity < 0.0;
        let mut sc = d.partiality >= 0.1 && d.intensity.abs() >= 0.1;
        if !include_negative && d.negative_intensity {
            sc = false;
        }
        if let Some(reference) = reference {
            if reference.find(refl.indices()).is_none() {
                sc = false;
            }
        }
        d.scalable = sc;
        if sc {
            n_obs += 1;
        }
    }
    n_obs
}

/// Mark which reflections may drive post-refinement: scalable ones whose
/// merged estimate rests on at least two observations (any redundancy is
/// enough when refining against a reference).
pub fn select_refinable(crystal: &Crystal, full: &RefList, have_reference: bool) {
    for refl in crystal.reflections.iter() {
        let mut d = refl.lock();
        if !d.scalable {
            d.refinable = false;
            continue;
        }
        d.refinable = match full.find(refl.indices()) {
            Some(merged) => have_reference || merged.get().redundancy >= 2,
            None => false,
        };
    }
}

/// Weight of one observation in the full-intensity estimate.
#[inline]
fn merge_weight(p: f64, osf: f64, lorentz: f64, sigma: f64) -> f64 {
    p * osf * osf * lorentz * lorentz / (sigma * sigma)
}

/// Estimate full intensities and update per-crystal scale factors by
/// alternating the two linear sub-problems until the aggregate residual
/// settles. Returns the merged list.
pub fn scale_intensities(
    crystals: &mut [Crystal],
    reference: Option<&RefList>,
    config: &ScaleConfig,
) -> Result<RefList> {
    let merged: RwLock<RefList> = RwLock::new(RefList::new());
    let mut previous_residual = f64::INFINITY;

    for round in 0..config.max_scale_iters {
        // Full-intensity estimate under the current scale factors. The
        // merged list is shared: lookups take the read lock, first
        // insertion of a key takes the write lock with a re-check, and
        // per-reflection accumulation runs under the reflection's own
        // lock.
        merged.write().expect("merged list lock").clear_for_accumulation();

        for crystal in crystals.iter().filter(|c| !c.pr_dud) {
            for refl in crystal.reflections.iter() {
                let d = refl.get();
                if !d.scalable {
                    continue;
                }
                let key = refl.indices();
                let target = {
                    let guard = merged.read().expect("merged list lock");
                    guard.find(key)
                };
                let target = match target {
                    Some(t) => t,
                    None => {
                        let mut guard = merged.write().expect("merged list lock");
                        match guard.find(key) {
                            Some(t) => t,
                            None => guard.add(key),
                        }
                    }
                };

                let w = merge_weight(d.partiality, crystal.osf, d.lorentz, d.esd_intensity);
                let scaled = d.intensity / (crystal.osf * d.lorentz * d.partiality);
                let mut m = target.lock();
                m.temp1 += w * scaled;
                m.temp2 += w;
                m.esd_intensity += w / d.partiality;
                m.redundancy += 1;
            }
        }

        {
            let guard = merged.read().expect("merged list lock");
            for refl in guard.iter() {
                let mut m = refl.lock();
                if m.temp2 > 0.0 {
                    m.intensity = m.temp1 / m.temp2;
                    m.esd_intensity = m.esd_intensity.sqrt() / m.temp2;
                    m.scalable = true;
                }
            }
        }

        // Per-crystal scale factors against the merged estimate.
        let mut residual = 0.0f64;
        {
            let guard = merged.read().expect("merged list lock");
            for crystal in crystals.iter_mut() {
                if crystal.pr_dud {
                    continue;
                }
                let mut num = 0.0f64;
                let mut den = 0.0f64;
                for refl in crystal.reflections.iter() {
                    let d = refl.get();
                    if !d.scalable {
                        continue;
                    }
                    let Some(full) = guard.find(refl.indices()) else {
                        continue;
                    };
                    let i_full = full.get().intensity;
                    let model = d.lorentz * d.partiality * i_full;
                    let w = 1.0 / (d.esd_intensity * d.esd_intensity);
                    num += w * d.intensity * model;
                    den += w * model * model;
                }
                if den > 0.0 && num.is_finite() {
                    crystal.osf = num / den;
                } else {
                    tracing::debug!("singular scale solve, marking crystal dud");
                    crystal.pr_dud = true;
                    continue;
                }

                for refl in crystal.reflections.iter() {
                    let d = refl.get();
                    if !d.scalable {
                        continue;
                    }
                    if let Some(full) = guard.find(refl.indices()) {
                        let model =
                            crystal.osf * d.lorentz * d.partiality * full.get().intensity;
                        let w = 1.0 / (d.esd_intensity * d.esd_intensity);
                        residual += w * (d.intensity - model) * (d.intensity - model);
                    }
                }
            }
        }

        let change = (previous_residual - residual).abs();
        if round > 0 && change <= config.scale_tolerance * previous_residual.max(1e-30) {
            break;
        }
        previous_residual = residual;
    }

    Ok(merged.into_inner().expect("merged list lock"))
}

/// One crystal's Gauss–Newton pass against the merged intensities.
///
/// Returns `Err` when the normal equations are singular and `Ok(false)`
/// when the fit diverged (caller marks the crystal dud either way).
fn post_refine_crystal(
    crystal: &mut Crystal,
    full: &RefList,
    detector: &Detector,
    config: &ScaleConfig,
) -> Result<bool> {
    let original_cell = crystal.cell.clone();
    let original_residual = model_residual(crystal, full, config);
    let mut reciprocal: Matrix3<f64> = crystal.cell.reciprocal()?;
    let cell_scale = reciprocal.norm() * 1e-6;

    for _ in 0..config.refine_max_iters {
        let mut normal = SMatrix::<f64, 9, 9>::zeros();
        let mut rhs = SVector::<f64, 9>::zeros();
        let mut n_used = 0usize;

        for refl in crystal.reflections.iter() {
            let d = refl.get();
            if !d.refinable {
                continue;
            }
            let Some(merged) = full.find(refl.indices()) else {
                continue;
            };
            let i_full = merged.get().intensity;
            let model = crystal.osf * d.lorentz * d.partiality * i_full;
            let residual = d.intensity - model;

            let sigma = d.esd_intensity.max(1e-12);
            let mut w = 1.0 / (sigma * sigma);
            // Outlier control: soften beyond k·σ.
            let deviation = residual.abs() / sigma;
            if deviation > config.outlier_sigma {
                w *= config.outlier_sigma / deviation;
            }

            let hkl = d.symmetric;
            let mut jac = SVector::<f64, 9>::zeros();
            for (slot, param) in RefineParam::cell_axes().enumerate() {
                let dp = partiality_gradient(
                    hkl,
                    &reciprocal,
                    &crystal.beam,
                    crystal.profile_radius,
                    param,
                );
                jac[slot] = crystal.osf * d.lorentz * i_full * dp * cell_scale;
            }

            normal += w * jac * jac.transpose();
            rhs += w * jac * residual;
            n_used += 1;
        }

        if n_used < 9 {
            return Ok(true);
        }

        for i in 0..9 {
            normal[(i, i)] += 1e-9;
        }
        let step = normal
            .lu()
            .solve(&rhs)
            .ok_or(EngineError::LinAlgSingular("post-refinement"))?;
        if !step.iter().all(|v| v.is_finite()) {
            return Ok(false);
        }

        for (slot, param) in RefineParam::cell_axes().enumerate() {
            if let RefineParam::CellAxis { axis, component } = param {
                reciprocal[(component, axis)] += step[slot] * cell_scale;
            }
        }
        crystal.cell.set_reciprocal(reciprocal);
        predict::update_predictions(crystal, detector)?;

        if step.norm() < 1e-8 {
            break;
        }
    }

    let refined_residual = model_residual(crystal, full, config);
    if refined_residual.is_finite() && refined_residual <= original_residual {
        Ok(true)
    } else {
        crystal.cell = original_cell;
        predict::update_predictions(crystal, detector)?;
        Ok(false)
    }
}

/// Weighted squared residual of a crystal's refinable observations
/// against the merged intensities.
fn model_residual(crystal: &Crystal, full: &RefList, config: &ScaleConfig) -> f64 {
    let mut sum = 0.0;
    for refl in crystal.reflections.iter() {
        let d = refl.get();
        if !d.refinable {
            continue;
        }
        let Some(merged) = full.find(refl.indices()) else {
            continue;
        };
        let model = crystal.osf * d.lorentz * d.partiality * merged.get().intensity;
        let sigma = d.esd_intensity.max(1e-12);
        let mut w = 1.0 / (sigma * sigma);
        let deviation = (d.intensity - model).abs() / sigma;
        if deviation > config.outlier_sigma {
            w *= config.outlier_sigma / deviation;
        }
        sum += w * (d.intensity - model) * (d.intensity - model);
    }
    sum
}

/// Median of per-reflection excitation-error magnitudes over scalable
/// reflections; used to re-estimate the profile radius after refinement.
fn median_excitation_error(crystal: &Crystal) -> Option<f64> {
    let mut magnitudes: Vec<f64> = crystal
        .reflections
        .iter()
        .filter_map(|r| {
            let d = r.get();
            d.scalable.then(|| d.excitation_error.abs())
        })
        .collect();
    if magnitudes.len() < 10 {
        return None;
    }
    magnitudes.sort_by(|a, b| a.partial_cmp(b).unwrap());
    Some(magnitudes[magnitudes.len() / 2])
}

/// Run the full scaling and post-refinement cycle.
///
/// Crystal reflection lists must already be keyed by asymmetric-unit
/// indices (with the raw frame indices as symmetry companions). Returns
/// the merged full-intensity list.
pub fn scale_and_post_refine(
    crystals: &mut [Crystal],
    detector: &Detector,
    reference: Option<&RefList>,
    config: &ScaleConfig,
    progress: Option<&dyn Progress>,
) -> Result<RefList> {
    for crystal in crystals.iter_mut() {
        predict::update_predictions(crystal, detector)?;
        select_scalable(crystal, reference, config.include_negative);
    }

    let mut full = scale_intensities(crystals, reference, config)?;
    for crystal in crystals.iter() {
        select_refinable(crystal, &full, reference.is_some());
    }

    for iteration in 0..config.n_iter {
        let osf_before: Vec<f64> = crystals.iter().map(|c| c.osf).collect();

        // Post-refine every crystal independently on the pool. Each slot
        // owns exactly one crystal for the duration of the pass.
        {
            let comparison: &RefList = reference.unwrap_or(&full);
            let slots: Vec<Mutex<&mut Crystal>> =
                crystals.iter_mut().map(Mutex::new).collect();
            let failures = Mutex::new(Vec::<usize>::new());

            pool::run_range(
                slots.len(),
                config.n_threads,
                Some("Refining"),
                progress,
                None,
                |i| {
                    let mut crystal = slots[i].lock().expect("crystal slot lock");
                    crystal.pr_dud = false;
                    match post_refine_crystal(&mut crystal, comparison, detector, config) {
                        Ok(true) => {}
                        Ok(false) | Err(_) => {
                            crystal.pr_dud = true;
                            failures.lock().expect("failure list lock").push(i);
                        }
                    }
                },
            );

            let failed = failures.into_inner().expect("failure list lock");
            if !failed.is_empty() {
                tracing::info!(
                    n_dud = failed.len(),
                    iteration,
                    "crystals could not be refined this cycle"
                );
            }
        }

        // Re-predict with an updated profile radius, refresh the flags,
        // then rebuild the merged list and scale factors.
        for crystal in crystals.iter_mut() {
            if let Some(median) = median_excitation_error(crystal) {
                crystal.set_profile_radius(median);
            }
            predict::update_predictions(crystal, detector)?;
            select_scalable(crystal, reference, config.include_negative);
        }

        full = scale_intensities(crystals, reference, config)?;
        for crystal in crystals.iter() {
            select_refinable(crystal, &full, reference.is_some());
        }

        let max_osf_change = crystals
            .iter()
            .zip(&osf_before)
            .map(|(c, before)| (c.osf - before).abs())
            .fold(0.0f64, f64::max);
        tracing::info!(
            iteration,
            max_osf_change,
            "scaling cycle finished"
        );
        if max_osf_change < config.osf_convergence {
            break;
        }
    }

    Ok(full)
}

impl RefList {
    /// Reset the merge accumulators on every reflection, keeping the key
    /// set (and therefore the redundancy history) intact between rounds.
    fn clear_for_accumulation(&mut self) {
        for refl in self.iter() {
            let mut d = refl.lock();
            d.temp1 = 0.0;
            d.temp2 = 0.0;
            d.esd_intensity = 0.0;
            d.redundancy = 0;
        }
    }
}
