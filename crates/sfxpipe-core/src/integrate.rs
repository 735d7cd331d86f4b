//! Ring integration of predicted reflections.
//!
//! Around each predicted position three concentric radii define a peak
//! disk (r ≤ r_inn) and a background annulus (r_mid < r ≤ r_out). The
//! background under the peak is estimated from the annulus by a plain
//! mean, a linear-gradient plane fit, or a robust median; the
//! background-subtracted peak sum gives the intensity, with σ propagated
//! from Poisson statistics plus the background-estimate variance.

use nalgebra::{Matrix3, Vector3};

use crate::crystal::Crystal;
use crate::error::{EngineError, Result};
use crate::image::Image;

/// Background estimator over the annulus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackgroundMethod {
    /// Mean of the annulus pixels.
    #[default]
    Plain,
    /// Least-squares plane over the annulus, evaluated under each peak
    /// pixel.
    Gradient,
    /// Median of the annulus pixels.
    Median,
}

/// Parsed integration-method descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrationMethod {
    /// Re-centroid the peak before integrating.
    pub recentre: bool,
    /// Keep peaks containing saturated pixels.
    pub use_saturated: bool,
    pub background: BackgroundMethod,
}

impl Default for IntegrationMethod {
    fn default() -> Self {
        Self {
            recentre: false,
            use_saturated: true,
            background: BackgroundMethod::Plain,
        }
    }
}

impl IntegrationMethod {
    /// Parse descriptors like `rings`, `rings-cen-grad`,
    /// `rings-nocen-nosat-median`.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let mut parts = descriptor.split('-');
        match parts.next() {
            Some("rings") => {}
            other => {
                return Err(EngineError::MalformedInput(format!(
                    "unknown integration method '{}'",
                    other.unwrap_or("")
                )))
            }
        }
        let mut method = Self::default();
        for token in parts {
            match token {
                "cen" => method.recentre = true,
                "nocen" => method.recentre = false,
                "sat" => method.use_saturated = true,
                "nosat" => method.use_saturated = false,
                "grad" => method.background = BackgroundMethod::Gradient,
                "nograd" => method.background = BackgroundMethod::Plain,
                "median" => method.background = BackgroundMethod::Median,
                other => {
                    return Err(EngineError::MalformedInput(format!(
                        "unknown integration option '{other}'"
                    )))
                }
            }
        }
        Ok(method)
    }
}

/// Integration tuning for one run.
#[derive(Debug, Clone)]
pub struct IntegrationConfig {
    pub method: IntegrationMethod,
    /// Peak disk radius (pixels).
    pub ir_inn: f64,
    /// Inner background radius (pixels).
    pub ir_mid: f64,
    /// Outer background radius (pixels).
    pub ir_out: f64,
    /// Resolution cutoff on 1/d in m⁻¹; reflections beyond it are never
    /// scalable.
    pub highres_limit: f64,
    /// Integrate predictions even when no detected peak is nearby.
    pub overpredict: bool,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            method: IntegrationMethod::default(),
            ir_inn: 4.0,
            ir_mid: 5.0,
            ir_out: 7.0,
            highres_limit: f64::INFINITY,
            overpredict: false,
        }
    }
}

/// Counts from integrating one crystal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrationStats {
    pub n_integrated: usize,
    pub n_scalable: usize,
    pub n_saturated: usize,
    pub n_no_peak_nearby: usize,
    pub n_failed: usize,
}

struct AnnulusFit {
    /// Background value under subpixel offset (dfs, dss) from the centre.
    offset: f64,
    grad_fs: f64,
    grad_ss: f64,
    /// Pixel-to-pixel spread of the annulus.
    sigma: f64,
    n: usize,
}

impl AnnulusFit {
    fn value_at(&self, dfs: f64, dss: f64) -> f64 {
        self.offset + self.grad_fs * dfs + self.grad_ss * dss
    }
}

fn fit_background(
    samples: &[(f64, f64, f64)],
    method: BackgroundMethod,
) -> Option<AnnulusFit> {
    let n = samples.len();
    if n < 3 {
        return None;
    }

    let fit = match method {
        BackgroundMethod::Plain => {
            let mean = samples.iter().map(|s| s.2).sum::<f64>() / n as f64;
            AnnulusFit {
                offset: mean,
                grad_fs: 0.0,
                grad_ss: 0.0,
                sigma: 0.0,
                n,
            }
        }
        BackgroundMethod::Median => {
            let mut values: Vec<f64> = samples.iter().map(|s| s.2).collect();
            values.sort_by(|a, b| a.partial_cmp(b).unwrap());
            AnnulusFit {
                offset: values[n / 2],
                grad_fs: 0.0,
                grad_ss: 0.0,
                sigma: 0.0,
                n,
            }
        }
        BackgroundMethod::Gradient => {
            // Least squares for v ≈ offset + gfs·dfs + gss·dss.
            let mut ata = Matrix3::<f64>::zeros();
            let mut atb = Vector3::<f64>::zeros();
            for &(dfs, dss, v) in samples {
                let row = Vector3::new(1.0, dfs, dss);
                ata += row * row.transpose();
                atb += row * v;
            }
            let sol = ata.lu().solve(&atb)?;
            AnnulusFit {
                offset: sol[0],
                grad_fs: sol[1],
                grad_ss: sol[2],
                sigma: 0.0,
                n,
            }
        }
    };

    let variance = samples
        .iter()
        .map(|&(dfs, dss, v)| {
            let r = v - fit.value_at(dfs, dss);
            r * r
        })
        .sum::<f64>()
        / n as f64;

    Some(AnnulusFit {
        sigma: variance.sqrt(),
        ..fit
    })
}

/// Integrate every predicted reflection of `crystal` from the frame data.
pub fn integrate_crystal(
    crystal: &mut Crystal,
    image: &Image,
    config: &IntegrationConfig,
) -> Result<IntegrationStats> {
    let mut stats = IntegrationStats::default();
    let r_out_sq = config.ir_out * config.ir_out;
    let r_mid = config.ir_mid;
    let r_inn_sq = config.ir_inn * config.ir_inn;

    for refl in crystal.reflections.iter() {
        let (mut fs, mut ss, panel_idx, partiality) = {
            let d = refl.get();
            (d.fs, d.ss, d.panel, d.partiality)
        };
        let Some(panel) = image.panels.get(panel_idx) else {
            stats.n_failed += 1;
            continue;
        };

        if !config.overpredict {
            let nearby = image
                .feature_closest(fs, ss, panel_idx)
                .map(|(d, _)| d <= config.ir_out)
                .unwrap_or(false);
            if !nearby {
                stats.n_no_peak_nearby += 1;
                refl.update(|d| d.scalable = false);
                continue;
            }
        }

        if config.method.recentre {
            if let Some((cfs, css)) = recentre(panel, fs, ss, config.ir_inn) {
                fs = cfs;
                ss = css;
            }
        }

        // Gather peak and annulus pixels around the (subpixel) centre.
        let mut peak: Vec<(f64, f64, f64)> = Vec::new();
        let mut annulus: Vec<(f64, f64, f64)> = Vec::new();
        let mut bad_in_peak = false;
        let mut saturated_in_peak = false;
        let mut truncated = false;

        let fs0 = (fs - config.ir_out).floor() as i64;
        let fs1 = (fs + config.ir_out).ceil() as i64;
        let ss0 = (ss - config.ir_out).floor() as i64;
        let ss1 = (ss + config.ir_out).ceil() as i64;
        for pss in ss0..=ss1 {
            for pfs in fs0..=fs1 {
                let dfs = pfs as f64 - fs;
                let dss = pss as f64 - ss;
                let r_sq = dfs * dfs + dss * dss;
                if r_sq > r_out_sq {
                    continue;
                }
                let inside = pfs >= 0 && pss >= 0 && pfs < panel.w as i64 && pss < panel.h as i64;
                if !inside {
                    if r_sq <= r_inn_sq {
                        truncated = true;
                    }
                    continue;
                }
                let (ufs, uss) = (pfs as usize, pss as usize);
                let v = panel.get(ufs, uss) as f64;
                if r_sq <= r_inn_sq {
                    if panel.is_bad(ufs, uss) {
                        bad_in_peak = true;
                    }
                    if panel.is_saturated(ufs, uss) {
                        saturated_in_peak = true;
                    }
                    peak.push((dfs, dss, v));
                } else if r_sq > r_mid * r_mid && !panel.is_bad(ufs, uss) {
                    annulus.push((dfs, dss, v));
                }
            }
        }

        if peak.is_empty() || truncated {
            stats.n_failed += 1;
            refl.update(|d| d.scalable = false);
            continue;
        }

        if saturated_in_peak {
            stats.n_saturated += 1;
            if !config.method.use_saturated {
                refl.update(|d| d.scalable = false);
                continue;
            }
        }

        let Some(bg) = fit_background(&annulus, config.method.background) else {
            stats.n_failed += 1;
            refl.update(|d| d.scalable = false);
            continue;
        };

        let mut intensity = 0.0f64;
        let mut poisson = 0.0f64;
        let mut bg_mean = 0.0f64;
        for &(dfs, dss, v) in &peak {
            let local_bg = bg.value_at(dfs, dss);
            intensity += v - local_bg;
            poisson += v.max(0.0);
            bg_mean += local_bg;
        }
        bg_mean /= peak.len() as f64;

        // Poisson counting term plus the variance of the subtracted
        // background estimate.
        let n_pk = peak.len() as f64;
        let bg_var = bg.sigma * bg.sigma / bg.n as f64;
        let sigma = (poisson + n_pk * n_pk * bg_var).sqrt().max(1e-6);

        let (h, k, l) = refl.indices();
        let within_resolution = match crystal.cell.resolution(h, k, l) {
            Ok(res) => 2.0 * res <= config.highres_limit,
            Err(_) => false,
        };

        let scalable = partiality >= 0.1
            && intensity.abs() >= 0.1
            && within_resolution
            && !bad_in_peak
            && (config.method.use_saturated || !saturated_in_peak);

        stats.n_integrated += 1;
        if scalable {
            stats.n_scalable += 1;
        }
        refl.update(|d| {
            d.fs = fs;
            d.ss = ss;
            d.intensity = intensity;
            d.esd_intensity = sigma;
            d.background = bg_mean;
            d.negative_intensity = intensity < 0.0;
            d.scalable = scalable;
            d.redundancy = 1;
        });
    }

    Ok(stats)
}

/// First moment of the peak disk, used by the `cen` option.
fn recentre(
    panel: &crate::image::PanelData,
    fs: f64,
    ss: f64,
    r_inn: f64,
) -> Option<(f64, f64)> {
    let mut total = 0.0;
    let mut mfs = 0.0;
    let mut mss = 0.0;
    let fs0 = (fs - r_inn).floor() as i64;
    let fs1 = (fs + r_inn).ceil() as i64;
    let ss0 = (ss - r_inn).floor() as i64;
    let ss1 = (ss + r_inn).ceil() as i64;
    for pss in ss0..=ss1 {
        for pfs in fs0..=fs1 {
            if pfs < 0 || pss < 0 || pfs >= panel.w as i64 || pss >= panel.h as i64 {
                continue;
            }
            let dfs = pfs as f64 - fs;
            let dss = pss as f64 - ss;
            if dfs * dfs + dss * dss > r_inn * r_inn {
                continue;
            }
            let v = panel.get(pfs as usize, pss as usize) as f64;
            if v > 0.0 {
                total += v;
                mfs += v * pfs as f64;
                mss += v * pss as f64;
            }
        }
    }
    (total > 0.0).then(|| (mfs / total, mss / total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crystal::{BeamSnapshot, Crystal};
    use crate::geometry::Detector;
    use crate::image::{BeamParams, Image, Peak};
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    fn beam() -> BeamSnapshot {
        BeamSnapshot {
            lambda: 1.55e-10,
            divergence: 1.0e-3,
            bandwidth: 0.01,
        }
    }

    /// A crystal with one hand-placed reflection at (fs, ss).
    fn crystal_with_reflection(fs: f64, ss: f64) -> Crystal {
        let cell =
            crate::cell::UnitCell::from_parameters(10e-9, 10e-9, 10e-9, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2);
        let mut crystal = Crystal::new(cell, beam());
        let refl = crystal.reflections.add((1, 0, 0));
        refl.update(|d| {
            d.fs = fs;
            d.ss = ss;
            d.panel = 0;
            d.partiality = 0.8;
            d.lorentz = 1.0;
        });
        crystal
    }

    fn frame_with_box(fs: usize, ss: usize, value: f32, background: f32) -> Image {
        let det = Detector::simple(64, 64, 10000.0, 0.1);
        let mut img = Image::new(&det, &BeamParams::default()).unwrap();
        for v in img.panels[0].data.iter_mut() {
            *v = background;
        }
        for dss in 0..2usize {
            for dfs in 0..2usize {
                img.panels[0].set(fs + dfs, ss + dss, background + value);
            }
        }
        img.features.push(Peak {
            fs: fs as f64 + 0.5,
            ss: ss as f64 + 0.5,
            panel: 0,
            intensity: 4.0 * value as f64,
        });
        img
    }

    #[test]
    fn flat_background_is_subtracted_exactly() {
        let img = frame_with_box(32, 32, 100.0, 7.0);
        let mut crystal = crystal_with_reflection(32.5, 32.5);
        let cfg = IntegrationConfig::default();
        let stats = integrate_crystal(&mut crystal, &img, &cfg).unwrap();
        assert_eq!(stats.n_integrated, 1);

        let d = crystal.reflections.find((1, 0, 0)).unwrap().get();
        assert_relative_eq!(d.intensity, 400.0, max_relative = 1e-9);
        assert_relative_eq!(d.background, 7.0, max_relative = 1e-9);
        assert!(d.scalable);
        assert!(!d.negative_intensity);
        assert!(d.esd_intensity > 0.0);
    }

    #[test]
    fn gradient_background_handles_a_ramp() {
        let mut img = frame_with_box(32, 32, 100.0, 0.0);
        // A linear ramp across the panel on top of the peak.
        for ss in 0..64usize {
            for fs in 0..64usize {
                let old = img.panels[0].get(fs, ss);
                img.panels[0].set(fs, ss, old + fs as f32 * 2.0);
            }
        }
        let mut crystal = crystal_with_reflection(32.5, 32.5);
        let cfg = IntegrationConfig {
            method: IntegrationMethod::parse("rings-grad").unwrap(),
            ..IntegrationConfig::default()
        };
        integrate_crystal(&mut crystal, &img, &cfg).unwrap();
        let d = crystal.reflections.find((1, 0, 0)).unwrap().get();
        assert_relative_eq!(d.intensity, 400.0, epsilon = 1.0);
    }

    #[test]
    fn saturated_peaks_can_be_rejected() {
        let mut img = frame_with_box(32, 32, 100.0, 0.0);
        let idx = img.panels[0].idx(32, 32);
        img.panels[0].sat[idx] = 50.0;

        let mut crystal = crystal_with_reflection(32.5, 32.5);
        let cfg = IntegrationConfig {
            method: IntegrationMethod::parse("rings-nosat").unwrap(),
            ..IntegrationConfig::default()
        };
        let stats = integrate_crystal(&mut crystal, &img, &cfg).unwrap();
        assert_eq!(stats.n_saturated, 1);
        assert!(!crystal.reflections.find((1, 0, 0)).unwrap().get().scalable);

        let mut crystal = crystal_with_reflection(32.5, 32.5);
        let cfg = IntegrationConfig::default();
        let stats = integrate_crystal(&mut crystal, &img, &cfg).unwrap();
        assert_eq!(stats.n_saturated, 1);
        assert!(crystal.reflections.find((1, 0, 0)).unwrap().get().scalable);
    }

    #[test]
    fn bad_pixel_in_peak_blocks_scalability() {
        let mut img = frame_with_box(32, 32, 100.0, 0.0);
        let idx = img.panels[0].idx(33, 32);
        img.panels[0].bad[idx] = true;

        let mut crystal = crystal_with_reflection(32.5, 32.5);
        integrate_crystal(&mut crystal, &img, &IntegrationConfig::default()).unwrap();
        assert!(!crystal.reflections.find((1, 0, 0)).unwrap().get().scalable);
    }

    #[test]
    fn predictions_without_nearby_peak_are_skipped_unless_overpredicting() {
        let mut img = frame_with_box(32, 32, 100.0, 0.0);
        img.features.clear();

        let mut crystal = crystal_with_reflection(32.5, 32.5);
        let stats =
            integrate_crystal(&mut crystal, &img, &IntegrationConfig::default()).unwrap();
        assert_eq!(stats.n_no_peak_nearby, 1);
        assert_eq!(stats.n_integrated, 0);

        let cfg = IntegrationConfig {
            overpredict: true,
            ..IntegrationConfig::default()
        };
        let mut crystal = crystal_with_reflection(32.5, 32.5);
        let stats = integrate_crystal(&mut crystal, &img, &cfg).unwrap();
        assert_eq!(stats.n_integrated, 1);
    }

    #[test]
    fn method_descriptor_parses() {
        let m = IntegrationMethod::parse("rings-cen-nosat-median").unwrap();
        assert!(m.recentre);
        assert!(!m.use_saturated);
        assert_eq!(m.background, BackgroundMethod::Median);
        assert!(IntegrationMethod::parse("prof2d").is_err());
        assert!(IntegrationMethod::parse("rings-bogus").is_err());
    }
}
