//! Gradient-walk peak search.
//!
//! Pixels above an intensity threshold with a strong squared gradient seed
//! a hill climb inside a sliding window; the walker's summit is centroided
//! over a fixed disk and accepted unless it is an isolated hot pixel, falls
//! off the panel, or sits too close to an already accepted peak. A final
//! pass culls columns with suspiciously many peaks, which are almost always
//! detector artefacts rather than diffraction.

use crate::image::{Image, PanelData, Peak};

/// Hill-climb window size in pixels; the climb looks `WINDOW/2` pixels in
/// each direction.
const PEAK_WINDOW_SIZE: usize = 10;
/// Centroid disk radius in pixels.
const INTEGRATION_RADIUS: i64 = 10;
/// Give up a climb that drifts this far from its seed pixel.
const MAX_DRIFT: f64 = 50.0;
/// Reject a candidate this close to an accepted peak.
const MIN_PEAK_SEPARATION: f64 = 15.0;
/// Delete all peaks in a fast-scan column holding more than this many.
const MAX_PEAKS_PER_COLUMN: usize = 3;

/// Tuning for the gradient walk.
#[derive(Debug, Clone)]
pub struct ZaefConfig {
    /// Minimum raw pixel value for a seed.
    pub threshold: f64,
    /// Minimum squared-gradient magnitude for a seed.
    pub min_sq_gradient: f64,
}

impl Default for ZaefConfig {
    fn default() -> Self {
        Self {
            threshold: 800.0,
            min_sq_gradient: 100_000.0,
        }
    }
}

/// Squared-gradient magnitude from forward and backward differences,
/// averaged per axis.
fn squared_gradient(p: &PanelData, fs: usize, ss: usize) -> f64 {
    let v = p.get(fs, ss) as f64;
    let dx1 = v - p.get(fs + 1, ss) as f64;
    let dx2 = p.get(fs - 1, ss) as f64 - v;
    let dy1 = v - p.get(fs, ss + 1) as f64;
    let dy2 = p.get(fs, ss - 1) as f64 - v;
    (dx1 * dx1 + dx2 * dx2) / 2.0 + (dy1 * dy1 + dy2 * dy2) / 2.0
}

/// An isolated hot pixel: strictly brighter than twice every one of its
/// eight neighbours. Border pixels never qualify.
fn is_hot_pixel(p: &PanelData, fs: usize, ss: usize) -> bool {
    if fs == 0 || ss == 0 || fs + 1 >= p.w || ss + 1 >= p.h {
        return false;
    }
    let half = p.get(fs, ss) / 2.0;
    for dss in -1i64..=1 {
        for dfs in -1i64..=1 {
            if dfs == 0 && dss == 0 {
                continue;
            }
            let nfs = (fs as i64 + dfs) as usize;
            let nss = (ss as i64 + dss) as usize;
            if p.get(nfs, nss) >= half {
                return false;
            }
        }
    }
    true
}

/// First moment over a disk around (fs, ss), skipping pixels outside the
/// panel and bad pixels. Returns (centroid fs, centroid ss, intensity), or
/// `None` when nothing usable is inside the disk.
fn centroid(p: &PanelData, fs: i64, ss: i64) -> Option<(f64, f64, f64)> {
    let lim = INTEGRATION_RADIUS * INTEGRATION_RADIUS;
    let mut total = 0.0f64;
    let mut fs_moment = 0.0f64;
    let mut ss_moment = 0.0f64;

    for dss in -INTEGRATION_RADIUS..INTEGRATION_RADIUS {
        for dfs in -INTEGRATION_RADIUS..INTEGRATION_RADIUS {
            if dfs * dfs + dss * dss > lim {
                continue;
            }
            let cfs = fs + dfs;
            let css = ss + dss;
            if cfs < 0 || css < 0 || cfs >= p.w as i64 || css >= p.h as i64 {
                continue;
            }
            if p.is_bad(cfs as usize, css as usize) {
                continue;
            }
            let v = p.get(cfs as usize, css as usize) as f64;
            total += v;
            fs_moment += v * cfs as f64;
            ss_moment += v * css as f64;
        }
    }

    if total <= 0.0 {
        return None;
    }
    Some((fs_moment / total, ss_moment / total, total))
}

fn distance(a_fs: usize, a_ss: usize, b_fs: usize, b_ss: usize) -> f64 {
    let dfs = a_fs as f64 - b_fs as f64;
    let dss = a_ss as f64 - b_ss as f64;
    (dfs * dfs + dss * dss).sqrt()
}

/// Run the gradient walk over every panel of the frame.
pub fn search(image: &Image, config: &ZaefConfig) -> Vec<Peak> {
    let mut accepted: Vec<Peak> = Vec::new();
    let mut n_rej_drift = 0usize;
    let mut n_rej_hot = 0usize;
    let mut n_rej_proximity = 0usize;
    let mut n_rej_outside = 0usize;

    for (panel_idx, p) in image.panels.iter().enumerate() {
        if p.w < 3 || p.h < 3 {
            continue;
        }
        for ss in 1..p.h - 1 {
            for fs in 1..p.w - 1 {
                if p.is_bad(fs, ss) {
                    continue;
                }
                if (p.get(fs, ss) as f64) < config.threshold {
                    continue;
                }
                if squared_gradient(p, fs, ss) < config.min_sq_gradient {
                    continue;
                }

                // Hill climb inside the sliding window.
                let half = PEAK_WINDOW_SIZE / 2;
                let mut mfs = fs;
                let mut mss = ss;
                loop {
                    let mut max = p.get(mfs, mss);
                    let mut moved = false;
                    let fs0 = mfs.saturating_sub(half);
                    let fs1 = (mfs + half).min(p.w - 1);
                    let ss0 = mss.saturating_sub(half);
                    let ss1 = (mss + half).min(p.h - 1);
                    for wss in ss0..ss1 {
                        for wfs in fs0..fs1 {
                            if p.get(wfs, wss) > max {
                                max = p.get(wfs, wss);
                                mfs = wfs;
                                mss = wss;
                                moved = true;
                            }
                        }
                    }
                    if distance(mfs, mss, fs, ss) > MAX_DRIFT || !moved {
                        break;
                    }
                }

                if distance(mfs, mss, fs, ss) > MAX_DRIFT {
                    n_rej_drift += 1;
                    continue;
                }

                if is_hot_pixel(p, mfs, mss) {
                    n_rej_hot += 1;
                    continue;
                }

                let Some((cfs, css, intensity)) = centroid(p, mfs as i64, mss as i64) else {
                    n_rej_outside += 1;
                    continue;
                };

                if cfs < 0.0 || cfs >= p.w as f64 || css < 0.0 || css >= p.h as f64 {
                    n_rej_outside += 1;
                    continue;
                }

                let near = accepted
                    .iter()
                    .filter(|q| q.panel == panel_idx)
                    .map(|q| ((q.fs - cfs).powi(2) + (q.ss - css).powi(2)).sqrt())
                    .fold(f64::INFINITY, f64::min);
                if near < MIN_PEAK_SEPARATION {
                    n_rej_proximity += 1;
                    continue;
                }

                accepted.push(Peak {
                    fs: cfs,
                    ss: css,
                    panel: panel_idx,
                    intensity,
                });
            }
        }
    }

    let n_before_cull = accepted.len();
    cull_column_artefacts(&mut accepted);

    tracing::debug!(
        accepted = accepted.len(),
        culled = n_before_cull - accepted.len(),
        drift = n_rej_drift,
        hot = n_rej_hot,
        proximity = n_rej_proximity,
        outside = n_rej_outside,
        "zaef peak search finished"
    );

    accepted
}

/// Delete every peak in any fast-scan column holding more than
/// [`MAX_PEAKS_PER_COLUMN`] peaks.
fn cull_column_artefacts(peaks: &mut Vec<Peak>) {
    use std::collections::HashMap;
    let mut per_column: HashMap<(usize, i64), usize> = HashMap::new();
    for p in peaks.iter() {
        *per_column.entry((p.panel, p.fs.round() as i64)).or_insert(0) += 1;
    }
    peaks.retain(|p| per_column[&(p.panel, p.fs.round() as i64)] <= MAX_PEAKS_PER_COLUMN);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Detector;
    use crate::image::{BeamParams, Image};

    fn add_gaussian(p: &mut PanelData, cx: f64, cy: f64, amplitude: f32, sigma: f64) {
        for ss in 0..p.h {
            for fs in 0..p.w {
                let dx = fs as f64 - cx;
                let dy = ss as f64 - cy;
                let v = amplitude as f64 * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
                let i = p.idx(fs, ss);
                p.data[i] += v as f32;
            }
        }
    }

    fn frame_with_gaussians(centres: &[(f64, f64)]) -> Image {
        let det = Detector::simple(1024, 1024, 13333.3, 80e-3);
        let mut img = Image::new(&det, &BeamParams::default()).unwrap();
        for &(cx, cy) in centres {
            add_gaussian(&mut img.panels[0], cx, cy, 10_000.0, 2.0);
        }
        img
    }

    #[test]
    fn three_gaussians_are_found_with_subpixel_centroids() {
        let truth = [(100.0, 100.0), (500.0, 500.0), (900.0, 900.0)];
        let img = frame_with_gaussians(&truth);
        let peaks = search(&img, &ZaefConfig::default());
        assert_eq!(peaks.len(), 3, "expected exactly three peaks");

        for &(cx, cy) in &truth {
            let best = peaks
                .iter()
                .map(|p| ((p.fs - cx).powi(2) + (p.ss - cy).powi(2)).sqrt())
                .fold(f64::INFINITY, f64::min);
            assert!(
                best < 0.3,
                "no centroid within 0.3 px of ({cx}, {cy}); best distance {best}"
            );
        }
    }

    #[test]
    fn isolated_hot_pixel_is_rejected() {
        let det = Detector::simple(64, 64, 10000.0, 0.1);
        let mut img = Image::new(&det, &BeamParams::default()).unwrap();
        img.panels[0].set(32, 32, 50_000.0);
        let peaks = search(&img, &ZaefConfig::default());
        assert!(peaks.is_empty(), "a lone bright pixel must not be a peak");
    }

    #[test]
    fn column_artefact_is_culled() {
        let det = Detector::simple(256, 256, 10000.0, 0.1);
        let mut img = Image::new(&det, &BeamParams::default()).unwrap();
        // Five blobs stacked in the same column, plus one real peak aside.
        for i in 0..5 {
            add_gaussian(&mut img.panels[0], 64.0, 30.0 + 40.0 * i as f64, 10_000.0, 2.0);
        }
        add_gaussian(&mut img.panels[0], 180.0, 128.0, 10_000.0, 2.0);
        let peaks = search(&img, &ZaefConfig::default());
        assert_eq!(peaks.len(), 1, "the stacked column must be removed");
        assert!((peaks[0].fs - 180.0).abs() < 0.5);
    }

    #[test]
    fn threshold_suppresses_faint_blobs() {
        let det = Detector::simple(256, 256, 10000.0, 0.1);
        let mut img = Image::new(&det, &BeamParams::default()).unwrap();
        add_gaussian(&mut img.panels[0], 100.0, 100.0, 500.0, 2.0);
        let peaks = search(&img, &ZaefConfig::default());
        assert!(peaks.is_empty());
    }
}
