//! Connected-component peak search with local-background SNR gates
//! (peakfinder8, and the stricter peakfinder9 variant).
//!
//! Candidate pixels inside a resolution annulus seed a flood fill over
//! neighbouring pixels that clear the same SNR gate against a local
//! background estimate; components are kept when their pixel count lies in
//! a configured band. Peakfinder9 additionally requires the seed to be a
//! strict local maximum with a margin, a higher seed SNR, and a minimum
//! background spread.

use crate::image::{Image, PanelData, Peak};

/// Tuning shared by peakfinder8 and peakfinder9.
#[derive(Debug, Clone)]
pub struct PeakfinderConfig {
    /// Minimum raw pixel value considered at all (ADU).
    pub adu_threshold: f64,
    /// SNR gate for component membership.
    pub min_snr: f64,
    /// Component size band.
    pub min_pix_count: usize,
    pub max_pix_count: usize,
    /// Half-width of the square local-background window (pixels).
    pub local_bg_radius: usize,
    /// Resolution annulus in pixels from the beam axis.
    pub min_res: f64,
    pub max_res: f64,
    /// Peakfinder9: SNR gate for the brightest pixel of a component.
    pub min_snr_biggest_pix: f64,
    /// Peakfinder9: SNR gate for every accepted component pixel.
    pub min_snr_peak_pix: f64,
    /// Peakfinder9: minimum background standard deviation.
    pub min_sig: f64,
    /// Peakfinder9: seed must exceed each neighbour by this margin.
    pub min_peak_over_neighbour: f64,
}

impl Default for PeakfinderConfig {
    fn default() -> Self {
        Self {
            adu_threshold: 0.0,
            min_snr: 5.0,
            min_pix_count: 2,
            max_pix_count: 200,
            local_bg_radius: 3,
            min_res: 0.0,
            max_res: 1200.0,
            min_snr_biggest_pix: 7.0,
            min_snr_peak_pix: 6.0,
            min_sig: 0.0,
            min_peak_over_neighbour: f64::NEG_INFINITY,
        }
    }
}

/// Local background estimate: median and a MAD-derived standard deviation
/// over a square ring around (fs, ss), excluding the central 3×3 block so
/// the peak itself does not lift the estimate.
fn local_background(p: &PanelData, fs: usize, ss: usize, radius: usize) -> Option<(f64, f64)> {
    let radius = radius.max(2);
    let fs0 = fs.saturating_sub(radius);
    let fs1 = (fs + radius).min(p.w - 1);
    let ss0 = ss.saturating_sub(radius);
    let ss1 = (ss + radius).min(p.h - 1);

    let mut values = Vec::with_capacity((2 * radius + 1) * (2 * radius + 1));
    for wss in ss0..=ss1 {
        for wfs in fs0..=fs1 {
            let center_block = wfs.abs_diff(fs) <= 1 && wss.abs_diff(ss) <= 1;
            if center_block || p.is_bad(wfs, wss) {
                continue;
            }
            values.push(p.get(wfs, wss) as f64);
        }
    }
    if values.len() < 4 {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let median = values[values.len() / 2];
    let mut deviations: Vec<f64> = values.iter().map(|v| (v - median).abs()).collect();
    deviations.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mad = deviations[deviations.len() / 2];
    // MAD → σ for a normal distribution; floor keeps SNR finite on
    // perfectly flat background.
    let sigma = (1.4826 * mad).max(1e-3);
    Some((median, sigma))
}

/// Radius of a panel-relative pixel from the beam axis, in pixels.
fn beam_radius_px(panel: &crate::geometry::Panel, fs: f64, ss: f64) -> f64 {
    let px = panel.cnx + fs * panel.fsx + ss * panel.ssx;
    let py = panel.cny + fs * panel.fsy + ss * panel.ssy;
    (px * px + py * py).sqrt()
}

fn strict_local_maximum(p: &PanelData, fs: usize, ss: usize, margin: f64) -> bool {
    if fs == 0 || ss == 0 || fs + 1 >= p.w || ss + 1 >= p.h {
        return false;
    }
    let v = p.get(fs, ss) as f64;
    let required = if margin.is_finite() { margin.max(0.0) } else { 0.0 };
    for dss in -1i64..=1 {
        for dfs in -1i64..=1 {
            if dfs == 0 && dss == 0 {
                continue;
            }
            let n = p.get((fs as i64 + dfs) as usize, (ss as i64 + dss) as usize) as f64;
            if v <= n + required {
                return false;
            }
        }
    }
    true
}

/// Run peakfinder8 (or peakfinder9 when `stricter` is set) over all
/// panels.
pub fn search(image: &Image, config: &PeakfinderConfig, stricter: bool) -> Vec<Peak> {
    let mut peaks = Vec::new();

    for (panel_idx, p) in image.panels.iter().enumerate() {
        let geom = &image.detector.panels[panel_idx];
        let mut visited = vec![false; p.w * p.h];

        for ss in 0..p.h {
            for fs in 0..p.w {
                if visited[p.idx(fs, ss)] || p.is_bad(fs, ss) {
                    continue;
                }
                let v = p.get(fs, ss) as f64;
                if v < config.adu_threshold {
                    continue;
                }
                let r = beam_radius_px(geom, fs as f64, ss as f64);
                if r < config.min_res || r > config.max_res {
                    continue;
                }
                let Some((bg, sigma)) = local_background(p, fs, ss, config.local_bg_radius)
                else {
                    continue;
                };
                if stricter && sigma < config.min_sig {
                    continue;
                }

                let seed_snr = (v - bg) / sigma;
                let seed_gate = if stricter {
                    config.min_snr_biggest_pix
                } else {
                    config.min_snr
                };
                if seed_snr < seed_gate {
                    continue;
                }
                if stricter && !strict_local_maximum(p, fs, ss, config.min_peak_over_neighbour) {
                    continue;
                }

                let member_gate = if stricter {
                    config.min_snr_peak_pix
                } else {
                    config.min_snr
                };

                // Flood fill the connected component above the member gate.
                let mut stack = vec![(fs, ss)];
                let mut members: Vec<(usize, usize, f64)> = Vec::new();
                visited[p.idx(fs, ss)] = true;
                while let Some((cfs, css)) = stack.pop() {
                    let cv = p.get(cfs, css) as f64;
                    members.push((cfs, css, cv - bg));
                    if members.len() > config.max_pix_count {
                        break;
                    }
                    for (dfs, dss) in [(1i64, 0i64), (-1, 0), (0, 1), (0, -1)] {
                        let nfs = cfs as i64 + dfs;
                        let nss = css as i64 + dss;
                        if nfs < 0 || nss < 0 || nfs >= p.w as i64 || nss >= p.h as i64 {
                            continue;
                        }
                        let (nfs, nss) = (nfs as usize, nss as usize);
                        if visited[p.idx(nfs, nss)] || p.is_bad(nfs, nss) {
                            continue;
                        }
                        let nv = p.get(nfs, nss) as f64;
                        if (nv - bg) / sigma >= member_gate {
                            visited[p.idx(nfs, nss)] = true;
                            stack.push((nfs, nss));
                        }
                    }
                }

                if members.len() < config.min_pix_count || members.len() > config.max_pix_count {
                    continue;
                }

                let total: f64 = members.iter().map(|m| m.2).sum();
                if total <= 0.0 {
                    continue;
                }
                let cfs = members.iter().map(|m| m.0 as f64 * m.2).sum::<f64>() / total;
                let css = members.iter().map(|m| m.1 as f64 * m.2).sum::<f64>() / total;

                peaks.push(Peak {
                    fs: cfs,
                    ss: css,
                    panel: panel_idx,
                    intensity: total,
                });
            }
        }
    }

    tracing::debug!(
        found = peaks.len(),
        variant = if stricter { "peakfinder9" } else { "peakfinder8" },
        "connected-component peak search finished"
    );
    peaks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Detector;
    use crate::image::{BeamParams, Image};

    fn noisy_frame(seed_peaks: &[(usize, usize, f32)]) -> Image {
        let det = Detector::simple(256, 256, 10000.0, 0.1);
        let mut img = Image::new(&det, &BeamParams::default()).unwrap();
        // Deterministic mild background texture.
        for ss in 0..256 {
            for fs in 0..256 {
                let v = 10.0 + ((fs * 7 + ss * 13) % 5) as f32;
                img.panels[0].set(fs, ss, v);
            }
        }
        for &(fs, ss, amp) in seed_peaks {
            for (dfs, dss) in [(0i64, 0i64), (1, 0), (0, 1), (1, 1)] {
                let f = (fs as i64 + dfs) as usize;
                let s = (ss as i64 + dss) as usize;
                let old = img.panels[0].get(f, s);
                img.panels[0].set(f, s, old + amp);
            }
        }
        img
    }

    #[test]
    fn component_detector_finds_compact_blobs() {
        let img = noisy_frame(&[(60, 60, 500.0), (180, 120, 700.0)]);
        let peaks = search(&img, &PeakfinderConfig::default(), false);
        assert_eq!(peaks.len(), 2);
        for (fs, ss) in [(60.5, 60.5), (180.5, 120.5)] {
            let best = peaks
                .iter()
                .map(|p| ((p.fs - fs).powi(2) + (p.ss - ss).powi(2)).sqrt())
                .fold(f64::INFINITY, f64::min);
            assert!(best < 1.0, "centroid miss: {best}");
        }
    }

    #[test]
    fn pixel_count_band_rejects_single_pixels() {
        let det = Detector::simple(128, 128, 10000.0, 0.1);
        let mut img = Image::new(&det, &BeamParams::default()).unwrap();
        img.panels[0].set(64, 64, 10_000.0);
        let cfg = PeakfinderConfig::default();
        assert!(cfg.min_pix_count >= 2);
        let peaks = search(&img, &cfg, false);
        assert!(peaks.is_empty(), "one hot pixel is below min_pix_count");
    }

    #[test]
    fn resolution_annulus_excludes_peaks() {
        let img = noisy_frame(&[(128, 140, 600.0)]);
        let mut cfg = PeakfinderConfig::default();
        // The blob sits ~12 px from the beam axis; exclude it.
        cfg.min_res = 50.0;
        assert!(search(&img, &cfg, false).is_empty());
        cfg.min_res = 0.0;
        assert_eq!(search(&img, &cfg, false).len(), 1);
    }

    #[test]
    fn peakfinder9_requires_local_maximum_margin() {
        let img = noisy_frame(&[(60, 60, 500.0)]);
        let mut cfg = PeakfinderConfig::default();
        cfg.min_sig = 0.0;
        // A 2×2 flat-top blob has no strict local maximum with a margin.
        cfg.min_peak_over_neighbour = 1.0;
        assert!(search(&img, &cfg, true).is_empty());
    }
}
