//! Detector frames: per-panel rasters, masks, beam values and peak lists.
//!
//! An [`Image`] exclusively owns its panel buffers, its feature (peak) list
//! and any crystals found on it. Decoding image files is an external
//! concern; the engine receives frames as owned `f32` rasters, one per
//! panel, in panel-relative row-major layout.

use std::collections::BTreeMap;

use crate::crystal::Crystal;
use crate::error::Result;
use crate::geometry::parse::BeamDefaults;
use crate::geometry::Detector;

/// hc/e in eV·m: λ = PHOTON_EV_M / E[eV].
pub const PHOTON_EV_M: f64 = 1.239841984e-6;

/// Convert a photon energy in eV to a wavelength in metres.
pub fn ev_to_lambda(ev: f64) -> f64 {
    PHOTON_EV_M / ev
}

/// Owned single-channel raster for one panel, with bad-pixel and
/// saturation companions. Row-major, panel-relative addressing.
#[derive(Debug, Clone)]
pub struct PanelData {
    pub w: usize,
    pub h: usize,
    pub data: Vec<f32>,
    /// Bad-pixel mask; bad pixels never contribute to peaks or integration.
    pub bad: Vec<bool>,
    /// Per-pixel saturation level (infinity when the detector never
    /// saturates).
    pub sat: Vec<f32>,
}

impl PanelData {
    pub fn new(w: usize, h: usize) -> Self {
        Self {
            w,
            h,
            data: vec![0.0; w * h],
            bad: vec![false; w * h],
            sat: vec![f32::INFINITY; w * h],
        }
    }

    #[inline]
    pub fn idx(&self, fs: usize, ss: usize) -> usize {
        ss * self.w + fs
    }

    #[inline]
    pub fn get(&self, fs: usize, ss: usize) -> f32 {
        self.data[self.idx(fs, ss)]
    }

    #[inline]
    pub fn set(&mut self, fs: usize, ss: usize, v: f32) {
        let i = self.idx(fs, ss);
        self.data[i] = v;
    }

    #[inline]
    pub fn is_bad(&self, fs: usize, ss: usize) -> bool {
        self.bad[self.idx(fs, ss)]
    }

    #[inline]
    pub fn is_saturated(&self, fs: usize, ss: usize) -> bool {
        let i = self.idx(fs, ss);
        self.data[i] >= self.sat[i]
    }

    /// Subtract the local median over a square window of half-width
    /// `radius` from every pixel. Used to flatten slowly varying
    /// background before peak search.
    pub fn median_filter(&mut self, radius: usize) {
        if radius == 0 {
            return;
        }
        let mut out = self.data.clone();
        let mut window = Vec::with_capacity((2 * radius + 1) * (2 * radius + 1));
        for ss in 0..self.h {
            for fs in 0..self.w {
                window.clear();
                let fs0 = fs.saturating_sub(radius);
                let fs1 = (fs + radius).min(self.w - 1);
                let ss0 = ss.saturating_sub(radius);
                let ss1 = (ss + radius).min(self.h - 1);
                for wss in ss0..=ss1 {
                    for wfs in fs0..=fs1 {
                        window.push(self.get(wfs, wss));
                    }
                }
                window.sort_by(|a, b| a.partial_cmp(b).unwrap());
                let median = window[window.len() / 2];
                out[self.idx(fs, ss)] -= median;
            }
        }
        self.data = out;
    }

    /// Zero out every pixel whose 3×3 neighbourhood contains a negative
    /// value. Suppresses readout noise around pedestal-subtracted zeros.
    pub fn noise_filter(&mut self) {
        let mut out = self.data.clone();
        for ss in 0..self.h {
            for fs in 0..self.w {
                let fs0 = fs.saturating_sub(1);
                let fs1 = (fs + 1).min(self.w - 1);
                let ss0 = ss.saturating_sub(1);
                let ss1 = (ss + 1).min(self.h - 1);
                let mut suppress = false;
                'scan: for wss in ss0..=ss1 {
                    for wfs in fs0..=fs1 {
                        if self.get(wfs, wss) < 0.0 {
                            suppress = true;
                            break 'scan;
                        }
                    }
                }
                if suppress {
                    out[self.idx(fs, ss)] = 0.0;
                }
            }
        }
        self.data = out;
    }
}

/// A located Bragg peak: subpixel panel-relative position plus intensity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub fs: f64,
    pub ss: f64,
    /// Index of the owning panel in the detector's panel list.
    pub panel: usize,
    pub intensity: f64,
}

/// Nominal beam parameters, optionally deferred to per-frame headers.
#[derive(Debug, Clone)]
pub struct BeamParams {
    /// Photon energy in eV, or a header field reference.
    pub photon_energy: crate::geometry::ValueOrRef,
    /// Full divergence angle in radians.
    pub divergence: f64,
    /// Fractional bandwidth Δλ/λ.
    pub bandwidth: f64,
    /// Initial reciprocal-space profile radius for new crystals (m⁻¹).
    pub profile_radius: f64,
}

impl Default for BeamParams {
    fn default() -> Self {
        Self {
            photon_energy: crate::geometry::ValueOrRef::Value(8000.0),
            divergence: 1.0e-3,
            bandwidth: 1.0e-2,
            profile_radius: 3.0e6,
        }
    }
}

impl BeamParams {
    /// Merge geometry-file defaults into unset fields.
    pub fn with_geometry_defaults(mut self, defaults: &BeamDefaults) -> Self {
        if defaults.photon_energy != crate::geometry::ValueOrRef::Value(0.0) {
            self.photon_energy = defaults.photon_energy.clone();
        }
        self
    }

    /// Parse a beam parameter file (`key = value`; keys `photon_energy`
    /// in eV or a header reference, `divergence` in rad, `bandwidth` as a
    /// fraction, `profile_radius` in m⁻¹). Unknown keys warn and are
    /// skipped.
    pub fn parse(text: &str) -> crate::error::Result<Self> {
        let mut beam = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            let number = || -> crate::error::Result<f64> {
                value.parse().map_err(|_| {
                    crate::error::EngineError::MalformedInput(format!(
                        "bad value for beam key '{key}': '{value}'"
                    ))
                })
            };
            match key {
                "photon_energy" => {
                    beam.photon_energy = match value.parse::<f64>() {
                        Ok(v) => crate::geometry::ValueOrRef::Value(v),
                        Err(_) => crate::geometry::ValueOrRef::HeaderRef(value.to_string()),
                    };
                }
                "divergence" => beam.divergence = number()?,
                "bandwidth" => beam.bandwidth = number()?,
                "profile_radius" => beam.profile_radius = number()?,
                other => {
                    tracing::warn!(key = other, "unknown beam file key ignored");
                }
            }
        }
        Ok(beam)
    }
}

/// One detector frame and everything derived from it.
#[derive(Debug, Clone)]
pub struct Image {
    pub filename: String,
    /// Event identifier inside a multi-event file (empty for single-frame
    /// files).
    pub event: String,
    /// Serial number assigned by the pipeline.
    pub serial: usize,
    /// Raster data, one entry per detector panel, same order.
    pub panels: Vec<PanelData>,
    /// Frame-local copy of the detector (camera lengths resolved from
    /// headers belong to this frame only).
    pub detector: Detector,
    /// Numeric per-frame header fields used to resolve deferred geometry
    /// and beam values.
    pub headers: BTreeMap<String, f64>,
    /// Wavelength in metres.
    pub lambda: f64,
    /// Full divergence angle in radians.
    pub divergence: f64,
    /// Fractional bandwidth Δλ/λ.
    pub bandwidth: f64,
    pub features: Vec<Peak>,
    pub crystals: Vec<Crystal>,
    pub n_saturated_peaks: usize,
}

impl Image {
    /// A frame of zeros matching `detector`, with beam values resolved from
    /// `beam` and the frame headers.
    pub fn new(detector: &Detector, beam: &BeamParams) -> Result<Self> {
        Self::with_headers(detector, beam, BTreeMap::new())
    }

    /// As [`Image::new`], resolving any header-referenced camera lengths
    /// and photon energies against `headers`.
    pub fn with_headers(
        detector: &Detector,
        beam: &BeamParams,
        headers: BTreeMap<String, f64>,
    ) -> Result<Self> {
        let mut detector = detector.clone();
        for p in &mut detector.panels {
            p.clen_value = p.clen.resolve(|name| headers.get(name).copied())?;
        }
        let ev = beam
            .photon_energy
            .resolve(|name| headers.get(name).copied())?;
        let panels = detector
            .panels
            .iter()
            .map(|p| PanelData::new(p.width(), p.height()))
            .collect();
        Ok(Self {
            filename: String::new(),
            event: String::new(),
            serial: 0,
            panels,
            detector,
            headers,
            lambda: ev_to_lambda(ev),
            divergence: beam.divergence,
            bandwidth: beam.bandwidth,
            features: Vec::new(),
            crystals: Vec::new(),
            n_saturated_peaks: 0,
        })
    }

    /// Distance to and index of the feature closest to (fs, ss) on
    /// `panel`, if any.
    pub fn feature_closest(&self, fs: f64, ss: f64, panel: usize) -> Option<(f64, usize)> {
        self.features
            .iter()
            .enumerate()
            .filter(|(_, f)| f.panel == panel)
            .map(|(i, f)| {
                let d = ((f.fs - fs).powi(2) + (f.ss - ss).powi(2)).sqrt();
                (d, i)
            })
            .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Detector;
    use approx::assert_relative_eq;

    #[test]
    fn median_filter_flattens_constant_offset() {
        let mut p = PanelData::new(16, 16);
        for v in p.data.iter_mut() {
            *v = 100.0;
        }
        p.set(8, 8, 1100.0);
        p.median_filter(2);
        // The background goes to zero, the spike keeps its contrast.
        assert_relative_eq!(p.get(2, 2), 0.0);
        assert_relative_eq!(p.get(8, 8), 1000.0);
    }

    #[test]
    fn noise_filter_zeroes_around_negatives() {
        let mut p = PanelData::new(8, 8);
        for v in p.data.iter_mut() {
            *v = 5.0;
        }
        p.set(4, 4, -1.0);
        p.noise_filter();
        assert_relative_eq!(p.get(4, 4), 0.0);
        assert_relative_eq!(p.get(3, 4), 0.0);
        assert_relative_eq!(p.get(5, 5), 0.0);
        assert_relative_eq!(p.get(1, 1), 5.0);
    }

    #[test]
    fn image_resolves_header_referenced_values() {
        let mut det = Detector::simple(64, 64, 10000.0, 0.1);
        det.panels[0].clen = crate::geometry::ValueOrRef::HeaderRef("clen_mm".into());
        let beam = BeamParams {
            photon_energy: crate::geometry::ValueOrRef::HeaderRef("photon_eV".into()),
            ..BeamParams::default()
        };
        let headers = BTreeMap::from([("clen_mm".to_string(), 0.093), ("photon_eV".to_string(), 9500.0)]);
        let img = Image::with_headers(&det, &beam, headers).unwrap();
        assert_relative_eq!(img.detector.panels[0].clen_value, 0.093);
        assert_relative_eq!(img.lambda, ev_to_lambda(9500.0));

        assert!(Image::new(&det, &BeamParams::default()).is_err());
    }

    #[test]
    fn beam_file_is_parsed() {
        let text = "photon_energy = 9300.0\n\
                    divergence = 2.0e-3\n\
                    bandwidth = 0.008\n\
                    profile_radius = 2.5e6\n\
                    future_key = 1\n";
        let beam = BeamParams::parse(text).unwrap();
        assert_eq!(
            beam.photon_energy,
            crate::geometry::ValueOrRef::Value(9300.0)
        );
        assert_relative_eq!(beam.divergence, 2.0e-3);
        assert_relative_eq!(beam.bandwidth, 0.008);
        assert_relative_eq!(beam.profile_radius, 2.5e6);
    }

    #[test]
    fn closest_feature_respects_panel() {
        let det = Detector::simple(64, 64, 10000.0, 0.1);
        let mut img = Image::new(&det, &BeamParams::default()).unwrap();
        img.features.push(Peak {
            fs: 10.0,
            ss: 10.0,
            panel: 0,
            intensity: 1.0,
        });
        let (d, idx) = img.feature_closest(13.0, 14.0, 0).unwrap();
        assert_eq!(idx, 0);
        assert_relative_eq!(d, 5.0);
        assert!(img.feature_closest(13.0, 14.0, 1).is_none());
    }
}
