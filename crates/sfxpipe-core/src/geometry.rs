//! Multi-panel detector geometry.
//!
//! A [`Detector`] is an ordered list of [`Panel`]s. Each panel maps its
//! (fast-scan, slow-scan) pixel addresses into the lab frame through a
//! corner position, two basis vectors and a camera length. The lab frame
//! has the beam along +z and the origin at the interaction point; pixel
//! positions are converted to metres through the panel resolution
//! (pixels per metre).

use nalgebra::{Matrix2, Vector2, Vector3};

use crate::error::{EngineError, Result};

pub mod parse;

/// A quantity that is either a literal value or deferred to a named
/// per-frame file-header field.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueOrRef {
    Value(f64),
    HeaderRef(String),
}

impl ValueOrRef {
    /// Resolve against an optional header lookup.
    pub fn resolve(&self, lookup: impl Fn(&str) -> Option<f64>) -> Result<f64> {
        match self {
            ValueOrRef::Value(v) => Ok(*v),
            ValueOrRef::HeaderRef(name) => lookup(name).ok_or_else(|| {
                EngineError::MalformedInput(format!("header field '{name}' not present"))
            }),
        }
    }
}

/// A rectangular bad region in global (fs, ss) addresses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BadRegion {
    pub min_fs: usize,
    pub max_fs: usize,
    pub min_ss: usize,
    pub max_ss: usize,
}

impl BadRegion {
    pub fn contains(&self, fs: usize, ss: usize) -> bool {
        fs >= self.min_fs && fs <= self.max_fs && ss >= self.min_ss && ss <= self.max_ss
    }
}

/// One detector tile.
#[derive(Debug, Clone, PartialEq)]
pub struct Panel {
    pub name: String,
    /// Inclusive global fast-scan address range.
    pub min_fs: usize,
    pub max_fs: usize,
    /// Inclusive global slow-scan address range.
    pub min_ss: usize,
    pub max_ss: usize,
    /// Lab-frame position of the (min_fs, min_ss) corner, in pixels.
    pub cnx: f64,
    pub cny: f64,
    /// Lab components of one fast-scan pixel step.
    pub fsx: f64,
    pub fsy: f64,
    /// Lab components of one slow-scan pixel step.
    pub ssx: f64,
    pub ssy: f64,
    /// Resolution in pixels per metre.
    pub res: f64,
    /// Camera length in metres, possibly deferred to a file header.
    pub clen: ValueOrRef,
    /// Resolved camera length (metres); filled in per frame when `clen`
    /// references a header field.
    pub clen_value: f64,
    /// Exclude this panel's peaks from indexing.
    pub no_index: bool,
}

impl Panel {
    /// Panel width in pixels.
    pub fn width(&self) -> usize {
        self.max_fs - self.min_fs + 1
    }

    /// Panel height in pixels.
    pub fn height(&self) -> usize {
        self.max_ss - self.min_ss + 1
    }

    /// Whether panel-relative coordinates are inside the panel rectangle.
    pub fn contains_relative(&self, fs: f64, ss: f64) -> bool {
        fs >= 0.0 && fs < self.width() as f64 && ss >= 0.0 && ss < self.height() as f64
    }

    /// Lab-frame position (metres) of panel-relative subpixel (fs, ss).
    pub fn lab_position(&self, fs: f64, ss: f64) -> Vector3<f64> {
        let px = self.cnx + fs * self.fsx + ss * self.ssx;
        let py = self.cny + fs * self.fsy + ss * self.ssy;
        Vector3::new(px / self.res, py / self.res, self.clen_value)
    }

    /// Scattering vector q (m⁻¹) for panel-relative (fs, ss) at wavenumber
    /// `k` = 1/λ.
    pub fn scattering_vector(&self, fs: f64, ss: f64, k: f64) -> Vector3<f64> {
        let pos = self.lab_position(fs, ss);
        let unit = pos / pos.norm();
        Vector3::new(k * unit.x, k * unit.y, k * (unit.z - 1.0))
    }

    /// Scattering angle 2θ for panel-relative (fs, ss).
    pub fn two_theta(&self, fs: f64, ss: f64) -> f64 {
        let pos = self.lab_position(fs, ss);
        (pos.x * pos.x + pos.y * pos.y).sqrt().atan2(pos.z)
    }

    /// Invert the fs/ss basis: returns panel-relative (fs, ss) for a lab
    /// pixel offset from the panel corner, or an error if the basis is
    /// degenerate.
    fn solve_basis(&self, dx_px: f64, dy_px: f64) -> Result<(f64, f64)> {
        let m = Matrix2::new(self.fsx, self.ssx, self.fsy, self.ssy);
        let rhs = Vector2::new(dx_px, dy_px);
        let sol = m
            .lu()
            .solve(&rhs)
            .ok_or(EngineError::LinAlgSingular("panel basis"))?;
        Ok((sol.x, sol.y))
    }
}

/// An ordered collection of panels plus detector-wide mask semantics.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Detector {
    pub panels: Vec<Panel>,
    /// Flag bits that must all be present for a pixel to be good.
    pub mask_good: u32,
    /// Flag bits that mark a pixel bad.
    pub mask_bad: u32,
    /// Bad regions in global addresses.
    pub bad_regions: Vec<BadRegion>,
}

impl Detector {
    /// The panel owning global integer address (fs, ss), if any.
    pub fn find_panel(&self, fs: usize, ss: usize) -> Option<usize> {
        self.panels.iter().position(|p| {
            fs >= p.min_fs && fs <= p.max_fs && ss >= p.min_ss && ss <= p.max_ss
        })
    }

    /// Whether a global address falls in any bad region.
    pub fn in_bad_region(&self, fs: usize, ss: usize) -> bool {
        self.bad_regions.iter().any(|r| r.contains(fs, ss))
    }

    /// Largest |q| reachable on any panel at wavelength λ (metres).
    pub fn largest_q(&self, lambda: f64) -> f64 {
        let k = 1.0 / lambda;
        let mut best: f64 = 0.0;
        for p in &self.panels {
            let w = p.width() as f64;
            let h = p.height() as f64;
            for (fs, ss) in [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)] {
                best = best.max(p.scattering_vector(fs, ss, k).norm());
            }
        }
        best
    }

    /// Map a scattering vector back to (panel index, panel-relative fs, ss).
    ///
    /// Returns `None` when the scattered ray misses every panel or points
    /// away from the detector.
    pub fn reverse_map(&self, q: &Vector3<f64>, k: f64) -> Option<(usize, f64, f64)> {
        let scattered = Vector3::new(q.x, q.y, q.z + k);
        if scattered.z <= 0.0 {
            return None;
        }
        for (pi, p) in self.panels.iter().enumerate() {
            let x = p.clen_value * scattered.x / scattered.z;
            let y = p.clen_value * scattered.y / scattered.z;
            let dx_px = x * p.res - p.cnx;
            let dy_px = y * p.res - p.cny;
            let Ok((fs, ss)) = p.solve_basis(dx_px, dy_px) else {
                continue;
            };
            if p.contains_relative(fs, ss) {
                return Some((pi, fs, ss));
            }
        }
        None
    }

    /// Verify that panel rectangles are disjoint in (fs, ss) address space.
    pub fn check_panel_overlap(&self) -> Result<()> {
        for (i, a) in self.panels.iter().enumerate() {
            for b in &self.panels[i + 1..] {
                let fs_overlap = a.min_fs <= b.max_fs && b.min_fs <= a.max_fs;
                let ss_overlap = a.min_ss <= b.max_ss && b.min_ss <= a.max_ss;
                if fs_overlap && ss_overlap {
                    return Err(EngineError::MalformedInput(format!(
                        "panels '{}' and '{}' overlap in address space",
                        a.name, b.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// A single square panel centred on the beam: the geometry used by the
    /// synthetic-frame tests.
    pub fn simple(width: usize, height: usize, res: f64, clen: f64) -> Self {
        Detector {
            panels: vec![Panel {
                name: "panel0".into(),
                min_fs: 0,
                max_fs: width - 1,
                min_ss: 0,
                max_ss: height - 1,
                cnx: -(width as f64) / 2.0,
                cny: -(height as f64) / 2.0,
                fsx: 1.0,
                fsy: 0.0,
                ssx: 0.0,
                ssy: 1.0,
                res,
                clen: ValueOrRef::Value(clen),
                clen_value: clen,
                no_index: false,
            }],
            mask_good: 0,
            mask_bad: 0,
            bad_regions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn det() -> Detector {
        Detector::simple(1024, 1024, 13333.3, 80e-3)
    }

    #[test]
    fn beam_centre_has_zero_q() {
        let det = det();
        let q = det.panels[0].scattering_vector(512.0, 512.0, 1.0 / 1.55e-10);
        assert!(q.norm() < 1e-3, "|q| at the beam centre = {}", q.norm());
    }

    #[test]
    fn forward_and_reverse_mapping_agree() {
        let det = det();
        let k = 1.0 / 1.55e-10;
        for (fs, ss) in [(100.25, 700.5), (512.0, 100.0), (900.75, 900.75)] {
            let q = det.panels[0].scattering_vector(fs, ss, k);
            let (pi, rfs, rss) = det.reverse_map(&q, k).expect("ray must hit the panel");
            assert_eq!(pi, 0);
            assert_relative_eq!(rfs, fs, epsilon = 1e-6);
            assert_relative_eq!(rss, ss, epsilon = 1e-6);
        }
    }

    #[test]
    fn largest_q_is_at_a_corner() {
        let det = det();
        let lambda = 1.55e-10;
        let qmax = det.largest_q(lambda);
        let qc = det.panels[0]
            .scattering_vector(0.0, 0.0, 1.0 / lambda)
            .norm();
        assert_relative_eq!(qmax, qc, max_relative = 1e-12);
        assert!(qmax > 0.0);
    }

    #[test]
    fn overlapping_panels_are_detected() {
        let mut det = det();
        let mut second = det.panels[0].clone();
        second.name = "panel1".into();
        second.min_fs = 1000;
        det.panels.push(second);
        assert!(det.check_panel_overlap().is_err());

        det.panels[1].min_fs = 1024;
        det.panels[1].max_fs = 2047;
        assert!(det.check_panel_overlap().is_ok());
    }

    #[test]
    fn header_referenced_clen_resolves() {
        let v = ValueOrRef::HeaderRef("/LCLS/detectorPosition".into());
        let got = v
            .resolve(|name| (name == "/LCLS/detectorPosition").then_some(0.112))
            .unwrap();
        assert_relative_eq!(got, 0.112);
        assert!(v.resolve(|_| None).is_err());
    }
}
