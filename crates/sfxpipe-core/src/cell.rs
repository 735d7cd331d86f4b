//! Unit cell representations and conversions.
//!
//! A [`UnitCell`] is stored in exactly one of three equivalent forms:
//!
//! 1. **Crystallographic** – six parameters (a, b, c, α, β, γ).
//! 2. **Cartesian** – the three direct-space axis vectors in the lab frame.
//! 3. **Reciprocal** – the three reciprocal-space axis vectors.
//!
//! Getters for the other two forms convert on demand. The crystallographic →
//! Cartesian convention places **a** along +x, **b** in the xy plane with γ
//! as the a–b angle, and gives **c** a positive z component. Reciprocal ↔
//! Cartesian is the inverse-transpose of the 3×3 axis matrix, computed with
//! an explicit LU decomposition.
//!
//! All lengths are metres, reciprocal lengths m⁻¹, angles radians.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

pub mod parse;

/// Relative weight of reciprocal-length misfit against angle misfit when
/// ranking candidate bases in [`match_cell`].
const LENGTH_WEIGHT: f64 = 10.0e-9;

/// Bravais lattice type, as written in cell files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatticeType {
    #[default]
    Triclinic,
    Monoclinic,
    Orthorhombic,
    Tetragonal,
    Rhombohedral,
    Hexagonal,
    Cubic,
}

impl LatticeType {
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "triclinic" => Some(Self::Triclinic),
            "monoclinic" => Some(Self::Monoclinic),
            "orthorhombic" => Some(Self::Orthorhombic),
            "tetragonal" => Some(Self::Tetragonal),
            "rhombohedral" => Some(Self::Rhombohedral),
            "hexagonal" => Some(Self::Hexagonal),
            "cubic" => Some(Self::Cubic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triclinic => "triclinic",
            Self::Monoclinic => "monoclinic",
            Self::Orthorhombic => "orthorhombic",
            Self::Tetragonal => "tetragonal",
            Self::Rhombohedral => "rhombohedral",
            Self::Hexagonal => "hexagonal",
            Self::Cubic => "cubic",
        }
    }
}

/// The six crystallographic parameters (metres / radians).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellParams {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

/// The canonical stored form of a cell.
#[derive(Debug, Clone, Copy, PartialEq)]
enum CellRep {
    /// Six scalar parameters.
    Crystallographic(CellParams),
    /// Direct axes as matrix columns (a | b | c), lab frame, metres.
    Cartesian(Matrix3<f64>),
    /// Reciprocal axes as matrix columns (a* | b* | c*), m⁻¹.
    Reciprocal(Matrix3<f64>),
}

/// A unit cell in one canonical representation plus lattice metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitCell {
    rep: CellRep,
    pub lattice_type: LatticeType,
    /// Centering symbol (P, A, B, C, I, F, R, H).
    pub centering: char,
    /// Unique axis for monoclinic settings ('a', 'b', 'c' or '*' = unset).
    pub unique_axis: char,
}

impl UnitCell {
    /// Cell from the six crystallographic parameters.
    pub fn from_parameters(a: f64, b: f64, c: f64, alpha: f64, beta: f64, gamma: f64) -> Self {
        Self {
            rep: CellRep::Crystallographic(CellParams {
                a,
                b,
                c,
                alpha,
                beta,
                gamma,
            }),
            lattice_type: LatticeType::default(),
            centering: 'P',
            unique_axis: '*',
        }
    }

    /// Cell from direct-space axis vectors (matrix columns a | b | c).
    pub fn from_cartesian(axes: Matrix3<f64>) -> Self {
        Self {
            rep: CellRep::Cartesian(axes),
            lattice_type: LatticeType::default(),
            centering: 'P',
            unique_axis: '*',
        }
    }

    /// Cell from reciprocal axis vectors (matrix columns a* | b* | c*).
    pub fn from_reciprocal(axes: Matrix3<f64>) -> Self {
        Self {
            rep: CellRep::Reciprocal(axes),
            lattice_type: LatticeType::default(),
            centering: 'P',
            unique_axis: '*',
        }
    }

    /// The six parameters, converting from the stored representation if
    /// needed.
    pub fn parameters(&self) -> Result<CellParams> {
        match self.rep {
            CellRep::Crystallographic(p) => Ok(p),
            CellRep::Cartesian(m) => Ok(params_from_axes(&m)),
            CellRep::Reciprocal(m) => {
                let direct = invert_axes(&m)?;
                Ok(params_from_axes(&direct))
            }
        }
    }

    /// Direct axes as matrix columns (a | b | c).
    pub fn cartesian(&self) -> Result<Matrix3<f64>> {
        match self.rep {
            CellRep::Crystallographic(p) => crystallographic_to_cartesian(&p),
            CellRep::Cartesian(m) => Ok(m),
            CellRep::Reciprocal(m) => invert_axes(&m),
        }
    }

    /// Reciprocal axes as matrix columns (a* | b* | c*).
    pub fn reciprocal(&self) -> Result<Matrix3<f64>> {
        match self.rep {
            CellRep::Crystallographic(p) => {
                let direct = crystallographic_to_cartesian(&p)?;
                invert_axes(&direct)
            }
            CellRep::Cartesian(m) => invert_axes(&m),
            CellRep::Reciprocal(m) => Ok(m),
        }
    }

    /// Replace the reciprocal axes, keeping lattice metadata.
    pub fn set_reciprocal(&mut self, axes: Matrix3<f64>) {
        self.rep = CellRep::Reciprocal(axes);
    }

    /// Return a copy rotated by `rot` (applied to all axis vectors).
    pub fn rotated(&self, rot: &Matrix3<f64>) -> Result<Self> {
        let direct = self.cartesian()?;
        let mut out = self.clone();
        out.rep = CellRep::Cartesian(rot * direct);
        Ok(out)
    }

    /// sin θ / λ = 1/2d for the reflection (h, k, l). Multiply by two for
    /// 1/d.
    pub fn resolution(&self, h: i32, k: i32, l: i32) -> Result<f64> {
        let p = self.parameters()?;
        let (ca, cb, cg) = (p.alpha.cos(), p.beta.cos(), p.gamma.cos());
        let (sa, sb, sg) = (p.alpha.sin(), p.beta.sin(), p.gamma.sin());
        let vsq = p.a * p.a * p.b * p.b * p.c * p.c
            * (1.0 - ca * ca - cb * cb - cg * cg + 2.0 * ca * cb * cg);

        let s11 = p.b * p.b * p.c * p.c * sa * sa;
        let s22 = p.a * p.a * p.c * p.c * sb * sb;
        let s33 = p.a * p.a * p.b * p.b * sg * sg;
        let s12 = p.a * p.b * p.c * p.c * (ca * cb - cg);
        let s23 = p.a * p.a * p.b * p.c * (cb * cg - ca);
        let s13 = p.a * p.b * p.b * p.c * (cg * ca - cb);

        let (hf, kf, lf) = (h as f64, k as f64, l as f64);
        let brackets = s11 * hf * hf
            + s22 * kf * kf
            + s33 * lf * lf
            + 2.0 * s12 * hf * kf
            + 2.0 * s23 * kf * lf
            + 2.0 * s13 * hf * lf;
        Ok((brackets / vsq).sqrt() / 2.0)
    }
}

fn modulus(v: &Vector3<f64>) -> f64 {
    v.norm()
}

fn angle_between(u: &Vector3<f64>, v: &Vector3<f64>) -> f64 {
    (u.dot(v) / (u.norm() * v.norm())).clamp(-1.0, 1.0).acos()
}

fn params_from_axes(m: &Matrix3<f64>) -> CellParams {
    let a = m.column(0).into_owned();
    let b = m.column(1).into_owned();
    let c = m.column(2).into_owned();
    CellParams {
        a: modulus(&a),
        b: modulus(&b),
        c: modulus(&c),
        alpha: angle_between(&b, &c),
        beta: angle_between(&a, &c),
        gamma: angle_between(&a, &b),
    }
}

/// Crystallographic → Cartesian. +a lies along +x, b in the xy plane, and
/// the z component of c is positive.
fn crystallographic_to_cartesian(p: &CellParams) -> Result<Matrix3<f64>> {
    let (ca, cb, cg) = (p.alpha.cos(), p.beta.cos(), p.gamma.cos());
    let (sb, sg) = (p.beta.sin(), p.gamma.sin());

    let tmp = ca * ca + cb * cb + cg * cg - 2.0 * ca * cb * cg;
    if tmp >= 1.0 {
        return Err(EngineError::DegenerateCell(format!(
            "angles {:.3}/{:.3}/{:.3} rad do not close a cell",
            p.alpha, p.beta, p.gamma
        )));
    }
    let volume = p.a * p.b * p.c * (1.0 - tmp).sqrt();

    let cos_alpha_star = (cb * cg - ca) / (sb * sg);
    let cstar = (p.a * p.b * sg) / volume;

    let av = Vector3::new(p.a, 0.0, 0.0);
    let bv = Vector3::new(p.b * cg, p.b * sg, 0.0);
    let cv = Vector3::new(p.c * cb, -p.c * sb * cos_alpha_star, 1.0 / cstar);

    Ok(Matrix3::from_columns(&[av, bv, cv]))
}

/// Inverse-transpose of an axis matrix: direct ↔ reciprocal. Uses an
/// explicit LU decomposition and fails on singular input.
fn invert_axes(m: &Matrix3<f64>) -> Result<Matrix3<f64>> {
    let inv = m
        .lu()
        .try_inverse()
        .ok_or_else(|| EngineError::DegenerateCell("singular axis matrix".into()))?;
    Ok(inv.transpose())
}

/// Length/angle tolerances for cell comparison.
#[derive(Debug, Clone, Copy)]
pub struct CellTolerances {
    /// Relative length tolerance (fraction, applied to reciprocal moduli).
    pub length_frac: f64,
    /// Absolute angle tolerance in radians.
    pub angle_rad: f64,
}

impl Default for CellTolerances {
    fn default() -> Self {
        Self {
            length_frac: 0.05,
            angle_rad: 1.5_f64.to_radians(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BasisCandidate {
    vec: Vector3<f64>,
    n: [f64; 3],
    fom: f64,
}

fn same_combination(a: &BasisCandidate, b: &BasisCandidate) -> bool {
    a.n == b.n
}

/// Try to express `cell` in a basis matching `template` within the given
/// tolerances.
///
/// Searches integer (and reciprocal-integer) combinations of the candidate
/// cell's reciprocal axes for a triple whose moduli and mutual angles agree
/// with the template, and returns the best-scoring match, or `None` if no
/// combination fits.
pub fn match_cell(
    cell: &UnitCell,
    template: &UnitCell,
    tol: &CellTolerances,
) -> Result<Option<UnitCell>> {
    const MAX_CAND: usize = 1024;

    let trec = template.reciprocal()?;
    let lengths = [
        trec.column(0).norm(),
        trec.column(1).norm(),
        trec.column(2).norm(),
    ];
    let t_a = trec.column(0).into_owned();
    let t_b = trec.column(1).into_owned();
    let t_c = trec.column(2).into_owned();
    let angles = [
        angle_between(&t_b, &t_c),
        angle_between(&t_a, &t_c),
        angle_between(&t_a, &t_b),
    ];

    let crec = cell.reciprocal()?;
    let ast = crec.column(0).into_owned();
    let bst = crec.column(1).into_owned();
    let cst = crec.column(2).into_owned();

    let mut cand: [Vec<BasisCandidate>; 3] = [Vec::new(), Vec::new(), Vec::new()];

    // Negative loop values mean 1/n, positive mean n, zero means zero.
    for n1l in -2i32..=4 {
        for n2l in -2i32..=4 {
            for n3l in -2i32..=4 {
                let base = [
                    if n1l >= 0 { n1l as f64 } else { 1.0 / n1l as f64 },
                    if n2l >= 0 { n2l as f64 } else { 1.0 / n2l as f64 },
                    if n3l >= 0 { n3l as f64 } else { 1.0 / n3l as f64 },
                ];
                for b1 in [-1.0, 1.0] {
                    for b2 in [-1.0, 1.0] {
                        for b3 in [-1.0, 1.0] {
                            let n = [base[0] * b1, base[1] * b2, base[2] * b3];
                            let t = n[0] * ast + n[1] * bst + n[2] * cst;
                            let tlen = t.norm();

                            for i in 0..3 {
                                let lt = lengths[i] * tol.length_frac;
                                if (tlen - lengths[i]).abs() >= lt {
                                    continue;
                                }
                                if cand[i].len() < MAX_CAND {
                                    cand[i].push(BasisCandidate {
                                        vec: t,
                                        n,
                                        fom: (lengths[i] - tlen).abs(),
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    let mut best: Option<(f64, [Vector3<f64>; 3])> = None;

    for ci in &cand[0] {
        for cj in &cand[1] {
            if same_combination(ci, cj) {
                continue;
            }
            let ang = angle_between(&ci.vec, &cj.vec);
            if (ang - angles[2]).abs() > tol.angle_rad {
                continue;
            }
            let fom1 = (ang - angles[2]).abs();

            for ck in &cand[2] {
                if same_combination(cj, ck) || same_combination(ci, ck) {
                    continue;
                }
                let ang = angle_between(&ci.vec, &ck.vec);
                if (ang - angles[1]).abs() > tol.angle_rad {
                    continue;
                }
                let fom2 = fom1 + (ang - angles[1]).abs();

                let ang = angle_between(&cj.vec, &ck.vec);
                if (ang - angles[0]).abs() > tol.angle_rad {
                    continue;
                }
                let fom3 = fom2
                    + (ang - angles[0]).abs()
                    + LENGTH_WEIGHT * (ci.fom + cj.fom + ck.fom);

                if best.map_or(true, |(f, _)| fom3 < f) {
                    best = Some((fom3, [ci.vec, cj.vec, ck.vec]));
                }
            }
        }
    }

    Ok(best.map(|(_, axes)| {
        let mut matched = UnitCell::from_reciprocal(Matrix3::from_columns(&axes));
        matched.lattice_type = template.lattice_type;
        matched.centering = template.centering;
        matched.unique_axis = template.unique_axis;
        matched
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    fn cubic_10nm() -> UnitCell {
        UnitCell::from_parameters(10e-9, 10e-9, 10e-9, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2)
    }

    #[test]
    fn trivial_cell_cartesian_and_reciprocal() {
        let cell = cubic_10nm();
        let m = cell.cartesian().unwrap();
        assert_relative_eq!(m[(0, 0)], 1e-8, max_relative = 1e-12);
        assert_relative_eq!(m[(1, 0)], 0.0, epsilon = 1e-20);
        assert_relative_eq!(m[(2, 0)], 0.0, epsilon = 1e-20);
        assert_relative_eq!(m[(1, 1)], 1e-8, max_relative = 1e-12);
        assert_relative_eq!(m[(2, 2)], 1e-8, max_relative = 1e-12);

        let r = cell.reciprocal().unwrap();
        for i in 0..3 {
            assert_relative_eq!(r.column(i).norm(), 1e8, max_relative = 1e-9);
        }
    }

    #[test]
    fn round_trip_through_each_representation() {
        let p0 = CellParams {
            a: 2.81e-9,
            b: 3.42e-9,
            c: 5.17e-9,
            alpha: 83.2_f64.to_radians(),
            beta: 95.8_f64.to_radians(),
            gamma: 101.3_f64.to_radians(),
        };
        let cell = UnitCell::from_parameters(p0.a, p0.b, p0.c, p0.alpha, p0.beta, p0.gamma);

        let via_cart = UnitCell::from_cartesian(cell.cartesian().unwrap());
        let via_recip = UnitCell::from_reciprocal(cell.reciprocal().unwrap());

        for round in [via_cart, via_recip] {
            let p = round.parameters().unwrap();
            assert_relative_eq!(p.a, p0.a, max_relative = 1e-9);
            assert_relative_eq!(p.b, p0.b, max_relative = 1e-9);
            assert_relative_eq!(p.c, p0.c, max_relative = 1e-9);
            assert_relative_eq!(p.alpha, p0.alpha, max_relative = 1e-9);
            assert_relative_eq!(p.beta, p0.beta, max_relative = 1e-9);
            assert_relative_eq!(p.gamma, p0.gamma, max_relative = 1e-9);
        }
    }

    #[test]
    fn degenerate_cell_is_rejected() {
        let cell = UnitCell::from_parameters(1e-9, 1e-9, 1e-9, 0.0, FRAC_PI_2, FRAC_PI_2);
        assert!(matches!(
            cell.cartesian(),
            Err(EngineError::DegenerateCell(_))
        ));

        let flat = Matrix3::from_columns(&[
            Vector3::new(1e-9, 0.0, 0.0),
            Vector3::new(2e-9, 0.0, 0.0),
            Vector3::new(0.0, 1e-9, 0.0),
        ]);
        assert!(matches!(
            UnitCell::from_cartesian(flat).reciprocal(),
            Err(EngineError::DegenerateCell(_))
        ));
    }

    #[test]
    fn resolution_of_cubic_axis_reflection() {
        let cell = cubic_10nm();
        // 1/d for (1,0,0) of a 10 nm cubic cell is 1e8 m^-1.
        let one_over_d = 2.0 * cell.resolution(1, 0, 0).unwrap();
        assert_relative_eq!(one_over_d, 1e8, max_relative = 1e-9);
    }

    #[test]
    fn match_cell_recovers_rotated_cell() {
        let template = cubic_10nm();
        let angle = 0.4_f64;
        let rot = Matrix3::new(
            angle.cos(),
            -angle.sin(),
            0.0,
            angle.sin(),
            angle.cos(),
            0.0,
            0.0,
            0.0,
            1.0,
        );
        let rotated = template.rotated(&rot).unwrap();

        let matched = match_cell(&rotated, &template, &CellTolerances::default())
            .unwrap()
            .expect("a rotated copy must match its own template");
        let p = matched.parameters().unwrap();
        assert_relative_eq!(p.a, 10e-9, max_relative = 1e-6);
        assert_relative_eq!(p.alpha, FRAC_PI_2, max_relative = 1e-6);
    }

    #[test]
    fn match_cell_rejects_unrelated_cell() {
        let template = cubic_10nm();
        let other = UnitCell::from_parameters(
            3.1e-9,
            4.7e-9,
            6.3e-9,
            72.0_f64.to_radians(),
            81.0_f64.to_radians(),
            96.0_f64.to_radians(),
        );
        let matched = match_cell(&other, &template, &CellTolerances::default()).unwrap();
        assert!(matched.is_none());
    }
}
