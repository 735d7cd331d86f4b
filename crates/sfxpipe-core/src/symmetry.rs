//! Point-group symmetry on Miller indices.
//!
//! A [`PointGroup`] is a closed set of integer 3×3 matrices acting on
//! (h, k, l). Groups are built from generator tables and closed under
//! multiplication at construction time. The asymmetric-unit representative
//! of an index triple is the lexicographically greatest member of its orbit,
//! which gives a total, group-independent canonical choice.

use crate::error::{EngineError, Result};

/// Signed Miller index triple.
pub type Hkl = (i32, i32, i32);

/// An integer symmetry operation acting on (h, k, l) column vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymOp(pub [[i32; 3]; 3]);

impl SymOp {
    pub const IDENTITY: SymOp = SymOp([[1, 0, 0], [0, 1, 0], [0, 0, 1]]);
    pub const INVERSION: SymOp = SymOp([[-1, 0, 0], [0, -1, 0], [0, 0, -1]]);

    pub fn apply(&self, hkl: Hkl) -> Hkl {
        let (h, k, l) = hkl;
        let m = &self.0;
        (
            m[0][0] * h + m[0][1] * k + m[0][2] * l,
            m[1][0] * h + m[1][1] * k + m[1][2] * l,
            m[2][0] * h + m[2][1] * k + m[2][2] * l,
        )
    }

    fn compose(&self, other: &SymOp) -> SymOp {
        let mut out = [[0i32; 3]; 3];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (0..3).map(|t| self.0[i][t] * other.0[t][j]).sum();
            }
        }
        SymOp(out)
    }
}

// Rotation generators, written for the conventional axis settings.
const TWOFOLD_X: SymOp = SymOp([[1, 0, 0], [0, -1, 0], [0, 0, -1]]);
const TWOFOLD_Y: SymOp = SymOp([[-1, 0, 0], [0, 1, 0], [0, 0, -1]]);
const TWOFOLD_Z: SymOp = SymOp([[-1, 0, 0], [0, -1, 0], [0, 0, 1]]);
const FOURFOLD_Z: SymOp = SymOp([[0, -1, 0], [1, 0, 0], [0, 0, 1]]);
const THREEFOLD_HEX: SymOp = SymOp([[0, 1, 0], [-1, -1, 0], [0, 0, 1]]);
const SIXFOLD_HEX: SymOp = SymOp([[1, 1, 0], [-1, 0, 0], [0, 0, 1]]);
const TWOFOLD_HEX_A: SymOp = SymOp([[0, 1, 0], [1, 0, 0], [0, 0, -1]]);
const THREEFOLD_CUBIC: SymOp = SymOp([[0, 0, 1], [1, 0, 0], [0, 1, 0]]);

/// A point group: its Hermann–Mauguin symbol and the closed operation set.
#[derive(Debug, Clone)]
pub struct PointGroup {
    symbol: String,
    ops: Vec<SymOp>,
}

impl PointGroup {
    /// Parse a Hermann–Mauguin symbol.
    ///
    /// Supported: 1, -1, 2, 2/m, 222, mmm, 4, 4/m, 422, 4/mmm, 3, 6, 6/m,
    /// 622, 6/mmm, 23, m-3, 432, m-3m.
    pub fn parse(symbol: &str) -> Result<Self> {
        let (generators, with_inversion): (&[SymOp], bool) = match symbol {
            "1" => (&[], false),
            "-1" => (&[], true),
            "2" => (&[TWOFOLD_Y], false),
            "2/m" => (&[TWOFOLD_Y], true),
            "222" => (&[TWOFOLD_X, TWOFOLD_Y, TWOFOLD_Z], false),
            "mmm" => (&[TWOFOLD_X, TWOFOLD_Y, TWOFOLD_Z], true),
            "4" => (&[FOURFOLD_Z], false),
            "4/m" => (&[FOURFOLD_Z], true),
            "422" => (&[FOURFOLD_Z, TWOFOLD_X], false),
            "4/mmm" => (&[FOURFOLD_Z, TWOFOLD_X], true),
            "3" => (&[THREEFOLD_HEX], false),
            "6" => (&[SIXFOLD_HEX], false),
            "6/m" => (&[SIXFOLD_HEX], true),
            "622" => (&[SIXFOLD_HEX, TWOFOLD_HEX_A], false),
            "6/mmm" => (&[SIXFOLD_HEX, TWOFOLD_HEX_A], true),
            "23" => (&[THREEFOLD_CUBIC, TWOFOLD_Z], false),
            "m-3" => (&[THREEFOLD_CUBIC, TWOFOLD_Z], true),
            "432" => (&[THREEFOLD_CUBIC, FOURFOLD_Z], false),
            "m-3m" => (&[THREEFOLD_CUBIC, FOURFOLD_Z], true),
            other => {
                return Err(EngineError::MalformedInput(format!(
                    "unknown point group '{other}'"
                )))
            }
        };

        let mut seeds = vec![SymOp::IDENTITY];
        seeds.extend_from_slice(generators);
        if with_inversion {
            seeds.push(SymOp::INVERSION);
        }

        Ok(Self {
            symbol: symbol.to_string(),
            ops: close_under_multiplication(seeds),
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Number of operations in the group.
    pub fn order(&self) -> usize {
        self.ops.len()
    }

    pub fn operations(&self) -> &[SymOp] {
        &self.ops
    }

    /// The canonical asymmetric-unit representative of `hkl`: the greatest
    /// orbit member in lexicographic (h, k, l) order.
    pub fn asymmetric(&self, hkl: Hkl) -> Hkl {
        self.ops
            .iter()
            .map(|op| op.apply(hkl))
            .max()
            .unwrap_or(hkl)
    }

    /// Whether two index triples are symmetry-equivalent under this group.
    pub fn equivalent(&self, a: Hkl, b: Hkl) -> bool {
        self.asymmetric(a) == self.asymmetric(b)
    }
}

fn close_under_multiplication(seeds: Vec<SymOp>) -> Vec<SymOp> {
    let mut ops = seeds;
    loop {
        let mut added = false;
        let snapshot = ops.clone();
        for a in &snapshot {
            for b in &snapshot {
                let c = a.compose(b);
                if !ops.contains(&c) {
                    ops.push(c);
                    added = true;
                }
            }
        }
        if !added {
            return ops;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_orders_are_correct() {
        for (symbol, order) in [
            ("1", 1),
            ("-1", 2),
            ("2/m", 4),
            ("222", 4),
            ("mmm", 8),
            ("4/mmm", 16),
            ("6/mmm", 24),
            ("23", 12),
            ("m-3", 24),
            ("432", 24),
            ("m-3m", 48),
        ] {
            let pg = PointGroup::parse(symbol).unwrap();
            assert_eq!(pg.order(), order, "wrong order for {symbol}");
        }
    }

    #[test]
    fn asymmetric_representative_is_orbit_invariant() {
        let pg = PointGroup::parse("4/mmm").unwrap();
        let hkl = (1, -3, 2);
        let canon = pg.asymmetric(hkl);
        for op in pg.operations() {
            assert_eq!(pg.asymmetric(op.apply(hkl)), canon);
        }
    }

    #[test]
    fn friedel_pairs_merge_under_inversion() {
        let pg = PointGroup::parse("-1").unwrap();
        assert!(pg.equivalent((1, 2, 3), (-1, -2, -3)));
        assert_eq!(pg.asymmetric((-1, -2, -3)), (1, 2, 3));

        let p1 = PointGroup::parse("1").unwrap();
        assert!(!p1.equivalent((1, 2, 3), (-1, -2, -3)));
    }

    #[test]
    fn unknown_symbol_is_rejected() {
        assert!(PointGroup::parse("5").is_err());
    }

    #[test]
    fn hexagonal_sixfold_cycles_axes() {
        let pg = PointGroup::parse("6").unwrap();
        assert_eq!(pg.order(), 6);
        assert!(pg.equivalent((1, 0, 2), (0, 1, 2)));
        assert!(pg.equivalent((1, 0, 2), (-1, 0, 2)));
    }
}
