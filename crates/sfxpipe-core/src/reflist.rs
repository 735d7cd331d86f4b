//! Reflection lists keyed by Miller indices.
//!
//! A [`RefList`] maps signed (h, k, l) triples to reflections with O(log n)
//! lookup and a deterministic iteration order. Each [`Reflection`] carries
//! its mutable payload behind its own mutex, so many writers can update
//! different reflections without serialising the whole list. Duplicate keys
//! are tolerated while observations are being gathered; a merging pass
//! collapses them before scaling.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{EngineError, Result};
use crate::symmetry::{Hkl, PointGroup};

/// Mutable per-reflection payload.
#[derive(Debug, Clone)]
pub struct ReflData {
    /// Predicted detector position, panel-relative subpixels.
    pub fs: f64,
    pub ss: f64,
    /// Index of the owning panel.
    pub panel: usize,
    /// Mean excitation error in m⁻¹.
    pub excitation_error: f64,
    /// Signed excitation-error extrema against the two limiting Ewald
    /// spheres, after clamping to the profile radius.
    pub r1: f64,
    pub r2: f64,
    /// Whether either extremum was clamped.
    pub clamp_low: bool,
    pub clamp_high: bool,
    /// Partiality in [0, 1].
    pub partiality: f64,
    /// Lorentz factor (1 at the untilted orientation).
    pub lorentz: f64,
    /// Measured intensity and its estimated standard deviation.
    pub intensity: f64,
    pub esd_intensity: f64,
    /// Background level under the peak (stream output).
    pub background: f64,
    /// How many observations were merged into this value.
    pub redundancy: usize,
    pub scalable: bool,
    pub refinable: bool,
    /// Set when a measured intensity came in negative.
    pub negative_intensity: bool,
    /// Scratch accumulators for merging passes.
    pub temp1: f64,
    pub temp2: f64,
    /// Symmetry companion: the indices this reflection had before
    /// asymmetric-unit mapping (or its canonical image, depending on
    /// which list it lives in).
    pub symmetric: Hkl,
}

impl Default for ReflData {
    fn default() -> Self {
        Self {
            fs: 0.0,
            ss: 0.0,
            panel: 0,
            excitation_error: 0.0,
            r1: 0.0,
            r2: 0.0,
            clamp_low: false,
            clamp_high: false,
            partiality: 0.0,
            lorentz: 1.0,
            intensity: 0.0,
            esd_intensity: 0.0,
            background: 0.0,
            redundancy: 0,
            scalable: false,
            refinable: false,
            negative_intensity: false,
            temp1: 0.0,
            temp2: 0.0,
            symmetric: (0, 0, 0),
        }
    }
}

/// A single reflection: immutable indices plus a locked payload.
#[derive(Debug)]
pub struct Reflection {
    hkl: Hkl,
    data: Mutex<ReflData>,
}

impl Reflection {
    pub fn new(hkl: Hkl) -> Self {
        Self {
            hkl,
            data: Mutex::new(ReflData::default()),
        }
    }

    pub fn indices(&self) -> Hkl {
        self.hkl
    }

    /// Take the per-reflection lock for an atomic read-modify-write.
    pub fn lock(&self) -> MutexGuard<'_, ReflData> {
        self.data.lock().expect("reflection lock poisoned")
    }

    /// Snapshot the payload.
    pub fn get(&self) -> ReflData {
        self.lock().clone()
    }

    /// Update the payload under the lock.
    pub fn update(&self, f: impl FnOnce(&mut ReflData)) {
        f(&mut self.lock());
    }
}

/// Ordered reflection container. Cloning is shallow: the clone shares the
/// reflections themselves.
#[derive(Debug, Default, Clone)]
pub struct RefList {
    map: BTreeMap<Hkl, Vec<Arc<Reflection>>>,
    len: usize,
}

impl RefList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live reflections, counting transient duplicates.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a reflection for (h, k, l); duplicates are allowed and kept
    /// until [`RefList::merge_duplicates`] runs.
    pub fn add(&mut self, hkl: Hkl) -> Arc<Reflection> {
        let refl = Arc::new(Reflection::new(hkl));
        self.map.entry(hkl).or_default().push(Arc::clone(&refl));
        self.len += 1;
        refl
    }

    /// Insert requiring uniqueness; fails if the key is already present.
    pub fn add_unique(&mut self, hkl: Hkl) -> Result<Arc<Reflection>> {
        if self.map.contains_key(&hkl) {
            return Err(EngineError::MalformedInput(format!(
                "duplicate reflection ({} {} {})",
                hkl.0, hkl.1, hkl.2
            )));
        }
        Ok(self.add(hkl))
    }

    /// First reflection stored under (h, k, l).
    pub fn find(&self, hkl: Hkl) -> Option<Arc<Reflection>> {
        self.map.get(&hkl).and_then(|v| v.first()).cloned()
    }

    /// All reflections stored under (h, k, l) (more than one only between
    /// concurrent insertion and the merge pass).
    pub fn find_all(&self, hkl: Hkl) -> &[Arc<Reflection>] {
        self.map.get(&hkl).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Remove every reflection under (h, k, l).
    pub fn remove(&mut self, hkl: Hkl) {
        if let Some(bucket) = self.map.remove(&hkl) {
            self.len -= bucket.len();
        }
    }

    /// Iterate in (h, k, l) order, visiting every live reflection exactly
    /// once. The cursor borrows the list for its lifetime.
    pub fn iter(&self) -> Cursor<'_> {
        Cursor {
            outer: self.map.values(),
            inner: [].iter(),
        }
    }

    /// Collapse duplicate keys by folding later payloads into the first
    /// with `combine`.
    pub fn merge_duplicates(&mut self, mut combine: impl FnMut(&mut ReflData, &ReflData)) {
        for bucket in self.map.values_mut() {
            if bucket.len() < 2 {
                continue;
            }
            let keep = Arc::clone(&bucket[0]);
            {
                let mut dst = keep.lock();
                for extra in &bucket[1..] {
                    let src = extra.get();
                    combine(&mut dst, &src);
                }
            }
            self.len -= bucket.len() - 1;
            bucket.truncate(1);
        }
    }

    /// Map every reflection to its asymmetric-unit key under `pg`,
    /// remembering the raw indices as the symmetry companion.
    pub fn asymmetric_indices(&self, pg: &PointGroup) -> RefList {
        let mut out = RefList::new();
        for refl in self.iter() {
            let raw = refl.indices();
            let canon = pg.asymmetric(raw);
            let new = out.add(canon);
            let mut data = refl.get();
            data.symmetric = raw;
            *new.lock() = data;
        }
        out
    }
}

/// Pull-style iteration cursor over a [`RefList`].
pub struct Cursor<'a> {
    outer: std::collections::btree_map::Values<'a, Hkl, Vec<Arc<Reflection>>>,
    inner: std::slice::Iter<'a, Arc<Reflection>>,
}

impl<'a> Iterator for Cursor<'a> {
    type Item = &'a Arc<Reflection>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(r) = self.inner.next() {
                return Some(r);
            }
            self.inner = self.outer.next()?.iter();
        }
    }
}

impl<'a> IntoIterator for &'a RefList {
    type Item = &'a Arc<Reflection>;
    type IntoIter = Cursor<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
