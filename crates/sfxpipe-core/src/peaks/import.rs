//! Externally supplied peaks and frames.
//!
//! Peak lists can arrive alongside the image file (already found by an
//! upstream hit finder) or over the wire as MessagePack maps in the online
//! -analysis schema: key `"peak_list"` holding three parallel arrays
//! (fast-scan positions, slow-scan positions, intensities), or key
//! `"corr_data"` holding a corrected full-detector raster as a binary
//! little-endian f64 blob plus its `[height, width]` shape.
//!
//! Positions in imported lists are global detector addresses. Software
//! that writes pixel *indices* rather than pixel-centre distances is
//! accommodated by an optional half-pixel shift.

use rmpv::Value;

use crate::error::{EngineError, Result};
use crate::geometry::Detector;
use crate::image::{PanelData, Peak};

/// Convert global-address (fs, ss, intensity) triples to panel-relative
/// peaks. Triples outside every panel, or on `no_index` panels, are
/// skipped. `half_pixel_shift` adds 0.5 to both coordinates to convert
/// pixel indices to pixel-centre distances.
pub fn peaks_from_list(
    triples: &[(f64, f64, f64)],
    detector: &Detector,
    half_pixel_shift: bool,
) -> Vec<Peak> {
    let offset = if half_pixel_shift { 0.5 } else { 0.0 };
    let mut peaks = Vec::with_capacity(triples.len());
    let mut n_outside = 0usize;

    for &(fs, ss, intensity) in triples {
        let fs = fs + offset;
        let ss = ss + offset;
        let Some(pi) = detector.find_panel(fs.floor().max(0.0) as usize, ss.floor().max(0.0) as usize)
        else {
            n_outside += 1;
            continue;
        };
        let panel = &detector.panels[pi];
        if panel.no_index {
            continue;
        }
        peaks.push(Peak {
            fs: fs - panel.min_fs as f64,
            ss: ss - panel.min_ss as f64,
            panel: pi,
            intensity,
        });
    }

    if n_outside > 0 {
        tracing::debug!(n_outside, "imported peaks outside every panel skipped");
    }
    peaks
}

/// Find `key` in a MessagePack map, warning when the key appears more than
/// once; the last occurrence wins.
fn map_lookup<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    let mut found = None;
    let mut n_seen = 0usize;
    for (k, v) in map {
        if k.as_str() == Some(key) {
            found = Some(v);
            n_seen += 1;
        }
    }
    if n_seen > 1 {
        tracing::warn!(key, n_seen, "malformed input: duplicated map key, using the last");
    }
    found
}

fn value_as_f64(v: &Value) -> Result<f64> {
    v.as_f64()
        .ok_or_else(|| EngineError::MalformedInput(format!("expected a number, got {v}")))
}

/// Parse an online-analysis MessagePack frame into a peak list.
pub fn peaks_from_msgpack(
    bytes: &[u8],
    detector: &Detector,
    half_pixel_shift: bool,
) -> Result<Vec<Peak>> {
    let value = rmpv::decode::read_value(&mut &bytes[..])
        .map_err(|e| EngineError::MalformedInput(format!("undecodable MessagePack: {e}")))?;
    let map = value
        .as_map()
        .ok_or_else(|| EngineError::MalformedInput("top-level MessagePack is not a map".into()))?;

    let peak_list = map_lookup(map, "peak_list")
        .ok_or_else(|| EngineError::MalformedInput("no 'peak_list' key".into()))?;
    let arrays = peak_list
        .as_array()
        .ok_or_else(|| EngineError::MalformedInput("'peak_list' is not an array".into()))?;
    if arrays.len() < 3 {
        return Err(EngineError::MalformedInput(
            "'peak_list' needs three parallel arrays".into(),
        ));
    }
    let fs_list = arrays[0]
        .as_array()
        .ok_or_else(|| EngineError::MalformedInput("peak fs list is not an array".into()))?;
    let ss_list = arrays[1]
        .as_array()
        .ok_or_else(|| EngineError::MalformedInput("peak ss list is not an array".into()))?;
    let i_list = arrays[2]
        .as_array()
        .ok_or_else(|| EngineError::MalformedInput("peak intensity list is not an array".into()))?;
    if fs_list.len() != ss_list.len() || fs_list.len() != i_list.len() {
        return Err(EngineError::MalformedInput(format!(
            "peak arrays have mismatched lengths {}/{}/{}",
            fs_list.len(),
            ss_list.len(),
            i_list.len()
        )));
    }

    let mut triples = Vec::with_capacity(fs_list.len());
    for i in 0..fs_list.len() {
        triples.push((
            value_as_f64(&fs_list[i])?,
            value_as_f64(&ss_list[i])?,
            value_as_f64(&i_list[i])?,
        ));
    }
    Ok(peaks_from_list(&triples, detector, half_pixel_shift))
}

/// Parse an online-analysis `corr_data` frame into per-panel rasters.
///
/// The blob is a row-major little-endian f64 raster covering the full
/// detector address space; each panel cuts its own rectangle out of it.
pub fn panel_data_from_msgpack(bytes: &[u8], detector: &Detector) -> Result<Vec<PanelData>> {
    let value = rmpv::decode::read_value(&mut &bytes[..])
        .map_err(|e| EngineError::MalformedInput(format!("undecodable MessagePack: {e}")))?;
    let map = value
        .as_map()
        .ok_or_else(|| EngineError::MalformedInput("top-level MessagePack is not a map".into()))?;

    let corr = map_lookup(map, "corr_data")
        .ok_or_else(|| EngineError::MalformedInput("no 'corr_data' key".into()))?;
    let corr_map = corr
        .as_map()
        .ok_or_else(|| EngineError::MalformedInput("'corr_data' is not a map".into()))?;

    let data = match map_lookup(corr_map, "data") {
        Some(Value::Binary(b)) => b.as_slice(),
        _ => {
            return Err(EngineError::MalformedInput(
                "'corr_data'/'data' missing or not binary".into(),
            ))
        }
    };
    let shape = map_lookup(corr_map, "shape")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::MalformedInput("'corr_data'/'shape' missing".into()))?;
    if shape.len() != 2 {
        return Err(EngineError::MalformedInput(
            "'corr_data'/'shape' must be [height, width]".into(),
        ));
    }
    let height = value_as_f64(&shape[0])? as usize;
    let width = value_as_f64(&shape[1])? as usize;
    if data.len() != height * width * 8 {
        return Err(EngineError::MalformedInput(format!(
            "'corr_data' blob is {} bytes for shape {height}x{width}",
            data.len()
        )));
    }

    let raster_at = |fs: usize, ss: usize| -> f64 {
        let idx = (ss * width + fs) * 8;
        f64::from_le_bytes(data[idx..idx + 8].try_into().unwrap())
    };

    let mut panels = Vec::with_capacity(detector.panels.len());
    for p in &detector.panels {
        if p.max_fs >= width || p.max_ss >= height {
            return Err(EngineError::MalformedInput(format!(
                "panel '{}' exceeds the provided {height}x{width} raster",
                p.name
            )));
        }
        let mut pd = PanelData::new(p.width(), p.height());
        for ss in 0..pd.h {
            for fs in 0..pd.w {
                let global_fs = p.min_fs + fs;
                let global_ss = p.min_ss + ss;
                pd.set(fs, ss, raster_at(global_fs, global_ss) as f32);
                if p.no_index || detector.in_bad_region(global_fs, global_ss) {
                    let i = pd.idx(fs, ss);
                    pd.bad[i] = true;
                }
            }
        }
        panels.push(pd);
    }
    Ok(panels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Detector;
    use approx::assert_relative_eq;

    fn encode(value: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        rmpv::encode::write_value(&mut out, value).unwrap();
        out
    }

    fn peak_list_value(fs: &[f64], ss: &[f64], i: &[f64]) -> Value {
        Value::Array(vec![
            Value::Array(fs.iter().map(|&v| Value::F64(v)).collect()),
            Value::Array(ss.iter().map(|&v| Value::F64(v)).collect()),
            Value::Array(i.iter().map(|&v| Value::F64(v)).collect()),
        ])
    }

    #[test]
    fn peak_list_is_decoded_with_half_pixel_shift() {
        let det = Detector::simple(256, 256, 10000.0, 0.1);
        let msg = Value::Map(vec![
            (
                Value::String("peak_list".into()),
                peak_list_value(&[10.0, 200.0], &[20.0, 100.0], &[1000.0, 2000.0]),
            ),
            (Value::String("other".into()), Value::F64(1.0)),
        ]);
        let peaks = peaks_from_msgpack(&encode(&msg), &det, true).unwrap();
        assert_eq!(peaks.len(), 2);
        assert_relative_eq!(peaks[0].fs, 10.5);
        assert_relative_eq!(peaks[0].ss, 20.5);
        assert_relative_eq!(peaks[1].intensity, 2000.0);

        let unshifted = peaks_from_msgpack(&encode(&msg), &det, false).unwrap();
        assert_relative_eq!(unshifted[0].fs, 10.0);
    }

    #[test]
    fn duplicate_keys_use_the_last_occurrence() {
        let det = Detector::simple(256, 256, 10000.0, 0.1);
        let msg = Value::Map(vec![
            (
                Value::String("peak_list".into()),
                peak_list_value(&[1.0], &[1.0], &[5.0]),
            ),
            (
                Value::String("peak_list".into()),
                peak_list_value(&[40.0, 50.0], &[40.0, 50.0], &[7.0, 8.0]),
            ),
        ]);
        let peaks = peaks_from_msgpack(&encode(&msg), &det, false).unwrap();
        assert_eq!(peaks.len(), 2);
        assert_relative_eq!(peaks[0].intensity, 7.0);
    }

    #[test]
    fn corr_data_raster_is_split_into_panels() {
        let det = Detector::simple(8, 8, 10000.0, 0.1);
        let mut blob = Vec::new();
        for ss in 0..8usize {
            for fs in 0..8usize {
                blob.extend_from_slice(&((ss * 8 + fs) as f64).to_le_bytes());
            }
        }
        let msg = Value::Map(vec![(
            Value::String("corr_data".into()),
            Value::Map(vec![
                (Value::String("data".into()), Value::Binary(blob)),
                (
                    Value::String("shape".into()),
                    Value::Array(vec![Value::F64(8.0), Value::F64(8.0)]),
                ),
            ]),
        )]);
        let panels = panel_data_from_msgpack(&encode(&msg), &det).unwrap();
        assert_eq!(panels.len(), 1);
        assert_relative_eq!(panels[0].get(3, 2), 19.0);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let det = Detector::simple(8, 8, 10000.0, 0.1);
        let msg = Value::Map(vec![(
            Value::String("corr_data".into()),
            Value::Map(vec![
                (Value::String("data".into()), Value::Binary(vec![0u8; 16])),
                (
                    Value::String("shape".into()),
                    Value::Array(vec![Value::F64(8.0), Value::F64(8.0)]),
                ),
            ]),
        )]);
        assert!(matches!(
            panel_data_from_msgpack(&encode(&msg), &det),
            Err(EngineError::MalformedInput(_))
        ));
    }

    #[test]
    fn no_index_panels_drop_imported_peaks() {
        let mut det = Detector::simple(64, 64, 10000.0, 0.1);
        det.panels[0].no_index = true;
        let peaks = peaks_from_list(&[(10.0, 10.0, 1.0)], &det, false);
        assert!(peaks.is_empty());
    }
}
