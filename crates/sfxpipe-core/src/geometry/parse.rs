//! Plain-text geometry description parser.
//!
//! The format is `key = value`, with panel-scoped keys written as
//! `<panel>/<key>`. Unknown keys are reported and skipped so that newer
//! descriptions stay loadable.
//!
//! ```text
//! clen = 0.080
//! photon_energy = 8000.0
//! adu_per_eV = 0.00338
//! mask_good = 0x27
//! mask_bad = 0x00
//!
//! q0/min_fs = 0
//! q0/max_fs = 1023
//! q0/min_ss = 0
//! q0/max_ss = 1023
//! q0/corner_x = -512.0
//! q0/corner_y = -512.0
//! q0/fs = +1.0x +0.0y
//! q0/ss = +0.0x +1.0y
//! q0/res = 13333.3
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{EngineError, Result};
use crate::geometry::{BadRegion, Detector, Panel, ValueOrRef};

/// Detector-wide beam defaults carried by a geometry file.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamDefaults {
    /// Nominal photon energy in eV, or the header field holding it.
    pub photon_energy: ValueOrRef,
    /// Detector gain in ADU per eV.
    pub adu_per_ev: Option<f64>,
    /// Default camera length applied to panels without their own `clen`.
    pub clen: Option<ValueOrRef>,
}

impl Default for BeamDefaults {
    fn default() -> Self {
        Self {
            photon_energy: ValueOrRef::Value(0.0),
            adu_per_ev: None,
            clen: None,
        }
    }
}

#[derive(Default)]
struct PanelBuilder {
    min_fs: Option<usize>,
    max_fs: Option<usize>,
    min_ss: Option<usize>,
    max_ss: Option<usize>,
    cnx: Option<f64>,
    cny: Option<f64>,
    fs: Option<(f64, f64)>,
    ss: Option<(f64, f64)>,
    res: Option<f64>,
    clen: Option<ValueOrRef>,
    no_index: bool,
}

/// Parse a direction like `+1.0x -0.002y` into (x, y) components.
fn parse_direction(value: &str) -> Result<(f64, f64)> {
    let mut x = 0.0;
    let mut y = 0.0;
    for token in value.split_whitespace() {
        let (coeff, axis) = token.split_at(token.len() - 1);
        let magnitude: f64 = match coeff {
            "" | "+" => 1.0,
            "-" => -1.0,
            s => s
                .parse()
                .map_err(|_| EngineError::MalformedInput(format!("bad direction '{value}'")))?,
        };
        match axis {
            "x" => x = magnitude,
            "y" => y = magnitude,
            _ => {
                return Err(EngineError::MalformedInput(format!(
                    "direction component '{token}' must end in x or y"
                )))
            }
        }
    }
    if x == 0.0 && y == 0.0 {
        return Err(EngineError::MalformedInput(format!(
            "direction '{value}' is zero"
        )));
    }
    Ok((x, y))
}

fn parse_value_or_ref(value: &str) -> ValueOrRef {
    match value.parse::<f64>() {
        Ok(v) => ValueOrRef::Value(v),
        Err(_) => ValueOrRef::HeaderRef(value.to_string()),
    }
}

fn parse_mask_bits(value: &str) -> Result<u32> {
    let parsed = if let Some(hex) = value.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)
    } else {
        value.parse()
    };
    parsed.map_err(|_| EngineError::MalformedInput(format!("bad mask value '{value}'")))
}

/// Parse a geometry description from text.
///
/// Returns the detector and the beam defaults found alongside it.
pub fn geometry_from_str(text: &str) -> Result<(Detector, BeamDefaults)> {
    let mut defaults = BeamDefaults::default();
    let mut builders: BTreeMap<String, PanelBuilder> = BTreeMap::new();
    let mut bad_builders: BTreeMap<String, PanelBuilder> = BTreeMap::new();
    let mut mask_good = 0u32;
    let mut mask_bad = 0u32;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            tracing::warn!(line = lineno + 1, "geometry line without '=' skipped");
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        if let Some((scope, field)) = key.split_once('/') {
            let target = if scope.starts_with("bad") {
                bad_builders.entry(scope.to_string()).or_default()
            } else {
                builders.entry(scope.to_string()).or_default()
            };
            match field {
                "min_fs" => target.min_fs = Some(parse_usize(value, key)?),
                "max_fs" => target.max_fs = Some(parse_usize(value, key)?),
                "min_ss" => target.min_ss = Some(parse_usize(value, key)?),
                "max_ss" => target.max_ss = Some(parse_usize(value, key)?),
                "corner_x" => target.cnx = Some(parse_f64(value, key)?),
                "corner_y" => target.cny = Some(parse_f64(value, key)?),
                "fs" => target.fs = Some(parse_direction(value)?),
                "ss" => target.ss = Some(parse_direction(value)?),
                "res" => target.res = Some(parse_f64(value, key)?),
                "clen" => target.clen = Some(parse_value_or_ref(value)),
                "no_index" => target.no_index = value != "0",
                other => {
                    tracing::warn!(key = other, panel = scope, "unknown panel key ignored");
                }
            }
        } else {
            match key {
                "clen" => defaults.clen = Some(parse_value_or_ref(value)),
                "photon_energy" => defaults.photon_energy = parse_value_or_ref(value),
                "adu_per_eV" => defaults.adu_per_ev = Some(parse_f64(value, key)?),
                "mask_good" => mask_good = parse_mask_bits(value)?,
                "mask_bad" => mask_bad = parse_mask_bits(value)?,
                other => {
                    tracing::warn!(key = other, "unknown geometry key ignored");
                }
            }
        }
    }

    let mut panels = Vec::new();
    for (name, b) in builders {
        let clen = match b.clen.or_else(|| defaults.clen.clone()) {
            Some(c) => c,
            None => {
                return Err(EngineError::MalformedInput(format!(
                    "panel '{name}' has no camera length"
                )))
            }
        };
        let clen_value = match &clen {
            ValueOrRef::Value(v) => *v,
            ValueOrRef::HeaderRef(_) => 0.0,
        };
        let panel = Panel {
            name: name.clone(),
            min_fs: required(b.min_fs, &name, "min_fs")?,
            max_fs: required(b.max_fs, &name, "max_fs")?,
            min_ss: required(b.min_ss, &name, "min_ss")?,
            max_ss: required(b.max_ss, &name, "max_ss")?,
            cnx: required(b.cnx, &name, "corner_x")?,
            cny: required(b.cny, &name, "corner_y")?,
            fsx: b.fs.map(|v| v.0).unwrap_or(1.0),
            fsy: b.fs.map(|v| v.1).unwrap_or(0.0),
            ssx: b.ss.map(|v| v.0).unwrap_or(0.0),
            ssy: b.ss.map(|v| v.1).unwrap_or(1.0),
            res: required(b.res, &name, "res")?,
            clen,
            clen_value,
            no_index: b.no_index,
        };
        if panel.max_fs < panel.min_fs || panel.max_ss < panel.min_ss {
            return Err(EngineError::MalformedInput(format!(
                "panel '{name}' has an empty address rectangle"
            )));
        }
        panels.push(panel);
    }

    if panels.is_empty() {
        return Err(EngineError::MalformedInput(
            "geometry describes no panels".into(),
        ));
    }

    let mut bad_regions = Vec::new();
    for (name, b) in bad_builders {
        bad_regions.push(BadRegion {
            min_fs: required(b.min_fs, &name, "min_fs")?,
            max_fs: required(b.max_fs, &name, "max_fs")?,
            min_ss: required(b.min_ss, &name, "min_ss")?,
            max_ss: required(b.max_ss, &name, "max_ss")?,
        });
    }

    let det = Detector {
        panels,
        mask_good,
        mask_bad,
        bad_regions,
    };
    det.check_panel_overlap()?;
    Ok((det, defaults))
}

/// Load a geometry file, returning the detector, beam defaults and the
/// verbatim file contents (the stream prologue carries the original text).
pub fn load_geometry(path: &Path) -> Result<(Detector, BeamDefaults, String)> {
    let text = fs::read_to_string(path)?;
    let (det, defaults) = geometry_from_str(&text)?;
    Ok((det, defaults, text))
}

fn parse_usize(value: &str, key: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|_| EngineError::MalformedInput(format!("bad integer for '{key}': '{value}'")))
}

fn parse_f64(value: &str, key: &str) -> Result<f64> {
    value
        .parse()
        .map_err(|_| EngineError::MalformedInput(format!("bad number for '{key}': '{value}'")))
}

fn required<T>(v: Option<T>, panel: &str, key: &str) -> Result<T> {
    v.ok_or_else(|| EngineError::MalformedInput(format!("panel '{panel}' is missing '{key}'")))
}
