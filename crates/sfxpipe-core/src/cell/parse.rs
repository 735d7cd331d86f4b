//! Cell file input and output.
//!
//! Two formats are accepted: a plain `key = value` cell file with keys
//! `a`, `b`, `c`, `al`, `be`, `ga`, `lattice_type`, `centering` and
//! `unique_axis` (lengths in nm or Å, angles in degrees or radians), and a
//! PDB file from which the `CRYST1` record is taken.

use std::fs;
use std::path::Path;

use crate::cell::{CellParams, LatticeType, UnitCell};
use crate::error::{EngineError, Result};

const CELL_FILE_BANNER: &str = "sfxpipe unit cell file version 1.0";

fn parse_length(value: &str) -> Result<f64> {
    let mut parts = value.split_whitespace();
    let num: f64 = parts
        .next()
        .ok_or_else(|| EngineError::MalformedInput("empty length value".into()))?
        .parse()
        .map_err(|_| EngineError::MalformedInput(format!("bad length '{value}'")))?;
    match parts.next() {
        Some("nm") | None => Ok(num * 1e-9),
        Some("A") => Ok(num * 1e-10),
        Some(unit) => Err(EngineError::MalformedInput(format!(
            "unknown length unit '{unit}'"
        ))),
    }
}

fn parse_angle(value: &str) -> Result<f64> {
    let mut parts = value.split_whitespace();
    let num: f64 = parts
        .next()
        .ok_or_else(|| EngineError::MalformedInput("empty angle value".into()))?
        .parse()
        .map_err(|_| EngineError::MalformedInput(format!("bad angle '{value}'")))?;
    match parts.next() {
        Some("deg") | None => Ok(num.to_radians()),
        Some("rad") => Ok(num),
        Some(unit) => Err(EngineError::MalformedInput(format!(
            "unknown angle unit '{unit}'"
        ))),
    }
}

/// Parse a cell from the text of a cell file.
pub fn cell_from_str(text: &str) -> Result<UnitCell> {
    let mut a = None;
    let mut b = None;
    let mut c = None;
    let mut al = None;
    let mut be = None;
    let mut ga = None;
    let mut lattice_type = LatticeType::default();
    let mut centering = 'P';
    let mut unique_axis = '*';

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.contains("cell file version") {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "a" => a = Some(parse_length(value)?),
            "b" => b = Some(parse_length(value)?),
            "c" => c = Some(parse_length(value)?),
            "al" => al = Some(parse_angle(value)?),
            "be" => be = Some(parse_angle(value)?),
            "ga" => ga = Some(parse_angle(value)?),
            "lattice_type" => {
                lattice_type = LatticeType::from_str_opt(value).ok_or_else(|| {
                    EngineError::MalformedInput(format!("unknown lattice type '{value}'"))
                })?;
            }
            "centering" => {
                centering = value.chars().next().unwrap_or('P');
            }
            "unique_axis" => {
                unique_axis = value.chars().next().unwrap_or('*');
            }
            other => {
                tracing::warn!(key = other, "ignoring unknown cell file key");
            }
        }
    }

    let (a, b, c, al, be, ga) = match (a, b, c, al, be, ga) {
        (Some(a), Some(b), Some(c), Some(al), Some(be), Some(ga)) => (a, b, c, al, be, ga),
        _ => {
            return Err(EngineError::MalformedInput(
                "cell file is missing one of a, b, c, al, be, ga".into(),
            ))
        }
    };

    let mut cell = UnitCell::from_parameters(a, b, c, al, be, ga);
    cell.lattice_type = lattice_type;
    cell.centering = centering;
    cell.unique_axis = unique_axis;
    Ok(cell)
}

/// Parse a cell from the first `CRYST1` record of a PDB file.
pub fn cell_from_pdb_str(text: &str) -> Result<UnitCell> {
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("CRYST1") {
            let fields: Vec<&str> = rest.split_whitespace().take(6).collect();
            if fields.len() != 6 {
                return Err(EngineError::MalformedInput(
                    "CRYST1 record has fewer than six numeric fields".into(),
                ));
            }
            let mut vals = [0.0f64; 6];
            for (slot, field) in vals.iter_mut().zip(&fields) {
                *slot = field.parse().map_err(|_| {
                    EngineError::MalformedInput(format!("bad CRYST1 field '{field}'"))
                })?;
            }
            return Ok(UnitCell::from_parameters(
                vals[0] * 1e-10,
                vals[1] * 1e-10,
                vals[2] * 1e-10,
                vals[3].to_radians(),
                vals[4].to_radians(),
                vals[5].to_radians(),
            ));
        }
    }
    Err(EngineError::MalformedInput("no CRYST1 record found".into()))
}

/// Load a cell from a file, dispatching on content: PDB if a `CRYST1`
/// record is present, cell-file syntax otherwise.
pub fn load_cell(path: &Path) -> Result<UnitCell> {
    let text = fs::read_to_string(path)?;
    if text.lines().any(|l| l.starts_with("CRYST1")) {
        cell_from_pdb_str(&text)
    } else {
        cell_from_str(&text)
    }
}

/// Render a cell in cell-file syntax. Reading the output reproduces the six
/// parameters.
pub fn cell_to_string(cell: &UnitCell) -> Result<String> {
    let p: CellParams = cell.parameters()?;
    let mut out = String::new();
    out.push_str(CELL_FILE_BANNER);
    out.push_str("\n\n");
    out.push_str(&format!("lattice_type = {}\n", cell.lattice_type.as_str()));
    out.push_str(&format!("centering = {}\n", cell.centering));
    if cell.unique_axis != '*' {
        out.push_str(&format!("unique_axis = {}\n", cell.unique_axis));
    }
    out.push_str(&format!("a = {:.7} nm\n", p.a * 1e9));
    out.push_str(&format!("b = {:.7} nm\n", p.b * 1e9));
    out.push_str(&format!("c = {:.7} nm\n", p.c * 1e9));
    out.push_str(&format!("al = {:.7} deg\n", p.alpha.to_degrees()));
    out.push_str(&format!("be = {:.7} deg\n", p.beta.to_degrees()));
    out.push_str(&format!("ga = {:.7} deg\n", p.gamma.to_degrees()));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn cell_file_round_trip() {
        let text = "lattice_type = tetragonal\n\
                    centering = I\n\
                    unique_axis = c\n\
                    a = 7.92 nm\n\
                    b = 7.92 nm\n\
                    c = 3.81 nm\n\
                    al = 90.0 deg\n\
                    be = 90.0 deg\n\
                    ga = 90.0 deg\n";
        let cell = cell_from_str(text).unwrap();
        let back = cell_from_str(&cell_to_string(&cell).unwrap()).unwrap();

        let p0 = cell.parameters().unwrap();
        let p1 = back.parameters().unwrap();
        assert_relative_eq!(p0.a, p1.a, max_relative = 1e-6);
        assert_relative_eq!(p0.c, p1.c, max_relative = 1e-6);
        assert_relative_eq!(p0.gamma, p1.gamma, max_relative = 1e-6);
        assert_eq!(back.centering, 'I');
        assert_eq!(back.unique_axis, 'c');
        assert_eq!(back.lattice_type, LatticeType::Tetragonal);
    }

    #[test]
    fn angstrom_lengths_are_accepted() {
        let text = "a = 79.2 A\nb = 79.2 A\nc = 38.1 A\nal = 90 deg\nbe = 90 deg\nga = 90 deg\n";
        let cell = cell_from_str(text).unwrap();
        let p = cell.parameters().unwrap();
        assert_relative_eq!(p.a, 7.92e-9, max_relative = 1e-9);
    }

    #[test]
    fn pdb_cryst1_record_is_parsed() {
        let text = "HEADER    TEST\n\
                    CRYST1   79.200   79.200   38.100  90.00  90.00  90.00 P 43 21 2\n\
                    END\n";
        let cell = cell_from_pdb_str(text).unwrap();
        let p = cell.parameters().unwrap();
        assert_relative_eq!(p.a, 7.92e-9, max_relative = 1e-9);
        assert_relative_eq!(p.alpha.to_degrees(), 90.0, max_relative = 1e-9);
    }

    #[test]
    fn missing_parameter_is_an_error() {
        let text = "a = 7.92 nm\nb = 7.92 nm\n";
        assert!(matches!(
            cell_from_str(text),
            Err(EngineError::MalformedInput(_))
        ));
    }
}
