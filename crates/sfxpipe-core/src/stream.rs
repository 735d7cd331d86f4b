//! Append-only text stream of per-frame results.
//!
//! A stream starts with a prologue (format banner, generator, argv, the
//! verbatim geometry file and the target cell) followed by one chunk per
//! processed frame. Each chunk holds `key = value` header lines, a peak
//! table, and zero or more crystal blocks with their reflection tables.
//!
//! Streams are concatenatable: readers skip anything outside chunk
//! markers, so `cat a.stream b.stream` is itself a valid stream. Unknown
//! header keys are tolerated for forward compatibility, and a truncated
//! final chunk is reported but does not fail the read.

use std::io::{BufRead, Write};
use std::sync::Mutex;

use nalgebra::{Matrix3, Vector3};

use crate::cell::{parse as cellparse, UnitCell};
use crate::crystal::{BeamSnapshot, Crystal};
use crate::error::Result;
use crate::image::ev_to_lambda;

const FORMAT_BANNER: &str = "Stream format 1.0";
const CHUNK_BEGIN: &str = "----- Begin chunk -----";
const CHUNK_END: &str = "----- End chunk -----";
const CRYSTAL_BEGIN: &str = "--- Begin crystal";
const CRYSTAL_END: &str = "--- End crystal";
const PEAKS_BEGIN: &str = "Peaks from peak search";
const PEAKS_END: &str = "End of peak list";
const REFL_BEGIN: &str = "Reflections measured after indexing";
const REFL_END: &str = "End of reflections";
const GEOM_BEGIN: &str = "----- Begin geometry file -----";
const GEOM_END: &str = "----- End geometry file -----";
const CELL_BEGIN: &str = "----- Begin unit cell -----";
const CELL_END: &str = "----- End unit cell -----";

/// One peak table row.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPeak {
    pub fs: f64,
    pub ss: f64,
    pub panel: String,
    pub intensity: f64,
}

/// One reflection table row.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamReflection {
    pub h: i32,
    pub k: i32,
    pub l: i32,
    pub intensity: f64,
    pub sigma: f64,
    pub partiality: f64,
    pub background: f64,
    pub fs: f64,
    pub ss: f64,
    pub panel: String,
}

/// One crystal block.
#[derive(Debug, Clone)]
pub struct StreamCrystal {
    /// Reciprocal axes as matrix columns (m⁻¹); the exact record of the
    /// indexed cell.
    pub reciprocal: Matrix3<f64>,
    pub osf: f64,
    /// Profile radius in m⁻¹.
    pub profile_radius: f64,
    pub reflections: Vec<StreamReflection>,
}

/// One frame's worth of stream records.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub filename: String,
    pub event: String,
    pub serial: usize,
    /// Frame outcome token (`indexed`, `not_indexed`, an error token...).
    pub status: String,
    pub indexed_by: String,
    pub photon_energy_ev: f64,
    pub divergence: f64,
    pub bandwidth: f64,
    pub peaks: Vec<StreamPeak>,
    pub crystals: Vec<StreamCrystal>,
}

impl StreamCrystal {
    pub fn from_crystal(crystal: &Crystal) -> Result<Self> {
        let mut reflections = Vec::with_capacity(crystal.reflections.len());
        for refl in crystal.reflections.iter() {
            let d = refl.get();
            let (h, k, l) = refl.indices();
            reflections.push(StreamReflection {
                h,
                k,
                l,
                intensity: d.intensity,
                sigma: d.esd_intensity,
                partiality: d.partiality,
                background: d.background,
                fs: d.fs,
                ss: d.ss,
                panel: format!("p{}", d.panel),
            });
        }
        Ok(Self {
            reciprocal: crystal.cell.reciprocal()?,
            osf: crystal.osf,
            profile_radius: crystal.profile_radius,
            reflections,
        })
    }

    /// Rebuild an in-memory crystal (raw-indexed reflections) from the
    /// block. Panel names are parsed back to indices where possible.
    pub fn to_crystal(&self, beam: BeamSnapshot) -> Crystal {
        let mut crystal = Crystal::new(UnitCell::from_reciprocal(self.reciprocal), beam);
        crystal.osf = self.osf;
        crystal.profile_radius = self.profile_radius;
        for r in &self.reflections {
            let refl = crystal.reflections.add((r.h, r.k, r.l));
            refl.update(|d| {
                d.intensity = r.intensity;
                d.esd_intensity = r.sigma;
                d.partiality = r.partiality;
                d.background = r.background;
                d.fs = r.fs;
                d.ss = r.ss;
                d.panel = r.panel.strip_prefix('p').and_then(|s| s.parse().ok()).unwrap_or(0);
                d.lorentz = 1.0;
                d.redundancy = 1;
                d.symmetric = (r.h, r.k, r.l);
            });
        }
        crystal
    }
}

/// Serialising writer: each chunk is written under one lock, so chunks
/// are byte-contiguous in the output no matter how many workers emit.
pub struct StreamWriter<W: Write + Send> {
    inner: Mutex<W>,
}

impl<W: Write + Send> StreamWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    /// Write the stream prologue.
    pub fn write_prologue(
        &self,
        generator: &str,
        argv: &[String],
        geometry_text: &str,
        target_cell: Option<&UnitCell>,
    ) -> Result<()> {
        let mut w = self.inner.lock().expect("stream writer lock");
        writeln!(w, "{FORMAT_BANNER}")?;
        writeln!(w, "Generated by {generator}")?;
        writeln!(w, "argv: {}", argv.join(" "))?;
        writeln!(w, "{GEOM_BEGIN}")?;
        w.write_all(geometry_text.as_bytes())?;
        if !geometry_text.ends_with('\n') {
            writeln!(w)?;
        }
        writeln!(w, "{GEOM_END}")?;
        if let Some(cell) = target_cell {
            writeln!(w, "{CELL_BEGIN}")?;
            w.write_all(cellparse::cell_to_string(cell)?.as_bytes())?;
            writeln!(w, "{CELL_END}")?;
        }
        Ok(())
    }

    /// Append one chunk.
    pub fn write_chunk(&self, chunk: &StreamChunk) -> Result<()> {
        let mut w = self.inner.lock().expect("stream writer lock");
        writeln!(w, "{CHUNK_BEGIN}")?;
        writeln!(w, "Image filename: {}", chunk.filename)?;
        if !chunk.event.is_empty() {
            writeln!(w, "Event: {}", chunk.event)?;
        }
        writeln!(w, "Image serial number: {}", chunk.serial)?;
        writeln!(w, "status = {}", chunk.status)?;
        writeln!(w, "indexed_by = {}", chunk.indexed_by)?;
        writeln!(w, "photon_energy_eV = {:.6}", chunk.photon_energy_ev)?;
        writeln!(w, "beam_divergence = {:.6e} rad", chunk.divergence)?;
        writeln!(w, "beam_bandwidth = {:.6e} (fraction)", chunk.bandwidth)?;
        writeln!(w, "num_peaks = {}", chunk.peaks.len())?;

        writeln!(w, "{PEAKS_BEGIN}")?;
        writeln!(w, "  fs/px      ss/px     Intensity  Panel")?;
        for p in &chunk.peaks {
            writeln!(
                w,
                "{:10.6} {:10.6} {:13.4} {}",
                p.fs, p.ss, p.intensity, p.panel
            )?;
        }
        writeln!(w, "{PEAKS_END}")?;

        for crystal in &chunk.crystals {
            writeln!(w, "{CRYSTAL_BEGIN}")?;
            let m = &crystal.reciprocal;
            for (name, col) in [("astar", 0), ("bstar", 1), ("cstar", 2)] {
                writeln!(
                    w,
                    "{name} = {:+.12e} {:+.12e} {:+.12e} m^-1",
                    m[(0, col)],
                    m[(1, col)],
                    m[(2, col)]
                )?;
            }
            writeln!(w, "overall_scale_factor = {:.8}", crystal.osf)?;
            writeln!(w, "profile_radius = {:.8e} m^-1", crystal.profile_radius)?;
            writeln!(w, "{REFL_BEGIN}")?;
            writeln!(
                w,
                "   h    k    l          I     sigma(I)          p  background      fs/px      ss/px  panel"
            )?;
            for r in &crystal.reflections {
                writeln!(
                    w,
                    "{:4} {:4} {:4} {:12.4} {:12.4} {:10.6} {:11.4} {:10.4} {:10.4}  {}",
                    r.h,
                    r.k,
                    r.l,
                    r.intensity,
                    r.sigma,
                    r.partiality,
                    r.background,
                    r.fs,
                    r.ss,
                    r.panel
                )?;
            }
            writeln!(w, "{REFL_END}")?;
            writeln!(w, "{CRYSTAL_END}")?;
        }

        writeln!(w, "{CHUNK_END}")?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner.into_inner().expect("stream writer lock")
    }
}

/// Pull-style stream reader.
pub struct StreamReader<R: BufRead> {
    lines: std::io::Lines<R>,
    /// The prologue's embedded geometry text, available after the first
    /// chunk read reaches it.
    pub geometry_text: Option<String>,
    /// The prologue's target cell, if one was recorded.
    pub target_cell: Option<UnitCell>,
}

impl<R: BufRead> StreamReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            geometry_text: None,
            target_cell: None,
        }
    }

    fn next_line(&mut self) -> Result<Option<String>> {
        match self.lines.next() {
            Some(line) => Ok(Some(line?)),
            None => Ok(None),
        }
    }

    /// Read up to the next complete chunk. Returns `None` at end of
    /// stream; a chunk cut off by the end of the file is reported and
    /// dropped.
    pub fn read_chunk(&mut self) -> Result<Option<StreamChunk>> {
        loop {
            let Some(line) = self.next_line()? else {
                return Ok(None);
            };
            match line.trim_end() {
                CHUNK_BEGIN => break,
                GEOM_BEGIN => {
                    let mut text = String::new();
                    loop {
                        let Some(l) = self.next_line()? else {
                            return Ok(None);
                        };
                        if l.trim_end() == GEOM_END {
                            break;
                        }
                        text.push_str(&l);
                        text.push('\n');
                    }
                    self.geometry_text = Some(text);
                }
                CELL_BEGIN => {
                    let mut text = String::new();
                    loop {
                        let Some(l) = self.next_line()? else {
                            return Ok(None);
                        };
                        if l.trim_end() == CELL_END {
                            break;
                        }
                        text.push_str(&l);
                        text.push('\n');
                    }
                    self.target_cell = Some(cellparse::cell_from_str(&text)?);
                }
                // Prologue and filler lines.
                _ => {}
            }
        }

        let mut chunk = StreamChunk::default();
        loop {
            let Some(line) = self.next_line()? else {
                tracing::warn!("stream ends inside a chunk; dropping the partial record");
                return Ok(None);
            };
            let line = line.trim_end().to_string();
            match line.as_str() {
                CHUNK_END => return Ok(Some(chunk)),
                PEAKS_BEGIN => self.read_peak_table(&mut chunk)?,
                CRYSTAL_BEGIN => {
                    if let Some(crystal) = self.read_crystal_block()? {
                        chunk.crystals.push(crystal);
                    } else {
                        tracing::warn!("stream ends inside a crystal block");
                        return Ok(None);
                    }
                }
                _ => parse_chunk_header(&mut chunk, &line),
            }
        }
    }

    fn read_peak_table(&mut self, chunk: &mut StreamChunk) -> Result<()> {
        loop {
            let Some(line) = self.next_line()? else {
                return Ok(());
            };
            let line = line.trim_end();
            if line == PEAKS_END {
                return Ok(());
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                continue; // table header
            }
            let (Ok(fs), Ok(ss), Ok(intensity)) = (
                fields[0].parse::<f64>(),
                fields[1].parse::<f64>(),
                fields[2].parse::<f64>(),
            ) else {
                continue;
            };
            chunk.peaks.push(StreamPeak {
                fs,
                ss,
                panel: fields[3].to_string(),
                intensity,
            });
        }
    }

    fn read_crystal_block(&mut self) -> Result<Option<StreamCrystal>> {
        let mut reciprocal = Matrix3::<f64>::zeros();
        let mut osf = 1.0;
        let mut profile_radius = 0.0;
        let mut reflections = Vec::new();

        loop {
            let Some(line) = self.next_line()? else {
                return Ok(None);
            };
            let line = line.trim_end();
            match line {
                CRYSTAL_END => {
                    return Ok(Some(StreamCrystal {
                        reciprocal,
                        osf,
                        profile_radius,
                        reflections,
                    }))
                }
                REFL_BEGIN => loop {
                    let Some(l) = self.next_line()? else {
                        return Ok(None);
                    };
                    let l = l.trim_end();
                    if l == REFL_END {
                        break;
                    }
                    if let Some(r) = parse_reflection_row(l) {
                        reflections.push(r);
                    }
                },
                _ => {
                    let Some((key, value)) = line.split_once('=') else {
                        continue;
                    };
                    let key = key.trim();
                    let value = value.trim();
                    match key {
                        "astar" | "bstar" | "cstar" => {
                            let col = match key {
                                "astar" => 0,
                                "bstar" => 1,
                                _ => 2,
                            };
                            let nums: Vec<f64> = value
                                .split_whitespace()
                                .take(3)
                                .filter_map(|t| t.parse().ok())
                                .collect();
                            if nums.len() == 3 {
                                reciprocal.set_column(col, &Vector3::new(nums[0], nums[1], nums[2]));
                            }
                        }
                        "overall_scale_factor" => {
                            osf = value.parse().unwrap_or(1.0);
                        }
                        "profile_radius" => {
                            profile_radius = value
                                .split_whitespace()
                                .next()
                                .and_then(|t| t.parse().ok())
                                .unwrap_or(0.0);
                        }
                        other => {
                            tracing::debug!(key = other, "unknown crystal key skipped");
                        }
                    }
                }
            }
        }
    }
}

fn parse_chunk_header(chunk: &mut StreamChunk, line: &str) {
    if let Some(value) = line.strip_prefix("Image filename: ") {
        chunk.filename = value.to_string();
        return;
    }
    if let Some(value) = line.strip_prefix("Event: ") {
        chunk.event = value.to_string();
        return;
    }
    if let Some(value) = line.strip_prefix("Image serial number: ") {
        chunk.serial = value.trim().parse().unwrap_or(0);
        return;
    }
    let Some((key, value)) = line.split_once('=') else {
        return;
    };
    let key = key.trim();
    let value = value.trim();
    let first = |v: &str| -> f64 {
        v.split_whitespace()
            .next()
            .and_then(|t| t.parse().ok())
            .unwrap_or(0.0)
    };
    match key {
        "status" => chunk.status = value.to_string(),
        "indexed_by" => chunk.indexed_by = value.to_string(),
        "photon_energy_eV" => chunk.photon_energy_ev = first(value),
        "beam_divergence" => chunk.divergence = first(value),
        "beam_bandwidth" => chunk.bandwidth = first(value),
        "num_peaks" => {}
        other => {
            tracing::debug!(key = other, "unknown chunk key skipped");
        }
    }
}

fn parse_reflection_row(line: &str) -> Option<StreamReflection> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }
    Some(StreamReflection {
        h: fields[0].parse().ok()?,
        k: fields[1].parse().ok()?,
        l: fields[2].parse().ok()?,
        intensity: fields[3].parse().ok()?,
        sigma: fields[4].parse().ok()?,
        partiality: fields[5].parse().ok()?,
        background: fields[6].parse().ok()?,
        fs: fields[7].parse().ok()?,
        ss: fields[8].parse().ok()?,
        panel: fields[9].to_string(),
    })
}

/// The beam values recorded in a chunk, as a snapshot for rebuilding
/// crystals.
pub fn chunk_beam(chunk: &StreamChunk) -> BeamSnapshot {
    BeamSnapshot {
        lambda: ev_to_lambda(chunk.photon_energy_ev),
        divergence: chunk.divergence,
        bandwidth: chunk.bandwidth,
    }
}

/// Count chunks by scanning for chunk markers (cheap pre-pass used for
/// progress reporting and allocation).
pub fn count_chunks<R: BufRead>(reader: R) -> Result<usize> {
    let mut n = 0usize;
    for line in reader.lines() {
        if line?.trim_end() == CHUNK_BEGIN {
            n += 1;
        }
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::BufReader;

    fn sample_chunk(serial: usize) -> StreamChunk {
        StreamChunk {
            filename: format!("run0042-{serial}.h5"),
            event: format!("//{serial}"),
            serial,
            status: "indexed".into(),
            indexed_by: "template".into(),
            photon_energy_ev: 8000.0,
            divergence: 1.0e-3,
            bandwidth: 0.01,
            peaks: vec![
                StreamPeak {
                    fs: 100.123456,
                    ss: 200.654321,
                    panel: "p0".into(),
                    intensity: 1234.5,
                },
                StreamPeak {
                    fs: 900.5,
                    ss: 12.25,
                    panel: "p0".into(),
                    intensity: 777.25,
                },
            ],
            crystals: vec![StreamCrystal {
                reciprocal: Matrix3::new(
                    1.0e8, 2.0e5, -3.0e5, 0.0, 9.9e7, 1.0e5, 4.0e4, 0.0, 1.01e8,
                ),
                osf: 1.25,
                profile_radius: 3.0e6,
                reflections: vec![
                    StreamReflection {
                        h: 1,
                        k: -2,
                        l: 3,
                        intensity: 4532.1234,
                        sigma: 21.5678,
                        partiality: 0.731234,
                        background: 12.5,
                        fs: 512.1234,
                        ss: 300.9876,
                        panel: "p0".into(),
                    },
                    StreamReflection {
                        h: -4,
                        k: 0,
                        l: 2,
                        intensity: -15.25,
                        sigma: 8.0,
                        partiality: 0.25,
                        background: 3.75,
                        fs: 100.5,
                        ss: 700.25,
                        panel: "p0".into(),
                    },
                ],
            }],
        }
    }

    fn write_stream(chunks: &[StreamChunk], with_cell: bool) -> String {
        let writer = StreamWriter::new(Vec::<u8>::new());
        let cell = UnitCell::from_parameters(
            10e-9,
            10e-9,
            10e-9,
            90f64.to_radians(),
            90f64.to_radians(),
            90f64.to_radians(),
        );
        writer
            .write_prologue(
                "sfxpipe 0.3.0",
                &["indexamajig".into(), "-i".into(), "files.lst".into()],
                "clen = 0.08\nphoton_energy = 8000\n",
                with_cell.then_some(&cell),
            )
            .unwrap();
        for c in chunks {
            writer.write_chunk(c).unwrap();
        }
        String::from_utf8(writer.into_inner()).unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let chunks = vec![sample_chunk(1), sample_chunk(2)];
        let text = write_stream(&chunks, true);

        let mut reader = StreamReader::new(BufReader::new(text.as_bytes()));
        let mut seen = Vec::new();
        while let Some(chunk) = reader.read_chunk().unwrap() {
            seen.push(chunk);
        }
        assert_eq!(seen.len(), 2);
        assert!(reader.geometry_text.is_some());
        assert!(reader.target_cell.is_some());

        for (a, b) in chunks.iter().zip(&seen) {
            assert_eq!(a.filename, b.filename);
            assert_eq!(a.event, b.event);
            assert_eq!(a.serial, b.serial);
            assert_eq!(a.status, b.status);
            assert_eq!(a.peaks.len(), b.peaks.len());
            for (p, q) in a.peaks.iter().zip(&b.peaks) {
                assert!((p.fs - q.fs).abs() < 1e-6);
                assert!((p.ss - q.ss).abs() < 1e-6);
            }
            assert_eq!(a.crystals.len(), b.crystals.len());
            let (ca, cb) = (&a.crystals[0], &b.crystals[0]);
            assert_relative_eq!(ca.osf, cb.osf, max_relative = 1e-9);
            assert!((ca.reciprocal - cb.reciprocal).norm() < 1.0);
            for (r, s) in ca.reflections.iter().zip(&cb.reflections) {
                assert_eq!((r.h, r.k, r.l), (s.h, s.k, s.l));
                assert!((r.intensity - s.intensity).abs() < 1e-4);
                assert!((r.sigma - s.sigma).abs() < 1e-4);
                assert!((r.partiality - s.partiality).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn truncated_final_chunk_is_reported_not_fatal() {
        let text = write_stream(&[sample_chunk(1), sample_chunk(2)], false);
        // Cut the stream in the middle of the second chunk.
        let cut = text.len() - 80;
        let truncated = &text[..cut];

        let mut reader = StreamReader::new(BufReader::new(truncated.as_bytes()));
        let first = reader.read_chunk().unwrap();
        assert!(first.is_some());
        let second = reader.read_chunk().unwrap();
        assert!(second.is_none(), "partial chunk must be dropped");
    }

    #[test]
    fn unknown_header_keys_are_tolerated() {
        let text = write_stream(&[sample_chunk(7)], false);
        let patched = text.replace(
            "indexed_by = template",
            "indexed_by = template\nsome_future_field = 99\nanother = x y z",
        );
        let mut reader = StreamReader::new(BufReader::new(patched.as_bytes()));
        let chunk = reader.read_chunk().unwrap().expect("chunk expected");
        assert_eq!(chunk.indexed_by, "template");
        assert_eq!(chunk.serial, 7);
    }

    #[test]
    fn concatenated_streams_read_through() {
        let a = write_stream(&[sample_chunk(1)], true);
        let b = write_stream(&[sample_chunk(2)], true);
        let joined = format!("{a}{b}");

        assert_eq!(
            count_chunks(BufReader::new(joined.as_bytes())).unwrap(),
            2
        );

        let mut reader = StreamReader::new(BufReader::new(joined.as_bytes()));
        let mut serials = Vec::new();
        while let Some(chunk) = reader.read_chunk().unwrap() {
            serials.push(chunk.serial);
        }
        assert_eq!(serials, vec![1, 2]);
    }

    #[test]
    fn crystal_blocks_rebuild_crystals() {
        let chunk = sample_chunk(3);
        let crystal = chunk.crystals[0].to_crystal(chunk_beam(&chunk));
        assert_relative_eq!(crystal.osf, 1.25);
        assert_eq!(crystal.reflections.len(), 2);
        let d = crystal.reflections.find((-4, 0, 2)).unwrap().get();
        assert_relative_eq!(d.intensity, -15.25);
        assert_relative_eq!(d.partiality, 0.25);
    }
}
