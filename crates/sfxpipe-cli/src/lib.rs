//! Shared plumbing for the sfxpipe command-line frontends.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};

use sfxpipe_core::error::{EngineError, Result};
use sfxpipe_core::image::{BeamParams, Image};
use sfxpipe_core::peaks::import;
use sfxpipe_core::pipeline::FrameSource;
use sfxpipe_core::pool::Progress;
use sfxpipe_core::reflist::RefList;
use sfxpipe_core::Detector;

/// Frame source for MessagePack frame files (online-analysis schema):
/// each listed file holds a `corr_data` raster and, optionally, a
/// `peak_list` map.
pub struct MsgpackFileSource {
    files: VecDeque<PathBuf>,
    detector: Detector,
    beam: BeamParams,
    /// Take peaks from the file's `peak_list` instead of searching.
    pub import_peaks: bool,
    /// Add 0.5 px to imported peak coordinates (pixel-index convention).
    pub half_pixel_shift: bool,
}

impl MsgpackFileSource {
    pub fn new(files: Vec<PathBuf>, detector: Detector, beam: BeamParams) -> Self {
        Self {
            files: files.into(),
            detector,
            beam,
            import_peaks: false,
            half_pixel_shift: true,
        }
    }

    /// Read the newline-separated file list the `-i` option points at.
    pub fn read_file_list(path: &std::path::Path) -> Result<Vec<PathBuf>> {
        let text = fs::read_to_string(path)?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(PathBuf::from)
            .collect())
    }
}

impl FrameSource for MsgpackFileSource {
    fn next_frame(&mut self) -> Result<Option<Image>> {
        let Some(path) = self.files.pop_front() else {
            return Ok(None);
        };
        let bytes = fs::read(&path)?;
        let mut image = Image::new(&self.detector, &self.beam)?;
        image.filename = path.to_string_lossy().into_owned();
        image.panels = import::panel_data_from_msgpack(&bytes, &self.detector)?;
        if self.import_peaks {
            image.features =
                import::peaks_from_msgpack(&bytes, &self.detector, self.half_pixel_shift)?;
        }
        Ok(Some(image))
    }
}

/// Terminal progress bar adapter for the engine's progress sink.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new(total: u64) -> Self {
        let bar = ProgressBar::new(total.max(1));
        bar.set_style(
            ProgressStyle::with_template(
                "{msg:>12} [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .expect("indicatif template")
            .progress_chars("=> "),
        );
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Progress for BarProgress {
    fn report(&self, done: usize, total: usize, label: &str) {
        self.bar.set_length(total as u64);
        self.bar.set_message(label.to_string());
        self.bar.set_position(done as u64);
    }
}

/// Write a merged reflection list: `h k l I sigma(I) nmeas`.
pub fn write_hkl(mut writer: impl Write, list: &RefList) -> Result<()> {
    writeln!(writer, "   h    k    l            I     sigma(I)  nmeas")?;
    for refl in list.iter() {
        let (h, k, l) = refl.indices();
        let d = refl.get();
        if d.redundancy == 0 {
            continue;
        }
        writeln!(
            writer,
            "{h:4} {k:4} {l:4} {:12.4} {:12.4} {:6}",
            d.intensity, d.esd_intensity, d.redundancy
        )?;
    }
    Ok(())
}

/// Read a reflection list written by [`write_hkl`] (used for
/// `--reference`).
pub fn read_hkl(text: &str) -> Result<RefList> {
    let mut list = RefList::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }
        let (Ok(h), Ok(k), Ok(l)) = (
            fields[0].parse::<i32>(),
            fields[1].parse::<i32>(),
            fields[2].parse::<i32>(),
        ) else {
            continue; // header line
        };
        let (intensity, sigma) = (
            fields[3]
                .parse::<f64>()
                .map_err(|_| EngineError::MalformedInput(format!("bad intensity: {line}")))?,
            fields[4]
                .parse::<f64>()
                .map_err(|_| EngineError::MalformedInput(format!("bad sigma: {line}")))?,
        );
        let redundancy = fields
            .get(5)
            .and_then(|f| f.parse::<usize>().ok())
            .unwrap_or(1);
        let refl = list.add((h, k, l));
        refl.update(|d| {
            d.intensity = intensity;
            d.esd_intensity = sigma;
            d.redundancy = redundancy;
            d.symmetric = (h, k, l);
        });
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkl_round_trip() {
        let mut list = RefList::new();
        for (hkl, i, s, n) in [
            ((1, 2, 3), 1234.5678, 12.25, 4),
            ((-2, 0, 5), -7.5, 3.125, 1),
        ] {
            let r = list.add(hkl);
            r.update(|d| {
                d.intensity = i;
                d.esd_intensity = s;
                d.redundancy = n;
            });
        }

        let mut out = Vec::new();
        write_hkl(&mut out, &list).unwrap();
        let back = read_hkl(&String::from_utf8(out).unwrap()).unwrap();
        assert_eq!(back.len(), 2);
        let d = back.find((1, 2, 3)).unwrap().get();
        assert!((d.intensity - 1234.5678).abs() < 1e-3);
        assert_eq!(d.redundancy, 4);
    }

    #[test]
    fn file_list_skips_blanks_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let list_path = dir.path().join("files.lst");
        fs::write(&list_path, "a.msgpack\n\n# comment\nb.msgpack\n").unwrap();
        let files = MsgpackFileSource::read_file_list(&list_path).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1], PathBuf::from("b.msgpack"));
    }
}
