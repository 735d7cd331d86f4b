//! End-to-end exercise: synthetic frames through peak search, indexing,
//! integration and the stream codec, then scaling of the re-read stream.

use std::f64::consts::FRAC_PI_2;
use std::io::BufReader;

use sfxpipe_core::cell::UnitCell;
use sfxpipe_core::crystal::BeamSnapshot;
use sfxpipe_core::error::Result;
use sfxpipe_core::geometry::Detector;
use sfxpipe_core::image::{BeamParams, Image, PanelData};
use sfxpipe_core::index::{IndexingConfig, IndexingDriver, TemplateIndexer};
use sfxpipe_core::integrate::IntegrationConfig;
use sfxpipe_core::pipeline::{process_frames, FrameSource, PipelineConfig};
use sfxpipe_core::predict::find_intersections;
use sfxpipe_core::scale::{scale_and_post_refine, ScaleConfig};
use sfxpipe_core::stream::{chunk_beam, StreamReader, StreamWriter};
use sfxpipe_core::symmetry::PointGroup;
use sfxpipe_core::Crystal;

const R_P: f64 = 3.0e6;

fn cubic_10nm() -> UnitCell {
    UnitCell::from_parameters(10e-9, 10e-9, 10e-9, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2)
}

fn paint_gaussian(panel: &mut PanelData, cx: f64, cy: f64, amp: f64) {
    let sigma = 1.5f64;
    let r = 8i64;
    let x0 = cx.round() as i64;
    let y0 = cy.round() as i64;
    for y in (y0 - r).max(0)..(y0 + r).min(panel.h as i64) {
        for x in (x0 - r).max(0)..(x0 + r).min(panel.w as i64) {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            let v = amp * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
            let i = panel.idx(x as usize, y as usize);
            panel.data[i] += v as f32;
        }
    }
}

struct SpotSource {
    remaining: usize,
    detector: Detector,
    cell: UnitCell,
}

impl FrameSource for SpotSource {
    fn next_frame(&mut self) -> Result<Option<Image>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;

        let mut img = Image::new(&self.detector, &BeamParams::default())?;
        img.filename = format!("frame-{:03}.msgpack", self.remaining);
        let beam = BeamSnapshot {
            lambda: img.lambda,
            divergence: img.divergence,
            bandwidth: img.bandwidth,
        };
        let predicted = find_intersections(&self.cell, &beam, R_P, &self.detector)?;
        for refl in predicted.iter() {
            let d = refl.get();
            paint_gaussian(&mut img.panels[d.panel], d.fs, d.ss, 10_000.0);
        }
        Ok(Some(img))
    }
}

#[test]
fn frames_to_merged_intensities() {
    let detector = Detector::simple(1024, 1024, 13333.3, 80e-3);
    let cell = cubic_10nm();

    // Stage 1: the per-frame pipeline writes a stream.
    let driver = IndexingDriver::new(
        vec![Box::new(TemplateIndexer::new(cell.clone()))],
        IndexingConfig {
            target_cell: Some(cell.clone()),
            ..IndexingConfig::default()
        },
    );
    let writer = StreamWriter::new(Vec::<u8>::new());
    writer
        .write_prologue(
            "sfxpipe test",
            &["indexamajig".into()],
            "clen = 0.08\nphoton_energy = 8000.0\n",
            Some(&cell),
        )
        .unwrap();
    let config = PipelineConfig {
        min_peaks: 10,
        profile_radius: R_P,
        integration: IntegrationConfig {
            overpredict: true,
            ..IntegrationConfig::default()
        },
        ..PipelineConfig::default()
    };
    let tmp = tempfile::tempdir().unwrap();
    let summary = process_frames(
        Box::new(SpotSource {
            remaining: 3,
            detector: detector.clone(),
            cell: cell.clone(),
        }),
        &driver,
        &writer,
        &config,
        2,
        tmp.path(),
        None,
    )
    .unwrap();
    assert_eq!(summary.n_frames, 3);
    assert_eq!(summary.n_indexed, 3);

    // Stage 2: read the stream back and rebuild the crystals.
    let text = String::from_utf8(writer.into_inner()).unwrap();
    let pg = PointGroup::parse("m-3m").unwrap();
    let mut reader = StreamReader::new(BufReader::new(text.as_bytes()));
    let mut crystals: Vec<Crystal> = Vec::new();
    while let Some(chunk) = reader.read_chunk().unwrap() {
        assert_eq!(chunk.status, "indexed");
        for sc in &chunk.crystals {
            let mut crystal = sc.to_crystal(chunk_beam(&chunk));
            assert!(!crystal.reflections.is_empty());
            crystal.profile_radius = R_P;
            crystal.reflections = crystal.reflections.asymmetric_indices(&pg);
            crystals.push(crystal);
        }
    }
    assert_eq!(crystals.len(), 3);
    let target = reader.target_cell.as_ref().expect("prologue cell");
    let p = target.parameters().unwrap();
    assert!((p.a - 10e-9).abs() / 10e-9 < 1e-6);

    // Stage 3: scale the partial observations into a merged list.
    let scale_config = ScaleConfig {
        n_iter: 1,
        ..ScaleConfig::default()
    };
    let full =
        scale_and_post_refine(&mut crystals, &detector, None, &scale_config, None).unwrap();

    let n_merged = full
        .iter()
        .filter(|r| r.get().redundancy > 0)
        .count();
    assert!(n_merged > 10, "only {n_merged} merged reflections");

    // Identical frames: every scale factor must come out the same.
    for c in &crystals {
        assert!(c.osf.is_finite() && c.osf > 0.0);
        let ratio = c.osf / crystals[0].osf;
        assert!(
            (ratio - 1.0).abs() < 0.05,
            "scale factors diverged: {ratio}"
        );
    }

    // Merged intensities of strong reflections are positive.
    let mut n_positive = 0usize;
    for refl in full.iter() {
        let d = refl.get();
        if d.redundancy >= 2 && d.intensity > 0.0 {
            n_positive += 1;
        }
    }
    assert!(n_positive > 10);
}
