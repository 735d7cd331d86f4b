//! sfxpipe-core — processing engine for serial crystallography streams.
//!
//! Diffraction snapshots from randomly oriented micro-crystals arrive as
//! multi-panel detector frames; the engine turns them into merged,
//! symmetry-reduced reflection intensities. The pipeline stages are:
//!
//! 1. **Peaks** – locate Bragg peaks (gradient walk or connected
//!    components), or import externally found lists.
//! 2. **Index** – hand the peaks to auto-indexing engines and vet their
//!    candidate cells (cell match, refinement, peak alignment).
//! 3. **Predict** – under a finite-bandwidth, finite-divergence beam,
//!    decide which reflections each crystal excites and with what
//!    partiality.
//! 4. **Integrate** – ring integration with pluggable background
//!    estimators.
//! 5. **Stream** – append each frame's results as a chunk of a text
//!    stream.
//! 6. **Scale** – offline, jointly estimate per-crystal scale factors,
//!    full intensities and refined cells from many streams' worth of
//!    partial observations.
//!
//! Image-file decoding, indexer child processes and any graphical
//! front-end are external collaborators: the engine talks to them through
//! the [`pipeline::FrameSource`] and [`index::Indexer`] traits and the
//! stream format.

pub mod cell;
pub mod crystal;
pub mod error;
pub mod geometry;
pub mod image;
pub mod index;
pub mod integrate;
pub mod peaks;
pub mod pipeline;
pub mod pool;
pub mod predict;
pub mod refine;
pub mod reflist;
pub mod scale;
pub mod stream;
pub mod symmetry;

pub use cell::{CellParams, CellTolerances, LatticeType, UnitCell};
pub use crystal::{BeamSnapshot, Crystal};
pub use error::{EngineError, Result};
pub use geometry::{Detector, Panel};
pub use image::{BeamParams, Image, Peak};
pub use pipeline::{PipelineConfig, PipelineSummary};
pub use reflist::{RefList, ReflData, Reflection};
pub use symmetry::{Hkl, PointGroup};

/// Engine version recorded in stream prologues.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
