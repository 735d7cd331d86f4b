//! Bragg peak search.
//!
//! Two native detectors are provided, plus import paths for externally
//! supplied peak lists:
//!
//! 1. **Zaef** – gradient-seeded hill climb with centroiding
//!    ([`zaef`]).
//! 2. **Peakfinder8/9** – resolution-ring-bounded connected components
//!    with local-background SNR gates ([`peakfinder`]).
//! 3. **Imported lists** – plain tables or MessagePack frames received
//!    from an online data pipeline ([`import`]).

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::image::Image;

pub mod import;
pub mod peakfinder;
pub mod zaef;

/// Which peak search runs in the per-frame pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakSearchMethod {
    #[default]
    Zaef,
    Peakfinder8,
    Peakfinder9,
    /// Peaks arrive with the frame; no search is run.
    None,
}

impl PeakSearchMethod {
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "zaef" => Some(Self::Zaef),
            "peakfinder8" => Some(Self::Peakfinder8),
            "peakfinder9" => Some(Self::Peakfinder9),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Combined peak search parameters for all methods.
#[derive(Debug, Clone)]
pub struct PeakSearchConfig {
    pub method: PeakSearchMethod,
    pub zaef: zaef::ZaefConfig,
    pub peakfinder: peakfinder::PeakfinderConfig,
}

impl Default for PeakSearchConfig {
    fn default() -> Self {
        Self {
            method: PeakSearchMethod::Zaef,
            zaef: zaef::ZaefConfig::default(),
            peakfinder: peakfinder::PeakfinderConfig::default(),
        }
    }
}

/// Run the configured peak search, replacing the frame's feature list.
pub fn search_peaks(image: &mut Image, config: &PeakSearchConfig) -> Result<()> {
    let peaks = match config.method {
        PeakSearchMethod::Zaef => zaef::search(image, &config.zaef),
        PeakSearchMethod::Peakfinder8 => peakfinder::search(image, &config.peakfinder, false),
        PeakSearchMethod::Peakfinder9 => peakfinder::search(image, &config.peakfinder, true),
        PeakSearchMethod::None => {
            return Err(EngineError::MalformedInput(
                "peak search method 'none' needs an imported peak list".into(),
            ))
        }
    };
    image.features = peaks;
    Ok(())
}
