use thiserror::Error;

/// Errors produced by the engine.
///
/// Setup-time failures (geometry, cell, stream prologue) abort the calling
/// program; per-frame and per-crystal failures are recorded and processing
/// continues.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Degenerate unit cell: {0}")]
    DegenerateCell(String),

    #[error("Not enough peaks for indexing ({found} found, {needed} needed)")]
    InsufficientPeaks { found: usize, needed: usize },

    #[error("Indexer timed out after {0} s")]
    IndexerTimeout(u64),

    #[error("Indexer produced no acceptable cell: {0}")]
    IndexerRejected(String),

    #[error("Integration failed: {0}")]
    IntegrationFailed(String),

    #[error("Singular matrix in {0}")]
    LinAlgSingular(&'static str),

    #[error("Allocation refused: {0}")]
    OutOfMemory(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Short status token used in stream chunk headers.
    pub fn status_token(&self) -> &'static str {
        match self {
            EngineError::Io(_) => "io_error",
            EngineError::MalformedInput(_) => "malformed",
            EngineError::DegenerateCell(_) => "degenerate_cell",
            EngineError::InsufficientPeaks { .. } => "too_few_peaks",
            EngineError::IndexerTimeout(_) => "indexer_timeout",
            EngineError::IndexerRejected(_) => "not_indexed",
            EngineError::IntegrationFailed(_) => "integration_failed",
            EngineError::LinAlgSingular(_) => "singular",
            EngineError::OutOfMemory(_) => "out_of_memory",
            EngineError::Timeout(_) => "timeout",
            EngineError::Cancelled => "cancelled",
        }
    }
}
