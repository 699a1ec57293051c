// Evidence Cam Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EvidenceCamError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Segment not found: {0}")]
    SegmentNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Overlay error: {0}")]
    Overlay(String),

    #[error("FFmpeg error: {0}")]
    FFmpeg(String),

    #[error("FFprobe error: {0}")]
    FFprobe(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Recorder is not running")]
    RecorderGone,

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for EvidenceCamError {
    fn from(err: anyhow::Error) -> Self {
        EvidenceCamError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EvidenceCamError>;
