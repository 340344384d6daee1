use std::fmt;
use thiserror::Error;

/// Failure talking to the generation service or fetching its output.
/// Recoverable by resubmitting the segment.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("submit failed: {0}")]
    Submit(String),
    #[error("poll failed: {0}")]
    Poll(String),
    #[error("generation failed: {0}")]
    JobFailed(String),
    #[error("generation timed out after {attempts} polls")]
    Timeout { attempts: u32 },
    #[error("download failed: HTTP {status}")]
    Fetch { status: u16 },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure rendering one overlay card. The card is simply left out.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("rasterizer failed: {0}")]
    Rasterizer(String),
    #[error("rasterizer produced no image")]
    EmptyImage,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Compositor stage identifiers, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Concatenate,
    Overlay,
    Subtitles,
    Finalize,
}

impl Pass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pass::Concatenate => "concatenate",
            Pass::Overlay => "overlay",
            Pass::Subtitles => "subtitles",
            Pass::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transcoding pass failed. Always fatal for the run.
#[derive(Debug, Error)]
#[error("{pass} pass failed: {message}")]
pub struct CompositionError {
    pub pass: Pass,
    pub message: String,
}

impl CompositionError {
    pub fn new(pass: Pass, message: impl Into<String>) -> Self {
        Self {
            pass,
            message: message.into(),
        }
    }
}
