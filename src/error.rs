// Error types for Device Pilot
// Each module surfaces errors through these variants rather than raw strings

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("invalid value for {field}: {value} ({reason})")]
    InvalidValue {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("failed to create directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("filesystem watcher error: {0}")]
    Watch(String),

    #[error("buffer directory unavailable: {0:?}")]
    DirUnavailable(PathBuf),
}

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("frame source closed unexpectedly")]
    StreamClosed,

    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
}

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("no usable segments for session {0}")]
    NoSegments(String),

    #[error("recorder I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ffmpeg concat failed with status {0}")]
    ConcatFailed(std::process::ExitStatus),
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error(transparent)]
    Recorder(#[from] RecorderError),
}
