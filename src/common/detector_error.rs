use std::path::PathBuf;
use thiserror::Error;

pub type DetectorResult<T> = Result<T, DetectorError>;

#[derive(Debug, Error)]
pub enum DetectorError {
    /// Unknown backbone/model/dataset identifier or a missing required setting.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Two parameter trees disagree on child names, node kinds or shapes.
    #[error("structural mismatch at `{path}`: {reason}")]
    StructuralMismatch { path: String, reason: String },

    /// Same-named fields of different kinds, e.g. a persistent array facing a trainable one.
    #[error("cannot transplant field `{path}`: {dst_kind} <- {src_kind}")]
    TypeTransplant {
        path: String,
        dst_kind: &'static str,
        src_kind: &'static str,
    },

    #[error("incompatible snapshot {path}: {reason}")]
    IncompatibleSnapshot { path: PathBuf, reason: String },

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: isize, len: usize },

    /// A loader worker failed; the main loop must not skip the example.
    #[error("data loader worker failed: {0}")]
    Worker(String),

    #[error("image resize failed: {0}")]
    Resize(String),

    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl DetectorError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn mismatch(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StructuralMismatch {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
