use std::path::PathBuf;

use ffmpeg_next as ffmpeg;
use thiserror::Error;

/// Errors surfaced by trajectory read/write operations.
///
/// Cache failures are recovered internally where possible: a failed cache
/// write is logged and the in-memory result returned; an unreadable cache is
/// logged and refilled from the container. Everything else propagates to the
/// caller unchanged.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum TrajectoryError {
    #[error("invalid trajectory mode `{0}`, must be `r` or `w`")]
    InvalidMode(String),

    #[error("trajectory file `{0}` does not exist")]
    FileMissing(PathBuf),

    #[error("could not create trajectory file `{path}`: {source}")]
    FileCreateFailed {
        path: PathBuf,
        #[source]
        source: ffmpeg::Error,
    },

    #[error("nested values must be added with `add_by_dict`")]
    InvalidValue,

    #[error("all feature sequences must have the same length, got {0:?}")]
    ShapeMismatch(Vec<(String, usize)>),

    #[error("the trajectory is already closed")]
    DoubleClose,

    #[error("the trajectory is not open for writing")]
    NotWritable,

    #[error("failed to persist the decoded cache: {0}")]
    CacheWriteFailed(#[source] CacheError),

    #[error("failed to read the decoded cache: {0}")]
    CacheReadFailed(#[source] CacheError),

    #[error("could not decode trajectory container `{path}`: {source}")]
    DecodeFailed {
        path: PathBuf,
        #[source]
        source: ffmpeg::Error,
    },

    #[error("feature `{0}` is not present in this trajectory")]
    FeatureMissing(String),

    #[error("malformed feature type string `{0}`")]
    MalformedFeatureType(String),

    #[error("feature type `{0}` cannot be carried by a video stream")]
    NotImage(crate::FeatureType),

    #[error("no encoder available for codec `{0}`")]
    EncoderMissing(&'static str),

    #[error("value does not match the stream layout: {0}")]
    Layout(#[from] ndarray::ShapeError),

    #[error("packet serialization error: {0}")]
    Pickle(#[from] serde_pickle::Error),

    #[error("container error: {0}")]
    Av(#[from] ffmpeg::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while persisting or reading the decoded cache.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache file error: {0}")]
    Hdf5(#[from] hdf5::Error),

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported dataset type {0} in cache")]
    UnsupportedDataset(String),
}
