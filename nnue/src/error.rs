use std::path::PathBuf;

use crate::wire::Perspective;

/// Invalid configuration values.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("hidden size must be even for pairwise activation, got {0}")]
    OddHiddenSize(usize),

    #[error("{name} {value} does not fit the i16 wire indices")]
    ExceedsWireWidth { name: &'static str, value: usize },

    #[error("feature transformer clamp must be positive and finite, got {0}")]
    InvalidClamp(f32),

    #[error("worst case accumulator {worst} exceeds {limit}")]
    AccumulatorOverflow { worst: f64, limit: i16 },

    #[error("square {square} maps to bucket {bucket}, but there are only {count} buckets")]
    BucketOutOfRange {
        square: usize,
        bucket: usize,
        count: usize,
    },

    #[error("invalid bucket map: {0}")]
    InvalidBucketMap(String),
}

/// A batch that must not reach the kernels.
///
/// Any of these is fatal to the batch; the training loop aborts instead of
/// skipping, so position accounting stays in sync with the producer.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum BatchError {
    #[error("record is {actual} bytes, layout requires {expected}")]
    Truncated { expected: usize, actual: usize },

    #[error("{section} count {count} exceeds capacity {capacity}")]
    CountExceedsCapacity {
        section: &'static str,
        count: usize,
        capacity: usize,
    },

    #[error("pair refers to entry {entry}, batch size is {batch_size}")]
    EntryOutOfRange { entry: i64, batch_size: usize },

    #[error("entry {entry}: {perspective:?} feature {index} outside [0, {limit})")]
    FeatureOutOfRange {
        entry: usize,
        perspective: Perspective,
        index: i64,
        limit: usize,
    },

    #[error("entry {entry}: {perspective:?} feature {index} appears twice")]
    DuplicateFeature {
        entry: usize,
        perspective: Perspective,
        index: i32,
    },

    #[error("entry {entry}: more than {limit} {perspective:?} features")]
    TooManyFeatures {
        entry: usize,
        perspective: Perspective,
        limit: usize,
    },

    #[error("entry {entry}: move slot {index} outside [0, {limit})")]
    MoveOutOfRange {
        entry: usize,
        index: i64,
        limit: usize,
    },

    #[error("entry {entry}: move slot {index} appears twice")]
    DuplicateMove { entry: usize, index: i32 },

    #[error("entry {entry}: more than {limit} legal moves")]
    TooManyMoves { entry: usize, limit: usize },

    #[error("entry {entry} has no legal moves")]
    NoLegalMoves { entry: usize },

    #[error("entry {entry}: best move {index} is not one of its legal moves")]
    BestMoveNotLegal { entry: usize, index: i64 },

    #[error("entry {entry}: WDL label {value} outside [0, 1]")]
    InvalidWdl { entry: usize, value: f32 },

    #[error("entry {entry}: invalid visit weight {value}")]
    InvalidVisitWeight { entry: usize, value: f32 },

    #[error("entry {entry}: visit weights sum to zero")]
    ZeroVisits { entry: usize },
}

/// Failures of the quantized export and its reader.
#[derive(thiserror::Error, Debug)]
pub enum ExportError {
    #[error("{tensor}[{index}] = {value} exceeds the clamp bound {bound}")]
    OutOfRange {
        tensor: &'static str,
        index: usize,
        value: f32,
        bound: f32,
    },

    #[error("{tensor}[{index}] = {value} does not fit in i16 after scaling")]
    Overflow {
        tensor: &'static str,
        index: usize,
        value: f32,
    },

    #[error("{tensor} has {actual} values, expected {expected}")]
    ShapeMismatch {
        tensor: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("blob is {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("padding byte {offset} is {found:#04x}, expected {expected:#04x}")]
    BadPadding {
        offset: usize,
        expected: u8,
        found: u8,
    },

    #[error("padding pattern must not be empty")]
    EmptyPattern,

    #[error("alignment must be greater than zero")]
    ZeroAlignment,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures on the producer side of the batch channel.
#[derive(thiserror::Error, Debug)]
pub enum ProducerError {
    #[error("data file {path:?} is {bytes} bytes, not a non-zero multiple of the {record} byte record")]
    BadFileLength {
        path: PathBuf,
        bytes: u64,
        record: usize,
    },

    #[error("producer configuration: {0}")]
    Config(String),

    #[error("producer has shut down")]
    Disconnected,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Crate level error.
#[derive(thiserror::Error, Debug)]
pub enum NnueError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Producer(#[from] ProducerError),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NnueError>;
