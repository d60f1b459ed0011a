#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("increment must not be negative")]
    NegativeIncrement,

    #[error("count must not be negative")]
    NegativeCount,

    #[error("prune boundary must not be negative")]
    NegativeBoundary,

    #[error("depth must be in the range 1-32")]
    DepthOutOfRange,

    #[error("sketches to merge must use the same width and depth")]
    ShapeMismatch,

    #[error("estimators to merge must use the same register count")]
    RegisterCountMismatch,

    #[error("table must have at least 4 buckets")]
    TableTooSmall,

    #[error("either a memory budget or a bucket count is required")]
    MissingCapacity,

    #[error("key must not contain a NUL byte")]
    NulInKey,

    #[error("counter value would overflow")]
    CounterOverflow,

    #[error("algorithm mismatch: expected {expected}, found {found}")]
    AlgorithmMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("invalid dump: {0}")]
    InvalidDump(&'static str),
}
