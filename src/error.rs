use thiserror::Error;

/// Contract violations of the history buffer. These only happen when the
/// caller breaks the single-writer ordering rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("timestamp {next} is not after the newest retained timestamp {last}")]
    Ordering { last: u64, next: u64 },

    #[error("index {index} out of bounds for history of size {size}")]
    Bounds { index: usize, size: usize },

    #[error("history is empty")]
    Empty,
}
