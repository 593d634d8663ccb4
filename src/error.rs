use crate::exchange::State;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Record codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Exchange is {actual:?}, operation requires {expected:?}")]
    InvalidState { expected: State, actual: State },
}

impl Error {
    /// Whether the underlying cause is the store's "key absent" answer.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Store(err) if err.is_not_found())
    }
}

pub type BoxError = Box<dyn core::error::Error + Send + Sync>;
