//! Error types shared by the datastores and the matchers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid schema name {0:?}")]
    InvalidSchema(String),

    #[error("invalid row: {0}")]
    InvalidRow(String),
}

/// Failure while matching a single feed entity.
///
/// An unresolved or ambiguous trip reference is not an error; it is reported
/// through the entity's schedule relationship instead.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("malformed input: {0}")]
    Malformed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MatchError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_converts_into_match_error() {
        let err: MatchError = StoreError::InvalidRow("bad date".to_string()).into();
        assert!(matches!(err, MatchError::Store(StoreError::InvalidRow(_))));
        assert_eq!(err.to_string(), "invalid row: bad date");
    }

    #[test]
    fn test_malformed_message() {
        let err = MatchError::malformed("missing route_id");
        assert_eq!(err.to_string(), "malformed input: missing route_id");
    }
}
