use quire_data::DataError;
use sqlx::error::ErrorKind;

/// Extension trait for converting `sqlx::Error` into `DataError`.
///
/// Due to Rust's orphan rules, we can't implement `From<sqlx::Error> for DataError`
/// in this crate. Instead, use `.into_data_error()`.
pub trait SqlxErrorExt {
    fn into_data_error(self) -> DataError;
}

impl SqlxErrorExt for sqlx::Error {
    fn into_data_error(self) -> DataError {
        let constraint = match &self {
            sqlx::Error::Database(db) => match db.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => Some(db.constraint().map(str::to_string)),
                _ => None,
            },
            _ => None,
        };
        if let Some(constraint) = constraint {
            return DataError::ConstraintViolation {
                constraint,
                source: Box::new(self),
            };
        }
        match self {
            sqlx::Error::RowNotFound => DataError::NotFound("row not found".into()),
            sqlx::Error::PoolClosed => DataError::Disconnected,
            err @ (sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::WorkerCrashed) => DataError::Connection(Box::new(err)),
            err => DataError::database(err),
        }
    }
}

/// Convenience alias for data-layer results using `DataError`.
pub type SqlxResult<T> = Result<T, DataError>;
