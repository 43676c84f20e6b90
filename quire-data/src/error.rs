use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// A field failed a schema constraint. Raised before any statement is sent.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("validation failed for `{field}`: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Programmer errors in model definitions, detected at registration or first
/// use. These are not recoverable at runtime.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ManifestError {
    #[error("a different manifest is already registered for table `{table}`")]
    Duplicate { table: String },
    #[error("invalid manifest for table `{table}`: {reason}")]
    Invalid { table: String, reason: String },
}

impl ManifestError {
    pub fn invalid(table: impl Into<String>, reason: impl Into<String>) -> Self {
        ManifestError::Invalid {
            table: table.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while assembling a query from a predicate literal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("invalid {kind} identifier: {ident}")]
    InvalidIdentifier { kind: &'static str, ident: String },
    #[error("unknown field `{field}` on `{table}`")]
    UnknownField { table: String, field: String },
    #[error("unknown relation `{relation}` on `{table}`")]
    UnknownRelation { table: String, relation: String },
    #[error("unknown method `{method}` on `{table}`")]
    UnknownMethod { table: String, method: String },
    #[error("operator `{op}` is not applicable to field `{field}`: {reason}")]
    InvalidOperator {
        field: String,
        op: &'static str,
        reason: String,
    },
}

/// Errors that can occur in the data layer.
///
/// Every DAL operation returns this type. Request errors (`Validation`,
/// `NotFound`, `StaleRevision`, `ConstraintViolation`) are distinct from
/// store-availability errors (`Connection`, `Timeout`, `Disconnected`), see
/// [`DataError::is_retryable`].
#[derive(Debug, Error)]
pub enum DataError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("revision {revision_id} of `{table}` is no longer current")]
    StaleRevision { table: String, revision_id: Uuid },

    #[error("constraint violation: {source}")]
    ConstraintViolation {
        constraint: Option<String>,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("connection error: {0}")]
    Connection(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("the data access layer is disconnected")]
    Disconnected,

    #[error("migration `{name}` failed: {source}")]
    Migration {
        name: String,
        #[source]
        source: Box<DataError>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl DataError {
    /// Construct a `Database` variant from any error type.
    ///
    /// Used by backend crates (e.g. `quire-data-sqlx`) to wrap driver-specific
    /// errors.
    pub fn database(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        DataError::Database(Box::new(err))
    }

    pub fn not_found(table: &str, id: impl std::fmt::Display) -> Self {
        DataError::NotFound(format!("{table} {id}"))
    }

    /// Whether the error means "the store is unreachable" rather than "the
    /// request was invalid". Retrying is left to the caller's own policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DataError::Connection(_) | DataError::Timeout(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DataError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_message_names_the_field() {
        let err = DataError::from(ValidationError::new("label", "is required"));
        assert_eq!(err.to_string(), "validation failed for `label`: is required");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(DataError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!DataError::NotFound("x".into()).is_retryable());
        assert!(!DataError::Disconnected.is_retryable());
    }

    #[test]
    fn test_manifest_errors_convert() {
        let err: DataError = ManifestError::Duplicate {
            table: "things".into(),
        }
        .into();
        assert!(matches!(
            err,
            DataError::Manifest(ManifestError::Duplicate { .. })
        ));
    }
}
