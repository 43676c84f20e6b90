//! Driver-independent core of the Quire data access layer.
//!
//! Manifests describe entities, [`FieldDescriptor`]s validate their fields,
//! predicate literals and the operator bag in [`ops`] describe filters, and
//! [`QueryBuilder`] renders them to parameterized SQL. Execution lives in
//! `quire-data-sqlx`.

pub mod error;
pub mod manifest;
pub mod ops;
pub mod page;
pub mod predicate;
pub mod query;
pub mod registry;
pub mod relation;
pub mod schema;
pub mod value;
pub mod write;

pub use error::{DataError, ManifestError, QueryError, ValidationError};
pub use manifest::{
    Cardinality, FieldDef, Manifest, ManifestBuilder, ManifestSource, RecordFn,
    RelationDefinition, RelationTarget, Through,
};
pub use page::{Page, Pageable};
pub use predicate::{Clause, Op, Predicate};
pub use query::{Dialect, JoinOptions, JoinSpec, QueryBuilder, Statement, Visibility};
pub use registry::ModelRegistry;
pub use schema::{DefaultPolicy, FieldDescriptor, FieldKind, Format};
pub use value::{Column, FromValue, Record, Value};

pub mod prelude {
    //! Re-exports of the most commonly used data types.
    pub use crate::ops;
    pub use crate::predicate;
    pub use crate::{
        Column, DataError, FieldDescriptor, FieldKind, Format, JoinOptions, Manifest,
        Page, Pageable, Predicate, Record, RelationDefinition, RelationTarget, Value,
    };
}
