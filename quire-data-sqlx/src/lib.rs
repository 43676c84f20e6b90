//! # quire-data-sqlx — SQLite runtime for the Quire data layer
//!
//! This crate executes what [`quire-data`](quire_data) describes. It owns the
//! connection pool, applies migrations, binds manifests into [`Model`]s and
//! runs the revision protocol on top of [SQLx](https://github.com/launchbadge/sqlx).
//!
//! # What's in this crate
//!
//! | Type | Description |
//! |------|-------------|
//! | [`DalConfig`] | Pool, timeout and migration settings, loadable from `application.yaml` |
//! | [`Dal`] | Bounded connection pool, model registry and statement runner |
//! | [`Tx`] | Transaction pinned to one connection; dropped = rolled back |
//! | [`Migrator`] | Plain-SQL migrations with an applied-migrations ledger |
//! | [`Model`] | A manifest bound to a `Dal`: create, get, query, attach |
//! | [`Instance`] | One record with change tracking, save/delete and revision operations |
//! | [`Query`] | Chainable query over a model; `run`, `first`, `count`, `delete`, `paginate`, or `.await` |
//! | [`ModelHandle`] | `static`-friendly model bound lazily to the active `Dal` |
//! | [`SqlxErrorExt`] | Extension trait to convert `sqlx::Error` → `DataError` (`.into_data_error()`) |
//!
//! # Quick start
//!
//! ```ignore
//! use quire_data_sqlx::prelude::*;
//!
//! let dal = Dal::connect(DalConfig::load("dev")?).await?;
//! let things = dal.model(things_manifest()?)?;
//!
//! let thing = things
//!     .create(Record::new().with("label", "x"), CreateOptions::by(user))
//!     .await?;
//! let edited = thing
//!     .new_revision(user, RevisionOptions::new().set("label", "y").tagged(["edit"]))
//!     .await?;
//!
//! let current = things.filter_where(predicate! { "id" => thing.id() }).first().await?;
//! let history = things.filter_where(predicate! { "id" => thing.id() }).include_stale().await?;
//! ```
//!
//! # Transactions
//!
//! Every mutating operation has an `_in` variant taking a [`Tx`]; all of its
//! statements then run on the transaction's connection. Revision operations
//! without a caller transaction open and commit their own.
//!
//! ```ignore
//! let mut tx = dal.begin().await?;
//! let author = authors.create_in(&mut tx, author_record, CreateOptions::default()).await?;
//! let book = books.create_in(&mut tx, book_record, CreateOptions::by(user)).await?;
//! books.attach_in(&mut tx, "authors", &book, &author).await?;
//! tx.commit().await?;
//! ```
//!
//! # Error bridging
//!
//! Due to Rust's orphan rules, `From<sqlx::Error> for DataError` can't be
//! implemented here. Use the [`SqlxErrorExt`] trait instead:
//!
//! ```ignore
//! use quire_data_sqlx::SqlxErrorExt;
//!
//! let rows = sqlx::query("SELECT ...")
//!     .fetch_all(dal.pool())
//!     .await
//!     .map_err(|e| e.into_data_error())?;
//! ```

pub mod config;
pub mod dal;
pub mod error;
pub mod handle;
pub mod instance;
pub mod migrate;
pub mod model;
pub mod query;
mod relation;
pub mod revision;
mod row;
pub mod tx;

pub use config::DalConfig;
pub use dal::Dal;
pub use error::{SqlxErrorExt, SqlxResult};
pub use handle::ModelHandle;
pub use instance::{Instance, Related};
pub use migrate::{Migration, Migrator};
pub use model::{CreateOptions, Model};
pub use query::Query;
pub use revision::{RevisionMeta, RevisionOptions};
pub use tx::Tx;

/// Re-exports of the most commonly used types from both `quire-data` and this crate.
pub mod prelude {
    pub use crate::{
        CreateOptions, Dal, DalConfig, Instance, Migration, Migrator, Model, ModelHandle, Query,
        Related, RevisionOptions, SqlxErrorExt, Tx,
    };
    pub use quire_data::prelude::*;
}
