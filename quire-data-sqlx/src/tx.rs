//! Transaction wrapper.
//!
//! Every mutating operation has an `_in` variant taking a [`Tx`], so several
//! operations can share one transaction:
//!
//! ```ignore
//! let mut tx = dal.begin().await?;
//! let book = books.create_in(&mut tx, record, CreateOptions::default()).await?;
//! books.attach_in(&mut tx, "authors", &book, &author).await?;
//! tx.commit().await?;
//! ```
//!
//! Dropping a `Tx` without committing rolls it back.

use std::ops::{Deref, DerefMut};

use quire_data::DataError;
use sqlx::{Sqlite, SqliteConnection, Transaction};

use crate::error::SqlxErrorExt;

/// A wrapper around a SQLx [`Transaction`] on the DAL's pool.
#[derive(Debug)]
pub struct Tx<'a>(pub Transaction<'a, Sqlite>);

impl<'a> Deref for Tx<'a> {
    type Target = Transaction<'a, Sqlite>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'a> DerefMut for Tx<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<'a> Tx<'a> {
    /// Unwraps the `Tx` into the inner `Transaction`.
    pub fn into_inner(self) -> Transaction<'a, Sqlite> {
        self.0
    }

    /// Returns a mutable reference to the underlying connection.
    pub fn as_mut(&mut self) -> &mut SqliteConnection {
        &mut self.0
    }

    pub async fn commit(self) -> Result<(), DataError> {
        self.0.commit().await.map_err(SqlxErrorExt::into_data_error)
    }

    pub async fn rollback(self) -> Result<(), DataError> {
        self.0.rollback().await.map_err(SqlxErrorExt::into_data_error)
    }
}
