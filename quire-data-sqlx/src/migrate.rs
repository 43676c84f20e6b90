//! Plain-SQL migrations with an applied-migrations ledger.
//!
//! Migrations are applied in name order. Each pending migration runs in its
//! own transaction together with its ledger row, so a failing file leaves
//! neither partial schema changes nor a ledger entry behind.

use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use quire_data::value::format_date;
use quire_data::{DataError, Statement, Value};
use sqlx::Row;

use crate::dal::Dal;
use crate::error::SqlxErrorExt;

pub const LEDGER_TABLE: &str = "_quire_migrations";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub name: String,
    pub sql: String,
}

impl Migration {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Migrator {
    migrations: Vec<Migration>,
}

impl Migrator {
    pub fn new(mut migrations: Vec<Migration>) -> Self {
        migrations.sort_by(|a, b| a.name.cmp(&b.name));
        Self { migrations }
    }

    /// Read every `*.sql` file of `dir`, named after the file.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, DataError> {
        let dir = dir.as_ref();
        let read_error = |e: std::io::Error| {
            DataError::Config(format!("cannot read migrations from {}: {e}", dir.display()))
        };
        let mut migrations = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(read_error)? {
            let path = entry.map_err(read_error)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let sql = std::fs::read_to_string(&path).map_err(read_error)?;
            migrations.push(Migration::new(name, sql));
        }
        Ok(Self::new(migrations))
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Apply every migration missing from the ledger, returning the names
    /// of those applied.
    pub async fn run(&self, dal: &Dal) -> Result<Vec<String>, DataError> {
        dal.execute_raw(&format!(
            "CREATE TABLE IF NOT EXISTS \"{LEDGER_TABLE}\" (name TEXT PRIMARY KEY NOT NULL, applied_at TEXT NOT NULL)"
        ))
        .await?;

        let ledger = Statement {
            sql: format!("SELECT name FROM \"{LEDGER_TABLE}\""),
            params: Vec::new(),
        };
        let applied: HashSet<String> = dal
            .fetch_all(None, &ledger)
            .await?
            .iter()
            .map(|row| row.try_get::<String, _>(0))
            .collect::<Result<_, _>>()
            .map_err(SqlxErrorExt::into_data_error)?;

        let mut newly_applied = Vec::new();
        for migration in self.migrations.iter().filter(|m| !applied.contains(&m.name)) {
            apply(dal, migration)
                .await
                .map_err(|source| DataError::Migration {
                    name: migration.name.clone(),
                    source: Box::new(source),
                })?;
            tracing::info!(migration = %migration.name, "migration applied");
            newly_applied.push(migration.name.clone());
        }
        Ok(newly_applied)
    }
}

async fn apply(dal: &Dal, migration: &Migration) -> Result<(), DataError> {
    let mut tx = dal.begin().await?;
    dal.execute_raw_on(tx.as_mut(), &migration.sql).await?;
    let record = Statement {
        sql: format!("INSERT INTO \"{LEDGER_TABLE}\" (name, applied_at) VALUES (?, ?)"),
        params: vec![
            Value::Text(migration.name.clone()),
            Value::Text(format_date(&Utc::now())),
        ],
    };
    dal.execute(Some(tx.as_mut()), &record).await?;
    tx.commit().await
}
