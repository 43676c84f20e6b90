//! Batch statements for eager relation loading.
//!
//! A relation is loaded with one statement for all source rows, whatever
//! their number. Direct relations filter the target table on its key;
//! relations with a junction table join through it and project the
//! junction's source column first, under [`SOURCE_KEY_ALIAS`].

use crate::error::QueryError;
use crate::manifest::{FieldDef, Manifest, RelationDefinition};
use crate::query::{Dialect, SqlWriter, Statement, Visibility};
use crate::value::Value;

/// Alias of the junction source column in junction-backed statements.
pub const SOURCE_KEY_ALIAS: &str = "__source_key";

const JUNCTION_ALIAS: &str = "j";

/// Select every `target` row related to one of `keys`.
///
/// `keys` should already be deduplicated. Sensitive target fields are not
/// projected.
pub fn build_relation_select(
    relation: &RelationDefinition,
    target: &Manifest,
    keys: &[Value],
    visibility: Visibility,
    order: &[(String, bool)],
    dialect: Dialect,
) -> Result<Statement, QueryError> {
    let table = target.table_name();
    let target_key = target_field(target, relation.target_key())?;
    let fields = relation_fields(relation, target);

    let mut w = SqlWriter::new(dialect);
    w.push("SELECT ");
    match relation.through_table() {
        Some(through) => {
            w.column(JUNCTION_ALIAS, &through.source_column);
            w.push(" AS ");
            w.ident(SOURCE_KEY_ALIAS);
            w.push(", ");
            w.column_list(table, &fields);
            w.push(" FROM ");
            w.ident(&through.table);
            w.push(" AS ");
            w.ident(JUNCTION_ALIAS);
            w.push(" JOIN ");
            w.ident(table);
            w.push(" ON ");
            w.column(table, target_key.column());
            w.push(" = ");
            w.column(JUNCTION_ALIAS, &through.target_column);
            w.push(" WHERE ");
            w.column(JUNCTION_ALIAS, &through.source_column);
        }
        None => {
            w.column_list(table, &fields);
            w.push(" FROM ");
            w.ident(table);
            w.push(" WHERE ");
            w.column(table, target_key.column());
        }
    }
    w.push(" IN (");
    for (idx, key) in keys.iter().enumerate() {
        if idx > 0 {
            w.push(", ");
        }
        w.bind(key.clone());
    }
    w.push(")");

    if target.has_revisions() && !(visibility.include_stale && visibility.include_deleted) {
        w.push(" AND ");
        w.visibility(table, visibility);
    }

    if !order.is_empty() {
        w.push(" ORDER BY ");
        for (idx, (field, asc)) in order.iter().enumerate() {
            if idx > 0 {
                w.push(", ");
            }
            let def = target_field(target, field)?;
            w.column(table, def.column());
            w.push(if *asc { " ASC" } else { " DESC" });
        }
    }
    Ok(w.finish())
}

/// Target fields projected by [`build_relation_select`], in column order.
/// Junction-backed statements put the source key before them.
pub fn relation_fields<'m>(relation: &RelationDefinition, target: &'m Manifest) -> Vec<&'m FieldDef> {
    target
        .persisted_fields()
        .filter(|f| !f.descriptor().is_sensitive() || f.name() == relation.target_key())
        .collect()
}

fn target_field<'m>(target: &'m Manifest, field: &str) -> Result<&'m FieldDef, QueryError> {
    match target.field(field) {
        Some(def) if !def.is_virtual() => Ok(def),
        _ => Err(QueryError::UnknownField {
            table: target.table_name().to_string(),
            field: field.to_string(),
        }),
    }
}
