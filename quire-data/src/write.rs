//! Statements that write single records: inserts, keyed updates and deletes,
//! the revision transitions and junction inserts.

use uuid::Uuid;

use crate::manifest::{FieldDef, Manifest, Through};
use crate::query::{Dialect, SqlWriter, Statement};
use crate::value::{Record, Value};

/// Insert every persisted field of `record`; absent fields are bound `NULL`.
pub fn build_insert(manifest: &Manifest, record: &Record, dialect: Dialect) -> Statement {
    let fields: Vec<&FieldDef> = manifest.persisted_fields().collect();
    let mut w = SqlWriter::new(dialect);
    w.push("INSERT INTO ");
    w.ident(manifest.table_name());
    w.push(" (");
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            w.push(", ");
        }
        w.ident(field.column());
    }
    w.push(") VALUES (");
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            w.push(", ");
        }
        w.bind(record.get(field.name()).cloned().unwrap_or_default());
    }
    w.push(")");
    w.finish()
}

/// Update the given columns of the row identified by the manifest's row key.
/// On revisioned tables only the current, non-deleted revision matches, so
/// zero affected rows means the revision is stale.
pub fn build_update(
    manifest: &Manifest,
    key: Value,
    changes: &[(&FieldDef, Value)],
    dialect: Dialect,
) -> Statement {
    let mut w = SqlWriter::new(dialect);
    w.push("UPDATE ");
    w.ident(manifest.table_name());
    w.push(" SET ");
    for (idx, (field, value)) in changes.iter().enumerate() {
        if idx > 0 {
            w.push(", ");
        }
        w.ident(field.column());
        w.push(" = ");
        w.bind(value.clone());
    }
    w.push(" WHERE ");
    w.ident(row_key_column(manifest));
    w.push(" = ");
    w.bind(key);
    if manifest.has_revisions() {
        push_current_guard(&mut w);
    }
    w.finish()
}

/// Hard delete of the row identified by the manifest's row key.
pub fn build_delete_row(manifest: &Manifest, key: Value, dialect: Dialect) -> Statement {
    let mut w = SqlWriter::new(dialect);
    w.push("DELETE FROM ");
    w.ident(manifest.table_name());
    w.push(" WHERE ");
    w.ident(row_key_column(manifest));
    w.push(" = ");
    w.bind(key);
    w.finish()
}

/// Mark revision `revision_id` of record `id` historical, provided it is
/// still the current, non-deleted revision. Zero affected rows means the
/// revision is stale.
pub fn build_mark_historical(
    manifest: &Manifest,
    id: Uuid,
    revision_id: Uuid,
    dialect: Dialect,
) -> Statement {
    let mut w = SqlWriter::new(dialect);
    w.push("UPDATE ");
    w.ident(manifest.table_name());
    w.push(" SET ");
    w.ident("old_rev_of");
    w.push(" = ");
    w.bind(Value::Uuid(id));
    w.push(" WHERE ");
    w.ident("rev_id");
    w.push(" = ");
    w.bind(Value::Uuid(revision_id));
    push_current_guard(&mut w);
    w.finish()
}

fn push_current_guard(w: &mut SqlWriter) {
    w.push(" AND ");
    w.ident("old_rev_of");
    w.push(" IS NULL AND ");
    w.ident("rev_deleted");
    w.push(" = ");
    w.bind(Value::Bool(false));
}

/// Flag every revision of record `id` deleted.
pub fn build_flag_deleted(manifest: &Manifest, id: Uuid, dialect: Dialect) -> Statement {
    let mut w = SqlWriter::new(dialect);
    w.push("UPDATE ");
    w.ident(manifest.table_name());
    w.push(" SET ");
    w.ident("rev_deleted");
    w.push(" = ");
    w.bind(Value::Bool(true));
    w.push(" WHERE ");
    w.ident("id");
    w.push(" = ");
    w.bind(Value::Uuid(id));
    w.finish()
}

/// Insert one junction row linking `source` to `target`.
pub fn build_attach(through: &Through, source: Value, target: Value, dialect: Dialect) -> Statement {
    let mut w = SqlWriter::new(dialect);
    w.push("INSERT INTO ");
    w.ident(&through.table);
    w.push(" (");
    w.ident(&through.source_column);
    w.push(", ");
    w.ident(&through.target_column);
    w.push(") VALUES (");
    w.bind(source);
    w.push(", ");
    w.bind(target);
    w.push(")");
    w.finish()
}

fn row_key_column(manifest: &Manifest) -> &str {
    manifest.column_of(manifest.row_key()).unwrap_or("id")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDescriptor;

    fn notes() -> std::sync::Arc<Manifest> {
        Manifest::builder("notes")
            .revisioned()
            .field("body", FieldDescriptor::string())
            .build()
            .unwrap()
    }

    #[test]
    fn test_insert_binds_every_persisted_column() {
        let m = notes();
        let record = Record::new().with("body", "hi");
        let s = build_insert(&m, &record, Dialect::Sqlite);
        assert_eq!(
            s.sql,
            "INSERT INTO \"notes\" (\"id\", \"rev_id\", \"rev_user\", \"rev_date\", \"rev_tags\", \"rev_deleted\", \"old_rev_of\", \"body\") VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        );
        assert_eq!(s.params.len(), 8);
        assert_eq!(s.params[7], Value::Text("hi".into()));
        assert_eq!(s.params[0], Value::Null);
    }

    #[test]
    fn test_updates_target_the_row_key() {
        let m = notes();
        let body = m.field("body").unwrap();
        let rev = Uuid::new_v4();
        let s = build_update(&m, Value::Uuid(rev), &[(body, "x".into())], Dialect::Postgres);
        assert_eq!(
            s.sql,
            "UPDATE \"notes\" SET \"body\" = $1 WHERE \"rev_id\" = $2 AND \"old_rev_of\" IS NULL AND \"rev_deleted\" = $3"
        );
        assert_eq!(s.params[1], Value::Uuid(rev));
        assert_eq!(s.params[2], Value::Bool(false));
    }

    #[test]
    fn test_plain_updates_have_no_revision_guard() {
        let m = Manifest::builder("tags")
            .field("name", FieldDescriptor::string())
            .build()
            .unwrap();
        let name = m.field("name").unwrap();
        let s = build_update(&m, Value::Int(1), &[(name, "x".into())], Dialect::Sqlite);
        assert_eq!(s.sql, "UPDATE \"tags\" SET \"name\" = ? WHERE \"id\" = ?");
    }

    #[test]
    fn test_mark_historical_is_conditional() {
        let m = notes();
        let s = build_mark_historical(&m, Uuid::nil(), Uuid::nil(), Dialect::Sqlite);
        assert_eq!(
            s.sql,
            "UPDATE \"notes\" SET \"old_rev_of\" = ? WHERE \"rev_id\" = ? AND \"old_rev_of\" IS NULL AND \"rev_deleted\" = ?"
        );
    }

    #[test]
    fn test_junction_insert() {
        let through = Through {
            table: "book_authors".into(),
            source_column: "book_id".into(),
            target_column: "author_id".into(),
        };
        let s = build_attach(&through, Value::Int(1), Value::Int(2), Dialect::Sqlite);
        assert_eq!(
            s.sql,
            "INSERT INTO \"book_authors\" (\"book_id\", \"author_id\") VALUES (?, ?)"
        );
    }
}
