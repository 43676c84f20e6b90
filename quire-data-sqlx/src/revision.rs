//! Append-only revision history for revisioned models.
//!
//! Every record of a revisioned table is a chain of rows sharing one logical
//! `id`. Exactly one of them is current (`old_rev_of IS NULL` and not
//! deleted); older rows point `old_rev_of` at the logical id. A new revision
//! retires the current row with a conditional UPDATE that doubles as the
//! optimistic staleness check, then inserts the new current row, both on the
//! same transaction.

use chrono::{DateTime, SubsecRound, Utc};
use quire_data::manifest::{
    ID, OLD_REVISION_OF, REVISION_DATE, REVISION_DELETED, REVISION_ID, REVISION_TAGS,
    REVISION_USER,
};
use quire_data::write::{build_flag_deleted, build_insert, build_mark_historical};
use quire_data::{
    DataError, FromValue, ManifestError, Predicate, QueryBuilder, Record, ValidationError, Value,
};
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::instance::{validate_record, Instance};
use crate::model::Model;
use crate::row::decode_row;
use crate::tx::Tx;

/// Tag of the revision written by [`Instance::delete_all_revisions`].
pub const DELETE_TAG: &str = "delete";

/// Options for [`Instance::new_revision`].
#[derive(Debug, Clone, Default)]
pub struct RevisionOptions {
    pub tags: Vec<String>,
    /// Field values that differ in the new revision.
    pub changes: Record,
}

impl RevisionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tagged<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.changes.insert(field, value);
        self
    }
}

/// Revision metadata of one row.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionMeta {
    pub revision_id: Uuid,
    pub user: Uuid,
    pub date: DateTime<Utc>,
    pub tags: Vec<String>,
    pub deleted: bool,
    pub old_revision_of: Option<Uuid>,
}

impl RevisionMeta {
    /// Whether this row is the current revision of its record.
    pub fn is_current(&self) -> bool {
        self.old_revision_of.is_none() && !self.deleted
    }

    fn from_record(record: &Record) -> Option<Self> {
        let tags = record
            .get(REVISION_TAGS)
            .and_then(Vec::<String>::from_value)
            .unwrap_or_default();
        Some(Self {
            revision_id: record.get(REVISION_ID)?.as_uuid()?,
            user: record.get(REVISION_USER)?.as_uuid()?,
            date: record
                .get(REVISION_DATE)
                .and_then(DateTime::<Utc>::from_value)?,
            tags,
            deleted: record
                .get(REVISION_DELETED)
                .and_then(Value::as_bool)
                .unwrap_or(false),
            old_revision_of: record.get(OLD_REVISION_OF).and_then(Value::as_uuid),
        })
    }
}

/// Revision columns of a fresh current row.
fn stamp(record: &mut Record, user: Uuid, tags: Vec<String>) {
    record.insert(REVISION_ID, Uuid::new_v4());
    record.insert(REVISION_USER, user);
    record.insert(REVISION_DATE, Utc::now().trunc_subsecs(6));
    record.insert(REVISION_TAGS, tags);
    record.insert(REVISION_DELETED, false);
    record.insert(OLD_REVISION_OF, Value::Null);
}

fn reject_revision_fields(record: &Record) -> Result<(), DataError> {
    let managed = [
        REVISION_ID,
        REVISION_USER,
        REVISION_DATE,
        REVISION_TAGS,
        REVISION_DELETED,
        OLD_REVISION_OF,
    ];
    match record.fields().find(|f| managed.contains(f)) {
        Some(field) => Err(ValidationError::new(field, "is managed by the revision engine").into()),
        None => Ok(()),
    }
}

fn ensure_revisioned(model: &Model) -> Result<(), DataError> {
    if model.manifest().has_revisions() {
        return Ok(());
    }
    Err(ManifestError::invalid(model.table_name(), "table does not keep revisions").into())
}

impl Model {
    /// Insert the first revision of a new record, authored by `user`.
    pub async fn create_first_revision(
        &self,
        user: Uuid,
        record: Record,
        tags: Vec<String>,
    ) -> Result<Instance, DataError> {
        self.create_first_revision_on(None, user, record, tags).await
    }

    pub async fn create_first_revision_in(
        &self,
        tx: &mut Tx<'_>,
        user: Uuid,
        record: Record,
        tags: Vec<String>,
    ) -> Result<Instance, DataError> {
        self.create_first_revision_on(Some(tx.as_mut()), user, record, tags)
            .await
    }

    async fn create_first_revision_on(
        &self,
        conn: Option<&mut SqliteConnection>,
        user: Uuid,
        mut record: Record,
        tags: Vec<String>,
    ) -> Result<Instance, DataError> {
        ensure_revisioned(self)?;
        reject_revision_fields(&record)?;
        stamp(&mut record, user, tags);
        let mut instance = self.new_instance(record);
        instance.save_on(conn).await?;
        tracing::debug!(
            table = self.table_name(),
            id = ?instance.id(),
            revision_id = ?instance.revision().map(|r| r.revision_id),
            "first revision created"
        );
        Ok(instance)
    }

    /// Every revision of record `id`, deleted ones included, oldest first.
    pub async fn history(&self, id: Uuid) -> Result<Vec<Instance>, DataError> {
        ensure_revisioned(self)?;
        self.filter_where(Predicate::new().field(ID, id))
            .include_stale()
            .include_deleted()
            .order_by(REVISION_DATE, true)
            .run()
            .await
    }
}

impl Instance {
    /// Revision metadata, on revisioned models.
    pub fn revision(&self) -> Option<RevisionMeta> {
        if !self.manifest().has_revisions() {
            return None;
        }
        RevisionMeta::from_record(self.record())
    }

    /// Write a new current revision of this record: the current field values
    /// overlaid with `options.changes`, authored by `user`.
    ///
    /// Fails with [`DataError::StaleRevision`] when this instance is no
    /// longer the current revision. The instance itself is left as it was
    /// and is stale afterwards; continue with the returned one.
    pub async fn new_revision(&self, user: Uuid, options: RevisionOptions) -> Result<Instance, DataError> {
        let mut tx = self.model().dal().begin().await?;
        let revision = self.new_revision_on(tx.as_mut(), user, options).await?;
        tx.commit().await?;
        Ok(revision)
    }

    pub async fn new_revision_in(
        &self,
        tx: &mut Tx<'_>,
        user: Uuid,
        options: RevisionOptions,
    ) -> Result<Instance, DataError> {
        self.new_revision_on(tx.as_mut(), user, options).await
    }

    async fn new_revision_on(
        &self,
        conn: &mut SqliteConnection,
        user: Uuid,
        options: RevisionOptions,
    ) -> Result<Instance, DataError> {
        let model = self.model();
        ensure_revisioned(model)?;
        reject_revision_fields(&options.changes)?;
        if options.changes.contains(ID) {
            return Err(ValidationError::new(ID, "cannot change across revisions").into());
        }
        let manifest = model.manifest();
        let dal = model.dal();
        let stored = self
            .original()
            .ok_or_else(|| DataError::NotFound(format!("{} (unsaved)", manifest.table_name())))?;
        let id = stored.get(ID).and_then(Value::as_uuid).unwrap_or_default();
        let previous = stored
            .get(REVISION_ID)
            .and_then(Value::as_uuid)
            .unwrap_or_default();

        let mut record = self.record().clone();
        if manifest.persisted_fields().any(|f| !record.contains(f.name())) {
            let full = load_revision(model, &mut *conn, previous).await?;
            for (field, value) in full.iter() {
                if !record.contains(field) {
                    record.insert(field.clone(), value.clone());
                }
            }
        }
        record.merge(options.changes);
        stamp(&mut record, user, options.tags);
        let validated = validate_record(manifest, &record, true)?;

        let retire = build_mark_historical(manifest, id, previous, dal.dialect());
        if dal.execute(Some(&mut *conn), &retire).await? == 0 {
            return Err(DataError::StaleRevision {
                table: manifest.table_name().to_string(),
                revision_id: previous,
            });
        }
        let insert = build_insert(manifest, &validated, dal.dialect());
        dal.execute(Some(&mut *conn), &insert).await?;

        let revision = Instance::loaded(model.clone(), validated);
        tracing::debug!(
            table = manifest.table_name(),
            %id,
            previous = %previous,
            revision_id = ?revision.revision().map(|r| r.revision_id),
            "revision created"
        );
        Ok(revision)
    }

    /// Soft-delete the whole history of this record: write a revision tagged
    /// `"delete"` authored by `user`, then flag every revision deleted.
    pub async fn delete_all_revisions(&self, user: Uuid) -> Result<(), DataError> {
        self.delete_all_revisions_tagged(user, Vec::<String>::new())
            .await
    }

    /// [`delete_all_revisions`](Self::delete_all_revisions) with extra tags
    /// on the deletion revision.
    pub async fn delete_all_revisions_tagged<I, S>(&self, user: Uuid, tags: I) -> Result<(), DataError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tx = self.model().dal().begin().await?;
        self.delete_all_revisions_on(tx.as_mut(), user, deletion_tags(tags))
            .await?;
        tx.commit().await
    }

    pub async fn delete_all_revisions_in(&self, tx: &mut Tx<'_>, user: Uuid) -> Result<(), DataError> {
        self.delete_all_revisions_on(tx.as_mut(), user, deletion_tags(Vec::<String>::new()))
            .await
    }

    async fn delete_all_revisions_on(
        &self,
        conn: &mut SqliteConnection,
        user: Uuid,
        tags: Vec<String>,
    ) -> Result<(), DataError> {
        let deletion = self
            .new_revision_on(&mut *conn, user, RevisionOptions::new().tagged(tags))
            .await?;
        let model = self.model();
        let id = deletion.id().unwrap_or_default();
        let flag = build_flag_deleted(model.manifest(), id, model.dal().dialect());
        let flagged = model.dal().execute(Some(conn), &flag).await?;
        tracing::debug!(table = model.table_name(), %id, revisions = flagged, "record history deleted");
        Ok(())
    }
}

/// Every persisted field of revision `revision_id`, sensitive ones
/// included. Empty when the row is gone.
async fn load_revision(
    model: &Model,
    conn: &mut SqliteConnection,
    revision_id: Uuid,
) -> Result<Record, DataError> {
    let manifest = model.manifest();
    let sensitive: Vec<&str> = manifest
        .persisted_fields()
        .filter(|f| f.descriptor().is_sensitive())
        .map(|f| f.name())
        .collect();
    let builder = QueryBuilder::new(manifest.clone())
        .filter_where(Predicate::new().field(REVISION_ID, revision_id))
        .include_stale()
        .include_deleted()
        .include_sensitive(sensitive);
    let statement = builder.build_select()?;
    let rows = model.dal().fetch_all(Some(conn), &statement).await?;
    match rows.first() {
        Some(row) => decode_row(row, &builder.select_fields(), 0),
        None => Ok(Record::new()),
    }
}

fn deletion_tags<I, S>(extra: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    std::iter::once(DELETE_TAG.to_string())
        .chain(extra.into_iter().map(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamped_rows_are_current() {
        let mut record = Record::new().with("label", "x");
        let user = Uuid::new_v4();
        stamp(&mut record, user, vec!["create".into()]);
        let meta = RevisionMeta::from_record(&record).unwrap();
        assert_eq!(meta.user, user);
        assert_eq!(meta.tags, vec!["create".to_string()]);
        assert!(meta.is_current());
        assert_eq!(meta.date.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn test_revision_fields_cannot_be_supplied() {
        let record = Record::new().with(REVISION_DELETED, true);
        let err = reject_revision_fields(&record).unwrap_err();
        assert!(matches!(err, DataError::Validation(ref e) if e.field == REVISION_DELETED));
    }

    #[test]
    fn test_deletion_tag_comes_first() {
        assert_eq!(deletion_tags(["gdpr"]), vec!["delete".to_string(), "gdpr".to_string()]);
    }
}
