use std::sync::Arc;

use quire_data::manifest::ID;
use quire_data::write::build_attach;
use quire_data::{
    DataError, Manifest, Predicate, QueryBuilder, QueryError, Record, Value, ValidationError,
};
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::dal::Dal;
use crate::instance::Instance;
use crate::query::Query;
use crate::tx::Tx;

/// Options for [`Model::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Author of the first revision; required on revisioned models.
    pub user: Option<Uuid>,
    /// Tags of the first revision.
    pub tags: Vec<String>,
}

impl CreateOptions {
    pub fn by(user: Uuid) -> Self {
        Self {
            user: Some(user),
            tags: Vec::new(),
        }
    }

    pub fn tagged<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// A manifest bound to a connected [`Dal`]: the entry point for creating,
/// loading and querying records of one table.
#[derive(Clone)]
pub struct Model {
    dal: Dal,
    manifest: Arc<Manifest>,
}

impl Model {
    pub(crate) fn new(dal: Dal, manifest: Arc<Manifest>) -> Self {
        Self { dal, manifest }
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    pub fn dal(&self) -> &Dal {
        &self.dal
    }

    pub fn table_name(&self) -> &str {
        self.manifest.table_name()
    }

    /// An unsaved instance. Nothing is validated until it is saved.
    pub fn new_instance(&self, record: Record) -> Instance {
        Instance::unsaved(self.clone(), record)
    }

    /// Validate and insert `record`. Revisioned models insert a first
    /// revision authored by `options.user`.
    pub async fn create(&self, record: Record, options: CreateOptions) -> Result<Instance, DataError> {
        if self.manifest.has_revisions() {
            let user = self.require_user(&options)?;
            return self.create_first_revision(user, record, options.tags).await;
        }
        self.create_on(None, record).await
    }

    pub async fn create_in(
        &self,
        tx: &mut Tx<'_>,
        record: Record,
        options: CreateOptions,
    ) -> Result<Instance, DataError> {
        if self.manifest.has_revisions() {
            let user = self.require_user(&options)?;
            return self
                .create_first_revision_in(tx, user, record, options.tags)
                .await;
        }
        self.create_on(Some(tx.as_mut()), record).await
    }

    async fn create_on(
        &self,
        conn: Option<&mut SqliteConnection>,
        record: Record,
    ) -> Result<Instance, DataError> {
        let mut instance = self.new_instance(record);
        instance.save_on(conn).await?;
        Ok(instance)
    }

    fn require_user(&self, options: &CreateOptions) -> Result<Uuid, DataError> {
        options.user.ok_or_else(|| {
            ValidationError::new("revisionUser", "is required to create a revisioned record").into()
        })
    }

    /// The visible record with logical id `id`.
    pub async fn get(&self, id: Uuid) -> Result<Instance, DataError> {
        self.get_on(None, id).await
    }

    pub async fn get_in(&self, tx: &mut Tx<'_>, id: Uuid) -> Result<Instance, DataError> {
        self.get_on(Some(tx.as_mut()), id).await
    }

    async fn get_on(&self, conn: Option<&mut SqliteConnection>, id: Uuid) -> Result<Instance, DataError> {
        self.filter_where(Predicate::new().field(ID, id))
            .first_on(conn)
            .await?
            .ok_or_else(|| DataError::not_found(self.table_name(), id))
    }

    pub fn query(&self) -> Query {
        Query::new(self.clone(), QueryBuilder::new(self.manifest.clone()))
    }

    pub fn filter_where(&self, predicate: impl Into<Predicate>) -> Query {
        self.query().filter_where(predicate)
    }

    /// Link `source` to `target` through the junction table of `relation`.
    pub async fn attach(&self, relation: &str, source: &Instance, target: &Instance) -> Result<(), DataError> {
        self.attach_on(None, relation, source, target).await
    }

    pub async fn attach_in(
        &self,
        tx: &mut Tx<'_>,
        relation: &str,
        source: &Instance,
        target: &Instance,
    ) -> Result<(), DataError> {
        self.attach_on(Some(tx.as_mut()), relation, source, target)
            .await
    }

    async fn attach_on(
        &self,
        conn: Option<&mut SqliteConnection>,
        relation: &str,
        source: &Instance,
        target: &Instance,
    ) -> Result<(), DataError> {
        let definition = self.manifest.relation(relation).ok_or_else(|| QueryError::UnknownRelation {
            table: self.table_name().to_string(),
            relation: relation.to_string(),
        })?;
        let through = definition.through_table().ok_or_else(|| QueryError::InvalidOperator {
            field: relation.to_string(),
            op: "attach",
            reason: "relation has no junction table".into(),
        })?;
        let source_key = key_of(source, definition.source_key())?;
        let target_key = key_of(target, definition.target_key())?;
        let statement = build_attach(through, source_key, target_key, self.dal.dialect());
        self.dal.execute(conn, &statement).await?;
        Ok(())
    }
}

fn key_of(instance: &Instance, field: &str) -> Result<Value, DataError> {
    match instance.get_value(field) {
        Some(value) if !value.is_null() => Ok(value.clone()),
        _ => Err(ValidationError::new(field, "is required to link records").into()),
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("table", &self.table_name())
            .field("generation", &self.dal.generation())
            .finish()
    }
}
