use std::future::IntoFuture;

use futures_util::future::BoxFuture;
use quire_data::manifest::ID;
use quire_data::{
    DataError, JoinOptions, Page, Pageable, Predicate, QueryBuilder, QueryError, Value,
};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use crate::error::SqlxErrorExt;
use crate::instance::Instance;
use crate::model::Model;
use crate::relation::load_joins;
use crate::row::{decode_row, decode_value};
use crate::tx::Tx;

/// A query over one model, executed by one of its terminal methods or by
/// awaiting it directly.
///
/// ```ignore
/// let recent = things
///     .filter_where(predicate! { "label" => ops::contains_any(["a", "b"]) })
///     .order_by("revisionDate", false)
///     .limit(10)
///     .await?;
/// ```
///
/// A query that can never match, such as one filtering on `in([])`,
/// returns its empty result without sending a statement.
#[derive(Debug, Clone)]
pub struct Query {
    model: Model,
    builder: QueryBuilder,
}

impl Query {
    pub(crate) fn new(model: Model, builder: QueryBuilder) -> Self {
        Self { model, builder }
    }

    pub fn builder(&self) -> &QueryBuilder {
        &self.builder
    }

    fn map(mut self, f: impl FnOnce(QueryBuilder) -> QueryBuilder) -> Self {
        self.builder = f(self.builder);
        self
    }

    pub fn filter_where(self, predicate: impl Into<Predicate>) -> Self {
        self.map(|b| b.filter_where(predicate))
    }

    pub fn and(self, predicate: impl Into<Predicate>) -> Self {
        self.map(|b| b.and(predicate))
    }

    pub fn or(self, predicate: impl Into<Predicate>) -> Self {
        self.map(|b| b.or(predicate))
    }

    pub fn where_in<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.map(|b| b.where_in(field, values))
    }

    pub fn order_by(self, field: &str, ascending: bool) -> Self {
        self.map(|b| b.order_by(field, ascending))
    }

    pub fn limit(self, limit: u64) -> Self {
        self.map(|b| b.limit(limit))
    }

    pub fn offset(self, offset: u64) -> Self {
        self.map(|b| b.offset(offset))
    }

    pub fn include_stale(self) -> Self {
        self.map(QueryBuilder::include_stale)
    }

    pub fn include_deleted(self) -> Self {
        self.map(QueryBuilder::include_deleted)
    }

    pub fn include_sensitive<I, S>(self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.map(|b| b.include_sensitive(fields))
    }

    pub fn get_join(self, relation: &str) -> Self {
        self.map(|b| b.get_join(relation))
    }

    pub fn get_join_with(self, relation: &str, options: JoinOptions) -> Self {
        self.map(|b| b.get_join_with(relation, options))
    }

    pub async fn run(&self) -> Result<Vec<Instance>, DataError> {
        self.run_on(None).await
    }

    pub async fn run_in(&self, tx: &mut Tx<'_>) -> Result<Vec<Instance>, DataError> {
        self.run_on(Some(tx.as_mut())).await
    }

    async fn run_on(&self, mut conn: Option<&mut SqliteConnection>) -> Result<Vec<Instance>, DataError> {
        if self.builder.is_unsatisfiable() {
            return Ok(Vec::new());
        }
        let statement = self.builder.build_select()?;
        let rows = self
            .model
            .dal()
            .fetch_all(conn.as_deref_mut(), &statement)
            .await?;
        let fields = self.builder.select_fields();
        let mut instances = rows
            .iter()
            .map(|row| {
                let record = decode_row(row, &fields, 0)?;
                Ok(Instance::loaded(self.model.clone(), record))
            })
            .collect::<Result<Vec<_>, DataError>>()?;

        load_joins(
            &self.model,
            &mut instances,
            self.builder.joins(),
            self.builder.visibility(),
            conn,
        )
        .await?;
        Ok(instances)
    }

    /// The first matching row, if any.
    pub async fn first(&self) -> Result<Option<Instance>, DataError> {
        self.first_on(None).await
    }

    pub async fn first_in(&self, tx: &mut Tx<'_>) -> Result<Option<Instance>, DataError> {
        self.first_on(Some(tx.as_mut())).await
    }

    pub(crate) async fn first_on(
        &self,
        conn: Option<&mut SqliteConnection>,
    ) -> Result<Option<Instance>, DataError> {
        let query = self.clone().limit(1);
        Ok(query.run_on(conn).await?.into_iter().next())
    }

    /// Number of matching rows. Ordering and paging are ignored.
    pub async fn count(&self) -> Result<u64, DataError> {
        self.count_on(None).await
    }

    pub async fn count_in(&self, tx: &mut Tx<'_>) -> Result<u64, DataError> {
        self.count_on(Some(tx.as_mut())).await
    }

    async fn count_on(&self, conn: Option<&mut SqliteConnection>) -> Result<u64, DataError> {
        if self.builder.is_unsatisfiable() {
            return Ok(0);
        }
        let statement = self.builder.clone().unpaged().build_count()?;
        let rows = self.model.dal().fetch_all(conn, &statement).await?;
        let count = match rows.first() {
            Some(row) => row
                .try_get::<i64, _>(0)
                .map_err(SqlxErrorExt::into_data_error)?,
            None => 0,
        };
        Ok(count.max(0) as u64)
    }

    /// Delete every matching record, returning the number of rows affected.
    ///
    /// Plain models lose the rows. On revisioned models every revision of
    /// each matching record is flagged deleted instead.
    pub async fn delete(&self) -> Result<u64, DataError> {
        self.delete_on(None).await
    }

    pub async fn delete_in(&self, tx: &mut Tx<'_>) -> Result<u64, DataError> {
        self.delete_on(Some(tx.as_mut())).await
    }

    async fn delete_on(&self, conn: Option<&mut SqliteConnection>) -> Result<u64, DataError> {
        if self.builder.is_unsatisfiable() {
            return Ok(0);
        }
        let builder = self.builder.clone().unpaged();
        let statement = if self.model.manifest().has_revisions() {
            builder.build_soft_delete()?
        } else {
            builder.build_delete()?
        };
        let affected = self.model.dal().execute(conn, &statement).await?;
        tracing::debug!(table = self.model.table_name(), affected, "bulk delete");
        Ok(affected)
    }

    /// Add `delta` to `field` on every matching row, returning each row's
    /// logical id and new value.
    ///
    /// Revisioned rows are changed in place; no revision is written.
    pub async fn increment(&self, field: &str, delta: impl Into<Value>) -> Result<Vec<(Uuid, Value)>, DataError> {
        self.increment_on(None, field, delta.into()).await
    }

    pub async fn increment_in(
        &self,
        tx: &mut Tx<'_>,
        field: &str,
        delta: impl Into<Value>,
    ) -> Result<Vec<(Uuid, Value)>, DataError> {
        self.increment_on(Some(tx.as_mut()), field, delta.into())
            .await
    }

    /// Subtract `delta` from `field` on every matching row.
    pub async fn decrement(&self, field: &str, delta: impl Into<Value>) -> Result<Vec<(Uuid, Value)>, DataError> {
        let delta = negate(field, delta.into())?;
        self.increment_on(None, field, delta).await
    }

    pub async fn decrement_in(
        &self,
        tx: &mut Tx<'_>,
        field: &str,
        delta: impl Into<Value>,
    ) -> Result<Vec<(Uuid, Value)>, DataError> {
        let delta = negate(field, delta.into())?;
        self.increment_on(Some(tx.as_mut()), field, delta).await
    }

    async fn increment_on(
        &self,
        conn: Option<&mut SqliteConnection>,
        field: &str,
        delta: Value,
    ) -> Result<Vec<(Uuid, Value)>, DataError> {
        // Built first so an unknown or non-numeric field is reported even
        // when no row can match.
        let statement = self.builder.clone().unpaged().build_increment(field, delta)?;
        if self.builder.is_unsatisfiable() {
            return Ok(Vec::new());
        }
        let manifest = self.model.manifest();
        let (Some(id_def), Some(def)) = (manifest.field(ID), manifest.field(field)) else {
            return Ok(Vec::new());
        };
        let rows = self.model.dal().fetch_all(conn, &statement).await?;
        rows.iter()
            .map(|row| {
                let id = decode_value(row, 0, id_def)?
                    .as_uuid()
                    .unwrap_or_default();
                Ok((id, decode_value(row, 1, def)?))
            })
            .collect()
    }

    /// One page of results plus the total count. The page's sort, when
    /// given, replaces the query's own ordering.
    pub async fn paginate(&self, pageable: &Pageable) -> Result<Page<Instance>, DataError> {
        self.paginate_on(None, pageable).await
    }

    pub async fn paginate_in(&self, tx: &mut Tx<'_>, pageable: &Pageable) -> Result<Page<Instance>, DataError> {
        self.paginate_on(Some(tx.as_mut()), pageable).await
    }

    async fn paginate_on(
        &self,
        mut conn: Option<&mut SqliteConnection>,
        pageable: &Pageable,
    ) -> Result<Page<Instance>, DataError> {
        let total = self.count_on(conn.as_deref_mut()).await?;
        let builder = match pageable.sort_order() {
            Some((field, ascending)) => self.builder.clone().unpaged().order_by(field, ascending),
            None => self.builder.clone(),
        };
        let builder = builder.limit(pageable.size).offset(pageable.offset());
        let content = Query::new(self.model.clone(), builder).run_on(conn).await?;
        Ok(Page::new(content, pageable, total))
    }
}

fn negate(field: &str, delta: Value) -> Result<Value, DataError> {
    match delta {
        Value::Int(i) => Ok(Value::Int(-i)),
        Value::Float(f) => Ok(Value::Float(-f)),
        other => Err(QueryError::InvalidOperator {
            field: field.to_string(),
            op: "decrement",
            reason: format!("delta must be numeric, got {}", other.type_name()),
        }
        .into()),
    }
}

impl IntoFuture for Query {
    type Output = Result<Vec<Instance>, DataError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.run().await })
    }
}
