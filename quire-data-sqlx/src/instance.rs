use std::collections::BTreeMap;
use std::sync::Arc;

use quire_data::manifest::{
    FieldDef, ID, OLD_REVISION_OF, REVISION_DATE, REVISION_DELETED, REVISION_ID, REVISION_TAGS,
    REVISION_USER,
};
use quire_data::write::{build_delete_row, build_flag_deleted, build_insert, build_update};
use quire_data::{
    Column, DataError, FromValue, Manifest, QueryError, Record, ValidationError, Value,
};
use serde::de::DeserializeOwned;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::model::Model;
use crate::tx::Tx;

const REVISION_FIELDS: [&str; 6] = [
    REVISION_ID,
    REVISION_USER,
    REVISION_DATE,
    REVISION_TAGS,
    REVISION_DELETED,
    OLD_REVISION_OF,
];

/// Rows attached to an instance by an eager join.
#[derive(Debug, Clone)]
pub enum Related {
    One(Option<Box<Instance>>),
    Many(Vec<Instance>),
}

impl Related {
    pub fn as_one(&self) -> Option<&Instance> {
        match self {
            Related::One(one) => one.as_deref(),
            Related::Many(many) => many.first(),
        }
    }

    pub fn as_many(&self) -> &[Instance] {
        match self {
            Related::One(Some(one)) => std::slice::from_ref(one.as_ref()),
            Related::One(None) => &[],
            Related::Many(many) => many,
        }
    }
}

/// One record of a model, either loaded from the store or not yet saved.
///
/// Field values live in a [`Record`]; the values last read from or written
/// to the store are kept aside, and saving writes only the fields that
/// differ from them.
#[derive(Clone)]
pub struct Instance {
    model: Model,
    values: Record,
    original: Option<Record>,
    related: BTreeMap<String, Related>,
}

impl Instance {
    pub(crate) fn unsaved(model: Model, values: Record) -> Self {
        let mut instance = Self {
            model,
            values,
            original: None,
            related: BTreeMap::new(),
        };
        instance.generate_virtual_values();
        instance
    }

    pub(crate) fn loaded(model: Model, record: Record) -> Self {
        let mut instance = Self {
            model,
            values: record.clone(),
            original: Some(record),
            related: BTreeMap::new(),
        };
        instance.generate_virtual_values();
        instance
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        self.model.manifest()
    }

    /// Whether the instance has never been saved.
    pub fn is_new(&self) -> bool {
        self.original.is_none()
    }

    /// Logical id, once assigned.
    pub fn id(&self) -> Option<Uuid> {
        self.values.get(ID).and_then(Value::as_uuid)
    }

    pub fn get_value(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn get<T: FromValue>(&self, column: Column<T>) -> Option<T> {
        self.values.get(column.name()).and_then(T::from_value)
    }

    pub fn record(&self) -> &Record {
        &self.values
    }

    /// Set a declared field. Setting a value equal to the current one is not
    /// a change.
    pub fn set_value(&mut self, field: &str, value: impl Into<Value>) -> Result<(), DataError> {
        let manifest = self.model.manifest();
        let def = manifest.field(field).ok_or_else(|| QueryError::UnknownField {
            table: manifest.table_name().to_string(),
            field: field.to_string(),
        })?;
        if def.is_virtual() {
            return Err(ValidationError::new(field, "is computed and cannot be set").into());
        }
        if manifest.has_revisions() && REVISION_FIELDS.contains(&field) {
            return Err(ValidationError::new(field, "is managed by the revision engine").into());
        }
        let value = value.into();
        if field == ID && !self.is_new() && self.values.get(ID) != Some(&value) {
            return Err(ValidationError::new(field, "cannot change on a stored record").into());
        }
        if self.values.get(field) != Some(&value) {
            self.values.insert(field, value);
        }
        Ok(())
    }

    pub fn set<T: Into<Value>>(&mut self, column: Column<T>, value: impl Into<T>) -> Result<(), DataError> {
        let value: T = value.into();
        self.set_value(column.name(), value)
    }

    /// Mutable access to an object field for in-place edits. Edits are
    /// picked up by the next save.
    pub fn json_mut(&mut self, field: &str) -> Option<&mut serde_json::Value> {
        match self.values.get_mut(field) {
            Some(Value::Json(json)) => Some(json),
            _ => None,
        }
    }

    /// Mutable access to an array field for in-place edits.
    pub fn array_mut(&mut self, field: &str) -> Option<&mut Vec<Value>> {
        match self.values.get_mut(field) {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        }
    }

    /// Persisted fields that differ from the stored values, compared
    /// structurally. Every set field of a new instance counts as changed.
    pub fn changed_fields(&self) -> Vec<String> {
        let manifest = self.model.manifest();
        manifest
            .persisted_fields()
            .filter(|f| {
                let current = self.values.get(f.name()).unwrap_or(&Value::Null);
                match &self.original {
                    None => !current.is_null(),
                    Some(original) => original.get(f.name()).unwrap_or(&Value::Null) != current,
                }
            })
            .map(|f| f.name().to_string())
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        !self.changed_fields().is_empty()
    }

    /// Recompute every virtual field from the current values.
    pub fn generate_virtual_values(&mut self) {
        let virtuals = self.model.manifest().virtual_values(&self.values);
        self.values.merge(virtuals);
    }

    /// Invoke a named behavior declared on the manifest.
    pub fn call(&self, method: &str) -> Result<Value, DataError> {
        let manifest = self.model.manifest();
        let behavior = manifest.method(method).ok_or_else(|| QueryError::UnknownMethod {
            table: manifest.table_name().to_string(),
            method: method.to_string(),
        })?;
        Ok(behavior(&self.values))
    }

    /// Rows loaded for `relation` by `get_join`.
    pub fn related(&self, relation: &str) -> Option<&Related> {
        self.related.get(relation)
    }

    pub(crate) fn set_related(&mut self, relation: &str, related: Related) {
        self.related.insert(relation.to_string(), related);
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.values.to_json()
    }

    /// Deserialize the instance into a caller-defined struct.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T, DataError> {
        self.values.to_typed().map_err(DataError::database)
    }

    pub(crate) fn original(&self) -> Option<&Record> {
        self.original.as_ref()
    }

    /// Insert a new instance, or write the changed fields of a stored one.
    /// Fields are validated first; nothing is sent when validation fails or
    /// nothing changed.
    pub async fn save(&mut self) -> Result<(), DataError> {
        self.save_on(None).await
    }

    pub async fn save_in(&mut self, tx: &mut Tx<'_>) -> Result<(), DataError> {
        self.save_on(Some(tx.as_mut())).await
    }

    pub(crate) async fn save_on(&mut self, conn: Option<&mut SqliteConnection>) -> Result<(), DataError> {
        let manifest = self.model.manifest().clone();
        let dal = self.model.dal().clone();
        let validated = if self.is_new() {
            validate_record(&manifest, &self.values, true)?
        } else {
            validate_present(&manifest, &self.values)?
        };

        match &self.original {
            None => {
                let statement = build_insert(&manifest, &validated, dal.dialect());
                dal.execute(conn, &statement).await?;
                tracing::debug!(table = manifest.table_name(), "record inserted");
            }
            Some(original) => {
                let changes = diff(&manifest, &validated, original);
                if changes.is_empty() {
                    return Ok(());
                }
                let key = original.get(manifest.row_key()).cloned().unwrap_or_default();
                let statement = build_update(&manifest, key.clone(), &changes, dal.dialect());
                if dal.execute(conn, &statement).await? == 0 {
                    if manifest.has_revisions() {
                        return Err(DataError::StaleRevision {
                            table: manifest.table_name().to_string(),
                            revision_id: key.as_uuid().unwrap_or_default(),
                        });
                    }
                    return Err(DataError::not_found(manifest.table_name(), key.key_string()));
                }
                tracing::debug!(
                    table = manifest.table_name(),
                    fields = changes.len(),
                    "record updated"
                );
            }
        }
        self.accept(validated);
        Ok(())
    }

    /// Delete the record. Plain models delete the row; revisioned models
    /// flag every revision of the record deleted.
    pub async fn delete(&self) -> Result<(), DataError> {
        self.delete_on(None).await
    }

    pub async fn delete_in(&self, tx: &mut Tx<'_>) -> Result<(), DataError> {
        self.delete_on(Some(tx.as_mut())).await
    }

    async fn delete_on(&self, conn: Option<&mut SqliteConnection>) -> Result<(), DataError> {
        let manifest = self.model.manifest();
        let dal = self.model.dal();
        let original = self
            .original
            .as_ref()
            .ok_or_else(|| DataError::NotFound(format!("{} (unsaved)", manifest.table_name())))?;
        let id = original.get(ID).and_then(Value::as_uuid).unwrap_or_default();
        let statement = if manifest.has_revisions() {
            build_flag_deleted(manifest, id, dal.dialect())
        } else {
            build_delete_row(manifest, Value::Uuid(id), dal.dialect())
        };
        if dal.execute(conn, &statement).await? == 0 {
            return Err(DataError::not_found(manifest.table_name(), id));
        }
        tracing::debug!(table = manifest.table_name(), %id, "record deleted");
        Ok(())
    }

    /// Adopt `record` as both the current and the stored values.
    pub(crate) fn accept(&mut self, record: Record) {
        self.values = record.clone();
        self.original = Some(record);
        self.generate_virtual_values();
    }
}

/// Validate every persisted field of `values`, filling defaults for missing
/// values when `fill_defaults` is set. Unknown fields are rejected.
pub(crate) fn validate_record(
    manifest: &Manifest,
    values: &Record,
    fill_defaults: bool,
) -> Result<Record, DataError> {
    if let Some(unknown) = values.fields().find(|f| manifest.field(f).is_none()) {
        return Err(QueryError::UnknownField {
            table: manifest.table_name().to_string(),
            field: unknown.to_string(),
        }
        .into());
    }
    let mut validated = Record::new();
    for field in manifest.persisted_fields() {
        let mut value = values.get(field.name()).cloned().unwrap_or_default();
        if value.is_null() && fill_defaults {
            if let Some(default) = field.descriptor().default_policy().produce() {
                value = default;
            }
        }
        let value = field.descriptor().validate(field.name(), value)?;
        validated.insert(field.name(), value);
    }
    Ok(validated)
}

/// Validate the persisted fields present in `values` of a stored record.
/// Fields left out of the projection that loaded it are not checked.
pub(crate) fn validate_present(manifest: &Manifest, values: &Record) -> Result<Record, DataError> {
    let mut validated = Record::new();
    for field in manifest.persisted_fields() {
        if let Some(value) = values.get(field.name()) {
            let value = field.descriptor().validate(field.name(), value.clone())?;
            validated.insert(field.name(), value);
        }
    }
    Ok(validated)
}

fn diff<'m>(manifest: &'m Manifest, validated: &Record, original: &Record) -> Vec<(&'m FieldDef, Value)> {
    manifest
        .persisted_fields()
        .filter_map(|field| {
            let new = validated.get(field.name())?;
            let old = original.get(field.name()).unwrap_or(&Value::Null);
            (new != old).then(|| (field, new.clone()))
        })
        .collect()
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("table", &self.model.table_name())
            .field("values", &self.values)
            .field("is_new", &self.is_new())
            .field("related", &self.related)
            .finish()
    }
}
