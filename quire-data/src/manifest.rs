//! Model manifests: the declarative description of one entity.
//!
//! A manifest is built once (typically inside a `LazyLock`) and never mutated
//! afterwards. Reserved fields are added by the builder:
//!
//! | Field             | Column        | Present on        |
//! |-------------------|---------------|-------------------|
//! | `id`              | `id`          | every manifest    |
//! | `revisionId`      | `rev_id`      | revisioned only   |
//! | `revisionUser`    | `rev_user`    | revisioned only   |
//! | `revisionDate`    | `rev_date`    | revisioned only   |
//! | `revisionTags`    | `rev_tags`    | revisioned only   |
//! | `revisionDeleted` | `rev_deleted` | revisioned only   |
//! | `oldRevisionOf`   | `old_rev_of`  | revisioned only   |
//!
//! On revisioned tables `rev_id` identifies a row and `id` is the logical
//! identifier shared by every revision of the record.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use convert_case::{Case, Casing};
use uuid::Uuid;

use crate::error::ManifestError;
use crate::query::is_valid_identifier;
use crate::schema::{FieldDescriptor, FieldKind};
use crate::value::{Record, Value};

pub const ID: &str = "id";
pub const REVISION_ID: &str = "revisionId";
pub const REVISION_USER: &str = "revisionUser";
pub const REVISION_DATE: &str = "revisionDate";
pub const REVISION_TAGS: &str = "revisionTags";
pub const REVISION_DELETED: &str = "revisionDeleted";
pub const OLD_REVISION_OF: &str = "oldRevisionOf";

/// Computes a virtual field or a named behavior from a record.
pub type RecordFn = Arc<dyn Fn(&Record) -> Value + Send + Sync>;

/// Deferred manifest lookup, used to break cycles between manifests that
/// reference each other.
pub type ManifestSource = fn() -> Result<Arc<Manifest>, ManifestError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Clone)]
pub enum RelationTarget {
    /// Target registered under this table name.
    Table(String),
    /// Target produced by a resolver function on first use.
    Lazy(ManifestSource),
}

impl RelationTarget {
    pub fn table(name: impl Into<String>) -> Self {
        RelationTarget::Table(name.into())
    }

    pub fn lazy(source: ManifestSource) -> Self {
        RelationTarget::Lazy(source)
    }
}

impl fmt::Debug for RelationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationTarget::Table(name) => f.debug_tuple("Table").field(name).finish(),
            RelationTarget::Lazy(_) => f.write_str("Lazy(<fn>)"),
        }
    }
}

/// Junction table of a many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Through {
    pub table: String,
    /// Junction column holding the source record's key.
    pub source_column: String,
    /// Junction column holding the target record's key.
    pub target_column: String,
}

#[derive(Debug, Clone)]
pub struct RelationDefinition {
    name: String,
    target: RelationTarget,
    source_key: String,
    target_key: String,
    cardinality: Cardinality,
    through: Option<Through>,
}

impl RelationDefinition {
    /// `source_key` is a field on the declaring manifest, `target_key` a
    /// field on the target manifest.
    pub fn new(
        name: impl Into<String>,
        target: RelationTarget,
        source_key: impl Into<String>,
        target_key: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            source_key: source_key.into(),
            target_key: target_key.into(),
            cardinality,
            through: None,
        }
    }

    pub fn one(
        name: impl Into<String>,
        target: RelationTarget,
        source_key: impl Into<String>,
        target_key: impl Into<String>,
    ) -> Self {
        Self::new(name, target, source_key, target_key, Cardinality::One)
    }

    pub fn many(
        name: impl Into<String>,
        target: RelationTarget,
        source_key: impl Into<String>,
        target_key: impl Into<String>,
    ) -> Self {
        Self::new(name, target, source_key, target_key, Cardinality::Many)
    }

    /// Route the relation through a junction table.
    pub fn through(
        mut self,
        table: impl Into<String>,
        source_column: impl Into<String>,
        target_column: impl Into<String>,
    ) -> Self {
        self.through = Some(Through {
            table: table.into(),
            source_column: source_column.into(),
            target_column: target_column.into(),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &RelationTarget {
        &self.target
    }

    pub fn source_key(&self) -> &str {
        &self.source_key
    }

    pub fn target_key(&self) -> &str {
        &self.target_key
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    pub fn through_table(&self) -> Option<&Through> {
        self.through.as_ref()
    }
}

/// A declared field together with its storage column.
#[derive(Debug, Clone)]
pub struct FieldDef {
    name: String,
    column: String,
    descriptor: FieldDescriptor,
}

impl FieldDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn descriptor(&self) -> &FieldDescriptor {
        &self.descriptor
    }

    pub fn kind(&self) -> FieldKind {
        self.descriptor.kind()
    }

    pub fn is_virtual(&self) -> bool {
        self.descriptor.is_virtual()
    }
}

pub struct Manifest {
    table_name: String,
    has_revisions: bool,
    fields: Vec<FieldDef>,
    relations: Vec<RelationDefinition>,
    virtuals: Vec<(String, RecordFn)>,
    methods: HashMap<String, RecordFn>,
}

impl Manifest {
    pub fn builder(table_name: impl Into<String>) -> ManifestBuilder {
        ManifestBuilder::new(table_name)
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn has_revisions(&self) -> bool {
        self.has_revisions
    }

    /// All fields in declaration order, reserved fields first.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn persisted_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| !f.is_virtual())
    }

    pub fn column_of(&self, field: &str) -> Option<&str> {
        self.field(field).map(FieldDef::column)
    }

    /// Field → column pairs of every persisted field.
    pub fn camel_to_snake(&self) -> Vec<(&str, &str)> {
        self.persisted_fields()
            .map(|f| (f.name.as_str(), f.column.as_str()))
            .collect()
    }

    /// The field identifying one row: `revisionId` on revisioned manifests,
    /// `id` otherwise.
    pub fn row_key(&self) -> &'static str {
        if self.has_revisions {
            REVISION_ID
        } else {
            ID
        }
    }

    pub fn relations(&self) -> &[RelationDefinition] {
        &self.relations
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDefinition> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Compute every virtual field of `record`. Virtual fields without a
    /// generator are `Null`.
    pub fn virtual_values(&self, record: &Record) -> Record {
        self.fields
            .iter()
            .filter(|f| f.is_virtual())
            .map(|f| {
                let value = self
                    .virtuals
                    .iter()
                    .find(|(name, _)| *name == f.name)
                    .map(|(_, generate)| generate(record))
                    .unwrap_or(Value::Null);
                (f.name.clone(), value)
            })
            .collect()
    }

    pub fn method(&self, name: &str) -> Option<&RecordFn> {
        self.methods.get(name)
    }
}

impl fmt::Debug for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manifest")
            .field("table_name", &self.table_name)
            .field("has_revisions", &self.has_revisions)
            .field("fields", &self.fields)
            .field("relations", &self.relations)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub struct ManifestBuilder {
    table_name: String,
    has_revisions: bool,
    fields: Vec<(String, FieldDescriptor)>,
    columns: HashMap<String, String>,
    relations: Vec<RelationDefinition>,
    virtuals: Vec<(String, RecordFn)>,
    methods: HashMap<String, RecordFn>,
}

impl ManifestBuilder {
    fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            has_revisions: false,
            fields: Vec::new(),
            columns: HashMap::new(),
            relations: Vec::new(),
            virtuals: Vec::new(),
            methods: HashMap::new(),
        }
    }

    /// Keep an append-only revision history for this entity.
    pub fn revisioned(mut self) -> Self {
        self.has_revisions = true;
        self
    }

    pub fn field(mut self, name: impl Into<String>, descriptor: FieldDescriptor) -> Self {
        self.fields.push((name.into(), descriptor));
        self
    }

    /// Override the storage column of a field (default: snake_case of the
    /// field name).
    pub fn column(mut self, field: impl Into<String>, column: impl Into<String>) -> Self {
        self.columns.insert(field.into(), column.into());
        self
    }

    /// Declare a computed field and its generator.
    pub fn virtual_field(
        mut self,
        name: impl Into<String>,
        kind: FieldKind,
        generate: impl Fn(&Record) -> Value + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        self.fields
            .push((name.clone(), FieldDescriptor::virtual_of(kind)));
        self.virtuals.push((name, Arc::new(generate)));
        self
    }

    pub fn relation(mut self, relation: RelationDefinition) -> Self {
        self.relations.push(relation);
        self
    }

    /// Named instance behavior, invoked through `Instance::call`.
    pub fn method(
        mut self,
        name: impl Into<String>,
        behavior: impl Fn(&Record) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.methods.insert(name.into(), Arc::new(behavior));
        self
    }

    pub fn build(self) -> Result<Arc<Manifest>, ManifestError> {
        let table = self.table_name;
        let invalid = |reason: String| ManifestError::invalid(table.clone(), reason);

        if !is_valid_identifier(&table, false) || table.contains('.') {
            return Err(invalid(format!("`{table}` is not a valid table name")));
        }

        let mut fields = reserved_fields(self.has_revisions);
        let reserved: HashSet<String> = fields.iter().map(|f| f.name.clone()).collect();

        let mut seen = HashSet::new();
        for (name, descriptor) in self.fields {
            if reserved.contains(&name) {
                return Err(invalid(format!("field `{name}` is reserved")));
            }
            if !seen.insert(name.clone()) {
                return Err(invalid(format!("duplicate field `{name}`")));
            }
            let column = self
                .columns
                .get(&name)
                .cloned()
                .unwrap_or_else(|| name.to_case(Case::Snake));
            fields.push(FieldDef {
                name,
                column,
                descriptor,
            });
        }

        for field in self.columns.keys() {
            if !seen.contains(field) {
                return Err(invalid(format!("column override for unknown field `{field}`")));
            }
        }

        let mut columns = HashSet::new();
        for field in fields.iter().filter(|f| !f.is_virtual()) {
            if !is_valid_identifier(&field.column, false) || field.column.contains('.') {
                return Err(invalid(format!(
                    "`{}` is not a valid column name for field `{}`",
                    field.column, field.name
                )));
            }
            if !columns.insert(field.column.clone()) {
                return Err(invalid(format!("column `{}` is mapped twice", field.column)));
            }
        }

        let mut relation_names = HashSet::new();
        for relation in &self.relations {
            if !relation_names.insert(relation.name.clone()) {
                return Err(invalid(format!("duplicate relation `{}`", relation.name)));
            }
            if fields.iter().any(|f| f.name == relation.name) {
                return Err(invalid(format!(
                    "relation `{}` shadows a field of the same name",
                    relation.name
                )));
            }
            match fields.iter().find(|f| f.name == relation.source_key) {
                Some(f) if !f.is_virtual() => {}
                _ => {
                    return Err(invalid(format!(
                        "relation `{}` uses unknown source key `{}`",
                        relation.name, relation.source_key
                    )))
                }
            }
            if let Some(through) = &relation.through {
                for ident in [&through.table, &through.source_column, &through.target_column] {
                    if !is_valid_identifier(ident, false) || ident.contains('.') {
                        return Err(invalid(format!(
                            "relation `{}` has invalid junction identifier `{ident}`",
                            relation.name
                        )));
                    }
                }
            }
        }

        for (name, _) in &self.virtuals {
            let declared = fields.iter().any(|f| &f.name == name && f.is_virtual());
            if !declared {
                return Err(invalid(format!("virtual generator for undeclared field `{name}`")));
            }
        }

        Ok(Arc::new(Manifest {
            table_name: table,
            has_revisions: self.has_revisions,
            fields,
            relations: self.relations,
            virtuals: self.virtuals,
            methods: self.methods,
        }))
    }
}

fn reserved(name: &str, column: &str, descriptor: FieldDescriptor) -> FieldDef {
    FieldDef {
        name: name.to_string(),
        column: column.to_string(),
        descriptor,
    }
}

fn reserved_fields(has_revisions: bool) -> Vec<FieldDef> {
    let mut fields = vec![reserved(
        ID,
        "id",
        FieldDescriptor::uuid()
            .required()
            .default_with(|| Value::Uuid(Uuid::new_v4())),
    )];
    if has_revisions {
        fields.extend([
            reserved(REVISION_ID, "rev_id", FieldDescriptor::uuid().required()),
            reserved(REVISION_USER, "rev_user", FieldDescriptor::uuid().required()),
            reserved(REVISION_DATE, "rev_date", FieldDescriptor::date().required()),
            reserved(
                REVISION_TAGS,
                "rev_tags",
                FieldDescriptor::array(FieldKind::String).default_value(Value::Array(Vec::new())),
            ),
            reserved(
                REVISION_DELETED,
                "rev_deleted",
                FieldDescriptor::boolean().required().default_value(false),
            ),
            reserved(OLD_REVISION_OF, "old_rev_of", FieldDescriptor::uuid()),
        ]);
    }
    fields
}
