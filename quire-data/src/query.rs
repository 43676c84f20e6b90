use std::collections::HashSet;
use std::sync::Arc;

use crate::error::QueryError;
use crate::manifest::{FieldDef, Manifest};
use crate::predicate::{Clause, Op, Predicate};
use crate::schema::FieldKind;
use crate::value::Value;

/// A query builder over one manifest, rendering parameterized SQL.
///
/// Predicate groups are combined with AND; an `or` group is bracketed, so
/// `filter_where(a).or(b | c).and(d)` renders `a AND (b OR c) AND d`.
///
/// # Example
///
/// ```ignore
/// let q = QueryBuilder::new(things)
///     .filter_where(predicate! { "label" => "x" })
///     .or(predicate! { "score" => ops::gt(5), "pinned" => true })
///     .order_by("createdOn", false)
///     .limit(10);
/// let statement = q.build_select()?;
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// `?` placeholders, `json_each`/`json_extract` for array and JSON operators.
    #[default]
    Sqlite,
    /// `$1, $2, ...` placeholders, `jsonb` operators.
    Postgres,
}

impl Dialect {
    fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => "?".to_string(),
        }
    }

    fn quote_char(self) -> char {
        '"'
    }
}

/// Rendered SQL with its bound values, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Which revisions a read may see. Both flags are off by default: only the
/// current, non-deleted revision of each record is visible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Visibility {
    pub include_stale: bool,
    pub include_deleted: bool,
}

/// Per-relation overrides for an eager join.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinOptions {
    pub include_stale: Option<bool>,
    pub include_deleted: Option<bool>,
    pub order_by: Vec<(String, bool)>,
}

impl JoinOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include_stale(mut self, include: bool) -> Self {
        self.include_stale = Some(include);
        self
    }

    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = Some(include);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, ascending: bool) -> Self {
        self.order_by.push((field.into(), ascending));
        self
    }

    /// Visibility for the joined rows, inheriting unset flags from the host
    /// query.
    pub fn visibility(&self, inherited: Visibility) -> Visibility {
        Visibility {
            include_stale: self.include_stale.unwrap_or(inherited.include_stale),
            include_deleted: self.include_deleted.unwrap_or(inherited.include_deleted),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinSpec {
    pub relation: String,
    pub options: JoinOptions,
}

#[derive(Debug, Clone)]
struct Group {
    any: bool,
    clauses: Vec<Clause>,
}

impl Group {
    fn is_unsatisfiable(&self) -> bool {
        if self.any {
            !self.clauses.is_empty() && self.clauses.iter().all(|c| c.op.is_unsatisfiable())
        } else {
            self.clauses.iter().any(|c| c.op.is_unsatisfiable())
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryBuilder {
    manifest: Arc<Manifest>,
    dialect: Dialect,
    groups: Vec<Group>,
    order: Vec<(String, bool)>,
    limit_val: Option<u64>,
    offset_val: Option<u64>,
    visibility: Visibility,
    sensitive: Vec<String>,
    joins: Vec<JoinSpec>,
}

impl QueryBuilder {
    pub fn new(manifest: Arc<Manifest>) -> Self {
        Self {
            manifest,
            dialect: Dialect::default(),
            groups: Vec::new(),
            order: Vec::new(),
            limit_val: None,
            offset_val: None,
            visibility: Visibility::default(),
            sensitive: Vec::new(),
            joins: Vec::new(),
        }
    }

    /// Create a new builder with an explicit SQL dialect.
    pub fn new_with_dialect(manifest: Arc<Manifest>, dialect: Dialect) -> Self {
        Self::new(manifest).dialect(dialect)
    }

    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    /// Add a conjunctive group. Equivalent to [`and`](Self::and).
    pub fn filter_where(self, predicate: impl Into<Predicate>) -> Self {
        self.and(predicate)
    }

    pub fn and(mut self, predicate: impl Into<Predicate>) -> Self {
        let clauses = predicate.into().into_clauses();
        if !clauses.is_empty() {
            self.groups.push(Group { any: false, clauses });
        }
        self
    }

    /// Add one bracketed group whose clauses are combined with OR.
    pub fn or(mut self, predicate: impl Into<Predicate>) -> Self {
        let clauses = predicate.into().into_clauses();
        if !clauses.is_empty() {
            self.groups.push(Group { any: true, clauses });
        }
        self
    }

    pub fn where_in<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.and(Clause::new(
            field,
            Op::In(values.into_iter().map(Into::into).collect()),
        ))
    }

    pub fn order_by(mut self, field: &str, ascending: bool) -> Self {
        self.order.push((field.to_string(), ascending));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit_val = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset_val = Some(offset);
        self
    }

    /// Also return historical revisions.
    pub fn include_stale(mut self) -> Self {
        self.visibility.include_stale = true;
        self
    }

    /// Also return soft-deleted rows.
    pub fn include_deleted(mut self) -> Self {
        self.visibility.include_deleted = true;
        self
    }

    /// Project the named sensitive fields, which are otherwise left out.
    pub fn include_sensitive<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sensitive.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Eagerly load a relation for every returned row.
    pub fn get_join(self, relation: &str) -> Self {
        self.get_join_with(relation, JoinOptions::default())
    }

    pub fn get_join_with(mut self, relation: &str, options: JoinOptions) -> Self {
        self.joins.push(JoinSpec {
            relation: relation.to_string(),
            options,
        });
        self
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn joins(&self) -> &[JoinSpec] {
        &self.joins
    }

    pub fn limit_value(&self) -> Option<u64> {
        self.limit_val
    }

    pub fn offset_value(&self) -> Option<u64> {
        self.offset_val
    }

    /// Drop ordering, limit and offset, keeping the filters.
    pub fn unpaged(mut self) -> Self {
        self.order.clear();
        self.limit_val = None;
        self.offset_val = None;
        self
    }

    /// Whether some top-level group can never match (e.g. `in([])`), so
    /// the query is known to return no rows without consulting the store.
    pub fn is_unsatisfiable(&self) -> bool {
        self.groups.iter().any(Group::is_unsatisfiable)
    }

    /// Fields projected by `SELECT`: persisted fields, minus sensitive ones
    /// that were not explicitly included. Source keys of joined relations
    /// are always projected.
    pub fn select_fields(&self) -> Vec<&FieldDef> {
        let join_keys: HashSet<&str> = self
            .joins
            .iter()
            .filter_map(|j| self.manifest.relation(&j.relation))
            .map(|r| r.source_key())
            .collect();
        self.manifest
            .persisted_fields()
            .filter(|f| {
                !f.descriptor().is_sensitive()
                    || self.sensitive.iter().any(|s| s == f.name())
                    || join_keys.contains(f.name())
            })
            .collect()
    }

    /// Build the `SELECT` statement for this query.
    pub fn build_select(&self) -> Result<Statement, QueryError> {
        self.check_sensitive()?;
        let table = self.manifest.table_name();
        let mut w = SqlWriter::new(self.dialect);
        w.push("SELECT ");
        w.column_list(table, &self.select_fields());
        w.push(" FROM ");
        w.ident(table);
        self.append_where(&mut w)?;
        self.append_order(&mut w)?;
        self.append_limit_offset(&mut w);
        Ok(w.finish())
    }

    pub fn build_count(&self) -> Result<Statement, QueryError> {
        let table = self.manifest.table_name();
        let mut w = SqlWriter::new(self.dialect);
        w.push("SELECT COUNT(*) FROM ");
        w.ident(table);
        self.append_where(&mut w)?;
        Ok(w.finish())
    }

    /// Hard delete of every matching row.
    pub fn build_delete(&self) -> Result<Statement, QueryError> {
        let table = self.manifest.table_name();
        let mut w = SqlWriter::new(self.dialect);
        w.push("DELETE FROM ");
        w.ident(table);
        self.append_where(&mut w)?;
        Ok(w.finish())
    }

    /// Flag every revision of each matching record as deleted.
    pub fn build_soft_delete(&self) -> Result<Statement, QueryError> {
        let table = self.manifest.table_name();
        let mut w = SqlWriter::new(self.dialect);
        w.push("UPDATE ");
        w.ident(table);
        w.push(" SET ");
        w.ident("rev_deleted");
        w.push(" = ");
        w.bind(Value::Bool(true));
        w.push(" WHERE ");
        w.ident("id");
        w.push(" IN (SELECT ");
        w.column(table, "id");
        w.push(" FROM ");
        w.ident(table);
        self.append_where(&mut w)?;
        w.push(")");
        Ok(w.finish())
    }

    /// Add `delta` to a numeric field of every matching row, returning
    /// `id` and the new value per row.
    pub fn build_increment(&self, field: &str, delta: Value) -> Result<Statement, QueryError> {
        let def = self.resolve(field)?;
        if !matches!(def.kind(), FieldKind::Integer | FieldKind::Number) {
            return Err(QueryError::InvalidOperator {
                field: field.to_string(),
                op: "increment",
                reason: format!("field is {}", def.kind().name()),
            });
        }
        let delta = def
            .kind()
            .coerce(delta)
            .map_err(|reason| QueryError::InvalidOperator {
                field: field.to_string(),
                op: "increment",
                reason,
            })?;

        let table = self.manifest.table_name();
        let mut w = SqlWriter::new(self.dialect);
        w.push("UPDATE ");
        w.ident(table);
        w.push(" SET ");
        w.ident(def.column());
        w.push(" = COALESCE(");
        w.ident(def.column());
        w.push(", 0) + ");
        w.bind(delta);
        self.append_where(&mut w)?;
        w.push(" RETURNING ");
        w.ident("id");
        w.push(", ");
        w.ident(def.column());
        Ok(w.finish())
    }

    fn check_sensitive(&self) -> Result<(), QueryError> {
        for name in &self.sensitive {
            self.resolve(name)?;
        }
        Ok(())
    }

    fn resolve(&self, field: &str) -> Result<&FieldDef, QueryError> {
        match self.manifest.field(field) {
            Some(def) if !def.is_virtual() => Ok(def),
            _ => Err(QueryError::UnknownField {
                table: self.manifest.table_name().to_string(),
                field: field.to_string(),
            }),
        }
    }

    fn append_where(&self, w: &mut SqlWriter) -> Result<(), QueryError> {
        let table = self.manifest.table_name();
        let mut first = true;
        let mut next = |w: &mut SqlWriter| {
            w.push(if first { " WHERE " } else { " AND " });
            first = false;
        };

        for group in &self.groups {
            next(w);
            if group.any && group.clauses.len() > 1 {
                w.push("(");
                for (idx, clause) in group.clauses.iter().enumerate() {
                    if idx > 0 {
                        w.push(" OR ");
                    }
                    self.append_clause(w, table, clause)?;
                }
                w.push(")");
            } else {
                for (idx, clause) in group.clauses.iter().enumerate() {
                    if idx > 0 {
                        w.push(" AND ");
                    }
                    self.append_clause(w, table, clause)?;
                }
            }
        }

        if self.manifest.has_revisions() {
            if !self.visibility.include_stale || !self.visibility.include_deleted {
                next(w);
            }
            w.visibility(table, self.visibility);
        }
        Ok(())
    }

    fn append_clause(&self, w: &mut SqlWriter, table: &str, clause: &Clause) -> Result<(), QueryError> {
        let def = self.resolve(&clause.field)?;
        let op = prepare(def, &clause.op)?;
        w.predicate(table, def, &op)
    }

    fn append_order(&self, w: &mut SqlWriter) -> Result<(), QueryError> {
        if self.order.is_empty() {
            return Ok(());
        }
        let table = self.manifest.table_name();
        w.push(" ORDER BY ");
        for (idx, (field, asc)) in self.order.iter().enumerate() {
            if idx > 0 {
                w.push(", ");
            }
            let def = self.resolve(field)?;
            w.column(table, def.column());
            w.push(if *asc { " ASC" } else { " DESC" });
        }
        Ok(())
    }

    fn append_limit_offset(&self, w: &mut SqlWriter) {
        match (self.limit_val, self.offset_val, self.dialect) {
            (Some(limit), _, _) => w.push(&format!(" LIMIT {limit}")),
            // SQLite only accepts OFFSET after a LIMIT.
            (None, Some(_), Dialect::Sqlite) => w.push(" LIMIT -1"),
            _ => {}
        }
        if let Some(offset) = self.offset_val {
            w.push(&format!(" OFFSET {offset}"));
        }
    }
}

/// Check that `op` applies to the field and coerce its operands to the
/// field's kind.
pub(crate) fn prepare(def: &FieldDef, op: &Op) -> Result<Op, QueryError> {
    let kind = def.kind();
    let invalid = |reason: String| QueryError::InvalidOperator {
        field: def.name().to_string(),
        op: op.name(),
        reason,
    };
    let coerce = |value: &Value| kind.coerce(value.clone()).map_err(invalid);
    let coerce_all = |values: &[Value]| values.iter().map(coerce).collect::<Result<Vec<_>, _>>();

    Ok(match op {
        Op::Eq(v) => Op::Eq(coerce(v)?),
        Op::Neq(v) => Op::Neq(coerce(v)?),
        Op::Lt(_) | Op::Lte(_) | Op::Gt(_) | Op::Gte(_) | Op::Between(..) if kind.is_structured() => {
            return Err(invalid(format!("{} fields are not ordered", kind.name())))
        }
        Op::Lt(v) => Op::Lt(coerce(v)?),
        Op::Lte(v) => Op::Lte(coerce(v)?),
        Op::Gt(v) => Op::Gt(coerce(v)?),
        Op::Gte(v) => Op::Gte(coerce(v)?),
        Op::Between(low, high) => Op::Between(coerce(low)?, coerce(high)?),
        Op::In(values) => Op::In(coerce_all(values)?),
        Op::ContainsAll(_) | Op::ContainsAny(_) if kind != FieldKind::Array => {
            return Err(invalid(format!("expected an array field, found {}", kind.name())))
        }
        Op::ContainsAll(values) | Op::ContainsAny(values) => {
            let items = match def.descriptor().item_kind() {
                Some(item_kind) => values
                    .iter()
                    .map(|v| item_kind.coerce(v.clone()).map_err(invalid))
                    .collect::<Result<Vec<_>, _>>()?,
                None => values.clone(),
            };
            if matches!(op, Op::ContainsAll(_)) {
                Op::ContainsAll(items)
            } else {
                Op::ContainsAny(items)
            }
        }
        Op::JsonContains(_) if kind != FieldKind::Object => {
            return Err(invalid(format!("expected an object field, found {}", kind.name())))
        }
        Op::JsonContains(probe) if !probe.is_object() => {
            return Err(invalid("probe must be a JSON object".into()))
        }
        Op::JsonContains(probe) => Op::JsonContains(probe.clone()),
        Op::Not(inner) => Op::Not(Box::new(prepare(def, inner)?)),
    })
}

/// Accumulates SQL text and bound values, numbering placeholders.
pub(crate) struct SqlWriter {
    dialect: Dialect,
    sql: String,
    params: Vec<Value>,
}

impl SqlWriter {
    pub(crate) fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }

    pub(crate) fn bind(&mut self, value: Value) {
        self.params.push(value);
        let placeholder = self.dialect.placeholder(self.params.len());
        self.sql.push_str(&placeholder);
    }

    pub(crate) fn ident(&mut self, ident: &str) {
        let quoted = quote_identifier(ident, self.dialect, false);
        self.sql.push_str(&quoted);
    }

    /// `"table"."column"`
    pub(crate) fn column(&mut self, table: &str, column: &str) {
        self.ident(table);
        self.sql.push('.');
        self.ident(column);
    }

    pub(crate) fn column_list(&mut self, table: &str, fields: &[&FieldDef]) {
        for (idx, field) in fields.iter().enumerate() {
            if idx > 0 {
                self.push(", ");
            }
            self.column(table, field.column());
        }
    }

    /// Deleted records are flagged on every revision, so widening to deleted
    /// rows also admits their history.
    pub(crate) fn visibility(&mut self, table: &str, visibility: Visibility) {
        match (visibility.include_stale, visibility.include_deleted) {
            (false, false) => {
                self.column(table, "old_rev_of");
                self.push(" IS NULL AND ");
                self.column(table, "rev_deleted");
                self.push(" = ");
                self.bind(Value::Bool(false));
            }
            (true, false) => {
                self.column(table, "rev_deleted");
                self.push(" = ");
                self.bind(Value::Bool(false));
            }
            (false, true) => {
                self.push("(");
                self.column(table, "old_rev_of");
                self.push(" IS NULL OR ");
                self.column(table, "rev_deleted");
                self.push(" = ");
                self.bind(Value::Bool(true));
                self.push(")");
            }
            (true, true) => {}
        }
    }

    fn comparison(&mut self, table: &str, column: &str, operator: &str, value: Value) {
        self.column(table, column);
        self.push(" ");
        self.push(operator);
        self.push(" ");
        self.bind(value);
    }

    fn value_list(&mut self, values: Vec<Value>) {
        self.push("(");
        for (idx, value) in values.into_iter().enumerate() {
            if idx > 0 {
                self.push(", ");
            }
            self.bind(value);
        }
        self.push(")");
    }

    pub(crate) fn predicate(&mut self, table: &str, def: &FieldDef, op: &Op) -> Result<(), QueryError> {
        let column = def.column();
        match op {
            Op::Eq(Value::Null) => {
                self.column(table, column);
                self.push(" IS NULL");
            }
            Op::Neq(Value::Null) => {
                self.column(table, column);
                self.push(" IS NOT NULL");
            }
            Op::Eq(v) => self.comparison(table, column, "=", v.clone()),
            Op::Neq(v) => self.comparison(table, column, "<>", v.clone()),
            Op::Lt(v) => self.comparison(table, column, "<", v.clone()),
            Op::Lte(v) => self.comparison(table, column, "<=", v.clone()),
            Op::Gt(v) => self.comparison(table, column, ">", v.clone()),
            Op::Gte(v) => self.comparison(table, column, ">=", v.clone()),
            Op::Between(low, high) => {
                self.column(table, column);
                self.push(" BETWEEN ");
                self.bind(low.clone());
                self.push(" AND ");
                self.bind(high.clone());
            }
            Op::In(values) if values.is_empty() => self.push("1 = 0"),
            Op::In(values) => {
                self.column(table, column);
                self.push(" IN ");
                self.value_list(values.clone());
            }
            Op::ContainsAny(values) if values.is_empty() => self.push("1 = 0"),
            Op::ContainsAll(values) if values.is_empty() => self.push("1 = 1"),
            Op::ContainsAny(values) => self.contains_any(table, column, values.clone()),
            Op::ContainsAll(values) => self.contains_all(table, column, dedupe(values)),
            Op::JsonContains(probe) => self.json_contains(table, def, probe)?,
            Op::Not(inner) => {
                self.push("NOT (");
                self.predicate(table, def, inner)?;
                self.push(")");
            }
        }
        Ok(())
    }

    fn contains_any(&mut self, table: &str, column: &str, values: Vec<Value>) {
        match self.dialect {
            Dialect::Sqlite => {
                self.push("EXISTS (SELECT 1 FROM json_each(");
                self.column(table, column);
                self.push(") WHERE value IN ");
            }
            Dialect::Postgres => {
                self.push("EXISTS (SELECT 1 FROM jsonb_array_elements_text(");
                self.column(table, column);
                self.push(") AS e(value) WHERE e.value IN ");
            }
        }
        self.value_list(values);
        self.push(")");
    }

    fn contains_all(&mut self, table: &str, column: &str, values: Vec<Value>) {
        match self.dialect {
            Dialect::Sqlite => {
                let expected = values.len();
                self.push("(SELECT COUNT(DISTINCT value) FROM json_each(");
                self.column(table, column);
                self.push(") WHERE value IN ");
                self.value_list(values);
                self.push(&format!(") = {expected}"));
            }
            Dialect::Postgres => {
                let array = Value::Json(Value::Array(values).to_json());
                self.comparison(table, column, "@>", array);
            }
        }
    }

    fn json_contains(
        &mut self,
        table: &str,
        def: &FieldDef,
        probe: &serde_json::Value,
    ) -> Result<(), QueryError> {
        if self.dialect == Dialect::Postgres {
            self.comparison(table, def.column(), "@>", Value::Json(probe.clone()));
            return Ok(());
        }

        let mut leaves = Vec::new();
        flatten_probe("$", probe, &mut leaves).map_err(|reason| QueryError::InvalidOperator {
            field: def.name().to_string(),
            op: "jsonContains",
            reason,
        })?;
        if leaves.is_empty() {
            self.push("1 = 1");
            return Ok(());
        }

        let wrap = leaves.len() > 1;
        if wrap {
            self.push("(");
        }
        for (idx, leaf) in leaves.into_iter().enumerate() {
            if idx > 0 {
                self.push(" AND ");
            }
            match leaf {
                Leaf::Scalar(path, serde_json::Value::Null) => {
                    self.push("json_extract(");
                    self.column(table, def.column());
                    self.push(", ");
                    self.bind(Value::Text(path));
                    self.push(") IS NULL");
                }
                Leaf::Scalar(path, value) => {
                    self.push("json_extract(");
                    self.column(table, def.column());
                    self.push(", ");
                    self.bind(Value::Text(path));
                    self.push(") = ");
                    self.bind(Value::from_json(value));
                }
                Leaf::Element(path, value) if value.is_object() || value.is_array() => {
                    self.push("EXISTS (SELECT 1 FROM json_each(");
                    self.column(table, def.column());
                    self.push(", ");
                    self.bind(Value::Text(path));
                    self.push(") WHERE json(value) = json(");
                    self.bind(Value::Text(value.to_string()));
                    self.push("))");
                }
                Leaf::Element(path, value) => {
                    self.push("EXISTS (SELECT 1 FROM json_each(");
                    self.column(table, def.column());
                    self.push(", ");
                    self.bind(Value::Text(path));
                    self.push(") WHERE value = ");
                    self.bind(Value::from_json(value));
                    self.push(")");
                }
            }
        }
        if wrap {
            self.push(")");
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> Statement {
        Statement {
            sql: self.sql,
            params: self.params,
        }
    }
}

enum Leaf {
    /// Value at a JSON path must equal the scalar.
    Scalar(String, serde_json::Value),
    /// Array at a JSON path must hold the element.
    Element(String, serde_json::Value),
}

fn flatten_probe(path: &str, probe: &serde_json::Value, out: &mut Vec<Leaf>) -> Result<(), String> {
    match probe {
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                if key.contains('"') {
                    return Err(format!("unsupported key `{key}`"));
                }
                flatten_probe(&format!("{path}.\"{key}\""), value, out)?;
            }
        }
        serde_json::Value::Array(items) => {
            out.extend(items.iter().map(|item| Leaf::Element(path.to_string(), item.clone())));
        }
        scalar => out.push(Leaf::Scalar(path.to_string(), scalar.clone())),
    }
    Ok(())
}

fn dedupe(values: &[Value]) -> Vec<Value> {
    let mut seen = HashSet::new();
    values
        .iter()
        .filter(|v| seen.insert(v.key_string()))
        .cloned()
        .collect()
}

pub(crate) fn is_valid_identifier(ident: &str, allow_star: bool) -> bool {
    if ident.is_empty() {
        return false;
    }
    let parts: Vec<&str> = ident.split('.').collect();
    for (idx, part) in parts.iter().enumerate() {
        if allow_star && *part == "*" {
            return idx + 1 == parts.len();
        }
        if !is_valid_segment(part) {
            return false;
        }
    }
    true
}

fn is_valid_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn quote_identifier(ident: &str, dialect: Dialect, allow_star: bool) -> String {
    let quote = dialect.quote_char();
    let parts: Vec<&str> = ident.split('.').collect();
    let last_idx = parts.len().saturating_sub(1);
    parts
        .into_iter()
        .enumerate()
        .map(|(idx, part)| {
            if allow_star && part == "*" && idx == last_idx {
                part.to_string()
            } else {
                format!("{quote}{part}{quote}")
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;
    use crate::predicate;
    use crate::schema::FieldDescriptor;

    fn things() -> Arc<Manifest> {
        Manifest::builder("things")
            .revisioned()
            .field("label", FieldDescriptor::string())
            .field("score", FieldDescriptor::integer())
            .field("tags", FieldDescriptor::array(FieldKind::String))
            .field("meta", FieldDescriptor::object())
            .field("secret", FieldDescriptor::string().sensitive())
            .build()
            .unwrap()
    }

    fn users() -> Arc<Manifest> {
        Manifest::builder("users")
            .field("name", FieldDescriptor::string())
            .field("age", FieldDescriptor::integer())
            .build()
            .unwrap()
    }

    const VISIBLE: &str = "\"things\".\"old_rev_of\" IS NULL AND \"things\".\"rev_deleted\" = ?";

    #[test]
    fn test_simple_select() {
        let s = QueryBuilder::new(users()).build_select().unwrap();
        assert_eq!(
            s.sql,
            "SELECT \"users\".\"id\", \"users\".\"name\", \"users\".\"age\" FROM \"users\""
        );
        assert!(s.params.is_empty());
    }

    #[test]
    fn test_default_visibility() {
        let s = QueryBuilder::new(things()).build_count().unwrap();
        assert_eq!(s.sql, format!("SELECT COUNT(*) FROM \"things\" WHERE {VISIBLE}"));
        assert_eq!(s.params, vec![Value::Bool(false)]);

        let s = QueryBuilder::new(things()).include_stale().build_count().unwrap();
        assert_eq!(
            s.sql,
            "SELECT COUNT(*) FROM \"things\" WHERE \"things\".\"rev_deleted\" = ?"
        );

        let s = QueryBuilder::new(things()).include_deleted().build_count().unwrap();
        assert_eq!(
            s.sql,
            "SELECT COUNT(*) FROM \"things\" WHERE (\"things\".\"old_rev_of\" IS NULL OR \"things\".\"rev_deleted\" = ?)"
        );
        assert_eq!(s.params, vec![Value::Bool(true)]);

        let s = QueryBuilder::new(things())
            .include_stale()
            .include_deleted()
            .build_count()
            .unwrap();
        assert_eq!(s.sql, "SELECT COUNT(*) FROM \"things\"");
    }

    #[test]
    fn test_sensitive_fields_are_projected_on_request() {
        let q = QueryBuilder::new(things());
        assert!(q.select_fields().iter().all(|f| f.name() != "secret"));
        let q = q.include_sensitive(["secret"]);
        assert!(q.select_fields().iter().any(|f| f.name() == "secret"));
        let err = QueryBuilder::new(things())
            .include_sensitive(["nope"])
            .build_select()
            .unwrap_err();
        assert!(matches!(err, QueryError::UnknownField { .. }));
    }

    #[test]
    fn test_and_of_ors_precedence() {
        let s = QueryBuilder::new(users())
            .filter_where(predicate! { "name" => "a" })
            .or(predicate! { "age" => ops::lt(3), "name" => "b" })
            .and(predicate! { "age" => ops::neq(Value::Null) })
            .build_count()
            .unwrap();
        assert_eq!(
            s.sql,
            "SELECT COUNT(*) FROM \"users\" WHERE \"users\".\"name\" = ? AND (\"users\".\"age\" < ? OR \"users\".\"name\" = ?) AND \"users\".\"age\" IS NOT NULL"
        );
        assert_eq!(
            s.params,
            vec![Value::Text("a".into()), Value::Int(3), Value::Text("b".into())]
        );
    }

    #[test]
    fn test_between_in_and_not() {
        let s = QueryBuilder::new(users())
            .filter_where(predicate! {
                "age" => ops::between(5, 10),
                "name" => ops::not(ops::is_in(["x", "y"])),
            })
            .build_count()
            .unwrap();
        assert_eq!(
            s.sql,
            "SELECT COUNT(*) FROM \"users\" WHERE \"users\".\"age\" BETWEEN ? AND ? AND NOT (\"users\".\"name\" IN (?, ?))"
        );
        assert_eq!(s.params.len(), 4);
    }

    #[test]
    fn test_empty_in_is_unsatisfiable() {
        let q = QueryBuilder::new(users()).where_in("name", Vec::<String>::new());
        assert!(q.is_unsatisfiable());
        let s = q.build_count().unwrap();
        assert_eq!(s.sql, "SELECT COUNT(*) FROM \"users\" WHERE 1 = 0");

        let partial = QueryBuilder::new(users()).or(predicate! {
            "name" => ops::is_in(Vec::<String>::new()),
            "age" => 3,
        });
        assert!(!partial.is_unsatisfiable());

        let negated = QueryBuilder::new(users())
            .filter_where(predicate! { "name" => ops::not(ops::is_in(Vec::<String>::new())) });
        assert!(!negated.is_unsatisfiable());
    }

    #[test]
    fn test_array_operators_sqlite() {
        let s = QueryBuilder::new(things())
            .include_stale()
            .include_deleted()
            .filter_where(predicate! {
                "tags" => ops::contains_any(["a", "b"]),
            })
            .and(predicate! { "tags" => ops::contains_all(["a", "b", "a"]) })
            .build_count()
            .unwrap();
        assert_eq!(
            s.sql,
            "SELECT COUNT(*) FROM \"things\" WHERE EXISTS (SELECT 1 FROM json_each(\"things\".\"tags\") WHERE value IN (?, ?)) AND (SELECT COUNT(DISTINCT value) FROM json_each(\"things\".\"tags\") WHERE value IN (?, ?)) = 2"
        );
    }

    #[test]
    fn test_empty_array_operators() {
        let s = QueryBuilder::new(things())
            .include_stale()
            .include_deleted()
            .filter_where(predicate! { "tags" => ops::contains_all(Vec::<String>::new()) })
            .build_count()
            .unwrap();
        assert_eq!(s.sql, "SELECT COUNT(*) FROM \"things\" WHERE 1 = 1");
        let q = QueryBuilder::new(things())
            .filter_where(predicate! { "tags" => ops::contains_any(Vec::<String>::new()) });
        assert!(q.is_unsatisfiable());
    }

    #[test]
    fn test_json_contains_sqlite() {
        let s = QueryBuilder::new(things())
            .include_stale()
            .include_deleted()
            .filter_where(predicate! {
                "meta" => ops::json_contains(serde_json::json!({"kind": "a", "nested": {"n": 1}, "list": [2]})),
            })
            .build_count()
            .unwrap();
        assert_eq!(
            s.sql,
            "SELECT COUNT(*) FROM \"things\" WHERE (json_extract(\"things\".\"meta\", ?) = ? AND EXISTS (SELECT 1 FROM json_each(\"things\".\"meta\", ?) WHERE value = ?) AND json_extract(\"things\".\"meta\", ?) = ?)"
        );
        assert_eq!(
            s.params,
            vec![
                Value::Text("$.\"kind\"".into()),
                Value::Text("a".into()),
                Value::Text("$.\"list\"".into()),
                Value::Int(2),
                Value::Text("$.\"nested\".\"n\"".into()),
                Value::Int(1),
            ]
        );
    }

    #[test]
    fn test_postgres_rendering() {
        let s = QueryBuilder::new_with_dialect(things(), Dialect::Postgres)
            .filter_where(predicate! {
                "label" => "x",
                "tags" => ops::contains_any(["a"]),
                "meta" => ops::json_contains(serde_json::json!({"k": true})),
            })
            .build_count()
            .unwrap();
        assert_eq!(
            s.sql,
            "SELECT COUNT(*) FROM \"things\" WHERE \"things\".\"label\" = $1 AND EXISTS (SELECT 1 FROM jsonb_array_elements_text(\"things\".\"tags\") AS e(value) WHERE e.value IN ($2)) AND \"things\".\"meta\" @> $3 AND \"things\".\"old_rev_of\" IS NULL AND \"things\".\"rev_deleted\" = $4"
        );
    }

    #[test]
    fn test_operator_applicability() {
        let err = QueryBuilder::new(users())
            .filter_where(predicate! { "age" => ops::contains_any([1]) })
            .build_count()
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidOperator { op: "containsAny", .. }));

        let err = QueryBuilder::new(things())
            .filter_where(predicate! { "meta" => ops::gt(1) })
            .build_count()
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidOperator { .. }));

        let err = QueryBuilder::new(users())
            .filter_where(predicate! { "age" => "old" })
            .build_count()
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidOperator { op: "eq", .. }));
    }

    #[test]
    fn test_unknown_fields() {
        let err = QueryBuilder::new(users())
            .filter_where(predicate! { "nope" => 1 })
            .build_count()
            .unwrap_err();
        assert_eq!(
            err,
            QueryError::UnknownField {
                table: "users".into(),
                field: "nope".into()
            }
        );
        let err = QueryBuilder::new(users())
            .order_by("nope", true)
            .build_select()
            .unwrap_err();
        assert!(matches!(err, QueryError::UnknownField { .. }));
    }

    #[test]
    fn test_order_limit_offset() {
        let s = QueryBuilder::new(users())
            .order_by("age", false)
            .order_by("name", true)
            .limit(10)
            .offset(20)
            .build_select()
            .unwrap();
        assert!(s.sql.ends_with(
            "ORDER BY \"users\".\"age\" DESC, \"users\".\"name\" ASC LIMIT 10 OFFSET 20"
        ));
        let s = QueryBuilder::new(users()).offset(5).build_select().unwrap();
        assert!(s.sql.ends_with(" LIMIT -1 OFFSET 5"));
    }

    #[test]
    fn test_soft_delete_and_increment() {
        let s = QueryBuilder::new(things())
            .filter_where(predicate! { "label" => "x" })
            .build_soft_delete()
            .unwrap();
        assert_eq!(
            s.sql,
            format!("UPDATE \"things\" SET \"rev_deleted\" = ? WHERE \"id\" IN (SELECT \"things\".\"id\" FROM \"things\" WHERE \"things\".\"label\" = ? AND {VISIBLE})")
        );
        assert_eq!(
            s.params,
            vec![Value::Bool(true), Value::Text("x".into()), Value::Bool(false)]
        );

        let s = QueryBuilder::new(users())
            .filter_where(predicate! { "name" => "x" })
            .build_increment("age", Value::Int(2))
            .unwrap();
        assert_eq!(
            s.sql,
            "UPDATE \"users\" SET \"age\" = COALESCE(\"age\", 0) + ? WHERE \"users\".\"name\" = ? RETURNING \"id\", \"age\""
        );
        assert!(QueryBuilder::new(users()).build_increment("name", Value::Int(1)).is_err());
    }

    #[test]
    fn test_identifier_checks() {
        assert!(is_valid_identifier("users.email", false));
        assert!(is_valid_identifier("users.*", true));
        assert!(!is_valid_identifier("users;drop", false));
        assert!(!is_valid_identifier("1abc", false));
        assert_eq!(
            quote_identifier("users.email", Dialect::Postgres, false),
            "\"users\".\"email\""
        );
    }
}
