//! Eager relation loading.
//!
//! Each joined relation costs one statement for the whole result set: the
//! source keys are collected and deduplicated, the related rows fetched in a
//! single `IN (..)` select, then handed back to their source instances.

use std::collections::{HashMap, HashSet};

use quire_data::relation::{build_relation_select, relation_fields};
use quire_data::{Cardinality, DataError, JoinSpec, QueryError, Value, Visibility};
use sqlx::SqliteConnection;

use crate::instance::{Instance, Related};
use crate::model::Model;
use crate::row::{decode_row, decode_value};

/// Load every join of `joins` onto `instances`.
pub(crate) async fn load_joins(
    model: &Model,
    instances: &mut [Instance],
    joins: &[JoinSpec],
    inherited: Visibility,
    mut conn: Option<&mut SqliteConnection>,
) -> Result<(), DataError> {
    if instances.is_empty() {
        return Ok(());
    }
    let manifest = model.manifest();
    let dal = model.dal();

    for join in joins {
        let relation = manifest
            .relation(&join.relation)
            .ok_or_else(|| QueryError::UnknownRelation {
                table: manifest.table_name().to_string(),
                relation: join.relation.clone(),
            })?;
        let source_def = manifest
            .field(relation.source_key())
            .ok_or_else(|| QueryError::UnknownField {
                table: manifest.table_name().to_string(),
                field: relation.source_key().to_string(),
            })?;
        let target = dal.registry().resolve(relation.target())?;
        let target_model = Model::new(dal.clone(), target.clone());

        let mut seen = HashSet::new();
        let keys: Vec<Value> = instances
            .iter()
            .filter_map(|i| i.get_value(relation.source_key()))
            .filter(|v| !v.is_null() && seen.insert(v.key_string()))
            .cloned()
            .collect();

        let mut grouped: HashMap<String, Vec<Instance>> = HashMap::new();
        if !keys.is_empty() {
            let statement = build_relation_select(
                relation,
                &target,
                &keys,
                join.options.visibility(inherited),
                &join.options.order_by,
                dal.dialect(),
            )?;
            let rows = dal.fetch_all(conn.as_deref_mut(), &statement).await?;
            let fields = relation_fields(relation, &target);
            for row in &rows {
                let (key, record) = if relation.through_table().is_some() {
                    let key = decode_value(row, 0, source_def)?;
                    (key, decode_row(row, &fields, 1)?)
                } else {
                    let record = decode_row(row, &fields, 0)?;
                    let key = record
                        .get(relation.target_key())
                        .cloned()
                        .unwrap_or_default();
                    (key, record)
                };
                grouped
                    .entry(key.key_string())
                    .or_default()
                    .push(Instance::loaded(target_model.clone(), record));
            }
            tracing::debug!(
                table = manifest.table_name(),
                relation = relation.name(),
                keys = keys.len(),
                rows = rows.len(),
                "relation loaded"
            );
        }

        for instance in instances.iter_mut() {
            let related = instance
                .get_value(relation.source_key())
                .filter(|v| !v.is_null())
                .and_then(|v| grouped.get(&v.key_string()))
                .cloned()
                .unwrap_or_default();
            let related = match relation.cardinality() {
                Cardinality::One => Related::One(related.into_iter().next().map(Box::new)),
                Cardinality::Many => Related::Many(related),
            };
            instance.set_related(relation.name(), related);
        }
    }
    Ok(())
}
