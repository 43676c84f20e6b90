use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::ManifestError;
use crate::manifest::{Manifest, RelationTarget};

/// Table name → manifest map shared by one data access layer.
///
/// Cloning is cheap; every clone sees the same entries.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<Manifest>>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a manifest under its table name.
    ///
    /// Registering the same `Arc` twice is a no-op; a different manifest for
    /// an already registered table is rejected.
    pub fn register(&self, manifest: Arc<Manifest>) -> Result<(), ManifestError> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match map.get(manifest.table_name()) {
            Some(existing) if Arc::ptr_eq(existing, &manifest) => Ok(()),
            Some(_) => Err(ManifestError::Duplicate {
                table: manifest.table_name().to_string(),
            }),
            None => {
                tracing::debug!(table = manifest.table_name(), "manifest registered");
                map.insert(manifest.table_name().to_string(), manifest);
                Ok(())
            }
        }
    }

    pub fn get(&self, table: &str) -> Option<Arc<Manifest>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
    }

    /// Resolve a relation target. Lazy targets are registered on first
    /// resolution.
    pub fn resolve(&self, target: &RelationTarget) -> Result<Arc<Manifest>, ManifestError> {
        match target {
            RelationTarget::Table(table) => self.get(table).ok_or_else(|| {
                ManifestError::invalid(table.clone(), "relation target is not registered")
            }),
            RelationTarget::Lazy(source) => {
                let manifest = source()?;
                if let Some(existing) = self.get(manifest.table_name()) {
                    return Ok(existing);
                }
                self.register(manifest.clone())?;
                Ok(manifest)
            }
        }
    }

    /// Check that every relation of `manifest` points at a resolvable target
    /// declaring the relation's target key.
    pub fn validate(&self, manifest: &Manifest) -> Result<(), ManifestError> {
        for relation in manifest.relations() {
            let target = self.resolve(relation.target()).map_err(|err| {
                ManifestError::invalid(
                    manifest.table_name(),
                    format!("relation `{}`: {err}", relation.name()),
                )
            })?;
            match target.field(relation.target_key()) {
                Some(field) if !field.is_virtual() => {}
                _ => {
                    return Err(ManifestError::invalid(
                        manifest.table_name(),
                        format!(
                            "relation `{}` targets unknown field `{}` on `{}`",
                            relation.name(),
                            relation.target_key(),
                            target.table_name()
                        ),
                    ))
                }
            }
        }
        Ok(())
    }

    pub fn clear(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Registered table names, sorted.
    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        tables.sort();
        tables
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("tables", &self.tables())
            .finish()
    }
}
