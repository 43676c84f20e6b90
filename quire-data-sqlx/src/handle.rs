use std::sync::{Arc, Mutex, PoisonError};

use quire_data::{DataError, Manifest, ManifestSource, Predicate, Record};
use uuid::Uuid;

use crate::dal::Dal;
use crate::instance::Instance;
use crate::model::{CreateOptions, Model};
use crate::query::Query;

/// A model declared in a `static`, bound lazily to the active [`Dal`].
///
/// The manifest source must hand out the same `Arc` on every call (build the
/// manifest inside a `LazyLock`), so that registering it again is a no-op.
///
/// ```ignore
/// static THINGS_MANIFEST: LazyLock<Result<Arc<Manifest>, ManifestError>> =
///     LazyLock::new(|| Manifest::builder("things").revisioned().build());
///
/// fn things_manifest() -> Result<Arc<Manifest>, ManifestError> {
///     THINGS_MANIFEST.clone()
/// }
///
/// pub static THINGS: ModelHandle = ModelHandle::new(things_manifest);
///
/// dal.activate();
/// let thing = THINGS.get(id).await?;
/// ```
///
/// The bound model is cached per DAL generation: after a disconnect and a
/// new connect, the next use registers the manifest with the new DAL.
pub struct ModelHandle {
    source: ManifestSource,
    cached: Mutex<Option<Model>>,
}

impl ModelHandle {
    pub const fn new(source: ManifestSource) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    pub fn manifest(&self) -> Result<Arc<Manifest>, DataError> {
        Ok((self.source)()?)
    }

    /// The model bound to the active DAL, registering its manifest on first
    /// use. Fails with [`DataError::Disconnected`] when no DAL is active.
    pub fn resolve(&self) -> Result<Model, DataError> {
        let dal = Dal::active()?;
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(model) = cached.as_ref() {
            if model.dal().generation() == dal.generation() {
                return Ok(model.clone());
            }
        }
        let model = dal.model(self.manifest()?)?;
        tracing::debug!(
            table = model.table_name(),
            generation = dal.generation(),
            "model handle bound"
        );
        *cached = Some(model.clone());
        Ok(model)
    }

    pub async fn create(&self, record: Record, options: CreateOptions) -> Result<Instance, DataError> {
        self.resolve()?.create(record, options).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Instance, DataError> {
        self.resolve()?.get(id).await
    }

    pub fn query(&self) -> Result<Query, DataError> {
        Ok(self.resolve()?.query())
    }

    pub fn filter_where(&self, predicate: impl Into<Predicate>) -> Result<Query, DataError> {
        Ok(self.resolve()?.filter_where(predicate))
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bound = self
            .cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|m| m.dal().generation());
        f.debug_struct("ModelHandle")
            .field("bound_generation", &bound)
            .finish()
    }
}
