//! Loading single entities by id, fetching only the attributes the callers
//! asked for.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, error};

use crate::{
    batch::{BatchController, BatchFuture},
    config::LoaderConfig,
    data::{IntoValuesError, KeySet, ValueSet},
    error::LoadError,
    projection::{ProjectionPolicy, ProjectionSpec},
    record::{IdFormat, Record},
    store::EntityStore,
};

/// One entity load: the id, and the attributes the caller needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub id: String,
    pub projection: ProjectionSpec,
}

type EntityFetch = BoxFuture<'static, Result<ValueSet<Option<Record>>, LoadError>>;
type EntityBatcher = Box<dyn Fn(KeySet<EntityKey>) -> EntityFetch + Send + Sync>;

pub type EntityFuture =
    BatchFuture<EntityKey, Option<Record>, LoadError, EntityFetch, EntityBatcher>;

/// Loads entities of one collection by id. All the loads issued in one
/// window become a single `find_by_ids` read. Unknown or malformed ids load
/// as `None`. A record the batch didn't ask for fails the whole batch with
/// an integrity error, as it does for [`GroupLoader`][crate::GroupLoader].
pub struct EntityLoader {
    collection: Arc<str>,
    controller: BatchController<EntityKey, Option<Record>, LoadError, EntityFetch, EntityBatcher>,
}

impl EntityLoader {
    pub fn new(
        store: Arc<dyn EntityStore>,
        collection: impl Into<String>,
        config: &LoaderConfig,
    ) -> Self {
        let collection: Arc<str> = collection.into().into();
        let policy = config.projection_policy;
        let id_format = config.id_format;

        let batcher: EntityBatcher = {
            let collection = Arc::clone(&collection);
            Box::new(move |keys| {
                fetch_entities(
                    Arc::clone(&store),
                    Arc::clone(&collection),
                    policy,
                    id_format,
                    keys,
                )
                .boxed()
            })
        };

        Self {
            collection,
            controller: BatchController::new(config.rules(batcher)),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Load the entity `id` with (at least) the attributes in `projection`.
    pub fn load(&self, id: impl Into<String>, projection: ProjectionSpec) -> EntityFuture {
        self.controller.load(EntityKey {
            id: id.into(),
            projection,
        })
    }

    /// Load the entity `id` with every attribute.
    pub fn load_all(&self, id: impl Into<String>) -> EntityFuture {
        self.load(id, ProjectionSpec::all())
    }

    pub fn controller(
        &self,
    ) -> &BatchController<EntityKey, Option<Record>, LoadError, EntityFetch, EntityBatcher> {
        &self.controller
    }
}

async fn fetch_entities(
    store: Arc<dyn EntityStore>,
    collection: Arc<str>,
    policy: ProjectionPolicy,
    id_format: IdFormat,
    keys: KeySet<EntityKey>,
) -> Result<ValueSet<Option<Record>>, LoadError> {
    // Malformed ids take no part in the read, nor in choosing its
    // projection. They load as None.
    if !keys.keys().any(|key| id_format.accepts(&key.id)) {
        debug!(collection = %collection, keys = keys.len(), "no valid ids in batch");
        return Ok(keys.into_values(|_| None));
    }

    let (projection, ids) = {
        let valid: Vec<&EntityKey> = keys
            .keys()
            .filter(|key| id_format.accepts(&key.id))
            .collect();

        let projection =
            policy.fetch_projection(&collection, valid.iter().map(|key| &key.projection))?;

        // The same id may appear under several projections.
        let mut seen = HashSet::new();
        let ids: Vec<String> = valid
            .iter()
            .map(|key| key.id.as_str())
            .filter(|id| seen.insert(*id))
            .map(str::to_owned)
            .collect();

        (projection, ids)
    };

    debug!(
        collection = %collection,
        keys = keys.len(),
        ids = ids.len(),
        "loading entities"
    );

    let records = store.find_by_ids(&collection, &ids, &projection).await?;

    let requested: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let mut by_id: HashMap<&str, &Record> = HashMap::with_capacity(records.len());
    for record in &records {
        match record.id() {
            Some(id) if requested.contains(id) => {
                by_id.entry(id).or_insert(record);
            }
            id => {
                let err = IntoValuesError::UnknownKey {
                    key: format!("{:?}", id.unwrap_or_default()),
                };
                error!(collection = %collection, error = %err, "bulk read does not match the requested ids");
                return Err(err.into());
            }
        }
    }

    Ok(keys.into_values(|key| {
        by_id
            .get(key.id.as_str())
            .map(|record| policy.deliver(record, &key.projection))
    }))
}
