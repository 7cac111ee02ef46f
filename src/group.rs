//! Loading all the children that reference a parent through a foreign key.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, error};

use crate::{
    batch::{BatchController, BatchFuture},
    config::LoaderConfig,
    data::{KeySet, ValueSet},
    error::LoadError,
    record::{IdFormat, Record},
    store::EntityStore,
};

type GroupFetch = BoxFuture<'static, Result<ValueSet<Vec<Record>>, LoadError>>;
type GroupBatcher = Box<dyn Fn(KeySet<String>) -> GroupFetch + Send + Sync>;

pub type GroupFuture = BatchFuture<String, Vec<Record>, LoadError, GroupFetch, GroupBatcher>;

/// Loads, for a parent id, every record of `collection` whose `foreign_key`
/// attribute holds that id. The loads of one window become a single
/// `find_by_field` read whose result is partitioned back per parent. A
/// parent without children gets an empty group.
pub struct GroupLoader {
    collection: Arc<str>,
    foreign_key: Arc<str>,
    controller: BatchController<String, Vec<Record>, LoadError, GroupFetch, GroupBatcher>,
}

impl GroupLoader {
    pub fn new(
        store: Arc<dyn EntityStore>,
        collection: impl Into<String>,
        foreign_key: impl Into<String>,
        config: &LoaderConfig,
    ) -> Self {
        let collection: Arc<str> = collection.into().into();
        let foreign_key: Arc<str> = foreign_key.into().into();
        let id_format = config.id_format;

        let batcher: GroupBatcher = {
            let collection = Arc::clone(&collection);
            let foreign_key = Arc::clone(&foreign_key);
            Box::new(move |keys| {
                fetch_groups(
                    Arc::clone(&store),
                    Arc::clone(&collection),
                    Arc::clone(&foreign_key),
                    id_format,
                    keys,
                )
                .boxed()
            })
        };

        Self {
            collection,
            foreign_key,
            controller: BatchController::new(config.rules(batcher)),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn foreign_key(&self) -> &str {
        &self.foreign_key
    }

    pub fn load(&self, parent_id: impl Into<String>) -> GroupFuture {
        self.controller.load(parent_id.into())
    }

    pub fn controller(
        &self,
    ) -> &BatchController<String, Vec<Record>, LoadError, GroupFetch, GroupBatcher> {
        &self.controller
    }
}

async fn fetch_groups(
    store: Arc<dyn EntityStore>,
    collection: Arc<str>,
    foreign_key: Arc<str>,
    id_format: IdFormat,
    keys: KeySet<String>,
) -> Result<ValueSet<Vec<Record>>, LoadError> {
    let parents: Vec<String> = keys
        .keys()
        .filter(|id| id_format.accepts(id))
        .cloned()
        .collect();

    debug!(
        collection = %collection,
        foreign_key = %foreign_key,
        parents = parents.len(),
        "loading groups"
    );

    let records = if parents.is_empty() {
        Vec::new()
    } else {
        store
            .find_by_field(&collection, &foreign_key, &parents)
            .await?
    };

    keys.groups_from_iter(records, |record| record.get_str(&foreign_key))
        .map_err(|err| {
            error!(collection = %collection, error = %err, "bulk read does not match the requested parents");
            LoadError::from(err)
        })
}
