//! The bulk-read collaborator the loaders fetch through.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use futures_timer::Delay;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::{
    config::RetryPolicy,
    error::StoreResult,
    projection::ProjectionSpec,
    record::Record,
};

/// Bulk reads against the persistence engine. Records may come back in any
/// order. Ids are validated by the loaders before they get here.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Records of `collection` whose `_id` is one of `ids`, limited to the
    /// attributes in `projection` (plus `_id`).
    async fn find_by_ids(
        &self,
        collection: &str,
        ids: &[String],
        projection: &ProjectionSpec,
    ) -> StoreResult<Vec<Record>>;

    /// Records of `collection` whose `field` holds one of `values`.
    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        values: &[String],
    ) -> StoreResult<Vec<Record>>;
}

#[async_trait]
impl<S: EntityStore + ?Sized> EntityStore for Arc<S> {
    async fn find_by_ids(
        &self,
        collection: &str,
        ids: &[String],
        projection: &ProjectionSpec,
    ) -> StoreResult<Vec<Record>> {
        (**self).find_by_ids(collection, ids, projection).await
    }

    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        values: &[String],
    ) -> StoreResult<Vec<Record>> {
        (**self).find_by_field(collection, field, values).await
    }
}

/// An in-memory [`EntityStore`]. Records are returned in insertion order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Record>>>,
    queries: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(
        self,
        collection: impl Into<String>,
        records: impl IntoIterator<Item = Record>,
    ) -> Self {
        self.collections
            .write()
            .entry(collection.into())
            .or_default()
            .extend(records);
        self
    }

    pub fn insert(&self, collection: impl Into<String>, record: Record) {
        self.collections
            .write()
            .entry(collection.into())
            .or_default()
            .push(record);
    }

    /// Number of bulk reads served so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn find_by_ids(
        &self,
        collection: &str,
        ids: &[String],
        projection: &ProjectionSpec,
    ) -> StoreResult<Vec<Record>> {
        self.queries.fetch_add(1, Ordering::SeqCst);

        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let collections = self.collections.read();

        Ok(collections
            .get(collection)
            .into_iter()
            .flatten()
            .filter(|record| record.id().map_or(false, |id| wanted.contains(id)))
            .map(|record| record.project(projection))
            .collect())
    }

    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        values: &[String],
    ) -> StoreResult<Vec<Record>> {
        self.queries.fetch_add(1, Ordering::SeqCst);

        let wanted: HashSet<&str> = values.iter().map(String::as_str).collect();
        let collections = self.collections.read();

        Ok(collections
            .get(collection)
            .into_iter()
            .flatten()
            .filter(|record| record.get_str(field).map_or(false, |v| wanted.contains(v)))
            .cloned()
            .collect())
    }
}

/// Wraps a store so that transient failures are retried, with a fixed
/// pause between attempts, before they reach a loader.
#[derive(Debug)]
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

async fn with_retry<T, F, Fut>(policy: RetryPolicy, operation: &str, mut attempt: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempts = 1;

    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempts < policy.max_attempts => {
                warn!(operation, attempt = attempts, error = %err, "retrying bulk read");
                attempts += 1;
                Delay::new(policy.backoff()).await;
            }
            Err(err) => {
                debug!(operation, attempts, error = %err, "bulk read failed");
                return Err(err);
            }
        }
    }
}

#[async_trait]
impl<S: EntityStore> EntityStore for RetryingStore<S> {
    async fn find_by_ids(
        &self,
        collection: &str,
        ids: &[String],
        projection: &ProjectionSpec,
    ) -> StoreResult<Vec<Record>> {
        with_retry(self.policy, "find_by_ids", || {
            self.inner.find_by_ids(collection, ids, projection)
        })
        .await
    }

    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        values: &[String],
    ) -> StoreResult<Vec<Record>> {
        with_retry(self.policy, "find_by_field", || {
            self.inner.find_by_field(collection, field, values)
        })
        .await
    }
}
