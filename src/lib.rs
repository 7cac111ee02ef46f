//! Entityloader is a request-scoped implementation of the
//! [dataloader pattern](https://github.com/graphql/dataloader) for graph
//! APIs backed by a document store. When resolving one request touches the
//! same kind of entity many times (a list of users, each resolving its
//! company), every individual "load by key" call is coalesced into a single
//! bulk read per scheduling tick, duplicate keys are fetched once, and each
//! caller gets back exactly the value for its own key.
//!
//! ## Overview
//!
//! The core is [`BatchController`], a generic keyed batch loader. It is
//! configured with a batch function, which receives a [`KeySet`] holding the
//! distinct keys of one batch (in first-request order) and returns a
//! [`ValueSet`]. The only way to build a `ValueSet` is through the methods on
//! `KeySet`, and each of them guarantees one value per key, so a batch
//! function can't hand one caller's data to another.
//!
//! ```
//! use entityloader::{BatchController, BatchRules, KeySet, ValueSet};
//! use futures::{executor::block_on, join};
//!
//! async fn stringify(keys: KeySet<u32>) -> Result<ValueSet<String>, ()> {
//!     Ok(keys.into_values(|key| key.to_string()))
//! }
//!
//! let controller = BatchController::new(BatchRules::new(stringify));
//!
//! let (a, b) = block_on(async { join!(controller.load(1), controller.load(2)) });
//! assert_eq!(a, Ok("1".to_string()));
//! assert_eq!(b, Ok("2".to_string()));
//! ```
//!
//! Two specializations cover the shapes a resolver needs:
//!
//! - [`EntityLoader`] loads single records by id, fetching only the fields
//!   the callers asked for (see [`ProjectionPolicy`] for how differing field
//!   sets in one batch are combined). Malformed ids never reach the store
//!   and load as `None`.
//! - [`GroupLoader`] loads every record that references a parent id through
//!   a foreign key, partitioning one bulk read back into per-parent groups.
//!
//! Both read through an [`EntityStore`]. [`RequestContext`] bundles one of
//! each for the user/company schema and is meant to be built once per
//! incoming request.
//!
//! ## Design notes
//!
//! ### Poll-driven batching
//!
//! Nothing is spawned: all the work is driven by polling [`BatchFuture`]s.
//! The first future to poll a batch becomes its driver. It waits out the
//! batch window (by default a single scheduler tick, so every sibling future
//! polled in the same round lands in the same batch), calls the batch
//! function and polls it to completion. The other futures sleep until the
//! result is in. If the driver is dropped, another future is woken to take
//! over, and any future that is polled a second time advances the batch
//! itself, so an idle driver never holds the others up.
//!
//! ### Caching
//!
//! With caching enabled (the default), a controller remembers every key it
//! has loaded. Loading the same key again returns a future bound to the same
//! result, whether that is still pending or already resolved; see
//! [`BatchFuture::shares_result_with`]. A cached failure is evicted the next
//! time its key is loaded, so the key is fetched again. Because the cache
//! lives as long as the controller, controllers should be request-scoped.

mod batch;
mod config;
mod context;
mod data;
mod entity;
mod error;
mod group;
pub mod logging;
mod projection;
mod record;
mod store;
mod wakerset;
mod window;

pub use batch::{BatchController, BatchFuture, BatchRules};
pub use config::{LoaderConfig, RetryPolicy};
pub use context::{company_relations, user_relations, RequestContext, COMPANIES, COMPANY_ID, USERS};
pub use data::{IntoValuesError, KeySet, KeyedEntry, OnDuplicate, ValueSet};
pub use entity::{EntityFuture, EntityKey, EntityLoader};
pub use error::{ConfigError, LoadError, LoadResult, StoreError, StoreResult};
pub use group::{GroupFuture, GroupLoader};
pub use projection::{derive_projection, ProjectionPolicy, ProjectionSpec, RelationMap};
pub use record::{is_object_id, IdFormat, Record, ID_FIELD};
pub use store::{EntityStore, MemoryStore, RetryingStore};
pub use window::Window;
