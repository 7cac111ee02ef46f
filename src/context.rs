//! Per-request loaders and the relationship resolvers built on them.
//!
//! The schema has two entity types: users, which may reference a company
//! through `companyId`, and companies, which list their users. A
//! [`RequestContext`] is created for every incoming request, so the batches
//! and caches of one request are never visible to another.

use std::sync::Arc;

use crate::{
    config::LoaderConfig,
    entity::EntityLoader,
    error::LoadResult,
    group::GroupLoader,
    projection::{derive_projection, ProjectionSpec, RelationMap},
    record::{Record, ID_FIELD},
    store::{EntityStore, RetryingStore},
};

pub const USERS: &str = "users";
pub const COMPANIES: &str = "companies";
pub const COMPANY_ID: &str = "companyId";

/// Relationship fields of the User type: `company` is backed by
/// `companyId`.
pub fn user_relations() -> RelationMap {
    RelationMap::new().relation("company", COMPANY_ID)
}

/// Relationship fields of the Company type: `users` is resolved from the
/// company's own `_id`.
pub fn company_relations() -> RelationMap {
    RelationMap::new().relation("users", ID_FIELD)
}

pub struct RequestContext {
    pub companies: EntityLoader,
    pub users_by_company: GroupLoader,
    company_relations: RelationMap,
    user_relations: RelationMap,
}

impl RequestContext {
    /// Loaders for one request. Bulk reads go through `store`, retried
    /// according to `config.retry`.
    pub fn new(store: Arc<dyn EntityStore>, config: &LoaderConfig) -> Self {
        let store: Arc<dyn EntityStore> = Arc::new(RetryingStore::new(store, config.retry));

        Self {
            companies: EntityLoader::new(Arc::clone(&store), COMPANIES, config),
            users_by_company: GroupLoader::new(store, USERS, COMPANY_ID, config),
            company_relations: company_relations(),
            user_relations: user_relations(),
        }
    }

    /// The attributes to read for a user when `requested` are the output
    /// fields selected on it.
    pub fn user_projection<'a>(&self, requested: impl IntoIterator<Item = &'a str>) -> ProjectionSpec {
        derive_projection(requested, &self.user_relations)
    }

    /// The attributes to read for a company when `requested` are the output
    /// fields selected on it.
    pub fn company_projection<'a>(
        &self,
        requested: impl IntoIterator<Item = &'a str>,
    ) -> ProjectionSpec {
        derive_projection(requested, &self.company_relations)
    }

    /// `User.company`: the company the user references, limited to the
    /// fields selected on it. A user without a `companyId` has no company.
    pub async fn resolve_user_company(
        &self,
        user: &Record,
        requested: &[&str],
    ) -> LoadResult<Option<Record>> {
        let company_id = match user.get_str(COMPANY_ID) {
            Some(id) if !id.is_empty() => id,
            _ => return Ok(None),
        };

        let projection = self.company_projection(requested.iter().copied());
        self.companies.load(company_id, projection).await
    }

    /// `Company.users`: every user that references the company, each
    /// limited to the fields selected on it.
    pub async fn resolve_company_users(
        &self,
        company: &Record,
        requested: &[&str],
    ) -> LoadResult<Vec<Record>> {
        let id = match company.id() {
            Some(id) => id,
            None => return Ok(Vec::new()),
        };

        let projection = self.user_projection(requested.iter().copied());
        let users = self.users_by_company.load(id).await?;
        Ok(users.iter().map(|user| user.project(&projection)).collect())
    }
}
