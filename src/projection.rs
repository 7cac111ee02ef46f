//! Field projections: which attributes a caller needs, and how the
//! projections of one batch are combined into a single bulk read.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{error::LoadError, record::Record};

/// The set of attributes a caller needs from an entity. The empty spec
/// means "every attribute".
///
/// The set is ordered so that equal field sets always hash and compare
/// equal, whatever order the fields were requested in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectionSpec(BTreeSet<String>);

impl ProjectionSpec {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_all(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, field: impl Into<String>) {
        self.0.insert(field.into());
    }

    pub fn contains(&self, field: &str) -> bool {
        self.is_all() || self.0.contains(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Smallest spec that covers both. Anything unioned with "all" is "all".
    pub fn union(&self, other: &ProjectionSpec) -> ProjectionSpec {
        if self.is_all() || other.is_all() {
            return ProjectionSpec::all();
        }

        ProjectionSpec(self.0.union(&other.0).cloned().collect())
    }

    /// True if every attribute of `other` is also covered by `self`.
    pub fn covers(&self, other: &ProjectionSpec) -> bool {
        self.is_all() || (!other.is_all() && other.0.is_subset(&self.0))
    }
}

impl<S: Into<String>> FromIterator<S> for ProjectionSpec {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        ProjectionSpec(iter.into_iter().map(Into::into).collect())
    }
}

/// Maps the relationship fields of an entity type to the stored attribute
/// that backs them: `company -> companyId` for a many-to-one reference,
/// `users -> _id` for a one-to-many relation resolved from the parent's key.
#[derive(Debug, Clone, Default)]
pub struct RelationMap(HashMap<String, String>);

impl RelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relation(mut self, field: impl Into<String>, backing: impl Into<String>) -> Self {
        self.0.insert(field.into(), backing.into());
        self
    }

    pub fn backing_attribute(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }
}

/// Turn the output fields a caller requested into the attributes the store
/// has to return: relationship fields become their backing attribute, every
/// other field passes through unchanged.
pub fn derive_projection<'a>(
    requested: impl IntoIterator<Item = &'a str>,
    relations: &RelationMap,
) -> ProjectionSpec {
    requested
        .into_iter()
        .map(|field| relations.backing_attribute(field).unwrap_or(field))
        .collect()
}

/// How to fetch a batch whose callers asked for different projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionPolicy {
    /// Fetch the union of every projection in the batch, then hand each
    /// caller only the attributes it asked for.
    #[default]
    Union,

    /// Fetch with the projection of the first key in the batch and hand that
    /// result to everyone. Callers that asked for more than the first caller
    /// receive fewer attributes than they requested.
    FirstKey,

    /// Fail the whole batch if its callers disagree on the projection.
    Reject,
}

impl ProjectionPolicy {
    /// The projection to apply to the bulk read for a batch, given the
    /// projections of its keys in first-request order.
    pub fn fetch_projection<'a>(
        &self,
        collection: &str,
        specs: impl IntoIterator<Item = &'a ProjectionSpec>,
    ) -> Result<ProjectionSpec, LoadError> {
        let mut specs = specs.into_iter();

        match self {
            ProjectionPolicy::Union => {
                let first = specs.next().cloned().unwrap_or_default();
                Ok(specs.fold(first, |acc, spec| acc.union(spec)))
            }
            ProjectionPolicy::FirstKey => Ok(specs.next().cloned().unwrap_or_default()),
            ProjectionPolicy::Reject => {
                let distinct: HashSet<&ProjectionSpec> = specs.collect();
                match distinct.len() {
                    0 => Ok(ProjectionSpec::all()),
                    1 => Ok(distinct.into_iter().next().cloned().unwrap_or_default()),
                    count => {
                        warn!(collection, distinct = count, "rejecting batch with mixed projections");
                        Err(LoadError::HeterogeneousProjection {
                            collection: collection.to_owned(),
                            distinct: count,
                        })
                    }
                }
            }
        }
    }

    /// What a caller that asked for `requested` receives from a record
    /// fetched with this batch's projection.
    pub fn deliver(&self, record: &Record, requested: &ProjectionSpec) -> Record {
        match self {
            ProjectionPolicy::Union => record.project(requested),
            ProjectionPolicy::FirstKey | ProjectionPolicy::Reject => record.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn spec(fields: &[&str]) -> ProjectionSpec {
        fields.iter().copied().collect()
    }

    fn company_relations() -> RelationMap {
        RelationMap::new().relation("users", "_id")
    }

    fn user_relations() -> RelationMap {
        RelationMap::new().relation("company", "companyId")
    }

    #[test]
    fn relationship_fields_become_their_foreign_key() {
        let projection = derive_projection(["firstName", "company"], &user_relations());
        assert_eq!(projection, spec(&["companyId", "firstName"]));

        let projection = derive_projection(["name", "users"], &company_relations());
        assert_eq!(projection, spec(&["_id", "name"]));
    }

    #[test]
    fn field_order_does_not_matter() {
        assert_eq!(spec(&["a", "b"]), spec(&["b", "a", "b"]));
    }

    #[test]
    fn union_with_all_is_all() {
        assert!(spec(&["a"]).union(&ProjectionSpec::all()).is_all());
        assert_eq!(spec(&["a"]).union(&spec(&["b"])), spec(&["a", "b"]));
        assert!(spec(&["a", "b"]).covers(&spec(&["b"])));
        assert!(!spec(&["a"]).covers(&ProjectionSpec::all()));
        assert!(ProjectionSpec::all().covers(&spec(&["z"])));
    }

    #[test]
    fn fetch_projection_per_policy() {
        let specs = [spec(&["name"]), spec(&["slogan"]), spec(&["name"])];

        assert_eq!(
            ProjectionPolicy::Union.fetch_projection("companies", &specs).unwrap(),
            spec(&["name", "slogan"])
        );
        assert_eq!(
            ProjectionPolicy::FirstKey.fetch_projection("companies", &specs).unwrap(),
            spec(&["name"])
        );
        assert_eq!(
            ProjectionPolicy::Reject.fetch_projection("companies", &specs),
            Err(LoadError::HeterogeneousProjection {
                collection: "companies".into(),
                distinct: 2
            })
        );
        assert_eq!(
            ProjectionPolicy::Reject
                .fetch_projection("companies", &specs[..1])
                .unwrap(),
            spec(&["name"])
        );
    }

    #[test]
    fn union_delivers_only_requested_fields() {
        let record = Record::new()
            .with("_id", "c1")
            .with("name", "Acme")
            .with("slogan", "Things");

        let delivered = ProjectionPolicy::Union.deliver(&record, &spec(&["slogan"]));
        assert_eq!(delivered, Record::new().with("_id", "c1").with("slogan", "Things"));

        let delivered = ProjectionPolicy::FirstKey.deliver(&record, &spec(&["slogan"]));
        assert_eq!(delivered, record);
    }
}
