//! Turning a changed entity into the index entries it invalidates.

use std::sync::Arc;

use async_trait::async_trait;
use twinhub_db::{DbError, MemoryJournal, PgJournal};
use twinhub_types::{ChangeRecord, EntityId, EntityKind, ReferenceTag};

/// Secondary index from a policy key to the things currently bound to it.
#[async_trait]
pub trait BindingIndex: Send + Sync {
    /// Live things whose latest `policy_id` is `policy_key`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the index cannot be queried.
    async fn things_bound_to(&self, policy_key: &str) -> Result<Vec<EntityId>, DbError>;
}

#[async_trait]
impl BindingIndex for PgJournal {
    async fn things_bound_to(&self, policy_key: &str) -> Result<Vec<EntityId>, DbError> {
        Self::things_bound_to(self, policy_key).await
    }
}

#[async_trait]
impl BindingIndex for MemoryJournal {
    async fn things_bound_to(&self, policy_key: &str) -> Result<Vec<EntityId>, DbError> {
        Self::things_bound_to(self, policy_key).await
    }
}

/// Maps one change to the reference tags it produces.
#[async_trait]
pub trait DependencyResolver: Send + Sync {
    /// Tags for every index entry made stale by `change`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if a lookup needed for the mapping fails.
    async fn resolve(&self, change: &ChangeRecord) -> Result<Vec<ReferenceTag>, DbError>;
}

/// The changed entity is its own index entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfReference;

#[async_trait]
impl DependencyResolver for SelfReference {
    async fn resolve(&self, change: &ChangeRecord) -> Result<Vec<ReferenceTag>, DbError> {
        Ok(vec![ReferenceTag::for_self(change)])
    }
}

/// A changed policy invalidates every thing bound to it.
///
/// The join is point-in-time. A thing that rebinds right after the lookup
/// emits its own change and is picked up by the thing stream.
pub struct PolicyBindingResolver {
    index: Arc<dyn BindingIndex>,
}

impl PolicyBindingResolver {
    /// Resolve through `index`.
    pub const fn new(index: Arc<dyn BindingIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl DependencyResolver for PolicyBindingResolver {
    async fn resolve(&self, change: &ChangeRecord) -> Result<Vec<ReferenceTag>, DbError> {
        let bound = self.index.things_bound_to(&change.entity_id.key).await?;
        Ok(bound
            .into_iter()
            .map(|thing| ReferenceTag::referencing(thing, change))
            .collect())
    }
}

/// The resolver a stream over `kind` should use.
pub fn resolver_for(kind: EntityKind, index: Arc<dyn BindingIndex>) -> Arc<dyn DependencyResolver> {
    match kind {
        EntityKind::Policy => Arc::new(PolicyBindingResolver::new(index)),
        EntityKind::Connection | EntityKind::Thing => Arc::new(SelfReference),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use twinhub_db::EntityJournal;
    use twinhub_types::{Event, EventPayload, Thing};

    use super::*;

    fn change(id: EntityId, revision: u64) -> ChangeRecord {
        ChangeRecord {
            entity_id: id,
            timestamp: Utc::now(),
            revision,
        }
    }

    async fn bind(journal: &MemoryJournal, thing: &str, policy: &str) {
        let id = EntityId::thing(thing);
        let payload = EventPayload::ThingCreated {
            thing: Thing {
                policy_id: Some(policy.to_owned()),
                ..Thing::default()
            },
        };
        let event = Event {
            entity_id: id,
            revision: 1,
            timestamp: Utc::now(),
            payload,
        };
        journal.append(&event).await.unwrap();
    }

    #[tokio::test]
    async fn things_resolve_to_themselves() {
        let resolver = resolver_for(EntityKind::Thing, Arc::new(MemoryJournal::new()));
        let tags = resolver
            .resolve(&change(EntityId::thing("ns:t"), 2))
            .await
            .unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags.first().unwrap().target, EntityId::thing("ns:t"));
    }

    #[tokio::test]
    async fn policy_fans_out_to_bound_things_only() {
        let journal = Arc::new(MemoryJournal::new());
        bind(&journal, "ns:a", "ns:p").await;
        bind(&journal, "ns:b", "ns:p").await;
        bind(&journal, "ns:c", "ns:other").await;

        let resolver = resolver_for(EntityKind::Policy, journal);
        let tags = resolver
            .resolve(&change(EntityId::policy("ns:p"), 5))
            .await
            .unwrap();

        let targets: Vec<String> = tags.iter().map(|t| t.target.to_string()).collect();
        assert_eq!(targets, vec!["thing:ns:a", "thing:ns:b"]);
        assert!(tags.iter().all(|t| t.cause == EntityId::policy("ns:p") && t.cause_revision == 5));
    }

    #[tokio::test]
    async fn unbound_policy_resolves_to_nothing() {
        let resolver = resolver_for(EntityKind::Policy, Arc::new(MemoryJournal::new()));
        let tags = resolver
            .resolve(&change(EntityId::policy("ns:lonely"), 1))
            .await
            .unwrap();
        assert!(tags.is_empty());
    }
}
