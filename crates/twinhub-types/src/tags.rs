//! Change records and reference tags exchanged with the sync streams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EntityId, Revision};

/// One changed entity, as reported by a change source.
///
/// Carries the entity's latest revision inside the queried window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// The changed entity.
    pub entity_id: EntityId,
    /// Timestamp of the change.
    pub timestamp: DateTime<Utc>,
    /// Revision reached by the change.
    pub revision: Revision,
}

/// Notification that `target`'s index entry may be stale because `cause`
/// changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceTag {
    /// Entity whose index entry must be refreshed.
    pub target: EntityId,
    /// Entity whose change triggered the refresh.
    pub cause: EntityId,
    /// Revision of the cause.
    pub cause_revision: Revision,
    /// When the cause changed.
    pub cause_timestamp: DateTime<Utc>,
}

impl ReferenceTag {
    /// A tag whose target is the changed entity itself.
    pub fn for_self(change: &ChangeRecord) -> Self {
        Self {
            target: change.entity_id.clone(),
            cause: change.entity_id.clone(),
            cause_revision: change.revision,
            cause_timestamp: change.timestamp,
        }
    }

    /// A tag pointing `target` at the changed entity.
    pub fn referencing(target: EntityId, change: &ChangeRecord) -> Self {
        Self {
            target,
            cause: change.entity_id.clone(),
            cause_revision: change.revision,
            cause_timestamp: change.timestamp,
        }
    }

    /// Identity of this notification.
    ///
    /// Two deliveries with the same key carry the same information, which
    /// is what lets the broker and the indexer drop duplicates.
    pub fn dedupe_key(&self) -> String {
        format!("{}|{}|{}", self.target, self.cause, self.cause_revision)
    }
}
