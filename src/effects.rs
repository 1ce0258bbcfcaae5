//! Mutation effects and their broadcast.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::identity::InstanceKey;
use crate::reactive::ReactiveRegistry;

/// Tables changed by one completed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectRecord {
    pub origin: InstanceKey,
    pub mutated_tables: BTreeSet<String>,
    /// The whole database was replaced (import, delete, reinitialize).
    pub database_replaced: bool,
}

impl EffectRecord {
    /// Whether a query reading `read_tables` must re-run.
    #[must_use]
    pub fn affects(&self, read_tables: &BTreeSet<String>) -> bool {
        self.database_replaced || !self.mutated_tables.is_disjoint(read_tables)
    }
}

/// Which signal decides the tables in an [`EffectRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectSource {
    /// Only tables the engine's change hook reported.
    #[default]
    Engine,
    /// Hook tables plus the statically mutated tables of every successful statement.
    EngineAndStatic,
}

/// Publishing side of the effect channel for one client.
pub(crate) struct EffectBus {
    origin: InstanceKey,
    sender: broadcast::Sender<EffectRecord>,
    enabled: bool,
}

impl EffectBus {
    pub(crate) fn new(
        origin: InstanceKey,
        sender: broadcast::Sender<EffectRecord>,
        enabled: bool,
    ) -> Self {
        Self {
            origin,
            sender,
            enabled,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<EffectRecord> {
        self.sender.subscribe()
    }

    /// Deliver a mutation to the local registry first, then to every other context.
    ///
    /// Empty mutations are dropped. Plain mutations are only published when reactivity is
    /// enabled; replacements always are, since peers must reopen their handles.
    pub(crate) fn publish(
        &self,
        registry: &ReactiveRegistry,
        mutated_tables: BTreeSet<String>,
        database_replaced: bool,
    ) {
        if !database_replaced && (!self.enabled || mutated_tables.is_empty()) {
            return;
        }
        let record = EffectRecord {
            origin: self.origin,
            mutated_tables,
            database_replaced,
        };
        registry.notify(&record);
        let receivers = self.sender.send(record).unwrap_or(0);
        debug!(origin = %self.origin, receivers, database_replaced, "effect published");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replacement_affects_every_query() {
        let record = EffectRecord {
            origin: InstanceKey::new(),
            mutated_tables: BTreeSet::new(),
            database_replaced: true,
        };
        assert!(record.affects(&BTreeSet::from(["anything".to_owned()])));
    }

    #[test]
    fn disjoint_tables_are_not_affected() {
        let record = EffectRecord {
            origin: InstanceKey::new(),
            mutated_tables: BTreeSet::from(["t".to_owned()]),
            database_replaced: false,
        };
        assert!(record.affects(&BTreeSet::from(["t".to_owned(), "u".to_owned()])));
        assert!(!record.affects(&BTreeSet::from(["u".to_owned()])));
    }
}
