//! Persisted state layouts and the transitions between them
//!
//! Two generations describe the same applied-migrations fact. The legacy
//! layout is a single table of applied filenames; the embedded layout adds a
//! frozen rollback snapshot per applied migration. The transitions here are
//! pure, backends only materialize the result.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::definitions::RollbackEntry;
use crate::revision;

/// Which layout a database currently carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    Uninitialized,
    Legacy,
    Embedded,
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Generation::Uninitialized => f.write_str("uninitialized"),
            Generation::Legacy => f.write_str("legacy"),
            Generation::Embedded => f.write_str("embedded"),
        }
    }
}

/// Everything a backend persists about applied migrations
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PersistedState {
    /// No migration tables exist yet
    #[default]
    Uninitialized,
    /// Generation 1: applied filenames only
    Legacy { applied: BTreeSet<String> },
    /// Generation 2: applied filenames plus rollback snapshots
    Embedded {
        applied: BTreeSet<String>,
        rollbacks: BTreeMap<String, RollbackEntry>,
    },
}

impl PersistedState {
    pub fn generation(&self) -> Generation {
        match self {
            PersistedState::Uninitialized => Generation::Uninitialized,
            PersistedState::Legacy { .. } => Generation::Legacy,
            PersistedState::Embedded { .. } => Generation::Embedded,
        }
    }

    /// Applied migration filenames, empty when uninitialized
    pub fn applied(&self) -> BTreeSet<String> {
        match self {
            PersistedState::Uninitialized => BTreeSet::new(),
            PersistedState::Legacy { applied } | PersistedState::Embedded { applied, .. } => {
                applied.clone()
            }
        }
    }

    /// Highest revision among the applied migrations, ignoring unparseable names
    pub fn latest_applied(&self) -> Option<u64> {
        self.applied()
            .iter()
            .filter_map(|migration| revision::revision(migration).ok())
            .max()
    }
}

/// Move any state to the embedded layout
///
/// `snapshots` holds the rollback entries that can still be captured from
/// files on disk; only applied migrations receive one.
pub fn upgrade(
    state: PersistedState,
    snapshots: &BTreeMap<String, RollbackEntry>,
) -> PersistedState {
    match state {
        PersistedState::Uninitialized => PersistedState::Embedded {
            applied: BTreeSet::new(),
            rollbacks: BTreeMap::new(),
        },
        PersistedState::Legacy { applied } => {
            let rollbacks = snapshots
                .iter()
                .filter(|(migration, _)| applied.contains(*migration))
                .map(|(migration, entry)| (migration.clone(), entry.clone()))
                .collect();
            PersistedState::Embedded { applied, rollbacks }
        }
        embedded @ PersistedState::Embedded { .. } => embedded,
    }
}

/// Move any state back to the legacy layout, discarding rollback snapshots
pub fn downgrade(state: PersistedState) -> PersistedState {
    match state {
        PersistedState::Uninitialized => PersistedState::Legacy {
            applied: BTreeSet::new(),
        },
        PersistedState::Embedded { applied, .. } => PersistedState::Legacy { applied },
        legacy @ PersistedState::Legacy { .. } => legacy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_upgrade_uninitialized() {
        let upgraded = upgrade(PersistedState::Uninitialized, &BTreeMap::new());
        assert_eq!(upgraded.generation(), Generation::Embedded);
        assert!(upgraded.applied().is_empty());
    }

    #[test]
    fn test_upgrade_legacy_backfills_applied_only() {
        let legacy = PersistedState::Legacy {
            applied: set(&["1-a.sql", "2-b.sql"]),
        };
        let mut snapshots = BTreeMap::new();
        snapshots.insert("1-a.sql".to_string(), RollbackEntry::Sql("drop table a;".into()));
        snapshots.insert("3-c.sql".to_string(), RollbackEntry::Sql("drop table c;".into()));

        match upgrade(legacy, &snapshots) {
            PersistedState::Embedded { applied, rollbacks } => {
                assert_eq!(applied, set(&["1-a.sql", "2-b.sql"]));
                assert_eq!(rollbacks.len(), 1);
                assert_eq!(
                    rollbacks.get("1-a.sql"),
                    Some(&RollbackEntry::Sql("drop table a;".into()))
                );
            }
            other => panic!("expected embedded state, got {:?}", other),
        }
    }

    #[test]
    fn test_upgrade_is_identity_on_embedded() {
        let mut rollbacks = BTreeMap::new();
        rollbacks.insert("1-a.sql".to_string(), RollbackEntry::Stop);
        let embedded = PersistedState::Embedded {
            applied: set(&["1-a.sql"]),
            rollbacks,
        };

        assert_eq!(upgrade(embedded.clone(), &BTreeMap::new()), embedded);
    }

    #[test]
    fn test_downgrade_keeps_applied() {
        let mut rollbacks = BTreeMap::new();
        rollbacks.insert("1-a.sql".to_string(), RollbackEntry::Stop);
        let embedded = PersistedState::Embedded {
            applied: set(&["1-a.sql", "4-d.sql"]),
            rollbacks,
        };

        let legacy = downgrade(embedded);
        assert_eq!(
            legacy,
            PersistedState::Legacy {
                applied: set(&["1-a.sql", "4-d.sql"])
            }
        );
        assert_eq!(legacy.latest_applied(), Some(4));
        assert_eq!(downgrade(legacy.clone()), legacy);
    }

    #[test]
    fn test_upgrade_then_downgrade_round_trips_applied() {
        let legacy = PersistedState::Legacy {
            applied: set(&["2-b.sql"]),
        };
        assert_eq!(downgrade(upgrade(legacy.clone(), &BTreeMap::new())), legacy);
    }
}
