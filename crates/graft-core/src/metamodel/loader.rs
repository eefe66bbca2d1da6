//! Single-id entity loaders, cached per lock mode.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lock acquired when reading or reassociating an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum LockMode {
    /// No lock; the instance may come from the session cache.
    #[default]
    None,
    /// Read from the database, bypassing the cache.
    Read,
    /// Verify the version at commit.
    Optimistic,
    /// Force a version increment at the next flush.
    OptimisticForceIncrement,
    /// Shared row lock.
    PessimisticRead,
    /// Exclusive row lock.
    PessimisticWrite,
    /// Exclusive row lock plus an immediate version increment.
    PessimisticForceIncrement,
}

impl LockMode {
    /// Does this mode force a version increment?
    pub fn forces_increment(self) -> bool {
        matches!(
            self,
            LockMode::OptimisticForceIncrement | LockMode::PessimisticForceIncrement
        )
    }

    /// Does this mode require a trip to the database?
    pub fn requires_database(self) -> bool {
        self > LockMode::None
    }

    /// Row-lock clause appended to the select statement.
    pub fn sql_suffix(self) -> &'static str {
        match self {
            LockMode::PessimisticRead => " FOR SHARE",
            LockMode::PessimisticWrite | LockMode::PessimisticForceIncrement => " FOR UPDATE",
            _ => "",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockMode::None => "NONE",
            LockMode::Read => "READ",
            LockMode::Optimistic => "OPTIMISTIC",
            LockMode::OptimisticForceIncrement => "OPTIMISTIC_FORCE_INCREMENT",
            LockMode::PessimisticRead => "PESSIMISTIC_READ",
            LockMode::PessimisticWrite => "PESSIMISTIC_WRITE",
            LockMode::PessimisticForceIncrement => "PESSIMISTIC_FORCE_INCREMENT",
        };
        f.write_str(name)
    }
}

/// A prepared by-id select for one entity type and lock mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityLoader {
    pub entity_name: String,
    pub lock_mode: LockMode,
    pub sql: String,
}

impl EntityLoader {
    pub fn new(entity_name: impl Into<String>, lock_mode: LockMode, sql: String) -> Self {
        Self {
            entity_name: entity_name.into(),
            lock_mode,
            sql,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_mode_ordering_and_suffix() {
        assert!(LockMode::PessimisticWrite > LockMode::Read);
        assert!(!LockMode::None.requires_database());
        assert!(LockMode::Read.requires_database());
        assert!(LockMode::PessimisticForceIncrement.forces_increment());
        assert!(!LockMode::PessimisticWrite.forces_increment());
        assert_eq!(LockMode::PessimisticRead.sql_suffix(), " FOR SHARE");
        assert_eq!(LockMode::Optimistic.sql_suffix(), "");
        assert_eq!(LockMode::OptimisticForceIncrement.to_string(), "OPTIMISTIC_FORCE_INCREMENT");
    }
}
