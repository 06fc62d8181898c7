//! Migration Definitions - Core types shared across the engine
//!
//! Defines the migration identity, the direction and target of a run, the
//! frozen rollback entry and the reports handed back to callers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MigrationError;
use crate::revision;

/// Text persisted in place of SQL for a rollback marked `/stop`
pub const STOP_SENTINEL: &str = "/stop";

/// Line prefixed to stored SQL that must run outside a transaction
pub const NOTX_MARKER: &str = "/notx\n";

/// Migration direction for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Apply the migration (run UP statements)
    Up,
    /// Rollback the migration (run DOWN statements)
    Down,
    /// Nothing to do, the database is already at the target
    #[default]
    None,
}

impl Direction {
    /// The token used after `!` on a directive line
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::None => "none",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The revision a run converges to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// The highest revision among the available migration files
    #[default]
    Latest,
    /// Apply everything at or below, roll back everything above
    Revision(u64),
}

impl From<u64> for Target {
    fn from(revision: u64) -> Self {
        Target::Revision(revision)
    }
}

impl FromStr for Target {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("latest") || trimmed == "-1" {
            return Ok(Target::Latest);
        }

        trimmed.parse::<u64>().map(Target::Revision).map_err(|_| {
            MigrationError::Configuration(format!(
                "invalid target revision '{}', expected a non-negative integer or 'latest'",
                s
            ))
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Latest => f.write_str("latest"),
            Target::Revision(revision) => write!(f, "{}", revision),
        }
    }
}

/// A migration file, identified by `<revision>-<name>.sql`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationFile {
    /// Ordering key taken from the filename prefix
    pub revision: u64,
    /// Everything after the first `-`, without the `.sql` extension
    pub name: String,
    /// The bare filename, which is also the persisted identity
    pub filename: String,
}

impl MigrationFile {
    /// Parse a filename (or a path ending in one) into a migration identity
    pub fn parse(path: &str) -> Result<Self, MigrationError> {
        let filename = revision::filename(path).to_string();
        let revision = revision::revision(&filename)?;
        let name = filename
            .split_once('-')
            .map(|(_, rest)| rest.trim_end_matches(".sql").to_string())
            .unwrap_or_default();

        Ok(Self {
            revision,
            name,
            filename,
        })
    }
}

impl fmt::Display for MigrationFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.filename)
    }
}

/// The frozen "down" SQL stored when a migration is applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackEntry {
    /// Statements to run to undo the migration
    Sql(String),
    /// Statements to run one by one outside a transaction
    NoTx(String),
    /// Automatic downward convergence must stop here
    Stop,
}

impl RollbackEntry {
    pub fn is_stop(&self) -> bool {
        matches!(self, RollbackEntry::Stop)
    }

    /// Text representation stored in the rollbacks table
    pub fn to_stored(&self) -> String {
        match self {
            RollbackEntry::Sql(sql) => sql.clone(),
            RollbackEntry::NoTx(sql) => format!("{}{}", NOTX_MARKER, sql),
            RollbackEntry::Stop => STOP_SENTINEL.to_string(),
        }
    }

    /// Inverse of [`RollbackEntry::to_stored`]
    pub fn from_stored(stored: impl Into<String>) -> Self {
        let stored = stored.into();
        if stored == STOP_SENTINEL {
            RollbackEntry::Stop
        } else if let Some(sql) = stored.strip_prefix(NOTX_MARKER) {
            RollbackEntry::NoTx(sql.to_string())
        } else {
            RollbackEntry::Sql(stored)
        }
    }
}

/// Result of an Apply run
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    /// Direction the main loop moved in
    pub direction: Direction,
    /// Effective revision the run converged to
    pub target: u64,
    /// Migrations whose Up section ran
    pub applied: Vec<String>,
    /// Migrations whose Down section (from file or snapshot) ran
    pub rolled_back: Vec<String>,
    /// Migrations handed to the background worker and marked optimistically
    pub deferred: Vec<String>,
    /// Applied migrations left alone because no rollback snapshot exists
    pub skipped: Vec<String>,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

impl ApplyReport {
    /// True when nothing was executed or recorded
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() && self.rolled_back.is_empty() && self.deferred.is_empty()
    }
}

/// Migration status row, merging files on disk with applied records
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub migration: String,
    pub revision: u64,
    pub applied: bool,
    pub file_present: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_str() {
        assert_eq!("latest".parse::<Target>().unwrap(), Target::Latest);
        assert_eq!("LATEST".parse::<Target>().unwrap(), Target::Latest);
        assert_eq!("-1".parse::<Target>().unwrap(), Target::Latest);
        assert_eq!("12".parse::<Target>().unwrap(), Target::Revision(12));
        assert!("-4".parse::<Target>().is_err());
        assert!("twelve".parse::<Target>().is_err());
    }

    #[test]
    fn test_migration_file_parse() {
        let file = MigrationFile::parse("sql/3-add-email-column.sql").unwrap();
        assert_eq!(file.revision, 3);
        assert_eq!(file.name, "add-email-column");
        assert_eq!(file.filename, "3-add-email-column.sql");

        assert!(matches!(
            MigrationFile::parse("create-users.sql"),
            Err(MigrationError::InvalidFilename(_))
        ));
        assert!(matches!(
            MigrationFile::parse("nodash.sql"),
            Err(MigrationError::InvalidFilename(_))
        ));
    }

    #[test]
    fn test_rollback_entry_storage() {
        assert_eq!(RollbackEntry::from_stored("/stop"), RollbackEntry::Stop);
        assert_eq!(
            RollbackEntry::from_stored("drop table samples;"),
            RollbackEntry::Sql("drop table samples;".to_string())
        );
        assert_eq!(RollbackEntry::Stop.to_stored(), STOP_SENTINEL);

        let notx = RollbackEntry::NoTx("drop index concurrently idx;".to_string());
        assert_eq!(notx.to_stored(), "/notx\ndrop index concurrently idx;");
        assert_eq!(RollbackEntry::from_stored(notx.to_stored()), notx);
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::Up.to_string(), "up");
        assert_eq!(Direction::Down.to_string(), "down");
        assert_eq!(Direction::None.to_string(), "none");
    }

    #[test]
    fn test_report_serializes_for_json_output() {
        let report = ApplyReport {
            direction: Direction::Down,
            target: 2,
            rolled_back: vec!["3-create-tags.sql".to_string()],
            ..ApplyReport::default()
        };

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["direction"], "down");
        assert_eq!(value["target"], 2);
        assert_eq!(value["rolled_back"][0], "3-create-tags.sql");
    }
}
