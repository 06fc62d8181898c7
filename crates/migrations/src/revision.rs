//! Revision Index - Revision numbers and orderings of migration files
//!
//! The revision is the integer before the first `-` of the bare filename.
//! Listings that feed an apply run reject invalid names outright, while the
//! latest-revision scan only logs and skips them.

use tracing::warn;

use crate::definitions::{Direction, MigrationFile};
use crate::error::{MigrationError, MigrationResult};

/// Extension every migration source carries
pub const MIGRATION_EXTENSION: &str = ".sql";

/// The bare filename of a path, accepting `/` and `\` separators
pub fn filename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Extract the revision number from a migration filename or path
pub fn revision(path: &str) -> MigrationResult<u64> {
    let name = filename(path);
    let (prefix, _) = name
        .split_once('-')
        .ok_or_else(|| MigrationError::InvalidFilename(name.to_string()))?;

    prefix
        .trim()
        .parse::<u64>()
        .map_err(|_| MigrationError::InvalidFilename(name.to_string()))
}

/// True when the entry looks like a migration source at all
pub fn is_migration_source(path: &str) -> bool {
    filename(path).ends_with(MIGRATION_EXTENSION)
}

/// Ascending by revision; equal revisions fall back to the filename
pub fn sort_up(files: &mut [MigrationFile]) {
    files.sort_by(|a, b| {
        a.revision
            .cmp(&b.revision)
            .then_with(|| a.filename.cmp(&b.filename))
    });
}

/// Descending by revision, the exact reverse of [`sort_up`]
pub fn sort_down(files: &mut [MigrationFile]) {
    files.sort_by(|a, b| {
        b.revision
            .cmp(&a.revision)
            .then_with(|| b.filename.cmp(&a.filename))
    });
}

/// Sort in the order the given direction walks the files
pub fn sort_for(files: &mut [MigrationFile], direction: Direction) {
    match direction {
        Direction::Down => sort_down(files),
        Direction::Up | Direction::None => sort_up(files),
    }
}

/// Parse every `.sql` entry, failing on the first invalid filename
pub fn index<S: AsRef<str>>(entries: &[S]) -> MigrationResult<Vec<MigrationFile>> {
    entries
        .iter()
        .map(AsRef::as_ref)
        .filter(|entry| is_migration_source(entry))
        .map(MigrationFile::parse)
        .collect()
}

/// Highest revision among the entries, skipping invalid filenames
pub fn latest<S: AsRef<str>>(entries: &[S]) -> u64 {
    entries
        .iter()
        .map(AsRef::as_ref)
        .filter(|entry| is_migration_source(entry))
        .filter_map(|entry| match revision(entry) {
            Ok(revision) => Some(revision),
            Err(err) => {
                warn!("Skipping {}: {}", entry, err);
                None
            }
        })
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_from_filename() {
        assert_eq!(revision("1-create-sample.sql").unwrap(), 1);
        assert_eq!(revision("sql/12-add-email.sql").unwrap(), 12);
        assert_eq!(revision("sql\\7-windows.sql").unwrap(), 7);
        assert_eq!(revision("0042-padded.sql").unwrap(), 42);
    }

    #[test]
    fn test_invalid_filenames() {
        for name in ["create-users.sql", "nodash.sql", "-1-negative.sql", "1.5-x.sql"] {
            let err = revision(name).unwrap_err();
            assert!(
                matches!(err, MigrationError::InvalidFilename(_)),
                "expected invalid filename for {}",
                name
            );
        }
    }

    #[test]
    fn test_sort_up_and_down() {
        let mut files = index(&["3-c.sql", "1-a.sql", "10-j.sql", "2-b.sql"]).unwrap();

        sort_up(&mut files);
        let up: Vec<u64> = files.iter().map(|f| f.revision).collect();
        assert_eq!(up, vec![1, 2, 3, 10]);

        sort_down(&mut files);
        let down: Vec<u64> = files.iter().map(|f| f.revision).collect();
        assert_eq!(down, vec![10, 3, 2, 1]);
    }

    #[test]
    fn test_index_rejects_invalid_names() {
        let err = index(&["1-a.sql", "bogus.sql"]).unwrap_err();
        assert!(matches!(err, MigrationError::InvalidFilename(name) if name == "bogus.sql"));

        // Non-sql entries are not migrations at all
        let files = index(&["1-a.sql", "README.md", ".keep"]).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_latest_skips_invalid_names() {
        assert_eq!(latest(&["1-a.sql", "bogus.sql", "7-g.sql", "3-c.sql"]), 7);
        assert_eq!(latest::<&str>(&[]), 0);
        assert_eq!(latest(&["bogus.sql"]), 0);
    }
}
