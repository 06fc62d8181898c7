//! Migration sources
//!
//! The engine never touches the filesystem directly: listings and file bodies
//! come from a [`MigrationReader`] handed to the runner at construction, so a
//! local directory and an embedded set of files are interchangeable.

use async_trait::async_trait;

use crate::error::{MigrationError, MigrationResult};

pub mod disk;
pub mod memory;

pub use disk::DiskReader;
pub use memory::MemoryReader;

/// Source of migration files
#[async_trait]
pub trait MigrationReader: Send + Sync {
    /// Paths of the entries directly inside `location`, joined with it
    async fn list_entries(&self, location: &str) -> MigrationResult<Vec<String>>;

    /// Raw bytes of the entry at `path`
    async fn read_content(&self, path: &str) -> MigrationResult<Vec<u8>>;

    /// Store a new entry; sources are read-only unless they override this
    async fn write_content(&self, path: &str, _content: &[u8]) -> MigrationResult<()> {
        Err(MigrationError::Configuration(format!(
            "cannot write {}: migration source is read-only",
            path
        )))
    }

    /// Read an entry as UTF-8 text
    async fn read_to_string(&self, path: &str) -> MigrationResult<String> {
        let bytes = self.read_content(path).await?;
        String::from_utf8(bytes).map_err(|e| MigrationError::io(path, e))
    }
}

/// Join a location and an entry name with a single `/`
pub fn join(location: &str, name: &str) -> String {
    let trimmed = location.trim_end_matches('/');
    if trimmed.is_empty() && location.starts_with('/') {
        format!("/{}", name)
    } else if trimmed.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", trimmed, name)
    }
}
