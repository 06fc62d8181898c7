//! In-memory migration source, for tests and embedded migration sets

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{join, MigrationReader};
use crate::error::{MigrationError, MigrationResult};

/// Migration files held in memory, keyed by path
///
/// Clones share the same files, so a test can keep a handle and add or
/// remove migrations between runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryReader {
    files: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches("./").trim_end_matches('/')
}

fn parent(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

impl MemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a file
    pub fn insert(&self, path: impl AsRef<str>, content: impl Into<Vec<u8>>) {
        self.files
            .write()
            .insert(normalize(path.as_ref()).to_string(), content.into());
    }

    /// Builder-style [`MemoryReader::insert`]
    pub fn with_file(self, path: impl AsRef<str>, content: impl Into<Vec<u8>>) -> Self {
        self.insert(path, content);
        self
    }

    /// Remove a file, returning whether it existed
    pub fn remove(&self, path: impl AsRef<str>) -> bool {
        self.files.write().remove(normalize(path.as_ref())).is_some()
    }

    pub fn contains(&self, path: impl AsRef<str>) -> bool {
        self.files.read().contains_key(normalize(path.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

#[async_trait]
impl MigrationReader for MemoryReader {
    async fn list_entries(&self, location: &str) -> MigrationResult<Vec<String>> {
        let location = normalize(location);
        let files = self.files.read();

        Ok(files
            .keys()
            .map(String::as_str)
            .filter(|path| parent(path) == location)
            .map(|path| join(location, path.rsplit('/').next().unwrap_or(path)))
            .collect())
    }

    async fn read_content(&self, path: &str) -> MigrationResult<Vec<u8>> {
        self.files
            .read()
            .get(normalize(path))
            .cloned()
            .ok_or_else(|| MigrationError::io(path, "no such file"))
    }

    async fn write_content(&self, path: &str, content: &[u8]) -> MigrationResult<()> {
        self.insert(path, content);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_only_direct_children() {
        let reader = MemoryReader::new()
            .with_file("sql/2-b.sql", "select 2;")
            .with_file("./sql/1-a.sql", "select 1;")
            .with_file("sql/old/0-x.sql", "select 0;")
            .with_file("other/3-c.sql", "select 3;");

        let entries = reader.list_entries("./sql/").await.unwrap();
        assert_eq!(entries, vec!["sql/1-a.sql", "sql/2-b.sql"]);
        assert!(reader.list_entries("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_files() {
        let reader = MemoryReader::new();
        let handle = reader.clone();

        handle.insert("sql/1-a.sql", "select 1;");
        assert_eq!(reader.read_content("sql/1-a.sql").await.unwrap(), b"select 1;");

        assert!(handle.remove("sql/1-a.sql"));
        assert!(reader.read_content("sql/1-a.sql").await.is_err());
        assert!(reader.is_empty());
    }
}
