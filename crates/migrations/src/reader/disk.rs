//! Local filesystem migration source

use async_trait::async_trait;
use std::path::Path;
use tokio::fs;

use super::{join, MigrationReader};
use crate::error::{MigrationError, MigrationResult};

/// Reads migrations from a local directory
#[derive(Debug, Clone, Default)]
pub struct DiskReader;

impl DiskReader {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MigrationReader for DiskReader {
    async fn list_entries(&self, location: &str) -> MigrationResult<Vec<String>> {
        let mut entries = fs::read_dir(location).await.map_err(|e| {
            MigrationError::Configuration(format!(
                "Failed to read migrations directory {}: {}",
                location, e
            ))
        })?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MigrationError::io(location, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| MigrationError::io(location, e))?;
            if file_type.is_dir() {
                continue;
            }

            paths.push(join(location, &entry.file_name().to_string_lossy()));
        }

        paths.sort();
        Ok(paths)
    }

    async fn read_content(&self, path: &str) -> MigrationResult<Vec<u8>> {
        fs::read(path).await.map_err(|e| MigrationError::io(path, e))
    }

    async fn write_content(&self, path: &str, content: &[u8]) -> MigrationResult<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    MigrationError::Configuration(format!(
                        "Failed to create migrations directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        fs::write(path, content)
            .await
            .map_err(|e| MigrationError::io(path, e))
    }
}
