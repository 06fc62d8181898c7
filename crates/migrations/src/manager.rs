//! Migration Manager - Listing, reading and creating migration files
//!
//! All access goes through the injected [`MigrationReader`], so the same
//! manager works against a local directory or an in-memory set of files.

use chrono::Utc;
use std::sync::Arc;

use crate::config::MigrationConfig;
use crate::definitions::{Direction, MigrationFile};
use crate::error::{MigrationError, MigrationResult};
use crate::reader::{join, MigrationReader};
use crate::revision;
use crate::sql::directive::{self, Section};

/// Migration manager for creating and loading migrations
#[derive(Clone)]
pub struct MigrationManager {
    reader: Arc<dyn MigrationReader>,
    location: String,
}

impl MigrationManager {
    pub fn new(config: &MigrationConfig, reader: Arc<dyn MigrationReader>) -> Self {
        Self {
            reader,
            location: config.get_migrations_dir().to_string_lossy().to_string(),
        }
    }

    /// Where the migrations live
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Full path of a migration, as handed to the reader
    pub fn path_for(&self, file: &MigrationFile) -> String {
        join(&self.location, &file.filename)
    }

    /// Every migration file, ordered for the given direction
    ///
    /// A `.sql` entry without a revision prefix fails the whole listing.
    pub async fn available(&self, direction: Direction) -> MigrationResult<Vec<MigrationFile>> {
        let entries = self.reader.list_entries(&self.location).await?;
        let mut files = revision::index(&entries)?;
        revision::sort_for(&mut files, direction);
        Ok(files)
    }

    /// Highest revision among the files, skipping names that don't parse
    pub async fn latest_revision(&self) -> MigrationResult<u64> {
        let entries = self.reader.list_entries(&self.location).await?;
        Ok(revision::latest(&entries))
    }

    /// Raw text of a migration
    pub async fn read(&self, path: &str) -> MigrationResult<String> {
        self.reader.read_to_string(path).await
    }

    /// The section of a migration for one direction
    pub async fn read_section(&self, path: &str, direction: Direction) -> MigrationResult<Section> {
        let content = self.read(path).await?;
        Ok(directive::parse(&content, direction))
    }

    /// Create an empty migration numbered after the latest one
    pub async fn create(&self, name: &str) -> MigrationResult<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MigrationError::Configuration(
                "migration name is required".to_string(),
            ));
        }

        // A location that doesn't exist yet is created by the write below
        let latest = match self.latest_revision().await {
            Ok(latest) => latest,
            Err(MigrationError::Configuration(_)) => 0,
            Err(err) => return Err(err),
        };

        let filename = format!(
            "{}-{}{}",
            latest + 1,
            name.split_whitespace().collect::<Vec<_>>().join("-"),
            revision::MIGRATION_EXTENSION
        );
        let path = join(&self.location, &filename);

        self.reader
            .write_content(&path, Self::template(name).as_bytes())
            .await?;

        tracing::info!("Created migration {}", path);
        Ok(path)
    }

    fn template(name: &str) -> String {
        format!(
            "-- Migration: {}\n\
             -- Created: {}\n\n\
             # --- !Up\n\n\
             # --- !Down\n\n",
            name,
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}
