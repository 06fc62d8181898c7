//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use elif_migrations::{MemoryBackend, MemoryReader, MigrationConfig, MigrationRunner};

pub const SAMPLES: &str = r#"
# --- !Up
create table samples (
    id serial primary key,
    name varchar(60) not null
);

# --- !Down
drop table samples;
"#;

pub const EMAIL: &str = r#"
# --- !Up
alter table samples add column email varchar(255);

# --- !Down
alter table samples drop column email;
"#;

pub const TAGS: &str = r#"
# --- !Up
create table tags (
    id serial primary key,
    label varchar(40) not null -- labels are short; keep them that way
);
insert into tags (label) values ('it''s; fine');

# --- !Down
drop table tags;
"#;

pub struct Fixture {
    pub runner: MigrationRunner,
    pub backend: MemoryBackend,
    pub reader: MemoryReader,
}

/// A runner over `sql/` holding the given files
pub fn fixture(files: &[(&str, &str)]) -> Fixture {
    fixture_with(MigrationConfig::default(), files)
}

pub fn fixture_with(config: MigrationConfig, files: &[(&str, &str)]) -> Fixture {
    let reader = MemoryReader::new();
    for (name, content) in files {
        reader.insert(format!("sql/{}", name), *content);
    }

    let backend = MemoryBackend::new();
    let runner = MigrationRunner::new(
        config.with_directory("sql"),
        Arc::new(backend.clone()),
        Arc::new(reader.clone()),
    );

    Fixture {
        runner,
        backend,
        reader,
    }
}

/// The three standard migrations: samples, email column, tags
pub fn three_migrations() -> Fixture {
    fixture(&[
        ("1-create-samples.sql", SAMPLES),
        ("2-add-email.sql", EMAIL),
        ("3-create-tags.sql", TAGS),
    ])
}
