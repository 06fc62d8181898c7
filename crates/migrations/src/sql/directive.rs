//! Directive Parser - Extracts the up or down section of a migration file
//!
//! Sections are introduced by directive lines such as `# --- !Up` or
//! `--- !down /async`. Everything between a matching directive and the next
//! directive of any kind belongs to that section.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;

use crate::definitions::Direction;

static DIRECTIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^#?\s*-{3,}\s*!(\S+)(.*)$").expect("directive pattern is valid")
});

/// Modifier attached to a directive line
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Modifier {
    /// Run in the background worker, recorded as applied immediately
    Async,
    /// Run outside of a transaction
    NoTx,
    /// Hard boundary for automatic downward convergence
    Stop,
    /// Anything else, kept for diagnostics
    Other(String),
}

impl Modifier {
    /// Parse a modifier token, with or without its leading `/`
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim().trim_start_matches('/');
        if token.is_empty() {
            return None;
        }

        Some(match token.to_ascii_lowercase().as_str() {
            "async" => Modifier::Async,
            "notx" => Modifier::NoTx,
            "stop" => Modifier::Stop,
            other => Modifier::Other(other.to_string()),
        })
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modifier::Async => f.write_str("/async"),
            Modifier::NoTx => f.write_str("/notx"),
            Modifier::Stop => f.write_str("/stop"),
            Modifier::Other(token) => write!(f, "/{}", token),
        }
    }
}

/// Set of modifiers collected from every matching directive line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Modifiers(BTreeSet<Modifier>);

impl Modifiers {
    pub fn contains(&self, modifier: &Modifier) -> bool {
        self.0.contains(modifier)
    }

    pub fn is_async(&self) -> bool {
        self.contains(&Modifier::Async)
    }

    pub fn is_notx(&self) -> bool {
        self.contains(&Modifier::NoTx)
    }

    pub fn is_stop(&self) -> bool {
        self.contains(&Modifier::Stop)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Modifier> {
        self.0.iter()
    }

    fn insert(&mut self, modifier: Modifier) {
        self.0.insert(modifier);
    }
}

impl FromIterator<Modifier> for Modifiers {
    fn from_iter<I: IntoIterator<Item = Modifier>>(iter: I) -> Self {
        Modifiers(iter.into_iter().collect())
    }
}

/// The SQL body and modifiers of one direction of a migration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    pub sql: String,
    pub modifiers: Modifiers,
}

impl Section {
    /// True when the section has no SQL to run
    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }
}

/// A directive line, split into its direction token and modifiers
fn directive(line: &str) -> Option<(&str, Modifiers)> {
    let captures = DIRECTIVE.captures(line.trim())?;
    let token = captures.get(1)?.as_str();
    let modifiers = captures
        .get(2)
        .map(|rest| rest.as_str().split_whitespace().filter_map(Modifier::parse).collect())
        .unwrap_or_default();

    Some((token, modifiers))
}

/// Extract the section for `direction` from the file content
pub fn parse(content: &str, direction: Direction) -> Section {
    let wanted = direction.as_str();
    let mut collecting = false;
    let mut body = String::new();
    let mut modifiers = Modifiers::default();

    for line in content.lines() {
        if let Some((token, found)) = directive(line) {
            collecting = token.eq_ignore_ascii_case(wanted);
            if collecting {
                for modifier in found.0 {
                    modifiers.insert(modifier);
                }
            }
            continue;
        }

        if collecting {
            body.push_str(line);
            body.push('\n');
        }
    }

    Section {
        sql: body.trim().to_string(),
        modifiers,
    }
}
