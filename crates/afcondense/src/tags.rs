//! Tag handles and the rules for turning identifiers into them
//!
//! A tag specification is either already resolved, a list of identifiers, or
//! the name of a table column whose cells hold identifiers. A cell may list
//! several identifiers separated by commas. Time-series extraction uses every
//! tag of a cell; summary extraction requires exactly one tag per cell and
//! rejects lists with [`Error::InvalidShape`].

use crate::error::{Error, Result};
use crate::source::{DataSource, SourceError};
use crate::table::Table;
use diagnostics::*;
use std::collections::HashMap;
use std::sync::Mutex;

/// A named handle to a time series in the data source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    name: String,
    id: String,
}

impl Tag {
    pub fn new<N: Into<String>, I: Into<String>>(name: N, id: I) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Ordered collection of tags, unique by name. Order drives output column order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    tags: Vec<Tag>,
}

impl TagSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tag unless one with the same name is present.
    pub fn insert(&mut self, tag: Tag) -> bool {
        if self.tags.iter().any(|t| t.name == tag.name) {
            return false;
        }
        self.tags.push(tag);
        true
    }

    pub fn extend_from(&mut self, other: &TagSet) {
        for tag in &other.tags {
            self.insert(tag.clone());
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tag> {
        self.tags.iter()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.tags.iter().map(Tag::name).collect()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.name == name)
    }

    /// Consecutive pieces of at most `size` tags.
    #[must_use]
    pub fn chunks(&self, size: usize) -> Vec<TagSet> {
        self.tags
            .chunks(size.max(1))
            .map(|c| TagSet { tags: c.to_vec() })
            .collect()
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        let mut set = TagSet::new();
        for tag in iter {
            set.insert(tag);
        }
        set
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = &'a Tag;
    type IntoIter = std::slice::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.tags.iter()
    }
}

/// How the tags of an extraction are specified.
#[derive(Debug, Clone, PartialEq)]
pub enum TagSpec {
    Resolved(TagSet),
    Names(Vec<String>),
    /// Identifiers are read per row from this column.
    Column(String),
}

impl TagSpec {
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TagSpec::Names(names.into_iter().map(Into::into).collect())
    }

    pub fn column<S: Into<String>>(name: S) -> Self {
        TagSpec::Column(name.into())
    }
}

impl From<TagSet> for TagSpec {
    fn from(tags: TagSet) -> Self {
        TagSpec::Resolved(tags)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Exactly one tag per cell.
    Summary,
    /// Any number of comma-separated tags per cell.
    TimeSeries,
}

/// Identifier resolutions shared across calls. Owned by the caller.
#[derive(Debug, Default)]
pub struct TagCache {
    entries: Mutex<HashMap<String, TagSet>>,
}

impl TagCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TagSet>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub fn get(&self, identifier: &str) -> Option<TagSet> {
        self.lock().get(identifier).cloned()
    }

    pub fn insert(&self, identifier: &str, tags: TagSet) {
        self.lock().insert(identifier.to_string(), tags);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn invalidate(&self) {
        self.lock().clear();
    }
}

/// Split a cell into trimmed identifiers, ignoring empty pieces.
#[must_use]
pub fn split_cell(cell: &str) -> Vec<String> {
    cell.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct TagResolver<'a> {
    source: &'a dyn DataSource,
    cache: Option<&'a TagCache>,
}

impl<'a> TagResolver<'a> {
    pub fn new(source: &'a dyn DataSource) -> Self {
        Self {
            source,
            cache: None,
        }
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Option<&'a TagCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Resolve a literal specification into one tag set.
    pub async fn resolve(&self, spec: &TagSpec) -> Result<TagSet> {
        match spec {
            TagSpec::Resolved(tags) => Ok(tags.clone()),
            TagSpec::Names(names) => {
                let mut tags = TagSet::new();
                for name in names {
                    tags.extend_from(&self.resolve_identifier(name).await?);
                }
                if tags.is_empty() {
                    return Err(Error::tag_not_found(names.join(", ")));
                }
                Ok(tags)
            }
            TagSpec::Column(column) => Err(Error::InvalidArgument(format!(
                "tag column '{column}' can only be resolved against a table"
            ))),
        }
    }

    /// Resolve one identifier. An identifier that matches nothing is NotFound.
    pub async fn resolve_identifier(&self, identifier: &str) -> Result<TagSet> {
        if let Some(tags) = self.cache.and_then(|c| c.get(identifier)) {
            return Ok(tags);
        }
        let found = match self.source.find_tags(identifier).await {
            Ok(found) => found,
            Err(SourceError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(Error::data_source(format!("tag query '{identifier}'"), e)),
        };
        if found.is_empty() {
            return Err(Error::tag_not_found(identifier));
        }
        let tags: TagSet = found.into_iter().collect();
        let count = tags.len();
        debug!("Resolved {count} tags for {identifier}", count: count, identifier: identifier);
        if let Some(cache) = self.cache {
            cache.insert(identifier, tags.clone());
        }
        Ok(tags)
    }

    /// Resolve the identifiers held in `column`, one tag set per table row.
    ///
    /// Each distinct cell is resolved once.
    pub async fn resolve_rows(
        &self,
        table: &Table,
        column: &str,
        mode: ResolveMode,
    ) -> Result<Vec<TagSet>> {
        let cells = table
            .column(column)
            .ok_or_else(|| Error::invalid_shape(format!("tag column '{column}' is missing")))?;

        let mut resolved: HashMap<String, TagSet> = HashMap::new();
        let mut per_row = Vec::with_capacity(cells.values.len());
        for (row, cell) in cells.values.iter().enumerate() {
            if cell.is_null() {
                return Err(Error::invalid_shape(format!(
                    "row {row} of tag column '{column}' is empty"
                )));
            }
            let text = cell.to_string();
            if let Some(tags) = resolved.get(&text) {
                per_row.push(tags.clone());
                continue;
            }
            let identifiers = split_cell(&text);
            if identifiers.is_empty() {
                return Err(Error::invalid_shape(format!(
                    "row {row} of tag column '{column}' is empty"
                )));
            }
            let mut tags = TagSet::new();
            for identifier in &identifiers {
                tags.extend_from(&self.resolve_identifier(identifier).await?);
            }
            // patterns count by what they match
            if mode == ResolveMode::Summary && tags.len() != 1 {
                return Err(Error::invalid_shape(format!(
                    "summary extraction needs exactly one tag per cell, row {row} of '{column}' resolves to {}: {text}",
                    tags.len()
                )));
            }
            resolved.insert(text, tags.clone());
            per_row.push(tags);
        }
        Ok(per_row)
    }
}
