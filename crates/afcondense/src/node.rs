//! Hierarchy nodes: events and assets returned by the data source
//!
//! A node path looks like `\\Server\Database\Root\Child\Leaf`. Splitting on
//! the backslash yields two empty pieces, the server and the database; these
//! four pieces are infrastructure and everything after them is the ancestry
//! of the node, root first. The level of a node is the number of ancestry
//! segments minus one, so root nodes sit at level 0.

use crate::error::{Error, Result};
use crate::time::{TimeBounds, TimeRange};
use chrono::{DateTime, TimeDelta, Utc};
use std::fmt;

/// Number of leading path pieces that carry no hierarchy information.
pub const INFRASTRUCTURE_SEGMENTS: usize = 4;

/// Opaque handle into the external data source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Event,
    Asset,
}

/// Parsed hierarchy path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodePath {
    raw: String,
    segments: Vec<String>,
}

impl NodePath {
    pub fn parse<S: Into<String>>(raw: S) -> Result<Self> {
        let raw = raw.into();
        let segments: Vec<String> = raw.split('\\').map(str::to_string).collect();
        if segments.len() <= INFRASTRUCTURE_SEGMENTS {
            return Err(Error::InvalidPath(raw));
        }
        if segments[INFRASTRUCTURE_SEGMENTS..].iter().any(String::is_empty) {
            return Err(Error::InvalidPath(raw));
        }
        Ok(Self { raw, segments })
    }

    /// Build a child path by appending one segment.
    pub fn child(&self, name: &str) -> Result<Self> {
        Self::parse(format!("{}\\{}", self.raw, name))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Ancestry segments, root first, ending with the node itself.
    #[must_use]
    pub fn ancestry(&self) -> &[String] {
        &self.segments[INFRASTRUCTURE_SEGMENTS..]
    }

    #[must_use]
    pub fn level(&self) -> usize {
        self.ancestry().len() - 1
    }

    #[must_use]
    pub fn leaf(&self) -> &str {
        self.ancestry().last().map_or("", String::as_str)
    }

    /// Name of the top-level ancestor.
    #[must_use]
    pub fn root(&self) -> &str {
        self.ancestry().first().map_or("", String::as_str)
    }

    /// True when `self` lies strictly below `other`.
    #[must_use]
    pub fn is_descendant_of(&self, other: &NodePath) -> bool {
        self.segments.len() > other.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One element of the source hierarchy. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    id: NodeId,
    kind: NodeKind,
    path: NodePath,
    name: String,
    template: Option<String>,
    bounds: Option<TimeBounds>,
}

impl Node {
    /// An event node. The display name is the last path segment.
    pub fn event(
        id: NodeId,
        path: &str,
        template: Option<&str>,
        bounds: TimeBounds,
    ) -> Result<Self> {
        Self::new(id, NodeKind::Event, path, template, Some(bounds))
    }

    pub fn asset(id: NodeId, path: &str, template: Option<&str>) -> Result<Self> {
        Self::new(id, NodeKind::Asset, path, template, None)
    }

    pub fn new(
        id: NodeId,
        kind: NodeKind,
        path: &str,
        template: Option<&str>,
        bounds: Option<TimeBounds>,
    ) -> Result<Self> {
        let path = NodePath::parse(path)?;
        let name = path.leaf().to_string();
        Ok(Self {
            id,
            kind,
            path,
            name,
            template: template.map(str::to_string),
            bounds,
        })
    }

    #[must_use]
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    #[must_use]
    pub fn path(&self) -> &NodePath {
        &self.path
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn level(&self) -> usize {
        self.path.level()
    }

    #[must_use]
    pub fn template(&self) -> Option<&str> {
        self.template.as_deref()
    }

    #[must_use]
    pub fn bounds(&self) -> Option<&TimeBounds> {
        self.bounds.as_ref()
    }

    #[must_use]
    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.bounds.map(|b| b.start)
    }

    #[must_use]
    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.bounds.and_then(|b| b.end)
    }

    /// The top-level ancestor name, used to group rows into procedures.
    #[must_use]
    pub fn procedure(&self) -> &str {
        self.path.root()
    }

    /// Query range for this node with an open end resolved against `now`.
    pub fn range(&self, now: DateTime<Utc>) -> Result<TimeRange> {
        self.bounds
            .map(|b| b.range(now))
            .ok_or_else(|| Error::InvalidArgument(format!("{} has no time bounds", self.path)))
    }

    /// Duration up to the end, or up to `now` while still open. Zero for assets.
    #[must_use]
    pub fn duration(&self, now: DateTime<Utc>) -> TimeDelta {
        self.bounds
            .map(|b| b.range(now).span())
            .unwrap_or_else(TimeDelta::zero)
    }

    /// True when `t` falls inside the node's bounds (open ends reach `now`).
    #[must_use]
    pub fn contains(&self, t: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.bounds.is_some_and(|b| b.range(now).contains(t))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            NodeKind::Event => write!(f, "Event:{}", self.path),
            NodeKind::Asset => write!(f, "Asset:{}", self.path),
        }
    }
}
