//! freightline core types: resource identity, change events and decoding.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod promotion;

/// Project-like namespace that owns a set of partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(String);

impl Scope {
    pub fn new(name: impl Into<String>) -> Self { Self(name.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for Scope {
    fn from(v: &str) -> Self { Self(v.to_string()) }
}

impl From<String> for Scope {
    fn from(v: String) -> Self { Self(v) }
}

/// Closed set of resource kinds the engine synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    /// Deployment target receiving promotions.
    Stage,
    /// Subscription describing where artifact versions are discovered.
    Warehouse,
    /// Immutable bundle of artifact versions promoted as a unit.
    Freight,
}

impl Kind {
    pub const ALL: [Kind; 3] = [Kind::Stage, Kind::Warehouse, Kind::Freight];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Stage => "Stage",
            Kind::Warehouse => "Warehouse",
            Kind::Freight => "Freight",
        }
    }

    /// Lowercase plural used by REST-style transports.
    pub fn plural(&self) -> &'static str {
        match self {
            Kind::Stage => "stages",
            Kind::Warehouse => "warehouses",
            Kind::Freight => "freights",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Kind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stage" | "stages" => Ok(Kind::Stage),
            "warehouse" | "warehouses" => Ok(Kind::Warehouse),
            "freight" | "freights" => Ok(Kind::Freight),
            _ => Err(DecodeError::UnknownKind(s.to_string())),
        }
    }
}

/// Cache partition key: one ordered list per `(scope, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub scope: Scope,
    pub kind: Kind,
}

impl PartitionKey {
    pub fn new(scope: Scope, kind: Kind) -> Self { Self { scope, kind } }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.scope, self.kind) }
}

/// Composite identity `(scope, kind, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub scope: Scope,
    pub kind: Kind,
    pub name: String,
}

/// Opaque versioned payload plus its identity.
///
/// Cache equality is by identity only; the payload is always replaced as a whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub scope: Scope,
    pub kind: Kind,
    #[serde(default)]
    pub name: String,
    /// Transport-assigned opaque version (e.g. `metadata.resourceVersion`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Resource {
    pub fn new(scope: impl Into<Scope>, kind: Kind, name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self { scope: scope.into(), kind, name: name.into(), version: None, payload }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn id(&self) -> ResourceId {
        ResourceId { scope: self.scope.clone(), kind: self.kind, name: self.name.clone() }
    }

    pub fn partition(&self) -> PartitionKey { PartitionKey::new(self.scope.clone(), self.kind) }

    pub fn same_identity(&self, other: &Resource) -> bool {
        self.kind == other.kind && self.name == other.name && self.scope == other.scope
    }

    /// Identity fields are present. Events for ill-formed resources are dropped.
    pub fn is_well_formed(&self) -> bool { !self.scope.is_empty() && !self.name.is_empty() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

impl ChangeType {
    /// Single-character marker used by the CLI (`+`, `~`, `-`).
    pub fn marker(&self) -> char {
        match self {
            ChangeType::Added => '+',
            ChangeType::Modified => '~',
            ChangeType::Deleted => '-',
        }
    }
}

/// One change delivered by the stream. No sequence number is carried.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub change_type: ChangeType,
    pub resource: Resource,
}

impl Event {
    pub fn added(resource: Resource) -> Self { Self { change_type: ChangeType::Added, resource } }
    pub fn modified(resource: Resource) -> Self { Self { change_type: ChangeType::Modified, resource } }
    pub fn deleted(resource: Resource) -> Self { Self { change_type: ChangeType::Deleted, resource } }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown resource kind: {0}")]
    UnknownKind(String),
    #[error("line {line}: {source}")]
    Line {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Result of decoding an event log: the events that parsed and the lines that did not.
#[derive(Debug, Default)]
pub struct Decoded {
    pub events: Vec<Event>,
    pub skipped: Vec<DecodeError>,
}

/// Decode newline-delimited JSON events. Blank lines and `#` comments are
/// ignored; lines that fail to parse are skipped and reported in `skipped`.
pub fn decode_events(text: &str) -> Decoded {
    let mut out = Decoded::default();
    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') { continue; }
        match serde_json::from_str::<Event>(trimmed) {
            Ok(ev) => out.events.push(ev),
            Err(source) => {
                debug!(line = idx + 1, error = %source, "decode: malformed event skipped");
                out.skipped.push(DecodeError::Line { line: idx + 1, source });
            }
        }
    }
    out
}

pub mod prelude {
    pub use super::{ChangeType, Event, Kind, PartitionKey, Resource, ResourceId, Scope};
    pub use super::promotion::{ArtifactRef, FreightRef, PromotionPhase, PromotionSignal};
}
