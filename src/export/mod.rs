use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::error::{Result, ReviewError};
use crate::geometry::Polygon;
use crate::store::{Partition, ResultStore};

pub mod osmchange;

pub use osmchange::OsmChangeSerializer;

/// Default file name offered for the change file.
pub const DEFAULT_FILE_NAME: &str = "exported_results.osc";
/// MIME type advertised for the change file.
pub const CHANGE_FILE_MIME: &str = "type/xml";

/// Key/value tags applied to every feature of one export.
///
/// One export describes one feature type: every kept candidate receives
/// the same tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `key=value` strings. Duplicate keys are rejected.
    pub fn parse<S: AsRef<str>>(items: &[S]) -> Result<Self> {
        let mut tags = Self::new();
        for item in items {
            let item = item.as_ref();
            let (key, value) = split_tag(item)?;
            if tags.0.contains_key(key) {
                return Err(ReviewError::InvalidTag {
                    tag: item.to_string(),
                    reason: "duplicate key",
                });
            }
            tags.0.insert(key.to_string(), value.to_string());
        }
        Ok(tags)
    }

    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self> {
        let items: Vec<String> = map.iter().map(|(k, v)| format!("{k}={v}")).collect();
        Self::parse(&items)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn split_tag(item: &str) -> Result<(&str, &str)> {
    let invalid = |reason| ReviewError::InvalidTag {
        tag: item.to_string(),
        reason,
    };
    let (key, value) = item.split_once('=').ok_or_else(|| invalid("expected key=value"))?;
    let (key, value) = (key.trim(), value.trim());
    if key.is_empty() {
        return Err(invalid("empty key"));
    }
    if value.is_empty() {
        return Err(invalid("empty value"));
    }
    Ok((key, value))
}

impl FromStr for TagSet {
    type Err = ReviewError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(&[s])
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.iter().map(|(k, v)| format!("{k}={v}")).collect();
        f.write_str(&pairs.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchMember {
    pub id: String,
    pub geometry: Polygon,
}

/// Snapshot of the kept candidates at the time it was collected.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportBatch {
    members: Vec<BatchMember>,
    tags: TagSet,
}

impl ExportBatch {
    pub fn new(members: Vec<BatchMember>, tags: TagSet) -> Self {
        Self { members, tags }
    }

    pub fn members(&self) -> &[BatchMember] {
        &self.members
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.id.as_str())
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    /// (geometry, tags) for each member, in batch order.
    pub fn pairs(&self) -> impl Iterator<Item = (&Polygon, &TagSet)> {
        self.members.iter().map(|m| (&m.geometry, &self.tags))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Every candidate under `keep/`, sorted by identifier.
pub fn collect_kept(store: &ResultStore, tags: &TagSet) -> Result<ExportBatch> {
    let mut ids: Vec<String> = store.list_partition(Partition::Keep)?.collect();
    ids.sort();

    let members = ids
        .into_iter()
        .map(|id| {
            let geometry = store.geometry_in(Partition::Keep, &id)?;
            Ok(BatchMember { id, geometry })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ExportBatch::new(members, tags.clone()))
}

/// A serialized change file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeDocument {
    pub body: String,
    pub feature_count: usize,
}

impl ChangeDocument {
    pub fn mime_type(&self) -> &'static str {
        CHANGE_FILE_MIME
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| ReviewError::io(parent, e))?;
        }
        fs::write(path, &self.body).map_err(|e| ReviewError::io(path, e))
    }
}

/// Turns a batch into a change file.
pub trait ChangeSerializer {
    fn name(&self) -> &'static str;
    fn serialize(&self, batch: &ExportBatch) -> Result<ChangeDocument>;
}

/// Serialize `batch` as OsmChange.
pub fn export(batch: &ExportBatch) -> Result<ChangeDocument> {
    export_with(batch, &OsmChangeSerializer::default())
}

pub fn export_with(batch: &ExportBatch, serializer: &dyn ChangeSerializer) -> Result<ChangeDocument> {
    if batch.is_empty() {
        return Err(ReviewError::EmptyBatch);
    }
    let document = serializer.serialize(batch)?;
    info!(
        serializer = serializer.name(),
        features = document.feature_count,
        "change file assembled"
    );
    Ok(document)
}
