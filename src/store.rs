//! Filesystem-backed result set for one query area.
//!
//! Layout (shared with the detector, must not change):
//!
//! ```text
//! <root>/<id>.json              pending geometry
//! <root>/<id>.png               pending raw image
//! <root>/<id>_painted.png       pending painted image
//! <root>/keep/...               kept, same naming
//! <root>/discard/...            discarded, same naming
//! ```
//!
//! `manifest.toml`, `.inference.lock` and `.staging/` also live under the
//! root; none of them match the pending scan.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Result, ReviewError};
use crate::geometry::Polygon;
use crate::query::QueryArea;

pub const MANIFEST_FILE: &str = "manifest.toml";
pub(crate) const STAGING_DIR: &str = ".staging";

const GEOMETRY_EXT: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Keep,
    Discard,
}

impl Partition {
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Keep => "keep",
            Self::Discard => "discard",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriageState {
    Pending,
    Kept,
    Discarded,
}

impl From<Partition> for TriageState {
    fn from(partition: Partition) -> Self {
        match partition {
            Partition::Keep => Self::Kept,
            Partition::Discard => Self::Discarded,
        }
    }
}

impl fmt::Display for TriageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Kept => "kept",
            Self::Discarded => "discarded",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Already present in the reference map data.
    Existing,
    /// Detected but absent from the reference map data.
    New,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Existing => "existing",
            Self::New => "new",
        })
    }
}

/// The three files that make up one candidate inside a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub geometry: PathBuf,
    pub raw_image: PathBuf,
    pub painted_image: PathBuf,
}

impl ArtifactPaths {
    pub fn in_dir(dir: &Path, id: &str) -> Self {
        Self {
            geometry: dir.join(format!("{id}.{GEOMETRY_EXT}")),
            raw_image: dir.join(format!("{id}.png")),
            painted_image: dir.join(format!("{id}_painted.png")),
        }
    }

    pub fn all(&self) -> [&Path; 3] {
        [&self.geometry, &self.raw_image, &self.painted_image]
    }
}

/// A candidate's images and its validated geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifacts {
    pub id: String,
    pub raw_image: PathBuf,
    pub painted_image: PathBuf,
    pub geometry: Polygon,
}

/// Identifier sets reported by the detector for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionManifest {
    #[serde(default)]
    pub existing: Vec<String>,
    #[serde(default)]
    pub new: Vec<String>,
    #[serde(default)]
    pub missed: Vec<String>,
    // Tables must follow plain values in TOML.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<QueryArea>,
}

/// Lazy scan of geometry records in one directory.
///
/// Created by [`ResultStore::list_pending`] and
/// [`ResultStore::list_partition`]; each call starts a fresh scan.
pub struct CandidateIds {
    entries: Option<fs::ReadDir>,
}

impl Iterator for CandidateIds {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let entries = self.entries.as_mut()?;
        entries.find_map(candidate_id)
    }
}

/// The identifier a directory entry names, if it is a geometry record.
fn candidate_id(entry: io::Result<fs::DirEntry>) -> Option<String> {
    let entry = match entry {
        Ok(e) => e,
        Err(e) => {
            warn!("skipping unreadable directory entry: {e}");
            return None;
        }
    };
    if !entry.file_type().is_ok_and(|t| t.is_file()) {
        return None;
    }
    let path = entry.path();
    if path.extension().and_then(|e| e.to_str()) != Some(GEOMETRY_EXT) {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|stem| !stem.starts_with('.'))
        .map(str::to_string)
}

#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_dir(&self, partition: Partition) -> PathBuf {
        self.root.join(partition.dir_name())
    }

    pub(crate) fn staging_dir(&self, id: &str) -> PathBuf {
        self.root.join(STAGING_DIR).join(id)
    }

    pub fn pending_paths(&self, id: &str) -> ArtifactPaths {
        ArtifactPaths::in_dir(&self.root, id)
    }

    pub fn partition_paths(&self, partition: Partition, id: &str) -> ArtifactPaths {
        ArtifactPaths::in_dir(&self.partition_dir(partition), id)
    }

    /// Identifiers still awaiting a decision. Reflects the directory as it is
    /// now; call again to rescan.
    pub fn list_pending(&self) -> Result<CandidateIds> {
        scan(&self.root)
    }

    pub fn list_partition(&self, partition: Partition) -> Result<CandidateIds> {
        scan(&self.partition_dir(partition))
    }

    /// Images and geometry for a pending candidate.
    pub fn load_artifacts(&self, id: &str) -> Result<Artifacts> {
        check_id(id)?;
        load(id, &self.pending_paths(id))
    }

    /// Images and geometry for a candidate already triaged into `partition`.
    pub fn load_from(&self, partition: Partition, id: &str) -> Result<Artifacts> {
        check_id(id)?;
        load(id, &self.partition_paths(partition, id))
    }

    /// Geometry alone, for a candidate in `partition`.
    pub fn geometry_in(&self, partition: Partition, id: &str) -> Result<Polygon> {
        check_id(id)?;
        let path = self.partition_paths(partition, id).geometry;
        read_geometry(id, &path)
    }

    pub fn state(&self, id: &str) -> Result<TriageState> {
        check_id(id)?;
        if self.pending_paths(id).geometry.is_file() {
            return Ok(TriageState::Pending);
        }
        if let Some(partition) = self.triaged_into(id) {
            return Ok(partition.into());
        }
        Err(ReviewError::UnknownCandidate(id.to_string()))
    }

    pub(crate) fn triaged_into(&self, id: &str) -> Option<Partition> {
        [Partition::Keep, Partition::Discard]
            .into_iter()
            .find(|p| self.partition_paths(*p, id).geometry.is_file())
    }

    /// Provenance as classified by the detector. Without a manifest, the
    /// detector's placement in the store is the only evidence, and it only
    /// places `new` candidates there.
    pub fn provenance(&self, id: &str) -> Result<Provenance> {
        check_id(id)?;
        if let Some(manifest) = self.manifest()? {
            if manifest.existing.iter().any(|e| e == id) {
                return Ok(Provenance::Existing);
            }
            if manifest.new.iter().any(|n| n == id) {
                return Ok(Provenance::New);
            }
        }
        self.state(id).map(|_| Provenance::New)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn manifest(&self) -> Result<Option<DetectionManifest>> {
        let path = self.manifest_path();
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ReviewError::io(path, e)),
        };
        toml::from_str(&content)
            .map(Some)
            .map_err(|e| ReviewError::Manifest {
                path,
                reason: e.to_string(),
            })
    }

    pub(crate) fn save_manifest(&self, manifest: &DetectionManifest) -> Result<()> {
        let path = self.manifest_path();
        let content = toml::to_string_pretty(manifest).map_err(|e| ReviewError::Manifest {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        fs::create_dir_all(&self.root).map_err(|e| ReviewError::io(&self.root, e))?;
        fs::write(&path, content).map_err(|e| ReviewError::io(path, e))
    }
}

fn scan(dir: &Path) -> Result<CandidateIds> {
    debug!(dir = %dir.display(), "scanning for geometry records");
    match fs::read_dir(dir) {
        Ok(entries) => Ok(CandidateIds {
            entries: Some(entries),
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(CandidateIds { entries: None }),
        Err(e) => Err(ReviewError::io(dir, e)),
    }
}

fn load(id: &str, paths: &ArtifactPaths) -> Result<Artifacts> {
    for path in paths.all() {
        if !path.is_file() {
            return Err(ReviewError::MissingArtifact {
                id: id.to_string(),
                path: path.to_path_buf(),
            });
        }
    }
    Ok(Artifacts {
        id: id.to_string(),
        raw_image: paths.raw_image.clone(),
        painted_image: paths.painted_image.clone(),
        geometry: read_geometry(id, &paths.geometry)?,
    })
}

fn read_geometry(id: &str, path: &Path) -> Result<Polygon> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(ReviewError::MissingArtifact {
                id: id.to_string(),
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(ReviewError::io(path, e)),
    };
    Polygon::from_json(&text).map_err(|e| ReviewError::MalformedGeometry {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

/// Identifiers are file stems; anything that could escape the root is
/// treated as unknown.
pub(crate) fn check_id(id: &str) -> Result<()> {
    let bad = id.is_empty()
        || id.starts_with('.')
        || id.contains(['/', '\\'])
        || Path::new(id).components().count() != 1;
    if bad {
        return Err(ReviewError::UnknownCandidate(id.to_string()));
    }
    Ok(())
}
