//! Keep/discard decisions for pending candidates.
//!
//! A decision moves all three artifacts of a candidate into the `keep` or
//! `discard` partition. The move is all-or-nothing: files are staged under
//! `.staging/<id>/` and then committed, and any failure returns every file
//! already moved to its pending location.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{Result, ReviewError};
use crate::store::{ArtifactPaths, Partition, ResultStore, STAGING_DIR, check_id};

/// The per-file move primitive.
pub trait Relocator {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
}

/// Moves files with `std::fs::rename`. All partitions share the result
/// root, so every rename stays on one filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsRelocator;

impl Relocator for FsRelocator {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }
}

pub struct TriageEngine<R: Relocator = FsRelocator> {
    store: ResultStore,
    relocator: R,
}

impl TriageEngine<FsRelocator> {
    pub fn new(store: ResultStore) -> Self {
        Self::with_relocator(store, FsRelocator)
    }
}

impl<R: Relocator> TriageEngine<R> {
    pub fn with_relocator(store: ResultStore, relocator: R) -> Self {
        Self { store, relocator }
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Move a pending candidate into `keep/`. Returns where its files now are.
    pub fn keep(&self, id: &str) -> Result<ArtifactPaths> {
        self.relocate(id, Partition::Keep)
    }

    /// Move a pending candidate into `discard/`. Returns where its files now are.
    pub fn discard(&self, id: &str) -> Result<ArtifactPaths> {
        self.relocate(id, Partition::Discard)
    }

    pub fn decide(&self, id: &str, partition: Partition) -> Result<ArtifactPaths> {
        self.relocate(id, partition)
    }

    fn relocate(&self, id: &str, partition: Partition) -> Result<ArtifactPaths> {
        let op = partition.dir_name();
        check_id(id)?;

        let source = self.store.pending_paths(id);
        if !source.geometry.is_file() {
            return Err(match self.store.triaged_into(id) {
                Some(partition) => ReviewError::AlreadyTriaged {
                    id: id.to_string(),
                    op,
                    partition,
                },
                None => ReviewError::MissingArtifact {
                    id: id.to_string(),
                    path: source.geometry,
                },
            });
        }
        for path in source.all() {
            if !path.is_file() {
                return Err(ReviewError::MissingArtifact {
                    id: id.to_string(),
                    path: path.to_path_buf(),
                });
            }
        }

        let dest = self.store.partition_paths(partition, id);
        let staging_dir = self.store.staging_dir(id);
        let staged = ArtifactPaths::in_dir(&staging_dir, id);
        for path in dest.all().into_iter().chain(staged.all()) {
            if path.exists() {
                return Err(ReviewError::DuplicateTarget {
                    id: id.to_string(),
                    op,
                    path: path.to_path_buf(),
                });
            }
        }

        for dir in [self.store.partition_dir(partition), staging_dir.clone()] {
            fs::create_dir_all(&dir).map_err(|source| ReviewError::RelocationFailed {
                id: id.to_string(),
                op,
                path: dir.clone(),
                source,
                stranded: Vec::new(),
            })?;
        }

        let mut mv = Move {
            relocator: &self.relocator,
            origin: source.all().map(Path::to_path_buf),
            current: source.all().map(Path::to_path_buf),
        };

        for (i, target) in staged.all().into_iter().chain(dest.all()).enumerate() {
            if let Err(source) = mv.step(i % 3, target) {
                let path = mv.current[i % 3].clone();
                let stranded = mv.rollback();
                if stranded.is_empty() {
                    warn!(id, %partition, "move failed, rolled back");
                    cleanup_staging(&staging_dir);
                } else {
                    warn!(id, %partition, ?stranded, "move failed, rollback incomplete");
                }
                return Err(ReviewError::RelocationFailed {
                    id: id.to_string(),
                    op,
                    path,
                    source,
                    stranded,
                });
            }
        }

        cleanup_staging(&staging_dir);
        info!(id, %partition, "candidate triaged");
        Ok(dest)
    }
}

/// Where each of a candidate's three files currently is.
struct Move<'a, R: Relocator> {
    relocator: &'a R,
    origin: [PathBuf; 3],
    current: [PathBuf; 3],
}

impl<R: Relocator> Move<'_, R> {
    fn step(&mut self, file: usize, to: &Path) -> io::Result<()> {
        self.relocator.rename(&self.current[file], to)?;
        self.current[file] = to.to_path_buf();
        Ok(())
    }

    /// Return every moved file to its origin, newest first. Yields the
    /// files that could not be returned.
    fn rollback(&mut self) -> Vec<PathBuf> {
        let mut stranded = Vec::new();
        for file in (0..3).rev() {
            if self.current[file] == self.origin[file] {
                continue;
            }
            match self.relocator.rename(&self.current[file], &self.origin[file]) {
                Ok(()) => self.current[file] = self.origin[file].clone(),
                Err(e) => {
                    debug!(path = %self.current[file].display(), "rollback failed: {e}");
                    stranded.push(self.current[file].clone());
                }
            }
        }
        stranded
    }
}

fn cleanup_staging(staging_dir: &Path) {
    if let Err(e) = fs::remove_dir(staging_dir) {
        debug!(dir = %staging_dir.display(), "could not remove staging dir: {e}");
        return;
    }
    // Shared parent; only goes away once no other candidate is staged.
    if let Some(parent) = staging_dir.parent()
        && parent.file_name().is_some_and(|n| n == STAGING_DIR)
    {
        let _ = fs::remove_dir(parent);
    }
}
