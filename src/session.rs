//! One operator's review of one result directory.

use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::Config;
use crate::detector::{CommandDetector, DetectionRequest, Detector};
use crate::error::{Result, ReviewError};
use crate::export::{self, ChangeDocument, ExportBatch, TagSet};
use crate::model::{HubModel, ModelSource};
use crate::query::QueryArea;
use crate::store::{DetectionManifest, ResultStore};
use crate::triage::TriageEngine;

pub const LOCK_FILE: &str = ".inference.lock";

/// Held while an inference run is in flight for a result directory.
/// Removing the lock file on drop releases it, on success and on failure.
/// The file holds the owner's PID so a lock left by a killed process can be
/// told apart from a live one.
#[derive(Debug)]
pub struct InferenceGuard {
    path: PathBuf,
}

impl InferenceGuard {
    /// Take the lock for `root`. A lock file whose recorded owner is no
    /// longer running was left by a crashed or interrupted run and is
    /// replaced.
    pub fn acquire(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| ReviewError::io(root, e))?;
        let path = root.join(LOCK_FILE);
        match Self::create(&path)? {
            Some(guard) => Ok(guard),
            None => {
                let owner = lock_owner(&path);
                if owner.is_some_and(|pid| !process_alive(pid)) {
                    warn!(path = %path.display(), pid = owner, "removing stale inference lock");
                    fs::remove_file(&path).map_err(|e| ReviewError::io(&path, e))?;
                    if let Some(guard) = Self::create(&path)? {
                        return Ok(guard);
                    }
                }
                Err(ReviewError::InferenceInFlight { lock: path, owner })
            }
        }
    }

    fn create(path: &Path) -> Result<Option<Self>> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(ReviewError::io(path, e)),
        };
        if let Err(e) = writeln!(file, "{}", std::process::id()) {
            let _ = fs::remove_file(path);
            return Err(ReviewError::io(path, e));
        }
        Ok(Some(Self {
            path: path.to_path_buf(),
        }))
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    a == b
        || matches!(
            (fs::canonicalize(a), fs::canonicalize(b)),
            (Ok(a), Ok(b)) if a == b
        )
}

/// PID recorded in a lock file, if it can be read.
fn lock_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 sends nothing; it only checks that the process exists.
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to another user.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for InferenceGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "could not release inference lock: {e}");
        }
    }
}

/// Result of one inference run, as shown to the operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceSummary {
    pub area: QueryArea,
    pub output_dir: PathBuf,
    pub existing: Vec<String>,
    pub new: Vec<String>,
    pub missed: Vec<String>,
}

impl InferenceSummary {
    /// `false` means "no new features found": informational, not a failure.
    pub fn has_new(&self) -> bool {
        !self.new.is_empty()
    }
}

pub struct ReviewSession {
    store: ResultStore,
    detector: Box<dyn Detector>,
    model: Box<dyn ModelSource>,
    batch_size: usize,
    save_full_images: bool,
}

impl ReviewSession {
    pub fn new(
        store: ResultStore,
        detector: Box<dyn Detector>,
        model: Box<dyn ModelSource>,
    ) -> Self {
        Self {
            store,
            detector,
            model,
            batch_size: crate::detector::DEFAULT_BATCH_SIZE,
            save_full_images: false,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let inference = &config.inference;
        let detector = CommandDetector::new(
            inference.detector_command.clone(),
            inference.detector_args.clone(),
        );
        let model = HubModel {
            endpoint: config.model.endpoint.clone(),
            repo_id: config.model.repo_id.clone(),
            revision: config.model.revision.clone(),
            filename: config.model.filename.clone(),
            local_dir: config.model.local_dir.clone(),
        };
        Self::new(
            ResultStore::new(&inference.output_dir),
            Box::new(detector),
            Box::new(model),
        )
        .with_batch_size(inference.batch_size)
        .with_full_images(inference.save_full_images)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_full_images(mut self, save_full_images: bool) -> Self {
        self.save_full_images = save_full_images;
        self
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn triage(&self) -> TriageEngine {
        TriageEngine::new(self.store.clone())
    }

    /// Fetch the model, run the detector over `area` and record what it
    /// found. At most one run per result directory is in flight; the run is
    /// not retried and cannot be cancelled.
    pub fn run_inference(&self, area: QueryArea) -> Result<InferenceSummary> {
        let _guard = InferenceGuard::acquire(self.store.root())?;

        info!(model = %self.model.describe(), "fetching model");
        let model_file = self.model.fetch()?;

        let request = DetectionRequest {
            model_file,
            output_dir: self.store.root().to_path_buf(),
            area,
            batch_size: self.batch_size,
            save_full_images: self.save_full_images,
        };
        info!(detector = self.detector.name(), "running inference");
        let outcome = self.detector.detect(&request)?;

        if !same_dir(&outcome.output_dir, self.store.root()) {
            return Err(ReviewError::Detector {
                name: self.detector.name().to_string(),
                message: format!(
                    "wrote results to {} instead of {}",
                    outcome.output_dir.display(),
                    self.store.root().display()
                ),
            });
        }
        self.store.save_manifest(&DetectionManifest {
            existing: outcome.existing.clone(),
            new: outcome.new.clone(),
            missed: outcome.missed.clone(),
            area: Some(area),
        })?;

        Ok(InferenceSummary {
            area,
            output_dir: self.store.root().to_path_buf(),
            existing: outcome.existing,
            new: outcome.new,
            missed: outcome.missed,
        })
    }

    pub fn collect_kept(&self, tags: &TagSet) -> Result<ExportBatch> {
        export::collect_kept(&self.store, tags)
    }

    pub fn export(&self, tags: &TagSet) -> Result<ChangeDocument> {
        export::export(&self.collect_kept(tags)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectionOutcome;
    use crate::query::LatLon;
    use crate::store::Provenance;
    use crate::test_utils::write_candidate;
    use std::cell::Cell;
    use std::rc::Rc;
    use tempfile::TempDir;

    struct LocalModel(PathBuf);

    impl ModelSource for LocalModel {
        fn describe(&self) -> String {
            "local".into()
        }
        fn fetch(&self) -> Result<PathBuf> {
            Ok(self.0.clone())
        }
    }

    /// Writes pending candidates for `new` and reports the given sets.
    struct FakeDetector {
        existing: Vec<&'static str>,
        new: Vec<&'static str>,
        calls: Rc<Cell<usize>>,
    }

    impl Detector for FakeDetector {
        fn name(&self) -> &str {
            "fake"
        }

        fn detect(&self, request: &DetectionRequest) -> Result<DetectionOutcome> {
            self.calls.set(self.calls.get() + 1);
            assert!(request.output_dir.join(LOCK_FILE).exists());
            for id in &self.new {
                write_candidate(&request.output_dir, id);
            }
            Ok(DetectionOutcome {
                output_dir: request.output_dir.clone(),
                existing: self.existing.iter().map(|s| s.to_string()).collect(),
                new: self.new.iter().map(|s| s.to_string()).collect(),
                missed: Vec::new(),
            })
        }
    }

    struct FailingDetector;

    impl Detector for FailingDetector {
        fn name(&self) -> &str {
            "failing"
        }
        fn detect(&self, _: &DetectionRequest) -> Result<DetectionOutcome> {
            Err(ReviewError::Detector {
                name: "failing".into(),
                message: "out of memory".into(),
            })
        }
    }

    fn area() -> QueryArea {
        QueryArea::new(
            LatLon {
                lat: 42.8075,
                lon: -8.1519,
            },
            2.0,
        )
        .unwrap()
    }

    fn session(dir: &Path, detector: Box<dyn Detector>) -> ReviewSession {
        ReviewSession::new(
            ResultStore::new(dir),
            detector,
            Box::new(LocalModel(dir.join("model.pt"))),
        )
    }

    #[test]
    fn end_to_end_keep_two_discard_one() {
        let dir = TempDir::new().unwrap();
        let calls = Rc::new(Cell::new(0));
        let session = session(
            dir.path(),
            Box::new(FakeDetector {
                existing: vec!["e1", "e2"],
                new: vec!["a", "b", "c"],
                calls: calls.clone(),
            }),
        );

        let summary = session.run_inference(area()).unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(summary.existing.len(), 2);
        assert_eq!(summary.new, vec!["a", "b", "c"]);
        assert!(summary.has_new());
        assert!(!dir.path().join(LOCK_FILE).exists());
        assert_eq!(session.store().provenance("e1").unwrap(), Provenance::Existing);
        assert_eq!(session.store().provenance("a").unwrap(), Provenance::New);

        let triage = session.triage();
        triage.keep("a").unwrap();
        triage.keep("b").unwrap();
        triage.discard("c").unwrap();
        assert_eq!(session.store().list_pending().unwrap().count(), 0);

        let tags = TagSet::parse(&["golf=feature"]).unwrap();
        let batch = session.collect_kept(&tags).unwrap();
        assert_eq!(batch.ids().collect::<Vec<_>>(), vec!["a", "b"]);

        let document = session.export(&tags).unwrap();
        assert_eq!(document.feature_count, 2);
        assert_eq!(document.body.matches("<way ").count(), 2);
    }

    #[test]
    fn no_new_features_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let session = session(
            dir.path(),
            Box::new(FakeDetector {
                existing: vec!["e1"],
                new: Vec::new(),
                calls: Rc::new(Cell::new(0)),
            }),
        );
        let summary = session.run_inference(area()).unwrap();
        assert!(!summary.has_new());
    }

    #[test]
    fn second_inference_while_one_is_in_flight_is_refused() {
        let dir = TempDir::new().unwrap();
        let calls = Rc::new(Cell::new(0));
        let session = session(
            dir.path(),
            Box::new(FakeDetector {
                existing: Vec::new(),
                new: vec!["a"],
                calls: calls.clone(),
            }),
        );

        let _held = InferenceGuard::acquire(dir.path()).unwrap();
        assert!(matches!(
            session.run_inference(area()),
            Err(ReviewError::InferenceInFlight { .. })
        ));
        assert_eq!(calls.get(), 0);
    }

    /// PID of a process that has already exited and been reaped.
    #[cfg(unix)]
    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[cfg(unix)]
    #[test]
    fn lock_left_by_a_dead_process_is_replaced() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(LOCK_FILE), format!("{}\n", dead_pid())).unwrap();
        let session = session(
            dir.path(),
            Box::new(FakeDetector {
                existing: Vec::new(),
                new: vec!["a"],
                calls: Rc::new(Cell::new(0)),
            }),
        );

        let summary = session.run_inference(area()).unwrap();
        assert_eq!(summary.new, vec!["a"]);
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn live_lock_names_its_owner_and_path() {
        let dir = TempDir::new().unwrap();
        let _held = InferenceGuard::acquire(dir.path()).unwrap();

        let err = InferenceGuard::acquire(dir.path()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains(&format!("in process {}", std::process::id())));
        assert!(message.contains(LOCK_FILE));
    }

    #[test]
    fn unreadable_lock_is_treated_as_held() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(LOCK_FILE), "").unwrap();

        match InferenceGuard::acquire(dir.path()) {
            Err(ReviewError::InferenceInFlight { lock, owner }) => {
                assert_eq!(lock, dir.path().join(LOCK_FILE));
                assert_eq!(owner, None);
            }
            other => panic!("expected InferenceInFlight, got {other:?}"),
        }
    }

    #[test]
    fn lock_is_released_when_detector_fails() {
        let dir = TempDir::new().unwrap();
        let session = session(dir.path(), Box::new(FailingDetector));

        assert!(matches!(
            session.run_inference(area()),
            Err(ReviewError::Detector { .. })
        ));
        assert!(!dir.path().join(LOCK_FILE).exists());
        assert!(!session.store().manifest_path().exists());
    }

    /// Reports a directory other than the one it was asked to use.
    struct MisplacedDetector(PathBuf);

    impl Detector for MisplacedDetector {
        fn name(&self) -> &str {
            "misplaced"
        }
        fn detect(&self, _: &DetectionRequest) -> Result<DetectionOutcome> {
            Ok(DetectionOutcome {
                output_dir: self.0.clone(),
                existing: vec!["e1".into()],
                new: vec!["a".into()],
                missed: Vec::new(),
            })
        }
    }

    #[test]
    fn detector_writing_elsewhere_is_rejected() {
        let dir = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let session = session(
            dir.path(),
            Box::new(MisplacedDetector(elsewhere.path().to_path_buf())),
        );

        match session.run_inference(area()) {
            Err(ReviewError::Detector { message, .. }) => {
                assert!(message.contains("instead of"));
            }
            other => panic!("expected Detector error, got {other:?}"),
        }
        assert!(!session.store().manifest_path().exists());
        assert!(!elsewhere.path().join(crate::store::MANIFEST_FILE).exists());
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn equivalent_output_dir_spelling_is_accepted() {
        let dir = TempDir::new().unwrap();
        let spelled = dir.path().join(".");
        let session = session(dir.path(), Box::new(MisplacedDetector(spelled)));

        let summary = session.run_inference(area()).unwrap();
        assert_eq!(summary.output_dir, dir.path());
        assert_eq!(session.store().provenance("e1").unwrap(), Provenance::Existing);
    }

    #[test]
    fn manifest_records_query_area() {
        let dir = TempDir::new().unwrap();
        let session = session(
            dir.path(),
            Box::new(FakeDetector {
                existing: Vec::new(),
                new: vec!["a"],
                calls: Rc::new(Cell::new(0)),
            }),
        );
        session.run_inference(area()).unwrap();

        let manifest = session.store().manifest().unwrap().unwrap();
        assert_eq!(manifest.area, Some(area()));
        assert_eq!(manifest.new, vec!["a"]);
    }

    #[test]
    fn empty_keep_cannot_be_exported() {
        let dir = TempDir::new().unwrap();
        let session = session(dir.path(), Box::new(FailingDetector));
        let tags = TagSet::parse(&["golf=feature"]).unwrap();
        assert!(session.collect_kept(&tags).unwrap().is_empty());
        assert!(matches!(session.export(&tags), Err(ReviewError::EmptyBatch)));
    }
}
