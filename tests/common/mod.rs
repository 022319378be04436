#![allow(dead_code)]

use assert_cmd::Command;
use osm_triage::config::Config;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const TRIANGLE: &str = "[[-8.1519,42.8075],[-8.1509,42.8075],[-8.1509,42.8085]]";

/// Detector stand-in: writes `a`, `b`, `c` into --output-dir and reports
/// two existing features.
pub const DETECTOR_SCRIPT: &str = r#"
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output-dir) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
for id in a b c; do
  printf '%s' '[[-8.1519,42.8075],[-8.1509,42.8075],[-8.1509,42.8085]]' > "$out/$id.json"
  printf raw > "$out/$id.png"
  printf painted > "$out/${id}_painted.png"
done
printf '{"output_dir":"%s","existing":["e1","e2"],"new":["a","b","c"],"missed":["m1"]}' "$out"
"#;

/// Detector stand-in that finds nothing new.
pub const EMPTY_DETECTOR_SCRIPT: &str = r#"
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output-dir) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
printf '{"output_dir":"%s","existing":["e1"],"new":[]}' "$out"
"#;

/// A temporary workspace with its own config file, result directory and a
/// pre-downloaded model.
pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_detector(DETECTOR_SCRIPT)
    }

    pub fn with_detector(script: &str) -> Self {
        let fixture = Self {
            dir: TempDir::new().unwrap(),
        };
        let mut config = Config::default();
        config.inference.output_dir = fixture.results();
        config.inference.detector_command = "sh".into();
        config.inference.detector_args = vec!["-c".into(), script.into(), "detect".into()];
        config.model.local_dir = fixture.dir.path().join("models");
        config.save(&fixture.config_path()).unwrap();

        fs::create_dir_all(fixture.results()).unwrap();
        fs::create_dir_all(&config.model.local_dir).unwrap();
        fs::write(config.model.local_dir.join("model.pt"), b"weights").unwrap();
        fixture
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("config.toml")
    }

    pub fn results(&self) -> PathBuf {
        self.dir.path().join("results")
    }

    pub fn candidate(&self, id: &str) {
        write_candidate(&self.results(), id);
    }

    pub fn candidate_in(&self, partition: &str, id: &str) {
        write_candidate(&self.results().join(partition), id);
    }

    /// The binary, isolated from the caller's environment and config.
    pub fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("osm-triage").unwrap();
        cmd.env_remove("MAPBOX_TOKEN")
            .env_remove("OSM_TRIAGE_OUTPUT_DIR")
            .env_remove("RUST_LOG")
            .env("NO_COLOR", "1")
            .arg("--config")
            .arg(self.config_path())
            .arg("--output-dir")
            .arg(self.results());
        cmd
    }
}

pub fn write_candidate(dir: &Path, id: &str) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(format!("{id}.json")), TRIANGLE).unwrap();
    fs::write(dir.join(format!("{id}.png")), b"raw").unwrap();
    fs::write(dir.join(format!("{id}_painted.png")), b"painted").unwrap();
}

pub fn artifacts_in(dir: &Path, id: &str) -> [PathBuf; 3] {
    [
        dir.join(format!("{id}.json")),
        dir.join(format!("{id}.png")),
        dir.join(format!("{id}_painted.png")),
    ]
}
