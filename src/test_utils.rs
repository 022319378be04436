//! Fixtures shared by the unit tests.

use std::fs;
use std::path::Path;

/// A small valid square near the default query area.
pub const SQUARE: &str =
    "[[-8.1519,42.8075],[-8.1509,42.8075],[-8.1509,42.8085],[-8.1519,42.8085]]";

/// Write the three artifacts for `id` into `dir` the way the detector lays
/// them out, creating `dir` if needed.
pub fn write_candidate(dir: &Path, id: &str) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(format!("{id}.json")), SQUARE).unwrap();
    fs::write(dir.join(format!("{id}.png")), b"raw").unwrap();
    fs::write(dir.join(format!("{id}_painted.png")), b"painted").unwrap();
}
