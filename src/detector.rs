use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, info};

use crate::error::{Result, ReviewError};
use crate::query::QueryArea;

pub const DEFAULT_BATCH_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRequest {
    pub model_file: PathBuf,
    pub output_dir: PathBuf,
    pub area: QueryArea,
    pub batch_size: usize,
    pub save_full_images: bool,
}

/// What the detector reports back: where it wrote its results and the
/// identifier sets it classified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionOutcome {
    pub output_dir: PathBuf,
    #[serde(default)]
    pub existing: Vec<String>,
    #[serde(default)]
    pub new: Vec<String>,
    #[serde(default)]
    pub missed: Vec<String>,
}

/// Runs inference over a query area and populates a result store.
pub trait Detector {
    fn name(&self) -> &str;
    fn detect(&self, request: &DetectionRequest) -> Result<DetectionOutcome>;
}

/// Invokes an external detector program.
///
/// The request is passed as flags:
///
/// ```text
/// <program> [args...] --model <file> --output-dir <dir> --lat <lat> --lon <lon>
///     --margin <km> --batch-size <n> [--save-full-images]
/// ```
///
/// and the program prints a [`DetectionOutcome`] as JSON on stdout.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    program: String,
    args: Vec<String>,
}

impl CommandDetector {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn command(&self, request: &DetectionRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--model")
            .arg(&request.model_file)
            .arg("--output-dir")
            .arg(&request.output_dir)
            .arg("--lat")
            .arg(request.area.center.lat.to_string())
            .arg("--lon")
            .arg(request.area.center.lon.to_string())
            .arg("--margin")
            .arg(request.area.margin_km.to_string())
            .arg("--batch-size")
            .arg(request.batch_size.to_string());
        if request.save_full_images {
            cmd.arg("--save-full-images");
        }
        cmd
    }

    fn failure(&self, message: impl Into<String>) -> ReviewError {
        ReviewError::Detector {
            name: self.program.clone(),
            message: message.into(),
        }
    }
}

impl Detector for CommandDetector {
    fn name(&self) -> &str {
        &self.program
    }

    fn detect(&self, request: &DetectionRequest) -> Result<DetectionOutcome> {
        let mut cmd = self.command(request);
        debug!(?cmd, "starting detector");

        let output = cmd
            .output()
            .map_err(|e| self.failure(format!("could not start: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.failure(format!("{} ({})", output.status, stderr.trim())));
        }

        let outcome: DetectionOutcome = serde_json::from_slice(&output.stdout)
            .map_err(|e| self.failure(format!("unreadable output: {e}")))?;
        info!(
            existing = outcome.existing.len(),
            new = outcome.new.len(),
            missed = outcome.missed.len(),
            "detector finished"
        );
        Ok(outcome)
    }
}
