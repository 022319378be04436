use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use tracing::info;

use crate::error::{Result, ReviewError};

/// Makes a model file available locally before inference.
pub trait ModelSource {
    fn describe(&self) -> String;
    fn fetch(&self) -> Result<PathBuf>;
}

/// A model file hosted in a Hugging Face style repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubModel {
    pub endpoint: String,
    pub repo_id: String,
    pub revision: String,
    pub filename: String,
    pub local_dir: PathBuf,
}

impl HubModel {
    pub fn url(&self) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.repo_id,
            self.revision,
            self.filename
        )
    }

    pub fn local_path(&self) -> PathBuf {
        self.local_dir.join(&self.filename)
    }

    fn failure(&self, message: impl Into<String>) -> ReviewError {
        ReviewError::ModelFetch {
            what: self.describe(),
            message: message.into(),
        }
    }
}

impl ModelSource for HubModel {
    fn describe(&self) -> String {
        format!("{}/{}", self.repo_id, self.filename)
    }

    fn fetch(&self) -> Result<PathBuf> {
        let target = self.local_path();
        if target.is_file() {
            info!(path = %target.display(), "model already present");
            return Ok(target);
        }

        fs::create_dir_all(&self.local_dir).map_err(|e| ReviewError::io(&self.local_dir, e))?;

        let url = self.url();
        info!(%url, "downloading model");
        let response = ureq::get(&url)
            .call()
            .map_err(|e| self.failure(e.to_string()))?;

        // Only a complete download is renamed into place.
        let partial = target.with_extension("part");
        let mut file = File::create(&partial).map_err(|e| ReviewError::io(&partial, e))?;
        if let Err(e) = io::copy(&mut response.into_reader(), &mut file) {
            let _ = fs::remove_file(&partial);
            return Err(self.failure(format!("download interrupted: {e}")));
        }
        drop(file);
        fs::rename(&partial, &target).map_err(|e| ReviewError::io(&target, e))?;

        info!(path = %target.display(), "model downloaded");
        Ok(target)
    }
}
