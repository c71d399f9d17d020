//! Per-request artifact directories.
//!
//! A session owns three locations, all derived from its id:
//!
//! - `<upload_root>/<id>/`: raw uploads, removed when the request ends;
//! - `<result_root>/<id>/`: encoded outputs, kept until [`SessionStore::purge`];
//! - `<archive_root>/upscaled_<id>.zip`: the packaged results, if requested.
//!
//! Sessions never share directories, so no cross-session locking is needed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use image::ImageFormat;
use tracing::{debug, info};

use hires_core::error::{HiresError, Result};
use hires_core::naming;
use hires_core::types::SessionId;

use crate::config::ServiceConfig;

#[derive(Clone, Debug)]
pub struct SessionStore {
    upload_root: PathBuf,
    result_root: PathBuf,
    archive_root: PathBuf,
}

impl SessionStore {
    pub fn new(
        upload_root: impl Into<PathBuf>,
        result_root: impl Into<PathBuf>,
        archive_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            upload_root: upload_root.into(),
            result_root: result_root.into(),
            archive_root: archive_root.into(),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(
            config.upload_root.clone(),
            config.result_root.clone(),
            config.archive_root.clone(),
        )
    }

    /// Mint a new session and create both of its directories.
    pub fn open_session(&self) -> Result<SessionId> {
        let id = SessionId::generate();
        self.upload_dir(&id)?;
        self.result_dir(&id)?;
        info!(session = %id, "Session opened");
        Ok(id)
    }

    /// Upload directory for `id`, created if missing.
    pub fn upload_dir(&self, id: &SessionId) -> Result<PathBuf> {
        ensure_dir(self.upload_root.join(id.to_string()))
    }

    /// Result directory for `id`, created if missing.
    pub fn result_dir(&self, id: &SessionId) -> Result<PathBuf> {
        ensure_dir(self.result_dir_path(id))
    }

    /// Where the result directory for `id` lives; not created.
    pub fn result_dir_path(&self, id: &SessionId) -> PathBuf {
        self.result_root.join(id.to_string())
    }

    pub fn archive_path(&self, id: &SessionId) -> PathBuf {
        self.archive_root.join(format!("upscaled_{id}.zip"))
    }

    /// Whether `id` still has a result directory.
    pub fn exists(&self, id: &SessionId) -> bool {
        self.result_dir_path(id).is_dir()
    }

    /// Delete the upload side of `id`.  Idempotent.
    pub fn close_upload(&self, id: &SessionId) -> Result<()> {
        let dir = self.upload_root.join(id.to_string());
        remove_dir_if_present(&dir)?;
        debug!(session = %id, "Upload directory removed");
        Ok(())
    }

    /// Delete the result directory of `id` without touching its archive.  Idempotent.
    pub fn discard_results(&self, id: &SessionId) -> Result<()> {
        remove_dir_if_present(&self.result_dir_path(id))
    }

    /// Delete the result directory and packaged archive of `id`.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` when the result directory does not exist.
    pub fn purge(&self, id: &SessionId) -> Result<()> {
        let dir = self.result_dir_path(id);
        if !dir.is_dir() {
            return Err(HiresError::SessionNotFound(id.to_string()));
        }
        fs::remove_dir_all(&dir).map_err(|e| HiresError::io(&dir, e))?;

        let archive = self.archive_path(id);
        match fs::remove_file(&archive) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(HiresError::io(&archive, e)),
        }
        info!(session = %id, "Session purged");
        Ok(())
    }

    /// Resolve a result file for preview or download.
    ///
    /// The requested name goes through the upload sanitizer, so it can never
    /// escape the result directory.
    pub fn result_file(&self, id: &SessionId, name: &str) -> Result<PathBuf> {
        let dir = self.result_dir_path(id);
        if !dir.is_dir() {
            return Err(HiresError::SessionNotFound(id.to_string()));
        }
        let clean = naming::sanitize_filename(name);
        let path = dir.join(&clean);
        if clean.is_empty() || !path.is_file() {
            return Err(HiresError::ResultNotFound {
                session: id.to_string(),
                name: name.to_string(),
            });
        }
        Ok(path)
    }

    /// Plain files in the result directory of `id`, sorted by name.
    pub fn list_results(&self, id: &SessionId) -> Result<Vec<String>> {
        let dir = self.result_dir_path(id);
        if !dir.is_dir() {
            return Err(HiresError::SessionNotFound(id.to_string()));
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| HiresError::io(&dir, e))? {
            let entry = entry.map_err(|e| HiresError::io(&dir, e))?;
            let is_file = entry
                .file_type()
                .map_err(|e| HiresError::io(entry.path(), e))?
                .is_file();
            if is_file && let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// MIME type guessed from the extension of `name`.
pub fn content_type(name: &str) -> &'static str {
    if naming::extension_of(name).as_deref() == Some("zip") {
        return "application/zip";
    }
    ImageFormat::from_path(name)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream")
}

fn ensure_dir(dir: PathBuf) -> Result<PathBuf> {
    fs::create_dir_all(&dir).map_err(|e| HiresError::io(&dir, e))?;
    Ok(dir)
}

fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(HiresError::io(dir, e)),
    }
}
