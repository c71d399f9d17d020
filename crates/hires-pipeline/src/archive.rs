//! Session result packaging.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use hires_core::error::{HiresError, Result};
use hires_core::types::SessionId;

use crate::session::SessionStore;

/// Name offered to clients downloading an archive.
pub const ARCHIVE_DOWNLOAD_NAME: &str = "upscaled_images.zip";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    /// Entry names in archive order.
    pub entries: Vec<String>,
    /// Archive size on disk.
    pub bytes: u64,
    pub download_name: &'static str,
}

pub struct ArchivePackager {
    store: Arc<SessionStore>,
}

impl ArchivePackager {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    /// Write every result file of `id` into a fresh Deflate ZIP.
    ///
    /// The archive is rebuilt on each call; entries are flat and sorted by name.
    pub fn package(&self, id: &SessionId) -> Result<ArchiveInfo> {
        let entries = self.store.list_results(id)?;
        self.write(id, entries)
    }

    /// Stage into a private temp file next to the archive, then rename over it.
    /// The staging file is removed if anything fails before the rename.
    fn write(&self, id: &SessionId, entries: Vec<String>) -> Result<ArchiveInfo> {
        let dir = self.store.result_dir_path(id);
        let path = self.store.archive_path(id);
        let staging_dir = path.parent().unwrap_or_else(|| Path::new("."));

        let staging = tempfile::Builder::new()
            .prefix(&format!("upscaled_{id}."))
            .suffix(".zip.part")
            .tempfile_in(staging_dir)
            .map_err(|e| HiresError::io(staging_dir, e))?;

        {
            let mut zip = ZipWriter::new(BufWriter::new(staging.as_file()));
            let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            for name in &entries {
                zip.start_file(name.as_str(), options)
                    .map_err(|e| HiresError::Archive(format!("{name}: {e}")))?;
                let source = dir.join(name);
                let mut reader = File::open(&source).map_err(|e| HiresError::io(&source, e))?;
                io::copy(&mut reader, &mut zip).map_err(|e| HiresError::io(&source, e))?;
            }
            let writer = zip
                .finish()
                .map_err(|e| HiresError::Archive(e.to_string()))?;
            writer
                .into_inner()
                .map_err(|e| HiresError::io(staging.path(), e.into_error()))?;
        }
        staging
            .persist(&path)
            .map_err(|e| HiresError::io(&path, e.error))?;

        let bytes = fs::metadata(&path)
            .map_err(|e| HiresError::io(&path, e))?
            .len();
        info!(session = %id, entries = entries.len(), bytes, "Archive written");
        Ok(ArchiveInfo {
            path,
            entries,
            bytes,
            download_name: ARCHIVE_DOWNLOAD_NAME,
        })
    }
}
