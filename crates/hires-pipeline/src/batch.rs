//! Batch processor: uploads in, encoded results out.
//!
//! Files are handled sequentially in input order.  Per file:
//!
//! 1. apply the extension/size admission policy and sanitize the name;
//! 2. persist the raw bytes to the session's upload directory and decode;
//! 3. lease the variant's engine and infer untiled, retrying once with the
//!    configured tile window on [`InferenceFault::ResourceExhausted`];
//! 4. encode and write into the session's result directory.
//!
//! Files that fail admission or decoding are skipped and reported.  Inference,
//! encoding and storage failures abort the batch; results already written
//! stay on disk and the error names the session so the caller can purge it.  The upload directory is removed on every exit path, and a
//! batch with no successes leaves no result directory behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use hires_core::backend::InferenceFault;
use hires_core::error::{HiresError, Result};
use hires_core::naming;
use hires_core::types::{ModelVariant, PixelBuffer, Scale, SessionId};

use crate::config::Limits;
use crate::encode::OutputEncoder;
use crate::model_cache::{EngineState, ModelCache};
use crate::session::SessionStore;

/// One file as received from the caller.
#[derive(Clone, Debug)]
pub struct UploadedFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImageOutcome {
    /// Sanitized upload name.
    pub original_name: String,
    /// Name of the file in the result directory.
    pub output_name: String,
    pub width: u32,
    pub height: u32,
    pub preview_url: String,
    pub download_url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub name: String,
    pub reason: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct BatchResult {
    pub session_id: SessionId,
    pub scale: Scale,
    pub model: ModelVariant,
    pub results: Vec<ImageOutcome>,
    pub skipped: Vec<SkippedFile>,
}

pub fn preview_url(session: &SessionId, name: &str) -> String {
    format!("/api/preview/{session}/{name}")
}

pub fn download_url(session: &SessionId, name: &str) -> String {
    format!("/api/download/{session}/{name}")
}

/// Run one inference on a leased engine, falling back to tiling once.
///
/// Tiling is disabled on entry and restored to disabled before returning,
/// whatever the outcome.
pub fn run_with_tiling_fallback(
    state: &mut EngineState,
    input: &PixelBuffer,
    tile_window: u32,
    file: &str,
) -> Result<PixelBuffer> {
    state.set_tile(0);
    let outcome = match state.enhance(input) {
        Err(InferenceFault::ResourceExhausted(reason)) => {
            warn!(file, %reason, tile = tile_window, "Resource exhausted; retrying with tiling");
            state.set_tile(tile_window);
            let retry = state.enhance(input);
            state.set_tile(0);
            retry
        }
        other => other,
    };
    outcome.map_err(|fault| match fault {
        InferenceFault::ResourceExhausted(reason) => HiresError::ResourceExhausted {
            file: file.to_string(),
            reason,
        },
        InferenceFault::Failed(reason) => HiresError::Inference {
            file: file.to_string(),
            reason,
        },
    })
}

enum Decoded {
    Image(PixelBuffer),
    Unreadable(String),
}

pub struct BatchProcessor {
    store: Arc<SessionStore>,
    models: Arc<ModelCache>,
    encoder: OutputEncoder,
    limits: Limits,
    tile_window: u32,
}

impl BatchProcessor {
    pub fn new(
        store: Arc<SessionStore>,
        models: Arc<ModelCache>,
        encoder: OutputEncoder,
        limits: Limits,
        tile_window: u32,
    ) -> Self {
        Self {
            store,
            models,
            encoder,
            limits,
            tile_window,
        }
    }

    /// Request-level admission: at least one file, at most `max_files`.
    pub fn validate(&self, files: &[UploadedFile]) -> Result<()> {
        if files.is_empty() {
            return Err(HiresError::NoImages);
        }
        if files.len() > self.limits.max_files {
            return Err(HiresError::BatchTooLarge {
                limit: self.limits.max_files,
                actual: files.len(),
            });
        }
        Ok(())
    }

    /// Run `files` through `session`.
    ///
    /// Failures other than `EmptyBatch` come back as `SessionAborted` so the
    /// caller can still purge whatever was written.
    pub async fn process_batch(
        &self,
        session: &SessionId,
        files: Vec<UploadedFile>,
        scale: Scale,
        variant: ModelVariant,
    ) -> Result<BatchResult> {
        let outcome = match self.validate(&files) {
            Ok(()) => self.run(session, files, scale, variant).await,
            Err(e) => Err(e),
        };
        self.settle(session, outcome)
    }

    /// Post-batch cleanup; never replaces the batch outcome with a cleanup error.
    fn settle(&self, session: &SessionId, outcome: Result<BatchResult>) -> Result<BatchResult> {
        if let Err(e) = self.store.close_upload(session) {
            warn!(session = %session, error = %e, "Failed to remove upload directory");
        }

        match outcome {
            Ok(result) => Ok(result),
            Err(HiresError::EmptyBatch { skipped }) => {
                warn!(session = %session, skipped, "No image in the batch could be processed");
                if let Err(e) = self.store.discard_results(session) {
                    warn!(session = %session, error = %e, "Failed to remove result directory");
                }
                Err(HiresError::EmptyBatch { skipped })
            }
            Err(e) => {
                warn!(session = %session, error = %e, "Batch aborted; results kept");
                Err(e.in_session(session))
            }
        }
    }

    async fn run(
        &self,
        session: &SessionId,
        files: Vec<UploadedFile>,
        scale: Scale,
        variant: ModelVariant,
    ) -> Result<BatchResult> {
        let upload_dir = self.store.upload_dir(session)?;
        let result_dir = self.store.result_dir(session)?;
        let total = files.len();
        info!(session = %session, files = total, scale = scale.get(), model = %variant, "Batch started");

        let mut results = Vec::with_capacity(total);
        let mut skipped = Vec::new();

        for file in files {
            let rejected = self.admission_failure(&file.name, file.bytes.len());
            let name = naming::sanitize_or_generate(&file.name);
            if let Some(reason) = rejected {
                warn!(session = %session, file = %name, %reason, "Skipping upload");
                skipped.push(SkippedFile { name, reason });
                continue;
            }

            let image = match stage_upload(upload_dir.join(&name), file.bytes).await? {
                Decoded::Image(image) => image,
                Decoded::Unreadable(reason) => {
                    warn!(session = %session, file = %name, %reason, "Skipping undecodable image");
                    skipped.push(SkippedFile { name, reason });
                    continue;
                }
            };

            let upscaled = self.infer(&name, image, scale, variant).await?;
            let (width, height) = (upscaled.width(), upscaled.height());

            let output_name = self.write_result(&result_dir, &name, upscaled).await?;
            debug!(session = %session, file = %name, output = %output_name, width, height, "Image upscaled");

            results.push(ImageOutcome {
                preview_url: preview_url(session, &output_name),
                download_url: download_url(session, &output_name),
                original_name: name,
                output_name,
                width,
                height,
            });
        }

        if results.is_empty() {
            return Err(HiresError::EmptyBatch {
                skipped: skipped.len(),
            });
        }

        info!(
            session = %session,
            processed = results.len(),
            skipped = skipped.len(),
            "Batch finished"
        );
        Ok(BatchResult {
            session_id: *session,
            scale,
            model: variant,
            results,
            skipped,
        })
    }

    fn admission_failure(&self, name: &str, len: usize) -> Option<String> {
        if !naming::is_allowed(name) {
            return Some(format!(
                "unsupported file type (allowed: {})",
                naming::ALLOWED_EXTENSIONS.join(", ")
            ));
        }
        if len as u64 > self.limits.max_file_bytes {
            return Some(format!(
                "file is {len} bytes; limit is {}",
                self.limits.max_file_bytes
            ));
        }
        None
    }

    async fn infer(
        &self,
        name: &str,
        image: PixelBuffer,
        scale: Scale,
        variant: ModelVariant,
    ) -> Result<PixelBuffer> {
        let handle = self.models.get_engine(variant, scale).await?;
        let mut state = handle.lock().await;
        state.set_outscale(scale);

        let tile_window = self.tile_window;
        let file = name.to_string();
        tokio::task::spawn_blocking(move || {
            run_with_tiling_fallback(&mut state, &image, tile_window, &file)
        })
        .await
        .map_err(|e| HiresError::Inference {
            file: name.to_string(),
            reason: format!("inference task failed: {e}"),
        })?
    }

    async fn write_result(&self, result_dir: &Path, name: &str, image: PixelBuffer) -> Result<String> {
        let encoder = self.encoder;
        let dir = result_dir.to_path_buf();
        let original = name.to_string();
        tokio::task::spawn_blocking(move || {
            let encoded = encoder.encode(&image, &original)?;
            let path = dir.join(&encoded.filename);
            fs::write(&path, &encoded.bytes).map_err(|e| HiresError::io(&path, e))?;
            Ok(encoded.filename)
        })
        .await
        .map_err(|e| HiresError::Encode {
            file: name.to_string(),
            reason: format!("encode task failed: {e}"),
        })?
    }
}

/// Persist the raw upload, then decode it.  Only storage failures are errors.
async fn stage_upload(path: PathBuf, bytes: Vec<u8>) -> Result<Decoded> {
    let display = path.clone();
    tokio::task::spawn_blocking(move || {
        fs::write(&path, &bytes).map_err(|e| HiresError::io(&path, e))?;
        Ok(match image::load_from_memory(&bytes) {
            Ok(image) => Decoded::Image(image),
            Err(e) => Decoded::Unreadable(format!("could not decode image: {e}")),
        })
    })
    .await
    .map_err(|e| HiresError::io(display, std::io::Error::other(e)))?
}
