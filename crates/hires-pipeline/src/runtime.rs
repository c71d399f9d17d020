//! Service composition.
//!
//! Keeps the wiring of store, model cache, batch processor and packager in
//! one place so boundary layers depend on a single entry point.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use hires_core::backend::EngineFactory;
use hires_core::error::{HiresError, Result};
use hires_core::types::{DeviceKind, ModelVariant, Scale, SessionId};

use crate::archive::{ArchiveInfo, ArchivePackager};
use crate::batch::{BatchProcessor, BatchResult, UploadedFile};
use crate::config::ServiceConfig;
use crate::encode::OutputEncoder;
use crate::model_cache::ModelCache;
use crate::session::SessionStore;

/// Catalog entry for one supported model variant.
#[derive(Clone, Debug, Serialize)]
pub struct ModelInfo {
    pub name: &'static str,
    pub blocks: u32,
    pub native_scale: u32,
    pub weights_path: PathBuf,
    pub weights_present: bool,
    pub weights_url: Option<String>,
    pub loaded: bool,
}

pub struct UpscaleService {
    config: ServiceConfig,
    store: Arc<SessionStore>,
    models: Arc<ModelCache>,
    processor: BatchProcessor,
    packager: Arc<ArchivePackager>,
}

impl UpscaleService {
    pub fn new(config: ServiceConfig, factory: Arc<dyn EngineFactory>) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(SessionStore::from_config(&config));
        let models = Arc::new(ModelCache::from_config(factory, &config));
        let processor = BatchProcessor::new(
            Arc::clone(&store),
            Arc::clone(&models),
            OutputEncoder::new(config.quality),
            config.limits,
            config.tile_window,
        );
        let packager = Arc::new(ArchivePackager::new(Arc::clone(&store)));
        info!(
            device = %models.device(),
            results = %config.result_root.display(),
            weights = %config.weights_dir.display(),
            "Upscale service ready"
        );
        Ok(Self {
            config,
            store,
            models,
            processor,
            packager,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn device(&self) -> DeviceKind {
        self.models.device()
    }

    /// Resolve request parameters; missing values take the defaults.
    pub fn parse_request(model: Option<&str>, scale: Option<u32>) -> Result<(ModelVariant, Scale)> {
        let variant = model.map(str::parse::<ModelVariant>).transpose()?.unwrap_or_default();
        let scale = scale.map(Scale::new).transpose()?.unwrap_or_default();
        Ok((variant, scale))
    }

    /// Open a session and run `files` through it.
    ///
    /// Request validation happens first, so a rejected request creates nothing.
    pub async fn upscale(
        &self,
        files: Vec<UploadedFile>,
        scale: Scale,
        variant: ModelVariant,
    ) -> Result<BatchResult> {
        self.processor.validate(&files)?;
        let session = self.store.open_session()?;
        self.processor
            .process_batch(&session, files, scale, variant)
            .await
    }

    pub async fn package(&self, id: &SessionId) -> Result<ArchiveInfo> {
        let packager = Arc::clone(&self.packager);
        let id = *id;
        tokio::task::spawn_blocking(move || packager.package(&id))
            .await
            .map_err(|e| HiresError::Archive(format!("packaging task failed: {e}")))?
    }

    pub fn purge(&self, id: &SessionId) -> Result<()> {
        self.store.purge(id)
    }

    pub fn results(&self, id: &SessionId) -> Result<Vec<String>> {
        self.store.list_results(id)
    }

    pub fn result_file(&self, id: &SessionId, name: &str) -> Result<PathBuf> {
        self.store.result_file(id, name)
    }

    pub fn model_catalog(&self) -> Vec<ModelInfo> {
        let loaded = self.models.loaded();
        ModelVariant::ALL
            .into_iter()
            .map(|variant| {
                let weights_path = self.models.weights_path(variant);
                ModelInfo {
                    name: variant.name(),
                    blocks: variant.architecture().num_block,
                    native_scale: variant.native_scale(),
                    weights_present: weights_path.is_file(),
                    weights_path,
                    weights_url: self.models.weights_url(variant),
                    loaded: loaded.contains(&variant),
                }
            })
            .collect()
    }
}
