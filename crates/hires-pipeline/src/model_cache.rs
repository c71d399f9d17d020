//! Process-wide registry of constructed engines, one per model variant.
//!
//! # Construction
//!
//! Each variant has its own `tokio::sync::OnceCell`.  Concurrent first use of
//! the same variant awaits a single construction; different variants build
//! in parallel.  A failed construction leaves the cell empty, so the next
//! request retries.
//!
//! # Mutation
//!
//! A [`ModelHandle`] wraps the engine and its [`EnhanceParams`] in one async
//! mutex.  Output scale and tiling are only changed while that mutex is held,
//! and inference runs under the same guard, so concurrent batches on one
//! variant never observe each other's settings mid-call.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OnceCell, OwnedMutexGuard};
use tracing::{debug, info};

use hires_core::backend::{EngineFactory, EnhanceEngine, EnhanceResult};
use hires_core::device;
use hires_core::error::{HiresError, Result};
use hires_core::types::{
    DeviceKind, EngineConfig, EnhanceParams, ModelVariant, PixelBuffer, Scale, WeightsSource,
};

use crate::config::ServiceConfig;

// ─── Engine state ────────────────────────────────────────────────────────────

/// The mutable half of a model handle.  Only reachable through its lock.
pub struct EngineState {
    engine: Box<dyn EnhanceEngine>,
    params: EnhanceParams,
}

impl EngineState {
    pub fn params(&self) -> EnhanceParams {
        self.params
    }

    pub fn set_outscale(&mut self, scale: Scale) {
        self.params.outscale = scale.get();
    }

    /// Tile window for subsequent calls; 0 disables tiling.
    pub fn set_tile(&mut self, tile: u32) {
        self.params.tile = tile;
    }

    pub fn enhance(&mut self, input: &PixelBuffer) -> EnhanceResult {
        self.engine.enhance(input, &self.params)
    }

    pub fn provider(&self) -> &str {
        self.engine.provider()
    }
}

// ─── Handle ──────────────────────────────────────────────────────────────────

struct HandleInner {
    config: EngineConfig,
    state: Arc<AsyncMutex<EngineState>>,
}

/// Shared handle to one variant's engine.  Clones refer to the same engine.
#[derive(Clone)]
pub struct ModelHandle {
    inner: Arc<HandleInner>,
}

impl ModelHandle {
    fn new(config: EngineConfig, engine: Box<dyn EnhanceEngine>) -> Self {
        let params = EnhanceParams::untiled(config.native_scale);
        Self {
            inner: Arc::new(HandleInner {
                config,
                state: Arc::new(AsyncMutex::new(EngineState { engine, params })),
            }),
        }
    }

    pub fn variant(&self) -> ModelVariant {
        self.inner.config.variant
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Whether `self` and `other` are the same cached engine.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Take the engine lock.  The owned guard may be moved to a blocking thread.
    pub async fn lock(&self) -> OwnedMutexGuard<EngineState> {
        Arc::clone(&self.inner.state).lock_owned().await
    }

    /// Snapshot of the current knobs (waits for the lock).
    pub async fn params(&self) -> EnhanceParams {
        self.inner.state.lock().await.params()
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("variant", &self.inner.config.variant)
            .field("device", &self.inner.config.device)
            .field("half", &self.inner.config.half)
            .finish_non_exhaustive()
    }
}

// ─── Cache ───────────────────────────────────────────────────────────────────

pub struct ModelCache {
    factory: Arc<dyn EngineFactory>,
    device: DeviceKind,
    weights_dir: PathBuf,
    weights_base_url: Option<String>,
    cells: Mutex<HashMap<ModelVariant, Arc<OnceCell<ModelHandle>>>>,
}

impl ModelCache {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        device: DeviceKind,
        weights_dir: impl Into<PathBuf>,
        weights_base_url: Option<String>,
    ) -> Self {
        Self {
            factory,
            device,
            weights_dir: weights_dir.into(),
            weights_base_url,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Cache for `config`, probing the host when no device is forced.
    pub fn from_config(factory: Arc<dyn EngineFactory>, config: &ServiceConfig) -> Self {
        let device = config.device.unwrap_or_else(device::select_device);
        Self::new(
            factory,
            device,
            config.weights_dir.clone(),
            config.weights_base_url.clone(),
        )
    }

    pub fn device(&self) -> DeviceKind {
        self.device
    }

    /// Engine for `variant` with its output scale set to `scale`.
    ///
    /// # Errors
    ///
    /// `WeightsUnavailable` or `EngineInit` when the first construction fails.
    pub async fn get_engine(&self, variant: ModelVariant, scale: Scale) -> Result<ModelHandle> {
        let cell = self.cell(variant);
        let handle = cell.get_or_try_init(|| self.construct(variant)).await?.clone();
        handle.lock().await.set_outscale(scale);
        debug!(model = %variant, scale = scale.get(), "Engine ready");
        Ok(handle)
    }

    /// Variants whose engine has been constructed.
    pub fn loaded(&self) -> Vec<ModelVariant> {
        let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        let mut loaded: Vec<_> = cells
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(variant, _)| *variant)
            .collect();
        loaded.sort();
        loaded
    }

    /// Local cache location of `variant`'s weights.
    pub fn weights_path(&self, variant: ModelVariant) -> PathBuf {
        self.weights_dir.join(variant.weights_file())
    }

    /// Remote location of `variant`'s weights, if a base URL is configured.
    pub fn weights_url(&self, variant: ModelVariant) -> Option<String> {
        self.weights_base_url
            .as_deref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), variant.weights_file()))
    }

    /// Construction parameters for `variant` on this cache's device.
    pub fn engine_config(&self, variant: ModelVariant) -> Result<EngineConfig> {
        let local = self.weights_path(variant);
        let weights = if local.is_file() {
            WeightsSource::Local(local)
        } else if let Some(url) = self.weights_url(variant) {
            WeightsSource::Remote {
                url,
                cache_path: local,
            }
        } else {
            return Err(HiresError::WeightsUnavailable {
                model: variant.to_string(),
                local,
            });
        };

        Ok(EngineConfig {
            variant,
            arch: variant.architecture(),
            native_scale: variant.native_scale(),
            weights,
            device: self.device,
            half: self.device.is_accelerator(),
        })
    }

    fn cell(&self, variant: ModelVariant) -> Arc<OnceCell<ModelHandle>> {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(cells.entry(variant).or_default())
    }

    async fn construct(&self, variant: ModelVariant) -> Result<ModelHandle> {
        let config = self.engine_config(variant)?;
        info!(
            model = %variant,
            device = %config.device,
            half = config.half,
            blocks = config.arch.num_block,
            weights = ?config.weights,
            "Constructing engine"
        );
        let engine = self.factory.build(&config).await?;
        info!(model = %variant, provider = engine.provider(), "Engine constructed");
        Ok(ModelHandle::new(config, engine))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    struct Identity;

    impl EnhanceEngine for Identity {
        fn enhance(&mut self, input: &PixelBuffer, _params: &EnhanceParams) -> EnhanceResult {
            Ok(input.clone())
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        builds: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EngineFactory for CountingFactory {
        async fn build(&self, config: &EngineConfig) -> Result<Box<dyn EnhanceEngine>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self.fail {
                return Err(HiresError::EngineInit {
                    model: config.variant.to_string(),
                    reason: "refused".into(),
                });
            }
            Ok(Box::new(Identity))
        }
    }

    fn weights_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for variant in ModelVariant::ALL {
            std::fs::write(dir.path().join(variant.weights_file()), b"onnx").unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn same_handle_per_variant_with_updated_scale() {
        let dir = weights_dir();
        let factory = Arc::new(CountingFactory::default());
        let cache = ModelCache::new(factory.clone(), DeviceKind::Cpu, dir.path(), None);

        let first = cache.get_engine(ModelVariant::X4Plus, Scale::new(4).unwrap()).await.unwrap();
        let second = cache.get_engine(ModelVariant::X4Plus, Scale::new(2).unwrap()).await.unwrap();

        assert!(first.ptr_eq(&second));
        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
        assert_eq!(first.params().await.outscale, 2);
        assert_eq!(first.params().await.tile, 0);
        assert_eq!(first.params().await.tile_pad, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_use_constructs_once() {
        let dir = weights_dir();
        let factory = Arc::new(CountingFactory::default());
        let cache = Arc::new(ModelCache::new(factory.clone(), DeviceKind::Cpu, dir.path(), None));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    cache.get_engine(ModelVariant::X4PlusAnime6B, Scale::default()).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.loaded(), vec![ModelVariant::X4PlusAnime6B]);
    }

    #[tokio::test]
    async fn variants_get_distinct_engines() {
        let dir = weights_dir();
        let cache = ModelCache::new(Arc::new(CountingFactory::default()), DeviceKind::Cuda, dir.path(), None);
        let photo = cache.get_engine(ModelVariant::X4Plus, Scale::default()).await.unwrap();
        let anime = cache.get_engine(ModelVariant::X4PlusAnime6B, Scale::default()).await.unwrap();
        assert!(!photo.ptr_eq(&anime));
        assert_eq!(anime.config().arch.num_block, 6);
        assert!(anime.config().half);
    }

    #[test]
    fn cpu_engines_run_full_precision() {
        let dir = weights_dir();
        let cache = ModelCache::new(Arc::new(CountingFactory::default()), DeviceKind::Cpu, dir.path(), None);
        let config = cache.engine_config(ModelVariant::X4Plus).unwrap();
        assert!(!config.half);
        assert_eq!(config.native_scale, 4);
        assert!(matches!(config.weights, WeightsSource::Local(_)));
    }

    #[test]
    fn missing_weights_fall_back_to_remote_or_fail() {
        let empty = tempfile::tempdir().unwrap();
        let factory: Arc<dyn EngineFactory> = Arc::new(CountingFactory::default());

        let remote = ModelCache::new(
            Arc::clone(&factory),
            DeviceKind::Cpu,
            empty.path(),
            Some("https://models.invalid/base/".into()),
        );
        match remote.engine_config(ModelVariant::X4Plus).unwrap().weights {
            WeightsSource::Remote { url, cache_path } => {
                assert_eq!(url, "https://models.invalid/base/RealESRGAN_x4plus.onnx");
                assert_eq!(cache_path, empty.path().join("RealESRGAN_x4plus.onnx"));
            }
            other => panic!("expected remote weights, got {other:?}"),
        }

        let offline = ModelCache::new(factory, DeviceKind::Cpu, empty.path(), None);
        let err = offline.engine_config(ModelVariant::X4Plus).unwrap_err();
        assert!(matches!(err, HiresError::WeightsUnavailable { .. }));
    }

    #[tokio::test]
    async fn failed_construction_is_retried() {
        let dir = weights_dir();
        let factory = Arc::new(CountingFactory {
            fail: true,
            ..CountingFactory::default()
        });
        let cache = ModelCache::new(factory.clone(), DeviceKind::Cpu, dir.path(), None);
        for _ in 0..2 {
            let err = cache
                .get_engine(ModelVariant::X4Plus, Scale::default())
                .await
                .expect_err("factory refuses");
            assert!(matches!(err, HiresError::EngineInit { .. }));
        }
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
        assert!(cache.loaded().is_empty());
    }

    #[tokio::test]
    async fn lock_serializes_knob_changes() {
        let dir = weights_dir();
        let cache = ModelCache::new(Arc::new(CountingFactory::default()), DeviceKind::Cpu, dir.path(), None);
        let handle = cache.get_engine(ModelVariant::X4Plus, Scale::default()).await.unwrap();

        let mut guard = handle.lock().await;
        guard.set_tile(256);
        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.params().await }
        });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());
        guard.set_tile(0);
        let input = PixelBuffer::new_rgb8(1, 1);
        assert!(guard.enhance(&input).is_ok());
        drop(guard);
        assert_eq!(pending.await.unwrap().tile, 0);
    }
}
