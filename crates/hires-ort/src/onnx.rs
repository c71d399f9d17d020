//! ONNX Runtime engine for the RRDB super-resolution networks.
//!
//! # Execution provider policy
//!
//! | Device | Provider                                                  |
//! |--------|-----------------------------------------------------------|
//! | cuda   | TensorRT (FP16 when `half`), falling back to CUDA          |
//! | mps    | CoreML, falling back to CPU                               |
//! | cpu    | default CPU provider                                      |
//!
//! `HIRES_ORT_TENSORRT` pins the CUDA path: `0`/`off`/`cuda` skips TensorRT,
//! `1`/`on`/`trt` requires it.
//!
//! # Weights
//!
//! Local weights are opened in place.  Remote weights are downloaded once
//! into the weights directory (written to a `.part` file, then renamed) and
//! reused by later processes.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, TensorRTExecutionProvider,
};
use ort::session::Session;
use ort::value::Tensor;
use reqwest::blocking::Client;
use tracing::{debug, info, warn};

use hires_core::backend::{EngineFactory, EnhanceEngine, EnhanceResult, InferenceFault};
use hires_core::error::{HiresError, Result};
use hires_core::types::{DeviceKind, EngineConfig, EnhanceParams, PixelBuffer, WeightsSource};

use crate::fault;
use crate::tiles::{self, Planar};

/// Environment knob controlling the TensorRT provider on CUDA devices.
pub const EP_ENV: &str = "HIRES_ORT_TENSORRT";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OrtEpMode {
    Auto,
    CudaOnly,
    TensorRtOnly,
}

fn ort_ep_mode() -> OrtEpMode {
    match env::var(EP_ENV)
        .unwrap_or_else(|_| "auto".to_string())
        .to_lowercase()
        .as_str()
    {
        "0" | "off" | "false" | "cuda" | "cuda-only" => OrtEpMode::CudaOnly,
        "1" | "on" | "true" | "trt" | "trt-only" => OrtEpMode::TensorRtOnly,
        _ => OrtEpMode::Auto,
    }
}

fn init_error(config: &EngineConfig, reason: impl std::fmt::Display) -> HiresError {
    HiresError::EngineInit {
        model: config.variant.to_string(),
        reason: reason.to_string(),
    }
}

// ─── Factory ─────────────────────────────────────────────────────────────────

/// Builds [`OnnxEngine`]s on a blocking worker thread.
#[derive(Clone, Debug, Default)]
pub struct OnnxEngineFactory {
    intra_threads: Option<usize>,
}

impl OnnxEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap ORT's intra-op thread pool (CPU provider).
    pub fn with_intra_threads(mut self, threads: usize) -> Self {
        self.intra_threads = Some(threads.max(1));
        self
    }
}

#[async_trait]
impl EngineFactory for OnnxEngineFactory {
    async fn build(&self, config: &EngineConfig) -> Result<Box<dyn EnhanceEngine>> {
        let owned = config.clone();
        let threads = self.intra_threads;
        let engine = tokio::task::spawn_blocking(move || OnnxEngine::load(&owned, threads))
            .await
            .map_err(|e| init_error(config, format!("loader task failed: {e}")))??;
        Ok(Box::new(engine))
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

/// One ORT session bound to one device.
pub struct OnnxEngine {
    session: Session,
    input_name: String,
    output_name: String,
    native_scale: u32,
    provider: &'static str,
}

impl OnnxEngine {
    fn load(config: &EngineConfig, intra_threads: Option<usize>) -> Result<Self> {
        let path = materialize_weights(config)?;
        info!(
            model = %config.variant,
            path = %path.display(),
            device = %config.device,
            half = config.half,
            "Loading ONNX model"
        );

        let (session, provider) = build_session(&path, config, intra_threads)?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| init_error(config, "model declares no input tensor"))?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| init_error(config, "model declares no output tensor"))?;

        info!(
            model = %config.variant,
            provider,
            input = %input_name,
            output = %output_name,
            blocks = config.arch.num_block,
            "Model loaded"
        );

        Ok(Self {
            session,
            input_name,
            output_name,
            native_scale: config.native_scale,
            provider,
        })
    }

    fn infer(&mut self, patch: &Planar) -> std::result::Result<Planar, InferenceFault> {
        let (w, h) = (patch.width() as usize, patch.height() as usize);
        debug!(w, h, provider = self.provider, "ORT run");

        let tensor = Tensor::from_array(([1usize, Planar::CHANNELS, h, w], patch.as_slice().to_vec()))
            .map_err(|e| fault::classify(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(|e| fault::classify(e.to_string()))?;
        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceFault::Failed(e.to_string()))?;

        if shape.len() != 4 || shape[1] != Planar::CHANNELS as i64 {
            return Err(InferenceFault::Failed(format!(
                "unexpected output shape {shape:?}; expected [1, 3, H, W]"
            )));
        }
        Planar::from_raw(shape[3] as u32, shape[2] as u32, data.to_vec()).ok_or_else(|| {
            InferenceFault::Failed(format!("output buffer does not match shape {shape:?}"))
        })
    }
}

impl EnhanceEngine for OnnxEngine {
    fn enhance(&mut self, input: &PixelBuffer, params: &EnhanceParams) -> EnhanceResult {
        let native = self.native_scale;
        tiles::enhance_image(input, params, native, |patch| self.infer(patch))
    }

    fn provider(&self) -> &str {
        self.provider
    }
}

// ─── Sessions ────────────────────────────────────────────────────────────────

fn build_session(
    path: &Path,
    config: &EngineConfig,
    intra_threads: Option<usize>,
) -> Result<(Session, &'static str)> {
    let built = match config.device {
        DeviceKind::Cuda => match ort_ep_mode() {
            OrtEpMode::CudaOnly => {
                info!("{EP_ENV} disables TensorRT EP; using CUDAExecutionProvider");
                cuda_session(path).map(|s| (s, "CUDAExecutionProvider"))
            }
            OrtEpMode::TensorRtOnly => {
                trt_session(path, config.half).map(|s| (s, "TensorrtExecutionProvider"))
            }
            OrtEpMode::Auto => match trt_session(path, config.half) {
                Ok(session) => Ok((session, "TensorrtExecutionProvider")),
                Err(e) => {
                    warn!(
                        error = %e,
                        "TensorRT EP registration failed; falling back to CUDAExecutionProvider"
                    );
                    cuda_session(path).map(|s| (s, "CUDAExecutionProvider"))
                }
            },
        },
        DeviceKind::Mps => match coreml_session(path) {
            Ok(session) => Ok((session, "CoreMLExecutionProvider")),
            Err(e) => {
                warn!(error = %e, "CoreML EP registration failed; falling back to CPU");
                cpu_session(path, intra_threads).map(|s| (s, "CPUExecutionProvider"))
            }
        },
        DeviceKind::Cpu => cpu_session(path, intra_threads).map(|s| (s, "CPUExecutionProvider")),
    };
    built.map_err(|e| init_error(config, e))
}

fn trt_session(path: &Path, half: bool) -> ort::Result<Session> {
    let cache_dir = path.parent().unwrap_or(path).join("trt_cache");
    let trt_ep = TensorRTExecutionProvider::default()
        .with_device_id(0)
        .with_fp16(half)
        .with_engine_cache(true)
        .with_engine_cache_path(cache_dir.to_string_lossy().to_string());
    if half {
        info!("TRT precision: FP16 mixed precision");
    }
    Session::builder()?
        .with_execution_providers([trt_ep.build().error_on_failure()])?
        .with_intra_threads(1)?
        .commit_from_file(path)
}

fn cuda_session(path: &Path) -> ort::Result<Session> {
    let cuda_ep = CUDAExecutionProvider::default().with_device_id(0);
    Session::builder()?
        .with_execution_providers([cuda_ep.build().error_on_failure()])?
        .with_intra_threads(1)?
        .commit_from_file(path)
}

fn coreml_session(path: &Path) -> ort::Result<Session> {
    Session::builder()?
        .with_execution_providers([CoreMLExecutionProvider::default().build().error_on_failure()])?
        .commit_from_file(path)
}

fn cpu_session(path: &Path, intra_threads: Option<usize>) -> ort::Result<Session> {
    let mut builder = Session::builder()?;
    if let Some(threads) = intra_threads {
        builder = builder.with_intra_threads(threads)?;
    }
    builder.commit_from_file(path)
}

// ─── Weights ─────────────────────────────────────────────────────────────────

fn materialize_weights(config: &EngineConfig) -> Result<PathBuf> {
    match &config.weights {
        WeightsSource::Local(path) => {
            if path.is_file() {
                Ok(path.clone())
            } else {
                Err(HiresError::WeightsUnavailable {
                    model: config.variant.to_string(),
                    local: path.clone(),
                })
            }
        }
        WeightsSource::Remote { url, cache_path } => {
            if cache_path.is_file() {
                return Ok(cache_path.clone());
            }
            download_weights(config, url, cache_path)?;
            Ok(cache_path.clone())
        }
    }
}

fn download_weights(config: &EngineConfig, url: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| HiresError::io(parent, e))?;
    }
    info!(model = %config.variant, url, dest = %dest.display(), "Downloading model weights");

    let client = Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| init_error(config, format!("HTTP client: {e}")))?;
    let bytes = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.bytes())
        .map_err(|e| init_error(config, format!("weights download from {url} failed: {e}")))?;

    let partial = dest.with_extension("onnx.part");
    fs::write(&partial, &bytes).map_err(|e| HiresError::io(&partial, e))?;
    fs::rename(&partial, dest).map_err(|e| HiresError::io(dest, e))?;
    info!(bytes = bytes.len(), dest = %dest.display(), "Weights cached");
    Ok(())
}
