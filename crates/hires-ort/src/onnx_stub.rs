#![allow(dead_code)]
//! Stub ONNX engine for builds without the `ort-runtime` feature.
//!
//! Same public surface as the real module; every build fails with
//! `EngineInit`, so the rest of the service still links and runs (and can be
//! driven by other [`EngineFactory`] implementations).

use async_trait::async_trait;

use hires_core::backend::{EngineFactory, EnhanceEngine};
use hires_core::error::{HiresError, Result};
use hires_core::types::EngineConfig;

/// Environment knob controlling the TensorRT provider on CUDA devices.
pub const EP_ENV: &str = "HIRES_ORT_TENSORRT";

#[derive(Clone, Debug, Default)]
pub struct OnnxEngineFactory {
    intra_threads: Option<usize>,
}

impl OnnxEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_intra_threads(mut self, threads: usize) -> Self {
        self.intra_threads = Some(threads.max(1));
        self
    }
}

#[async_trait]
impl EngineFactory for OnnxEngineFactory {
    async fn build(&self, config: &EngineConfig) -> Result<Box<dyn EnhanceEngine>> {
        Err(HiresError::EngineInit {
            model: config.variant.to_string(),
            reason: "hires-ort was built without the `ort-runtime` feature".into(),
        })
    }
}
