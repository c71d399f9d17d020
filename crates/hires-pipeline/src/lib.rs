#![doc = include_str!("../README.md")]

pub mod archive;
pub mod batch;
pub mod config;
pub mod encode;
pub mod model_cache;
pub mod runtime;
pub mod session;

pub use batch::{BatchProcessor, BatchResult, ImageOutcome, SkippedFile, UploadedFile};
pub use config::ServiceConfig;
pub use runtime::UpscaleService;
