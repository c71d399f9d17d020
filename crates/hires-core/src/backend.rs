//! Inference engine seam: the contract every super-resolution adapter satisfies.
//!
//! The network itself is an opaque collaborator.  The core only needs:
//!
//! 1. **Construction** through an [`EngineFactory`] from an [`EngineConfig`].
//!    Construction is expensive (weights load, provider setup) and happens at
//!    most once per model variant per process; the model cache enforces that.
//!
//! 2. **A typed failure signal.**  [`InferenceFault::ResourceExhausted`] is the
//!    only outcome the batch processor recovers from (by retrying with tiling).
//!    Adapters own the translation from their runtime's errors into this enum;
//!    the core never inspects messages.
//!
//! 3. **Exclusive access per call.**  `enhance` takes `&mut self`.  The model
//!    cache wraps each engine in an async mutex and every call is made while
//!    holding it, so engines need not be internally synchronized.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{EngineConfig, EnhanceParams, PixelBuffer};

/// Why a single `enhance` call did not produce an image.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InferenceFault {
    /// Device or host memory ran out, or the accelerator reported a transient
    /// allocation failure.  Retrying with a smaller working set may succeed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// Anything else.  Not retried.
    #[error("{0}")]
    Failed(String),
}

/// Outcome of one inference call.
pub type EnhanceResult = std::result::Result<PixelBuffer, InferenceFault>;

/// A constructed super-resolution engine bound to one device.
pub trait EnhanceEngine: Send {
    /// Upscale `input` by `params.outscale`, honouring the tiling and padding knobs.
    ///
    /// Output channel layout follows the input (alpha in, alpha out).
    fn enhance(&mut self, input: &PixelBuffer, params: &EnhanceParams) -> EnhanceResult;

    /// Execution provider or backend label for logs.
    fn provider(&self) -> &str {
        "unknown"
    }
}

/// Builds engines on first use of a model variant.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// Load weights and prepare an engine for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`HiresError::EngineInit`](crate::error::HiresError::EngineInit)
    /// when the runtime rejects the model, and
    /// [`HiresError::WeightsUnavailable`](crate::error::HiresError::WeightsUnavailable)
    /// when the weights cannot be obtained.
    async fn build(&self, config: &EngineConfig) -> Result<Box<dyn EnhanceEngine>>;
}
