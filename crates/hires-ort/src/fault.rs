//! Translation of runtime error text into [`InferenceFault`].
//!
//! ONNX Runtime reports allocation failures from every execution provider as
//! plain status strings.  This is the only place that looks at them.

use hires_core::backend::InferenceFault;

const EXHAUSTION_MARKERS: &[&str] = &[
    "out of memory",
    "outofmemory",
    "failed to allocate",
    "cudaerrormemoryallocation",
    "cuda_error_out_of_memory",
    "cublas_status_alloc_failed",
    "bad_alloc",
    "cannot allocate memory",
    "insufficient memory",
    "resource exhausted",
    "mps backend out of memory",
];

/// Heuristic: does `message` describe a (possibly transient) allocation failure?
pub fn is_resource_exhaustion(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    EXHAUSTION_MARKERS.iter().any(|m| lower.contains(m))
}

pub fn classify(message: impl Into<String>) -> InferenceFault {
    let message = message.into();
    if is_resource_exhaustion(&message) {
        InferenceFault::ResourceExhausted(message)
    } else {
        InferenceFault::Failed(message)
    }
}
