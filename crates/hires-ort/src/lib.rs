#![doc = include_str!("../README.md")]

pub mod fault;
pub mod tiles;

#[cfg(feature = "ort-runtime")]
pub mod onnx;

#[cfg(not(feature = "ort-runtime"))]
#[path = "onnx_stub.rs"]
pub mod onnx;

pub use onnx::OnnxEngineFactory;
