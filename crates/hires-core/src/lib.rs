#![doc = include_str!("../README.md")]

pub mod backend;
pub mod device;
pub mod error;
pub mod naming;
pub mod types;

pub use error::{HiresError, Result};
