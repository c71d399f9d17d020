//! Accelerator selection.
//!
//! Priority: discrete CUDA device, then Apple MPS, then CPU.  The CPU is
//! always available, so selection cannot fail.  The first answer is cached
//! for the process lifetime.

use std::path::Path;
use std::sync::OnceLock;

use tracing::{info, warn};

use crate::types::DeviceKind;

/// Environment variable that forces a device (`cuda`, `mps`, `cpu`).
pub const DEVICE_ENV: &str = "HIRES_DEVICE";

static SELECTED_DEVICE: OnceLock<DeviceKind> = OnceLock::new();

/// Capability checks used by [`select_device_with`].
pub trait DeviceProbe {
    fn cuda_available(&self) -> bool;
    fn mps_available(&self) -> bool;
}

/// Probes the running host.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemProbe;

impl DeviceProbe for SystemProbe {
    fn cuda_available(&self) -> bool {
        if let Ok(visible) = std::env::var("CUDA_VISIBLE_DEVICES") {
            let visible = visible.trim();
            if visible.is_empty() || visible == "-1" {
                return false;
            }
        }
        cuda_driver_present()
    }

    fn mps_available(&self) -> bool {
        cfg!(all(target_os = "macos", target_arch = "aarch64"))
    }
}

#[cfg(target_os = "linux")]
const LIBCUDA_CANDIDATES: &[&str] = &[
    "/usr/lib/x86_64-linux-gnu/libcuda.so.1",
    "/usr/lib/aarch64-linux-gnu/libcuda.so.1",
    "/usr/lib64/libcuda.so.1",
    // WSL2 exposes the host driver here without /proc/driver/nvidia.
    "/usr/lib/wsl/lib/libcuda.so.1",
];

#[cfg(target_os = "linux")]
fn cuda_driver_present() -> bool {
    Path::new("/proc/driver/nvidia/version").is_file()
        || Path::new("/dev/nvidia0").exists()
        || LIBCUDA_CANDIDATES.iter().any(|p| Path::new(p).is_file())
}

#[cfg(target_os = "windows")]
fn cuda_driver_present() -> bool {
    let root = std::env::var("SystemRoot").unwrap_or_else(|_| "C:\\Windows".to_string());
    Path::new(&root).join("System32").join("nvcuda.dll").is_file()
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn cuda_driver_present() -> bool {
    false
}

/// Pick the best device `probe` reports.  Pure; no caching.
pub fn select_device_with(probe: &dyn DeviceProbe) -> DeviceKind {
    if probe.cuda_available() {
        DeviceKind::Cuda
    } else if probe.mps_available() {
        DeviceKind::Mps
    } else {
        DeviceKind::Cpu
    }
}

/// Resolve an explicit override, ignoring (with a warning) values that do not parse.
pub fn device_override(raw: Option<&str>) -> Option<DeviceKind> {
    let raw = raw?.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("auto") {
        return None;
    }
    match raw.parse() {
        Ok(device) => Some(device),
        Err(err) => {
            warn!(value = raw, error = %err, "Ignoring unrecognised device override");
            None
        }
    }
}

/// Process-wide device choice.  Probed once, then stable.
pub fn select_device() -> DeviceKind {
    *SELECTED_DEVICE.get_or_init(|| {
        let forced = device_override(std::env::var(DEVICE_ENV).ok().as_deref());
        let device = forced.unwrap_or_else(|| select_device_with(&SystemProbe));
        info!(device = %device, forced = forced.is_some(), "Compute device selected");
        device
    })
}
