//! Device selection.
//!
//! Device placement is a configuration concern: the run configuration names a
//! preferred device and [`resolve_device`] falls back to the CPU when no
//! accelerator is present.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Device type for backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    /// CPU backend
    #[default]
    Cpu,
    /// GPU backend with adapter index
    Gpu(usize),
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "CPU"),
            Device::Gpu(id) => write!(f, "GPU:{}", id),
        }
    }
}

impl std::str::FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        match lower.as_str() {
            "cpu" => Ok(Device::Cpu),
            "gpu" | "cuda" => Ok(Device::Gpu(0)),
            _ => {
                let id = lower
                    .strip_prefix("gpu:")
                    .or_else(|| lower.strip_prefix("cuda:"))
                    .and_then(|id| id.parse().ok())
                    .ok_or_else(|| format!("unknown device '{s}'"))?;
                Ok(Device::Gpu(id))
            }
        }
    }
}

/// Resolve the requested device against what the host provides
pub fn resolve_device(requested: Device) -> Device {
    let device = match requested {
        Device::Cpu => Device::Cpu,
        Device::Gpu(id) if is_gpu_available() => Device::Gpu(id),
        Device::Gpu(id) => {
            warn!("GPU:{id} requested but no accelerator detected, falling back to CPU");
            Device::Cpu
        }
    };
    info!("Using device: {device}");
    device
}

/// Check if any GPU acceleration is available
pub fn is_gpu_available() -> bool {
    has_nvidia_gpu() || has_amd_gpu()
}

fn has_nvidia_gpu() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/proc/driver/nvidia/version").exists()
            || std::path::Path::new("/dev/nvidia0").exists()
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

fn has_amd_gpu() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/sys/module/amdgpu").exists()
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}
