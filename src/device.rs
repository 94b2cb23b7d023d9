//! # Device Selection
//!
//! Resolves the configured device preference (`auto`, `cpu`, `cuda`, `metal`)
//! to a concrete candle device. Auto-detection is cached for the process
//! lifetime since probing CUDA/Metal is not free.

use candle_core::Device;
use std::sync::OnceLock;
use tracing::{debug, info};

static DETECTED_DEVICE: OnceLock<Device> = OnceLock::new();

/// Where model inference should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    /// Pick the best available device (CUDA, then Metal, then CPU)
    Auto,
    Cpu,
    /// Falls back to CPU when no CUDA device is present
    Cuda,
    /// Falls back to CPU when no Metal device is present
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

impl DevicePreference {
    /// Resolve the preference to a usable device.
    pub fn resolve(self) -> Device {
        match self {
            DevicePreference::Auto => detected_device().clone(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => cuda_device().unwrap_or(Device::Cpu),
            DevicePreference::Metal => metal_device().unwrap_or(Device::Cpu),
        }
    }
}

/// True when the device can run f16 arithmetic at full speed.
pub fn is_accelerator(device: &Device) -> bool {
    !matches!(device, Device::Cpu)
}

fn detected_device() -> &'static Device {
    DETECTED_DEVICE.get_or_init(|| {
        if let Some(device) = cuda_device() {
            info!("Selected CUDA GPU for inference");
            return device;
        }
        if let Some(device) = metal_device() {
            info!("Selected Metal GPU for inference");
            return device;
        }
        info!("No GPU available, using CPU for inference");
        Device::Cpu
    })
}

fn cuda_device() -> Option<Device> {
    match Device::new_cuda(0) {
        Ok(device) => Some(device),
        Err(e) => {
            debug!("CUDA not available: {}", e);
            None
        }
    }
}

fn metal_device() -> Option<Device> {
    match Device::new_metal(0) {
        Ok(device) => Some(device),
        Err(e) => {
            debug!("Metal not available: {}", e);
            None
        }
    }
}
