//! Backend aliases.
//!
//! CPU (`ndarray`) by default; the `wgpu` feature switches to the GPU.

use burn::backend::Autodiff;

#[cfg(not(feature = "wgpu"))]
pub type DefaultBackend = burn::backend::NdArray;

#[cfg(feature = "wgpu")]
pub type DefaultBackend = burn::backend::Wgpu;

/// The autodiff backend used for training
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Device for the configured backend
pub fn default_device(device: xray_core::Device) -> <DefaultBackend as burn::tensor::backend::Backend>::Device {
    #[cfg(not(feature = "wgpu"))]
    {
        let _ = device;
        burn::backend::ndarray::NdArrayDevice::Cpu
    }

    #[cfg(feature = "wgpu")]
    {
        match device {
            xray_core::Device::Cpu => burn::backend::wgpu::WgpuDevice::Cpu,
            xray_core::Device::Gpu(id) => burn::backend::wgpu::WgpuDevice::DiscreteGpu(id),
        }
    }
}

/// Human-readable backend name
pub fn backend_name() -> &'static str {
    #[cfg(not(feature = "wgpu"))]
    {
        "NdArray (CPU)"
    }

    #[cfg(feature = "wgpu")]
    {
        "WGPU (GPU)"
    }
}
