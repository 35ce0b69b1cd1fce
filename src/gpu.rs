//! GPU adapters and capabilities
//!
//! Adapter enumeration goes through wgpu so the indices line up with the
//! tool's `--adapter` option for the same graphics API. Capabilities are
//! whatever the tool itself reported, captured once per suite run.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ntc::{GpuFeature, GraphicsApi, RunResult};

/// A graphics adapter visible through one API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterInfo {
    pub index: usize,
    pub name: String,
    pub backend: String,
    pub device_type: String,
}

fn backends_for(api: GraphicsApi) -> wgpu::Backends {
    match api {
        GraphicsApi::Vulkan => wgpu::Backends::VULKAN,
        GraphicsApi::Dx12 => wgpu::Backends::DX12,
    }
}

/// All adapters for `api`, in enumeration order
pub fn list_adapters(api: GraphicsApi) -> Vec<AdapterInfo> {
    let backends = backends_for(api);
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends,
        ..Default::default()
    });

    let adapters: Vec<wgpu::Adapter> = pollster::block_on(instance.enumerate_adapters(backends));

    adapters
        .into_iter()
        .enumerate()
        .map(|(index, adapter)| {
            let info = adapter.get_info();
            AdapterInfo {
                index,
                name: info.name,
                backend: info.backend.to_str().to_string(),
                device_type: format!("{:?}", info.device_type),
            }
        })
        .inspect(|a| info!("Adapter {}: {} ({})", a.index, a.name, a.backend))
        .collect()
}

/// Device capabilities as reported by the tool.
///
/// Taken from a describe or compression run and passed to later cases so
/// they can decide what to skip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuCapabilities {
    pub gpu_name: String,
    /// Empty when the report came from the CUDA path
    pub graphics_api: String,
    pub features: Vec<GpuFeature>,
    pub compute_capability: Option<(u32, u32)>,
}

impl GpuCapabilities {
    pub fn from_result(result: &RunResult) -> Self {
        Self {
            gpu_name: result.gpu_name.clone(),
            graphics_api: result.graphics_api.clone(),
            features: result.gpu_features.clone(),
            compute_capability: result.compute_capability,
        }
    }

    pub fn supports(&self, feature: GpuFeature) -> bool {
        self.features.contains(&feature)
    }

    /// Any form of cooperative vector support
    pub fn supports_coop_vec(&self) -> bool {
        self.supports(GpuFeature::CoopVec)
            || self.supports(GpuFeature::CoopVecInt8)
            || self.supports(GpuFeature::CoopVecFP8)
    }

    /// Names of the supported features, for reports
    pub fn feature_names(&self) -> Vec<&'static str> {
        self.features.iter().map(GpuFeature::name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_from_result() {
        let result = RunResult {
            gpu_name: "NVIDIA GeForce RTX 4090".into(),
            graphics_api: "Vulkan".into(),
            gpu_features: vec![GpuFeature::DP4a, GpuFeature::CoopVecInt8],
            ..Default::default()
        };
        let caps = GpuCapabilities::from_result(&result);
        assert!(caps.supports(GpuFeature::DP4a));
        assert!(!caps.supports(GpuFeature::FP16));
        assert!(caps.supports_coop_vec());
        assert_eq!(caps.feature_names(), vec!["DP4a", "CoopVecInt8"]);
    }

    #[test]
    fn test_no_coop_vec() {
        let caps = GpuCapabilities {
            features: vec![GpuFeature::DP4a, GpuFeature::FP16],
            ..Default::default()
        };
        assert!(!caps.supports_coop_vec());
    }

    #[test]
    fn test_backend_mapping() {
        assert_eq!(backends_for(GraphicsApi::Vulkan), wgpu::Backends::VULKAN);
        assert_eq!(backends_for(GraphicsApi::Dx12), wgpu::Backends::DX12);
    }
}
