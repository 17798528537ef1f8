// file: src/platform.rs
// description: Platform capability query (native MX support, compute capability) and device cache control.
// author: cipher-rc5

use candle_core::Device;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::memory::MemoryManager;

pub trait Platform: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the device executes MX formats natively.
    fn supports_mx(&self) -> bool;

    fn device(&self) -> &Device;

    /// Compute capability as `major * 10 + minor`, when the device reports one.
    fn device_capability(&self) -> Option<u32> {
        None
    }

    fn memory(&self) -> &MemoryManager;

    /// Hand cached device memory back before any later allocation relies on it.
    fn empty_cache(&self) -> Result<()> {
        let freed = self.memory().empty_cache();
        debug!("{}: empty_cache freed {} bytes", self.name(), freed);
        Ok(())
    }
}

/// Host (CPU) platform. `native_mx` marks it as MX-capable so the native path
/// can run against the reference kernels.
pub struct HostPlatform {
    device: Device,
    native_mx: bool,
    capability: Option<u32>,
    memory: MemoryManager,
}

impl HostPlatform {
    pub fn new(native_mx: bool) -> Arc<Self> {
        Arc::new(Self {
            device: Device::Cpu,
            native_mx,
            capability: None,
            memory: MemoryManager::new(),
        })
    }

    pub fn with_capability(native_mx: bool, capability: u32) -> Arc<Self> {
        Arc::new(Self {
            device: Device::Cpu,
            native_mx,
            capability: Some(capability),
            memory: MemoryManager::new(),
        })
    }
}

impl Platform for HostPlatform {
    fn name(&self) -> &str {
        "host"
    }

    fn supports_mx(&self) -> bool {
        self.native_mx
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn device_capability(&self) -> Option<u32> {
        self.capability
    }

    fn memory(&self) -> &MemoryManager {
        &self.memory
    }
}
