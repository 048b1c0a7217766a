//! Engine and device configuration.
//!
//! Device options mirror the runtime parameters of the accelerator layer
//! and can be overridden through `DAGFLOW_DEVICE_*` environment variables.

use crate::sched::SchedulerKind;
use std::env;

/// Built-in search path for device kernel libraries, overridden by
/// `DAGFLOW_DEVICE_PATH`.
pub const DEFAULT_LIB_PATH: &str = "/usr/local/lib/dagflow";

/// Configuration of the accelerator device layer.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Number of accelerator devices to enable (0 disables the offload
    /// engine entirely).
    pub enabled: usize,
    /// Bitmask selecting which physical devices participate.
    pub mask: u32,
    /// Percentage of the device's free memory to reserve for the pool.
    pub memory_use: u8,
    /// Explicit segment count; overrides `memory_use` when >= 0.
    pub memory_number_of_blocks: i64,
    /// Segment size in bytes.
    pub memory_block_size: usize,
    /// `;`-separated search paths for device kernel libraries.
    pub path: String,
    /// Verbosity of the device layer (higher is noisier).
    pub verbose: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            enabled: 0,
            mask: u32::MAX,
            memory_use: 95,
            memory_number_of_blocks: -1,
            memory_block_size: 32 * 1024,
            path: DEFAULT_LIB_PATH.to_string(),
            verbose: 0,
        }
    }
}

impl DeviceConfig {
    /// Reads the device configuration from the environment, falling back
    /// to defaults for unset or unparsable variables.
    pub fn from_env() -> Self {
        let mut cfg = DeviceConfig::default();
        if let Some(v) = env_parse::<usize>("DAGFLOW_DEVICE_ENABLED") {
            cfg.enabled = v;
        }
        if let Some(v) = env_parse::<u32>("DAGFLOW_DEVICE_MASK") {
            cfg.mask = v;
        }
        if let Some(v) = env_parse::<u8>("DAGFLOW_DEVICE_MEMORY_USE") {
            cfg.memory_use = v.min(100);
        }
        if let Some(v) = env_parse::<i64>("DAGFLOW_DEVICE_MEMORY_NUMBER_OF_BLOCKS") {
            cfg.memory_number_of_blocks = v;
        }
        if let Some(v) = env_parse::<usize>("DAGFLOW_DEVICE_MEMORY_BLOCK_SIZE") {
            cfg.memory_block_size = v;
        }
        if let Ok(v) = env::var("DAGFLOW_DEVICE_PATH") {
            cfg.path = v;
        }
        if let Some(v) = env_parse::<u8>("DAGFLOW_DEVICE_VERBOSE") {
            cfg.verbose = v;
        }
        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of worker threads (execution streams).
    pub workers: usize,
    /// Scheduling policy.
    pub scheduler: SchedulerKind,
    /// Pin worker threads to CPU cores when topology permits.
    pub pin_workers: bool,
    /// Accelerator layer configuration.
    pub device: DeviceConfig,
}

impl EngineConfig {
    /// Creates a configuration with the given worker count and policy,
    /// devices disabled.
    pub fn new(workers: usize, scheduler: SchedulerKind) -> Self {
        EngineConfig {
            workers,
            scheduler,
            pin_workers: false,
            device: DeviceConfig::default(),
        }
    }

    /// Enables worker pinning.
    pub fn with_pinning(mut self) -> Self {
        self.pin_workers = true;
        self
    }

    /// Replaces the device configuration.
    pub fn with_devices(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }
}
