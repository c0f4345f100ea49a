//! Dispatcher configuration.
//!
//! A `DispatchConfig` is passed explicitly to `Dispatcher::new`. A
//! process-wide default may be installed once at startup with
//! [`set_default`]; after that it is immutable.

mod env;

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::{KernelError, Result};

pub use env::{ENV_DEVICES, ENV_FALLBACK, ENV_THREADS};

/// An execution substrate the dispatcher can compile for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// The configured accelerator (OpenCL-style device).
    Accelerator,
    /// CPU fallback on a fixed-size worker pool.
    ThreadPool,
    /// CPU fallback on the calling thread, one chunk.
    Sequential,
}

impl DeviceKind {
    pub fn name(self) -> &'static str {
        match self {
            DeviceKind::Accelerator => "acc",
            DeviceKind::ThreadPool => "jtp",
            DeviceKind::Sequential => "seq",
        }
    }

    pub fn is_fallback(self) -> bool {
        self != DeviceKind::Accelerator
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceKind {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "acc" | "accelerator" | "gpu" | "opencl" => Ok(DeviceKind::Accelerator),
            "jtp" | "pool" | "threadpool" | "thread_pool" => Ok(DeviceKind::ThreadPool),
            "seq" | "sequential" => Ok(DeviceKind::Sequential),
            other => Err(KernelError::config(format!("unknown device kind '{}'", other))),
        }
    }
}

/// What happens when the accelerator cannot compile or run a kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Surface the failure to the caller.
    #[default]
    Strict,
    /// Retry on the next configured device.
    FallBack,
}

impl FromStr for FallbackPolicy {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" | "0" | "false" => Ok(FallbackPolicy::Strict),
            "fallback" | "fall_back" | "1" | "true" => Ok(FallbackPolicy::FallBack),
            other => Err(KernelError::config(format!(
                "unknown fallback policy '{}'",
                other
            ))),
        }
    }
}

/// Host/device transfer mode for the accelerator backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Upload arrays before every `execute`, download read-write arrays
    /// after it.
    #[default]
    Implicit,
    /// Transfer only on `Kernel::put` / `Kernel::get`.
    Explicit,
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Devices to try, most preferred first.
    pub devices: Vec<DeviceKind>,
    pub fallback: FallbackPolicy,
    /// Worker count for the thread-pool device (`None` = one per core).
    pub num_threads: Option<usize>,
    /// Upper bound on the product of a range's local sizes.
    pub max_work_group_size: usize,
    pub transfer_mode: TransferMode,
    pub thread_name_prefix: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            devices: vec![DeviceKind::Accelerator, DeviceKind::ThreadPool],
            fallback: FallbackPolicy::default(),
            num_threads: None,
            max_work_group_size: 256,
            transfer_mode: TransferMode::default(),
            thread_name_prefix: "kernelc-worker".to_string(),
        }
    }
}

impl DispatchConfig {
    pub fn builder() -> DispatchConfigBuilder {
        DispatchConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(KernelError::config("at least one device is required"));
        }
        for (i, d) in self.devices.iter().enumerate() {
            if self.devices[..i].contains(d) {
                return Err(KernelError::config(format!("device '{}' listed twice", d)));
            }
        }
        if let Some(n) = self.num_threads {
            if n == 0 {
                return Err(KernelError::config("num_threads must be > 0"));
            }
            if n > 1024 {
                return Err(KernelError::config("num_threads too large (max 1024)"));
            }
        }
        if self.max_work_group_size == 0 {
            return Err(KernelError::config("max_work_group_size must be > 0"));
        }
        Ok(())
    }

    pub fn worker_threads(&self) -> usize {
        self.num_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Defaults overridden by `KERNELC_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        env::apply(&mut config, |key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Default)]
pub struct DispatchConfigBuilder {
    config: DispatchConfig,
}

impl DispatchConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: DispatchConfig::default(),
        }
    }

    pub fn devices(mut self, devices: &[DeviceKind]) -> Self {
        self.config.devices = devices.to_vec();
        self
    }

    pub fn fallback(mut self, policy: FallbackPolicy) -> Self {
        self.config.fallback = policy;
        self
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.config.num_threads = Some(n);
        self
    }

    pub fn max_work_group_size(mut self, n: usize) -> Self {
        self.config.max_work_group_size = n;
        self
    }

    pub fn transfer_mode(mut self, mode: TransferMode) -> Self {
        self.config.transfer_mode = mode;
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn build(self) -> Result<DispatchConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

static DEFAULT: OnceLock<DispatchConfig> = OnceLock::new();

/// Install the process-wide default. Fails if one is already set.
pub fn set_default(config: DispatchConfig) -> Result<()> {
    config.validate()?;
    DEFAULT
        .set(config)
        .map_err(|_| KernelError::config("default dispatch config already set"))
}

/// The process-wide default, or the built-in defaults if none was set.
pub fn default_config() -> &'static DispatchConfig {
    DEFAULT.get_or_init(DispatchConfig::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_validates() {
        assert!(DispatchConfig::builder().num_threads(0).build().is_err());
        assert!(DispatchConfig::builder().devices(&[]).build().is_err());
        assert!(DispatchConfig::builder()
            .devices(&[DeviceKind::Sequential, DeviceKind::Sequential])
            .build()
            .is_err());
        let cfg = DispatchConfig::builder()
            .devices(&[DeviceKind::ThreadPool])
            .num_threads(4)
            .build()
            .unwrap();
        assert_eq!(cfg.worker_threads(), 4);
    }

    #[test]
    fn test_device_kind_parse() {
        assert_eq!("GPU".parse::<DeviceKind>().unwrap(), DeviceKind::Accelerator);
        assert_eq!("jtp".parse::<DeviceKind>().unwrap(), DeviceKind::ThreadPool);
        assert_eq!("seq".parse::<DeviceKind>().unwrap(), DeviceKind::Sequential);
        assert!("fpga".parse::<DeviceKind>().is_err());
    }

    #[test]
    fn test_default_prefers_accelerator_strictly() {
        let cfg = DispatchConfig::default();
        assert_eq!(cfg.devices[0], DeviceKind::Accelerator);
        assert_eq!(cfg.fallback, FallbackPolicy::Strict);
    }
}
