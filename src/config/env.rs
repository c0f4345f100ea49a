use super::{DeviceKind, DispatchConfig, FallbackPolicy};
use crate::error::{KernelError, Result};

/// Comma-separated device preference, e.g. `acc,jtp`.
pub const ENV_DEVICES: &str = "KERNELC_DEVICES";
/// `strict` or `fallback`.
pub const ENV_FALLBACK: &str = "KERNELC_FALLBACK";
/// Worker count for the thread-pool device.
pub const ENV_THREADS: &str = "KERNELC_THREADS";

/// Apply overrides found through `lookup`.
pub(super) fn apply(
    config: &mut DispatchConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(devices) = lookup(ENV_DEVICES) {
        config.devices = devices
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(str::parse::<DeviceKind>)
            .collect::<Result<Vec<_>>>()?;
    }
    if let Some(policy) = lookup(ENV_FALLBACK) {
        config.fallback = policy.parse::<FallbackPolicy>()?;
    }
    if let Some(threads) = lookup(ENV_THREADS) {
        let n = threads
            .trim()
            .parse::<usize>()
            .map_err(|_| KernelError::config(format!("{}: not a number: '{}'", ENV_THREADS, threads)))?;
        config.num_threads = Some(n);
    }
    Ok(())
}
