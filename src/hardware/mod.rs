//! Accelerator detection and the parallelism budget derived from it.
//!
//! The probe itself is a pure function of `(cpu count, CUDA devices, MPS)`
//! so that the budget rules are testable without hardware. `probe()` feeds
//! it from the running machine.

use std::fmt;

use candle_core::Device;
use tracing::{debug, warn};

/// Upper bound for concurrently running HPO trials.
pub const MAX_HPO_PARALLEL_JOBS: usize = 16;
/// Upper bound for the classical per-entity thread pool.
pub const MAX_CLASSICAL_THREADS: usize = 16;
const MAX_DATA_WORKERS: usize = 8;
const MAX_CUDA_PROBE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accelerator {
    Gpu,
    Mps,
    Cpu,
}

impl Accelerator {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "gpu" | "cuda" => Some(Accelerator::Gpu),
            "mps" | "metal" => Some(Accelerator::Mps),
            "cpu" => Some(Accelerator::Cpu),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Accelerator::Gpu => "gpu",
            Accelerator::Mps => "mps",
            Accelerator::Cpu => "cpu",
        }
    }
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the hardware probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareConfig {
    pub accelerator: Accelerator,
    /// Number of accelerator devices (1 for CPU).
    pub devices: usize,
    /// Training strategy hint: `ddp` for multi-GPU, otherwise `auto`.
    pub strategy: &'static str,
    pub data_worker_count: usize,
    pub hpo_parallel_jobs: usize,
    pub cpu_count: usize,
}

impl HardwareConfig {
    /// Threads used to fan classical fits out across entities.
    pub fn classical_threads(&self) -> usize {
        self.cpu_count.clamp(1, MAX_CLASSICAL_THREADS)
    }

    /// One-line summary for job reports, e.g. `gpu x4 (ddp), 8 data workers, 8 hpo jobs`.
    pub fn describe(&self) -> String {
        format!(
            "{} x{} ({}), {} data workers, {} hpo jobs",
            self.accelerator, self.devices, self.strategy, self.data_worker_count, self.hpo_parallel_jobs
        )
    }

    /// Materialize the candle device for this accelerator.
    ///
    /// Falls back to the CPU if the backend refuses to initialise.
    pub fn device(&self) -> Device {
        let dev = match self.accelerator {
            Accelerator::Gpu => Device::new_cuda(0),
            Accelerator::Mps => Device::new_metal(0),
            Accelerator::Cpu => return Device::Cpu,
        };
        match dev {
            Ok(d) => d,
            Err(err) => {
                warn!(target: "hardware", accelerator = %self.accelerator, %err, "device init failed; using cpu");
                Device::Cpu
            }
        }
    }
}

/// Derive the hardware configuration from raw counts.
///
/// Priority is CUDA > MPS > CPU. An override is honoured only when that
/// accelerator is actually available.
pub fn probe_with(
    cpu_count: usize,
    cuda_devices: usize,
    mps_available: bool,
    override_acc: Option<Accelerator>,
) -> HardwareConfig {
    let cpu_count = cpu_count.max(1);

    let detected = if cuda_devices > 0 {
        Accelerator::Gpu
    } else if mps_available {
        Accelerator::Mps
    } else {
        Accelerator::Cpu
    };

    let accelerator = match override_acc {
        Some(Accelerator::Gpu) if cuda_devices > 0 => Accelerator::Gpu,
        Some(Accelerator::Mps) if mps_available => Accelerator::Mps,
        Some(Accelerator::Cpu) => Accelerator::Cpu,
        _ => detected,
    };

    let devices = match accelerator {
        Accelerator::Gpu => cuda_devices,
        Accelerator::Mps | Accelerator::Cpu => 1,
    };
    let strategy = if accelerator == Accelerator::Gpu && devices > 1 {
        "ddp"
    } else {
        "auto"
    };

    // GPU trials share the device, so fewer run concurrently.
    let divisor = if accelerator == Accelerator::Gpu { 8 } else { 4 };
    let hpo_parallel_jobs = (cpu_count / divisor).clamp(1, MAX_HPO_PARALLEL_JOBS);
    let data_worker_count = (cpu_count / 4).clamp(1, MAX_DATA_WORKERS);

    HardwareConfig {
        accelerator,
        devices,
        strategy,
        data_worker_count,
        hpo_parallel_jobs,
        cpu_count,
    }
}

/// Probe the running machine.
pub fn probe(override_acc: Option<Accelerator>) -> HardwareConfig {
    let cpu_count = num_cpus::get();
    let cuda_devices = count_cuda_devices();
    let mps_available = candle_core::utils::metal_is_available() && Device::new_metal(0).is_ok();

    let hw = probe_with(cpu_count, cuda_devices, mps_available, override_acc);
    debug!(
        target: "hardware",
        accelerator = %hw.accelerator,
        devices = hw.devices,
        cpus = hw.cpu_count,
        hpo_jobs = hw.hpo_parallel_jobs,
        "hardware probed"
    );
    hw
}

fn count_cuda_devices() -> usize {
    if !candle_core::utils::cuda_is_available() {
        return 0;
    }
    (0..MAX_CUDA_PROBE)
        .take_while(|&ordinal| Device::new_cuda(ordinal).is_ok())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cuda_beats_mps_beats_cpu() {
        assert_eq!(probe_with(8, 2, true, None).accelerator, Accelerator::Gpu);
        assert_eq!(probe_with(8, 0, true, None).accelerator, Accelerator::Mps);
        assert_eq!(probe_with(8, 0, false, None).accelerator, Accelerator::Cpu);
    }

    #[test]
    fn override_only_applies_when_available() {
        assert_eq!(
            probe_with(8, 2, false, Some(Accelerator::Cpu)).accelerator,
            Accelerator::Cpu
        );
        assert_eq!(
            probe_with(8, 0, false, Some(Accelerator::Gpu)).accelerator,
            Accelerator::Cpu
        );
    }

    #[test]
    fn parallel_budget_scales_with_cores() {
        let cpu = probe_with(64, 0, false, None);
        assert_eq!(cpu.hpo_parallel_jobs, 16);
        assert_eq!(cpu.data_worker_count, 8);
        assert_eq!(cpu.classical_threads(), 16);

        let gpu = probe_with(64, 4, false, None);
        assert_eq!(gpu.hpo_parallel_jobs, 8);
        assert_eq!(gpu.devices, 4);
        assert_eq!(gpu.strategy, "ddp");

        assert_eq!(gpu.describe(), "gpu x4 (ddp), 8 data workers, 8 hpo jobs");

        let tiny = probe_with(1, 0, false, None);
        assert_eq!(tiny.hpo_parallel_jobs, 1);
        assert_eq!(tiny.data_worker_count, 1);
        assert_eq!(tiny.strategy, "auto");
        assert_eq!(tiny.describe(), "cpu x1 (auto), 1 data workers, 1 hpo jobs");
    }
}
