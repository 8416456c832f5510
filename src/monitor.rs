//! Resource monitor: samples RAM (and GPU VRAM, where detectable) on a
//! fixed interval and triggers eviction when usage crosses a watermark.
//! Fills in what were placeholder `ResourceUsage`/`GpuInfo` stubs with a
//! real `sysinfo`-backed sampler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use sysinfo::System;

#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSnapshot {
    pub mem_used_bytes: u64,
    pub mem_total_bytes: u64,
    pub vram_used_bytes: u64,
    pub vram_total_bytes: u64,
}

impl ResourceSnapshot {
    pub fn mem_fraction(&self) -> f32 {
        if self.mem_total_bytes == 0 {
            return 0.0;
        }
        self.mem_used_bytes as f32 / self.mem_total_bytes as f32
    }

    pub fn vram_fraction(&self) -> f32 {
        if self.vram_total_bytes == 0 {
            return 0.0;
        }
        self.vram_used_bytes as f32 / self.vram_total_bytes as f32
    }
}

/// Reports VRAM usage. Implemented separately from the RAM sampler since
/// `sysinfo` has no cross-vendor GPU support; the llama_cpp engine tracks
/// its own VRAM bookkeeping and exposes it through this trait so the
/// monitor doesn't need to depend on CUDA/Vulkan directly.
pub trait VramSource: Send + Sync {
    fn vram_usage(&self) -> (u64, u64);
}

pub struct NoVram;

impl VramSource for NoVram {
    fn vram_usage(&self) -> (u64, u64) {
        (0, 0)
    }
}

pub struct ResourceMonitor {
    system: Mutex<System>,
    vram_source: Box<dyn VramSource>,
    watermark: f32,
    last_mem_used: AtomicU64,
    last_mem_total: AtomicU64,
}

impl ResourceMonitor {
    pub fn new(watermark: f32, vram_source: Box<dyn VramSource>) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
            vram_source,
            watermark: watermark.clamp(0.0, 1.0),
            last_mem_used: AtomicU64::new(0),
            last_mem_total: AtomicU64::new(0),
        }
    }

    pub fn sample(&self) -> ResourceSnapshot {
        let (mem_used, mem_total) = {
            let mut system = self.system.lock().unwrap();
            system.refresh_memory();
            (system.used_memory(), system.total_memory())
        };
        let (vram_used, vram_total) = self.vram_source.vram_usage();

        self.last_mem_used.store(mem_used, Ordering::Relaxed);
        self.last_mem_total.store(mem_total, Ordering::Relaxed);

        ResourceSnapshot {
            mem_used_bytes: mem_used,
            mem_total_bytes: mem_total,
            vram_used_bytes: vram_used,
            vram_total_bytes: vram_total,
        }
    }

    pub fn last_sample(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            mem_used_bytes: self.last_mem_used.load(Ordering::Relaxed),
            mem_total_bytes: self.last_mem_total.load(Ordering::Relaxed),
            vram_used_bytes: 0,
            vram_total_bytes: 0,
        }
    }

    pub fn is_over_watermark(&self, snapshot: &ResourceSnapshot) -> bool {
        snapshot.mem_fraction() >= self.watermark || snapshot.vram_fraction() >= self.watermark
    }

    /// Runs `evict_one` repeatedly until usage drops back under the
    /// watermark or `evict_one` reports nothing left to evict. `evict_one`
    /// should skip any model currently serving a request and return
    /// `false` only when no such model remains.
    pub async fn relieve_pressure(&self, mut evict_one: impl FnMut() -> bool) {
        loop {
            let snapshot = self.sample();
            if !self.is_over_watermark(&snapshot) {
                return;
            }
            if !evict_one() {
                return;
            }
        }
    }

    /// Spawns a background task that samples on `interval` and invokes
    /// `on_watermark` with the current snapshot whenever usage crosses the
    /// configured watermark. Intended to run for the lifetime of the node.
    pub fn spawn_loop<F>(self: std::sync::Arc<Self>, interval: Duration, mut on_watermark: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(ResourceSnapshot) + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let snapshot = self.sample();
                if self.is_over_watermark(&snapshot) {
                    on_watermark(snapshot);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedVram(u64, u64);

    impl VramSource for FixedVram {
        fn vram_usage(&self) -> (u64, u64) {
            (self.0, self.1)
        }
    }

    #[test]
    fn watermark_fraction_uses_whichever_resource_is_higher() {
        let snapshot = ResourceSnapshot {
            mem_used_bytes: 10,
            mem_total_bytes: 100,
            vram_used_bytes: 95,
            vram_total_bytes: 100,
        };
        let monitor = ResourceMonitor::new(0.9, Box::new(NoVram));
        assert!(monitor.is_over_watermark(&snapshot));
    }

    #[test]
    fn under_watermark_is_not_flagged() {
        let snapshot = ResourceSnapshot {
            mem_used_bytes: 10,
            mem_total_bytes: 100,
            vram_used_bytes: 10,
            vram_total_bytes: 100,
        };
        let monitor = ResourceMonitor::new(0.9, Box::new(NoVram));
        assert!(!monitor.is_over_watermark(&snapshot));
    }

    #[test]
    fn sample_reports_vram_from_injected_source() {
        let monitor = ResourceMonitor::new(0.9, Box::new(FixedVram(512, 1024)));
        let snapshot = monitor.sample();
        assert_eq!(snapshot.vram_used_bytes, 512);
        assert_eq!(snapshot.vram_total_bytes, 1024);
    }

    #[tokio::test]
    async fn relieve_pressure_stops_once_under_watermark() {
        let monitor = ResourceMonitor::new(0.99, Box::new(FixedVram(0, 0)));
        let mut calls = 0;
        monitor
            .relieve_pressure(|| {
                calls += 1;
                false
            })
            .await;
        // mem fraction on a real host is essentially never >= 0.99, so
        // relieve_pressure should return without calling evict_one.
        assert_eq!(calls, 0);
    }
}
