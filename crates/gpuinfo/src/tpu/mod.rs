//! TPU backend: metrics come from an out-of-process data source.
//!
//! Device presence is established by counting device nodes; readings are
//! produced by the background worker in [`worker`] and consumed here by
//! copying single records out of the shared table. All vendor-contract
//! calls stay synchronous and cheap.

pub(crate) mod worker;

use std::borrow::Cow;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context;
use gpuinfo_types::{DynamicInfo, StaticInfo};

use crate::device::{DeviceHandle, GpuDevice};
use crate::vendor::{take_mask_bit, GpuVendor};
use worker::{ScriptInvocation, SharedChipState, MAX_CHIPS_PER_HOST};

/// Device nodes the accelerator driver exposes; the number of matches is
/// the chip count for the session.
pub(crate) const TPU_DEVICE_GLOB: &str = "/dev/accel*";

pub struct TpuVendor {
    shared: Arc<SharedChipState>,
    poller: Option<JoinHandle<()>>,
    device_glob: String,
    local_error: Option<String>,
    #[cfg(test)]
    invocation_override: Option<ScriptInvocation>,
}

impl TpuVendor {
    pub fn new() -> Self {
        Self::with_device_glob(TPU_DEVICE_GLOB)
    }

    fn with_device_glob(pattern: &str) -> Self {
        Self {
            shared: Arc::new(SharedChipState::new()),
            poller: None,
            device_glob: pattern.to_string(),
            local_error: None,
            #[cfg(test)]
            invocation_override: None,
        }
    }

    fn chip_count(&self) -> usize {
        self.shared.chip_count.load(Ordering::Acquire)
    }

    fn script_invocation(&mut self, interpreter: &str) -> ScriptInvocation {
        #[cfg(test)]
        if let Some(invocation) = self.invocation_override.take() {
            return invocation;
        }
        ScriptInvocation::preferred(interpreter)
    }
}

impl Default for TpuVendor {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuVendor for TpuVendor {
    fn name(&self) -> &'static str {
        "TPU"
    }

    fn init(&mut self) -> bool {
        let chip_count = match count_device_nodes(&self.device_glob) {
            Ok(count) => count,
            Err(err) => {
                self.local_error = Some(format!("TPU device discovery failed: {err:#}"));
                return false;
            }
        };
        if chip_count == 0 {
            self.local_error = Some(format!(
                "no TPU device nodes matched {}",
                self.device_glob
            ));
            return false;
        }
        let chip_count = chip_count.min(MAX_CHIPS_PER_HOST);
        self.shared.table.full_reset();
        self.shared.stop.store(false, Ordering::Release);
        self.shared.chip_count.store(chip_count, Ordering::Release);
        self.local_error = None;
        tracing::info!(chip_count, "TPU backend initialized");
        true
    }

    fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(poller) = self.poller.take() {
            // Blocks until the worker observes the flag, which it checks at
            // sleep granularity.
            if poller.join().is_err() {
                tracing::warn!("TPU usage poller panicked");
            }
        }
        self.shared.chip_count.store(0, Ordering::Release);
    }

    fn last_error_string(&self) -> Cow<'_, str> {
        match &self.local_error {
            Some(message) => Cow::Borrowed(message.as_str()),
            None => Cow::Borrowed("no TPU error recorded"),
        }
    }

    fn get_device_handles(
        &mut self,
        devices: &mut Vec<GpuDevice>,
        selection_mask: &mut u64,
    ) -> bool {
        let chip_count = self.chip_count();
        if chip_count == 0 {
            return false;
        }
        if self.poller.is_none() {
            let interpreter = worker::configured_interpreter();
            let invocation = self.script_invocation(&interpreter);
            match worker::spawn_poller(Arc::clone(&self.shared), invocation, interpreter) {
                Ok(handle) => self.poller = Some(handle),
                Err(err) => {
                    self.local_error = Some(format!("failed to start usage poller: {err}"));
                    return false;
                }
            }
        }
        for slot in 0..chip_count {
            if !take_mask_bit(selection_mask) {
                continue;
            }
            devices.push(GpuDevice::new(DeviceHandle::from_index(slot)));
        }
        true
    }

    fn populate_static_info(&mut self, device: &mut GpuDevice) {
        let info = &mut device.static_info;
        *info = StaticInfo::default();

        let slot = device.handle.index();
        let name = match self.shared.table.snapshot(slot) {
            Some(usage) if !usage.name.is_empty() => format!("TPU{slot}-{}", usage.name),
            _ => format!("TPU{slot}"),
        };
        info.device_name = Some(name);
    }

    fn refresh_dynamic_info(&mut self, device: &mut GpuDevice) {
        let info = &mut device.dynamic_info;
        *info = DynamicInfo::default();

        let slot = device.handle.index();
        if slot >= self.chip_count() {
            // The backend disabled itself after this device was handed out.
            return;
        }
        let Some(usage) = self.shared.table.snapshot(slot) else {
            return;
        };

        let used = usage.memory_usage.max(0) as u64;
        let total = usage.total_memory.max(0) as u64;
        // Unlike a library call, the external source makes no non-zero
        // guarantee for the total; clamp the divisor.
        let mem_util = (used as f64 * 100.0 / total.max(1) as f64).round() as u32;
        info.gpu_util_rate = Some(usage.duty_cycle_pct.round() as u32);
        info.mem_util_rate = Some(mem_util);
        info.total_memory = Some(total);
        info.used_memory = Some(used);
        info.free_memory = Some(total.saturating_sub(used));
    }

    fn refresh_running_processes(&mut self, device: &mut GpuDevice) {
        // The external source reports no per-process data.
        device.processes.clear();
    }
}

fn count_device_nodes(pattern: &str) -> anyhow::Result<usize> {
    let matches = glob::glob(pattern).context("parse device glob pattern")?;
    Ok(matches.filter_map(Result::ok).count())
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use test_log::test;

    use super::worker::ChipUsageData;
    use super::*;

    fn fake_device_tree(count: usize) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().expect("create temp dir");
        for index in 0..count {
            File::create(dir.path().join(format!("accel{index}"))).expect("create device node");
        }
        let pattern = format!("{}/accel*", dir.path().display());
        (dir, pattern)
    }

    #[test]
    fn device_node_counting_follows_the_glob() {
        let (_dir, pattern) = fake_device_tree(3);
        assert_eq!(count_device_nodes(&pattern).expect("count"), 3);

        let (_empty, empty_pattern) = fake_device_tree(0);
        assert_eq!(count_device_nodes(&empty_pattern).expect("count"), 0);
    }

    #[test]
    fn init_fails_when_no_device_nodes_match() {
        let (_dir, pattern) = fake_device_tree(0);
        let mut vendor = TpuVendor::with_device_glob(&pattern);
        assert!(!vendor.init());
        assert!(vendor.last_error_string().contains("no TPU device nodes"));
    }

    #[test]
    fn init_discovers_chip_count_from_device_nodes() {
        let (_dir, pattern) = fake_device_tree(2);
        let mut vendor = TpuVendor::with_device_glob(&pattern);
        assert!(vendor.init());
        assert_eq!(vendor.chip_count(), 2);
    }

    #[test]
    fn enumeration_starts_worker_and_honors_mask() {
        let (_dir, pattern) = fake_device_tree(3);
        let mut vendor = TpuVendor::with_device_glob(&pattern);
        vendor.invocation_override = Some(ScriptInvocation::custom(vec![
            "sh".to_string(),
            "-c".to_string(),
            "printf '0 10 100 1.0000 chip1\\n1 20 100 2.0000 chip1\\n2 30 100 3.0000 chip1\\n'"
                .to_string(),
        ]));
        assert!(vendor.init());

        let mut devices = Vec::new();
        let mut mask = 0b101u64;
        assert!(vendor.get_device_handles(&mut devices, &mut mask));
        assert!(vendor.poller.is_some());
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].handle().index(), 0);
        assert_eq!(devices[1].handle().index(), 2);

        vendor.shutdown();
        assert_eq!(vendor.chip_count(), 0);
    }

    #[test]
    fn dynamic_info_is_a_snapshot_of_the_shared_table() {
        let (_dir, pattern) = fake_device_tree(1);
        let mut vendor = TpuVendor::with_device_glob(&pattern);
        assert!(vendor.init());
        vendor.shared.table.publish(
            0,
            ChipUsageData {
                name: "chip1".to_string(),
                device_id: 0,
                memory_usage: 5000,
                total_memory: 10000,
                duty_cycle_pct: 12.4,
            },
        );

        let mut device = GpuDevice::new(DeviceHandle::from_index(0));
        vendor.refresh_dynamic_info(&mut device);
        assert_eq!(device.dynamic_info.mem_util_rate, Some(50));
        assert_eq!(device.dynamic_info.gpu_util_rate, Some(12));
        assert_eq!(device.dynamic_info.total_memory, Some(10000));
        assert_eq!(device.dynamic_info.used_memory, Some(5000));
        assert_eq!(device.dynamic_info.free_memory, Some(5000));
    }

    #[test]
    fn dynamic_info_clamps_zero_total_memory() {
        let (_dir, pattern) = fake_device_tree(1);
        let mut vendor = TpuVendor::with_device_glob(&pattern);
        assert!(vendor.init());
        // Startup state: nothing published yet, all-zero slot.
        let mut device = GpuDevice::new(DeviceHandle::from_index(0));
        vendor.refresh_dynamic_info(&mut device);
        assert_eq!(device.dynamic_info.mem_util_rate, Some(0));
        assert_eq!(device.dynamic_info.total_memory, Some(0));
    }

    #[test]
    fn dynamic_info_goes_invalid_after_self_disable() {
        let (_dir, pattern) = fake_device_tree(1);
        let mut vendor = TpuVendor::with_device_glob(&pattern);
        assert!(vendor.init());
        let mut device = GpuDevice::new(DeviceHandle::from_index(0));

        // Simulate the worker's permanent disablement.
        vendor.shared.chip_count.store(0, Ordering::Release);
        device.dynamic_info.gpu_util_rate = Some(42);
        vendor.refresh_dynamic_info(&mut device);
        assert_eq!(device.dynamic_info, DynamicInfo::default());
    }

    #[test]
    fn static_info_names_chips_by_slot_and_family() {
        let (_dir, pattern) = fake_device_tree(1);
        let mut vendor = TpuVendor::with_device_glob(&pattern);
        assert!(vendor.init());

        let mut device = GpuDevice::new(DeviceHandle::from_index(0));
        vendor.populate_static_info(&mut device);
        assert_eq!(device.static_info.device_name.as_deref(), Some("TPU0"));

        vendor.shared.table.publish(
            0,
            ChipUsageData {
                name: "v5e".to_string(),
                device_id: 0,
                memory_usage: 0,
                total_memory: 0,
                duty_cycle_pct: 0.0,
            },
        );
        vendor.populate_static_info(&mut device);
        assert_eq!(device.static_info.device_name.as_deref(), Some("TPU0-v5e"));
    }

    #[test]
    fn shutdown_without_worker_is_idempotent() {
        let (_dir, pattern) = fake_device_tree(1);
        let mut vendor = TpuVendor::with_device_glob(&pattern);
        assert!(vendor.init());
        vendor.shutdown();
        vendor.shutdown();
        assert_eq!(vendor.chip_count(), 0);
    }
}
