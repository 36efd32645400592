//! NVIDIA backend: binds the management library at runtime and answers the
//! vendor contract with plain foreign calls on the caller's thread.

pub(crate) mod nvml;

use std::borrow::Cow;
use std::ffi::{c_uint, CStr};
use std::ptr;

use gpuinfo_types::{DynamicInfo, GpuProcess, StaticInfo, WorkloadKind};

use crate::device::{DeviceHandle, GpuDevice};
use crate::vendor::{take_mask_bit, GpuVendor};
use nvml::{
    NvmlDevice, NvmlLib, NvmlMemory, NvmlProcessInfo, NvmlProcessUtilizationSample, NvmlReturn,
    NvmlUtilization, NVML_CLOCK_GRAPHICS, NVML_CLOCK_MEM, NVML_CLOCK_SM,
    NVML_ERROR_INSUFFICIENT_SIZE, NVML_PCIE_UTIL_RX_BYTES, NVML_PCIE_UTIL_TX_BYTES, NVML_SUCCESS,
    NVML_TEMPERATURE_GPU, NVML_TEMPERATURE_THRESHOLD_SHUTDOWN,
    NVML_TEMPERATURE_THRESHOLD_SLOWDOWN, NVML_VALUE_NOT_AVAILABLE,
};

/// `nvmlDeviceGetName` buffer size, enough for the v2 name width.
const MAX_DEVICE_NAME: usize = 96;

/// Linear growth increment for the running-process scratch buffer. The
/// short-read result code does not report the exact size for this call
/// path, so the buffer grows by fixed steps until the vendor accepts it.
const PROCESS_BUFFER_GROWTH: usize = 64;

const NOT_INITIALIZED: &str =
    "The NVIDIA extraction has not been initialized, call GpuVendor::init first";
const NO_ERROR_FACILITY: &str =
    "An unanticipated error occurred while accessing NVIDIA GPU information";

pub struct NvidiaVendor {
    lib: Option<NvmlLib>,
    last_status: NvmlReturn,
    local_error: Option<String>,
    /// Running-process scratch, shared across devices and polls; grown
    /// monotonically, cleared logically by overwriting.
    process_scratch: Vec<NvmlProcessInfo>,
    /// Utilization-sample scratch, same reuse policy.
    sample_scratch: Vec<NvmlProcessUtilizationSample>,
}

impl NvidiaVendor {
    pub fn new() -> Self {
        Self {
            lib: None,
            last_status: NVML_SUCCESS,
            local_error: Some(NOT_INITIALIZED.to_string()),
            process_scratch: Vec::new(),
            sample_scratch: Vec::new(),
        }
    }

    /// Applies incremental utilization samples to the freshly rebuilt
    /// process list, then advances the device watermark.
    fn sample_process_utilization(&mut self, device: &mut GpuDevice) {
        let Some(lib) = self.lib.as_ref() else {
            return;
        };
        let Some(get_process_utilization) = lib.device_get_process_utilization else {
            // Older drivers: the breakdown simply stays unavailable.
            return;
        };
        let handle = device.handle.as_ptr();
        let watermark = device.last_utilization_timestamp;

        // Null probe: the vendor reports the exact sample count newer than
        // `watermark` via the short-read error.
        let mut sample_count: c_uint = 0;
        let status = unsafe {
            get_process_utilization(handle, ptr::null_mut(), &mut sample_count, watermark)
        };
        if status != NVML_ERROR_INSUFFICIENT_SIZE {
            return;
        }
        if self.sample_scratch.len() < sample_count as usize {
            self.sample_scratch
                .resize(sample_count as usize, NvmlProcessUtilizationSample::default());
        }

        let mut returned = self.sample_scratch.len() as c_uint;
        let status = unsafe {
            get_process_utilization(
                handle,
                self.sample_scratch.as_mut_ptr(),
                &mut returned,
                watermark,
            )
        };
        if status != NVML_SUCCESS {
            self.last_status = status;
            return;
        }
        let returned = (returned as usize).min(self.sample_scratch.len());
        device.last_utilization_timestamp = correlate_samples(
            &mut device.processes,
            &self.sample_scratch[..returned],
            watermark,
        );
    }
}

impl Default for NvidiaVendor {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuVendor for NvidiaVendor {
    fn name(&self) -> &'static str {
        "NVIDIA"
    }

    fn init(&mut self) -> bool {
        let lib = match NvmlLib::load() {
            Ok(lib) => lib,
            Err(err) => {
                self.local_error = Some(err.to_string());
                return false;
            }
        };
        // Safety: all required entry points resolved; nvmlInit takes no
        // arguments and is documented thread-safe.
        self.last_status = unsafe { (lib.init)() };
        self.lib = Some(lib);
        self.local_error = None;
        self.last_status == NVML_SUCCESS
    }

    fn shutdown(&mut self) {
        if let Some(lib) = self.lib.take() {
            unsafe {
                (lib.shutdown)();
            }
            self.local_error = Some(NOT_INITIALIZED.to_string());
        }
        self.process_scratch = Vec::new();
        self.sample_scratch = Vec::new();
    }

    fn last_error_string(&self) -> Cow<'_, str> {
        if let Some(message) = &self.local_error {
            return Cow::Borrowed(message.as_str());
        }
        if let Some(lib) = &self.lib {
            let message = unsafe { (lib.error_string)(self.last_status) };
            if !message.is_null() {
                // Safety: nvmlErrorString returns a static nul-terminated
                // string owned by the library.
                return unsafe { CStr::from_ptr(message) }.to_string_lossy();
            }
        }
        Cow::Borrowed(NO_ERROR_FACILITY)
    }

    fn get_device_handles(
        &mut self,
        devices: &mut Vec<GpuDevice>,
        selection_mask: &mut u64,
    ) -> bool {
        let Some(lib) = self.lib.as_ref() else {
            return false;
        };

        let mut device_count: c_uint = 0;
        self.last_status = unsafe { (lib.device_get_count)(&mut device_count) };
        if self.last_status != NVML_SUCCESS {
            return false;
        }

        devices.reserve(device_count as usize);
        for index in 0..device_count {
            if !take_mask_bit(selection_mask) {
                continue;
            }
            let mut handle: NvmlDevice = ptr::null_mut();
            self.last_status = unsafe { (lib.device_get_handle_by_index)(index, &mut handle) };
            if self.last_status != NVML_SUCCESS {
                // One unresolvable index does not abort the rest.
                tracing::warn!(index, status = self.last_status, "skipping NVML device");
                continue;
            }
            devices.push(GpuDevice::new(DeviceHandle::from_ptr(handle)));
        }
        true
    }

    fn populate_static_info(&mut self, device: &mut GpuDevice) {
        let Some(lib) = self.lib.as_ref() else {
            return;
        };
        let handle = device.handle.as_ptr();
        let info = &mut device.static_info;
        *info = StaticInfo::default();

        let mut name_buf = [0u8; MAX_DEVICE_NAME];
        self.last_status = unsafe {
            (lib.device_get_name)(handle, name_buf.as_mut_ptr().cast(), MAX_DEVICE_NAME as c_uint)
        };
        if self.last_status == NVML_SUCCESS {
            info.device_name = CStr::from_bytes_until_nul(&name_buf)
                .ok()
                .map(|name| name.to_string_lossy().into_owned());
        }

        info.max_pcie_gen = query_u32(
            &mut self.last_status,
            lib.device_get_max_pcie_link_generation,
            handle,
        );
        info.max_pcie_link_width = query_u32(
            &mut self.last_status,
            lib.device_get_max_pcie_link_width,
            handle,
        );
        info.temperature_shutdown_threshold = query_selected_u32(
            &mut self.last_status,
            lib.device_get_temperature_threshold,
            handle,
            NVML_TEMPERATURE_THRESHOLD_SHUTDOWN,
        );
        info.temperature_slowdown_threshold = query_selected_u32(
            &mut self.last_status,
            lib.device_get_temperature_threshold,
            handle,
            NVML_TEMPERATURE_THRESHOLD_SLOWDOWN,
        );
    }

    fn refresh_dynamic_info(&mut self, device: &mut GpuDevice) {
        let Some(lib) = self.lib.as_ref() else {
            return;
        };
        let handle = device.handle.as_ptr();
        let info = &mut device.dynamic_info;
        *info = DynamicInfo::default();

        // Effective GPU speed is whichever of the graphics and SM domains
        // runs faster; the max clock must come from the same domain so the
        // current/max pair stays consistent.
        let graphics_clock = query_selected_u32(
            &mut self.last_status,
            lib.device_get_clock_info,
            handle,
            NVML_CLOCK_GRAPHICS,
        );
        let sm_clock = query_selected_u32(
            &mut self.last_status,
            lib.device_get_clock_info,
            handle,
            NVML_CLOCK_SM,
        );
        let gpu_clock_domain = elect_clock_domain(graphics_clock, sm_clock);
        info.gpu_clock_speed = if gpu_clock_domain == NVML_CLOCK_SM {
            sm_clock
        } else {
            graphics_clock
        };
        info.gpu_clock_speed_max = query_selected_u32(
            &mut self.last_status,
            lib.device_get_max_clock_info,
            handle,
            gpu_clock_domain,
        );

        info.mem_clock_speed = query_selected_u32(
            &mut self.last_status,
            lib.device_get_clock_info,
            handle,
            NVML_CLOCK_MEM,
        );
        info.mem_clock_speed_max = query_selected_u32(
            &mut self.last_status,
            lib.device_get_max_clock_info,
            handle,
            NVML_CLOCK_MEM,
        );

        let mut utilization = NvmlUtilization::default();
        self.last_status =
            unsafe { (lib.device_get_utilization_rates)(handle, &mut utilization) };
        if self.last_status == NVML_SUCCESS {
            info.gpu_util_rate = Some(utilization.gpu);
        }

        let mut rate: c_uint = 0;
        let mut sampling_period: c_uint = 0;
        self.last_status =
            unsafe { (lib.device_get_encoder_utilization)(handle, &mut rate, &mut sampling_period) };
        if self.last_status == NVML_SUCCESS {
            info.encoder_rate = Some(rate);
        }
        self.last_status =
            unsafe { (lib.device_get_decoder_utilization)(handle, &mut rate, &mut sampling_period) };
        if self.last_status == NVML_SUCCESS {
            info.decoder_rate = Some(rate);
        }

        let mut memory = NvmlMemory::default();
        self.last_status = unsafe { (lib.device_get_memory_info)(handle, &mut memory) };
        if self.last_status == NVML_SUCCESS {
            info.total_memory = Some(memory.total);
            info.used_memory = Some(memory.used);
            info.free_memory = Some(memory.free);
            info.mem_util_rate = Some(mem_util_rate(&memory));
        }

        info.pcie_link_gen = query_u32(
            &mut self.last_status,
            lib.device_get_curr_pcie_link_generation,
            handle,
        );
        info.pcie_link_width = query_u32(
            &mut self.last_status,
            lib.device_get_curr_pcie_link_width,
            handle,
        );
        info.pcie_rx = query_selected_u32(
            &mut self.last_status,
            lib.device_get_pcie_throughput,
            handle,
            NVML_PCIE_UTIL_RX_BYTES,
        );
        info.pcie_tx = query_selected_u32(
            &mut self.last_status,
            lib.device_get_pcie_throughput,
            handle,
            NVML_PCIE_UTIL_TX_BYTES,
        );
        info.fan_speed = query_u32(&mut self.last_status, lib.device_get_fan_speed, handle);
        info.gpu_temp = query_selected_u32(
            &mut self.last_status,
            lib.device_get_temperature,
            handle,
            NVML_TEMPERATURE_GPU,
        );
        info.power_draw = query_u32(&mut self.last_status, lib.device_get_power_usage, handle);
        info.power_draw_max = query_u32(
            &mut self.last_status,
            lib.device_get_enforced_power_limit,
            handle,
        );
    }

    fn refresh_running_processes(&mut self, device: &mut GpuDevice) {
        device.processes.clear();
        let Some(lib) = self.lib.as_ref() else {
            return;
        };
        let handle = device.handle.as_ptr();

        let graphics_count = match query_processes_with_growth(
            &mut self.process_scratch,
            0,
            |infos, count| unsafe {
                (lib.device_get_graphics_running_processes)(handle, count, infos)
            },
        ) {
            Ok(count) => count,
            Err(status) => {
                self.last_status = status;
                0
            }
        };
        // Compute-context results land after the graphics-context results in
        // the same backing storage.
        let compute_count = match query_processes_with_growth(
            &mut self.process_scratch,
            graphics_count,
            |infos, count| unsafe {
                (lib.device_get_compute_running_processes)(handle, count, infos)
            },
        ) {
            Ok(count) => count,
            Err(status) => {
                self.last_status = status;
                0
            }
        };

        let total = graphics_count + compute_count;
        device.processes.reserve(total);
        for (index, raw) in self.process_scratch[..total].iter().enumerate() {
            let kind = if index < graphics_count {
                WorkloadKind::Graphics
            } else {
                WorkloadKind::Compute
            };
            let mut entry = GpuProcess::new(raw.pid, kind);
            if raw.used_gpu_memory != NVML_VALUE_NOT_AVAILABLE {
                entry.gpu_memory_bytes = Some(raw.used_gpu_memory);
            }
            device.processes.push(entry);
        }

        if !device.processes.is_empty() {
            self.sample_process_utilization(device);
        }
    }
}

fn query_u32(
    last_status: &mut NvmlReturn,
    query: nvml::DeviceGetUintFn,
    device: NvmlDevice,
) -> Option<u32> {
    let mut value: c_uint = 0;
    *last_status = unsafe { query(device, &mut value) };
    (*last_status == NVML_SUCCESS).then_some(value)
}

fn query_selected_u32(
    last_status: &mut NvmlReturn,
    query: nvml::DeviceGetSelectedUintFn,
    device: NvmlDevice,
    selector: c_uint,
) -> Option<u32> {
    let mut value: c_uint = 0;
    *last_status = unsafe { query(device, selector, &mut value) };
    (*last_status == NVML_SUCCESS).then_some(value)
}

/// Picks the clock domain whose current reading is the device's effective
/// speed: the faster of graphics and SM when both answered, SM when only it
/// answered, graphics otherwise.
fn elect_clock_domain(graphics_clock: Option<u32>, sm_clock: Option<u32>) -> c_uint {
    match (graphics_clock, sm_clock) {
        (Some(graphics), Some(sm)) if graphics < sm => NVML_CLOCK_SM,
        (None, Some(_)) => NVML_CLOCK_SM,
        _ => NVML_CLOCK_GRAPHICS,
    }
}

/// The memory-info call guarantees a non-zero total on success.
fn mem_util_rate(memory: &NvmlMemory) -> u32 {
    (memory.used * 100 / memory.total) as u32
}

/// Queries one running-process category into `scratch` starting at
/// `offset`, growing the buffer by [`PROCESS_BUFFER_GROWTH`] and retrying
/// for as long as the vendor reports a short read. This call path reports
/// no exact required size, so the retries are unbounded. An allocation
/// failure aborts the process (there is no safe partial state to continue
/// from).
fn query_processes_with_growth(
    scratch: &mut Vec<NvmlProcessInfo>,
    offset: usize,
    mut query: impl FnMut(*mut NvmlProcessInfo, &mut c_uint) -> NvmlReturn,
) -> Result<usize, NvmlReturn> {
    loop {
        let mut count = (scratch.len() - offset) as c_uint;
        // Safety: `offset <= scratch.len()`, so the pointer is in-bounds or
        // one past the end; the callee writes at most `count` entries.
        let infos = unsafe { scratch.as_mut_ptr().add(offset) };
        match query(infos, &mut count) {
            NVML_SUCCESS => return Ok(count as usize),
            NVML_ERROR_INSUFFICIENT_SIZE => {
                scratch.resize(scratch.len() + PROCESS_BUFFER_GROWTH, NvmlProcessInfo::default());
            }
            status => return Err(status),
        }
    }
}

/// Reconciles incremental utilization samples against the discovery list.
///
/// A sample is accepted only when its PID matches a discovered process,
/// every percentage field is plausible (≤ 100) and its timestamp is
/// strictly newer than the watermark that was in effect when the request
/// was issued. Returns the new watermark: the largest timestamp among
/// accepted samples, never less than `watermark`.
pub(crate) fn correlate_samples(
    processes: &mut [GpuProcess],
    samples: &[NvmlProcessUtilizationSample],
    watermark: u64,
) -> u64 {
    let mut newest = watermark;
    for sample in samples {
        // Known vendor inconsistency: samples can reference PIDs that are
        // not running, carry percentages above 100 or repeat timestamps we
        // already consumed. All of those are discarded.
        if sample.sm_util > 100 || sample.enc_util > 100 || sample.dec_util > 100 {
            continue;
        }
        if sample.time_stamp <= watermark {
            continue;
        }
        let Some(process) = processes.iter_mut().find(|p| p.pid == sample.pid) else {
            continue;
        };
        process.sm_util = Some(sample.sm_util);
        process.enc_util = Some(sample.enc_util);
        process.dec_util = Some(sample.dec_util);
        newest = newest.max(sample.time_stamp);
    }
    newest
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pid: u32, ts: u64, sm: u32, enc: u32, dec: u32) -> NvmlProcessUtilizationSample {
        NvmlProcessUtilizationSample {
            pid,
            time_stamp: ts,
            sm_util: sm,
            mem_util: 0,
            enc_util: enc,
            dec_util: dec,
        }
    }

    #[test]
    fn growth_loop_handles_zero_processes() {
        let mut scratch = Vec::new();
        let count = query_processes_with_growth(&mut scratch, 0, |_, count| {
            *count = 0;
            NVML_SUCCESS
        })
        .expect("zero processes is a success");
        assert_eq!(count, 0);
    }

    #[test]
    fn growth_loop_terminates_with_capacity_at_least_true_count() {
        for true_count in [1usize, 63, 64, 130] {
            let mut scratch = Vec::new();
            let counted = query_processes_with_growth(&mut scratch, 0, |infos, count| {
                if (*count as usize) < true_count {
                    return NVML_ERROR_INSUFFICIENT_SIZE;
                }
                for pid in 0..true_count {
                    // Safety: the buffer holds at least `true_count` slots.
                    unsafe {
                        *infos.add(pid) = NvmlProcessInfo {
                            pid: pid as c_uint,
                            used_gpu_memory: 1,
                        };
                    }
                }
                *count = true_count as c_uint;
                NVML_SUCCESS
            })
            .expect("growth loop must converge");
            assert_eq!(counted, true_count);
            assert!(scratch.len() >= true_count);
        }
    }

    #[test]
    fn growth_loop_writes_second_category_after_first() {
        let mut scratch = Vec::new();
        let graphics = query_processes_with_growth(&mut scratch, 0, |infos, count| {
            if (*count as usize) < 2 {
                return NVML_ERROR_INSUFFICIENT_SIZE;
            }
            unsafe {
                *infos = NvmlProcessInfo {
                    pid: 10,
                    used_gpu_memory: 1,
                };
                *infos.add(1) = NvmlProcessInfo {
                    pid: 11,
                    used_gpu_memory: 1,
                };
            }
            *count = 2;
            NVML_SUCCESS
        })
        .expect("graphics query");
        let compute = query_processes_with_growth(&mut scratch, graphics, |infos, count| {
            if (*count as usize) < 1 {
                return NVML_ERROR_INSUFFICIENT_SIZE;
            }
            unsafe {
                *infos = NvmlProcessInfo {
                    pid: 20,
                    used_gpu_memory: 2,
                };
            }
            *count = 1;
            NVML_SUCCESS
        })
        .expect("compute query");

        assert_eq!((graphics, compute), (2, 1));
        let pids: Vec<u32> = scratch[..3].iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![10, 11, 20]);
    }

    #[test]
    fn growth_loop_passes_vendor_errors_through() {
        let mut scratch = Vec::new();
        let result = query_processes_with_growth(&mut scratch, 0, |_, _| 999);
        assert_eq!(result, Err(999));
    }

    #[test]
    fn correlate_accepts_matching_fresh_sample() {
        let mut processes = vec![GpuProcess::new(42, WorkloadKind::Compute)];
        let samples = [sample(42, 100, 55, 10, 20)];
        let new_watermark = correlate_samples(&mut processes, &samples, 0);
        assert_eq!(new_watermark, 100);
        assert_eq!(processes[0].sm_util, Some(55));
        assert_eq!(processes[0].enc_util, Some(10));
        assert_eq!(processes[0].dec_util, Some(20));
    }

    #[test]
    fn correlate_rejects_unmatched_pid_and_keeps_watermark() {
        let mut processes = vec![GpuProcess::new(1, WorkloadKind::Graphics)];
        let samples = [sample(999, 500, 10, 0, 0)];
        assert_eq!(correlate_samples(&mut processes, &samples, 7), 7);
        assert_eq!(processes[0].sm_util, None);
    }

    #[test]
    fn correlate_rejects_percentages_above_100() {
        let mut processes = vec![GpuProcess::new(1, WorkloadKind::Compute)];
        for bad in [
            sample(1, 50, 101, 0, 0),
            sample(1, 50, 0, 101, 0),
            sample(1, 50, 0, 0, 101),
        ] {
            assert_eq!(correlate_samples(&mut processes, &[bad], 10), 10);
            assert_eq!(processes[0].sm_util, None);
        }
    }

    #[test]
    fn correlate_rejects_stale_timestamps() {
        let mut processes = vec![GpuProcess::new(1, WorkloadKind::Compute)];
        // Equal to the watermark is stale too: acceptance is strictly-newer.
        let samples = [sample(1, 10, 30, 0, 0)];
        assert_eq!(correlate_samples(&mut processes, &samples, 10), 10);
        assert_eq!(processes[0].sm_util, None);
    }

    #[test]
    fn watermark_is_non_decreasing_across_polls() {
        let mut processes = vec![GpuProcess::new(1, WorkloadKind::Compute)];
        let mut watermark = 0;
        for (ts, expected) in [(5u64, 5u64), (3, 5), (9, 9), (9, 9)] {
            watermark = correlate_samples(&mut processes, &[sample(1, ts, 1, 0, 0)], watermark);
            assert_eq!(watermark, expected);
        }
    }

    #[test]
    fn watermark_never_advances_past_rejected_samples() {
        let mut processes = vec![GpuProcess::new(1, WorkloadKind::Compute)];
        let samples = [
            sample(1, 100, 40, 0, 0),   // accepted
            sample(999, 200, 10, 0, 0), // unmatched PID
            sample(1, 300, 120, 0, 0),  // implausible percentage
        ];
        assert_eq!(correlate_samples(&mut processes, &samples, 0), 100);
    }

    #[test]
    fn clock_domain_election_prefers_faster_domain() {
        assert_eq!(elect_clock_domain(Some(1000), Some(1200)), NVML_CLOCK_SM);
        assert_eq!(
            elect_clock_domain(Some(1200), Some(1000)),
            NVML_CLOCK_GRAPHICS
        );
        assert_eq!(
            elect_clock_domain(Some(1000), Some(1000)),
            NVML_CLOCK_GRAPHICS
        );
        assert_eq!(elect_clock_domain(None, Some(800)), NVML_CLOCK_SM);
        assert_eq!(elect_clock_domain(Some(800), None), NVML_CLOCK_GRAPHICS);
        assert_eq!(elect_clock_domain(None, None), NVML_CLOCK_GRAPHICS);
    }

    #[test]
    fn memory_utilization_is_derived_from_used_and_total() {
        let memory = NvmlMemory {
            total: 10000,
            free: 5000,
            used: 5000,
        };
        assert_eq!(mem_util_rate(&memory), 50);
    }

    #[test]
    fn uninitialized_vendor_reports_explanatory_error() {
        let vendor = NvidiaVendor::new();
        assert!(vendor.last_error_string().contains("not been initialized"));
    }
}
