//! Runtime binding of the NVIDIA management library.
//!
//! The library is opened with `dlopen` semantics and every entry point the
//! collectors need is resolved by hand, preferring versioned export names.
//! Only the declarations below are carried; the full vendor header is not
//! needed for the subset of calls this crate makes.

use std::env;
use std::ffi::{c_char, c_int, c_uint, c_ulonglong, c_void, OsStr, OsString};

use libloading::Library;
use thiserror::Error;

const PRIMARY_NVML_LIB: &str = "libnvidia-ml.so.1";
const NVML_FALLBACK_LIB: &str = "libnvidia-ml.so";

/// Overrides the candidate list entirely when set.
pub(crate) const NVML_LIB_PATH_ENV_VAR: &str = "GPUINFO_NVML_LIB_PATH";

/// Opaque device handle owned by the vendor library.
pub(crate) type NvmlDevice = *mut c_void;
/// `nvmlReturn_t`, stored as a plain int.
pub(crate) type NvmlReturn = c_int;

pub(crate) const NVML_SUCCESS: NvmlReturn = 0;
pub(crate) const NVML_ERROR_INSUFFICIENT_SIZE: NvmlReturn = 7;

// nvmlClockType_t
pub(crate) const NVML_CLOCK_GRAPHICS: c_uint = 0;
pub(crate) const NVML_CLOCK_SM: c_uint = 1;
pub(crate) const NVML_CLOCK_MEM: c_uint = 2;

// nvmlTemperatureSensors_t / nvmlTemperatureThresholds_t
pub(crate) const NVML_TEMPERATURE_GPU: c_uint = 0;
pub(crate) const NVML_TEMPERATURE_THRESHOLD_SHUTDOWN: c_uint = 0;
pub(crate) const NVML_TEMPERATURE_THRESHOLD_SLOWDOWN: c_uint = 1;

// nvmlPcieUtilCounter_t
pub(crate) const NVML_PCIE_UTIL_TX_BYTES: c_uint = 0;
pub(crate) const NVML_PCIE_UTIL_RX_BYTES: c_uint = 1;

/// Sentinel the library stores in 64-bit fields it cannot report.
pub(crate) const NVML_VALUE_NOT_AVAILABLE: u64 = u64::MAX;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct NvmlUtilization {
    pub gpu: c_uint,
    pub memory: c_uint,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct NvmlMemory {
    pub total: c_ulonglong,
    pub free: c_ulonglong,
    pub used: c_ulonglong,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct NvmlProcessInfo {
    pub pid: c_uint,
    pub used_gpu_memory: c_ulonglong,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct NvmlProcessUtilizationSample {
    pub pid: c_uint,
    pub time_stamp: c_ulonglong,
    pub sm_util: c_uint,
    pub mem_util: c_uint,
    pub enc_util: c_uint,
    pub dec_util: c_uint,
}

pub(crate) type InitFn = unsafe extern "C" fn() -> NvmlReturn;
pub(crate) type ShutdownFn = unsafe extern "C" fn() -> NvmlReturn;
pub(crate) type DeviceGetCountFn = unsafe extern "C" fn(*mut c_uint) -> NvmlReturn;
pub(crate) type DeviceGetHandleByIndexFn =
    unsafe extern "C" fn(c_uint, *mut NvmlDevice) -> NvmlReturn;
pub(crate) type ErrorStringFn = unsafe extern "C" fn(NvmlReturn) -> *const c_char;
pub(crate) type DeviceGetNameFn =
    unsafe extern "C" fn(NvmlDevice, *mut c_char, c_uint) -> NvmlReturn;
/// Plain scalar query: `fn(device, out)`.
pub(crate) type DeviceGetUintFn = unsafe extern "C" fn(NvmlDevice, *mut c_uint) -> NvmlReturn;
/// Scalar query with a selector: `fn(device, clock domain / sensor /
/// threshold / counter, out)`.
pub(crate) type DeviceGetSelectedUintFn =
    unsafe extern "C" fn(NvmlDevice, c_uint, *mut c_uint) -> NvmlReturn;
/// Codec utilization query: `fn(device, out rate, out sampling period)`.
pub(crate) type DeviceGetCodecUtilFn =
    unsafe extern "C" fn(NvmlDevice, *mut c_uint, *mut c_uint) -> NvmlReturn;
pub(crate) type DeviceGetUtilizationRatesFn =
    unsafe extern "C" fn(NvmlDevice, *mut NvmlUtilization) -> NvmlReturn;
pub(crate) type DeviceGetMemoryInfoFn =
    unsafe extern "C" fn(NvmlDevice, *mut NvmlMemory) -> NvmlReturn;
/// Running-process list query: `fn(device, in/out count, out infos)`.
pub(crate) type DeviceGetRunningProcessesFn =
    unsafe extern "C" fn(NvmlDevice, *mut c_uint, *mut NvmlProcessInfo) -> NvmlReturn;
pub(crate) type DeviceGetProcessUtilizationFn = unsafe extern "C" fn(
    NvmlDevice,
    *mut NvmlProcessUtilizationSample,
    *mut c_uint,
    c_ulonglong,
) -> NvmlReturn;

#[derive(Debug, Error)]
pub enum NvmlLoadError {
    #[error("no NVML library could be loaded (tried {tried:?}): {source}")]
    LibraryNotFound {
        tried: Vec<String>,
        source: libloading::Error,
    },
    #[error("NVML library is missing required symbol `{name}`")]
    MissingSymbol { name: &'static str },
}

/// Entry points resolved from the management library.
///
/// Constructed only after every required symbol resolved, so a partially
/// bound table is unreachable by construction; dropping the table unmaps
/// the library.
pub(crate) struct NvmlLib {
    pub init: InitFn,
    pub shutdown: ShutdownFn,
    pub device_get_count: DeviceGetCountFn,
    pub device_get_handle_by_index: DeviceGetHandleByIndexFn,
    pub error_string: ErrorStringFn,
    pub device_get_name: DeviceGetNameFn,
    pub device_get_max_pcie_link_generation: DeviceGetUintFn,
    pub device_get_max_pcie_link_width: DeviceGetUintFn,
    pub device_get_temperature_threshold: DeviceGetSelectedUintFn,
    pub device_get_clock_info: DeviceGetSelectedUintFn,
    pub device_get_max_clock_info: DeviceGetSelectedUintFn,
    pub device_get_utilization_rates: DeviceGetUtilizationRatesFn,
    pub device_get_memory_info: DeviceGetMemoryInfoFn,
    pub device_get_curr_pcie_link_generation: DeviceGetUintFn,
    pub device_get_curr_pcie_link_width: DeviceGetUintFn,
    pub device_get_pcie_throughput: DeviceGetSelectedUintFn,
    pub device_get_fan_speed: DeviceGetUintFn,
    pub device_get_temperature: DeviceGetSelectedUintFn,
    pub device_get_power_usage: DeviceGetUintFn,
    pub device_get_enforced_power_limit: DeviceGetUintFn,
    pub device_get_encoder_utilization: DeviceGetCodecUtilFn,
    pub device_get_decoder_utilization: DeviceGetCodecUtilFn,
    pub device_get_graphics_running_processes: DeviceGetRunningProcessesFn,
    pub device_get_compute_running_processes: DeviceGetRunningProcessesFn,
    /// Missing from older drivers; absence only disables the per-process
    /// utilization breakdown.
    pub device_get_process_utilization: Option<DeviceGetProcessUtilizationFn>,
    _lib: Library,
}

impl NvmlLib {
    /// Loads the first candidate library that opens and binds all required
    /// entry points.
    pub(crate) fn load() -> Result<Self, NvmlLoadError> {
        let mut candidates: Vec<OsString> = Vec::with_capacity(3);
        if let Some(path) = env::var_os(NVML_LIB_PATH_ENV_VAR) {
            candidates.push(path);
        }
        candidates.push(OsStr::new(PRIMARY_NVML_LIB).to_os_string());
        candidates.push(OsStr::new(NVML_FALLBACK_LIB).to_os_string());
        Self::load_from(&candidates)
    }

    pub(crate) fn load_from(candidates: &[OsString]) -> Result<Self, NvmlLoadError> {
        let mut last_err = None;
        for candidate in candidates {
            let candidate_display = candidate.to_string_lossy();
            tracing::info!("Loading NVML library from {}", candidate_display);
            // Safety: opening NVML runs its initializers, which the library
            // documents as safe to do from any thread.
            match unsafe { Library::new(candidate) } {
                Ok(lib) => return Self::bind(lib),
                Err(err) => {
                    tracing::debug!(error = %err, "Failed to load {}", candidate_display);
                    last_err = Some(err);
                }
            }
        }
        Err(NvmlLoadError::LibraryNotFound {
            tried: candidates
                .iter()
                .map(|c| c.to_string_lossy().into_owned())
                .collect(),
            source: last_err.unwrap_or(libloading::Error::DlOpenUnknown),
        })
    }

    /// Resolves every entry point out of `lib`. A missing required symbol
    /// returns early, dropping `lib` and thereby releasing the library
    /// handle together with all partially resolved state.
    fn bind(lib: Library) -> Result<Self, NvmlLoadError> {
        unsafe {
            Ok(NvmlLib {
                init: resolve(&lib, &["nvmlInit_v2", "nvmlInit"])?,
                shutdown: resolve(&lib, &["nvmlShutdown"])?,
                device_get_count: resolve(&lib, &["nvmlDeviceGetCount_v2", "nvmlDeviceGetCount"])?,
                device_get_handle_by_index: resolve(
                    &lib,
                    &["nvmlDeviceGetHandleByIndex_v2", "nvmlDeviceGetHandleByIndex"],
                )?,
                error_string: resolve(&lib, &["nvmlErrorString"])?,
                device_get_name: resolve(&lib, &["nvmlDeviceGetName"])?,
                device_get_max_pcie_link_generation: resolve(
                    &lib,
                    &["nvmlDeviceGetMaxPcieLinkGeneration"],
                )?,
                device_get_max_pcie_link_width: resolve(&lib, &["nvmlDeviceGetMaxPcieLinkWidth"])?,
                device_get_temperature_threshold: resolve(
                    &lib,
                    &["nvmlDeviceGetTemperatureThreshold"],
                )?,
                device_get_clock_info: resolve(&lib, &["nvmlDeviceGetClockInfo"])?,
                device_get_max_clock_info: resolve(&lib, &["nvmlDeviceGetMaxClockInfo"])?,
                device_get_utilization_rates: resolve(&lib, &["nvmlDeviceGetUtilizationRates"])?,
                device_get_memory_info: resolve(&lib, &["nvmlDeviceGetMemoryInfo"])?,
                device_get_curr_pcie_link_generation: resolve(
                    &lib,
                    &["nvmlDeviceGetCurrPcieLinkGeneration"],
                )?,
                device_get_curr_pcie_link_width: resolve(
                    &lib,
                    &["nvmlDeviceGetCurrPcieLinkWidth"],
                )?,
                device_get_pcie_throughput: resolve(&lib, &["nvmlDeviceGetPcieThroughput"])?,
                device_get_fan_speed: resolve(&lib, &["nvmlDeviceGetFanSpeed"])?,
                device_get_temperature: resolve(&lib, &["nvmlDeviceGetTemperature"])?,
                device_get_power_usage: resolve(&lib, &["nvmlDeviceGetPowerUsage"])?,
                device_get_enforced_power_limit: resolve(
                    &lib,
                    &["nvmlDeviceGetEnforcedPowerLimit"],
                )?,
                device_get_encoder_utilization: resolve(
                    &lib,
                    &["nvmlDeviceGetEncoderUtilization"],
                )?,
                device_get_decoder_utilization: resolve(
                    &lib,
                    &["nvmlDeviceGetDecoderUtilization"],
                )?,
                device_get_graphics_running_processes: resolve(
                    &lib,
                    &["nvmlDeviceGetGraphicsRunningProcesses"],
                )?,
                device_get_compute_running_processes: resolve(
                    &lib,
                    &["nvmlDeviceGetComputeRunningProcesses"],
                )?,
                device_get_process_utilization: resolve(&lib, &["nvmlDeviceGetProcessUtilization"])
                    .ok(),
                _lib: lib,
            })
        }
    }
}

/// Resolves the first export matching one of `names`, versioned names
/// first. The fn pointer is copied out of the symbol; the caller keeps the
/// `Library` alive for as long as the pointer is used.
unsafe fn resolve<T: Copy>(lib: &Library, names: &[&'static str]) -> Result<T, NvmlLoadError> {
    for name in names {
        if let Ok(symbol) = lib.get::<T>(name.as_bytes()) {
            return Ok(*symbol);
        }
    }
    Err(NvmlLoadError::MissingSymbol {
        name: names.last().copied().unwrap_or("?"),
    })
}
