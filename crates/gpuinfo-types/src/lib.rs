//! Shared device telemetry type definitions
//!
//! This crate contains the record types exchanged between the extraction
//! core and the components that display collected metrics. Every attribute
//! that depends on a vendor query is an `Option`: `None` means the
//! vendor/driver/runtime combination could not supply that field during the
//! last populate/refresh pass, which consumers must treat as "unavailable",
//! never as zero.

/// Context a process was found running under on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    Graphics,
    Compute,
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Device attributes expected to stay constant for the process lifetime.
///
/// Populated once per session by `populate_static_info`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticInfo {
    /// Marketing name reported by the vendor
    pub device_name: Option<String>,
    /// Highest PCIe generation the device supports
    pub max_pcie_gen: Option<u32>,
    /// Widest PCIe link the device supports, in lanes
    pub max_pcie_link_width: Option<u32>,
    // °C
    pub temperature_shutdown_threshold: Option<u32>,
    // °C
    pub temperature_slowdown_threshold: Option<u32>,
    /// Whether the device shares system memory with the host CPU
    pub integrated_graphics: bool,
}

/// Device attributes expected to change on every poll.
///
/// Rebuilt from a `Default` (all-`None`) state by each call to
/// `refresh_dynamic_info`; a query that fails this round leaves its field
/// `None` and never resurrects a stale value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicInfo {
    // MHz
    pub gpu_clock_speed: Option<u32>,
    // MHz
    pub gpu_clock_speed_max: Option<u32>,
    // MHz
    pub mem_clock_speed: Option<u32>,
    // MHz
    pub mem_clock_speed_max: Option<u32>,
    // %
    pub gpu_util_rate: Option<u32>,
    // %
    pub mem_util_rate: Option<u32>,
    // %
    pub encoder_rate: Option<u32>,
    // %
    pub decoder_rate: Option<u32>,
    // bytes
    pub total_memory: Option<u64>,
    // bytes
    pub used_memory: Option<u64>,
    // bytes
    pub free_memory: Option<u64>,
    /// PCIe generation currently in use
    pub pcie_link_gen: Option<u32>,
    /// PCIe link width currently in use, in lanes
    pub pcie_link_width: Option<u32>,
    // KiB/s
    pub pcie_rx: Option<u32>,
    // KiB/s
    pub pcie_tx: Option<u32>,
    // %
    pub fan_speed: Option<u32>,
    // °C
    pub gpu_temp: Option<u32>,
    // mW
    pub power_draw: Option<u32>,
    // mW
    pub power_draw_max: Option<u32>,
    /// Whether encode and decode workloads share the same hardware unit
    pub encode_decode_shared: bool,
}

/// One process observed running on a device during the last poll.
///
/// The per-device process list is rebuilt wholesale every poll: PIDs are not
/// guaranteed to keep the same array index from one poll to the next, so
/// entries are never patched in place across polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuProcess {
    pub pid: u32,
    pub kind: WorkloadKind,
    // bytes
    pub gpu_memory_bytes: Option<u64>,
    /// Compute/SM utilization, %
    pub sm_util: Option<u32>,
    /// Video encoder utilization, %
    pub enc_util: Option<u32>,
    /// Video decoder utilization, %
    pub dec_util: Option<u32>,
}

impl GpuProcess {
    pub fn new(pid: u32, kind: WorkloadKind) -> Self {
        Self {
            pid,
            kind,
            gpu_memory_bytes: None,
            sm_util: None,
            enc_util: None,
            dec_util: None,
        }
    }
}
