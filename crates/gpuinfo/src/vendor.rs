//! The vendor contract and the registry that composes vendor backends.

use std::borrow::Cow;

use crate::device::{GpuDevice, VendorId};

/// The capability set every vendor family implements exactly once.
///
/// All populate/refresh operations side-effect the device's records in
/// place; a query that fails leaves its field `None` and is never reported
/// through a return code. Backends must tolerate being polled repeatedly and
/// may not keep per-call mutable state across calls beyond the device's
/// utilization watermark.
pub trait GpuVendor {
    /// Short vendor family name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Binds the vendor's data source. On `false`, [`last_error_string`]
    /// explains why and the backend must be discarded.
    ///
    /// [`last_error_string`]: GpuVendor::last_error_string
    fn init(&mut self) -> bool;

    /// Releases library handles, joins any worker thread and drops owned
    /// buffer storage. Idempotent.
    fn shutdown(&mut self);

    /// Human-readable description of the most recent failure.
    fn last_error_string(&self) -> Cow<'_, str>;

    /// Appends one owned device per selected, resolvable native index to
    /// `devices`.
    ///
    /// One bit of `selection_mask` is consumed per native index whether or
    /// not that index is selected, so a single mask spans the concatenated
    /// device lists of several vendors. A vendor reporting zero devices is a
    /// success with nothing appended. A handle-resolution failure skips that
    /// index without aborting enumeration.
    fn get_device_handles(&mut self, devices: &mut Vec<GpuDevice>, selection_mask: &mut u64) -> bool;

    /// Fills `device.static_info`, once per session.
    fn populate_static_info(&mut self, device: &mut GpuDevice);

    /// Fills `device.dynamic_info`, once per poll.
    fn refresh_dynamic_info(&mut self, device: &mut GpuDevice);

    /// Rebuilds `device.processes`, once per poll.
    fn refresh_running_processes(&mut self, device: &mut GpuDevice);
}

/// Consumes the low bit of the enumeration mask.
///
/// Every native index consumes a bit, selected or not, so mask positions
/// stay aligned with native device indices.
pub(crate) fn take_mask_bit(mask: &mut u64) -> bool {
    let selected = *mask & 1 == 1;
    *mask >>= 1;
    selected
}

/// Process-scoped composition of vendor backends.
///
/// Built once at startup; backends whose `init` fails are dropped here and
/// never reachable afterwards. All collector-facing operations dispatch
/// through the registry so callers stay vendor-agnostic.
pub struct VendorRegistry {
    vendors: Vec<Box<dyn GpuVendor>>,
}

impl VendorRegistry {
    pub fn new() -> Self {
        Self {
            vendors: Vec::new(),
        }
    }

    /// Registry preloaded with the vendor backends built into this crate.
    pub fn with_default_vendors() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(crate::nvidia::NvidiaVendor::new()));
        registry.register(Box::new(crate::tpu::TpuVendor::new()));
        registry
    }

    /// Initializes `vendor` and keeps it if that succeeds. A load failure is
    /// non-fatal: the vendor is simply absent from the registry and other
    /// vendors are unaffected.
    pub fn register(&mut self, mut vendor: Box<dyn GpuVendor>) -> bool {
        if vendor.init() {
            tracing::info!(vendor = vendor.name(), "vendor backend initialized");
            self.vendors.push(vendor);
            true
        } else {
            tracing::info!(
                vendor = vendor.name(),
                error = %vendor.last_error_string(),
                "vendor backend unavailable"
            );
            false
        }
    }

    pub fn len(&self) -> usize {
        self.vendors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vendors.is_empty()
    }

    pub fn vendor_name(&self, id: VendorId) -> &'static str {
        self.vendors[id.0].name()
    }

    /// Enumerates every registered vendor's devices into one list.
    ///
    /// Composition is plain concatenation: each vendor appends in resolution
    /// order and consumes mask bits for its own native indices.
    pub fn get_device_handles(&mut self, selection_mask: u64) -> Vec<GpuDevice> {
        let mut mask = selection_mask;
        let mut devices = Vec::new();
        for (index, vendor) in self.vendors.iter_mut().enumerate() {
            let first_new = devices.len();
            if !vendor.get_device_handles(&mut devices, &mut mask) {
                tracing::warn!(
                    vendor = vendor.name(),
                    error = %vendor.last_error_string(),
                    "device enumeration failed"
                );
            }
            for device in &mut devices[first_new..] {
                device.vendor = VendorId(index);
            }
        }
        devices
    }

    pub fn populate_static_info(&mut self, device: &mut GpuDevice) {
        self.vendors[device.vendor.0].populate_static_info(device);
    }

    pub fn refresh_dynamic_info(&mut self, device: &mut GpuDevice) {
        self.vendors[device.vendor.0].refresh_dynamic_info(device);
    }

    pub fn refresh_running_processes(&mut self, device: &mut GpuDevice) {
        self.vendors[device.vendor.0].refresh_running_processes(device);
    }

    /// Shuts every backend down and empties the registry.
    pub fn shutdown(&mut self) {
        for vendor in &mut self.vendors {
            vendor.shutdown();
        }
        self.vendors.clear();
    }
}

impl Default for VendorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VendorRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
