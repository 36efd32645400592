//! Device records owned by the external collector.

use std::ffi::c_void;

use gpuinfo_types::{DynamicInfo, GpuProcess, StaticInfo};

/// Index of a vendor backend within the [`VendorRegistry`] that produced a
/// device.
///
/// [`VendorRegistry`]: crate::vendor::VendorRegistry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorId(pub(crate) usize);

impl VendorId {
    /// Placeholder carried by freshly enumerated devices until the registry
    /// attaches them to the vendor that produced them.
    pub(crate) const UNATTACHED: VendorId = VendorId(usize::MAX);
}

/// Opaque vendor-specific device identifier.
///
/// Library-backed vendors store a native handle owned by the vendor library;
/// filesystem-discovered vendors store a synthetic slot index. Only the
/// vendor that minted a handle may interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle(u64);

impl DeviceHandle {
    pub fn from_ptr(ptr: *mut c_void) -> Self {
        Self(ptr as u64)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub fn from_index(index: usize) -> Self {
        Self(index as u64)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One accelerator device and everything the last polls learned about it.
///
/// The records are refreshed in place by the owning vendor backend; errors
/// surface only as `None` fields, never as return codes.
#[derive(Debug)]
pub struct GpuDevice {
    pub(crate) vendor: VendorId,
    pub(crate) handle: DeviceHandle,
    pub static_info: StaticInfo,
    pub dynamic_info: DynamicInfo,
    /// Rebuilt wholesale on every `refresh_running_processes`; the backing
    /// allocation is retained across polls.
    pub processes: Vec<GpuProcess>,
    /// Largest incremental utilization sample timestamp accepted so far, in
    /// microseconds. Monotonically non-decreasing; used to request and
    /// accept only samples newer than the previous poll.
    pub(crate) last_utilization_timestamp: u64,
}

impl GpuDevice {
    pub fn new(handle: DeviceHandle) -> Self {
        Self {
            vendor: VendorId::UNATTACHED,
            handle,
            static_info: StaticInfo::default(),
            dynamic_info: DynamicInfo::default(),
            processes: Vec::new(),
            last_utilization_timestamp: 0,
        }
    }

    /// The registry index of the vendor backend that owns this device.
    pub fn vendor(&self) -> VendorId {
        self.vendor
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_roundtrips_native_pointer() {
        let fake = 0x7f00_dead_beef_usize as *mut c_void;
        assert_eq!(DeviceHandle::from_ptr(fake).as_ptr(), fake);
    }

    #[test]
    fn handle_roundtrips_synthetic_index() {
        for index in [0usize, 1, 63] {
            assert_eq!(DeviceHandle::from_index(index).index(), index);
        }
    }

    #[test]
    fn new_device_starts_with_invalid_records_and_zero_watermark() {
        let device = GpuDevice::new(DeviceHandle::from_index(0));
        assert_eq!(device.static_info, StaticInfo::default());
        assert_eq!(device.dynamic_info, DynamicInfo::default());
        assert!(device.processes.is_empty());
        assert_eq!(device.last_utilization_timestamp, 0);
    }
}
