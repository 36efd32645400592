//! Hardware telemetry extraction core for accelerator devices.
//!
//! This crate discovers the accelerator devices exposed by heterogeneous
//! vendors, binds vendor capability sets at runtime and answers "what do
//! the devices and their processes look like right now" every time an
//! external collector polls it.
//!
//! A [`VendorRegistry`] composes one [`GpuVendor`] backend per vendor
//! family. Every enumerated [`GpuDevice`] then answers the same
//! five-operation contract (init, static info, dynamic info, process list,
//! shutdown) regardless of vendor. Per-field query failures never surface
//! as errors: a field the vendor could not supply this round is simply
//! `None`, which consumers must render as "unavailable" rather than zero.
//!
//! Two concurrency regimes coexist. Library-backed vendors (NVIDIA) are
//! plain foreign calls on the caller's thread. The external-source vendor
//! (TPU) runs one background thread that shells out to an interpreter on a
//! fixed cadence and publishes into a mutex-guarded table which the
//! synchronous contract calls read.

pub mod device;
pub mod vendor;

mod nvidia;
mod tpu;

pub use gpuinfo_types::{DynamicInfo, GpuProcess, StaticInfo, WorkloadKind};

pub use crate::device::{DeviceHandle, GpuDevice, VendorId};
pub use crate::nvidia::NvidiaVendor;
pub use crate::tpu::TpuVendor;
pub use crate::vendor::{GpuVendor, VendorRegistry};
