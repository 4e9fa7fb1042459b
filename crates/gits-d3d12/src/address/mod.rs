//! Capture/replay address bookkeeping for GPU virtual addresses and descriptor handles.

mod descriptor;
mod gpu;
mod interval;

pub use descriptor::{DescriptorHandleService, DescriptorHeapInfo, HandleKind};
pub use gpu::GpuAddressService;
pub use interval::{
    AddressIntervalIndex, AddressMapping, AddressSpace, AllocationRecord, HeapRecord,
    PlacedAllocation,
};
