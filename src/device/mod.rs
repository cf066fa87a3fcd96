// Copyright 2024 Mikael Lund
//
// Licensed under the Apache license, version 2.0 (the "license");
// you may not use this file except in compliance with the license.
// You may obtain a copy of the license at
//
//     http://www.apache.org/licenses/license-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the license is distributed on an "as is" basis,
// without warranties or conditions of any kind, either express or implied.
// See the license for the specific language governing permissions and
// limitations under the license.

//! Device abstraction: buffers, in-order streams and cross-stream markers.
//!
//! Two implementations exist:
//! - [`HostDevice`]: runs the kernels on the CPU with rayon and logs every
//!   stream operation, used as reference and in tests
//! - [`WgpuDevice`]: runs the WGSL kernels through wgpu

mod event;
mod gpu;
mod host;

pub use event::GpuEventSynchronizer;
pub use gpu::WgpuDevice;
pub use host::{HostDevice, LoggedOp, StreamOp};

use crate::kernel::{Kernel, LaunchParams, NbParam};
use crate::pairlist::{ExclusionMask, JClusterGroup, SuperClusterEntry};
use anyhow::Result;
use bytemuck::Pod;
use std::ops::Range;

/// Plain data that can live in a device buffer
pub trait Element: Pod + Send + Sync + 'static {}
impl<T: Pod + Send + Sync + 'static> Element for T {}

/// A compute device with in-order streams.
///
/// Work enqueued on one stream executes in order. Ordering between streams
/// exists only through markers: work enqueued on a stream after
/// [`Device::wait_marker`] runs after everything enqueued on the marking
/// stream before [`Device::record_marker`].
pub trait Device: Send + Sync + Sized {
    type Buffer<T: Element>: Send + Sync;
    type Stream: Send + Sync;
    type Marker: Clone + Send + Sync + std::fmt::Debug;
    /// Result of an enqueued device-to-host copy, readable after synchronization
    type Download<T: Element>: Send;

    fn name(&self) -> String;

    fn create_stream(&self, label: &str) -> Result<Self::Stream>;

    /// Allocates `len` zeroed elements
    fn allocate<T: Element>(&self, len: usize, label: &str) -> Result<Self::Buffer<T>>;

    /// Copies `src` to `dst` starting at element `offset`
    fn copy_to_device<T: Element>(
        &self,
        stream: &Self::Stream,
        dst: &Self::Buffer<T>,
        offset: usize,
        src: &[T],
    ) -> Result<()>;

    /// Zeroes a range of elements
    fn clear<T: Element>(&self, stream: &Self::Stream, buffer: &Self::Buffer<T>, range: Range<usize>) -> Result<()>;

    /// Enqueues a copy of `range` back to the host
    fn copy_from_device<T: Element>(
        &self,
        stream: &Self::Stream,
        src: &Self::Buffer<T>,
        range: Range<usize>,
    ) -> Result<Self::Download<T>>;

    /// Reads a finished download; the stream must have been synchronized
    fn fetch<T: Element>(&self, download: Self::Download<T>) -> Result<Vec<T>>;

    fn record_marker(&self, stream: &Self::Stream) -> Result<Self::Marker>;

    fn wait_marker(&self, stream: &Self::Stream, marker: &Self::Marker) -> Result<()>;

    /// Starts executing work enqueued so far without waiting for it
    fn flush(&self, stream: &Self::Stream) -> Result<()>;

    /// Blocks until all work enqueued on the stream has completed
    fn synchronize(&self, stream: &Self::Stream) -> Result<()>;

    fn launch(&self, stream: &Self::Stream, kernel: Kernel, args: &KernelArgs<'_, Self>) -> Result<()>;

    /// Use the tabulated Ewald kernels unless overridden
    fn prefers_tabulated_ewald(&self) -> bool {
        false
    }
}

/// Buffers bound to a kernel launch, in binding order
pub struct KernelArgs<'a, D: Device> {
    pub param: &'a D::Buffer<NbParam>,
    pub launch: LaunchParams,
    pub xq: &'a D::Buffer<[f32; 4]>,
    pub f: &'a D::Buffer<[f32; 3]>,
    pub shift_vec: &'a D::Buffer<[f32; 4]>,
    pub fshift: &'a D::Buffer<[f32; 3]>,
    pub e_lj: &'a D::Buffer<f32>,
    pub e_el: &'a D::Buffer<f32>,
    pub atom_types: &'a D::Buffer<i32>,
    pub lj_comb: &'a D::Buffer<[f32; 2]>,
    pub nbfp: &'a D::Buffer<[f32; 2]>,
    pub nbfp_comb: &'a D::Buffer<[f32; 2]>,
    pub coulomb_tab: &'a D::Buffer<f32>,
    pub sci: &'a D::Buffer<SuperClusterEntry>,
    pub cj4: &'a D::Buffer<JClusterGroup>,
    pub excl: &'a D::Buffer<ExclusionMask>,
    pub imask_outer: &'a D::Buffer<u32>,
}

/// Growth rule for arrays that are reallocated every search step
pub fn over_alloc_large(n: usize) -> usize {
    (1.19 * n as f64) as usize + 1000
}

/// Growth rule for atom arrays
pub fn over_alloc_small(n: usize) -> usize {
    (1.19 * n as f64) as usize + 8000
}

/// Device buffer with a used length and a larger capacity.
///
/// The capacity only grows; shrinking the length keeps the allocation.
pub struct DeviceArray<D: Device, T: Element> {
    buffer: D::Buffer<T>,
    len: usize,
    capacity: usize,
    label: String,
}

impl<D: Device, T: Element> DeviceArray<D, T> {
    /// Empty array with room for one element
    pub fn new(device: &D, label: &str) -> Result<Self> {
        Ok(Self {
            buffer: device.allocate(1, label)?,
            len: 0,
            capacity: 1,
            label: label.to_string(),
        })
    }

    /// Array of exactly `data.len()` elements, uploaded on `stream`
    pub fn from_slice(device: &D, stream: &D::Stream, label: &str, data: &[T]) -> Result<Self> {
        let mut array = Self::new(device, label)?;
        array.reallocate(device, data.len(), |n| n)?;
        device.copy_to_device(stream, &array.buffer, 0, data)?;
        Ok(array)
    }

    /// Sets the length to `len`, allocating `over_alloc(len)` elements if the
    /// capacity is too small. Contents are lost on reallocation. Returns
    /// whether a new buffer was allocated.
    pub fn reallocate(&mut self, device: &D, len: usize, over_alloc: impl Fn(usize) -> usize) -> Result<bool> {
        let grown = len > self.capacity;
        if grown {
            let capacity = over_alloc(len).max(len);
            self.buffer = device.allocate(capacity, &self.label)?;
            trace!("Reallocated {} to {capacity} elements", self.label);
            self.capacity = capacity;
        }
        self.len = len;
        Ok(grown)
    }

    /// Copies `data` in at element `offset`
    pub fn upload(&self, device: &D, stream: &D::Stream, offset: usize, data: &[T]) -> Result<()> {
        anyhow::ensure!(
            offset + data.len() <= self.len,
            "Upload of {} elements at {offset} overflows {} ({} elements)",
            data.len(),
            self.label,
            self.len
        );
        if data.is_empty() {
            return Ok(());
        }
        device.copy_to_device(stream, &self.buffer, offset, data)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffer(&self) -> &D::Buffer<T> {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_over_allocation() {
        assert_eq!(over_alloc_large(0), 1000);
        assert_eq!(over_alloc_large(1000), 2190);
        assert_eq!(over_alloc_small(100), 8119);
        assert!(over_alloc_small(1_000_000) > 1_000_000);
    }

    #[test]
    fn test_array_growth_is_monotonic() {
        let device = HostDevice::new();
        let stream = device.create_stream("local").unwrap();
        let mut array = DeviceArray::<HostDevice, f32>::new(&device, "test").unwrap();
        assert!(array.reallocate(&device, 10, over_alloc_large).unwrap());
        assert_eq!(array.capacity(), 1011);
        // Shrinking and growing within capacity keeps the buffer
        assert!(!array.reallocate(&device, 5, over_alloc_large).unwrap());
        assert!(!array.reallocate(&device, 1011, over_alloc_large).unwrap());
        assert_eq!(array.capacity(), 1011);
        assert!(array.reallocate(&device, 1012, over_alloc_large).unwrap());
        assert!(array.capacity() > 1011);

        array.reallocate(&device, 3, over_alloc_large).unwrap();
        assert!(array.upload(&device, &stream, 1, &[1.0, 2.0]).is_ok());
        assert!(array.upload(&device, &stream, 2, &[1.0, 2.0]).is_err());
        let download = device.copy_from_device(&stream, array.buffer(), 0..3).unwrap();
        device.synchronize(&stream).unwrap();
        assert_eq!(device.fetch(download).unwrap(), vec![0.0, 1.0, 2.0]);
    }
}
