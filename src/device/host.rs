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

//! Reference device executing every operation eagerly on the host.
//!
//! Operations run when they are enqueued, so stream order and marker order
//! hold trivially. Each operation is appended to a log that tests use to
//! check what was transferred and in which order.

use super::{Device, Element, KernelArgs};
use crate::kernel::cpu::{self, KernelData, KernelOutputs};
use crate::kernel::pair::PairTables;
use crate::kernel::Kernel;
use anyhow::{anyhow, Result};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A stream operation as recorded by [`HostDevice`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOp {
    CopyToDevice { buffer: String, len: usize },
    Clear { buffer: String, len: usize },
    CopyFromDevice { buffer: String, len: usize },
    /// Kernel name
    Launch(String),
    Mark(u64),
    Wait(u64),
    Synchronize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedOp {
    /// Stream label
    pub stream: String,
    pub op: StreamOp,
}

pub struct HostBuffer<T> {
    label: String,
    data: RwLock<Vec<T>>,
}

impl<T: Element> HostBuffer<T> {
    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<T>>> {
        self.data
            .read()
            .map_err(|_| anyhow!("Buffer {} is poisoned", self.label))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<T>>> {
        self.data
            .write()
            .map_err(|_| anyhow!("Buffer {} is poisoned", self.label))
    }

    /// Current contents, bypassing the streams
    pub fn to_vec(&self) -> Result<Vec<T>> {
        Ok(self.read()?.clone())
    }

    fn check_range(&self, range: &Range<usize>) -> Result<()> {
        let len = self.read()?.len();
        anyhow::ensure!(
            range.start <= range.end && range.end <= len,
            "Range {range:?} out of bounds for {} ({len} elements)",
            self.label
        );
        Ok(())
    }
}

pub struct HostStream {
    label: String,
}

#[derive(Default)]
pub struct HostDevice {
    log: Mutex<Vec<LoggedOp>>,
    next_marker: AtomicU64,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A panic while holding the log cannot leave it half-written
    fn log(&self) -> MutexGuard<'_, Vec<LoggedOp>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, stream: &HostStream, op: StreamOp) {
        self.log().push(LoggedOp {
            stream: stream.label.clone(),
            op,
        });
    }

    /// All operations enqueued so far
    pub fn operations(&self) -> Vec<LoggedOp> {
        self.log().clone()
    }

    pub fn clear_operations(&self) {
        self.log().clear();
    }
}

impl Device for HostDevice {
    type Buffer<T: Element> = HostBuffer<T>;
    type Stream = HostStream;
    type Marker = u64;
    type Download<T: Element> = Vec<T>;

    fn name(&self) -> String {
        format!("host ({} threads)", rayon::current_num_threads())
    }

    fn create_stream(&self, label: &str) -> Result<HostStream> {
        Ok(HostStream {
            label: label.to_string(),
        })
    }

    fn allocate<T: Element>(&self, len: usize, label: &str) -> Result<HostBuffer<T>> {
        Ok(HostBuffer {
            label: label.to_string(),
            data: RwLock::new(vec![T::zeroed(); len]),
        })
    }

    fn copy_to_device<T: Element>(
        &self,
        stream: &HostStream,
        dst: &HostBuffer<T>,
        offset: usize,
        src: &[T],
    ) -> Result<()> {
        let range = offset..offset + src.len();
        dst.check_range(&range)?;
        dst.write()?[range].copy_from_slice(src);
        self.record(
            stream,
            StreamOp::CopyToDevice {
                buffer: dst.label.clone(),
                len: src.len(),
            },
        );
        Ok(())
    }

    fn clear<T: Element>(&self, stream: &HostStream, buffer: &HostBuffer<T>, range: Range<usize>) -> Result<()> {
        buffer.check_range(&range)?;
        let len = range.len();
        buffer.write()?[range].fill(T::zeroed());
        self.record(
            stream,
            StreamOp::Clear {
                buffer: buffer.label.clone(),
                len,
            },
        );
        Ok(())
    }

    fn copy_from_device<T: Element>(
        &self,
        stream: &HostStream,
        src: &HostBuffer<T>,
        range: Range<usize>,
    ) -> Result<Vec<T>> {
        src.check_range(&range)?;
        let data = src.read()?[range].to_vec();
        self.record(
            stream,
            StreamOp::CopyFromDevice {
                buffer: src.label.clone(),
                len: data.len(),
            },
        );
        Ok(data)
    }

    fn fetch<T: Element>(&self, download: Vec<T>) -> Result<Vec<T>> {
        Ok(download)
    }

    fn record_marker(&self, stream: &HostStream) -> Result<u64> {
        let marker = self.next_marker.fetch_add(1, Ordering::Relaxed);
        self.record(stream, StreamOp::Mark(marker));
        Ok(marker)
    }

    fn wait_marker(&self, stream: &HostStream, marker: &u64) -> Result<()> {
        self.record(stream, StreamOp::Wait(*marker));
        Ok(())
    }

    fn flush(&self, _stream: &HostStream) -> Result<()> {
        Ok(())
    }

    fn synchronize(&self, stream: &HostStream) -> Result<()> {
        self.record(stream, StreamOp::Synchronize);
        Ok(())
    }

    fn launch(&self, stream: &HostStream, kernel: Kernel, args: &KernelArgs<'_, Self>) -> Result<()> {
        trace!("Launching {kernel} on {} with {} blocks", stream.label, args.launch.num_blocks(&kernel));
        self.record(stream, StreamOp::Launch(kernel.to_string()));

        if kernel == Kernel::SumUp {
            cpu::sum_up(
                &args.launch,
                &mut args.fshift.write()?,
                &mut args.e_lj.write()?,
                &mut args.e_el.write()?,
            );
            return Ok(());
        }

        let param = args.param.read()?;
        let (xq, shift_vec) = (args.xq.read()?, args.shift_vec.read()?);
        let (atom_types, lj_comb) = (args.atom_types.read()?, args.lj_comb.read()?);
        let (nbfp, nbfp_comb) = (args.nbfp.read()?, args.nbfp_comb.read()?);
        let coulomb_tab = args.coulomb_tab.read()?;
        let (sci, excl) = (args.sci.read()?, args.excl.read()?);
        anyhow::ensure!(
            args.launch.num_sci as usize <= sci.len(),
            "Launch over {} super-clusters, list holds {}",
            args.launch.num_sci,
            sci.len()
        );
        let data = KernelData {
            param: param.first().ok_or_else(|| anyhow!("Kernel parameters not uploaded"))?,
            launch: &args.launch,
            xq: &xq,
            shift_vec: &shift_vec,
            atom_types: &atom_types,
            lj_comb: &lj_comb,
            tables: PairTables {
                nbfp: &nbfp,
                nbfp_comb: &nbfp_comb,
                coulomb_tab: &coulomb_tab,
            },
            sci: &sci,
            excl: &excl,
        };
        let mut cj4 = args.cj4.write()?;
        match kernel {
            Kernel::Nonbonded(flavor) => cpu::nonbonded(
                &flavor,
                &data,
                &mut cj4,
                KernelOutputs {
                    f: &mut args.f.write()?,
                    fshift: &mut args.fshift.write()?,
                    e_lj: &mut args.e_lj.write()?,
                    e_el: &mut args.e_el.write()?,
                },
            ),
            Kernel::PruneOnly => cpu::prune_only(&data, &mut cj4, &mut args.imask_outer.write()?),
            Kernel::SumUp => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfers_are_logged() {
        let device = HostDevice::new();
        let stream = device.create_stream("local").unwrap();
        let buffer: HostBuffer<u32> = device.allocate(4, "mask").unwrap();
        device.copy_to_device(&stream, &buffer, 1, &[7, 8]).unwrap();
        assert!(device.copy_to_device(&stream, &buffer, 3, &[7, 8]).is_err());
        device.clear(&stream, &buffer, 2..4).unwrap();
        let download = device.copy_from_device(&stream, &buffer, 0..4).unwrap();
        device.synchronize(&stream).unwrap();
        assert_eq!(device.fetch(download).unwrap(), vec![0, 7, 0, 0]);
        assert_eq!(
            device.operations().into_iter().map(|op| op.op).collect::<Vec<_>>(),
            vec![
                StreamOp::CopyToDevice {
                    buffer: "mask".into(),
                    len: 2
                },
                StreamOp::Clear {
                    buffer: "mask".into(),
                    len: 2
                },
                StreamOp::CopyFromDevice {
                    buffer: "mask".into(),
                    len: 4
                },
                StreamOp::Synchronize,
            ]
        );
        device.clear_operations();
        assert!(device.operations().is_empty());
    }

    #[test]
    fn test_log_survives_poisoning() {
        let device = HostDevice::new();
        let stream = device.create_stream("local").unwrap();
        let buffer: HostBuffer<u32> = device.allocate(2, "mask").unwrap();
        device.copy_to_device(&stream, &buffer, 0, &[1]).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _log = device.log.lock().unwrap();
            panic!("panic while holding the log");
        }));
        assert!(result.is_err());
        assert!(device.log.is_poisoned());
        device.clear(&stream, &buffer, 0..2).unwrap();
        let ops: Vec<_> = device.operations().into_iter().map(|op| op.op).collect();
        assert_eq!(
            ops,
            vec![
                StreamOp::CopyToDevice {
                    buffer: "mask".into(),
                    len: 1
                },
                StreamOp::Clear {
                    buffer: "mask".into(),
                    len: 2
                },
            ]
        );
    }
}
