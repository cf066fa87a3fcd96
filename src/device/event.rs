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

//! Single-use cross-stream dependency.

use super::Device;
use crate::error::NbnxmError;
use anyhow::Result;

/// Marked on one stream and waited for exactly once on another.
///
/// Marking again before the wait was enqueued, or waiting twice for the same
/// mark, is a protocol error.
pub struct GpuEventSynchronizer<D: Device> {
    marker: Option<D::Marker>,
    consumed: bool,
}

impl<D: Device> Default for GpuEventSynchronizer<D> {
    fn default() -> Self {
        Self {
            marker: None,
            consumed: false,
        }
    }
}

impl<D: Device> GpuEventSynchronizer<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the current end of `stream`
    pub fn mark(&mut self, device: &D, stream: &D::Stream) -> Result<()> {
        if self.marker.is_some() && !self.consumed {
            return Err(NbnxmError::EventNotConsumed.into());
        }
        self.marker = Some(device.record_marker(stream)?);
        self.consumed = false;
        Ok(())
    }

    /// Makes later work on `stream` wait for the marked point
    pub fn enqueue_wait(&mut self, device: &D, stream: &D::Stream) -> Result<()> {
        match &self.marker {
            Some(marker) if !self.consumed => {
                device.wait_marker(stream, marker)?;
                self.consumed = true;
                Ok(())
            }
            _ => Err(NbnxmError::EventNotMarked.into()),
        }
    }

    /// Forgets the mark, e.g. when the waiting side has nothing to do
    pub fn reset(&mut self) {
        self.marker = None;
        self.consumed = false;
    }

    /// Marked and not yet waited for
    pub fn is_pending(&self) -> bool {
        self.marker.is_some() && !self.consumed
    }
}
