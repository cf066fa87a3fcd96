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

//! Cluster pairlist records shared bit-for-bit between host and device.
//!
//! A [`SuperClusterEntry`] points to a contiguous run of [`JClusterGroup`]s.
//! Each group holds four j-clusters; bit `jm * 8 + i` of a warp's interaction
//! mask says that i-cluster `i` of the super-cluster interacts with j-cluster
//! `cj[jm]`. The 8x8 atom pairs of a cluster pair are split over two warps,
//! so every group carries one mask and exclusion index per warp.

use crate::constants::{
    CLUSTERS_PER_SUPERCLUSTER, CLUSTER_PAIR_SPLIT, CLUSTER_SIZE, EXCL_SIZE, JGROUP_SIZE,
    NUM_SHIFT_VECTORS,
};
use crate::error::NbnxmError;
use anyhow::Result;
use bytemuck::{Pod, Zeroable};

/// One super-cluster and its range of j-cluster groups
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SuperClusterEntry {
    /// Super-cluster index
    pub sci: i32,
    /// Shift vector index applied to the i-atoms
    pub shift: i32,
    pub cj4_ind_start: i32,
    pub cj4_length: i32,
}

impl SuperClusterEntry {
    pub fn cj4_range(&self) -> std::ops::Range<usize> {
        let start = self.cj4_ind_start as usize;
        start..start + self.cj4_length as usize
    }
}

/// Interaction mask and exclusion-mask index of one warp
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ImaskExclIndex {
    pub imask: u32,
    pub excl_ind: i32,
}

/// Four j-clusters sharing interaction masks
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct JClusterGroup {
    pub cj: [i32; JGROUP_SIZE],
    pub imei: [ImaskExclIndex; CLUSTER_PAIR_SPLIT],
}

/// Exclusion bits for the atom pairs handled by one warp.
///
/// Lane `l` reads `pair[l]`; bit `jm * 8 + i` is set when atom pair
/// (i-cluster `i`, j-cluster `cj[jm]`) at that lane interacts.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct ExclusionMask {
    pub pair: [u32; EXCL_SIZE],
}

impl Default for ExclusionMask {
    /// No exclusions
    fn default() -> Self {
        Self {
            pair: [u32::MAX; EXCL_SIZE],
        }
    }
}

/// Pairlist built by the pair search for one interaction locality
#[derive(Clone, Debug)]
pub struct HostPairlist {
    /// Atoms per i-cluster the list was built for
    pub na_ci: usize,
    pub sci: Vec<SuperClusterEntry>,
    pub cj4: Vec<JClusterGroup>,
    pub excl: Vec<ExclusionMask>,
}

impl Default for HostPairlist {
    fn default() -> Self {
        Self {
            na_ci: CLUSTER_SIZE,
            sci: Vec::new(),
            cj4: Vec::new(),
            // Index 0 is the shared "no exclusions" mask
            excl: vec![ExclusionMask::default()],
        }
    }
}

impl HostPairlist {
    pub fn is_empty(&self) -> bool {
        self.sci.is_empty()
    }

    /// Number of interacting cluster pairs, counting set mask bits of both warps once
    pub fn num_cluster_pairs(&self) -> usize {
        self.cj4
            .iter()
            .map(|g| (g.imei[0].imask | g.imei[1].imask).count_ones() as usize)
            .sum()
    }

    /// Checks the internal consistency of the list and returns the number of
    /// atoms it needs, i.e. one past the highest atom index it references
    pub fn validate(&self) -> Result<usize> {
        let invalid = |msg: String| -> anyhow::Error { NbnxmError::InvalidPairlist(msg).into() };
        if self.na_ci != CLUSTER_SIZE {
            return Err(invalid(format!(
                "{} atoms per cluster, kernels are built for {CLUSTER_SIZE}",
                self.na_ci
            )));
        }
        let mut num_clusters = 0;
        for (n, entry) in self.sci.iter().enumerate() {
            if entry.sci < 0 {
                return Err(invalid(format!("sci[{n}] = {} is negative", entry.sci)));
            }
            if entry.shift < 0 || entry.shift as usize >= NUM_SHIFT_VECTORS {
                return Err(invalid(format!("sci[{n}] has shift {}", entry.shift)));
            }
            if entry.cj4_ind_start < 0
                || entry.cj4_length < 0
                || entry.cj4_range().end > self.cj4.len()
            {
                return Err(invalid(format!("sci[{n}] j-group range out of bounds")));
            }
            num_clusters = num_clusters.max((entry.sci as usize + 1) * CLUSTERS_PER_SUPERCLUSTER);
        }
        for (n, group) in self.cj4.iter().enumerate() {
            for (jm, &cj) in group.cj.iter().enumerate() {
                let used = group
                    .imei
                    .iter()
                    .any(|w| (w.imask >> (jm * CLUSTERS_PER_SUPERCLUSTER)) & 0xff != 0);
                if !used {
                    continue;
                }
                if cj < 0 {
                    return Err(invalid(format!("cj4[{n}].cj[{jm}] = {cj} is negative")));
                }
                num_clusters = num_clusters.max(cj as usize + 1);
            }
            if group
                .imei
                .iter()
                .any(|w| w.excl_ind < 0 || w.excl_ind as usize >= self.excl.len())
            {
                return Err(invalid(format!("cj4[{n}] exclusion index out of range")));
            }
        }
        Ok(num_clusters * CLUSTER_SIZE)
    }
}
