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

//! Cluster geometry and execution-model constants shared by host and kernels.
//!
//! The WGSL kernel hard-codes the same values; changing any of them here
//! requires the matching change in `shaders/nonbonded.wgsl`.

/// Number of atoms per cluster
pub const CLUSTER_SIZE: usize = 8;

/// Number of i-clusters in a super-cluster
pub const CLUSTERS_PER_SUPERCLUSTER: usize = 8;

/// Atoms in a super-cluster
pub const SUPERCLUSTER_SIZE: usize = CLUSTER_SIZE * CLUSTERS_PER_SUPERCLUSTER;

/// Number of j-clusters in a j-cluster group
pub const JGROUP_SIZE: usize = 4;

/// Lanes per warp
pub const WARP_SIZE: usize = 32;

/// A cluster pair (8x8 threads) is split over this many warps
pub const CLUSTER_PAIR_SPLIT: usize = 2;

/// Threads per warp that work on one cluster pair
pub const SUB_WARP: usize = CLUSTER_SIZE * CLUSTER_SIZE / CLUSTER_PAIR_SPLIT;

/// Exclusion mask words per entry, one per lane
pub const EXCL_SIZE: usize = SUB_WARP;

/// Threads per block, one per i-j atom pair of a cluster pair
pub const THREADS_PER_BLOCK: usize = CLUSTER_SIZE * CLUSTER_SIZE;

/// Interaction mask with all bits of one j-cluster set
pub const SUPERCLUSTER_INTERACTION_MASK: u32 = (1 << CLUSTERS_PER_SUPERCLUSTER) - 1;

/// Periodic images in each direction used for shift vectors
pub const SHIFT_BOX: [i32; 3] = [2, 1, 1];

/// Number of periodic shift vectors: (2*2+1) x (2*1+1) x (2*1+1)
pub const NUM_SHIFT_VECTORS: usize = 45;

/// Index of the zero shift vector
pub const CENTRAL_SHIFT_INDEX: usize = 22;

/// Energy accumulator copies; blocks spread their atomics over them
pub const ENERGY_MEMORY_MULTIPLIER: usize = 64;

/// Shift-force accumulator copies
pub const SHIFT_MEMORY_MULTIPLIER: usize = 64;

/// Energy buffer length: slot 0 receives the folded total
pub const ENERGY_MEMORY_SIZE: usize = memory_size(ENERGY_MEMORY_MULTIPLIER);

/// Shift-force buffer length in units of [`NUM_SHIFT_VECTORS`]
pub const SHIFT_MEMORY_SIZE: usize = memory_size(SHIFT_MEMORY_MULTIPLIER);

/// Pair distances squared are clamped to this to keep r^-12 finite in single precision
pub const MIN_DISTANCE_SQUARED: f32 = 3.82e-7;

const fn memory_size(multiplier: usize) -> usize {
    if multiplier == 1 {
        1
    } else {
        multiplier + 1
    }
}

/// Shift index of the periodic image (x, y, z), each in `-SHIFT_BOX..=SHIFT_BOX`
pub const fn shift_index(x: i32, y: i32, z: i32) -> usize {
    let nx = 2 * SHIFT_BOX[0] + 1;
    let ny = 2 * SHIFT_BOX[1] + 1;
    (((z + SHIFT_BOX[2]) * ny + (y + SHIFT_BOX[1])) * nx + (x + SHIFT_BOX[0])) as usize
}

/// First energy slot written by block `bidx`
pub const fn energy_index_base(bidx: usize) -> usize {
    if ENERGY_MEMORY_MULTIPLIER == 1 {
        0
    } else {
        1 + (bidx & (ENERGY_MEMORY_MULTIPLIER - 1))
    }
}

/// First shift-force slot written by block `bidx`
pub const fn shift_index_base(bidx: usize) -> usize {
    if SHIFT_MEMORY_MULTIPLIER == 1 {
        0
    } else {
        NUM_SHIFT_VECTORS * (1 + (bidx & (SHIFT_MEMORY_MULTIPLIER - 1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shift_indices() {
        assert_eq!(shift_index(0, 0, 0), CENTRAL_SHIFT_INDEX);
        assert_eq!(shift_index(-2, -1, -1), 0);
        assert_eq!(shift_index(2, 1, 1), NUM_SHIFT_VECTORS - 1);
    }

    #[test]
    fn test_memory_slots() {
        assert_eq!(ENERGY_MEMORY_SIZE, 65);
        assert_eq!(energy_index_base(0), 1);
        assert_eq!(energy_index_base(63), 64);
        assert_eq!(energy_index_base(64), 1);
        assert_eq!(shift_index_base(1), 2 * NUM_SHIFT_VECTORS);
        assert!(shift_index_base(127) + NUM_SHIFT_VECTORS <= SHIFT_MEMORY_SIZE * NUM_SHIFT_VECTORS);
        assert_eq!(SUB_WARP, WARP_SIZE);
    }
}
