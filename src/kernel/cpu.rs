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

//! CPU emulation of the cluster-pair kernels.
//!
//! Blocks run in parallel with rayon; inside a block the two warps are
//! stepped lane by lane so that masks, exclusion bits, shuffle reductions and
//! atomic accumulation happen exactly as on the device. Mask updates are
//! collected per block and written back once all blocks are done.

use super::pair::{self, PairAtoms, PairTables};
use super::warp::{self, Lanes};
use super::{Kernel, KernelFlavor, LaunchParams, NbParam};
use crate::constants::{
    energy_index_base, shift_index_base, CENTRAL_SHIFT_INDEX, CLUSTERS_PER_SUPERCLUSTER,
    CLUSTER_PAIR_SPLIT, CLUSTER_SIZE, ENERGY_MEMORY_SIZE, JGROUP_SIZE, NUM_SHIFT_VECTORS,
    SHIFT_MEMORY_SIZE, SUPERCLUSTER_INTERACTION_MASK, SUPERCLUSTER_SIZE, WARP_SIZE,
};
use crate::pairlist::{ExclusionMask, JClusterGroup, SuperClusterEntry};
use glam::{Vec3, Vec4};
use rayon::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};

/// Read-only kernel inputs
#[derive(Clone, Copy)]
pub struct KernelData<'a> {
    pub param: &'a NbParam,
    pub launch: &'a LaunchParams,
    pub xq: &'a [[f32; 4]],
    pub shift_vec: &'a [[f32; 4]],
    pub atom_types: &'a [i32],
    pub lj_comb: &'a [[f32; 2]],
    pub tables: PairTables<'a>,
    pub sci: &'a [SuperClusterEntry],
    pub excl: &'a [ExclusionMask],
}

/// Accumulation targets of the nonbonded kernel
pub struct KernelOutputs<'a> {
    pub f: &'a mut [[f32; 3]],
    pub fshift: &'a mut [[f32; 3]],
    pub e_lj: &'a mut [f32],
    pub e_el: &'a mut [f32],
}

/// Float buffer with atomic adds, as used by the device kernels
struct AtomicBuffer(Vec<AtomicU32>);

impl AtomicBuffer {
    fn new(values: &[f32]) -> Self {
        Self(values.iter().map(|v| AtomicU32::new(v.to_bits())).collect())
    }

    fn add(&self, index: usize, value: f32) {
        let slot = &self.0[index];
        let mut old = slot.load(Ordering::Relaxed);
        loop {
            let new = (f32::from_bits(old) + value).to_bits();
            match slot.compare_exchange_weak(old, new, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(current) => old = current,
            }
        }
    }

    fn write_back(self, out: &mut [f32]) {
        out.iter_mut()
            .zip(self.0)
            .for_each(|(o, a)| *o = f32::from_bits(a.into_inner()));
    }
}

struct Accumulators {
    f: AtomicBuffer,
    fshift: AtomicBuffer,
    e_lj: AtomicBuffer,
    e_el: AtomicBuffer,
}

/// New interaction mask of one warp for one j-group
#[derive(Clone, Copy, Debug)]
struct MaskUpdate {
    j4: usize,
    widx: usize,
    imask: u32,
    /// Outer mask, written on a fresh list only
    outer: Option<u32>,
}

/// Thread indices of lane `lane` in warp `widx`: `(tidxi, tidxj)`
#[inline]
const fn thread_index(widx: usize, lane: usize) -> (usize, usize) {
    let tidx = widx * WARP_SIZE + lane;
    (tidx % CLUSTER_SIZE, tidx / CLUSTER_SIZE)
}

/// i-atoms of a super-cluster moved by its shift vector
fn shifted_i_atoms(data: &KernelData, entry: &SuperClusterEntry) -> [Vec4; SUPERCLUSTER_SIZE] {
    let s = data.shift_vec[entry.shift as usize];
    let first = entry.sci as usize * SUPERCLUSTER_SIZE;
    std::array::from_fn(|k| {
        let [x, y, z, q] = data.xq[first + k];
        Vec4::new(x + s[0], y + s[1], z + s[2], q)
    })
}

/// Runs the nonbonded kernel over all super-clusters of the list
pub fn nonbonded(flavor: &KernelFlavor, data: &KernelData, cj4: &mut [JClusterGroup], out: KernelOutputs) {
    let acc = Accumulators {
        f: AtomicBuffer::new(bytemuck::cast_slice::<[f32; 3], f32>(&*out.f)),
        fshift: AtomicBuffer::new(bytemuck::cast_slice::<[f32; 3], f32>(&*out.fshift)),
        e_lj: AtomicBuffer::new(&*out.e_lj),
        e_el: AtomicBuffer::new(&*out.e_el),
    };
    let num_blocks = data.launch.num_blocks(&Kernel::Nonbonded(*flavor));
    let groups: &[JClusterGroup] = cj4;
    let updates: Vec<MaskUpdate> = (0..num_blocks)
        .into_par_iter()
        .flat_map_iter(|bidx| nonbonded_block(flavor, data, groups, &acc, bidx))
        .collect();

    for update in updates {
        cj4[update.j4].imei[update.widx].imask = update.imask;
    }
    acc.f.write_back(bytemuck::cast_slice_mut(out.f));
    acc.fshift.write_back(bytemuck::cast_slice_mut(out.fshift));
    acc.e_lj.write_back(out.e_lj);
    acc.e_el.write_back(out.e_el);
}

fn nonbonded_block(
    flavor: &KernelFlavor,
    data: &KernelData,
    cj4: &[JClusterGroup],
    acc: &Accumulators,
    bidx: usize,
) -> Vec<MaskUpdate> {
    let p = data.param;
    let entry = data.sci[bidx];
    let sci = entry.sci as usize;
    let shift = entry.shift as usize;
    let range = entry.cj4_range();
    let exclusion_forces = flavor.exclusion_forces();
    let uses_comb = flavor.vdw.uses_combination_rule();
    let num_types = p.num_types as usize;

    let type_of = |a: usize| if uses_comb { 0 } else { data.atom_types[a] as usize };
    let comb_of = |a: usize| if uses_comb { data.lj_comb[a] } else { [0.0; 2] };

    // Shared memory staging with the Coulomb prefactor folded into qi
    let mut xqib = shifted_i_atoms(data, &entry);
    xqib.iter_mut().for_each(|xq| xq.w *= p.epsfac);
    let first_i = sci * SUPERCLUSTER_SIZE;

    let is_diagonal = shift == CENTRAL_SHIFT_INDEX
        && !range.is_empty()
        && cj4[range.start].cj[0] as usize == sci * CLUSTERS_PER_SUPERCLUSTER;

    let mut updates = Vec::new();
    for widx in 0..CLUSTER_PAIR_SPLIT {
        let mut e_lj: Lanes<f32> = [0.0; WARP_SIZE];
        let mut e_el: Lanes<f32> = [0.0; WARP_SIZE];
        let mut fci = [[Vec3::ZERO; CLUSTERS_PER_SUPERCLUSTER]; WARP_SIZE];

        if flavor.calc_energies && exclusion_forces && is_diagonal {
            for lane in 0..WARP_SIZE {
                let (tidxi, _) = thread_index(widx, lane);
                for i in 0..CLUSTERS_PER_SUPERCLUSTER {
                    let qi = xqib[i * CLUSTER_SIZE + tidxi].w;
                    e_el[lane] += qi * qi;
                    if flavor.vdw.is_ewald() {
                        let t = type_of(first_i + i * CLUSTER_SIZE + tidxi);
                        e_lj[lane] += data.tables.nbfp[t * (num_types + 1)][0];
                    }
                }
                // Each i-atom was added by all eight j-threads
                if flavor.vdw.is_ewald() {
                    let c2 = p.ewaldcoeff_lj * p.ewaldcoeff_lj;
                    e_lj[lane] *= 0.5 / 6.0 * (c2 * c2 * c2 / 6.0) / CLUSTER_SIZE as f32;
                }
                e_el[lane] /= p.epsfac * CLUSTER_SIZE as f32;
                e_el[lane] *= if flavor.elec.is_ewald() {
                    -p.ewald_beta * std::f32::consts::FRAC_2_SQRT_PI * 0.5
                } else {
                    -0.5 * p.c_rf
                };
            }
        }

        for j4 in range.clone() {
            let group = &cj4[j4];
            let mut imask = group.imei[widx].imask;
            if !flavor.prune && imask == 0 {
                continue;
            }
            let wexcl = &data.excl[group.imei[widx].excl_ind as usize];

            for jm in 0..JGROUP_SIZE {
                if imask & (SUPERCLUSTER_INTERACTION_MASK << (jm * CLUSTERS_PER_SUPERCLUSTER)) == 0 {
                    continue;
                }
                let cj = group.cj[jm] as usize;
                let mut fcj: Lanes<Vec3> = [Vec3::ZERO; WARP_SIZE];

                for i in 0..CLUSTERS_PER_SUPERCLUSTER {
                    let bit = jm * CLUSTERS_PER_SUPERCLUSTER + i;
                    let mask_ji = 1u32 << bit;
                    if imask & mask_ji == 0 {
                        continue;
                    }
                    let ci = sci * CLUSTERS_PER_SUPERCLUSTER + i;
                    let mut in_list: Lanes<bool> = [false; WARP_SIZE];

                    for lane in 0..WARP_SIZE {
                        let (tidxi, tidxj) = thread_index(widx, lane);
                        let aj = cj * CLUSTER_SIZE + tidxj;
                        let ai = first_i + i * CLUSTER_SIZE + tidxi;
                        let [xj, yj, zj, qj] = data.xq[aj];
                        let xqi = xqib[i * CLUSTER_SIZE + tidxi];
                        let rv = Vec3::new(xj, yj, zj) - xqi.truncate();
                        let r2 = rv.length_squared();
                        in_list[lane] = r2 < p.rlist_outer_sq;

                        let int_bit = ((wexcl.pair[lane] >> bit) & 1) as f32;
                        let self_pair = shift == CENTRAL_SHIFT_INDEX && tidxj <= tidxi && ci == cj;
                        let within = if exclusion_forces {
                            r2 < p.rcoulomb_sq && !self_pair
                        } else {
                            r2 < p.rcoulomb_sq && int_bit != 0.0
                        };
                        if !within {
                            continue;
                        }
                        let atoms = PairAtoms {
                            r2,
                            qi: xqi.w,
                            qj,
                            type_i: type_of(ai),
                            type_j: type_of(aj),
                            lj_comb_i: comb_of(ai),
                            lj_comb_j: comb_of(aj),
                            int_bit,
                        };
                        let terms = pair::interact(flavor, p, &data.tables, &atoms);
                        let f_ij = rv * terms.f_invr;
                        fcj[lane] += f_ij;
                        fci[lane][i] -= f_ij;
                        e_lj[lane] += terms.e_lj;
                        e_el[lane] += terms.e_el;
                    }
                    if flavor.prune && !warp::any(&in_list) {
                        imask &= !mask_ji;
                    }
                }

                let reduced = warp::reduce_force_j(&fcj);
                for (lane, value) in reduced.iter().enumerate() {
                    let (tidxi, tidxj) = thread_index(widx, lane);
                    if tidxi < 3 {
                        acc.f.add((cj * CLUSTER_SIZE + tidxj) * 3 + tidxi, *value);
                    }
                }
            }
            if flavor.prune {
                updates.push(MaskUpdate {
                    j4,
                    widx,
                    imask,
                    outer: None,
                });
            }
        }

        let calc_fshift = data.launch.calc_fshift != 0 && shift != CENTRAL_SHIFT_INDEX;
        let mut fshift_buf: Lanes<f32> = [0.0; WARP_SIZE];
        for i in 0..CLUSTERS_PER_SUPERCLUSTER {
            let lanes: Lanes<Vec3> = std::array::from_fn(|lane| fci[lane][i]);
            let reduced = warp::reduce_force_i(&lanes);
            for (lane, value) in reduced.iter().enumerate() {
                let (tidxi, tidxj) = thread_index(widx, lane);
                let component = tidxj & 3;
                if component < 3 {
                    acc.f.add((first_i + i * CLUSTER_SIZE + tidxi) * 3 + component, *value);
                    if calc_fshift {
                        fshift_buf[lane] += value;
                    }
                }
            }
        }
        if calc_fshift {
            for (lane, value) in fshift_buf.iter().enumerate() {
                let component = thread_index(widx, lane).1 & 3;
                if component < 3 {
                    acc.fshift.add((shift_index_base(bidx) + shift) * 3 + component, *value);
                }
            }
        }
        if flavor.calc_energies {
            acc.e_lj.add(energy_index_base(bidx), warp::reduce_energy(&e_lj));
            acc.e_el.add(energy_index_base(bidx), warp::reduce_energy(&e_el));
        }
    }
    updates
}

/// Prunes one part of the list with the inner radius.
///
/// On a fresh list the outer masks are first computed from the list's own
/// masks and stored in `imask_outer`; otherwise they are read from it.
pub fn prune_only(data: &KernelData, cj4: &mut [JClusterGroup], imask_outer: &mut [u32]) {
    let launch = data.launch;
    let num_parts = launch.prune_num_parts.max(1) as usize;
    let part = launch.prune_part as usize;
    let num_blocks = launch.num_blocks(&Kernel::PruneOnly);
    let groups: &[JClusterGroup] = cj4;
    let outer: &[u32] = imask_outer;
    let updates: Vec<MaskUpdate> = (0..num_blocks)
        .into_par_iter()
        .flat_map_iter(|bidx| prune_block(data, groups, outer, bidx * num_parts + part))
        .collect();

    for update in updates {
        cj4[update.j4].imei[update.widx].imask = update.imask;
        if let Some(mask) = update.outer {
            imask_outer[update.j4 * CLUSTER_PAIR_SPLIT + update.widx] = mask;
        }
    }
}

fn prune_block(data: &KernelData, cj4: &[JClusterGroup], outer: &[u32], sci_index: usize) -> Vec<MaskUpdate> {
    let p = data.param;
    let fresh = data.launch.have_fresh_list != 0;
    let entry = data.sci[sci_index];
    let xib = shifted_i_atoms(data, &entry);
    let mut updates = Vec::with_capacity(entry.cj4_range().len() * CLUSTER_PAIR_SPLIT);

    for widx in 0..CLUSTER_PAIR_SPLIT {
        for j4 in entry.cj4_range() {
            let group = &cj4[j4];
            let mut imask_full = if fresh { group.imei[widx].imask } else { 0 };
            let mut imask_check = if fresh {
                imask_full
            } else {
                outer[j4 * CLUSTER_PAIR_SPLIT + widx]
            };
            for jm in 0..JGROUP_SIZE {
                if imask_check & (SUPERCLUSTER_INTERACTION_MASK << (jm * CLUSTERS_PER_SUPERCLUSTER)) == 0 {
                    continue;
                }
                let cj = group.cj[jm] as usize;
                for i in 0..CLUSTERS_PER_SUPERCLUSTER {
                    let mask_ji = 1u32 << (jm * CLUSTERS_PER_SUPERCLUSTER + i);
                    if imask_check & mask_ji == 0 {
                        continue;
                    }
                    let r2: Lanes<f32> = std::array::from_fn(|lane| {
                        let (tidxi, tidxj) = thread_index(widx, lane);
                        let [x, y, z, _] = data.xq[cj * CLUSTER_SIZE + tidxj];
                        let xi = xib[i * CLUSTER_SIZE + tidxi].truncate();
                        (Vec3::new(x, y, z) - xi).length_squared()
                    });
                    if fresh && !warp::any(&r2.map(|r2| r2 < p.rlist_outer_sq)) {
                        imask_full &= !mask_ji;
                    }
                    if !warp::any(&r2.map(|r2| r2 < p.rlist_inner_sq)) {
                        imask_check &= !mask_ji;
                    }
                }
            }
            updates.push(MaskUpdate {
                j4,
                widx,
                imask: imask_check,
                outer: fresh.then_some(imask_full),
            });
        }
    }
    updates
}

/// Sets slot 0 of the energy and shift-force buffers to the sum of the other slots
pub fn sum_up(launch: &LaunchParams, fshift: &mut [[f32; 3]], e_lj: &mut [f32], e_el: &mut [f32]) {
    if launch.sum_energies != 0 {
        for e in [e_lj, e_el] {
            e[0] = e[1..ENERGY_MEMORY_SIZE].iter().sum();
        }
    }
    if launch.sum_fshift != 0 {
        for s in 0..NUM_SHIFT_VECTORS {
            fshift[s] = (1..SHIFT_MEMORY_SIZE).fold([0.0; 3], |sum, slot| {
                let f = fshift[slot * NUM_SHIFT_VECTORS + s];
                [sum[0] + f[0], sum[1] + f[1], sum[2] + f[2]]
            });
        }
    }
}
