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

//! Test systems, a brute-force cluster pairlist and reference sums.

use crate::atomdata::{CombinationRule, LjParams, NbAtomData};
use crate::config::{CoulombType, InteractionConst, InteractionModifier, NonbondedSettings, VdwKind};
use crate::constants::{
    CENTRAL_SHIFT_INDEX, CLUSTERS_PER_SUPERCLUSTER, CLUSTER_PAIR_SPLIT, CLUSTER_SIZE, EXCL_SIZE,
    JGROUP_SIZE, NUM_SHIFT_VECTORS, WARP_SIZE,
};
use crate::kernel::pair::{self, PairAtoms, PairTables};
use crate::kernel::{KernelFlavor, NbParam};
use crate::pairlist::{ExclusionMask, HostPairlist, ImaskExclIndex, JClusterGroup, SuperClusterEntry};
use crate::{Matrix3, Vector3};
use glam::{DVec3, Vec3};
use itertools::iproduct;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::collections::HashMap;

/// Super-clusters per box side
const SUPERCLUSTERS_PER_SIDE: usize = 2;
/// Atom lattice spacing, nm
const SPACING: f64 = 0.375;
const JITTER: f64 = 0.05;

/// A periodic cubic box of neutral diatomics, clustered on a lattice
pub struct TestSystem {
    pub nbat: NbAtomData,
    pub box_length: f64,
    pub ic: InteractionConst,
    pub pairlist: HostPairlist,
}

impl TestSystem {
    /// 2x2x2 super-clusters of 2x2x2 clusters of 2x2x2 atoms.
    ///
    /// Atoms `2k` and `2k+1` form a molecule with charges `+q`, `-q` and are
    /// excluded from each other.
    pub fn new(comb_rule: CombinationRule, settings: &NonbondedSettings, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let cells = 4 * SUPERCLUSTERS_PER_SIDE;
        let box_length = cells as f64 * SPACING;
        let mut xq = Vec::new();
        let mut types = Vec::new();
        let n = SUPERCLUSTERS_PER_SIDE;
        for (sz, sy, sx) in iproduct!(0..n, 0..n, 0..n) {
            for (cz, cy, cx) in iproduct!(0..2, 0..2, 0..2) {
                for (az, ay, ax) in iproduct!(0..2, 0..2, 0..2) {
                    let coord = |s: usize, c: usize, a: usize, rng: &mut SmallRng| {
                        ((4 * s + 2 * c + a) as f64 + 0.5) * SPACING + rng.gen_range(-JITTER..JITTER)
                    };
                    let x = coord(sx, cx, ax, &mut rng);
                    let y = coord(sy, cy, ay, &mut rng);
                    let z = coord(sz, cz, az, &mut rng);
                    let charge = if xq.len() % 2 == 0 { 0.5 } else { -0.5 };
                    types.push((xq.len() % 2) as i32);
                    xq.push([x as f32, y as f32, z as f32, charge]);
                }
            }
        }
        let lj = [LjParams::new(0.25, 0.4), LjParams::new(0.2, 0.6)];
        let mut nbat = NbAtomData::new(&lj, comb_rule).unwrap();
        let num_atoms = xq.len();
        nbat.set_atoms(xq, types, num_atoms).unwrap();
        nbat.set_box(&Matrix3::from_diagonal(&Vector3::from_element(box_length)));
        let pairlist = build_pairlist(&nbat, settings.rlist, is_excluded);
        Self {
            nbat,
            box_length,
            ic: settings.interaction_const().unwrap(),
            pairlist,
        }
    }

    /// Ewald correction table, or a single zero when not using Ewald
    pub fn coulomb_table(&self) -> Vec<f32> {
        self.ic
            .coulomb_ewald_tables
            .as_ref()
            .map_or_else(|| vec![0.0], |t| t.table_f.clone())
    }
}

/// Molecules are consecutive atom pairs
pub fn is_excluded(a: usize, b: usize) -> bool {
    a != b && a / 2 == b / 2
}

fn position(nbat: &NbAtomData, a: usize) -> Vec3 {
    let [x, y, z, _] = nbat.xq[a];
    Vec3::new(x, y, z)
}

fn shift_vector(nbat: &NbAtomData, shift: usize) -> Vec3 {
    let [x, y, z, _] = nbat.shift_vec[shift];
    Vec3::new(x, y, z)
}

/// Thread indices `(tidxi, tidxj)` of lane `lane` in warp `widx`
fn thread_index(widx: usize, lane: usize) -> (usize, usize) {
    let tidx = widx * WARP_SIZE + lane;
    (tidx % CLUSTER_SIZE, tidx / CLUSTER_SIZE)
}

/// Half list of all cluster pairs with any atom pair closer than `rlist`.
///
/// A pair `(ci, cj)` with shift `s` is listed when `cj > ci`, or `cj == ci`
/// with `s` at or after the central shift; on the diagonal only `j > i`
/// atom pairs interact.
pub fn build_pairlist(nbat: &NbAtomData, rlist: f64, excluded: impl Fn(usize, usize) -> bool) -> HostPairlist {
    let num_clusters = nbat.num_atoms() / CLUSTER_SIZE;
    let num_sci = num_clusters / CLUSTERS_PER_SUPERCLUSTER;
    let rlist2 = (rlist * rlist) as f32;
    let mut list = HostPairlist::default();
    // Bounding spheres of the clusters
    let spheres: Vec<(Vec3, f32)> = (0..num_clusters)
        .map(|c| {
            let atoms = c * CLUSTER_SIZE..(c + 1) * CLUSTER_SIZE;
            let center = atoms.clone().map(|a| position(nbat, a)).sum::<Vec3>() / CLUSTER_SIZE as f32;
            let radius = atoms
                .map(|a| position(nbat, a).distance(center))
                .fold(0.0, f32::max);
            (center, radius)
        })
        .collect();
    let mut excl_index: HashMap<[u32; EXCL_SIZE], i32> = HashMap::new();
    excl_index.insert(ExclusionMask::default().pair, 0);

    for (sci, shift) in iproduct!(0..num_sci, 0..NUM_SHIFT_VECTORS) {
        let s = shift_vector(nbat, shift);
        let mut candidates: Vec<(usize, u32)> = Vec::new();
        for cj in 0..num_clusters {
            let mut bits = 0;
            for i in 0..CLUSTERS_PER_SUPERCLUSTER {
                let ci = sci * CLUSTERS_PER_SUPERCLUSTER + i;
                if cj < ci || (cj == ci && shift < CENTRAL_SHIFT_INDEX) {
                    continue;
                }
                let (ri, rj) = (spheres[ci], spheres[cj]);
                if (rj.0 - ri.0 - s).length() > rlist as f32 + ri.1 + rj.1 {
                    continue;
                }
                let in_range = iproduct!(0..CLUSTER_SIZE, 0..CLUSTER_SIZE).any(|(ti, tj)| {
                    let xi = position(nbat, ci * CLUSTER_SIZE + ti) + s;
                    (position(nbat, cj * CLUSTER_SIZE + tj) - xi).length_squared() < rlist2
                });
                if in_range {
                    bits |= 1 << i;
                }
            }
            if bits != 0 {
                candidates.push((cj, bits));
            }
        }
        if candidates.is_empty() {
            continue;
        }
        let start = list.cj4.len();
        for chunk in candidates.chunks(JGROUP_SIZE) {
            let mut group = JClusterGroup::default();
            let mut imask = 0;
            for (jm, &(cj, bits)) in chunk.iter().enumerate() {
                group.cj[jm] = cj as i32;
                imask |= bits << (jm * CLUSTERS_PER_SUPERCLUSTER);
            }
            for widx in 0..CLUSTER_PAIR_SPLIT {
                let pair: [u32; EXCL_SIZE] = std::array::from_fn(|lane| {
                    let (ti, tj) = thread_index(widx, lane);
                    let mut word = u32::MAX;
                    for (jm, &(cj, bits)) in chunk.iter().enumerate() {
                        for i in (0..CLUSTERS_PER_SUPERCLUSTER).filter(|i| bits & (1 << i) != 0) {
                            let ci = sci * CLUSTERS_PER_SUPERCLUSTER + i;
                            let a = ci * CLUSTER_SIZE + ti;
                            let b = cj * CLUSTER_SIZE + tj;
                            let lower = shift == CENTRAL_SHIFT_INDEX && ci == cj && tj <= ti;
                            if lower || excluded(a, b) {
                                word &= !(1 << (jm * CLUSTERS_PER_SUPERCLUSTER + i));
                            }
                        }
                    }
                    word
                });
                let next = excl_index.len() as i32;
                let excl_ind = *excl_index.entry(pair).or_insert_with(|| {
                    list.excl.push(ExclusionMask { pair });
                    next
                });
                group.imei[widx] = ImaskExclIndex { imask, excl_ind };
            }
            list.cj4.push(group);
        }
        list.sci.push(SuperClusterEntry {
            sci: sci as i32,
            shift: shift as i32,
            cj4_ind_start: start as i32,
            cj4_length: (list.cj4.len() - start) as i32,
        });
    }
    list
}

/// Forces and energies summed in double precision
#[derive(Debug, Clone)]
pub struct Reference {
    pub forces: Vec<[f64; 3]>,
    pub e_lj: f64,
    pub e_el: f64,
    /// Sum of i-forces from pairs with a non-central shift
    pub fshift_total: [f64; 3],
}

impl Reference {
    fn new(num_atoms: usize) -> Self {
        Self {
            forces: vec![[0.0; 3]; num_atoms],
            e_lj: 0.0,
            e_el: 0.0,
            fshift_total: [0.0; 3],
        }
    }

    fn add_force(&mut self, atom: usize, f: [f64; 3]) {
        (0..3).for_each(|d| self.forces[atom][d] += f[d]);
    }
}

/// Sequential loop over every listed atom pair with the kernel's pair function
pub fn list_sum(system: &TestSystem, flavor: &KernelFlavor, param: &NbParam) -> Reference {
    let nbat = &system.nbat;
    let list = &system.pairlist;
    let table = system.coulomb_table();
    let tables = PairTables {
        nbfp: &nbat.nbfp,
        nbfp_comb: &nbat.nbfp_comb,
        coulomb_tab: &table,
    };
    let uses_comb = flavor.vdw.uses_combination_rule();
    let mut reference = Reference::new(nbat.num_atoms());

    for entry in &list.sci {
        let sci = entry.sci as usize;
        let shift = entry.shift as usize;
        let s = shift_vector(nbat, shift);
        let range = entry.cj4_range();
        let diagonal = shift == CENTRAL_SHIFT_INDEX
            && !range.is_empty()
            && list.cj4[range.start].cj[0] as usize == sci * CLUSTERS_PER_SUPERCLUSTER;
        if flavor.calc_energies && flavor.exclusion_forces() && diagonal {
            add_self_energy(&mut reference, system, flavor, param, sci);
        }
        for j4 in range {
            let group = &list.cj4[j4];
            for (jm, i, ti, tj) in iproduct!(0..JGROUP_SIZE, 0..CLUSTERS_PER_SUPERCLUSTER, 0..CLUSTER_SIZE, 0..CLUSTER_SIZE) {
                let tidx = tj * CLUSTER_SIZE + ti;
                let (widx, lane) = (tidx / WARP_SIZE, tidx % WARP_SIZE);
                let bit = jm * CLUSTERS_PER_SUPERCLUSTER + i;
                let imei = group.imei[widx];
                if imei.imask & (1 << bit) == 0 {
                    continue;
                }
                let ci = sci * CLUSTERS_PER_SUPERCLUSTER + i;
                let cj = group.cj[jm] as usize;
                let (a, b) = (ci * CLUSTER_SIZE + ti, cj * CLUSTER_SIZE + tj);
                let xi = position(nbat, a) + s;
                let rv = position(nbat, b) - xi;
                let r2 = rv.length_squared();
                let int_bit = ((list.excl[imei.excl_ind as usize].pair[lane] >> bit) & 1) as f32;
                let within = if flavor.exclusion_forces() {
                    r2 < param.rcoulomb_sq && !(shift == CENTRAL_SHIFT_INDEX && tj <= ti && ci == cj)
                } else {
                    r2 < param.rcoulomb_sq && int_bit != 0.0
                };
                if !within {
                    continue;
                }
                let atoms = PairAtoms {
                    r2,
                    qi: nbat.xq[a][3] * param.epsfac,
                    qj: nbat.xq[b][3],
                    type_i: if uses_comb { 0 } else { nbat.atom_types[a] as usize },
                    type_j: if uses_comb { 0 } else { nbat.atom_types[b] as usize },
                    lj_comb_i: nbat.lj_comb[a],
                    lj_comb_j: nbat.lj_comb[b],
                    int_bit,
                };
                let terms = pair::interact(flavor, param, &tables, &atoms);
                let f = (rv * terms.f_invr).as_dvec3().to_array();
                reference.add_force(b, f);
                reference.add_force(a, f.map(|x| -x));
                if shift != CENTRAL_SHIFT_INDEX {
                    (0..3).for_each(|d| reference.fshift_total[d] -= f[d]);
                }
                reference.e_lj += terms.e_lj as f64;
                reference.e_el += terms.e_el as f64;
            }
        }
    }
    reference
}

fn add_self_energy(reference: &mut Reference, system: &TestSystem, flavor: &KernelFlavor, param: &NbParam, sci: usize) {
    let nbat = &system.nbat;
    let atoms = sci * CLUSTERS_PER_SUPERCLUSTER * CLUSTER_SIZE..(sci + 1) * CLUSTERS_PER_SUPERCLUSTER * CLUSTER_SIZE;
    let q2: f64 = atoms.clone().map(|a| (nbat.xq[a][3] as f64).powi(2)).sum();
    let factor = if flavor.elec.is_ewald() {
        -param.ewald_beta as f64 / std::f64::consts::PI.sqrt()
    } else {
        -0.5 * param.c_rf as f64
    };
    reference.e_el += factor * param.epsfac as f64 * q2;
    if flavor.vdw.is_ewald() {
        let num_types = nbat.num_types();
        let c6: f64 = atoms
            .map(|a| nbat.nbfp[nbat.atom_types[a] as usize * (num_types + 1)][0] as f64)
            .sum();
        let beta = param.ewaldcoeff_lj as f64;
        reference.e_lj += c6 * 0.5 / 6.0 * beta.powi(6) / 6.0;
    }
}

/// Minimum-image direct sum for Ewald electrostatics with plain or shifted LJ
pub fn direct_sum(system: &TestSystem, ic: &InteractionConst) -> Reference {
    assert!(ic.coulomb_type.is_ewald() && ic.vdw_type == VdwKind::Cut);
    assert!(matches!(ic.vdw_modifier, InteractionModifier::None | InteractionModifier::PotShift));
    let nbat = &system.nbat;
    let n = nbat.num_atoms();
    let num_types = nbat.num_types();
    let beta = ic.ewaldcoeff_q;
    let l = system.box_length;
    let rc2 = ic.rcoulomb * ic.rcoulomb;
    let two_over_sqrt_pi = 2.0 / std::f64::consts::PI.sqrt();
    let pos = |a: usize| DVec3::new(nbat.xq[a][0] as f64, nbat.xq[a][1] as f64, nbat.xq[a][2] as f64);
    let mut reference = Reference::new(n);

    let q2: f64 = nbat.xq.iter().map(|xq| (xq[3] as f64).powi(2)).sum();
    reference.e_el -= beta / std::f64::consts::PI.sqrt() * ic.epsfac * q2;

    for a in 0..n {
        for b in a + 1..n {
            let mut d = pos(b) - pos(a);
            d -= l * (d / l).round();
            let r2 = d.length_squared();
            if r2 >= rc2 {
                continue;
            }
            let r = r2.sqrt();
            let qq = ic.epsfac * nbat.xq[a][3] as f64 * nbat.xq[b][3] as f64;
            let gauss = two_over_sqrt_pi * beta * (-beta * beta * r2).exp();
            // Force along d, divided by r
            let mut f_invr;
            if is_excluded(a, b) {
                reference.e_el -= qq * libm::erf(beta * r) / r;
                f_invr = qq * (gauss / r - libm::erf(beta * r) / r2) / r;
            } else {
                reference.e_el += qq * (libm::erfc(beta * r) / r - ic.sh_ewald);
                f_invr = qq * (libm::erfc(beta * r) / r2 + gauss / r) / r;
                let [c6, c12] = nbat.nbfp[nbat.atom_types[a] as usize * num_types + nbat.atom_types[b] as usize]
                    .map(|c| c as f64);
                let (c6, c12) = (c6 / 6.0, c12 / 12.0);
                let inv_r6 = r2.powi(-3);
                reference.e_lj += c12 * (inv_r6 * inv_r6 + ic.repulsion_shift.cpot)
                    - c6 * (inv_r6 + ic.dispersion_shift.cpot);
                f_invr += (12.0 * c12 * inv_r6 * inv_r6 - 6.0 * c6 * inv_r6) / r2;
            }
            let f = (d * f_invr).to_array();
            reference.add_force(b, f);
            reference.add_force(a, f.map(|x| -x));
        }
    }
    reference
}

/// Asserts that every atom pair closer than `r` is still covered by the masks in `cj4`
pub fn assert_covers_pairs_within(system: &TestSystem, cj4: &[JClusterGroup], r: f64) {
    let nbat = &system.nbat;
    let list = &system.pairlist;
    let r2 = (r * r) as f32;
    for entry in &list.sci {
        let sci = entry.sci as usize;
        let s = shift_vector(nbat, entry.shift as usize);
        for j4 in entry.cj4_range() {
            let group = &list.cj4[j4];
            for (widx, jm, i) in iproduct!(0..CLUSTER_PAIR_SPLIT, 0..JGROUP_SIZE, 0..CLUSTERS_PER_SUPERCLUSTER) {
                let bit = 1 << (jm * CLUSTERS_PER_SUPERCLUSTER + i);
                if group.imei[widx].imask & bit == 0 {
                    continue;
                }
                let ci = sci * CLUSTERS_PER_SUPERCLUSTER + i;
                let cj = group.cj[jm] as usize;
                let close = (0..WARP_SIZE).any(|lane| {
                    let (ti, tj) = thread_index(widx, lane);
                    let xi = position(nbat, ci * CLUSTER_SIZE + ti) + s;
                    (position(nbat, cj * CLUSTER_SIZE + tj) - xi).length_squared() < r2
                });
                if close {
                    assert_ne!(cj4[j4].imei[widx].imask & bit, 0, "pruned an in-range pair {ci}-{cj}");
                }
            }
        }
    }
}

/// Settings shared by several tests: Ewald with a pairlist buffer
pub fn ewald_settings() -> NonbondedSettings {
    NonbondedSettings {
        coulomb_type: CoulombType::Pme,
        rlist: 1.05,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_list_counts_each_pair_once() {
        let settings = ewald_settings();
        let system = TestSystem::new(CombinationRule::Geometric, &settings, 1);
        let nbat = &system.nbat;
        let list = &system.pairlist;
        assert_eq!(list.validate().unwrap(), nbat.num_atoms());

        // Count atom pairs within the cut-off as seen through the list
        let rc2 = (settings.rcoulomb * settings.rcoulomb) as f32;
        let mut listed = 0usize;
        for entry in &list.sci {
            let s = shift_vector(nbat, entry.shift as usize);
            for j4 in entry.cj4_range() {
                let group = &list.cj4[j4];
                for (jm, i, ti, tj) in iproduct!(0..JGROUP_SIZE, 0..CLUSTERS_PER_SUPERCLUSTER, 0..CLUSTER_SIZE, 0..CLUSTER_SIZE) {
                    let tidx = tj * CLUSTER_SIZE + ti;
                    let imei = group.imei[tidx / WARP_SIZE];
                    let bit = jm * CLUSTERS_PER_SUPERCLUSTER + i;
                    if imei.imask & (1 << bit) == 0 {
                        continue;
                    }
                    if (list.excl[imei.excl_ind as usize].pair[tidx % WARP_SIZE] >> bit) & 1 == 0 {
                        continue;
                    }
                    let ci = entry.sci as usize * CLUSTERS_PER_SUPERCLUSTER + i;
                    let cj = group.cj[jm] as usize;
                    let xi = position(nbat, ci * CLUSTER_SIZE + ti) + s;
                    if (position(nbat, cj * CLUSTER_SIZE + tj) - xi).length_squared() < rc2 {
                        listed += 1;
                    }
                }
            }
        }
        let l = system.box_length as f32;
        let n = nbat.num_atoms();
        let expected = iproduct!(0..n, 0..n)
            .filter(|&(a, b)| a < b && !is_excluded(a, b))
            .filter(|&(a, b)| {
                let mut d = position(nbat, b) - position(nbat, a);
                d -= l * (d / l).round();
                d.length_squared() < rc2
            })
            .count();
        assert_eq!(listed, expected);
    }
}
