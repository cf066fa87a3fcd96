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

//! Single precision interaction of one atom pair inside the cut-off.
//!
//! Forces are returned as `F/r` so that the force on j is `rv * f_invr`
//! with `rv = xj - xi`. LJ parameters are pre-multiplied: `c6 = 6 C6` and
//! `c12 = 12 C12`.

use super::{ElecType, KernelFlavor, NbParam, VdwType};
use crate::constants::MIN_DISTANCE_SQUARED;
use crate::ewald::{interpolate_coulomb_force_r, pmecorr_f};

const ONE_SIXTH: f32 = 1.0 / 6.0;
const ONE_TWELFTH: f32 = 1.0 / 12.0;

/// Parameter tables shared by all pairs
#[derive(Clone, Copy, Debug)]
pub struct PairTables<'a> {
    /// `(6 C6, 12 C12)` per type pair
    pub nbfp: &'a [[f32; 2]],
    /// LJ-PME grid parameters per type
    pub nbfp_comb: &'a [[f32; 2]],
    pub coulomb_tab: &'a [f32],
}

/// What the kernel knows about a pair after the cut-off test
#[derive(Clone, Copy, Debug, Default)]
pub struct PairAtoms {
    pub r2: f32,
    /// i-charge already scaled by the Coulomb prefactor
    pub qi: f32,
    pub qj: f32,
    pub type_i: usize,
    pub type_j: usize,
    /// Per-atom combination parameters
    pub lj_comb_i: [f32; 2],
    pub lj_comb_j: [f32; 2],
    /// 1 for interacting pairs, 0 for excluded ones
    pub int_bit: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PairTerms {
    pub f_invr: f32,
    pub e_lj: f32,
    pub e_el: f32,
}

/// Lorentz-Berthelot `sigma`, `epsilon` to `(6 C6, 12 C12)`
#[inline]
fn convert_sigma_epsilon_to_c6_c12(sigma: f32, epsilon: f32) -> [f32; 2] {
    let sigma2 = sigma * sigma;
    let sigma6 = sigma2 * sigma2 * sigma2;
    let c6 = epsilon * sigma6;
    [c6, c6 * sigma6]
}

#[inline]
fn switch_distance(p: &NbParam, r2: f32, inv_r: f32) -> f32 {
    (r2 * inv_r - p.rvdw_switch).max(0.0)
}

fn force_switch_f(p: &NbParam, c6c12: [f32; 2], inv_r: f32, r2: f32) -> f32 {
    let rs = switch_distance(p, r2, inv_r);
    let [c6, c12] = c6c12;
    (-c6 * (p.dispersion_c2 + p.dispersion_c3 * rs) + c12 * (p.repulsion_c2 + p.repulsion_c3 * rs))
        * rs
        * rs
        * inv_r
}

fn force_switch_e(p: &NbParam, c6c12: [f32; 2], inv_r: f32, r2: f32) -> f32 {
    let rs = switch_distance(p, r2, inv_r);
    let [c6, c12] = c6c12;
    let disp = p.dispersion_c2 / 3.0 + p.dispersion_c3 / 4.0 * rs;
    let rep = p.repulsion_c2 / 3.0 + p.repulsion_c3 / 4.0 * rs;
    (c6 * disp - c12 * rep) * rs * rs * rs
}

/// Applies the potential switch to an LJ force and energy
fn potential_switch(p: &NbParam, inv_r: f32, r2: f32, f_invr: f32, e_lj: f32) -> (f32, f32) {
    let rs = switch_distance(p, r2, inv_r);
    let sw = 1.0 + (p.vdw_switch_c3 + (p.vdw_switch_c4 + p.vdw_switch_c5 * rs) * rs) * rs * rs * rs;
    let dsw = (3.0 * p.vdw_switch_c3 + (4.0 * p.vdw_switch_c4 + 5.0 * p.vdw_switch_c5 * rs) * rs) * rs * rs;
    (f_invr * sw - inv_r * e_lj * dsw, e_lj * sw)
}

/// Subtracts the LJ-PME grid part; returns force and energy contributions
fn lj_ewald(p: &NbParam, c6grid: f32, r2: f32, inv_r2: f32, int_bit: f32) -> (f32, f32) {
    let lje_coeff2 = p.ewaldcoeff_lj * p.ewaldcoeff_lj;
    let lje_coeff6_6 = lje_coeff2 * lje_coeff2 * lje_coeff2 * ONE_SIXTH;
    let inv_r6_nm = inv_r2 * inv_r2 * inv_r2;
    let cr2 = lje_coeff2 * r2;
    let expmcr2 = (-cr2).exp();
    let poly = 1.0 + cr2 + 0.5 * cr2 * cr2;
    let f = c6grid * (inv_r6_nm - expmcr2 * (inv_r6_nm * poly + lje_coeff6_6)) * inv_r2;
    // Only real LJ pairs are shifted
    let e = ONE_SIXTH * c6grid * (inv_r6_nm * (1.0 - expmcr2 * poly) + p.sh_lj_ewald * int_bit);
    (f, e)
}

fn lj_ewald_c6grid(vdw: VdwType, tables: &PairTables, type_i: usize, type_j: usize) -> f32 {
    let (ci, cj) = (tables.nbfp_comb[type_i], tables.nbfp_comb[type_j]);
    match vdw {
        VdwType::EwaldLb => {
            let sigma = ci[0] + cj[0];
            let sigma2 = sigma * sigma;
            ci[1] * cj[1] * sigma2 * sigma2 * sigma2
        }
        _ => ci[0] * cj[0],
    }
}

/// Force over r and pair energies for an i-j pair that passed the cut-off test
pub fn interact(flavor: &KernelFlavor, p: &NbParam, tables: &PairTables, a: &PairAtoms) -> PairTerms {
    let exclusion_forces = flavor.exclusion_forces();
    let energies = flavor.calc_energies;
    let int_bit = a.int_bit;

    let r2 = a.r2.max(MIN_DISTANCE_SQUARED);
    let inv_r = 1.0 / r2.sqrt();
    let inv_r2 = inv_r * inv_r;

    let mut e_lj = 0.0;
    let mut c6c12 = [0.0; 2];
    let mut f_invr = if flavor.vdw == VdwType::CutCombLb && !energies {
        let sigma = a.lj_comb_i[0] + a.lj_comb_j[0];
        let epsilon = a.lj_comb_i[1] * a.lj_comb_j[1];
        let sig_r = sigma * inv_r;
        let sig_r2 = sig_r * sig_r;
        let mut sig_r6 = sig_r2 * sig_r2 * sig_r2;
        if exclusion_forces {
            sig_r6 *= int_bit;
        }
        epsilon * sig_r6 * (sig_r6 - 1.0) * inv_r2
    } else {
        c6c12 = match flavor.vdw {
            VdwType::CutCombGeom => [
                a.lj_comb_i[0] * a.lj_comb_j[0],
                a.lj_comb_i[1] * a.lj_comb_j[1],
            ],
            VdwType::CutCombLb => convert_sigma_epsilon_to_c6_c12(
                a.lj_comb_i[0] + a.lj_comb_j[0],
                a.lj_comb_i[1] * a.lj_comb_j[1],
            ),
            _ => tables.nbfp[p.num_types as usize * a.type_i + a.type_j],
        };
        let [c6, c12] = c6c12;
        let mut inv_r6 = inv_r2 * inv_r2 * inv_r2;
        if exclusion_forces {
            inv_r6 *= int_bit;
        }
        if energies || flavor.vdw == VdwType::PSwitch {
            e_lj = int_bit
                * (c12 * (inv_r6 * inv_r6 + p.repulsion_cpot) * ONE_TWELFTH
                    - c6 * (inv_r6 + p.dispersion_cpot) * ONE_SIXTH);
        }
        inv_r6 * (c12 * inv_r6 - c6) * inv_r2
    };

    match flavor.vdw {
        VdwType::FSwitch => {
            // Not masked: excluded pairs beyond the switching radius keep the switch terms
            f_invr += force_switch_f(p, c6c12, inv_r, r2);
            if energies {
                e_lj += force_switch_e(p, c6c12, inv_r, r2);
            }
        }
        VdwType::EwaldGeom | VdwType::EwaldLb => {
            let c6grid = lj_ewald_c6grid(flavor.vdw, tables, a.type_i, a.type_j);
            let (f, e) = lj_ewald(p, c6grid, r2, inv_r2, int_bit);
            f_invr += f;
            if energies {
                e_lj += e;
            }
        }
        VdwType::PSwitch => {
            (f_invr, e_lj) = potential_switch(p, inv_r, r2, f_invr, e_lj);
        }
        _ => {}
    }

    if flavor.elec.has_vdw_cutoff_check() && r2 >= p.rvdw_sq {
        f_invr = 0.0;
        e_lj = 0.0;
    }
    if !energies {
        e_lj = 0.0;
    }

    let qq = a.qi * a.qj;
    f_invr += qq * match flavor.elec {
        ElecType::Cut if exclusion_forces => int_bit * inv_r2 * inv_r,
        ElecType::Cut => inv_r2 * inv_r,
        ElecType::Rf => int_bit * inv_r2 * inv_r - p.two_k_rf,
        ElecType::EwaldAna | ElecType::EwaldAnaTwin => {
            let beta2 = p.ewald_beta * p.ewald_beta;
            int_bit * inv_r2 * inv_r + pmecorr_f(beta2 * r2) * beta2 * p.ewald_beta
        }
        ElecType::EwaldTab | ElecType::EwaldTabTwin => {
            let r = r2 * inv_r;
            (int_bit * inv_r2 - interpolate_coulomb_force_r(tables.coulomb_tab, p.coulomb_tab_scale, r))
                * inv_r
        }
    };

    let e_el = if energies {
        qq * match flavor.elec {
            ElecType::Cut => int_bit * inv_r - p.c_rf,
            ElecType::Rf => int_bit * inv_r + 0.5 * p.two_k_rf * r2 - p.c_rf,
            _ => inv_r * (int_bit - libm::erff(r2 * inv_r * p.ewald_beta)) - int_bit * p.sh_ewald,
        }
    } else {
        0.0
    };

    PairTerms { f_invr, e_lj, e_el }
}
