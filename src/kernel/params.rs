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

//! Kernel parameter records and the choice of kernel flavour.

use super::{ElecType, VdwType};
use crate::atomdata::CombinationRule;
use crate::config::{
    CoulombType, InteractionConst, InteractionModifier, KernelOverrides, LongRangeVdw,
    PairlistParams, VdwKind,
};
use crate::error::NbnxmError;
use anyhow::Result;
use bytemuck::{Pod, Zeroable};

/// Single precision parameters read by every kernel, laid out as a WGSL uniform.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct NbParam {
    /// Coulomb prefactor; i-charges are scaled with it
    pub epsfac: f32,
    pub c_rf: f32,
    pub two_k_rf: f32,
    pub ewald_beta: f32,
    pub sh_ewald: f32,
    pub sh_lj_ewald: f32,
    pub ewaldcoeff_lj: f32,
    pub rvdw_sq: f32,
    pub rcoulomb_sq: f32,
    pub rlist_outer_sq: f32,
    pub rlist_inner_sq: f32,
    /// Points per nm of the Ewald correction table
    pub coulomb_tab_scale: f32,
    pub dispersion_c2: f32,
    pub dispersion_c3: f32,
    pub dispersion_cpot: f32,
    pub repulsion_c2: f32,
    pub repulsion_c3: f32,
    pub repulsion_cpot: f32,
    pub vdw_switch_c3: f32,
    pub vdw_switch_c4: f32,
    pub vdw_switch_c5: f32,
    pub rvdw_switch: f32,
    pub num_types: u32,
    pub use_dynamic_pruning: u32,
}

impl NbParam {
    pub fn new(ic: &InteractionConst, list_params: &PairlistParams, num_types: usize) -> Self {
        let mut param = Self {
            num_types: num_types as u32,
            ..Default::default()
        };
        param.set_cutoff_parameters(ic, list_params);
        param
    }

    /// Copies everything that depends on the cut-offs; called again after PME tuning
    pub fn set_cutoff_parameters(&mut self, ic: &InteractionConst, list_params: &PairlistParams) {
        self.ewald_beta = ic.ewaldcoeff_q as f32;
        self.sh_ewald = ic.sh_ewald as f32;
        self.epsfac = ic.epsfac as f32;
        self.two_k_rf = (2.0 * ic.reaction_field_coefficient) as f32;
        self.c_rf = ic.reaction_field_shift as f32;
        self.rvdw_sq = (ic.rvdw * ic.rvdw) as f32;
        self.rcoulomb_sq = (ic.rcoulomb * ic.rcoulomb) as f32;
        self.rlist_outer_sq = (list_params.rlist_outer * list_params.rlist_outer) as f32;
        self.rlist_inner_sq = (list_params.rlist_inner * list_params.rlist_inner) as f32;
        self.use_dynamic_pruning = list_params.use_dynamic_pruning as u32;

        self.sh_lj_ewald = ic.sh_lj_ewald as f32;
        self.ewaldcoeff_lj = ic.ewaldcoeff_lj as f32;
        self.rvdw_switch = ic.rvdw_switch as f32;
        self.dispersion_c2 = ic.dispersion_shift.c2 as f32;
        self.dispersion_c3 = ic.dispersion_shift.c3 as f32;
        self.dispersion_cpot = ic.dispersion_shift.cpot as f32;
        self.repulsion_c2 = ic.repulsion_shift.c2 as f32;
        self.repulsion_c3 = ic.repulsion_shift.c3 as f32;
        self.repulsion_cpot = ic.repulsion_shift.cpot as f32;
        self.vdw_switch_c3 = ic.vdw_switch.c3 as f32;
        self.vdw_switch_c4 = ic.vdw_switch.c4 as f32;
        self.vdw_switch_c5 = ic.vdw_switch.c5 as f32;
        self.coulomb_tab_scale = ic
            .coulomb_ewald_tables
            .as_ref()
            .map_or(0.0, |table| table.scale as f32);
    }
}

/// Per-launch values, laid out as a WGSL uniform
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct LaunchParams {
    /// Number of super-cluster entries in the list
    pub num_sci: u32,
    pub calc_fshift: u32,
    /// Which of `prune_num_parts` interleaved parts a prune launch handles
    pub prune_part: u32,
    pub prune_num_parts: u32,
    /// The outer masks are computed from the freshly built list
    pub have_fresh_list: u32,
    pub sum_energies: u32,
    pub sum_fshift: u32,
    pub _pad: u32,
}

impl LaunchParams {
    /// Number of blocks a launch over this list runs
    pub fn num_blocks(&self, kernel: &super::Kernel) -> usize {
        match kernel {
            super::Kernel::Nonbonded(_) => self.num_sci as usize,
            super::Kernel::PruneOnly => {
                let parts = self.prune_num_parts.max(1) as usize;
                (self.num_sci as usize).saturating_sub(self.prune_part as usize).div_ceil(parts)
            }
            super::Kernel::SumUp => 1,
        }
    }
}

/// Analytical or tabulated Ewald, single or twin cut-off
pub fn pick_ewald_kernel_type(
    ic: &InteractionConst,
    overrides: &KernelOverrides,
    prefers_tabulated: bool,
) -> Result<ElecType> {
    if overrides.force_analytical_ewald && overrides.force_tabulated_ewald {
        return Err(NbnxmError::ConflictingEwaldOverrides.into());
    }
    let analytical = if overrides.force_analytical_ewald {
        true
    } else if overrides.force_tabulated_ewald {
        false
    } else {
        !prefers_tabulated
    };
    let twin = ic.rcoulomb != ic.rvdw || overrides.force_twin_cutoff;
    let elec = match (analytical, twin) {
        (true, false) => ElecType::EwaldAna,
        (true, true) => ElecType::EwaldAnaTwin,
        (false, false) => ElecType::EwaldTab,
        (false, true) => ElecType::EwaldTabTwin,
    };
    debug!(
        "Using {} Ewald {} cut-off kernel",
        if analytical { "analytical" } else { "tabulated" },
        if twin { "twin" } else { "single" }
    );
    Ok(elec)
}

pub fn pick_elec_kernel_type(
    ic: &InteractionConst,
    overrides: &KernelOverrides,
    prefers_tabulated: bool,
) -> Result<ElecType> {
    match ic.coulomb_type {
        CoulombType::Cut => Ok(ElecType::Cut),
        CoulombType::ReactionField => Ok(ElecType::Rf),
        CoulombType::Ewald | CoulombType::Pme => {
            pick_ewald_kernel_type(ic, overrides, prefers_tabulated)
        }
        other => Err(NbnxmError::UnsupportedElectrostatics(other.to_string()).into()),
    }
}

pub fn pick_vdw_kernel_type(ic: &InteractionConst, comb_rule: CombinationRule) -> Result<VdwType> {
    let mismatch = |long_range: LongRangeVdw| -> anyhow::Error {
        NbnxmError::CombinationRuleMismatch {
            long_range: long_range.to_string(),
            short_range: comb_rule.to_string(),
        }
        .into()
    };
    match ic.vdw_type {
        VdwKind::Cut => match ic.vdw_modifier {
            InteractionModifier::None | InteractionModifier::PotShift => Ok(match comb_rule {
                CombinationRule::None => VdwType::Cut,
                CombinationRule::Geometric => VdwType::CutCombGeom,
                CombinationRule::LorentzBerthelot => VdwType::CutCombLb,
            }),
            InteractionModifier::ForceSwitch => Ok(VdwType::FSwitch),
            InteractionModifier::PotSwitch => Ok(VdwType::PSwitch),
            other => Err(NbnxmError::UnsupportedVdwModifier(other.to_string()).into()),
        },
        VdwKind::Pme => match (ic.ljpme_comb_rule, comb_rule) {
            (LongRangeVdw::Geometric, CombinationRule::Geometric) => Ok(VdwType::EwaldGeom),
            (LongRangeVdw::LorentzBerthelot, CombinationRule::LorentzBerthelot) => {
                Ok(VdwType::EwaldLb)
            }
            (long_range, _) => Err(mismatch(long_range)),
        },
        other => Err(NbnxmError::UnsupportedVdwType(other.to_string()).into()),
    }
}
