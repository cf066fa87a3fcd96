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

//! User-facing nonbonded settings and the interaction constants derived from them.
//!
//! Settings are plain data that can be read from YAML:
//!
//! ```yaml
//! coulomb_type: Pme
//! rcoulomb: 1.0
//! vdw_modifier: PotShift
//! rvdw: 1.0
//! rlist: 1.1
//! rlist_inner: 1.0
//! ```
//!
//! [`InteractionConst`] holds everything the kernels need in double precision;
//! it is converted to the single precision kernel parameters by the manager.

use crate::ewald::{self, EwaldCorrectionTable};
use crate::error::NbnxmError;
use anyhow::Result;
use physical_constants::{AVOGADRO_CONSTANT, ELEMENTARY_CHARGE, VACUUM_ELECTRIC_PERMITTIVITY};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

/// Electrostatics treatment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CoulombType {
    /// Plain cut-off, optionally shifted to zero at the cut-off
    Cut,
    ReactionField,
    Ewald,
    #[default]
    Pme,
    /// Generalized reaction field; not available in the kernels
    GeneralizedReactionField,
}

impl CoulombType {
    pub fn is_ewald(&self) -> bool {
        matches!(self, Self::Ewald | Self::Pme)
    }
}

/// Van der Waals treatment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VdwKind {
    #[default]
    Cut,
    /// LJ-PME: long-range dispersion on a grid
    Pme,
    /// Tabulated user potentials; not available in the kernels
    User,
}

/// Modifier applied to a potential at the cut-off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InteractionModifier {
    None,
    #[default]
    PotShift,
    ForceSwitch,
    PotSwitch,
    ExactCutoff,
}

/// Combination rule of the LJ-PME grid part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LongRangeVdw {
    #[default]
    Geometric,
    LorentzBerthelot,
}

macro_rules! display_as_debug {
    ($($t:ty),*) => {
        $(impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:?}", self)
            }
        })*
    };
}
display_as_debug!(CoulombType, VdwKind, InteractionModifier, LongRangeVdw);

/// Nonbonded input settings; lengths in nm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NonbondedSettings {
    pub coulomb_type: CoulombType,
    pub coulomb_modifier: InteractionModifier,
    pub rcoulomb: f64,
    /// Relative dielectric constant
    pub epsilon_r: f64,
    /// Reaction-field dielectric constant; zero means infinity
    pub epsilon_rf: f64,
    /// Relative strength of the direct-space Ewald potential at the cut-off
    pub ewald_rtol: f64,
    pub vdw_type: VdwKind,
    pub vdw_modifier: InteractionModifier,
    pub rvdw: f64,
    /// Where force- or potential-switching starts
    pub rvdw_switch: f64,
    pub ewald_rtol_lj: f64,
    pub ljpme_comb_rule: LongRangeVdw,
    /// Outer pairlist radius
    pub rlist: f64,
    /// Inner pairlist radius for dynamic pruning; `None` disables it
    pub rlist_inner: Option<f64>,
}

impl Default for NonbondedSettings {
    fn default() -> Self {
        Self {
            coulomb_type: CoulombType::Pme,
            coulomb_modifier: InteractionModifier::PotShift,
            rcoulomb: 1.0,
            epsilon_r: 1.0,
            epsilon_rf: 0.0,
            ewald_rtol: 1e-5,
            vdw_type: VdwKind::Cut,
            vdw_modifier: InteractionModifier::PotShift,
            rvdw: 1.0,
            rvdw_switch: 0.0,
            ewald_rtol_lj: 1e-3,
            ljpme_comb_rule: LongRangeVdw::Geometric,
            rlist: 1.0,
            rlist_inner: None,
        }
    }
}

impl NonbondedSettings {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: Self = serde_yaml::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.rcoulomb > 0.0 && self.rvdw > 0.0,
            "Cut-offs must be positive"
        );
        anyhow::ensure!(
            self.rlist >= self.rcoulomb.max(self.rvdw),
            "rlist ({}) must be at least max(rcoulomb, rvdw)",
            self.rlist
        );
        if let Some(inner) = self.rlist_inner {
            anyhow::ensure!(
                inner >= self.rcoulomb.max(self.rvdw) && inner <= self.rlist,
                "rlist_inner ({inner}) must lie between max(rcoulomb, rvdw) and rlist"
            );
        }
        if matches!(
            self.vdw_modifier,
            InteractionModifier::ForceSwitch | InteractionModifier::PotSwitch
        ) {
            anyhow::ensure!(
                self.rvdw_switch < self.rvdw,
                "rvdw_switch ({}) must be smaller than rvdw ({})",
                self.rvdw_switch,
                self.rvdw
            );
        }
        Ok(())
    }

    pub fn pairlist_params(&self) -> PairlistParams {
        PairlistParams {
            rlist_outer: self.rlist,
            rlist_inner: self.rlist_inner.unwrap_or(self.rlist),
            use_dynamic_pruning: self.rlist_inner.is_some(),
        }
    }

    /// Derives all cut-off dependent constants
    pub fn interaction_const(&self) -> Result<InteractionConst> {
        self.validate()?;
        let epsfac = ONE_4PI_EPS0 / self.epsilon_r;

        let (reaction_field_coefficient, reaction_field_shift) = match self.coulomb_type {
            CoulombType::Cut => match self.coulomb_modifier {
                InteractionModifier::PotShift => (0.0, 1.0 / self.rcoulomb),
                _ => (0.0, 0.0),
            },
            CoulombType::ReactionField => {
                reaction_field_constants(self.rcoulomb, self.epsilon_r, self.epsilon_rf)
            }
            _ => (0.0, 0.0),
        };
        if !self.coulomb_type.is_ewald() && self.rcoulomb != self.rvdw {
            return Err(NbnxmError::TwinCutoffUnsupported {
                rcoulomb: self.rcoulomb,
                rvdw: self.rvdw,
            }
            .into());
        }

        let mut ic = InteractionConst {
            coulomb_type: self.coulomb_type,
            coulomb_modifier: self.coulomb_modifier,
            rcoulomb: self.rcoulomb,
            epsfac,
            reaction_field_coefficient,
            reaction_field_shift,
            ewald_rtol: self.ewald_rtol,
            ewaldcoeff_q: 0.0,
            sh_ewald: 0.0,
            coulomb_ewald_tables: None,
            vdw_type: self.vdw_type,
            vdw_modifier: self.vdw_modifier,
            rvdw: self.rvdw,
            rvdw_switch: self.rvdw_switch,
            dispersion_shift: ShiftConsts::default(),
            repulsion_shift: ShiftConsts::default(),
            vdw_switch: SwitchConsts::default(),
            ewald_rtol_lj: self.ewald_rtol_lj,
            ewaldcoeff_lj: 0.0,
            sh_lj_ewald: 0.0,
            ljpme_comb_rule: self.ljpme_comb_rule,
        };
        if self.coulomb_type.is_ewald() {
            ic.set_coulomb_ewald(self.rcoulomb);
        }
        ic.set_vdw_constants();
        Ok(ic)
    }
}

/// 1/(4π ε0) in kJ mol⁻¹ nm e⁻²
pub const ONE_4PI_EPS0: f64 = ELEMENTARY_CHARGE * ELEMENTARY_CHARGE * AVOGADRO_CONSTANT
    / (4.0 * PI * VACUUM_ELECTRIC_PERMITTIVITY)
    * 1e9
    * 1e-3;

/// Returns `(k_rf, c_rf)`; `epsilon_rf == 0` is a conducting boundary
fn reaction_field_constants(rc: f64, epsilon_r: f64, epsilon_rf: f64) -> (f64, f64) {
    let k_rf = if epsilon_rf == 0.0 {
        1.0 / (2.0 * rc.powi(3))
    } else {
        (epsilon_rf - epsilon_r) / ((2.0 * epsilon_rf + epsilon_r) * rc.powi(3))
    };
    (k_rf, 1.0 / rc + k_rf * rc * rc)
}

/// Force-switch or potential-shift constants for one `r^-p` term
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ShiftConsts {
    pub c2: f64,
    pub c3: f64,
    pub cpot: f64,
}

impl ShiftConsts {
    fn potential_shift(p: i32, rc: f64) -> Self {
        Self {
            cpot: -rc.powi(-p),
            ..Default::default()
        }
    }

    fn force_switch(p: i32, rsw: f64, rc: f64) -> Self {
        let p_f = p as f64;
        let d = rc - rsw;
        let c2 = ((p_f + 1.0) * rsw - (p_f + 4.0) * rc) / (rc.powi(p + 2) * d.powi(2));
        let c3 = -((p_f + 1.0) * rsw - (p_f + 3.0) * rc) / (rc.powi(p + 2) * d.powi(3));
        let cpot = -rc.powi(-p) + p_f * c2 / 3.0 * d.powi(3) + p_f * c3 / 4.0 * d.powi(4);
        Self { c2, c3, cpot }
    }
}

/// Potential-switch polynomial `1 + c3 x³ + c4 x⁴ + c5 x⁵`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SwitchConsts {
    pub c3: f64,
    pub c4: f64,
    pub c5: f64,
}

impl SwitchConsts {
    fn new(rsw: f64, rc: f64) -> Self {
        let d = rc - rsw;
        Self {
            c3: -10.0 / d.powi(3),
            c4: 15.0 / d.powi(4),
            c5: -6.0 / d.powi(5),
        }
    }
}

/// Cut-off dependent constants of the short-range interactions
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionConst {
    pub coulomb_type: CoulombType,
    pub coulomb_modifier: InteractionModifier,
    pub rcoulomb: f64,
    /// Coulomb prefactor divided by epsilon_r
    pub epsfac: f64,
    /// k_rf
    pub reaction_field_coefficient: f64,
    /// c_rf
    pub reaction_field_shift: f64,
    pub ewald_rtol: f64,
    pub ewaldcoeff_q: f64,
    pub sh_ewald: f64,
    pub coulomb_ewald_tables: Option<EwaldCorrectionTable>,
    pub vdw_type: VdwKind,
    pub vdw_modifier: InteractionModifier,
    pub rvdw: f64,
    pub rvdw_switch: f64,
    pub dispersion_shift: ShiftConsts,
    pub repulsion_shift: ShiftConsts,
    pub vdw_switch: SwitchConsts,
    pub ewald_rtol_lj: f64,
    pub ewaldcoeff_lj: f64,
    pub sh_lj_ewald: f64,
    pub ljpme_comb_rule: LongRangeVdw,
}

impl InteractionConst {
    /// Sets the Coulomb cut-off and everything depending on it
    fn set_coulomb_ewald(&mut self, rcoulomb: f64) {
        self.rcoulomb = rcoulomb;
        self.ewaldcoeff_q = ewald::calc_ewald_coeff_q(rcoulomb, self.ewald_rtol);
        self.sh_ewald = match self.coulomb_modifier {
            InteractionModifier::PotShift => ewald::ewald_shift(self.ewaldcoeff_q, rcoulomb),
            _ => 0.0,
        };
        self.coulomb_ewald_tables = Some(EwaldCorrectionTable::new(self.ewaldcoeff_q, rcoulomb));
    }

    fn set_vdw_constants(&mut self) {
        let rc = self.rvdw;
        match self.vdw_modifier {
            InteractionModifier::PotShift => {
                self.dispersion_shift = ShiftConsts::potential_shift(6, rc);
                self.repulsion_shift = ShiftConsts::potential_shift(12, rc);
            }
            InteractionModifier::ForceSwitch => {
                self.dispersion_shift = ShiftConsts::force_switch(6, self.rvdw_switch, rc);
                self.repulsion_shift = ShiftConsts::force_switch(12, self.rvdw_switch, rc);
            }
            InteractionModifier::PotSwitch => {
                self.vdw_switch = SwitchConsts::new(self.rvdw_switch, rc);
            }
            InteractionModifier::None | InteractionModifier::ExactCutoff => {}
        }
        if self.vdw_type == VdwKind::Pme {
            self.ewaldcoeff_lj = ewald::calc_ewald_coeff_lj(rc, self.ewald_rtol_lj);
            if self.vdw_modifier == InteractionModifier::PotShift {
                self.sh_lj_ewald = ewald::lj_ewald_shift(self.ewaldcoeff_lj, rc);
            }
        }
    }

    /// Returns a copy with a scaled Coulomb cut-off as chosen by PME load
    /// balancing. The Ewald coefficient follows the cut-off at constant
    /// relative tolerance; the van der Waals cut-off is left unchanged.
    pub fn with_pme_load_balancing(&self, rcoulomb: f64) -> Result<Self> {
        anyhow::ensure!(
            self.coulomb_type.is_ewald(),
            "PME load balancing requires Ewald electrostatics"
        );
        anyhow::ensure!(
            rcoulomb >= self.rvdw,
            "Load balanced rcoulomb ({rcoulomb}) is below rvdw ({})",
            self.rvdw
        );
        let mut ic = self.clone();
        ic.set_coulomb_ewald(rcoulomb);
        Ok(ic)
    }
}

/// Pairlist radii
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairlistParams {
    /// Radius the list was built with
    pub rlist_outer: f64,
    /// Radius used after dynamic pruning
    pub rlist_inner: f64,
    pub use_dynamic_pruning: bool,
}

/// Environment variables forcing kernel flavours for benchmarking
pub const ENV_FORCE_ANALYTICAL_EWALD: &str = "CLUSTERPAIR_FORCE_ANALYTICAL_EWALD";
pub const ENV_FORCE_TABULATED_EWALD: &str = "CLUSTERPAIR_FORCE_TABULATED_EWALD";
pub const ENV_FORCE_EWALD_TWIN_CUTOFF: &str = "CLUSTERPAIR_FORCE_EWALD_TWIN_CUTOFF";

/// Ewald kernel overrides, each set when the variable is present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelOverrides {
    pub force_analytical_ewald: bool,
    pub force_tabulated_ewald: bool,
    pub force_twin_cutoff: bool,
}

impl KernelOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var_os(name).is_some())
    }

    /// Builds overrides from an arbitrary variable lookup
    pub fn from_lookup(is_set: impl Fn(&str) -> bool) -> Self {
        Self {
            force_analytical_ewald: is_set(ENV_FORCE_ANALYTICAL_EWALD),
            force_tabulated_ewald: is_set(ENV_FORCE_TABULATED_EWALD),
            force_twin_cutoff: is_set(ENV_FORCE_EWALD_TWIN_CUTOFF),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_coulomb_prefactor() {
        assert_relative_eq!(ONE_4PI_EPS0, 138.935_457_6, max_relative = 1e-7);
    }

    #[test]
    fn test_yaml() {
        let settings = NonbondedSettings::from_yaml(
            "coulomb_type: ReactionField\nepsilon_rf: 0.0\nrcoulomb: 1.2\nrvdw: 1.2\nrlist: 1.3\nrlist_inner: 1.25\n",
        )
        .unwrap();
        assert_eq!(settings.coulomb_type, CoulombType::ReactionField);
        let list = settings.pairlist_params();
        assert!(list.use_dynamic_pruning);
        assert_relative_eq!(list.rlist_inner, 1.25);

        assert!(NonbondedSettings::from_yaml("rlist: 0.5\n").is_err());
        assert!(NonbondedSettings::from_yaml("bogus: 1\n").is_err());
    }

    #[test]
    fn test_reaction_field() {
        let settings = NonbondedSettings {
            coulomb_type: CoulombType::ReactionField,
            ..Default::default()
        };
        let ic = settings.interaction_const().unwrap();
        // Conducting boundary
        assert_relative_eq!(ic.reaction_field_coefficient, 0.5);
        assert_relative_eq!(ic.reaction_field_shift, 1.5);

        let ic = NonbondedSettings {
            coulomb_type: CoulombType::Cut,
            epsilon_r: 4.0,
            ..Default::default()
        }
        .interaction_const()
        .unwrap();
        assert_relative_eq!(ic.reaction_field_coefficient, 0.0);
        assert_relative_eq!(ic.reaction_field_shift, 1.0);
    }

    #[test]
    fn test_twin_cutoff_needs_ewald() {
        let err = NonbondedSettings {
            coulomb_type: CoulombType::ReactionField,
            rcoulomb: 1.2,
            rvdw: 1.0,
            rlist: 1.2,
            ..Default::default()
        }
        .interaction_const()
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NbnxmError>(),
            Some(NbnxmError::TwinCutoffUnsupported { .. })
        ));
    }

    #[test]
    fn test_force_switch_is_continuous() {
        let settings = NonbondedSettings {
            vdw_modifier: InteractionModifier::ForceSwitch,
            rvdw_switch: 0.8,
            ..Default::default()
        };
        let ic = settings.interaction_const().unwrap();
        for (p, sc) in [(6, ic.dispersion_shift), (12, ic.repulsion_shift)] {
            let rc: f64 = 1.0;
            let d = rc - 0.8;
            // Force vanishes at the cut-off: p r^-(p+1) + p (c2 d² + c3 d³) = 0
            let force = p as f64 * rc.powi(-p - 1) + p as f64 * (sc.c2 * d * d + sc.c3 * d.powi(3));
            assert_relative_eq!(force, 0.0, epsilon = 1e-9);
            // Potential vanishes at the cut-off
            let pot = rc.powi(-p)
                - p as f64 * (sc.c2 / 3.0 * d.powi(3) + sc.c3 / 4.0 * d.powi(4))
                + sc.cpot;
            assert_relative_eq!(pot, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_potential_switch() {
        let sw = SwitchConsts::new(0.9, 1.2);
        let x: f64 = 0.3;
        assert_relative_eq!(
            1.0 + sw.c3 * x.powi(3) + sw.c4 * x.powi(4) + sw.c5 * x.powi(5),
            0.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_load_balancing_keeps_rtol() {
        let ic = NonbondedSettings::default().interaction_const().unwrap();
        let tuned = ic.with_pme_load_balancing(1.2).unwrap();
        assert_relative_eq!(
            libm::erfc(tuned.ewaldcoeff_q * 1.2),
            libm::erfc(ic.ewaldcoeff_q * 1.0),
            max_relative = 1e-8
        );
        assert!(tuned.ewaldcoeff_q < ic.ewaldcoeff_q);
        assert_relative_eq!(tuned.rvdw, 1.0);
        assert!(ic.with_pme_load_balancing(0.9).is_err());
    }

    #[test]
    fn test_overrides() {
        let o = KernelOverrides::from_lookup(|name| name == ENV_FORCE_TABULATED_EWALD);
        assert!(o.force_tabulated_ewald);
        assert!(!o.force_analytical_ewald);
        assert!(!o.force_twin_cutoff);
    }
}
