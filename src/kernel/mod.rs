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

//! Kernel flavours, parameters and the CPU emulation of the cluster-pair kernel.
//!
//! The same kernel exists twice: as WGSL for [`crate::device::WgpuDevice`] and
//! as a lane-by-lane emulation in [`cpu`] for [`crate::device::HostDevice`].
//! Both read the [`NbParam`] and [`LaunchParams`] records defined here.

pub mod cpu;
pub mod pair;
pub mod params;
pub mod warp;

pub use params::{pick_elec_kernel_type, pick_ewald_kernel_type, pick_vdw_kernel_type, LaunchParams, NbParam};

use std::fmt;

/// Electrostatics flavour of the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElecType {
    /// Plain cut-off, optionally shifted
    Cut,
    Rf,
    /// Tabulated Ewald correction
    EwaldTab,
    /// Tabulated Ewald with a separate, shorter vdW cut-off
    EwaldTabTwin,
    /// Analytical Ewald correction
    EwaldAna,
    EwaldAnaTwin,
}

impl ElecType {
    pub const fn is_ewald(self) -> bool {
        !matches!(self, Self::Cut | Self::Rf)
    }
    pub const fn is_tabulated(self) -> bool {
        matches!(self, Self::EwaldTab | Self::EwaldTabTwin)
    }
    pub const fn is_analytical(self) -> bool {
        matches!(self, Self::EwaldAna | Self::EwaldAnaTwin)
    }
    /// Twin cut-off flavours test r² against the vdW cut-off separately
    pub const fn has_vdw_cutoff_check(self) -> bool {
        matches!(self, Self::EwaldTabTwin | Self::EwaldAnaTwin)
    }
    /// Value of the `ELEC_TYPE` pipeline constant
    pub const fn code(self) -> u32 {
        self as u32
    }
}

/// Van der Waals flavour of the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VdwType {
    /// Type-pair parameter matrix
    Cut,
    /// Geometric combination of per-atom parameters
    CutCombGeom,
    /// Lorentz-Berthelot combination of per-atom parameters
    CutCombLb,
    FSwitch,
    PSwitch,
    /// LJ-PME with geometric grid combination
    EwaldGeom,
    /// LJ-PME with Lorentz-Berthelot grid combination
    EwaldLb,
}

impl VdwType {
    /// Reads per-atom combination parameters instead of atom types
    pub const fn uses_combination_rule(self) -> bool {
        matches!(self, Self::CutCombGeom | Self::CutCombLb)
    }
    pub const fn is_ewald(self) -> bool {
        matches!(self, Self::EwaldGeom | Self::EwaldLb)
    }
    /// Value of the `VDW_TYPE` pipeline constant
    pub const fn code(self) -> u32 {
        self as u32
    }
}

/// One compiled variant of the nonbonded kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelFlavor {
    pub elec: ElecType,
    pub vdw: VdwType,
    pub calc_energies: bool,
    /// Prune the interaction masks with the outer list radius
    pub prune: bool,
}

impl KernelFlavor {
    /// Excluded pairs inside the cut-off still get the long-range correction
    pub const fn exclusion_forces(&self) -> bool {
        self.elec.is_ewald()
            || matches!(self.elec, ElecType::Rf)
            || self.vdw.is_ewald()
            || (matches!(self.elec, ElecType::Cut) && self.calc_energies)
    }
}

impl fmt::Display for KernelFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nbnxn_kernel_Elec{:?}_Vdw{:?}_{}{}",
            self.elec,
            self.vdw,
            if self.prune { "Prune" } else { "" },
            if self.calc_energies { "VF" } else { "F" }
        )
    }
}

/// Kernels a device can launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    Nonbonded(KernelFlavor),
    /// Dynamic or rolling pruning of the interaction masks
    PruneOnly,
    /// Folds the energy and shift-force multiplier slots into slot 0
    SumUp,
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nonbonded(flavor) => write!(f, "{flavor}"),
            Self::PruneOnly => write!(f, "nbnxn_kernel_prune"),
            Self::SumUp => write!(f, "nbnxn_kernel_sum_up"),
        }
    }
}
