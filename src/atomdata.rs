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

//! Host-side atom data in the layout consumed by the kernels.

use crate::constants::{shift_index, NUM_SHIFT_VECTORS, SHIFT_BOX};
use crate::{Matrix3, Vector3};
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// How LJ parameters of unlike atom types are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CombinationRule {
    /// Full type-pair matrix, looked up per pair
    None,
    #[default]
    Geometric,
    LorentzBerthelot,
}

impl std::fmt::Display for CombinationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Lennard-Jones parameters of one atom type
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LjParams {
    /// nm
    pub sigma: f64,
    /// kJ/mol
    pub epsilon: f64,
}

impl LjParams {
    pub const fn new(sigma: f64, epsilon: f64) -> Self {
        Self { sigma, epsilon }
    }
    pub fn c6(&self) -> f64 {
        4.0 * self.epsilon * self.sigma.powi(6)
    }
    pub fn c12(&self) -> f64 {
        4.0 * self.epsilon * self.sigma.powi(12)
    }
}

/// Atom data handed over by the pair search.
///
/// Positions and charges are packed as `[x, y, z, q]`. The first
/// `num_local` atoms are home atoms, the rest are halo atoms. Forces
/// downloaded from the device end up in `f`.
#[derive(Debug, Clone)]
pub struct NbAtomData {
    pub comb_rule: CombinationRule,
    /// Per-type parameters the tables were built from
    pub lj_params: Vec<LjParams>,
    /// `(6 C6, 12 C12)` for each type pair, row-major
    pub nbfp: Vec<[f32; 2]>,
    /// Per-type LJ-PME grid parameters
    pub nbfp_comb: Vec<[f32; 2]>,
    /// Per-atom combination parameters
    pub lj_comb: Vec<[f32; 2]>,
    pub atom_types: Vec<i32>,
    pub xq: Vec<[f32; 4]>,
    pub num_local: usize,
    pub shift_vec: Vec<[f32; 4]>,
    /// Shift vectors change every step
    pub dynamic_box: bool,
    pub f: Vec<[f32; 3]>,
}

impl NbAtomData {
    pub fn new(lj_params: &[LjParams], comb_rule: CombinationRule) -> Result<Self> {
        anyhow::ensure!(!lj_params.is_empty(), "At least one atom type is required");
        let nbfp = itertools::iproduct!(lj_params.iter(), lj_params.iter())
            .map(|(a, b)| {
                let (c6, c12) = match comb_rule {
                    CombinationRule::Geometric => ((a.c6() * b.c6()).sqrt(), (a.c12() * b.c12()).sqrt()),
                    CombinationRule::LorentzBerthelot | CombinationRule::None => {
                        let mixed = LjParams::new(
                            0.5 * (a.sigma + b.sigma),
                            (a.epsilon * b.epsilon).sqrt(),
                        );
                        (mixed.c6(), mixed.c12())
                    }
                };
                [(6.0 * c6) as f32, (12.0 * c12) as f32]
            })
            .collect();
        let nbfp_comb = lj_params
            .iter()
            .map(|p| match comb_rule {
                CombinationRule::LorentzBerthelot => {
                    [(0.5 * p.sigma) as f32, (24.0 * p.epsilon).sqrt() as f32]
                }
                _ => [(6.0 * p.c6()).sqrt() as f32, (12.0 * p.c12()).sqrt() as f32],
            })
            .collect();
        Ok(Self {
            comb_rule,
            lj_params: lj_params.to_vec(),
            nbfp,
            nbfp_comb,
            lj_comb: Vec::new(),
            atom_types: Vec::new(),
            xq: Vec::new(),
            num_local: 0,
            shift_vec: vec![[0.0; 4]; NUM_SHIFT_VECTORS],
            dynamic_box: false,
            f: Vec::new(),
        })
    }

    pub fn num_types(&self) -> usize {
        self.lj_params.len()
    }

    pub fn num_atoms(&self) -> usize {
        self.xq.len()
    }

    /// Replaces all atoms; the force output is resized and zeroed
    pub fn set_atoms(&mut self, xq: Vec<[f32; 4]>, atom_types: Vec<i32>, num_local: usize) -> Result<()> {
        anyhow::ensure!(
            xq.len() == atom_types.len(),
            "Got {} positions but {} atom types",
            xq.len(),
            atom_types.len()
        );
        anyhow::ensure!(num_local <= xq.len(), "More local atoms than atoms");
        let num_types = self.num_types() as i32;
        if let Some(t) = atom_types.iter().find(|&&t| t < 0 || t >= num_types) {
            anyhow::bail!("Atom type {t} out of range (0..{num_types})");
        }
        self.lj_comb = atom_types
            .iter()
            .map(|&t| self.comb_params(t as usize))
            .collect();
        self.f = vec![[0.0; 3]; xq.len()];
        self.xq = xq;
        self.atom_types = atom_types;
        self.num_local = num_local;
        Ok(())
    }

    /// Per-atom parameters whose combination gives the pair parameters in the kernel
    fn comb_params(&self, atom_type: usize) -> [f32; 2] {
        let p = &self.lj_params[atom_type];
        match self.comb_rule {
            CombinationRule::Geometric => {
                [(6.0 * p.c6()).sqrt() as f32, (12.0 * p.c12()).sqrt() as f32]
            }
            CombinationRule::LorentzBerthelot => [
                (0.5 * 2f64.powf(1.0 / 6.0) * p.sigma) as f32,
                (12.0 * p.epsilon).sqrt() as f32,
            ],
            CombinationRule::None => [0.0; 2],
        }
    }

    /// Updates positions only, e.g. after integration
    pub fn set_positions(&mut self, xq: &[[f32; 4]]) -> Result<()> {
        anyhow::ensure!(xq.len() == self.xq.len(), "Atom count changed without a new search");
        self.xq.copy_from_slice(xq);
        Ok(())
    }

    /// Computes the periodic shift vectors from box vectors stored as matrix columns
    pub fn set_box(&mut self, box_matrix: &Matrix3) {
        for z in -SHIFT_BOX[2]..=SHIFT_BOX[2] {
            for y in -SHIFT_BOX[1]..=SHIFT_BOX[1] {
                for x in -SHIFT_BOX[0]..=SHIFT_BOX[0] {
                    let shift: Vector3 = box_matrix * Vector3::new(x as f64, y as f64, z as f64);
                    self.shift_vec[shift_index(x, y, z)] =
                        [shift.x as f32, shift.y as f32, shift.z as f32, 0.0];
                }
            }
        }
    }
}
