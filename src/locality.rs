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

//! Local and non-local work split.

use crate::error::NbnxmError;
use anyhow::Result;
use std::ops::Range;

/// Which pairlist and stream an interaction belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionLocality {
    /// Interactions between home atoms
    Local,
    /// Interactions involving halo atoms
    NonLocal,
}

impl InteractionLocality {
    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Local => 0,
            Self::NonLocal => 1,
        }
    }
}

impl std::fmt::Display for InteractionLocality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::NonLocal => write!(f, "non-local"),
        }
    }
}

/// Which atoms a transfer covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomLocality {
    Local,
    NonLocal,
    All,
}

impl AtomLocality {
    /// Transfers of all atoms have no single stream
    pub fn interaction_locality(self) -> Result<InteractionLocality> {
        match self {
            Self::Local => Ok(InteractionLocality::Local),
            Self::NonLocal => Ok(InteractionLocality::NonLocal),
            Self::All => Err(NbnxmError::MissingLocality("all-atom".into()).into()),
        }
    }

    /// Atom index range: home atoms come first, halo atoms after
    pub fn atom_range(self, num_local: usize, num_atoms: usize) -> Range<usize> {
        match self {
            Self::Local => 0..num_local,
            Self::NonLocal => num_local..num_atoms,
            Self::All => 0..num_atoms,
        }
    }
}

/// What the current step needs besides forces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepWork {
    pub compute_energy: bool,
    pub compute_virial: bool,
    /// Forces stay on the device for a later reduction; no download
    pub use_gpu_f_buffer_ops: bool,
}
