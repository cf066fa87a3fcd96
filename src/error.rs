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

//! Fatal configuration and protocol errors.
//!
//! Public functions return `anyhow::Result`; the variants below are what ends
//! up inside when the failure is one of the known inconsistencies, so callers
//! may `downcast_ref::<NbnxmError>()` to match on them.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum NbnxmError {
    /// Van der Waals type without a matching kernel flavour
    UnsupportedVdwType(String),
    /// Van der Waals modifier without a matching kernel flavour
    UnsupportedVdwModifier(String),
    /// Electrostatics type without a matching kernel flavour
    UnsupportedElectrostatics(String),
    /// LJ-PME grid and short-range combination rules differ
    CombinationRuleMismatch { long_range: String, short_range: String },
    /// Plain cut-off and reaction-field kernels need rvdw == rcoulomb
    TwinCutoffUnsupported { rcoulomb: f64, rvdw: f64 },
    /// Both analytical and tabulated Ewald were forced from the environment
    ConflictingEwaldOverrides,
    /// The number of atoms per cluster changed between pairlist uploads
    ClusterSizeChanged { previous: usize, current: usize },
    /// A pairlist references data out of range
    InvalidPairlist(String),
    /// Operation needs atom data that was never uploaded
    MissingAtomData,
    /// Operation on a locality this instance was not created with
    MissingLocality(String),
    /// An event was marked again before its wait was enqueued
    EventNotConsumed,
    /// A wait was enqueued on an event that is not marked
    EventNotMarked,
    /// No compatible GPU adapter
    NoAdapter,
    /// Adapter or device creation failed
    DeviceCreation(String),
    /// Mapping a readback buffer failed
    Readback(String),
}

impl fmt::Display for NbnxmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedVdwType(t) => write!(
                f,
                "The requested VdW type {t} is not implemented in the GPU kernels"
            ),
            Self::UnsupportedVdwModifier(m) => write!(
                f,
                "The requested VdW interaction modifier {m} is not implemented in the GPU kernels"
            ),
            Self::UnsupportedElectrostatics(e) => write!(
                f,
                "The requested electrostatics type {e} is not implemented in the GPU kernels"
            ),
            Self::CombinationRuleMismatch {
                long_range,
                short_range,
            } => write!(
                f,
                "Combination rules for long-range ({long_range}) and short-range ({short_range}) interactions should match"
            ),
            Self::TwinCutoffUnsupported { rcoulomb, rvdw } => write!(
                f,
                "rcoulomb ({rcoulomb}) and rvdw ({rvdw}) must be equal without Ewald electrostatics"
            ),
            Self::ConflictingEwaldOverrides => write!(
                f,
                "Both analytical and tabulated Ewald kernels requested through environment variables"
            ),
            Self::ClusterSizeChanged { previous, current } => write!(
                f,
                "The number of atoms per cluster has changed (from {previous} to {current})"
            ),
            Self::InvalidPairlist(msg) => write!(f, "Inconsistent pairlist: {msg}"),
            Self::MissingAtomData => write!(f, "Atom data has not been initialized"),
            Self::MissingLocality(l) => write!(f, "No stream or pairlist for {l} interactions"),
            Self::EventNotConsumed => write!(f, "Trying to mark an event before it was consumed"),
            Self::EventNotMarked => write!(f, "Trying to wait for an event that was not marked"),
            Self::NoAdapter => write!(f, "No GPU adapter found"),
            Self::DeviceCreation(e) => write!(f, "Failed to create GPU device: {e}"),
            Self::Readback(e) => write!(f, "Device readback failed: {e}"),
        }
    }
}

impl std::error::Error for NbnxmError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_cluster_size() {
        let err = NbnxmError::ClusterSizeChanged {
            previous: 8,
            current: 4,
        };
        assert_eq!(
            err.to_string(),
            "The number of atoms per cluster has changed (from 8 to 4)"
        );
    }

    #[test]
    fn downcast_through_anyhow() {
        let err: anyhow::Error = NbnxmError::EventNotMarked.into();
        assert_eq!(
            err.downcast_ref::<NbnxmError>(),
            Some(&NbnxmError::EventNotMarked)
        );
    }

    #[test]
    fn display_mismatch() {
        let err = NbnxmError::CombinationRuleMismatch {
            long_range: "Geometric".into(),
            short_range: "LorentzBerthelot".into(),
        };
        assert!(err.to_string().contains("Geometric"));
        assert!(err.to_string().contains("LorentzBerthelot"));
    }
}
