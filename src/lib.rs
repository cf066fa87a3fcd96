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

//! Cluster-pair nonbonded forces on accelerators.
//!
//! Atoms are grouped in clusters of [`constants::CLUSTER_SIZE`] and clusters in
//! super-clusters; one workgroup handles one super-cluster and all j-clusters
//! listed for it in a pre-built [`pairlist::HostPairlist`]. The host-side
//! [`manager::NonbondedGpu`] owns the device buffers and orders the work of the
//! local and non-local streams with explicit events.

pub mod atomdata;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod ewald;
pub mod kernel;
pub mod locality;
pub mod manager;
pub mod pairlist;
#[cfg(test)]
mod testing;

pub use atomdata::{CombinationRule, LjParams, NbAtomData};
pub use config::{InteractionConst, NonbondedSettings, PairlistParams};
pub use device::{Device, HostDevice, WgpuDevice};
pub use error::NbnxmError;
pub use locality::{AtomLocality, InteractionLocality, StepWork};
pub use manager::{NbOutputs, NbStatistics, NonbondedGpu};
pub use pairlist::HostPairlist;

#[macro_use]
extern crate log;

pub type Matrix3 = nalgebra::Matrix3<f64>;
pub type Vector3 = nalgebra::Vector3<f64>;
