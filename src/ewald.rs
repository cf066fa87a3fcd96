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

//! Ewald splitting coefficients and the real-space correction force.
//!
//! The short-range kernels need `erf(βr)` terms subtracted from the plain
//! Coulomb force for excluded and non-excluded pairs alike. This can be done
//! analytically with a rational approximation ([`pmecorr_f`]) or by linear
//! interpolation in a table ([`EwaldCorrectionTable`]).

use std::f64::consts::PI;

/// Finds β such that `erfc(β rc) = rtol` by bisection
pub fn calc_ewald_coeff_q(rc: f64, rtol: f64) -> f64 {
    bisect_coefficient(rc, rtol, |beta, rc| libm::erfc(beta * rc))
}

/// Finds β such that the relative LJ-PME dispersion tail at `rc` equals `rtol`
pub fn calc_ewald_coeff_lj(rc: f64, rtol: f64) -> f64 {
    bisect_coefficient(rc, rtol, lj_ewald_tail)
}

/// `exp(-x²)(1 + x² + x⁴/2)` with `x = β rc`
fn lj_ewald_tail(beta: f64, rc: f64) -> f64 {
    let x2 = (beta * rc).powi(2);
    (-x2).exp() * (1.0 + x2 + 0.5 * x2 * x2)
}

fn bisect_coefficient(rc: f64, rtol: f64, tail: impl Fn(f64, f64) -> f64) -> f64 {
    let mut beta = 5.0;
    let mut doublings = 0;
    loop {
        doublings += 1;
        beta *= 2.0;
        if tail(beta, rc) <= rtol {
            break;
        }
    }
    let (mut low, mut high) = (0.0, beta);
    for _ in 0..doublings + 60 {
        beta = 0.5 * (low + high);
        if tail(beta, rc) > rtol {
            low = beta;
        } else {
            high = beta;
        }
    }
    beta
}

/// Potential shift making the screened Coulomb energy vanish at `rc`
pub fn ewald_shift(beta: f64, rc: f64) -> f64 {
    libm::erfc(beta * rc) / rc
}

/// Potential shift of the LJ-PME grid term at `rc`
pub fn lj_ewald_shift(beta_lj: f64, rc: f64) -> f64 {
    (lj_ewald_tail(beta_lj, rc) - 1.0) / rc.powi(6)
}

/// Rational approximation of the Ewald real-space force correction.
///
/// For `z2 = β²r²` returns `F(z)` with `β³ F(z) = -erf(βr)/r³ + 2β exp(-β²r²)/(√π r²)`,
/// accurate to single precision for `z2 < 16`.
#[inline]
pub fn pmecorr_f(z2: f32) -> f32 {
    const FN6: f32 = -1.735_732_3e-8;
    const FN5: f32 = 1.470_362_4e-6;
    const FN4: f32 = -0.000_053_401_64;
    const FN3: f32 = 0.001_005_472_1;
    const FN2: f32 = -0.019_278_317;
    const FN1: f32 = 0.069_670_166;
    const FN0: f32 = -0.752_252_05;

    const FD4: f32 = 0.001_119_346_3;
    const FD3: f32 = 0.014_866_955;
    const FD2: f32 = 0.115_838_42;
    const FD1: f32 = 0.507_365_9;
    const FD0: f32 = 1.0;

    let z4 = z2 * z2;

    let mut polyfd0 = FD4 * z4 + FD2;
    let polyfd1 = FD3 * z4 + FD1;
    polyfd0 = polyfd0 * z4 + FD0;
    polyfd0 = polyfd1 * z2 + polyfd0;
    let inv = 1.0 / polyfd0;

    let mut polyfn0 = FN6 * z4 + FN4;
    let mut polyfn1 = FN5 * z4 + FN3;
    polyfn0 = polyfn0 * z4 + FN2;
    polyfn1 = polyfn1 * z4 + FN1;
    polyfn0 = polyfn0 * z4 + FN0;
    polyfn0 = polyfn1 * z2 + polyfn0;

    polyfn0 * inv
}

/// `erf(βr)/r² - 2β exp(-β²r²)/(√π r)`, the force subtracted from `1/r²`
fn correction_force(beta: f64, r: f64) -> f64 {
    if r == 0.0 {
        return 0.0;
    }
    let br = beta * r;
    libm::erf(br) / (r * r) - 2.0 * beta / PI.sqrt() * (-br * br).exp() / r
}

/// Table of the Ewald correction force on a uniform grid in r.
#[derive(Clone, Debug, PartialEq)]
pub struct EwaldCorrectionTable {
    /// Points per nm
    pub scale: f64,
    /// Correction force at `i / scale`
    pub table_f: Vec<f32>,
}

/// Grid points per 1/β
const POINTS_PER_SCREENING_LENGTH: f64 = 256.0;

impl EwaldCorrectionTable {
    /// Tabulates up to `rc` with two points of margin for the interpolation stencil
    pub fn new(beta: f64, rc: f64) -> Self {
        let scale = POINTS_PER_SCREENING_LENGTH * beta;
        let size = (rc * scale) as usize + 2;
        let table_f = (0..size)
            .map(|i| correction_force(beta, i as f64 / scale) as f32)
            .collect();
        Self { scale, table_f }
    }

    pub fn len(&self) -> usize {
        self.table_f.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table_f.is_empty()
    }

    /// Linear interpolation of the correction force at distance `r`
    pub fn interpolate(&self, r: f32) -> f32 {
        interpolate_coulomb_force_r(&self.table_f, self.scale as f32, r)
    }
}

/// Interpolation used by the kernels; `r` must lie inside the tabulated range
#[inline]
pub fn interpolate_coulomb_force_r(table: &[f32], scale: f32, r: f32) -> f32 {
    let normalized = scale * r;
    let index = normalized as usize;
    let fraction = normalized - index as f32;
    let left = table[index];
    let right = table[index + 1];
    fraction.mul_add(right - left, left)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_ewald_coefficient() {
        let beta = calc_ewald_coeff_q(1.0, 1e-5);
        assert_relative_eq!(libm::erfc(beta), 1e-5, max_relative = 1e-9);
        assert_relative_eq!(beta, 3.123_413, epsilon = 1e-5);

        let beta_lj = calc_ewald_coeff_lj(1.2, 1e-3);
        assert_relative_eq!(lj_ewald_tail(beta_lj, 1.2), 1e-3, max_relative = 1e-9);
    }

    #[test]
    fn test_pmecorr_matches_erf() {
        for i in 1..200 {
            let z = i as f64 * 0.02;
            let exact = -libm::erf(z) / z.powi(3) + 2.0 * (-z * z).exp() / (PI.sqrt() * z * z);
            let approx = pmecorr_f((z * z) as f32) as f64;
            assert_relative_eq!(approx, exact, max_relative = 2e-5, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_table_interpolation() {
        let beta = 3.12;
        let table = EwaldCorrectionTable::new(beta, 1.0);
        assert_eq!(table.table_f[0], 0.0);
        assert!(table.len() as f64 > table.scale);
        for r in [0.05, 0.1, 0.333, 0.5, 0.77, 0.999] {
            let exact = correction_force(beta, r);
            assert_relative_eq!(
                table.interpolate(r as f32) as f64,
                exact,
                max_relative = 1e-4,
                epsilon = 1e-4
            );
            // Analytical and tabulated flavours agree
            let ana = -(pmecorr_f((beta * beta * r * r) as f32) as f64) * beta.powi(3) * r;
            assert_relative_eq!(ana, exact, max_relative = 1e-4, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_shifts() {
        assert_relative_eq!(ewald_shift(3.0, 1.0), libm::erfc(3.0));
        // Without screening the LJ-PME shift vanishes
        assert_relative_eq!(lj_ewald_shift(0.0, 1.0), 0.0);
        assert!(lj_ewald_shift(3.0, 1.0) < 0.0);
    }
}
