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

//! Lane-level emulation of warp shuffles and the kernel's tree reductions.
//!
//! A warp is held as one value per lane. Lane `l` of warp `w` is thread
//! `tidx = 32 w + l` of the 8x8 block, i.e. `tidxi = l % 8` and
//! `tidxj = (32 w + l) / 8`.

use crate::constants::{CLUSTER_SIZE, WARP_SIZE};
use glam::Vec3;

/// One value per lane
pub type Lanes<T> = [T; WARP_SIZE];

/// `v[l + delta]`; lanes past the end keep their own value
#[inline]
pub fn shfl_down(v: &Lanes<f32>, delta: usize) -> Lanes<f32> {
    std::array::from_fn(|l| if l + delta < WARP_SIZE { v[l + delta] } else { v[l] })
}

/// `v[l - delta]`; lanes before the start keep their own value
#[inline]
pub fn shfl_up(v: &Lanes<f32>, delta: usize) -> Lanes<f32> {
    std::array::from_fn(|l| if l >= delta { v[l - delta] } else { v[l] })
}

/// True if the predicate holds on any lane
#[inline]
pub fn any(pred: &Lanes<bool>) -> bool {
    pred.iter().any(|&p| p)
}

/// Transposing reduction of j-forces over the eight lanes sharing `tidxj`.
///
/// Afterwards lane `l` with `tidxi = l % 8 < 3` holds component `tidxi` of
/// the summed force of its row.
pub fn reduce_force_j(f: &Lanes<Vec3>) -> Lanes<f32> {
    let x = transpose_reduce(f, 1, |l| l % CLUSTER_SIZE);
    let xd = shfl_down(&x, 4);
    std::array::from_fn(|l| x[l] + xd[l])
}

/// Transposing reduction of i-forces over the four rows of a warp.
///
/// Afterwards lane `l` with `(tidxj & 3) < 3` holds component `tidxj & 3`
/// of the force summed over all lanes with the same `tidxi`.
pub fn reduce_force_i(f: &Lanes<Vec3>) -> Lanes<f32> {
    transpose_reduce(f, CLUSTER_SIZE, |l| l / CLUSTER_SIZE)
}

/// Two transposing stages with strides `s` and `2s`; `key(l) & 3` picks the component
fn transpose_reduce(f: &Lanes<Vec3>, stride: usize, key: impl Fn(usize) -> usize) -> Lanes<f32> {
    let mut x: Lanes<f32> = std::array::from_fn(|l| f[l].x);
    let mut y: Lanes<f32> = std::array::from_fn(|l| f[l].y);
    let mut z: Lanes<f32> = std::array::from_fn(|l| f[l].z);

    let (xd, yu, zd) = (shfl_down(&x, stride), shfl_up(&y, stride), shfl_down(&z, stride));
    for l in 0..WARP_SIZE {
        x[l] += xd[l];
        y[l] += yu[l];
        z[l] += zd[l];
        if key(l) & 1 != 0 {
            x[l] = y[l];
        }
    }

    let (xd, zu) = (shfl_down(&x, 2 * stride), shfl_up(&z, 2 * stride));
    for l in 0..WARP_SIZE {
        x[l] += xd[l];
        z[l] += zu[l];
        if key(l) & 2 != 0 {
            x[l] = z[l];
        }
    }
    x
}

/// Butterfly sum; the total ends up in lane 0
pub fn reduce_energy(e: &Lanes<f32>) -> f32 {
    let mut e = *e;
    let mut delta = 1;
    while delta < WARP_SIZE {
        let down = shfl_down(&e, delta);
        e.iter_mut().zip(down).for_each(|(a, b)| *a += b);
        delta *= 2;
    }
    e[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn random_forces() -> Lanes<Vec3> {
        let mut rng = SmallRng::seed_from_u64(7);
        std::array::from_fn(|_| {
            Vec3::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            )
        })
    }

    #[test]
    fn test_shuffles() {
        let v: Lanes<f32> = std::array::from_fn(|l| l as f32);
        assert_eq!(shfl_down(&v, 4)[0], 4.0);
        assert_eq!(shfl_down(&v, 4)[30], 30.0);
        assert_eq!(shfl_up(&v, 8)[9], 1.0);
        assert_eq!(shfl_up(&v, 8)[3], 3.0);
    }

    #[test]
    fn test_reduce_force_j() {
        let f = random_forces();
        let reduced = reduce_force_j(&f);
        for l in 0..WARP_SIZE {
            let tidxi = l % CLUSTER_SIZE;
            if tidxi >= 3 {
                continue;
            }
            let row = l / CLUSTER_SIZE;
            let sum: Vec3 = (0..CLUSTER_SIZE).map(|i| f[row * CLUSTER_SIZE + i]).sum();
            assert_relative_eq!(reduced[l], sum[tidxi], epsilon = 1e-5);
        }
    }

    #[test]
    fn test_reduce_force_i() {
        let f = random_forces();
        let reduced = reduce_force_i(&f);
        for l in 0..WARP_SIZE {
            let component = (l / CLUSTER_SIZE) & 3;
            if component >= 3 {
                continue;
            }
            let tidxi = l % CLUSTER_SIZE;
            let sum: Vec3 = (0..4).map(|row| f[row * CLUSTER_SIZE + tidxi]).sum();
            assert_relative_eq!(reduced[l], sum[component], epsilon = 1e-5);
        }
    }

    #[test]
    fn test_reduce_energy() {
        let e: Lanes<f32> = std::array::from_fn(|l| 0.5 * l as f32);
        assert_relative_eq!(reduce_energy(&e), 248.0);
        let mut flags = [false; WARP_SIZE];
        assert!(!any(&flags));
        flags[17] = true;
        assert!(any(&flags));
    }
}
