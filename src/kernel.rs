//! Interpolation kernels that scatter one Fourier sample into the lattice.
//!
//! Coordinates handed to [`KernelMode::scatter`] are lattice coordinates:
//! `x` is the (non-negative) complex index along the fast axis, `y` and `z`
//! are centred indices. Footprints that would leave the valid lattice range
//! contribute nothing at all; there is no partial clipping.

use std::f32::consts::PI;
use std::ops::RangeInclusive;

use num_complex::Complex32;
use once_cell::sync::Lazy;

use crate::error::{invalid_config, ReconError};
use crate::lattice::Accumulator;

/// Gaussian width of the 8-cell trilinear kernel.
pub const I2G: f32 = 4.0 / (PI * PI);
/// Falloff of the 3x3x3 kernel.
pub const I3G: f32 = 6.4 / (PI * PI);
/// Falloff of the 4x4x4 kernel.
pub const I4G: f32 = 8.8 / (PI * PI);
/// Falloff of the 5x5x5 kernels.
pub const I5G: f32 = 10.4 / (PI * PI);

/// Lookup table steps per lattice unit.
const TABLE_STEPS: f32 = 39.0;
const TABLE_EDGE: usize = 100;

const HYPERG_STEP: f32 = 1.0e-4;
const HYPERG_LEN: usize = 50_000;

/// `exp(-r / I5G)` sampled on a 1/39 lattice-unit grid, indexed by the
/// absolute per-axis offsets.
static GAUSS_TABLE: Lazy<Vec<f32>> = Lazy::new(|| {
    let mut table = vec![0.0f32; TABLE_EDGE * TABLE_EDGE * TABLE_EDGE];
    for k in 0..TABLE_EDGE {
        for j in 0..TABLE_EDGE {
            for i in 0..TABLE_EDGE {
                let r = ((i * i + j * j + k * k) as f32).sqrt() / TABLE_STEPS;
                table[i + j * TABLE_EDGE + k * TABLE_EDGE * TABLE_EDGE] = (-r / I5G).exp();
            }
        }
    }
    table
});

/// `1F1(1; 3/2; -v^2)` tabulated on `[0, 5)`.
static HYPERG_TABLE: Lazy<Vec<f32>> = Lazy::new(|| {
    (0..HYPERG_LEN)
        .map(|i| kummer_1_3half(i as f64 * HYPERG_STEP as f64) as f32)
        .collect()
});

/// Evaluates `1F1(1; 3/2; -v^2)` through Kummer's transformation,
/// `exp(-v^2) * sum_k v^(2k) / ((2k+1) k!)`, which keeps every term positive.
fn kummer_1_3half(v: f64) -> f64 {
    let z = v * v;
    let mut term = 1.0f64;
    let mut sum = 1.0f64;
    let mut k = 0.0f64;
    loop {
        k += 1.0;
        term *= z / k;
        let add = term / (2.0 * k + 1.0);
        sum += add;
        if k > z && add < sum * 1.0e-16 {
            break;
        }
    }
    (-z).exp() * sum
}

/// Radial hypergeometric basis function; zero outside `[0, 5)`.
pub fn hyperg(v: f32) -> f32 {
    if !(0.0..=4.9999).contains(&v) {
        return 0.0;
    }
    HYPERG_TABLE[((v / HYPERG_STEP) as usize).min(HYPERG_LEN - 1)]
}

fn gauss_lookup(offset: [f32; 3]) -> f32 {
    let idx = |d: f32| ((d * TABLE_STEPS).round().abs() as usize).min(TABLE_EDGE - 1);
    GAUSS_TABLE[idx(offset[0]) + idx(offset[1]) * TABLE_EDGE + idx(offset[2]) * TABLE_EDGE * TABLE_EDGE]
}

/// One weighted Fourier sample on its way into the lattice.
///
/// `value`, `weight` and `power` are already multiplied by the slice's
/// reliability weight; the kernel scales them, and `count`, by its falloff.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    pub value: Complex32,
    pub weight: f32,
    pub power: f32,
    /// The reliability weight alone.
    pub count: f32,
    /// Slice value before any weighting.
    pub raw: Complex32,
    /// CTF at the sample's radius, 1 without one.
    pub ctf: f32,
}

impl Sample {
    /// A sample `v` inserted with reliability weight `w`.
    pub fn weighted(v: Complex32, w: f32) -> Self {
        Self {
            value: v * w,
            weight: w,
            power: w * v.norm_sqr(),
            count: w,
            raw: v,
            ctf: 1.0,
        }
    }

    pub fn conj(self) -> Self {
        Self {
            value: self.value.conj(),
            raw: self.raw.conj(),
            ..self
        }
    }
}

/// The interpolation footprint used by a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelMode {
    /// Single nearest cell.
    Nearest,
    /// The 8 cells of the enclosing unit cube, separable Gaussian.
    Trilinear,
    /// 3x3x3 around the nearest cell, `exp(-r/I3G)`.
    Gaussian3,
    /// 4x4x4 from the floored cell, `exp(-r/I4G)`.
    Gaussian4,
    /// 5x5x5 around the nearest cell, `exp(-r/I5G)` from a lookup table.
    GaussianTable,
    /// 5x5x5 around the nearest cell, `exp(-r/I5G)` computed directly.
    Gaussian5,
    /// 5x5x5 around the nearest cell, hypergeometric falloff.
    Hypergeometric,
}

impl TryFrom<u8> for KernelMode {
    type Error = ReconError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::Nearest),
            2 => Ok(Self::Trilinear),
            3 => Ok(Self::Gaussian3),
            4 => Ok(Self::Gaussian4),
            5 => Ok(Self::GaussianTable),
            6 => Ok(Self::Gaussian5),
            7 => Ok(Self::Hypergeometric),
            other => Err(invalid_config(format!("no such insert slice mode: {other}"))),
        }
    }
}

/// Integer ranges of a kernel footprint in lattice indices.
struct Footprint {
    x: RangeInclusive<isize>,
    y: RangeInclusive<isize>,
    z: RangeInclusive<isize>,
}

fn round(v: f32) -> isize {
    (v + 0.5).floor() as isize
}

fn splat(acc: &mut Accumulator, p: [f32; 3], s: Sample, fp: Footprint, falloff: impl Fn([f32; 3]) -> f32) {
    for k in fp.z.clone() {
        for j in fp.y.clone() {
            for i in fp.x.clone() {
                let g = falloff([i as f32 - p[0], j as f32 - p[1], k as f32 - p[2]]);
                acc.add_sample(k as usize, j as usize, i as usize, &s, g);
            }
        }
    }
}

fn radius(d: [f32; 3]) -> f32 {
    (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt()
}

impl KernelMode {
    pub fn code(self) -> u8 {
        match self {
            Self::Nearest => 1,
            Self::Trilinear => 2,
            Self::Gaussian3 => 3,
            Self::Gaussian4 => 4,
            Self::GaussianTable => 5,
            Self::Gaussian5 => 6,
            Self::Hypergeometric => 7,
        }
    }

    /// Insert a sample given by its frequency coordinates `k` (origin at 0).
    ///
    /// Samples with negative `kx` are reflected through the origin and
    /// conjugated first, since only the non-negative half is stored.
    pub fn scatter_frequency(self, acc: &mut Accumulator, k: [f32; 3], sample: Sample) -> bool {
        let (k, sample) = if k[0] < 0.0 {
            ([-k[0], -k[1], -k[2]], sample.conj())
        } else {
            (k, sample)
        };
        let h = acc.dims().half() as f32;
        self.scatter(acc, [k[0], k[1] + h, k[2] + h], sample)
    }

    /// Insert a sample at lattice coordinates `p` (`p[0] >= 0`).
    ///
    /// Returns `false` when the footprint fell outside the lattice and
    /// nothing was written.
    pub fn scatter(self, acc: &mut Accumulator, p: [f32; 3], sample: Sample) -> bool {
        match self {
            Self::Nearest => nearest(acc, p, sample),
            Self::Trilinear => trilinear(acc, p, sample),
            Self::Gaussian3 => gaussian3(acc, p, sample),
            Self::Gaussian4 => gaussian4(acc, p, sample),
            Self::GaussianTable => wide(acc, p, sample, gauss_lookup),
            Self::Gaussian5 => wide(acc, p, sample, |d| (-radius(d) / I5G).exp()),
            Self::Hypergeometric => wide(acc, p, sample, |d| hyperg(radius(d).sqrt())),
        }
    }
}

fn nearest(acc: &mut Accumulator, p: [f32; 3], s: Sample) -> bool {
    let dims = acc.dims();
    let (x0, y0, z0) = (round(p[0]), round(p[1]), round(p[2]));
    let n = dims.n as isize;
    if x0 < 0 || x0 >= dims.nxc() as isize || y0 < 0 || y0 >= n || z0 < 0 || z0 >= n {
        return false;
    }
    acc.add_sample(z0 as usize, y0 as usize, x0 as usize, &s, 1.0);
    true
}

/// Gaussian weights of the 8 cube corners for fractional offsets `d`.
pub(crate) fn trilinear_weights(d: [f32; 3]) -> [f32; 8] {
    let mut g = [0.0f32; 8];
    for (c, gc) in g.iter_mut().enumerate() {
        let dx = if c & 1 == 0 { d[0] } else { 1.0 - d[0] };
        let dy = if c & 2 == 0 { d[1] } else { 1.0 - d[1] };
        let dz = if c & 4 == 0 { d[2] } else { 1.0 - d[2] };
        *gc = (-(dx * dx + dy * dy + dz * dz) / I2G).exp();
    }
    g
}

/// Floored origin of the trilinear cube, if all 8 corners are on the lattice.
pub(crate) fn trilinear_origin(nxc: usize, n: usize, p: [f32; 3]) -> Option<[usize; 3]> {
    let (x0, y0, z0) = (p[0].floor(), p[1].floor(), p[2].floor());
    if x0 < 0.0 || y0 < 0.0 || z0 < 0.0 {
        return None;
    }
    let (x0, y0, z0) = (x0 as usize, y0 as usize, z0 as usize);
    if x0 + 1 >= nxc || y0 + 1 >= n || z0 + 1 >= n {
        return None;
    }
    Some([x0, y0, z0])
}

fn trilinear(acc: &mut Accumulator, p: [f32; 3], s: Sample) -> bool {
    let dims = acc.dims();
    let Some([x0, y0, z0]) = trilinear_origin(dims.nxc(), dims.n, p) else {
        return false;
    };
    let g = trilinear_weights([p[0] - x0 as f32, p[1] - y0 as f32, p[2] - z0 as f32]);
    for (c, gc) in g.iter().enumerate() {
        let x = x0 + (c & 1);
        let y = y0 + ((c >> 1) & 1);
        let z = z0 + ((c >> 2) & 1);
        acc.add_sample(z, y, x, &s, *gc);
    }
    true
}

/// Margin test shared by the extended kernels: the origin must leave room
/// for two cells on the high side of every axis and two on the low side of
/// `y` and `z`.
fn inside_margins(acc: &Accumulator, x0: isize, y0: isize, z0: isize) -> bool {
    let dims = acc.dims();
    let n = dims.n as isize;
    x0 < dims.nxc() as isize - 2 && y0 >= 2 && y0 <= n - 3 && z0 >= 2 && z0 <= n - 3
}

fn gaussian3(acc: &mut Accumulator, p: [f32; 3], s: Sample) -> bool {
    let (x0, y0, z0) = (round(p[0]), round(p[1]), round(p[2]));
    if !inside_margins(acc, x0, y0, z0) {
        return false;
    }
    let lo = if x0 == 0 { 0 } else { x0 - 1 };
    let fp = Footprint {
        x: lo..=x0 + 1,
        y: y0 - 1..=y0 + 1,
        z: z0 - 1..=z0 + 1,
    };
    splat(acc, p, s, fp, |d| (-radius(d) / I3G).exp());
    true
}

fn gaussian4(acc: &mut Accumulator, p: [f32; 3], s: Sample) -> bool {
    let (x0, y0, z0) = (p[0].floor() as isize, p[1].floor() as isize, p[2].floor() as isize);
    if !inside_margins(acc, x0, y0, z0) {
        return false;
    }
    let lo = if x0 == 0 { 0 } else { x0 - 1 };
    let fp = Footprint {
        x: lo..=x0 + 2,
        y: y0 - 1..=y0 + 2,
        z: z0 - 1..=z0 + 2,
    };
    splat(acc, p, s, fp, |d| (-radius(d) / I4G).exp());
    true
}

/// The 5x5x5 kernels. When the footprint reaches the `x = 0` plane, the
/// Friedel mate at `-p` also spills into the stored half, so it is inserted
/// a second time, mirrored and conjugated.
fn wide(acc: &mut Accumulator, p: [f32; 3], s: Sample, falloff: impl Fn([f32; 3]) -> f32 + Copy) -> bool {
    let (x0, y0, z0) = (round(p[0]), round(p[1]), round(p[2]));
    if !inside_margins(acc, x0, y0, z0) {
        return false;
    }
    let lo = if x0 <= 1 { 0 } else { x0 - 2 };
    let fp = Footprint {
        x: lo..=x0 + 2,
        y: y0 - 2..=y0 + 2,
        z: z0 - 2..=z0 + 2,
    };
    splat(acc, p, s, fp, falloff);

    if x0 <= 1 {
        let two_h = 2.0 * acc.dims().half() as f32;
        let n = acc.dims().n as isize;
        let m = [-p[0], two_h - p[1], two_h - p[2]];
        let (mx, my, mz) = (round(m[0]), round(m[1]), round(m[2]));
        if my < 2 || my > n - 3 || mz < 2 || mz > n - 3 {
            return true;
        }
        let fp = Footprint {
            x: 0..=mx + 2,
            y: my - 2..=my + 2,
            z: mz - 2..=mz + 2,
        };
        splat(acc, m, s.conj(), fp, falloff);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::Dims;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn total_weight(acc: &Accumulator) -> f32 {
        acc.weight().sum()
    }

    #[test]
    fn codes_round_trip_and_unknown_codes_fail() {
        for code in 1..=7u8 {
            assert_eq!(KernelMode::try_from(code).unwrap().code(), code);
        }
        assert!(KernelMode::try_from(0).is_err());
        assert!(KernelMode::try_from(8).is_err());
    }

    #[test]
    fn nearest_hits_one_cell() {
        let mut acc = Accumulator::new(Dims::new(8), false);
        let s = Sample::weighted(Complex32::new(2.0, -1.0), 0.5);
        assert!(KernelMode::Nearest.scatter(&mut acc, [1.4, 4.6, 2.2], s));
        assert_eq!(acc.weight()[[2, 5, 1]], 0.5);
        assert_eq!(acc.data()[[2, 5, 1]], Complex32::new(1.0, -0.5));
        assert_abs_diff_eq!(total_weight(&acc), 0.5);
    }

    #[test]
    fn trilinear_on_grid_point_has_unit_centre() {
        let mut acc = Accumulator::new(Dims::new(8), false);
        let s = Sample::weighted(Complex32::new(1.0, 0.0), 1.0);
        assert!(KernelMode::Trilinear.scatter(&mut acc, [1.0, 3.0, 3.0], s));
        assert_abs_diff_eq!(acc.weight()[[3, 3, 1]], 1.0);
        assert_abs_diff_eq!(acc.weight()[[3, 3, 2]], (-1.0 / I2G).exp(), epsilon = 1e-6);
        assert_abs_diff_eq!(acc.weight()[[4, 4, 2]], (-3.0 / I2G).exp(), epsilon = 1e-6);
    }

    #[test]
    fn extended_kernels_skip_points_near_the_edge() {
        for mode in [
            KernelMode::Gaussian3,
            KernelMode::Gaussian4,
            KernelMode::GaussianTable,
            KernelMode::Gaussian5,
            KernelMode::Hypergeometric,
        ] {
            let mut acc = Accumulator::new(Dims::new(12), false);
            let s = Sample::weighted(Complex32::new(1.0, 1.0), 1.0);
            assert!(!mode.scatter(&mut acc, [2.0, 1.0, 6.0], s), "{mode:?}");
            assert!(!mode.scatter(&mut acc, [5.6, 6.0, 6.0], s), "{mode:?}");
            assert_eq!(total_weight(&acc), 0.0, "{mode:?}");
        }
    }

    #[test]
    fn lookup_table_tracks_exact_gaussian() {
        let s = Sample::weighted(Complex32::new(1.0, 0.0), 1.0);
        let mut table = Accumulator::new(Dims::new(16), false);
        let mut exact = table.zeroed_like();
        let p = [3.3, 7.8, 8.1];
        assert!(KernelMode::GaussianTable.scatter(&mut table, p, s));
        assert!(KernelMode::Gaussian5.scatter(&mut exact, p, s));
        for (a, b) in table.weight().iter().zip(exact.weight().iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 0.02);
        }
    }

    #[test]
    fn mirrored_pass_keeps_zero_plane_hermitian() {
        let n = 16;
        let dims = Dims::new(n);
        let mut acc = Accumulator::new(dims, false);
        let s = Sample::weighted(Complex32::new(0.7, 0.4), 1.0);
        assert!(KernelMode::Gaussian5.scatter(&mut acc, [0.3, 7.2, 8.4], s));
        for z in 2..n - 2 {
            for y in 2..n - 2 {
                let (pz, py) = (dims.partner(z).unwrap(), dims.partner(y).unwrap());
                let a = acc.data()[[z, y, 0]];
                let b = acc.data()[[pz, py, 0]];
                assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-5);
                assert_abs_diff_eq!(a.im, -b.im, epsilon = 1e-5);
                assert_abs_diff_eq!(acc.weight()[[z, y, 0]], acc.weight()[[pz, py, 0]], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn negative_x_reflects_and_conjugates() {
        let dims = Dims::new(16);
        for mode in [KernelMode::Nearest, KernelMode::Trilinear, KernelMode::Gaussian4] {
            let mut via_rule = Accumulator::new(dims, false);
            let mut direct = via_rule.zeroed_like();
            let v = Complex32::new(0.25, -1.5);
            let s = Sample::weighted(v, 2.0);
            mode.scatter_frequency(&mut via_rule, [-3.2, 1.7, -2.4], s);
            mode.scatter_frequency(&mut direct, [3.2, -1.7, 2.4], Sample::weighted(v.conj(), 2.0));
            assert_eq!(via_rule.data(), direct.data(), "{mode:?}");
            assert_eq!(via_rule.weight(), direct.weight(), "{mode:?}");
        }
    }

    #[test]
    fn hypergeometric_basis_is_one_at_origin_and_decays() {
        assert_relative_eq!(hyperg(0.0), 1.0, epsilon = 1e-6);
        assert!(hyperg(0.5) < 1.0);
        assert!(hyperg(1.5) < hyperg(0.5));
        assert!(hyperg(1.5) > 0.0);
        assert_eq!(hyperg(5.5), 0.0);
        assert_eq!(hyperg(-0.1), 0.0);
    }
}
