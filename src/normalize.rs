//! Turns accumulated values and weights into a finished Fourier volume, and
//! that volume into real space.

use ndarray::{Array3, Axis};
use num_complex::Complex32;

use crate::config::{EstimateParams, Neighborhood, Normalization, ReconConfig, Weighting};
use crate::error::{invalid_state, Result};
use crate::fft::{centred_to_wrap, crop_centred, inverse_half_volume, mask_circumference, origin_phase};
use crate::lattice::{Accumulator, Dims};

/// Density correction from the emptiness of each cell's neighbourhood.
///
/// Every empty neighbour at L1 offset `d` adds `pow_a[3kc + 1 - d]` to a
/// running sum; the cell is then scaled by `pow_b[r] / (1 - alpha * sum)`
/// where `r` is its own L1 distance from the origin.
#[derive(Clone, Debug)]
pub struct EstimateWeighting {
    kc: isize,
    half: isize,
    pow_a: Vec<f32>,
    pow_b: Vec<f32>,
    alpha: f32,
    neighborhood: Neighborhood,
}

impl EstimateWeighting {
    pub fn new(params: &EstimateParams, dims: Dims) -> Self {
        let kc = (params.box_size as isize - 1) / 2;
        let vol = (params.box_size * params.box_size * params.box_size) as f32;
        let half = dims.half() as isize;

        let mut pow_a: Vec<f32> = (0..=3 * kc).map(|i| (params.a * i as f32).exp()).collect();
        pow_a[3 * kc as usize] = 0.0;
        let pow_b: Vec<f32> = (0..=3 * half).map(|i| (params.b * i as f32).exp()).collect();

        let mut max = 0.0f32;
        for_each_offset(kc, |i, j, k| {
            max += pow_a[(3 * kc + 1 - i.abs() - j.abs() - k.abs()) as usize];
        });
        let alpha = (1.0 - 1.0 / vol) / max;

        Self {
            kc,
            half,
            pow_a,
            pow_b,
            alpha,
            neighborhood: params.neighborhood,
        }
    }

    /// Multiplier for the cell stored at `[z, y, x]`.
    pub fn factor(&self, weight: &Array3<f32>, z: usize, y: usize, x: usize) -> f32 {
        let h = self.half;
        let (cx, cy, cz) = (x as isize, y as isize - h, z as isize - h);
        let sum = match self.neighborhood {
            Neighborhood::Literal => self.literal_sum(weight, cx, cy, cz),
            Neighborhood::Corrected => self.corrected_sum(weight, cx, cy, cz),
        };
        let r = (cx.abs() + cy.abs() + cz.abs()) as usize;
        self.pow_b[r.min(self.pow_b.len() - 1)] / (1.0 - self.alpha * sum)
    }

    fn empty_at(&self, weight: &Array3<f32>, nx: isize, ny: isize, nz: isize) -> bool {
        let h = self.half;
        if nx < 0 {
            return false;
        }
        weight.get([(nz + h) as usize, (ny + h) as usize, nx as usize]) == Some(&0.0)
    }

    fn falloff(&self, ii: isize, jj: isize, kk: isize) -> f32 {
        self.pow_a[(3 * self.kc + 1 - ii.abs() - jj.abs() - kk.abs()) as usize]
    }

    /// Box walk with `z` following the `y` offset. A neighbour with negative
    /// `x` is reflected through the origin, and the reflected `x` and `y`
    /// stay in effect for the rest of their loops.
    fn literal_sum(&self, weight: &Array3<f32>, cx: isize, cy: isize, cz: isize) -> f32 {
        let (kc, h) = (self.kc, self.half);
        let mut sum = 0.0f32;
        for ii in -kc..=kc {
            let mut nx = cx + ii;
            if nx >= h {
                continue;
            }
            for jj in -kc..=kc {
                let mut ny = cy + jj;
                if ny <= -h || ny >= h {
                    continue;
                }
                for kk in -kc..=kc {
                    let mut nz = cz + jj;
                    if nz <= -h || nz >= h {
                        continue;
                    }
                    if nx < 0 {
                        nx = -nx;
                        ny = -ny;
                        nz = -nz;
                    }
                    if (ii, jj, kk) == (0, 0, 0) {
                        continue;
                    }
                    if self.empty_at(weight, nx, ny, nz) {
                        sum += self.falloff(ii, jj, kk);
                    }
                }
            }
        }
        sum
    }

    /// Box walk over every offset, each reflected on its own.
    fn corrected_sum(&self, weight: &Array3<f32>, cx: isize, cy: isize, cz: isize) -> f32 {
        let h = self.half;
        let mut sum = 0.0f32;
        for_each_offset(self.kc, |ii, jj, kk| {
            let (mut nx, mut ny, mut nz) = (cx + ii, cy + jj, cz + kk);
            if nx >= h || ny <= -h || ny >= h || nz <= -h || nz >= h {
                return;
            }
            if nx < 0 {
                nx = -nx;
                ny = -ny;
                nz = -nz;
            }
            if self.empty_at(weight, nx, ny, nz) {
                sum += self.falloff(ii, jj, kk);
            }
        });
        sum
    }
}

/// Visit every offset of the `(2kc+1)^3` box except the centre.
fn for_each_offset(kc: isize, mut f: impl FnMut(isize, isize, isize)) {
    for i in -kc..=kc {
        for j in -kc..=kc {
            for k in -kc..=kc {
                if i != 0 || j != 0 || k != 0 {
                    f(i, j, k);
                }
            }
        }
    }
}

/// Divides accumulated values by their weights under one strategy.
pub struct Normalizer<'a> {
    strategy: &'a Normalization,
    estimate: Option<EstimateWeighting>,
    sign: f32,
    npad: usize,
    recentre: bool,
}

impl<'a> Normalizer<'a> {
    pub fn new(config: &'a ReconConfig, dims: Dims) -> Self {
        let estimate = match &config.weighting {
            Weighting::None => None,
            Weighting::Estimate(p) => Some(EstimateWeighting::new(p, dims)),
        };
        Self {
            strategy: &config.normalization,
            estimate,
            sign: config.sign as f32,
            npad: config.npad,
            recentre: true,
        }
    }

    /// Leave out the origin phase and the sign, so the result stays in the
    /// convention of the inserted slices.
    pub fn without_recentring(mut self) -> Self {
        self.recentre = false;
        self
    }

    /// One cell under the strategy alone, before sign and density factors.
    /// `radius` is the cell's frequency radius in padded lattice units.
    pub fn cell(&self, v: Complex32, w: f32, power: Option<f32>, radius: f32) -> Complex32 {
        if w <= 0.0 {
            return Complex32::new(0.0, 0.0);
        }
        match self.strategy {
            Normalization::Average => v / w,
            Normalization::Wiener => v / (w * (1.0 + 1.0 / w)),
            Normalization::WienerSnr { snr } => v / (w + 1.0 / snr.at(radius, self.npad)),
            Normalization::Dlog => {
                let mag2 = v.norm_sqr();
                match power {
                    Some(p) if mag2 > 0.0 => v * ((p / w) / mag2).sqrt(),
                    _ => Complex32::new(0.0, 0.0),
                }
            }
        }
    }

    /// Normalize every cell of `acc` in place, including the origin phase
    /// that puts the real-space centre on voxel `n/2` and the configured
    /// overall sign.
    pub fn apply(&self, acc: &mut Accumulator) -> Result<()> {
        let dims = acc.dims();
        let h = dims.half() as isize;
        let dlog = matches!(self.strategy, Normalization::Dlog);
        let (data, weight, power) = acc.parts_mut();
        if dlog && power.is_none() {
            return Err(invalid_state("dlog normalization needs a power volume"));
        }
        for ((z, y, x), v) in data.indexed_iter_mut() {
            let w = weight[[z, y, x]];
            if w <= 0.0 {
                *v = Complex32::new(0.0, 0.0);
                continue;
            }
            let (kx, ky, kz) = (x as isize, y as isize - h, z as isize - h);
            let radius = ((kx * kx + ky * ky + kz * kz) as f32).sqrt();
            let mut out = self.cell(*v, w, power.map(|p| p[[z, y, x]]), radius);
            if let Some(est) = &self.estimate {
                out *= est.factor(weight, z, y, x);
            }
            *v = if self.recentre {
                out * origin_phase(kx + ky + kz, dims.n).conj() * self.sign
            } else {
                out
            };
        }
        Ok(())
    }
}

/// Inverse transform a normalized centred half-space volume and cut out the
/// `base^3` result.
pub fn to_real_space(data: &Array3<Complex32>, base: usize, mask: bool) -> Array3<f32> {
    let padded = inverse_half_volume(centred_to_wrap(data));
    let mut out = if padded.len_of(Axis(0)) == base {
        padded
    } else {
        crop_centred(&padded, base)
    };
    if mask {
        mask_circumference(&mut out);
    }
    out
}
