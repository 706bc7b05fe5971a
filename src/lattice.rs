//! The shared accumulation state of a reconstruction: a Hermitian half-space
//! Fourier volume plus its parallel weight (and optional power) volumes.
//!
//! Arrays are indexed `[z, y, x]`. The `x` axis holds the non-negative
//! frequencies `0..=n/2`; `y` and `z` are stored centred, so lattice index
//! `i` holds frequency `i - n/2`.

use std::sync::Arc;

use ndarray::{Array3, Zip};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{invalid_size, Result};
use crate::kernel::Sample;

/// Geometry of a padded cubic Fourier lattice of edge `n`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dims {
    pub n: usize,
}

impl Dims {
    pub fn new(n: usize) -> Self {
        Self { n }
    }

    /// Centre index along `y`/`z` (frequency zero).
    pub fn half(&self) -> usize {
        self.n / 2
    }

    /// Complex cells stored along the fast axis.
    pub fn nxc(&self) -> usize {
        self.n / 2 + 1
    }

    /// 1 for odd lattices, 2 for even ones.
    pub fn parity_offset(&self) -> usize {
        if self.n % 2 == 1 {
            1
        } else {
            2
        }
    }

    /// Fast-axis extent in interleaved floats, `n + parity_offset`.
    pub fn float_extent(&self) -> usize {
        self.n + self.parity_offset()
    }

    /// `[z, y, x]` shape of the complex and weight volumes.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.n, self.n, self.nxc())
    }

    /// Signed frequency stored at centred index `i`.
    pub fn frequency(&self, i: usize) -> isize {
        i as isize - self.half() as isize
    }

    /// Centred index of the frequency `-k` where `i` holds `k`.
    pub fn partner(&self, i: usize) -> Option<usize> {
        let p = 2 * self.half() as isize - i as isize;
        (p >= 0 && (p as usize) < self.n).then_some(p as usize)
    }
}

/// Per-cell terms for the SSNR of CTF-affected data, measured against a
/// reference Fourier volume `P` in the convention of the inserted slices.
///
/// For every sample `F` with CTF value `c` and reliability weight `w` the
/// cell gains `w` in `count`, `-2 w Re(conj(F) c P)` in `cross` and
/// `w c^2 |P|^2` in `model`. Together with the power volume they sum
/// `w |F - c P|^2`.
#[derive(Clone, Debug)]
pub struct CtfResidual {
    reference: Arc<Array3<Complex32>>,
    count: Array3<f32>,
    cross: Array3<f32>,
    model: Array3<f32>,
}

impl CtfResidual {
    fn new(reference: Arc<Array3<Complex32>>) -> Self {
        let shape = reference.dim();
        Self {
            reference,
            count: Array3::zeros(shape),
            cross: Array3::zeros(shape),
            model: Array3::zeros(shape),
        }
    }

    pub fn reference(&self) -> &Array3<Complex32> {
        &self.reference
    }

    /// Summed reliability weight (`Kn`) per cell.
    pub fn count(&self) -> &Array3<f32> {
        &self.count
    }

    pub fn cross(&self) -> &Array3<f32> {
        &self.cross
    }

    pub fn model(&self) -> &Array3<f32> {
        &self.model
    }
}

/// Accumulated Fourier samples and the kernel weight behind each cell.
#[derive(Clone, Debug)]
pub struct Accumulator {
    dims: Dims,
    data: Array3<Complex32>,
    weight: Array3<f32>,
    power: Option<Array3<f32>>,
    residual: Option<CtfResidual>,
    folded: bool,
}

/// Sum cells `a` and `b` of a real volume into both.
fn fold_pair(volume: &mut Array3<f32>, a: [usize; 3], b: [usize; 3]) {
    let s = volume[a] + volume[b];
    volume[a] = s;
    volume[b] = s;
}

impl Accumulator {
    /// Zero-filled volumes for a padded lattice of edge `n`.
    pub fn new(dims: Dims, with_power: bool) -> Self {
        let shape = dims.shape();
        Self {
            dims,
            data: Array3::zeros(shape),
            weight: Array3::zeros(shape),
            power: with_power.then(|| Array3::zeros(shape)),
            residual: None,
            folded: false,
        }
    }

    /// Adopt buffers produced elsewhere (for instance by another worker).
    pub fn from_parts(
        data: Array3<Complex32>,
        weight: Array3<f32>,
        power: Option<Array3<f32>>,
    ) -> Result<Self> {
        let (nz, ny, nx) = data.dim();
        let dims = Dims::new(ny);
        if nz != ny || nx != dims.nxc() {
            return Err(invalid_size(format!(
                "volume shape {:?} is not a half-space cube",
                data.dim()
            )));
        }
        if weight.dim() != data.dim() {
            return Err(invalid_size(format!(
                "weight shape {:?} does not match volume shape {:?}",
                weight.dim(),
                data.dim()
            )));
        }
        if let Some(p) = &power {
            if p.dim() != data.dim() {
                return Err(invalid_size(format!(
                    "power shape {:?} does not match volume shape {:?}",
                    p.dim(),
                    data.dim()
                )));
            }
        }
        Ok(Self {
            dims,
            data,
            weight,
            power,
            residual: None,
            folded: false,
        })
    }

    /// An empty accumulator of the same geometry, sharing the CTF
    /// reference if there is one.
    pub fn zeroed_like(&self) -> Self {
        let mut acc = Self::new(self.dims, self.power.is_some());
        acc.residual = self
            .residual
            .as_ref()
            .map(|r| CtfResidual::new(Arc::clone(&r.reference)));
        acc
    }

    /// Start measuring CTF residuals against `reference`, a centred
    /// half-space volume of this lattice. Earlier residual sums are dropped.
    pub fn set_ctf_reference(&mut self, reference: Array3<Complex32>) -> Result<()> {
        if reference.dim() != self.dims.shape() {
            return Err(invalid_size(format!(
                "reference shape {:?} does not match lattice shape {:?}",
                reference.dim(),
                self.dims.shape()
            )));
        }
        self.residual = Some(CtfResidual::new(Arc::new(reference)));
        Ok(())
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    pub fn data(&self) -> &Array3<Complex32> {
        &self.data
    }

    pub fn weight(&self) -> &Array3<f32> {
        &self.weight
    }

    pub fn power(&self) -> Option<&Array3<f32>> {
        self.power.as_ref()
    }

    pub fn ctf_residual(&self) -> Option<&CtfResidual> {
        self.residual.as_ref()
    }

    pub fn is_folded(&self) -> bool {
        self.folded
    }

    pub fn into_parts(self) -> (Array3<Complex32>, Array3<f32>, Option<Array3<f32>>) {
        (self.data, self.weight, self.power)
    }

    pub(crate) fn parts_mut(
        &mut self,
    ) -> (&mut Array3<Complex32>, &Array3<f32>, Option<&Array3<f32>>) {
        (&mut self.data, &self.weight, self.power.as_ref())
    }

    /// Add one kernel contribution to cell `[z, y, x]`.
    #[inline]
    pub(crate) fn add(&mut self, z: usize, y: usize, x: usize, value: Complex32, weight: f32, power: f32) {
        self.data[[z, y, x]] += value;
        self.weight[[z, y, x]] += weight;
        if let Some(p) = self.power.as_mut() {
            p[[z, y, x]] += power;
        }
        self.folded = false;
    }

    /// Add `sample` to cell `[z, y, x]` scaled by the kernel falloff `g`,
    /// including its CTF residual terms when they are tracked.
    #[inline]
    pub(crate) fn add_sample(&mut self, z: usize, y: usize, x: usize, s: &Sample, g: f32) {
        self.add(z, y, x, s.value * g, s.weight * g, s.power * g);
        if let Some(r) = self.residual.as_mut() {
            let p = r.reference[[z, y, x]];
            let w = s.count * g;
            r.count[[z, y, x]] += w;
            r.cross[[z, y, x]] -= 2.0 * w * s.ctf * (s.raw.conj() * p).re;
            r.model[[z, y, x]] += w * s.ctf * s.ctf * p.norm_sqr();
        }
    }

    /// Elementwise sum of another accumulator into this one.
    pub fn merge(&mut self, other: &Accumulator) -> Result<()> {
        if other.dims != self.dims {
            return Err(invalid_size(format!(
                "cannot merge lattice of edge {} into edge {}",
                other.dims.n, self.dims.n
            )));
        }
        self.data += &other.data;
        self.weight += &other.weight;
        match (self.power.as_mut(), other.power.as_ref()) {
            (Some(p), Some(q)) => *p += q,
            (Some(_), None) => {
                return Err(invalid_size("merged accumulator carries no power volume"));
            }
            _ => {}
        }
        match (self.residual.as_mut(), other.residual.as_ref()) {
            (Some(r), Some(q)) => {
                r.count += &q.count;
                r.cross += &q.cross;
                r.model += &q.model;
            }
            (Some(_), None) => {
                return Err(invalid_size("merged accumulator carries no CTF residual volumes"));
            }
            _ => {}
        }
        self.folded = self.folded && other.folded;
        Ok(())
    }

    /// Fill the Fourier volume with random-phase values of magnitude 1e-10.
    pub fn seed_noise(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let phases = Array3::random_using(
            self.data.dim(),
            Uniform::new(0.0f32, 2.0 * std::f32::consts::PI),
            &mut rng,
        );
        Zip::from(&mut self.data).and(&phases).for_each(|v, &f| {
            *v = Complex32::new(1.0e-10 * f.sin(), 1.0e-10 * f.cos());
        });
    }

    /// Make the `kx = 0` plane (and the Nyquist plane of even lattices)
    /// Hermitian-consistent.
    ///
    /// Each pair `(ky, kz)`, `(-ky, -kz)` receives the sum of its own value
    /// and the conjugate of its partner's, with weights, power and CTF
    /// residual terms summed the same way. Self-conjugate cells keep only
    /// their real part. A second call without an intervening insertion
    /// changes nothing.
    pub fn enforce_central_plane(&mut self) {
        if self.folded {
            return;
        }
        let n = self.dims.n;
        let mut planes = vec![0];
        if n % 2 == 0 {
            planes.push(n / 2);
        }
        for &ix in &planes {
            for iz in 0..n {
                for iy in 0..n {
                    let (Some(py), Some(pz)) = (self.dims.partner(iy), self.dims.partner(iz)) else {
                        continue;
                    };
                    if (pz, py) == (iz, iy) {
                        let v = self.data[[iz, iy, ix]];
                        self.data[[iz, iy, ix]] = Complex32::new(v.re, 0.0);
                        continue;
                    }
                    if (iz, iy) > (pz, py) {
                        continue;
                    }
                    let s = self.data[[iz, iy, ix]] + self.data[[pz, py, ix]].conj();
                    self.data[[iz, iy, ix]] = s;
                    self.data[[pz, py, ix]] = s.conj();

                    let (a, b) = ([iz, iy, ix], [pz, py, ix]);
                    fold_pair(&mut self.weight, a, b);
                    if let Some(p) = self.power.as_mut() {
                        fold_pair(p, a, b);
                    }
                    if let Some(r) = self.residual.as_mut() {
                        fold_pair(&mut r.count, a, b);
                        fold_pair(&mut r.cross, a, b);
                        fold_pair(&mut r.model, a, b);
                    }
                }
            }
        }
        self.folded = true;
    }
}
