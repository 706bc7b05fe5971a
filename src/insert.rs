//! Scatters one padded Fourier slice into the accumulator, once per
//! symmetry-equivalent pose.

use ndarray::Array2;
use num_complex::Complex32;

use crate::kernel::{KernelMode, Sample};
use crate::lattice::Accumulator;
use crate::orientation::{Orientation, SymmetryGroup};
use crate::slice::CtfProfile;

/// Slice points `(row, x, ky)` inside the inscribed circle of radius
/// `n/2 - 1`; everything further out is never inserted or scored.
pub(crate) fn gated_points(n: usize) -> impl Iterator<Item = (usize, usize, f32)> {
    let h = n / 2;
    let nxc = n / 2 + 1;
    let limit = (h as f32 - 1.0) * (h as f32 - 1.0);
    (0..n).flat_map(move |y| {
        let ky = y as f32 - h as f32;
        (0..nxc)
            .filter(move |&x| (x * x) as f32 + ky * ky < limit)
            .map(move |x| (y, x, ky))
    })
}

/// Builds the kernel sample for one slice point.
#[derive(Clone, Copy)]
pub(crate) struct SampleRule<'a> {
    pub weight: f32,
    pub ctf: Option<&'a CtfProfile>,
    pub npad: usize,
}

impl SampleRule<'_> {
    #[inline]
    pub fn sample(&self, v: Complex32, x: usize, ky: f32) -> Sample {
        let w = self.weight;
        match self.ctf {
            None => Sample::weighted(v, w),
            Some(ctf) => {
                let r = ((x * x) as f32 + ky * ky).sqrt();
                let c = ctf.values.at(r, self.npad);
                let value = if ctf.applied { v * w } else { v * (c * w) };
                Sample {
                    value,
                    weight: w * c * c,
                    power: w * v.norm_sqr(),
                    count: w,
                    raw: v,
                    ctf: c,
                }
            }
        }
    }
}

/// Insert `spectrum` at every pose of `symmetry` applied to `pose`.
///
/// Returns how many samples landed inside the lattice.
pub(crate) fn insert_spectrum(
    acc: &mut Accumulator,
    mode: KernelMode,
    symmetry: &SymmetryGroup,
    spectrum: &Array2<Complex32>,
    pose: &Orientation,
    rule: SampleRule<'_>,
) -> usize {
    let n = acc.dims().n;
    let mut written = 0;
    for o in symmetry.orientations(pose) {
        for (y, x, ky) in gated_points(n) {
            let sample = rule.sample(spectrum[[y, x]], x, ky);
            if mode.scatter_frequency(acc, o.map(x as f32, ky), sample) {
                written += 1;
            }
        }
    }
    written
}
