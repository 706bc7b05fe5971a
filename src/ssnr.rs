//! Spectral SNR estimated from the spread of the samples that landed in each
//! cell, for nearest-neighbour sessions that track power. CTF-affected data
//! is measured against a reference volume instead of the cell mean.

use serde::Serialize;

use crate::error::{invalid_config, invalid_state, Result};
use crate::lattice::Accumulator;
use crate::normalize::EstimateWeighting;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct SsnrShell {
    /// Summed squared mean amplitude.
    pub signal: f32,
    /// Summed variance of the mean.
    pub variance: f32,
    /// Fourier cells counted, both Friedel mates included.
    pub cells: u32,
    /// Samples behind those cells.
    pub slices: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SsnrCurve {
    pub shells: Vec<SsnrShell>,
}

impl SsnrCurve {
    pub fn len(&self) -> usize {
        self.shells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shells.is_empty()
    }

    /// `signal / variance - 1` for shell `i`, 0 where no variance was seen.
    pub fn ssnr(&self, i: usize) -> f32 {
        match self.shells.get(i) {
            Some(s) if s.variance > 0.0 => s.signal / s.variance - 1.0,
            _ => 0.0,
        }
    }
}

/// Bin every cell with more than one contributing sample into shells of
/// width `ring_width` (in lattice units of the padded volume).
///
/// Cells are counted once per Friedel pair: the `kx = 0` plane keeps only
/// `kz > 0`, or `kz = 0` with `ky >= 0`.
///
/// When the accumulator tracks CTF residuals, `Kn` is the summed sample
/// weight, the signal is the mean power `|F|^2 / Kn` and the variance comes
/// from the misfit `|F - ctf P|^2` against the reference.
pub fn ssnr_curve(
    acc: &Accumulator,
    ring_width: f32,
    estimate: Option<&EstimateWeighting>,
) -> Result<SsnrCurve> {
    if !(ring_width > 0.0) {
        return Err(invalid_config(format!("ring width must be positive, got {ring_width}")));
    }
    let power = acc
        .power()
        .ok_or_else(|| invalid_state("SSNR needs a session that tracks power"))?;
    let dims = acc.dims();
    let h = dims.half() as isize;
    let hf = h.max(1) as f32;
    let inc = (hf / ring_width).round() as usize;
    let mut shells = vec![SsnrShell::default(); inc + 1];

    let weight = acc.weight();
    let residual = acc.ctf_residual();
    for ((z, y, x), v) in acc.data().indexed_iter() {
        let kn = residual.map_or(weight[[z, y, x]], |r| r.count()[[z, y, x]]);
        if !(kn > 1.5) {
            continue;
        }
        let (kx, ky, kz) = (x as isize, y as isize - h, z as isize - h);
        if !(kx > 0 || kz > 0 || (kz == 0 && ky >= 0)) {
            continue;
        }
        let arg = (((kx * kx + ky * ky + kz * kz) as f32) / (hf * hf)).sqrt();
        let r = (inc as f32 * arg).round() as usize;
        let Some(shell) = shells.get_mut(r) else {
            continue;
        };
        let wght = estimate.map_or(1.0, |e| e.factor(weight, z, y, x));
        let p = power[[z, y, x]];
        match residual {
            None => {
                shell.signal += (v / kn).norm_sqr() * wght;
                shell.variance += (p - v.norm_sqr() / kn) * wght / (kn * (kn - 1.0));
            }
            Some(r) => {
                let misfit = p + r.cross()[[z, y, x]] + r.model()[[z, y, x]];
                shell.signal += p * wght / kn;
                shell.variance += misfit * wght / (kn * (kn - 1.0));
            }
        }
        shell.cells += 2;
        shell.slices += kn as u32;
    }
    Ok(SsnrCurve { shells })
}
