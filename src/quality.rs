//! Slice quality from an interpolated Fourier ring correlation against the
//! current accumulation.

use ndarray::Array2;
use num_complex::Complex32;
use serde::Serialize;

use crate::error::{invalid_config, Result};
use crate::insert::gated_points;
use crate::kernel::{trilinear_origin, trilinear_weights};
use crate::lattice::Accumulator;
use crate::orientation::Orientation;

/// Bins whose normalized correlation is below this do not contribute.
const CONTRIB_THRESHOLD: f32 = 0.01;
const MAX_FRC_SQUARED: f32 = 0.999;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct QualityScore {
    pub frc_integral: f32,
    pub snr_normed_frc_integral: f32,
    pub normed_snr_integral: f32,
}

/// Radially binned running sums of one slice against the volume.
///
/// The volume value at each slice point is interpolated with the trilinear
/// kernel after taking out what the slice itself would have put there, so a
/// slice that is already inserted is compared against the rest of the data.
pub struct InterpolatedFrc<'a> {
    acc: &'a Accumulator,
    sampling: f32,
    frc: Vec<f32>,
    norm_ref: Vec<f32>,
    norm_slice: Vec<f32>,
}

impl<'a> InterpolatedFrc<'a> {
    pub fn new(acc: &'a Accumulator, sampling: f32) -> Result<Self> {
        if !(sampling > 0.0) {
            return Err(invalid_config(format!(
                "sampling must be greater than 0, got {sampling}"
            )));
        }
        let bins = (acc.dims().half() as f32 * sampling) as usize;
        Ok(Self {
            acc,
            sampling,
            frc: vec![0.0; bins],
            norm_ref: vec![0.0; bins],
            norm_slice: vec![0.0; bins],
        })
    }

    pub fn reset(&mut self) {
        for v in self.frc.iter_mut().chain(&mut self.norm_ref).chain(&mut self.norm_slice) {
            *v = 0.0;
        }
    }

    /// Add the slice value `v` (inserted with weight `w`) seen at lattice
    /// coordinates `p`. Returns `false` if the point fell outside the
    /// interpolation range or the last radial bin.
    pub fn accumulate(&mut self, p: [f32; 3], v: Complex32, w: f32) -> bool {
        let dims = self.acc.dims();
        let Some([x0, y0, z0]) = trilinear_origin(dims.nxc(), dims.n, p) else {
            return false;
        };
        let h = dims.half() as isize;
        let (ry, rz) = (y0 as isize - h, z0 as isize - h);
        let r2 = (x0 * x0) as isize + ry * ry + rz * rz;
        let bin = ((r2 as f32).sqrt() * self.sampling) as usize;
        if self.frc.is_empty() || bin > self.frc.len() - 1 {
            return false;
        }

        let g = trilinear_weights([p[0] - x0 as f32, p[1] - y0 as f32, p[2] - z0 as f32]);
        let data = self.acc.data();
        let mut interp = Complex32::new(0.0, 0.0);
        for (c, gc) in g.iter().enumerate() {
            let cell = data[[z0 + ((c >> 2) & 1), y0 + ((c >> 1) & 1), x0 + (c & 1)]];
            interp += (cell - v * (w * gc)) * *gc;
        }

        self.frc[bin] += interp.re * v.re + interp.im * v.im;
        self.norm_ref[bin] += interp.norm_sqr();
        self.norm_slice[bin] += v.norm_sqr();
        true
    }

    /// Reduce the curve to the three figures of merit, treating the slice
    /// as the average of `n_particles` images.
    pub fn finish(&self, n_particles: u32) -> Result<QualityScore> {
        if n_particles == 0 {
            return Err(invalid_config("number of particles must be at least 1"));
        }
        let mut score = QualityScore::default();
        let mut contrib = 0usize;
        for i in 0..self.frc.len() {
            let frc = if self.norm_ref[i] == 0.0 || self.norm_slice[i] == 0.0 {
                0.0
            } else {
                self.frc[i] / (self.norm_ref[i] * self.norm_slice[i]).sqrt()
            };
            if frc < CONTRIB_THRESHOLD {
                continue;
            }
            contrib += 1;
            score.frc_integral += frc;
            let tmp = (frc * frc).min(MAX_FRC_SQUARED);
            let adjusted = tmp / ((1.0 - tmp) * n_particles as f32);
            score.normed_snr_integral += adjusted;
            score.snr_normed_frc_integral += (adjusted / (1.0 + adjusted)).sqrt();
        }
        if contrib == 0 {
            return Ok(QualityScore::default());
        }
        let c = contrib as f32;
        score.frc_integral /= c;
        score.snr_normed_frc_integral /= c;
        score.normed_snr_integral /= c;
        Ok(score)
    }
}

/// Score a padded spectrum at one pose against `acc`.
pub(crate) fn score_spectrum(
    acc: &Accumulator,
    spectrum: &Array2<Complex32>,
    pose: &Orientation,
    weight: f32,
    sampling: f32,
    n_particles: u32,
) -> Result<QualityScore> {
    let mut frc = InterpolatedFrc::new(acc, sampling)?;
    let h = acc.dims().half() as f32;
    for (y, x, ky) in gated_points(acc.dims().n) {
        let mut k = pose.map(x as f32, ky);
        let mut v = spectrum[[y, x]];
        if k[0] < 0.0 {
            k = [-k[0], -k[1], -k[2]];
            v = v.conj();
        }
        frc.accumulate([k[0], k[1] + h, k[2] + h], v, weight);
    }
    frc.finish(n_particles)
}

/// Least-squares line `y = slope * x + intercept` between two scores.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LineFit {
    pub x: &'static str,
    pub y: &'static str,
    pub slope: f32,
    pub intercept: f32,
}

/// Session-wide statistics of the quality scores.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScoreSummary {
    pub count: usize,
    pub mean: QualityScore,
    pub variance: QualityScore,
    pub fits: Vec<LineFit>,
}

fn columns(scores: &[QualityScore]) -> [(&'static str, Vec<f32>); 3] {
    [
        ("frc_integral", scores.iter().map(|s| s.frc_integral).collect()),
        (
            "snr_normed_frc_integral",
            scores.iter().map(|s| s.snr_normed_frc_integral).collect(),
        ),
        (
            "normed_snr_integral",
            scores.iter().map(|s| s.normed_snr_integral).collect(),
        ),
    ]
}

fn mean_var(v: &[f32]) -> (f32, f32) {
    let n = v.len() as f32;
    let mean = v.iter().sum::<f32>() / n;
    let var = v.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n;
    (mean, var)
}

fn fit(x: &[f32], y: &[f32]) -> Option<(f32, f32)> {
    let (mx, vx) = mean_var(x);
    let (my, _) = mean_var(y);
    if vx <= 0.0 {
        return None;
    }
    let cov = x.iter().zip(y).map(|(a, b)| (a - mx) * (b - my)).sum::<f32>() / x.len() as f32;
    let slope = cov / vx;
    Some((slope, my - slope * mx))
}

impl ScoreSummary {
    pub fn from_scores(scores: &[QualityScore]) -> Option<Self> {
        if scores.is_empty() {
            return None;
        }
        let cols = columns(scores);
        let stats: Vec<(f32, f32)> = cols.iter().map(|(_, v)| mean_var(v)).collect();
        let mut fits = Vec::new();
        for (a, b) in [(0, 1), (0, 2), (1, 2)] {
            if let Some((slope, intercept)) = fit(&cols[a].1, &cols[b].1) {
                fits.push(LineFit {
                    x: cols[a].0,
                    y: cols[b].0,
                    slope,
                    intercept,
                });
            }
        }
        Some(Self {
            count: scores.len(),
            mean: QualityScore {
                frc_integral: stats[0].0,
                snr_normed_frc_integral: stats[1].0,
                normed_snr_integral: stats[2].0,
            },
            variance: QualityScore {
                frc_integral: stats[0].1,
                snr_normed_frc_integral: stats[1].1,
                normed_snr_integral: stats[2].1,
            },
            fits,
        })
    }
}
