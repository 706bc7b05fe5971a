//! A reconstruction session: owns the accumulation buffers from `setup`
//! to `finish`.

use std::borrow::Cow;

use ndarray::{Array2, Array3};
use num_complex::Complex32;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::{ReconConfig, Weighting};
use crate::error::{invalid_size, invalid_state, Result};
use crate::insert::{insert_spectrum, SampleRule};
use crate::kernel::KernelMode;
use crate::lattice::{Accumulator, Dims};
use crate::normalize::{to_real_space, EstimateWeighting, Normalizer};
use crate::orientation::SymmetryGroup;
use crate::quality::{score_spectrum, QualityScore, ScoreSummary};
use crate::slice::Slice;
use crate::ssnr::{ssnr_curve, SsnrCurve};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum InsertOutcome {
    /// The slice was scattered; `samples` landed inside the lattice.
    Inserted { samples: usize },
    /// The quality gate skipped the slice.
    Rejected { score: f32 },
}

pub struct Reconstructor {
    config: ReconConfig,
    mode: KernelMode,
    symmetry: SymmetryGroup,
    base: usize,
    acc: Accumulator,
    scores: Vec<QualityScore>,
    cursor: usize,
}

impl Reconstructor {
    /// Validate `config` and allocate zeroed buffers for it.
    pub fn setup(config: ReconConfig) -> Result<Self> {
        let (mode, symmetry) = config.validate()?;
        let base = config.size()?;
        let dims = Dims::new(config.padded_size()?);
        let mut acc = Accumulator::new(dims, config.needs_power());
        if let Some(seed) = config.noise_seed {
            acc.seed_noise(seed);
        }
        info!(
            size = base,
            npad = config.npad,
            mode = mode.code(),
            symmetry = symmetry.label(),
            nsym = symmetry.order(),
            "reconstruction session ready"
        );
        Ok(Self {
            config,
            mode,
            symmetry,
            base,
            acc,
            scores: Vec::new(),
            cursor: 0,
        })
    }

    /// Continue a session from buffers accumulated elsewhere.
    pub fn with_accumulator(config: ReconConfig, acc: Accumulator) -> Result<Self> {
        let mut session = Self::setup(config)?;
        if acc.dims() != session.acc.dims() {
            return Err(invalid_size(format!(
                "accumulator edge {} does not match padded size {}",
                acc.dims().n,
                session.acc.dims().n
            )));
        }
        if session.config.needs_power() && acc.power().is_none() {
            return Err(invalid_state("session needs a power volume the accumulator lacks"));
        }
        session.acc = acc;
        Ok(session)
    }

    /// Measure every later insertion against `reference` so the SSNR can
    /// account for each slice's CTF.
    ///
    /// `reference` is a centred half-space volume in the slices' own
    /// convention, such as [`Reconstructor::finish_reference`] returns.
    pub fn with_ctf_reference(mut self, reference: Array3<Complex32>) -> Result<Self> {
        if !self.config.needs_power() {
            return Err(invalid_state("CTF residuals need a session that tracks power"));
        }
        if self.acc.weight().iter().any(|w| *w != 0.0) {
            return Err(invalid_state("the CTF reference must be set before any slice is inserted"));
        }
        self.acc.set_ctf_reference(reference)?;
        info!("measuring CTF residuals against a reference volume");
        Ok(self)
    }

    pub fn config(&self) -> &ReconConfig {
        &self.config
    }

    pub fn symmetry(&self) -> &SymmetryGroup {
        &self.symmetry
    }

    pub fn accumulator(&self) -> &Accumulator {
        &self.acc
    }

    pub fn into_accumulator(self) -> Accumulator {
        self.acc
    }

    pub fn scores(&self) -> &[QualityScore] {
        &self.scores
    }

    /// Checks a slice and returns its padded spectrum and total weight.
    fn prepare<'s>(&self, slice: &'s Slice) -> Result<(Cow<'s, Array2<Complex32>>, f32)> {
        let weight = self.config.weight * slice.effective_weight()?;
        let spectrum = slice.spectrum_for(self.base, self.config.npad)?;
        Ok((spectrum, weight))
    }

    /// Consume the next gate position; `Some(score)` means reject.
    fn gate(&mut self) -> Option<f32> {
        let hard = self.config.hard?;
        let idx = self.cursor;
        self.cursor += 1;
        let score = self.scores.get(idx)?.snr_normed_frc_integral;
        (score < hard).then_some(score)
    }

    pub fn insert_slice(&mut self, slice: &Slice) -> Result<InsertOutcome> {
        let (spectrum, weight) = self.prepare(slice)?;
        if let Some(score) = self.gate() {
            warn!(slice = self.cursor - 1, score, "slice below quality threshold, skipped");
            return Ok(InsertOutcome::Rejected { score });
        }
        let rule = SampleRule {
            weight,
            ctf: slice.ctf.as_ref(),
            npad: self.config.npad,
        };
        let samples = insert_spectrum(&mut self.acc, self.mode, &self.symmetry, &spectrum, &slice.pose, rule);
        debug!(samples, weight, "slice inserted");
        Ok(InsertOutcome::Inserted { samples })
    }

    /// Score a slice at its own pose against the current accumulation and
    /// queue the score for the quality gate.
    pub fn score_slice(&mut self, slice: &Slice, n_particles: u32) -> Result<QualityScore> {
        let (spectrum, weight) = self.prepare(slice)?;
        let score = score_spectrum(
            &self.acc,
            &spectrum,
            &slice.pose,
            weight,
            self.config.sampling,
            n_particles,
        )?;
        debug!(
            frc = score.frc_integral,
            snr_normed = score.snr_normed_frc_integral,
            "slice scored"
        );
        self.scores.push(score);
        Ok(score)
    }

    /// Insert many slices on the rayon pool.
    ///
    /// Each worker fills its own zeroed accumulator; the partial sums are
    /// added together and then into the session. All slices are checked
    /// before anything is written, and the quality gate is consulted in
    /// slice order.
    pub fn insert_batch_parallel(&mut self, slices: &[Slice]) -> Result<Vec<InsertOutcome>> {
        let prepared = slices
            .iter()
            .map(|s| self.prepare(s))
            .collect::<Result<Vec<_>>>()?;

        let mut outcomes = Vec::with_capacity(slices.len());
        let mut accepted = Vec::with_capacity(slices.len());
        for (slice, (spectrum, weight)) in slices.iter().zip(prepared) {
            match self.gate() {
                Some(score) => {
                    warn!(slice = self.cursor - 1, score, "slice below quality threshold, skipped");
                    outcomes.push(InsertOutcome::Rejected { score });
                }
                None => {
                    outcomes.push(InsertOutcome::Inserted { samples: 0 });
                    accepted.push((outcomes.len() - 1, slice, spectrum, weight));
                }
            }
        }

        let template = &self.acc;
        let (mode, symmetry, npad) = (self.mode, &self.symmetry, self.config.npad);
        let (sum, counts) = accepted
            .par_iter()
            .try_fold(
                || (template.zeroed_like(), Vec::new()),
                |(mut acc, mut counts), (idx, slice, spectrum, weight)| -> Result<_> {
                    let rule = SampleRule {
                        weight: *weight,
                        ctf: slice.ctf.as_ref(),
                        npad,
                    };
                    let n = insert_spectrum(&mut acc, mode, symmetry, spectrum, &slice.pose, rule);
                    counts.push((*idx, n));
                    Ok((acc, counts))
                },
            )
            .try_reduce(
                || (template.zeroed_like(), Vec::new()),
                |(mut a, mut ca), (b, cb)| {
                    a.merge(&b)?;
                    ca.extend(cb);
                    Ok((a, ca))
                },
            )?;

        self.acc.merge(&sum)?;
        for (idx, n) in counts {
            outcomes[idx] = InsertOutcome::Inserted { samples: n };
        }
        info!(
            slices = slices.len(),
            inserted = accepted.len(),
            "parallel batch inserted"
        );
        Ok(outcomes)
    }

    fn log_scores(&self) {
        if let Some(summary) = ScoreSummary::from_scores(&self.scores) {
            info!(
                count = summary.count,
                frc_mean = summary.mean.frc_integral,
                frc_var = summary.variance.frc_integral,
                snr_normed_mean = summary.mean.snr_normed_frc_integral,
                snr_normed_var = summary.variance.snr_normed_frc_integral,
                normed_snr_mean = summary.mean.normed_snr_integral,
                normed_snr_var = summary.variance.normed_snr_integral,
                "quality score statistics"
            );
            for f in &summary.fits {
                info!(x = f.x, y = f.y, slope = f.slope, intercept = f.intercept, "score fit");
            }
        }
    }

    fn normalize(&mut self, recentre: bool) -> Result<()> {
        self.log_scores();
        if self.config.enforce_central_plane {
            self.acc.enforce_central_plane();
        }
        let normalizer = Normalizer::new(&self.config, self.acc.dims());
        let normalizer = if recentre {
            normalizer
        } else {
            normalizer.without_recentring()
        };
        normalizer.apply(&mut self.acc)
    }

    /// The normalized, centred half-space Fourier volume.
    pub fn finish_fourier(mut self) -> Result<Array3<Complex32>> {
        self.normalize(true)?;
        let (data, _, _) = self.acc.into_parts();
        Ok(data)
    }

    /// The normalized half-space volume without the origin phase or sign,
    /// ready to serve as the reference of a CTF SSNR pass.
    pub fn finish_reference(mut self) -> Result<Array3<Complex32>> {
        self.normalize(false)?;
        let (data, _, _) = self.acc.into_parts();
        Ok(data)
    }

    /// The real-space volume of edge `size`.
    pub fn finish(mut self) -> Result<Array3<f32>> {
        self.normalize(true)?;
        let volume = to_real_space(self.acc.data(), self.base, self.config.mask_circumference);
        info!(size = self.base, "reconstruction finished");
        Ok(volume)
    }

    /// Shell-wise SSNR of the accumulated samples instead of a volume.
    pub fn finish_ssnr(mut self, ring_width: f32) -> Result<SsnrCurve> {
        self.log_scores();
        self.acc.enforce_central_plane();
        let estimate = match &self.config.weighting {
            Weighting::None => None,
            Weighting::Estimate(p) => Some(EstimateWeighting::new(p, self.acc.dims())),
        };
        let curve = ssnr_curve(&self.acc, ring_width, estimate.as_ref())?;
        info!(shells = curve.len(), "SSNR finished");
        Ok(curve)
    }
}
