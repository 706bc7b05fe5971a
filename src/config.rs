//! Session configuration.
//!
//! A session is described by one JSON document, e.g.
//!
//! ```json
//! { "size": 64, "npad": 2, "symmetry": "d3", "mode": 2,
//!   "normalization": { "kind": "wiener_snr", "snr": { "values": [10.0, 8.0, 2.0] } },
//!   "weighting": { "kind": "estimate" } }
//! ```
//!
//! Every field except `size` has a default.

use serde::{Deserialize, Serialize};

use crate::error::{invalid_config, ReconError, Result};
use crate::kernel::KernelMode;
use crate::orientation::SymmetryGroup;

/// A table of values sampled along the radius of Fourier space, such as an
/// SNR estimate or a CTF curve.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RadialProfile {
    pub values: Vec<f32>,
    /// Table entries per unpadded pixel of radius.
    #[serde(default = "default_oversampling")]
    pub oversampling: f32,
}

impl RadialProfile {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            oversampling: 1.0,
        }
    }

    pub fn constant(value: f32) -> Self {
        Self::new(vec![value])
    }

    /// Value at `radius` measured in padded lattice units.
    ///
    /// Radii past the end of the table read the last entry.
    pub fn at(&self, radius: f32, npad: usize) -> f32 {
        let idx = (radius * self.oversampling / npad as f32).round().max(0.0) as usize;
        let last = self.values.len().saturating_sub(1);
        self.values.get(idx.min(last)).copied().unwrap_or(0.0)
    }

    fn validate(&self, what: &str) -> Result<()> {
        if self.values.is_empty() {
            return Err(invalid_config(format!("{what} profile is empty")));
        }
        if !(self.oversampling > 0.0) {
            return Err(invalid_config(format!(
                "{what} profile oversampling must be positive, got {}",
                self.oversampling
            )));
        }
        Ok(())
    }
}

fn default_oversampling() -> f32 {
    1.0
}

/// How accumulated values are divided by their accumulated weight.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Normalization {
    /// `value / weight`.
    #[default]
    Average,
    /// Rescale the magnitude to `sqrt(power / weight)`, keeping the phase.
    Dlog,
    /// `value / (weight * (1 + 1/weight))`.
    Wiener,
    /// `value / (weight + 1/snr(radius))`.
    WienerSnr { snr: RadialProfile },
}

/// Which z offset the ESTIMATE neighbourhood walks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Neighborhood {
    /// Neighbour z follows the y offset (`cz + jj`), so the box is walked
    /// along a diagonal in y/z. Once a neighbour with negative x is
    /// reflected, the reflected x and y carry over to the following
    /// offsets of the same loops.
    #[default]
    Literal,
    /// Neighbour z follows its own offset (`cz + kk`), and each neighbour
    /// is reflected on its own.
    Corrected,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimateParams {
    /// Edge length of the cubic neighbourhood; must be odd.
    #[serde(default = "default_box_size")]
    pub box_size: usize,
    /// Exponent step of the neighbourhood falloff table.
    #[serde(default = "default_wght_a")]
    pub a: f32,
    /// Exponent step of the radial table.
    #[serde(default = "default_wght_b")]
    pub b: f32,
    #[serde(default)]
    pub neighborhood: Neighborhood,
}

impl Default for EstimateParams {
    fn default() -> Self {
        Self {
            box_size: default_box_size(),
            a: default_wght_a(),
            b: default_wght_b(),
            neighborhood: Neighborhood::default(),
        }
    }
}

fn default_box_size() -> usize {
    7
}

fn default_wght_a() -> f32 {
    0.2
}

fn default_wght_b() -> f32 {
    0.004
}

/// Sampling-density correction applied on top of the normalization.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Weighting {
    #[default]
    None,
    Estimate(EstimateParams),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconConfig {
    /// Edge length of the input projections and of the output volume.
    #[serde(default)]
    pub size: Option<usize>,
    /// Padding factor applied to every slice before its transform.
    #[serde(default = "default_npad")]
    pub npad: usize,
    #[serde(default = "default_symmetry")]
    pub symmetry: String,
    /// Interpolation kernel code, 1 to 7.
    #[serde(default = "default_mode")]
    pub mode: u8,
    /// Reliability weight applied to every slice in addition to its own.
    #[serde(default = "default_weight")]
    pub weight: f32,
    #[serde(default)]
    pub normalization: Normalization,
    #[serde(default)]
    pub weighting: Weighting,
    /// Overall sign of the finished volume (+1 or -1).
    #[serde(default = "default_sign")]
    pub sign: i32,
    /// Slices whose SNR-normalized FRC integral falls below this are skipped.
    #[serde(default)]
    pub hard: Option<f32>,
    /// FRC radial bins per lattice unit.
    #[serde(default = "default_sampling")]
    pub sampling: f32,
    #[serde(default)]
    pub mask_circumference: bool,
    #[serde(default = "default_true")]
    pub enforce_central_plane: bool,
    /// Keep a weighted |F|^2 volume (needed by SSNR analysis).
    #[serde(default)]
    pub track_power: bool,
    /// Seed the Fourier volume with 1e-10 random-phase noise.
    #[serde(default)]
    pub noise_seed: Option<u64>,
}

fn default_npad() -> usize {
    1
}

fn default_symmetry() -> String {
    "c1".to_string()
}

fn default_mode() -> u8 {
    2
}

fn default_weight() -> f32 {
    1.0
}

fn default_sign() -> i32 {
    1
}

fn default_sampling() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            size: None,
            npad: default_npad(),
            symmetry: default_symmetry(),
            mode: default_mode(),
            weight: default_weight(),
            normalization: Normalization::default(),
            weighting: Weighting::default(),
            sign: default_sign(),
            hard: None,
            sampling: default_sampling(),
            mask_circumference: false,
            enforce_central_plane: true,
            track_power: false,
            noise_seed: None,
        }
    }
}

impl ReconConfig {
    pub fn new(size: usize) -> Self {
        Self {
            size: Some(size),
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ReconError::Format(format!("config JSON: {e}")))
    }

    pub fn with_npad(mut self, npad: usize) -> Self {
        self.npad = npad;
        self
    }

    pub fn with_mode(mut self, mode: u8) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_symmetry(mut self, symmetry: &str) -> Self {
        self.symmetry = symmetry.to_string();
        self
    }

    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn with_weighting(mut self, weighting: Weighting) -> Self {
        self.weighting = weighting;
        self
    }

    /// Base (unpadded) size, failing when it was never given.
    pub fn size(&self) -> Result<usize> {
        match self.size {
            Some(0) => Err(invalid_config("size must be positive")),
            Some(size) => Ok(size),
            None => Err(invalid_config("target size is not given")),
        }
    }

    pub fn padded_size(&self) -> Result<usize> {
        let size = self.size()?;
        size.checked_mul(self.npad).ok_or_else(|| {
            invalid_config(format!("padded size {size} x {} overflows", self.npad))
        })
    }

    /// Whether the session has to keep a power volume next to the weights.
    pub fn needs_power(&self) -> bool {
        self.track_power || matches!(self.normalization, Normalization::Dlog)
    }

    /// Check every parameter; the resolved kernel and symmetry are returned
    /// so callers do not parse them twice.
    pub fn validate(&self) -> Result<(KernelMode, SymmetryGroup)> {
        if self.npad == 0 {
            return Err(invalid_config("npad must be at least 1"));
        }
        let padded = self.padded_size()?;
        if padded < 4 {
            return Err(invalid_config(format!(
                "padded size {padded} is too small to reconstruct"
            )));
        }
        let mode = KernelMode::try_from(self.mode)?;
        let symmetry = SymmetryGroup::parse(&self.symmetry)?;
        if !(self.weight > 0.0) {
            return Err(invalid_config(format!(
                "weight must be positive, got {}",
                self.weight
            )));
        }
        if !(self.sampling > 0.0) {
            return Err(invalid_config(format!(
                "sampling must be greater than 0, got {}",
                self.sampling
            )));
        }
        if self.sign != 1 && self.sign != -1 {
            return Err(invalid_config(format!("sign must be 1 or -1, got {}", self.sign)));
        }
        if let Normalization::WienerSnr { snr } = &self.normalization {
            snr.validate("snr")?;
            if snr.values.iter().any(|v| !(*v > 0.0)) {
                return Err(invalid_config("snr values must be positive"));
            }
        }
        if let Weighting::Estimate(p) = &self.weighting {
            if p.box_size < 3 || p.box_size % 2 == 0 {
                return Err(invalid_config(format!(
                    "estimate box size must be odd and at least 3, got {}",
                    p.box_size
                )));
            }
        }
        Ok((mode, symmetry))
    }
}

pub(crate) fn validate_profile(profile: &RadialProfile, what: &str) -> Result<()> {
    profile.validate(what)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_json_with_defaults() {
        let cfg = ReconConfig::from_json(r#"{ "size": 32 }"#).unwrap();
        assert_eq!(cfg.size().unwrap(), 32);
        assert_eq!(cfg.npad, 1);
        assert_eq!(cfg.symmetry, "c1");
        assert_eq!(cfg.mode, 2);
        assert_eq!(cfg.normalization, Normalization::Average);
        assert_eq!(cfg.weighting, Weighting::None);
        assert!(cfg.enforce_central_plane);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_tagged_strategies() {
        let cfg = ReconConfig::from_json(
            r#"{ "size": 16, "npad": 2,
                 "normalization": { "kind": "wiener_snr", "snr": { "values": [4.0, 2.0] } },
                 "weighting": { "kind": "estimate", "neighborhood": "corrected" } }"#,
        )
        .unwrap();
        match &cfg.normalization {
            Normalization::WienerSnr { snr } => assert_eq!(snr.values, vec![4.0, 2.0]),
            other => panic!("unexpected normalization {other:?}"),
        }
        match &cfg.weighting {
            Weighting::Estimate(p) => {
                assert_eq!(p.box_size, 7);
                assert_eq!(p.neighborhood, Neighborhood::Corrected);
            }
            other => panic!("unexpected weighting {other:?}"),
        }
    }

    #[test]
    fn missing_size_is_a_configuration_error() {
        let cfg = ReconConfig::from_json("{}").unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ReconError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn rejects_unknown_mode_and_bad_sampling() {
        let cfg = ReconConfig::new(16).with_mode(9);
        assert!(matches!(
            cfg.validate(),
            Err(ReconError::InvalidConfiguration(_))
        ));

        let mut cfg = ReconConfig::new(16);
        cfg.sampling = 0.0;
        assert!(matches!(
            cfg.validate(),
            Err(ReconError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn overflowing_padded_size_is_a_configuration_error() {
        let cfg = ReconConfig::from_json(&format!(
            r#"{{ "size": {}, "npad": 4 }}"#,
            usize::MAX / 2
        ))
        .unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ReconError::InvalidConfiguration(_))
        ));
        assert!(cfg.padded_size().is_err());
    }

    #[test]
    fn radial_profile_clamps_to_last_entry() {
        let p = RadialProfile::new(vec![1.0, 2.0, 3.0]);
        assert_eq!(p.at(0.0, 1), 1.0);
        assert_eq!(p.at(2.0, 2), 2.0);
        assert_eq!(p.at(40.0, 1), 3.0);
    }
}
