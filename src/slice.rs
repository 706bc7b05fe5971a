//! Caller-supplied slices and the checks they go through before insertion.

use std::borrow::Cow;

use ndarray::Array2;
use num_complex::Complex32;
use serde::{Deserialize, Serialize};

use crate::config::{validate_profile, RadialProfile};
use crate::error::{invalid_config, invalid_size, invalid_state, ReconError, Result};
use crate::fft::prepare_slice;
use crate::orientation::Orientation;

/// Per-radius CTF values for one slice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CtfProfile {
    pub values: RadialProfile,
    /// The CTF was already multiplied into the slice data.
    #[serde(default)]
    pub applied: bool,
}

#[derive(Clone, Debug)]
pub enum SliceData {
    /// A real-space projection of the base size.
    Image(Array2<f32>),
    /// A padded Fourier slice, shape `[np, np/2 + 1]` with centred rows.
    Spectrum(Array2<Complex32>),
}

#[derive(Clone, Debug)]
pub struct Slice {
    pub data: SliceData,
    pub pose: Orientation,
    /// Reliability weight.
    pub weight: f32,
    /// Multiplicity, e.g. how often a bootstrap draw picked this slice.
    pub mult: u32,
    /// `data` is already padded and transformed.
    pub padded: bool,
    /// Sub-pixel translation applied while transforming an image.
    pub shift: Option<(f32, f32)>,
    pub ctf: Option<CtfProfile>,
}

impl Slice {
    pub fn image(image: Array2<f32>, pose: Orientation) -> Self {
        Self {
            data: SliceData::Image(image),
            pose,
            weight: 1.0,
            mult: 1,
            padded: false,
            shift: None,
            ctf: None,
        }
    }

    pub fn spectrum(spectrum: Array2<Complex32>, pose: Orientation) -> Self {
        Self {
            data: SliceData::Spectrum(spectrum),
            padded: true,
            ..Self::image(Array2::zeros((0, 0)), pose)
        }
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_mult(mut self, mult: u32) -> Self {
        self.mult = mult;
        self
    }

    pub fn with_shift(mut self, sx: f32, sy: f32) -> Self {
        self.shift = Some((sx, sy));
        self
    }

    pub fn with_ctf(mut self, ctf: CtfProfile) -> Self {
        self.ctf = Some(ctf);
        self
    }

    /// Reliability weight times multiplicity, after checking both.
    pub(crate) fn effective_weight(&self) -> Result<f32> {
        if !(self.weight >= 0.0) || !self.weight.is_finite() {
            return Err(invalid_config(format!("slice weight {} is not usable", self.weight)));
        }
        if self.mult == 0 {
            return Err(invalid_config("slice multiplicity must be at least 1"));
        }
        if let Some(ctf) = &self.ctf {
            validate_profile(&ctf.values, "ctf")?;
        }
        Ok(self.weight * self.mult as f32)
    }

    /// The padded Fourier slice the inserter reads, transforming the image
    /// first when needed.
    pub(crate) fn spectrum_for(&self, base: usize, npad: usize) -> Result<Cow<'_, Array2<Complex32>>> {
        let np = base * npad;
        let empty = match &self.data {
            SliceData::Image(img) => img.is_empty(),
            SliceData::Spectrum(spectrum) => spectrum.is_empty(),
        };
        if empty {
            return Err(ReconError::NullInput("slice has no data".into()));
        }
        match (&self.data, self.padded) {
            (SliceData::Spectrum(spectrum), true) => {
                let expect = (np, np / 2 + 1);
                if spectrum.dim() != expect {
                    return Err(invalid_size(format!(
                        "padded slice is {:?}, expected {:?}",
                        spectrum.dim(),
                        expect
                    )));
                }
                Ok(Cow::Borrowed(spectrum))
            }
            (SliceData::Image(_), true) => Err(invalid_state(
                "slice is flagged as padded but holds a real-space image",
            )),
            (SliceData::Spectrum(_), false) => Err(invalid_state(
                "slice is already in Fourier space; flag it as padded",
            )),
            (SliceData::Image(img), false) => {
                let (ny, nx) = img.dim();
                if ny != nx || nx != base {
                    return Err(invalid_size(format!(
                        "projection is {ny}x{nx}, session expects {base}x{base}"
                    )));
                }
                prepare_slice(&img.view(), npad, self.shift).map(Cow::Owned)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_is_transformed_to_padded_shape() {
        let slice = Slice::image(Array2::zeros((8, 8)), Orientation::identity());
        let spectrum = slice.spectrum_for(8, 2).unwrap();
        assert_eq!(spectrum.dim(), (16, 9));
    }

    #[test]
    fn domain_mismatches_are_invalid_state() {
        let mut slice = Slice::image(Array2::zeros((8, 8)), Orientation::identity());
        slice.padded = true;
        assert!(matches!(slice.spectrum_for(8, 1), Err(ReconError::InvalidState(_))));

        let mut slice = Slice::spectrum(Array2::zeros((8, 5)), Orientation::identity());
        slice.padded = false;
        assert!(matches!(slice.spectrum_for(8, 1), Err(ReconError::InvalidState(_))));
    }

    #[test]
    fn size_mismatches_are_invalid_size() {
        let slice = Slice::image(Array2::zeros((6, 6)), Orientation::identity());
        assert!(matches!(slice.spectrum_for(8, 1), Err(ReconError::InvalidSize(_))));

        let slice = Slice::image(Array2::zeros((8, 7)), Orientation::identity());
        assert!(matches!(slice.spectrum_for(8, 1), Err(ReconError::InvalidSize(_))));

        let slice = Slice::spectrum(Array2::zeros((8, 5)), Orientation::identity());
        assert!(matches!(slice.spectrum_for(8, 2), Err(ReconError::InvalidSize(_))));
    }

    #[test]
    fn empty_data_is_null_input() {
        let slice = Slice::spectrum(Array2::zeros((0, 0)), Orientation::identity());
        assert!(matches!(slice.spectrum_for(8, 1), Err(ReconError::NullInput(_))));
    }

    #[test]
    fn weight_includes_multiplicity() {
        let slice = Slice::image(Array2::zeros((4, 4)), Orientation::identity())
            .with_weight(0.5)
            .with_mult(3);
        assert_eq!(slice.effective_weight().unwrap(), 1.5);
        assert!(slice.clone().with_mult(0).effective_weight().is_err());
        assert!(slice.with_weight(f32::NAN).effective_weight().is_err());
    }
}
