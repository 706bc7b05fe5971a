//! Direct Fourier reconstruction of a 3D volume from oriented 2D projections.
//!
//! Each projection is padded, transformed, and scattered as a central slice
//! into a half-space Fourier lattice together with the kernel weight behind
//! every cell. `finish` folds the central planes, divides by the weights
//! under the configured strategy and inverts the result.
//!
//! ```no_run
//! use fourier_recon::{Orientation, ReconConfig, Reconstructor, Slice};
//! use ndarray::Array2;
//!
//! let mut session = Reconstructor::setup(ReconConfig::new(64).with_npad(2))?;
//! let projection = Array2::<f32>::zeros((64, 64));
//! session.insert_slice(&Slice::image(projection, Orientation::from_spider(0.0, 45.0, 0.0)))?;
//! let volume = session.finish()?;
//! # Ok::<(), fourier_recon::ReconError>(())
//! ```

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod fft;
mod insert;
pub mod kernel;
pub mod lattice;
pub mod normalize;
pub mod orientation;
pub mod quality;
pub mod session;
pub mod slice;
pub mod ssnr;
pub mod store;

pub use bootstrap::{Bootstrap, Media};
pub use config::{EstimateParams, Neighborhood, Normalization, RadialProfile, ReconConfig, Weighting};
pub use error::{ReconError, Result};
pub use kernel::KernelMode;
pub use lattice::{Accumulator, CtfResidual, Dims};
pub use orientation::{Orientation, SymmetryGroup};
pub use quality::{QualityScore, ScoreSummary};
pub use session::{InsertOutcome, Reconstructor};
pub use slice::{CtfProfile, Slice, SliceData};
pub use ssnr::SsnrCurve;
pub use store::{Acquisition, SliceStore, SliceStoreWriter};
