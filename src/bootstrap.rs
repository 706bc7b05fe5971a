//! Bootstrap resampling: transform every slice once, then rebuild the
//! volume for any number of draws with replacement.

use std::path::PathBuf;

use ndarray::Array3;
use rand::Rng;
use tracing::{debug, info};

use crate::config::ReconConfig;
use crate::error::{invalid_size, invalid_state, Result};
use crate::session::Reconstructor;
use crate::slice::Slice;
use crate::store::{Acquisition, SliceStore, SliceStoreWriter};

/// Where prepared slices are kept between reconstructions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Media {
    Memory,
    /// A slice store at this path prefix.
    File(PathBuf),
}

enum Holding {
    Memory(Vec<Slice>),
    /// Written until the first reconstruction, read from then on.
    File {
        prefix: PathBuf,
        writer: Option<SliceStoreWriter>,
        store: Option<SliceStore>,
    },
}

pub struct Bootstrap {
    config: ReconConfig,
    holding: Holding,
    len: usize,
}

impl Bootstrap {
    pub fn new(config: ReconConfig, media: Media) -> Result<Self> {
        config.validate()?;
        let holding = match media {
            Media::Memory => Holding::Memory(Vec::new()),
            Media::File(prefix) => Holding::File {
                writer: Some(SliceStoreWriter::create(&prefix)?),
                prefix,
                store: None,
            },
        };
        Ok(Self {
            config,
            holding,
            len: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pad and transform `slice` now and keep the spectrum.
    pub fn add(&mut self, slice: &Slice, acquisition: &Acquisition) -> Result<usize> {
        let weight = slice.effective_weight()?;
        let spectrum = slice.spectrum_for(self.config.size()?, self.config.npad)?;
        match &mut self.holding {
            Holding::Memory(slices) => {
                let mut prepared = Slice::spectrum(spectrum.into_owned(), slice.pose).with_weight(weight);
                prepared.ctf = slice.ctf.clone();
                slices.push(prepared);
            }
            Holding::File {
                writer: Some(writer), ..
            } => {
                writer.add(&spectrum, &slice.pose, weight, slice.ctf.as_ref(), acquisition)?;
            }
            Holding::File { writer: None, .. } => {
                return Err(invalid_state(
                    "slice store is closed once reconstruction has started",
                ));
            }
        }
        self.len += 1;
        Ok(self.len - 1)
    }

    /// Multiplicities of `n` draws with replacement from the stored slices.
    pub fn resample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<u32> {
        let mut mults = vec![0u32; self.len];
        if self.len == 0 {
            return mults;
        }
        for _ in 0..n {
            mults[rng.gen_range(0..self.len)] += 1;
        }
        mults
    }

    /// A fresh reconstruction with slice `i` inserted `mults[i]` times.
    pub fn reconstruct(&mut self, mults: &[u32]) -> Result<Array3<f32>> {
        if mults.len() != self.len {
            return Err(invalid_size(format!(
                "{} multiplicities given for {} slices",
                mults.len(),
                self.len
            )));
        }
        if let Holding::File {
            prefix,
            writer,
            store,
        } = &mut self.holding
        {
            if let Some(w) = writer.take() {
                w.finish()?;
            }
            if store.is_none() {
                *store = Some(SliceStore::open(prefix.as_path())?);
            }
        }

        let mut session = Reconstructor::setup(self.config.clone())?;
        for (i, &m) in mults.iter().enumerate() {
            if m == 0 {
                continue;
            }
            match &mut self.holding {
                Holding::Memory(slices) => {
                    let slice = &mut slices[i];
                    slice.mult = m;
                    session.insert_slice(slice)?;
                }
                Holding::File {
                    store: Some(store), ..
                } => {
                    session.insert_slice(&store.get(i)?.with_mult(m))?;
                }
                Holding::File { store: None, .. } => {
                    return Err(invalid_state("slice store is not open"));
                }
            }
            debug!(slice = i, mult = m, "bootstrap insert");
        }
        let drawn: u32 = mults.iter().sum();
        info!(slices = self.len, drawn, "bootstrap volume");
        session.finish()
    }
}
