//! On-disk store of padded Fourier slices, so a bootstrap can re-insert
//! slices many times without holding them in memory or transforming them
//! again.
//!
//! `<prefix>.bin` holds the spectra back to back as little-endian `f32`
//! (re, im) pairs; `<prefix>.txt` holds one JSON record per slice.

use std::ffi::OsString;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use ndarray::Array2;
use num_complex::Complex32;
use serde::{Deserialize, Serialize};

use crate::error::{invalid_size, ReconError, Result};
use crate::orientation::Orientation;
use crate::slice::{CtfProfile, Slice};

const BYTES_PER_SAMPLE: u64 = 8;

/// Physical parameters kept next to each slice.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Acquisition {
    #[serde(default)]
    pub pixel: f32,
    #[serde(default)]
    pub voltage: f32,
    #[serde(default)]
    pub cs: f32,
    #[serde(default)]
    pub amp_contrast: f32,
    #[serde(default)]
    pub defocus: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SliceRecord {
    #[serde(flatten)]
    pub acquisition: Acquisition,
    pub phi: f32,
    pub theta: f32,
    pub psi: f32,
    #[serde(default = "unit_weight")]
    pub weight: f32,
    /// CTF of the slice, restored with it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctf: Option<CtfProfile>,
    /// `[rows, columns]` of the stored spectrum.
    pub dims: [usize; 2],
    /// Byte offset into the binary file.
    pub offset: u64,
    /// Byte length in the binary file.
    pub len: u64,
}

fn unit_weight() -> f32 {
    1.0
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = prefix.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

pub struct SliceStoreWriter {
    bin: BufWriter<File>,
    txt: BufWriter<File>,
    offset: u64,
    count: usize,
}

impl SliceStoreWriter {
    /// Create (or truncate) `<prefix>.bin` and `<prefix>.txt`.
    pub fn create(prefix: impl AsRef<Path>) -> Result<Self> {
        let prefix = prefix.as_ref();
        Ok(Self {
            bin: BufWriter::new(File::create(with_suffix(prefix, ".bin"))?),
            txt: BufWriter::new(File::create(with_suffix(prefix, ".txt"))?),
            offset: 0,
            count: 0,
        })
    }

    /// Append one padded spectrum and return its id.
    pub fn add(
        &mut self,
        spectrum: &Array2<Complex32>,
        pose: &Orientation,
        weight: f32,
        ctf: Option<&CtfProfile>,
        acquisition: &Acquisition,
    ) -> Result<usize> {
        if spectrum.is_empty() {
            return Err(ReconError::NullInput("cannot store an empty spectrum".into()));
        }
        for v in spectrum.iter() {
            self.bin.write_all(&v.re.to_le_bytes())?;
            self.bin.write_all(&v.im.to_le_bytes())?;
        }
        let (phi, theta, psi) = pose.spider_angles();
        let len = spectrum.len() as u64 * BYTES_PER_SAMPLE;
        let record = SliceRecord {
            acquisition: acquisition.clone(),
            phi,
            theta,
            psi,
            weight,
            ctf: ctf.cloned(),
            dims: [spectrum.nrows(), spectrum.ncols()],
            offset: self.offset,
            len,
        };
        serde_json::to_writer(&mut self.txt, &record)
            .map_err(|e| ReconError::Format(format!("slice record: {e}")))?;
        self.txt.write_all(b"\n")?;
        self.offset += len;
        self.count += 1;
        Ok(self.count - 1)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn finish(mut self) -> Result<()> {
        self.bin.flush()?;
        self.txt.flush()?;
        Ok(())
    }
}

pub struct SliceStore {
    bin: PathBuf,
    records: Vec<SliceRecord>,
}

impl SliceStore {
    pub fn open(prefix: impl AsRef<Path>) -> Result<Self> {
        let prefix = prefix.as_ref();
        let txt = BufReader::new(File::open(with_suffix(prefix, ".txt"))?);
        let mut records = Vec::new();
        for (lineno, line) in txt.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: SliceRecord = serde_json::from_str(&line)
                .map_err(|e| ReconError::Format(format!("line {}: {e}", lineno + 1)))?;
            let expected = record.dims[0]
                .checked_mul(record.dims[1])
                .and_then(|cells| (cells as u64).checked_mul(BYTES_PER_SAMPLE));
            if expected != Some(record.len) {
                return Err(ReconError::Format(format!(
                    "line {}: {} bytes cannot hold a {:?} spectrum",
                    lineno + 1,
                    record.len,
                    record.dims
                )));
            }
            records.push(record);
        }
        Ok(Self {
            bin: with_suffix(prefix, ".bin"),
            records,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&self, id: usize) -> Option<&SliceRecord> {
        self.records.get(id)
    }

    /// Read slice `id` back as a padded spectrum at its stored pose.
    pub fn get(&self, id: usize) -> Result<Slice> {
        let record = self
            .records
            .get(id)
            .ok_or_else(|| ReconError::NullInput(format!("no slice {id} in store of {}", self.len())))?;
        let mut file = File::open(&self.bin)?;
        file.seek(SeekFrom::Start(record.offset))?;
        let mut bytes = vec![0u8; record.len as usize];
        file.read_exact(&mut bytes)?;

        let values: Vec<Complex32> = bytes
            .chunks_exact(BYTES_PER_SAMPLE as usize)
            .map(|c| {
                Complex32::new(
                    f32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                    f32::from_le_bytes([c[4], c[5], c[6], c[7]]),
                )
            })
            .collect();
        let spectrum = Array2::from_shape_vec((record.dims[0], record.dims[1]), values)
            .map_err(|e| invalid_size(format!("slice {id}: {e}")))?;
        let pose = Orientation::from_spider(record.phi, record.theta, record.psi);
        let mut slice = Slice::spectrum(spectrum, pose).with_weight(record.weight);
        slice.ctf = record.ctf.clone();
        Ok(slice)
    }
}
