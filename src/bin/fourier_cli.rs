use std::fs;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use ndarray::{Array1, Array2, Array3, Axis};
use ndarray_npy::{write_npy, NpzReader};
use tracing::{info, Level};

use fourier_recon::{InsertOutcome, Orientation, ReconConfig, Reconstructor, Slice};

/// Direct Fourier reconstruction CLI.
///
/// Expected NPZ file structure:
///   - key "projections": 3D array (N, S, S) of f32
///   - key "angles": 2D array (N, 3) of f32, SPIDER phi/theta/psi in degrees
///   - key "weights" (optional): 1D array (N,) of f32
///
/// The JSON config describes the session; its "size" defaults to S.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to NPZ file containing projections and angles
    #[arg(long)]
    projections: PathBuf,

    /// Path to session config JSON
    #[arg(long)]
    config: PathBuf,

    /// Score every slice before inserting it so the config's "hard"
    /// threshold can skip poor ones
    #[arg(long)]
    score: bool,

    /// Number of particle images averaged into each projection
    #[arg(long, default_value_t = 1)]
    n_particles: u32,

    /// Output path for reconstructed volume (.npy)
    #[arg(long)]
    output: PathBuf,

    /// Log every slice
    #[arg(long)]
    verbose: bool,
}

/// The optional "weights" array; all ones only when the key is absent.
fn read_weights<R: Read + Seek>(npz: &mut NpzReader<R>, n: usize) -> Result<Array1<f32>> {
    let names = npz
        .names()
        .map_err(|e| anyhow::anyhow!("Failed to list NPZ arrays: {}", e))?;
    if !names.iter().any(|name| name == "weights") {
        return Ok(Array1::ones(n));
    }
    npz.by_name("weights")
        .map_err(|e| anyhow::anyhow!("Invalid 'weights' array in NPZ: {}", e))
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    // --- Load projections + angles from NPZ ---
    let file = File::open(&args.projections)
        .map_err(|e| anyhow::anyhow!("Failed to open NPZ {:?}: {}", args.projections, e))?;
    let mut npz = NpzReader::new(file)
        .map_err(|e| anyhow::anyhow!("Failed to read NPZ {:?}: {}", args.projections, e))?;

    let projections: Array3<f32> = npz
        .by_name("projections")
        .map_err(|e| anyhow::anyhow!("Missing or invalid 'projections' array in NPZ: {}", e))?;

    let angles: Array2<f32> = npz
        .by_name("angles")
        .map_err(|e| anyhow::anyhow!("Missing or invalid 'angles' array in NPZ: {}", e))?;

    let n = projections.len_of(Axis(0));
    let weights = read_weights(&mut npz, n)?;

    if angles.dim() != (n, 3) {
        anyhow::bail!("'angles' has shape {:?}, expected ({}, 3)", angles.dim(), n);
    }
    if weights.len() != n {
        anyhow::bail!("'weights' has {} entries for {} projections", weights.len(), n);
    }

    // --- Session config ---
    let text = fs::read_to_string(&args.config)
        .map_err(|e| anyhow::anyhow!("Failed to read config JSON {:?}: {}", args.config, e))?;
    let mut config = ReconConfig::from_json(&text)
        .map_err(|e| anyhow::anyhow!("Invalid config {:?}: {}", args.config, e))?;
    if config.size.is_none() {
        config.size = Some(projections.len_of(Axis(1)));
    }

    info!(
        projections = n,
        size = projections.len_of(Axis(1)),
        mode = config.mode,
        symmetry = %config.symmetry,
        "running direct Fourier reconstruction"
    );

    let mut session = Reconstructor::setup(config)
        .map_err(|e| anyhow::anyhow!("Failed to set up reconstruction: {}", e))?;

    let slices = (0..n).map(|i| {
        let a = angles.row(i);
        Slice::image(
            projections.index_axis(Axis(0), i).to_owned(),
            Orientation::from_spider(a[0], a[1], a[2]),
        )
        .with_weight(weights[i])
    });

    // --- Insert ---
    let mut rejected = 0usize;
    for (i, slice) in slices.enumerate() {
        if args.score {
            session
                .score_slice(&slice, args.n_particles)
                .map_err(|e| anyhow::anyhow!("Failed to score projection {}: {}", i, e))?;
        }
        let outcome = session
            .insert_slice(&slice)
            .map_err(|e| anyhow::anyhow!("Failed to insert projection {}: {}", i, e))?;
        if let InsertOutcome::Rejected { .. } = outcome {
            rejected += 1;
        }
    }
    info!(inserted = n - rejected, rejected, "all projections processed");

    let volume = session
        .finish()
        .map_err(|e| anyhow::anyhow!("Failed to finish reconstruction: {}", e))?;

    // --- Save volume as .npy ---
    write_npy(&args.output, &volume)
        .map_err(|e| anyhow::anyhow!("Failed to write output NPY {:?}: {}", args.output, e))?;

    info!(output = ?args.output, "reconstruction written");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;
    use ndarray_npy::NpzWriter;

    fn npz_with(dir: &std::path::Path, weights: Option<Array1<f64>>) -> NpzReader<File> {
        let path = dir.join("input.npz");
        let mut w = NpzWriter::new(File::create(&path).unwrap());
        w.add_array("angles", &Array2::<f32>::zeros((3, 3))).unwrap();
        if let Some(weights) = weights {
            w.add_array("weights", &weights).unwrap();
        }
        w.finish().unwrap();
        NpzReader::new(File::open(&path).unwrap()).unwrap()
    }

    #[test]
    fn missing_weights_default_to_ones() {
        let dir = tempfile::tempdir().unwrap();
        let mut npz = npz_with(dir.path(), None);
        assert_eq!(read_weights(&mut npz, 3).unwrap(), Array1::<f32>::ones(3));
    }

    #[test]
    fn weights_of_the_wrong_dtype_are_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut npz = npz_with(dir.path(), Some(Array1::from(vec![0.5f64, 1.0, 2.0])));
        assert!(read_weights(&mut npz, 3).is_err());
    }
}
