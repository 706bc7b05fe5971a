use approx::assert_abs_diff_eq;
use ndarray::{Array2, Zip};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::SeedableRng;

use fourier_recon::{
    Accumulator, Dims, KernelMode, Normalization, Orientation, ReconConfig, Reconstructor, Slice,
    SymmetryGroup,
};

fn random_spectrum(np: usize, seed: u64) -> Array2<Complex32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let shape = (np, np / 2 + 1);
    let re = Array2::random_using(shape, Uniform::new(-1.0f32, 1.0), &mut rng);
    let im = Array2::random_using(shape, Uniform::new(-1.0f32, 1.0), &mut rng);
    let mut out = Array2::<Complex32>::zeros(shape);
    Zip::from(&mut out)
        .and(&re)
        .and(&im)
        .for_each(|o, &r, &i| *o = Complex32::new(r, i));
    out
}

#[test]
fn zero_slice_nearest_kernel_gives_zero_volume() {
    let cfg = ReconConfig::new(4).with_npad(1).with_mode(1).with_symmetry("c1");
    let slice = Slice::image(Array2::zeros((4, 4)), Orientation::identity()).with_weight(1.0);

    let mut weights_only = Reconstructor::setup(cfg.clone()).unwrap();
    weights_only.insert_slice(&slice).unwrap();
    let weight = weights_only.accumulator().weight();
    assert_eq!(weight[[2, 2, 0]], 1.0);
    assert_eq!(weight.sum(), 1.0);

    let mut session = Reconstructor::setup(cfg).unwrap();
    session.insert_slice(&slice).unwrap();
    let volume = session.finish().unwrap();
    assert_eq!(volume.dim(), (4, 4, 4));
    assert!(volume.iter().all(|v| *v == 0.0));
}

#[test]
fn twofold_symmetry_equals_two_manual_insertions() {
    let base = 8;
    let npad = 2;
    let np = base * npad;
    let pose = Orientation::from_spider(20.0, 40.0, 60.0);
    let spectrum = random_spectrum(np, 3);
    let slice = Slice::spectrum(spectrum.clone(), pose);

    let cfg = ReconConfig::new(base).with_npad(npad).with_mode(2);
    let mut sym = Reconstructor::setup(cfg.clone().with_symmetry("c2")).unwrap();
    sym.insert_slice(&slice).unwrap();

    let c2 = SymmetryGroup::parse("c2").unwrap();
    assert_eq!(c2.order(), 2);
    let mut manual = Reconstructor::setup(cfg.clone()).unwrap();
    let mut parts = Vec::new();
    for i in 0..c2.order() {
        let copy = Slice::spectrum(spectrum.clone(), c2.equivalent(&pose, i));
        manual.insert_slice(&copy).unwrap();

        let mut alone = Reconstructor::setup(cfg.clone()).unwrap();
        alone.insert_slice(&copy).unwrap();
        parts.push(alone.into_accumulator());
    }

    assert_eq!(sym.accumulator().data(), manual.accumulator().data());
    assert_eq!(sym.accumulator().weight(), manual.accumulator().weight());

    let summed = parts[0].weight() + parts[1].weight();
    for (a, b) in sym.accumulator().weight().iter().zip(summed.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
    }
}

#[test]
fn wiener_normalization_by_hand() {
    let n = 8;
    let cfg = ReconConfig::new(n).with_normalization(Normalization::Wiener);

    let (mut data, mut weight, power) = Accumulator::new(Dims::new(n), false).into_parts();
    // kx = 1, ky = 1, kz = 0: even checkerboard parity
    data[[4, 5, 1]] = Complex32::new(4.0, -2.0);
    weight[[4, 5, 1]] = 2.0;
    // a value with no weight behind it
    data[[4, 6, 2]] = Complex32::new(7.0, 7.0);
    let acc = Accumulator::from_parts(data, weight, power).unwrap();

    let session = Reconstructor::with_accumulator(cfg, acc).unwrap();
    let out = session.finish_fourier().unwrap();
    assert_abs_diff_eq!(out[[4, 5, 1]].re, 4.0 / 3.0, epsilon = 1e-6);
    assert_abs_diff_eq!(out[[4, 5, 1]].im, -2.0 / 3.0, epsilon = 1e-6);
    assert_eq!(out[[4, 6, 2]], Complex32::new(0.0, 0.0));
}

#[test]
fn unweighted_cells_are_zero_under_every_strategy() {
    let base = 8;
    let strategies = [
        Normalization::Average,
        Normalization::Dlog,
        Normalization::Wiener,
        Normalization::WienerSnr {
            snr: fourier_recon::RadialProfile::new(vec![5.0, 3.0, 1.0]),
        },
    ];
    for strategy in strategies {
        let cfg = ReconConfig::new(base).with_npad(2).with_normalization(strategy.clone());
        let mut session = Reconstructor::setup(cfg).unwrap();
        let slice = Slice::spectrum(random_spectrum(16, 9), Orientation::from_spider(5.0, 70.0, 15.0));
        session.insert_slice(&slice).unwrap();
        let mut folded = session.accumulator().clone();
        folded.enforce_central_plane();
        let weight = folded.weight().clone();

        let out = session.finish_fourier().unwrap();
        for (v, w) in out.iter().zip(weight.iter()) {
            assert!(v.re.is_finite() && v.im.is_finite(), "{strategy:?}");
            if *w == 0.0 {
                assert_eq!(*v, Complex32::new(0.0, 0.0), "{strategy:?}");
            }
        }
    }
}

#[test]
fn every_kernel_mode_reconstructs_finite_volumes() {
    for code in 1..=7u8 {
        let cfg = ReconConfig::new(8).with_npad(2).with_mode(code);
        let mut session = Reconstructor::setup(cfg).unwrap();
        for (i, angles) in [(0.0, 0.0, 0.0), (30.0, 60.0, 10.0), (100.0, 120.0, -40.0)]
            .iter()
            .enumerate()
        {
            let pose = Orientation::from_spider(angles.0, angles.1, angles.2);
            session
                .insert_slice(&Slice::spectrum(random_spectrum(16, i as u64), pose))
                .unwrap();
        }
        assert_eq!(
            KernelMode::try_from(code).unwrap().code(),
            session.config().mode
        );
        let vol = session.finish().unwrap();
        assert_eq!(vol.dim(), (8, 8, 8));
        assert!(vol.iter().all(|v| v.is_finite()), "mode {code}");
    }
}
