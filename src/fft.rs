//! Forward transform of projections into padded Fourier slices and inverse
//! transform of the finished half-space volume.

use std::sync::Arc;

use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use crate::error::{invalid_size, ReconError, Result};

fn transform_lanes<D: ndarray::Dimension>(
    data: &mut ndarray::Array<Complex32, D>,
    axis: Axis,
    fft: &Arc<dyn Fft<f32>>,
) {
    let mut buf = vec![Complex32::new(0.0, 0.0); data.len_of(axis)];
    for mut lane in data.lanes_mut(axis) {
        for (b, v) in buf.iter_mut().zip(lane.iter()) {
            *b = *v;
        }
        fft.process(&mut buf);
        for (v, b) in lane.iter_mut().zip(buf.iter()) {
            *v = *b;
        }
    }
}

/// Mean of the pixels outside the inscribed circle, if there are any.
fn background_mean(image: &ArrayView2<f32>) -> Option<f32> {
    let n = image.nrows() as isize;
    let c = n / 2;
    let r2 = c * c;
    let (mut sum, mut count) = (0.0f64, 0usize);
    for ((j, i), v) in image.indexed_iter() {
        let (dy, dx) = (j as isize - c, i as isize - c);
        if dx * dx + dy * dy > r2 {
            sum += *v as f64;
            count += 1;
        }
    }
    (count > 0).then(|| (sum / count as f64) as f32)
}

/// Phase that moves the real-space origin of an `n`-point transform by
/// `n/2` samples, for the signed frequency sum `k`.
///
/// Even lattices get the exact checkerboard `(-1)^k`; odd ones need the
/// full `exp(2 pi i k (n/2) / n)`.
pub(crate) fn origin_phase(k: isize, n: usize) -> Complex32 {
    let n = n as isize;
    let h = n / 2;
    if n % 2 == 0 {
        let sign = if k.rem_euclid(2) == 0 { 1.0 } else { -1.0 };
        return Complex32::new(sign, 0.0);
    }
    let turns = (k * h).rem_euclid(n) as f32 / n as f32;
    Complex32::from_polar(1.0, 2.0 * std::f32::consts::PI * turns)
}

/// Turn a square real-space projection into a padded Fourier slice.
///
/// The image is background-subtracted, zero-padded to `size * npad` with
/// pixel `n/2` of the image on pixel `np/2` of the pad, and transformed. The
/// result has shape `[np, np/2 + 1]`: rows are centred `ky`, columns the
/// non-negative `kx`. An origin phase places the real-space origin at the
/// image centre, and `shift = (sx, sy)` translates the image by sub-pixel
/// amounts.
pub fn prepare_slice(
    image: &ArrayView2<f32>,
    npad: usize,
    shift: Option<(f32, f32)>,
) -> Result<Array2<Complex32>> {
    let (ny, nx) = image.dim();
    if ny == 0 || nx == 0 {
        return Err(ReconError::NullInput("empty projection".into()));
    }
    if ny != nx {
        return Err(invalid_size(format!("projection is {ny}x{nx}, expected a square image")));
    }
    if npad == 0 {
        return Err(invalid_size("padding factor must be at least 1"));
    }
    let n = nx;
    let np = n * npad;
    let offset = np / 2 - n / 2;
    let background = background_mean(image).unwrap_or(0.0);

    let mut full = Array2::<Complex32>::zeros((np, np));
    full.slice_mut(s![offset..offset + n, offset..offset + n])
        .zip_mut_with(image, |d, v| *d = Complex32::new(*v - background, 0.0));

    let fft = FftPlanner::<f32>::new().plan_fft_forward(np);
    transform_lanes(&mut full, Axis(1), &fft);
    transform_lanes(&mut full, Axis(0), &fft);

    let h = np / 2;
    let nxc = np / 2 + 1;
    let out = Array2::from_shape_fn((np, nxc), |(c, kx)| {
        let ky = c as isize - h as isize;
        let wrapped = (c + np - h) % np;
        let mut v = full[[wrapped, kx]] * origin_phase(kx as isize + ky, np);
        if let Some((sx, sy)) = shift {
            let phase = -2.0 * std::f32::consts::PI * (kx as f32 * sx + ky as f32 * sy) / np as f32;
            v *= Complex32::from_polar(1.0, phase);
        }
        v
    });
    Ok(out)
}

/// Move the centred `y`/`z` axes of a half-space volume to FFT wrap order.
pub fn centred_to_wrap(centred: &Array3<Complex32>) -> Array3<Complex32> {
    let (n, _, nxc) = centred.dim();
    let h = n / 2;
    Array3::from_shape_fn((n, n, nxc), |(z, y, x)| centred[[(z + h) % n, (y + h) % n, x]])
}

/// Inverse transform of a Hermitian half-space volume in wrap order.
///
/// Returns the real `n^3` volume scaled by `1/n^3`.
pub fn inverse_half_volume(half: Array3<Complex32>) -> Array3<f32> {
    let (n, _, nxc) = half.dim();
    let fft = FftPlanner::<f32>::new().plan_fft_inverse(n);
    let mut half = half;
    transform_lanes(&mut half, Axis(0), &fft);
    transform_lanes(&mut half, Axis(1), &fft);

    let scale = 1.0 / (n * n * n) as f32;
    let mut out = Array3::<f32>::zeros((n, n, n));
    let mut row = vec![Complex32::new(0.0, 0.0); n];
    for z in 0..n {
        for y in 0..n {
            for kx in 0..n {
                row[kx] = if kx < nxc {
                    half[[z, y, kx]]
                } else {
                    half[[z, y, n - kx]].conj()
                };
            }
            fft.process(&mut row);
            for (x, v) in row.iter().enumerate() {
                out[[z, y, x]] = v.re * scale;
            }
        }
    }
    out
}

/// The `base^3` window of a padded volume whose voxel `base/2` sits on the
/// padded centre `n/2`.
pub fn crop_centred(volume: &Array3<f32>, base: usize) -> Array3<f32> {
    let n = volume.len_of(Axis(0));
    if base >= n {
        return volume.clone();
    }
    let o = n / 2 - base / 2;
    volume
        .slice(s![o..o + base, o..o + base, o..o + base])
        .to_owned()
}

/// Subtract the mean of the outermost spherical shell and zero everything
/// outside the inscribed sphere.
pub fn mask_circumference(volume: &mut Array3<f32>) {
    let s = volume.len_of(Axis(0)) as isize;
    let c = s / 2;
    let outer = c * c;
    let inner = (c - 1) * (c - 1);
    let radius2 = |(k, j, i): (usize, usize, usize)| {
        let (dz, dy, dx) = (k as isize - c, j as isize - c, i as isize - c);
        dx * dx + dy * dy + dz * dz
    };

    let (mut sum, mut count) = (0.0f64, 0usize);
    for (idx, v) in volume.indexed_iter() {
        let lr = radius2(idx);
        if lr >= inner && lr <= outer {
            sum += *v as f64;
            count += 1;
        }
    }
    let mean = if count > 0 { (sum / count as f64) as f32 } else { 0.0 };

    for (idx, v) in volume.indexed_iter_mut() {
        if radius2(idx) > outer {
            *v = 0.0;
        } else {
            *v -= mean;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn centred_delta_transforms_to_ones() {
        let n = 8;
        let mut image = Array2::<f32>::zeros((n, n));
        image[[n / 2, n / 2]] = 1.0;
        let slice = prepare_slice(&image.view(), 1, None).unwrap();
        assert_eq!(slice.dim(), (8, 5));
        for v in slice.iter() {
            assert_abs_diff_eq!(v.re, 1.0, epsilon = 1e-5);
            assert_abs_diff_eq!(v.im, 0.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn padding_keeps_centred_delta_flat() {
        let mut image = Array2::<f32>::zeros((6, 6));
        image[[3, 3]] = 2.0;
        let slice = prepare_slice(&image.view(), 2, None).unwrap();
        assert_eq!(slice.dim(), (12, 7));
        for v in slice.iter() {
            assert_abs_diff_eq!(v.re, 2.0, epsilon = 1e-5);
            assert_abs_diff_eq!(v.im, 0.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn odd_sizes_keep_centred_delta_flat() {
        for (n, npad) in [(9, 1), (9, 2), (7, 3)] {
            let mut image = Array2::<f32>::zeros((n, n));
            image[[n / 2, n / 2]] = 1.0;
            let slice = prepare_slice(&image.view(), npad, None).unwrap();
            let np = n * npad;
            assert_eq!(slice.dim(), (np, np / 2 + 1));
            for v in slice.iter() {
                assert_abs_diff_eq!(v.re, 1.0, epsilon = 1e-4);
                assert_abs_diff_eq!(v.im, 0.0, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn origin_phase_is_a_checkerboard_for_even_lattices() {
        assert_eq!(origin_phase(3, 8), Complex32::new(-1.0, 0.0));
        assert_eq!(origin_phase(-4, 8), Complex32::new(1.0, 0.0));
        // odd: k = 1 on 9 points moves by 4/9 of a turn
        let p = origin_phase(1, 9);
        let expect = Complex32::from_polar(1.0, 2.0 * std::f32::consts::PI * 4.0 / 9.0);
        assert_abs_diff_eq!(p.re, expect.re, epsilon = 1e-6);
        assert_abs_diff_eq!(p.im, expect.im, epsilon = 1e-6);
        let q = origin_phase(-1, 9);
        assert_abs_diff_eq!(q.re, p.re, epsilon = 1e-6);
        assert_abs_diff_eq!(q.im, -p.im, epsilon = 1e-6);
    }

    #[test]
    fn whole_pixel_shift_matches_moved_image() {
        let n = 8;
        let mut centred = Array2::<f32>::zeros((n, n));
        centred[[4, 4]] = 1.0;
        let mut moved = Array2::<f32>::zeros((n, n));
        moved[[4, 5]] = 1.0;
        let a = prepare_slice(&centred.view(), 1, Some((1.0, 0.0))).unwrap();
        let b = prepare_slice(&moved.view(), 1, None).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(x.re, y.re, epsilon = 1e-4);
            assert_abs_diff_eq!(x.im, y.im, epsilon = 1e-4);
        }
    }

    #[test]
    fn background_outside_circle_is_removed() {
        let image = Array2::<f32>::from_elem((8, 8), 3.0);
        let slice = prepare_slice(&image.view(), 1, None).unwrap();
        assert!(slice.iter().all(|v| v.norm() < 1e-4));
    }

    #[test]
    fn non_square_projection_is_rejected() {
        let image = Array2::<f32>::zeros((8, 6));
        assert!(matches!(
            prepare_slice(&image.view(), 1, None),
            Err(ReconError::InvalidSize(_))
        ));
    }

    #[test]
    fn dc_term_inverts_to_constant() {
        let n = 6;
        let mut centred = Array3::<Complex32>::zeros((n, n, n / 2 + 1));
        centred[[n / 2, n / 2, 0]] = Complex32::new((n * n * n) as f32, 0.0);
        let vol = inverse_half_volume(centred_to_wrap(&centred));
        for v in vol.iter() {
            assert_abs_diff_eq!(*v, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn single_frequencies_invert_to_cosines() {
        let n = 8;
        let h = n / 2;
        let amp = Complex32::new((n * n * n) as f32 / 2.0, 0.0);

        let mut along_x = Array3::<Complex32>::zeros((n, n, h + 1));
        along_x[[h, h, 1]] = amp;
        let vol = inverse_half_volume(centred_to_wrap(&along_x));
        for ((_, _, x), v) in vol.indexed_iter() {
            let expect = (2.0 * std::f32::consts::PI * x as f32 / n as f32).cos();
            assert_abs_diff_eq!(*v, expect, epsilon = 1e-5);
        }

        let mut along_y = Array3::<Complex32>::zeros((n, n, h + 1));
        along_y[[h, h + 1, 0]] = amp;
        along_y[[h, h - 1, 0]] = amp;
        let vol = inverse_half_volume(centred_to_wrap(&along_y));
        for ((_, y, _), v) in vol.indexed_iter() {
            let expect = (2.0 * std::f32::consts::PI * y as f32 / n as f32).cos();
            assert_abs_diff_eq!(*v, expect, epsilon = 1e-5);
        }
    }

    #[test]
    fn crop_takes_middle_window() {
        let vol = Array3::from_shape_fn((8, 8, 8), |(z, y, x)| (z * 100 + y * 10 + x) as f32);
        let c = crop_centred(&vol, 4);
        assert_eq!(c.dim(), (4, 4, 4));
        assert_eq!(c[[0, 0, 0]], 222.0);
        assert_eq!(c[[3, 3, 3]], 555.0);

        // odd window in an even pad: voxel 4 of 9 lands on 9 of 18
        let vol = Array3::from_shape_fn((18, 18, 18), |(z, _, _)| z as f32);
        let c = crop_centred(&vol, 9);
        assert_eq!(c[[4, 0, 0]], 9.0);
    }

    #[test]
    fn circumference_mask_zeroes_corners_and_centres_shell() {
        let mut vol = Array3::<f32>::from_elem((8, 8, 8), 5.0);
        mask_circumference(&mut vol);
        assert_eq!(vol[[0, 0, 0]], 0.0);
        assert_abs_diff_eq!(vol[[4, 4, 4]], 0.0);
        assert_abs_diff_eq!(vol[[4, 4, 0]], 0.0);
    }
}
