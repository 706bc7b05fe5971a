//! Slice orientations and point-group symmetry expansion.

use nalgebra::{Matrix3, Rotation3, Unit, Vector3};

use crate::error::{invalid_config, Result};

/// A slice pose as a 3x3 rotation matrix.
///
/// Row 0 and row 1 span the slice plane in frequency space: slice point
/// `(x, ky)` lands at `x * row0 + ky * row1`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Orientation {
    matrix: Matrix3<f32>,
}

impl Default for Orientation {
    fn default() -> Self {
        Self::identity()
    }
}

impl Orientation {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
        }
    }

    pub fn from_matrix(matrix: Matrix3<f32>) -> Self {
        Self { matrix }
    }

    /// ZYZ Euler angles in degrees, `Rz(psi) * Ry(theta) * Rz(phi)`, in the
    /// frame-rotation sense used by SPIDER/EMAN parameter files.
    pub fn from_spider(phi: f32, theta: f32, psi: f32) -> Self {
        let (sf, cf) = phi.to_radians().sin_cos();
        let (st, ct) = theta.to_radians().sin_cos();
        let (sp, cp) = psi.to_radians().sin_cos();
        let matrix = Matrix3::new(
            cp * ct * cf - sp * sf,
            cp * ct * sf + sp * cf,
            -cp * st,
            -sp * ct * cf - cp * sf,
            -sp * ct * sf + cp * cf,
            sp * st,
            st * cf,
            st * sf,
            ct,
        );
        Self { matrix }
    }

    /// The ZYZ angles `(phi, theta, psi)` in degrees that
    /// [`Orientation::from_spider`] maps back to this matrix. When `theta`
    /// is 0 or 180 only `psi +- phi` is defined and `phi` is reported as 0.
    pub fn spider_angles(&self) -> (f32, f32, f32) {
        let m = &self.matrix;
        let theta = m[(2, 2)].clamp(-1.0, 1.0).acos();
        if theta.sin().abs() > 1.0e-5 {
            let phi = m[(2, 1)].atan2(m[(2, 0)]);
            let psi = m[(1, 2)].atan2(-m[(0, 2)]);
            (phi.to_degrees(), theta.to_degrees(), psi.to_degrees())
        } else if m[(2, 2)] > 0.0 {
            (0.0, 0.0, m[(0, 1)].atan2(m[(0, 0)]).to_degrees())
        } else {
            (0.0, 180.0, m[(0, 1)].atan2(-m[(0, 0)]).to_degrees())
        }
    }

    pub fn matrix(&self) -> &Matrix3<f32> {
        &self.matrix
    }

    /// `self * other`.
    pub fn compose(&self, other: &Orientation) -> Orientation {
        Orientation {
            matrix: self.matrix * other.matrix,
        }
    }

    /// Frequency coordinates of slice point `(x, ky)`, origin at zero.
    #[inline]
    pub fn map(&self, x: f32, ky: f32) -> [f32; 3] {
        let m = &self.matrix;
        [
            x * m[(0, 0)] + ky * m[(1, 0)],
            x * m[(0, 1)] + ky * m[(1, 1)],
            x * m[(0, 2)] + ky * m[(1, 2)],
        ]
    }
}

const GROUP_TOLERANCE: f64 = 1.0e-4;
const MAX_GROUP_ORDER: usize = 240;

/// A point group resolved from its label, e.g. `c1`, `d7`, `tet`, `icos`.
#[derive(Clone, Debug)]
pub struct SymmetryGroup {
    label: String,
    elements: Vec<Matrix3<f32>>,
}

impl SymmetryGroup {
    pub fn parse(label: &str) -> Result<Self> {
        let key = label.trim().to_ascii_lowercase();
        let z = Vector3::z_axis();
        let x = Vector3::x_axis();
        let diag = Unit::new_normalize(Vector3::new(1.0, 1.0, 1.0));
        let tau = std::f64::consts::TAU;

        let generators: Vec<Rotation3<f64>> = match key.as_str() {
            "t" | "tet" => vec![
                Rotation3::from_axis_angle(&z, tau / 2.0),
                Rotation3::from_axis_angle(&diag, tau / 3.0),
            ],
            "o" | "oct" => vec![
                Rotation3::from_axis_angle(&z, tau / 4.0),
                Rotation3::from_axis_angle(&diag, tau / 3.0),
            ],
            "i" | "icos" => {
                let phi = (1.0 + 5.0f64.sqrt()) / 2.0;
                let five = Unit::new_normalize(Vector3::new(0.0, 1.0, phi));
                vec![
                    Rotation3::from_axis_angle(&z, tau / 2.0),
                    Rotation3::from_axis_angle(&five, tau / 5.0),
                ]
            }
            _ => {
                let fold = key
                    .get(1..)
                    .and_then(|n| n.parse::<usize>().ok())
                    .filter(|n| *n >= 1)
                    .ok_or_else(|| invalid_config(format!("unknown symmetry group '{label}'")))?;
                match key.as_bytes()[0] {
                    b'c' => vec![Rotation3::from_axis_angle(&z, tau / fold as f64)],
                    b'd' => vec![
                        Rotation3::from_axis_angle(&z, tau / fold as f64),
                        Rotation3::from_axis_angle(&x, tau / 2.0),
                    ],
                    _ => return Err(invalid_config(format!("unknown symmetry group '{label}'"))),
                }
            }
        };

        let elements = close_group(&generators)
            .ok_or_else(|| invalid_config(format!("symmetry group '{label}' does not close")))?;
        Ok(Self {
            label: key,
            elements,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn order(&self) -> usize {
        self.elements.len()
    }

    /// The `i`-th symmetry-equivalent pose of `base`; `i = 0` is `base`
    /// itself.
    ///
    /// # Panics
    /// If `i >= self.order()`.
    pub fn equivalent(&self, base: &Orientation, i: usize) -> Orientation {
        Orientation::from_matrix(base.matrix * self.elements[i])
    }

    pub fn orientations<'a>(&'a self, base: &'a Orientation) -> impl Iterator<Item = Orientation> + 'a {
        (0..self.order()).map(move |i| self.equivalent(base, i))
    }
}

/// Every product of the generators, identity first. `None` if the set keeps
/// growing, which only happens for generators that are not a finite group.
fn close_group(generators: &[Rotation3<f64>]) -> Option<Vec<Matrix3<f32>>> {
    let mut elements: Vec<Matrix3<f64>> = vec![Matrix3::identity()];
    let mut cursor = 0;
    while cursor < elements.len() {
        let e = elements[cursor];
        for g in generators {
            let p = g.matrix() * e;
            let known = elements
                .iter()
                .any(|q| (q - p).abs().max() < GROUP_TOLERANCE);
            if !known {
                if elements.len() == MAX_GROUP_ORDER {
                    return None;
                }
                elements.push(p);
            }
        }
        cursor += 1;
    }
    Some(elements.iter().map(|m| m.cast::<f32>()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn group_orders() {
        for (label, order) in [
            ("c1", 1),
            ("C4", 4),
            ("d1", 2),
            ("d6", 12),
            ("tet", 12),
            ("t", 12),
            ("oct", 24),
            ("icos", 60),
        ] {
            assert_eq!(SymmetryGroup::parse(label).unwrap().order(), order, "{label}");
        }
    }

    #[test]
    fn unknown_labels_are_rejected() {
        for label in ["", "x3", "c0", "c", "dd2", "h"] {
            assert!(SymmetryGroup::parse(label).is_err(), "{label}");
        }
    }

    #[test]
    fn first_element_is_identity() {
        let g = SymmetryGroup::parse("d3").unwrap();
        let base = Orientation::from_spider(10.0, 20.0, 30.0);
        assert_eq!(g.equivalent(&base, 0), base);
    }

    #[test]
    fn octahedral_group_is_closed() {
        let g = SymmetryGroup::parse("oct").unwrap();
        for a in &g.elements {
            for b in &g.elements {
                let p = a * b;
                assert!(g.elements.iter().any(|q| (q - p).abs().max() < 1e-4));
            }
        }
    }

    #[test]
    fn spider_angles_give_rotations() {
        let o = Orientation::from_spider(33.0, 71.0, -12.0);
        let m = o.matrix();
        let should_be_identity = m * m.transpose();
        assert_abs_diff_eq!((should_be_identity - Matrix3::identity()).abs().max(), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(m.determinant(), 1.0, epsilon = 1e-6);
        assert_eq!(Orientation::from_spider(0.0, 0.0, 0.0), Orientation::identity());
    }

    #[test]
    fn spider_angles_round_trip() {
        for (phi, theta, psi) in [(10.0, 20.0, 30.0), (-120.0, 95.0, 170.0), (0.0, 0.0, 45.0), (0.0, 180.0, -60.0)] {
            let o = Orientation::from_spider(phi, theta, psi);
            let (a, b, c) = o.spider_angles();
            let back = Orientation::from_spider(a, b, c);
            assert_abs_diff_eq!((back.matrix() - o.matrix()).abs().max(), 0.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn mapping_uses_first_two_rows() {
        let p = Orientation::identity().map(3.0, -2.0);
        assert_eq!(p, [3.0, -2.0, 0.0]);

        // 90 degree tilt about y puts the slice x axis along -z
        let o = Orientation::from_spider(0.0, 90.0, 0.0);
        let p = o.map(1.0, 0.0);
        assert_abs_diff_eq!(p[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(p[1], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(p[2], -1.0, epsilon = 1e-6);
    }
}
