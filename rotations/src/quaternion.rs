use nalgebra::{Matrix3, Matrix4, Vector3};
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Mul, Neg};
use thiserror::Error;

/// A quaternion in the Hamilton convention (`ij = k`), stored as `(x, y, z, w)`
/// with `w` the scalar part.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

/// Errors that can occur when creating a `Quaternion`.
#[derive(Debug, Clone, Error, Copy)]
pub enum QuaternionErrors {
    #[error("got zero magnitude quaternion")]
    ZeroMagnitude,
    #[error("got zero magnitude axis")]
    ZeroMagnitudeAxis,
}

impl Quaternion {
    pub const IDENTITY: Self = Self { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };

    pub fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }

    pub fn dot(&self, other: &Quaternion) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z + self.w * other.w
    }

    pub fn norm(&self) -> f64 {
        self.dot(self).sqrt()
    }

    pub fn conjugate(&self) -> Quaternion {
        Quaternion::new(-self.x, -self.y, -self.z, self.w)
    }

    /// Returns the imaginary part as a 3-vector.
    pub fn imag(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    /// Normalizes the quaternion.
    ///
    /// # Returns
    ///
    /// A `Result` which is `Ok` containing the normalized `Quaternion`, or an
    /// `Err` containing a `QuaternionErrors` if the magnitude is zero.
    pub fn normalize(&self) -> Result<Self, QuaternionErrors> {
        let mag = self.norm();
        if mag < f64::EPSILON {
            return Err(QuaternionErrors::ZeroMagnitude);
        }
        Ok(Quaternion::new(
            self.x / mag,
            self.y / mag,
            self.z / mag,
            self.w / mag,
        ))
    }

    /// Creates a random quaternion. Not normalized.
    pub fn rand() -> Quaternion {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        Quaternion::new(
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
        )
    }

    /// The 4x4 matrix `L(q)` such that `L(q) * p` is the Hamilton product
    /// `q * p`, with quaternions laid out as `(w, x, y, z)` column vectors.
    pub fn left_matrix(&self) -> Matrix4<f64> {
        let (x, y, z, w) = (self.x, self.y, self.z, self.w);
        Matrix4::new(
            w, -x, -y, -z, //
            x, w, -z, y, //
            y, z, w, -x, //
            z, -y, x, w,
        )
    }

    /// The 4x4 matrix `R(q)` such that `R(q) * p` is the Hamilton product
    /// `p * q`, with the same `(w, x, y, z)` layout as [`left_matrix`](Self::left_matrix).
    pub fn right_matrix(&self) -> Matrix4<f64> {
        let (x, y, z, w) = (self.x, self.y, self.z, self.w);
        Matrix4::new(
            w, -x, -y, -z, //
            x, w, z, -y, //
            y, -z, w, x, //
            z, y, -x, w,
        )
    }
}

/// Extracts the lower-right 3x3 block of a 4x4 quaternion matrix, i.e. the
/// rows and columns acting on the imaginary parts.
pub fn project(m: &Matrix4<f64>) -> Matrix3<f64> {
    m.fixed_view::<3, 3>(1, 1).into_owned()
}

/// Closed form of `project(a.left_matrix() * b.right_matrix())`.
///
/// This is the bilinear block that maps an angular velocity to the rate of
/// change of the imaginary part of a relative orientation, so the entries
/// must match the matrix product expansion exactly.
pub fn project_multiply_left_right(a: &Quaternion, b: &Quaternion) -> Matrix3<f64> {
    Matrix3::new(
        a.w * b.w - a.x * b.x + a.y * b.y + a.z * b.z,
        -a.x * b.y - a.y * b.x + a.w * b.z - a.z * b.w,
        -a.x * b.z - a.z * b.x - a.w * b.y + a.y * b.w,
        -a.y * b.x - a.x * b.y - a.w * b.z + a.z * b.w,
        a.w * b.w + a.x * b.x - a.y * b.y + a.z * b.z,
        -a.y * b.z - a.z * b.y + a.w * b.x - a.x * b.w,
        -a.z * b.x - a.x * b.z + a.w * b.y - a.y * b.w,
        -a.z * b.y - a.y * b.z - a.w * b.x + a.x * b.w,
        a.w * b.w + a.x * b.x + a.y * b.y - a.z * b.z,
    )
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mul<Quaternion> for Quaternion {
    type Output = Self;

    /// Hamilton product of two quaternions (`ij = k`).
    fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
            self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
        )
    }
}

impl Mul<f64> for Quaternion {
    type Output = Self;

    fn mul(self, rhs: f64) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs, self.w * rhs)
    }
}

impl Add<Quaternion> for Quaternion {
    type Output = Self;

    /// Componentwise sum. Only meaningful for accumulating quaternion
    /// derivatives during integration, not for composing rotations.
    fn add(self, rhs: Self) -> Self {
        Self::new(
            self.x + rhs.x,
            self.y + rhs.y,
            self.z + rhs.z,
            self.w + rhs.w,
        )
    }
}

impl AddAssign<Quaternion> for Quaternion {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
        self.z += rhs.z;
        self.w += rhs.w;
    }
}

impl Neg for Quaternion {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z, -self.w)
    }
}

/// A unit quaternion representing a 3D rotation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct UnitQuaternion(pub Quaternion);

impl UnitQuaternion {
    pub const IDENTITY: Self = Self(Quaternion::IDENTITY);

    pub fn new(x: f64, y: f64, z: f64, w: f64) -> Result<Self, QuaternionErrors> {
        Ok(Self(Quaternion::new(x, y, z, w).normalize()?))
    }

    /// Builds the rotation of `angle` radians about `axis`.
    ///
    /// # Returns
    ///
    /// A `Result` which is `Ok` containing the rotation, or an `Err` if the
    /// axis has zero magnitude.
    pub fn from_axis_angle(axis: &Vector3<f64>, angle: f64) -> Result<Self, QuaternionErrors> {
        let mag = axis.norm();
        if mag < f64::EPSILON {
            return Err(QuaternionErrors::ZeroMagnitudeAxis);
        }
        let half = 0.5 * angle;
        let s = half.sin() / mag;
        Ok(Self(Quaternion::new(
            axis[0] * s,
            axis[1] * s,
            axis[2] * s,
            half.cos(),
        )))
    }

    pub fn conjugate(&self) -> Self {
        // already unit, no renormalization needed
        Self(self.0.conjugate())
    }

    /// Rotates a vector from the body frame to the world frame (active
    /// rotation).
    pub fn rotate(&self, v: &Vector3<f64>) -> Vector3<f64> {
        let (x, y, z, w) = (self.0.x, self.0.y, self.0.z, self.0.w);

        let out1 = (w * w + x * x - y * y - z * z) * v[0]
            + 2.0 * (x * y - w * z) * v[1]
            + 2.0 * (x * z + w * y) * v[2];

        let out2 = 2.0 * (x * y + w * z) * v[0]
            + (w * w - x * x + y * y - z * z) * v[1]
            + 2.0 * (y * z - w * x) * v[2];

        let out3 = 2.0 * (x * z - w * y) * v[0]
            + 2.0 * (y * z + w * x) * v[1]
            + (w * w - x * x - y * y + z * z) * v[2];

        Vector3::new(out1, out2, out3)
    }

    /// Rotates a vector from the world frame to the body frame, the inverse
    /// of [`rotate`](Self::rotate).
    pub fn rotate_inverse(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.conjugate().rotate(v)
    }

    /// The rotation matrix `R` with `R * v == self.rotate(v)`.
    pub fn to_rotation_matrix(&self) -> Matrix3<f64> {
        let (x, y, z, w) = (self.0.x, self.0.y, self.0.z, self.0.w);
        Matrix3::new(
            w * w + x * x - y * y - z * z,
            2.0 * (x * y - w * z),
            2.0 * (x * z + w * y),
            2.0 * (x * y + w * z),
            w * w - x * x + y * y - z * z,
            2.0 * (y * z - w * x),
            2.0 * (x * z - w * y),
            2.0 * (y * z + w * x),
            w * w - x * x - y * y + z * z,
        )
    }

    /// Advances the orientation by `omega` (world frame, rad/s) over `dt`
    /// with the kinematic relation `dq/dt = 0.5 * omega_quat * q`, then
    /// renormalizes.
    ///
    /// Non-finite inputs propagate as non-finite components; callers own the
    /// finiteness of their velocities.
    pub fn integrate(&self, omega: &Vector3<f64>, dt: f64) -> Self {
        let omega_quat = Quaternion::new(omega[0], omega[1], omega[2], 0.0);
        let derivative = omega_quat * self.0 * (0.5 * dt);
        let q = self.0 + derivative;
        let mag = q.norm();
        Self(Quaternion::new(q.x / mag, q.y / mag, q.z / mag, q.w / mag))
    }

    pub fn rand() -> Result<Self, QuaternionErrors> {
        Ok(Self(Quaternion::rand().normalize()?))
    }
}

impl Default for UnitQuaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mul<UnitQuaternion> for UnitQuaternion {
    type Output = Self;

    fn mul(self, rhs: UnitQuaternion) -> Self::Output {
        Self(self.0 * rhs.0)
    }
}

impl Neg for UnitQuaternion {
    type Output = Self;

    fn neg(self) -> Self {
        Self(-self.0)
    }
}

impl From<UnitQuaternion> for Quaternion {
    fn from(value: UnitQuaternion) -> Self {
        value.0
    }
}

impl TryFrom<Quaternion> for UnitQuaternion {
    type Error = QuaternionErrors;

    fn try_from(value: Quaternion) -> Result<Self, QuaternionErrors> {
        Ok(Self(value.normalize()?))
    }
}
