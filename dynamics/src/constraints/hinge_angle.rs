use super::LimitState;
use crate::body::RigidBody;
use crate::errors::WorldErrors;
use nalgebra::{Matrix3, Vector3};
use rotations::quaternion::project_multiply_left_right;
use rotations::{orthonormal_basis, UnitQuaternion};

/// Constrains the relative orientation of two bodies to a rotation about a
/// single axis, with optional angle limits.
///
/// The first two rows of the constraint remove the transverse angular error;
/// the third row is the angle limit and is decoupled whenever neither limit
/// is active.
pub struct HingeAngle {
    /// Hinge axis in body-2's frame.
    axis: Vector3<f64>,
    /// Unit vectors completing the triad with `axis`, body-2 frame.
    p0: Vector3<f64>,
    p1: Vector3<f64>,
    /// Relative reference orientation captured at initialization.
    q0: UnitQuaternion,
    accumulated_impulse: Vector3<f64>,
    bias: Vector3<f64>,
    effective_mass: Matrix3<f64>,
    jacobian: Matrix3<f64>,
    /// Limits stored as `sin(angle / 2)`.
    min_half_sin: f64,
    max_half_sin: f64,
    softness: f64,
    bias_factor: f64,
    limit_softness: f64,
    limit_bias: f64,
    limit_state: LimitState,
}

impl HingeAngle {
    /// Builds the row from the bodies' current orientations and a world-space
    /// hinge axis.
    pub(crate) fn initialize(
        body1: &RigidBody,
        body2: &RigidBody,
        axis_world: &Vector3<f64>,
    ) -> Result<Self, WorldErrors> {
        if axis_world.iter().any(|e| !e.is_finite()) {
            return Err(WorldErrors::InvalidArgument("hinge axis must be finite"));
        }
        let norm = axis_world.norm();
        if norm < f64::EPSILON {
            return Err(WorldErrors::InvalidArgument("hinge axis must be non-zero"));
        }
        let axis = body2.orientation.rotate_inverse(&(axis_world / norm));
        let [p0, p1] = orthonormal_basis(&axis);
        let q0 = body2.orientation.conjugate() * body1.orientation;
        Ok(Self {
            axis,
            p0,
            p1,
            q0,
            accumulated_impulse: Vector3::zeros(),
            bias: Vector3::zeros(),
            effective_mass: Matrix3::zeros(),
            jacobian: Matrix3::zeros(),
            min_half_sin: -1.0,
            max_half_sin: 1.0,
            softness: 0.001,
            bias_factor: 0.2,
            limit_softness: 0.0001,
            limit_bias: 0.2,
            limit_state: LimitState::Free,
        })
    }

    /// Restricts the hinge angle to `[min_angle, max_angle]` radians,
    /// measured about the axis relative to the reference orientation.
    pub fn set_limit(&mut self, min_angle: f64, max_angle: f64) {
        self.min_half_sin = (min_angle * 0.5).sin();
        self.max_half_sin = (max_angle * 0.5).sin();
    }

    pub fn set_softness(&mut self, softness: f64) {
        self.softness = softness;
    }

    pub fn set_bias_factor(&mut self, bias_factor: f64) {
        self.bias_factor = bias_factor;
    }

    pub fn set_limit_softness(&mut self, limit_softness: f64) {
        self.limit_softness = limit_softness;
    }

    pub fn set_limit_bias(&mut self, limit_bias: f64) {
        self.limit_bias = limit_bias;
    }

    pub fn accumulated_impulse(&self) -> Vector3<f64> {
        self.accumulated_impulse
    }

    pub fn limit_state(&self) -> LimitState {
        self.limit_state
    }

    pub(crate) fn prepare(
        &mut self,
        body1: &mut RigidBody,
        body2: &mut RigidBody,
        inv_dt: f64,
        warm_start: bool,
    ) {
        let q1 = body1.orientation;
        let q2 = body2.orientation;

        let rel = self.q0 * q1.conjugate();
        let dq = rel * q2;

        let mut m0 = -0.5 * project_multiply_left_right(&rel.0, &q2.0);
        let v = dq.0.imag();
        let mut error = Vector3::new(self.p0.dot(&v), self.p1.dot(&v), self.axis.dot(&v));
        // shortest-arc fix: map the relative rotation to the hemisphere
        // nearest the reference before differentiating
        if dq.0.w < 0.0 {
            error = -error;
            m0 = -m0;
        }

        let basis = Matrix3::new(
            self.p0[0], self.p0[1], self.p0[2], //
            self.p1[0], self.p1[1], self.p1[2], //
            self.axis[0], self.axis[1], self.axis[2],
        );
        let mut jacobian = basis * m0;

        let mut e = error[2];
        self.limit_state = if e > self.max_half_sin {
            e -= self.max_half_sin;
            LimitState::AtMax
        } else if e < self.min_half_sin {
            e -= self.min_half_sin;
            LimitState::AtMin
        } else {
            self.accumulated_impulse[2] = 0.0;
            jacobian.set_row(2, &nalgebra::RowVector3::zeros());
            LimitState::Free
        };

        let inertia_sum = body1.inverse_inertia_world + body2.inverse_inertia_world;
        let mut k = jacobian * inertia_sum * jacobian.transpose();
        k[(0, 0)] += self.softness * inv_dt;
        k[(1, 1)] += self.softness * inv_dt;
        k[(2, 2)] += self.limit_softness * inv_dt;
        if self.limit_state == LimitState::Free {
            // decouple the limit row so it cannot bleed into the others
            k[(0, 2)] = 0.0;
            k[(1, 2)] = 0.0;
            k[(2, 0)] = 0.0;
            k[(2, 1)] = 0.0;
            k[(2, 2)] = 1.0;
        }
        self.effective_mass = k.try_inverse().unwrap_or_else(Matrix3::zeros);

        self.jacobian = jacobian;
        self.bias = Vector3::new(
            error[0] * self.bias_factor,
            error[1] * self.bias_factor,
            e * self.limit_bias,
        ) * inv_dt;

        if warm_start {
            let impulse = self.jacobian.transpose() * self.accumulated_impulse;
            body1.apply_angular_impulse(&impulse);
            body2.apply_angular_impulse(&-impulse);
        }
    }

    pub(crate) fn iterate(&mut self, body1: &mut RigidBody, body2: &mut RigidBody, inv_dt: f64) {
        let jv = self.jacobian * (body1.angular_velocity - body2.angular_velocity);
        let softness_term = Vector3::new(
            self.accumulated_impulse[0] * self.softness,
            self.accumulated_impulse[1] * self.softness,
            self.accumulated_impulse[2] * self.limit_softness,
        ) * inv_dt;

        let lambda = -(self.effective_mass * (jv + self.bias + softness_term));

        if self.limit_state == LimitState::Free {
            self.accumulated_impulse[2] = 0.0;
        }
        let old = self.accumulated_impulse;
        self.accumulated_impulse += lambda;
        match self.limit_state {
            LimitState::AtMax => {
                self.accumulated_impulse[2] = self.accumulated_impulse[2].min(0.0)
            }
            LimitState::AtMin => {
                self.accumulated_impulse[2] = self.accumulated_impulse[2].max(0.0)
            }
            LimitState::Free => self.accumulated_impulse[2] = 0.0,
        }

        let actual = self.accumulated_impulse - old;
        let impulse = self.jacobian.transpose() * actual;
        body1.apply_angular_impulse(&impulse);
        body2.apply_angular_impulse(&-impulse);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn body_pair() -> (RigidBody, RigidBody) {
        let body1 = RigidBody::default();
        let mut body2 = RigidBody::default();
        body2.set_position(Vector3::new(0.0, 2.0, 0.0));
        (body1, body2)
    }

    #[test]
    fn test_zero_error_at_reference() {
        let (mut body1, mut body2) = body_pair();
        let mut row =
            HingeAngle::initialize(&body1, &body2, &Vector3::new(0.0, 1.0, 0.0)).unwrap();
        row.prepare(&mut body1, &mut body2, 60.0, true);
        assert_abs_diff_eq!(row.bias.norm(), 0.0, epsilon = 1e-12);
        assert_eq!(row.limit_state(), LimitState::Free);
    }

    #[test]
    fn test_rejects_zero_axis() {
        let (body1, body2) = body_pair();
        assert!(HingeAngle::initialize(&body1, &body2, &Vector3::zeros()).is_err());
        assert!(
            HingeAngle::initialize(&body1, &body2, &Vector3::new(f64::NAN, 0.0, 0.0)).is_err()
        );
    }

    #[test]
    fn test_transverse_velocity_is_damped() {
        let (mut body1, mut body2) = body_pair();
        let mut row =
            HingeAngle::initialize(&body1, &body2, &Vector3::new(0.0, 1.0, 0.0)).unwrap();
        body2.set_angular_velocity(Vector3::new(1.0, 0.5, 0.0));

        // softness leaves a residual within one prepare cycle; across
        // cycles the residual decays geometrically
        let inv_dt = 60.0;
        for _ in 0..60 {
            row.prepare(&mut body1, &mut body2, inv_dt, true);
            for _ in 0..8 {
                row.iterate(&mut body1, &mut body2, inv_dt);
            }
        }

        let relative = body1.angular_velocity() - body2.angular_velocity();
        // the transverse component is driven to zero, the axis one is free
        assert!(relative[0].abs() < 1e-6);
        assert_abs_diff_eq!(body2.angular_velocity()[1], 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_limit_clamp_codes() {
        let (mut body1, mut body2) = body_pair();
        let mut row =
            HingeAngle::initialize(&body1, &body2, &Vector3::new(0.0, 1.0, 0.0)).unwrap();
        row.set_limit(-0.1, 0.1);

        // rotate body2 past the max limit
        let turn =
            UnitQuaternion::from_axis_angle(&Vector3::new(0.0, 1.0, 0.0), 0.5).unwrap();
        body2.set_orientation(turn);
        row.prepare(&mut body1, &mut body2, 60.0, true);
        assert_eq!(row.limit_state(), LimitState::AtMax);

        // and past the min limit
        let turn =
            UnitQuaternion::from_axis_angle(&Vector3::new(0.0, 1.0, 0.0), -0.5).unwrap();
        body2.set_orientation(turn);
        row.prepare(&mut body1, &mut body2, 60.0, true);
        assert_eq!(row.limit_state(), LimitState::AtMin);
    }

    #[test]
    fn test_at_max_impulse_is_non_positive() {
        let (mut body1, mut body2) = body_pair();
        let mut row =
            HingeAngle::initialize(&body1, &body2, &Vector3::new(0.0, 1.0, 0.0)).unwrap();
        row.set_limit(-0.1, 0.1);
        let turn =
            UnitQuaternion::from_axis_angle(&Vector3::new(0.0, 1.0, 0.0), 0.5).unwrap();
        body2.set_orientation(turn);

        row.prepare(&mut body1, &mut body2, 60.0, true);
        let mut previous = row.accumulated_impulse()[2];
        for _ in 0..10 {
            row.iterate(&mut body1, &mut body2, 60.0);
            let current = row.accumulated_impulse()[2];
            assert!(current <= 1e-12);
            assert!(current <= previous + 1e-12);
            previous = current;
        }
    }

    #[test]
    fn test_free_limit_row_stays_zero() {
        let (mut body1, mut body2) = body_pair();
        let mut row =
            HingeAngle::initialize(&body1, &body2, &Vector3::new(0.0, 1.0, 0.0)).unwrap();
        body2.set_angular_velocity(Vector3::new(0.3, 2.0, -0.1));

        row.prepare(&mut body1, &mut body2, 60.0, true);
        for _ in 0..8 {
            row.iterate(&mut body1, &mut body2, 60.0);
            assert_eq!(row.accumulated_impulse()[2], 0.0);
        }
    }
}
