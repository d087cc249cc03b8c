use super::LimitState;
use crate::body::RigidBody;
use crate::errors::WorldErrors;
use nalgebra::Vector3;

/// Keeps the signed distance of an anchor on body 2 from a plane carried by
/// body 1 inside a `(min, max)` band.
///
/// The plane is defined by an anchor and an axis stored in body-1's frame;
/// the row is a scalar unilateral constraint along the axis. While neither
/// limit is active the row contributes nothing.
pub struct PointOnPlane {
    /// Plane normal in body-1's frame, unit length.
    axis: Vector3<f64>,
    /// Anchor on the plane, body-1 frame.
    anchor1: Vector3<f64>,
    /// Constrained point, body-2 frame.
    anchor2: Vector3<f64>,
    /// `(J_v1, J_w1, J_v2, J_w2)`.
    jacobian: [Vector3<f64>; 4],
    /// Reciprocal of the projected mass.
    effective_mass: f64,
    accumulated_impulse: f64,
    bias: f64,
    min_dist: f64,
    max_dist: f64,
    softness: f64,
    bias_factor: f64,
    limit_state: LimitState,
}

impl PointOnPlane {
    pub(crate) fn initialize(
        body1: &RigidBody,
        body2: &RigidBody,
        axis_world: &Vector3<f64>,
        anchor1_world: &Vector3<f64>,
        anchor2_world: &Vector3<f64>,
    ) -> Result<Self, WorldErrors> {
        for v in [axis_world, anchor1_world, anchor2_world] {
            if v.iter().any(|e| !e.is_finite()) {
                return Err(WorldErrors::InvalidArgument(
                    "plane axis and anchors must be finite",
                ));
            }
        }
        let norm = axis_world.norm();
        if norm < f64::EPSILON {
            return Err(WorldErrors::InvalidArgument("plane axis must be non-zero"));
        }
        Ok(Self {
            axis: body1.orientation.rotate_inverse(&(axis_world / norm)),
            anchor1: body1
                .orientation
                .rotate_inverse(&(anchor1_world - body1.position)),
            anchor2: body2
                .orientation
                .rotate_inverse(&(anchor2_world - body2.position)),
            jacobian: [Vector3::zeros(); 4],
            effective_mass: 0.0,
            accumulated_impulse: 0.0,
            bias: 0.0,
            min_dist: 0.0,
            max_dist: 0.0,
            softness: 0.001,
            bias_factor: 0.2,
            limit_state: LimitState::Free,
        })
    }

    /// Allowed band for the distance along the axis. The default `(0, 0)`
    /// pins the point onto the plane.
    pub fn set_limit(&mut self, min_dist: f64, max_dist: f64) {
        self.min_dist = min_dist;
        self.max_dist = max_dist;
    }

    pub fn set_softness(&mut self, softness: f64) {
        self.softness = softness;
    }

    pub fn set_bias_factor(&mut self, bias_factor: f64) {
        self.bias_factor = bias_factor;
    }

    pub fn accumulated_impulse(&self) -> f64 {
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
        let axis = body1.orientation.rotate(&self.axis);
        let r1 = body1.orientation.rotate(&self.anchor1);
        let r2 = body2.orientation.rotate(&self.anchor2);
        let p1 = body1.position + r1;
        let p2 = body2.position + r2;
        let u = p2 - p1;

        self.jacobian = [
            -axis,
            -(r1 + u).cross(&axis),
            axis,
            r2.cross(&axis),
        ];

        let mut e = u.dot(&axis);
        self.limit_state = if e > self.max_dist {
            e -= self.max_dist;
            LimitState::AtMax
        } else if e < self.min_dist {
            e -= self.min_dist;
            LimitState::AtMin
        } else {
            // inactive this step: the row contributes nothing
            self.accumulated_impulse = 0.0;
            self.limit_state = LimitState::Free;
            return;
        };

        let k = body1.inverse_mass
            + body2.inverse_mass
            + (body1.inverse_inertia_world * self.jacobian[1]).dot(&self.jacobian[1])
            + (body2.inverse_inertia_world * self.jacobian[3]).dot(&self.jacobian[3])
            + self.softness * inv_dt;
        self.effective_mass = 1.0 / k;

        self.bias = e * self.bias_factor * inv_dt;

        if warm_start {
            self.apply(body1, body2, self.accumulated_impulse);
        }
    }

    pub(crate) fn iterate(&mut self, body1: &mut RigidBody, body2: &mut RigidBody, inv_dt: f64) {
        if self.limit_state == LimitState::Free {
            return;
        }

        let jv = self.jacobian[0].dot(&body1.velocity)
            + self.jacobian[1].dot(&body1.angular_velocity)
            + self.jacobian[2].dot(&body2.velocity)
            + self.jacobian[3].dot(&body2.angular_velocity);
        let softness_term = self.accumulated_impulse * self.softness * inv_dt;

        let lambda = -self.effective_mass * (jv + self.bias + softness_term);
        let old = self.accumulated_impulse;
        self.accumulated_impulse += lambda;
        match self.limit_state {
            LimitState::AtMax => {
                self.accumulated_impulse = self.accumulated_impulse.min(0.0)
            }
            LimitState::AtMin => {
                self.accumulated_impulse = self.accumulated_impulse.max(0.0)
            }
            LimitState::Free => unreachable!(),
        }

        let actual = self.accumulated_impulse - old;
        self.apply(body1, body2, actual);
    }

    fn apply(&self, body1: &mut RigidBody, body2: &mut RigidBody, impulse: f64) {
        body1.apply_linear_impulse(&(self.jacobian[0] * impulse));
        body1.apply_angular_impulse(&(self.jacobian[1] * impulse));
        body2.apply_linear_impulse(&(self.jacobian[2] * impulse));
        body2.apply_angular_impulse(&(self.jacobian[3] * impulse));
    }
}
