use super::LimitState;
use crate::body::RigidBody;
use crate::errors::WorldErrors;
use crate::BodyHandle;
use nalgebra::Vector3;

/// A constraint row with a small fixed payload, kept in its own arena.
///
/// Same `prepare`/`iterate` protocol as the large rows; the payload is a
/// single scalar row, which is what tether-style soft-body constraints need.
pub struct SmallConstraint {
    pub(crate) body1: BodyHandle,
    pub(crate) body2: BodyHandle,
    pub(crate) stamp: u64,
    pub(crate) kind: SmallConstraintKind,
}

pub enum SmallConstraintKind {
    DistanceLimit(DistanceLimit),
}

impl SmallConstraint {
    pub(crate) fn new(body1: BodyHandle, body2: BodyHandle, kind: SmallConstraintKind) -> Self {
        Self { body1, body2, stamp: 0, kind }
    }

    pub fn body1(&self) -> BodyHandle {
        self.body1
    }

    pub fn body2(&self) -> BodyHandle {
        self.body2
    }

    pub(crate) fn prepare(
        &mut self,
        body1: &mut RigidBody,
        body2: &mut RigidBody,
        inv_dt: f64,
        stamp: u64,
    ) {
        let warm_start = self.stamp != stamp;
        self.stamp = stamp;
        match &mut self.kind {
            SmallConstraintKind::DistanceLimit(row) => {
                row.prepare(body1, body2, inv_dt, warm_start)
            }
        }
    }

    pub(crate) fn iterate(&mut self, body1: &mut RigidBody, body2: &mut RigidBody, inv_dt: f64) {
        match &mut self.kind {
            SmallConstraintKind::DistanceLimit(row) => row.iterate(body1, body2, inv_dt),
        }
    }

    pub fn as_distance_limit(&self) -> Option<&DistanceLimit> {
        match &self.kind {
            SmallConstraintKind::DistanceLimit(row) => Some(row),
        }
    }

    pub fn as_distance_limit_mut(&mut self) -> Option<&mut DistanceLimit> {
        match &mut self.kind {
            SmallConstraintKind::DistanceLimit(row) => Some(row),
        }
    }
}

/// Keeps the distance between two anchors inside a `(min, max)` band.
pub struct DistanceLimit {
    anchor1: Vector3<f64>,
    anchor2: Vector3<f64>,
    jacobian: [Vector3<f64>; 4],
    effective_mass: f64,
    accumulated_impulse: f64,
    bias: f64,
    min_dist: f64,
    max_dist: f64,
    softness: f64,
    bias_factor: f64,
    limit_state: LimitState,
}

impl DistanceLimit {
    pub(crate) fn initialize(
        body1: &RigidBody,
        body2: &RigidBody,
        anchor1_world: &Vector3<f64>,
        anchor2_world: &Vector3<f64>,
        min_dist: f64,
        max_dist: f64,
    ) -> Result<Self, WorldErrors> {
        for v in [anchor1_world, anchor2_world] {
            if v.iter().any(|e| !e.is_finite()) {
                return Err(WorldErrors::InvalidArgument("anchors must be finite"));
            }
        }
        if !min_dist.is_finite() || !max_dist.is_finite() || min_dist > max_dist || min_dist < 0.0
        {
            return Err(WorldErrors::InvalidArgument(
                "distance limits must be finite with 0 <= min <= max",
            ));
        }
        Ok(Self {
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
            min_dist,
            max_dist,
            softness: 0.001,
            bias_factor: 0.2,
            limit_state: LimitState::Free,
        })
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
        let r1 = body1.orientation.rotate(&self.anchor1);
        let r2 = body2.orientation.rotate(&self.anchor2);
        let p1 = body1.position + r1;
        let p2 = body2.position + r2;
        let u = p2 - p1;

        let dist = u.norm();
        // anchors on top of each other leave the direction undefined; any
        // unit vector satisfies the row then
        let axis = if dist > f64::EPSILON {
            u / dist
        } else {
            Vector3::new(0.0, 1.0, 0.0)
        };

        self.jacobian = [-axis, -r1.cross(&axis), axis, r2.cross(&axis)];

        let mut e = dist;
        self.limit_state = if e > self.max_dist {
            e -= self.max_dist;
            LimitState::AtMax
        } else if e < self.min_dist {
            e -= self.min_dist;
            LimitState::AtMin
        } else {
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
