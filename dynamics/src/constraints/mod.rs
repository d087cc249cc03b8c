//! Velocity-level constraint rows.
//!
//! A row couples two bodies and carries its accumulated Lagrange multiplier
//! across solver iterations. Rows are a closed set of variants dispatched
//! through the enum discriminant; each variant inlines its own `prepare` and
//! `iterate`, so the solver's inner loop walks contiguous records without an
//! out-of-line vtable.

pub mod hinge_angle;
pub mod point_on_plane;
pub mod small;

use crate::body::RigidBody;
use crate::BodyHandle;
use serde::{Deserialize, Serialize};

pub use hinge_angle::HingeAngle;
pub use point_on_plane::PointOnPlane;
pub use small::{DistanceLimit, SmallConstraint, SmallConstraintKind};

/// Which unilateral limit, if any, a row found active during `prepare`.
/// Selects the inequality projection applied to the accumulated impulse
/// during `iterate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitState {
    Free,
    AtMax,
    AtMin,
}

/// A constraint row between two bodies.
pub struct Constraint {
    pub(crate) body1: BodyHandle,
    pub(crate) body2: BodyHandle,
    pub(crate) stamp: u64,
    pub(crate) kind: ConstraintKind,
}

pub enum ConstraintKind {
    HingeAngle(HingeAngle),
    PointOnPlane(PointOnPlane),
}

impl Constraint {
    pub(crate) fn new(body1: BodyHandle, body2: BodyHandle, kind: ConstraintKind) -> Self {
        Self { body1, body2, stamp: 0, kind }
    }

    pub fn body1(&self) -> BodyHandle {
        self.body1
    }

    pub fn body2(&self) -> BodyHandle {
        self.body2
    }

    /// Builds the row's jacobian and effective mass for the current body
    /// state and applies the warm-start impulse.
    ///
    /// The warm start must happen exactly once per substep even if a caller
    /// prepares twice; `stamp` identifies the substep.
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
            ConstraintKind::HingeAngle(row) => row.prepare(body1, body2, inv_dt, warm_start),
            ConstraintKind::PointOnPlane(row) => row.prepare(body1, body2, inv_dt, warm_start),
        }
    }

    /// Applies one velocity correction.
    pub(crate) fn iterate(&mut self, body1: &mut RigidBody, body2: &mut RigidBody, inv_dt: f64) {
        match &mut self.kind {
            ConstraintKind::HingeAngle(row) => row.iterate(body1, body2, inv_dt),
            ConstraintKind::PointOnPlane(row) => row.iterate(body1, body2, inv_dt),
        }
    }

    pub fn as_hinge_angle(&self) -> Option<&HingeAngle> {
        match &self.kind {
            ConstraintKind::HingeAngle(row) => Some(row),
            _ => None,
        }
    }

    pub fn as_hinge_angle_mut(&mut self) -> Option<&mut HingeAngle> {
        match &mut self.kind {
            ConstraintKind::HingeAngle(row) => Some(row),
            _ => None,
        }
    }

    pub fn as_point_on_plane(&self) -> Option<&PointOnPlane> {
        match &self.kind {
            ConstraintKind::PointOnPlane(row) => Some(row),
            _ => None,
        }
    }

    pub fn as_point_on_plane_mut(&mut self) -> Option<&mut PointOnPlane> {
        match &mut self.kind {
            ConstraintKind::PointOnPlane(row) => Some(row),
            _ => None,
        }
    }
}

impl From<HingeAngle> for ConstraintKind {
    fn from(row: HingeAngle) -> Self {
        ConstraintKind::HingeAngle(row)
    }
}

impl From<PointOnPlane> for ConstraintKind {
    fn from(row: PointOnPlane) -> Self {
        ConstraintKind::PointOnPlane(row)
    }
}
