//! Contact manifolds.
//!
//! The solver consumes already-built contact rows; whatever narrowphase the
//! caller runs reports its results through `World::add_contact`. A manifold
//! holds up to four points against one body pair and follows the same
//! `prepare`/`iterate` protocol as the other rows: normal impulses are
//! clamped non-negative, friction impulses to the Coulomb bound of the
//! accumulated normal impulse.

use crate::body::RigidBody;
use crate::BodyHandle;
use nalgebra::Vector3;
use rotations::orthonormal_basis;

pub const MAX_CONTACT_POINTS: usize = 4;

/// Penetration below this depth generates no position bias.
const PENETRATION_SLOP: f64 = 0.005;
const BIAS_FACTOR: f64 = 0.2;
/// Points whose anchors drift apart farther than this stop matching.
const MATCH_TOLERANCE: f64 = 0.02;

#[derive(Debug, Clone, Copy, Default)]
pub struct ContactPoint {
    /// Anchors in each body's frame.
    local_anchor1: Vector3<f64>,
    local_anchor2: Vector3<f64>,
    /// Calibration of the gap measurement, captured at insertion.
    offset: f64,
    normal_impulse: f64,
    tangent_impulse: [f64; 2],
    // rebuilt by prepare
    r1: Vector3<f64>,
    r2: Vector3<f64>,
    normal_mass: f64,
    tangent_mass: [f64; 2],
    bias: f64,
}

impl ContactPoint {
    pub fn normal_impulse(&self) -> f64 {
        self.normal_impulse
    }
}

/// Up to four contact points between one pair of bodies.
pub struct ContactManifold {
    pub(crate) body1: BodyHandle,
    pub(crate) body2: BodyHandle,
    pub(crate) stamp: u64,
    /// Contact normal in body-1's frame, pointing from body 1 to body 2.
    normal: Vector3<f64>,
    friction: f64,
    points: [ContactPoint; MAX_CONTACT_POINTS],
    num_points: usize,
    // world-frame normal and tangents cached by prepare
    normal_world: Vector3<f64>,
    tangents: [Vector3<f64>; 2],
    points_added_this_step: usize,
}

impl ContactManifold {
    pub(crate) fn new(body1: BodyHandle, body2: BodyHandle, normal_local: Vector3<f64>) -> Self {
        Self {
            body1,
            body2,
            stamp: 0,
            normal: normal_local,
            friction: 0.5,
            points: [ContactPoint::default(); MAX_CONTACT_POINTS],
            num_points: 0,
            normal_world: Vector3::zeros(),
            tangents: [Vector3::zeros(); 2],
            points_added_this_step: 0,
        }
    }

    pub fn body1(&self) -> BodyHandle {
        self.body1
    }

    pub fn body2(&self) -> BodyHandle {
        self.body2
    }

    pub fn num_points(&self) -> usize {
        self.num_points
    }

    pub fn points(&self) -> &[ContactPoint] {
        &self.points[..self.num_points]
    }

    pub fn set_friction(&mut self, friction: f64) {
        self.friction = friction.max(0.0);
    }

    /// Installs a contact point given in world space.
    ///
    /// A point matching an existing anchor refreshes it and keeps its
    /// accumulated impulses. Otherwise the point is appended; with
    /// `auxiliary` manifolds fill to four points at once, without it a
    /// manifold accepts one new point per step and a full manifold replaces
    /// the nearest existing point.
    pub(crate) fn add_point(
        &mut self,
        body1: &RigidBody,
        body2: &RigidBody,
        point1_world: &Vector3<f64>,
        point2_world: &Vector3<f64>,
        penetration: f64,
        auxiliary: bool,
    ) {
        let local_anchor1 = body1
            .orientation
            .rotate_inverse(&(point1_world - body1.position));
        let local_anchor2 = body2
            .orientation
            .rotate_inverse(&(point2_world - body2.position));
        let normal_world = body1.orientation.rotate(&self.normal);
        let offset = -penetration - (point2_world - point1_world).dot(&normal_world);

        // refresh a matching point in place, keeping its warm-start state
        for point in &mut self.points[..self.num_points] {
            if (point.local_anchor1 - local_anchor1).norm() < MATCH_TOLERANCE {
                point.local_anchor1 = local_anchor1;
                point.local_anchor2 = local_anchor2;
                point.offset = offset;
                return;
            }
        }

        let fresh = ContactPoint {
            local_anchor1,
            local_anchor2,
            offset,
            ..ContactPoint::default()
        };

        if self.num_points < MAX_CONTACT_POINTS
            && (auxiliary || self.points_added_this_step == 0)
        {
            self.points[self.num_points] = fresh;
            self.num_points += 1;
        } else {
            // replace the nearest point; its impulse history no longer
            // describes this geometry
            let nearest = (0..self.num_points)
                .min_by(|&a, &b| {
                    let da = (self.points[a].local_anchor1 - local_anchor1).norm();
                    let db = (self.points[b].local_anchor1 - local_anchor1).norm();
                    da.partial_cmp(&db).expect("anchor distances are finite")
                })
                .unwrap_or(0);
            if self.num_points == 0 {
                self.num_points = 1;
            }
            self.points[nearest] = fresh;
        }
        self.points_added_this_step += 1;
    }

    pub(crate) fn begin_step(&mut self) {
        self.points_added_this_step = 0;
    }

    pub(crate) fn prepare(
        &mut self,
        body1: &mut RigidBody,
        body2: &mut RigidBody,
        inv_dt: f64,
        warm_start: bool,
    ) {
        let normal = body1.orientation.rotate(&self.normal);
        let tangents = orthonormal_basis(&normal);
        self.normal_world = normal;
        self.tangents = tangents;

        for point in &mut self.points[..self.num_points] {
            point.r1 = body1.orientation.rotate(&point.local_anchor1);
            point.r2 = body2.orientation.rotate(&point.local_anchor2);
            let p1 = body1.position + point.r1;
            let p2 = body2.position + point.r2;
            let separation = (p2 - p1).dot(&normal) + point.offset;

            point.bias = BIAS_FACTOR * inv_dt * (separation + PENETRATION_SLOP).min(0.0);

            point.normal_mass = 1.0
                / (body1.inverse_mass
                    + body2.inverse_mass
                    + effective_angular_term(body1, point.r1, &normal)
                    + effective_angular_term(body2, point.r2, &normal));
            for (i, tangent) in tangents.iter().enumerate() {
                point.tangent_mass[i] = 1.0
                    / (body1.inverse_mass
                        + body2.inverse_mass
                        + effective_angular_term(body1, point.r1, tangent)
                        + effective_angular_term(body2, point.r2, tangent));
            }

            if warm_start {
                let impulse = normal * point.normal_impulse
                    + tangents[0] * point.tangent_impulse[0]
                    + tangents[1] * point.tangent_impulse[1];
                apply_contact_impulse(body1, body2, point, &impulse);
            }
        }
    }

    pub(crate) fn iterate(&mut self, body1: &mut RigidBody, body2: &mut RigidBody, _inv_dt: f64) {
        let normal = self.normal_world;
        for point in &mut self.points[..self.num_points] {
            // normal row
            let dv = relative_velocity(body1, body2, point);
            let vn = dv.dot(&normal);
            let lambda = -point.normal_mass * (vn + point.bias);
            let old = point.normal_impulse;
            point.normal_impulse = (old + lambda).max(0.0);
            let impulse = normal * (point.normal_impulse - old);
            apply_contact_impulse(body1, body2, point, &impulse);

            // friction rows against the Coulomb bound
            let max_friction = self.friction * point.normal_impulse;
            for (i, tangent) in self.tangents.iter().enumerate() {
                let dv = relative_velocity(body1, body2, point);
                let vt = dv.dot(tangent);
                let lambda = -point.tangent_mass[i] * vt;
                let old = point.tangent_impulse[i];
                point.tangent_impulse[i] = (old + lambda).clamp(-max_friction, max_friction);
                let impulse = tangent * (point.tangent_impulse[i] - old);
                apply_contact_impulse(body1, body2, point, &impulse);
            }
        }
    }
}

fn relative_velocity(
    body1: &RigidBody,
    body2: &RigidBody,
    point: &ContactPoint,
) -> Vector3<f64> {
    body2.velocity + body2.angular_velocity.cross(&point.r2)
        - body1.velocity
        - body1.angular_velocity.cross(&point.r1)
}

fn effective_angular_term(body: &RigidBody, r: Vector3<f64>, direction: &Vector3<f64>) -> f64 {
    let rn = r.cross(direction);
    (body.inverse_inertia_world * rn).dot(&rn)
}

fn apply_contact_impulse(
    body1: &mut RigidBody,
    body2: &mut RigidBody,
    point: &ContactPoint,
    impulse: &Vector3<f64>,
) {
    body1.apply_linear_impulse(&-impulse);
    body1.apply_angular_impulse(&-point.r1.cross(impulse));
    body2.apply_linear_impulse(impulse);
    body2.apply_angular_impulse(&point.r2.cross(impulse));
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena::Handle;

    fn ground_and_ball(height: f64) -> (RigidBody, RigidBody) {
        let mut ground = RigidBody::default();
        ground.make_static();
        let mut ball = RigidBody::default();
        ball.set_position(Vector3::new(0.0, height, 0.0));
        (ground, ball)
    }

    fn manifold() -> ContactManifold {
        ContactManifold::new(Handle::INVALID, Handle::INVALID, Vector3::new(0.0, 1.0, 0.0))
    }

    #[test]
    fn test_penetrating_contact_pushes_apart() {
        let (mut ground, mut ball) = ground_and_ball(0.45);
        let mut row = manifold();
        // ball of radius 0.5 overlapping the ground by 0.05
        row.add_point(
            &ground,
            &ball,
            &Vector3::new(0.0, 0.0, 0.0),
            &Vector3::new(0.0, -0.05, 0.0),
            0.05,
            true,
        );
        ball.set_velocity(Vector3::new(0.0, -1.0, 0.0));

        row.prepare(&mut ground, &mut ball, 60.0, true);
        for _ in 0..8 {
            row.iterate(&mut ground, &mut ball, 60.0);
        }

        assert!(ball.velocity()[1] > -1e-9);
        assert!(row.points()[0].normal_impulse() > 0.0);
        assert_eq!(ground.velocity(), Vector3::zeros());
    }

    #[test]
    fn test_friction_slows_sliding() {
        let (mut ground, mut ball) = ground_and_ball(0.5);
        let mut row = manifold();
        row.set_friction(1.0);
        row.add_point(
            &ground,
            &ball,
            &Vector3::zeros(),
            &Vector3::new(0.0, 0.0, 0.0),
            0.0,
            true,
        );
        ball.set_velocity(Vector3::new(1.0, -0.5, 0.0));

        row.prepare(&mut ground, &mut ball, 60.0, true);
        for _ in 0..16 {
            row.iterate(&mut ground, &mut ball, 60.0);
        }

        // sliding is slowed, never reversed
        assert!(ball.velocity()[0] >= -1e-9);
        assert!(ball.velocity()[0] < 1.0);
    }

    #[test]
    fn test_manifold_point_matching() {
        let (ground, ball) = ground_and_ball(0.5);
        let mut row = manifold();
        row.add_point(&ground, &ball, &Vector3::zeros(), &Vector3::zeros(), 0.0, true);
        assert_eq!(row.num_points(), 1);

        // the same anchor refreshes instead of appending
        row.add_point(&ground, &ball, &Vector3::zeros(), &Vector3::zeros(), 0.01, true);
        assert_eq!(row.num_points(), 1);

        for i in 0..4 {
            row.add_point(
                &ground,
                &ball,
                &Vector3::new(0.3 + 0.3 * i as f64, 0.0, 0.0),
                &Vector3::new(0.3 + 0.3 * i as f64, 0.0, 0.0),
                0.0,
                true,
            );
        }
        // capped at four points
        assert_eq!(row.num_points(), MAX_CONTACT_POINTS);
    }

    #[test]
    fn test_incremental_manifold_accepts_one_point_per_step() {
        let (ground, ball) = ground_and_ball(0.5);
        let mut row = manifold();
        row.begin_step();
        for i in 0..3 {
            row.add_point(
                &ground,
                &ball,
                &Vector3::new(i as f64, 0.0, 0.0),
                &Vector3::new(i as f64, 0.0, 0.0),
                0.0,
                false,
            );
        }
        assert_eq!(row.num_points(), 1);

        row.begin_step();
        row.add_point(
            &ground,
            &ball,
            &Vector3::new(5.0, 0.0, 0.0),
            &Vector3::new(5.0, 0.0, 0.0),
            0.0,
            false,
        );
        assert_eq!(row.num_points(), 2);
    }
}
