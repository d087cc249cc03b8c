use crate::errors::WorldErrors;
use nalgebra::{Matrix3, Vector3};
use rotations::UnitQuaternion;
use serde::{Deserialize, Serialize};

/// A rigid body record.
///
/// Bodies start inert: unit mass, unit inertia, identity orientation, zero
/// velocities. A body with `inverse_mass == 0` is static or kinematic and
/// never receives a velocity change from the solver or the integrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigidBody {
    pub(crate) position: Vector3<f64>,
    pub(crate) orientation: UnitQuaternion,
    pub(crate) velocity: Vector3<f64>,
    pub(crate) angular_velocity: Vector3<f64>,
    pub(crate) inverse_mass: f64,
    pub(crate) inverse_inertia_local: Matrix3<f64>,
    pub(crate) inverse_inertia_world: Matrix3<f64>,
    pub(crate) accumulated_force: Vector3<f64>,
    pub(crate) accumulated_torque: Vector3<f64>,
    pub(crate) sleep_time: f64,
    pub(crate) active: bool,
    pub(crate) island_id: u32,
}

impl Default for RigidBody {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            orientation: UnitQuaternion::IDENTITY,
            velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            inverse_mass: 1.0,
            inverse_inertia_local: Matrix3::identity(),
            inverse_inertia_world: Matrix3::identity(),
            accumulated_force: Vector3::zeros(),
            accumulated_torque: Vector3::zeros(),
            sleep_time: 0.0,
            active: true,
            island_id: 0,
        }
    }
}

impl RigidBody {
    pub fn position(&self) -> Vector3<f64> {
        self.position
    }

    pub fn orientation(&self) -> UnitQuaternion {
        self.orientation
    }

    pub fn velocity(&self) -> Vector3<f64> {
        self.velocity
    }

    pub fn angular_velocity(&self) -> Vector3<f64> {
        self.angular_velocity
    }

    pub fn inverse_mass(&self) -> f64 {
        self.inverse_mass
    }

    pub fn is_static(&self) -> bool {
        self.inverse_mass == 0.0
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn island_id(&self) -> u32 {
        self.island_id
    }

    pub fn set_position(&mut self, position: Vector3<f64>) {
        self.position = position;
    }

    pub fn set_orientation(&mut self, orientation: UnitQuaternion) {
        self.orientation = orientation;
        self.recompute_world_inertia();
    }

    pub fn set_velocity(&mut self, velocity: Vector3<f64>) {
        self.velocity = velocity;
    }

    pub fn set_angular_velocity(&mut self, angular_velocity: Vector3<f64>) {
        self.angular_velocity = angular_velocity;
    }

    /// Sets mass and the local-frame inertia tensor.
    ///
    /// # Returns
    ///
    /// `Ok(())`, or `InvalidArgument` for a non-finite or non-positive mass
    /// or a non-invertible inertia tensor.
    pub fn set_mass_properties(
        &mut self,
        mass: f64,
        inertia: Matrix3<f64>,
    ) -> Result<(), WorldErrors> {
        if !mass.is_finite() || mass <= 0.0 {
            return Err(WorldErrors::InvalidArgument("mass must be finite and > 0"));
        }
        if inertia.iter().any(|e| !e.is_finite()) {
            return Err(WorldErrors::InvalidArgument("inertia must be finite"));
        }
        let inverse = inertia
            .try_inverse()
            .ok_or(WorldErrors::InvalidArgument("inertia must be invertible"))?;
        self.inverse_mass = 1.0 / mass;
        self.inverse_inertia_local = inverse;
        self.recompute_world_inertia();
        Ok(())
    }

    /// Makes the body static: infinite mass and inertia, velocities zeroed.
    pub fn make_static(&mut self) {
        self.inverse_mass = 0.0;
        self.inverse_inertia_local = Matrix3::zeros();
        self.inverse_inertia_world = Matrix3::zeros();
        self.velocity = Vector3::zeros();
        self.angular_velocity = Vector3::zeros();
    }

    /// Accumulates a force through the center of mass for the next step.
    pub fn apply_force(&mut self, force: Vector3<f64>) {
        self.accumulated_force += force;
    }

    pub fn apply_torque(&mut self, torque: Vector3<f64>) {
        self.accumulated_torque += torque;
    }

    /// Accumulates a force acting at a world-space point.
    pub fn apply_force_at(&mut self, force: Vector3<f64>, point: Vector3<f64>) {
        self.accumulated_force += force;
        self.accumulated_torque += (point - self.position).cross(&force);
    }

    /// Changes the velocity immediately by an impulse through the center of
    /// mass.
    pub fn apply_impulse(&mut self, impulse: Vector3<f64>) {
        self.apply_linear_impulse(&impulse);
    }

    /// Changes the velocities immediately by an impulse acting at a
    /// world-space point.
    pub fn apply_impulse_at(&mut self, impulse: Vector3<f64>, point: Vector3<f64>) {
        self.apply_linear_impulse(&impulse);
        self.apply_angular_impulse(&(point - self.position).cross(&impulse));
    }

    /// Semi-implicit Euler velocity update from the accumulated force and
    /// torque plus gravity. Clears the accumulators.
    pub(crate) fn integrate_velocity(&mut self, dt: f64, gravity: &Vector3<f64>) {
        if self.inverse_mass == 0.0 {
            self.accumulated_force = Vector3::zeros();
            self.accumulated_torque = Vector3::zeros();
            return;
        }
        self.velocity += dt * self.inverse_mass * self.accumulated_force + dt * gravity;
        self.angular_velocity += dt * (self.inverse_inertia_world * self.accumulated_torque);
        self.accumulated_force = Vector3::zeros();
        self.accumulated_torque = Vector3::zeros();
    }

    /// Advances position and orientation from the current velocities, then
    /// refreshes the world-frame inertia consumed by the next prepare pass.
    pub(crate) fn integrate_position(&mut self, dt: f64) {
        if self.inverse_mass == 0.0 {
            return;
        }
        self.position += dt * self.velocity;
        self.orientation = self.orientation.integrate(&self.angular_velocity, dt);
        self.recompute_world_inertia();
    }

    pub(crate) fn recompute_world_inertia(&mut self) {
        let r = self.orientation.to_rotation_matrix();
        self.inverse_inertia_world = r * self.inverse_inertia_local * r.transpose();
    }

    /// No-ops on a static body: besides the physics, a shared static body
    /// must never be written while solver tasks run in parallel.
    pub(crate) fn apply_angular_impulse(&mut self, impulse: &Vector3<f64>) {
        if self.inverse_mass == 0.0 {
            return;
        }
        self.angular_velocity += self.inverse_inertia_world * impulse;
    }

    pub(crate) fn apply_linear_impulse(&mut self, impulse: &Vector3<f64>) {
        if self.inverse_mass == 0.0 {
            return;
        }
        self.velocity += self.inverse_mass * impulse;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const TOL: f64 = 1e-12;

    #[test]
    fn test_static_body_never_moves() {
        let mut body = RigidBody::default();
        body.make_static();
        body.apply_force(Vector3::new(100.0, 0.0, 0.0));
        body.integrate_velocity(1.0 / 60.0, &Vector3::new(0.0, -9.81, 0.0));
        body.integrate_position(1.0 / 60.0);
        assert_eq!(body.velocity(), Vector3::zeros());
        assert_eq!(body.angular_velocity(), Vector3::zeros());
        assert_eq!(body.position(), Vector3::zeros());
    }

    #[test]
    fn test_gravity_integration() {
        let mut body = RigidBody::default();
        body.integrate_velocity(0.5, &Vector3::new(0.0, -10.0, 0.0));
        assert_abs_diff_eq!(body.velocity()[1], -5.0, epsilon = TOL);
    }

    #[test]
    fn test_force_accumulator_cleared() {
        let mut body = RigidBody::default();
        body.apply_force(Vector3::new(6.0, 0.0, 0.0));
        body.integrate_velocity(1.0, &Vector3::zeros());
        assert_abs_diff_eq!(body.velocity()[0], 6.0, epsilon = TOL);
        body.integrate_velocity(1.0, &Vector3::zeros());
        assert_abs_diff_eq!(body.velocity()[0], 6.0, epsilon = TOL);
    }

    #[test]
    fn test_world_inertia_follows_orientation() {
        let mut body = RigidBody::default();
        body.set_mass_properties(2.0, Matrix3::from_diagonal(&Vector3::new(1.0, 2.0, 3.0)))
            .unwrap();
        let q = rotations::UnitQuaternion::from_axis_angle(
            &Vector3::new(0.0, 0.0, 1.0),
            std::f64::consts::FRAC_PI_2,
        )
        .unwrap();
        body.set_orientation(q);

        // a quarter turn about z swaps the x and y principal axes
        let world = body.inverse_inertia_world;
        assert_abs_diff_eq!(world[(0, 0)], 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(world[(1, 1)], 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(world[(2, 2)], 1.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_orientation_stays_normalized() {
        let mut body = RigidBody::default();
        body.set_angular_velocity(Vector3::new(5.0, -3.0, 2.0));
        for _ in 0..600 {
            body.integrate_position(1.0 / 60.0);
        }
        assert_abs_diff_eq!(body.orientation().0.norm(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_apply_force_at_produces_torque() {
        let mut body = RigidBody::default();
        body.apply_force_at(Vector3::new(0.0, 1.0, 0.0), Vector3::new(1.0, 0.0, 0.0));
        body.integrate_velocity(1.0, &Vector3::zeros());
        // r x f = (1,0,0) x (0,1,0) = (0,0,1)
        assert_abs_diff_eq!(body.angular_velocity()[2], 1.0, epsilon = TOL);
    }

    #[test]
    fn test_apply_impulse_at() {
        let mut body = RigidBody::default();
        body.set_mass_properties(2.0, Matrix3::identity()).unwrap();
        body.apply_impulse_at(Vector3::new(0.0, 2.0, 0.0), Vector3::new(1.0, 0.0, 0.0));
        assert_abs_diff_eq!(body.velocity()[1], 1.0, epsilon = TOL);
        assert_abs_diff_eq!(body.angular_velocity()[2], 2.0, epsilon = TOL);
    }

    #[test]
    fn test_rejects_bad_mass() {
        let mut body = RigidBody::default();
        assert!(body.set_mass_properties(0.0, Matrix3::identity()).is_err());
        assert!(body.set_mass_properties(f64::NAN, Matrix3::identity()).is_err());
        assert!(body
            .set_mass_properties(1.0, Matrix3::zeros())
            .is_err());
    }
}
