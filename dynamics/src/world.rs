use crate::body::RigidBody;
use crate::config::{StepConfig, WorldCapacity};
use crate::constraints::{
    Constraint, ConstraintKind, DistanceLimit, HingeAngle, PointOnPlane, SmallConstraint,
    SmallConstraintKind,
};
use crate::contact::ContactManifold;
use crate::errors::WorldErrors;
use crate::solver;
use crate::{BodyHandle, ConstraintHandle, ContactHandle, SmallConstraintHandle};
use arena::Arena;
use nalgebra::Vector3;
use std::collections::HashMap;

/// A world of rigid bodies and the constraint rows between them.
///
/// The world owns every record through fixed-capacity arenas; callers hold
/// handles. All mutation of solver state happens inside [`step`](Self::step),
/// everything else goes through the accessors here.
pub struct World {
    pub(crate) bodies: Arena<RigidBody>,
    pub(crate) contacts: Arena<ContactManifold>,
    pub(crate) constraints: Arena<Constraint>,
    pub(crate) small_constraints: Arena<SmallConstraint>,
    pub(crate) contact_map: HashMap<(BodyHandle, BodyHandle), ContactHandle>,
    pub(crate) step_config: StepConfig,
    pub(crate) step_stamp: u64,
}

impl World {
    pub fn new(capacity: WorldCapacity) -> Self {
        Self {
            bodies: Arena::new(capacity.body_count),
            contacts: Arena::new(capacity.contact_count),
            constraints: Arena::new(capacity.constraint_count),
            small_constraints: Arena::new(capacity.small_constraint_count),
            contact_map: HashMap::new(),
            step_config: StepConfig::default(),
            step_stamp: 0,
        }
    }

    pub fn step_config(&self) -> &StepConfig {
        &self.step_config
    }

    pub fn set_step_config(&mut self, config: StepConfig) -> Result<(), WorldErrors> {
        config.validate()?;
        self.step_config = config;
        Ok(())
    }

    /// Creates an inert body: unit mass, identity orientation, zero
    /// velocities.
    pub fn create_body(&mut self) -> Result<BodyHandle, WorldErrors> {
        Ok(self.bodies.insert(RigidBody::default())?)
    }

    pub fn body(&self, handle: BodyHandle) -> Result<&RigidBody, WorldErrors> {
        Ok(self.bodies.get(handle)?)
    }

    pub fn body_mut(&mut self, handle: BodyHandle) -> Result<&mut RigidBody, WorldErrors> {
        Ok(self.bodies.get_mut(handle)?)
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    pub fn active_body_count(&self) -> usize {
        self.bodies.active_len()
    }

    /// Wakes a sleeping body.
    pub fn activate_body(&mut self, handle: BodyHandle) -> Result<(), WorldErrors> {
        self.bodies.set_active(handle, true)?;
        let body = self.bodies.get_mut(handle)?;
        body.active = true;
        body.sleep_time = 0.0;
        Ok(())
    }

    /// Removes a body. Every constraint row and contact manifold attached
    /// to it is detached and freed as well.
    pub fn remove_body(&mut self, handle: BodyHandle) -> Result<(), WorldErrors> {
        self.bodies.get(handle)?;

        let dead: Vec<ConstraintHandle> = (0..self.constraints.len())
            .filter(|&i| {
                let row = &self.constraints.iter_live()[i];
                row.body1 == handle || row.body2 == handle
            })
            .map(|i| self.constraints.handle_at(i))
            .collect();
        for h in dead {
            self.constraints.free(h)?;
        }

        let dead: Vec<SmallConstraintHandle> = (0..self.small_constraints.len())
            .filter(|&i| {
                let row = &self.small_constraints.iter_live()[i];
                row.body1 == handle || row.body2 == handle
            })
            .map(|i| self.small_constraints.handle_at(i))
            .collect();
        for h in dead {
            self.small_constraints.free(h)?;
        }

        let dead: Vec<ContactHandle> = (0..self.contacts.len())
            .filter(|&i| {
                let row = &self.contacts.iter_live()[i];
                row.body1 == handle || row.body2 == handle
            })
            .map(|i| self.contacts.handle_at(i))
            .collect();
        for h in dead {
            let manifold = self.contacts.free(h)?;
            self.contact_map.remove(&(manifold.body1, manifold.body2));
        }

        self.bodies.free(handle)?;
        Ok(())
    }

    fn check_pair(&self, body1: BodyHandle, body2: BodyHandle) -> Result<(), WorldErrors> {
        if body1 == body2 {
            return Err(WorldErrors::SameBody);
        }
        self.bodies.get(body1)?;
        self.bodies.get(body2)?;
        Ok(())
    }

    fn wake_pair(&mut self, body1: BodyHandle, body2: BodyHandle) {
        for handle in [body1, body2] {
            let _ = self.activate_body(handle);
        }
    }

    /// Attaches a hinge-angle row between two bodies, hinging about the
    /// world-space `axis`. The current relative orientation becomes the
    /// reference.
    pub fn add_hinge_angle(
        &mut self,
        body1: BodyHandle,
        body2: BodyHandle,
        axis: &Vector3<f64>,
    ) -> Result<ConstraintHandle, WorldErrors> {
        self.check_pair(body1, body2)?;
        let row = {
            let b1 = self.bodies.get(body1)?;
            let b2 = self.bodies.get(body2)?;
            HingeAngle::initialize(b1, b2, axis)?
        };
        let handle = self
            .constraints
            .insert(Constraint::new(body1, body2, ConstraintKind::HingeAngle(row)))?;
        self.wake_pair(body1, body2);
        Ok(handle)
    }

    /// Attaches a point-on-plane row: the plane is carried by `body1`, the
    /// anchored point by `body2`.
    pub fn add_point_on_plane(
        &mut self,
        body1: BodyHandle,
        body2: BodyHandle,
        axis: &Vector3<f64>,
        anchor1: &Vector3<f64>,
        anchor2: &Vector3<f64>,
    ) -> Result<ConstraintHandle, WorldErrors> {
        self.check_pair(body1, body2)?;
        let row = {
            let b1 = self.bodies.get(body1)?;
            let b2 = self.bodies.get(body2)?;
            PointOnPlane::initialize(b1, b2, axis, anchor1, anchor2)?
        };
        let handle = self.constraints.insert(Constraint::new(
            body1,
            body2,
            ConstraintKind::PointOnPlane(row),
        ))?;
        self.wake_pair(body1, body2);
        Ok(handle)
    }

    /// Attaches a small-arena distance-limit row between two anchors.
    pub fn add_distance_limit(
        &mut self,
        body1: BodyHandle,
        body2: BodyHandle,
        anchor1: &Vector3<f64>,
        anchor2: &Vector3<f64>,
        min_dist: f64,
        max_dist: f64,
    ) -> Result<SmallConstraintHandle, WorldErrors> {
        self.check_pair(body1, body2)?;
        let row = {
            let b1 = self.bodies.get(body1)?;
            let b2 = self.bodies.get(body2)?;
            DistanceLimit::initialize(b1, b2, anchor1, anchor2, min_dist, max_dist)?
        };
        let handle = self.small_constraints.insert(SmallConstraint::new(
            body1,
            body2,
            SmallConstraintKind::DistanceLimit(row),
        ))?;
        self.wake_pair(body1, body2);
        Ok(handle)
    }

    pub fn constraint(&self, handle: ConstraintHandle) -> Result<&Constraint, WorldErrors> {
        Ok(self.constraints.get(handle)?)
    }

    pub fn hinge_angle(&self, handle: ConstraintHandle) -> Result<&HingeAngle, WorldErrors> {
        self.constraints
            .get(handle)?
            .as_hinge_angle()
            .ok_or(WorldErrors::WrongConstraintKind)
    }

    pub fn hinge_angle_mut(
        &mut self,
        handle: ConstraintHandle,
    ) -> Result<&mut HingeAngle, WorldErrors> {
        self.constraints
            .get_mut(handle)?
            .as_hinge_angle_mut()
            .ok_or(WorldErrors::WrongConstraintKind)
    }

    pub fn point_on_plane(&self, handle: ConstraintHandle) -> Result<&PointOnPlane, WorldErrors> {
        self.constraints
            .get(handle)?
            .as_point_on_plane()
            .ok_or(WorldErrors::WrongConstraintKind)
    }

    pub fn point_on_plane_mut(
        &mut self,
        handle: ConstraintHandle,
    ) -> Result<&mut PointOnPlane, WorldErrors> {
        self.constraints
            .get_mut(handle)?
            .as_point_on_plane_mut()
            .ok_or(WorldErrors::WrongConstraintKind)
    }

    pub fn distance_limit(
        &self,
        handle: SmallConstraintHandle,
    ) -> Result<&DistanceLimit, WorldErrors> {
        self.small_constraints
            .get(handle)?
            .as_distance_limit()
            .ok_or(WorldErrors::WrongConstraintKind)
    }

    pub fn distance_limit_mut(
        &mut self,
        handle: SmallConstraintHandle,
    ) -> Result<&mut DistanceLimit, WorldErrors> {
        self.small_constraints
            .get_mut(handle)?
            .as_distance_limit_mut()
            .ok_or(WorldErrors::WrongConstraintKind)
    }

    pub fn remove_constraint(&mut self, handle: ConstraintHandle) -> Result<(), WorldErrors> {
        self.constraints.free(handle)?;
        Ok(())
    }

    pub fn remove_small_constraint(
        &mut self,
        handle: SmallConstraintHandle,
    ) -> Result<(), WorldErrors> {
        self.small_constraints.free(handle)?;
        Ok(())
    }

    pub fn constraint_count(&self) -> usize {
        self.constraints.len()
    }

    pub fn small_constraint_count(&self) -> usize {
        self.small_constraints.len()
    }

    /// Reports a contact point between two bodies, in world space with
    /// `normal` pointing from `body1` toward `body2` and `penetration >= 0`
    /// for overlap.
    ///
    /// Points accumulate into a manifold per body pair, up to four points.
    /// With `enable_auxiliary_contacts` a full manifold may be installed in
    /// one frame; otherwise manifolds grow by one point per step.
    pub fn add_contact(
        &mut self,
        body1: BodyHandle,
        body2: BodyHandle,
        normal: &Vector3<f64>,
        point1: &Vector3<f64>,
        point2: &Vector3<f64>,
        penetration: f64,
    ) -> Result<ContactHandle, WorldErrors> {
        self.check_pair(body1, body2)?;
        for v in [normal, point1, point2] {
            if v.iter().any(|e| !e.is_finite()) {
                return Err(WorldErrors::InvalidArgument("contact data must be finite"));
            }
        }
        if !penetration.is_finite() {
            return Err(WorldErrors::InvalidArgument("penetration must be finite"));
        }
        let norm = normal.norm();
        if norm < f64::EPSILON {
            return Err(WorldErrors::InvalidArgument("contact normal must be non-zero"));
        }

        let existing = self.contact_map.get(&(body1, body2)).copied();
        let handle = match existing {
            Some(handle) if self.contacts.contains(handle) => handle,
            _ => {
                let normal_local = self
                    .bodies
                    .get(body1)?
                    .orientation
                    .rotate_inverse(&(normal / norm));
                let handle = self
                    .contacts
                    .insert(ContactManifold::new(body1, body2, normal_local))?;
                self.contact_map.insert((body1, body2), handle);
                handle
            }
        };

        let auxiliary = self.step_config.enable_auxiliary_contacts;
        {
            let b1 = self.bodies.get(body1)?;
            let b2 = self.bodies.get(body2)?;
            let manifold = self.contacts.get_mut(handle).expect("just resolved");
            manifold.add_point(b1, b2, point1, point2, penetration, auxiliary);
        }
        self.wake_pair(body1, body2);
        Ok(handle)
    }

    pub fn contact(&self, handle: ContactHandle) -> Result<&ContactManifold, WorldErrors> {
        Ok(self.contacts.get(handle)?)
    }

    pub fn contact_mut(
        &mut self,
        handle: ContactHandle,
    ) -> Result<&mut ContactManifold, WorldErrors> {
        Ok(self.contacts.get_mut(handle)?)
    }

    pub fn remove_contact(&mut self, handle: ContactHandle) -> Result<(), WorldErrors> {
        let manifold = self.contacts.free(handle)?;
        self.contact_map.remove(&(manifold.body1, manifold.body2));
        Ok(())
    }

    /// Drops every contact manifold, e.g. before a narrowphase rebuilds
    /// them from scratch.
    pub fn clear_contacts(&mut self) {
        while self.contacts.len() > 0 {
            let handle = self.contacts.handle_at(0);
            let _ = self.contacts.free(handle);
        }
        self.contact_map.clear();
    }

    pub fn contact_count(&self) -> usize {
        self.contacts.len()
    }

    /// Advances the world by `dt` seconds: velocity integration, constraint
    /// preparation, the iterated velocity solve, position integration, the
    /// relaxation passes, and the sleep update. With `multi_thread` the
    /// solver passes run on the worker pool.
    pub fn step(&mut self, dt: f64, multi_thread: bool) -> Result<(), WorldErrors> {
        solver::step(self, dt, multi_thread)
    }
}
