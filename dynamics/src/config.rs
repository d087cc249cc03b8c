use crate::errors::WorldErrors;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
pub use worker_pool::ThreadModel;

/// Capacities of the world's arenas, fixed at construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorldCapacity {
    /// Capacity of the body arena.
    pub body_count: usize,
    /// Capacity of the contact arena; each record holds up to four points.
    pub contact_count: usize,
    /// Capacity of the constraint arena.
    pub constraint_count: usize,
    /// Capacity of the small-constraint arena.
    pub small_constraint_count: usize,
}

impl Default for WorldCapacity {
    fn default() -> Self {
        Self {
            body_count: 256,
            contact_count: 1024,
            constraint_count: 256,
            small_constraint_count: 256,
        }
    }
}

impl WorldCapacity {
    pub fn with_body_count(mut self, body_count: usize) -> Self {
        self.body_count = body_count;
        self
    }

    pub fn with_contact_count(mut self, contact_count: usize) -> Self {
        self.contact_count = contact_count;
        self
    }

    pub fn with_constraint_count(mut self, constraint_count: usize) -> Self {
        self.constraint_count = constraint_count;
        self
    }

    pub fn with_small_constraint_count(mut self, small_constraint_count: usize) -> Self {
        self.small_constraint_count = small_constraint_count;
        self
    }
}

/// Tuning of one call to `World::step`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StepConfig {
    /// Velocity-solver passes per substep.
    pub solver_iterations: usize,
    /// Relaxation passes per substep, run after position integration.
    pub relax_iterations: usize,
    /// A step of `dt` is performed as this many substeps of `dt / n`.
    pub substep_count: usize,
    /// When true a caller may install a full manifold per pair in one
    /// frame; when false manifolds build incrementally.
    pub enable_auxiliary_contacts: bool,
    /// Whether pool workers spin on the gate between steps or park.
    #[serde(skip)]
    pub thread_model: ThreadModel,
    pub gravity: Vector3<f64>,
    /// A body sleeps once `|v| + |w|` stays below this for `sleep_time`.
    pub sleep_threshold: f64,
    pub sleep_time: f64,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            solver_iterations: 8,
            relax_iterations: 4,
            substep_count: 1,
            enable_auxiliary_contacts: true,
            thread_model: ThreadModel::Regular,
            gravity: Vector3::new(0.0, -9.81, 0.0),
            sleep_threshold: 0.03,
            sleep_time: 0.5,
        }
    }
}

impl StepConfig {
    /// Sets the solver and relaxation pass counts.
    pub fn with_solver_iterations(mut self, solver: usize, relax: usize) -> Self {
        self.solver_iterations = solver;
        self.relax_iterations = relax;
        self
    }

    pub fn with_substep_count(mut self, substep_count: usize) -> Self {
        self.substep_count = substep_count;
        self
    }

    pub fn with_auxiliary_contacts(mut self, enabled: bool) -> Self {
        self.enable_auxiliary_contacts = enabled;
        self
    }

    pub fn with_thread_model(mut self, thread_model: ThreadModel) -> Self {
        self.thread_model = thread_model;
        self
    }

    pub fn with_gravity(mut self, gravity: Vector3<f64>) -> Self {
        self.gravity = gravity;
        self
    }

    pub fn with_sleep(mut self, threshold: f64, time: f64) -> Self {
        self.sleep_threshold = threshold;
        self.sleep_time = time;
        self
    }

    /// Disables deactivation entirely.
    pub fn without_sleep(mut self) -> Self {
        self.sleep_threshold = 0.0;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), WorldErrors> {
        if self.substep_count < 1 {
            return Err(WorldErrors::InvalidArgument("substep_count must be >= 1"));
        }
        if !(self.gravity[0].is_finite() && self.gravity[1].is_finite() && self.gravity[2].is_finite()) {
            return Err(WorldErrors::InvalidArgument("gravity must be finite"));
        }
        if !self.sleep_threshold.is_finite() || self.sleep_threshold < 0.0 {
            return Err(WorldErrors::InvalidArgument("sleep_threshold must be finite and >= 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let config = StepConfig::default()
            .with_solver_iterations(2, 1)
            .with_substep_count(4)
            .with_gravity(Vector3::zeros())
            .without_sleep();
        assert_eq!(config.solver_iterations, 2);
        assert_eq!(config.relax_iterations, 1);
        assert_eq!(config.substep_count, 4);
        assert_eq!(config.sleep_threshold, 0.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_substeps() {
        let config = StepConfig::default().with_substep_count(0);
        assert!(config.validate().is_err());
    }
}
