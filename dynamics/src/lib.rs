//! Impulse-based rigid-body dynamics with a semi-implicit Euler integrator.
//!
//! A [`World`] owns rigid bodies and constraint rows in fixed-capacity
//! arenas and advances them with [`World::step`]: an iterated velocity-level
//! Gauss-Seidel solve with warm starting, substeps, relaxation passes, and
//! an optional worker-pool parallelisation of the solver passes.

pub mod body;
pub mod config;
pub mod constraints;
pub mod contact;
pub mod errors;
mod solver;
pub mod world;

use arena::Handle;

pub type BodyHandle = Handle<body::RigidBody>;
pub type ConstraintHandle = Handle<constraints::Constraint>;
pub type SmallConstraintHandle = Handle<constraints::SmallConstraint>;
pub type ContactHandle = Handle<contact::ContactManifold>;

pub use body::RigidBody;
pub use config::{StepConfig, ThreadModel, WorldCapacity};
pub use constraints::{Constraint, DistanceLimit, HingeAngle, LimitState, PointOnPlane};
pub use contact::ContactManifold;
pub use errors::WorldErrors;
pub use world::World;
