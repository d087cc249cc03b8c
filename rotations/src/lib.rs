pub mod basis;
pub mod quaternion;

pub use basis::orthonormal_basis;
pub use quaternion::{Quaternion, QuaternionErrors, UnitQuaternion};
