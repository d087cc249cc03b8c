use arena::ArenaErrors;
use rotations::QuaternionErrors;
use thiserror::Error;

/// Errors that can occur when building or stepping a `World`.
#[derive(Debug, Clone, Copy, Error)]
pub enum WorldErrors {
    #[error("{0}")]
    ArenaErrors(#[from] ArenaErrors),
    #[error("{0}")]
    QuaternionErrors(#[from] QuaternionErrors),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("constraint handle refers to a different constraint kind")]
    WrongConstraintKind,
    #[error("a constraint requires two distinct bodies")]
    SameBody,
}
