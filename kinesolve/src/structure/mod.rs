pub type JointIndex = usize;

pub mod constraint;
pub mod joint;

pub use constraint::{Constraint, ConstraintKind};
pub use joint::{Joint, JointSet};
