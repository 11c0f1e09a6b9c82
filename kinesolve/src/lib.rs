#![allow(unknown_lints)]

mod error;
pub mod solver;
pub mod structure;
mod utils;

pub use error::{DomainType, KinesolveError};
pub use solver::{
    ccd::CcdSolver, chain::ChainSolver, tree::TreeSolver, IterationEvent, Solve, SolverParams,
    SolverState, Target,
};
pub use structure::{
    constraint::{
        BallSocket, Constraint, ConstraintKind, ConstraintStates, DistanceField, Hinge,
        OrientationField, PlanarPolygon,
    },
    joint::{GlobalPose, Joint, JointSet},
    JointIndex,
};
