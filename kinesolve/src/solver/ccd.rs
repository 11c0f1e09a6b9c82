use cgmath::InnerSpace;

use crate::error::KinesolveError;
use crate::structure::{JointIndex, JointSet};
use crate::utils::{rotation_angle, rotation_between};

use super::{Solve, SolverState, Target};

/// Cyclic coordinate descent over a single linear chain.
///
/// Each iteration sweeps root-ward from the joint just above the end
/// effector, rotating one joint at a time toward the target. Rotations are
/// applied immediately, so joints later in the sweep observe the effect of
/// earlier ones; the sweep order is part of the contract.
pub struct CcdSolver {
    state: SolverState,
    chain: Vec<JointIndex>,
    target: Option<Target>,
    previous: Option<Target>,
}

impl CcdSolver {
    pub fn new(joints: &JointSet, chain: Vec<JointIndex>) -> Result<Self, KinesolveError> {
        joints.validate_chain(&chain)?;
        if chain.len() < 2 {
            return Err(KinesolveError::chain_too_short(chain.len()));
        }
        Ok(Self {
            state: SolverState::default(),
            chain,
            target: None,
            previous: None,
        })
    }

    pub fn set_target(&mut self, target: Target) {
        self.target = Some(target);
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub fn end_effector(&self) -> JointIndex {
        *self.chain.last().unwrap()
    }

    fn effector_distance(&self, joints: &JointSet, target: &Target) -> f32 {
        (joints.position(self.end_effector()) - target.position).magnitude()
    }
}

impl Solve for CcdSolver {
    fn state(&self) -> &SolverState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut SolverState {
        &mut self.state
    }

    fn solved_joints(&self) -> &[JointIndex] {
        &self.chain
    }

    fn changed(&self, _joints: &JointSet) -> bool {
        self.target != self.previous
    }

    fn reset(&mut self, joints: &mut JointSet) {
        self.previous = self.target;
        joints.refresh_subtree(self.chain[0]);
    }

    fn iterate(&mut self, joints: &mut JointSet) -> bool {
        let target = match self.target {
            Some(target) => target,
            None => return true,
        };
        let effector = self.end_effector();
        let mut swept = 0f32;
        for i in (0..self.chain.len() - 1).rev() {
            let handle = self.chain[i];
            let joint = joints.get(handle).unwrap();
            let inverse = joint.orientation().conjugate();
            let origin = joint.position();
            let effector_local = inverse * (joints.position(effector) - origin);
            let target_local = inverse * (target.position - origin);
            let mut delta = match rotation_between(effector_local, target_local) {
                Some(delta) => delta,
                None => continue,
            };
            if let Some(constraint) = joint.constraint() {
                delta = constraint.constrain_rotation(delta, joint);
            }
            swept += rotation_angle(delta).0;
            // immediate commit: the rest of the sweep sees this joint moved
            joints.rotate(handle, delta);
        }
        let distance = self.effector_distance(joints, &target);
        self.state.set_last_error(distance);
        distance <= self.state.params.error || swept <= self.state.params.min_distance
    }

    fn update(&mut self, _joints: &mut JointSet) {
        // rotations are already applied in place during the sweep
    }
}
