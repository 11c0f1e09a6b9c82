use cgmath::{AbsDiffEq, InnerSpace, One, Quaternion, Vector3};

use crate::error::KinesolveError;
use crate::structure::{JointIndex, JointSet};
use crate::utils::{lerp_vec3, rotation_between, safe_normalize};

use super::{Solve, SolverState, Target};

/// Two-pass FABRIK over a single linear chain.
///
/// Iterations work on a desired-position buffer: forward reaching walks
/// tip to root without touching the joints, backward reaching walks root to
/// tip and commits rotations in place. The best configuration seen across
/// iterations (by end-effector distance alone) is kept as a fallback and
/// committed by `update()`.
pub struct ChainSolver {
    state: SolverState,
    pub(crate) chain: Vec<JointIndex>,
    pub(crate) target: Option<Target>,
    previous: Option<Target>,
    /// `distances[i]` is the bone length between `chain[i]` and
    /// `chain[i + 1]`, cached at reset and constant across a run.
    distances: Vec<f32>,
    pub(crate) desired_positions: Vec<Vector3<f32>>,
    desired_orientations: Vec<Quaternion<f32>>,
    best_rotations: Vec<Quaternion<f32>>,
    best_distance: f32,
}

impl ChainSolver {
    pub fn new(joints: &JointSet, chain: Vec<JointIndex>) -> Result<Self, KinesolveError> {
        joints.validate_chain(&chain)?;
        let mut solver = Self {
            state: SolverState::default(),
            chain,
            target: None,
            previous: None,
            distances: vec![],
            desired_positions: vec![],
            desired_orientations: vec![],
            best_rotations: vec![],
            best_distance: f32::MAX,
        };
        solver.rebuild(joints);
        Ok(solver)
    }

    pub fn set_target(&mut self, target: Target) {
        self.target = Some(target);
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub fn head(&self) -> JointIndex {
        self.chain[0]
    }

    pub fn end_effector(&self) -> JointIndex {
        *self.chain.last().unwrap()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub(crate) fn joint_at(&self, position: usize) -> JointIndex {
        self.chain[position]
    }

    /// Where forward reaching last wanted the head of this chain.
    pub(crate) fn first_desired_position(&self) -> Vector3<f32> {
        self.desired_positions[0]
    }

    pub(crate) fn desired_position(&self, position: usize) -> Vector3<f32> {
        self.desired_positions[position]
    }

    pub(crate) fn effector_distance(&self, joints: &JointSet, position: Vector3<f32>) -> f32 {
        (joints.position(self.end_effector()) - position).magnitude()
    }

    /// Rebuilds bone lengths and the desired buffers from the live joints.
    pub(crate) fn rebuild(&mut self, joints: &JointSet) {
        self.distances = self
            .chain
            .windows(2)
            .map(|pair| (joints.position(pair[1]) - joints.position(pair[0])).magnitude())
            .collect();
        self.desired_positions = self
            .chain
            .iter()
            .map(|joint| joints.position(*joint))
            .collect();
        self.desired_orientations = self
            .chain
            .iter()
            .map(|joint| joints.orientation(*joint))
            .collect();
        self.best_rotations.clear();
        self.best_distance = f32::MAX;
        log::trace!(
            "chain rebuilt: {} joints, reach {}",
            self.chain.len(),
            self.distances.iter().sum::<f32>()
        );
    }

    /// Forward reaching: tip to root over the desired buffer only.
    ///
    /// Each step anchors on the constraint-corrected previous desired
    /// position and interpolates so consecutive desired positions sit at
    /// exactly the cached bone length. When the target is out of reach the
    /// interpolation factor saturates and the buffer straightens toward it;
    /// no special case is needed.
    pub(crate) fn forward_reach(&mut self, joints: &JointSet, target_position: Vector3<f32>) {
        let last = self.chain.len() - 1;
        self.desired_positions[last] = target_position;
        for i in (0..last).rev() {
            let bone = self.distances[i];
            if bone <= f32::default_epsilon() {
                self.desired_positions[i] = self.desired_positions[i + 1];
                continue;
            }
            let anchor = self.forward_anchor(joints, i);
            let reach = (anchor - self.desired_positions[i + 1]).magnitude();
            if reach <= f32::default_epsilon() {
                // anchor collapsed onto the child; keep the current bone
                // direction instead of inventing one
                let direction =
                    safe_normalize(joints.position(self.chain[i]) - joints.position(self.chain[i + 1]))
                        .unwrap_or(Vector3::unit_x());
                self.desired_positions[i] = self.desired_positions[i + 1] + direction * bone;
                continue;
            }
            self.desired_positions[i] =
                lerp_vec3(self.desired_positions[i + 1], anchor, bone / reach);
        }
    }

    /// Constraint-aware anchor for `desired_positions[i]`, derived from the
    /// current chain geometry rather than the new target.
    fn forward_anchor(&self, joints: &JointSet, i: usize) -> Vector3<f32> {
        let anchor = self.desired_positions[i];
        let joint = joints.get(self.chain[i]).unwrap();
        let constraint = match joint.constraint() {
            Some(constraint) if constraint.enabled() => constraint,
            _ => return anchor,
        };
        let rest_direction = match safe_normalize(joints.get(self.chain[i + 1]).unwrap().translation)
        {
            Some(direction) => direction,
            None => return anchor,
        };
        let parent_orientation = match joint.parent {
            Some(parent) => joints.orientation(parent),
            None => Quaternion::one(),
        };
        let proposed = self.desired_positions[i + 1] - anchor;
        let local = match safe_normalize(parent_orientation.conjugate() * proposed) {
            Some(direction) => direction,
            None => return anchor,
        };
        let admissible = constraint.admissible_direction(local, rest_direction);
        self.desired_positions[i + 1] - parent_orientation * admissible * self.distances[i]
    }

    /// Backward reaching: root to tip, committing rotations in place.
    ///
    /// Re-anchors the buffer at the head's true position, rotates each
    /// joint so its child's rest bone direction points at the desired
    /// position, and overwrites the desired position with the position the
    /// constrained rotation actually produced, so downstream bookkeeping
    /// stays consistent. Returns the accumulated positional change.
    ///
    /// With `skip_head` the head joint is left untouched: a chain hanging
    /// off a shared sub-base must not rotate it, that joint's orientation
    /// is owned by the tree's branch reconciliation.
    pub(crate) fn backward_reach(&mut self, joints: &mut JointSet, skip_head: bool) -> f32 {
        let last = self.chain.len() - 1;
        let head = self.chain[0];
        self.desired_positions[0] = joints.position(head);
        self.desired_orientations[0] = joints.orientation(head);
        let start = if skip_head && last > 0 {
            // the head stays put; realign the buffer on where its current
            // orientation actually leaves the first joint
            self.desired_positions[1] = joints.position(self.chain[1]);
            self.desired_orientations[1] = joints.orientation(self.chain[1]);
            1
        } else {
            0
        };
        let mut change = 0f32;
        for i in start..last {
            let handle = self.chain[i];
            let child_handle = self.chain[i + 1];
            let child_translation = joints.get(child_handle).unwrap().translation;
            let joint = joints.get(handle).unwrap();
            let desired = self.desired_positions[i + 1] - joint.position();
            let local_desired = joint.orientation().conjugate() * desired;
            if let Some(mut delta) = rotation_between(child_translation, local_desired) {
                if let Some(constraint) = joint.constraint() {
                    delta = constraint.constrain_rotation(delta, joint);
                }
                joints.rotate(handle, delta);
            }
            let actual = joints.position(child_handle);
            change += (actual - self.desired_positions[i + 1]).magnitude();
            self.desired_positions[i + 1] = actual;
            self.desired_orientations[i + 1] = joints.orientation(child_handle);
        }
        change
    }

    fn track_best(&mut self, joints: &JointSet, distance: f32) {
        if distance < self.best_distance {
            self.best_distance = distance;
            self.best_rotations = self
                .chain
                .iter()
                .map(|joint| joints.get(*joint).unwrap().rotation)
                .collect();
        }
    }
}

impl Solve for ChainSolver {
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
        self.rebuild(joints);
    }

    fn iterate(&mut self, joints: &mut JointSet) -> bool {
        let target = match self.target {
            Some(target) => target,
            None => return true,
        };
        if self.chain.len() < 2 {
            return true;
        }
        self.forward_reach(joints, target.position);
        let change = self.backward_reach(joints, false);
        let distance = self.effector_distance(joints, target.position);
        self.state.set_last_error(distance);
        self.track_best(joints, distance);
        distance <= self.state.params.error || change <= self.state.params.min_distance
    }

    /// Commits the best configuration seen so far; the per-iteration
    /// rotations are already in place, this only rolls back a regression.
    fn update(&mut self, joints: &mut JointSet) {
        if self.best_rotations.len() != self.chain.len() {
            return;
        }
        for (joint, rotation) in self.chain.iter().zip(self.best_rotations.iter()) {
            joints.get_mut(*joint).unwrap().rotation = *rotation;
        }
        joints.refresh_subtree(self.chain[0]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::Zero;

    fn arm(bones: &[f32]) -> (JointSet, Vec<JointIndex>) {
        let mut joints = JointSet::new();
        let mut chain = vec![joints
            .append("j0", None, Vector3::zero(), Quaternion::one())
            .unwrap()];
        for (i, length) in bones.iter().enumerate() {
            let parent = *chain.last().unwrap();
            let handle = joints
                .append(
                    &format!("j{}", i + 1),
                    Some(parent),
                    Vector3::new(*length, 0f32, 0f32),
                    Quaternion::one(),
                )
                .unwrap();
            chain.push(handle);
        }
        (joints, chain)
    }

    fn run_to_convergence(solver: &mut ChainSolver, joints: &mut JointSet) {
        solver.state_mut().params.times_per_frame = 1f32;
        for _ in 0..solver.state().params.max_iterations {
            if solver.solve(joints) {
                break;
            }
        }
    }

    #[test]
    fn test_chain_reaches_target() {
        let (mut joints, chain) = arm(&[10f32, 10f32]);
        let mut solver = ChainSolver::new(&joints, chain).unwrap();
        solver.set_target(Target::new(
            Vector3::new(8f32, 9f32, 0f32),
            Quaternion::one(),
        ));
        run_to_convergence(&mut solver, &mut joints);
        assert!(solver.state().last_error() <= solver.state().params.error);
    }

    #[test]
    fn test_degenerate_bone_is_copied_through() {
        let (mut joints, chain) = arm(&[10f32, 0f32, 10f32]);
        let mut solver = ChainSolver::new(&joints, chain).unwrap();
        solver.set_target(Target::new(
            Vector3::new(5f32, 8f32, 0f32),
            Quaternion::one(),
        ));
        run_to_convergence(&mut solver, &mut joints);
        assert!(solver.state().last_error() <= solver.state().params.error);
    }

    #[test]
    fn test_forward_reach_preserves_bone_lengths() {
        let (mut joints, chain) = arm(&[10f32, 10f32]);
        let mut solver = ChainSolver::new(&joints, chain).unwrap();
        solver.reset(&mut joints);
        solver.forward_reach(&joints, Vector3::new(3f32, 4f32, 0f32));
        for (pair, bone) in solver.desired_positions.windows(2).zip(&solver.distances) {
            assert!(((pair[1] - pair[0]).magnitude() - bone).abs() <= 1e-4);
        }
    }

    #[test]
    fn test_update_commits_best_seen() {
        let (mut joints, chain) = arm(&[10f32, 10f32]);
        let tip = *chain.last().unwrap();
        let mut solver = ChainSolver::new(&joints, chain).unwrap();
        let target = Target::new(Vector3::new(8f32, 9f32, 0f32), Quaternion::one());
        solver.set_target(target);
        run_to_convergence(&mut solver, &mut joints);
        let committed = (joints.position(tip) - target.position).magnitude();
        assert!((committed - solver.best_distance).abs() <= 1e-4);
    }
}
