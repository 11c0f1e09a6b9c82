use cgmath::{AbsDiffEq, InnerSpace, Vector3, Zero};

use crate::error::KinesolveError;
use crate::structure::{JointIndex, JointSet};
use crate::utils::rotation_between;

use super::{chain::ChainSolver, Solve, SolverState, Target};

/// Centroid displacement below which a sub-base keeps its orientation.
const CENTROID_EPSILON: f32 = 0.001f32;

/// One linear run of the decomposed tree and the branches hanging off its
/// end. The chain's end effector is a sub-base when there is more than one
/// child.
struct TreeNode {
    chain: ChainSolver,
    children: Vec<TreeNode>,
    /// Branch weight used when averaging this chain's pull on a shared
    /// sub-base.
    weight: f32,
    /// Whether this chain performed forward reaching this iteration.
    modified: bool,
    /// Whether any leaf below (or at) this node carries a real target.
    active: bool,
    /// Weighted average of active children's desired head positions,
    /// recomputed every iteration for non-leaf nodes.
    synthetic: Option<Vector3<f32>>,
}

/// FABRIK over a branching joint hierarchy.
///
/// The tree is decomposed into linear chains at construction: every maximal
/// run of single-child joints becomes one [`ChainSolver`], and a joint with
/// more than one child terminates the run and heads one new run per child.
/// Each iteration runs forward reaching leaves to root with weighted
/// synthetic targets at the branch points, then backward reaching root to
/// leaves, reconciling every sub-base orientation between its branches'
/// demands.
pub struct TreeSolver {
    state: SolverState,
    root: TreeNode,
    all_joints: Vec<JointIndex>,
}

impl TreeSolver {
    pub fn new(joints: &JointSet, root: JointIndex) -> Result<Self, KinesolveError> {
        if joints.get(root).is_none() {
            return Err(KinesolveError::unknown_joint(root));
        }
        let root = build_node(joints, vec![root])?;
        let mut all_joints = vec![];
        collect_joints(&root, &mut all_joints);
        log::debug!(
            "tree decomposed into {} chains over {} joints",
            count_chains(&root),
            all_joints.len()
        );
        Ok(Self {
            state: SolverState::default(),
            root,
            all_joints,
        })
    }

    /// Registers the target pose for one end effector. The joint must be
    /// the tip of a leaf chain of this tree.
    pub fn set_target(&mut self, effector: JointIndex, target: Target) -> Result<(), KinesolveError> {
        match find_leaf_mut(&mut self.root, effector) {
            Some(node) => {
                node.chain.set_target(target);
                Ok(())
            }
            None => Err(KinesolveError::unknown_effector(effector)),
        }
    }

    /// Sets the averaging weight of the branch whose chain ends at
    /// `effector` (a leaf tip or an intermediate sub-base).
    pub fn set_weight(&mut self, effector: JointIndex, weight: f32) -> Result<(), KinesolveError> {
        match find_node_mut(&mut self.root, effector) {
            Some(node) => {
                node.weight = weight;
                Ok(())
            }
            None => Err(KinesolveError::unknown_effector(effector)),
        }
    }
}

fn build_node(joints: &JointSet, mut run: Vec<JointIndex>) -> Result<TreeNode, KinesolveError> {
    let mut cursor = *run.last().unwrap();
    loop {
        let children = joints.children_of(cursor);
        if children.len() != 1 {
            break;
        }
        cursor = children[0];
        run.push(cursor);
    }
    let branches = joints.children_of(cursor).to_vec();
    let chain = ChainSolver::new(joints, run)?;
    let mut children = Vec::with_capacity(branches.len());
    for branch in branches {
        children.push(build_node(joints, vec![cursor, branch])?);
    }
    Ok(TreeNode {
        chain,
        children,
        weight: 1f32,
        modified: false,
        active: false,
        synthetic: None,
    })
}

fn collect_joints(node: &TreeNode, out: &mut Vec<JointIndex>) {
    for position in 0..node.chain.len() {
        let joint = node.chain.joint_at(position);
        if !out.contains(&joint) {
            out.push(joint);
        }
    }
    for child in &node.children {
        collect_joints(child, out);
    }
}

fn count_chains(node: &TreeNode) -> usize {
    1 + node.children.iter().map(count_chains).sum::<usize>()
}

fn find_leaf_mut(node: &mut TreeNode, effector: JointIndex) -> Option<&mut TreeNode> {
    if node.children.is_empty() {
        if node.chain.end_effector() == effector {
            return Some(node);
        }
        return None;
    }
    node.children
        .iter_mut()
        .find_map(|child| find_leaf_mut(child, effector))
}

fn find_node_mut(node: &mut TreeNode, effector: JointIndex) -> Option<&mut TreeNode> {
    if node.chain.end_effector() == effector {
        return Some(node);
    }
    node.children
        .iter_mut()
        .find_map(|child| find_node_mut(child, effector))
}

fn node_target_position(node: &TreeNode) -> Option<Vector3<f32>> {
    if node.children.is_empty() {
        node.chain.target.map(|target| target.position)
    } else {
        node.synthetic
    }
}

/// Leaves-to-root pass: children first, so a branch point can average its
/// children's freshly computed head demands into a synthetic target.
fn forward_pass(node: &mut TreeNode, joints: &JointSet, error: f32) {
    for child in &mut node.children {
        forward_pass(child, joints, error);
    }
    node.active = if node.children.is_empty() {
        node.chain.target.is_some()
    } else {
        node.children.iter().any(|child| child.active)
    };
    node.synthetic = None;
    if !node.children.is_empty() {
        let mut accumulated = Vector3::zero();
        let mut weight_sum = 0f32;
        for child in &node.children {
            if !child.active {
                continue;
            }
            accumulated += child.chain.first_desired_position() * child.weight;
            weight_sum += child.weight;
        }
        if weight_sum > 0f32 {
            node.synthetic = Some(accumulated / weight_sum);
        }
    }
    node.modified = false;
    let target_position = match node_target_position(node) {
        Some(position) => position,
        None => return,
    };
    if node.chain.effector_distance(joints, target_position) > error {
        node.chain.forward_reach(joints, target_position);
        node.modified = true;
    }
}

/// Root-to-leaves pass: commit each modified chain, then reconcile the
/// sub-base orientation before descending into its branches.
///
/// Every chain except the root run hangs off a sub-base; those chains skip
/// their head in backward reaching so the reconciliation below stays the
/// only writer of a sub-base's orientation.
fn backward_pass(
    node: &mut TreeNode,
    joints: &mut JointSet,
    change: &mut f32,
    chains: &mut usize,
    is_root: bool,
) {
    if node.modified {
        *change += node.chain.backward_reach(joints, !is_root);
        *chains += 1;
    }
    if node.children.len() > 1 {
        reconcile_sub_base(node, joints);
    }
    for child in &mut node.children {
        backward_pass(child, joints, change, chains, false);
    }
}

/// Aligns a shared sub-base with its branches' pulls: the weighted centroid
/// of the children's rest first-joint positions is rotated onto the
/// centroid of their currently demanded first-joint positions, both taken
/// in the sub-base local frame. Symmetric demands cancel and leave the
/// sub-base untouched.
fn reconcile_sub_base(node: &TreeNode, joints: &mut JointSet) {
    let sub_base = node.chain.end_effector();
    let base_position = joints.position(sub_base);
    let inverse = joints.orientation(sub_base).conjugate();
    let mut rest_centroid = Vector3::zero();
    let mut current_centroid = Vector3::zero();
    let mut weight_sum = 0f32;
    let mut contributing = 0usize;
    for child in &node.children {
        if child.chain.len() < 2 {
            continue;
        }
        let first = child.chain.joint_at(1);
        let translation = joints.get(first).unwrap().translation;
        if translation.magnitude2() <= f32::default_epsilon() {
            continue;
        }
        contributing += 1;
        weight_sum += child.weight;
        rest_centroid += translation * child.weight;
        current_centroid +=
            (inverse * (child.chain.desired_position(1) - base_position)) * child.weight;
    }
    if contributing < 2 || weight_sum <= 0f32 {
        return;
    }
    let rest_centroid = rest_centroid / weight_sum;
    let current_centroid = current_centroid / weight_sum;
    if (current_centroid - rest_centroid).magnitude() <= CENTROID_EPSILON {
        return;
    }
    if let Some(delta) = rotation_between(rest_centroid, current_centroid) {
        joints.rotate(sub_base, delta);
    }
}

fn any_changed(node: &TreeNode, joints: &JointSet) -> bool {
    node.chain.changed(joints) || node.children.iter().any(|child| any_changed(child, joints))
}

fn reset_node(node: &mut TreeNode, joints: &mut JointSet) {
    node.chain.reset(joints);
    node.modified = false;
    node.synthetic = None;
    for child in &mut node.children {
        reset_node(child, joints);
    }
}

fn visit_leaf_errors(
    node: &TreeNode,
    joints: &JointSet,
    error: f32,
    worst: &mut f32,
    any_target: &mut bool,
    all_within: &mut bool,
) {
    if node.children.is_empty() {
        if let Some(target) = node.chain.target {
            *any_target = true;
            let distance = node.chain.effector_distance(joints, target.position);
            if distance > *worst {
                *worst = distance;
            }
            if distance > error {
                *all_within = false;
            }
        }
    }
    for child in &node.children {
        visit_leaf_errors(child, joints, error, worst, any_target, all_within);
    }
}

impl Solve for TreeSolver {
    fn state(&self) -> &SolverState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut SolverState {
        &mut self.state
    }

    fn solved_joints(&self) -> &[JointIndex] {
        &self.all_joints
    }

    fn changed(&self, joints: &JointSet) -> bool {
        any_changed(&self.root, joints)
    }

    fn reset(&mut self, joints: &mut JointSet) {
        reset_node(&mut self.root, joints);
    }

    fn iterate(&mut self, joints: &mut JointSet) -> bool {
        let error = self.state.params.error;
        forward_pass(&mut self.root, joints, error);
        let mut change = 0f32;
        let mut chains = 0usize;
        backward_pass(&mut self.root, joints, &mut change, &mut chains, true);
        let mut worst = 0f32;
        let mut any_target = false;
        let mut all_within = true;
        visit_leaf_errors(
            &self.root,
            joints,
            error,
            &mut worst,
            &mut any_target,
            &mut all_within,
        );
        if !any_target {
            return true;
        }
        self.state.set_last_error(worst);
        if chains == 0 {
            // every targeted chain was already within error
            return all_within;
        }
        all_within || change / chains as f32 <= self.state.params.min_distance
    }

    fn update(&mut self, _joints: &mut JointSet) {
        // backward reaching and sub-base reconciliation commit in place
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cgmath::{One, Quaternion};

    /// Root, a spine joint, and two symmetric two-bone arms sharing it.
    fn symmetric_tree() -> (JointSet, JointIndex, [JointIndex; 2]) {
        let mut joints = JointSet::new();
        let root = joints
            .append("root", None, Vector3::zero(), Quaternion::one())
            .unwrap();
        let spine = joints
            .append(
                "spine",
                Some(root),
                Vector3::new(0f32, 5f32, 0f32),
                Quaternion::one(),
            )
            .unwrap();
        let left_elbow = joints
            .append(
                "left_elbow",
                Some(spine),
                Vector3::new(-3f32, 3f32, 0f32),
                Quaternion::one(),
            )
            .unwrap();
        let left_hand = joints
            .append(
                "left_hand",
                Some(left_elbow),
                Vector3::new(-3f32, 3f32, 0f32),
                Quaternion::one(),
            )
            .unwrap();
        let right_elbow = joints
            .append(
                "right_elbow",
                Some(spine),
                Vector3::new(3f32, 3f32, 0f32),
                Quaternion::one(),
            )
            .unwrap();
        let right_hand = joints
            .append(
                "right_hand",
                Some(right_elbow),
                Vector3::new(3f32, 3f32, 0f32),
                Quaternion::one(),
            )
            .unwrap();
        (joints, spine, [left_hand, right_hand])
    }

    #[test]
    fn test_tree_decomposes_at_branch() {
        let (joints, _, hands) = symmetric_tree();
        let solver = TreeSolver::new(&joints, 0).unwrap();
        assert_eq!(count_chains(&solver.root), 3);
        assert_eq!(solver.root.children.len(), 2);
        let tips: Vec<JointIndex> = solver
            .root
            .children
            .iter()
            .map(|child| child.chain.end_effector())
            .collect();
        assert!(tips.contains(&hands[0]) && tips.contains(&hands[1]));
    }

    #[test]
    fn test_set_target_rejects_non_effector() {
        let (joints, spine, _) = symmetric_tree();
        let mut solver = TreeSolver::new(&joints, 0).unwrap();
        let target = Target::new(Vector3::zero(), Quaternion::one());
        assert!(solver.set_target(spine, target).is_err());
    }

    #[test]
    fn test_symmetric_targets_keep_sub_base_orientation() {
        let (mut joints, spine, hands) = symmetric_tree();
        let mut solver = TreeSolver::new(&joints, 0).unwrap();
        let before = joints.orientation(spine);
        // mirrored pair, pulled inward and up by the same amount
        solver
            .set_target(
                hands[0],
                Target::new(Vector3::new(-4f32, 12f32, 0f32), Quaternion::one()),
            )
            .unwrap();
        solver
            .set_target(
                hands[1],
                Target::new(Vector3::new(4f32, 12f32, 0f32), Quaternion::one()),
            )
            .unwrap();
        solver.state_mut().params.times_per_frame = 50f32;
        solver.solve(&mut joints);
        let after = joints.orientation(spine);
        assert_relative_eq!(before * Vector3::unit_y(), after * Vector3::unit_y(), epsilon = 1e-2);
    }

    #[test]
    fn test_tree_without_targets_is_terminal() {
        let (mut joints, _, _) = symmetric_tree();
        let mut solver = TreeSolver::new(&joints, 0).unwrap();
        assert!(solver.solve(&mut joints));
        assert_eq!(solver.state().iterations(), solver.state().params.max_iterations);
    }
}
