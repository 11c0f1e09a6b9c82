use std::collections::HashMap;

use cgmath::{InnerSpace, One, Quaternion, Vector3, Zero};

use crate::error::KinesolveError;

use super::{constraint::Constraint, JointIndex};

/// World-space pose derived from the local transforms along the parent
/// chain. Cached on the joint and refreshed parent-first.
#[derive(Debug, Clone, Copy)]
pub struct GlobalPose {
    pub position: Vector3<f32>,
    pub orientation: Quaternion<f32>,
}

impl Default for GlobalPose {
    fn default() -> Self {
        Self {
            position: Vector3::zero(),
            orientation: Quaternion::one(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Joint {
    pub name: String,
    pub handle: JointIndex,
    /// Local offset from the parent joint. Its length is the bone length and
    /// must stay constant while solving.
    pub translation: Vector3<f32>,
    /// Local rotation relative to the parent frame. Solvers mutate this.
    pub rotation: Quaternion<f32>,
    pub parent: Option<JointIndex>,
    pub constraint: Option<Constraint>,
    global: GlobalPose,
}

impl Joint {
    pub fn position(&self) -> Vector3<f32> {
        self.global.position
    }

    pub fn orientation(&self) -> Quaternion<f32> {
        self.global.orientation
    }

    pub fn translation(&self) -> Vector3<f32> {
        self.translation
    }

    pub fn rotation(&self) -> Quaternion<f32> {
        self.rotation
    }

    pub fn constraint(&self) -> Option<&Constraint> {
        self.constraint.as_ref()
    }

    pub fn bone_length(&self) -> f32 {
        self.translation.magnitude()
    }
}

/// Arena of joints forming one tree. A joint's parent must already be in the
/// set when the joint is appended, so a child index is always greater than
/// its parent index and the reference graph cannot form a cycle. The first
/// joint is the root; appending a second parentless joint is rejected.
#[derive(Debug, Clone, Default)]
pub struct JointSet {
    joints: Vec<Joint>,
    joints_by_name: HashMap<String, JointIndex>,
    parent_tree: HashMap<JointIndex, Vec<JointIndex>>,
}

impl JointSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(
        &mut self,
        name: &str,
        parent: Option<JointIndex>,
        translation: Vector3<f32>,
        rotation: Quaternion<f32>,
    ) -> Result<JointIndex, KinesolveError> {
        match parent {
            Some(parent_idx) => {
                if parent_idx >= self.joints.len() {
                    return Err(KinesolveError::missing_parent(parent_idx));
                }
            }
            None => {
                if !self.joints.is_empty() {
                    return Err(KinesolveError::second_root());
                }
            }
        }
        let handle = self.joints.len();
        let mut joint = Joint {
            name: name.to_owned(),
            handle,
            translation,
            rotation,
            parent,
            constraint: None,
            global: GlobalPose::default(),
        };
        if joint.name.is_empty() {
            joint.name = format!("Joint{}", handle);
        }
        self.joints_by_name.insert(joint.name.clone(), handle);
        if let Some(parent_idx) = parent {
            self.parent_tree
                .entry(parent_idx)
                .or_insert(vec![])
                .push(handle);
        }
        self.joints.push(joint);
        self.refresh_pose(handle);
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }

    pub fn get(&self, joint: JointIndex) -> Option<&Joint> {
        self.joints.get(joint)
    }

    pub fn get_mut(&mut self, joint: JointIndex) -> Option<&mut Joint> {
        self.joints.get_mut(joint)
    }

    pub fn find(&self, name: &str) -> Option<&Joint> {
        self.joints_by_name
            .get(name)
            .and_then(|idx| self.joints.get(*idx))
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Joint> {
        self.joints_by_name
            .get(name)
            .and_then(|idx| self.joints.get_mut(*idx))
    }

    pub fn parent_of(&self, joint: JointIndex) -> Option<&Joint> {
        self.get(joint)
            .and_then(|joint| joint.parent)
            .and_then(|idx| self.joints.get(idx))
    }

    pub fn children_of(&self, joint: JointIndex) -> &[JointIndex] {
        self.parent_tree
            .get(&joint)
            .map(|children| children.as_slice())
            .unwrap_or(&[])
    }

    pub fn iter_idx(&self) -> impl Iterator<Item = JointIndex> {
        0..self.joints.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Joint> {
        self.joints.iter()
    }

    pub fn position(&self, joint: JointIndex) -> Vector3<f32> {
        self.joints[joint].global.position
    }

    pub fn orientation(&self, joint: JointIndex) -> Quaternion<f32> {
        self.joints[joint].global.orientation
    }

    /// Replaces the local rotation and refreshes the joint's subtree.
    pub fn set_rotation(&mut self, joint: JointIndex, rotation: Quaternion<f32>) {
        if let Some(target) = self.joints.get_mut(joint) {
            target.rotation = rotation;
            self.refresh_subtree(joint);
        }
    }

    /// Composes `delta` onto the local rotation (in the joint's own frame)
    /// and refreshes the joint's subtree.
    pub fn rotate(&mut self, joint: JointIndex, delta: Quaternion<f32>) {
        if let Some(target) = self.joints.get_mut(joint) {
            target.rotation = (target.rotation * delta).normalize();
            self.refresh_subtree(joint);
        }
    }

    fn refresh_pose(&mut self, joint: JointIndex) {
        let parent_pose = self.joints[joint]
            .parent
            .map(|parent| self.joints[parent].global);
        let target = &mut self.joints[joint];
        target.global = match parent_pose {
            Some(parent) => GlobalPose {
                position: parent.position + parent.orientation * target.translation,
                orientation: (parent.orientation * target.rotation).normalize(),
            },
            None => GlobalPose {
                position: target.translation,
                orientation: target.rotation.normalize(),
            },
        };
    }

    /// Recomputes cached world poses for `root` and everything below it.
    /// Parents outside the subtree are assumed current.
    pub fn refresh_subtree(&mut self, root: JointIndex) {
        if root >= self.joints.len() {
            return;
        }
        let mut stack = vec![root];
        while let Some(idx) = stack.pop() {
            self.refresh_pose(idx);
            if let Some(children) = self.parent_tree.get(&idx) {
                stack.extend(children.iter().copied());
            }
        }
    }

    /// Recomputes every cached world pose, root first. Call after mutating
    /// local transforms directly through `get_mut`.
    pub fn refresh_all(&mut self) {
        // append order guarantees parents come before children
        for idx in 0..self.joints.len() {
            self.refresh_pose(idx);
        }
    }

    /// Checks that `chain` is a parent-to-child path through this set.
    pub fn validate_chain(&self, chain: &[JointIndex]) -> Result<(), KinesolveError> {
        if chain.is_empty() {
            return Err(KinesolveError::empty_chain());
        }
        for (position, joint) in chain.iter().enumerate() {
            if *joint >= self.joints.len() {
                return Err(KinesolveError::unknown_joint(*joint));
            }
            if position > 0 && self.joints[*joint].parent != Some(chain[position - 1]) {
                return Err(KinesolveError::broken_chain(position));
            }
        }
        Ok(())
    }
}
