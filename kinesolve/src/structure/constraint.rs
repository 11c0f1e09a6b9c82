use std::fmt;
use std::sync::Arc;

use cgmath::{AbsDiffEq, InnerSpace, One, Quaternion, Rad, Rotation3, Vector2, Vector3, Zero};

use crate::utils::{safe_normalize, swing_twist, twist_angle};

use super::joint::Joint;

/// Admissible-orientation volume with no closed-form structure. Solvers only
/// ever ask it for the nearest admissible orientation.
pub trait OrientationField: Send + Sync {
    fn nearest(&self, orientation: Quaternion<f32>) -> Quaternion<f32>;
}

#[derive(Debug, Clone, Copy)]
pub struct ConstraintStates {
    pub enabled: bool,
}

impl Default for ConstraintStates {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Single-axis rotation window. Swing away from the axis is rejected; the
/// signed twist angle about the axis, measured from `rest`, is clamped to
/// `[min_angle, max_angle]`.
#[derive(Debug, Clone)]
pub struct Hinge {
    /// Rotation axis in the joint's local frame. Unit length expected.
    pub axis: Vector3<f32>,
    /// Idle local rotation the angular window is measured from.
    pub rest: Quaternion<f32>,
    pub min_angle: Rad<f32>,
    pub max_angle: Rad<f32>,
}

/// Ball-and-socket: swing limited by an elliptical cone around the rest
/// direction, twist limited to a window about it.
#[derive(Debug, Clone)]
pub struct BallSocket {
    /// Cone and twist axis in the joint's local frame, normally the idle
    /// bone direction of the constrained joint's child. Unit length
    /// expected.
    pub axis: Vector3<f32>,
    /// Idle local rotation swing and twist are measured from.
    pub rest: Quaternion<f32>,
    pub up: Rad<f32>,
    pub down: Rad<f32>,
    pub left: Rad<f32>,
    pub right: Rad<f32>,
    pub min_twist: Rad<f32>,
    pub max_twist: Rad<f32>,
}

/// Swing directions admissible when their projection onto the plane at
/// `height` along the axis falls inside a polygon; outside points clamp to
/// the nearest boundary point. Twist as in [`BallSocket`].
#[derive(Debug, Clone)]
pub struct PlanarPolygon {
    pub axis: Vector3<f32>,
    pub rest: Quaternion<f32>,
    pub height: f32,
    /// Polygon vertices in the plane basis derived from the axis.
    pub vertices: Vec<Vector2<f32>>,
    pub min_twist: Rad<f32>,
    pub max_twist: Rad<f32>,
}

#[derive(Clone)]
pub struct DistanceField {
    pub field: Arc<dyn OrientationField>,
}

impl fmt::Debug for DistanceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistanceField").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum ConstraintKind {
    Hinge(Hinge),
    BallSocket(BallSocket),
    PlanarPolygon(PlanarPolygon),
    DistanceField(DistanceField),
}

#[derive(Debug, Clone)]
pub struct Constraint {
    pub states: ConstraintStates,
    pub kind: ConstraintKind,
}

impl From<Hinge> for Constraint {
    fn from(hinge: Hinge) -> Self {
        Self::new(ConstraintKind::Hinge(hinge))
    }
}

impl From<BallSocket> for Constraint {
    fn from(ball: BallSocket) -> Self {
        Self::new(ConstraintKind::BallSocket(ball))
    }
}

impl From<PlanarPolygon> for Constraint {
    fn from(polygon: PlanarPolygon) -> Self {
        Self::new(ConstraintKind::PlanarPolygon(polygon))
    }
}

impl From<DistanceField> for Constraint {
    fn from(field: DistanceField) -> Self {
        Self::new(ConstraintKind::DistanceField(field))
    }
}

impl Constraint {
    pub fn new(kind: ConstraintKind) -> Self {
        Self {
            states: ConstraintStates::default(),
            kind,
        }
    }

    pub fn enabled(&self) -> bool {
        self.states.enabled
    }

    /// Corrects a proposed local rotation delta so that composing it onto
    /// the joint's current rotation lands inside the admissible set.
    ///
    /// Pure function of its inputs; solvers call it speculatively and may
    /// discard the result. Degenerate configurations yield the identity
    /// delta rather than NaN.
    pub fn constrain_rotation(
        &self,
        proposed: Quaternion<f32>,
        joint: &Joint,
    ) -> Quaternion<f32> {
        if !self.states.enabled {
            return proposed;
        }
        let current = joint.rotation();
        let candidate = (current * proposed).normalize();
        let corrected = match &self.kind {
            ConstraintKind::Hinge(hinge) => hinge.clamp_orientation(candidate),
            ConstraintKind::BallSocket(ball) => ball.clamp_orientation(candidate),
            ConstraintKind::PlanarPolygon(polygon) => polygon.clamp_orientation(candidate),
            ConstraintKind::DistanceField(field) => Some(field.field.nearest(candidate)),
        };
        match corrected {
            Some(corrected) => (current.conjugate() * corrected).normalize(),
            None => Quaternion::one(),
        }
    }

    /// Clamps a proposed bone direction into the constraint's admissible
    /// swing set. `direction` lives in the frame the joint's rotation acts
    /// in; `rest_direction` is the child's idle bone direction in the
    /// joint's local frame. Both unit.
    ///
    /// Used by position-based solvers during forward reaching; distance
    /// fields expose no direction structure and pass the direction through.
    pub(crate) fn admissible_direction(
        &self,
        direction: Vector3<f32>,
        rest_direction: Vector3<f32>,
    ) -> Vector3<f32> {
        if !self.states.enabled {
            return direction;
        }
        match &self.kind {
            ConstraintKind::Hinge(hinge) => hinge
                .clamp_direction(direction, rest_direction)
                .unwrap_or(direction),
            ConstraintKind::BallSocket(ball) => {
                ball.clamp_direction(direction).unwrap_or(direction)
            }
            ConstraintKind::PlanarPolygon(polygon) => {
                polygon.clamp_direction_from_rest(direction).unwrap_or(direction)
            }
            ConstraintKind::DistanceField(_) => direction,
        }
    }
}

impl Hinge {
    fn clamp_orientation(&self, candidate: Quaternion<f32>) -> Option<Quaternion<f32>> {
        let axis = safe_normalize(self.axis)?;
        let relative = (self.rest.conjugate() * candidate).normalize();
        let (_, twist) = swing_twist(relative, axis);
        let angle = twist_angle(twist, axis);
        let clamped = Rad(angle.0.clamp(self.min_angle.0, self.max_angle.0));
        // swing is projected out entirely
        Some((self.rest * Quaternion::from_axis_angle(axis, clamped)).normalize())
    }

    fn clamp_direction(
        &self,
        direction: Vector3<f32>,
        rest_direction: Vector3<f32>,
    ) -> Option<Vector3<f32>> {
        let axis = safe_normalize(self.axis)?;
        let local = self.rest.conjugate() * direction;
        let rest_parallel = axis * rest_direction.dot(axis);
        let rest_perp = rest_direction - rest_parallel;
        if rest_perp.abs_diff_eq(&Vector3::zero(), Vector3::<f32>::default_epsilon()) {
            // bone lies on the hinge axis, rotating cannot move it
            return None;
        }
        let local_perp = local - axis * local.dot(axis);
        let angle = if local_perp.abs_diff_eq(&Vector3::zero(), Vector3::<f32>::default_epsilon())
        {
            Rad(0f32)
        } else {
            Rad(axis
                .dot(rest_perp.cross(local_perp))
                .atan2(rest_perp.dot(local_perp)))
        };
        let clamped = Rad(angle.0.clamp(self.min_angle.0, self.max_angle.0));
        let swung = Quaternion::from_axis_angle(axis, clamped) * rest_direction;
        Some((self.rest * swung).normalize())
    }
}

impl BallSocket {
    fn clamp_orientation(&self, candidate: Quaternion<f32>) -> Option<Quaternion<f32>> {
        let axis = safe_normalize(self.axis)?;
        let (right, up) = swing_basis(axis);
        let relative = (self.rest.conjugate() * candidate).normalize();
        let (swing, twist) = swing_twist(relative, axis);
        let direction = to_basis(swing * axis, right, up, axis);
        let clamped = clamp_to_cone(direction, self.up, self.down, self.left, self.right);
        let swing = Quaternion::from_arc(axis, from_basis(clamped, right, up, axis), None);
        let angle = twist_angle(twist, axis);
        let twist = Quaternion::from_axis_angle(
            axis,
            Rad(angle.0.clamp(self.min_twist.0, self.max_twist.0)),
        );
        Some((self.rest * swing * twist).normalize())
    }

    fn clamp_direction(&self, direction: Vector3<f32>) -> Option<Vector3<f32>> {
        let axis = safe_normalize(self.axis)?;
        let (right, up) = swing_basis(axis);
        let local = to_basis(self.rest.conjugate() * direction, right, up, axis);
        let clamped = clamp_to_cone(local, self.up, self.down, self.left, self.right);
        Some(self.rest * from_basis(clamped, right, up, axis))
    }
}

impl PlanarPolygon {
    fn clamp_orientation(&self, candidate: Quaternion<f32>) -> Option<Quaternion<f32>> {
        let axis = safe_normalize(self.axis)?;
        let (right, up) = swing_basis(axis);
        let relative = (self.rest.conjugate() * candidate).normalize();
        let (swing, twist) = swing_twist(relative, axis);
        let direction = to_basis(swing * axis, right, up, axis);
        let clamped = self.clamp_planar(direction)?;
        let swing = Quaternion::from_arc(axis, from_basis(clamped, right, up, axis), None);
        let angle = twist_angle(twist, axis);
        let twist = Quaternion::from_axis_angle(
            axis,
            Rad(angle.0.clamp(self.min_twist.0, self.max_twist.0)),
        );
        Some((self.rest * swing * twist).normalize())
    }

    fn clamp_direction_from_rest(&self, direction: Vector3<f32>) -> Option<Vector3<f32>> {
        let axis = safe_normalize(self.axis)?;
        let (right, up) = swing_basis(axis);
        let local = to_basis(self.rest.conjugate() * direction, right, up, axis);
        let clamped = self.clamp_planar(local)?;
        Some(self.rest * from_basis(clamped, right, up, axis))
    }

    /// Clamps a basis-space direction (z along the axis) into the
    /// polygonal swing region.
    fn clamp_planar(&self, direction: Vector3<f32>) -> Option<Vector3<f32>> {
        if self.vertices.len() < 3 || self.height <= f32::default_epsilon() {
            return None;
        }
        let planar = Vector2::new(direction.x, direction.y);
        let point = if direction.z > f32::default_epsilon() {
            planar * (self.height / direction.z)
        } else {
            // behind the plane, push the projection out so the boundary
            // clamp below catches it
            let fallback =
                if planar.abs_diff_eq(&Vector2::zero(), Vector2::<f32>::default_epsilon()) {
                    Vector2::unit_x()
                } else {
                    planar.normalize()
                };
            fallback * 1.0e6f32
        };
        let point = if point_in_polygon(point, &self.vertices) {
            point
        } else {
            closest_boundary_point(point, &self.vertices)
        };
        safe_normalize(Vector3::new(point.x, point.y, self.height))
    }
}

/// Orthonormal pair completing `axis` into a right-handed basis
/// `(right, up, axis)`. Anchors the ellipse azimuth deterministically.
fn swing_basis(axis: Vector3<f32>) -> (Vector3<f32>, Vector3<f32>) {
    let reference = if axis.y.abs() < 0.99f32 {
        Vector3::unit_y()
    } else {
        Vector3::unit_x()
    };
    let right = reference.cross(axis).normalize();
    let up = axis.cross(right);
    (right, up)
}

fn to_basis(
    v: Vector3<f32>,
    right: Vector3<f32>,
    up: Vector3<f32>,
    axis: Vector3<f32>,
) -> Vector3<f32> {
    Vector3::new(v.dot(right), v.dot(up), v.dot(axis))
}

fn from_basis(
    v: Vector3<f32>,
    right: Vector3<f32>,
    up: Vector3<f32>,
    axis: Vector3<f32>,
) -> Vector3<f32> {
    right * v.x + up * v.y + axis * v.z
}

/// Clamps a unit direction into the elliptical cone around +Z whose
/// half-angles are `up`/`down`/`left`/`right` per quadrant.
fn clamp_to_cone(
    direction: Vector3<f32>,
    up: Rad<f32>,
    down: Rad<f32>,
    left: Rad<f32>,
    right: Rad<f32>,
) -> Vector3<f32> {
    let polar = direction.z.clamp(-1f32, 1f32).acos();
    let planar = Vector2::new(direction.x, direction.y);
    if planar.abs_diff_eq(&Vector2::zero(), Vector2::<f32>::default_epsilon()) {
        if direction.z >= 0f32 {
            return direction;
        }
        // straight back, no azimuth to clamp along; fold onto the axis
        return Vector3::unit_z();
    }
    let azimuth = planar.normalize();
    let a = if azimuth.x >= 0f32 { right.0 } else { left.0 };
    let b = if azimuth.y >= 0f32 { up.0 } else { down.0 };
    let denominator = ((b * azimuth.x).powi(2) + (a * azimuth.y).powi(2)).sqrt();
    let limit = if denominator <= f32::default_epsilon() {
        0f32
    } else {
        a * b / denominator
    };
    if polar <= limit {
        return direction;
    }
    let (sin, cos) = limit.sin_cos();
    Vector3::new(sin * azimuth.x, sin * azimuth.y, cos)
}

fn point_in_polygon(point: Vector2<f32>, vertices: &[Vector2<f32>]) -> bool {
    let mut inside = false;
    let mut previous = vertices.len() - 1;
    for current in 0..vertices.len() {
        let a = vertices[current];
        let b = vertices[previous];
        if (a.y > point.y) != (b.y > point.y) {
            let crossing = a.x + (point.y - a.y) / (b.y - a.y) * (b.x - a.x);
            if point.x < crossing {
                inside = !inside;
            }
        }
        previous = current;
    }
    inside
}

fn closest_boundary_point(point: Vector2<f32>, vertices: &[Vector2<f32>]) -> Vector2<f32> {
    let mut best = vertices[0];
    let mut best_distance2 = f32::MAX;
    let mut previous = vertices.len() - 1;
    for current in 0..vertices.len() {
        let candidate = closest_on_segment(point, vertices[previous], vertices[current]);
        let distance2 = (candidate - point).magnitude2();
        if distance2 < best_distance2 {
            best_distance2 = distance2;
            best = candidate;
        }
        previous = current;
    }
    best
}

fn closest_on_segment(point: Vector2<f32>, a: Vector2<f32>, b: Vector2<f32>) -> Vector2<f32> {
    let segment = b - a;
    let length2 = segment.magnitude2();
    if length2 <= f32::default_epsilon() {
        return a;
    }
    let t = ((point - a).dot(segment) / length2).clamp(0f32, 1f32);
    a + segment * t
}
