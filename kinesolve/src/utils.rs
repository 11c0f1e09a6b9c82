use cgmath::{AbsDiffEq, InnerSpace, One, Quaternion, Rad, Vector3, Zero};

pub fn lerp_vec3(a: Vector3<f32>, b: Vector3<f32>, amount: f32) -> Vector3<f32> {
    a + (b - a) * amount
}

/// Normalized copy of `v`, or `None` when the vector is too short to carry a
/// direction.
pub fn safe_normalize(v: Vector3<f32>) -> Option<Vector3<f32>> {
    if v.abs_diff_eq(&Vector3::zero(), Vector3::<f32>::default_epsilon()) {
        None
    } else {
        Some(v.normalize())
    }
}

/// Shortest-arc rotation mapping direction `from` onto direction `to`.
///
/// Degenerate inputs (either direction too short) yield `None`; the caller
/// skips the joint for that step instead of propagating NaN.
pub fn rotation_between(from: Vector3<f32>, to: Vector3<f32>) -> Option<Quaternion<f32>> {
    let from = safe_normalize(from)?;
    let to = safe_normalize(to)?;
    Some(Quaternion::from_arc(from, to, None))
}

/// Splits `q` into swing and twist about the unit `axis`, with
/// `q == swing * twist`. The twist is the component of the rotation about
/// `axis`; the swing is what remains, orthogonal to it.
///
/// When the rotation is a pure half-turn away from the axis the twist
/// projection collapses; the whole rotation is then reported as swing.
pub fn swing_twist(q: Quaternion<f32>, axis: Vector3<f32>) -> (Quaternion<f32>, Quaternion<f32>) {
    let projected = axis * q.v.dot(axis);
    let twist = Quaternion::from_sv(q.s, projected);
    if twist.magnitude2() <= f32::default_epsilon() {
        return (q, Quaternion::one());
    }
    let twist = twist.normalize();
    let swing = q * twist.conjugate();
    (swing, twist)
}

/// Signed rotation angle of a twist quaternion about the unit `axis` it was
/// decomposed against, in `(-pi, pi]`.
pub fn twist_angle(twist: Quaternion<f32>, axis: Vector3<f32>) -> Rad<f32> {
    let mut angle = 2f32 * twist.v.dot(axis).atan2(twist.s);
    if angle > std::f32::consts::PI {
        angle -= 2f32 * std::f32::consts::PI;
    } else if angle <= -std::f32::consts::PI {
        angle += 2f32 * std::f32::consts::PI;
    }
    Rad(angle)
}

/// Rotation angle of an arbitrary unit quaternion, in `[0, pi]`.
pub fn rotation_angle(q: Quaternion<f32>) -> Rad<f32> {
    Rad(2f32 * q.s.abs().clamp(0f32, 1f32).acos())
}
